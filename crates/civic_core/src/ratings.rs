use crate::error::{EngineError, EngineResult};
use crate::schema::{AreaWeighting, EntityKind, RatingPayload, RatingRecord};
use std::collections::HashMap;
use time::OffsetDateTime;
use uuid::Uuid;

pub const MIN_DIMENSION_SCORE: u8 = 1;
pub const MAX_DIMENSION_SCORE: u8 = 5;

#[derive(Debug, Clone)]
pub struct RatingSubmission<'a> {
    pub entity_id: &'a str,
    pub entity_kind: EntityKind,
    pub issue_id: &'a str,
    pub rater_id: &'a str,
    pub rater_trust: f64,
    pub had_direct_interaction: bool,
    pub payload: RatingPayload,
    pub area_weighting: AreaWeighting,
    pub submitted_at: OffsetDateTime,
}

type RatingKey = (String, String, String); // (rater, issue, entity)

/// Ratings keyed by (rater, issue, entity). Same replace-in-place discipline
/// as the vote ledger.
#[derive(Debug, Clone, Default)]
pub struct RatingLedger {
    active: Vec<RatingRecord>,
    index: HashMap<RatingKey, usize>,
    superseded: Vec<RatingRecord>,
}

/// Exhaustive check of a payload against the rated entity kind.
pub fn validate_payload(payload: &RatingPayload, entity_kind: EntityKind) -> EngineResult<()> {
    if payload.entity_kind() != entity_kind {
        return Err(EngineError::validation(format!(
            "{} rating payload submitted for a {entity_kind}",
            payload.entity_kind()
        )));
    }
    for (dimension, score) in payload.dimensions() {
        if !(MIN_DIMENSION_SCORE..=MAX_DIMENSION_SCORE).contains(&score) {
            return Err(EngineError::validation(format!(
                "{dimension} must be between {MIN_DIMENSION_SCORE} and {MAX_DIMENSION_SCORE}, got {score}"
            )));
        }
    }
    Ok(())
}

impl RatingLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validates, then records. Nothing is stored on failure.
    pub fn submit(
        &mut self,
        submission: RatingSubmission<'_>,
        min_rater_trust: f64,
    ) -> EngineResult<RatingRecord> {
        if submission.rater_trust < min_rater_trust {
            return Err(EngineError::validation(format!(
                "rater {} has trust {} below the participation threshold {min_rater_trust}",
                submission.rater_id, submission.rater_trust
            )));
        }
        validate_payload(&submission.payload, submission.entity_kind)?;

        let key = (
            submission.rater_id.to_string(),
            submission.issue_id.to_string(),
            submission.entity_id.to_string(),
        );
        if let Some(&slot) = self.index.get(&key) {
            let record = &mut self.active[slot];
            self.superseded.push(record.clone());
            record.rater_trust = submission.rater_trust;
            record.had_direct_interaction = submission.had_direct_interaction;
            record.payload = submission.payload;
            record.area_weighting = submission.area_weighting;
            record.submitted_at = submission.submitted_at;
            record.revision += 1;
            return Ok(record.clone());
        }

        let record = RatingRecord {
            id: format!("rating-{}", Uuid::new_v4()),
            entity_id: submission.entity_id.to_string(),
            entity_kind: submission.entity_kind,
            issue_id: submission.issue_id.to_string(),
            rater_id: submission.rater_id.to_string(),
            rater_trust: submission.rater_trust,
            had_direct_interaction: submission.had_direct_interaction,
            payload: submission.payload,
            area_weighting: submission.area_weighting,
            revision: 1,
            submitted_at: submission.submitted_at,
        };
        self.index.insert(key, self.active.len());
        self.active.push(record.clone());
        Ok(record)
    }

    pub fn get(&self, rater_id: &str, issue_id: &str, entity_id: &str) -> Option<&RatingRecord> {
        self.index
            .get(&(rater_id.to_string(), issue_id.to_string(), entity_id.to_string()))
            .map(|&slot| &self.active[slot])
    }

    pub fn list_for_entity(&self, entity_id: &str) -> Vec<RatingRecord> {
        self.active
            .iter()
            .filter(|rating| rating.entity_id == entity_id)
            .cloned()
            .collect()
    }

    pub fn active(&self) -> &[RatingRecord] {
        &self.active
    }

    pub fn superseded(&self) -> &[RatingRecord] {
        &self.superseded
    }

    pub fn len(&self) -> usize {
        self.active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    pub fn restore(active: Vec<RatingRecord>, mut superseded: Vec<RatingRecord>) -> Self {
        let mut ledger = Self::new();
        for record in active {
            let key = (
                record.rater_id.clone(),
                record.issue_id.clone(),
                record.entity_id.clone(),
            );
            match ledger.index.get(&key) {
                Some(&slot) => {
                    let displaced = std::mem::replace(&mut ledger.active[slot], record);
                    superseded.push(displaced);
                }
                None => {
                    ledger.index.insert(key, ledger.active.len());
                    ledger.active.push(record);
                }
            }
        }
        superseded.sort_by(|a, b| {
            a.revision
                .cmp(&b.revision)
                .then(a.submitted_at.cmp(&b.submitted_at))
        });
        ledger.superseded = superseded;
        ledger
    }
}
