use crate::schema::{AreaWeighting, EntityKind, VoteRecord, VoteValue};
use std::collections::HashMap;
use time::OffsetDateTime;
use uuid::Uuid;

/// Everything a cast needs besides the ledger itself.
#[derive(Debug, Clone)]
pub struct Ballot<'a> {
    pub poll_id: &'a str,
    pub entity_id: &'a str,
    pub entity_kind: EntityKind,
    pub voter_id: &'a str,
    pub value: VoteValue,
    pub voter_trust: f64,
    pub area_weighting: AreaWeighting,
    pub cast_at: OffsetDateTime,
}

/// Votes keyed by (poll, voter). Recasting replaces in place; the replaced
/// revision moves to `superseded` and is never dropped.
#[derive(Debug, Clone, Default)]
pub struct VoteLedger {
    active: Vec<VoteRecord>,
    index: HashMap<(String, String), usize>,
    superseded: Vec<VoteRecord>,
}

impl VoteLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cast(&mut self, ballot: Ballot<'_>) -> VoteRecord {
        let key = (ballot.poll_id.to_string(), ballot.voter_id.to_string());
        if let Some(&slot) = self.index.get(&key) {
            let record = &mut self.active[slot];
            self.superseded.push(record.clone());
            record.value = ballot.value;
            record.voter_trust = ballot.voter_trust;
            record.area_weighting = ballot.area_weighting;
            record.cast_at = ballot.cast_at;
            record.revision += 1;
            return record.clone();
        }

        let record = VoteRecord {
            id: format!("vote-{}", Uuid::new_v4()),
            poll_id: ballot.poll_id.to_string(),
            entity_id: ballot.entity_id.to_string(),
            entity_kind: ballot.entity_kind,
            voter_id: ballot.voter_id.to_string(),
            voter_trust: ballot.voter_trust,
            value: ballot.value,
            area_weighting: ballot.area_weighting,
            revision: 1,
            cast_at: ballot.cast_at,
        };
        self.index.insert(key, self.active.len());
        self.active.push(record.clone());
        record
    }

    /// Current one-per-voter set for a poll, in first-cast order.
    pub fn list_active(&self, poll_id: &str) -> Vec<VoteRecord> {
        self.active
            .iter()
            .filter(|vote| vote.poll_id == poll_id)
            .cloned()
            .collect()
    }

    pub fn active_count(&self, poll_id: &str) -> usize {
        self.active.iter().filter(|vote| vote.poll_id == poll_id).count()
    }

    pub fn get(&self, poll_id: &str, voter_id: &str) -> Option<&VoteRecord> {
        self.index
            .get(&(poll_id.to_string(), voter_id.to_string()))
            .map(|&slot| &self.active[slot])
    }

    /// Superseded revisions for one voter on one poll, oldest first.
    pub fn history(&self, poll_id: &str, voter_id: &str) -> Vec<VoteRecord> {
        self.superseded
            .iter()
            .filter(|vote| vote.poll_id == poll_id && vote.voter_id == voter_id)
            .cloned()
            .collect()
    }

    pub fn active(&self) -> &[VoteRecord] {
        &self.active
    }

    pub fn superseded(&self) -> &[VoteRecord] {
        &self.superseded
    }

    /// Rebuild from persisted records. Later active records for the same
    /// (poll, voter) win; anything they displace is kept as superseded.
    pub fn restore(active: Vec<VoteRecord>, mut superseded: Vec<VoteRecord>) -> Self {
        let mut ledger = Self::new();
        for record in active {
            let key = (record.poll_id.clone(), record.voter_id.clone());
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
        superseded.sort_by(|a, b| a.revision.cmp(&b.revision).then(a.cast_at.cmp(&b.cast_at)));
        ledger.superseded = superseded;
        ledger
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::ServiceStatus;
    use std::collections::HashSet;
    use time::macros::datetime;

    fn local() -> AreaWeighting {
        AreaWeighting {
            is_local: true,
            is_adjacent: false,
            multiplier: 2.0,
            distance_km: None,
        }
    }

    fn ballot<'a>(voter_id: &'a str, value: VoteValue, at: OffsetDateTime) -> Ballot<'a> {
        Ballot {
            poll_id: "poll-001",
            entity_id: "official-001",
            entity_kind: EntityKind::Official,
            voter_id,
            value,
            voter_trust: 7.0,
            area_weighting: local(),
            cast_at: at,
        }
    }

    #[test]
    fn recast_replaces_in_place() {
        let mut ledger = VoteLedger::new();
        let first = ledger.cast(ballot("citizen-001", VoteValue::verified(), datetime!(2024-01-10 10:00 UTC)));
        let second = ledger.cast(ballot(
            "citizen-001",
            VoteValue::not_verified(),
            datetime!(2024-01-10 12:00 UTC),
        ));

        assert_eq!(first.id, second.id);
        assert_eq!(second.revision, 2);
        assert_eq!(second.value, VoteValue::not_verified());
        assert_eq!(second.cast_at, datetime!(2024-01-10 12:00 UTC));
        assert_eq!(ledger.active_count("poll-001"), 1);

        let history = ledger.history("poll-001", "citizen-001");
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].value, VoteValue::verified());
    }

    #[test]
    fn list_active_never_repeats_a_voter() {
        let mut ledger = VoteLedger::new();
        let voters = ["a", "b", "a", "c", "b", "a"];
        for (i, voter) in voters.iter().enumerate() {
            let value = if i % 2 == 0 {
                VoteValue::verified()
            } else {
                VoteValue::service(ServiceStatus::InService)
            };
            ledger.cast(ballot(voter, value, datetime!(2024-01-10 10:00 UTC)));
        }

        let active = ledger.list_active("poll-001");
        let unique: HashSet<_> = active.iter().map(|vote| vote.voter_id.as_str()).collect();
        assert_eq!(active.len(), 3);
        assert_eq!(unique.len(), 3);
        // stable for display: first-cast order
        let order: Vec<_> = active.iter().map(|vote| vote.voter_id.as_str()).collect();
        assert_eq!(order, vec!["a", "b", "c"]);
        assert_eq!(ledger.superseded().len(), 3);
    }

    #[test]
    fn polls_are_isolated() {
        let mut ledger = VoteLedger::new();
        ledger.cast(ballot("a", VoteValue::verified(), datetime!(2024-01-10 10:00 UTC)));
        let mut other = ballot("a", VoteValue::verified(), datetime!(2024-01-10 10:00 UTC));
        other.poll_id = "poll-002";
        ledger.cast(other);

        assert_eq!(ledger.active_count("poll-001"), 1);
        assert_eq!(ledger.active_count("poll-002"), 1);
        assert!(ledger.history("poll-001", "a").is_empty());
    }

    #[test]
    fn restore_rebuilds_index() {
        let mut ledger = VoteLedger::new();
        ledger.cast(ballot("a", VoteValue::verified(), datetime!(2024-01-10 10:00 UTC)));
        ledger.cast(ballot("a", VoteValue::not_verified(), datetime!(2024-01-10 11:00 UTC)));

        let mut restored =
            VoteLedger::restore(ledger.active().to_vec(), ledger.superseded().to_vec());
        assert_eq!(restored.get("poll-001", "a").unwrap().revision, 2);

        let recast = restored.cast(ballot("a", VoteValue::verified(), datetime!(2024-01-10 12:00 UTC)));
        assert_eq!(recast.revision, 3);
        assert_eq!(restored.active_count("poll-001"), 1);
        assert_eq!(restored.history("poll-001", "a").len(), 2);
    }
}
