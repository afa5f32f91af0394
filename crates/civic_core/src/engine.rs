//! Engine façade: registration, voting, rating and verification for every
//! entity, with scores recomputed from the full ledgers on each change.
//!
//! Each entity's book (entity record, polls, vote ledger, rating ledger) sits
//! behind its own mutex, so mutations for one entity are serialized while
//! unrelated entities proceed independently. Computed scores are published
//! to a separate read cache that never waits on a recompute.

use crate::error::{EngineError, EngineResult};
use crate::geo;
use crate::policy::Policy;
use crate::ratings::{RatingLedger, RatingSubmission};
use crate::schema::{
    Citizen, DocumentSet, Entity, EntityKind, EntityScores, Issue, IssueStatus,
    IssueVerificationFlags, Location, Poll, PollKind, PollResult, PollStatus, RatingPayload,
    RatingRecord, VerificationState, VoteRecord, VoteValue,
};
use crate::scoring::{self, TrustBreakdown};
use crate::verification::{self, Effect, VerificationEvent};
use crate::votes::{Ballot, VoteLedger};
use dashmap::DashMap;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use time::OffsetDateTime;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct NewEntity {
    pub id: String,
    pub display_name: String,
    pub category: String,
    pub kind: EntityKind,
    pub location: Location,
}

#[derive(Debug, Clone)]
pub struct NewIssue {
    pub id: String,
    pub reporter_id: String,
    pub category: String,
    pub location: Location,
}

#[derive(Debug, Clone)]
pub struct VoteRequest {
    pub entity_id: String,
    pub kind: PollKind,
    pub voter_id: String,
    pub value: VoteValue,
}

#[derive(Debug, Clone)]
pub struct RatingRequest {
    pub entity_id: String,
    pub issue_id: String,
    pub rater_id: String,
    pub had_direct_interaction: bool,
    pub payload: RatingPayload,
}

/// A poll that completed during a cast or a tick.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletedPoll {
    pub poll: Poll,
    pub verification: VerificationState,
}

/// Everything needed to rebuild an engine.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct EngineSnapshot {
    pub entities: Vec<Entity>,
    pub citizens: Vec<Citizen>,
    pub issues: Vec<Issue>,
    pub polls: Vec<Poll>,
    pub votes: Vec<VoteRecord>,
    pub superseded_votes: Vec<VoteRecord>,
    pub ratings: Vec<RatingRecord>,
    pub superseded_ratings: Vec<RatingRecord>,
}

#[derive(Debug)]
struct EntityBook {
    entity: Entity,
    polls: Vec<Poll>,
    votes: VoteLedger,
    ratings: RatingLedger,
}

impl EntityBook {
    fn new(entity: Entity) -> Self {
        Self {
            entity,
            polls: Vec::new(),
            votes: VoteLedger::new(),
            ratings: RatingLedger::new(),
        }
    }

    fn open_poll_index(&self, kind: PollKind) -> Option<usize> {
        self.polls
            .iter()
            .position(|poll| poll.kind == kind && poll.is_open())
    }
}

pub struct Engine {
    policy: Policy,
    books: DashMap<String, Arc<Mutex<EntityBook>>>,
    poll_owners: DashMap<String, String>,
    citizens: DashMap<String, Citizen>,
    issues: DashMap<String, Issue>,
    scores: DashMap<String, EntityScores>,
}

fn lock(book: &Mutex<EntityBook>) -> MutexGuard<'_, EntityBook> {
    book.lock().unwrap_or_else(PoisonError::into_inner)
}

fn require_id(field: &str, value: &str) -> EngineResult<()> {
    if value.trim().is_empty() {
        return Err(EngineError::validation(format!("{field} must not be empty")));
    }
    Ok(())
}

impl Engine {
    pub fn new(policy: Policy) -> Self {
        Self {
            policy,
            books: DashMap::new(),
            poll_owners: DashMap::new(),
            citizens: DashMap::new(),
            issues: DashMap::new(),
            scores: DashMap::new(),
        }
    }

    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    fn book(&self, entity_id: &str) -> EngineResult<Arc<Mutex<EntityBook>>> {
        self.books
            .get(entity_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| EngineError::not_found("entity", entity_id))
    }

    fn book_for_poll(&self, poll_id: &str) -> EngineResult<Arc<Mutex<EntityBook>>> {
        let owner = self
            .poll_owners
            .get(poll_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| EngineError::not_found("poll", poll_id))?;
        self.book(&owner)
    }

    // ---- identity / registration -------------------------------------------------

    pub fn register_entity(&self, new: NewEntity) -> EngineResult<Entity> {
        require_id("entity id", &new.id)?;
        require_id("display name", &new.display_name)?;

        let entity = Entity {
            id: new.id.clone(),
            display_name: new.display_name,
            category: new.category,
            kind: new.kind,
            trust_score: self.policy.trust.seed,
            civic_sense_score: self.policy.civic_sense.seed,
            verification: VerificationState::Unverified,
            location: new.location,
            documents: None,
        };

        match self.books.entry(new.id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(EngineError::validation(format!(
                    "entity {} is already registered",
                    new.id
                )));
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(Arc::new(Mutex::new(EntityBook::new(entity.clone()))));
            }
        }
        self.scores.insert(new.id.clone(), EntityScores {
            trust_score: entity.trust_score,
            civic_sense_score: entity.civic_sense_score,
        });
        info!("Registered {} {}", entity.kind, entity.id);
        Ok(entity)
    }

    /// Registers a citizen or refreshes the trust/location snapshot supplied by
    /// the identity collaborator. The civic-sense score is kept on refresh.
    pub fn register_citizen(
        &self,
        id: &str,
        trust_score: f64,
        location: Location,
    ) -> EngineResult<Citizen> {
        require_id("citizen id", id)?;
        let trust = &self.policy.trust;
        if !trust_score.is_finite() || !(trust.floor..=trust.ceiling).contains(&trust_score) {
            return Err(EngineError::validation(format!(
                "citizen trust {trust_score} outside [{}, {}]",
                trust.floor, trust.ceiling
            )));
        }

        let seed = self.policy.civic_sense.seed;
        match self.citizens.entry(id.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(mut slot) => {
                let citizen = slot.get_mut();
                citizen.trust_score = trust_score;
                // jitter under the movement threshold keeps the cached fix
                let moved = match &location.coordinate {
                    Some(current) => {
                        geo::has_moved(current, citizen.location.coordinate.as_ref(), &self.policy)
                    }
                    None => true,
                };
                if moved {
                    citizen.location = location;
                } else {
                    citizen.location.area_code = location.area_code;
                }
                Ok(citizen.clone())
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                let citizen = Citizen {
                    id: id.to_string(),
                    trust_score,
                    civic_sense_score: seed,
                    location,
                };
                slot.insert(citizen.clone());
                Ok(citizen)
            }
        }
    }

    pub fn entity(&self, entity_id: &str) -> EngineResult<Entity> {
        let book = self.book(entity_id)?;
        let guard = lock(&book);
        Ok(guard.entity.clone())
    }

    pub fn citizen(&self, citizen_id: &str) -> EngineResult<Citizen> {
        self.citizens
            .get(citizen_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| EngineError::not_found("citizen", citizen_id))
    }

    pub fn entity_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.books.iter().map(|entry| entry.key().clone()).collect();
        ids.sort();
        ids
    }

    // ---- issue tracking --------------------------------------------------------------

    pub fn file_issue(&self, new: NewIssue, now: OffsetDateTime) -> EngineResult<Issue> {
        require_id("issue id", &new.id)?;
        let reporter = self.citizen(&new.reporter_id)?;

        let issue = Issue {
            reporter_weighting: geo::classify(&reporter.location, &new.location, &self.policy),
            id: new.id,
            reporter_id: new.reporter_id,
            category: new.category,
            location: new.location,
            status: IssueStatus::Submitted,
            assigned_to: None,
            verification_flags: IssueVerificationFlags::default(),
            filed_at: now,
        };
        match self.issues.entry(issue.id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(EngineError::validation(format!(
                    "issue {} already filed",
                    issue.id
                )));
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(issue.clone());
            }
        }
        debug!(
            "Filed issue {} with priority multiplier {}",
            issue.id,
            issue.priority_multiplier()
        );
        self.compute_citizen_scores(&issue.reporter_id)?;
        Ok(issue)
    }

    pub fn issue(&self, issue_id: &str) -> EngineResult<Issue> {
        self.issues
            .get(issue_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| EngineError::not_found("issue", issue_id))
    }

    pub fn assign_issue(&self, issue_id: &str, entity_id: &str) -> EngineResult<Issue> {
        self.book(entity_id)?;
        let issue = self.update_issue(issue_id, |issue| {
            issue.assigned_to = Some(entity_id.to_string());
            if matches!(issue.status, IssueStatus::Submitted | IssueStatus::UnderReview) {
                issue.status = IssueStatus::InProgress;
            }
        })?;
        info!("Assigned issue {issue_id} to {entity_id}");
        Ok(issue)
    }

    pub fn update_issue_status(&self, issue_id: &str, status: IssueStatus) -> EngineResult<Issue> {
        let issue = self.update_issue(issue_id, |issue| issue.status = status)?;
        self.compute_citizen_scores(&issue.reporter_id)?;
        Ok(issue)
    }

    pub fn flag_issue(&self, issue_id: &str, flags: IssueVerificationFlags) -> EngineResult<Issue> {
        let issue = self.update_issue(issue_id, |issue| issue.verification_flags = flags)?;
        self.compute_citizen_scores(&issue.reporter_id)?;
        Ok(issue)
    }

    fn update_issue(&self, issue_id: &str, change: impl FnOnce(&mut Issue)) -> EngineResult<Issue> {
        let mut entry = self
            .issues
            .get_mut(issue_id)
            .ok_or_else(|| EngineError::not_found("issue", issue_id))?;
        change(entry.value_mut());
        Ok(entry.value().clone())
    }

    // ---- verification --------------------------------------------------------------

    pub fn submit_documents(
        &self,
        entity_id: &str,
        documents: DocumentSet,
    ) -> EngineResult<VerificationState> {
        let book = self.book(entity_id)?;
        let mut guard = lock(&book);
        verification::validate_documents(&documents, guard.entity.kind)?;
        let state = self.transition(
            &mut guard,
            VerificationEvent::DocumentsUploaded(documents.clone()),
            None,
        );
        if state == VerificationState::DocumentsSubmitted {
            guard.entity.documents = Some(documents);
        }
        Ok(state)
    }

    /// Document-verification collaborator verdict. Confirmation opens the
    /// verification poll.
    pub fn confirm_documents(
        &self,
        entity_id: &str,
        confirmed: bool,
        now: OffsetDateTime,
    ) -> EngineResult<VerificationState> {
        let book = self.book(entity_id)?;
        let mut guard = lock(&book);
        Ok(self.transition(
            &mut guard,
            VerificationEvent::DocumentsConfirmed { confirmed },
            Some(now),
        ))
    }

    pub fn resubmit(&self, entity_id: &str) -> EngineResult<VerificationState> {
        let book = self.book(entity_id)?;
        let mut guard = lock(&book);
        let state = self.transition(&mut guard, VerificationEvent::Resubmitted, None);
        if state == VerificationState::Unverified {
            guard.entity.documents = None;
        }
        Ok(state)
    }

    pub fn verification_state(&self, entity_id: &str) -> EngineResult<VerificationState> {
        Ok(self.entity(entity_id)?.verification)
    }

    /// Applies a lifecycle event. Conflicts are redundant deliveries: logged
    /// and ignored, leaving the state as it was.
    fn transition(
        &self,
        book: &mut EntityBook,
        event: VerificationEvent,
        now: Option<OffsetDateTime>,
    ) -> VerificationState {
        let current = book.entity.verification;
        let transition = match verification::apply(&book.entity.id, current, &event) {
            Ok(transition) => transition,
            Err(err) => {
                warn!("Ignoring verification event: {err}");
                return current;
            }
        };

        book.entity.verification = transition.to;
        info!(
            "Verification of {} moved {} -> {}",
            book.entity.id, transition.from, transition.to
        );

        if transition.effect == Effect::OpenVerificationPoll {
            let opened_at = now.unwrap_or_else(OffsetDateTime::now_utc);
            self.open_poll(book, PollKind::Verification, opened_at);
        }
        transition.to
    }

    fn open_poll(&self, book: &mut EntityBook, kind: PollKind, now: OffsetDateTime) -> usize {
        let poll = Poll {
            id: format!("poll-{}", Uuid::new_v4()),
            entity_id: book.entity.id.clone(),
            entity_kind: book.entity.kind,
            kind,
            status: PollStatus::Open,
            opened_at: now,
            completion: None,
            result: PollResult::default(),
            decision_sign: 0,
            sign_since: None,
        };
        info!("Opened {} poll {} for {}", kind, poll.id, book.entity.id);
        self.poll_owners
            .insert(poll.id.clone(), book.entity.id.clone());
        book.polls.push(poll);
        book.polls.len() - 1
    }

    // ---- voting ---------------------------------------------------------------------

    /// Casts against the entity's open poll of the requested kind. Service
    /// polls open lazily; verification polls only exist while the entity is
    /// `polling_open`.
    pub fn cast_vote(&self, request: VoteRequest, now: OffsetDateTime) -> EngineResult<VoteRecord> {
        let voter = self.eligible_voter(&request.voter_id)?;
        let book = self.book(&request.entity_id)?;
        let mut guard = lock(&book);
        validate_ballot(&request.value, request.kind, guard.entity.kind)?;

        let slot = match (guard.open_poll_index(request.kind), request.kind) {
            (Some(slot), _) => slot,
            (None, PollKind::ServiceStatus) => self.open_poll(&mut guard, PollKind::ServiceStatus, now),
            (None, PollKind::Verification) => {
                return Err(EngineError::conflict(
                    &request.entity_id,
                    "cast a verification vote",
                    guard.entity.verification,
                ));
            }
        };
        self.record_vote(&mut guard, slot, &voter, request.value, now)
    }

    /// Casts against a specific poll, which must still be open.
    pub fn vote_on_poll(
        &self,
        poll_id: &str,
        voter_id: &str,
        value: VoteValue,
        now: OffsetDateTime,
    ) -> EngineResult<VoteRecord> {
        let voter = self.eligible_voter(voter_id)?;
        let book = self.book_for_poll(poll_id)?;
        let mut guard = lock(&book);
        let slot = guard
            .polls
            .iter()
            .position(|poll| poll.id == poll_id)
            .ok_or_else(|| EngineError::not_found("poll", poll_id))?;
        let poll = &guard.polls[slot];
        validate_ballot(&value, poll.kind, guard.entity.kind)?;
        if !poll.is_open() {
            return Err(EngineError::conflict(poll_id, "cast a vote", "completed"));
        }
        self.record_vote(&mut guard, slot, &voter, value, now)
    }

    fn eligible_voter(&self, voter_id: &str) -> EngineResult<Citizen> {
        let voter = self.citizen(voter_id)?;
        if voter.trust_score < self.policy.votes.min_voter_trust {
            return Err(EngineError::validation(format!(
                "voter {voter_id} has trust {} below {}",
                voter.trust_score, self.policy.votes.min_voter_trust
            )));
        }
        Ok(voter)
    }

    fn record_vote(
        &self,
        book: &mut EntityBook,
        slot: usize,
        voter: &Citizen,
        value: VoteValue,
        now: OffsetDateTime,
    ) -> EngineResult<VoteRecord> {
        let area_weighting = geo::classify(&voter.location, &book.entity.location, &self.policy);
        let poll_id = book.polls[slot].id.clone();
        let record = book.votes.cast(Ballot {
            poll_id: &poll_id,
            entity_id: &book.entity.id,
            entity_kind: book.entity.kind,
            voter_id: &voter.id,
            value,
            voter_trust: voter.trust_score,
            area_weighting,
            cast_at: now,
        });
        debug!(
            "Vote {} rev {} on {} weighted {}",
            record.id,
            record.revision,
            poll_id,
            record.weight()
        );

        self.refresh_open_polls(book, now);
        self.recompute(book);
        Ok(record)
    }

    pub fn list_active_votes(&self, poll_id: &str) -> EngineResult<Vec<VoteRecord>> {
        let book = self.book_for_poll(poll_id)?;
        let guard = lock(&book);
        Ok(guard.votes.list_active(poll_id))
    }

    pub fn vote_history(&self, poll_id: &str, voter_id: &str) -> EngineResult<Vec<VoteRecord>> {
        let book = self.book_for_poll(poll_id)?;
        let guard = lock(&book);
        Ok(guard.votes.history(poll_id, voter_id))
    }

    pub fn poll(&self, poll_id: &str) -> EngineResult<Poll> {
        let book = self.book_for_poll(poll_id)?;
        let guard = lock(&book);
        guard
            .polls
            .iter()
            .find(|poll| poll.id == poll_id)
            .cloned()
            .ok_or_else(|| EngineError::not_found("poll", poll_id))
    }

    pub fn polls_for(&self, entity_id: &str) -> EngineResult<Vec<Poll>> {
        let book = self.book(entity_id)?;
        let guard = lock(&book);
        Ok(guard.polls.clone())
    }

    /// Fresh result for an open poll; the frozen result for a completed one.
    pub fn compute_poll_result(&self, poll_id: &str) -> EngineResult<PollResult> {
        let book = self.book_for_poll(poll_id)?;
        let guard = lock(&book);
        let poll = guard
            .polls
            .iter()
            .find(|poll| poll.id == poll_id)
            .ok_or_else(|| EngineError::not_found("poll", poll_id))?;
        if !poll.is_open() {
            return Ok(poll.result.clone());
        }
        let votes = guard.votes.list_active(poll_id);
        Ok(scoring::compute_poll_result(&votes, poll.kind, &self.policy))
    }

    // ---- ratings --------------------------------------------------------------------

    pub fn submit_rating(
        &self,
        request: RatingRequest,
        now: OffsetDateTime,
    ) -> EngineResult<RatingRecord> {
        let issue = self.issue(&request.issue_id)?;
        let rater = self.citizen(&request.rater_id)?;
        let book = self.book(&request.entity_id)?;
        let mut guard = lock(&book);

        if issue.assigned_to.as_deref() != Some(request.entity_id.as_str()) {
            return Err(EngineError::validation(format!(
                "issue {} is not assigned to {}",
                issue.id, request.entity_id
            )));
        }

        let area_weighting = geo::classify(&rater.location, &issue.location, &self.policy);
        let entity_kind = guard.entity.kind;
        let record = guard.ratings.submit(
            RatingSubmission {
                entity_id: &request.entity_id,
                entity_kind,
                issue_id: &issue.id,
                rater_id: &rater.id,
                rater_trust: rater.trust_score,
                had_direct_interaction: request.had_direct_interaction,
                payload: request.payload,
                area_weighting,
                submitted_at: now,
            },
            self.policy.votes.min_rater_trust,
        )?;
        debug!("Rating {} rev {} for {}", record.id, record.revision, request.entity_id);

        self.recompute(&mut guard);
        Ok(record)
    }

    pub fn ratings_for(&self, entity_id: &str) -> EngineResult<Vec<RatingRecord>> {
        let book = self.book(entity_id)?;
        let guard = lock(&book);
        Ok(guard.ratings.list_for_entity(entity_id))
    }

    // ---- scores ---------------------------------------------------------------------

    /// Recomputes from the full ledgers and publishes the result.
    pub fn compute_entity_scores(&self, entity_id: &str) -> EngineResult<EntityScores> {
        let book = self.book(entity_id)?;
        let mut guard = lock(&book);
        Ok(self.recompute(&mut guard))
    }

    pub fn trust_breakdown(&self, entity_id: &str) -> EngineResult<TrustBreakdown> {
        let book = self.book(entity_id)?;
        let guard = lock(&book);
        Ok(scoring::compute_trust_breakdown(
            guard.entity.trust_score,
            &guard.polls,
            guard.ratings.active(),
            &self.policy,
        ))
    }

    /// Last published scores; never blocks on an in-flight recompute.
    pub fn scores(&self, entity_id: &str) -> Option<EntityScores> {
        self.scores.get(entity_id).map(|entry| *entry.value())
    }

    pub fn compute_citizen_scores(&self, citizen_id: &str) -> EngineResult<EntityScores> {
        let filed: Vec<Issue> = self
            .issues
            .iter()
            .filter(|entry| entry.value().reporter_id == citizen_id)
            .map(|entry| entry.value().clone())
            .collect();
        let filed_refs: Vec<&Issue> = filed.iter().collect();

        let mut entry = self
            .citizens
            .get_mut(citizen_id)
            .ok_or_else(|| EngineError::not_found("citizen", citizen_id))?;
        let scores = scoring::compute_citizen_scores(entry.value(), &filed_refs, &self.policy);
        entry.civic_sense_score = scores.civic_sense_score;
        Ok(scores)
    }

    fn recompute(&self, book: &mut EntityBook) -> EntityScores {
        let scores = scoring::compute_entity_scores(
            &book.entity,
            &book.polls,
            book.ratings.active(),
            &self.policy,
        );
        if scores.trust_score != book.entity.trust_score {
            debug!(
                "Trust of {} recomputed {} -> {}",
                book.entity.id, book.entity.trust_score, scores.trust_score
            );
        }
        book.entity.trust_score = scores.trust_score;
        book.entity.civic_sense_score = scores.civic_sense_score;
        self.scores.insert(book.entity.id.clone(), scores);
        scores
    }

    // ---- time -----------------------------------------------------------------------

    fn refresh_open_polls(&self, book: &mut EntityBook, now: OffsetDateTime) -> Vec<CompletedPoll> {
        let mut completed = Vec::new();
        for slot in 0..book.polls.len() {
            if !book.polls[slot].is_open() {
                continue;
            }
            let votes = book.votes.list_active(&book.polls[slot].id);
            let completion = match scoring::refresh_poll(&mut book.polls[slot], &votes, now, &self.policy) {
                Ok(Some(completion)) => completion,
                Ok(None) => continue,
                Err(err) => {
                    warn!("Skipping poll refresh: {err}");
                    continue;
                }
            };

            let poll = book.polls[slot].clone();
            info!(
                "Poll {} completed ({:?}) with score {} over {} votes",
                poll.id, completion.reason, poll.result.weighted_score, poll.result.total_votes
            );
            if poll.kind == PollKind::Verification {
                self.transition(
                    book,
                    VerificationEvent::PollCompleted {
                        positive: scoring::poll_passed(&poll),
                        quorum_met: completion.quorum_met,
                    },
                    Some(now),
                );
            }
            completed.push(CompletedPoll {
                poll,
                verification: book.entity.verification,
            });
        }
        completed
    }

    /// Advances every open poll to `now`, completing the ones whose quorum,
    /// cooldown or open-duration ceiling has been reached.
    pub fn tick(&self, now: OffsetDateTime) -> Vec<CompletedPoll> {
        let books: Vec<Arc<Mutex<EntityBook>>> =
            self.books.iter().map(|entry| Arc::clone(entry.value())).collect();

        let mut completed = Vec::new();
        for book in books {
            let mut guard = lock(&book);
            let done = self.refresh_open_polls(&mut guard, now);
            if !done.is_empty() {
                self.recompute(&mut guard);
            }
            completed.extend(done);
        }
        completed
    }

    // ---- persistence ------------------------------------------------------------

    pub fn snapshot(&self) -> EngineSnapshot {
        let mut snapshot = EngineSnapshot::default();
        for id in self.entity_ids() {
            let Ok(book) = self.book(&id) else { continue };
            let guard = lock(&book);
            snapshot.entities.push(guard.entity.clone());
            snapshot.polls.extend(guard.polls.iter().cloned());
            snapshot.votes.extend(guard.votes.active().iter().cloned());
            snapshot
                .superseded_votes
                .extend(guard.votes.superseded().iter().cloned());
            snapshot.ratings.extend(guard.ratings.active().iter().cloned());
            snapshot
                .superseded_ratings
                .extend(guard.ratings.superseded().iter().cloned());
        }
        snapshot.citizens = self.citizens.iter().map(|e| e.value().clone()).collect();
        snapshot.citizens.sort_by(|a, b| a.id.cmp(&b.id));
        snapshot.issues = self.issues.iter().map(|e| e.value().clone()).collect();
        snapshot.issues.sort_by(|a, b| a.id.cmp(&b.id));
        snapshot
    }

    pub fn restore(policy: Policy, snapshot: EngineSnapshot) -> EngineResult<Self> {
        let engine = Self::new(policy);

        let mut polls: HashMap<String, Vec<Poll>> = HashMap::new();
        for poll in snapshot.polls {
            polls.entry(poll.entity_id.clone()).or_default().push(poll);
        }
        let mut votes: HashMap<String, (Vec<VoteRecord>, Vec<VoteRecord>)> = HashMap::new();
        for vote in snapshot.votes {
            votes.entry(vote.entity_id.clone()).or_default().0.push(vote);
        }
        for vote in snapshot.superseded_votes {
            votes.entry(vote.entity_id.clone()).or_default().1.push(vote);
        }
        let mut ratings: HashMap<String, (Vec<RatingRecord>, Vec<RatingRecord>)> = HashMap::new();
        for rating in snapshot.ratings {
            ratings.entry(rating.entity_id.clone()).or_default().0.push(rating);
        }
        for rating in snapshot.superseded_ratings {
            ratings.entry(rating.entity_id.clone()).or_default().1.push(rating);
        }

        for entity in snapshot.entities {
            let id = entity.id.clone();
            let mut book = EntityBook::new(entity);
            book.polls = polls.remove(&id).unwrap_or_default();
            book.polls.sort_by(|a, b| a.opened_at.cmp(&b.opened_at));
            if let Some((active, superseded)) = votes.remove(&id) {
                book.votes = VoteLedger::restore(active, superseded);
            }
            if let Some((active, superseded)) = ratings.remove(&id) {
                book.ratings = RatingLedger::restore(active, superseded);
            }
            for poll in &book.polls {
                engine.poll_owners.insert(poll.id.clone(), id.clone());
            }
            engine.scores.insert(id.clone(), EntityScores {
                trust_score: book.entity.trust_score,
                civic_sense_score: book.entity.civic_sense_score,
            });
            engine.books.insert(id, Arc::new(Mutex::new(book)));
        }

        let orphan = polls
            .keys()
            .chain(votes.keys())
            .chain(ratings.keys())
            .next()
            .cloned();
        if let Some(orphan) = orphan {
            return Err(EngineError::not_found("entity", orphan));
        }

        for citizen in snapshot.citizens {
            engine.citizens.insert(citizen.id.clone(), citizen);
        }
        for issue in snapshot.issues {
            engine.issues.insert(issue.id.clone(), issue);
        }
        Ok(engine)
    }
}

fn validate_ballot(value: &VoteValue, kind: PollKind, entity_kind: EntityKind) -> EngineResult<()> {
    if value.sign_for(kind).is_none() {
        return Err(EngineError::validation(format!(
            "ballot carries no {kind} answer"
        )));
    }
    if value.service.is_some() && entity_kind != EntityKind::Official {
        return Err(EngineError::validation(
            "service-status answers only apply to officials",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::ServiceStatus;
    use time::macros::datetime;

    fn engine() -> Engine {
        let engine = Engine::new(Policy::default());
        engine
            .register_entity(NewEntity {
                id: "official-001".to_string(),
                display_name: "Rajesh Kumar".to_string(),
                category: "Municipal Corporation".to_string(),
                kind: EntityKind::Official,
                location: Location::area("DEL-001"),
            })
            .unwrap();
        engine
            .register_entity(NewEntity {
                id: "private-001".to_string(),
                display_name: "ABC Construction Pvt Ltd".to_string(),
                category: "Construction".to_string(),
                kind: EntityKind::Contractor,
                location: Location::area("DEL-001"),
            })
            .unwrap();
        engine.register_citizen("citizen-001", 7.0, Location::area("DEL-001")).unwrap();
        engine.register_citizen("citizen-002", 5.0, Location::area("DEL-001")).unwrap();
        engine
    }

    fn service_vote(voter: &str, status: ServiceStatus) -> VoteRequest {
        VoteRequest {
            entity_id: "official-001".to_string(),
            kind: PollKind::ServiceStatus,
            voter_id: voter.to_string(),
            value: VoteValue::service(status),
        }
    }

    #[test]
    fn duplicate_issue_is_rejected_and_original_kept() {
        let engine = engine();
        let filed = engine
            .file_issue(
                NewIssue {
                    id: "issue-001".to_string(),
                    reporter_id: "citizen-001".to_string(),
                    category: "Infrastructure".to_string(),
                    location: Location::area("DEL-001"),
                },
                datetime!(2024-01-10 08:00 UTC),
            )
            .unwrap();
        let err = engine
            .file_issue(
                NewIssue {
                    id: "issue-001".to_string(),
                    reporter_id: "citizen-002".to_string(),
                    category: "Sanitation".to_string(),
                    location: Location::area("DEL-002"),
                },
                datetime!(2024-01-10 09:00 UTC),
            )
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
        assert_eq!(engine.issue("issue-001").unwrap(), filed);
    }

    #[test]
    fn citizen_location_refreshes_only_past_movement_threshold() {
        let engine = engine();
        let home = Location::area("DEL-001").with_coordinate(28.6139, 77.2090);
        engine.register_citizen("citizen-003", 6.0, home).unwrap();

        // ~0.08 km away: cached fix kept, trust refreshed
        let jitter = Location::area("DEL-001").with_coordinate(28.6145, 77.2095);
        let citizen = engine.register_citizen("citizen-003", 6.5, jitter).unwrap();
        assert_eq!(citizen.trust_score, 6.5);
        let kept = citizen.location.coordinate.unwrap();
        assert_eq!((kept.lat, kept.lon), (28.6139, 77.2090));

        // ~2.9 km away: refreshed
        let moved = Location::area("DEL-002").with_coordinate(28.6400, 77.2090);
        let citizen = engine.register_citizen("citizen-003", 6.5, moved.clone()).unwrap();
        assert_eq!(citizen.location, moved);
    }

    #[test]
    fn open_poll_result_is_recomputed_from_active_votes() {
        let engine = engine();
        let vote = engine
            .cast_vote(service_vote("citizen-001", ServiceStatus::InService), datetime!(2024-01-10 10:00 UTC))
            .unwrap();
        let result = engine.compute_poll_result(&vote.poll_id).unwrap();
        assert_eq!(result.total_votes, 1);
        assert_eq!(result.in_service_votes, 1);
        assert_eq!(result.weighted_score, 3.5);
        assert!(engine.compute_poll_result("poll-missing").is_err());
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let engine = engine();
        let err = engine
            .register_entity(NewEntity {
                id: "official-001".to_string(),
                display_name: "Someone Else".to_string(),
                category: String::new(),
                kind: EntityKind::Official,
                location: Location::default(),
            })
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }

    #[test]
    fn citizen_trust_must_be_in_range() {
        let engine = engine();
        assert!(engine.register_citizen("c", 0.5, Location::default()).is_err());
        assert!(engine.register_citizen("c", 11.0, Location::default()).is_err());
        assert!(engine.register_citizen("c", f64::NAN, Location::default()).is_err());
    }

    #[test]
    fn service_poll_opens_lazily_and_reopens_after_completion() {
        let engine = engine();
        let first = engine
            .cast_vote(service_vote("citizen-001", ServiceStatus::InService), datetime!(2024-01-10 10:00 UTC))
            .unwrap();
        let second = engine
            .cast_vote(service_vote("citizen-002", ServiceStatus::InService), datetime!(2024-01-10 11:00 UTC))
            .unwrap();
        assert_eq!(first.poll_id, second.poll_id);

        let poll = engine.poll(&first.poll_id).unwrap();
        assert_eq!(poll.status, PollStatus::Completed);

        let third = engine
            .cast_vote(service_vote("citizen-001", ServiceStatus::NotInService), datetime!(2024-01-11 10:00 UTC))
            .unwrap();
        assert_ne!(third.poll_id, first.poll_id);
        assert_eq!(engine.polls_for("official-001").unwrap().len(), 2);
    }

    #[test]
    fn completed_poll_refuses_direct_votes() {
        let engine = engine();
        let vote = engine
            .cast_vote(service_vote("citizen-001", ServiceStatus::InService), datetime!(2024-01-10 10:00 UTC))
            .unwrap();
        engine
            .cast_vote(service_vote("citizen-002", ServiceStatus::InService), datetime!(2024-01-10 11:00 UTC))
            .unwrap();

        let err = engine
            .vote_on_poll(
                &vote.poll_id,
                "citizen-002",
                VoteValue::service(ServiceStatus::NotInService),
                datetime!(2024-01-10 12:00 UTC),
            )
            .unwrap_err();
        assert!(err.is_state_conflict());
    }

    #[test]
    fn contractors_take_no_service_votes() {
        let engine = engine();
        let mut request = service_vote("citizen-001", ServiceStatus::InService);
        request.entity_id = "private-001".to_string();
        let err = engine.cast_vote(request, datetime!(2024-01-10 10:00 UTC)).unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
        assert!(engine.polls_for("private-001").unwrap().is_empty());
    }

    #[test]
    fn verification_vote_needs_an_open_verification_poll() {
        let engine = engine();
        let err = engine
            .cast_vote(
                VoteRequest {
                    entity_id: "official-001".to_string(),
                    kind: PollKind::Verification,
                    voter_id: "citizen-001".to_string(),
                    value: VoteValue::verified(),
                },
                datetime!(2024-01-10 10:00 UTC),
            )
            .unwrap_err();
        assert!(err.is_state_conflict());
    }

    #[test]
    fn unknown_ids_are_not_found() {
        let engine = engine();
        assert!(matches!(engine.entity("nobody"), Err(EngineError::NotFound { kind: "entity", .. })));
        assert!(matches!(engine.poll("poll-x"), Err(EngineError::NotFound { kind: "poll", .. })));
        assert!(matches!(
            engine.cast_vote(service_vote("ghost", ServiceStatus::InService), datetime!(2024-01-10 10:00 UTC)),
            Err(EngineError::NotFound { kind: "citizen", .. })
        ));
    }

    #[test]
    fn redundant_lifecycle_events_are_ignored() {
        let engine = engine();
        // nothing uploaded yet: confirmation is a no-op
        let state = engine
            .confirm_documents("official-001", true, datetime!(2024-01-10 09:00 UTC))
            .unwrap();
        assert_eq!(state, VerificationState::Unverified);
        assert!(engine.polls_for("official-001").unwrap().is_empty());
    }

    #[test]
    fn snapshot_round_trip() {
        let engine = engine();
        engine
            .cast_vote(service_vote("citizen-001", ServiceStatus::InService), datetime!(2024-01-10 10:00 UTC))
            .unwrap();
        engine
            .cast_vote(service_vote("citizen-001", ServiceStatus::NotInService), datetime!(2024-01-10 10:30 UTC))
            .unwrap();

        let snapshot = engine.snapshot();
        let restored = Engine::restore(Policy::default(), snapshot.clone()).unwrap();
        assert_eq!(restored.snapshot(), snapshot);

        let poll_id = &snapshot.polls[0].id;
        assert_eq!(restored.list_active_votes(poll_id).unwrap().len(), 1);
        assert_eq!(restored.vote_history(poll_id, "citizen-001").unwrap().len(), 1);
    }

    #[test]
    fn restore_rejects_orphan_records() {
        let engine = engine();
        engine
            .cast_vote(service_vote("citizen-001", ServiceStatus::InService), datetime!(2024-01-10 10:00 UTC))
            .unwrap();
        let mut snapshot = engine.snapshot();
        snapshot.entities.retain(|entity| entity.id != "official-001");
        assert!(Engine::restore(Policy::default(), snapshot).is_err());
    }
}
