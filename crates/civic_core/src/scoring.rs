use crate::error::{EngineError, EngineResult};
use crate::policy::Policy;
use crate::schema::{
    Citizen, Completion, CompletionReason, Entity, EntityScores, Issue, Poll, PollKind,
    PollResult, PollStatus, RatingRecord, ServiceStatus, Verification, VoteRecord,
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};

/// How an entity's trust score was assembled. `None` components had no input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct TrustBreakdown {
    pub trust_score: f64,
    pub poll_component: Option<f64>,
    pub rating_component: Option<f64>,
    pub polls_counted: usize,
    pub ratings_counted: usize,
}

pub fn vote_weight(vote: &VoteRecord) -> f64 {
    vote.weight()
}

/// Weighted result of a poll's active votes.
///
/// `weighted_score = scale * (W+ - W-) / (W+ + W- + prior_weight)`, where W+
/// and W- sum `voter_trust * locality multiplier` over supporting and opposing
/// ballots on the poll's decision axis. Counts cover both axes.
pub fn compute_poll_result(votes: &[VoteRecord], kind: PollKind, policy: &Policy) -> PollResult {
    let mut result = PollResult {
        total_votes: votes.len(),
        ..PollResult::default()
    };

    for vote in votes {
        match vote.value.verification {
            Some(Verification::Verified) => result.verified_votes += 1,
            Some(Verification::NotVerified) => result.not_verified_votes += 1,
            None => {}
        }
        match vote.value.service {
            Some(ServiceStatus::InService) => result.in_service_votes += 1,
            Some(ServiceStatus::NotInService) => result.not_in_service_votes += 1,
            None => {}
        }

        let weight = vote_weight(vote);
        match vote.value.sign_for(kind) {
            Some(sign) if sign > 0.0 => result.positive_weight += weight,
            Some(_) => result.negative_weight += weight,
            None => {}
        }
    }

    let denominator = result.total_weight() + policy.polls.prior_weight;
    let score = if denominator > 0.0 {
        policy.polls.score_scale * (result.positive_weight - result.negative_weight) / denominator
    } else {
        0.0
    };
    result.weighted_score = round_score(score, policy.output.rounding);
    result
}

fn decision_sign(score: f64) -> i8 {
    if score > 0.0 {
        1
    } else if score < 0.0 {
        -1
    } else {
        0
    }
}

/// Recompute an open poll from its active votes and complete it when the
/// completion rules are met. Returns the completion if it happened now.
pub fn refresh_poll(
    poll: &mut Poll,
    votes: &[VoteRecord],
    now: OffsetDateTime,
    policy: &Policy,
) -> EngineResult<Option<Completion>> {
    if !poll.is_open() {
        return Err(EngineError::conflict(&poll.id, "refresh", "completed"));
    }

    poll.result = compute_poll_result(votes, poll.kind, policy);

    let sign = decision_sign(poll.result.weighted_score);
    if sign != poll.decision_sign || poll.sign_since.is_none() {
        poll.decision_sign = sign;
        // the sign has held since the latest ballot that could have moved it
        let latest_cast = votes.iter().map(|vote| vote.cast_at).max();
        poll.sign_since = Some(latest_cast.map_or(now, |cast| cast.min(now)));
    }

    let polls = &policy.polls;
    let quorum_met = poll.result.total_votes >= polls.quorum;
    let stable_for = poll.sign_since.map_or(Duration::ZERO, |since| now - since);
    let decided = quorum_met
        && sign != 0
        && poll.result.weighted_score.abs() >= polls.decision_threshold
        && stable_for >= Duration::seconds(polls.cooldown_minutes.saturating_mul(60));

    let max_open = Duration::seconds(polls.max_open_days.saturating_mul(86_400));
    let expired = now - poll.opened_at >= max_open
        && (poll.kind == PollKind::Verification || poll.result.total_votes > 0);

    let reason = if decided {
        CompletionReason::Decided
    } else if expired {
        CompletionReason::Expired
    } else {
        return Ok(None);
    };

    let completion = Completion {
        reason,
        quorum_met,
        completed_at: now,
    };
    poll.status = PollStatus::Completed;
    poll.completion = Some(completion.clone());
    Ok(Some(completion))
}

/// A completed poll passes when it was decided or expired with quorum, and
/// its frozen score is positive.
pub fn poll_passed(poll: &Poll) -> bool {
    match &poll.completion {
        Some(completion) => completion.quorum_met && poll.result.weighted_score > 0.0,
        None => false,
    }
}

fn map_poll_score_to_trust(score: f64, policy: &Policy) -> f64 {
    let scale = policy.polls.score_scale;
    let fraction = ((score + scale) / (2.0 * scale)).clamp(0.0, 1.0);
    policy.trust.floor + (policy.trust.ceiling - policy.trust.floor) * fraction
}

fn map_rating_to_trust(mean: f64, policy: &Policy) -> f64 {
    let fraction = ((mean - 1.0) / 4.0).clamp(0.0, 1.0);
    policy.trust.floor + (policy.trust.ceiling - policy.trust.floor) * fraction
}

fn recency_factor(rating: &RatingRecord, newest: OffsetDateTime, policy: &Policy) -> f64 {
    let half_life = policy.trust.rating_half_life_days;
    if half_life <= 0.0 {
        return 1.0;
    }
    let age_days = (newest - rating.submitted_at).as_seconds_f64() / 86_400.0;
    0.5f64.powf(age_days.max(0.0) / half_life)
}

pub fn rating_weight(rating: &RatingRecord, newest: OffsetDateTime, policy: &Policy) -> f64 {
    let interaction = if rating.had_direct_interaction {
        1.0
    } else {
        policy.trust.indirect_interaction_weight
    };
    rating.rater_trust * rating.area_weighting.multiplier * interaction * recency_factor(rating, newest, policy)
}

fn weighted_mean(pairs: impl Iterator<Item = (f64, f64)>) -> Option<f64> {
    let (sum, weights) = pairs.fold((0.0, 0.0), |(sum, weights), (value, weight)| {
        (sum + value * weight, weights + weight)
    });
    if weights > 0.0 { Some(sum / weights) } else { None }
}

/// Trust recomputed from scratch. Recency is measured against the newest
/// rating in the ledger rather than the wall clock, so identical ledgers
/// always produce identical scores.
pub fn compute_trust_breakdown(
    prior_trust: f64,
    polls: &[Poll],
    ratings: &[RatingRecord],
    policy: &Policy,
) -> TrustBreakdown {
    let counted_polls: Vec<&Poll> = polls
        .iter()
        .filter(|poll| {
            poll.status == PollStatus::Completed
                && poll.completion.as_ref().is_some_and(|c| c.quorum_met)
        })
        .collect();
    let poll_component = weighted_mean(counted_polls.iter().map(|poll| {
        (
            map_poll_score_to_trust(poll.result.weighted_score, policy),
            poll.result.total_weight(),
        )
    }));

    let newest = ratings.iter().map(|rating| rating.submitted_at).max();
    let rating_component = newest.and_then(|newest| {
        weighted_mean(ratings.iter().map(|rating| {
            let [a, b] = rating.payload.headline();
            let mean = (f64::from(a) + f64::from(b)) / 2.0;
            (map_rating_to_trust(mean, policy), rating_weight(rating, newest, policy))
        }))
    });

    let trust = &policy.trust;
    let combined = match (poll_component, rating_component) {
        (Some(poll), Some(rating)) => weighted_mean(
            [(poll, trust.poll_share), (rating, trust.rating_share)].into_iter(),
        )
        .or(Some((poll + rating) / 2.0)),
        (Some(only), None) | (None, Some(only)) => Some(only),
        (None, None) => None,
    };

    let trust_score = match combined {
        Some(value) => round_score(
            clamp_score(value, trust.floor, trust.ceiling),
            policy.output.rounding,
        ),
        None => prior_trust,
    };

    TrustBreakdown {
        trust_score,
        poll_component: poll_component.map(|value| round_score(value, policy.output.rounding)),
        rating_component: rating_component.map(|value| round_score(value, policy.output.rounding)),
        polls_counted: counted_polls.len(),
        ratings_counted: ratings.len(),
    }
}

/// Officials and contractors: trust from polls and ratings, civic sense untouched.
pub fn compute_entity_scores(
    entity: &Entity,
    polls: &[Poll],
    ratings: &[RatingRecord],
    policy: &Policy,
) -> EntityScores {
    let breakdown = compute_trust_breakdown(entity.trust_score, polls, ratings, policy);
    EntityScores {
        trust_score: breakdown.trust_score,
        civic_sense_score: entity.civic_sense_score,
    }
}

/// Civic sense from the citizen's own filing history: the share of filed
/// issues later verified or resolved, blended with participation volume.
pub fn compute_civic_sense(prior: f64, filed: &[&Issue], policy: &Policy) -> f64 {
    if filed.is_empty() {
        return prior;
    }
    let civic = &policy.civic_sense;
    let substantiated = filed.iter().filter(|issue| issue.is_substantiated()).count();
    let quality = substantiated as f64 / filed.len() as f64;
    let volume = if civic.volume_target == 0 {
        1.0
    } else {
        (filed.len() as f64 / civic.volume_target as f64).min(1.0)
    };

    let shares = civic.quality_share + civic.volume_share;
    let blended = if shares > 0.0 {
        (civic.quality_share * quality + civic.volume_share * volume) / shares
    } else {
        quality
    };
    round_score(
        clamp_score(civic.ceiling * blended, civic.floor, civic.ceiling),
        policy.output.rounding,
    )
}

pub fn compute_citizen_scores(citizen: &Citizen, filed: &[&Issue], policy: &Policy) -> EntityScores {
    EntityScores {
        trust_score: citizen.trust_score,
        civic_sense_score: compute_civic_sense(citizen.civic_sense_score, filed, policy),
    }
}

fn clamp_score(value: f64, floor: f64, ceiling: f64) -> f64 {
    value.max(floor).min(ceiling)
}

fn round_score(value: f64, decimals: u32) -> f64 {
    let factor = 10f64.powi(decimals as i32);
    (value * factor).round() / factor
}
