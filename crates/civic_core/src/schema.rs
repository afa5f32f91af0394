use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use time::OffsetDateTime;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Official,
    Contractor,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value = match self {
            EntityKind::Official => "official",
            EntityKind::Contractor => "contractor",
        };
        write!(f, "{value}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Coordinate {
    pub lat: f64, // degrees
    pub lon: f64, // degrees
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Location {
    pub area_code: Option<String>, // e.g. "DEL-001"
    pub coordinate: Option<Coordinate>,
}

impl Location {
    pub fn area(code: impl Into<String>) -> Self {
        Self {
            area_code: Some(code.into()),
            coordinate: None,
        }
    }

    pub fn point(lat: f64, lon: f64) -> Self {
        Self {
            area_code: None,
            coordinate: Some(Coordinate { lat, lon }),
        }
    }

    pub fn with_coordinate(mut self, lat: f64, lon: f64) -> Self {
        self.coordinate = Some(Coordinate { lat, lon });
        self
    }
}

/// Result of classifying an observer against a target area.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct AreaWeighting {
    pub is_local: bool,
    pub is_adjacent: bool,
    pub multiplier: f64,
    pub distance_km: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum VerificationState {
    Unverified,
    DocumentsSubmitted,
    PollingOpen,
    Verified,
    Rejected,
}

impl fmt::Display for VerificationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value = match self {
            VerificationState::Unverified => "unverified",
            VerificationState::DocumentsSubmitted => "documents_submitted",
            VerificationState::PollingOpen => "polling_open",
            VerificationState::Verified => "verified",
            VerificationState::Rejected => "rejected",
        };
        write!(f, "{value}")
    }
}

/// Verification documents as reported by the document-verification collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DocumentSet {
    Official {
        employee_id: String,
        domain_email: String,
    },
    Contractor {
        registration_number: String, // CIN / LLP
        gst_number: String,
        pan: String,
    },
}

impl DocumentSet {
    pub fn entity_kind(&self) -> EntityKind {
        match self {
            DocumentSet::Official { .. } => EntityKind::Official,
            DocumentSet::Contractor { .. } => EntityKind::Contractor,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Entity {
    pub id: String,
    pub display_name: String,
    pub category: String, // department or trade
    pub kind: EntityKind,
    pub trust_score: f64,       // [1, 10]
    pub civic_sense_score: f64, // [0, 100]
    pub verification: VerificationState,
    pub location: Location,
    pub documents: Option<DocumentSet>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Citizen {
    pub id: String,
    pub trust_score: f64,
    pub civic_sense_score: f64,
    pub location: Location,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Verification {
    Verified,
    NotVerified,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ServiceStatus {
    InService,
    NotInService,
}

/// One ballot. A verification answer, a service answer (officials only), or both.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct VoteValue {
    pub verification: Option<Verification>,
    pub service: Option<ServiceStatus>,
}

impl VoteValue {
    pub fn verified() -> Self {
        Self {
            verification: Some(Verification::Verified),
            service: None,
        }
    }

    pub fn not_verified() -> Self {
        Self {
            verification: Some(Verification::NotVerified),
            service: None,
        }
    }

    pub fn service(status: ServiceStatus) -> Self {
        Self {
            verification: None,
            service: Some(status),
        }
    }

    /// +1 for support, -1 for opposition, None when the ballot is silent on `kind`.
    pub fn sign_for(&self, kind: PollKind) -> Option<f64> {
        match kind {
            PollKind::Verification => self.verification.map(|v| match v {
                Verification::Verified => 1.0,
                Verification::NotVerified => -1.0,
            }),
            PollKind::ServiceStatus => self.service.map(|s| match s {
                ServiceStatus::InService => 1.0,
                ServiceStatus::NotInService => -1.0,
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct VoteRecord {
    pub id: String,
    pub poll_id: String,
    pub entity_id: String,
    pub entity_kind: EntityKind,
    pub voter_id: String,
    pub voter_trust: f64,
    pub value: VoteValue,
    pub area_weighting: AreaWeighting,
    pub revision: u32,
    #[serde(with = "time::serde::rfc3339")]
    #[schemars(with = "String")]
    pub cast_at: OffsetDateTime,
}

impl VoteRecord {
    pub fn weight(&self) -> f64 {
        self.voter_trust * self.area_weighting.multiplier
    }
}

/// Performance ratings, one fixed dimension set per rated entity kind.
/// Every dimension is scored 1 (very poor) to 5 (excellent).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RatingPayload {
    Official {
        response_time: u8,
        resolution_quality: u8,
        communication: u8,
        accountability: u8,
        overall_performance: u8,
    },
    Contractor {
        grievance_resolution: u8,
        service_quality: u8,
        compliance: u8,
        transparency: u8,
        community_contribution: u8,
        overall_reliability: u8,
    },
}

impl RatingPayload {
    pub fn entity_kind(&self) -> EntityKind {
        match self {
            RatingPayload::Official { .. } => EntityKind::Official,
            RatingPayload::Contractor { .. } => EntityKind::Contractor,
        }
    }

    pub fn dimensions(&self) -> Vec<(&'static str, u8)> {
        match *self {
            RatingPayload::Official {
                response_time,
                resolution_quality,
                communication,
                accountability,
                overall_performance,
            } => vec![
                ("response_time", response_time),
                ("resolution_quality", resolution_quality),
                ("communication", communication),
                ("accountability", accountability),
                ("overall_performance", overall_performance),
            ],
            RatingPayload::Contractor {
                grievance_resolution,
                service_quality,
                compliance,
                transparency,
                community_contribution,
                overall_reliability,
            } => vec![
                ("grievance_resolution", grievance_resolution),
                ("service_quality", service_quality),
                ("compliance", compliance),
                ("transparency", transparency),
                ("community_contribution", community_contribution),
                ("overall_reliability", overall_reliability),
            ],
        }
    }

    /// The accountability-class dimensions that feed trust.
    pub fn headline(&self) -> [u8; 2] {
        match *self {
            RatingPayload::Official {
                accountability,
                overall_performance,
                ..
            } => [accountability, overall_performance],
            RatingPayload::Contractor {
                transparency,
                overall_reliability,
                ..
            } => [transparency, overall_reliability],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct RatingRecord {
    pub id: String,
    pub entity_id: String,
    pub entity_kind: EntityKind,
    pub issue_id: String,
    pub rater_id: String,
    pub rater_trust: f64,
    pub had_direct_interaction: bool,
    pub payload: RatingPayload,
    pub area_weighting: AreaWeighting,
    pub revision: u32,
    #[serde(with = "time::serde::rfc3339")]
    #[schemars(with = "String")]
    pub submitted_at: OffsetDateTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum PollKind {
    Verification,
    ServiceStatus,
}

impl fmt::Display for PollKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value = match self {
            PollKind::Verification => "verification",
            PollKind::ServiceStatus => "service_status",
        };
        write!(f, "{value}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum PollStatus {
    Open,
    Completed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum CompletionReason {
    Decided, // quorum, threshold and cooldown all satisfied
    Expired, // open-duration ceiling reached
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Completion {
    pub reason: CompletionReason,
    pub quorum_met: bool,
    #[serde(with = "time::serde::rfc3339")]
    #[schemars(with = "String")]
    pub completed_at: OffsetDateTime,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct PollResult {
    pub total_votes: usize,
    pub verified_votes: usize,
    pub not_verified_votes: usize,
    pub in_service_votes: usize,
    pub not_in_service_votes: usize,
    pub positive_weight: f64,
    pub negative_weight: f64,
    pub weighted_score: f64,
}

impl PollResult {
    pub fn total_weight(&self) -> f64 {
        self.positive_weight + self.negative_weight
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Poll {
    pub id: String,
    pub entity_id: String,
    pub entity_kind: EntityKind,
    pub kind: PollKind,
    pub status: PollStatus,
    #[serde(with = "time::serde::rfc3339")]
    #[schemars(with = "String")]
    pub opened_at: OffsetDateTime,
    pub completion: Option<Completion>,
    pub result: PollResult,
    pub decision_sign: i8, // -1, 0, 1
    #[serde(with = "time::serde::rfc3339::option")]
    #[schemars(with = "Option<String>")]
    pub sign_since: Option<OffsetDateTime>,
}

impl Poll {
    pub fn is_open(&self) -> bool {
        self.status == PollStatus::Open
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum IssueStatus {
    Submitted,
    UnderReview,
    InProgress,
    Resolved,
}

impl fmt::Display for IssueStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value = match self {
            IssueStatus::Submitted => "submitted",
            IssueStatus::UnderReview => "under_review",
            IssueStatus::InProgress => "in_progress",
            IssueStatus::Resolved => "resolved",
        };
        write!(f, "{value}")
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct IssueVerificationFlags {
    pub official_verified: bool,
    pub led_to_resolution: bool,
    pub evidence_confirmed: bool,
    pub multi_source_validated: bool,
}

impl IssueVerificationFlags {
    pub fn is_verified(&self) -> bool {
        self.official_verified
            || self.led_to_resolution
            || (self.evidence_confirmed && self.multi_source_validated)
    }

    pub fn reasons(&self) -> Vec<&'static str> {
        let mut reasons = Vec::new();
        if self.official_verified {
            reasons.push("Verified by Official");
        }
        if self.led_to_resolution {
            reasons.push("Led to Resolution");
        }
        if self.evidence_confirmed {
            reasons.push("Evidence Confirmed");
        }
        if self.multi_source_validated {
            reasons.push("Multi-source Validated");
        }
        reasons
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Issue {
    pub id: String,
    pub reporter_id: String,
    pub category: String,
    pub location: Location,
    pub status: IssueStatus,
    pub assigned_to: Option<String>,
    pub verification_flags: IssueVerificationFlags,
    pub reporter_weighting: AreaWeighting, // reporter vs issue area: priority multiplier
    #[serde(with = "time::serde::rfc3339")]
    #[schemars(with = "String")]
    pub filed_at: OffsetDateTime,
}

impl Issue {
    pub fn priority_multiplier(&self) -> f64 {
        self.reporter_weighting.multiplier
    }

    /// Counts toward the reporter's quality share.
    pub fn is_substantiated(&self) -> bool {
        self.status == IssueStatus::Resolved || self.verification_flags.is_verified()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct EntityScores {
    pub trust_score: f64,
    pub civic_sense_score: f64,
}
