use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

/// Every tunable constant the engine uses. Loaded from `policy.toml` plus
/// `adjacency.yaml`; anything missing falls back to the defaults below.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Policy {
    pub locality: LocalityPolicy,
    pub votes: VotePolicy,
    pub polls: PollPolicy,
    pub trust: TrustPolicy,
    pub civic_sense: CivicSensePolicy,
    pub output: OutputPolicy,
    #[serde(skip)]
    pub adjacency: AdjacencyTable,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalityPolicy {
    pub local_radius_km: f64,
    pub adjacent_radius_km: f64,
    pub local_multiplier: f64,
    pub adjacent_multiplier: f64,
    pub outside_multiplier: f64,
    pub movement_threshold_km: f64,
}

impl Default for LocalityPolicy {
    fn default() -> Self {
        Self {
            local_radius_km: 2.0,
            adjacent_radius_km: 10.0,
            local_multiplier: 2.0,
            adjacent_multiplier: 1.5,
            outside_multiplier: 1.0,
            movement_threshold_km: 1.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VotePolicy {
    pub min_voter_trust: f64,
    pub min_rater_trust: f64,
}

impl Default for VotePolicy {
    fn default() -> Self {
        Self {
            min_voter_trust: 1.0,
            min_rater_trust: 4.0,
        }
    }
}

/// Upper bounds for poll durations: one year.
pub const MAX_OPEN_DAYS: i64 = 366;
pub const MAX_COOLDOWN_MINUTES: i64 = MAX_OPEN_DAYS * 24 * 60;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollPolicy {
    pub quorum: usize,
    pub decision_threshold: f64,
    pub cooldown_minutes: i64,
    pub max_open_days: i64,
    /// Reporting range of the weighted score: results land in (-scale, scale).
    pub score_scale: f64,
    /// Neutral pseudo-weight added to the denominator so small polls stay damped.
    pub prior_weight: f64,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            quorum: 2,
            decision_threshold: 2.0,
            cooldown_minutes: 60,
            max_open_days: 14,
            score_scale: 5.0,
            prior_weight: 6.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrustPolicy {
    pub floor: f64,
    pub ceiling: f64,
    pub seed: f64,
    pub poll_share: f64,
    pub rating_share: f64,
    pub indirect_interaction_weight: f64,
    /// Zero disables recency decay.
    pub rating_half_life_days: f64,
}

impl Default for TrustPolicy {
    fn default() -> Self {
        Self {
            floor: 1.0,
            ceiling: 10.0,
            seed: 1.0,
            poll_share: 0.4,
            rating_share: 0.6,
            indirect_interaction_weight: 0.5,
            rating_half_life_days: 180.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CivicSensePolicy {
    pub floor: f64,
    pub ceiling: f64,
    pub seed: f64,
    pub quality_share: f64,
    pub volume_share: f64,
    pub volume_target: usize,
}

impl Default for CivicSensePolicy {
    fn default() -> Self {
        Self {
            floor: 0.0,
            ceiling: 100.0,
            seed: 50.0,
            quality_share: 0.7,
            volume_share: 0.3,
            volume_target: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputPolicy {
    pub rounding: u32,
}

impl Default for OutputPolicy {
    fn default() -> Self {
        Self { rounding: 2 }
    }
}

/// Symmetric set of area-code pairs considered adjacent.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AdjacencyTable {
    pairs: BTreeSet<(String, String)>,
}

impl AdjacencyTable {
    pub fn insert(&mut self, a: &str, b: &str) {
        let (a, b) = (normalize_area(a), normalize_area(b));
        if a.is_empty() || b.is_empty() || a == b {
            return;
        }
        let pair = if a <= b { (a, b) } else { (b, a) };
        self.pairs.insert(pair);
    }

    pub fn are_adjacent(&self, a: &str, b: &str) -> bool {
        let (a, b) = (normalize_area(a), normalize_area(b));
        let pair = if a <= b { (a, b) } else { (b, a) };
        self.pairs.contains(&pair)
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn pairs(&self) -> impl Iterator<Item = (&str, &str)> {
        self.pairs.iter().map(|(a, b)| (a.as_str(), b.as_str()))
    }
}

pub fn normalize_area(code: &str) -> String {
    code.trim().to_ascii_uppercase()
}

#[derive(Debug, Clone, Deserialize)]
struct AdjacencyFile {
    #[serde(default)]
    adjacency: std::collections::HashMap<String, Vec<String>>,
}

impl Policy {
    pub fn load_from_dir(path: &Path) -> Result<Self> {
        let policy_path = path.join("policy.toml");
        let mut policy: Policy = if policy_path.exists() {
            let policy_str = fs::read_to_string(&policy_path)?;
            toml::from_str(&policy_str)?
        } else {
            Policy::default()
        };

        let adjacency_path = path.join("adjacency.yaml");
        if adjacency_path.exists() {
            let adjacency_str = fs::read_to_string(&adjacency_path)?;
            policy.adjacency = parse_adjacency(&adjacency_str)?;
        }

        policy.validate()?;
        Ok(policy)
    }

    pub fn validate(&self) -> Result<()> {
        let l = &self.locality;
        if l.local_radius_km < 0.0 || l.adjacent_radius_km < l.local_radius_km {
            bail!(
                "adjacent radius ({}) must be >= local radius ({}) >= 0",
                l.adjacent_radius_km,
                l.local_radius_km
            );
        }
        if !(l.local_multiplier >= l.adjacent_multiplier
            && l.adjacent_multiplier >= l.outside_multiplier
            && l.outside_multiplier > 0.0)
        {
            bail!("locality multipliers must satisfy local >= adjacent >= outside > 0");
        }
        if self.polls.quorum == 0 {
            bail!("poll quorum must be at least 1");
        }
        if !(0..=MAX_COOLDOWN_MINUTES).contains(&self.polls.cooldown_minutes) {
            bail!(
                "poll cooldown ({} min) must lie within [0, {MAX_COOLDOWN_MINUTES}]",
                self.polls.cooldown_minutes
            );
        }
        if !(1..=MAX_OPEN_DAYS).contains(&self.polls.max_open_days) {
            bail!(
                "poll max_open_days ({}) must lie within [1, {MAX_OPEN_DAYS}]",
                self.polls.max_open_days
            );
        }
        if self.polls.score_scale <= 0.0 || self.polls.prior_weight < 0.0 {
            bail!("poll score scale must be positive and prior weight non-negative");
        }
        if self.trust.floor > self.trust.ceiling
            || !(self.trust.floor..=self.trust.ceiling).contains(&self.trust.seed)
        {
            bail!("trust seed must lie within [floor, ceiling]");
        }
        if self.trust.poll_share < 0.0 || self.trust.rating_share < 0.0 {
            bail!("trust component shares must be non-negative");
        }
        if self.civic_sense.floor > self.civic_sense.ceiling
            || !(self.civic_sense.floor..=self.civic_sense.ceiling).contains(&self.civic_sense.seed)
        {
            bail!("civic-sense seed must lie within [floor, ceiling]");
        }
        Ok(())
    }
}

pub fn parse_adjacency(raw: &str) -> Result<AdjacencyTable> {
    let parsed: AdjacencyFile = serde_yaml::from_str(raw)?;
    let mut table = AdjacencyTable::default();
    for (area, neighbours) in parsed.adjacency {
        for neighbour in neighbours {
            table.insert(&area, &neighbour);
        }
    }
    Ok(table)
}
