use anyhow::{Context, Result, bail};
use civic_core::engine::{NewEntity, NewIssue, RatingRequest, VoteRequest};
use civic_core::schema::{
    DocumentSet, EntityKind, EntityScores, IssueStatus, IssueVerificationFlags, Location, PollKind,
    RatingPayload, ServiceStatus, Verification, VoteValue,
};
use civic_core::scoring::TrustBreakdown;
use civic_core::{Engine, Policy, db};
use clap::{Args, Parser, Subcommand, ValueEnum};
use schemars::schema_for;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use time::OffsetDateTime;
use tracing::{debug, info};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "civic")]
#[command(about = "Civic accountability engine CLI", long_about = None)]
struct Cli {
    /// SQLite database holding engine state
    #[arg(long, global = true, env = "CIVIC_DB", default_value = "civic.db")]
    db: PathBuf,

    /// Directory containing policy.toml and adjacency.yaml
    #[arg(long, global = true, env = "CIVIC_POLICY_DIR", default_value = "config")]
    policy_dir: PathBuf,

    /// Log level when RUST_LOG is unset
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Export canonical JSON Schemas to the ./schemas directory
    Schema {
        #[command(subcommand)]
        command: SchemaCommands,
    },
    /// Inspect the effective scoring policy
    Policy {
        #[command(subcommand)]
        command: PolicyCommands,
    },
    /// Register and inspect officials and contractors
    Entity {
        #[command(subcommand)]
        command: EntityCommands,
    },
    /// Register and inspect citizens
    Citizen {
        #[command(subcommand)]
        command: CitizenCommands,
    },
    /// File and track civic issues
    Issue {
        #[command(subcommand)]
        command: IssueCommands,
    },
    /// Cast or recast a vote on an entity's open poll
    Vote(VoteArgs),
    /// Rate an entity's handling of an assigned issue
    Rate(RateArgs),
    /// Inspect polls
    Poll {
        #[command(subcommand)]
        command: PollCommands,
    },
    /// Complete polls whose cooldown or open-duration ceiling has passed
    Tick,
    /// Generate Markdown scorecards
    Scorecards {
        #[command(subcommand)]
        command: ScorecardCommands,
    },
}

#[derive(Subcommand)]
enum SchemaCommands {
    /// Export JSON Schema files for canonical types
    Export {
        /// Output directory (default: ./schemas)
        #[arg(long, default_value = "schemas")]
        out_dir: PathBuf,
    },
}

#[derive(Subcommand)]
enum PolicyCommands {
    /// Print the policy as TOML
    Show,
}

#[derive(Subcommand)]
enum EntityCommands {
    Register {
        #[arg(long)]
        id: String,
        #[arg(long)]
        name: String,
        #[arg(long)]
        category: String,
        #[arg(long, value_enum)]
        kind: KindArg,
        #[command(flatten)]
        location: LocationArgs,
    },
    Show {
        #[arg(long)]
        id: String,
    },
    /// Upload verification documents
    Documents {
        #[arg(long)]
        id: String,
        #[arg(long)]
        employee_id: Option<String>,
        #[arg(long)]
        domain_email: Option<String>,
        #[arg(long)]
        registration_number: Option<String>,
        #[arg(long)]
        gst_number: Option<String>,
        #[arg(long)]
        pan: Option<String>,
    },
    /// Record the document check verdict
    Confirm {
        #[arg(long)]
        id: String,
        /// Documents failed the check
        #[arg(long)]
        rejected: bool,
    },
    /// Restart verification after a rejection
    Resubmit {
        #[arg(long)]
        id: String,
    },
}

#[derive(Subcommand)]
enum CitizenCommands {
    /// Register a citizen or refresh their trust and location
    Register {
        #[arg(long)]
        id: String,
        #[arg(long)]
        trust: f64,
        #[command(flatten)]
        location: LocationArgs,
    },
    Show {
        #[arg(long)]
        id: String,
    },
}

#[derive(Subcommand)]
enum IssueCommands {
    File {
        #[arg(long)]
        id: String,
        #[arg(long)]
        reporter: String,
        #[arg(long)]
        category: String,
        #[command(flatten)]
        location: LocationArgs,
    },
    Assign {
        #[arg(long)]
        id: String,
        #[arg(long)]
        entity: String,
    },
    Status {
        #[arg(long)]
        id: String,
        #[arg(long, value_enum)]
        status: IssueStatusArg,
    },
    Flag {
        #[arg(long)]
        id: String,
        #[arg(long)]
        official_verified: bool,
        #[arg(long)]
        led_to_resolution: bool,
        #[arg(long)]
        evidence_confirmed: bool,
        #[arg(long)]
        multi_source_validated: bool,
    },
}

#[derive(Subcommand)]
enum PollCommands {
    /// Print a poll with its active votes
    Show {
        #[arg(long)]
        id: String,
    },
}

#[derive(Subcommand)]
enum ScorecardCommands {
    Build {
        /// Vault root (default: ./vault)
        #[arg(long, default_value = "vault")]
        out_dir: PathBuf,
    },
}

#[derive(Args)]
struct LocationArgs {
    /// Area code, e.g. DEL-001
    #[arg(long)]
    area: Option<String>,
    #[arg(long, allow_negative_numbers = true, requires = "lon")]
    lat: Option<f64>,
    #[arg(long, allow_negative_numbers = true, requires = "lat")]
    lon: Option<f64>,
}

impl LocationArgs {
    fn into_location(self) -> Location {
        let mut location = Location {
            area_code: self.area,
            coordinate: None,
        };
        if let (Some(lat), Some(lon)) = (self.lat, self.lon) {
            location = location.with_coordinate(lat, lon);
        }
        location
    }
}

#[derive(Args)]
struct VoteArgs {
    #[arg(long)]
    entity: String,
    #[arg(long)]
    voter: String,
    #[arg(long, value_enum)]
    poll: PollKindArg,
    #[arg(long, value_enum)]
    verification: Option<VerificationArg>,
    #[arg(long, value_enum)]
    service: Option<ServiceArg>,
}

#[derive(Args)]
struct RateArgs {
    #[arg(long)]
    entity: String,
    #[arg(long)]
    issue: String,
    #[arg(long)]
    rater: String,
    /// Dimension scores 1-5 in order: officials take five
    /// (response time, resolution quality, communication, accountability,
    /// overall performance), contractors six (grievance resolution, service
    /// quality, compliance, transparency, community contribution, overall
    /// reliability)
    #[arg(long, value_delimiter = ',', required = true)]
    scores: Vec<u8>,
    /// Rater never dealt with the entity directly
    #[arg(long)]
    indirect: bool,
}

#[derive(Clone, Copy, ValueEnum)]
enum KindArg {
    Official,
    Contractor,
}

impl From<KindArg> for EntityKind {
    fn from(value: KindArg) -> Self {
        match value {
            KindArg::Official => EntityKind::Official,
            KindArg::Contractor => EntityKind::Contractor,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum PollKindArg {
    Verification,
    Service,
}

impl From<PollKindArg> for PollKind {
    fn from(value: PollKindArg) -> Self {
        match value {
            PollKindArg::Verification => PollKind::Verification,
            PollKindArg::Service => PollKind::ServiceStatus,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum VerificationArg {
    Verified,
    NotVerified,
}

#[derive(Clone, Copy, ValueEnum)]
enum ServiceArg {
    InService,
    NotInService,
}

#[derive(Clone, Copy, ValueEnum)]
enum IssueStatusArg {
    Submitted,
    UnderReview,
    InProgress,
    Resolved,
}

impl From<IssueStatusArg> for IssueStatus {
    fn from(value: IssueStatusArg) -> Self {
        match value {
            IssueStatusArg::Submitted => IssueStatus::Submitted,
            IssueStatusArg::UnderReview => IssueStatus::UnderReview,
            IssueStatusArg::InProgress => IssueStatus::InProgress,
            IssueStatusArg::Resolved => IssueStatus::Resolved,
        }
    }
}

#[derive(Serialize)]
struct EntityView<'a> {
    entity: &'a civic_core::schema::Entity,
    breakdown: &'a TrustBreakdown,
    polls: &'a [civic_core::schema::Poll],
}

#[derive(Serialize)]
struct CitizenView<'a> {
    citizen: &'a civic_core::schema::Citizen,
    scores: &'a EntityScores,
}

#[derive(Serialize)]
struct PollView<'a> {
    poll: &'a civic_core::schema::Poll,
    votes: &'a [civic_core::schema::VoteRecord],
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("civic_core={0},civic={0},warn", cli.log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    match cli.command {
        Commands::Schema { command } => match command {
            SchemaCommands::Export { out_dir } => schema_export(out_dir),
        },
        Commands::Policy { command } => match command {
            PolicyCommands::Show => policy_show(&cli.policy_dir),
        },
        command => run_against_db(&cli.db, &cli.policy_dir, command),
    }
}

fn schema_export(out_dir: PathBuf) -> Result<()> {
    fs::create_dir_all(&out_dir)?;

    let schemas = [
        ("Entity", schema_for!(civic_core::schema::Entity)),
        ("Citizen", schema_for!(civic_core::schema::Citizen)),
        ("Issue", schema_for!(civic_core::schema::Issue)),
        ("Poll", schema_for!(civic_core::schema::Poll)),
        ("PollResult", schema_for!(civic_core::schema::PollResult)),
        ("VoteRecord", schema_for!(civic_core::schema::VoteRecord)),
        ("RatingRecord", schema_for!(civic_core::schema::RatingRecord)),
        ("RatingPayload", schema_for!(civic_core::schema::RatingPayload)),
        ("DocumentSet", schema_for!(civic_core::schema::DocumentSet)),
        ("EntityScores", schema_for!(civic_core::schema::EntityScores)),
        ("TrustBreakdown", schema_for!(civic_core::scoring::TrustBreakdown)),
        ("EngineSnapshot", schema_for!(civic_core::engine::EngineSnapshot)),
    ];
    for (name, schema) in schemas {
        let json = serde_json::to_string_pretty(&schema)?;
        fs::write(out_dir.join(format!("{name}.schema.json")), json)?;
    }

    println!("Exported schemas to {}", out_dir.display());
    Ok(())
}

fn policy_show(policy_dir: &Path) -> Result<()> {
    let policy = Policy::load_from_dir(policy_dir)?;
    println!("{}", toml::to_string_pretty(&policy)?);
    if !policy.adjacency.is_empty() {
        println!("# adjacency ({} pairs)", policy.adjacency.len());
        for (a, b) in policy.adjacency.pairs() {
            println!("# {a} <-> {b}");
        }
    }
    Ok(())
}

fn run_against_db(db_path: &Path, policy_dir: &Path, command: Commands) -> Result<()> {
    let policy = Policy::load_from_dir(policy_dir)?;
    let db_str = db_path.to_string_lossy();
    let mut conn = db::open(&db_str)?;

    if let Commands::Scorecards { command } = command {
        let ScorecardCommands::Build { out_dir } = command;
        let stats = scorecards::build_vault(&conn, &policy, &out_dir, OffsetDateTime::now_utc())?;
        println!(
            "Wrote {} entity and {} poll notes to {}",
            stats.entities,
            stats.polls,
            out_dir.display()
        );
        return Ok(());
    }

    let snapshot = db::load_snapshot(&conn)?;
    debug!(
        "Loaded {} entities, {} polls from {}",
        snapshot.entities.len(),
        snapshot.polls.len(),
        db_str
    );
    let engine = Engine::restore(policy, snapshot).context("restoring engine state")?;
    let now = OffsetDateTime::now_utc();

    let dirty = execute(&engine, command, now)?;
    if dirty {
        db::save_snapshot(&mut conn, &engine.snapshot())?;
        info!("Saved state to {}", db_str);
    }
    Ok(())
}

/// Runs one command. Returns whether engine state changed.
fn execute(engine: &Engine, command: Commands, now: OffsetDateTime) -> Result<bool> {
    match command {
        Commands::Entity { command } => match command {
            EntityCommands::Register {
                id,
                name,
                category,
                kind,
                location,
            } => {
                let entity = engine.register_entity(NewEntity {
                    id,
                    display_name: name,
                    category,
                    kind: kind.into(),
                    location: location.into_location(),
                })?;
                print_json(&entity)?;
                Ok(true)
            }
            EntityCommands::Show { id } => {
                let entity = engine.entity(&id)?;
                let breakdown = engine.trust_breakdown(&id)?;
                let polls = engine.polls_for(&id)?;
                print_json(&EntityView {
                    entity: &entity,
                    breakdown: &breakdown,
                    polls: &polls,
                })?;
                Ok(false)
            }
            EntityCommands::Documents {
                id,
                employee_id,
                domain_email,
                registration_number,
                gst_number,
                pan,
            } => {
                let documents = match engine.entity(&id)?.kind {
                    EntityKind::Official => DocumentSet::Official {
                        employee_id: employee_id.context("--employee-id is required for officials")?,
                        domain_email: domain_email
                            .context("--domain-email is required for officials")?,
                    },
                    EntityKind::Contractor => DocumentSet::Contractor {
                        registration_number: registration_number
                            .context("--registration-number is required for contractors")?,
                        gst_number: gst_number.context("--gst-number is required for contractors")?,
                        pan: pan.context("--pan is required for contractors")?,
                    },
                };
                let state = engine.submit_documents(&id, documents)?;
                println!("{id}: {state}");
                Ok(true)
            }
            EntityCommands::Confirm { id, rejected } => {
                let state = engine.confirm_documents(&id, !rejected, now)?;
                println!("{id}: {state}");
                Ok(true)
            }
            EntityCommands::Resubmit { id } => {
                let state = engine.resubmit(&id)?;
                println!("{id}: {state}");
                Ok(true)
            }
        },
        Commands::Citizen { command } => match command {
            CitizenCommands::Register {
                id,
                trust,
                location,
            } => {
                let citizen = engine.register_citizen(&id, trust, location.into_location())?;
                print_json(&citizen)?;
                Ok(true)
            }
            CitizenCommands::Show { id } => {
                let citizen = engine.citizen(&id)?;
                let scores = engine.compute_citizen_scores(&id)?;
                print_json(&CitizenView {
                    citizen: &citizen,
                    scores: &scores,
                })?;
                Ok(false)
            }
        },
        Commands::Issue { command } => {
            let issue = match command {
                IssueCommands::File {
                    id,
                    reporter,
                    category,
                    location,
                } => engine.file_issue(
                    NewIssue {
                        id,
                        reporter_id: reporter,
                        category,
                        location: location.into_location(),
                    },
                    now,
                )?,
                IssueCommands::Assign { id, entity } => engine.assign_issue(&id, &entity)?,
                IssueCommands::Status { id, status } => {
                    engine.update_issue_status(&id, status.into())?
                }
                IssueCommands::Flag {
                    id,
                    official_verified,
                    led_to_resolution,
                    evidence_confirmed,
                    multi_source_validated,
                } => engine.flag_issue(
                    &id,
                    IssueVerificationFlags {
                        official_verified,
                        led_to_resolution,
                        evidence_confirmed,
                        multi_source_validated,
                    },
                )?,
            };
            print_json(&issue)?;
            Ok(true)
        }
        Commands::Vote(args) => {
            let value = VoteValue {
                verification: args.verification.map(|v| match v {
                    VerificationArg::Verified => Verification::Verified,
                    VerificationArg::NotVerified => Verification::NotVerified,
                }),
                service: args.service.map(|s| match s {
                    ServiceArg::InService => ServiceStatus::InService,
                    ServiceArg::NotInService => ServiceStatus::NotInService,
                }),
            };
            let vote = engine.cast_vote(
                VoteRequest {
                    entity_id: args.entity,
                    kind: args.poll.into(),
                    voter_id: args.voter,
                    value,
                },
                now,
            )?;
            print_json(&vote)?;
            Ok(true)
        }
        Commands::Rate(args) => {
            let kind = engine.entity(&args.entity)?.kind;
            let rating = engine.submit_rating(
                RatingRequest {
                    entity_id: args.entity,
                    issue_id: args.issue,
                    rater_id: args.rater,
                    had_direct_interaction: !args.indirect,
                    payload: rating_payload(kind, &args.scores)?,
                },
                now,
            )?;
            print_json(&rating)?;
            Ok(true)
        }
        Commands::Poll { command } => match command {
            PollCommands::Show { id } => {
                let poll = engine.poll(&id)?;
                let votes = engine.list_active_votes(&id)?;
                print_json(&PollView {
                    poll: &poll,
                    votes: &votes,
                })?;
                Ok(false)
            }
        },
        Commands::Tick => {
            let completed = engine.tick(now);
            for done in &completed {
                println!(
                    "{} ({} poll for {}) completed, score {:.2}, entity {}",
                    done.poll.id,
                    done.poll.kind,
                    done.poll.entity_id,
                    done.poll.result.weighted_score,
                    done.verification
                );
            }
            if completed.is_empty() {
                println!("No polls ready to complete");
            }
            Ok(!completed.is_empty())
        }
        Commands::Schema { .. } | Commands::Policy { .. } | Commands::Scorecards { .. } => {
            bail!("command does not operate on engine state")
        }
    }
}

fn rating_payload(kind: EntityKind, scores: &[u8]) -> Result<RatingPayload> {
    match (kind, scores) {
        (
            EntityKind::Official,
            &[
                response_time,
                resolution_quality,
                communication,
                accountability,
                overall_performance,
            ],
        ) => Ok(RatingPayload::Official {
            response_time,
            resolution_quality,
            communication,
            accountability,
            overall_performance,
        }),
        (
            EntityKind::Contractor,
            &[
                grievance_resolution,
                service_quality,
                compliance,
                transparency,
                community_contribution,
                overall_reliability,
            ],
        ) => Ok(RatingPayload::Contractor {
            grievance_resolution,
            service_quality,
            compliance,
            transparency,
            community_contribution,
            overall_reliability,
        }),
        (EntityKind::Official, _) => bail!("officials take 5 scores, got {}", scores.len()),
        (EntityKind::Contractor, _) => bail!("contractors take 6 scores, got {}", scores.len()),
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_vote_flags() {
        let cli = Cli::try_parse_from([
            "civic", "vote", "--entity", "official-001", "--voter", "c1", "--poll", "service",
            "--service", "in-service",
        ])
        .unwrap();
        assert!(matches!(cli.command, Commands::Vote(_)));
        assert_eq!(cli.db, PathBuf::from("civic.db"));
    }

    #[test]
    fn rating_payload_matches_entity_kind() {
        let official = rating_payload(EntityKind::Official, &[3, 4, 5, 4, 4]).unwrap();
        assert_eq!(official.headline(), [4, 4]);
        let contractor = rating_payload(EntityKind::Contractor, &[1, 2, 3, 4, 5, 5]).unwrap();
        assert_eq!(contractor.headline(), [4, 5]);
        assert!(rating_payload(EntityKind::Official, &[1, 2, 3, 4, 5, 5]).is_err());
        assert!(rating_payload(EntityKind::Contractor, &[1, 2]).is_err());
    }
}
