use anyhow::Result;
use civic_core::db;
use civic_core::engine::EngineSnapshot;
use civic_core::policy::Policy;
use civic_core::schema::{Entity, Issue, Poll, RatingRecord};
use civic_core::scoring::{TrustBreakdown, compute_trust_breakdown};
use rusqlite::Connection;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use time::OffsetDateTime;
use time::macros::format_description;

pub struct VaultPaths {
    pub root: PathBuf,
    pub index_dir: PathBuf,
    pub entities_dir: PathBuf,
    pub polls_dir: PathBuf,
}

impl VaultPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            index_dir: root.join("00_Index"),
            entities_dir: root.join("Entities"),
            polls_dir: root.join("Polls"),
            root,
        }
    }

    pub fn ensure(&self) -> Result<()> {
        fs::create_dir_all(&self.index_dir)?;
        fs::create_dir_all(&self.entities_dir)?;
        fs::create_dir_all(&self.polls_dir)?;
        Ok(())
    }
}

/// Summary of what a build wrote.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VaultStats {
    pub entities: usize,
    pub polls: usize,
    pub issues: usize,
}

pub fn build_vault(
    conn: &Connection,
    policy: &Policy,
    vault_root: &Path,
    generated_at: OffsetDateTime,
) -> Result<VaultStats> {
    let snapshot = db::load_snapshot(conn)?;
    write_vault(&snapshot, policy, vault_root, generated_at)
}

pub fn write_vault(
    snapshot: &EngineSnapshot,
    policy: &Policy,
    vault_root: &Path,
    generated_at: OffsetDateTime,
) -> Result<VaultStats> {
    let paths = VaultPaths::new(vault_root);
    paths.ensure()?;
    let stamp = generated_at.format(format_description!("[year]-[month]-[day] [hour]:[minute] UTC"))?;

    // 1) Entity scorecards, highest trust first
    let mut entities: Vec<&Entity> = snapshot.entities.iter().collect();
    entities.sort_by(|a, b| {
        b.trust_score
            .total_cmp(&a.trust_score)
            .then_with(|| a.id.cmp(&b.id))
    });

    let mut entity_index = index_header("MOC - Entities", &stamp);
    for entity in &entities {
        let polls: Vec<Poll> = snapshot
            .polls
            .iter()
            .filter(|poll| poll.entity_id == entity.id)
            .cloned()
            .collect();
        let ratings: Vec<RatingRecord> = snapshot
            .ratings
            .iter()
            .filter(|rating| rating.entity_id == entity.id)
            .cloned()
            .collect();
        let breakdown = compute_trust_breakdown(entity.trust_score, &polls, &ratings, policy);
        write_entity_note(&paths, entity, &polls, &ratings, &breakdown)?;
        entity_index.push(format!(
            "- [[Entities/{}|{}]] ({}) trust {:.2}, {}",
            entity.id, entity.display_name, entity.kind, entity.trust_score, entity.verification
        ));
    }
    if entities.is_empty() {
        entity_index.push("_No registered entities._".to_string());
    }
    fs::write(paths.index_dir.join("MOC - Entities.md"), entity_index.join("\n"))?;

    // 2) Poll notes
    let mut poll_index = index_header("MOC - Polls", &stamp);
    let mut polls: Vec<&Poll> = snapshot.polls.iter().collect();
    polls.sort_by(|a, b| b.opened_at.cmp(&a.opened_at).then_with(|| a.id.cmp(&b.id)));
    for poll in &polls {
        write_poll_note(&paths, poll)?;
        poll_index.push(format!(
            "- [[Polls/{}|{} poll for {}]] {:?}, score {:.2}",
            poll.id, poll.kind, poll.entity_id, poll.status, poll.result.weighted_score
        ));
    }
    if polls.is_empty() {
        poll_index.push("_No polls opened._".to_string());
    }
    fs::write(paths.index_dir.join("MOC - Polls.md"), poll_index.join("\n"))?;

    // 3) Issue overview
    let issue_lines = issue_overview(&snapshot.issues, &stamp);
    fs::write(paths.index_dir.join("MOC - Issues.md"), issue_lines.join("\n"))?;

    Ok(VaultStats {
        entities: entities.len(),
        polls: polls.len(),
        issues: snapshot.issues.len(),
    })
}

fn index_header(title: &str, stamp: &str) -> Vec<String> {
    vec![
        format!("# {title}"),
        String::new(),
        format!("This index is generated ({stamp}). Do not edit manually."),
        String::new(),
    ]
}

fn write_entity_note(
    paths: &VaultPaths,
    entity: &Entity,
    polls: &[Poll],
    ratings: &[RatingRecord],
    breakdown: &TrustBreakdown,
) -> Result<()> {
    let note_path = paths.entities_dir.join(format!("{}.md", entity.id));

    let mut md = String::new();
    md.push_str("---\n");
    md.push_str(&format!("id: {}\n", entity.id));
    md.push_str(&format!("kind: {}\n", entity.kind));
    md.push_str(&format!("trust_score: {}\n", entity.trust_score));
    md.push_str(&format!("civic_sense_score: {}\n", entity.civic_sense_score));
    md.push_str(&format!("verification: {}\n", entity.verification));
    if let Some(area) = &entity.location.area_code {
        md.push_str(&format!("area_code: {area}\n"));
    }
    md.push_str("---\n\n");

    md.push_str(&format!("# {}\n\n", entity.display_name));
    md.push_str(&format!("- Category: `{}`\n", entity.category));
    md.push_str(&format!("- Verification: `{}`\n\n", entity.verification));

    md.push_str("## Trust\n");
    md.push_str(&format!("- Score: **{:.2}** / 10\n", breakdown.trust_score));
    md.push_str(&format!(
        "- From polls: {} ({} counted)\n",
        fmt_component(breakdown.poll_component),
        breakdown.polls_counted
    ));
    md.push_str(&format!(
        "- From ratings: {} ({} counted)\n\n",
        fmt_component(breakdown.rating_component),
        breakdown.ratings_counted
    ));

    md.push_str("## Polls\n");
    if polls.is_empty() {
        md.push_str("_No polls yet._\n");
    } else {
        md.push_str("| Poll | Kind | Status | Votes | Score |\n");
        md.push_str("|------|------|--------|-------|-------|\n");
        for poll in polls {
            md.push_str(&format!(
                "| [[Polls/{}]] | {} | {:?} | {} | {:.2} |\n",
                poll.id, poll.kind, poll.status, poll.result.total_votes, poll.result.weighted_score
            ));
        }
    }
    md.push('\n');

    md.push_str("## Ratings\n");
    let averages = dimension_averages(ratings);
    if averages.is_empty() {
        md.push_str("_No ratings yet._\n");
    } else {
        md.push_str(&format!("{} active rating(s).\n\n", ratings.len()));
        for (dimension, average) in averages {
            md.push_str(&format!("- {dimension}: {average:.2}\n"));
        }
    }

    if let Some(documents) = &entity.documents {
        md.push_str("\n## Documents\n");
        md.push_str("```json\n");
        md.push_str(&serde_json::to_string_pretty(documents)?);
        md.push_str("\n```\n");
    }

    fs::write(note_path, md)?;
    Ok(())
}

fn fmt_component(value: Option<f64>) -> String {
    value.map_or_else(|| "n/a".to_string(), |v| format!("{v:.2}"))
}

fn dimension_averages(ratings: &[RatingRecord]) -> BTreeMap<&'static str, f64> {
    let mut sums: BTreeMap<&'static str, (u32, u32)> = BTreeMap::new();
    for rating in ratings {
        for (dimension, score) in rating.payload.dimensions() {
            let entry = sums.entry(dimension).or_insert((0, 0));
            entry.0 += u32::from(score);
            entry.1 += 1;
        }
    }
    sums.into_iter()
        .map(|(dimension, (sum, count))| (dimension, f64::from(sum) / f64::from(count)))
        .collect()
}

fn write_poll_note(paths: &VaultPaths, poll: &Poll) -> Result<()> {
    let note_path = paths.polls_dir.join(format!("{}.md", poll.id));
    let r = &poll.result;

    let mut md = String::new();
    md.push_str("---\n");
    md.push_str(&format!("id: {}\n", poll.id));
    md.push_str(&format!("entity_id: {}\n", poll.entity_id));
    md.push_str(&format!("kind: {}\n", poll.kind));
    md.push_str(&format!("status: {:?}\n", poll.status));
    md.push_str("result_json: |\n");
    md.push_str(&indent_yaml_block(&serde_json::to_string_pretty(r)?));
    md.push_str("---\n\n");

    md.push_str(&format!("# {} poll for [[Entities/{}]]\n\n", poll.kind, poll.entity_id));
    md.push_str(&format!("- Total votes: {}\n", r.total_votes));
    md.push_str(&format!("- Verified / not verified: {} / {}\n", r.verified_votes, r.not_verified_votes));
    md.push_str(&format!(
        "- In service / not in service: {} / {}\n",
        r.in_service_votes, r.not_in_service_votes
    ));
    md.push_str(&format!("- Weighted score: **{:.2}**\n", r.weighted_score));
    match &poll.completion {
        Some(completion) => md.push_str(&format!(
            "- Completed: {:?}, quorum {}\n",
            completion.reason,
            if completion.quorum_met { "met" } else { "not met" }
        )),
        None => md.push_str("- Still open\n"),
    }

    fs::write(note_path, md)?;
    Ok(())
}

fn issue_overview(issues: &[Issue], stamp: &str) -> Vec<String> {
    let mut lines = index_header("MOC - Issues", stamp);

    let mut by_status: BTreeMap<String, usize> = BTreeMap::new();
    let mut by_category: BTreeMap<String, usize> = BTreeMap::new();
    for issue in issues {
        *by_status.entry(issue.status.to_string()).or_insert(0) += 1;
        *by_category.entry(issue.category.clone()).or_insert(0) += 1;
    }

    lines.push("## By Status".to_string());
    lines.push(String::new());
    if by_status.is_empty() {
        lines.push("_No issues filed._".to_string());
    }
    for (status, count) in by_status {
        lines.push(format!("- {status} ({count})"));
    }

    lines.push(String::new());
    lines.push("## By Category".to_string());
    lines.push(String::new());
    let mut categories: Vec<(String, usize)> = by_category.into_iter().collect();
    categories.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    if categories.is_empty() {
        lines.push("_No issues filed._".to_string());
    }
    for (category, count) in categories {
        lines.push(format!("- {category} ({count})"));
    }
    lines
}

fn indent_yaml_block(s: &str) -> String {
    let mut out = String::new();
    for line in s.lines() {
        out.push_str("  ");
        out.push_str(line);
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use civic_core::Engine;
    use civic_core::engine::{NewEntity, NewIssue, VoteRequest};
    use civic_core::schema::{EntityKind, Location, PollKind, ServiceStatus, VoteValue};
    use tempfile::TempDir;
    use time::macros::datetime;

    fn snapshot() -> EngineSnapshot {
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
            .register_citizen("citizen-001", 7.0, Location::area("DEL-001"))
            .unwrap();
        engine
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
        engine
            .cast_vote(
                VoteRequest {
                    entity_id: "official-001".to_string(),
                    kind: PollKind::ServiceStatus,
                    voter_id: "citizen-001".to_string(),
                    value: VoteValue::service(ServiceStatus::InService),
                },
                datetime!(2024-01-10 10:00 UTC),
            )
            .unwrap();
        engine.snapshot()
    }

    #[test]
    fn writes_notes_and_indexes() {
        let dir = TempDir::new().unwrap();
        let snapshot = snapshot();
        let stats = write_vault(
            &snapshot,
            &Policy::default(),
            dir.path(),
            datetime!(2024-01-11 09:30 UTC),
        )
        .unwrap();
        assert_eq!(stats, VaultStats { entities: 1, polls: 1, issues: 1 });

        let entity_note = fs::read_to_string(dir.path().join("Entities/official-001.md")).unwrap();
        assert!(entity_note.contains("# Rajesh Kumar"));
        assert!(entity_note.contains("verification: unverified"));
        assert!(entity_note.contains("_No ratings yet._"));

        let poll_note =
            fs::read_to_string(dir.path().join(format!("Polls/{}.md", snapshot.polls[0].id))).unwrap();
        assert!(poll_note.contains("- Total votes: 1"));
        assert!(poll_note.contains("- Still open"));

        let moc = fs::read_to_string(dir.path().join("00_Index/MOC - Entities.md")).unwrap();
        assert!(moc.contains("2024-01-11 09:30 UTC"));
        assert!(moc.contains("[[Entities/official-001|Rajesh Kumar]]"));

        let issues = fs::read_to_string(dir.path().join("00_Index/MOC - Issues.md")).unwrap();
        assert!(issues.contains("- submitted (1)"));
        assert!(issues.contains("- Infrastructure (1)"));
    }

    #[test]
    fn builds_from_database() {
        let dir = TempDir::new().unwrap();
        let mut conn = db::open_in_memory().unwrap();
        db::save_snapshot(&mut conn, &snapshot()).unwrap();

        let stats = build_vault(
            &conn,
            &Policy::default(),
            &dir.path().join("vault"),
            datetime!(2024-01-11 09:30 UTC),
        )
        .unwrap();
        assert_eq!(stats.entities, 1);
        assert!(dir.path().join("vault/00_Index/MOC - Polls.md").exists());
    }
}
