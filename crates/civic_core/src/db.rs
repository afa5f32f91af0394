use crate::engine::EngineSnapshot;
use crate::schema::{Citizen, Entity, Issue, Poll, RatingRecord, VoteRecord};
use anyhow::Result;
use rusqlite::{Connection, params};
use serde::de::DeserializeOwned;

pub fn open(db_path: &str) -> Result<Connection> {
    let conn = Connection::open(db_path)?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    init(&conn)?;
    Ok(conn)
}

pub fn open_in_memory() -> Result<Connection> {
    let conn = Connection::open_in_memory()?;
    init(&conn)?;
    Ok(conn)
}

fn init(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS entities (
          id TEXT PRIMARY KEY,
          kind TEXT NOT NULL,
          display_name TEXT NOT NULL,
          verification TEXT NOT NULL,
          trust_score REAL NOT NULL,
          raw_json TEXT NOT NULL,
          updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now'))
        );

        CREATE TABLE IF NOT EXISTS citizens (
          id TEXT PRIMARY KEY,
          trust_score REAL NOT NULL,
          civic_sense_score REAL NOT NULL,
          raw_json TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS issues (
          id TEXT PRIMARY KEY,
          reporter_id TEXT NOT NULL,
          assigned_to TEXT,
          status TEXT NOT NULL,
          filed_at TEXT NOT NULL,
          raw_json TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS polls (
          id TEXT PRIMARY KEY,
          entity_id TEXT NOT NULL,
          kind TEXT NOT NULL,
          status TEXT NOT NULL,
          opened_at TEXT NOT NULL,
          raw_json TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS votes (
          id TEXT NOT NULL,
          revision INTEGER NOT NULL,
          poll_id TEXT NOT NULL,
          voter_id TEXT NOT NULL,
          active INTEGER NOT NULL,
          seq INTEGER NOT NULL,
          cast_at TEXT NOT NULL,
          raw_json TEXT NOT NULL,
          PRIMARY KEY (id, revision)
        );

        CREATE TABLE IF NOT EXISTS ratings (
          id TEXT NOT NULL,
          revision INTEGER NOT NULL,
          entity_id TEXT NOT NULL,
          issue_id TEXT NOT NULL,
          rater_id TEXT NOT NULL,
          active INTEGER NOT NULL,
          seq INTEGER NOT NULL,
          submitted_at TEXT NOT NULL,
          raw_json TEXT NOT NULL,
          PRIMARY KEY (id, revision)
        );

        CREATE INDEX IF NOT EXISTS idx_polls_entity ON polls(entity_id);
        CREATE INDEX IF NOT EXISTS idx_votes_poll ON votes(poll_id);
        CREATE INDEX IF NOT EXISTS idx_ratings_entity ON ratings(entity_id);
        CREATE INDEX IF NOT EXISTS idx_issues_reporter ON issues(reporter_id);
        "#,
    )?;
    Ok(())
}

fn label<T: serde::Serialize>(value: &T) -> Result<String> {
    // unit enums serialize to a bare JSON string
    Ok(serde_json::to_value(value)?
        .as_str()
        .unwrap_or_default()
        .to_string())
}

fn timestamp(value: &time::OffsetDateTime) -> Result<String> {
    Ok(value.format(&time::format_description::well_known::Rfc3339)?)
}

pub fn upsert_entity(conn: &Connection, entity: &Entity) -> Result<()> {
    conn.execute(
        r#"
        INSERT INTO entities (id, kind, display_name, verification, trust_score, raw_json)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6)
        ON CONFLICT(id) DO UPDATE SET
          kind=excluded.kind,
          display_name=excluded.display_name,
          verification=excluded.verification,
          trust_score=excluded.trust_score,
          raw_json=excluded.raw_json,
          updated_at=strftime('%Y-%m-%dT%H:%M:%fZ','now')
        "#,
        params![
            entity.id,
            label(&entity.kind)?,
            entity.display_name,
            label(&entity.verification)?,
            entity.trust_score,
            serde_json::to_string(entity)?
        ],
    )?;
    Ok(())
}

pub fn upsert_citizen(conn: &Connection, citizen: &Citizen) -> Result<()> {
    conn.execute(
        r#"
        INSERT INTO citizens (id, trust_score, civic_sense_score, raw_json)
        VALUES (?1, ?2, ?3, ?4)
        ON CONFLICT(id) DO UPDATE SET
          trust_score=excluded.trust_score,
          civic_sense_score=excluded.civic_sense_score,
          raw_json=excluded.raw_json
        "#,
        params![
            citizen.id,
            citizen.trust_score,
            citizen.civic_sense_score,
            serde_json::to_string(citizen)?
        ],
    )?;
    Ok(())
}

pub fn upsert_issue(conn: &Connection, issue: &Issue) -> Result<()> {
    conn.execute(
        r#"
        INSERT INTO issues (id, reporter_id, assigned_to, status, filed_at, raw_json)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6)
        ON CONFLICT(id) DO UPDATE SET
          reporter_id=excluded.reporter_id,
          assigned_to=excluded.assigned_to,
          status=excluded.status,
          filed_at=excluded.filed_at,
          raw_json=excluded.raw_json
        "#,
        params![
            issue.id,
            issue.reporter_id,
            issue.assigned_to,
            label(&issue.status)?,
            timestamp(&issue.filed_at)?,
            serde_json::to_string(issue)?
        ],
    )?;
    Ok(())
}

pub fn upsert_poll(conn: &Connection, poll: &Poll) -> Result<()> {
    conn.execute(
        r#"
        INSERT INTO polls (id, entity_id, kind, status, opened_at, raw_json)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6)
        ON CONFLICT(id) DO UPDATE SET
          status=excluded.status,
          raw_json=excluded.raw_json
        "#,
        params![
            poll.id,
            poll.entity_id,
            label(&poll.kind)?,
            label(&poll.status)?,
            timestamp(&poll.opened_at)?,
            serde_json::to_string(poll)?
        ],
    )?;
    Ok(())
}

/// `seq` is the record's position in its ledger list; loads replay that order.
pub fn upsert_vote(conn: &Connection, vote: &VoteRecord, active: bool, seq: usize) -> Result<()> {
    conn.execute(
        r#"
        INSERT INTO votes (id, revision, poll_id, voter_id, active, seq, cast_at, raw_json)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
        ON CONFLICT(id, revision) DO UPDATE SET
          active=excluded.active,
          seq=excluded.seq,
          raw_json=excluded.raw_json
        "#,
        params![
            vote.id,
            vote.revision,
            vote.poll_id,
            vote.voter_id,
            active,
            seq as i64,
            timestamp(&vote.cast_at)?,
            serde_json::to_string(vote)?
        ],
    )?;
    Ok(())
}

pub fn upsert_rating(
    conn: &Connection,
    rating: &RatingRecord,
    active: bool,
    seq: usize,
) -> Result<()> {
    conn.execute(
        r#"
        INSERT INTO ratings (id, revision, entity_id, issue_id, rater_id, active, seq, submitted_at, raw_json)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
        ON CONFLICT(id, revision) DO UPDATE SET
          active=excluded.active,
          seq=excluded.seq,
          raw_json=excluded.raw_json
        "#,
        params![
            rating.id,
            rating.revision,
            rating.entity_id,
            rating.issue_id,
            rating.rater_id,
            active,
            seq as i64,
            timestamp(&rating.submitted_at)?,
            serde_json::to_string(rating)?
        ],
    )?;
    Ok(())
}

/// Writes the whole snapshot in one transaction. Rows are upserted, never
/// deleted; a superseded revision flips to `active = 0`.
pub fn save_snapshot(conn: &mut Connection, snapshot: &EngineSnapshot) -> Result<()> {
    let tx = conn.transaction()?;
    for entity in &snapshot.entities {
        upsert_entity(&tx, entity)?;
    }
    for citizen in &snapshot.citizens {
        upsert_citizen(&tx, citizen)?;
    }
    for issue in &snapshot.issues {
        upsert_issue(&tx, issue)?;
    }
    for poll in &snapshot.polls {
        upsert_poll(&tx, poll)?;
    }
    for (seq, vote) in snapshot.superseded_votes.iter().enumerate() {
        upsert_vote(&tx, vote, false, seq)?;
    }
    for (seq, vote) in snapshot.votes.iter().enumerate() {
        upsert_vote(&tx, vote, true, seq)?;
    }
    for (seq, rating) in snapshot.superseded_ratings.iter().enumerate() {
        upsert_rating(&tx, rating, false, seq)?;
    }
    for (seq, rating) in snapshot.ratings.iter().enumerate() {
        upsert_rating(&tx, rating, true, seq)?;
    }
    tx.commit()?;
    Ok(())
}

fn load_rows<T: DeserializeOwned>(conn: &Connection, sql: &str) -> Result<Vec<T>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
    let mut out = Vec::new();
    for raw in rows {
        out.push(serde_json::from_str(&raw?)?);
    }
    Ok(out)
}

pub fn load_snapshot(conn: &Connection) -> Result<EngineSnapshot> {
    Ok(EngineSnapshot {
        entities: load_rows(conn, "SELECT raw_json FROM entities ORDER BY id")?,
        citizens: load_rows(conn, "SELECT raw_json FROM citizens ORDER BY id")?,
        issues: load_rows(conn, "SELECT raw_json FROM issues ORDER BY id")?,
        polls: load_rows(conn, "SELECT raw_json FROM polls ORDER BY entity_id, opened_at, id")?,
        votes: load_rows(
            conn,
            "SELECT raw_json FROM votes WHERE active = 1 ORDER BY seq",
        )?,
        superseded_votes: load_rows(
            conn,
            "SELECT raw_json FROM votes WHERE active = 0 ORDER BY seq",
        )?,
        ratings: load_rows(
            conn,
            "SELECT raw_json FROM ratings WHERE active = 1 ORDER BY seq",
        )?,
        superseded_ratings: load_rows(
            conn,
            "SELECT raw_json FROM ratings WHERE active = 0 ORDER BY seq",
        )?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{Engine, NewEntity, VoteRequest};
    use crate::policy::Policy;
    use crate::schema::{EntityKind, Location, PollKind, ServiceStatus, VoteValue};
    use tempfile::TempDir;
    use time::macros::datetime;

    fn seeded_engine() -> Engine {
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
    }

    fn service_vote(status: ServiceStatus) -> VoteRequest {
        VoteRequest {
            entity_id: "official-001".to_string(),
            kind: PollKind::ServiceStatus,
            voter_id: "citizen-001".to_string(),
            value: VoteValue::service(status),
        }
    }

    #[test]
    fn snapshot_survives_a_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("civic.db");
        let path = path.to_str().unwrap();

        let engine = seeded_engine();
        engine
            .cast_vote(service_vote(ServiceStatus::InService), datetime!(2024-01-10 10:00 UTC))
            .unwrap();
        let snapshot = engine.snapshot();

        {
            let mut conn = open(path).unwrap();
            save_snapshot(&mut conn, &snapshot).unwrap();
        }

        let conn = open(path).unwrap();
        assert_eq!(load_snapshot(&conn).unwrap(), snapshot);
    }

    #[test]
    fn superseded_revisions_flip_inactive() {
        let mut conn = open_in_memory().unwrap();
        let engine = seeded_engine();
        engine
            .cast_vote(service_vote(ServiceStatus::InService), datetime!(2024-01-10 10:00 UTC))
            .unwrap();
        save_snapshot(&mut conn, &engine.snapshot()).unwrap();

        engine
            .cast_vote(service_vote(ServiceStatus::NotInService), datetime!(2024-01-10 10:20 UTC))
            .unwrap();
        save_snapshot(&mut conn, &engine.snapshot()).unwrap();

        let counts: (i64, i64) = conn
            .query_row(
                "SELECT SUM(active), COUNT(*) FROM votes",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!(counts, (1, 2));

        let loaded = load_snapshot(&conn).unwrap();
        assert_eq!(loaded.votes.len(), 1);
        assert_eq!(loaded.votes[0].revision, 2);
        assert_eq!(loaded.superseded_votes.len(), 1);
    }

    #[test]
    fn recast_keeps_first_cast_order_across_reload() {
        let mut conn = open_in_memory().unwrap();
        let engine = seeded_engine();
        engine
            .register_citizen("citizen-002", 7.0, Location::area("DEL-001"))
            .unwrap();
        let mut second = service_vote(ServiceStatus::InService);
        second.voter_id = "citizen-002".to_string();

        let first = engine
            .cast_vote(service_vote(ServiceStatus::InService), datetime!(2024-01-10 10:00 UTC))
            .unwrap();
        engine.cast_vote(second, datetime!(2024-01-10 10:05 UTC)).unwrap();
        save_snapshot(&mut conn, &engine.snapshot()).unwrap();

        engine
            .cast_vote(service_vote(ServiceStatus::NotInService), datetime!(2024-01-10 10:10 UTC))
            .unwrap();
        let snapshot = engine.snapshot();
        save_snapshot(&mut conn, &snapshot).unwrap();

        let loaded = load_snapshot(&conn).unwrap();
        assert_eq!(loaded, snapshot);

        let restored = Engine::restore(Policy::default(), loaded).unwrap();
        let voters: Vec<String> = restored
            .list_active_votes(&first.poll_id)
            .unwrap()
            .into_iter()
            .map(|vote| vote.voter_id)
            .collect();
        assert_eq!(voters, ["citizen-001", "citizen-002"]);
    }
}
