//! Run ledger: one row per run, one row per identifier outcome.

use std::path::Path;

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::warn;

use crate::harvest::{Outcome, OutcomeSink, RunSummary};
use crate::record::RecordKey;

pub fn connect(path: &Path) -> Result<Connection> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let conn = Connection::open(path)
        .with_context(|| format!("opening ledger {}", path.display()))?;
    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
    Ok(conn)
}

pub fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS runs (
            id          INTEGER PRIMARY KEY,
            command     TEXT NOT NULL,
            started_at  TEXT NOT NULL DEFAULT (datetime('now')),
            finished_at TEXT,
            attempted   INTEGER,
            succeeded   INTEGER,
            skipped     INTEGER
        );

        CREATE TABLE IF NOT EXISTS outcomes (
            id          INTEGER PRIMARY KEY,
            run_id      INTEGER NOT NULL REFERENCES runs(id),
            group_name  TEXT NOT NULL,
            level       TEXT NOT NULL CHECK(level IN ('query','document')),
            identifier  TEXT NOT NULL,
            source_id   TEXT,
            outcome     TEXT NOT NULL,
            detail      TEXT,
            recorded_at TEXT NOT NULL DEFAULT (datetime('now'))
        );
        CREATE INDEX IF NOT EXISTS idx_outcomes_run ON outcomes(run_id);
        CREATE INDEX IF NOT EXISTS idx_outcomes_identifier ON outcomes(identifier);
        ",
    )?;
    Ok(())
}

pub fn start_run(conn: &Connection, command: &str) -> Result<i64> {
    conn.execute("INSERT INTO runs (command) VALUES (?1)", params![command])?;
    Ok(conn.last_insert_rowid())
}

pub fn record_outcome(conn: &Connection, run_id: i64, key: &RecordKey, outcome: &Outcome) -> Result<()> {
    let source_id = match key {
        RecordKey::Source { .. } => None,
        RecordKey::Related { source, .. } => Some(source.as_str()),
    };
    conn.execute(
        "INSERT INTO outcomes (run_id, group_name, level, identifier, source_id, outcome, detail)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            run_id,
            key.group(),
            key.level().as_str(),
            key.identifier(),
            source_id,
            outcome.kind(),
            outcome.detail(),
        ],
    )?;
    Ok(())
}

pub fn finish_run(conn: &Connection, run_id: i64, summary: &RunSummary) -> Result<()> {
    let mut total = summary.queries();
    total.merge(&summary.documents());
    conn.execute(
        "UPDATE runs SET finished_at = datetime('now'), attempted = ?2, succeeded = ?3, skipped = ?4
         WHERE id = ?1",
        params![
            run_id,
            total.attempted() as i64,
            total.succeeded() as i64,
            total.skipped() as i64,
        ],
    )?;
    Ok(())
}

/// Outcome counts of one group at one level.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupStats {
    pub group: String,
    pub level: String,
    pub persisted: usize,
    pub skipped: usize,
    pub incomplete: usize,
    pub failed: usize,
}

pub struct Stats {
    pub run_id: i64,
    pub command: String,
    pub started_at: String,
    pub finished_at: Option<String>,
    pub groups: Vec<GroupStats>,
    /// Most common incomplete reasons: (detail, count).
    pub incomplete_reasons: Vec<(String, usize)>,
}

/// Stats of the latest run, if any run was recorded.
pub fn get_stats(conn: &Connection) -> Result<Option<Stats>> {
    let latest = conn
        .query_row(
            "SELECT id, command, started_at, finished_at FROM runs ORDER BY id DESC LIMIT 1",
            [],
            |r| Ok((r.get::<_, i64>(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
        )
        .optional()?;
    let Some((run_id, command, started_at, finished_at)) = latest else {
        return Ok(None);
    };

    let mut stmt = conn.prepare(
        "SELECT group_name, level,
                SUM(outcome = 'persisted'),
                SUM(outcome IN ('skipped_existing', 'claimed')),
                SUM(outcome = 'incomplete'),
                SUM(outcome = 'failed')
         FROM outcomes WHERE run_id = ?1
         GROUP BY group_name, level
         ORDER BY group_name, level DESC",
    )?;
    let groups = stmt
        .query_map(params![run_id], |r| {
            Ok(GroupStats {
                group: r.get(0)?,
                level: r.get(1)?,
                persisted: r.get(2)?,
                skipped: r.get(3)?,
                incomplete: r.get(4)?,
                failed: r.get(5)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut stmt = conn.prepare(
        "SELECT detail, COUNT(*) AS n FROM outcomes
         WHERE run_id = ?1 AND outcome = 'incomplete'
         GROUP BY detail ORDER BY n DESC, detail LIMIT 5",
    )?;
    let incomplete_reasons = stmt
        .query_map(params![run_id], |r| Ok((r.get(0)?, r.get(1)?)))?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    Ok(Some(Stats {
        run_id,
        command,
        started_at,
        finished_at,
        groups,
        incomplete_reasons,
    }))
}

/// Outcome sink backed by the ledger database.
pub struct Ledger {
    conn: Connection,
    run_id: i64,
}

impl Ledger {
    pub fn open(path: &Path, command: &str) -> Result<Self> {
        let conn = connect(path)?;
        Self::with_connection(conn, command)
    }

    pub fn with_connection(conn: Connection, command: &str) -> Result<Self> {
        init_schema(&conn)?;
        let run_id = start_run(&conn, command)?;
        Ok(Self { conn, run_id })
    }

    pub fn run_id(&self) -> i64 {
        self.run_id
    }

    pub fn finish(self, summary: &RunSummary) -> Result<()> {
        finish_run(&self.conn, self.run_id, summary)
    }
}

impl OutcomeSink for Ledger {
    fn record(&mut self, key: &RecordKey, outcome: &Outcome) {
        // The ledger is an audit trail; losing a row must not stop the harvest.
        if let Err(e) = record_outcome(&self.conn, self.run_id, key, outcome) {
            warn!(%key, error = %e, "Could not record outcome in ledger");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::harvest::{GroupTally, Tally};
    use crate::pipeline::{Field, Incomplete, Shortfall};

    fn ledger() -> Ledger {
        Ledger::with_connection(Connection::open_in_memory().unwrap(), "run").unwrap()
    }

    #[test]
    fn empty_ledger_has_no_stats() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        assert!(get_stats(&conn).unwrap().is_none());
    }

    #[test]
    fn outcomes_roll_up_per_group() {
        let mut ledger = ledger();
        let title_timeout = Outcome::Incomplete(Incomplete {
            field: Field::Title,
            reason: Shortfall::TimedOut,
        });
        ledger.record(&RecordKey::source("A01B", "Q1"), &Outcome::Persisted);
        ledger.record(&RecordKey::source("A01B", "Q2"), &title_timeout);
        ledger.record(&RecordKey::source("A01B", "Q3"), &title_timeout);
        ledger.record(&RecordKey::related("A01B", "Q1", "D1"), &Outcome::SkippedExisting);
        ledger.record(&RecordKey::related("A01B", "Q1", "D2"), &Outcome::Failed("record A01B/Q1_D2 already exists".into()));

        let stats = get_stats(&ledger.conn).unwrap().unwrap();
        assert_eq!(stats.run_id, ledger.run_id());
        assert_eq!(stats.command, "run");
        assert!(stats.finished_at.is_none());
        assert_eq!(
            stats.groups,
            vec![
                GroupStats {
                    group: "A01B".into(),
                    level: "query".into(),
                    persisted: 1,
                    skipped: 0,
                    incomplete: 2,
                    failed: 0,
                },
                GroupStats {
                    group: "A01B".into(),
                    level: "document".into(),
                    persisted: 0,
                    skipped: 1,
                    incomplete: 0,
                    failed: 1,
                },
            ]
        );
        assert_eq!(
            stats.incomplete_reasons,
            vec![("incomplete at title (timed out)".to_string(), 2)]
        );
    }

    #[test]
    fn finish_stores_totals() {
        let ledger = ledger();
        let conn_run = ledger.run_id();
        let summary = RunSummary {
            groups: vec![GroupTally {
                group: "A01B".into(),
                queries: Tally {
                    persisted: 3,
                    skipped_existing: 2,
                    ..Default::default()
                },
                documents: Tally {
                    failed: 1,
                    ..Default::default()
                },
            }],
            limited: false,
        };
        let conn = ledger.conn;
        finish_run(&conn, conn_run, &summary).unwrap();

        let (attempted, succeeded, skipped): (i64, i64, i64) = conn
            .query_row(
                "SELECT attempted, succeeded, skipped FROM runs WHERE id = ?1",
                params![conn_run],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
            )
            .unwrap();
        assert_eq!((attempted, succeeded, skipped), (4, 3, 2));
    }
}
