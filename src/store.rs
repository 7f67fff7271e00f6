//! Agreement history persisted in SQLite
//!
//! Every settled round is recorded; on startup the node restores its last
//! common random from here.

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::agreement::traits::AgreementListener;
use crate::agreement::types::{Settlement, SettlementKind};
use crate::error::Result;

/// One row of the `agreements` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AgreementRecord {
    pub round_id: String,
    pub initiator: String,
    pub phase: String,
    pub old_random: String,
    pub new_random: Option<String>,
    /// Common random held after the round settled.
    pub seed_after: String,
    pub outcome: String,
    /// False for agreements that must not be used as a seed (possible replays).
    pub usable: bool,
    pub decided_at: i64,
}

fn outcome_label(kind: &SettlementKind) -> String {
    match kind {
        SettlementKind::Agreed => "agreed".to_string(),
        SettlementKind::CommitmentRecorded => "commitment".to_string(),
        SettlementKind::RevealRecorded => "reveal".to_string(),
        SettlementKind::Failed(cause) => cause.to_string(),
    }
}

#[derive(Clone)]
pub struct AgreementStore {
    conn: Arc<Mutex<Connection>>,
}

impl AgreementStore {
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)?;
        Ok(AgreementStore {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Ok(AgreementStore {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Create the schema and its indexes.
    pub fn init(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "CREATE TABLE IF NOT EXISTS agreements (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                round_id    TEXT NOT NULL,
                initiator   TEXT NOT NULL,
                phase       TEXT NOT NULL,
                old_random  TEXT NOT NULL,
                new_random  TEXT,
                seed_after  TEXT NOT NULL,
                outcome     TEXT NOT NULL,
                usable      INTEGER NOT NULL,
                decided_at  INTEGER NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_agreements_round ON agreements(round_id)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_agreements_decided_at ON agreements(decided_at)",
            [],
        )?;
        Ok(())
    }

    pub fn record(&self, settlement: &Settlement, usable: bool) -> Result<()> {
        let round = &settlement.round;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO agreements
                (round_id, initiator, phase, old_random, new_random, seed_after, outcome, usable, decided_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                round.to_string(),
                round.initiator().as_str(),
                round.phase().to_string(),
                settlement.old_common_random,
                settlement.new_common_random,
                settlement.current_common_random,
                outcome_label(&settlement.kind),
                usable,
                chrono::Utc::now().timestamp_millis(),
            ],
        )?;
        debug!(round = %round, usable, "Store: settlement recorded");
        Ok(())
    }

    /// Common random held after the most recently recorded round.
    pub fn latest_common_random(&self) -> Result<Option<String>> {
        let conn = self.conn.lock();
        let seed = conn
            .query_row(
                "SELECT seed_after FROM agreements ORDER BY id DESC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()?;
        Ok(seed)
    }

    /// Most recent rows first.
    pub fn recent(&self, limit: u32) -> Result<Vec<AgreementRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT round_id, initiator, phase, old_random, new_random, seed_after, outcome, usable, decided_at
             FROM agreements ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map([limit], |row| {
            Ok(AgreementRecord {
                round_id: row.get(0)?,
                initiator: row.get(1)?,
                phase: row.get(2)?,
                old_random: row.get(3)?,
                new_random: row.get(4)?,
                seed_after: row.get(5)?,
                outcome: row.get(6)?,
                usable: row.get(7)?,
                decided_at: row.get(8)?,
            })
        })?;
        let records = rows.collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(records)
    }

    pub fn count(&self) -> Result<u64> {
        let conn = self.conn.lock();
        let count: u64 = conn.query_row("SELECT COUNT(*) FROM agreements", [], |row| row.get(0))?;
        Ok(count)
    }
}

/// Listener of the InfoService: keeps the agreement history.
///
/// An agreement built on the bootstrap common random could be a replay of
/// an earlier run, so it is recorded as not usable.
pub struct HistoryListener {
    store: AgreementStore,
    bootstrap: String,
}

impl HistoryListener {
    pub fn new(store: AgreementStore, bootstrap: impl Into<String>) -> Self {
        HistoryListener {
            store,
            bootstrap: bootstrap.into(),
        }
    }
}

impl AgreementListener for HistoryListener {
    fn notify_agreement(&self, old: &str, new: Option<&str>) {
        match new {
            Some(new) => info!(old = %old, new = %new, "InfoService: new common random"),
            None => info!(old = %old, "InfoService: round ended without a new common random"),
        }
    }

    fn round_settled(&self, settlement: &Settlement) {
        let usable = settlement.kind == SettlementKind::Agreed
            && settlement.round.predecessor() != self.bootstrap;
        if let Err(e) = self.store.record(settlement, usable) {
            warn!(round = %settlement.round, error = %e, "InfoService: failed to record settlement");
        }
    }
}
