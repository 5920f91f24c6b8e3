//! Durable per-channel observation store (`gsmws.db`).
//!
//! Three tables, shared by every decoder worker and the controller through a
//! single connection behind one lock:
//!
//! - `AVAIL_ARFCN` — weighted RSSI per currently tracked channel, upserted by
//!   the controller each tick and expired after four neighbor cycles.
//! - `MAX_STRENGTHS` — strongest reading ever seen per channel.
//! - `AVG_STRENGTHS` — mean of the bounded recent window plus its size.
//!
//! The latter two exist so a decoder can warm-start after a crash: the recent
//! window is reconstructed as `count` copies of the stored mean. That loses
//! the sample distribution but preserves both the mean and the window size,
//! which is all the weighted average needs.

use crate::types::{Arfcn, AVAIL_EXPIRY_CYCLES};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::Path;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("observation store: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Handle to the gsmws database. All access must be serialized by the owner
/// (the controller wraps this in one `Mutex` shared with its decoders).
pub struct ObservationStore {
    conn: Connection,
}

impl ObservationStore {
    pub fn open<P: AsRef<Path>>(path: P) -> StoreResult<Self> {
        let store = Self {
            conn: Connection::open(path)?,
        };
        store.init_schema()?;
        Ok(store)
    }

    pub fn open_in_memory() -> StoreResult<Self> {
        let store = Self {
            conn: Connection::open_in_memory()?,
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> StoreResult<()> {
        self.conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS AVAIL_ARFCN (TIMESTAMP TEXT NOT NULL, ARFCN INTEGER, RSSI REAL);
             CREATE TABLE IF NOT EXISTS MAX_STRENGTHS (TIMESTAMP TEXT NOT NULL, ARFCN INTEGER, RSSI REAL);
             CREATE TABLE IF NOT EXISTS AVG_STRENGTHS (TIMESTAMP TEXT NOT NULL, ARFCN INTEGER, RSSI REAL, COUNT INTEGER);",
        )?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // AVAIL_ARFCN — controller side
    // -------------------------------------------------------------------------

    /// Fold a weighted-RSSI snapshot into the availability table, then expire
    /// rows not refreshed within `AVAIL_EXPIRY_CYCLES` neighbor cycles.
    pub fn upsert_availability(
        &self,
        rssis: &BTreeMap<Arfcn, f64>,
        now: DateTime<Utc>,
        neighbor_cycle_secs: u64,
    ) -> StoreResult<()> {
        let stamp = now.to_rfc3339();
        let existing = self.tracked_arfcns()?;

        for arfcn in &existing {
            if let Some(rssi) = rssis.get(arfcn) {
                self.conn.execute(
                    "UPDATE AVAIL_ARFCN SET TIMESTAMP=?1, RSSI=?2 WHERE ARFCN=?3",
                    params![stamp, rssi, arfcn.get()],
                )?;
            }
        }
        for (arfcn, rssi) in rssis {
            if !existing.contains(arfcn) {
                self.conn.execute(
                    "INSERT INTO AVAIL_ARFCN VALUES (?1, ?2, ?3)",
                    params![stamp, arfcn.get(), rssi],
                )?;
            }
        }

        let horizon = (AVAIL_EXPIRY_CYCLES * neighbor_cycle_secs) as i64;
        let mut stmt = self.conn.prepare("SELECT TIMESTAMP, ARFCN FROM AVAIL_ARFCN")?;
        let rows: Vec<(String, u16)> = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<Result<_, _>>()?;
        drop(stmt);

        for (ts, raw) in rows {
            let Ok(parsed) = DateTime::parse_from_rfc3339(&ts) else {
                continue;
            };
            if (now - parsed.with_timezone(&Utc)).num_seconds() > horizon {
                self.conn
                    .execute("DELETE FROM AVAIL_ARFCN WHERE ARFCN=?1", params![raw])?;
                debug!(arfcn = raw, timestamp = %ts, "expiring stale availability row");
            }
        }
        Ok(())
    }

    /// Channels whose weighted RSSI is strictly negative — no occupant heard.
    pub fn safe_arfcns(&self) -> StoreResult<Vec<Arfcn>> {
        let mut stmt = self
            .conn
            .prepare("SELECT ARFCN FROM AVAIL_ARFCN WHERE RSSI < 0")?;
        let rows = stmt.query_map([], |row| row.get::<_, u16>(0))?;
        let mut safe = Vec::new();
        for raw in rows {
            if let Some(arfcn) = Arfcn::new(raw?) {
                safe.push(arfcn);
            }
        }
        Ok(safe)
    }

    /// Every channel currently tracked in the availability table.
    pub fn tracked_arfcns(&self) -> StoreResult<Vec<Arfcn>> {
        let mut stmt = self.conn.prepare("SELECT ARFCN FROM AVAIL_ARFCN")?;
        let rows = stmt.query_map([], |row| row.get::<_, u16>(0))?;
        let mut tracked = Vec::new();
        for raw in rows {
            if let Some(arfcn) = Arfcn::new(raw?) {
                tracked.push(arfcn);
            }
        }
        Ok(tracked)
    }

    // -------------------------------------------------------------------------
    // MAX_STRENGTHS / AVG_STRENGTHS — decoder side
    // -------------------------------------------------------------------------

    pub fn insert_max(&self, now: DateTime<Utc>, arfcn: Arfcn, rssi: f64) -> StoreResult<()> {
        self.conn.execute(
            "INSERT INTO MAX_STRENGTHS VALUES (?1, ?2, ?3)",
            params![now.to_rfc3339(), arfcn.get(), rssi],
        )?;
        Ok(())
    }

    pub fn update_max(&self, now: DateTime<Utc>, arfcn: Arfcn, rssi: f64) -> StoreResult<()> {
        self.conn.execute(
            "UPDATE MAX_STRENGTHS SET TIMESTAMP=?1, RSSI=?2 WHERE ARFCN=?3",
            params![now.to_rfc3339(), rssi, arfcn.get()],
        )?;
        Ok(())
    }

    pub fn delete_max(&self, arfcn: Arfcn) -> StoreResult<()> {
        self.conn.execute(
            "DELETE FROM MAX_STRENGTHS WHERE ARFCN=?1",
            params![arfcn.get()],
        )?;
        Ok(())
    }

    /// Replace the persisted recent-window summary for one channel.
    pub fn replace_avg(
        &self,
        now: DateTime<Utc>,
        arfcn: Arfcn,
        mean: f64,
        count: usize,
    ) -> StoreResult<()> {
        self.conn.execute(
            "DELETE FROM AVG_STRENGTHS WHERE ARFCN=?1",
            params![arfcn.get()],
        )?;
        self.conn.execute(
            "INSERT INTO AVG_STRENGTHS VALUES (?1, ?2, ?3, ?4)",
            params![now.to_rfc3339(), arfcn.get(), mean, count as i64],
        )?;
        Ok(())
    }

    pub fn delete_avg(&self, arfcn: Arfcn) -> StoreResult<()> {
        self.conn.execute(
            "DELETE FROM AVG_STRENGTHS WHERE ARFCN=?1",
            params![arfcn.get()],
        )?;
        Ok(())
    }

    /// Reload the decoder's in-memory state after a restart.
    ///
    /// The recent window comes back as `count` copies of the stored mean,
    /// clamped to `width`. An acknowledged approximation: two crashes in a
    /// row flatten the window to a constant.
    #[allow(clippy::type_complexity)]
    pub fn warm_load(
        &self,
        width: usize,
    ) -> StoreResult<(HashMap<Arfcn, f64>, HashMap<Arfcn, VecDeque<f64>>)> {
        let mut max_strengths = HashMap::new();
        let mut stmt = self.conn.prepare("SELECT ARFCN, RSSI FROM MAX_STRENGTHS")?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, u16>(0)?, row.get::<_, f64>(1)?)))?;
        for row in rows {
            let (raw, rssi) = row?;
            if let Some(arfcn) = Arfcn::new(raw) {
                max_strengths.insert(arfcn, rssi);
            }
        }
        drop(stmt);

        let mut recent = HashMap::new();
        let mut stmt = self
            .conn
            .prepare("SELECT ARFCN, RSSI, COUNT FROM AVG_STRENGTHS")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, u16>(0)?,
                row.get::<_, f64>(1)?,
                row.get::<_, i64>(2)?,
            ))
        })?;
        for row in rows {
            let (raw, mean, count) = row?;
            let Some(arfcn) = Arfcn::new(raw) else {
                continue;
            };
            let count = (count.max(0) as usize).min(width);
            recent.insert(arfcn, std::iter::repeat(mean).take(count).collect());
        }

        Ok((max_strengths, recent))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_init_is_idempotent() {
        let store = ObservationStore::open_in_memory().unwrap();
        store.init_schema().unwrap();
        assert!(store.tracked_arfcns().unwrap().is_empty());
    }

    #[test]
    fn warm_load_on_empty_store() {
        let store = ObservationStore::open_in_memory().unwrap();
        let (max, recent) = store.warm_load(100).unwrap();
        assert!(max.is_empty());
        assert!(recent.is_empty());
    }

    #[test]
    fn warm_load_clamps_count_to_window() {
        let store = ObservationStore::open_in_memory().unwrap();
        let arfcn = Arfcn::new(45).unwrap();
        store.replace_avg(Utc::now(), arfcn, 10.0, 500).unwrap();
        let (_, recent) = store.warm_load(100).unwrap();
        assert_eq!(recent[&arfcn].len(), 100);
    }
}
