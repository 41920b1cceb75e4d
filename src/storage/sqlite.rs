//! SQLite-backed QoE storage
//!
//! Raw tables (`samples`, `alternatives`, `backlog`) are written by OCR
//! ingestion; every other table is owned by the engine.
//!
//! - One connection behind a mutex, WAL journal
//! - Prepared statement caching
//! - Multi-row writes inside `BEGIN IMMEDIATE` transactions
//! - Timestamps stored as unix milliseconds

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use rusqlite::types::Value;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use tracing::{debug, info, warn};

use super::{AlternativeSource, LoadedSamples, ProcessedStore, SampleSource, WorkQueue};
use crate::models::{
    Accumulator, AlternativeIndex, AlternativeMeasurement, BacklogEntry, PeriodSummary, Sample, SampleKey,
};
use crate::qoe::{CarriedOverKeys, CommitPlan};

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA cache_size = -64000;  -- 64MB cache
PRAGMA temp_store = MEMORY;

-- Raw OCR readings, stored as read: latency and stream may be missing or garbage
CREATE TABLE IF NOT EXISTS samples (
    user_id TEXT NOT NULL,
    game_id TEXT NOT NULL,
    stream_id TEXT,
    timestamp_ms INTEGER NOT NULL,
    latency
);

CREATE INDEX IF NOT EXISTS idx_samples_pair_ts
    ON samples(user_id, game_id, timestamp_ms);

-- One JSON array of candidate latencies per timestamp, in engine order
CREATE TABLE IF NOT EXISTS alternatives (
    user_id TEXT NOT NULL,
    game_id TEXT NOT NULL,
    timestamp_ms INTEGER NOT NULL,
    candidates_json TEXT NOT NULL,
    PRIMARY KEY (user_id, game_id, timestamp_ms)
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS backlog (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id TEXT NOT NULL,
    game_id TEXT NOT NULL,
    since_ms INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS points (
    game_id TEXT NOT NULL,
    user_id TEXT NOT NULL,
    stream_id TEXT NOT NULL,
    timestamp_ms INTEGER NOT NULL,
    latency INTEGER NOT NULL,
    sequence_index INTEGER NOT NULL,
    original_latency INTEGER,
    was_spike INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (game_id, user_id, stream_id, timestamp_ms)
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_points_pair_ts
    ON points(game_id, user_id, timestamp_ms);

CREATE TABLE IF NOT EXISTS discarded_points (
    game_id TEXT NOT NULL,
    user_id TEXT NOT NULL,
    stream_id TEXT NOT NULL,
    timestamp_ms INTEGER NOT NULL,
    latency INTEGER NOT NULL,
    sequence_index INTEGER NOT NULL,
    original_latency INTEGER,
    was_spike INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (game_id, user_id, stream_id, timestamp_ms)
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS glitches (
    game_id TEXT NOT NULL,
    user_id TEXT NOT NULL,
    stream_id TEXT NOT NULL,
    timestamp_ms INTEGER NOT NULL,
    latency INTEGER NOT NULL,
    sequence_index INTEGER NOT NULL,
    original_latency INTEGER,
    was_spike INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (game_id, user_id, stream_id, timestamp_ms)
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_glitches_pair_ts
    ON glitches(game_id, user_id, timestamp_ms);

CREATE TABLE IF NOT EXISTS spikes (
    game_id TEXT NOT NULL,
    user_id TEXT NOT NULL,
    stream_id TEXT NOT NULL,
    timestamp_ms INTEGER NOT NULL,
    latency INTEGER NOT NULL,
    sequence_index INTEGER NOT NULL,
    original_latency INTEGER,
    was_spike INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (game_id, user_id, stream_id, timestamp_ms)
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_spikes_pair_ts
    ON spikes(game_id, user_id, timestamp_ms);

CREATE TABLE IF NOT EXISTS discarded_spikes (
    game_id TEXT NOT NULL,
    user_id TEXT NOT NULL,
    stream_id TEXT NOT NULL,
    timestamp_ms INTEGER NOT NULL,
    latency INTEGER NOT NULL,
    sequence_index INTEGER NOT NULL,
    original_latency INTEGER,
    was_spike INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (game_id, user_id, stream_id, timestamp_ms)
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS periods (
    game_id TEXT NOT NULL,
    user_id TEXT NOT NULL,
    seq_idx INTEGER NOT NULL,
    min_latency INTEGER NOT NULL,
    max_latency INTEGER NOT NULL,
    start_ms INTEGER NOT NULL,
    end_ms INTEGER NOT NULL,
    stable INTEGER NOT NULL,
    is_spike INTEGER NOT NULL,
    length INTEGER NOT NULL,
    PRIMARY KEY (game_id, user_id, seq_idx)
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_periods_pair_start
    ON periods(game_id, user_id, start_ms);

CREATE TABLE IF NOT EXISTS accumulators (
    game_id TEXT NOT NULL,
    user_id TEXT NOT NULL,
    total_points INTEGER NOT NULL,
    per_digit_json TEXT NOT NULL,
    stable_min INTEGER,
    stable_max INTEGER,
    PRIMARY KEY (game_id, user_id)
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS active_days (
    game_id TEXT NOT NULL,
    user_id TEXT NOT NULL,
    day INTEGER NOT NULL,
    PRIMARY KEY (game_id, user_id, day)
) WITHOUT ROWID;
"#;

const PROCESSED_TABLES: [&str; 8] = [
    "points",
    "discarded_points",
    "glitches",
    "spikes",
    "discarded_spikes",
    "periods",
    "accumulators",
    "active_days",
];

/// Tables holding per-sample rows
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleTable {
    Points,
    DiscardedPoints,
    Glitches,
    Spikes,
    DiscardedSpikes,
}

impl SampleTable {
    fn name(self) -> &'static str {
        match self {
            Self::Points => "points",
            Self::DiscardedPoints => "discarded_points",
            Self::Glitches => "glitches",
            Self::Spikes => "spikes",
            Self::DiscardedSpikes => "discarded_spikes",
        }
    }

    fn holds_spikes(self) -> bool {
        matches!(self, Self::Spikes | Self::DiscardedSpikes)
    }
}

#[inline]
fn to_ms(t: DateTime<Utc>) -> i64 {
    t.timestamp_millis()
}

#[inline]
fn from_ms(ms: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms).single()
}

fn ms_column(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let ms: i64 = row.get(idx)?;
    from_ms(ms).ok_or(rusqlite::Error::IntegralValueOutOfRange(idx, ms))
}

/// Parse an OCR latency value. Only non-negative integers below `u32::MAX` are readings.
fn parse_latency(value: &Value) -> Option<u32> {
    let raw = match value {
        Value::Integer(i) => *i,
        Value::Real(f) if f.fract() == 0.0 => *f as i64,
        Value::Text(s) => s.trim().parse::<i64>().ok()?,
        _ => return None,
    };
    u32::try_from(raw).ok()
}

/// Run `f` inside an immediate transaction, rolling back on error.
fn in_transaction<T>(conn: &Connection, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
    conn.execute_batch("BEGIN IMMEDIATE")?;
    match f(conn) {
        Ok(value) => {
            conn.execute_batch("COMMIT")?;
            Ok(value)
        }
        Err(e) => {
            if let Err(rollback) = conn.execute_batch("ROLLBACK") {
                warn!("Rollback failed: {}", rollback);
            }
            Err(e)
        }
    }
}

fn upsert_sample(conn: &Connection, table: SampleTable, sample: &Sample) -> Result<()> {
    let sql = format!(
        "INSERT OR REPLACE INTO {}
         (game_id, user_id, stream_id, timestamp_ms, latency, sequence_index, original_latency, was_spike)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        table.name()
    );
    let mut stmt = conn.prepare_cached(&sql)?;
    stmt.execute(params![
        &sample.game_id,
        &sample.user_id,
        &sample.stream_id,
        to_ms(sample.timestamp),
        sample.latency as i64,
        sample.sequence_index as i64,
        sample.original_latency.map(|l| l as i64),
        sample.was_spike,
    ])?;
    Ok(())
}

fn delete_sample(conn: &Connection, table: SampleTable, game_id: &str, user_id: &str, key: &SampleKey) -> Result<usize> {
    let sql = format!(
        "DELETE FROM {} WHERE game_id = ?1 AND user_id = ?2 AND stream_id = ?3 AND timestamp_ms = ?4",
        table.name()
    );
    let mut stmt = conn.prepare_cached(&sql)?;
    Ok(stmt.execute(params![game_id, user_id, &key.stream_id, to_ms(key.timestamp)])?)
}

/// Upsert glitches and evict the points stored under the same keys.
/// Returns the number of evicted points.
fn write_glitches(conn: &Connection, glitches: &[Sample]) -> Result<usize> {
    let mut evicted = 0usize;
    for glitch in glitches {
        upsert_sample(conn, SampleTable::Glitches, glitch)?;
        evicted += delete_sample(conn, SampleTable::Points, &glitch.game_id, &glitch.user_id, &glitch.key())?;
    }
    Ok(evicted)
}

fn row_to_period(row: &rusqlite::Row) -> rusqlite::Result<PeriodSummary> {
    Ok(PeriodSummary {
        game_id: row.get(0)?,
        user_id: row.get(1)?,
        seq_idx: row.get::<_, i64>(2)? as u32,
        min: row.get::<_, i64>(3)? as u32,
        max: row.get::<_, i64>(4)? as u32,
        start: ms_column(row, 5)?,
        end: ms_column(row, 6)?,
        stable: row.get(7)?,
        is_spike: row.get(8)?,
        length: row.get::<_, i64>(9)? as usize,
    })
}

const PERIOD_COLUMNS: &str =
    "game_id, user_id, seq_idx, min_latency, max_latency, start_ms, end_ms, stable, is_spike, length";

/// QoE storage on one SQLite database
pub struct SqliteQoeStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteQoeStore {
    /// Open (or create) the database at `db_path` and make sure every table
    /// and index exists.
    pub fn new(db_path: &str) -> Result<Self> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX; // guarded by our own mutex

        let conn = Connection::open_with_flags(db_path, flags)
            .with_context(|| format!("Failed to open database at {}", db_path))?;

        conn.execute_batch(SCHEMA_SQL)
            .context("Failed to initialize database schema")?;

        let journal_mode: String = conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap_or_default();
        if db_path != ":memory:" && journal_mode.to_lowercase() != "wal" {
            warn!("WAL mode not active, journal_mode = {}", journal_mode);
        }

        let samples: i64 = conn
            .query_row("SELECT COUNT(*) FROM samples", [], |row| row.get(0))
            .unwrap_or(0);
        info!("📊 QoE database ready at {} ({} raw samples)", db_path, samples);

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    // ------------------------------------------------------------------
    // Ingestion side
    // ------------------------------------------------------------------

    /// Insert one raw OCR row as read, without validation.
    pub fn insert_raw_sample(
        &self,
        user_id: &str,
        game_id: &str,
        stream_id: Option<&str>,
        timestamp: DateTime<Utc>,
        latency: Option<&str>,
    ) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO samples (user_id, game_id, stream_id, timestamp_ms, latency)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![user_id, game_id, stream_id, to_ms(timestamp), latency],
        )?;
        Ok(())
    }

    pub fn insert_samples(&self, samples: &[Sample]) -> Result<usize> {
        if samples.is_empty() {
            return Ok(0);
        }
        let conn = self.conn.lock();
        in_transaction(&conn, |conn| {
            let mut stmt = conn.prepare_cached(
                "INSERT INTO samples (user_id, game_id, stream_id, timestamp_ms, latency)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for s in samples {
                stmt.execute(params![
                    &s.user_id,
                    &s.game_id,
                    &s.stream_id,
                    to_ms(s.timestamp),
                    s.latency.to_string(),
                ])?;
            }
            Ok(samples.len())
        })
    }

    pub fn insert_alternative(&self, user_id: &str, game_id: &str, alternative: &AlternativeMeasurement) -> Result<()> {
        let candidates = serde_json::to_string(&alternative.candidates)?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO alternatives (user_id, game_id, timestamp_ms, candidates_json)
             VALUES (?1, ?2, ?3, ?4)",
            params![user_id, game_id, to_ms(alternative.timestamp), candidates],
        )?;
        Ok(())
    }

    pub fn push_backlog(&self, entry: &BacklogEntry) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO backlog (user_id, game_id, since_ms) VALUES (?1, ?2, ?3)",
            params![&entry.user_id, &entry.game_id, to_ms(entry.since)],
        )?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Read-back of processed state
    // ------------------------------------------------------------------

    /// Rows of `table` for one pair, oldest first.
    pub fn stored_samples(&self, table: SampleTable, user_id: &str, game_id: &str) -> Result<Vec<Sample>> {
        let conn = self.conn.lock();
        let sql = format!(
            "SELECT stream_id, timestamp_ms, latency, sequence_index, original_latency, was_spike
             FROM {}
             WHERE game_id = ?1 AND user_id = ?2
             ORDER BY timestamp_ms, stream_id",
            table.name()
        );
        let mut stmt = conn.prepare_cached(&sql)?;
        let rows = stmt
            .query_map(params![game_id, user_id], |row| {
                let stream_id: String = row.get(0)?;
                let timestamp = ms_column(row, 1)?;
                let latency = row.get::<_, i64>(2)? as u32;
                let mut sample = Sample::new(user_id, game_id, stream_id, timestamp, latency)
                    .with_sequence_index(row.get::<_, i64>(3)? as u64);
                sample.original_latency = row.get::<_, Option<i64>>(4)?.map(|l| l as u32);
                sample.was_spike = row.get(5)?;
                sample.is_spike = table.holds_spikes();
                Ok(sample)
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Persisted periods of a pair by seq_idx.
    pub fn periods(&self, user_id: &str, game_id: &str) -> Result<Vec<PeriodSummary>> {
        let conn = self.conn.lock();
        let sql = format!(
            "SELECT {} FROM periods WHERE game_id = ?1 AND user_id = ?2 ORDER BY seq_idx",
            PERIOD_COLUMNS
        );
        let mut stmt = conn.prepare_cached(&sql)?;
        let periods = stmt
            .query_map(params![game_id, user_id], row_to_period)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(periods)
    }

    pub fn active_days(&self, user_id: &str, game_id: &str) -> Result<Vec<i64>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT day FROM active_days WHERE game_id = ?1 AND user_id = ?2 ORDER BY day",
        )?;
        let days = stmt
            .query_map(params![game_id, user_id], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<i64>>>()?;
        Ok(days)
    }

    pub fn backlog_len(&self) -> Result<usize> {
        let conn = self.conn.lock();
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM backlog", [], |row| row.get(0))?;
        Ok(n as usize)
    }

    /// Run `PRAGMA optimize` and checkpoint the WAL.
    pub fn optimize(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute_batch(
            "PRAGMA optimize;
             PRAGMA wal_checkpoint(TRUNCATE);",
        )?;
        info!("🔧 Database optimized");
        Ok(())
    }
}

impl SampleSource for SqliteQoeStore {
    fn pairs(&self) -> Result<Vec<(String, String)>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT DISTINCT user_id, game_id FROM samples ORDER BY user_id, game_id",
        )?;
        let pairs = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(pairs)
    }

    fn samples_since(&self, user_id: &str, game_id: &str, since: DateTime<Utc>) -> Result<LoadedSamples> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT stream_id, timestamp_ms, latency
             FROM samples
             WHERE user_id = ?1 AND game_id = ?2 AND timestamp_ms >= ?3",
        )?;

        let rows = stmt
            .query_map(params![user_id, game_id, to_ms(since)], |row| {
                Ok((
                    row.get::<_, Option<String>>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, Value>(2)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut loaded = LoadedSamples::default();
        for (stream_id, timestamp_ms, latency) in rows {
            let stream_id = stream_id.filter(|s| !s.trim().is_empty());
            let parsed = match (stream_id, from_ms(timestamp_ms), parse_latency(&latency)) {
                (Some(stream), Some(timestamp), Some(latency)) => {
                    Some(Sample::new(user_id, game_id, stream, timestamp, latency))
                }
                _ => None,
            };

            match parsed {
                Some(sample) => loaded.samples.push(sample),
                None => {
                    warn!(
                        user = %user_id,
                        game = %game_id,
                        timestamp_ms,
                        latency = ?latency,
                        "skipping malformed sample"
                    );
                    loaded.malformed += 1;
                }
            }
        }

        Ok(loaded)
    }
}

impl AlternativeSource for SqliteQoeStore {
    fn alternatives(&self, user_id: &str, game_id: &str, since: DateTime<Utc>) -> Result<AlternativeIndex> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT timestamp_ms, candidates_json
             FROM alternatives
             WHERE user_id = ?1 AND game_id = ?2 AND timestamp_ms >= ?3",
        )?;

        let rows = stmt
            .query_map(params![user_id, game_id, to_ms(since)], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut measurements = Vec::with_capacity(rows.len());
        for (timestamp_ms, json) in rows {
            let parsed = from_ms(timestamp_ms)
                .zip(serde_json::from_str::<Vec<u32>>(&json).ok());
            match parsed {
                Some((timestamp, candidates)) => {
                    measurements.push(AlternativeMeasurement { timestamp, candidates })
                }
                None => warn!(
                    user = %user_id,
                    game = %game_id,
                    timestamp_ms,
                    "skipping malformed alternative measurement"
                ),
            }
        }

        Ok(AlternativeIndex::new(measurements))
    }
}

impl ProcessedStore for SqliteQoeStore {
    fn accumulator(&self, user_id: &str, game_id: &str) -> Result<Accumulator> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT total_points, per_digit_json, stable_min, stable_max
                 FROM accumulators WHERE game_id = ?1 AND user_id = ?2",
                params![game_id, user_id],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Option<i64>>(2)?,
                        row.get::<_, Option<i64>>(3)?,
                    ))
                },
            )
            .optional()?;

        let Some((total, per_digit_json, stable_min, stable_max)) = row else {
            return Ok(Accumulator::default());
        };

        let per_digit_length: BTreeMap<u32, u64> = serde_json::from_str(&per_digit_json)
            .with_context(|| format!("Corrupt accumulator for {}/{}", user_id, game_id))?;

        Ok(Accumulator {
            total_points: total as u64,
            per_digit_length,
            stable_bounds: stable_min.zip(stable_max).map(|(lo, hi)| (lo as u32, hi as u32)),
        })
    }

    fn last_period(&self, user_id: &str, game_id: &str, since: DateTime<Utc>) -> Result<Option<PeriodSummary>> {
        let conn = self.conn.lock();
        let sql = format!(
            "SELECT {} FROM periods
             WHERE game_id = ?1 AND user_id = ?2 AND start_ms <= ?3
             ORDER BY start_ms DESC
             LIMIT 1",
            PERIOD_COLUMNS
        );
        let period = conn
            .query_row(&sql, params![game_id, user_id, to_ms(since)], row_to_period)
            .optional()?;
        Ok(period)
    }

    fn old_periods(&self, user_id: &str, game_id: &str, since: DateTime<Utc>) -> Result<Vec<PeriodSummary>> {
        let conn = self.conn.lock();
        in_transaction(&conn, |conn| {
            let sql = format!(
                "SELECT {} FROM periods
                 WHERE game_id = ?1 AND user_id = ?2 AND start_ms <= ?3
                 ORDER BY start_ms, seq_idx",
                PERIOD_COLUMNS
            );
            let mut periods = conn
                .prepare_cached(&sql)?
                .query_map(params![game_id, user_id, to_ms(since)], row_to_period)?
                .collect::<rusqlite::Result<Vec<_>>>()?;

            // Park renumbered rows on negative indexes first so they never collide
            let mut renumbered = 0usize;
            for (idx, period) in periods.iter_mut().enumerate() {
                if period.seq_idx as usize != idx {
                    conn.execute(
                        "UPDATE periods SET seq_idx = ?4
                         WHERE game_id = ?1 AND user_id = ?2 AND seq_idx = ?3",
                        params![game_id, user_id, period.seq_idx as i64, -(idx as i64) - 1],
                    )?;
                    period.seq_idx = idx as u32;
                    renumbered += 1;
                }
            }
            if renumbered > 0 {
                conn.execute(
                    "UPDATE OR REPLACE periods SET seq_idx = -seq_idx - 1
                     WHERE game_id = ?1 AND user_id = ?2 AND seq_idx < 0",
                    params![game_id, user_id],
                )?;
                debug!(user = %user_id, game = %game_id, renumbered, "repaired period numbering");
            }

            periods.pop();
            Ok(periods)
        })
    }

    fn carried_over(&self, user_id: &str, game_id: &str, from: DateTime<Utc>) -> Result<(CarriedOverKeys, Option<u64>)> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT timestamp_ms, stream_id, sequence_index
             FROM points
             WHERE game_id = ?1 AND user_id = ?2 AND timestamp_ms >= ?3
             ORDER BY timestamp_ms, sequence_index",
        )?;
        let rows = stmt
            .query_map(params![game_id, user_id, to_ms(from)], |row| {
                Ok((ms_column(row, 0)?, row.get::<_, String>(1)?, row.get::<_, i64>(2)? as u64))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let init_idx = rows.first().map(|(_, _, idx)| *idx);
        Ok((rows.into_iter().collect(), init_idx))
    }

    fn spike_keys(&self, user_id: &str, game_id: &str, from: DateTime<Utc>) -> Result<HashSet<SampleKey>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT stream_id, timestamp_ms FROM spikes
             WHERE game_id = ?1 AND user_id = ?2 AND timestamp_ms >= ?3",
        )?;
        let keys = stmt
            .query_map(params![game_id, user_id, to_ms(from)], |row| {
                Ok(SampleKey {
                    stream_id: row.get(0)?,
                    timestamp: ms_column(row, 1)?,
                })
            })?
            .collect::<rusqlite::Result<HashSet<_>>>()?;
        Ok(keys)
    }

    fn store_glitches(&self, glitches: &[Sample]) -> Result<()> {
        if glitches.is_empty() {
            return Ok(());
        }
        let conn = self.conn.lock();
        in_transaction(&conn, |conn| {
            let evicted = write_glitches(conn, glitches)?;
            debug!("📦 Stored {} glitches ({} points evicted)", glitches.len(), evicted);
            Ok(())
        })
    }

    fn commit(
        &self,
        user_id: &str,
        game_id: &str,
        plan: &CommitPlan,
        spikes: &[Sample],
        stale_spikes: &HashSet<SampleKey>,
    ) -> Result<()> {
        let per_digit_json = serde_json::to_string(&plan.accumulator.per_digit_length)?;

        let conn = self.conn.lock();
        let evicted = in_transaction(&conn, |conn| {
            let evicted = write_glitches(conn, &plan.glitches)?;
            for point in &plan.points {
                upsert_sample(conn, SampleTable::Points, point)?;
            }

            if let Some(last) = plan.periods.iter().map(|p| p.seq_idx).max() {
                let mut stmt = conn.prepare_cached(
                    "INSERT OR REPLACE INTO periods
                     (game_id, user_id, seq_idx, min_latency, max_latency, start_ms, end_ms, stable, is_spike, length)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                )?;
                for p in &plan.periods {
                    stmt.execute(params![
                        game_id,
                        user_id,
                        p.seq_idx as i64,
                        p.min as i64,
                        p.max as i64,
                        to_ms(p.start),
                        to_ms(p.end),
                        p.stable,
                        p.is_spike,
                        p.length as i64,
                    ])?;
                }
                conn.execute(
                    "DELETE FROM periods WHERE game_id = ?1 AND user_id = ?2 AND seq_idx > ?3",
                    params![game_id, user_id, last as i64],
                )?;
            }

            let (stable_min, stable_max) = match plan.accumulator.stable_bounds {
                Some((lo, hi)) => (Some(lo as i64), Some(hi as i64)),
                None => (None, None),
            };
            conn.execute(
                "INSERT OR REPLACE INTO accumulators
                 (game_id, user_id, total_points, per_digit_json, stable_min, stable_max)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    game_id,
                    user_id,
                    plan.accumulator.total_points as i64,
                    &per_digit_json,
                    stable_min,
                    stable_max,
                ],
            )?;

            {
                let mut stmt = conn.prepare_cached(
                    "INSERT OR IGNORE INTO active_days (game_id, user_id, day) VALUES (?1, ?2, ?3)",
                )?;
                for day in &plan.active_days {
                    stmt.execute(params![game_id, user_id, day])?;
                }
            }

            for key in stale_spikes {
                delete_sample(conn, SampleTable::Spikes, game_id, user_id, key)?;
            }
            for spike in spikes {
                upsert_sample(conn, SampleTable::Spikes, spike)?;
            }

            Ok(evicted)
        })?;

        debug!(
            user = %user_id,
            game = %game_id,
            points = plan.points.len(),
            glitches = plan.glitches.len(),
            evicted,
            periods = plan.periods.len(),
            spikes = spikes.len(),
            stale_spikes = stale_spikes.len(),
            "📦 committed unit"
        );
        Ok(())
    }

    fn discard(&self, points: &[Sample], spikes: &[Sample]) -> Result<()> {
        let conn = self.conn.lock();
        in_transaction(&conn, |conn| {
            for point in points.iter().filter(|p| !p.is_carried_over) {
                upsert_sample(conn, SampleTable::DiscardedPoints, point)?;
            }
            for spike in spikes.iter().filter(|s| !s.is_carried_over) {
                upsert_sample(conn, SampleTable::DiscardedSpikes, spike)?;
            }
            Ok(())
        })
    }

    fn reset(&self) -> Result<()> {
        let conn = self.conn.lock();
        in_transaction(&conn, |conn| {
            for table in PROCESSED_TABLES {
                conn.execute(&format!("DELETE FROM {}", table), [])?;
            }
            Ok(())
        })?;
        info!("🧹 Processed QoE state wiped");
        Ok(())
    }
}

impl WorkQueue for SqliteQoeStore {
    fn drain(&self) -> Result<Vec<BacklogEntry>> {
        let conn = self.conn.lock();
        in_transaction(&conn, |conn| {
            let rows = conn
                .prepare_cached("SELECT user_id, game_id, since_ms FROM backlog ORDER BY id")?
                .query_map([], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?, row.get::<_, i64>(2)?))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            conn.execute("DELETE FROM backlog", [])?;

            let mut entries = Vec::with_capacity(rows.len());
            for (user_id, game_id, since_ms) in rows {
                match from_ms(since_ms) {
                    Some(since) => entries.push(BacklogEntry { user_id, game_id, since }),
                    None => warn!(user = %user_id, game = %game_id, since_ms, "dropping backlog entry with invalid timestamp"),
                }
            }
            Ok(entries)
        })
    }
}
