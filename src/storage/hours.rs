//! Hour-progress accounting in the relational control plane.
//!
//! Every hour of backfill gets a row: announced as `running` at start,
//! overwritten with a terminal `ok`/`error` plus counters and phase timings
//! at finish. Retrying an hour flips it back to `running` and clears the
//! previous terminal state.

use std::time::Instant;

use chrono::{DateTime, Utc};
use sqlx::Row;

use crate::error::StoreError;
use crate::hour::HourKey;

use super::database::Database;

/// Terminal or in-flight status of an hour row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HourStatus {
    Running,
    Ok,
    Error,
}

impl HourStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            HourStatus::Running => "running",
            HourStatus::Ok => "ok",
            HourStatus::Error => "error",
        }
    }
}

/// Counters and timings reported when an hour completes.
#[derive(Debug, Clone, Default)]
pub struct HourFinish {
    pub ok: bool,
    pub events_scanned: i64,
    pub events_malformed: i64,
    pub lines_oversize: i64,
    pub utterances: i64,
    pub utterances_deduped: i64,
    pub hits: i64,
    pub bytes_read: i64,
    pub fetch_ms: i64,
    pub read_ms: i64,
    pub db_ms: i64,
    pub detect_ms: i64,
    pub error_text: Option<String>,
}

/// One hour row read back from the control plane.
#[derive(Debug, Clone)]
pub struct HourRow {
    pub hour_utc: DateTime<Utc>,
    pub status: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub events_scanned: i64,
    pub utterances: i64,
    pub hits: i64,
    pub error_text: Option<String>,
}

/// Accessor for `ingest_hours`.
#[derive(Clone)]
pub struct HourStore {
    db: Database,
}

impl HourStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Upserts the hour as `running`, clearing any previous terminal state.
    pub async fn start_hour(&self, hour: HourKey) -> Result<(), StoreError> {
        let began = Instant::now();
        sqlx::query(
            r#"
            INSERT INTO ingest_hours (hour_utc, status, started_at)
            VALUES ($1, 'running', NOW())
            ON CONFLICT (hour_utc) DO UPDATE SET
                status = 'running',
                started_at = NOW(),
                finished_at = NULL,
                error_text = NULL
            "#,
        )
        .bind(hour.start())
        .execute(self.db.pool())
        .await?;
        self.db.observe_query("start_hour", began.elapsed());
        Ok(())
    }

    /// Records the terminal state of an hour.
    pub async fn finish_hour(&self, hour: HourKey, finish: &HourFinish) -> Result<(), StoreError> {
        let began = Instant::now();
        let status = if finish.ok {
            HourStatus::Ok
        } else {
            HourStatus::Error
        };
        sqlx::query(
            r#"
            UPDATE ingest_hours SET
                status = $2,
                finished_at = GREATEST(NOW(), started_at),
                events_scanned = $3,
                events_malformed = $4,
                lines_oversize = $5,
                utterances = $6,
                utterances_deduped = $7,
                hits = $8,
                bytes_read = $9,
                fetch_ms = $10,
                read_ms = $11,
                db_ms = $12,
                detect_ms = $13,
                error_text = $14
            WHERE hour_utc = $1
            "#,
        )
        .bind(hour.start())
        .bind(status.as_str())
        .bind(finish.events_scanned)
        .bind(finish.events_malformed)
        .bind(finish.lines_oversize)
        .bind(finish.utterances)
        .bind(finish.utterances_deduped)
        .bind(finish.hits)
        .bind(finish.bytes_read)
        .bind(finish.fetch_ms)
        .bind(finish.read_ms)
        .bind(finish.db_ms)
        .bind(finish.detect_ms)
        .bind(&finish.error_text)
        .execute(self.db.pool())
        .await?;
        self.db.observe_query("finish_hour", began.elapsed());
        Ok(())
    }

    /// Reads one hour row back, mostly for operators and tests.
    pub async fn get_hour(&self, hour: HourKey) -> Result<Option<HourRow>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT hour_utc, status, started_at, finished_at,
                   events_scanned, utterances, hits, error_text
            FROM ingest_hours WHERE hour_utc = $1
            "#,
        )
        .bind(hour.start())
        .fetch_optional(self.db.pool())
        .await?;

        Ok(row.map(|row| HourRow {
            hour_utc: row.get("hour_utc"),
            status: row.get("status"),
            started_at: row.get("started_at"),
            finished_at: row.get("finished_at"),
            events_scanned: row.get("events_scanned"),
            utterances: row.get("utterances"),
            hits: row.get("hits"),
            error_text: row.get("error_text"),
        }))
    }
}
