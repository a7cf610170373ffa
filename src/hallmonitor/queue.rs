//! Leased refresh queues for repo and actor metadata.
//!
//! Queue rows live in Postgres and are leased with `FOR UPDATE SKIP LOCKED`,
//! so concurrent workers never fight over a row. Leasing pushes a row's
//! `next_attempt_at` forward by the lease duration; a worker that dies
//! simply lets the row fall due again at lease expiry. Ack deletes the row,
//! nack reschedules it with the caller's backoff.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::Row;

use crate::error::StoreError;
use crate::hid::Hid;
use crate::storage::{Database, SubjectKind};

/// One leased queue row.
#[derive(Debug, Clone)]
pub struct QueueJob {
    pub subject_hid: Hid,
    pub priority: i32,
    pub attempts: i32,
}

/// Capability to put a subject on a refresh queue, passed to ingestion.
#[async_trait]
pub trait Enqueuer: Send + Sync {
    async fn enqueue(&self, hid: &Hid, priority: i32) -> Result<(), StoreError>;
}

/// Postgres-backed queue over one subject kind.
#[derive(Clone)]
pub struct CatalogQueue {
    db: Database,
    kind: SubjectKind,
}

impl CatalogQueue {
    pub fn new(db: Database, kind: SubjectKind) -> Self {
        Self { db, kind }
    }

    pub fn kind(&self) -> SubjectKind {
        self.kind
    }

    /// Leases up to `n` due rows, highest priority first, oldest due first.
    /// The update doubles as the lease: the row will not come due again
    /// until `lease_for` from now.
    pub async fn lease(&self, n: i64, lease_for: Duration) -> Result<Vec<QueueJob>, StoreError> {
        let sql = format!(
            r#"
            WITH due AS (
                SELECT subject_hid FROM {table}
                WHERE next_attempt_at <= NOW()
                ORDER BY priority DESC, next_attempt_at ASC
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE {table} q
            SET next_attempt_at = NOW() + make_interval(secs => $2),
                lease_expires = NOW() + make_interval(secs => $2)
            FROM due
            WHERE q.subject_hid = due.subject_hid
            RETURNING q.subject_hid, q.priority, q.attempts
            "#,
            table = self.kind.queue_table()
        );

        let rows = sqlx::query(&sql)
            .bind(n)
            .bind(lease_for.as_secs_f64())
            .fetch_all(self.db.pool())
            .await?;

        Ok(rows
            .into_iter()
            .filter_map(|row| {
                let bytes: Vec<u8> = row.get("subject_hid");
                let subject_hid = Hid::try_from(bytes.as_slice()).ok()?;
                Some(QueueJob {
                    subject_hid,
                    priority: row.get("priority"),
                    attempts: row.get("attempts"),
                })
            })
            .collect())
    }

    /// Success: the row's work is done, drop it.
    pub async fn ack(&self, hid: &Hid) -> Result<(), StoreError> {
        let sql = format!(
            "DELETE FROM {} WHERE subject_hid = $1",
            self.kind.queue_table()
        );
        sqlx::query(&sql)
            .bind(hid.as_slice())
            .execute(self.db.pool())
            .await?;
        Ok(())
    }

    /// Failure: record the error and come back after `backoff`.
    pub async fn nack(&self, hid: &Hid, error: &str, backoff: Duration) -> Result<(), StoreError> {
        let sql = format!(
            r#"
            UPDATE {} SET
                attempts = attempts + 1,
                next_attempt_at = NOW() + make_interval(secs => $2),
                lease_expires = NULL,
                last_error = $3
            WHERE subject_hid = $1
            "#,
            self.kind.queue_table()
        );
        sqlx::query(&sql)
            .bind(hid.as_slice())
            .bind(backoff.as_secs_f64())
            .bind(error)
            .execute(self.db.pool())
            .await?;
        Ok(())
    }

    /// Rows currently waiting or leased.
    pub async fn len(&self) -> Result<i64, StoreError> {
        let sql = format!("SELECT COUNT(*) FROM {}", self.kind.queue_table());
        let count: i64 = sqlx::query_scalar(&sql).fetch_one(self.db.pool()).await?;
        Ok(count)
    }
}

#[async_trait]
impl Enqueuer for CatalogQueue {
    /// Inserts the subject if absent; an existing row keeps its schedule but
    /// adopts a raised priority.
    async fn enqueue(&self, hid: &Hid, priority: i32) -> Result<(), StoreError> {
        let sql = format!(
            r#"
            INSERT INTO {} (subject_hid, priority)
            VALUES ($1, $2)
            ON CONFLICT (subject_hid)
            DO UPDATE SET priority = GREATEST({}.priority, EXCLUDED.priority)
            "#,
            self.kind.queue_table(),
            self.kind.queue_table()
        );
        sqlx::query(&sql)
            .bind(hid.as_slice())
            .bind(priority)
            .execute(self.db.pool())
            .await?;
        Ok(())
    }
}

/// Nack backoff: `base * 2^attempts`, bounded at ten minutes, plus five
/// seconds when the failure was a rate limit.
pub fn nack_backoff(base: Duration, attempts: i32, rate_limited: bool) -> Duration {
    const CAP: Duration = Duration::from_secs(600);
    let shift = attempts.clamp(0, 16) as u32;
    let mut delay = base.saturating_mul(1u32 << shift).min(CAP);
    if rate_limited {
        delay += Duration::from_secs(5);
    }
    delay
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let base = Duration::from_secs(5);
        assert_eq!(nack_backoff(base, 0, false), Duration::from_secs(5));
        assert_eq!(nack_backoff(base, 1, false), Duration::from_secs(10));
        assert_eq!(nack_backoff(base, 3, false), Duration::from_secs(40));
        assert_eq!(nack_backoff(base, 12, false), Duration::from_secs(600));
    }

    #[test]
    fn rate_limit_adds_five_seconds() {
        let base = Duration::from_secs(5);
        assert_eq!(nack_backoff(base, 0, true), Duration::from_secs(10));
        assert_eq!(nack_backoff(base, 12, true), Duration::from_secs(605));
    }
}
