//! Leased verification of consent challenges.
//!
//! Each opt-in receipt owns a random challenge hash. The worker leases due
//! verification jobs and probes for the proof artifact: a `.<hash>.txt`
//! file on the repo's default branch, or a public gist carrying
//! `<hash>.txt`. Found artifacts activate the receipt; artifacts that
//! disappear put an active receipt into revocation-pending, and a second
//! miss after the grace window revokes it.
//!
//! Probes persist per-request ETags (branch, file, gists) so the usual
//! answer is a cheap 304, and rate-limit answers reschedule the job at the
//! advertised reset.

use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use sqlx::Row;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cancel::Scope;
use crate::error::{GithubError, StoreError};
use crate::github::{Conditional, Fetched, GithubClient};
use crate::storage::Database;

use super::ConsentStore;

/// Gists listing page size.
const GISTS_PER_PAGE: u32 = 100;

/// Upper bound on gists pages walked per probe.
const GISTS_MAX_PAGES: u32 = 10;

/// Probe retry backoff base.
const PROBE_BACKOFF_BASE: Duration = Duration::from_secs(300);

/// Probe retry backoff ceiling.
const PROBE_BACKOFF_CAP: Duration = Duration::from_secs(6 * 3600);

/// Settings for the verification loop.
#[derive(Debug, Clone)]
pub struct VerifyConfig {
    /// Rows leased per poll.
    pub lease_batch: i64,
    /// How far each lease pushes `next_attempt_at` forward.
    pub lease_for: Duration,
    /// Re-check cadence for verified receipts.
    pub recheck_after: Duration,
    /// Grace window between artifact disappearance and revocation.
    pub grace: Duration,
}

impl Default for VerifyConfig {
    fn default() -> Self {
        Self {
            lease_batch: 10,
            lease_for: Duration::from_secs(120),
            recheck_after: Duration::from_secs(7 * 86400),
            grace: Duration::from_secs(48 * 3600),
        }
    }
}

/// One leased verification job.
#[derive(Debug, Clone)]
pub struct VerifyJob {
    pub id: Uuid,
    pub receipt_id: Uuid,
    pub subject_type: String,
    pub subject_key: String,
    pub challenge_hash: String,
    pub attempts: i32,
    pub last_status: Option<i32>,
    pub etag_branch: Option<String>,
    pub etag_file: Option<String>,
    pub etag_gists: Option<String>,
    pub receipt_state: String,
}

/// What one probe established.
#[derive(Debug)]
enum ProbeOutcome {
    Found,
    Absent,
    RateLimited { reset_epoch: i64 },
    Failed(String),
}

/// Fresh validators gathered during a probe.
#[derive(Debug, Default)]
struct ProbeEtags {
    branch: Option<String>,
    file: Option<String>,
    gists: Option<String>,
    last_status: Option<i32>,
    last_url: Option<String>,
}

/// Worker that drives verification jobs to a terminal receipt state.
pub struct VerifyWorker {
    db: Database,
    store: ConsentStore,
    github: GithubClient,
    config: VerifyConfig,
    worker_id: String,
}

impl VerifyWorker {
    pub fn new(db: Database, github: GithubClient, config: VerifyConfig) -> Self {
        let store = ConsentStore::new(db.clone());
        Self {
            db,
            store,
            github,
            config,
            worker_id: format!("verify-{}", std::process::id()),
        }
    }

    /// Leases and processes one batch. Returns how many jobs were handled.
    pub async fn run_once(&self, scope: &Scope) -> Result<usize, StoreError> {
        let jobs = self.lease(self.config.lease_batch).await?;
        let handled = jobs.len();
        for job in jobs {
            if scope.is_cancelled() {
                break;
            }
            if let Err(err) = self.process(&job, scope).await {
                warn!(job = %job.id, error = %err, "verification job failed");
            }
        }
        Ok(handled)
    }

    /// Leases due jobs under skip-locked semantics; the lease itself is the
    /// pushed-forward `next_attempt_at`.
    async fn lease(&self, n: i64) -> Result<Vec<VerifyJob>, StoreError> {
        let rows = sqlx::query(
            r#"
            WITH due AS (
                SELECT id FROM consent_verifications
                WHERE next_attempt_at <= NOW()
                ORDER BY next_attempt_at ASC
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE consent_verifications v
            SET next_attempt_at = NOW() + make_interval(secs => $2),
                lease_expires = NOW() + make_interval(secs => $2),
                leased_by = $3
            FROM due
            WHERE v.id = due.id
            RETURNING v.id, v.receipt_id, v.subject_type, v.subject_key, v.challenge_hash,
                      v.attempts, v.last_status, v.etag_branch, v.etag_file, v.etag_gists,
                      (SELECT state FROM consent_receipts r WHERE r.id = v.receipt_id)
                          AS receipt_state
            "#,
        )
        .bind(n)
        .bind(self.config.lease_for.as_secs_f64())
        .bind(&self.worker_id)
        .fetch_all(self.db.pool())
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| VerifyJob {
                id: row.get("id"),
                receipt_id: row.get("receipt_id"),
                subject_type: row.get("subject_type"),
                subject_key: row.get("subject_key"),
                challenge_hash: row.get("challenge_hash"),
                attempts: row.get("attempts"),
                last_status: row.get("last_status"),
                etag_branch: row.get("etag_branch"),
                etag_file: row.get("etag_file"),
                etag_gists: row.get("etag_gists"),
                receipt_state: row
                    .get::<Option<String>, _>("receipt_state")
                    .unwrap_or_else(|| "revoked".to_string()),
            })
            .collect())
    }

    async fn process(&self, job: &VerifyJob, scope: &Scope) -> Result<(), StoreError> {
        if job.receipt_state == "revoked" {
            return self.delete_job(job.id).await;
        }

        let mut etags = ProbeEtags::default();
        let outcome = if job.subject_type == "repo_file" {
            self.probe_repo_file(job, &mut etags, scope).await
        } else {
            self.probe_gists(job, &mut etags, scope).await
        };

        match outcome {
            ProbeOutcome::Found => {
                etags.last_status = etags.last_status.or(Some(200));
                match job.receipt_state.as_str() {
                    "pending" => {
                        info!(receipt = %job.receipt_id, subject = %job.subject_key, "consent verified");
                        self.store.mark_verified(job.receipt_id).await?;
                    }
                    "revocation_pending" => {
                        info!(receipt = %job.receipt_id, "consent artifact restored within grace");
                        self.store.restore_active(job.receipt_id).await?;
                    }
                    _ => {}
                }
                self.reschedule(job.id, &etags, 0, self.config.recheck_after, None)
                    .await
            }
            ProbeOutcome::Absent => {
                etags.last_status = etags.last_status.or(Some(404));
                match job.receipt_state.as_str() {
                    "active" => {
                        warn!(receipt = %job.receipt_id, "consent artifact missing, grace window opened");
                        self.store.mark_revocation_pending(job.receipt_id).await?;
                        self.reschedule(job.id, &etags, job.attempts + 1, self.config.grace, None)
                            .await
                    }
                    "revocation_pending" => {
                        warn!(receipt = %job.receipt_id, "grace expired, consent revoked");
                        self.store.mark_revoked(job.receipt_id).await?;
                        self.delete_job(job.id).await
                    }
                    _ => {
                        // Still pending: keep probing on a growing backoff.
                        let delay = probe_backoff(job.attempts as u32 + 1);
                        self.reschedule(job.id, &etags, job.attempts + 1, delay, None)
                            .await
                    }
                }
            }
            ProbeOutcome::RateLimited { reset_epoch } => {
                let reset = Utc
                    .timestamp_opt(reset_epoch, 0)
                    .single()
                    .unwrap_or_else(|| Utc::now() + chrono::Duration::seconds(60));
                debug!(job = %job.id, %reset, "verification rate limited");
                let delay = (reset - Utc::now())
                    .to_std()
                    .unwrap_or(Duration::from_secs(60));
                self.reschedule(job.id, &etags, job.attempts, delay, Some(reset))
                    .await
            }
            ProbeOutcome::Failed(reason) => {
                debug!(job = %job.id, %reason, "verification probe failed");
                let delay = probe_backoff(job.attempts as u32 + 1);
                self.reschedule(job.id, &etags, job.attempts + 1, delay, None)
                    .await
            }
        }
    }

    /// Probes `.{hash}.txt` on the default branch. A 304 on the repo lookup
    /// means nothing was pushed since the last probe, so the previous answer
    /// still holds.
    async fn probe_repo_file(
        &self,
        job: &VerifyJob,
        etags: &mut ProbeEtags,
        scope: &Scope,
    ) -> ProbeOutcome {
        let Some((owner, repo)) = job.subject_key.split_once('/') else {
            return ProbeOutcome::Failed(format!("bad repo key '{}'", job.subject_key));
        };
        let cond = job.etag_branch.as_deref().map(Conditional::etag);

        let fetched = match self
            .github
            .repo_by_name(owner, repo, cond.as_ref(), scope)
            .await
        {
            Ok(fetched) => fetched,
            Err(err) => return probe_error(err),
        };

        let branch = match fetched {
            Fetched::NotModified => {
                return match job.last_status {
                    Some(200) => ProbeOutcome::Found,
                    _ => ProbeOutcome::Absent,
                };
            }
            Fetched::Modified { value, etag, .. } => {
                etags.branch = etag;
                value.default_branch.unwrap_or_else(|| "main".to_string())
            }
        };

        let path = format!(".{}.txt", job.challenge_hash);
        let cond = job.etag_file.as_deref().map(Conditional::etag);
        etags.last_url = Some(format!("{}/{}/contents/{}@{}", owner, repo, path, branch));
        match self
            .github
            .contents(owner, repo, &path, &branch, cond.as_ref(), scope)
            .await
        {
            Ok(Fetched::Modified { etag, .. }) => {
                etags.file = etag;
                etags.last_status = Some(200);
                ProbeOutcome::Found
            }
            // The file we already saw is unchanged.
            Ok(Fetched::NotModified) => {
                etags.last_status = Some(200);
                ProbeOutcome::Found
            }
            Err(GithubError::Gone { status, .. }) => {
                etags.last_status = Some(status as i32);
                ProbeOutcome::Absent
            }
            Err(err) => probe_error(err),
        }
    }

    /// Probes the subject's public gists for `{hash}.txt`.
    async fn probe_gists(
        &self,
        job: &VerifyJob,
        etags: &mut ProbeEtags,
        scope: &Scope,
    ) -> ProbeOutcome {
        let filename = format!("{}.txt", job.challenge_hash);
        let mut page = 1;
        loop {
            let cond = if page == 1 {
                job.etag_gists.as_deref().map(Conditional::etag)
            } else {
                None
            };
            let fetched = match self
                .github
                .gists(&job.subject_key, GISTS_PER_PAGE, page, cond.as_ref(), scope)
                .await
            {
                Ok(fetched) => fetched,
                Err(GithubError::Gone { status, .. }) => {
                    etags.last_status = Some(status as i32);
                    return ProbeOutcome::Absent;
                }
                Err(err) => return probe_error(err),
            };

            let gists = match fetched {
                Fetched::NotModified => {
                    return match job.last_status {
                        Some(200) => ProbeOutcome::Found,
                        _ => ProbeOutcome::Absent,
                    };
                }
                Fetched::Modified { value, etag, .. } => {
                    if page == 1 {
                        etags.gists = etag;
                    }
                    value
                }
            };

            if gists.iter().any(|g| g.has_file(&filename)) {
                etags.last_status = Some(200);
                return ProbeOutcome::Found;
            }
            if gists.len() < GISTS_PER_PAGE as usize || page >= GISTS_MAX_PAGES {
                etags.last_status = Some(404);
                return ProbeOutcome::Absent;
            }
            page += 1;
        }
    }

    async fn reschedule(
        &self,
        job_id: Uuid,
        etags: &ProbeEtags,
        attempts: i32,
        delay: Duration,
        rate_reset_at: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE consent_verifications SET
                attempts = $2,
                next_attempt_at = NOW() + make_interval(secs => $3),
                lease_expires = NULL,
                leased_by = NULL,
                last_status = COALESCE($4, last_status),
                last_url = COALESCE($5, last_url),
                etag_branch = COALESCE($6, etag_branch),
                etag_file = COALESCE($7, etag_file),
                etag_gists = COALESCE($8, etag_gists),
                rate_reset_at = $9
            WHERE id = $1
            "#,
        )
        .bind(job_id)
        .bind(attempts)
        .bind(delay.as_secs_f64())
        .bind(etags.last_status)
        .bind(&etags.last_url)
        .bind(&etags.branch)
        .bind(&etags.file)
        .bind(&etags.gists)
        .bind(rate_reset_at)
        .execute(self.db.pool())
        .await?;
        Ok(())
    }

    async fn delete_job(&self, job_id: Uuid) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM consent_verifications WHERE id = $1")
            .bind(job_id)
            .execute(self.db.pool())
            .await?;
        Ok(())
    }
}

fn probe_error(err: GithubError) -> ProbeOutcome {
    match err {
        GithubError::RateLimited { reset_epoch } => ProbeOutcome::RateLimited { reset_epoch },
        other => ProbeOutcome::Failed(other.to_string()),
    }
}

fn probe_backoff(attempt: u32) -> Duration {
    PROBE_BACKOFF_BASE
        .saturating_mul(1u32 << attempt.min(16))
        .min(PROBE_BACKOFF_CAP)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probe_backoff_grows_to_cap() {
        assert_eq!(probe_backoff(1), Duration::from_secs(600));
        assert_eq!(probe_backoff(2), Duration::from_secs(1200));
        assert_eq!(probe_backoff(12), PROBE_BACKOFF_CAP);
    }

    #[test]
    fn rate_limit_errors_map_to_reschedule() {
        let outcome = probe_error(GithubError::RateLimited { reset_epoch: 99 });
        assert!(matches!(
            outcome,
            ProbeOutcome::RateLimited { reset_epoch: 99 }
        ));
        assert!(matches!(
            probe_error(GithubError::Transient("boom".into())),
            ProbeOutcome::Failed(_)
        ));
    }

    #[test]
    fn default_config_is_sane() {
        let config = VerifyConfig::default();
        assert!(config.grace < config.recheck_after);
        assert!(config.lease_batch > 0);
    }
}
