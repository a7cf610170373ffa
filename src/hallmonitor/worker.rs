//! Worker pool refreshing repo and actor metadata.
//!
//! Workers lease jobs from both catalog queues and drive each through the
//! upstream client: 304 touches the row, 200 maps and upserts through the
//! consent gate, permanent-gone statuses tombstone, and rate limits or 5xx
//! answers nack with backoff. Shutdown is cooperative through the run
//! scope's cancel token.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::cancel::Scope;
use crate::config::HallmonitorConfig;
use crate::consent::{ConsentState, ConsentStore};
use crate::error::GithubError;
use crate::github::{ApiRepo, ApiUser, Conditional, Fetched, GithubClient};
use crate::hid::hid_hex;
use crate::storage::{ActorRecord, CatalogState, CatalogStore, RepoRecord, SubjectKind};

use super::cadence;
use super::queue::{nack_backoff, CatalogQueue, QueueJob};

/// How long a tombstoned subject waits before another look.
const TOMBSTONE_RECHECK: Duration = Duration::from_secs(90 * 86400);

/// Statistics about a pool run.
#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    pub jobs_completed: u64,
    pub jobs_failed: u64,
    pub tombstoned: u64,
    pub not_modified: u64,
    pub average_job_duration: Duration,
}

impl PoolStats {
    pub fn total_processed(&self) -> u64 {
        self.jobs_completed + self.jobs_failed
    }
}

/// Shared atomic counters the workers write into.
#[derive(Default)]
struct SharedStats {
    completed: AtomicU64,
    failed: AtomicU64,
    tombstoned: AtomicU64,
    not_modified: AtomicU64,
    total_duration_ms: AtomicU64,
}

impl SharedStats {
    fn record(&self, ok: bool, elapsed: Duration) {
        if ok {
            self.completed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }
        self.total_duration_ms
            .fetch_add(elapsed.as_millis() as u64, Ordering::Relaxed);
    }

    fn snapshot(&self) -> PoolStats {
        let completed = self.completed.load(Ordering::Relaxed);
        let failed = self.failed.load(Ordering::Relaxed);
        let total = completed + failed;
        let average = if total > 0 {
            Duration::from_millis(self.total_duration_ms.load(Ordering::Relaxed) / total)
        } else {
            Duration::ZERO
        };
        PoolStats {
            jobs_completed: completed,
            jobs_failed: failed,
            tombstoned: self.tombstoned.load(Ordering::Relaxed),
            not_modified: self.not_modified.load(Ordering::Relaxed),
            average_job_duration: average,
        }
    }
}

/// The metadata refresh pool.
pub struct HallmonitorPool {
    repos: CatalogQueue,
    actors: CatalogQueue,
    catalog: CatalogStore,
    consent: ConsentStore,
    github: GithubClient,
    config: HallmonitorConfig,
    stats: Arc<SharedStats>,
}

impl HallmonitorPool {
    pub fn new(
        repos: CatalogQueue,
        actors: CatalogQueue,
        catalog: CatalogStore,
        consent: ConsentStore,
        github: GithubClient,
        config: HallmonitorConfig,
    ) -> Self {
        Self {
            repos,
            actors,
            catalog,
            consent,
            github,
            config,
            stats: Arc::new(SharedStats::default()),
        }
    }

    /// Runs workers until the scope is cancelled. Returns final stats.
    pub async fn run(self: Arc<Self>, scope: Scope) -> PoolStats {
        info!(workers = self.config.num_workers, "hallmonitor pool starting");
        let mut handles = Vec::with_capacity(self.config.num_workers);
        for worker_id in 0..self.config.num_workers {
            let pool = Arc::clone(&self);
            let scope = scope.clone();
            handles.push(tokio::spawn(async move {
                pool.worker_loop(worker_id, scope).await;
            }));
        }
        for result in futures::future::join_all(handles).await {
            if let Err(err) = result {
                warn!(error = %err, "hallmonitor worker panicked");
            }
        }
        let stats = self.stats.snapshot();
        info!(
            completed = stats.jobs_completed,
            failed = stats.jobs_failed,
            tombstoned = stats.tombstoned,
            "hallmonitor pool stopped"
        );
        stats
    }

    async fn worker_loop(&self, worker_id: usize, scope: Scope) {
        debug!(worker_id, "hallmonitor worker started");
        while !scope.is_cancelled() {
            let handled = self.drain_queues(&scope).await;
            if handled == 0 && !scope.sleep(self.config.idle_sleep).await {
                break;
            }
        }
        debug!(worker_id, "hallmonitor worker stopped");
    }

    /// One lease round over both queues. Returns the number of jobs handled.
    async fn drain_queues(&self, scope: &Scope) -> usize {
        // Consent snapshot once per round; gate applies before processing.
        let consent = match self.consent.load_index().await {
            Ok(index) => index,
            Err(err) => {
                warn!(error = %err, "consent index load failed, deferring round");
                let _ = scope.sleep(self.config.idle_sleep).await;
                return 0;
            }
        };

        let mut handled = 0;
        for queue in [&self.repos, &self.actors] {
            let jobs = match queue.lease(self.config.lease_batch, self.config.lease_for).await {
                Ok(jobs) => jobs,
                Err(err) => {
                    warn!(queue = queue.kind().table(), error = %err, "queue lease failed");
                    continue;
                }
            };
            for job in jobs {
                if scope.is_cancelled() {
                    return handled;
                }
                handled += 1;
                let began = Instant::now();
                let job_scope = scope.with_budget(self.config.lease_for.mul_f32(0.8));
                let ok = self.process(queue, &job, &consent, &job_scope).await;
                self.stats.record(ok, began.elapsed());
            }
        }
        handled
    }

    /// Drives one leased job to ack or nack.
    async fn process(
        &self,
        queue: &CatalogQueue,
        job: &QueueJob,
        consent: &crate::consent::ConsentIndex,
        scope: &Scope,
    ) -> bool {
        let hid = &job.subject_hid;
        let kind = queue.kind();

        // Denied subjects are not tracked at all.
        if consent.effective(hid) == ConsentState::Deny {
            debug!(hid = %hid_hex(hid), "subject denied by consent, dropping job");
            return queue.ack(hid).await.is_ok();
        }

        let state = match self.load_state(kind, hid).await {
            Ok(Some(state)) => state,
            Ok(None) => {
                // No catalog stub means no numeric id to fetch with.
                warn!(hid = %hid_hex(hid), "queue row without catalog stub, dropping");
                return queue.ack(hid).await.is_ok();
            }
            Err(err) => {
                let backoff = nack_backoff(self.config.backoff_base, job.attempts, false);
                let _ = queue.nack(hid, &err.to_string(), backoff).await;
                return false;
            }
        };

        // Tombstoned and not yet due for a far-future recheck.
        if state.gone_code.is_some() && state.next_refresh_at > Utc::now() {
            return queue.ack(hid).await.is_ok();
        }
        // Legacy subjects with synthetic ids have nothing to fetch.
        if state.github_id <= 0 {
            return queue.ack(hid).await.is_ok();
        }

        let outcome = match kind {
            SubjectKind::Repo => self.refresh_repo(hid, &state, consent, scope).await,
            SubjectKind::Actor => self.refresh_actor(hid, &state, consent, scope).await,
        };

        match outcome {
            Ok(RefreshOutcome::Updated) => queue.ack(hid).await.is_ok(),
            Ok(RefreshOutcome::NotModified) => {
                self.stats.not_modified.fetch_add(1, Ordering::Relaxed);
                queue.ack(hid).await.is_ok()
            }
            Ok(RefreshOutcome::Tombstoned) => {
                self.stats.tombstoned.fetch_add(1, Ordering::Relaxed);
                queue.ack(hid).await.is_ok()
            }
            Err(err) => {
                let backoff = nack_backoff(self.config.backoff_base, job.attempts, err.rate_limited);
                debug!(hid = %hid_hex(hid), error = %err.message, backoff_secs = backoff.as_secs(), "job nacked");
                let _ = queue.nack(hid, &err.message, backoff).await;
                false
            }
        }
    }

    async fn load_state(
        &self,
        kind: SubjectKind,
        hid: &crate::hid::Hid,
    ) -> Result<Option<CatalogState>, crate::error::StoreError> {
        match kind {
            SubjectKind::Repo => self.catalog.repo_state(hid).await,
            SubjectKind::Actor => self.catalog.actor_state(hid).await,
        }
    }

    async fn refresh_repo(
        &self,
        hid: &crate::hid::Hid,
        state: &CatalogState,
        consent: &crate::consent::ConsentIndex,
        scope: &Scope,
    ) -> Result<RefreshOutcome, ProcessError> {
        let cond = state.etag.as_deref().map(Conditional::etag);
        match self
            .github
            .repo_by_id(state.github_id, cond.as_ref(), scope)
            .await
        {
            Ok(Fetched::NotModified) => {
                let next = cadence::next_repo_refresh(
                    Utc::now(),
                    state.stars,
                    state.pushed_at,
                    self.config.push_min,
                );
                self.catalog
                    .touch(SubjectKind::Repo, hid, next)
                    .await
                    .map_err(ProcessError::store)?;
                Ok(RefreshOutcome::NotModified)
            }
            Ok(Fetched::Modified { value, etag, .. }) => {
                let record = map_repo(&value);
                let next = cadence::next_repo_refresh(
                    Utc::now(),
                    record.stars,
                    record.pushed_at,
                    self.config.push_min,
                );
                self.catalog
                    .upsert_repo(hid, &record, etag.as_deref(), next, consent.consent_id(hid))
                    .await
                    .map_err(ProcessError::store)?;
                Ok(RefreshOutcome::Updated)
            }
            Err(GithubError::Gone { status, reason }) => {
                let next = Utc::now()
                    + chrono::Duration::from_std(TOMBSTONE_RECHECK)
                        .unwrap_or(chrono::Duration::days(90));
                self.catalog
                    .tombstone(SubjectKind::Repo, hid, status as i32, &reason, next)
                    .await
                    .map_err(ProcessError::store)?;
                info!(hid = %hid_hex(hid), status, "repository tombstoned");
                Ok(RefreshOutcome::Tombstoned)
            }
            Err(err) => Err(ProcessError::github(err)),
        }
    }

    async fn refresh_actor(
        &self,
        hid: &crate::hid::Hid,
        state: &CatalogState,
        consent: &crate::consent::ConsentIndex,
        scope: &Scope,
    ) -> Result<RefreshOutcome, ProcessError> {
        let cond = state.etag.as_deref().map(Conditional::etag);
        match self
            .github
            .user_by_id(state.github_id, cond.as_ref(), scope)
            .await
        {
            Ok(Fetched::NotModified) => {
                let next = cadence::next_actor_refresh(Utc::now(), state.followers);
                self.catalog
                    .touch(SubjectKind::Actor, hid, next)
                    .await
                    .map_err(ProcessError::store)?;
                Ok(RefreshOutcome::NotModified)
            }
            Ok(Fetched::Modified { value, etag, .. }) => {
                let record = map_actor(&value);
                let next = cadence::next_actor_refresh(Utc::now(), record.followers);
                self.catalog
                    .upsert_actor(hid, &record, etag.as_deref(), next, consent.consent_id(hid))
                    .await
                    .map_err(ProcessError::store)?;
                Ok(RefreshOutcome::Updated)
            }
            Err(GithubError::Gone { status, reason }) => {
                let next = Utc::now()
                    + chrono::Duration::from_std(TOMBSTONE_RECHECK)
                        .unwrap_or(chrono::Duration::days(90));
                self.catalog
                    .tombstone(SubjectKind::Actor, hid, status as i32, &reason, next)
                    .await
                    .map_err(ProcessError::store)?;
                info!(hid = %hid_hex(hid), status, "actor tombstoned");
                Ok(RefreshOutcome::Tombstoned)
            }
            Err(err) => Err(ProcessError::github(err)),
        }
    }
}

enum RefreshOutcome {
    Updated,
    NotModified,
    Tombstoned,
}

struct ProcessError {
    message: String,
    rate_limited: bool,
}

impl ProcessError {
    fn github(err: GithubError) -> Self {
        Self {
            rate_limited: matches!(err, GithubError::RateLimited { .. }),
            message: err.to_string(),
        }
    }

    fn store(err: crate::error::StoreError) -> Self {
        Self {
            message: err.to_string(),
            rate_limited: false,
        }
    }
}

/// Maps the upstream repo payload onto a catalog record.
pub fn map_repo(api: &ApiRepo) -> RepoRecord {
    RepoRecord {
        github_id: api.id,
        full_name: Some(api.full_name.clone()),
        description: api.description.clone().filter(|s| !s.is_empty()),
        homepage: api.homepage.clone().filter(|s| !s.is_empty()),
        api_url: api.url.clone(),
        default_branch: api.default_branch.clone(),
        language: api.language.clone(),
        stars: i32::try_from(api.stargazers_count).ok(),
        forks: i32::try_from(api.forks_count).ok(),
        open_issues: i32::try_from(api.open_issues_count).ok(),
        is_fork: Some(api.fork),
        is_archived: Some(api.archived),
        pushed_at: api.pushed_at,
        upstream_created_at: api.created_at,
        upstream_updated_at: api.updated_at,
    }
}

/// Maps the upstream user payload onto a catalog record.
pub fn map_actor(api: &ApiUser) -> ActorRecord {
    ActorRecord {
        github_id: api.id,
        login: Some(api.login.clone()),
        name: api.name.clone().filter(|s| !s.is_empty()),
        company: api.company.clone().filter(|s| !s.is_empty()),
        blog: api.blog.clone().filter(|s| !s.is_empty()),
        location: api.location.clone().filter(|s| !s.is_empty()),
        bio: api.bio.clone().filter(|s| !s.is_empty()),
        api_url: api.url.clone(),
        followers: i32::try_from(api.followers).ok(),
        following: i32::try_from(api.following).ok(),
        public_repos: i32::try_from(api.public_repos).ok(),
        upstream_created_at: api.created_at,
        upstream_updated_at: api.updated_at,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn repo_mapping_blanks_empty_strings() {
        let api: ApiRepo = serde_json::from_value(json!({
            "id": 42,
            "full_name": "octo/repo",
            "description": "",
            "stargazers_count": 1200,
            "fork": false
        }))
        .unwrap();
        let record = map_repo(&api);
        assert_eq!(record.github_id, 42);
        assert_eq!(record.full_name.as_deref(), Some("octo/repo"));
        assert!(record.description.is_none());
        assert_eq!(record.stars, Some(1200));
    }

    #[test]
    fn actor_mapping_carries_followers() {
        let api: ApiUser = serde_json::from_value(json!({
            "id": 7,
            "login": "octocat",
            "followers": 5000,
            "blog": ""
        }))
        .unwrap();
        let record = map_actor(&api);
        assert_eq!(record.followers, Some(5000));
        assert!(record.blog.is_none());
        assert_eq!(record.login.as_deref(), Some("octocat"));
    }

    #[test]
    fn stats_snapshot_averages() {
        let stats = SharedStats::default();
        stats.record(true, Duration::from_millis(100));
        stats.record(false, Duration::from_millis(300));
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.jobs_completed, 1);
        assert_eq!(snapshot.jobs_failed, 1);
        assert_eq!(snapshot.total_processed(), 2);
        assert_eq!(snapshot.average_job_duration, Duration::from_millis(200));
    }
}
