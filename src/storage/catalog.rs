//! Cached upstream metadata for repositories and actors, keyed by HID.
//!
//! Rows are created as stubs when ingestion first sees a subject, filled in
//! by the hallmonitor worker, and tombstoned when upstream reports the
//! subject permanently gone. Identifying columns are passed through
//! [`crate::consent`] gating before they reach this store: without a
//! `consent_id` they are bound as NULL, and the table CHECKs repeat the rule.

use std::time::Instant;

use chrono::{DateTime, Utc};
use sqlx::Row;
use uuid::Uuid;

use crate::error::StoreError;
use crate::hid::Hid;

use super::database::Database;

/// Upstream repository metadata mapped from the REST API.
#[derive(Debug, Clone, Default)]
pub struct RepoRecord {
    pub github_id: i64,
    pub full_name: Option<String>,
    pub description: Option<String>,
    pub homepage: Option<String>,
    pub api_url: Option<String>,
    pub default_branch: Option<String>,
    pub language: Option<String>,
    pub stars: Option<i32>,
    pub forks: Option<i32>,
    pub open_issues: Option<i32>,
    pub is_fork: Option<bool>,
    pub is_archived: Option<bool>,
    pub pushed_at: Option<DateTime<Utc>>,
    pub upstream_created_at: Option<DateTime<Utc>>,
    pub upstream_updated_at: Option<DateTime<Utc>>,
}

/// Upstream actor metadata mapped from the REST API.
#[derive(Debug, Clone, Default)]
pub struct ActorRecord {
    pub github_id: i64,
    pub login: Option<String>,
    pub name: Option<String>,
    pub company: Option<String>,
    pub blog: Option<String>,
    pub location: Option<String>,
    pub bio: Option<String>,
    pub api_url: Option<String>,
    pub followers: Option<i32>,
    pub following: Option<i32>,
    pub public_repos: Option<i32>,
    pub upstream_created_at: Option<DateTime<Utc>>,
    pub upstream_updated_at: Option<DateTime<Utc>>,
}

/// The slice of a catalog row the refresh worker needs.
#[derive(Debug, Clone)]
pub struct CatalogState {
    pub github_id: i64,
    pub etag: Option<String>,
    pub gone_code: Option<i32>,
    pub next_refresh_at: DateTime<Utc>,
    pub stars: Option<i32>,
    pub followers: Option<i32>,
    pub pushed_at: Option<DateTime<Utc>>,
}

/// Accessor for the `repositories` and `actors` tables.
#[derive(Clone)]
pub struct CatalogStore {
    db: Database,
}

impl CatalogStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Creates a repo stub if the subject is new. Called from ingestion.
    pub async fn ensure_repo_stub(&self, hid: &Hid, github_id: i64) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO repositories (repo_hid, github_id) VALUES ($1, $2)
             ON CONFLICT (repo_hid) DO NOTHING",
        )
        .bind(hid.as_slice())
        .bind(github_id)
        .execute(self.db.pool())
        .await?;
        Ok(())
    }

    /// Creates an actor stub if the subject is new.
    pub async fn ensure_actor_stub(&self, hid: &Hid, github_id: i64) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO actors (actor_hid, github_id) VALUES ($1, $2)
             ON CONFLICT (actor_hid) DO NOTHING",
        )
        .bind(hid.as_slice())
        .bind(github_id)
        .execute(self.db.pool())
        .await?;
        Ok(())
    }

    pub async fn repo_state(&self, hid: &Hid) -> Result<Option<CatalogState>, StoreError> {
        let row = sqlx::query(
            "SELECT github_id, etag, gone_code, next_refresh_at, stars, pushed_at
             FROM repositories WHERE repo_hid = $1",
        )
        .bind(hid.as_slice())
        .fetch_optional(self.db.pool())
        .await?;
        Ok(row.map(|row| CatalogState {
            github_id: row.get("github_id"),
            etag: row.get("etag"),
            gone_code: row.get("gone_code"),
            next_refresh_at: row.get("next_refresh_at"),
            stars: row.get("stars"),
            followers: None,
            pushed_at: row.get("pushed_at"),
        }))
    }

    pub async fn actor_state(&self, hid: &Hid) -> Result<Option<CatalogState>, StoreError> {
        let row = sqlx::query(
            "SELECT github_id, etag, gone_code, next_refresh_at, followers
             FROM actors WHERE actor_hid = $1",
        )
        .bind(hid.as_slice())
        .fetch_optional(self.db.pool())
        .await?;
        Ok(row.map(|row| CatalogState {
            github_id: row.get("github_id"),
            etag: row.get("etag"),
            gone_code: row.get("gone_code"),
            next_refresh_at: row.get("next_refresh_at"),
            stars: None,
            followers: row.get("followers"),
            pushed_at: None,
        }))
    }

    /// Full upsert after a 200 fetch. Identifying columns are written only
    /// when `consent_id` is present; otherwise NULL goes in their place.
    pub async fn upsert_repo(
        &self,
        hid: &Hid,
        record: &RepoRecord,
        etag: Option<&str>,
        next_refresh_at: DateTime<Utc>,
        consent_id: Option<Uuid>,
    ) -> Result<(), StoreError> {
        let began = Instant::now();
        let labeled = consent_id.is_some();
        sqlx::query(
            r#"
            INSERT INTO repositories (
                repo_hid, github_id, consent_id, full_name, description, homepage, api_url,
                default_branch, language, stars, forks, open_issues, is_fork, is_archived,
                pushed_at, upstream_created_at, upstream_updated_at,
                etag, fetched_at, next_refresh_at, gone_code, gone_reason
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16,
                      $17, $18, NOW(), $19, NULL, NULL)
            ON CONFLICT (repo_hid) DO UPDATE SET
                github_id = EXCLUDED.github_id,
                consent_id = EXCLUDED.consent_id,
                full_name = EXCLUDED.full_name,
                description = EXCLUDED.description,
                homepage = EXCLUDED.homepage,
                api_url = EXCLUDED.api_url,
                default_branch = EXCLUDED.default_branch,
                language = EXCLUDED.language,
                stars = EXCLUDED.stars,
                forks = EXCLUDED.forks,
                open_issues = EXCLUDED.open_issues,
                is_fork = EXCLUDED.is_fork,
                is_archived = EXCLUDED.is_archived,
                pushed_at = EXCLUDED.pushed_at,
                upstream_created_at = EXCLUDED.upstream_created_at,
                upstream_updated_at = EXCLUDED.upstream_updated_at,
                etag = EXCLUDED.etag,
                fetched_at = NOW(),
                next_refresh_at = EXCLUDED.next_refresh_at,
                gone_code = NULL,
                gone_reason = NULL
            "#,
        )
        .bind(hid.as_slice())
        .bind(record.github_id)
        .bind(consent_id)
        .bind(if labeled { record.full_name.as_deref() } else { None })
        .bind(if labeled { record.description.as_deref() } else { None })
        .bind(if labeled { record.homepage.as_deref() } else { None })
        .bind(if labeled { record.api_url.as_deref() } else { None })
        .bind(record.default_branch.as_deref())
        .bind(record.language.as_deref())
        .bind(record.stars)
        .bind(record.forks)
        .bind(record.open_issues)
        .bind(record.is_fork)
        .bind(record.is_archived)
        .bind(record.pushed_at)
        .bind(record.upstream_created_at)
        .bind(record.upstream_updated_at)
        .bind(etag)
        .bind(next_refresh_at)
        .execute(self.db.pool())
        .await?;
        self.db.observe_query("upsert_repo", began.elapsed());
        Ok(())
    }

    /// Full upsert of an actor after a 200 fetch, consent-gated like
    /// [`CatalogStore::upsert_repo`].
    pub async fn upsert_actor(
        &self,
        hid: &Hid,
        record: &ActorRecord,
        etag: Option<&str>,
        next_refresh_at: DateTime<Utc>,
        consent_id: Option<Uuid>,
    ) -> Result<(), StoreError> {
        let began = Instant::now();
        let labeled = consent_id.is_some();
        sqlx::query(
            r#"
            INSERT INTO actors (
                actor_hid, github_id, consent_id, login, name, company, blog, location, bio,
                api_url, followers, following, public_repos,
                upstream_created_at, upstream_updated_at,
                etag, fetched_at, next_refresh_at, gone_code, gone_reason
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15,
                      $16, NOW(), $17, NULL, NULL)
            ON CONFLICT (actor_hid) DO UPDATE SET
                github_id = EXCLUDED.github_id,
                consent_id = EXCLUDED.consent_id,
                login = EXCLUDED.login,
                name = EXCLUDED.name,
                company = EXCLUDED.company,
                blog = EXCLUDED.blog,
                location = EXCLUDED.location,
                bio = EXCLUDED.bio,
                api_url = EXCLUDED.api_url,
                followers = EXCLUDED.followers,
                following = EXCLUDED.following,
                public_repos = EXCLUDED.public_repos,
                upstream_created_at = EXCLUDED.upstream_created_at,
                upstream_updated_at = EXCLUDED.upstream_updated_at,
                etag = EXCLUDED.etag,
                fetched_at = NOW(),
                next_refresh_at = EXCLUDED.next_refresh_at,
                gone_code = NULL,
                gone_reason = NULL
            "#,
        )
        .bind(hid.as_slice())
        .bind(record.github_id)
        .bind(consent_id)
        .bind(if labeled { record.login.as_deref() } else { None })
        .bind(if labeled { record.name.as_deref() } else { None })
        .bind(if labeled { record.company.as_deref() } else { None })
        .bind(if labeled { record.blog.as_deref() } else { None })
        .bind(if labeled { record.location.as_deref() } else { None })
        .bind(if labeled { record.bio.as_deref() } else { None })
        .bind(if labeled { record.api_url.as_deref() } else { None })
        .bind(record.followers)
        .bind(record.following)
        .bind(record.public_repos)
        .bind(record.upstream_created_at)
        .bind(record.upstream_updated_at)
        .bind(etag)
        .bind(next_refresh_at)
        .execute(self.db.pool())
        .await?;
        self.db.observe_query("upsert_actor", began.elapsed());
        Ok(())
    }

    /// 304 path: the metadata is current, only bookkeeping moves.
    pub async fn touch(
        &self,
        kind: SubjectKind,
        hid: &Hid,
        next_refresh_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let sql = format!(
            "UPDATE {} SET fetched_at = NOW(), next_refresh_at = $2 WHERE {} = $1",
            kind.table(),
            kind.hid_column()
        );
        sqlx::query(&sql)
            .bind(hid.as_slice())
            .bind(next_refresh_at)
            .execute(self.db.pool())
            .await?;
        Ok(())
    }

    /// Permanent-gone path: record the status and push the next look far out.
    pub async fn tombstone(
        &self,
        kind: SubjectKind,
        hid: &Hid,
        gone_code: i32,
        gone_reason: &str,
        next_refresh_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let sql = format!(
            "UPDATE {} SET gone_code = $2, gone_reason = $3, fetched_at = NOW(),
             next_refresh_at = $4 WHERE {} = $1",
            kind.table(),
            kind.hid_column()
        );
        sqlx::query(&sql)
            .bind(hid.as_slice())
            .bind(gone_code)
            .bind(gone_reason)
            .bind(next_refresh_at)
            .execute(self.db.pool())
            .await?;
        Ok(())
    }
}

/// Which catalog a subject lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubjectKind {
    Repo,
    Actor,
}

impl SubjectKind {
    pub fn table(self) -> &'static str {
        match self {
            SubjectKind::Repo => "repositories",
            SubjectKind::Actor => "actors",
        }
    }

    pub fn hid_column(self) -> &'static str {
        match self {
            SubjectKind::Repo => "repo_hid",
            SubjectKind::Actor => "actor_hid",
        }
    }

    pub fn queue_table(self) -> &'static str {
        match self {
            SubjectKind::Repo => super::schema::tables::REPO_CATALOG_QUEUE,
            SubjectKind::Actor => super::schema::tables::ACTOR_CATALOG_QUEUE,
        }
    }
}
