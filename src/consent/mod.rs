//! Consent state, receipts and the write-time gate.
//!
//! Every repo and actor has an effective consent state derived from its
//! latest receipt: an active opt-out denies fact writes outright, an active
//! verified opt-in allows identifying labels, an opt-in whose proof artifact
//! recently disappeared is pending revocation, and everything else is
//! `none`. Ingestion loads the whole state table into a [`ConsentIndex`]
//! once per hour; catalog upserts consult it per subject.

pub mod verify;

use std::collections::HashMap;
use std::time::Instant;

use sqlx::Row;
use uuid::Uuid;

use crate::error::StoreError;
use crate::hid::Hid;
use crate::storage::Database;

/// Effective consent state of one principal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConsentState {
    #[default]
    None,
    Allow,
    Deny,
    RevocationPending,
}

impl ConsentState {
    pub fn as_str(self) -> &'static str {
        match self {
            ConsentState::None => "none",
            ConsentState::Allow => "allow",
            ConsentState::Deny => "deny",
            ConsentState::RevocationPending => "revocation_pending",
        }
    }
}

/// Derives the effective state from the latest receipt's fields.
pub fn effective_state(action: &str, state: &str) -> ConsentState {
    match (action, state) {
        ("opt_out", "active") => ConsentState::Deny,
        ("opt_in", "active") => ConsentState::Allow,
        ("opt_in", "revocation_pending") => ConsentState::RevocationPending,
        _ => ConsentState::None,
    }
}

/// In-memory snapshot of every principal with a non-default state.
#[derive(Debug, Default, Clone)]
pub struct ConsentIndex {
    entries: HashMap<Hid, (ConsentState, Option<Uuid>)>,
}

impl ConsentIndex {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, hid: Hid, state: ConsentState, consent_id: Option<Uuid>) {
        self.entries.insert(hid, (state, consent_id));
    }

    pub fn effective(&self, hid: &Hid) -> ConsentState {
        self.entries
            .get(hid)
            .map(|(state, _)| *state)
            .unwrap_or_default()
    }

    /// The receipt id backing an active opt-in; `None` in every other state,
    /// which keeps identifying columns NULL downstream.
    pub fn consent_id(&self, hid: &Hid) -> Option<Uuid> {
        match self.entries.get(hid) {
            Some((ConsentState::Allow, id)) => *id,
            _ => None,
        }
    }

    /// Fact-write gate: a deny on either side of the pair skips the write.
    /// `allow` and `none` proceed; labels stay NULL without a consent id.
    pub fn allows_fact(&self, repo_hid: &Hid, actor_hid: &Hid) -> bool {
        self.effective(repo_hid) != ConsentState::Deny
            && self.effective(actor_hid) != ConsentState::Deny
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A freshly opened opt-in challenge.
#[derive(Debug, Clone)]
pub struct OptInChallenge {
    pub receipt_id: Uuid,
    /// Hex challenge; the subject proves control by publishing a file named
    /// after it (`.<hash>.txt` in the repo, `<hash>.txt` in a gist).
    pub challenge_hash: String,
}

/// Receipt and principal persistence.
#[derive(Clone)]
pub struct ConsentStore {
    db: Database,
}

impl ConsentStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Loads the effective state of every principal with receipts.
    pub async fn load_index(&self) -> Result<ConsentIndex, StoreError> {
        let began = Instant::now();
        let rows = sqlx::query(
            r#"
            SELECT DISTINCT ON (principal, principal_hid)
                   id, principal_hid, action, state
            FROM consent_receipts
            ORDER BY principal, principal_hid, issued_at DESC, id DESC
            "#,
        )
        .fetch_all(self.db.pool())
        .await?;

        let mut index = ConsentIndex::empty();
        for row in rows {
            let hid_bytes: Vec<u8> = row.get("principal_hid");
            let Ok(hid) = Hid::try_from(hid_bytes.as_slice()) else {
                continue;
            };
            let action: String = row.get("action");
            let state: String = row.get("state");
            let effective = effective_state(&action, &state);
            if effective == ConsentState::None {
                continue;
            }
            let consent_id = match effective {
                ConsentState::Allow => Some(row.get("id")),
                _ => None,
            };
            index.insert(hid, effective, consent_id);
        }
        self.db.observe_query("load_consent_index", began.elapsed());
        Ok(index)
    }

    /// Opens an opt-in: a pending receipt with a fresh random challenge plus
    /// the verification job that will probe for its proof artifact.
    pub async fn open_opt_in(
        &self,
        principal: &str,
        hid: &Hid,
        evidence_kind: &str,
        subject_key: &str,
    ) -> Result<OptInChallenge, StoreError> {
        if principal != "repo" && principal != "actor" {
            return Err(StoreError::Validation {
                field: "principal".to_string(),
                message: format!("unknown principal '{}'", principal),
            });
        }
        if evidence_kind != "repo_file" && evidence_kind != "gist_file" {
            return Err(StoreError::Validation {
                field: "evidence_kind".to_string(),
                message: format!("unknown evidence kind '{}'", evidence_kind),
            });
        }

        let challenge_hash = random_challenge();
        let mut tx = self.db.pool().begin().await?;

        let receipt_id: Uuid = sqlx::query_scalar(
            r#"
            INSERT INTO consent_receipts
                (principal, principal_hid, action, state, evidence_kind, challenge_hash)
            VALUES ($1, $2, 'opt_in', 'pending', $3, $4)
            RETURNING id
            "#,
        )
        .bind(principal)
        .bind(hid.as_slice())
        .bind(evidence_kind)
        .bind(&challenge_hash)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO consent_verifications
                (receipt_id, subject_type, subject_key, principal_hid, challenge_hash)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(receipt_id)
        .bind(evidence_kind)
        .bind(subject_key)
        .bind(hid.as_slice())
        .bind(&challenge_hash)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(OptInChallenge {
            receipt_id,
            challenge_hash,
        })
    }

    /// Records an opt-out; effective immediately, no verification involved.
    pub async fn record_opt_out(&self, principal: &str, hid: &Hid) -> Result<Uuid, StoreError> {
        let receipt_id: Uuid = sqlx::query_scalar(
            r#"
            INSERT INTO consent_receipts (principal, principal_hid, action, state)
            VALUES ($1, $2, 'opt_out', 'active')
            RETURNING id
            "#,
        )
        .bind(principal)
        .bind(hid.as_slice())
        .fetch_one(self.db.pool())
        .await?;
        Ok(receipt_id)
    }

    /// Flips a receipt to `active` after its artifact was found, and stamps
    /// the principal row with the consent.
    pub async fn mark_verified(&self, receipt_id: Uuid) -> Result<(), StoreError> {
        let mut tx = self.db.pool().begin().await?;

        let row = sqlx::query(
            r#"
            UPDATE consent_receipts
            SET state = 'active', verified_at = NOW()
            WHERE id = $1
            RETURNING principal, principal_hid
            "#,
        )
        .bind(receipt_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| StoreError::NotFound(format!("receipt {}", receipt_id)))?;

        let principal: String = row.get("principal");
        let hid: Vec<u8> = row.get("principal_hid");
        let (table, column) = principal_table(&principal);
        let sql = format!(
            "INSERT INTO {table} ({column}, consent_id) VALUES ($1, $2)
             ON CONFLICT ({column}) DO UPDATE SET consent_id = EXCLUDED.consent_id"
        );
        sqlx::query(&sql)
            .bind(&hid)
            .bind(receipt_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Marks an active opt-in as pending revocation; the artifact vanished
    /// but the grace window is still open.
    pub async fn mark_revocation_pending(&self, receipt_id: Uuid) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE consent_receipts SET state = 'revocation_pending'
             WHERE id = $1 AND state = 'active'",
        )
        .bind(receipt_id)
        .execute(self.db.pool())
        .await?;
        Ok(())
    }

    /// Restores an opt-in whose artifact reappeared within grace.
    pub async fn restore_active(&self, receipt_id: Uuid) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE consent_receipts SET state = 'active', verified_at = NOW()
             WHERE id = $1 AND state = 'revocation_pending'",
        )
        .bind(receipt_id)
        .execute(self.db.pool())
        .await?;
        Ok(())
    }

    /// Terminal revocation: detaches the consent from the principal row so
    /// labels fall back to NULL on the next catalog write.
    pub async fn mark_revoked(&self, receipt_id: Uuid) -> Result<(), StoreError> {
        let mut tx = self.db.pool().begin().await?;

        let row = sqlx::query(
            r#"
            UPDATE consent_receipts SET state = 'revoked'
            WHERE id = $1
            RETURNING principal, principal_hid
            "#,
        )
        .bind(receipt_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| StoreError::NotFound(format!("receipt {}", receipt_id)))?;

        let principal: String = row.get("principal");
        let hid: Vec<u8> = row.get("principal_hid");
        let (table, column) = principal_table(&principal);
        let sql = format!(
            "UPDATE {table} SET consent_id = NULL, label_explicit = NULL WHERE {column} = $1"
        );
        sqlx::query(&sql).bind(&hid).execute(&mut *tx).await?;

        tx.commit().await?;
        Ok(())
    }
}

fn principal_table(principal: &str) -> (&'static str, &'static str) {
    if principal == "repo" {
        ("principals_repos", "repo_hid")
    } else {
        ("principals_actors", "actor_hid")
    }
}

/// 32 random bytes, hex encoded.
fn random_challenge() -> String {
    use rand::RngCore;
    let mut bytes = [0u8; 32];
    rand::rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hid::{actor_hid_from_login, repo_hid_from_name};

    #[test]
    fn effective_state_mapping() {
        assert_eq!(effective_state("opt_out", "active"), ConsentState::Deny);
        assert_eq!(effective_state("opt_in", "active"), ConsentState::Allow);
        assert_eq!(
            effective_state("opt_in", "revocation_pending"),
            ConsentState::RevocationPending
        );
        assert_eq!(effective_state("opt_in", "pending"), ConsentState::None);
        assert_eq!(effective_state("opt_in", "revoked"), ConsentState::None);
        assert_eq!(effective_state("opt_out", "revoked"), ConsentState::None);
    }

    #[test]
    fn deny_on_either_side_blocks_fact_writes() {
        let repo = repo_hid_from_name("octo/repo");
        let actor = actor_hid_from_login("grump");
        let other_actor = actor_hid_from_login("cheerful");

        let mut index = ConsentIndex::empty();
        index.insert(actor, ConsentState::Deny, None);

        assert!(!index.allows_fact(&repo, &actor));
        assert!(index.allows_fact(&repo, &other_actor));

        let mut repo_denied = ConsentIndex::empty();
        repo_denied.insert(repo, ConsentState::Deny, None);
        assert!(!repo_denied.allows_fact(&repo, &other_actor));
    }

    #[test]
    fn allow_and_none_proceed() {
        let repo = repo_hid_from_name("octo/repo");
        let actor = actor_hid_from_login("someone");
        let mut index = ConsentIndex::empty();
        index.insert(repo, ConsentState::Allow, Some(Uuid::new_v4()));
        assert!(index.allows_fact(&repo, &actor));
    }

    #[test]
    fn consent_id_only_surfaces_for_allow() {
        let hid = repo_hid_from_name("octo/repo");
        let id = Uuid::new_v4();

        let mut index = ConsentIndex::empty();
        index.insert(hid, ConsentState::Allow, Some(id));
        assert_eq!(index.consent_id(&hid), Some(id));

        let mut pending = ConsentIndex::empty();
        pending.insert(hid, ConsentState::RevocationPending, Some(id));
        assert_eq!(pending.consent_id(&hid), None);

        assert_eq!(ConsentIndex::empty().consent_id(&hid), None);
    }

    #[test]
    fn challenge_is_hex_and_unique() {
        let a = random_challenge();
        let b = random_challenge();
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }
}
