//! Control-plane schema journal.
//!
//! Every statement in the `schema` module gets a journal entry named after
//! the object it creates (`table/ingest_hours`, `index/idx_repo_queue_due`)
//! plus a fingerprint of its SQL. Applying the schema skips journaled
//! entries, runs all pending ones in a single transaction, and warns when a
//! journaled statement's text has drifted since it was applied. A failed
//! upgrade therefore leaves the journal at its previous edge, never halfway.

use std::collections::HashMap;

use sha2::{Digest, Sha256};
use sqlx::{PgPool, Row};
use tracing::{info, warn};

use crate::error::StoreError;

use super::schema;

const JOURNAL_TABLE_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS schema_journal (
    name TEXT PRIMARY KEY,
    fingerprint TEXT NOT NULL,
    applied_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
)
"#;

/// One schema statement with its journal identity.
struct JournalEntry {
    name: String,
    fingerprint: String,
    sql: &'static str,
}

/// Applies every control-plane statement not yet journaled. Returns how
/// many statements ran.
pub async fn apply_control_schema(pool: &PgPool) -> Result<usize, StoreError> {
    sqlx::query(JOURNAL_TABLE_SQL).execute(pool).await?;

    let mut journaled: HashMap<String, String> = HashMap::new();
    for row in sqlx::query("SELECT name, fingerprint FROM schema_journal")
        .fetch_all(pool)
        .await?
    {
        journaled.insert(row.get("name"), row.get("fingerprint"));
    }

    let pending: Vec<JournalEntry> = journal_entries()
        .into_iter()
        .filter(|entry| match journaled.get(&entry.name) {
            None => true,
            Some(recorded) => {
                if recorded != &entry.fingerprint {
                    // The statement changed after it was applied. CREATE IF
                    // NOT EXISTS will not re-shape an existing object, so
                    // this needs an operator, not a silent rerun.
                    warn!(
                        name = %entry.name,
                        "schema statement drifted since it was journaled"
                    );
                }
                false
            }
        })
        .collect();

    if pending.is_empty() {
        return Ok(0);
    }

    let mut tx = pool.begin().await?;
    for entry in &pending {
        sqlx::query(entry.sql).execute(&mut *tx).await.map_err(|e| {
            warn!(name = %entry.name, error = %e, "schema statement failed");
            StoreError::Query(e)
        })?;
        sqlx::query("INSERT INTO schema_journal (name, fingerprint) VALUES ($1, $2)")
            .bind(&entry.name)
            .bind(&entry.fingerprint)
            .execute(&mut *tx)
            .await?;
    }
    tx.commit().await?;

    info!(applied = pending.len(), "control-plane schema applied");
    Ok(pending.len())
}

/// Journal identities for every control-plane statement, in apply order.
fn journal_entries() -> Vec<JournalEntry> {
    schema::all_schema_statements()
        .into_iter()
        .map(|sql| JournalEntry {
            name: object_name(sql),
            fingerprint: fingerprint(sql),
            sql,
        })
        .collect()
}

/// Derives `kind/object` from a `CREATE … IF NOT EXISTS <object>` statement.
fn object_name(sql: &str) -> String {
    let kind = if sql.trim_start().starts_with("CREATE INDEX") {
        "index"
    } else {
        "table"
    };
    let object = sql
        .split_once("IF NOT EXISTS")
        .map(|(_, rest)| rest.trim_start())
        .and_then(|rest| rest.split(|c: char| c.is_whitespace() || c == '(').next())
        .unwrap_or("unnamed");
    format!("{}/{}", kind, object)
}

/// Short, stable content hash of a statement.
fn fingerprint(sql: &str) -> String {
    let digest = Sha256::digest(sql.as_bytes());
    hex::encode(&digest[..8])
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn every_statement_has_a_distinct_journal_name() {
        let entries = journal_entries();
        assert_eq!(entries.len(), schema::all_schema_statements().len());
        let names: HashSet<&str> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names.len(), entries.len(), "journal names collide");
        assert!(!names.contains("table/unnamed"));
        assert!(!names.contains("index/unnamed"));
    }

    #[test]
    fn object_names_split_tables_from_indexes() {
        assert_eq!(
            object_name(schema::CREATE_INGEST_HOURS),
            "table/ingest_hours"
        );
        assert_eq!(
            object_name("CREATE INDEX IF NOT EXISTS idx_repo_queue_due ON repo_catalog_queue(next_attempt_at, priority)"),
            "index/idx_repo_queue_due"
        );
    }

    #[test]
    fn fingerprints_are_stable_and_content_sensitive() {
        let a = fingerprint(schema::CREATE_INGEST_HOURS);
        assert_eq!(a, fingerprint(schema::CREATE_INGEST_HOURS));
        assert_eq!(a.len(), 16);
        assert_ne!(a, fingerprint(schema::CREATE_ACTORS));
    }
}
