//! Batch writer for the columnar facts store.
//!
//! Facts are written over ClickHouse's HTTP interface. Inserts send rows as
//! JSONEachRow through `input()`, letting the server `unhex()` HID columns
//! into `FixedString(32)` and parse millisecond timestamps into
//! `DateTime64(3)`. The batch id and `ver` are injected as literals so every
//! row of a batch carries the same pair; replaying a batch with the same
//! `ver` collapses on merge.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::cancel::Scope;
use crate::config::ClickhouseConfig;
use crate::error::FactsError;

use super::schema;

/// Base delay of the insert retry curve.
const RETRY_BASE: Duration = Duration::from_millis(500);

/// Retry delay ceiling.
const RETRY_CAP: Duration = Duration::from_secs(30);

/// A stable `(ingest_batch_id, ver)` pair shared by every row of a batch.
#[derive(Debug, Clone, Copy)]
pub struct IngestBatch {
    pub id: Uuid,
    pub ver: u64,
}

impl IngestBatch {
    /// Opens a batch stamped with the current wall clock as its version.
    pub fn open(now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            ver: now.timestamp_millis().max(0) as u64,
        }
    }
}

/// Insertion columns of one utterance fact. HIDs travel hex-encoded and
/// timestamps as UTC milliseconds; the server converts both.
#[derive(Debug, Clone, Serialize)]
pub struct UtteranceRow {
    pub event_id: String,
    pub event_type: String,
    pub repo_hid_hex: String,
    pub actor_hid_hex: String,
    pub hid_key_version: i16,
    pub created_at_ms: i64,
    pub source: String,
    pub source_detail: String,
    pub ordinal: i32,
    pub text_raw: String,
    pub text_normalized: Option<String>,
    pub lang_code: Option<String>,
    pub lang_confidence: Option<f32>,
    pub lang_reliable: u8,
    pub sentiment_score: Option<f32>,
}

impl UtteranceRow {
    /// Replay identity within the replacing engine.
    pub fn dedup_key(&self) -> (String, String, i32) {
        (self.event_id.clone(), self.source.clone(), self.ordinal)
    }

    fn validate(&self) -> Result<(), String> {
        if self.event_id.is_empty() {
            return Err("event_id: empty".to_string());
        }
        if self.ordinal < 0 {
            return Err(format!("ordinal: negative ({})", self.ordinal));
        }
        if self.repo_hid_hex.len() != 64 || self.actor_hid_hex.len() != 64 {
            return Err("hid: not 32 bytes".to_string());
        }
        Ok(())
    }
}

/// Insertion columns of one hit fact.
#[derive(Debug, Clone, Serialize)]
pub struct HitRow {
    pub utterance_id: String,
    pub created_at_ms: i64,
    pub source: String,
    pub repo_hid_hex: String,
    pub actor_hid_hex: String,
    pub lang_code: Option<String>,
    pub term: String,
    pub category: String,
    pub severity: String,
    pub ctx_action: String,
    pub target_type: String,
    pub target_id: String,
    pub target_name: Option<String>,
    pub target_span_start: Option<i32>,
    pub target_span_end: Option<i32>,
    pub target_distance: Option<i32>,
    pub span_start: i32,
    pub span_end: i32,
    pub detector_version: i32,
    pub detector_source: String,
    pub pre_context: String,
    pub post_context: String,
    pub zones: Vec<String>,
}

impl HitRow {
    fn validate(&self) -> Result<(), String> {
        if self.utterance_id.is_empty() {
            return Err("utterance_id: empty".to_string());
        }
        if self.span_start < 0 {
            return Err(format!("span_start: negative ({})", self.span_start));
        }
        if self.span_end <= self.span_start {
            return Err(format!(
                "span_end: {} not after span_start {}",
                self.span_end, self.span_start
            ));
        }
        if self.term.is_empty() {
            return Err("term: empty".to_string());
        }
        Ok(())
    }
}

/// Resolved identity of a persisted utterance, for hit stamping.
#[derive(Debug, Clone, Deserialize)]
pub struct UtteranceRef {
    pub id: String,
    pub lang_code: Option<String>,
}

/// Outcome of a batch insert. Failures are partial: chunks that could not be
/// written after retries are counted and the last error kept.
#[derive(Debug, Default)]
pub struct InsertReport {
    pub inserted: usize,
    pub failed: usize,
    /// Rows dropped before sending for violating invariants.
    pub invalid: usize,
    pub error: Option<FactsError>,
}

/// ClickHouse-backed facts writer.
#[derive(Clone)]
pub struct FactsStore {
    http: Client,
    base_url: String,
    log_sql: bool,
    chunk_size: usize,
    max_retries: u32,
}

impl FactsStore {
    pub fn new(config: &ClickhouseConfig) -> Self {
        Self {
            http: Client::builder()
                .timeout(Duration::from_secs(120))
                .build()
                .unwrap_or_else(|_| Client::new()),
            base_url: config.url.trim_end_matches('/').to_string(),
            log_sql: config.log_sql,
            chunk_size: config.chunk_size.max(1),
            max_retries: config.max_retries.max(1),
        }
    }

    /// Applies the facts-store DDL. Idempotent.
    pub async fn ensure_schema(&self, scope: &Scope) -> Result<(), FactsError> {
        for statement in schema::facts_schema_statements() {
            self.with_retries(scope, statement.to_string()).await?;
        }
        Ok(())
    }

    /// Inserts utterance rows in chunks under the batch's `(id, ver)` stamp.
    pub async fn insert_utterances(
        &self,
        rows: &[UtteranceRow],
        batch: IngestBatch,
        scope: &Scope,
    ) -> InsertReport {
        let (valid, invalid) = split_valid(rows, |r| r.validate());
        let mut report = self
            .insert_chunked(&valid, scope, |chunk| utterance_insert_sql(chunk, batch))
            .await;
        report.invalid = invalid;
        report
    }

    /// Inserts hit rows. The caller guarantees the referenced utterances were
    /// written first.
    pub async fn insert_hits(
        &self,
        rows: &[HitRow],
        batch: IngestBatch,
        scope: &Scope,
    ) -> InsertReport {
        let (valid, invalid) = split_valid(rows, |r| r.validate());
        let mut report = self
            .insert_chunked(&valid, scope, |chunk| hit_insert_sql(chunk, batch))
            .await;
        report.invalid = invalid;
        report
    }

    /// Resolves persisted utterance ids and language codes for a set of
    /// events, keyed by `(event_id, source, ordinal)`. `argMax` over `ver`
    /// matches what the replacing engine will keep.
    pub async fn lookup_utterances(
        &self,
        event_ids: &[String],
        scope: &Scope,
    ) -> Result<HashMap<(String, String, i32), UtteranceRef>, FactsError> {
        if event_ids.is_empty() {
            return Ok(HashMap::new());
        }
        let id_list = event_ids
            .iter()
            .map(|id| sql_quote(id))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "SELECT event_id, toString(source) AS source, ordinal, \
             argMax(toString(id), ver) AS id, argMax(lang_code, ver) AS lang_code \
             FROM {} WHERE event_id IN ({}) \
             GROUP BY event_id, source, ordinal \
             FORMAT JSONEachRow",
            schema::tables::UTTERANCES,
            id_list
        );

        let body = self.with_retries(scope, sql).await?;
        let mut out = HashMap::new();
        for line in body.lines().filter(|l| !l.trim().is_empty()) {
            let row: LookupRow = serde_json::from_str(line)?;
            out.insert(
                (row.event_id, row.source, row.ordinal),
                UtteranceRef {
                    id: row.id,
                    lang_code: row.lang_code.filter(|l| !l.is_empty()),
                },
            );
        }
        Ok(out)
    }

    async fn insert_chunked<T: Serialize>(
        &self,
        rows: &[&T],
        scope: &Scope,
        build_sql: impl Fn(&[&T]) -> String,
    ) -> InsertReport {
        let mut report = InsertReport::default();
        for chunk in rows.chunks(self.chunk_size) {
            let sql = build_sql(chunk);
            match self.with_retries(scope, sql).await {
                Ok(_) => report.inserted += chunk.len(),
                Err(err) => {
                    warn!(rows = chunk.len(), error = %err, "facts chunk insert failed");
                    report.failed += chunk.len();
                    report.error = Some(err);
                    if matches!(report.error, Some(FactsError::Cancelled)) {
                        report.failed += rows.len() - report.inserted - report.failed;
                        break;
                    }
                }
            }
        }
        report
    }

    /// Runs one statement with capped exponential backoff on retryable
    /// failures.
    async fn with_retries(&self, scope: &Scope, sql: String) -> Result<String, FactsError> {
        let mut attempt: u32 = 0;
        loop {
            if scope.is_cancelled() {
                return Err(FactsError::Cancelled);
            }
            match self.execute(&sql).await {
                Ok(body) => return Ok(body),
                Err(err) if err.is_retryable() => {
                    attempt += 1;
                    if attempt >= self.max_retries {
                        return Err(FactsError::RetriesExhausted {
                            attempts: attempt,
                            last: err.to_string(),
                        });
                    }
                    let delay = backoff_delay(attempt);
                    debug!(attempt, delay_ms = delay.as_millis() as u64, error = %err, "facts retry");
                    if !scope.sleep(delay).await {
                        return Err(FactsError::Cancelled);
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn execute(&self, sql: &str) -> Result<String, FactsError> {
        let began = Instant::now();
        let response = self
            .http
            .post(&self.base_url)
            .body(sql.to_string())
            .send()
            .await
            .map_err(|e| FactsError::Http(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| FactsError::Http(e.to_string()))?;

        if self.log_sql {
            let head: String = sql.chars().take(120).collect();
            debug!(elapsed_ms = began.elapsed().as_millis() as u64, sql = %head, "clickhouse");
        }

        if !status.is_success() {
            let tail: String = body.chars().take(256).collect();
            return Err(FactsError::Status {
                status: status.as_u16(),
                body: tail,
            });
        }
        Ok(body)
    }
}

#[derive(Debug, Deserialize)]
struct LookupRow {
    event_id: String,
    source: String,
    ordinal: i32,
    id: String,
    lang_code: Option<String>,
}

fn split_valid<'a, T>(
    rows: &'a [T],
    validate: impl Fn(&T) -> Result<(), String>,
) -> (Vec<&'a T>, usize) {
    let mut valid = Vec::with_capacity(rows.len());
    let mut invalid = 0;
    for row in rows {
        match validate(row) {
            Ok(()) => valid.push(row),
            Err(field) => {
                warn!(field = %field, "dropping invalid fact row");
                invalid += 1;
            }
        }
    }
    (valid, invalid)
}

fn backoff_delay(attempt: u32) -> Duration {
    let exp = RETRY_BASE.saturating_mul(1u32 << attempt.min(16));
    exp.min(RETRY_CAP)
}

/// Quotes a string literal for ClickHouse SQL.
fn sql_quote(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len() + 2);
    out.push('\'');
    for c in raw.chars() {
        match c {
            '\'' => out.push_str("\\'"),
            '\\' => out.push_str("\\\\"),
            _ => out.push(c),
        }
    }
    out.push('\'');
    out
}

fn json_lines<T: Serialize>(rows: &[&T]) -> String {
    rows.iter()
        .filter_map(|row| serde_json::to_string(row).ok())
        .collect::<Vec<_>>()
        .join("\n")
}

fn utterance_insert_sql(rows: &[&UtteranceRow], batch: IngestBatch) -> String {
    format!(
        "INSERT INTO {table} \
         (event_id, event_type, repo_hid, actor_hid, hid_key_version, created_at, source, \
          source_detail, ordinal, text_raw, text_normalized, lang_code, lang_confidence, \
          lang_reliable, sentiment_score, ingest_batch_id, ver) \
         SELECT event_id, event_type, unhex(repo_hid_hex), unhex(actor_hid_hex), \
          hid_key_version, toDateTime64(created_at_ms / 1000.0, 3, 'UTC'), source, \
          source_detail, ordinal, text_raw, text_normalized, lang_code, lang_confidence, \
          lang_reliable, sentiment_score, toUUID({batch_id}), {ver} \
         FROM input('event_id String, event_type String, repo_hid_hex String, \
          actor_hid_hex String, hid_key_version Int16, created_at_ms Int64, source String, \
          source_detail String, ordinal Int32, text_raw String, \
          text_normalized Nullable(String), lang_code Nullable(String), \
          lang_confidence Nullable(Float32), lang_reliable UInt8, \
          sentiment_score Nullable(Float32)') \
         FORMAT JSONEachRow\n{rows}",
        table = schema::tables::UTTERANCES,
        batch_id = sql_quote(&batch.id.to_string()),
        ver = batch.ver,
        rows = json_lines(rows),
    )
}

fn hit_insert_sql(rows: &[&HitRow], batch: IngestBatch) -> String {
    format!(
        "INSERT INTO {table} \
         (utterance_id, created_at, source, repo_hid, actor_hid, lang_code, term, category, \
          severity, ctx_action, target_type, target_id, target_name, target_span_start, \
          target_span_end, target_distance, span_start, span_end, detector_version, \
          detector_source, pre_context, post_context, zones, ingest_batch_id, ver) \
         SELECT toUUID(utterance_id), toDateTime64(created_at_ms / 1000.0, 3, 'UTC'), source, \
          unhex(repo_hid_hex), unhex(actor_hid_hex), lang_code, term, category, severity, \
          ctx_action, target_type, target_id, target_name, target_span_start, \
          target_span_end, target_distance, span_start, span_end, detector_version, \
          detector_source, pre_context, post_context, zones, toUUID({batch_id}), {ver} \
         FROM input('utterance_id String, created_at_ms Int64, source String, \
          repo_hid_hex String, actor_hid_hex String, lang_code Nullable(String), \
          term String, category String, severity String, ctx_action String, \
          target_type String, target_id String, target_name Nullable(String), \
          target_span_start Nullable(Int32), target_span_end Nullable(Int32), \
          target_distance Nullable(Int32), span_start Int32, span_end Int32, \
          detector_version Int32, detector_source String, pre_context String, \
          post_context String, zones Array(String)') \
         FORMAT JSONEachRow\n{rows}",
        table = schema::tables::HITS,
        batch_id = sql_quote(&batch.id.to_string()),
        ver = batch.ver,
        rows = json_lines(rows),
    )
}
