//! The backfill runner: one UTC hour at a time through fetch, read,
//! extract, normalize, write, and optional detection.
//!
//! Each hour is announced in the control plane before work starts and
//! closed with counters, phase timings and a terminal status. Utterance
//! writes always precede hit writes for the same batch, and the consent
//! gate filters both before anything reaches the facts store. Cancellation
//! at any point records the hour as `error` with whatever counters had
//! accumulated.

pub mod progress;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::archive::{ArchiveCache, EventReader};
use crate::cancel::Scope;
use crate::config::BackfillConfig;
use crate::consent::{ConsentIndex, ConsentStore};
use crate::detect::{Detector, HitSeverity, RuleMatch};
use crate::extract::{extract, RawUtterance};
use crate::hallmonitor::Enqueuer;
use crate::hid::{actor_hid, hid_hex, repo_hid, Hid, HID_KEY_VERSION};
use crate::hour::HourKey;
use crate::normalize::normalize;
use crate::storage::{
    CatalogStore, FactsStore, HitRow, HourFinish, HourStore, IngestBatch, UtteranceRef,
    UtteranceRow,
};

pub use progress::{ProgressCounters, ProgressMonitor};

/// How often the background monitor logs range progress.
const PROGRESS_INTERVAL: Duration = Duration::from_secs(30);

/// Budget for acquiring one hour's archive stream, tightened against the
/// parent scope.
const FETCH_BUDGET: Duration = Duration::from_secs(600);

/// Summary of a processed hour range.
#[derive(Debug, Default)]
pub struct RangeSummary {
    pub hours_ok: usize,
    pub hours_error: usize,
    pub utterances: u64,
    pub hits: u64,
}

/// Wiring for one backfill run.
pub struct BackfillRunner {
    cache: Arc<ArchiveCache>,
    hours: HourStore,
    facts: FactsStore,
    consent: ConsentStore,
    catalog: CatalogStore,
    repo_queue: Arc<dyn Enqueuer>,
    actor_queue: Arc<dyn Enqueuer>,
    detector: Option<Arc<Detector>>,
    config: BackfillConfig,
}

impl BackfillRunner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cache: Arc<ArchiveCache>,
        hours: HourStore,
        facts: FactsStore,
        consent: ConsentStore,
        catalog: CatalogStore,
        repo_queue: Arc<dyn Enqueuer>,
        actor_queue: Arc<dyn Enqueuer>,
        detector: Option<Arc<Detector>>,
        config: BackfillConfig,
    ) -> Self {
        Self {
            cache,
            hours,
            facts,
            consent,
            catalog,
            repo_queue,
            actor_queue,
            detector,
            config,
        }
    }

    /// Walks the inclusive hour range. A failed hour records its error and
    /// lets the next hour proceed; only cancellation stops the walk.
    pub async fn run_range(
        &self,
        start: HourKey,
        end: HourKey,
        scope: &Scope,
    ) -> RangeSummary {
        let counters = ProgressCounters::new();
        let monitor = ProgressMonitor::spawn(counters.clone(), PROGRESS_INTERVAL);
        let mut summary = RangeSummary::default();

        for hour in start.range_to(end) {
            if scope.is_cancelled() {
                break;
            }
            let finish = self.run_hour(hour, scope).await;
            counters.hour_done(finish.ok);
            counters.add_events(finish.events_scanned.max(0) as u64);
            counters.add_utterances(finish.utterances.max(0) as u64);
            counters.add_hits(finish.hits.max(0) as u64);
            summary.utterances += finish.utterances.max(0) as u64;
            summary.hits += finish.hits.max(0) as u64;
            if finish.ok {
                summary.hours_ok += 1;
            } else {
                summary.hours_error += 1;
            }
        }

        monitor.stop();
        summary
    }

    /// Processes a single hour end to end and records its outcome. Never
    /// returns an error: failures land in the hour row.
    pub async fn run_hour(&self, hour: HourKey, scope: &Scope) -> HourFinish {
        info!(hour = %hour, "hour starting");
        if let Err(err) = self.hours.start_hour(hour).await {
            warn!(hour = %hour, error = %err, "could not announce hour");
            return HourFinish {
                error_text: Some(err.to_string()),
                ..HourFinish::default()
            };
        }

        let mut finish = match self.ingest_hour(hour, scope).await {
            Ok(finish) => finish,
            Err(reason) => {
                let mut finish = reason.partial;
                finish.ok = false;
                finish.error_text = Some(reason.message);
                finish
            }
        };

        if scope.is_cancelled() && finish.ok {
            finish.ok = false;
            finish.error_text = Some("cancelled".to_string());
        }
        if let Err(err) = self.hours.finish_hour(hour, &finish).await {
            warn!(hour = %hour, error = %err, "could not record hour finish");
        }
        info!(
            hour = %hour,
            ok = finish.ok,
            events = finish.events_scanned,
            utterances = finish.utterances,
            hits = finish.hits,
            "hour finished"
        );
        finish
    }

    async fn ingest_hour(&self, hour: HourKey, scope: &Scope) -> Result<HourFinish, HourAbort> {
        let mut finish = HourFinish::default();

        let consent = self
            .consent
            .load_index()
            .await
            .map_err(|e| HourAbort::new(&finish, format!("consent index: {}", e)))?;
        debug!(principals = consent.len(), "consent index loaded");

        let fetch_started = Instant::now();
        let fetch_scope = scope.with_budget(FETCH_BUDGET);
        let file = self
            .cache
            .open_hour(hour, &fetch_scope)
            .await
            .map_err(|e| HourAbort::new(&finish, format!("fetch: {}", e)))?;
        finish.fetch_ms = fetch_started.elapsed().as_millis() as i64;

        let batch = IngestBatch::open(Utc::now());
        let mut reader = EventReader::new(file);
        let mut pending: Vec<UtteranceRow> = Vec::new();
        let mut pending_bytes = 0usize;
        let mut seen_keys: HashSet<(String, String, i32)> = HashSet::new();
        let mut subjects = SubjectSet::default();
        let read_started = Instant::now();
        // The read timer brackets the whole iterate/flush loop; db and
        // detect time are subtracted out at the end.
        let read_ms = |finish: &HourFinish| {
            (read_started.elapsed().as_millis() as i64 - finish.db_ms - finish.detect_ms).max(0)
        };

        loop {
            if scope.is_cancelled() {
                let elapsed = read_ms(&finish);
                self.absorb_reader_stats(&mut finish, &reader, elapsed);
                return Err(HourAbort::new(&finish, "cancelled".to_string()));
            }
            let envelope = match reader.next() {
                None => break,
                Some(Ok(envelope)) => envelope,
                Some(Err(err)) => {
                    let elapsed = read_ms(&finish);
                    self.absorb_reader_stats(&mut finish, &reader, elapsed);
                    return Err(HourAbort::new(&finish, format!("read: {}", err)));
                }
            };
            finish.events_scanned += 1;

            for raw in extract(&envelope) {
                let repo = repo_hid(raw.repo_id, &raw.repo_name);
                let actor = actor_hid(raw.actor_id, &raw.actor_login);
                if !consent.allows_fact(&repo, &actor) {
                    debug!(
                        event = %raw.event_id,
                        repo = %hid_hex(&repo),
                        "utterance skipped by consent gate"
                    );
                    continue;
                }
                subjects.note(&raw, repo, actor);

                let row = build_utterance_row(&raw, repo, actor);
                if !seen_keys.insert(row.dedup_key()) {
                    finish.utterances_deduped += 1;
                    continue;
                }
                pending_bytes += row.text_raw.len()
                    + row.text_normalized.as_deref().map_or(0, str::len);
                pending.push(row);
            }

            if pending.len() >= self.config.batch_rows || pending_bytes >= self.config.batch_bytes {
                self.flush(&mut pending, batch, &mut finish, scope).await?;
                pending_bytes = 0;
            }
        }
        self.flush(&mut pending, batch, &mut finish, scope).await?;
        let elapsed = read_ms(&finish);
        self.absorb_reader_stats(&mut finish, &reader, elapsed);

        if let Some(sample) = reader.sample() {
            debug!(hour = %hour, sample_bytes = sample.len(), "first-line sample captured");
        }

        self.enqueue_subjects(&subjects, &consent).await;

        finish.ok = finish.error_text.is_none();
        Ok(finish)
    }

    fn absorb_reader_stats<R: std::io::Read>(
        &self,
        finish: &mut HourFinish,
        reader: &EventReader<R>,
        read_ms: i64,
    ) {
        let stats = reader.stats();
        finish.events_malformed = stats.malformed as i64;
        finish.lines_oversize = stats.oversize_dropped as i64;
        finish.bytes_read = stats.bytes_read as i64;
        finish.read_ms = read_ms;
    }

    /// Writes the pending utterance batch, then (when detection is on) the
    /// hits derived from it. Utterances always land first.
    async fn flush(
        &self,
        pending: &mut Vec<UtteranceRow>,
        batch: IngestBatch,
        finish: &mut HourFinish,
        scope: &Scope,
    ) -> Result<(), HourAbort> {
        if pending.is_empty() {
            return Ok(());
        }
        let rows = std::mem::take(pending);

        let db_started = Instant::now();
        let report = self.facts.insert_utterances(&rows, batch, scope).await;
        finish.db_ms += db_started.elapsed().as_millis() as i64;
        finish.utterances += report.inserted as i64;
        if report.failed > 0 || report.invalid > 0 {
            warn!(
                failed = report.failed,
                invalid = report.invalid,
                "utterance batch had failures"
            );
        }
        if let Some(err) = report.error {
            if matches!(err, crate::error::FactsError::Cancelled) {
                return Err(HourAbort::new(finish, "cancelled".to_string()));
            }
            // Partial failure: the hour continues but ends in error status.
            finish.error_text = Some(format!("utterance insert: {}", err));
            return Ok(());
        }

        if let Some(detector) = &self.detector {
            let detect_started = Instant::now();
            let hits = self.detect_batch(detector, &rows, batch, scope).await;
            finish.detect_ms += detect_started.elapsed().as_millis() as i64;
            match hits {
                Ok(hits) => finish.hits += hits as i64,
                Err(message) => return Err(HourAbort::new(finish, message)),
            }
        }
        Ok(())
    }

    /// Looks up the persisted identifiers for a batch, scans each utterance
    /// and writes ranked hits.
    async fn detect_batch(
        &self,
        detector: &Detector,
        rows: &[UtteranceRow],
        batch: IngestBatch,
        scope: &Scope,
    ) -> Result<u64, String> {
        let event_ids: Vec<String> = rows
            .iter()
            .map(|r| r.event_id.clone())
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        let resolved = match self.facts.lookup_utterances(&event_ids, scope).await {
            Ok(resolved) => resolved,
            Err(err) => {
                warn!(error = %err, "utterance lookup failed, skipping detection for batch");
                return Ok(0);
            }
        };

        let mut hit_rows = Vec::new();
        for row in rows {
            let Some(text) = row.text_normalized.as_deref() else {
                continue;
            };
            let key = (row.event_id.clone(), row.source.clone(), row.ordinal);
            let Some(utterance) = resolved.get(&key) else {
                debug!(event = %row.event_id, "persisted utterance not found for hit stamping");
                continue;
            };
            for m in detector.scan(text) {
                hit_rows.push(build_hit_row(row, utterance, &m, detector.version()));
            }
        }
        if hit_rows.is_empty() {
            return Ok(0);
        }

        let report = self.facts.insert_hits(&hit_rows, batch, scope).await;
        if let Some(err) = report.error {
            if matches!(err, crate::error::FactsError::Cancelled) {
                return Err("cancelled".to_string());
            }
            warn!(error = %err, failed = report.failed, "hit batch had failures");
        }
        Ok(report.inserted as u64)
    }

    /// Feeds newly seen subjects to the hallmonitor lane. Best effort;
    /// ingestion never fails because a queue write did.
    async fn enqueue_subjects(&self, subjects: &SubjectSet, consent: &ConsentIndex) {
        use crate::consent::ConsentState;
        for (hid, github_id) in &subjects.repos {
            if consent.effective(hid) == ConsentState::Deny || *github_id <= 0 {
                continue;
            }
            if let Err(err) = self.catalog.ensure_repo_stub(hid, *github_id).await {
                debug!(error = %err, "repo stub write failed");
                continue;
            }
            if let Err(err) = self.repo_queue.enqueue(hid, 0).await {
                debug!(error = %err, "repo enqueue failed");
            }
        }
        for (hid, github_id) in &subjects.actors {
            if consent.effective(hid) == ConsentState::Deny || *github_id <= 0 {
                continue;
            }
            if let Err(err) = self.catalog.ensure_actor_stub(hid, *github_id).await {
                debug!(error = %err, "actor stub write failed");
                continue;
            }
            if let Err(err) = self.actor_queue.enqueue(hid, 0).await {
                debug!(error = %err, "actor enqueue failed");
            }
        }
    }
}

/// Distinct repo/actor subjects seen during an hour.
#[derive(Default)]
struct SubjectSet {
    repos: HashMap<Hid, i64>,
    actors: HashMap<Hid, i64>,
}

impl SubjectSet {
    fn note(&mut self, raw: &RawUtterance, repo: Hid, actor: Hid) {
        self.repos.entry(repo).or_insert(raw.repo_id);
        self.actors.entry(actor).or_insert(raw.actor_id);
    }
}

/// An hour-fatal failure carrying the counters gathered so far.
struct HourAbort {
    message: String,
    partial: HourFinish,
}

impl HourAbort {
    fn new(partial: &HourFinish, message: String) -> Self {
        Self {
            message,
            partial: partial.clone(),
        }
    }
}

/// Builds the columnar row for one gated utterance.
fn build_utterance_row(raw: &RawUtterance, repo: Hid, actor: Hid) -> UtteranceRow {
    let normalized = normalize(&raw.text);
    UtteranceRow {
        event_id: raw.event_id.clone(),
        event_type: raw.event_type.clone(),
        repo_hid_hex: hid_hex(&repo),
        actor_hid_hex: hid_hex(&actor),
        hid_key_version: HID_KEY_VERSION,
        created_at_ms: raw.created_at.timestamp_millis(),
        source: raw.source.as_str().to_string(),
        source_detail: raw.source_detail.clone(),
        ordinal: raw.ordinal,
        text_raw: raw.text.clone(),
        text_normalized: if normalized.is_empty() {
            None
        } else {
            Some(normalized)
        },
        lang_code: None,
        lang_confidence: None,
        lang_reliable: 0,
        sentiment_score: None,
    }
}

/// Builds the columnar row for one ranked match.
fn build_hit_row(
    utterance: &UtteranceRow,
    persisted: &UtteranceRef,
    m: &RuleMatch,
    detector_version: i32,
) -> HitRow {
    HitRow {
        utterance_id: persisted.id.clone(),
        created_at_ms: utterance.created_at_ms,
        source: utterance.source.clone(),
        repo_hid_hex: utterance.repo_hid_hex.clone(),
        actor_hid_hex: utterance.actor_hid_hex.clone(),
        lang_code: persisted.lang_code.clone(),
        term: m.term.clone(),
        category: m.category.as_str().to_string(),
        severity: HitSeverity::from_score(m.severity).as_str().to_string(),
        ctx_action: m.ctx_action.as_str().to_string(),
        target_type: m
            .target
            .as_ref()
            .map(|t| t.ttype.as_str())
            .unwrap_or("none")
            .to_string(),
        target_id: m
            .target
            .as_ref()
            .map(|t| t.id.clone())
            .unwrap_or_default(),
        target_name: m.target.as_ref().map(|t| t.name.clone()),
        target_span_start: m.target.as_ref().map(|t| t.start as i32),
        target_span_end: m.target.as_ref().map(|t| t.end as i32),
        target_distance: m.target.as_ref().map(|t| t.distance as i32),
        span_start: m.span.0 as i32,
        span_end: m.span.1 as i32,
        detector_version,
        detector_source: m.source.as_str().to_string(),
        pre_context: m.pre_context.clone(),
        post_context: m.post_context.clone(),
        zones: m.zones.iter().map(|z| z.as_str().to_string()).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::{Category, CtxAction, DetectorSource, TargetHit, TargetType, Zone};
    use crate::extract::Source;

    fn raw_utterance(text: &str) -> RawUtterance {
        RawUtterance {
            event_id: "100".to_string(),
            event_type: "PushEvent".to_string(),
            repo_id: 42,
            repo_name: "octo/repo".to_string(),
            actor_id: 7,
            actor_login: "octocat".to_string(),
            created_at: "2015-01-02T03:04:05Z".parse().unwrap(),
            source: Source::Commit,
            source_detail: "push:abc".to_string(),
            ordinal: 0,
            text: text.to_string(),
        }
    }

    #[test]
    fn utterance_row_carries_hids_and_normalized_text() {
        let raw = raw_utterance("This IS   Garbage");
        let repo = repo_hid(raw.repo_id, &raw.repo_name);
        let actor = actor_hid(raw.actor_id, &raw.actor_login);
        let row = build_utterance_row(&raw, repo, actor);
        assert_eq!(row.repo_hid_hex.len(), 64);
        assert_eq!(row.text_raw, "This IS   Garbage");
        assert_eq!(row.text_normalized.as_deref(), Some("this is garbage"));
        assert_eq!(row.source, "commit");
        assert_eq!(row.hid_key_version, HID_KEY_VERSION);
        assert_eq!(row.lang_reliable, 0);
    }

    #[test]
    fn hit_row_carries_detector_stamp_and_target() {
        let raw = raw_utterance("this is garbage, @dependabot");
        let repo = repo_hid(raw.repo_id, &raw.repo_name);
        let actor = actor_hid(raw.actor_id, &raw.actor_login);
        let row = build_utterance_row(&raw, repo, actor);
        let persisted = UtteranceRef {
            id: "0191d3a8-0000-7000-8000-000000000001".to_string(),
            lang_code: Some("en".to_string()),
        };
        let m = RuleMatch {
            term: "garbage".to_string(),
            category: Category::Generic,
            severity: 1,
            span: (8, 15),
            source: DetectorSource::Template,
            pre_context: "this is ".to_string(),
            post_context: ", dependabot".to_string(),
            zones: vec![Zone::Quote],
            target: Some(TargetHit {
                ttype: TargetType::Bot,
                id: "dependabot".to_string(),
                name: "dependabot".to_string(),
                start: 18,
                end: 28,
                distance: 3,
            }),
            ctx_action: CtxAction::None,
        };

        let hit = build_hit_row(&row, &persisted, &m, 3);
        assert_eq!(hit.utterance_id, persisted.id);
        assert_eq!(hit.term, "garbage");
        assert_eq!(hit.detector_source, "template");
        assert_eq!(hit.detector_version, 3);
        assert_eq!(hit.target_type, "bot");
        assert_eq!(hit.target_id, "dependabot");
        assert_eq!(hit.severity, "mild");
        assert_eq!(hit.zones, vec!["quote"]);
        assert_eq!(hit.lang_code.as_deref(), Some("en"));
        assert!(hit.span_end > hit.span_start);
    }

    #[test]
    fn hit_row_without_target_uses_none_type() {
        let raw = raw_utterance("plain garbage");
        let repo = repo_hid(raw.repo_id, &raw.repo_name);
        let actor = actor_hid(raw.actor_id, &raw.actor_login);
        let row = build_utterance_row(&raw, repo, actor);
        let persisted = UtteranceRef {
            id: "0191d3a8-0000-7000-8000-000000000002".to_string(),
            lang_code: None,
        };
        let m = RuleMatch {
            term: "garbage".to_string(),
            category: Category::Generic,
            severity: 2,
            span: (6, 13),
            source: DetectorSource::Lemma,
            pre_context: "plain ".to_string(),
            post_context: String::new(),
            zones: vec![],
            target: None,
            ctx_action: CtxAction::None,
        };
        let hit = build_hit_row(&row, &persisted, &m, 1);
        assert_eq!(hit.target_type, "none");
        assert_eq!(hit.target_id, "");
        assert!(hit.target_name.is_none());
        assert_eq!(hit.severity, "strong");
        assert_eq!(hit.detector_source, "lemma");
    }

    #[test]
    fn normalization_collapsing_to_nothing_becomes_null() {
        // Whitespace-only text never reaches extraction, but text made of
        // stripped characters can still normalize to empty.
        let raw = raw_utterance("\u{200B}\u{FEFF}");
        let repo = repo_hid(raw.repo_id, &raw.repo_name);
        let actor = actor_hid(raw.actor_id, &raw.actor_login);
        let row = build_utterance_row(&raw, repo, actor);
        assert!(row.text_normalized.is_none());
    }
}
