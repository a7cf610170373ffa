//! Rule-driven scanner over normalized utterance text.
//!
//! Scanning runs in four passes: context zones (code fences, inline code,
//! quotes), target alias occurrences, template/lemma matching, then ranking.
//! Matches sharing `(term, span)` collapse to a single winner: template
//! source beats lemma, ties break on category rank.

use std::sync::Arc;

use super::rulepack::{Category, Rulepack, TargetType};

/// How a match was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectorSource {
    Template,
    Lemma,
}

impl DetectorSource {
    pub fn as_str(self) -> &'static str {
        match self {
            DetectorSource::Template => "template",
            DetectorSource::Lemma => "lemma",
        }
    }

    fn rank(self) -> u8 {
        match self {
            DetectorSource::Template => 1,
            DetectorSource::Lemma => 0,
        }
    }
}

/// Context zones a span can fall into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Zone {
    CodeFence,
    InlineCode,
    Quote,
}

impl Zone {
    pub fn as_str(self) -> &'static str {
        match self {
            Zone::CodeFence => "code_fence",
            Zone::InlineCode => "inline_code",
            Zone::Quote => "quote",
        }
    }
}

/// Whether zone gating changed a match's severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CtxAction {
    None,
    Upgraded,
    Downgraded,
}

impl CtxAction {
    pub fn as_str(self) -> &'static str {
        match self {
            CtxAction::None => "none",
            CtxAction::Upgraded => "upgraded",
            CtxAction::Downgraded => "downgraded",
        }
    }
}

/// Severity bucket persisted on hits. `SlurMasked` is reserved for a
/// specialized pack and never emitted by this detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HitSeverity {
    Mild,
    Strong,
    SlurMasked,
}

impl HitSeverity {
    pub fn from_score(score: i32) -> Self {
        if score <= 1 {
            HitSeverity::Mild
        } else {
            HitSeverity::Strong
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            HitSeverity::Mild => "mild",
            HitSeverity::Strong => "strong",
            HitSeverity::SlurMasked => "slur_masked",
        }
    }
}

/// The nearest target alias to a match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetHit {
    pub ttype: TargetType,
    pub id: String,
    pub name: String,
    pub start: usize,
    pub end: usize,
    /// Byte gap between the match span and the alias span; 0 when touching.
    pub distance: usize,
}

/// One ranked detector match.
#[derive(Debug, Clone)]
pub struct RuleMatch {
    pub term: String,
    pub category: Category,
    pub severity: i32,
    pub span: (usize, usize),
    pub source: DetectorSource,
    pub pre_context: String,
    pub post_context: String,
    pub zones: Vec<Zone>,
    pub target: Option<TargetHit>,
    pub ctx_action: CtxAction,
}

/// Scanner over normalized text.
pub struct Detector {
    pack: Arc<Rulepack>,
    version: i32,
    prefer_non_overlapping: bool,
}

impl Detector {
    pub fn new(pack: Arc<Rulepack>, version: i32) -> Self {
        Self {
            pack,
            version,
            prefer_non_overlapping: true,
        }
    }

    /// Allow overlapping matches instead of the default greedy sweep.
    pub fn with_overlaps(mut self, allow: bool) -> Self {
        self.prefer_non_overlapping = !allow;
        self
    }

    /// Version stamped onto every hit this detector produces.
    pub fn version(&self) -> i32 {
        self.version
    }

    pub fn pack(&self) -> &Rulepack {
        &self.pack
    }

    /// Scans one normalized utterance and returns ranked matches in span order.
    pub fn scan(&self, text: &str) -> Vec<RuleMatch> {
        if text.is_empty() {
            return Vec::new();
        }
        let zones = compute_zones(text);
        let targets = self.find_targets(text);

        let mut matches: Vec<RuleMatch> = Vec::new();
        for template in &self.pack.templates {
            for found in template.regex.find_iter(text) {
                matches.push(self.build_match(
                    text,
                    &template.term,
                    template.category,
                    template.severity,
                    (found.start(), found.end()),
                    DetectorSource::Template,
                    &zones,
                    &targets,
                ));
            }
        }
        for (start, end) in tokens(text) {
            if let Some(rule) = self.pack.lemmas.get(&text[start..end]) {
                matches.push(self.build_match(
                    text,
                    &rule.term,
                    rule.category,
                    rule.severity,
                    (start, end),
                    DetectorSource::Lemma,
                    &zones,
                    &targets,
                ));
            }
        }

        let mut ranked = rank_matches(matches);
        if self.prefer_non_overlapping {
            ranked = drop_overlaps(ranked);
        }
        ranked.sort_by_key(|m| m.span);
        ranked
    }

    #[allow(clippy::too_many_arguments)]
    fn build_match(
        &self,
        text: &str,
        term: &str,
        category: Category,
        severity: i32,
        span: (usize, usize),
        source: DetectorSource,
        zones: &[ZoneSpan],
        targets: &[TargetOccurrence],
    ) -> RuleMatch {
        let in_zones: Vec<Zone> = zones
            .iter()
            .filter(|z| z.start < span.1 && span.0 < z.end)
            .map(|z| z.zone)
            .collect();

        let mut adjusted = severity;
        for zone in &in_zones {
            adjusted += match zone {
                Zone::CodeFence => self.pack.zone_adjust.code_fence,
                Zone::InlineCode => self.pack.zone_adjust.inline_code,
                Zone::Quote => self.pack.zone_adjust.quote,
            };
        }
        adjusted = adjusted.max(self.pack.min_severity);
        let ctx_action = match adjusted.cmp(&severity) {
            std::cmp::Ordering::Less => CtxAction::Downgraded,
            std::cmp::Ordering::Greater => CtxAction::Upgraded,
            std::cmp::Ordering::Equal => CtxAction::None,
        };

        let target = targets
            .iter()
            .map(|t| {
                let distance = span_gap(span, (t.start, t.end));
                (distance, t)
            })
            .min_by_key(|(distance, t)| (*distance, t.start))
            .map(|(distance, t)| TargetHit {
                ttype: t.ttype,
                id: t.id.clone(),
                name: t.name.clone(),
                start: t.start,
                end: t.end,
                distance,
            });

        let window = self.pack.context_window;
        RuleMatch {
            term: term.to_string(),
            category,
            severity: adjusted,
            span,
            source,
            pre_context: slice_before(text, span.0, window),
            post_context: slice_after(text, span.1, window),
            zones: in_zones,
            target,
            ctx_action,
        }
    }

    /// Every alias occurrence in the text, longest alias first per position.
    fn find_targets(&self, text: &str) -> Vec<TargetOccurrence> {
        let mut found = Vec::new();
        for alias in &self.pack.targets {
            for (start, matched) in text.match_indices(alias.alias.as_str()) {
                found.push(TargetOccurrence {
                    ttype: alias.ttype,
                    id: alias.id.clone(),
                    name: matched.to_string(),
                    start,
                    end: start + matched.len(),
                });
            }
        }
        // Aliases are pre-sorted longest first, so a shorter alias landing
        // inside a longer occurrence is dropped here.
        found.sort_by_key(|t| (t.start, std::cmp::Reverse(t.end)));
        let mut kept: Vec<TargetOccurrence> = Vec::new();
        for candidate in found {
            if kept
                .iter()
                .any(|k| k.start <= candidate.start && candidate.end <= k.end)
            {
                continue;
            }
            kept.push(candidate);
        }
        kept
    }
}

struct TargetOccurrence {
    ttype: TargetType,
    id: String,
    name: String,
    start: usize,
    end: usize,
}

#[derive(Debug, Clone, Copy)]
struct ZoneSpan {
    zone: Zone,
    start: usize,
    end: usize,
}

/// Collapses matches sharing `(term, span)` down to the ranking winner.
fn rank_matches(matches: Vec<RuleMatch>) -> Vec<RuleMatch> {
    let mut best: Vec<RuleMatch> = Vec::new();
    for candidate in matches {
        match best
            .iter_mut()
            .find(|m| m.term == candidate.term && m.span == candidate.span)
        {
            Some(existing) => {
                if match_rank(&candidate) > match_rank(existing) {
                    *existing = candidate;
                }
            }
            None => best.push(candidate),
        }
    }
    best
}

fn match_rank(m: &RuleMatch) -> (u8, u8) {
    (m.source.rank(), m.category.rank())
}

/// Greedy non-overlap sweep: strongest matches claim their spans first.
fn drop_overlaps(mut matches: Vec<RuleMatch>) -> Vec<RuleMatch> {
    matches.sort_by(|a, b| {
        match_rank(b)
            .cmp(&match_rank(a))
            .then(b.severity.cmp(&a.severity))
            .then((b.span.1 - b.span.0).cmp(&(a.span.1 - a.span.0)))
            .then(a.span.cmp(&b.span))
    });
    let mut kept: Vec<RuleMatch> = Vec::new();
    for candidate in matches {
        let overlaps = kept
            .iter()
            .any(|k| k.span.0 < candidate.span.1 && candidate.span.0 < k.span.1);
        if !overlaps {
            kept.push(candidate);
        }
    }
    kept
}

/// Byte spans of alphanumeric token runs, for lemma lookup.
fn tokens(text: &str) -> Vec<(usize, usize)> {
    let mut out = Vec::new();
    let mut start: Option<usize> = None;
    for (i, c) in text.char_indices() {
        if c.is_alphanumeric() {
            if start.is_none() {
                start = Some(i);
            }
        } else if let Some(s) = start.take() {
            out.push((s, i));
        }
    }
    if let Some(s) = start {
        out.push((s, text.len()));
    }
    out
}

/// Byte gap between two spans; zero when they touch or overlap.
fn span_gap(a: (usize, usize), b: (usize, usize)) -> usize {
    if b.1 <= a.0 {
        a.0 - b.1
    } else if a.1 <= b.0 {
        b.0 - a.1
    } else {
        0
    }
}

fn slice_before(text: &str, at: usize, window: usize) -> String {
    let mut start = at.saturating_sub(window);
    while start > 0 && !text.is_char_boundary(start) {
        start -= 1;
    }
    text[start..at].to_string()
}

fn slice_after(text: &str, at: usize, window: usize) -> String {
    let mut end = (at + window).min(text.len());
    while end < text.len() && !text.is_char_boundary(end) {
        end += 1;
    }
    text[at..end].to_string()
}

/// Zone spans for one utterance: fenced blocks, inline code, quoted lines.
fn compute_zones(text: &str) -> Vec<ZoneSpan> {
    let mut zones = Vec::new();

    // Fenced blocks: pair ``` markers; an unclosed fence runs to the end.
    let fence_marks: Vec<usize> = text.match_indices("```").map(|(i, _)| i).collect();
    let mut fences = Vec::new();
    let mut i = 0;
    while i < fence_marks.len() {
        let start = fence_marks[i];
        let end = fence_marks
            .get(i + 1)
            .map(|close| close + 3)
            .unwrap_or(text.len());
        fences.push((start, end));
        zones.push(ZoneSpan {
            zone: Zone::CodeFence,
            start,
            end,
        });
        i += 2;
    }

    // Inline code: pair single backticks outside any fence.
    let inside_fence = |at: usize| fences.iter().any(|&(s, e)| s <= at && at < e);
    let ticks: Vec<usize> = text
        .match_indices('`')
        .map(|(i, _)| i)
        .filter(|&i| !inside_fence(i))
        .collect();
    for pair in ticks.chunks(2) {
        if let [open, close] = pair {
            zones.push(ZoneSpan {
                zone: Zone::InlineCode,
                start: *open,
                end: close + 1,
            });
        }
    }

    // Quoted lines.
    let mut offset = 0;
    for line in text.split_inclusive('\n') {
        if line.trim_start().starts_with('>') {
            zones.push(ZoneSpan {
                zone: Zone::Quote,
                start: offset,
                end: offset + line.len(),
            });
        }
        offset += line.len();
    }

    zones
}
