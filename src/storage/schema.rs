//! Schema constants for the relational control plane and the columnar
//! facts store.
//!
//! Control-plane tables live in PostgreSQL; facts live in ClickHouse under
//! a ReplacingMergeTree engine keyed by `ver`, so replays collapse on merge.
//! The CHECK constraints on principal and catalog tables repeat the consent
//! gate's rule: identifying columns may only be non-NULL alongside a
//! `consent_id`.

/// Per-hour ingestion progress.
pub const CREATE_INGEST_HOURS: &str = r#"
CREATE TABLE IF NOT EXISTS ingest_hours (
    hour_utc TIMESTAMPTZ PRIMARY KEY,
    status TEXT NOT NULL CHECK (status IN ('running', 'ok', 'error')),
    started_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    finished_at TIMESTAMPTZ,
    events_scanned BIGINT NOT NULL DEFAULT 0,
    events_malformed BIGINT NOT NULL DEFAULT 0,
    lines_oversize BIGINT NOT NULL DEFAULT 0,
    utterances BIGINT NOT NULL DEFAULT 0,
    utterances_deduped BIGINT NOT NULL DEFAULT 0,
    hits BIGINT NOT NULL DEFAULT 0,
    bytes_read BIGINT NOT NULL DEFAULT 0,
    fetch_ms BIGINT NOT NULL DEFAULT 0,
    read_ms BIGINT NOT NULL DEFAULT 0,
    db_ms BIGINT NOT NULL DEFAULT 0,
    detect_ms BIGINT NOT NULL DEFAULT 0,
    error_text TEXT,
    CHECK (finished_at IS NULL OR started_at <= finished_at)
)
"#;

/// Consent receipts: the audit trail the effective state derives from.
pub const CREATE_CONSENT_RECEIPTS: &str = r#"
CREATE TABLE IF NOT EXISTS consent_receipts (
    id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
    principal TEXT NOT NULL CHECK (principal IN ('repo', 'actor')),
    principal_hid BYTEA NOT NULL CHECK (octet_length(principal_hid) = 32),
    action TEXT NOT NULL CHECK (action IN ('opt_in', 'opt_out')),
    state TEXT NOT NULL CHECK (state IN ('pending', 'active', 'revocation_pending', 'revoked')),
    evidence_kind TEXT CHECK (evidence_kind IN ('repo_file', 'gist_file')),
    challenge_hash TEXT,
    issued_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    verified_at TIMESTAMPTZ
)
"#;

/// Minimal repo principal rows; labels are gated on consent.
pub const CREATE_PRINCIPALS_REPOS: &str = r#"
CREATE TABLE IF NOT EXISTS principals_repos (
    repo_hid BYTEA PRIMARY KEY CHECK (octet_length(repo_hid) = 32),
    label_explicit TEXT,
    consent_id UUID REFERENCES consent_receipts(id),
    CHECK (label_explicit IS NULL OR consent_id IS NOT NULL)
)
"#;

/// Minimal actor principal rows; labels are gated on consent.
pub const CREATE_PRINCIPALS_ACTORS: &str = r#"
CREATE TABLE IF NOT EXISTS principals_actors (
    actor_hid BYTEA PRIMARY KEY CHECK (octet_length(actor_hid) = 32),
    label_explicit TEXT,
    consent_id UUID REFERENCES consent_receipts(id),
    CHECK (label_explicit IS NULL OR consent_id IS NOT NULL)
)
"#;

/// Leased consent verification jobs.
pub const CREATE_CONSENT_VERIFICATIONS: &str = r#"
CREATE TABLE IF NOT EXISTS consent_verifications (
    id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
    receipt_id UUID NOT NULL REFERENCES consent_receipts(id),
    subject_type TEXT NOT NULL CHECK (subject_type IN ('repo_file', 'gist_file')),
    subject_key TEXT NOT NULL,
    principal_hid BYTEA NOT NULL CHECK (octet_length(principal_hid) = 32),
    challenge_hash TEXT NOT NULL,
    attempts INTEGER NOT NULL DEFAULT 0,
    last_status INTEGER,
    last_url TEXT,
    etag_branch TEXT,
    etag_file TEXT,
    etag_gists TEXT,
    rate_reset_at TIMESTAMPTZ,
    next_attempt_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    lease_expires TIMESTAMPTZ,
    leased_by TEXT
)
"#;

/// Repo metadata refresh queue.
pub const CREATE_REPO_CATALOG_QUEUE: &str = r#"
CREATE TABLE IF NOT EXISTS repo_catalog_queue (
    subject_hid BYTEA PRIMARY KEY CHECK (octet_length(subject_hid) = 32),
    priority INTEGER NOT NULL DEFAULT 0,
    attempts INTEGER NOT NULL DEFAULT 0,
    next_attempt_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    lease_expires TIMESTAMPTZ,
    last_error TEXT,
    enqueued_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
)
"#;

/// Actor metadata refresh queue.
pub const CREATE_ACTOR_CATALOG_QUEUE: &str = r#"
CREATE TABLE IF NOT EXISTS actor_catalog_queue (
    subject_hid BYTEA PRIMARY KEY CHECK (octet_length(subject_hid) = 32),
    priority INTEGER NOT NULL DEFAULT 0,
    attempts INTEGER NOT NULL DEFAULT 0,
    next_attempt_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    lease_expires TIMESTAMPTZ,
    last_error TEXT,
    enqueued_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
)
"#;

/// Cached repository metadata, keyed by HID. Identifying columns require an
/// attached consent.
pub const CREATE_REPOSITORIES: &str = r#"
CREATE TABLE IF NOT EXISTS repositories (
    repo_hid BYTEA PRIMARY KEY CHECK (octet_length(repo_hid) = 32),
    github_id BIGINT NOT NULL,
    consent_id UUID REFERENCES consent_receipts(id),
    full_name TEXT,
    description TEXT,
    homepage TEXT,
    api_url TEXT,
    default_branch TEXT,
    language TEXT,
    stars INTEGER,
    forks INTEGER,
    open_issues INTEGER,
    is_fork BOOLEAN,
    is_archived BOOLEAN,
    pushed_at TIMESTAMPTZ,
    upstream_created_at TIMESTAMPTZ,
    upstream_updated_at TIMESTAMPTZ,
    etag TEXT,
    fetched_at TIMESTAMPTZ,
    next_refresh_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    gone_code INTEGER,
    gone_reason TEXT,
    first_seen_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    CHECK (
        (full_name IS NULL AND description IS NULL AND homepage IS NULL AND api_url IS NULL)
        OR consent_id IS NOT NULL
    )
)
"#;

/// Cached actor metadata, keyed by HID. Identifying columns require an
/// attached consent.
pub const CREATE_ACTORS: &str = r#"
CREATE TABLE IF NOT EXISTS actors (
    actor_hid BYTEA PRIMARY KEY CHECK (octet_length(actor_hid) = 32),
    github_id BIGINT NOT NULL,
    consent_id UUID REFERENCES consent_receipts(id),
    login TEXT,
    name TEXT,
    company TEXT,
    blog TEXT,
    location TEXT,
    bio TEXT,
    api_url TEXT,
    followers INTEGER,
    following INTEGER,
    public_repos INTEGER,
    upstream_created_at TIMESTAMPTZ,
    upstream_updated_at TIMESTAMPTZ,
    etag TEXT,
    fetched_at TIMESTAMPTZ,
    next_refresh_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    gone_code INTEGER,
    gone_reason TEXT,
    first_seen_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    CHECK (
        (login IS NULL AND name IS NULL AND company IS NULL AND blog IS NULL
         AND location IS NULL AND bio IS NULL AND api_url IS NULL)
        OR consent_id IS NOT NULL
    )
)
"#;

/// Index statements, one per entry so each runs as its own query.
pub const CREATE_INDEX_STATEMENTS: &[&str] = &[
    "CREATE INDEX IF NOT EXISTS idx_ingest_hours_status ON ingest_hours(status)",
    "CREATE INDEX IF NOT EXISTS idx_consent_receipts_principal ON consent_receipts(principal_hid, issued_at DESC)",
    "CREATE INDEX IF NOT EXISTS idx_consent_verifications_due ON consent_verifications(next_attempt_at)",
    "CREATE INDEX IF NOT EXISTS idx_repo_queue_due ON repo_catalog_queue(next_attempt_at, priority)",
    "CREATE INDEX IF NOT EXISTS idx_actor_queue_due ON actor_catalog_queue(next_attempt_at, priority)",
    "CREATE INDEX IF NOT EXISTS idx_repositories_refresh ON repositories(next_refresh_at)",
    "CREATE INDEX IF NOT EXISTS idx_actors_refresh ON actors(next_refresh_at)",
];

/// Returns all control-plane statements in dependency order.
pub fn all_schema_statements() -> Vec<&'static str> {
    let mut statements = vec![
        CREATE_INGEST_HOURS,
        CREATE_CONSENT_RECEIPTS,
        CREATE_PRINCIPALS_REPOS,
        CREATE_PRINCIPALS_ACTORS,
        CREATE_CONSENT_VERIFICATIONS,
        CREATE_REPO_CATALOG_QUEUE,
        CREATE_ACTOR_CATALOG_QUEUE,
        CREATE_REPOSITORIES,
        CREATE_ACTORS,
    ];
    statements.extend_from_slice(CREATE_INDEX_STATEMENTS);
    statements
}

/// Utterance facts table. `id` defaults server-side to a UUIDv7, and the
/// ReplacingMergeTree order key is the replay identity.
pub const CREATE_UTTERANCES: &str = r#"
CREATE TABLE IF NOT EXISTS utterances (
    id UUID DEFAULT generateUUIDv7(),
    event_id String,
    event_type LowCardinality(String),
    repo_hid FixedString(32),
    actor_hid FixedString(32),
    hid_key_version Int16,
    created_at DateTime64(3, 'UTC'),
    source Enum8('commit' = 1, 'issue' = 2, 'pr' = 3, 'comment' = 4),
    source_detail LowCardinality(String),
    ordinal Int32,
    text_raw String,
    text_normalized Nullable(String),
    lang_code Nullable(String),
    lang_confidence Nullable(Float32),
    lang_reliable UInt8 DEFAULT 0,
    sentiment_score Nullable(Float32),
    ingest_batch_id UUID,
    ver UInt64
) ENGINE = ReplacingMergeTree(ver)
ORDER BY (event_id, source, ordinal)
"#;

/// Hit facts table. The order key matches the detector ranking identity.
pub const CREATE_HITS: &str = r#"
CREATE TABLE IF NOT EXISTS hits (
    id UUID DEFAULT generateUUIDv7(),
    utterance_id UUID,
    created_at DateTime64(3, 'UTC'),
    source Enum8('commit' = 1, 'issue' = 2, 'pr' = 3, 'comment' = 4),
    repo_hid FixedString(32),
    actor_hid FixedString(32),
    lang_code Nullable(String),
    term String,
    category Enum8('bot_rage' = 1, 'tooling_rage' = 2, 'self_own' = 3, 'generic' = 4, 'lang_rage' = 5),
    severity Enum8('mild' = 1, 'strong' = 2, 'slur_masked' = 3),
    ctx_action Enum8('none' = 0, 'upgraded' = 1, 'downgraded' = 2),
    target_type Enum8('none' = 0, 'bot' = 1, 'tool' = 2, 'lang' = 3, 'framework' = 4),
    target_id String DEFAULT '',
    target_name Nullable(String),
    target_span_start Nullable(Int32),
    target_span_end Nullable(Int32),
    target_distance Nullable(Int32),
    span_start Int32,
    span_end Int32,
    detector_version Int32,
    detector_source Enum8('template' = 1, 'lemma' = 2),
    pre_context String,
    post_context String,
    zones Array(LowCardinality(String)),
    ingest_batch_id UUID,
    ver UInt64
) ENGINE = ReplacingMergeTree(ver)
ORDER BY (utterance_id, term, span_start, span_end)
"#;

/// Returns the facts-store statements.
pub fn facts_schema_statements() -> Vec<&'static str> {
    vec![CREATE_UTTERANCES, CREATE_HITS]
}

/// Table names used by runtime queries.
pub mod tables {
    /// Hour progress table.
    pub const INGEST_HOURS: &str = "ingest_hours";
    /// Repo refresh queue.
    pub const REPO_CATALOG_QUEUE: &str = "repo_catalog_queue";
    /// Actor refresh queue.
    pub const ACTOR_CATALOG_QUEUE: &str = "actor_catalog_queue";
    /// Utterance facts.
    pub const UTTERANCES: &str = "utterances";
    /// Hit facts.
    pub const HITS: &str = "hits";
}
