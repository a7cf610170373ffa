//! Process-wide configuration, read once from the environment.
//!
//! Backing-service settings use the `SERVICE_*` namespace and pipeline
//! behavior the `CORE_*` namespace. Everything has a sane default except the
//! two database URLs, which are required.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::ConfigError;

/// Default on-disk location for cached archive hours.
const DEFAULT_CACHE_DIR: &str = "./archive-cache";

/// Default per-batch row ceiling for columnar flushes.
const DEFAULT_BATCH_ROWS: usize = 2000;

/// Default per-batch byte ceiling for columnar flushes.
const DEFAULT_BATCH_BYTES: usize = 8 * 1024 * 1024;

/// Postgres control-plane settings.
#[derive(Debug, Clone)]
pub struct PgConfig {
    /// Connection URL (`SERVICE_PGSQL_DBURL`).
    pub url: String,
    /// Pool size ceiling (`SERVICE_PGSQL_MAX_CONNS`).
    pub max_conns: u32,
    /// Queries slower than this are logged at warn (`SERVICE_PGSQL_SLOW_MS`).
    pub slow_ms: u64,
    /// Log every statement at debug (`SERVICE_PGSQL_LOG_SQL`).
    pub log_sql: bool,
}

/// ClickHouse facts-store settings.
#[derive(Debug, Clone)]
pub struct ClickhouseConfig {
    /// HTTP endpoint URL (`SERVICE_CLICKHOUSE_DBURL`).
    pub url: String,
    /// Log every statement at debug (`SERVICE_CLICKHOUSE_LOG_SQL`).
    pub log_sql: bool,
    /// Rows per insert chunk.
    pub chunk_size: usize,
    /// Bounded insert retries.
    pub max_retries: u32,
}

/// Archive cache settings.
#[derive(Debug, Clone)]
pub struct ArchiveConfig {
    /// Directory holding `<stem>.json.gz` files and their sidecars.
    pub cache_dir: PathBuf,
    /// Hours within this window of now are revalidated with a conditional GET.
    pub refresh_recent: Duration,
    /// Cached files older than this are deleted by retention.
    pub retain_max_age: Duration,
    /// Total cache size ceiling; oldest hours are deleted first beyond it.
    pub retain_max_bytes: u64,
}

/// Backfill pipeline settings.
#[derive(Debug, Clone)]
pub struct BackfillConfig {
    /// Run the detector and write hits (`CORE_BACKFILL_DETECT`).
    pub detect: bool,
    /// Detector version stamped on hits (`CORE_DETECT_VERSION`).
    pub detect_version: i32,
    /// Flush a batch at this many utterance rows.
    pub batch_rows: usize,
    /// Flush a batch at this many accumulated text bytes.
    pub batch_bytes: usize,
}

/// Upstream REST client settings.
#[derive(Debug, Clone)]
pub struct GithubConfig {
    /// Personal access tokens, rotated per request (`SERVICE_GITHUB_TOKENS`).
    pub tokens: Vec<String>,
    /// User-Agent header sent on every request.
    pub user_agent: String,
    /// Bounded retries per logical request.
    pub max_retries: u32,
}

/// Hallmonitor worker settings.
#[derive(Debug, Clone)]
pub struct HallmonitorConfig {
    /// Number of worker tasks.
    pub num_workers: usize,
    /// Rows leased per poll.
    pub lease_batch: i64,
    /// How far each lease pushes `next_attempt_at` forward.
    pub lease_for: Duration,
    /// Base of the nack backoff curve.
    pub backoff_base: Duration,
    /// Sleep when both queues are drained.
    pub idle_sleep: Duration,
    /// A repo pushed within this window refreshes sooner than its band.
    pub push_min: Duration,
}

/// Complete process configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub pg: PgConfig,
    pub clickhouse: ClickhouseConfig,
    pub archive: ArchiveConfig,
    pub backfill: BackfillConfig,
    pub github: GithubConfig,
    pub hallmonitor: HallmonitorConfig,
}

impl Config {
    /// Reads the full configuration from the environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            pg: PgConfig {
                url: require("SERVICE_PGSQL_DBURL")?,
                max_conns: parse_or("SERVICE_PGSQL_MAX_CONNS", 10)?,
                slow_ms: parse_or("SERVICE_PGSQL_SLOW_MS", 250)?,
                log_sql: flag_or("SERVICE_PGSQL_LOG_SQL", false)?,
            },
            clickhouse: ClickhouseConfig {
                url: require("SERVICE_CLICKHOUSE_DBURL")?,
                log_sql: flag_or("SERVICE_CLICKHOUSE_LOG_SQL", false)?,
                chunk_size: parse_or("CORE_FACTS_CHUNK_SIZE", 1000)?,
                max_retries: parse_or("CORE_FACTS_MAX_RETRIES", 5)?,
            },
            archive: ArchiveConfig {
                cache_dir: PathBuf::from(
                    std::env::var("CORE_ARCHIVE_CACHE_DIR")
                        .unwrap_or_else(|_| DEFAULT_CACHE_DIR.to_string()),
                ),
                refresh_recent: Duration::from_secs(
                    parse_or::<u64>("CORE_ARCHIVE_REFRESH_RECENT_HOURS", 48)? * 3600,
                ),
                retain_max_age: Duration::from_secs(
                    parse_or::<u64>("CORE_ARCHIVE_RETAIN_MAX_AGE_DAYS", 30)? * 86400,
                ),
                retain_max_bytes: parse_or("CORE_ARCHIVE_RETAIN_MAX_BYTES", 50 * 1024 * 1024 * 1024)?,
            },
            backfill: BackfillConfig {
                detect: flag_or("CORE_BACKFILL_DETECT", false)?,
                detect_version: parse_or("CORE_DETECT_VERSION", 1)?,
                batch_rows: parse_or("CORE_BACKFILL_BATCH_ROWS", DEFAULT_BATCH_ROWS)?,
                batch_bytes: parse_or("CORE_BACKFILL_BATCH_BYTES", DEFAULT_BATCH_BYTES)?,
            },
            github: GithubConfig {
                tokens: token_list(std::env::var("SERVICE_GITHUB_TOKENS").ok()),
                user_agent: std::env::var("CORE_USER_AGENT")
                    .unwrap_or_else(|_| format!("saltmine/{}", env!("CARGO_PKG_VERSION"))),
                max_retries: parse_or("CORE_GITHUB_MAX_RETRIES", 5)?,
            },
            hallmonitor: HallmonitorConfig {
                num_workers: parse_or("CORE_HALLMONITOR_WORKERS", 4)?,
                lease_batch: parse_or("CORE_HALLMONITOR_LEASE_BATCH", 20)?,
                lease_for: Duration::from_secs(parse_or("CORE_HALLMONITOR_LEASE_SECS", 120)?),
                backoff_base: Duration::from_secs(parse_or("CORE_HALLMONITOR_BACKOFF_SECS", 5)?),
                idle_sleep: Duration::from_secs(parse_or("CORE_HALLMONITOR_IDLE_SECS", 5)?),
                push_min: Duration::from_secs(
                    parse_or::<u64>("CORE_HALLMONITOR_PUSH_MIN_DAYS", 2)? * 86400,
                ),
            },
        })
    }
}

fn require(key: &str) -> Result<String, ConfigError> {
    std::env::var(key).map_err(|_| ConfigError::MissingEnvVar(key.to_string()))
}

fn parse_or<T: std::str::FromStr>(key: &str, default: T) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse().map_err(|e| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("{}", e),
        }),
        Err(_) => Ok(default),
    }
}

/// Accepts `1`/`0` plus the usual boolean spellings.
fn flag_or(key: &str, default: bool) -> Result<bool, ConfigError> {
    match std::env::var(key) {
        Ok(raw) => match raw.trim() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" | "" => Ok(false),
            other => Err(ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("expected 0/1, got '{}'", other),
            }),
        },
        Err(_) => Ok(default),
    }
}

fn token_list(raw: Option<String>) -> Vec<String> {
    raw.map(|s| {
        s.split(',')
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .collect()
    })
    .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_list_splits_and_trims() {
        let tokens = token_list(Some(" ghp_a , ghp_b,,ghp_c ".to_string()));
        assert_eq!(tokens, vec!["ghp_a", "ghp_b", "ghp_c"]);
        assert!(token_list(None).is_empty());
        assert!(token_list(Some("".to_string())).is_empty());
    }

    #[test]
    fn flag_spellings() {
        std::env::set_var("SALTMINE_TEST_FLAG_A", "1");
        assert!(flag_or("SALTMINE_TEST_FLAG_A", false).unwrap());
        std::env::set_var("SALTMINE_TEST_FLAG_A", "off");
        assert!(!flag_or("SALTMINE_TEST_FLAG_A", true).unwrap());
        std::env::set_var("SALTMINE_TEST_FLAG_A", "maybe");
        assert!(flag_or("SALTMINE_TEST_FLAG_A", false).is_err());
        std::env::remove_var("SALTMINE_TEST_FLAG_A");
        assert!(flag_or("SALTMINE_TEST_FLAG_A", true).unwrap());
    }

    #[test]
    fn parse_or_defaults_when_unset() {
        assert_eq!(parse_or("SALTMINE_TEST_UNSET_U64", 42u64).unwrap(), 42);
    }
}
