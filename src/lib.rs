//! saltmine: mines the public GitHub event archive for profanity/anger
//! utterances, with consent-gated identity.
//!
//! The backfill lane walks UTC hours through fetch, extract, normalize,
//! detect and columnar writes; the hallmonitor lane maintains repo/actor
//! metadata through a rate-limited REST client; the bouncer lane verifies
//! consent challenges that gate identifying labels.

pub mod archive;
pub mod backfill;
pub mod cancel;
pub mod cli;
pub mod clock;
pub mod config;
pub mod consent;
pub mod detect;
pub mod error;
pub mod extract;
pub mod github;
pub mod hallmonitor;
pub mod hid;
pub mod hour;
pub mod normalize;
pub mod storage;

// Re-export commonly used error types
pub use error::{
    ArchiveError, ConfigError, DbErrorKind, FactsError, GithubError, RulepackError, StoreError,
};
