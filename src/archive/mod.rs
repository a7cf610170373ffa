//! Hourly archive acquisition: fetcher, revalidating disk cache, line reader.

pub mod cache;
pub mod fetch;
pub mod reader;

pub use cache::{ArchiveCache, CacheMeta, RetentionPolicy};
pub use fetch::{FetchOutcome, HourFetcher, HttpHourFetcher, Validators};
pub use reader::{EventReader, ReaderStats};
