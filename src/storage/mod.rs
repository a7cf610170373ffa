//! Persistence: the relational control plane and the columnar facts store.

pub mod catalog;
pub mod database;
pub mod facts;
pub mod hours;
pub mod migrations;
pub mod schema;

pub use catalog::{ActorRecord, CatalogState, CatalogStore, RepoRecord, SubjectKind};
pub use database::Database;
pub use facts::{FactsStore, HitRow, IngestBatch, InsertReport, UtteranceRef, UtteranceRow};
pub use hours::{HourFinish, HourRow, HourStatus, HourStore};
pub use migrations::apply_control_schema;
