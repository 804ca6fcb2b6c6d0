//! Digest compiler: turns library snapshots into merged, exported event records.

use serde::Serialize;

pub mod compile;
pub mod export;
pub mod merge;
pub mod normalize;

pub use compile::{CompileOptions, CompileReport, DigestCompiler, DigestOutputs};
pub use export::{
    render_ics, write_ics, write_parquet_snapshots, write_xlsx, CalendarEntry, CalendarTime,
    DigestExporter, DigestTables, EventRow, SourceRow,
};
pub use merge::{MergeConfig, MergeReviewItem, MergedDigest, Merger};
pub use normalize::{normalize, CategoryRule, CategoryRules, NormalizationError};

pub const CRATE_NAME: &str = "pogo-digest";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureStage {
    Snapshot,
    UnknownSource,
    Extraction,
    Normalization,
}

/// A library page that produced no event record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CompileFailure {
    pub source_id: String,
    pub slug: String,
    pub url: String,
    pub stage: FailureStage,
    pub reason: String,
}
