//! Source extractor contracts, the Graph API and CSV export extractors, and the record normalizer.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, Offset, Utc};
use pagesync_core::Source;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

mod csv_export;
mod graph;
mod normalize;

pub use csv_export::{CsvExtractor, CsvExtractorConfig, REQUIRED_COLUMNS};
pub use graph::{ApiExtractor, ApiExtractorConfig, DEFAULT_GRAPH_BASE_URL, DEFAULT_GRAPH_VERSION};
pub use normalize::{normalize, parse_count, parse_timestamp};

pub const CRATE_NAME: &str = "pagesync-adapters";

/// Which Graph edge an API object was pulled from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApiEdge {
    Posts,
    VideoReels,
}

/// One Graph JSON object (post or reel) as returned by the API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiPost {
    pub edge: ApiEdge,
    pub observed_at: DateTime<Utc>,
    pub body: JsonValue,
}

/// One export row keyed by its (trimmed) header names.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CsvRow {
    pub file: String,
    pub line: u64,
    pub observed_at: DateTime<Utc>,
    pub columns: BTreeMap<String, String>,
}

impl CsvRow {
    /// First non-blank value among `names`, compared case-insensitively.
    pub fn get(&self, names: &[&str]) -> Option<&str> {
        names.iter().find_map(|name| {
            self.columns
                .iter()
                .find(|(key, _)| key.eq_ignore_ascii_case(name))
                .map(|(_, value)| value.trim())
                .filter(|value| !value.is_empty())
        })
    }

    pub fn location(&self) -> String {
        format!("{}:{}", self.file, self.line)
    }
}

/// Raw record handed from an extractor to the normalizer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RawRecord {
    Api(ApiPost),
    Csv(CsvRow),
}

impl RawRecord {
    pub fn source(&self) -> Source {
        match self {
            RawRecord::Api(_) => Source::Api,
            RawRecord::Csv(_) => Source::Csv,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizeContext {
    pub page_id: String,
    /// Offset applied to timestamps that carry none.
    pub naive_offset: FixedOffset,
}

impl NormalizeContext {
    pub fn new(page_id: impl Into<String>) -> Self {
        Self {
            page_id: page_id.into(),
            naive_offset: Utc.fix(),
        }
    }

    pub fn with_offset(mut self, offset: FixedOffset) -> Self {
        self.naive_offset = offset;
        self
    }
}

/// Raw bytes pulled from a source, kept for the per-run archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawPayload {
    pub source: Source,
    pub label: String,
    pub extension: &'static str,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, Default)]
pub struct ExtractOutput {
    pub records: Vec<RawRecord>,
    /// Page metadata and videos, passed through for the dashboard.
    pub page_snapshot: Option<JsonValue>,
    pub payloads: Vec<RawPayload>,
    /// Rows dropped before normalization (e.g. another page's rows).
    pub filtered: usize,
}

#[derive(Debug, Error)]
#[error("{source_name} source unavailable: {reason}")]
pub struct SourceUnavailableError {
    pub source_name: Source,
    pub reason: String,
}

impl SourceUnavailableError {
    pub fn new(source: Source, reason: impl Into<String>) -> Self {
        Self {
            source_name: source,
            reason: reason.into(),
        }
    }
}

#[async_trait]
pub trait SourceExtractor: Send + Sync {
    fn source(&self) -> Source;

    async fn extract(&self) -> Result<ExtractOutput, SourceUnavailableError>;
}
