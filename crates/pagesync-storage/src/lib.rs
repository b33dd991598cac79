//! Canonical store, raw artifact archive and Graph API fetch utilities for pagesync.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use pagesync_core::{
    sort_canonical, Field, Metric, NormalizedPost, PostRecord, PostType, ReconcileOutcome,
    Reconciler, Source, SourceMask, Stamp,
};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "pagesync-storage";

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("reading {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{path} line {line}: {message}")]
    Corrupt {
        path: PathBuf,
        line: u64,
        message: String,
    },
    #[error("encoding canonical table: {0}")]
    Encode(String),
    #[error("writing {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Replace `path` with `bytes` via a sibling temp file, fsync and rename.
///
/// Readers only ever observe the previous file or the complete new one.
pub async fn write_atomically(path: &Path, bytes: &[u8]) -> Result<(), PersistenceError> {
    let write_err = |source| PersistenceError::Write {
        path: path.to_path_buf(),
        source,
    };
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&parent).await.map_err(write_err)?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let written = async {
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await?;
        file.write_all(bytes).await?;
        file.flush().await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&temp_path, path).await
    }
    .await;

    if let Err(err) = written {
        let _ = fs::remove_file(&temp_path).await;
        return Err(write_err(err));
    }
    Ok(())
}

const HEADER: [&str; 29] = [
    "id",
    "created_at",
    "post_type",
    "post_type_source",
    "message",
    "message_source",
    "permalink",
    "permalink_source",
    "source_mask",
    "reactions_total",
    "comments",
    "shares",
    "views",
    "reach",
    "impressions",
    "like",
    "love",
    "haha",
    "wow",
    "sad",
    "angry",
    "reactions_total_source",
    "reactions_total_observed_at",
    "comments_source",
    "comments_observed_at",
    "shares_source",
    "shares_observed_at",
    "csv_observed_at",
    "api_observed_at",
];

/// Flattened persisted row. Empty cells mean "unknown"; `0` is an observed zero.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct StoredRow {
    id: String,
    created_at: DateTime<Utc>,
    post_type: PostType,
    post_type_source: Option<Source>,
    message: Option<String>,
    message_source: Option<Source>,
    permalink: Option<String>,
    permalink_source: Option<Source>,
    source_mask: SourceMask,
    reactions_total: Option<u64>,
    comments: Option<u64>,
    shares: Option<u64>,
    views: Option<u64>,
    reach: Option<u64>,
    impressions: Option<u64>,
    like: Option<u64>,
    love: Option<u64>,
    haha: Option<u64>,
    wow: Option<u64>,
    sad: Option<u64>,
    angry: Option<u64>,
    reactions_total_source: Option<Source>,
    reactions_total_observed_at: Option<DateTime<Utc>>,
    comments_source: Option<Source>,
    comments_observed_at: Option<DateTime<Utc>>,
    shares_source: Option<Source>,
    shares_observed_at: Option<DateTime<Utc>>,
    csv_observed_at: Option<DateTime<Utc>>,
    api_observed_at: Option<DateTime<Utc>>,
}

fn stamp_parts(record: &PostRecord, metric: Metric) -> (Option<Source>, Option<DateTime<Utc>>) {
    record
        .shared_stamps
        .get(&metric)
        .map(|s| (Some(s.source), Some(s.observed_at)))
        .unwrap_or((None, None))
}

fn field_from_parts(value: Option<String>, source: Option<Source>) -> Field<String> {
    match value {
        Some(v) if !v.is_empty() => Field { value: Some(v), source },
        _ => Field::empty(),
    }
}

impl From<&PostRecord> for StoredRow {
    fn from(record: &PostRecord) -> Self {
        let m = |metric| record.metric(metric);
        let (reactions_total_source, reactions_total_observed_at) =
            stamp_parts(record, Metric::ReactionsTotal);
        let (comments_source, comments_observed_at) = stamp_parts(record, Metric::Comments);
        let (shares_source, shares_observed_at) = stamp_parts(record, Metric::Shares);
        Self {
            id: record.id.clone(),
            created_at: record.created_at,
            post_type: record.post_type,
            post_type_source: record.post_type_source,
            message: record.message.value.clone(),
            message_source: record.message.value.as_ref().and(record.message.source),
            permalink: record.permalink.value.clone(),
            permalink_source: record.permalink.value.as_ref().and(record.permalink.source),
            source_mask: record.source_mask,
            reactions_total: m(Metric::ReactionsTotal),
            comments: m(Metric::Comments),
            shares: m(Metric::Shares),
            views: m(Metric::Views),
            reach: m(Metric::Reach),
            impressions: m(Metric::Impressions),
            like: m(Metric::Like),
            love: m(Metric::Love),
            haha: m(Metric::Haha),
            wow: m(Metric::Wow),
            sad: m(Metric::Sad),
            angry: m(Metric::Angry),
            reactions_total_source,
            reactions_total_observed_at,
            comments_source,
            comments_observed_at,
            shares_source,
            shares_observed_at,
            csv_observed_at: record.csv_observed_at,
            api_observed_at: record.api_observed_at,
        }
    }
}

impl From<StoredRow> for PostRecord {
    fn from(row: StoredRow) -> Self {
        let values = [
            (Metric::ReactionsTotal, row.reactions_total),
            (Metric::Comments, row.comments),
            (Metric::Shares, row.shares),
            (Metric::Views, row.views),
            (Metric::Reach, row.reach),
            (Metric::Impressions, row.impressions),
            (Metric::Like, row.like),
            (Metric::Love, row.love),
            (Metric::Haha, row.haha),
            (Metric::Wow, row.wow),
            (Metric::Sad, row.sad),
            (Metric::Angry, row.angry),
        ];
        let metrics = values
            .into_iter()
            .filter_map(|(metric, value)| value.map(|v| (metric, v)))
            .collect();

        let mut shared_stamps = BTreeMap::new();
        for (metric, source, observed_at) in [
            (Metric::ReactionsTotal, row.reactions_total_source, row.reactions_total_observed_at),
            (Metric::Comments, row.comments_source, row.comments_observed_at),
            (Metric::Shares, row.shares_source, row.shares_observed_at),
        ] {
            if let (Some(source), Some(observed_at)) = (source, observed_at) {
                shared_stamps.insert(metric, Stamp { source, observed_at });
            }
        }

        PostRecord {
            id: row.id,
            created_at: row.created_at,
            post_type: row.post_type,
            post_type_source: row.post_type_source,
            message: field_from_parts(row.message, row.message_source),
            permalink: field_from_parts(row.permalink, row.permalink_source),
            metrics,
            shared_stamps,
            source_mask: row.source_mask,
            csv_observed_at: row.csv_observed_at,
            api_observed_at: row.api_observed_at,
        }
    }
}

/// Serialize records into the canonical table layout, header included.
pub fn encode_table(records: &[PostRecord]) -> Result<Vec<u8>, PersistenceError> {
    let mut sorted = records.to_vec();
    sort_canonical(&mut sorted);

    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(Vec::new());
    writer
        .write_record(HEADER)
        .map_err(|e| PersistenceError::Encode(e.to_string()))?;
    for record in &sorted {
        writer
            .serialize(StoredRow::from(record))
            .map_err(|e| PersistenceError::Encode(format!("record {}: {e}", record.id)))?;
    }
    writer
        .into_inner()
        .map_err(|e| PersistenceError::Encode(e.to_string()))
}

/// Parse a canonical table. `path` is only used for error context.
pub fn decode_table(path: &Path, bytes: &[u8]) -> Result<Vec<PostRecord>, PersistenceError> {
    let corrupt = |line: u64, message: String| PersistenceError::Corrupt {
        path: path.to_path_buf(),
        line,
        message,
    };
    if bytes.is_empty() {
        return Ok(Vec::new());
    }

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .from_reader(bytes);
    let header = reader.headers().map_err(|e| corrupt(1, e.to_string()))?;
    if !header.iter().eq(HEADER.iter().copied()) {
        return Err(corrupt(1, "unexpected header".to_string()));
    }

    let mut records = Vec::new();
    for row in reader.deserialize::<StoredRow>() {
        let row = row.map_err(|e| {
            let line = e.position().map(|p| p.line()).unwrap_or(0);
            corrupt(line, e.to_string())
        })?;
        records.push(PostRecord::from(row));
    }
    Ok(records)
}

/// The single persisted table the dashboard reads.
#[derive(Debug, Clone)]
pub struct CanonicalStore {
    path: PathBuf,
    reconciler: Reconciler,
}

impl CanonicalStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            reconciler: Reconciler::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Last successful snapshot; a store that was never written is empty.
    pub async fn load(&self) -> Result<Vec<PostRecord>, PersistenceError> {
        let bytes = match fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(PersistenceError::Read {
                    path: self.path.clone(),
                    source,
                })
            }
        };
        decode_table(&self.path, &bytes)
    }

    pub async fn save(&self, records: &[PostRecord]) -> Result<(), PersistenceError> {
        let bytes = encode_table(records)?;
        write_atomically(&self.path, &bytes).await?;
        info!(path = %self.path.display(), records = records.len(), "canonical store saved");
        Ok(())
    }

    /// Reconcile `batch` into the stored snapshot and persist the result.
    pub async fn upsert(&self, batch: Vec<NormalizedPost>) -> Result<ReconcileOutcome, PersistenceError> {
        let existing = self.load().await?;
        let outcome = self.reconciler.apply(existing, batch);
        let exists = fs::try_exists(&self.path).await.unwrap_or(false);
        if outcome.dirty || !exists {
            self.save(&outcome.records).await?;
        } else {
            debug!(path = %self.path.display(), "no record changed; snapshot left untouched");
        }
        Ok(outcome)
    }
}

#[derive(Debug, Clone)]
pub struct StoredArtifact {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

/// Hash-addressed archive of raw extractor payloads.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub fn artifact_relative_path(
        &self,
        fetched_at: DateTime<Utc>,
        source: Source,
        content_hash: &str,
        extension: &str,
    ) -> PathBuf {
        let stamp = fetched_at.format("%Y%m%d_%H%M%S").to_string();
        let ext = extension.trim_start_matches('.').trim();
        let ext = if ext.is_empty() { "bin" } else { ext };
        PathBuf::from(stamp)
            .join(source.as_str())
            .join(format!("{content_hash}.{ext}"))
    }

    pub async fn archive(
        &self,
        fetched_at: DateTime<Utc>,
        source: Source,
        extension: &str,
        bytes: &[u8],
    ) -> anyhow::Result<StoredArtifact> {
        let content_hash = Self::sha256_hex(bytes);
        let relative_path = self.artifact_relative_path(fetched_at, source, &content_hash, extension);
        let absolute_path = self.root.join(&relative_path);

        let deduplicated = fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking artifact path {}", absolute_path.display()))?;
        if !deduplicated {
            write_atomically(&absolute_path, bytes)
                .await
                .with_context(|| format!("archiving {}", absolute_path.display()))?;
        }

        Ok(StoredArtifact {
            content_hash,
            relative_path,
            absolute_path,
            byte_size: bytes.len(),
            deduplicated,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// Graph error codes for throttling and transient backend failures.
pub fn classify_graph_code(code: i64) -> RetryDisposition {
    match code {
        1 | 2 | 4 | 17 | 32 | 341 | 613 => RetryDisposition::Retryable,
        _ => RetryDisposition::NonRetryable,
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
    /// Pause before every request after the first, to stay under page-level rate limits.
    pub request_spacing: Duration,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            backoff: BackoffPolicy::default(),
            request_spacing: Duration::from_millis(200),
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {endpoint} failed: {source}")]
    Request {
        endpoint: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("graph error from {endpoint} (http {status}, code {code:?}): {message}")]
    Graph {
        endpoint: String,
        status: u16,
        code: Option<i64>,
        message: String,
    },
    #[error("undecodable body from {endpoint}: {message}")]
    Decode { endpoint: String, message: String },
}

impl FetchError {
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            FetchError::Request { source, .. } => classify_reqwest_error(source),
            FetchError::Graph { status, code, .. } => {
                let by_status = StatusCode::from_u16(*status)
                    .map(classify_status)
                    .unwrap_or(RetryDisposition::NonRetryable);
                let by_code = code
                    .map(classify_graph_code)
                    .unwrap_or(RetryDisposition::NonRetryable);
                if by_status == RetryDisposition::Retryable || by_code == RetryDisposition::Retryable {
                    RetryDisposition::Retryable
                } else {
                    RetryDisposition::NonRetryable
                }
            }
            FetchError::Decode { .. } => RetryDisposition::NonRetryable,
        }
    }
}

/// URL with its query string removed, safe to log (paging URLs embed the access token).
pub fn redact_endpoint(url: &str) -> String {
    url.split(['?', '#']).next().unwrap_or_default().to_string()
}

/// URL with its `access_token` query pair removed; other parameters are kept.
pub fn strip_access_token(url: &str) -> String {
    let Ok(mut parsed) = reqwest::Url::parse(url) else {
        return redact_endpoint(url);
    };
    let kept: Vec<(String, String)> = parsed
        .query_pairs()
        .filter(|(key, _)| key != "access_token")
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .collect();
    if kept.is_empty() {
        parsed.set_query(None);
    } else {
        parsed.query_pairs_mut().clear().extend_pairs(kept);
    }
    parsed.to_string()
}

#[derive(Debug, Deserialize)]
struct GraphErrorEnvelope {
    error: GraphErrorBody,
}

#[derive(Debug, Deserialize)]
struct GraphErrorBody {
    #[serde(default)]
    message: String,
    #[serde(default)]
    code: Option<i64>,
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    backoff: BackoffPolicy,
    request_spacing: Duration,
    sent: std::sync::atomic::AtomicUsize,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            backoff: config.backoff,
            request_spacing: config.request_spacing,
            sent: std::sync::atomic::AtomicUsize::new(0),
        })
    }

    /// GET a Graph endpoint and decode the JSON body, retrying transient failures.
    pub async fn get_json(&self, url: &str, query: &[(&str, String)]) -> Result<JsonValue, FetchError> {
        let endpoint = redact_endpoint(url);
        let span = info_span!("graph_get", endpoint = %endpoint);
        self.get_json_with_retries(url, query, &endpoint)
            .instrument(span)
            .await
    }

    async fn get_json_with_retries(
        &self,
        url: &str,
        query: &[(&str, String)],
        endpoint: &str,
    ) -> Result<JsonValue, FetchError> {
        let mut attempt = 0;
        loop {
            match self.get_json_once(url, query, endpoint).await {
                Ok(value) => return Ok(value),
                Err(err)
                    if err.disposition() == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries =>
                {
                    let delay = self.backoff.delay_for_attempt(attempt);
                    warn!(attempt = attempt + 1, delay_ms = delay.as_millis() as u64, error = %err, "transient graph failure; backing off");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn get_json_once(
        &self,
        url: &str,
        query: &[(&str, String)],
        endpoint: &str,
    ) -> Result<JsonValue, FetchError> {
        let previous = self
            .sent
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        if previous > 0 && !self.request_spacing.is_zero() {
            tokio::time::sleep(self.request_spacing).await;
        }

        let request_err = |source: reqwest::Error| FetchError::Request {
            endpoint: endpoint.to_string(),
            source: source.without_url(),
        };
        let resp = self
            .client
            .get(url)
            .query(query)
            .send()
            .await
            .map_err(request_err)?;
        let status = resp.status();
        let body = resp.bytes().await.map_err(request_err)?;

        let value: Option<JsonValue> = serde_json::from_slice(&body).ok();
        let graph_error = value
            .as_ref()
            .filter(|v| v.get("error").is_some())
            .and_then(|v| serde_json::from_value::<GraphErrorEnvelope>(v.clone()).ok());

        if let Some(envelope) = graph_error {
            return Err(FetchError::Graph {
                endpoint: endpoint.to_string(),
                status: status.as_u16(),
                code: envelope.error.code,
                message: envelope.error.message,
            });
        }
        if !status.is_success() {
            return Err(FetchError::Graph {
                endpoint: endpoint.to_string(),
                status: status.as_u16(),
                code: None,
                message: format!("http status {status}"),
            });
        }
        value.ok_or_else(|| FetchError::Decode {
            endpoint: endpoint.to_string(),
            message: format!("{} bytes of non-JSON body", body.len()),
        })
    }
}
