//! Refresh cycle orchestration: extract, normalize, reconcile, persist, report.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use pagesync_adapters::{
    normalize, ApiExtractor, CsvExtractor, CsvExtractorConfig, ExtractOutput, NormalizeContext,
    SourceExtractor,
};
use pagesync_core::{Metric, NormalizedPost, PostRecord, PostType, Source};
use pagesync_storage::{write_atomically, ArtifactStore, CanonicalStore};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tokio::fs;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

mod config;

pub use config::{RefreshConfig, DEFAULT_CONFIG_FILE};

pub const CRATE_NAME: &str = "pagesync-sync";

const SUMMARY_FILE: &str = "refresh_summary.json";
const BRIEF_FILE: &str = "refresh_brief.md";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceStatus {
    Extracted,
    /// Not configured for this run.
    Disabled,
    Unavailable,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceOutcome {
    pub source: Source,
    pub status: SourceStatus,
    pub raw_records: usize,
    pub normalized: usize,
    pub malformed: usize,
    pub filtered: usize,
    pub detail: Option<String>,
}

impl SourceOutcome {
    fn skipped(source: Source, status: SourceStatus, detail: impl Into<String>) -> Self {
        Self {
            source,
            status,
            raw_records: 0,
            normalized: 0,
            malformed: 0,
            filtered: 0,
            detail: Some(detail.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub sources: Vec<SourceOutcome>,
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    /// Raw records dropped by the normalizer.
    pub skipped: usize,
    pub store_records: usize,
    pub store_path: String,
    pub page_snapshot: Option<String>,
    pub archived_payloads: usize,
    pub reports_dir: String,
}

impl RefreshSummary {
    pub fn source(&self, source: Source) -> Option<&SourceOutcome> {
        self.sources.iter().find(|o| o.source == source)
    }

    pub fn to_markdown(&self) -> String {
        let mut lines = vec![
            "# pagesync refresh".to_string(),
            String::new(),
            format!("- Run ID: `{}`", self.run_id),
            format!("- Started: {}", self.started_at.to_rfc3339()),
            format!("- Duration: {} ms", self.duration_ms),
            format!(
                "- Posts: {} inserted, {} updated, {} unchanged, {} skipped",
                self.inserted, self.updated, self.unchanged, self.skipped
            ),
            format!("- Store: {} records in `{}`", self.store_records, self.store_path),
            String::new(),
            "## Sources".to_string(),
        ];
        for outcome in &self.sources {
            let mut line = format!(
                "- {}: {:?}, {} raw, {} normalized, {} malformed, {} filtered",
                outcome.source,
                outcome.status,
                outcome.raw_records,
                outcome.normalized,
                outcome.malformed,
                outcome.filtered
            );
            if let Some(detail) = &outcome.detail {
                line.push_str(&format!(" ({detail})"));
            }
            lines.push(line);
        }
        lines.push(String::new());
        lines.join("\n")
    }
}

/// One refresh cycle over the configured extractors.
pub struct Updater {
    config: RefreshConfig,
    extractors: Vec<Box<dyn SourceExtractor>>,
    disabled: Vec<SourceOutcome>,
    store: CanonicalStore,
    archive: Option<ArtifactStore>,
}

impl Updater {
    /// Builds the extractors the config enables; missing credentials or export paths
    /// disable that source rather than failing.
    pub fn from_config(config: RefreshConfig) -> Result<Self> {
        let mut extractors: Vec<Box<dyn SourceExtractor>> = Vec::new();
        let mut disabled = Vec::new();

        match config.api_extractor_config()? {
            Some(api) => {
                let extractor = ApiExtractor::new(api, config.http_client_config())?;
                extractors.push(Box::new(extractor));
            }
            None => disabled.push(SourceOutcome::skipped(
                Source::Api,
                SourceStatus::Disabled,
                "no access token configured",
            )),
        }

        match &config.csv_export {
            Some(path) => {
                let page_id = Some(config.page_id.trim().to_string()).filter(|p| !p.is_empty());
                extractors.push(Box::new(CsvExtractor::new(CsvExtractorConfig {
                    path: path.clone(),
                    page_id,
                })));
            }
            None => disabled.push(SourceOutcome::skipped(
                Source::Csv,
                SourceStatus::Disabled,
                "no export path configured",
            )),
        }

        let mut updater = Self::with_extractors(config, extractors);
        updater.disabled = disabled;
        Ok(updater)
    }

    pub fn with_extractors(config: RefreshConfig, extractors: Vec<Box<dyn SourceExtractor>>) -> Self {
        let store = CanonicalStore::new(config.store_path.clone());
        let archive = config.archive_dir.clone().map(ArtifactStore::new);
        Self {
            config,
            extractors,
            disabled: Vec::new(),
            store,
            archive,
        }
    }

    pub fn config(&self) -> &RefreshConfig {
        &self.config
    }

    pub async fn run_once(&self) -> Result<RefreshSummary> {
        let run_id = Uuid::new_v4();
        let span = info_span!("refresh", %run_id);
        self.run_cycle(run_id).instrument(span).await
    }

    async fn run_cycle(&self, run_id: Uuid) -> Result<RefreshSummary> {
        let started_at = Utc::now();
        let clock = Instant::now();
        let ctx = NormalizeContext::new(self.config.page_id.trim()).with_offset(self.config.naive_offset()?);

        let mut sources = self.disabled.clone();
        for outcome in &sources {
            info!(source = %outcome.source, reason = outcome.detail.as_deref().unwrap_or(""), "source disabled");
        }

        let mut batch: Vec<NormalizedPost> = Vec::new();
        let mut page_snapshot: Option<JsonValue> = None;
        let mut archived_payloads = 0usize;

        for extractor in &self.extractors {
            let source = extractor.source();
            let extracted = extractor
                .extract()
                .instrument(info_span!("extract", %source))
                .await;
            let output = match extracted {
                Ok(output) => output,
                Err(err) => {
                    warn!(%source, error = %err, "source unavailable; continuing without it");
                    sources.push(SourceOutcome::skipped(
                        source,
                        SourceStatus::Unavailable,
                        err.reason,
                    ));
                    continue;
                }
            };

            archived_payloads += self.archive_payloads(started_at, &output).await;
            if output.page_snapshot.is_some() {
                page_snapshot = output.page_snapshot.clone();
            }

            let (normalized, malformed) = normalize_all(&output, &ctx);
            info!(
                %source,
                raw = output.records.len(),
                normalized = normalized.len(),
                malformed,
                filtered = output.filtered,
                "normalize"
            );
            sources.push(SourceOutcome {
                source,
                status: SourceStatus::Extracted,
                raw_records: output.records.len(),
                normalized: normalized.len(),
                malformed,
                filtered: output.filtered,
                detail: None,
            });
            batch.extend(normalized);
        }

        let skipped: usize = sources.iter().map(|o| o.malformed).sum();
        let outcome = self
            .store
            .upsert(batch)
            .await
            .with_context(|| format!("persisting {}", self.store.path().display()))?;
        info!(
            inserted = outcome.inserted(),
            updated = outcome.updated(),
            unchanged = outcome.unchanged(),
            records = outcome.records.len(),
            "reconcile"
        );

        let page_snapshot_path = match page_snapshot {
            Some(snapshot) => {
                let bytes = serde_json::to_vec_pretty(&snapshot).context("serializing page snapshot")?;
                write_atomically(&self.config.page_snapshot_path, &bytes)
                    .await
                    .context("writing page snapshot")?;
                Some(self.config.page_snapshot_path.display().to_string())
            }
            None => None,
        };

        let reports_dir = self.config.reports_dir.join(run_id.to_string());
        let finished_at = Utc::now();
        let summary = RefreshSummary {
            run_id,
            started_at,
            finished_at,
            duration_ms: clock.elapsed().as_millis() as u64,
            sources,
            inserted: outcome.inserted(),
            updated: outcome.updated(),
            unchanged: outcome.unchanged(),
            skipped,
            store_records: outcome.records.len(),
            store_path: self.store.path().display().to_string(),
            page_snapshot: page_snapshot_path,
            archived_payloads,
            reports_dir: reports_dir.display().to_string(),
        };
        write_reports(&reports_dir, &summary).await?;
        info!(duration_ms = summary.duration_ms, reports = %summary.reports_dir, "persist");
        Ok(summary)
    }

    async fn archive_payloads(&self, fetched_at: DateTime<Utc>, output: &ExtractOutput) -> usize {
        let Some(archive) = &self.archive else {
            return 0;
        };
        let mut stored = 0;
        for payload in &output.payloads {
            match archive
                .archive(fetched_at, payload.source, payload.extension, &payload.bytes)
                .await
            {
                Ok(artifact) => {
                    stored += 1;
                    tracing::debug!(
                        label = %payload.label,
                        path = %artifact.relative_path.display(),
                        deduplicated = artifact.deduplicated,
                        "raw payload archived"
                    );
                }
                Err(err) => warn!(label = %payload.label, error = %err, "raw payload not archived"),
            }
        }
        stored
    }
}

fn normalize_all(output: &ExtractOutput, ctx: &NormalizeContext) -> (Vec<NormalizedPost>, usize) {
    let mut normalized = Vec::with_capacity(output.records.len());
    let mut malformed = 0;
    for raw in &output.records {
        match normalize(raw, ctx) {
            Ok(post) => normalized.push(post),
            Err(err) => {
                malformed += 1;
                warn!(
                    error = %err,
                    location = err.location.as_deref().unwrap_or(""),
                    "malformed record skipped"
                );
            }
        }
    }
    (normalized, malformed)
}

async fn write_reports(dir: &Path, summary: &RefreshSummary) -> Result<()> {
    fs::create_dir_all(dir)
        .await
        .with_context(|| format!("creating {}", dir.display()))?;
    let json = serde_json::to_vec_pretty(summary).context("serializing refresh summary")?;
    fs::write(dir.join(SUMMARY_FILE), json)
        .await
        .with_context(|| format!("writing {SUMMARY_FILE}"))?;
    fs::write(dir.join(BRIEF_FILE), summary.to_markdown())
        .await
        .with_context(|| format!("writing {BRIEF_FILE}"))?;
    Ok(())
}

/// Markdown digest of the most recent `runs` refresh summaries under `reports_dir`.
pub fn report_recent_markdown(reports_dir: &Path, runs: usize) -> Result<String> {
    let mut summaries = Vec::new();
    // No reports directory yet means no run has completed.
    let entries: Vec<std::fs::DirEntry> = match std::fs::read_dir(reports_dir) {
        Ok(entries) => entries.filter_map(|e| e.ok()).collect(),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Vec::new(),
        Err(err) => {
            return Err(err).with_context(|| format!("reading {}", reports_dir.display()))
        }
    };
    for entry in entries {
        let path = entry.path().join(SUMMARY_FILE);
        if !path.is_file() {
            continue;
        }
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        match serde_json::from_str::<RefreshSummary>(&text) {
            Ok(summary) => summaries.push(summary),
            Err(err) => warn!(path = %path.display(), error = %err, "unreadable refresh summary skipped"),
        }
    }
    summaries.sort_by(|a, b| b.started_at.cmp(&a.started_at));

    let mut lines = vec!["# pagesync recent refreshes".to_string(), String::new()];
    if summaries.is_empty() {
        lines.push("_no refresh runs recorded_".to_string());
    }
    for summary in summaries.into_iter().take(runs.max(1)) {
        lines.push(format!("## Run `{}`", summary.run_id));
        lines.push(format!("- started: {}", summary.started_at.to_rfc3339()));
        lines.push(format!(
            "- posts: +{} inserted, {} updated, {} unchanged, {} skipped",
            summary.inserted, summary.updated, summary.unchanged, summary.skipped
        ));
        lines.push(format!("- store records: {}", summary.store_records));
        for outcome in &summary.sources {
            lines.push(format!("- {}: {:?}", outcome.source, outcome.status));
        }
        lines.push(String::new());
    }
    Ok(lines.join("\n"))
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricStats {
    pub total: u64,
    /// Records holding a known value.
    pub reporting: usize,
}

/// Operator summary of the canonical table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub records: usize,
    pub earliest: Option<DateTime<Utc>>,
    pub latest: Option<DateTime<Utc>>,
    pub by_type: BTreeMap<PostType, usize>,
    pub by_sources: BTreeMap<String, usize>,
    pub metrics: BTreeMap<Metric, MetricStats>,
}

impl StoreStats {
    pub fn compute(records: &[PostRecord]) -> Self {
        let mut stats = StoreStats {
            records: records.len(),
            ..Default::default()
        };
        for record in records {
            stats.earliest = Some(stats.earliest.map_or(record.created_at, |e| e.min(record.created_at)));
            stats.latest = Some(stats.latest.map_or(record.created_at, |l| l.max(record.created_at)));
            *stats.by_type.entry(record.post_type).or_default() += 1;
            *stats.by_sources.entry(record.source_mask.to_string()).or_default() += 1;
            for (metric, value) in &record.metrics {
                let entry = stats.metrics.entry(*metric).or_default();
                entry.total = entry.total.saturating_add(*value);
                entry.reporting += 1;
            }
        }
        stats
    }

    pub fn to_markdown(&self) -> String {
        let day = |ts: Option<DateTime<Utc>>| {
            ts.map(|t| t.format("%Y-%m-%d").to_string())
                .unwrap_or_else(|| "-".to_string())
        };
        let mut lines = vec![
            "# pagesync store".to_string(),
            String::new(),
            format!("- records: {}", self.records),
            format!("- range: {} .. {}", day(self.earliest), day(self.latest)),
            String::new(),
            "## Post types".to_string(),
        ];
        for (post_type, count) in &self.by_type {
            lines.push(format!("- {post_type}: {count}"));
        }
        lines.push(String::new());
        lines.push("## Sources".to_string());
        for (mask, count) in &self.by_sources {
            lines.push(format!("- {mask}: {count}"));
        }
        lines.push(String::new());
        lines.push("## Metrics (known values only)".to_string());
        for metric in Metric::ALL {
            let entry = self.metrics.get(&metric).cloned().unwrap_or_default();
            lines.push(format!(
                "- {metric}: {} across {}/{} records",
                entry.total, entry.reporting, self.records
            ));
        }
        lines.push(String::new());
        lines.join("\n")
    }
}

pub async fn store_stats(store_path: impl Into<PathBuf>) -> Result<StoreStats> {
    let store = CanonicalStore::new(store_path);
    let records = store
        .load()
        .await
        .with_context(|| format!("loading {}", store.path().display()))?;
    Ok(StoreStats::compute(&records))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use async_trait::async_trait;
    use pagesync_adapters::{ApiEdge, ApiPost, CsvRow, RawPayload, RawRecord, SourceUnavailableError};
    use serde_json::json;
    use tempfile::{tempdir, TempDir};

    struct FakeExtractor {
        source: Source,
        output: std::result::Result<ExtractOutput, String>,
    }

    #[async_trait]
    impl SourceExtractor for FakeExtractor {
        fn source(&self) -> Source {
            self.source
        }

        async fn extract(&self) -> std::result::Result<ExtractOutput, SourceUnavailableError> {
            match &self.output {
                Ok(output) => Ok(output.clone()),
                Err(reason) => Err(SourceUnavailableError::new(self.source, reason.clone())),
            }
        }
    }

    fn ts(raw: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(raw).unwrap().with_timezone(&Utc)
    }

    fn csv_output() -> ExtractOutput {
        let row = |line: u64, cells: &[(&str, &str)]| {
            RawRecord::Csv(CsvRow {
                file: "export.csv".to_string(),
                line,
                observed_at: ts("2025-06-10T00:00:00Z"),
                columns: cells
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect::<BTreeMap<_, _>>(),
            })
        };
        ExtractOutput {
            records: vec![
                row(2, &[
                    ("Post ID", "1001"),
                    ("Publish time", "06/01/2025 10:00"),
                    ("Post type", "Photos"),
                    ("Title", "Grand opening"),
                    ("Reach", "500"),
                    ("Reactions", "40"),
                ]),
                row(3, &[("Post ID", "1002"), ("Publish time", "not a date")]),
            ],
            page_snapshot: None,
            payloads: vec![RawPayload {
                source: Source::Csv,
                label: "export.csv".to_string(),
                extension: "csv",
                bytes: b"Post ID,Publish time\n".to_vec(),
            }],
            filtered: 1,
        }
    }

    fn api_output() -> ExtractOutput {
        ExtractOutput {
            records: vec![RawRecord::Api(ApiPost {
                edge: ApiEdge::Posts,
                observed_at: ts("2025-06-10T06:00:00Z"),
                body: json!({
                    "id": "111_1001",
                    "created_time": "2025-06-01T10:00:00+0000",
                    "status_type": "added_photos",
                    "message": "Grand opening (api)",
                    "reactions": {"summary": {"total_count": 42}},
                    "like": {"summary": {"total_count": 30}}
                }),
            })],
            page_snapshot: Some(json!({"page": {"name": "Sample"}, "videos": []})),
            payloads: Vec::new(),
            filtered: 0,
        }
    }

    fn config(dir: &TempDir) -> RefreshConfig {
        RefreshConfig {
            page_id: "111".to_string(),
            store_path: dir.path().join("data/posts.csv"),
            page_snapshot_path: dir.path().join("data/page_info.json"),
            reports_dir: dir.path().join("reports"),
            archive_dir: Some(dir.path().join("artifacts")),
            ..RefreshConfig::default()
        }
    }

    fn updater(dir: &TempDir, api: std::result::Result<ExtractOutput, String>) -> Updater {
        Updater::with_extractors(
            config(dir),
            vec![
                Box::new(FakeExtractor {
                    source: Source::Api,
                    output: api,
                }),
                Box::new(FakeExtractor {
                    source: Source::Csv,
                    output: Ok(csv_output()),
                }),
            ],
        )
    }

    #[tokio::test]
    async fn full_cycle_merges_sources_and_writes_outputs() {
        let dir = tempdir().expect("tempdir");
        let summary = updater(&dir, Ok(api_output())).run_once().await.expect("refresh");

        assert_eq!(summary.inserted, 1);
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.store_records, 1);
        assert_eq!(summary.archived_payloads, 1);
        let csv = summary.source(Source::Csv).unwrap();
        assert_eq!((csv.status, csv.malformed, csv.filtered), (SourceStatus::Extracted, 1, 1));

        let records = CanonicalStore::new(dir.path().join("data/posts.csv")).load().await.unwrap();
        assert_eq!(records[0].message.value.as_deref(), Some("Grand opening"));
        assert_eq!(records[0].metric(Metric::Reach), Some(500));
        assert_eq!(records[0].metric(Metric::Like), Some(30));
        assert_eq!(records[0].metric(Metric::ReactionsTotal), Some(42));

        assert!(dir.path().join("data/page_info.json").is_file());
        let report_dir = PathBuf::from(&summary.reports_dir);
        assert!(report_dir.join(SUMMARY_FILE).is_file());
        assert!(std::fs::read_to_string(report_dir.join(BRIEF_FILE))
            .unwrap()
            .contains("1 inserted"));
    }

    #[tokio::test]
    async fn rerun_with_same_inputs_changes_nothing() {
        let dir = tempdir().expect("tempdir");
        let first = updater(&dir, Ok(api_output())).run_once().await.expect("first");
        let before = std::fs::read(&first.store_path).unwrap();

        let second = updater(&dir, Ok(api_output())).run_once().await.expect("second");
        assert_eq!((second.inserted, second.updated, second.unchanged), (0, 0, 1));
        assert_eq!(std::fs::read(&second.store_path).unwrap(), before);
    }

    #[tokio::test]
    async fn expired_token_rerun_keeps_breakdown_and_csv_fields() {
        let dir = tempdir().expect("tempdir");
        updater(&dir, Ok(api_output())).run_once().await.expect("first");

        let summary = updater(&dir, Err("graph error (code 190)".to_string()))
            .run_once()
            .await
            .expect("csv-only refresh still succeeds");
        let api = summary.source(Source::Api).unwrap();
        assert_eq!(api.status, SourceStatus::Unavailable);
        assert_eq!(summary.page_snapshot, None);

        let records = CanonicalStore::new(dir.path().join("data/posts.csv")).load().await.unwrap();
        assert_eq!(records[0].metric(Metric::Like), Some(30));
        assert_eq!(records[0].metric(Metric::Reach), Some(500));
        assert_eq!(records[0].message.value.as_deref(), Some("Grand opening"));
    }

    #[tokio::test]
    async fn unconfigured_sources_are_reported_disabled() {
        let dir = tempdir().expect("tempdir");
        let summary = Updater::from_config(config(&dir))
            .expect("updater")
            .run_once()
            .await
            .expect("empty refresh");
        assert_eq!(summary.store_records, 0);
        assert!(summary.sources.iter().all(|o| o.status == SourceStatus::Disabled));
        assert!(dir.path().join("data/posts.csv").is_file());
    }

    #[tokio::test]
    async fn persistence_failure_aborts_the_cycle() {
        let dir = tempdir().expect("tempdir");
        let mut cfg = config(&dir);
        std::fs::create_dir_all(dir.path().join("blocked")).unwrap();
        cfg.store_path = dir.path().join("blocked");
        let updater = Updater::with_extractors(
            cfg,
            vec![Box::new(FakeExtractor {
                source: Source::Csv,
                output: Ok(csv_output()),
            })],
        );
        assert!(updater.run_once().await.is_err());
        assert!(!dir.path().join("reports").exists());
    }

    #[tokio::test]
    async fn recent_report_lists_newest_runs_first() {
        let dir = tempdir().expect("tempdir");
        let first = updater(&dir, Ok(api_output())).run_once().await.unwrap();
        let second = updater(&dir, Ok(api_output())).run_once().await.unwrap();

        let digest = report_recent_markdown(&dir.path().join("reports"), 1).unwrap();
        assert!(digest.contains(&second.run_id.to_string()));
        assert!(!digest.contains(&first.run_id.to_string()));

        let both = report_recent_markdown(&dir.path().join("reports"), 5).unwrap();
        let newer = both.find(&second.run_id.to_string()).unwrap();
        let older = both.find(&first.run_id.to_string()).unwrap();
        assert!(newer < older);
    }

    #[test]
    fn recent_report_before_any_run_says_so() {
        let dir = tempdir().expect("tempdir");
        let digest = report_recent_markdown(&dir.path().join("reports"), 5).expect("report");
        assert!(digest.contains("_no refresh runs recorded_"));
    }

    #[tokio::test]
    async fn stats_count_only_known_values() {
        let dir = tempdir().expect("tempdir");
        updater(&dir, Ok(api_output())).run_once().await.unwrap();
        let stats = store_stats(dir.path().join("data/posts.csv")).await.unwrap();
        assert_eq!(stats.records, 1);
        assert_eq!(stats.by_type.get(&PostType::Photo), Some(&1));
        assert_eq!(stats.metrics.get(&Metric::Views), None);
        assert_eq!(
            stats.metrics.get(&Metric::Reach),
            Some(&MetricStats { total: 500, reporting: 1 })
        );
        assert!(stats.to_markdown().contains("- views: 0 across 0/1 records"));
    }
}
