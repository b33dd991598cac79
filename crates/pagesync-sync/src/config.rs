use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, FixedOffset, Utc};
use pagesync_adapters::{ApiExtractorConfig, DEFAULT_GRAPH_BASE_URL, DEFAULT_GRAPH_VERSION};
use pagesync_storage::{BackoffPolicy, HttpClientConfig};
use serde::Deserialize;

pub const DEFAULT_CONFIG_FILE: &str = "pagesync.yaml";

/// Everything one refresh cycle needs. Built once and passed to the updater.
#[derive(Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RefreshConfig {
    pub page_id: String,
    pub access_token: Option<String>,
    pub graph_base_url: String,
    pub graph_version: String,
    /// Export file or directory of exports.
    pub csv_export: Option<PathBuf>,
    pub store_path: PathBuf,
    pub page_snapshot_path: PathBuf,
    pub reports_dir: PathBuf,
    pub archive_dir: Option<PathBuf>,
    /// Offset for timestamps that carry none, in minutes east of UTC.
    pub naive_utc_offset_minutes: i32,
    pub http_timeout_secs: u64,
    pub user_agent: String,
    pub max_retries: usize,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub request_spacing_ms: u64,
    pub page_size: u32,
    pub max_pages: usize,
    pub since: Option<DateTime<Utc>>,
    pub breakdown_posts: usize,
    pub include_reels: bool,
    pub include_videos: bool,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            page_id: String::new(),
            access_token: None,
            graph_base_url: DEFAULT_GRAPH_BASE_URL.to_string(),
            graph_version: DEFAULT_GRAPH_VERSION.to_string(),
            csv_export: None,
            store_path: PathBuf::from("data/posts.csv"),
            page_snapshot_path: PathBuf::from("data/page_info.json"),
            reports_dir: PathBuf::from("reports"),
            archive_dir: Some(PathBuf::from("artifacts")),
            naive_utc_offset_minutes: 0,
            http_timeout_secs: 30,
            user_agent: "pagesync/0.1".to_string(),
            max_retries: 3,
            retry_base_delay_ms: 500,
            retry_max_delay_ms: 8_000,
            request_spacing_ms: 200,
            page_size: 25,
            max_pages: 40,
            since: None,
            breakdown_posts: 30,
            include_reels: true,
            include_videos: true,
        }
    }
}

impl std::fmt::Debug for RefreshConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RefreshConfig")
            .field("page_id", &self.page_id)
            .field("access_token", &self.access_token.as_ref().map(|_| "<redacted>"))
            .field("graph_base_url", &self.graph_base_url)
            .field("graph_version", &self.graph_version)
            .field("csv_export", &self.csv_export)
            .field("store_path", &self.store_path)
            .field("page_snapshot_path", &self.page_snapshot_path)
            .field("reports_dir", &self.reports_dir)
            .field("archive_dir", &self.archive_dir)
            .finish_non_exhaustive()
    }
}

impl RefreshConfig {
    /// Defaults, then the YAML file, then `PAGESYNC_*` environment variables.
    ///
    /// An explicit `path` must exist; otherwise `pagesync.yaml` is read when present.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_yaml_file(path)?,
            None if Path::new(DEFAULT_CONFIG_FILE).is_file() => {
                Self::from_yaml_file(Path::new(DEFAULT_CONFIG_FILE))?
            }
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn from_yaml_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn from_yaml_str(text: &str) -> Result<Self> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(text)?)
    }

    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        let var = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        if let Some(v) = var("PAGESYNC_PAGE_ID") {
            self.page_id = v;
        }
        if let Some(v) = var("PAGESYNC_ACCESS_TOKEN") {
            self.access_token = Some(v);
        }
        if let Some(v) = var("PAGESYNC_GRAPH_BASE_URL") {
            self.graph_base_url = v;
        }
        if let Some(v) = var("PAGESYNC_CSV_EXPORT") {
            self.csv_export = Some(PathBuf::from(v));
        }
        if let Some(v) = var("PAGESYNC_STORE_PATH") {
            self.store_path = PathBuf::from(v);
        }
        if let Some(v) = var("PAGESYNC_HTTP_TIMEOUT_SECS") {
            self.http_timeout_secs = v
                .parse()
                .with_context(|| format!("PAGESYNC_HTTP_TIMEOUT_SECS=`{v}` is not a number of seconds"))?;
        }
        Ok(())
    }

    pub fn access_token(&self) -> Option<&str> {
        self.access_token
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
    }

    pub fn naive_offset(&self) -> Result<FixedOffset> {
        FixedOffset::east_opt(self.naive_utc_offset_minutes * 60).ok_or_else(|| {
            anyhow!(
                "naive_utc_offset_minutes={} is outside +/-24h",
                self.naive_utc_offset_minutes
            )
        })
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            backoff: BackoffPolicy {
                max_retries: self.max_retries,
                base_delay: Duration::from_millis(self.retry_base_delay_ms),
                max_delay: Duration::from_millis(self.retry_max_delay_ms),
            },
            request_spacing: Duration::from_millis(self.request_spacing_ms),
        }
    }

    /// `None` when no access token is configured.
    pub fn api_extractor_config(&self) -> Result<Option<ApiExtractorConfig>> {
        let Some(token) = self.access_token() else {
            return Ok(None);
        };
        if self.page_id.trim().is_empty() {
            return Err(anyhow!("an access token is configured but page_id is empty"));
        }
        let mut api = ApiExtractorConfig::new(self.page_id.trim(), token);
        api.base_url = self.graph_base_url.clone();
        api.api_version = self.graph_version.clone();
        api.page_size = self.page_size;
        api.max_pages = self.max_pages;
        api.since = self.since;
        api.breakdown_posts = self.breakdown_posts;
        api.include_reels = self.include_reels;
        api.include_videos = self.include_videos;
        Ok(Some(api))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn yaml_overrides_defaults_and_env_overrides_yaml() {
        let mut config = RefreshConfig::from_yaml_str(
            "page_id: \"111\"\ncsv_export: exports\nhttp_timeout_secs: 10\nmax_pages: 5\n",
        )
        .expect("yaml");
        assert_eq!(config.page_id, "111");
        assert_eq!(config.max_pages, 5);
        assert_eq!(config.store_path, PathBuf::from("data/posts.csv"));

        let env: HashMap<&str, &str> = HashMap::from([
            ("PAGESYNC_PAGE_ID", "222"),
            ("PAGESYNC_HTTP_TIMEOUT_SECS", "45"),
            ("PAGESYNC_ACCESS_TOKEN", "  "),
        ]);
        config
            .apply_env(|key| env.get(key).map(|v| v.to_string()))
            .expect("env");
        assert_eq!(config.page_id, "222");
        assert_eq!(config.http_timeout_secs, 45);
        assert_eq!(config.csv_export, Some(PathBuf::from("exports")));
        assert_eq!(config.access_token(), None);
    }

    #[test]
    fn bad_env_number_is_an_error() {
        let mut config = RefreshConfig::default();
        let err = config
            .apply_env(|key| (key == "PAGESYNC_HTTP_TIMEOUT_SECS").then(|| "soon".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("PAGESYNC_HTTP_TIMEOUT_SECS"));
    }

    #[test]
    fn unknown_yaml_keys_are_rejected() {
        assert!(RefreshConfig::from_yaml_str("pageid: 1\n").is_err());
    }

    #[test]
    fn api_is_disabled_without_token_and_needs_page_id_with_one() {
        let mut config = RefreshConfig::default();
        assert!(config.api_extractor_config().unwrap().is_none());

        config.access_token = Some("secret".to_string());
        assert!(config.api_extractor_config().is_err());

        config.page_id = "111".to_string();
        let api = config.api_extractor_config().unwrap().expect("api enabled");
        assert_eq!(api.page_id, "111");
        assert!(!format!("{config:?}").contains("secret"));
    }

    #[test]
    fn offset_minutes_become_fixed_offset() {
        let mut config = RefreshConfig::default();
        config.naive_utc_offset_minutes = 480;
        assert_eq!(config.naive_offset().unwrap().local_minus_utc(), 8 * 3600);
        config.naive_utc_offset_minutes = 100_000;
        assert!(config.naive_offset().is_err());
    }
}
