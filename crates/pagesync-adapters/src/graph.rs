use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pagesync_core::Source;
use pagesync_storage::{strip_access_token, FetchError, HttpClientConfig, HttpFetcher};
use serde_json::{json, Map, Value as JsonValue};
use tracing::{debug, info, warn};

use crate::{ApiEdge, ApiPost, ExtractOutput, RawPayload, RawRecord, SourceExtractor, SourceUnavailableError};

pub const DEFAULT_GRAPH_BASE_URL: &str = "https://graph.facebook.com";
pub const DEFAULT_GRAPH_VERSION: &str = "v21.0";

const PAGE_FIELDS: &str =
    "name,fan_count,followers_count,talking_about_count,overall_star_rating,rating_count";
const POST_FIELDS: &str = "id,message,created_time,shares,permalink_url,status_type,\
reactions.summary(true),comments.summary(true)";
const BREAKDOWN_FIELDS: &str = "reactions.type(LIKE).summary(true).as(like),\
reactions.type(LOVE).summary(true).as(love),\
reactions.type(HAHA).summary(true).as(haha),\
reactions.type(WOW).summary(true).as(wow),\
reactions.type(SAD).summary(true).as(sad),\
reactions.type(ANGRY).summary(true).as(angry)";
const BREAKDOWN_KEYS: [&str; 6] = ["like", "love", "haha", "wow", "sad", "angry"];
const REEL_FIELDS: &str =
    "id,description,created_time,permalink_url,updated_time,likes.summary(true),comments.summary(true)";
const VIDEO_FIELDS: &str = "id,title,description,created_time,length,views,permalink_url";

#[derive(Clone)]
pub struct ApiExtractorConfig {
    pub base_url: String,
    pub api_version: String,
    pub page_id: String,
    pub access_token: String,
    /// `limit` sent with each paged request.
    pub page_size: u32,
    pub max_pages: usize,
    pub since: Option<DateTime<Utc>>,
    /// How many of the newest posts get a per-reaction breakdown request.
    pub breakdown_posts: usize,
    pub include_reels: bool,
    pub include_videos: bool,
}

impl std::fmt::Debug for ApiExtractorConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiExtractorConfig")
            .field("base_url", &self.base_url)
            .field("api_version", &self.api_version)
            .field("page_id", &self.page_id)
            .field("access_token", &"<redacted>")
            .field("page_size", &self.page_size)
            .field("max_pages", &self.max_pages)
            .field("since", &self.since)
            .field("breakdown_posts", &self.breakdown_posts)
            .finish_non_exhaustive()
    }
}

impl ApiExtractorConfig {
    pub fn new(page_id: impl Into<String>, access_token: impl Into<String>) -> Self {
        Self {
            base_url: DEFAULT_GRAPH_BASE_URL.to_string(),
            api_version: DEFAULT_GRAPH_VERSION.to_string(),
            page_id: page_id.into(),
            access_token: access_token.into(),
            page_size: 25,
            max_pages: 40,
            since: None,
            breakdown_posts: 30,
            include_reels: true,
            include_videos: true,
        }
    }

    fn node_url(&self, node: &str) -> String {
        format!(
            "{}/{}/{}",
            self.base_url.trim_end_matches('/'),
            self.api_version.trim_matches('/'),
            node
        )
    }
}

/// Pulls page metadata, posts, reels and videos from the Graph API.
#[derive(Debug)]
pub struct ApiExtractor {
    config: ApiExtractorConfig,
    http: HttpFetcher,
}

struct EdgePages {
    items: Vec<JsonValue>,
    payloads: Vec<RawPayload>,
}

impl ApiExtractor {
    pub fn new(config: ApiExtractorConfig, http: HttpClientConfig) -> anyhow::Result<Self> {
        let http = HttpFetcher::new(http).context("creating graph http client")?;
        Ok(Self { config, http })
    }

    pub fn config(&self) -> &ApiExtractorConfig {
        &self.config
    }

    fn unavailable(&self, what: &str, err: FetchError) -> SourceUnavailableError {
        SourceUnavailableError::new(Source::Api, format!("{what}: {err}"))
    }

    async fn fetch_edge(&self, edge: &str, fields: &str) -> Result<EdgePages, FetchError> {
        let mut url = self.config.node_url(&format!("{}/{edge}", self.config.page_id));
        let mut query = vec![
            ("fields", fields.to_string()),
            ("limit", self.config.page_size.to_string()),
            ("access_token", self.config.access_token.clone()),
        ];
        if let Some(since) = self.config.since {
            query.push(("since", since.timestamp().to_string()));
        }

        let mut pages = EdgePages {
            items: Vec::new(),
            payloads: Vec::new(),
        };
        for page_number in 1..=self.config.max_pages.max(1) {
            let body = self.http.get_json(&url, &query).await?;
            let data = body
                .get("data")
                .and_then(JsonValue::as_array)
                .cloned()
                .unwrap_or_default();
            debug!(edge, page_number, items = data.len(), "graph page fetched");
            pages.payloads.push(RawPayload {
                source: Source::Api,
                label: format!("{edge}-{page_number}"),
                extension: "json",
                bytes: serde_json::to_vec(&archived_copy(&body)).unwrap_or_default(),
            });
            let exhausted = data.is_empty();
            pages.items.extend(data);

            // `paging.next` already carries every query parameter, token included.
            match body.pointer("/paging/next").and_then(JsonValue::as_str) {
                Some(next) if !exhausted => {
                    url = next.to_string();
                    query.clear();
                }
                _ => break,
            }
            if page_number == self.config.max_pages {
                info!(edge, max_pages = self.config.max_pages, "page cap reached; older items left for the export");
            }
        }
        Ok(pages)
    }

    async fn attach_breakdown(&self, post: &mut JsonValue) -> Result<(), FetchError> {
        let Some(raw_id) = post.get("id").and_then(JsonValue::as_str).map(str::to_string) else {
            return Ok(());
        };
        let query = [
            ("fields", BREAKDOWN_FIELDS.to_string()),
            ("access_token", self.config.access_token.clone()),
        ];
        let detail = self.http.get_json(&self.config.node_url(&raw_id), &query).await?;
        if let (Some(target), Some(detail)) = (post.as_object_mut(), detail.as_object()) {
            for key in BREAKDOWN_KEYS {
                if let Some(value) = detail.get(key) {
                    target.insert(key.to_string(), value.clone());
                }
            }
        }
        Ok(())
    }
}

/// Page body as archived: paging URLs lose their access token.
fn archived_copy(body: &JsonValue) -> JsonValue {
    let mut copy = body.clone();
    for pointer in ["/paging/next", "/paging/previous"] {
        if let Some(link) = copy.pointer_mut(pointer) {
            if let Some(url) = link.as_str() {
                *link = JsonValue::String(strip_access_token(url));
            }
        }
    }
    copy
}

#[async_trait]
impl SourceExtractor for ApiExtractor {
    fn source(&self) -> Source {
        Source::Api
    }

    async fn extract(&self) -> Result<ExtractOutput, SourceUnavailableError> {
        let observed_at = Utc::now();
        let mut output = ExtractOutput::default();

        let page_query = [
            ("fields", PAGE_FIELDS.to_string()),
            ("access_token", self.config.access_token.clone()),
        ];
        let page_info = self
            .http
            .get_json(&self.config.node_url(&self.config.page_id), &page_query)
            .await
            .map_err(|err| self.unavailable("page metadata", err))?;

        let mut posts = self
            .fetch_edge("posts", POST_FIELDS)
            .await
            .map_err(|err| self.unavailable("posts", err))?;
        output.payloads.append(&mut posts.payloads);

        let mut breakdowns = 0usize;
        for post in posts.items.iter_mut().take(self.config.breakdown_posts) {
            match self.attach_breakdown(post).await {
                Ok(()) => breakdowns += 1,
                Err(err) => warn!(error = %err, "reaction breakdown unavailable for post"),
            }
        }
        info!(posts = posts.items.len(), breakdowns, "graph posts extracted");
        output.records.extend(posts.items.into_iter().map(|body| {
            RawRecord::Api(ApiPost {
                edge: ApiEdge::Posts,
                observed_at,
                body,
            })
        }));

        if self.config.include_reels {
            match self.fetch_edge("video_reels", REEL_FIELDS).await {
                Ok(mut reels) => {
                    info!(reels = reels.items.len(), "graph reels extracted");
                    output.payloads.append(&mut reels.payloads);
                    output.records.extend(reels.items.into_iter().map(|body| {
                        RawRecord::Api(ApiPost {
                            edge: ApiEdge::VideoReels,
                            observed_at,
                            body,
                        })
                    }));
                }
                Err(err) => warn!(error = %err, "reels edge unavailable; continuing with posts only"),
            }
        }

        let mut videos = Vec::new();
        if self.config.include_videos {
            match self.fetch_edge("videos", VIDEO_FIELDS).await {
                Ok(mut pages) => {
                    output.payloads.append(&mut pages.payloads);
                    videos = pages.items;
                }
                Err(err) => warn!(error = %err, "videos edge unavailable; snapshot will omit videos"),
            }
        }

        let mut snapshot = Map::new();
        snapshot.insert("page".to_string(), page_info);
        snapshot.insert("videos".to_string(), JsonValue::Array(videos));
        snapshot.insert("fetched_at".to_string(), json!(observed_at));
        output.page_snapshot = Some(JsonValue::Object(snapshot));
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use pagesync_storage::BackoffPolicy;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Minimal one-request-per-connection HTTP server answering from `route`.
    async fn serve(route: fn(&str, u16) -> (u16, String)) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    break;
                };
                let mut buf = vec![0u8; 8192];
                let mut read = 0;
                while read < buf.len() {
                    let n = socket.read(&mut buf[read..]).await.unwrap_or(0);
                    if n == 0 {
                        break;
                    }
                    read += n;
                    if buf[..read].windows(4).any(|w| w == b"\r\n\r\n") {
                        break;
                    }
                }
                let head = String::from_utf8_lossy(&buf[..read]).to_string();
                let target = head.split_whitespace().nth(1).unwrap_or("/").to_string();
                let (status, body) = route(&target, port);
                let response = format!(
                    "HTTP/1.1 {status} X\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                    body.len()
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            }
        });
        port
    }

    fn graph_route(target: &str, port: u16) -> (u16, String) {
        let (path, query) = target.split_once('?').unwrap_or((target, ""));
        let body = match path {
            "/v21.0/111" => json!({"id": "111", "name": "Sample Page", "fan_count": 1200}),
            "/v21.0/111/posts" if query.contains("after=p2") => json!({
                "data": [{
                    "id": "111_2",
                    "created_time": "2025-05-01T08:00:00+0000",
                    "status_type": "mobile_status_update",
                    "message": "older"
                }]
            }),
            "/v21.0/111/posts" => json!({
                "data": [{
                    "id": "111_3",
                    "created_time": "2025-06-01T08:00:00+0000",
                    "status_type": "added_photos",
                    "reactions": {"summary": {"total_count": 12}}
                }],
                "paging": {"next": format!("http://127.0.0.1:{port}/v21.0/111/posts?after=p2&access_token=T")}
            }),
            "/v21.0/111_3" => json!({
                "id": "111_3",
                "like": {"data": [], "summary": {"total_count": 10}},
                "love": {"data": [], "summary": {"total_count": 2}}
            }),
            "/v21.0/111_2" => return (400, json!({"error": {"code": 100, "message": "unsupported"}}).to_string()),
            "/v21.0/111/video_reels" => json!({
                "data": [{"id": "900", "created_time": "2025-06-02T08:00:00+0000"}]
            }),
            "/v21.0/111/videos" => json!({"data": [{"id": "901", "views": 55}]}),
            _ => return (404, json!({"error": {"code": 803, "message": "unknown path"}}).to_string()),
        };
        (200, body.to_string())
    }

    fn expired_route(_target: &str, _port: u16) -> (u16, String) {
        (
            400,
            json!({"error": {"code": 190, "message": "Error validating access token"}}).to_string(),
        )
    }

    fn extractor(port: u16) -> ApiExtractor {
        let mut config = ApiExtractorConfig::new("111", "T");
        config.base_url = format!("http://127.0.0.1:{port}");
        ApiExtractor::new(
            config,
            HttpClientConfig {
                timeout: Duration::from_secs(5),
                user_agent: None,
                backoff: BackoffPolicy {
                    max_retries: 1,
                    base_delay: Duration::from_millis(1),
                    max_delay: Duration::from_millis(1),
                },
                request_spacing: Duration::ZERO,
            },
        )
        .unwrap()
    }

    #[tokio::test]
    async fn pages_through_posts_and_attaches_breakdown() {
        let port = serve(graph_route).await;
        let output = extractor(port).extract().await.expect("extract");

        let bodies: Vec<&JsonValue> = output
            .records
            .iter()
            .map(|r| match r {
                RawRecord::Api(post) => &post.body,
                RawRecord::Csv(_) => panic!("api extractor produced a csv row"),
            })
            .collect();
        assert_eq!(bodies.len(), 3);
        assert_eq!(bodies[0]["id"], "111_3");
        assert_eq!(bodies[0]["like"]["summary"]["total_count"], 10);
        assert!(bodies[1].get("like").is_none());
        assert!(matches!(&output.records[2], RawRecord::Api(p) if p.edge == ApiEdge::VideoReels));

        let snapshot = output.page_snapshot.expect("snapshot");
        assert_eq!(snapshot["page"]["name"], "Sample Page");
        assert_eq!(snapshot["videos"][0]["views"], 55);
        assert!(output.payloads.len() >= 4);
    }

    #[tokio::test]
    async fn archived_pages_do_not_carry_the_token() {
        let port = serve(graph_route).await;
        let output = extractor(port).extract().await.expect("extract");

        let first = output
            .payloads
            .iter()
            .find(|p| p.label == "posts-1")
            .expect("first posts page archived");
        let archived: JsonValue = serde_json::from_slice(&first.bytes).expect("json payload");
        assert_eq!(
            archived["paging"]["next"],
            format!("http://127.0.0.1:{port}/v21.0/111/posts?after=p2")
        );
        for payload in &output.payloads {
            let text = String::from_utf8_lossy(&payload.bytes);
            assert!(!text.contains("access_token"), "{} leaks the token", payload.label);
        }
    }

    #[tokio::test]
    async fn expired_token_makes_source_unavailable() {
        let port = serve(expired_route).await;
        let err = extractor(port).extract().await.unwrap_err();
        assert_eq!(err.source_name, Source::Api);
        assert!(err.reason.contains("190"));
        assert!(!err.reason.contains("access_token=T"));
    }
}
