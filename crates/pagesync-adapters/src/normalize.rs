use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, TimeZone, Utc};
use pagesync_core::{Metric, Metrics, MalformedRecordError, NormalizedPost, PostType, Source};
use serde_json::Value as JsonValue;
use tracing::warn;

use crate::{ApiEdge, ApiPost, CsvRow, NormalizeContext, RawRecord};

const CSV_ID: &[&str] = &["Post ID"];
const CSV_PUBLISHED: &[&str] = &["Publish time", "Published"];
const CSV_TYPE: &[&str] = &["Post type", "Type"];
const CSV_TITLE: &[&str] = &["Title"];
const CSV_DESCRIPTION: &[&str] = &["Description"];
const CSV_PERMALINK: &[&str] = &["Permalink", "Permalink URL"];

const CSV_METRICS: &[(Metric, &[&str])] = &[
    (Metric::ReactionsTotal, &["Reactions", "Total reactions"]),
    (Metric::Comments, &["Comments"]),
    (Metric::Shares, &["Shares"]),
    (Metric::Views, &["Views"]),
    (Metric::Reach, &["Reach"]),
    (Metric::Impressions, &["Impressions"]),
];

const NAIVE_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M",
    "%m/%d/%Y %H:%M",
    "%m/%d/%Y %H:%M:%S",
];

/// Map one raw record onto the source-agnostic shape the reconciler consumes.
pub fn normalize(raw: &RawRecord, ctx: &NormalizeContext) -> Result<NormalizedPost, MalformedRecordError> {
    match raw {
        RawRecord::Api(post) => normalize_api(post, ctx),
        RawRecord::Csv(row) => normalize_csv(row, ctx),
    }
}

/// Accepts RFC 3339, ISO-8601 with or without offset, bare dates and the export's `MM/DD/YYYY HH:MM`.
pub fn parse_timestamp(value: &str, naive_offset: FixedOffset) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(value) {
        return Some(ts.with_timezone(&Utc));
    }
    // `%.f` also matches no fraction; `%#z` takes hour-only offsets such as `+00`.
    for format in [
        "%Y-%m-%dT%H:%M:%S%.f%z",
        "%Y-%m-%d %H:%M:%S%.f%z",
        "%Y-%m-%dT%H:%M:%S%.f%#z",
        "%Y-%m-%d %H:%M:%S%.f%#z",
    ] {
        if let Ok(ts) = DateTime::parse_from_str(value, format) {
            return Some(ts.with_timezone(&Utc));
        }
    }
    let naive = NAIVE_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(value, format).ok())
        .or_else(|| {
            NaiveDate::parse_from_str(value, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })?;
    naive_offset
        .from_local_datetime(&naive)
        .single()
        .map(|ts| ts.with_timezone(&Utc))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Count {
    Value(u64),
    Negative,
    Invalid,
}

/// Parse an export cell such as `1,234` or `500.0`. Blank cells are `None`.
pub fn parse_count(cell: &str) -> Option<u64> {
    match classify_count(cell) {
        Some(Count::Value(v)) => Some(v),
        _ => None,
    }
}

pub(crate) fn classify_count(cell: &str) -> Option<Count> {
    let cleaned = cell.trim().replace([',', ' '], "");
    if cleaned.is_empty() || cleaned == "-" {
        return None;
    }
    if let Ok(v) = cleaned.parse::<i64>() {
        return Some(if v < 0 { Count::Negative } else { Count::Value(v as u64) });
    }
    match cleaned.parse::<f64>() {
        Ok(v) if v.is_finite() && v.fract() == 0.0 => Some(if v < 0.0 {
            Count::Negative
        } else {
            Count::Value(v as u64)
        }),
        _ => Some(Count::Invalid),
    }
}

fn json_count(value: Option<&JsonValue>) -> Option<Count> {
    match value? {
        JsonValue::Null => None,
        JsonValue::Number(n) => Some(match (n.as_u64(), n.as_i64()) {
            (Some(v), _) => Count::Value(v),
            (None, Some(_)) => Count::Negative,
            _ => match n.as_f64() {
                Some(f) if f < 0.0 => Count::Negative,
                Some(f) if f.fract() == 0.0 => Count::Value(f as u64),
                _ => Count::Invalid,
            },
        }),
        JsonValue::String(s) => classify_count(s),
        _ => Some(Count::Invalid),
    }
}

fn record_metric(
    metrics: &mut Metrics,
    metric: Metric,
    count: Option<Count>,
    source: Source,
    record_id: &str,
) {
    match count {
        Some(Count::Value(v)) => {
            metrics.insert(metric, v);
        }
        Some(Count::Negative) => {
            warn!(source = %source, record_id, metric = %metric, "negative metric value dropped");
        }
        Some(Count::Invalid) | None => {}
    }
}

fn non_blank(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// Graph ids look like `<page_id>_<post_id>`; exports use the bare post id.
fn canonical_id(raw_id: &str, page_id: &str) -> String {
    let raw_id = raw_id.trim();
    if page_id.is_empty() {
        return raw_id.to_string();
    }
    match raw_id.split_once('_') {
        Some((prefix, rest)) if prefix == page_id && !rest.is_empty() => rest.to_string(),
        _ => raw_id.to_string(),
    }
}

fn normalize_api(post: &ApiPost, ctx: &NormalizeContext) -> Result<NormalizedPost, MalformedRecordError> {
    let body = &post.body;
    let location = match post.edge {
        ApiEdge::Posts => "posts",
        ApiEdge::VideoReels => "video_reels",
    };

    let raw_id = match body.get("id") {
        Some(JsonValue::String(s)) if !s.trim().is_empty() => s.clone(),
        Some(JsonValue::Number(n)) => n.to_string(),
        _ => {
            return Err(MalformedRecordError::new(Source::Api, "id", "is missing").at(location));
        }
    };
    let id = canonical_id(&raw_id, &ctx.page_id);

    let created_raw = body.get("created_time").and_then(JsonValue::as_str);
    let created_at = match created_raw {
        None => {
            return Err(MalformedRecordError::new(Source::Api, "created_time", "is missing")
                .with_record_id(id)
                .at(location))
        }
        Some(raw) => parse_timestamp(raw, ctx.naive_offset).ok_or_else(|| {
            MalformedRecordError::new(Source::Api, "created_time", format!("`{raw}` is not a timestamp"))
                .with_record_id(id.clone())
                .at(location)
        })?,
    };

    let post_type = match post.edge {
        ApiEdge::VideoReels => Some(PostType::Reel),
        ApiEdge::Posts => body
            .get("status_type")
            .and_then(JsonValue::as_str)
            .and_then(PostType::from_source_tag),
    };

    let text = |key: &str| non_blank(body.get(key).and_then(JsonValue::as_str));
    let message = text("message").or_else(|| text("description"));
    let permalink = text("permalink_url");

    let summary_total = |key: &str| json_count(body.pointer(&format!("/{key}/summary/total_count")));
    let mut metrics = Metrics::new();
    let reactions = match post.edge {
        ApiEdge::Posts => summary_total("reactions"),
        ApiEdge::VideoReels => summary_total("likes"),
    };
    record_metric(&mut metrics, Metric::ReactionsTotal, reactions, Source::Api, &id);
    record_metric(&mut metrics, Metric::Comments, summary_total("comments"), Source::Api, &id);
    record_metric(
        &mut metrics,
        Metric::Shares,
        json_count(body.pointer("/shares/count")),
        Source::Api,
        &id,
    );
    for metric in Metric::REACTION_BREAKDOWN {
        let count = summary_total(metric.name())
            .or_else(|| summary_total(&format!("{}_count", metric.name())));
        record_metric(&mut metrics, metric, count, Source::Api, &id);
    }

    Ok(NormalizedPost {
        source: Source::Api,
        observed_at: post.observed_at,
        id,
        created_at,
        post_type,
        message,
        permalink,
        metrics,
    })
}

fn normalize_csv(row: &CsvRow, ctx: &NormalizeContext) -> Result<NormalizedPost, MalformedRecordError> {
    let malformed = |field: &'static str, reason: String| {
        MalformedRecordError::new(Source::Csv, field, reason).at(row.location())
    };

    let id = row
        .get(CSV_ID)
        .map(|raw| canonical_id(raw, &ctx.page_id))
        .ok_or_else(|| malformed("Post ID", "is missing".to_string()))?;

    let created_at = match row.get(CSV_PUBLISHED) {
        None => return Err(malformed("Publish time", "is missing".to_string()).with_record_id(id)),
        Some(raw) => parse_timestamp(raw, ctx.naive_offset).ok_or_else(|| {
            malformed("Publish time", format!("`{raw}` is not a timestamp")).with_record_id(id.clone())
        })?,
    };

    let mut metrics = Metrics::new();
    for (metric, columns) in CSV_METRICS {
        let count = row.get(columns).and_then(classify_count);
        if count == Some(Count::Invalid) {
            warn!(location = %row.location(), metric = %metric, "non-numeric metric cell ignored");
        }
        record_metric(&mut metrics, *metric, count, Source::Csv, &id);
    }

    Ok(NormalizedPost {
        source: Source::Csv,
        observed_at: row.observed_at,
        id,
        created_at,
        post_type: row.get(CSV_TYPE).and_then(PostType::from_source_tag),
        message: non_blank(row.get(CSV_TITLE)).or_else(|| non_blank(row.get(CSV_DESCRIPTION))),
        permalink: non_blank(row.get(CSV_PERMALINK)),
        metrics,
    })
}
