//! Canonical post model and provenance types for pagesync.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

mod reconcile;

pub use reconcile::{ChangeKind, ReconcileOutcome, Reconciler};

pub const CRATE_NAME: &str = "pagesync-core";

/// Upstream extractor a value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    Api,
    Csv,
}

impl Source {
    pub const ALL: [Source; 2] = [Source::Api, Source::Csv];

    pub fn as_str(self) -> &'static str {
        match self {
            Source::Api => "api",
            Source::Csv => "csv",
        }
    }

    fn bit(self) -> u8 {
        match self {
            Source::Api => 0b01,
            Source::Csv => 0b10,
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Source {
    type Err = ParseTagError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "api" => Ok(Source::Api),
            "csv" => Ok(Source::Csv),
            other => Err(ParseTagError::new("source", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unrecognized {kind} `{value}`")]
pub struct ParseTagError {
    pub kind: &'static str,
    pub value: String,
}

impl ParseTagError {
    fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}

/// Set of sources that contributed to a record. Persisted as `api`, `csv` or `api+csv`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SourceMask(u8);

impl SourceMask {
    pub const EMPTY: SourceMask = SourceMask(0);

    pub fn only(source: Source) -> Self {
        Self(source.bit())
    }

    pub fn insert(&mut self, source: Source) {
        self.0 |= source.bit();
    }

    pub fn contains(self, source: Source) -> bool {
        self.0 & source.bit() != 0
    }

    pub fn union(self, other: SourceMask) -> Self {
        Self(self.0 | other.0)
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn sources(self) -> impl Iterator<Item = Source> {
        Source::ALL.into_iter().filter(move |s| self.contains(*s))
    }
}

impl fmt::Display for SourceMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts = self.sources().map(Source::as_str).collect::<Vec<_>>();
        f.write_str(&parts.join("+"))
    }
}

impl FromStr for SourceMask {
    type Err = ParseTagError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut mask = SourceMask::EMPTY;
        for part in s.split('+').map(str::trim).filter(|p| !p.is_empty()) {
            let source = part
                .parse::<Source>()
                .map_err(|_| ParseTagError::new("source mask", s))?;
            mask.insert(source);
        }
        Ok(mask)
    }
}

impl TryFrom<String> for SourceMask {
    type Error = ParseTagError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<SourceMask> for String {
    fn from(mask: SourceMask) -> Self {
        mask.to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum PostType {
    Photo,
    Video,
    Reel,
    Live,
    Text,
    Shared,
}

impl PostType {
    pub const ALL: [PostType; 6] = [
        PostType::Photo,
        PostType::Video,
        PostType::Reel,
        PostType::Live,
        PostType::Text,
        PostType::Shared,
    ];

    /// Resolution for records whose sources never reported a recognizable type.
    pub const DEFAULT: PostType = PostType::Text;

    pub fn as_str(self) -> &'static str {
        match self {
            PostType::Photo => "Photo",
            PostType::Video => "Video",
            PostType::Reel => "Reel",
            PostType::Live => "Live",
            PostType::Text => "Text",
            PostType::Shared => "Shared",
        }
    }

    /// Maps a Graph `status_type` or an export `Post type` label onto the canonical enum.
    ///
    /// Both sources go through this one table. Unrecognized tags yield `None` and are
    /// left for the reconciler to resolve, so an unknown label can never displace a
    /// recognized type reported by the other source.
    pub fn from_source_tag(tag: &str) -> Option<Self> {
        let key = tag.trim().to_ascii_lowercase().replace([' ', '-'], "_");
        match key.as_str() {
            "added_photos" | "photo" | "photos" | "tagged_in_photo" => Some(PostType::Photo),
            "added_video" | "video" | "videos" => Some(PostType::Video),
            "reel" | "reels" | "video_reel" | "video_reels" => Some(PostType::Reel),
            "live" | "live_video" | "live_videos" | "added_live_video" => Some(PostType::Live),
            "mobile_status_update" | "status" | "text" | "created_note" | "wall_post" => {
                Some(PostType::Text)
            }
            "shared_story" | "shared" | "share" | "link" | "links" => Some(PostType::Shared),
            _ => None,
        }
    }
}

impl fmt::Display for PostType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PostType {
    type Err = ParseTagError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PostType::ALL
            .into_iter()
            .find(|t| t.as_str() == s.trim())
            .ok_or_else(|| ParseTagError::new("post type", s))
    }
}

/// Which extractor is authoritative for a metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricOwner {
    Csv,
    Api,
    /// Reported by both; the most recent observation wins.
    Shared,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    ReactionsTotal,
    Comments,
    Shares,
    Views,
    Reach,
    Impressions,
    Like,
    Love,
    Haha,
    Wow,
    Sad,
    Angry,
}

impl Metric {
    pub const ALL: [Metric; 12] = [
        Metric::ReactionsTotal,
        Metric::Comments,
        Metric::Shares,
        Metric::Views,
        Metric::Reach,
        Metric::Impressions,
        Metric::Like,
        Metric::Love,
        Metric::Haha,
        Metric::Wow,
        Metric::Sad,
        Metric::Angry,
    ];

    pub const REACTION_BREAKDOWN: [Metric; 6] = [
        Metric::Like,
        Metric::Love,
        Metric::Haha,
        Metric::Wow,
        Metric::Sad,
        Metric::Angry,
    ];

    pub const SHARED: [Metric; 3] = [Metric::ReactionsTotal, Metric::Comments, Metric::Shares];

    pub fn name(self) -> &'static str {
        match self {
            Metric::ReactionsTotal => "reactions_total",
            Metric::Comments => "comments",
            Metric::Shares => "shares",
            Metric::Views => "views",
            Metric::Reach => "reach",
            Metric::Impressions => "impressions",
            Metric::Like => "like",
            Metric::Love => "love",
            Metric::Haha => "haha",
            Metric::Wow => "wow",
            Metric::Sad => "sad",
            Metric::Angry => "angry",
        }
    }

    pub fn owner(self) -> MetricOwner {
        match self {
            Metric::Views | Metric::Reach | Metric::Impressions => MetricOwner::Csv,
            Metric::Like
            | Metric::Love
            | Metric::Haha
            | Metric::Wow
            | Metric::Sad
            | Metric::Angry => MetricOwner::Api,
            Metric::ReactionsTotal | Metric::Comments | Metric::Shares => MetricOwner::Shared,
        }
    }

    /// Whether a value for this metric may be taken from `source` at all.
    pub fn accepts(self, source: Source) -> bool {
        match self.owner() {
            MetricOwner::Shared => true,
            MetricOwner::Csv => source == Source::Csv,
            MetricOwner::Api => source == Source::Api,
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Observed metric values. A missing key means "not fetched", never zero.
pub type Metrics = BTreeMap<Metric, u64>;

/// Descriptive value paired with the source that supplied it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Field<T> {
    pub value: Option<T>,
    pub source: Option<Source>,
}

impl<T> Default for Field<T> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<T> Field<T> {
    pub fn empty() -> Self {
        Self {
            value: None,
            source: None,
        }
    }

    pub fn from_source(value: T, source: Source) -> Self {
        Self {
            value: Some(value),
            source: Some(source),
        }
    }

    pub fn is_from(&self, source: Source) -> bool {
        self.value.is_some() && self.source == Some(source)
    }
}

/// When, and from where, a last-write-wins value was observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stamp {
    pub source: Source,
    pub observed_at: DateTime<Utc>,
}

impl Stamp {
    /// Newer observations win; on a tie the CSV export beats the API.
    pub fn supersedes(&self, current: Option<&Stamp>) -> bool {
        match current {
            None => true,
            Some(cur) => {
                self.observed_at > cur.observed_at
                    || (self.observed_at == cur.observed_at
                        && (self.source == cur.source || self.source == Source::Csv))
            }
        }
    }
}

/// Source-agnostic handoff from the normalizer into the reconciler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedPost {
    pub source: Source,
    pub observed_at: DateTime<Utc>,
    pub id: String,
    pub created_at: DateTime<Utc>,
    /// `None` when the source gave no tag or one outside the mapping table.
    pub post_type: Option<PostType>,
    pub message: Option<String>,
    pub permalink: Option<String>,
    pub metrics: Metrics,
}

/// Canonical merged representation of one post.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostRecord {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub post_type: PostType,
    pub post_type_source: Option<Source>,
    pub message: Field<String>,
    pub permalink: Field<String>,
    pub metrics: Metrics,
    /// Provenance for the shared (last-write-wins) metrics only.
    pub shared_stamps: BTreeMap<Metric, Stamp>,
    pub source_mask: SourceMask,
    pub csv_observed_at: Option<DateTime<Utc>>,
    pub api_observed_at: Option<DateTime<Utc>>,
}

impl PostRecord {
    /// First sighting of a post id.
    pub fn from_normalized(post: NormalizedPost) -> Self {
        let source = post.source;
        let mut record = Self {
            id: post.id,
            created_at: post.created_at,
            post_type: post.post_type.unwrap_or(PostType::DEFAULT),
            post_type_source: post.post_type.map(|_| source),
            message: post
                .message
                .map(|m| Field::from_source(m, source))
                .unwrap_or_default(),
            permalink: post
                .permalink
                .map(|p| Field::from_source(p, source))
                .unwrap_or_default(),
            metrics: Metrics::new(),
            shared_stamps: BTreeMap::new(),
            source_mask: SourceMask::only(source),
            csv_observed_at: None,
            api_observed_at: None,
        };
        record.note_observation(source, post.observed_at);

        let stamp = Stamp {
            source,
            observed_at: post.observed_at,
        };
        for (metric, value) in post.metrics {
            if !metric.accepts(source) {
                continue;
            }
            if metric.owner() == MetricOwner::Shared {
                record.shared_stamps.insert(metric, stamp);
            }
            record.metrics.insert(metric, value);
        }
        record
    }

    pub fn metric(&self, metric: Metric) -> Option<u64> {
        self.metrics.get(&metric).copied()
    }

    pub fn last_observed(&self, source: Source) -> Option<DateTime<Utc>> {
        match source {
            Source::Api => self.api_observed_at,
            Source::Csv => self.csv_observed_at,
        }
    }

    pub(crate) fn note_observation(&mut self, source: Source, observed_at: DateTime<Utc>) {
        let slot = match source {
            Source::Api => &mut self.api_observed_at,
            Source::Csv => &mut self.csv_observed_at,
        };
        if slot.map_or(true, |last| observed_at > last) {
            *slot = Some(observed_at);
        }
    }

    /// Equality over what the dashboard sees, ignoring provenance bookkeeping.
    pub fn same_content(&self, other: &PostRecord) -> bool {
        self.id == other.id
            && self.created_at == other.created_at
            && self.post_type == other.post_type
            && self.message.value == other.message.value
            && self.permalink.value == other.permalink.value
            && self.metrics == other.metrics
            && self.source_mask == other.source_mask
    }
}

/// Canonical store order: newest post first, ties broken by id.
pub fn sort_canonical(records: &mut [PostRecord]) {
    records.sort_by(|a, b| {
        b.created_at
            .cmp(&a.created_at)
            .then_with(|| a.id.cmp(&b.id))
    });
}

/// A single raw record that could not be mapped onto the canonical shape.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("malformed {origin} record {}: field `{field}` {reason}", .record_id.as_deref().unwrap_or("<no id>"))]
pub struct MalformedRecordError {
    pub origin: Source,
    pub record_id: Option<String>,
    pub field: &'static str,
    pub reason: String,
    /// File and line for CSV rows, endpoint for API payloads.
    pub location: Option<String>,
}

impl MalformedRecordError {
    pub fn new(origin: Source, field: &'static str, reason: impl Into<String>) -> Self {
        Self {
            origin,
            record_id: None,
            field,
            reason: reason.into(),
            location: None,
        }
    }

    pub fn with_record_id(mut self, id: impl Into<String>) -> Self {
        self.record_id = Some(id.into());
        self
    }

    pub fn at(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }
}
