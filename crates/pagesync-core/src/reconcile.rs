//! Field-level merge of freshly normalized posts into the canonical record set.

use std::collections::BTreeMap;

use tracing::{debug, trace, warn};

use crate::{sort_canonical, Field, MetricOwner, NormalizedPost, PostRecord, Source, Stamp};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Inserted,
    Updated,
    Unchanged,
}

#[derive(Debug, Clone)]
pub struct ReconcileOutcome {
    pub records: Vec<PostRecord>,
    pub changes: BTreeMap<String, ChangeKind>,
    /// True when any record differs from its input, provenance included.
    pub dirty: bool,
}

impl ReconcileOutcome {
    pub fn count(&self, kind: ChangeKind) -> usize {
        self.changes.values().filter(|k| **k == kind).count()
    }

    pub fn inserted(&self) -> usize {
        self.count(ChangeKind::Inserted)
    }

    pub fn updated(&self) -> usize {
        self.count(ChangeKind::Updated)
    }

    pub fn unchanged(&self) -> usize {
        self.count(ChangeKind::Unchanged)
    }
}

/// Merges batches keyed by post id.
///
/// Precedence: the CSV export owns descriptive fields, `reach`, `views` and
/// `impressions`; the API owns the reaction breakdown; `reactions_total`, `comments`
/// and `shares` follow the newest observation. Applying the same batch twice leaves
/// the result unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct Reconciler;

impl Reconciler {
    pub fn new() -> Self {
        Self
    }

    pub fn apply(&self, existing: Vec<PostRecord>, batch: Vec<NormalizedPost>) -> ReconcileOutcome {
        let mut by_id: BTreeMap<String, PostRecord> = BTreeMap::new();
        for record in existing {
            let id = record.id.clone();
            if by_id.insert(id.clone(), record).is_some() {
                warn!(id = %id, "duplicate id in stored snapshot; keeping the later row");
            }
        }

        let mut groups: BTreeMap<String, Vec<NormalizedPost>> = BTreeMap::new();
        for post in batch {
            groups.entry(post.id.clone()).or_default().push(post);
        }

        let mut changes = BTreeMap::new();
        let mut dirty = false;

        for (id, mut posts) in groups {
            posts.sort_by(|a, b| {
                a.observed_at
                    .cmp(&b.observed_at)
                    .then_with(|| a.source.cmp(&b.source))
            });

            let before = by_id.get(&id).cloned();
            let mut incoming = posts.into_iter();
            let mut record = match &before {
                Some(existing) => existing.clone(),
                None => {
                    let Some(first) = incoming.next() else {
                        continue;
                    };
                    PostRecord::from_normalized(first)
                }
            };
            for post in incoming {
                merge_into(&mut record, post);
            }

            let kind = match &before {
                None => ChangeKind::Inserted,
                Some(prev) if !prev.same_content(&record) => ChangeKind::Updated,
                Some(_) => ChangeKind::Unchanged,
            };
            if before.as_ref() != Some(&record) {
                dirty = true;
            }
            debug!(id = %id, change = ?kind, sources = %record.source_mask, "reconciled post");
            changes.insert(id.clone(), kind);
            by_id.insert(id, record);
        }

        let mut records = by_id.into_values().collect::<Vec<_>>();
        sort_canonical(&mut records);
        ReconcileOutcome {
            records,
            changes,
            dirty,
        }
    }
}

fn merge_into(record: &mut PostRecord, post: NormalizedPost) {
    let source = post.source;
    let stamp = Stamp {
        source,
        observed_at: post.observed_at,
    };
    // An older extraction from the same source must not roll back its own fields.
    let fresh = record
        .last_observed(source)
        .map_or(true, |last| post.observed_at >= last);

    if fresh {
        let csv_held = record.source_mask.contains(Source::Csv);
        if source == Source::Csv || !csv_held {
            record.created_at = post.created_at;
        }
        if let Some(post_type) = post.post_type {
            if source == Source::Csv || record.post_type_source != Some(Source::Csv) {
                record.post_type = post_type;
                record.post_type_source = Some(source);
            }
        }
        offer_descriptive(&mut record.message, post.message, source);
        offer_descriptive(&mut record.permalink, post.permalink, source);
    } else {
        debug!(id = %record.id, %source, "stale extraction; keeping newer source-owned fields");
    }

    for (metric, value) in post.metrics {
        match metric.owner() {
            MetricOwner::Shared => {
                if stamp.supersedes(record.shared_stamps.get(&metric)) {
                    record.metrics.insert(metric, value);
                    record.shared_stamps.insert(metric, stamp);
                }
            }
            _ if !metric.accepts(source) => {
                trace!(id = %record.id, %metric, %source, "ignoring metric owned by the other source");
            }
            _ => {
                if fresh {
                    record.metrics.insert(metric, value);
                }
            }
        }
    }

    record.source_mask.insert(source);
    record.note_observation(source, post.observed_at);
}

fn offer_descriptive(field: &mut Field<String>, value: Option<String>, source: Source) {
    let Some(value) = value else {
        return;
    };
    if source == Source::Csv || !field.is_from(Source::Csv) {
        *field = Field::from_source(value, source);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Metric, Metrics, PostType, SourceMask};
    use chrono::{DateTime, TimeZone, Utc};

    fn at(day: u32, hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, day, hour, 0, 0).single().unwrap()
    }

    fn post(source: Source, id: &str, observed_at: DateTime<Utc>, metrics: &[(Metric, u64)]) -> NormalizedPost {
        NormalizedPost {
            source,
            observed_at,
            id: id.to_string(),
            created_at: at(1, 0),
            post_type: None,
            message: None,
            permalink: None,
            metrics: metrics.iter().copied().collect::<Metrics>(),
        }
    }

    fn csv_p1() -> NormalizedPost {
        let mut p = post(Source::Csv, "P1", at(2, 0), &[(Metric::Reach, 500)]);
        p.post_type = PostType::from_source_tag("added_photos");
        p
    }

    fn api_p1() -> NormalizedPost {
        post(
            Source::Api,
            "P1",
            at(2, 1),
            &[
                (Metric::Like, 10),
                (Metric::Love, 2),
                (Metric::ReactionsTotal, 12),
            ],
        )
    }

    fn find<'a>(records: &'a [PostRecord], id: &str) -> &'a PostRecord {
        records.iter().find(|r| r.id == id).unwrap()
    }

    #[test]
    fn csv_and_api_rows_merge_into_one_record() {
        let outcome = Reconciler::new().apply(vec![], vec![csv_p1(), api_p1()]);
        assert_eq!(outcome.records.len(), 1);
        let p1 = &outcome.records[0];
        assert_eq!(p1.post_type, PostType::Photo);
        assert_eq!(p1.metric(Metric::Reach), Some(500));
        assert_eq!(p1.metric(Metric::Like), Some(10));
        assert_eq!(p1.metric(Metric::Love), Some(2));
        assert_eq!(p1.metric(Metric::ReactionsTotal), Some(12));
        assert_eq!(p1.metric(Metric::Views), None);
        assert_eq!(p1.metric(Metric::Haha), None);
        assert_eq!(p1.source_mask.to_string(), "api+csv");
        assert_eq!(outcome.inserted(), 1);
    }

    #[test]
    fn reapplying_a_batch_changes_nothing() {
        let reconciler = Reconciler::new();
        let batch = vec![csv_p1(), api_p1(), post(Source::Api, "P2", at(2, 1), &[(Metric::Comments, 0)])];
        let once = reconciler.apply(vec![], batch.clone());
        let twice = reconciler.apply(once.records.clone(), batch);
        assert_eq!(once.records, twice.records);
        assert!(!twice.dirty);
        assert_eq!(twice.unchanged(), 2);
    }

    #[test]
    fn reach_keeps_csv_value_when_api_runs_later() {
        let reconciler = Reconciler::new();
        let first = reconciler.apply(vec![], vec![csv_p1()]);
        let api = post(Source::Api, "P1", at(3, 0), &[(Metric::Reach, 9_999), (Metric::Views, 7)]);
        let second = reconciler.apply(first.records, vec![api]);
        let p1 = find(&second.records, "P1");
        assert_eq!(p1.metric(Metric::Reach), Some(500));
        assert_eq!(p1.metric(Metric::Views), None);
    }

    #[test]
    fn csv_never_writes_reaction_breakdown() {
        let reconciler = Reconciler::new();
        let first = reconciler.apply(vec![], vec![api_p1()]);
        let csv = post(Source::Csv, "P1", at(4, 0), &[(Metric::Like, 0)]);
        let second = reconciler.apply(first.records, vec![csv]);
        assert_eq!(find(&second.records, "P1").metric(Metric::Like), Some(10));
    }

    #[test]
    fn absent_metrics_stay_absent_and_zero_stays_zero() {
        let outcome = Reconciler::new().apply(
            vec![],
            vec![post(Source::Csv, "P3", at(2, 0), &[(Metric::Reach, 0)])],
        );
        let p3 = find(&outcome.records, "P3");
        assert_eq!(p3.metric(Metric::Reach), Some(0));
        assert_eq!(p3.metrics.len(), 1);
        assert_eq!(p3.metric(Metric::Views), None);
        assert_eq!(p3.metric(Metric::Comments), None);
    }

    #[test]
    fn shared_metrics_follow_latest_observation() {
        let reconciler = Reconciler::new();
        let old_csv = post(Source::Csv, "P1", at(2, 0), &[(Metric::Comments, 4), (Metric::Shares, 1)]);
        let new_api = post(Source::Api, "P1", at(5, 0), &[(Metric::Comments, 9)]);
        let outcome = reconciler.apply(vec![], vec![new_api, old_csv]);
        let p1 = find(&outcome.records, "P1");
        assert_eq!(p1.metric(Metric::Comments), Some(9));
        assert_eq!(p1.metric(Metric::Shares), Some(1));
        assert_eq!(p1.shared_stamps[&Metric::Comments].source, Source::Api);
    }

    #[test]
    fn equal_observation_times_prefer_csv_for_shared_metrics() {
        let api = post(Source::Api, "P1", at(2, 0), &[(Metric::Shares, 3)]);
        let csv = post(Source::Csv, "P1", at(2, 0), &[(Metric::Shares, 5)]);
        let outcome = Reconciler::new().apply(vec![], vec![csv, api]);
        assert_eq!(find(&outcome.records, "P1").metric(Metric::Shares), Some(5));
    }

    #[test]
    fn csv_descriptive_fields_win_in_either_order() {
        let mut csv = csv_p1();
        csv.message = Some("from export".into());
        let mut api = api_p1();
        api.message = Some("from graph".into());
        api.permalink = Some("https://example.test/p1".into());
        api.post_type = Some(PostType::Video);

        let reconciler = Reconciler::new();
        let first = reconciler.apply(vec![], vec![csv.clone()]);
        let second = reconciler.apply(first.records, vec![api.clone()]);
        let p1 = find(&second.records, "P1");
        assert_eq!(p1.message.value.as_deref(), Some("from export"));
        assert_eq!(p1.permalink.value.as_deref(), Some("https://example.test/p1"));
        assert_eq!(p1.post_type, PostType::Photo);

        let api_first = reconciler.apply(vec![], vec![api]);
        let mut later_csv = csv;
        later_csv.observed_at = at(9, 0);
        let merged = reconciler.apply(api_first.records, vec![later_csv]);
        let p1 = find(&merged.records, "P1");
        assert_eq!(p1.message.value.as_deref(), Some("from export"));
        assert_eq!(p1.message.source, Some(Source::Csv));
        assert_eq!(p1.post_type, PostType::Photo);
    }

    #[test]
    fn unknown_type_defaults_without_displacing_known_type() {
        let reconciler = Reconciler::new();
        let untyped = reconciler.apply(vec![], vec![post(Source::Api, "P4", at(2, 0), &[])]);
        assert_eq!(find(&untyped.records, "P4").post_type, PostType::Text);
        assert_eq!(find(&untyped.records, "P4").post_type_source, None);

        let mut typed = post(Source::Api, "P4", at(3, 0), &[]);
        typed.post_type = Some(PostType::Reel);
        let csv_unknown = post(Source::Csv, "P4", at(4, 0), &[]);
        let merged = reconciler.apply(untyped.records, vec![typed, csv_unknown]);
        assert_eq!(find(&merged.records, "P4").post_type, PostType::Reel);
    }

    #[test]
    fn stale_export_does_not_roll_back_reach() {
        let reconciler = Reconciler::new();
        let newer = post(Source::Csv, "P1", at(6, 0), &[(Metric::Reach, 800)]);
        let older = post(Source::Csv, "P1", at(2, 0), &[(Metric::Reach, 500)]);
        let first = reconciler.apply(vec![], vec![newer]);
        let second = reconciler.apply(first.records, vec![older]);
        assert_eq!(find(&second.records, "P1").metric(Metric::Reach), Some(800));
        assert!(!second.dirty);
    }

    #[test]
    fn csv_only_rerun_keeps_stored_reaction_breakdown() {
        let reconciler = Reconciler::new();
        let seeded = reconciler.apply(vec![], vec![csv_p1(), api_p1()]);
        let rerun = post(Source::Csv, "P1", at(8, 0), &[(Metric::Reach, 650)]);
        let outcome = reconciler.apply(seeded.records, vec![rerun]);
        let p1 = find(&outcome.records, "P1");
        assert_eq!(p1.metric(Metric::Reach), Some(650));
        assert_eq!(p1.metric(Metric::Like), Some(10));
        assert_eq!(p1.metric(Metric::Love), Some(2));
        assert_eq!(p1.metric(Metric::ReactionsTotal), Some(12));
        assert_eq!(outcome.updated(), 1);
    }

    #[test]
    fn ids_stay_unique_and_sorted_newest_first() {
        let mut older = post(Source::Csv, "A", at(2, 0), &[]);
        older.created_at = at(1, 0);
        let mut newer = post(Source::Api, "B", at(2, 0), &[]);
        newer.created_at = at(7, 0);
        let dup = post(Source::Api, "A", at(3, 0), &[(Metric::Like, 1)]);
        let outcome = Reconciler::new().apply(vec![], vec![older, newer, dup]);
        let ids = outcome.records.iter().map(|r| r.id.as_str()).collect::<Vec<_>>();
        assert_eq!(ids, vec!["B", "A"]);
        assert_eq!(
            find(&outcome.records, "A").source_mask,
            SourceMask::only(Source::Csv).union(SourceMask::only(Source::Api))
        );
    }
}
