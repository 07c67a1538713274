//! Folding record streams into summaries
//!
//! Folds are sequential and follow stream order, so floating-point sums are
//! reproducible for a given partition order.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use futures::{pin_mut, Stream, StreamExt};
use serde::Serialize;

use crate::emitter::{Delivery, EmitSummary, RecordSink, StreamEmitter};
use crate::error::Result;
use crate::filter::FilterSpec;
use crate::record::{columns, RawRecord};

/// Fold an async record stream
pub async fn fold<S, A, F>(stream: S, init: A, mut f: F) -> A
where
    S: Stream<Item = RawRecord>,
    F: FnMut(A, &RawRecord) -> A,
{
    pin_mut!(stream);
    let mut acc = init;
    while let Some(record) = stream.next().await {
        acc = f(acc, &record);
    }
    acc
}

/// Fold an in-memory record sequence
pub fn fold_records<I, A, F>(records: I, init: A, mut f: F) -> A
where
    I: IntoIterator<Item = RawRecord>,
    F: FnMut(A, &RawRecord) -> A,
{
    records.into_iter().fold(init, |acc, record| f(acc, &record))
}

/// Sink that folds instead of forwarding. The accumulator only leaves through
/// [`FoldSink::into_parts`].
struct FoldSink<A, F> {
    acc: Option<A>,
    f: F,
    count: usize,
}

impl<A, F> FoldSink<A, F> {
    fn into_parts(self) -> (Option<A>, usize) {
        (self.acc, self.count)
    }
}

#[async_trait]
impl<A, F> RecordSink for FoldSink<A, F>
where
    A: Send,
    F: FnMut(A, &RawRecord) -> A + Send,
{
    async fn push(&mut self, record: RawRecord) -> Result<Delivery> {
        if let Some(acc) = self.acc.take() {
            self.acc = Some((self.f)(acc, &record));
        }
        self.count += 1;
        Ok(Delivery::Accepted)
    }

    fn is_closed(&self) -> bool {
        false
    }
}

/// Result of an emitter-driven fold
#[derive(Debug, Clone, Serialize)]
pub struct AggregateReport<A> {
    pub value: A,
    pub count: usize,
    pub summary: EmitSummary,
}

/// Folds filtered partition records through the emitter pipeline
#[derive(Debug, Clone)]
pub struct Aggregator {
    emitter: StreamEmitter,
}

impl Aggregator {
    pub fn new(emitter: StreamEmitter) -> Self {
        Self { emitter }
    }

    pub async fn aggregate<A, F>(
        &self,
        partitions: &[String],
        spec: &FilterSpec,
        init: A,
        f: F,
    ) -> Result<AggregateReport<A>>
    where
        A: Send,
        F: FnMut(A, &RawRecord) -> A + Send,
    {
        let mut sink = FoldSink {
            acc: Some(init),
            f,
            count: 0,
        };
        let summary = self.emitter.emit(partitions, spec, &mut sink).await?;
        let (acc, count) = sink.into_parts();
        let value = acc.ok_or_else(|| {
            crate::error::StreamError::Internal("fold accumulator lost".into())
        })?;
        Ok(AggregateReport { value, count, summary })
    }
}

/// Running totals over raw ad rows
#[derive(Debug, Clone, Default)]
pub struct RunningTotals {
    records: u64,
    cost: f64,
    play_count: f64,
    digg_count: f64,
    advertisers: BTreeSet<String>,
    products: BTreeSet<String>,
    genres: BTreeSet<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TotalsSummary {
    pub records: u64,
    pub total_cost: f64,
    pub total_play_count: f64,
    pub total_digg_count: f64,
    pub avg_play_count: f64,
    pub avg_cost: f64,
    pub unique_advertisers: usize,
    pub unique_products: usize,
    pub unique_genres: usize,
}

impl RunningTotals {
    pub fn observe(&mut self, record: &RawRecord) {
        self.records += 1;
        self.cost += record.number_or_zero(columns::COST);
        self.play_count += record.number_or_zero(columns::PLAY_COUNT);
        self.digg_count += record.number_or_zero(columns::DIGG_COUNT);
        if let Some(name) = record.text(columns::ADVERTISER_NAME) {
            self.advertisers.insert(name.to_string());
        }
        if let Some(name) = record.text(columns::PRODUCT_NAME) {
            self.products.insert(name.to_string());
        }
        if let Some(name) = record.text(columns::GENRE_NAME) {
            self.genres.insert(name.to_string());
        }
    }

    /// Fold step
    pub fn fold(mut self, record: &RawRecord) -> Self {
        self.observe(record);
        self
    }

    pub fn records(&self) -> u64 {
        self.records
    }

    pub fn summary(&self) -> TotalsSummary {
        let n = self.records as f64;
        let avg = |total: f64| if self.records > 0 { total / n } else { 0.0 };
        TotalsSummary {
            records: self.records,
            total_cost: self.cost,
            total_play_count: self.play_count,
            total_digg_count: self.digg_count,
            avg_play_count: avg(self.play_count),
            avg_cost: avg(self.cost),
            unique_advertisers: self.advertisers.len(),
            unique_products: self.products.len(),
            unique_genres: self.genres.len(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlatformStats {
    pub platform: String,
    pub total_ads: f64,
    pub total_cost: f64,
    pub total_play_count: f64,
    pub total_digg_count: f64,
    pub record_count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlatformSummary {
    #[serde(flatten)]
    pub stats: PlatformStats,
    pub avg_play_per_ad: f64,
    pub avg_cost_per_ad: f64,
    /// Share of the cost across all platforms, in percent to 2 decimals
    pub percentage: f64,
}

/// Per-platform totals. Reads summary columns (`ad_count`, `total_*`) when
/// present and raw row columns otherwise, where every row is one ad.
#[derive(Debug, Clone, Default)]
pub struct PlatformBreakdown {
    platforms: BTreeMap<String, PlatformStats>,
}

impl PlatformBreakdown {
    pub fn observe(&mut self, record: &RawRecord) {
        let platform = record.text(columns::APP_NAME).unwrap_or("unknown");
        let stats = self
            .platforms
            .entry(platform.to_string())
            .or_insert_with(|| PlatformStats {
                platform: platform.to_string(),
                ..Default::default()
            });
        stats.total_ads += record.number(columns::AD_COUNT).unwrap_or(1.0);
        stats.total_cost += summary_or_raw(record, columns::TOTAL_COST, columns::COST);
        stats.total_play_count += summary_or_raw(record, columns::TOTAL_PLAY_COUNT, columns::PLAY_COUNT);
        stats.total_digg_count += summary_or_raw(record, columns::TOTAL_DIGG_COUNT, columns::DIGG_COUNT);
        stats.record_count += 1;
    }

    pub fn fold(mut self, record: &RawRecord) -> Self {
        self.observe(record);
        self
    }

    pub fn platforms(&self) -> impl Iterator<Item = &str> {
        self.platforms.keys().map(String::as_str)
    }

    /// Per-platform stats with per-ad averages, highest total cost first
    pub fn summary(&self) -> Vec<PlatformSummary> {
        let cost_all: f64 = self.platforms.values().map(|s| s.total_cost).sum();
        let mut out: Vec<PlatformSummary> = self
            .platforms
            .values()
            .map(|stats| PlatformSummary {
                avg_play_per_ad: ratio(stats.total_play_count, stats.total_ads),
                avg_cost_per_ad: ratio(stats.total_cost, stats.total_ads),
                percentage: round2(ratio(stats.total_cost, cost_all) * 100.0),
                stats: stats.clone(),
            })
            .collect();
        out.sort_by(|a, b| b.stats.total_cost.total_cmp(&a.stats.total_cost));
        out
    }
}

/// Genres reported by [`GenreBreakdown::summary`]
pub const TOP_GENRES: usize = 10;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenreSummary {
    pub genre: String,
    pub total_ads: f64,
    pub total_cost: f64,
    /// Rounded to 2 decimals
    pub avg_cost_per_ad: f64,
}

/// Per-genre totals over the genre time series, or raw rows (one ad each)
#[derive(Debug, Clone, Default)]
pub struct GenreBreakdown {
    genres: BTreeMap<String, (f64, f64)>,
}

impl GenreBreakdown {
    pub fn observe(&mut self, record: &RawRecord) {
        let genre = record.text(columns::GENRE_NAME).unwrap_or("unknown");
        let ads = record
            .number(columns::AD_COUNT)
            .or_else(|| record.number(columns::TOTAL_ADS))
            .unwrap_or(1.0);
        let (total_ads, total_cost) = self.genres.entry(genre.to_string()).or_default();
        *total_ads += ads;
        *total_cost += summary_or_raw(record, columns::TOTAL_COST, columns::COST);
    }

    pub fn fold(mut self, record: &RawRecord) -> Self {
        self.observe(record);
        self
    }

    pub fn len(&self) -> usize {
        self.genres.len()
    }

    pub fn is_empty(&self) -> bool {
        self.genres.is_empty()
    }

    /// The [`TOP_GENRES`] genres with the highest total cost, highest first
    pub fn summary(&self) -> Vec<GenreSummary> {
        let mut out: Vec<GenreSummary> = self
            .genres
            .iter()
            .map(|(genre, &(total_ads, total_cost))| GenreSummary {
                genre: genre.clone(),
                total_ads,
                total_cost,
                avg_cost_per_ad: round2(ratio(total_cost, total_ads)),
            })
            .collect();
        out.sort_by(|a, b| b.total_cost.total_cmp(&a.total_cost));
        out.truncate(TOP_GENRES);
        out
    }
}

fn ratio(total: f64, count: f64) -> f64 {
    if count > 0.0 {
        total / count
    } else {
        0.0
    }
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

fn summary_or_raw(record: &RawRecord, summary: &str, raw: &str) -> f64 {
    record
        .number(summary)
        .or_else(|| record.number(raw))
        .unwrap_or(0.0)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DateSpan {
    pub start: String,
    pub end: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DailySummary {
    pub total_records: u64,
    pub total_ads: f64,
    pub total_cost: f64,
    pub avg_daily_ads: f64,
    pub date_range: Option<DateSpan>,
}

/// Statistics over daily aggregation rows
#[derive(Debug, Clone, Default)]
pub struct DailyStats {
    records: u64,
    ads: f64,
    cost: f64,
    first: Option<String>,
    last: Option<String>,
}

impl DailyStats {
    pub fn observe(&mut self, record: &RawRecord) {
        self.records += 1;
        self.ads += record.number(columns::TOTAL_ADS).unwrap_or(1.0);
        self.cost += summary_or_raw(record, columns::TOTAL_COST, columns::COST);
        if let Some(date) = record.text(columns::DATE) {
            if self.first.as_deref().map_or(true, |d| date < d) {
                self.first = Some(date.to_string());
            }
            if self.last.as_deref().map_or(true, |d| date > d) {
                self.last = Some(date.to_string());
            }
        }
    }

    pub fn fold(mut self, record: &RawRecord) -> Self {
        self.observe(record);
        self
    }

    pub fn summary(&self) -> DailySummary {
        DailySummary {
            total_records: self.records,
            total_ads: self.ads,
            total_cost: self.cost,
            avg_daily_ads: if self.records > 0 {
                self.ads / self.records as f64
            } else {
                0.0
            },
            date_range: match (&self.first, &self.last) {
                (Some(start), Some(end)) => Some(DateSpan {
                    start: start.clone(),
                    end: end.clone(),
                }),
                _ => None,
            },
        }
    }
}
