//! Retrieval over partition data for an external answer generator
//!
//! The similarity index and the text generator are collaborators behind
//! traits. This module only selects partitions, filters rows into documents
//! and assembles the context string handed to the generator.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Datelike, Local, Months, NaiveDate};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::aggregate::{fold_records, PlatformBreakdown};
use crate::emitter::CollectSink;
use crate::engine::StreamEngine;
use crate::error::Result;
use crate::filter::{compose, DateRange, FilterSpec, TermPredicate};
use crate::locator::{build_timeseries_path, PartitionCategory, PartitionKey, Period};
use crate::record::{columns, FieldValue, RawRecord};

/// Files read per search
pub const MAX_FILES_PER_SEARCH: usize = 3;

/// Rows taken from each file
pub const MAX_RECORDS_PER_FILE: usize = 100;

/// Hits returned when the filter carries no limit
pub const DEFAULT_TOP_K: usize = 10;

const TREND_REPORT: &str = "trend_analysis_report.json";

/// External embedding / similarity index
#[async_trait]
pub trait SimilarityIndex: Send + Sync {
    async fn add_documents(&self, documents: Vec<AdDocument>) -> Result<()>;

    /// Top `k` documents for `query` with relevance scores in `[0, 1]`
    async fn similarity_search(&self, query: &str, k: usize) -> Result<Vec<(AdDocument, f32)>>;
}

/// External text generator
#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn generate(&self, query: &str, context: &str) -> Result<String>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Performance {
    pub play_count: f64,
    pub cost: f64,
    /// Likes per play, in percent
    pub engagement_rate: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    pub source: String,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    pub date: Option<String>,
    pub advertiser: Option<String>,
    pub genre: Option<String>,
    pub platform: Option<String>,
    pub performance: Option<Performance>,
}

/// Indexable text plus metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdDocument {
    pub content: String,
    pub metadata: DocumentMetadata,
}

impl AdDocument {
    pub fn from_record(record: &RawRecord) -> Self {
        let field = |name: &str| record.get(name).map(FieldValue::render).unwrap_or_default();

        let mut lines = vec![
            format!("Product: {}", field(columns::PRODUCT_NAME)),
            format!("Advertiser: {}", field(columns::ADVERTISER_NAME)),
            format!("Genre: {}", field(columns::GENRE_NAME)),
            format!("Platform: {}", field(columns::APP_NAME)),
            format!("Ad copy: {}", field(columns::AD_SENTENCE)),
        ];
        if let Some(opening) = record.text(columns::AD_START_SENTENCE) {
            lines.push(format!("Opening: {opening}"));
        }
        if let Some(full) = record.text(columns::AD_ALL_SENTENCE) {
            lines.push(format!("Full text: {full}"));
        }
        lines.push(format!("Plays: {}", field(columns::PLAY_COUNT)));
        lines.push(format!("Likes: {}", field(columns::DIGG_COUNT)));
        lines.push(format!("Cost: ¥{}", field(columns::COST)));
        lines.push(format!("Date: {}", field(columns::DATE)));
        lines.push(format!("Streaming period: {}", field(columns::STREAMING_PERIOD)));

        let play_count = record.number_or_zero(columns::PLAY_COUNT);
        let digg_count = record.number_or_zero(columns::DIGG_COUNT);
        let engagement_rate = if play_count > 0.0 {
            digg_count / play_count * 100.0
        } else {
            0.0
        };
        let date = record.text(columns::DATE).map(str::to_string);

        Self {
            content: lines.join("\n"),
            metadata: DocumentMetadata {
                source: format!("timeseries_data/{}", date.as_deref().unwrap_or("")),
                kind: None,
                date,
                advertiser: record.text(columns::ADVERTISER_NAME).map(str::to_string),
                genre: record.text(columns::GENRE_NAME).map(str::to_string),
                platform: record.text(columns::APP_NAME).map(str::to_string),
                performance: Some(Performance {
                    play_count,
                    cost: record.number_or_zero(columns::COST),
                    engagement_rate,
                }),
            },
        }
    }
}

/// What a free-text question asks for
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryIntent {
    pub needs_time_series: bool,
    pub needs_platform_data: bool,
    pub needs_genre_data: bool,
    pub needs_advertiser_data: bool,
    pub time_range: DateRange,
}

impl QueryIntent {
    pub fn analyze(query: &str) -> Self {
        Self::analyze_at(query, Local::now().date_naive())
    }

    /// Keyword detection plus month extraction. Without a month in the
    /// query the range is the three months up to `today`.
    pub fn analyze_at(query: &str, today: NaiveDate) -> Self {
        let lower = query.to_lowercase();
        let has = |words: &[&str]| words.iter().any(|w| lower.contains(w));

        let time_range = {
            let months = extract_months(query);
            match (months.first(), months.last()) {
                (Some(first), Some(last)) => DateRange::new(first.to_string(), last.to_string()),
                _ => {
                    let start = today.checked_sub_months(Months::new(3)).unwrap_or(today);
                    DateRange::new(month_label(start), month_label(today))
                }
            }
        };

        Self {
            needs_time_series: has(&["推移", "トレンド"]),
            needs_platform_data: has(&["instagram", "facebook", "プラットフォーム"]),
            needs_genre_data: has(&["ジャンル", "カテゴリ"]),
            needs_advertiser_data: has(&["広告主", "企業"]),
            time_range,
        }
    }

    /// Whole-series summary partitions the intent asks for
    pub fn summary_partitions(&self) -> Vec<String> {
        let wanted = [
            (self.needs_platform_data, PartitionCategory::ByPlatform),
            (self.needs_genre_data, PartitionCategory::ByGenre),
            (self.needs_advertiser_data, PartitionCategory::ByAdvertiser),
        ];
        wanted
            .into_iter()
            .filter(|(needed, _)| *needed)
            .filter_map(|(_, category)| PartitionKey::new(category, Period::All).ok())
            .map(|key| key.path())
            .collect()
    }
}

fn month_label(date: NaiveDate) -> String {
    format!("{:04}-{:02}", date.year(), date.month())
}

/// Months written as `YYYY-MM` or `YYYY年M月`, in order of appearance
fn extract_months(query: &str) -> Vec<Period> {
    let chars: Vec<char> = query.chars().collect();
    let mut found = Vec::new();
    let mut i = 0;

    while i + 4 < chars.len() {
        let year_digits = &chars[i..i + 4];
        let preceded_by_digit = i > 0 && chars[i - 1].is_ascii_digit();
        if preceded_by_digit || !year_digits.iter().all(char::is_ascii_digit) || !matches!(chars[i + 4], '年' | '-') {
            i += 1;
            continue;
        }

        let month_start = i + 5;
        let mut j = month_start;
        while j < chars.len() && j < month_start + 2 && chars[j].is_ascii_digit() {
            j += 1;
        }
        let month_ok = j > month_start && chars.get(j).map_or(true, |c| !c.is_ascii_digit());
        if month_ok {
            let year: String = year_digits.iter().collect();
            let month: String = chars[month_start..j].iter().collect();
            if let (Ok(y), Ok(m)) = (year.parse::<i32>(), month.parse::<u32>()) {
                if let Ok(period) = Period::month(y, m) {
                    found.push(period);
                    i = j;
                    continue;
                }
            }
        }
        i += 1;
    }
    found
}

/// Scored search result
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchHit {
    pub content: String,
    pub metadata: DocumentMetadata,
    pub relevance_score: f32,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct TrendReport {
    #[serde(default)]
    analysis_period: Option<TrendPeriod>,
    #[serde(default)]
    summary: Option<TrendSummary>,
    #[serde(default)]
    key_trends: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct TrendPeriod {
    start: Option<String>,
    end: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct TrendSummary {
    total_ads: Option<f64>,
    total_cost: Option<f64>,
}

/// Partition-backed retrieval in front of a similarity index
pub struct Retriever {
    engine: Arc<StreamEngine>,
    index: Arc<dyn SimilarityIndex>,
    generator: Option<Arc<dyn TextGenerator>>,
}

impl std::fmt::Debug for Retriever {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Retriever")
            .field("engine", &self.engine)
            .field("has_generator", &self.generator.is_some())
            .finish()
    }
}

impl Retriever {
    pub fn new(engine: Arc<StreamEngine>, index: Arc<dyn SimilarityIndex>) -> Self {
        Self {
            engine,
            index,
            generator: None,
        }
    }

    pub fn with_generator(mut self, generator: Arc<dyn TextGenerator>) -> Self {
        self.generator = Some(generator);
        self
    }

    pub fn has_generator(&self) -> bool {
        self.generator.is_some()
    }

    /// Seed the index with the trend report and per-platform summaries.
    /// Either source may be absent. Returns the number of documents added.
    pub async fn initialize(&self) -> Result<usize> {
        self.engine.config().require_bucket()?;
        let mut documents = Vec::new();

        match self.trend_document().await {
            Ok(Some(doc)) => documents.push(doc),
            Ok(None) => {}
            Err(e) => warn!(error = %e, "trend report unavailable"),
        }
        match self.platform_documents().await {
            Ok(docs) => documents.extend(docs),
            Err(e) => warn!(error = %e, "platform summary skipped"),
        }

        let added = documents.len();
        if added > 0 {
            self.index.add_documents(documents).await?;
        }
        info!(documents = added, "retrieval index seeded");
        Ok(added)
    }

    async fn trend_document(&self) -> Result<Option<AdDocument>> {
        let path = build_timeseries_path("trends", TREND_REPORT);
        let raw = match self.engine.reader().read_all(&path).await {
            Ok(raw) => raw,
            Err(e) if e.is_not_found() || e.is_permission_denied() => {
                warn!(path = %path, "trend report not accessible");
                return Ok(None);
            }
            Err(e) => return Err(e),
        };
        let report: TrendReport = serde_json::from_slice(&raw)?;
        let Some(summary) = report.summary else {
            return Ok(None);
        };

        let period = report.analysis_period.unwrap_or_default();
        let mut content = format!(
            "Ad trend summary\nPeriod: {} to {}\nTotal ads: {}\nTotal cost: ¥{}\n\nKey trends:",
            period.start.unwrap_or_default(),
            period.end.unwrap_or_default(),
            summary.total_ads.unwrap_or(0.0),
            summary.total_cost.unwrap_or(0.0),
        );
        for trend in &report.key_trends {
            content.push_str("\n- ");
            content.push_str(trend);
        }

        Ok(Some(AdDocument {
            content,
            metadata: DocumentMetadata {
                source: "trend_analysis".into(),
                kind: Some("summary".into()),
                date: Some(Local::now().date_naive().to_string()),
                ..Default::default()
            },
        }))
    }

    async fn platform_documents(&self) -> Result<Vec<AdDocument>> {
        let path = PartitionKey::new(PartitionCategory::ByPlatform, Period::All)?.path();
        let mut sink = CollectSink::new();
        let spec = FilterSpec::default().with_limit(MAX_RECORDS_PER_FILE);
        self.engine.emitter().emit(&[path], &spec, &mut sink).await?;

        let breakdown = fold_records(sink.into_records(), PlatformBreakdown::default(), PlatformBreakdown::fold);
        Ok(breakdown
            .summary()
            .into_iter()
            .map(|p| {
                let avg_play = if p.stats.record_count > 0 {
                    p.stats.total_play_count / p.stats.record_count as f64
                } else {
                    0.0
                };
                AdDocument {
                    content: format!(
                        "Platform: {}\nAds: {}\nTotal cost: ¥{}\nAverage plays: {}",
                        p.stats.platform,
                        p.stats.total_ads,
                        p.stats.total_cost,
                        avg_play.round()
                    ),
                    metadata: DocumentMetadata {
                        source: "platform_stats".into(),
                        kind: Some("statistics".into()),
                        platform: Some(p.stats.platform.clone()),
                        ..Default::default()
                    },
                }
            })
            .collect())
    }

    /// Files a search reads: partitions in range, then summary partitions
    /// for the intent, capped at [`MAX_FILES_PER_SEARCH`].
    pub fn select_files(&self, intent: &QueryIntent, filters: &FilterSpec) -> Result<Vec<String>> {
        let range = filters.date_range.as_ref().unwrap_or(&intent.time_range);
        let (start, end) = range.bounds()?;
        let mut files = self.engine.catalog().candidate_paths(start, end);
        files.extend(intent.summary_partitions());
        files.truncate(MAX_FILES_PER_SEARCH);
        Ok(files)
    }

    /// Filter rows matching the query terms into documents, index them and
    /// return the top hits. Unreadable files are skipped.
    pub async fn search(&self, query: &str, filters: &FilterSpec) -> Result<Vec<SearchHit>> {
        self.engine.config().require_bucket()?;
        let intent = QueryIntent::analyze(query);
        let files = self.select_files(&intent, filters)?;

        let row_filter = FilterSpec {
            date_range: None,
            limit: None,
            ..filters.clone()
        };
        let emitter = self.engine.emitter();
        let mut documents = Vec::new();

        for file in &files {
            let predicate = compose(&row_filter)?.and(TermPredicate::new(query));
            let mut sink = CollectSink::new();
            let summary = emitter
                .emit_matching(std::slice::from_ref(file), &predicate, Some(MAX_RECORDS_PER_FILE), &mut sink)
                .await?;
            if summary.has_failures() || summary.missing().next().is_some() {
                warn!(path = %file, "file skipped");
            }
            debug!(path = %file, documents = sink.len(), "documents extracted");
            documents.extend(sink.into_records().iter().map(AdDocument::from_record));
        }

        if documents.is_empty() {
            return Ok(Vec::new());
        }
        self.index.add_documents(documents).await?;

        let k = filters.limit.unwrap_or(DEFAULT_TOP_K);
        let hits = self.index.similarity_search(query, k).await?;
        Ok(hits
            .into_iter()
            .map(|(doc, score)| SearchHit {
                content: doc.content,
                metadata: doc.metadata,
                relevance_score: score,
            })
            .collect())
    }

    /// Answer with the generator when one is configured and succeeds,
    /// otherwise list the hits.
    pub async fn answer(&self, query: &str, hits: &[SearchHit]) -> String {
        if let Some(generator) = &self.generator {
            match generator.generate(query, &assemble_context(hits)).await {
                Ok(text) => return text,
                Err(e) => warn!(error = %e, "generation failed, answering with data only"),
            }
        }
        data_only_response(query, hits)
    }
}

/// Prompt context: one numbered block per hit
pub fn assemble_context(hits: &[SearchHit]) -> String {
    hits.iter()
        .enumerate()
        .map(|(i, hit)| {
            format!(
                "[Result {}]\n{}\nRelevance: {:.1}%\nPlatform: {}\nDate: {}",
                i + 1,
                hit.content,
                hit.relevance_score * 100.0,
                hit.metadata.platform.as_deref().unwrap_or("-"),
                hit.metadata.date.as_deref().unwrap_or("-"),
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

pub fn data_only_response(query: &str, hits: &[SearchHit]) -> String {
    let mut out = format!("Found {} records related to \"{}\":\n\n", hits.len(), query);
    for (i, hit) in hits.iter().enumerate() {
        let (plays, cost) = hit
            .metadata
            .performance
            .as_ref()
            .map_or((0.0, 0.0), |p| (p.play_count, p.cost));
        out.push_str(&format!(
            "[{}]\n{}\n- Platform: {}\n- Date: {}\n- Plays: {}\n- Cost: ¥{}\n\n",
            i + 1,
            hit.content,
            hit.metadata.platform.as_deref().unwrap_or("-"),
            hit.metadata.date.as_deref().unwrap_or("-"),
            plays,
            cost,
        ));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_intent_keywords() {
        let intent = QueryIntent::analyze_at("Instagramのジャンル別トレンド", day(2025, 3, 15));
        assert!(intent.needs_platform_data);
        assert!(intent.needs_genre_data);
        assert!(intent.needs_time_series);
        assert!(!intent.needs_advertiser_data);
        assert_eq!(
            intent.summary_partitions(),
            vec![
                "timeseries_data/by_platform/platform_timeseries.parquet",
                "timeseries_data/by_genre/genre_timeseries.parquet",
            ]
        );
    }

    #[test]
    fn test_intent_extracts_months() {
        let intent = QueryIntent::analyze_at("2024年1月から2024年3月の広告主", day(2025, 3, 15));
        assert_eq!(intent.time_range, DateRange::new("2024-01", "2024-03"));
        assert!(intent.needs_advertiser_data);

        let intent = QueryIntent::analyze_at("costs for 2024-11", day(2025, 3, 15));
        assert_eq!(intent.time_range, DateRange::new("2024-11", "2024-11"));
    }

    #[test]
    fn test_intent_defaults_to_last_three_months() {
        let intent = QueryIntent::analyze_at("best ads", day(2025, 3, 15));
        assert_eq!(intent.time_range, DateRange::new("2024-12", "2025-03"));
    }

    #[test]
    fn test_document_from_record() {
        let record = RawRecord::new()
            .with(columns::PRODUCT_NAME, "Serum")
            .with(columns::APP_NAME, "Instagram")
            .with(columns::PLAY_COUNT, 200i64)
            .with(columns::DIGG_COUNT, 10i64)
            .with(columns::COST, 1500.0)
            .with(columns::DATE, "2024-03-01");
        let doc = AdDocument::from_record(&record);
        assert!(doc.content.contains("Product: Serum"));
        assert!(doc.content.contains("Cost: ¥1500"));
        assert!(!doc.content.contains("Opening:"));
        let perf = doc.metadata.performance.unwrap();
        assert_eq!(perf.engagement_rate, 5.0);
        assert_eq!(doc.metadata.source, "timeseries_data/2024-03-01");
    }

    #[test]
    fn test_context_and_data_only_response() {
        let hit = SearchHit {
            content: "Product: Serum".into(),
            metadata: DocumentMetadata {
                platform: Some("Instagram".into()),
                date: Some("2024-03-01".into()),
                performance: Some(Performance {
                    play_count: 200.0,
                    cost: 1500.0,
                    engagement_rate: 5.0,
                }),
                ..Default::default()
            },
            relevance_score: 0.875,
        };
        let context = assemble_context(std::slice::from_ref(&hit));
        assert!(context.starts_with("[Result 1]\nProduct: Serum"));
        assert!(context.contains("Relevance: 87.5%"));

        let text = data_only_response("serum", &[hit]);
        assert!(text.starts_with("Found 1 records related to \"serum\""));
        assert!(text.contains("- Plays: 200"));
    }
}
