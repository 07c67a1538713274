//! Query facade: request parameters → plan → emitter
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use futures::StreamExt;
//! use polarway_stream::{RemoteStore, StreamConfig, StreamEngine, StreamRequest};
//!
//! # async fn example() -> polarway_stream::Result<()> {
//! let store = RemoteStore::local("/data/ads")?;
//! let engine = StreamEngine::new(StreamConfig::new("ads"), Arc::new(store))?;
//! engine.refresh_catalog().await?;
//!
//! let request = StreamRequest::month("2025_03").with_min_play_count(100.0);
//! let mut lines = engine.stream_ndjson(&request)?;
//! while let Some(_line) = lines.next().await {
//!     // write the line to a chunked response body
//! }
//! let summary = lines.finish().await?;
//! println!("{} records", summary.emitted);
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use chrono::NaiveDate;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::aggregate::{AggregateReport, Aggregator, DailyStats, GenreBreakdown, PlatformBreakdown};
use crate::catalog::PartitionCatalog;
use crate::config::StreamConfig;
use crate::decoder::{ActiveBackend, ColumnarDecoder};
use crate::emitter::{
    CollectSink, EmitSummary, NdjsonStream, PartitionReport, RecordSink, RecordStream, StreamEmitter,
};
use crate::error::{Result, StreamError};
use crate::filter::{DateRange, FilterSpec};
use crate::locator::{build_timeseries_path, PartitionCategory, PartitionKey, Period, TIMESERIES_ROOT};
use crate::record::{FieldInfo, RawRecord};
use crate::store::ObjectReader;

/// Month streamed when a request names none
pub const DEFAULT_YEAR_MONTH: &str = "2025_03";

/// Upstream query parameters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StreamRequest {
    #[serde(alias = "year_month")]
    pub year_month: Option<String>,
    pub platform: Option<String>,
    pub genre: Option<String>,
    pub advertiser: Option<String>,
    #[serde(alias = "min_play_count")]
    pub min_play_count: Option<f64>,
    #[serde(alias = "min_cost")]
    pub min_cost: Option<f64>,
    pub limit: Option<usize>,
    /// Range start (`YYYY-MM` or `YYYY-MM-DD`); overrides `year_month` together with `end`
    pub start: Option<String>,
    pub end: Option<String>,
}

impl StreamRequest {
    pub fn month(year_month: impl Into<String>) -> Self {
        Self {
            year_month: Some(year_month.into()),
            ..Default::default()
        }
    }

    pub fn range(start: impl Into<String>, end: impl Into<String>) -> Self {
        Self {
            start: Some(start.into()),
            end: Some(end.into()),
            ..Default::default()
        }
    }

    pub fn with_platform(mut self, platform: impl Into<String>) -> Self {
        self.platform = Some(platform.into());
        self
    }

    pub fn with_genre(mut self, genre: impl Into<String>) -> Self {
        self.genre = Some(genre.into());
        self
    }

    pub fn with_advertiser(mut self, advertiser: impl Into<String>) -> Self {
        self.advertiser = Some(advertiser.into());
        self
    }

    pub fn with_min_play_count(mut self, n: f64) -> Self {
        self.min_play_count = Some(n);
        self
    }

    pub fn with_min_cost(mut self, cost: f64) -> Self {
        self.min_cost = Some(cost);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn year_month(&self) -> &str {
        self.year_month
            .as_deref()
            .filter(|m| !m.trim().is_empty())
            .unwrap_or(DEFAULT_YEAR_MONTH)
    }

    fn date_range(&self) -> Result<Option<DateRange>> {
        match (non_blank(&self.start), non_blank(&self.end)) {
            (None, None) => Ok(None),
            (Some(start), Some(end)) => Ok(Some(DateRange::new(start, end))),
            _ => Err(StreamError::InvalidArgument(
                "date range needs both start and end".into(),
            )),
        }
    }

    fn filter_spec(&self, default_limit: usize) -> FilterSpec {
        FilterSpec {
            platform: self.platform.clone(),
            genre: self.genre.clone(),
            advertiser: self.advertiser.clone(),
            min_play_count: self.min_play_count,
            min_cost: self.min_cost,
            date_range: None,
            limit: Some(self.limit.unwrap_or(default_limit)),
        }
    }
}

fn non_blank(v: &Option<String>) -> Option<&str> {
    v.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

/// Partitions to read and the filter to apply
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryPlan {
    pub partitions: Vec<String>,
    pub filter: FilterSpec,
}

/// Buffered query response
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryResult {
    pub success: bool,
    pub count: usize,
    pub data: Vec<RawRecord>,
    pub partitions: Vec<PartitionReport>,
    pub degraded: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineStatus {
    pub bucket: Option<String>,
    pub backend: ActiveBackend,
    pub catalog_partitions: usize,
    pub catalog_rows: u64,
    pub catalog_bytes: u64,
    pub chunk_threshold: usize,
    pub max_partitions_per_query: usize,
}

/// Entry point composing store, decoder and catalog
pub struct StreamEngine {
    config: StreamConfig,
    reader: Arc<dyn ObjectReader>,
    decoder: Arc<ColumnarDecoder>,
    catalog: RwLock<Arc<PartitionCatalog>>,
}

impl std::fmt::Debug for StreamEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamEngine")
            .field("config", &self.config)
            .field("decoder", &self.decoder)
            .field("catalog_partitions", &self.catalog.read().len())
            .finish()
    }
}

impl StreamEngine {
    pub fn new(config: StreamConfig, reader: Arc<dyn ObjectReader>) -> Result<Self> {
        config.validate()?;
        let decoder = Arc::new(ColumnarDecoder::from_config(&config));
        Ok(Self {
            config,
            reader,
            decoder,
            catalog: RwLock::new(Arc::new(PartitionCatalog::new())),
        })
    }

    /// Replace the decoder, e.g. with one built from custom backend factories
    pub fn with_decoder(mut self, decoder: Arc<ColumnarDecoder>) -> Self {
        self.decoder = decoder;
        self
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    pub fn reader(&self) -> &Arc<dyn ObjectReader> {
        &self.reader
    }

    pub fn decoder(&self) -> &Arc<ColumnarDecoder> {
        &self.decoder
    }

    pub fn catalog(&self) -> Arc<PartitionCatalog> {
        Arc::clone(&*self.catalog.read())
    }

    pub fn replace_catalog(&self, catalog: PartitionCatalog) {
        *self.catalog.write() = Arc::new(catalog);
    }

    /// Rebuild the catalog from the manifest, or from a listing of the raw
    /// partition directory when the manifest yields nothing. Returns the entry count.
    #[instrument(skip(self))]
    pub async fn refresh_catalog(&self) -> Result<usize> {
        let mut catalog = PartitionCatalog::build(self.reader.as_ref(), &self.config.manifest_path).await?;
        if catalog.is_empty() {
            let prefix = build_timeseries_path("", PartitionCategory::Raw.directory().unwrap_or(""));
            match PartitionCatalog::build_from_listing(self.reader.as_ref(), &prefix).await {
                Ok(listed) => catalog = listed,
                Err(e) if e.is_not_found() || e.is_permission_denied() => {
                    warn!(prefix = %prefix, error = %e, "partition listing unavailable");
                }
                Err(e) => return Err(e),
            }
        }
        let len = catalog.len();
        self.replace_catalog(catalog);
        info!(partitions = len, "catalog refreshed");
        Ok(len)
    }

    pub fn emitter(&self) -> StreamEmitter {
        StreamEmitter::new(
            Arc::clone(&self.reader),
            Arc::clone(&self.decoder),
            self.config.chunk_threshold,
            self.config.max_partitions_per_query,
        )
    }

    /// Resolve a request into partition paths and a filter.
    ///
    /// A `start`/`end` range selects catalog partitions (or locator-built
    /// monthly paths when the catalog is empty) and adds a date clause;
    /// otherwise the single raw partition of `year_month` is read.
    pub fn plan(&self, request: &StreamRequest) -> Result<QueryPlan> {
        self.config.require_bucket()?;
        let mut filter = request.filter_spec(self.config.default_limit);

        let partitions = match request.date_range()? {
            Some(range) => {
                let (start, end) = range.bounds()?;
                filter.date_range = Some(range);
                self.catalog().candidate_paths(start, end)
            }
            None => {
                let period = Period::parse(request.year_month())?;
                vec![PartitionKey::new(PartitionCategory::Raw, period)?.path()]
            }
        };

        Ok(QueryPlan { partitions, filter })
    }

    /// NDJSON line stream for a chunked, no-cache HTTP response
    pub fn stream_ndjson(&self, request: &StreamRequest) -> Result<NdjsonStream> {
        let plan = self.plan(request)?;
        Ok(self
            .emitter()
            .spawn_ndjson(plan.partitions, plan.filter, self.config.ndjson_line_capacity()))
    }

    /// Record stream fed by a background emitter
    pub fn stream(&self, request: &StreamRequest) -> Result<RecordStream> {
        let plan = self.plan(request)?;
        Ok(self
            .emitter()
            .spawn_records(plan.partitions, plan.filter, self.config.record_queue_capacity))
    }

    /// Emit into a caller-provided sink on the current task
    pub async fn emit(&self, request: &StreamRequest, sink: &mut dyn RecordSink) -> Result<EmitSummary> {
        let plan = self.plan(request)?;
        self.emitter().emit(&plan.partitions, &plan.filter, sink).await
    }

    /// Run a request to completion and buffer the result
    pub async fn query(&self, request: &StreamRequest) -> Result<QueryResult> {
        let mut sink = CollectSink::new();
        let summary = self.emit(request, &mut sink).await?;
        let data = sink.into_records();
        Ok(QueryResult {
            success: true,
            count: data.len(),
            data,
            partitions: summary.partitions,
            degraded: summary.degraded,
        })
    }

    /// Fold the records a request selects
    pub async fn aggregate<A, F>(&self, request: &StreamRequest, init: A, f: F) -> Result<AggregateReport<A>>
    where
        A: Send,
        F: FnMut(A, &RawRecord) -> A + Send,
    {
        let plan = self.plan(request)?;
        Aggregator::new(self.emitter())
            .aggregate(&plan.partitions, &plan.filter, init, f)
            .await
    }

    /// Per-platform totals from the platform time series
    pub async fn platform_summary(
        &self,
        platform: Option<&str>,
        range: Option<DateRange>,
    ) -> Result<AggregateReport<PlatformBreakdown>> {
        let spec = FilterSpec {
            platform: platform.map(str::to_string),
            date_range: range,
            ..Default::default()
        };
        self.summarize(PartitionCategory::ByPlatform, &spec, PlatformBreakdown::default(), PlatformBreakdown::fold)
            .await
    }

    /// Per-genre totals from the genre time series
    pub async fn genre_summary(&self, range: Option<DateRange>) -> Result<AggregateReport<GenreBreakdown>> {
        let spec = FilterSpec {
            date_range: range,
            ..Default::default()
        };
        self.summarize(PartitionCategory::ByGenre, &spec, GenreBreakdown::default(), GenreBreakdown::fold)
            .await
    }

    /// Statistics over the daily aggregation series
    pub async fn daily_summary(&self, range: Option<DateRange>) -> Result<AggregateReport<DailyStats>> {
        let spec = FilterSpec {
            date_range: range,
            ..Default::default()
        };
        self.summarize(PartitionCategory::Daily, &spec, DailyStats::default(), DailyStats::fold)
            .await
    }

    async fn summarize<A, F>(
        &self,
        category: PartitionCategory,
        spec: &FilterSpec,
        init: A,
        f: F,
    ) -> Result<AggregateReport<A>>
    where
        A: Send,
        F: FnMut(A, &RawRecord) -> A + Send,
    {
        self.config.require_bucket()?;
        let path = PartitionKey::new(category, Period::All)?.path();
        Aggregator::new(self.emitter())
            .aggregate(&[path], spec, init, f)
            .await
    }

    /// Column description of one object. Missing objects are errors; an
    /// undecodable object gives an empty list.
    pub async fn schema(&self, path: &str) -> Result<Vec<FieldInfo>> {
        if !path.starts_with(TIMESERIES_ROOT) {
            warn!(path = %path, "schema requested outside the time-series tree");
        }
        let bytes = self.reader.read_all(path).await?;
        Ok(self.decoder.schema(&bytes))
    }

    pub fn status(&self) -> EngineStatus {
        let catalog = self.catalog();
        EngineStatus {
            bucket: self.config.bucket.clone(),
            backend: self.decoder.active_backend(),
            catalog_partitions: catalog.len(),
            catalog_rows: catalog.total_rows(),
            catalog_bytes: catalog.total_bytes(),
            chunk_threshold: self.config.chunk_threshold,
            max_partitions_per_query: self.config.max_partitions_per_query,
        }
    }
}

/// First and last day of a request's range, if it carries one
pub fn request_bounds(request: &StreamRequest) -> Result<Option<(NaiveDate, NaiveDate)>> {
    request.date_range()?.map(|r| r.bounds()).transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::RemoteStore;

    fn engine(bucket: Option<&str>) -> StreamEngine {
        let mut config = StreamConfig::default();
        config.bucket = bucket.map(str::to_string);
        StreamEngine::new(config, Arc::new(RemoteStore::in_memory())).unwrap()
    }

    #[test]
    fn test_default_request_plans_default_month() {
        let plan = engine(Some("ads")).plan(&StreamRequest::default()).unwrap();
        assert_eq!(
            plan.partitions,
            vec!["timeseries_data/raw_consolidated/consolidated_2025_03.parquet"]
        );
        assert_eq!(plan.filter.limit, Some(1000));
        assert!(plan.filter.date_range.is_none());
    }

    #[test]
    fn test_missing_bucket_is_config_error() {
        let err = engine(None).plan(&StreamRequest::default()).unwrap_err();
        assert!(matches!(err, StreamError::Config(_)));
    }

    #[test]
    fn test_range_request_without_catalog() {
        let plan = engine(Some("ads"))
            .plan(&StreamRequest::range("2024-01", "2024-02").with_limit(5))
            .unwrap();
        assert_eq!(plan.partitions.len(), 2);
        assert_eq!(plan.filter.limit, Some(5));
        assert_eq!(plan.filter.date_range, Some(DateRange::new("2024-01", "2024-02")));
    }

    #[test]
    fn test_half_range_rejected() {
        let request = StreamRequest {
            start: Some("2024-01".into()),
            ..Default::default()
        };
        assert!(engine(Some("ads")).plan(&request).is_err());
    }

    #[test]
    fn test_request_deserializes_camel_case() {
        let request: StreamRequest =
            serde_json::from_str(r#"{"yearMonth": "2024_11", "minPlayCount": 100, "limit": 10}"#).unwrap();
        assert_eq!(request.year_month(), "2024_11");
        assert_eq!(request.min_play_count, Some(100.0));
        assert_eq!(
            request_bounds(&StreamRequest::range("2024-02", "2024-02")).unwrap(),
            Some((
                NaiveDate::from_ymd_opt(2024, 2, 1).unwrap(),
                NaiveDate::from_ymd_opt(2024, 2, 29).unwrap()
            ))
        );
    }

    #[tokio::test]
    async fn test_status_reports_pending_backend() {
        let engine = engine(Some("ads"));
        let status = engine.status();
        assert_eq!(status.backend, ActiveBackend::Pending);
        assert_eq!(status.catalog_partitions, 0);
        assert_eq!(engine.refresh_catalog().await.unwrap(), 0);
    }
}
