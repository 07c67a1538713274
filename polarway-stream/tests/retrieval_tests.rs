//! Retriever tests against an in-memory store and a keyword-scoring index

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use polars::prelude::*;

use polarway_stream::filter::{DateRange, FilterSpec};
use polarway_stream::retrieval::{AdDocument, SimilarityIndex, TextGenerator};
use polarway_stream::{RemoteStore, Retriever, StreamConfig, StreamEngine, StreamError};

/// Scores a document by the share of query terms its content contains
#[derive(Default)]
struct KeywordIndex {
    docs: Mutex<Vec<AdDocument>>,
}

#[async_trait]
impl SimilarityIndex for KeywordIndex {
    async fn add_documents(&self, documents: Vec<AdDocument>) -> polarway_stream::Result<()> {
        self.docs.lock().extend(documents);
        Ok(())
    }

    async fn similarity_search(&self, query: &str, k: usize) -> polarway_stream::Result<Vec<(AdDocument, f32)>> {
        let terms: Vec<String> = query.split_whitespace().map(str::to_lowercase).collect();
        let docs = self.docs.lock();
        let mut scored: Vec<(AdDocument, f32)> = docs
            .iter()
            .map(|doc| {
                let content = doc.content.to_lowercase();
                let hits = terms.iter().filter(|t| content.contains(t.as_str())).count();
                (doc.clone(), hits as f32 / terms.len().max(1) as f32)
            })
            .filter(|(_, score)| *score > 0.0)
            .collect();
        scored.sort_by(|a, b| b.1.total_cmp(&a.1));
        scored.truncate(k);
        Ok(scored)
    }
}

struct FailingGenerator;

#[async_trait]
impl TextGenerator for FailingGenerator {
    async fn generate(&self, _query: &str, _context: &str) -> polarway_stream::Result<String> {
        Err(StreamError::Transient("generator timed out".into()))
    }
}

fn parquet_bytes(mut df: DataFrame) -> Bytes {
    let mut out = Vec::new();
    ParquetWriter::new(&mut out).finish(&mut df).unwrap();
    Bytes::from(out)
}

async fn seeded_store() -> RemoteStore {
    let store = RemoteStore::in_memory();
    let ads = DataFrame::new(vec![
        Series::new("product_name".into(), vec!["Vitamin Serum", "Face Lotion", "Night Serum"]).into(),
        Series::new("app_name".into(), vec!["Instagram", "Instagram", "Facebook"]).into(),
        Series::new("genre_name".into(), vec!["beauty", "beauty", "beauty"]).into(),
        Series::new("play_count".into(), vec![200i64, 80, 500]).into(),
        Series::new("digg_count".into(), vec![10i64, 4, 50]).into(),
        Series::new("cost".into(), vec![1500.0f64, 300.0, 2500.0]).into(),
        Series::new("date".into(), vec!["2024-03-01", "2024-03-02", "2024-03-03"]).into(),
    ])
    .unwrap();
    store
        .put("timeseries_data/raw_consolidated/consolidated_2024_03.parquet", parquet_bytes(ads))
        .await
        .unwrap();

    let platforms = DataFrame::new(vec![
        Series::new("app_name".into(), vec!["Instagram", "Facebook"]).into(),
        Series::new("ad_count".into(), vec![10i64, 4]).into(),
        Series::new("total_cost".into(), vec![9000.0f64, 1200.0]).into(),
        Series::new("total_play_count".into(), vec![5000i64, 800]).into(),
    ])
    .unwrap();
    store
        .put("timeseries_data/by_platform/platform_timeseries.parquet", parquet_bytes(platforms))
        .await
        .unwrap();

    let trends = r#"{
        "analysis_period": {"start": "2024-01-01", "end": "2024-03-31"},
        "summary": {"total_ads": 14, "total_cost": 10200},
        "key_trends": ["serum ads dominate beauty"]
    }"#;
    store
        .put("timeseries_data/trends/trend_analysis_report.json", trends.as_bytes().to_vec())
        .await
        .unwrap();
    store
}

async fn retriever() -> (Retriever, Arc<KeywordIndex>) {
    let store = seeded_store().await;
    let engine = Arc::new(StreamEngine::new(StreamConfig::new("ads"), Arc::new(store)).unwrap());
    let index = Arc::new(KeywordIndex::default());
    (Retriever::new(engine, index.clone()), index)
}

fn march() -> FilterSpec {
    FilterSpec::default().with_date_range(DateRange::new("2024-03", "2024-03"))
}

#[tokio::test]
async fn test_initialize_seeds_trend_and_platform_documents() {
    let (retriever, index) = retriever().await;

    let added = retriever.initialize().await.unwrap();
    assert_eq!(added, 3);

    let docs = index.docs.lock();
    assert!(docs[0].content.contains("- serum ads dominate beauty"));
    assert_eq!(docs[0].metadata.source, "trend_analysis");
    // platform documents follow, highest total cost first
    assert_eq!(docs[1].metadata.platform.as_deref(), Some("Instagram"));
    assert_eq!(docs[2].metadata.platform.as_deref(), Some("Facebook"));
}

#[tokio::test]
async fn test_search_returns_term_matching_rows() {
    let (retriever, _index) = retriever().await;

    let hits = retriever.search("serum", &march()).await.unwrap();
    assert_eq!(hits.len(), 2);
    assert!(hits.iter().all(|h| h.content.contains("Serum")));
    assert!(hits.iter().all(|h| h.relevance_score == 1.0));
}

#[tokio::test]
async fn test_search_applies_row_filters() {
    let (retriever, _index) = retriever().await;

    let filters = march().with_platform("Facebook");
    let hits = retriever.search("serum", &filters).await.unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].metadata.platform.as_deref(), Some("Facebook"));
    assert_eq!(hits[0].metadata.performance.as_ref().unwrap().engagement_rate, 10.0);
}

#[tokio::test]
async fn test_search_without_data_is_empty() {
    let (retriever, _index) = retriever().await;

    let filters = FilterSpec::default().with_date_range(DateRange::new("2022-01", "2022-02"));
    let hits = retriever.search("serum", &filters).await.unwrap();
    assert!(hits.is_empty());
}

#[tokio::test]
async fn test_answer_falls_back_when_generator_fails() {
    let (retriever, _index) = retriever().await;
    let retriever = retriever.with_generator(Arc::new(FailingGenerator));
    assert!(retriever.has_generator());

    let hits = retriever.search("lotion", &march()).await.unwrap();
    let answer = retriever.answer("lotion", &hits).await;
    assert!(answer.starts_with("Found 1 records related to \"lotion\""));
    assert!(answer.contains("Product: Face Lotion"));
}
