//! # Polarway Stream
//!
//! Filtered, bounded streaming over time-partitioned Parquet files held in an
//! object store. Memory stays bounded by the chunk threshold, a failing
//! decoder degrades to a fallback instead of crashing, and a slow consumer
//! throttles the pipeline all the way back to the remote read.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────┐
//! │                  StreamEngine                    │
//! │   (requests → plan → stream / query / fold)     │
//! ├──────────────┬─────────────────┬────────────────┤
//! │ Partition    │  StreamEmitter  │  Aggregator    │
//! │ Catalog      │  (backpressure) │  (folds)       │
//! ├──────────────┴───────┬─────────┴────────────────┤
//! │ ChunkAssembler       │ ColumnarDecoder           │
//! │ (bounded buffers)    │ polars → parquet rows     │
//! ├──────────────────────┴──────────────────────────┤
//! │        ObjectReader (object_store)               │
//! │  timeseries_data/{category}/{file}.parquet       │
//! └─────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use polarway_stream::{RemoteStore, StreamConfig, StreamEngine, StreamRequest};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = RemoteStore::local("/data/ads")?;
//!     let engine = StreamEngine::new(StreamConfig::new("ads"), Arc::new(store))?;
//!     engine.refresh_catalog().await?;
//!
//!     // Instagram rows of March 2025 with at least 100 plays
//!     let request = StreamRequest::month("2025_03")
//!         .with_platform("Instagram")
//!         .with_min_play_count(100.0);
//!     let result = engine.query(&request).await?;
//!     println!("{} records", result.count);
//!
//!     Ok(())
//! }
//! ```
//!
//! ## Features
//!
//! - **Sticky decoder fallback**: the primary backend is abandoned for the
//!   process lifetime after its first failure
//! - **Bounded channels**: producers await capacity instead of polling
//! - **Per-partition outcomes**: missing, denied, unreadable and corrupt
//!   partitions are reported, not fatal
//! - **Railway Programming**: all operations return `Result<T, StreamError>`

pub mod aggregate;
pub mod catalog;
pub mod chunk;
pub mod config;
pub mod decoder;
pub mod emitter;
pub mod engine;
pub mod error;
pub mod filter;
pub mod locator;
pub mod record;
pub mod retrieval;
pub mod store;

// Re-exports for convenience
pub use aggregate::{
    fold, fold_records, AggregateReport, Aggregator, DailyStats, GenreBreakdown, PlatformBreakdown, RunningTotals,
};
pub use catalog::{is_in_data_gap, Manifest, PartitionCatalog, PartitionInfo};
pub use chunk::{ChunkAssembler, ChunkBuffer};
pub use config::StreamConfig;
pub use decoder::{ActiveBackend, ColumnarDecoder, DecoderBackend, RecordIter};
pub use emitter::{
    ChannelSink, CollectSink, EmitSummary, NdjsonSink, PartitionOutcome, RecordSink, StreamEmitter,
};
pub use engine::{QueryResult, StreamEngine, StreamRequest};
pub use error::{Result, StreamError};
pub use filter::{compose, DateRange, FilterSpec, RowPredicate};
pub use locator::{resolve_path, PartitionCategory, PartitionKey, Period};
pub use record::{FieldValue, RawRecord};
pub use retrieval::{Retriever, SimilarityIndex, TextGenerator};
pub use store::{ObjectReader, RemoteStore};
