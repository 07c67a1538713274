//! Columnar decoding with sticky backend fallback
//!
//! Two interchangeable backends decode Parquet buffers into [`RawRecord`]s:
//! the polars reader (primary) and the `parquet` crate's row reader (fallback).
//!
//! Selection happens once per [`ColumnarDecoder`]:
//! ```text
//! Pending ──init ok──▶ Primary{proven: false} ──first decode ok──▶ Primary{proven: true}
//!    │                        │
//!    │ init err /             │ first decode err
//!    │ primary disabled       ▼
//!    └──────────────────▶ Fallback ──(fallback init err)──▶ Unavailable
//! ```
//! Once the primary is abandoned it is never retried. With no backend at all,
//! the fail-open API returns empty results instead of errors.
//!
//! [`ParquetFooter`] splits a remote object into row-group spans so that a
//! decode unit never has to hold the whole object.

mod polars_backend;
mod row_backend;
mod row_groups;

pub use polars_backend::{PolarsBackend, PolarsFactory};
pub use row_backend::{ParquetRowBackend, ParquetRowFactory};
pub use row_groups::{metadata_len, ParquetFooter, RowGroupSpan, FOOTER_PREFETCH, FOOTER_TAIL_LEN};

use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{Result, StreamError};
use crate::filter::RowPredicate;
use crate::record::{FieldInfo, FieldValue, RawRecord};

/// Lazy record sequence produced by a backend
pub type BoxedRecordIter = Box<dyn Iterator<Item = Result<RawRecord>> + Send>;

/// One columnar-format reader implementation
pub trait DecoderBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Materialize every record of the buffer
    fn decode(&self, buffer: &Bytes) -> Result<Vec<RawRecord>>;

    /// Record-at-a-time view of the buffer. Not resumable: restart by calling again.
    fn decode_lazy(&self, buffer: Bytes) -> Result<BoxedRecordIter>;

    fn schema(&self, buffer: &Bytes) -> Result<Vec<FieldInfo>>;
}

/// Initializes a backend on first use
pub trait BackendFactory: Send + Sync {
    fn name(&self) -> &'static str;

    fn init(&self) -> Result<Arc<dyn DecoderBackend>>;
}

/// Which backend is serving decode calls
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "backend", rename_all = "snake_case")]
pub enum ActiveBackend {
    /// Nothing initialized yet
    Pending,
    Primary(&'static str),
    Fallback(&'static str),
    /// Both backends failed to initialize
    Unavailable,
}

impl ActiveBackend {
    pub fn is_degraded(&self) -> bool {
        matches!(self, ActiveBackend::Unavailable)
    }
}

enum Selection {
    Pending,
    Primary {
        backend: Arc<dyn DecoderBackend>,
        proven: bool,
    },
    Fallback(Arc<dyn DecoderBackend>),
    Unavailable,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Tier {
    UnprovenPrimary,
    ProvenPrimary,
    Fallback,
}

/// Decoder front-end holding the process-wide backend choice
pub struct ColumnarDecoder {
    primary: Box<dyn BackendFactory>,
    fallback: Box<dyn BackendFactory>,
    disable_primary: bool,
    selection: RwLock<Selection>,
}

impl std::fmt::Debug for ColumnarDecoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ColumnarDecoder")
            .field("primary", &self.primary.name())
            .field("fallback", &self.fallback.name())
            .field("disable_primary", &self.disable_primary)
            .field("active", &self.active_backend())
            .finish()
    }
}

impl Default for ColumnarDecoder {
    fn default() -> Self {
        Self::new(PolarsFactory, ParquetRowFactory)
    }
}

impl ColumnarDecoder {
    pub fn new(primary: impl BackendFactory + 'static, fallback: impl BackendFactory + 'static) -> Self {
        Self {
            primary: Box::new(primary),
            fallback: Box::new(fallback),
            disable_primary: false,
            selection: RwLock::new(Selection::Pending),
        }
    }

    /// polars primary, `parquet` row reader fallback
    pub fn from_config(config: &crate::config::StreamConfig) -> Self {
        Self::default().with_primary_disabled(config.disable_primary_decoder)
    }

    /// Skip the primary entirely. Only meaningful before the first decode.
    pub fn with_primary_disabled(mut self, disabled: bool) -> Self {
        self.disable_primary = disabled;
        self
    }

    pub fn active_backend(&self) -> ActiveBackend {
        match &*self.selection.read() {
            Selection::Pending => ActiveBackend::Pending,
            Selection::Primary { backend, .. } => ActiveBackend::Primary(backend.name()),
            Selection::Fallback(backend) => ActiveBackend::Fallback(backend.name()),
            Selection::Unavailable => ActiveBackend::Unavailable,
        }
    }

    /// Initialize eagerly and report the outcome
    pub fn warm_up(&self) -> ActiveBackend {
        let _ = self.resolve();
        self.active_backend()
    }

    fn snapshot(selection: &Selection) -> Option<(Arc<dyn DecoderBackend>, Tier)> {
        match selection {
            Selection::Pending | Selection::Unavailable => None,
            Selection::Primary { backend, proven } => Some((
                backend.clone(),
                if *proven { Tier::ProvenPrimary } else { Tier::UnprovenPrimary },
            )),
            Selection::Fallback(backend) => Some((backend.clone(), Tier::Fallback)),
        }
    }

    /// Current backend, initializing behind the write gate on first use
    fn resolve(&self) -> Option<(Arc<dyn DecoderBackend>, Tier)> {
        {
            let sel = self.selection.read();
            if !matches!(*sel, Selection::Pending) {
                return Self::snapshot(&sel);
            }
        }

        let mut sel = self.selection.write();
        if matches!(*sel, Selection::Pending) {
            *sel = self.initialize();
        }
        Self::snapshot(&sel)
    }

    fn initialize(&self) -> Selection {
        if self.disable_primary {
            info!(backend = self.fallback.name(), "primary decoder disabled by configuration");
            return self.initialize_fallback();
        }
        match self.primary.init() {
            Ok(backend) => {
                info!(backend = backend.name(), "primary decoder initialized");
                Selection::Primary {
                    backend,
                    proven: false,
                }
            }
            Err(e) => {
                warn!(backend = self.primary.name(), error = %e, "primary decoder failed to initialize, falling back");
                self.initialize_fallback()
            }
        }
    }

    fn initialize_fallback(&self) -> Selection {
        match self.fallback.init() {
            Ok(backend) => {
                info!(backend = backend.name(), "fallback decoder initialized");
                Selection::Fallback(backend)
            }
            Err(e) => {
                warn!(backend = self.fallback.name(), error = %e, "fallback decoder unavailable, decoding degraded to empty results");
                Selection::Unavailable
            }
        }
    }

    fn mark_proven(&self) {
        let mut sel = self.selection.write();
        if let Selection::Primary { proven, .. } = &mut *sel {
            *proven = true;
        }
    }

    /// Abandon the primary for good. No-op if another caller already moved on.
    fn demote(&self, cause: &StreamError) {
        let mut sel = self.selection.write();
        let name = match &*sel {
            Selection::Primary { backend, proven: false } => backend.name(),
            _ => return,
        };
        warn!(backend = name, error = %cause, "primary decoder failed on first decode, switching to fallback");
        *sel = self.initialize_fallback();
    }

    /// Run `op` against the active backend, applying the first-decode demotion rule
    fn run<T>(&self, op: impl Fn(&dyn DecoderBackend) -> Result<T>) -> Result<T> {
        let (backend, tier) = self
            .resolve()
            .ok_or_else(|| StreamError::BackendUnavailable("no decoder backend initialized".into()))?;

        match op(backend.as_ref()) {
            Ok(out) => {
                if tier == Tier::UnprovenPrimary {
                    self.mark_proven();
                }
                Ok(out)
            }
            Err(e) if tier == Tier::UnprovenPrimary => {
                self.demote(&e);
                let (backend, _) = self.resolve().ok_or_else(|| {
                    StreamError::BackendUnavailable(format!("primary failed ({e}) and no fallback"))
                })?;
                op(backend.as_ref())
            }
            Err(e) => Err(e),
        }
    }

    // ─── Strict API ───

    pub fn try_decode(&self, buffer: &Bytes) -> Result<Vec<RawRecord>> {
        self.run(|b| b.decode(buffer))
    }

    pub fn try_decode_lazy(&self, buffer: &Bytes) -> Result<BoxedRecordIter> {
        self.run(|b| b.decode_lazy(buffer.clone()))
    }

    pub fn try_schema(&self, buffer: &Bytes) -> Result<Vec<FieldInfo>> {
        self.run(|b| b.schema(buffer))
    }

    // ─── Fail-open API ───

    /// Whole-buffer decode. Failures are logged and yield no records.
    pub fn decode(&self, buffer: &Bytes) -> Vec<RawRecord> {
        self.try_decode(buffer).unwrap_or_else(|e| {
            warn!(bytes = buffer.len(), error = %e, "decode failed, returning no records");
            Vec::new()
        })
    }

    /// Lazy decode. A failure before or during iteration ends the sequence.
    pub fn decode_lazy(&self, buffer: &Bytes) -> RecordIter {
        match self.try_decode_lazy(buffer) {
            Ok(inner) => RecordIter::new(inner),
            Err(e) => {
                warn!(bytes = buffer.len(), error = %e, "lazy decode failed, returning no records");
                RecordIter::from_error(e)
            }
        }
    }

    pub fn schema(&self, buffer: &Bytes) -> Vec<FieldInfo> {
        self.try_schema(buffer).unwrap_or_else(|e| {
            warn!(bytes = buffer.len(), error = %e, "schema inspection failed");
            Vec::new()
        })
    }

    /// Feed decoded records to `processor` in batches of `batch_size`.
    /// Returns the number of records processed.
    pub fn decode_batches<F>(&self, buffer: &Bytes, batch_size: usize, mut processor: F) -> usize
    where
        F: FnMut(Vec<RawRecord>),
    {
        let batch_size = batch_size.max(1);
        let mut total = 0;
        let mut batch = Vec::with_capacity(batch_size);
        for record in self.decode_lazy(buffer) {
            batch.push(record);
            if batch.len() == batch_size {
                total += batch.len();
                processor(std::mem::replace(&mut batch, Vec::with_capacity(batch_size)));
            }
        }
        if !batch.is_empty() {
            total += batch.len();
            processor(batch);
        }
        debug!(records = total, batch_size, "batch decode complete");
        total
    }

    /// Records of the buffer accepted by `predicate`, at most `max`
    pub fn decode_filtered(&self, buffer: &Bytes, predicate: &dyn RowPredicate, max: usize) -> Vec<RawRecord> {
        self.decode_lazy(buffer)
            .filter(|r| predicate.matches(r))
            .take(max)
            .collect()
    }
}

/// Fail-open lazy iterator returned by [`ColumnarDecoder::decode_lazy`]
pub struct RecordIter {
    inner: Option<BoxedRecordIter>,
    error: Option<StreamError>,
    yielded: usize,
}

impl RecordIter {
    fn new(inner: BoxedRecordIter) -> Self {
        Self {
            inner: Some(inner),
            error: None,
            yielded: 0,
        }
    }

    fn from_error(error: StreamError) -> Self {
        Self {
            inner: None,
            error: Some(error),
            yielded: 0,
        }
    }

    /// Whether the sequence ended on an error rather than exhaustion
    pub fn failed(&self) -> bool {
        self.error.is_some()
    }

    pub fn error(&self) -> Option<&StreamError> {
        self.error.as_ref()
    }

    pub fn take_error(&mut self) -> Option<StreamError> {
        self.error.take()
    }

    /// Records handed out so far
    pub fn yielded(&self) -> usize {
        self.yielded
    }
}

impl Iterator for RecordIter {
    type Item = RawRecord;

    fn next(&mut self) -> Option<RawRecord> {
        let inner = self.inner.as_mut()?;
        match inner.next() {
            Some(Ok(record)) => {
                self.yielded += 1;
                Some(record)
            }
            Some(Err(e)) => {
                warn!(after = self.yielded, error = %e, "decode failed mid-sequence, truncating");
                self.inner = None;
                self.error = Some(e);
                None
            }
            None => {
                self.inner = None;
                None
            }
        }
    }
}

/// Parquet magic, present at both ends of a complete file
pub const PARQUET_MAGIC: &[u8; 4] = b"PAR1";

/// Whether `buf` is framed like a complete Parquet file. A prefix of a larger
/// object has no footer yet and cannot be decoded on its own.
pub fn is_complete_parquet(buf: &[u8]) -> bool {
    buf.len() >= 12 && buf.starts_with(PARQUET_MAGIC) && buf.ends_with(PARQUET_MAGIC)
}

// ─── value conversion shared by both backends ───

pub(crate) fn date_from_days(days: i32) -> FieldValue {
    chrono::DateTime::from_timestamp(i64::from(days) * 86_400, 0)
        .map(|dt| FieldValue::Str(dt.date_naive().format("%Y-%m-%d").to_string()))
        .unwrap_or(FieldValue::Int(i64::from(days)))
}

pub(crate) fn datetime_from_micros(micros: i64) -> FieldValue {
    chrono::DateTime::from_timestamp_micros(micros)
        .map(|dt| FieldValue::Str(dt.naive_utc().format("%Y-%m-%d %H:%M:%S").to_string()))
        .unwrap_or(FieldValue::Int(micros))
}

pub(crate) fn unsigned(v: u64) -> FieldValue {
    i64::try_from(v).map_or(FieldValue::Float(v as f64), FieldValue::Int)
}
