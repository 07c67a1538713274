//! Flow-controlled emission: remote read → chunk → decode → filter → sink
//!
//! Per partition, bytes are pulled from the store, assembled into decode
//! units, decoded lazily and filtered record by record. Stores with ranged
//! reads are read footer first and then one row-group span at a time, so a
//! decode unit is bounded by the chunk threshold or one row group, whichever
//! is larger. Other stores stream the object and decode it once it is
//! complete. Accepted records go to a [`RecordSink`] whose `push` awaits
//! capacity, so a slow consumer throttles the whole pipeline back to the
//! remote read.
//!
//! A failing partition is logged and recorded in the [`EmitSummary`]; the
//! remaining partitions are still read.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error, info, warn};

use crate::chunk::ChunkAssembler;
use crate::decoder::{
    is_complete_parquet, metadata_len, ColumnarDecoder, ParquetFooter, FOOTER_PREFETCH, FOOTER_TAIL_LEN, PARQUET_MAGIC,
};
use crate::error::{Result, StreamError};
use crate::filter::{compose, FilterSpec, RecordLimit, RowPredicate};
use crate::record::RawRecord;
use crate::store::ObjectReader;

/// Result of handing one record to a sink
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Accepted,
    /// The consumer is gone; stop producing
    Closed,
}

/// Consumer of accepted records
#[async_trait]
pub trait RecordSink: Send {
    /// Deliver one record, waiting while the consumer is saturated
    async fn push(&mut self, record: RawRecord) -> Result<Delivery>;

    fn is_closed(&self) -> bool;
}

/// Sink over a bounded channel of records
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<RawRecord>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::Sender<RawRecord>) -> Self {
        Self { tx }
    }

    /// Sink plus its receiving end
    pub fn bounded(capacity: usize) -> (Self, mpsc::Receiver<RawRecord>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self::new(tx), rx)
    }
}

#[async_trait]
impl RecordSink for ChannelSink {
    async fn push(&mut self, record: RawRecord) -> Result<Delivery> {
        match self.tx.send(record).await {
            Ok(()) => Ok(Delivery::Accepted),
            Err(_) => Ok(Delivery::Closed),
        }
    }

    fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Sink buffering every record in memory, for bounded (limited) queries
#[derive(Debug, Default)]
pub struct CollectSink {
    records: Vec<RawRecord>,
}

impl CollectSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn into_records(self) -> Vec<RawRecord> {
        self.records
    }
}

#[async_trait]
impl RecordSink for CollectSink {
    async fn push(&mut self, record: RawRecord) -> Result<Delivery> {
        self.records.push(record);
        Ok(Delivery::Accepted)
    }

    fn is_closed(&self) -> bool {
        false
    }
}

/// Sink writing one JSON object per line. Channel capacity is in lines.
#[derive(Debug, Clone)]
pub struct NdjsonSink {
    tx: mpsc::Sender<Bytes>,
    bytes_sent: u64,
}

impl NdjsonSink {
    pub fn new(tx: mpsc::Sender<Bytes>) -> Self {
        Self { tx, bytes_sent: 0 }
    }

    pub fn bounded(capacity: usize) -> (Self, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self::new(tx), rx)
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }
}

/// Serialize a record as one NDJSON line
pub fn ndjson_line(record: &RawRecord) -> Result<Bytes> {
    let mut line = serde_json::to_vec(record)?;
    line.push(b'\n');
    Ok(Bytes::from(line))
}

#[async_trait]
impl RecordSink for NdjsonSink {
    async fn push(&mut self, record: RawRecord) -> Result<Delivery> {
        let line = ndjson_line(&record)?;
        let len = line.len() as u64;
        match self.tx.send(line).await {
            Ok(()) => {
                self.bytes_sent += len;
                Ok(Delivery::Accepted)
            }
            Err(_) => Ok(Delivery::Closed),
        }
    }

    fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// What happened to one partition
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PartitionOutcome {
    /// Read and decoded; `records` were delivered
    Streamed { records: usize },
    /// The object does not exist: no data for this period
    Missing,
    /// Access refused by the store
    Denied { message: String },
    /// The read failed part-way; `records` were delivered before the failure
    Unreadable { message: String, records: usize },
    /// The bytes could not be decoded; `records` were delivered before the failure
    Corrupt { message: String, records: usize },
    /// Not read: partition cap, row limit or cancellation
    Skipped,
}

impl PartitionOutcome {
    pub fn records(&self) -> usize {
        match self {
            PartitionOutcome::Streamed { records }
            | PartitionOutcome::Unreadable { records, .. }
            | PartitionOutcome::Corrupt { records, .. } => *records,
            _ => 0,
        }
    }

    /// Missing data is not a failure; unreadable, denied and corrupt partitions are.
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            PartitionOutcome::Denied { .. }
                | PartitionOutcome::Unreadable { .. }
                | PartitionOutcome::Corrupt { .. }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PartitionReport {
    pub path: String,
    #[serde(flatten)]
    pub outcome: PartitionOutcome,
}

/// Per-query emission summary
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EmitSummary {
    pub emitted: usize,
    pub partitions: Vec<PartitionReport>,
    pub limit_reached: bool,
    pub cancelled: bool,
    /// No decoder backend was available; zero records prove nothing
    pub degraded: bool,
}

impl EmitSummary {
    pub fn has_failures(&self) -> bool {
        self.partitions.iter().any(|p| p.outcome.is_failure())
    }

    pub fn missing(&self) -> impl Iterator<Item = &str> {
        self.partitions
            .iter()
            .filter(|p| p.outcome == PartitionOutcome::Missing)
            .map(|p| p.path.as_str())
    }

    pub fn failed(&self) -> impl Iterator<Item = &PartitionReport> {
        self.partitions.iter().filter(|p| p.outcome.is_failure())
    }
}

enum Flow {
    Continue,
    LimitReached,
    Cancelled,
}

/// How decoding one unit ended
struct Drained {
    /// Set when the partition must stop early
    stop: Option<Flow>,
    yielded: usize,
    error: Option<StreamError>,
}

impl Drained {
    fn stopped(flow: Flow) -> Self {
        Self {
            stop: Some(flow),
            yielded: 0,
            error: None,
        }
    }
}

/// Outcome of a partition that could not be opened
fn open_failure(path: &str, e: &StreamError) -> PartitionOutcome {
    if e.is_not_found() {
        warn!(path = %path, "no data for this partition");
        PartitionOutcome::Missing
    } else if e.is_permission_denied() {
        error!(path = %path, error = %e, "permission denied reading partition");
        PartitionOutcome::Denied { message: e.to_string() }
    } else {
        warn!(path = %path, error = %e, retryable = e.is_retryable(), "failed to open partition");
        PartitionOutcome::Unreadable { message: e.to_string(), records: 0 }
    }
}

/// Drives the read → decode → filter pipeline into a sink
#[derive(Clone)]
pub struct StreamEmitter {
    reader: Arc<dyn ObjectReader>,
    decoder: Arc<ColumnarDecoder>,
    chunk_threshold: usize,
    max_partitions: usize,
}

impl std::fmt::Debug for StreamEmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamEmitter")
            .field("chunk_threshold", &self.chunk_threshold)
            .field("max_partitions", &self.max_partitions)
            .finish()
    }
}

impl StreamEmitter {
    pub fn new(
        reader: Arc<dyn ObjectReader>,
        decoder: Arc<ColumnarDecoder>,
        chunk_threshold: usize,
        max_partitions: usize,
    ) -> Self {
        Self {
            reader,
            decoder,
            chunk_threshold: chunk_threshold.max(1),
            max_partitions: max_partitions.max(1),
        }
    }

    /// Emit records of `partitions` (in order) accepted by `spec` into `sink`.
    ///
    /// Only an invalid spec or a failing sink is an error. Storage and decode
    /// failures are reported per partition in the summary.
    pub async fn emit(
        &self,
        partitions: &[String],
        spec: &FilterSpec,
        sink: &mut dyn RecordSink,
    ) -> Result<EmitSummary> {
        let predicate = compose(spec)?;
        self.emit_matching(partitions, &predicate, spec.limit, sink).await
    }

    /// Like [`StreamEmitter::emit`] with a prebuilt predicate and row cap
    pub async fn emit_matching(
        &self,
        partitions: &[String],
        predicate: &dyn RowPredicate,
        limit: Option<usize>,
        sink: &mut dyn RecordSink,
    ) -> Result<EmitSummary> {
        let mut limit = RecordLimit::new(limit);
        let mut summary = EmitSummary::default();
        let mut stopped = false;

        for (idx, path) in partitions.iter().enumerate() {
            if stopped || idx >= self.max_partitions {
                if idx == self.max_partitions && !stopped {
                    debug!(cap = self.max_partitions, "partition cap reached");
                }
                summary.partitions.push(PartitionReport {
                    path: path.clone(),
                    outcome: PartitionOutcome::Skipped,
                });
                continue;
            }

            if limit.is_reached() {
                summary.limit_reached = true;
                stopped = true;
                summary.partitions.push(PartitionReport {
                    path: path.clone(),
                    outcome: PartitionOutcome::Skipped,
                });
                continue;
            }
            if sink.is_closed() {
                summary.cancelled = true;
                stopped = true;
                summary.partitions.push(PartitionReport {
                    path: path.clone(),
                    outcome: PartitionOutcome::Skipped,
                });
                continue;
            }

            let (outcome, flow) = self
                .emit_partition(path, predicate, &mut limit, sink)
                .await?;
            summary.emitted += outcome.records();
            summary.partitions.push(PartitionReport {
                path: path.clone(),
                outcome,
            });

            match flow {
                Flow::Continue => {}
                Flow::LimitReached => {
                    summary.limit_reached = true;
                    stopped = true;
                }
                Flow::Cancelled => {
                    summary.cancelled = true;
                    stopped = true;
                }
            }
        }

        summary.degraded = self.decoder.active_backend().is_degraded();
        if summary.degraded {
            warn!("no decoder backend available, query result is degraded");
        }
        info!(
            emitted = summary.emitted,
            partitions = summary.partitions.len(),
            limit_reached = summary.limit_reached,
            cancelled = summary.cancelled,
            "emit complete"
        );
        Ok(summary)
    }

    async fn emit_partition(
        &self,
        path: &str,
        predicate: &dyn RowPredicate,
        limit: &mut RecordLimit,
        sink: &mut dyn RecordSink,
    ) -> Result<(PartitionOutcome, Flow)> {
        if self.reader.supports_ranges() {
            match self.read_footer(path).await {
                Ok(footer) => return self.emit_row_groups(path, &footer, predicate, limit, sink).await,
                Err(e) if e.is_not_found() || e.is_permission_denied() => {
                    return Ok((open_failure(path, &e), Flow::Continue));
                }
                Err(e) => {
                    debug!(path = %path, error = %e, "no usable footer, streaming whole object");
                }
            }
        }
        self.emit_streamed(path, predicate, limit, sink).await
    }

    /// Fetch and parse the footer with ranged reads, usually in one request
    async fn read_footer(&self, path: &str) -> Result<ParquetFooter> {
        let size = self.reader.object_size(path).await?;
        if size < FOOTER_TAIL_LEN + PARQUET_MAGIC.len() as u64 {
            return Err(StreamError::DecodeFailure(format!("{size}-byte object is too small for Parquet")));
        }
        let prefetch = size.min(FOOTER_PREFETCH);
        let tail = self.reader.read_range(path, size - prefetch..size).await?;
        let trailer = tail
            .len()
            .checked_sub(FOOTER_TAIL_LEN as usize)
            .map_or(&[][..], |at| &tail[at..]);
        let needed = metadata_len(trailer)? + FOOTER_TAIL_LEN;
        if needed > size {
            return Err(StreamError::DecodeFailure(format!("footer of {needed} bytes in a {size}-byte object")));
        }
        let footer = match (tail.len() as u64).checked_sub(needed) {
            Some(at) => tail.slice(at as usize..),
            None => self.reader.read_range(path, size - needed..size).await?,
        };
        ParquetFooter::decode(size, footer)
    }

    /// Ranged path: one decode unit per row-group span
    async fn emit_row_groups(
        &self,
        path: &str,
        footer: &ParquetFooter,
        predicate: &dyn RowPredicate,
        limit: &mut RecordLimit,
        sink: &mut dyn RecordSink,
    ) -> Result<(PartitionOutcome, Flow)> {
        let spans = footer.spans(self.chunk_threshold);
        debug!(
            path = %path,
            bytes = footer.object_size(),
            row_groups = footer.num_row_groups(),
            units = spans.len(),
            "reading partition by row group"
        );
        let mut delivered = 0usize;

        for span in &spans {
            if sink.is_closed() {
                return Ok((PartitionOutcome::Streamed { records: delivered }, Flow::Cancelled));
            }
            let bytes = match self.reader.read_range(path, span.bytes.clone()).await {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!(path = %path, error = %e, records = delivered, "row group read failed");
                    return Ok((
                        PartitionOutcome::Unreadable { message: e.to_string(), records: delivered },
                        Flow::Continue,
                    ));
                }
            };
            let unit = match footer.frame(span, bytes) {
                Ok(unit) => unit,
                Err(e) => {
                    warn!(path = %path, error = %e, records = delivered, "row groups could not be framed");
                    return Ok((
                        PartitionOutcome::Corrupt { message: e.to_string(), records: delivered },
                        Flow::Continue,
                    ));
                }
            };

            debug!(path = %path, row_groups = ?span.row_groups, bytes = unit.len(), "decoding row groups");
            let drained = self.drain(&unit, predicate, limit, sink, &mut delivered).await?;
            if let Some(flow) = drained.stop {
                return Ok((PartitionOutcome::Streamed { records: delivered }, flow));
            }
            match drained.error {
                None => {}
                // nothing can decode; degraded mode is reported on the summary
                Some(StreamError::BackendUnavailable(_)) => break,
                Some(e) => {
                    warn!(path = %path, error = %e, records = delivered, "decode failed, skipping rest of partition");
                    return Ok((
                        PartitionOutcome::Corrupt { message: e.to_string(), records: delivered },
                        Flow::Continue,
                    ));
                }
            }
            if limit.is_reached() {
                return Ok((PartitionOutcome::Streamed { records: delivered }, Flow::LimitReached));
            }
        }

        debug!(path = %path, records = delivered, "partition streamed");
        Ok((PartitionOutcome::Streamed { records: delivered }, Flow::Continue))
    }

    /// Sequential path for readers without ranged access: chunks are carried
    /// forward until they frame a complete object
    async fn emit_streamed(
        &self,
        path: &str,
        predicate: &dyn RowPredicate,
        limit: &mut RecordLimit,
        sink: &mut dyn RecordSink,
    ) -> Result<(PartitionOutcome, Flow)> {
        let stream = match self.reader.open_stream(path).await {
            Ok(stream) => stream,
            Err(e) => return Ok((open_failure(path, &e), Flow::Continue)),
        };

        let mut chunks = ChunkAssembler::new(stream, self.chunk_threshold);
        let mut carry: Option<Bytes> = None;
        let mut delivered = 0usize;

        loop {
            if sink.is_closed() {
                return Ok((PartitionOutcome::Streamed { records: delivered }, Flow::Cancelled));
            }

            let (unit, last) = match chunks.next().await {
                Some(Ok(chunk)) => (join(carry.take(), chunk), false),
                Some(Err(e)) => {
                    warn!(path = %path, error = %e, records = delivered, "partition read failed");
                    return Ok((
                        PartitionOutcome::Unreadable { message: e.to_string(), records: delivered },
                        Flow::Continue,
                    ));
                }
                None => match carry.take() {
                    Some(rest) => (rest, true),
                    None => break,
                },
            };

            if !last && !is_complete_parquet(&unit) {
                debug!(path = %path, bytes = unit.len(), "decode unit incomplete, carrying forward");
                carry = Some(unit);
                continue;
            }

            debug!(path = %path, bytes = unit.len(), "decoding chunk");
            let drained = self.drain(&unit, predicate, limit, sink, &mut delivered).await?;
            if let Some(flow) = drained.stop {
                return Ok((PartitionOutcome::Streamed { records: delivered }, flow));
            }

            match drained.error {
                None => {}
                Some(StreamError::BackendUnavailable(_)) => {
                    // nothing can decode; degraded mode is reported on the summary
                }
                Some(e) if !last && drained.yielded == 0 => {
                    debug!(path = %path, error = %e, "decode unit rejected, carrying forward");
                    carry = Some(unit);
                }
                Some(e) => {
                    warn!(path = %path, error = %e, records = delivered, "decode failed, skipping rest of partition");
                    return Ok((
                        PartitionOutcome::Corrupt { message: e.to_string(), records: delivered },
                        Flow::Continue,
                    ));
                }
            }
            if limit.is_reached() {
                return Ok((PartitionOutcome::Streamed { records: delivered }, Flow::LimitReached));
            }
            if last {
                break;
            }
        }

        debug!(path = %path, records = delivered, "partition streamed");
        Ok((PartitionOutcome::Streamed { records: delivered }, Flow::Continue))
    }

    /// Decode one unit and push the records `predicate` accepts
    async fn drain(
        &self,
        unit: &Bytes,
        predicate: &dyn RowPredicate,
        limit: &mut RecordLimit,
        sink: &mut dyn RecordSink,
        delivered: &mut usize,
    ) -> Result<Drained> {
        let mut records = self.decoder.decode_lazy(unit);
        for record in records.by_ref() {
            if !predicate.matches(&record) {
                continue;
            }
            if sink.is_closed() {
                return Ok(Drained::stopped(Flow::Cancelled));
            }
            if !limit.admit() {
                return Ok(Drained::stopped(Flow::LimitReached));
            }
            match sink.push(record).await? {
                Delivery::Accepted => *delivered += 1,
                Delivery::Closed => return Ok(Drained::stopped(Flow::Cancelled)),
            }
        }
        Ok(Drained {
            stop: None,
            yielded: records.yielded(),
            error: records.take_error(),
        })
    }

    /// Run the emitter on a background task feeding a bounded record channel
    pub fn spawn_records(&self, partitions: Vec<String>, spec: FilterSpec, capacity: usize) -> RecordStream {
        let (mut sink, rx) = ChannelSink::bounded(capacity);
        let emitter = self.clone();
        let handle = tokio::spawn(async move { emitter.emit(&partitions, &spec, &mut sink).await });
        EmitStream::new(rx, handle)
    }

    /// Run the emitter on a background task feeding a bounded NDJSON line channel
    pub fn spawn_ndjson(&self, partitions: Vec<String>, spec: FilterSpec, capacity: usize) -> NdjsonStream {
        let (mut sink, rx) = NdjsonSink::bounded(capacity);
        let emitter = self.clone();
        let handle = tokio::spawn(async move { emitter.emit(&partitions, &spec, &mut sink).await });
        EmitStream::new(rx, handle)
    }
}

fn join(carry: Option<Bytes>, chunk: Bytes) -> Bytes {
    match carry {
        None => chunk,
        Some(prev) => {
            let mut buf = BytesMut::with_capacity(prev.len() + chunk.len());
            buf.extend_from_slice(&prev);
            buf.extend_from_slice(&chunk);
            buf.freeze()
        }
    }
}

/// Output of a background emitter. Dropping it stops the producer and
/// releases its remote stream.
pub struct EmitStream<T> {
    inner: ReceiverStream<T>,
    handle: Option<JoinHandle<Result<EmitSummary>>>,
}

/// Record-at-a-time query stream
pub type RecordStream = EmitStream<RawRecord>;

/// NDJSON line stream, ready for a chunked HTTP body
pub type NdjsonStream = EmitStream<Bytes>;

impl<T> EmitStream<T> {
    fn new(rx: mpsc::Receiver<T>, handle: JoinHandle<Result<EmitSummary>>) -> Self {
        Self {
            inner: ReceiverStream::new(rx),
            handle: Some(handle),
        }
    }

    /// Stop receiving and wait for the producer's summary. Unconsumed items are
    /// discarded; a producer still running sees the closed channel and reports cancellation.
    pub async fn finish(mut self) -> Result<EmitSummary> {
        self.inner.close();
        match self.handle.take() {
            Some(handle) => handle.await?,
            None => Err(StreamError::Internal("emit summary already taken".into())),
        }
    }
}

impl<T> Stream for EmitStream<T> {
    type Item = T;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        Pin::new(&mut self.get_mut().inner).poll_next(cx)
    }
}

impl<T> Drop for EmitStream<T> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::{BackendFactory, BoxedRecordIter, DecoderBackend, ParquetRowBackend, ParquetRowFactory};
    use crate::record::{columns, FieldInfo};
    use crate::store::{ByteStream, ObjectEntry, RemoteStore};
    use futures::stream;
    use parking_lot::Mutex;
    use proptest::prelude::*;
    use std::collections::HashMap;

    /// Store fake: serves fixed objects, fails others with a chosen error
    #[derive(Default)]
    struct FakeReader {
        objects: HashMap<String, Bytes>,
        denied: Vec<String>,
        chunk: usize,
    }

    #[async_trait]
    impl ObjectReader for FakeReader {
        async fn exists(&self, path: &str) -> Result<bool> {
            Ok(self.objects.contains_key(path))
        }

        async fn read_all(&self, path: &str) -> Result<Bytes> {
            self.objects
                .get(path)
                .cloned()
                .ok_or_else(|| StreamError::NotFound(path.to_string()))
        }

        async fn open_stream(&self, path: &str) -> Result<ByteStream> {
            if self.denied.iter().any(|d| d == path) {
                return Err(StreamError::PermissionDenied { path: path.into(), message: "nope".into() });
            }
            let data = self.read_all(path).await?;
            let step = self.chunk.max(1);
            let chunks: Vec<Result<Bytes>> = (0..data.len())
                .step_by(step)
                .map(|i| Ok(data.slice(i..(i + step).min(data.len()))))
                .collect();
            Ok(stream::iter(chunks).boxed())
        }

        async fn list(&self, _prefix: &str) -> Result<Vec<ObjectEntry>> {
            Ok(Vec::new())
        }
    }

    fn parquet_of(rows: &[(&str, i64)]) -> Bytes {
        use polars::prelude::*;
        let mut df = DataFrame::new(vec![
            Series::new("app_name".into(), rows.iter().map(|r| r.0).collect::<Vec<_>>()).into(),
            Series::new("play_count".into(), rows.iter().map(|r| r.1).collect::<Vec<_>>()).into(),
        ])
        .unwrap();
        let mut out = Vec::new();
        ParquetWriter::new(&mut out).finish(&mut df).unwrap();
        Bytes::from(out)
    }

    /// `rows` rows in row groups of `group_rows`: play_count = i, app_name = app-{i % 7}
    fn grouped_parquet(rows: usize, group_rows: usize) -> Bytes {
        use polars::prelude::*;
        let mut df = DataFrame::new(vec![
            Series::new("app_name".into(), (0..rows).map(|i| format!("app-{}", i % 7)).collect::<Vec<_>>()).into(),
            Series::new("play_count".into(), (0..rows as i64).collect::<Vec<_>>()).into(),
        ])
        .unwrap();
        let mut out = Vec::new();
        ParquetWriter::new(&mut out)
            .with_row_group_size(Some(group_rows))
            .finish(&mut df)
            .unwrap();
        Bytes::from(out)
    }

    /// Row decoder that records the size of every unit it is handed
    #[derive(Clone, Default)]
    struct UnitSizes(Arc<Mutex<Vec<usize>>>);

    impl DecoderBackend for UnitSizes {
        fn name(&self) -> &'static str {
            "unit-sizes"
        }

        fn decode(&self, buffer: &Bytes) -> Result<Vec<RawRecord>> {
            self.0.lock().push(buffer.len());
            ParquetRowBackend.decode(buffer)
        }

        fn decode_lazy(&self, buffer: Bytes) -> Result<BoxedRecordIter> {
            self.0.lock().push(buffer.len());
            ParquetRowBackend.decode_lazy(buffer)
        }

        fn schema(&self, buffer: &Bytes) -> Result<Vec<FieldInfo>> {
            ParquetRowBackend.schema(buffer)
        }
    }

    impl BackendFactory for UnitSizes {
        fn name(&self) -> &'static str {
            "unit-sizes"
        }

        fn init(&self) -> Result<Arc<dyn DecoderBackend>> {
            Ok(Arc::new(self.clone()))
        }
    }

    fn emitter(reader: FakeReader, threshold: usize) -> StreamEmitter {
        StreamEmitter::new(Arc::new(reader), Arc::new(ColumnarDecoder::default()), threshold, 3)
    }

    #[tokio::test]
    async fn test_filters_and_preserves_order() {
        let mut reader = FakeReader { chunk: 64, ..Default::default() };
        reader
            .objects
            .insert("p1".into(), parquet_of(&[("a", 500), ("b", 50), ("c", 700)]));
        let emitter = emitter(reader, 128);

        let (mut sink, mut rx) = ChannelSink::bounded(16);
        let spec = FilterSpec::default().with_min_play_count(100.0);
        let summary = emitter.emit(&["p1".to_string()], &spec, &mut sink).await.unwrap();
        drop(sink);

        let mut names = Vec::new();
        while let Some(r) = rx.recv().await {
            names.push(r.text(columns::APP_NAME).unwrap().to_string());
        }
        assert_eq!(names, vec!["a", "c"]);
        assert_eq!(summary.emitted, 2);
        assert_eq!(summary.partitions[0].outcome, PartitionOutcome::Streamed { records: 2 });
    }

    #[tokio::test]
    async fn test_missing_and_denied_partitions_do_not_abort() {
        let mut reader = FakeReader { chunk: 1024, ..Default::default() };
        reader.objects.insert("good".into(), parquet_of(&[("a", 1)]));
        reader.denied.push("secret".into());
        let emitter = emitter(reader, 1 << 20);

        let (mut sink, _rx) = ChannelSink::bounded(16);
        let parts = vec!["missing".to_string(), "secret".to_string(), "good".to_string()];
        let summary = emitter.emit(&parts, &FilterSpec::default(), &mut sink).await.unwrap();

        assert_eq!(summary.partitions[0].outcome, PartitionOutcome::Missing);
        assert!(matches!(summary.partitions[1].outcome, PartitionOutcome::Denied { .. }));
        assert_eq!(summary.partitions[2].outcome, PartitionOutcome::Streamed { records: 1 });
        assert_eq!(summary.emitted, 1);
        assert_eq!(summary.missing().collect::<Vec<_>>(), vec!["missing"]);
    }

    #[tokio::test]
    async fn test_corrupt_partition_reported_and_skipped() {
        let mut reader = FakeReader { chunk: 4, ..Default::default() };
        reader.objects.insert("bad".into(), Bytes::from_static(b"PAR1 this is not a parquet file PAR1"));
        reader.objects.insert("good".into(), parquet_of(&[("a", 1), ("b", 2)]));
        let emitter = emitter(reader, 8);

        let (mut sink, _rx) = ChannelSink::bounded(16);
        let parts = vec!["bad".to_string(), "good".to_string()];
        let summary = emitter.emit(&parts, &FilterSpec::default(), &mut sink).await.unwrap();

        assert!(matches!(summary.partitions[0].outcome, PartitionOutcome::Corrupt { records: 0, .. }));
        assert_eq!(summary.partitions[1].outcome, PartitionOutcome::Streamed { records: 2 });
        assert!(summary.has_failures());
    }

    #[tokio::test]
    async fn test_limit_stops_early_and_skips_rest() {
        let mut reader = FakeReader { chunk: 256, ..Default::default() };
        reader.objects.insert("p1".into(), parquet_of(&[("a", 1), ("b", 2), ("c", 3)]));
        reader.objects.insert("p2".into(), parquet_of(&[("d", 4)]));
        let emitter = emitter(reader, 1 << 20);

        let (mut sink, _rx) = ChannelSink::bounded(16);
        let spec = FilterSpec::default().with_limit(2);
        let parts = vec!["p1".to_string(), "p2".to_string()];
        let summary = emitter.emit(&parts, &spec, &mut sink).await.unwrap();

        assert_eq!(summary.emitted, 2);
        assert!(summary.limit_reached);
        assert_eq!(summary.partitions[1].outcome, PartitionOutcome::Skipped);
    }

    #[tokio::test]
    async fn test_partition_cap() {
        let reader = FakeReader { chunk: 256, ..Default::default() };
        let emitter = StreamEmitter::new(Arc::new(reader), Arc::new(ColumnarDecoder::default()), 1024, 2);
        let (mut sink, _rx) = ChannelSink::bounded(1);
        let parts: Vec<String> = (0..4).map(|i| format!("p{i}")).collect();
        let summary = emitter.emit(&parts, &FilterSpec::default(), &mut sink).await.unwrap();
        let skipped = summary
            .partitions
            .iter()
            .filter(|p| p.outcome == PartitionOutcome::Skipped)
            .count();
        assert_eq!(skipped, 2);
    }

    #[tokio::test]
    async fn test_closed_sink_cancels() {
        let mut reader = FakeReader { chunk: 256, ..Default::default() };
        reader.objects.insert("p1".into(), parquet_of(&[("a", 1), ("b", 2)]));
        let emitter = emitter(reader, 1 << 20);

        let (mut sink, rx) = ChannelSink::bounded(1);
        drop(rx);
        let summary = emitter
            .emit(&["p1".to_string()], &FilterSpec::default(), &mut sink)
            .await
            .unwrap();
        assert!(summary.cancelled);
        assert_eq!(summary.emitted, 0);
    }

    #[tokio::test]
    async fn test_ndjson_stream_lines() {
        let mut reader = FakeReader { chunk: 100, ..Default::default() };
        reader.objects.insert("p1".into(), parquet_of(&[("a", 1), ("b", 2)]));
        let emitter = emitter(reader, 1 << 20);

        let stream = emitter.spawn_ndjson(vec!["p1".into()], FilterSpec::default(), 1);
        let lines: Vec<Bytes> = stream.collect().await;
        assert_eq!(lines.len(), 2);
        assert_eq!(&lines[0][..], b"{\"app_name\":\"a\",\"play_count\":1}\n");
    }

    #[tokio::test]
    async fn test_ranged_reads_bound_decode_units() {
        let object = grouped_parquet(5000, 500);
        let store = RemoteStore::in_memory();
        store.put("p1", object.clone()).await.unwrap();
        let units = UnitSizes::default();
        let decoder = ColumnarDecoder::new(units.clone(), ParquetRowFactory);
        let emitter = StreamEmitter::new(Arc::new(store), Arc::new(decoder), 1024, 3);

        let mut sink = CollectSink::new();
        let spec = FilterSpec::default().with_limit(1);
        let summary = emitter.emit(&["p1".to_string()], &spec, &mut sink).await.unwrap();
        assert_eq!(summary.emitted, 1);
        let seen = units.0.lock().clone();
        assert_eq!(seen.len(), 1, "one row group is enough for one record");
        assert!(seen[0] < object.len() / 3, "unit {} of a {}-byte object", seen[0], object.len());

        units.0.lock().clear();
        let mut sink = CollectSink::new();
        let summary = emitter.emit(&["p1".to_string()], &FilterSpec::default(), &mut sink).await.unwrap();
        assert_eq!(summary.emitted, 5000);
        let seen = units.0.lock().clone();
        assert!(seen.len() > 1);
        assert!(seen.iter().all(|&n| n < object.len() / 2), "units {seen:?}");

        let plays: Vec<Option<f64>> = sink.into_records().iter().map(|r| r.number("play_count")).collect();
        let expected: Vec<Option<f64>> = (0..5000).map(|i| Some(i as f64)).collect();
        assert_eq!(plays, expected);
    }

    #[tokio::test]
    async fn test_ranged_store_reports_missing_and_corrupt() {
        let store = RemoteStore::in_memory();
        store.put("bad", b"PAR1 this is not a parquet file PAR1".to_vec()).await.unwrap();
        store.put("tiny", b"PAR1".to_vec()).await.unwrap();
        store.put("good", grouped_parquet(10, 5)).await.unwrap();
        let emitter = StreamEmitter::new(Arc::new(store), Arc::new(ColumnarDecoder::default()), 64, 4);

        let mut sink = CollectSink::new();
        let parts = vec!["missing".to_string(), "bad".to_string(), "tiny".to_string(), "good".to_string()];
        let summary = emitter.emit(&parts, &FilterSpec::default(), &mut sink).await.unwrap();

        assert_eq!(summary.partitions[0].outcome, PartitionOutcome::Missing);
        assert!(matches!(summary.partitions[1].outcome, PartitionOutcome::Corrupt { records: 0, .. }));
        assert!(summary.partitions[2].outcome.is_failure());
        assert_eq!(summary.partitions[3].outcome, PartitionOutcome::Streamed { records: 10 });
    }

    fn block_on<F: std::future::Future>(future: F) -> F::Output {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap()
            .block_on(future)
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]

        #[test]
        fn prop_limit_caps_output_and_every_record_matches(
            limit in 0usize..40,
            threshold in 64usize..4096,
            chunk in 16usize..1024,
            min_play in 0i64..300,
            platform in prop::option::of(0usize..7),
            ranged in any::<bool>(),
        ) {
            let object = grouped_parquet(300, 40);
            let mut spec = FilterSpec::default().with_min_play_count(min_play as f64).with_limit(limit);
            if let Some(p) = platform {
                spec = spec.with_platform(format!("app-{p}"));
            }
            let predicate = compose(&spec).unwrap();

            let run_spec = spec.clone();
            let (summary, records) = block_on(async move {
                let reader: Arc<dyn ObjectReader> = if ranged {
                    let store = RemoteStore::in_memory();
                    store.put("p1", object.clone()).await.unwrap();
                    store.put("p2", object).await.unwrap();
                    Arc::new(store)
                } else {
                    let mut fake = FakeReader { chunk, ..Default::default() };
                    fake.objects.insert("p1".into(), object.clone());
                    fake.objects.insert("p2".into(), object);
                    Arc::new(fake)
                };
                let emitter = StreamEmitter::new(reader, Arc::new(ColumnarDecoder::default()), threshold, 3);
                let mut sink = CollectSink::new();
                let parts = vec!["p1".to_string(), "p2".to_string()];
                let summary = emitter.emit(&parts, &run_spec, &mut sink).await.unwrap();
                (summary, sink.into_records())
            });

            prop_assert!(summary.emitted <= limit);
            prop_assert_eq!(summary.emitted, records.len());
            for record in &records {
                prop_assert!(predicate.matches(record));
            }
            let matching_per_object = (0..300i64)
                .filter(|i| *i >= min_play && platform.map_or(true, |p| *i as usize % 7 == p))
                .count();
            prop_assert_eq!(records.len(), limit.min(2 * matching_per_object));
        }
    }

    #[tokio::test]
    async fn test_record_stream_summary() {
        let mut reader = FakeReader { chunk: 100, ..Default::default() };
        reader.objects.insert("p1".into(), parquet_of(&[("a", 1), ("b", 2), ("c", 3)]));
        let emitter = emitter(reader, 1 << 20);

        let mut stream = emitter.spawn_records(vec!["p1".into()], FilterSpec::default(), 1);
        let mut seen = 0;
        while let Some(_record) = stream.next().await {
            seen += 1;
        }
        let summary = stream.finish().await.unwrap();
        assert_eq!(seen, 3);
        assert_eq!(summary.emitted, 3);
        assert!(!summary.cancelled);
    }
}
