//! Remote object access
//!
//! [`ObjectReader`] is the seam the engine reads through. [`RemoteStore`] is the
//! production implementation over the `object_store` crate. Nothing here caches
//! or retries: callers decide what to do with a `Transient` error.

use std::fmt;
use std::ops::Range;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{BoxStream, StreamExt, TryStreamExt};
use object_store::path::Path as ObjectPath;
use object_store::{ObjectStore, PutPayload};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::error::{Result, StreamError};

/// Byte-chunk stream of one remote object
pub type ByteStream = BoxStream<'static, Result<Bytes>>;

/// Listing entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectEntry {
    pub path: String,
    pub size: u64,
}

/// Read-only view of the remote store
#[async_trait]
pub trait ObjectReader: Send + Sync {
    /// Whether an object exists. Only `NotFound` maps to `false`; other failures propagate.
    async fn exists(&self, path: &str) -> Result<bool>;

    /// Fetch a whole object into memory
    async fn read_all(&self, path: &str) -> Result<Bytes>;

    /// Open an incremental read. Dropping the stream releases the remote read.
    async fn open_stream(&self, path: &str) -> Result<ByteStream>;

    /// Objects under `prefix`, sorted by path
    async fn list(&self, prefix: &str) -> Result<Vec<ObjectEntry>>;

    /// Whether [`ObjectReader::read_range`] fetches only the requested bytes.
    /// The default range methods read the whole object.
    fn supports_ranges(&self) -> bool {
        false
    }

    /// Object length in bytes
    async fn object_size(&self, path: &str) -> Result<u64> {
        Ok(self.read_all(path).await?.len() as u64)
    }

    /// Bytes `range` of an object
    async fn read_range(&self, path: &str, range: Range<u64>) -> Result<Bytes> {
        let data = self.read_all(path).await?;
        slice_range(path, &data, range)
    }
}

/// `range` of `data`, which must lie within it
pub fn slice_range(path: &str, data: &Bytes, range: Range<u64>) -> Result<Bytes> {
    let len = data.len() as u64;
    if range.start > range.end || range.end > len {
        return Err(StreamError::InvalidArgument(format!(
            "range {range:?} outside {path:?} ({len} bytes)"
        )));
    }
    Ok(data.slice(range.start as usize..range.end as usize))
}

/// Strip Firebase hosting suffixes so `foo.firebasestorage.app` and
/// `foo.appspot.com` both address bucket `foo`.
pub fn normalize_bucket_name(bucket: &str) -> String {
    let bucket = bucket.trim();
    bucket
        .strip_suffix(".firebasestorage.app")
        .or_else(|| bucket.strip_suffix(".appspot.com"))
        .unwrap_or(bucket)
        .to_string()
}

/// [`ObjectReader`] backed by any `object_store` implementation
#[derive(Clone)]
pub struct RemoteStore {
    inner: Arc<dyn ObjectStore>,
    bucket: String,
}

impl fmt::Debug for RemoteStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteStore")
            .field("bucket", &self.bucket)
            .field("backend", &self.inner.to_string())
            .finish()
    }
}

impl RemoteStore {
    /// Wrap an existing store
    pub fn new(inner: Arc<dyn ObjectStore>, bucket: impl AsRef<str>) -> Self {
        Self {
            inner,
            bucket: normalize_bucket_name(bucket.as_ref()),
        }
    }

    /// Process-local store, used by tests and dry runs
    pub fn in_memory() -> Self {
        Self::new(Arc::new(object_store::memory::InMemory::new()), "memory")
    }

    /// Store rooted at a local directory (the directory plays the bucket)
    pub fn local(root: impl AsRef<std::path::Path>) -> Result<Self> {
        let root = root.as_ref();
        let fs = object_store::local::LocalFileSystem::new_with_prefix(root)?;
        Ok(Self::new(Arc::new(fs), root.to_string_lossy()))
    }

    /// Google Cloud Storage bucket, credentials from the environment
    #[cfg(feature = "gcp")]
    pub fn gcs(bucket: &str) -> Result<Self> {
        let bucket = normalize_bucket_name(bucket);
        let gcs = object_store::gcp::GoogleCloudStorageBuilder::from_env()
            .with_bucket_name(&bucket)
            .build()?;
        Ok(Self::new(Arc::new(gcs), bucket))
    }

    /// S3 bucket, credentials from the environment
    #[cfg(feature = "aws")]
    pub fn s3(bucket: &str) -> Result<Self> {
        let s3 = object_store::aws::AmazonS3Builder::from_env()
            .with_bucket_name(bucket)
            .build()?;
        Ok(Self::new(Arc::new(s3), bucket))
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Underlying store, for writers that live outside this crate
    pub fn inner(&self) -> &Arc<dyn ObjectStore> {
        &self.inner
    }

    /// Upload an object. The engine never writes; this exists for fixtures and tooling.
    pub async fn put(&self, path: &str, data: impl Into<Bytes>) -> Result<()> {
        let location = object_path(path)?;
        self.inner
            .put(&location, PutPayload::from(data.into()))
            .await?;
        Ok(())
    }
}

fn object_path(path: &str) -> Result<ObjectPath> {
    let trimmed = path.trim_start_matches('/');
    if trimmed.is_empty() {
        return Err(StreamError::InvalidArgument("empty object path".into()));
    }
    Ok(ObjectPath::parse(trimmed)?)
}

#[async_trait]
impl ObjectReader for RemoteStore {
    #[instrument(skip(self), fields(bucket = %self.bucket))]
    async fn exists(&self, path: &str) -> Result<bool> {
        match self.inner.head(&object_path(path)?).await {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    #[instrument(skip(self), fields(bucket = %self.bucket))]
    async fn read_all(&self, path: &str) -> Result<Bytes> {
        let bytes = self.inner.get(&object_path(path)?).await?.bytes().await?;
        debug!(path = %path, bytes = bytes.len(), "object read");
        Ok(bytes)
    }

    async fn open_stream(&self, path: &str) -> Result<ByteStream> {
        let result = self.inner.get(&object_path(path)?).await?;
        debug!(path = %path, size = result.meta.size, "remote stream opened");
        Ok(result.into_stream().map_err(StreamError::from).boxed())
    }

    fn supports_ranges(&self) -> bool {
        true
    }

    async fn object_size(&self, path: &str) -> Result<u64> {
        Ok(self.inner.head(&object_path(path)?).await?.size)
    }

    async fn read_range(&self, path: &str, range: Range<u64>) -> Result<Bytes> {
        let bytes = self.inner.get_range(&object_path(path)?, range.clone()).await?;
        debug!(path = %path, start = range.start, end = range.end, "range read");
        Ok(bytes)
    }

    #[instrument(skip(self), fields(bucket = %self.bucket))]
    async fn list(&self, prefix: &str) -> Result<Vec<ObjectEntry>> {
        let trimmed = prefix.trim_matches('/');
        let prefix = if trimmed.is_empty() {
            None
        } else {
            Some(ObjectPath::parse(trimmed)?)
        };

        let mut entries: Vec<ObjectEntry> = self
            .inner
            .list(prefix.as_ref())
            .map_ok(|meta| ObjectEntry {
                path: meta.location.to_string(),
                size: meta.size,
            })
            .try_collect()
            .await?;
        entries.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_bucket_name() {
        assert_eq!(normalize_bucket_name("ads-data.firebasestorage.app"), "ads-data");
        assert_eq!(normalize_bucket_name("ads-data.appspot.com"), "ads-data");
        assert_eq!(normalize_bucket_name(" ads-data "), "ads-data");
    }

    #[tokio::test]
    async fn test_in_memory_read_and_exists() {
        let store = RemoteStore::in_memory();
        store.put("timeseries_data/a.parquet", b"abc".to_vec()).await.unwrap();

        assert!(store.exists("timeseries_data/a.parquet").await.unwrap());
        assert!(!store.exists("timeseries_data/b.parquet").await.unwrap());
        assert_eq!(
            store.read_all("timeseries_data/a.parquet").await.unwrap(),
            Bytes::from_static(b"abc")
        );
    }

    #[tokio::test]
    async fn test_missing_object_is_not_found() {
        let store = RemoteStore::in_memory();
        let err = store.read_all("timeseries_data/none.parquet").await.unwrap_err();
        assert!(err.is_not_found());
        assert!(store.open_stream("timeseries_data/none.parquet").await.is_err());
    }

    #[tokio::test]
    async fn test_list_is_sorted_and_prefixed() {
        let store = RemoteStore::in_memory();
        for p in ["timeseries_data/daily/z.parquet", "timeseries_data/daily/a.parquet", "other/x"] {
            store.put(p, b"1234".to_vec()).await.unwrap();
        }
        let listed = store.list("timeseries_data/").await.unwrap();
        let paths: Vec<&str> = listed.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(paths, vec!["timeseries_data/daily/a.parquet", "timeseries_data/daily/z.parquet"]);
        assert_eq!(listed[0].size, 4);
    }

    #[tokio::test]
    async fn test_ranged_reads() {
        let store = RemoteStore::in_memory();
        store.put("blob", b"PAR1-body-PAR1".to_vec()).await.unwrap();

        assert!(store.supports_ranges());
        assert_eq!(store.object_size("blob").await.unwrap(), 14);
        assert_eq!(store.read_range("blob", 10..14).await.unwrap(), Bytes::from_static(b"PAR1"));
        assert!(store.object_size("none").await.unwrap_err().is_not_found());
    }

    #[test]
    fn test_slice_range_bounds() {
        let data = Bytes::from_static(b"abcdef");
        assert_eq!(slice_range("x", &data, 1..3).unwrap(), Bytes::from_static(b"bc"));
        assert_eq!(slice_range("x", &data, 6..6).unwrap(), Bytes::new());
        assert!(slice_range("x", &data, 4..7).is_err());
    }

    #[tokio::test]
    async fn test_open_stream_yields_all_bytes() {
        let store = RemoteStore::in_memory();
        let payload: Vec<u8> = (0..=255u8).cycle().take(10_000).collect();
        store.put("blob", payload.clone()).await.unwrap();

        let chunks: Vec<Bytes> = store.open_stream("blob").await.unwrap().try_collect().await.unwrap();
        let joined: Vec<u8> = chunks.iter().flat_map(|c| c.iter().copied()).collect();
        assert_eq!(joined, payload);
    }
}
