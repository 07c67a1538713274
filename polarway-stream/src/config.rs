//! Configuration for Polarway Stream

use crate::error::{Result, StreamError};

/// Default decode unit size: 10 MiB
pub const DEFAULT_CHUNK_THRESHOLD: usize = 10 * 1024 * 1024;

/// Default pending-output high-water mark: 16 KiB of NDJSON
pub const DEFAULT_HIGH_WATER_MARK: usize = 16 * 1024;

/// Default manifest location, written by the consolidation job
pub const DEFAULT_MANIFEST_PATH: &str =
    "timeseries_data/raw_consolidated/consolidation_results.json";

/// Streaming engine configuration
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Bucket holding the `timeseries_data/` tree. `None` means unconfigured.
    pub bucket: Option<String>,

    /// Bytes accumulated before a decode pass is triggered
    pub chunk_threshold: usize,

    /// Maximum partitions read by a single query
    pub max_partitions_per_query: usize,

    /// Pending NDJSON bytes tolerated before the producer is throttled
    pub high_water_mark: usize,

    /// Capacity of the record channel behind `RecordStream`
    pub record_queue_capacity: usize,

    /// Skip the primary decoder and go straight to the fallback
    pub disable_primary_decoder: bool,

    /// Object path of the partition manifest
    pub manifest_path: String,

    /// Row cap applied when a request does not carry one
    pub default_limit: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            bucket: None,
            chunk_threshold: DEFAULT_CHUNK_THRESHOLD,
            max_partitions_per_query: 3,
            high_water_mark: DEFAULT_HIGH_WATER_MARK,
            record_queue_capacity: 256,
            disable_primary_decoder: false,
            manifest_path: DEFAULT_MANIFEST_PATH.to_string(),
            default_limit: 1000,
        }
    }
}

impl StreamConfig {
    /// Create config with sensible defaults for the given bucket
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            bucket: Some(bucket.into()),
            ..Self::default()
        }
    }

    /// Build a config from `POLARWAY_*` environment variables.
    ///
    /// Recognised variables:
    /// ```text
    /// POLARWAY_STREAM_BUCKET            bucket name (unset = unconfigured)
    /// POLARWAY_STREAM_CHUNK_BYTES       decode unit size in bytes
    /// POLARWAY_STREAM_MAX_PARTITIONS    partitions per query
    /// POLARWAY_STREAM_HIGH_WATER_MARK   pending NDJSON bytes
    /// POLARWAY_DISABLE_PRIMARY_DECODER  "1" / "true" forces the fallback decoder
    /// ```
    pub fn from_env() -> Result<Self> {
        let mut cfg = Self::default();

        if let Ok(bucket) = std::env::var("POLARWAY_STREAM_BUCKET") {
            if !bucket.trim().is_empty() {
                cfg.bucket = Some(bucket.trim().to_string());
            }
        }
        if let Some(v) = env_usize("POLARWAY_STREAM_CHUNK_BYTES")? {
            cfg.chunk_threshold = v;
        }
        if let Some(v) = env_usize("POLARWAY_STREAM_MAX_PARTITIONS")? {
            cfg.max_partitions_per_query = v;
        }
        if let Some(v) = env_usize("POLARWAY_STREAM_HIGH_WATER_MARK")? {
            cfg.high_water_mark = v;
        }
        if let Ok(flag) = std::env::var("POLARWAY_DISABLE_PRIMARY_DECODER") {
            cfg.disable_primary_decoder = parse_flag(&flag);
        }

        cfg.validate()?;
        Ok(cfg)
    }

    /// Override the bucket
    pub fn with_bucket(mut self, bucket: impl Into<String>) -> Self {
        self.bucket = Some(bucket.into());
        self
    }

    /// Override the decode unit size
    pub fn with_chunk_threshold(mut self, bytes: usize) -> Self {
        self.chunk_threshold = bytes;
        self
    }

    /// Override the partitions-per-query cap
    pub fn with_max_partitions(mut self, n: usize) -> Self {
        self.max_partitions_per_query = n;
        self
    }

    /// Override the pending-output high-water mark
    pub fn with_high_water_mark(mut self, bytes: usize) -> Self {
        self.high_water_mark = bytes;
        self
    }

    pub fn with_record_queue_capacity(mut self, capacity: usize) -> Self {
        self.record_queue_capacity = capacity;
        self
    }

    pub fn with_primary_decoder_disabled(mut self, disabled: bool) -> Self {
        self.disable_primary_decoder = disabled;
        self
    }

    pub fn with_manifest_path(mut self, path: impl Into<String>) -> Self {
        self.manifest_path = path.into();
        self
    }

    pub fn with_default_limit(mut self, limit: usize) -> Self {
        self.default_limit = limit;
        self
    }

    /// The configured bucket, or a `Config` error the HTTP layer maps to a 500
    pub fn require_bucket(&self) -> Result<&str> {
        self.bucket
            .as_deref()
            .ok_or_else(|| StreamError::Config("bucket not configured".to_string()))
    }

    /// Number of NDJSON lines that fit under the high-water mark, assuming
    /// roughly 512 bytes per serialized record. Never zero.
    pub fn ndjson_line_capacity(&self) -> usize {
        (self.high_water_mark / 512).max(1)
    }

    /// Reject configurations that would stall or never decode
    pub fn validate(&self) -> Result<()> {
        if self.chunk_threshold == 0 {
            return Err(StreamError::Config("chunk_threshold must be > 0".into()));
        }
        if self.max_partitions_per_query == 0 {
            return Err(StreamError::Config(
                "max_partitions_per_query must be > 0".into(),
            ));
        }
        if self.high_water_mark == 0 {
            return Err(StreamError::Config("high_water_mark must be > 0".into()));
        }
        if self.record_queue_capacity == 0 {
            return Err(StreamError::Config(
                "record_queue_capacity must be > 0".into(),
            ));
        }
        Ok(())
    }
}

fn env_usize(key: &str) -> Result<Option<usize>> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<usize>()
            .map(Some)
            .map_err(|e| StreamError::Config(format!("{key}={raw:?}: {e}"))),
        Err(_) => Ok(None),
    }
}

fn parse_flag(raw: &str) -> bool {
    matches!(
        raw.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let cfg = StreamConfig::default();
        assert_eq!(cfg.chunk_threshold, 10 * 1024 * 1024);
        assert_eq!(cfg.max_partitions_per_query, 3);
        assert_eq!(cfg.high_water_mark, 16_384);
        assert_eq!(cfg.default_limit, 1000);
        assert!(cfg.bucket.is_none());
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_builder_pattern() {
        let cfg = StreamConfig::new("ads-bucket")
            .with_chunk_threshold(1024)
            .with_max_partitions(5)
            .with_primary_decoder_disabled(true);

        assert_eq!(cfg.require_bucket().unwrap(), "ads-bucket");
        assert_eq!(cfg.chunk_threshold, 1024);
        assert_eq!(cfg.max_partitions_per_query, 5);
        assert!(cfg.disable_primary_decoder);
    }

    #[test]
    fn test_missing_bucket_is_config_error() {
        let err = StreamConfig::default().require_bucket().unwrap_err();
        assert!(matches!(err, StreamError::Config(_)));
    }

    #[test]
    fn test_validate_rejects_zero_threshold() {
        let cfg = StreamConfig::default().with_chunk_threshold(0);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_parse_flag() {
        assert!(parse_flag("1"));
        assert!(parse_flag("TRUE"));
        assert!(!parse_flag("0"));
        assert!(!parse_flag(""));
    }

    #[test]
    fn test_line_capacity_never_zero() {
        let cfg = StreamConfig::default().with_high_water_mark(10);
        assert_eq!(cfg.ndjson_line_capacity(), 1);
        assert_eq!(StreamConfig::default().ndjson_line_capacity(), 32);
    }
}
