//! In-memory partition catalog
//!
//! Built once per process from the consolidation manifest (or from a store
//! listing) and read-only afterward. A missing or unreadable manifest leaves
//! the catalog empty; planners then address monthly raw partitions directly.

use std::collections::BTreeMap;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{Result, StreamError};
use crate::locator::{months_between, PartitionCategory, PartitionKey, Period};
use crate::store::ObjectReader;

const MIB: f64 = 1024.0 * 1024.0;

/// Manifest document. Accepts both
/// `{"partitions": [{"period", "byte_size", "row_count"}]}` and the
/// consolidation report `{"processing_results": [{"month_key", "file_size_mb", "total_rows"}]}`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Manifest {
    #[serde(default, alias = "processing_results")]
    pub partitions: Vec<ManifestEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ManifestEntry {
    #[serde(alias = "month_key")]
    pub period: String,
    #[serde(default)]
    pub byte_size: Option<u64>,
    #[serde(default)]
    pub file_size_mb: Option<f64>,
    #[serde(default, alias = "total_rows")]
    pub row_count: Option<u64>,
    /// Explicit object path; derived from the period when absent
    #[serde(default)]
    pub path: Option<String>,
}

impl ManifestEntry {
    pub fn bytes(&self) -> u64 {
        match (self.byte_size, self.file_size_mb) {
            (Some(b), _) => b,
            (None, Some(mb)) if mb.is_finite() && mb > 0.0 => (mb * MIB).round() as u64,
            _ => 0,
        }
    }
}

impl Manifest {
    pub fn parse(raw: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(raw)?)
    }
}

/// Inclusive calendar coverage of a partition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CoveredRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl CoveredRange {
    fn of(period: Period) -> Option<Self> {
        Some(Self {
            start: period.start_date()?,
            end: period.end_date()?,
        })
    }

    /// Fully or partially inside `[start, end]`
    pub fn overlaps(&self, start: NaiveDate, end: NaiveDate) -> bool {
        self.start <= end && self.end >= start
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PartitionInfo {
    pub key: PartitionKey,
    pub remote_path: String,
    pub byte_size: u64,
    /// Unknown for partitions discovered by listing
    pub row_count: Option<u64>,
    /// `None` for whole-series files
    pub date_range: Option<CoveredRange>,
}

impl PartitionInfo {
    pub fn new(key: PartitionKey, remote_path: impl Into<String>, byte_size: u64, row_count: Option<u64>) -> Self {
        Self {
            key,
            remote_path: remote_path.into(),
            byte_size,
            row_count,
            date_range: CoveredRange::of(key.period()),
        }
    }
}

/// Per-process partition index, keyed by partition
#[derive(Debug, Clone, Default)]
pub struct PartitionCatalog {
    entries: BTreeMap<PartitionKey, PartitionInfo>,
}

impl PartitionCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from the manifest at `manifest_path`.
    ///
    /// Missing or access-denied manifests give an empty catalog. Transient
    /// failures and malformed JSON are errors.
    pub async fn build(reader: &dyn ObjectReader, manifest_path: &str) -> Result<Self> {
        let raw = match reader.read_all(manifest_path).await {
            Ok(raw) => raw,
            Err(e) if e.is_not_found() => {
                warn!(path = %manifest_path, "manifest not found, catalog left empty");
                return Ok(Self::new());
            }
            Err(e) if e.is_permission_denied() => {
                warn!(path = %manifest_path, error = %e, "manifest not accessible, catalog left empty");
                return Ok(Self::new());
            }
            Err(e) => return Err(e),
        };

        let manifest = Manifest::parse(&raw).map_err(|e| match e {
            StreamError::Serialization(msg) => {
                StreamError::Serialization(format!("malformed manifest {manifest_path}: {msg}"))
            }
            other => other,
        })?;
        let catalog = Self::from_manifest(&manifest);
        info!(path = %manifest_path, partitions = catalog.len(), "partition catalog built");
        Ok(catalog)
    }

    /// Raw monthly partitions listed in `manifest`. Entries with an
    /// unparseable period are skipped.
    pub fn from_manifest(manifest: &Manifest) -> Self {
        let mut catalog = Self::new();
        for entry in &manifest.partitions {
            let key = match Period::parse(&entry.period)
                .and_then(|period| PartitionKey::new(PartitionCategory::Raw, period))
            {
                Ok(key) => key,
                Err(e) => {
                    warn!(period = %entry.period, error = %e, "skipping manifest entry");
                    continue;
                }
            };
            let path = entry.path.clone().unwrap_or_else(|| key.path());
            catalog.insert(PartitionInfo::new(key, path, entry.bytes(), entry.row_count));
        }
        catalog
    }

    /// Build from a store listing under `prefix`. Objects that are not
    /// partition files are ignored.
    pub async fn build_from_listing(reader: &dyn ObjectReader, prefix: &str) -> Result<Self> {
        let mut catalog = Self::new();
        for entry in reader.list(prefix).await? {
            match PartitionKey::from_path(&entry.path) {
                Ok(key) => catalog.insert(PartitionInfo::new(key, entry.path, entry.size, None)),
                Err(_) => debug!(path = %entry.path, "not a partition, skipped"),
            }
        }
        info!(prefix = %prefix, partitions = catalog.len(), "partition catalog built from listing");
        Ok(catalog)
    }

    pub fn insert(&mut self, info: PartitionInfo) {
        self.entries.insert(info.key, info);
    }

    pub fn get(&self, key: &PartitionKey) -> Option<&PartitionInfo> {
        self.entries.get(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PartitionInfo> {
        self.entries.values()
    }

    pub fn total_rows(&self) -> u64 {
        self.iter().filter_map(|p| p.row_count).sum()
    }

    pub fn total_bytes(&self) -> u64 {
        self.iter().map(|p| p.byte_size).sum()
    }

    /// Dated partitions overlapping `[start, end]`, in period order
    pub fn partitions_in_range(&self, start: NaiveDate, end: NaiveDate) -> Vec<&PartitionInfo> {
        let mut hits: Vec<&PartitionInfo> = self
            .iter()
            .filter(|p| p.date_range.is_some_and(|r| r.overlaps(start, end)))
            .collect();
        hits.sort_by_key(|p| (p.key.period(), p.key.category()));
        hits
    }

    /// Paths of the partitions overlapping `[start, end]`, in period order
    pub fn select_by_date_range(&self, start: NaiveDate, end: NaiveDate) -> Vec<String> {
        self.partitions_in_range(start, end)
            .into_iter()
            .map(|p| p.remote_path.clone())
            .collect()
    }

    /// Paths to read for `[start, end]`. An empty catalog falls back to the
    /// monthly raw partition paths built by the locator.
    pub fn candidate_paths(&self, start: NaiveDate, end: NaiveDate) -> Vec<String> {
        if self.is_empty() {
            return months_between(start, end)
                .into_iter()
                .filter_map(|period| PartitionKey::new(PartitionCategory::Raw, period).ok())
                .map(|key| key.path())
                .collect();
        }
        self.select_by_date_range(start, end)
    }
}

/// Known windows with no collected data
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataGap {
    pub start: &'static str,
    pub end: &'static str,
}

pub const DATA_GAPS: [DataGap; 2] = [
    DataGap {
        start: "2023-12-18",
        end: "2024-01-11",
    },
    DataGap {
        start: "2024-04-24",
        end: "2024-07-09",
    },
];

impl DataGap {
    pub fn contains(&self, date: NaiveDate) -> bool {
        // ISO dates order lexicographically
        let day = date.format("%Y-%m-%d").to_string();
        self.start <= day.as_str() && day.as_str() <= self.end
    }
}

pub fn is_in_data_gap(date: NaiveDate) -> bool {
    DATA_GAPS.iter().any(|gap| gap.contains(date))
}
