//! Partition addressing: logical `(category, period)` keys to object paths
//!
//! Layout:
//! ```text
//! timeseries_data/
//! ├── timeseries.parquet                       (root, no category directory)
//! ├── raw_consolidated/consolidated_2024_03.parquet
//! ├── daily/daily_aggregation.parquet
//! ├── by_platform/platform_timeseries.parquet
//! └── ...
//! ```
//! Everything here is pure: no I/O, no clocks.

use std::fmt;
use std::str::FromStr;

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};

use crate::error::{Result, StreamError};

/// Top-level prefix of every partition object
pub const TIMESERIES_ROOT: &str = "timeseries_data";

const PARQUET_EXT: &str = ".parquet";

/// Partition category. `Root` is the category `""`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartitionCategory {
    Root,
    Raw,
    Daily,
    Weekly,
    Monthly,
    ByPlatform,
    ByGenre,
    ByAdvertiser,
}

impl PartitionCategory {
    pub const ALL: [PartitionCategory; 8] = [
        PartitionCategory::Root,
        PartitionCategory::Raw,
        PartitionCategory::Daily,
        PartitionCategory::Weekly,
        PartitionCategory::Monthly,
        PartitionCategory::ByPlatform,
        PartitionCategory::ByGenre,
        PartitionCategory::ByAdvertiser,
    ];

    /// Parse a category name. Accepts `raw_consolidated` as an alias of `raw`.
    pub fn parse(name: &str) -> Result<Self> {
        match name.trim() {
            "" => Ok(PartitionCategory::Root),
            "raw" | "raw_consolidated" => Ok(PartitionCategory::Raw),
            "daily" => Ok(PartitionCategory::Daily),
            "weekly" => Ok(PartitionCategory::Weekly),
            "monthly" => Ok(PartitionCategory::Monthly),
            "by_platform" => Ok(PartitionCategory::ByPlatform),
            "by_genre" => Ok(PartitionCategory::ByGenre),
            "by_advertiser" => Ok(PartitionCategory::ByAdvertiser),
            other => Err(StreamError::InvalidArgument(format!(
                "unknown partition category: {other:?}"
            ))),
        }
    }

    /// Logical name, `""` for the root category
    pub fn name(&self) -> &'static str {
        match self {
            PartitionCategory::Root => "",
            PartitionCategory::Raw => "raw",
            PartitionCategory::Daily => "daily",
            PartitionCategory::Weekly => "weekly",
            PartitionCategory::Monthly => "monthly",
            PartitionCategory::ByPlatform => "by_platform",
            PartitionCategory::ByGenre => "by_genre",
            PartitionCategory::ByAdvertiser => "by_advertiser",
        }
    }

    /// Directory under `timeseries_data/`; the root category has none
    pub fn directory(&self) -> Option<&'static str> {
        match self {
            PartitionCategory::Root => None,
            PartitionCategory::Raw => Some("raw_consolidated"),
            other => Some(other.name()),
        }
    }

    pub fn file_stem(&self) -> &'static str {
        match self {
            PartitionCategory::Root => "timeseries",
            PartitionCategory::Raw => "consolidated",
            PartitionCategory::Daily => "daily_aggregation",
            PartitionCategory::Weekly => "weekly_aggregation",
            PartitionCategory::Monthly => "monthly_aggregation",
            PartitionCategory::ByPlatform => "platform_timeseries",
            PartitionCategory::ByGenre => "genre_timeseries",
            PartitionCategory::ByAdvertiser => "advertiser_timeseries",
        }
    }

    /// Raw partitions only exist per period; there is no whole-series raw file.
    pub fn requires_period(&self) -> bool {
        matches!(self, PartitionCategory::Raw)
    }

    fn from_directory(dir: Option<&str>) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|c| c.directory() == dir)
    }
}

impl fmt::Display for PartitionCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for PartitionCategory {
    type Err = StreamError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// Calendar period of a partition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Period {
    /// The whole-series file (no period suffix)
    All,
    Month { year: i32, month: u32 },
    Day(NaiveDate),
}

impl Period {
    pub fn month(year: i32, month: u32) -> Result<Self> {
        if !(1..=12).contains(&month) || !(1000..=9999).contains(&year) {
            return Err(StreamError::InvalidArgument(format!(
                "invalid calendar month: {year}-{month}"
            )));
        }
        Ok(Period::Month { year, month })
    }

    /// Parse `""`, `all`, `YYYY-MM`, `YYYY_MM`, `YYYY-MM-DD` or `YYYY_MM_DD`
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if raw.is_empty() || raw.eq_ignore_ascii_case("all") {
            return Ok(Period::All);
        }

        let invalid = || StreamError::InvalidArgument(format!("unparseable period: {raw:?}"));
        let parts: Vec<&str> = raw.split(['-', '_']).collect();
        // fixed-width digit fields: 4 for the year, 2 for month and day
        let well_formed = parts.iter().enumerate().all(|(i, p)| {
            p.len() == if i == 0 { 4 } else { 2 } && p.bytes().all(|b| b.is_ascii_digit())
        });
        if !well_formed {
            return Err(invalid());
        }
        let nums = parts
            .iter()
            .map(|p| p.parse::<u32>())
            .collect::<std::result::Result<Vec<u32>, _>>()
            .map_err(|_| invalid())?;

        match nums.as_slice() {
            [year, month] => Period::month(*year as i32, *month).map_err(|_| invalid()),
            [year, month, day] => NaiveDate::from_ymd_opt(*year as i32, *month, *day)
                .map(Period::Day)
                .ok_or_else(invalid),
            _ => Err(invalid()),
        }
    }

    /// File suffix: `YYYY_MM`, `YYYY_MM_DD`, or `""` for `All`
    pub fn key(&self) -> String {
        match self {
            Period::All => String::new(),
            Period::Month { year, month } => format!("{year:04}_{month:02}"),
            Period::Day(d) => format!("{:04}_{:02}_{:02}", d.year(), d.month(), d.day()),
        }
    }

    pub fn is_all(&self) -> bool {
        matches!(self, Period::All)
    }

    /// First day covered, `None` for `All`
    pub fn start_date(&self) -> Option<NaiveDate> {
        match self {
            Period::All => None,
            Period::Month { year, month } => NaiveDate::from_ymd_opt(*year, *month, 1),
            Period::Day(d) => Some(*d),
        }
    }

    /// Last day covered (real month end), `None` for `All`
    pub fn end_date(&self) -> Option<NaiveDate> {
        match self {
            Period::All => None,
            Period::Month { year, month } => {
                let (ny, nm) = if *month == 12 { (year + 1, 1) } else { (*year, month + 1) };
                NaiveDate::from_ymd_opt(ny, nm, 1).and_then(|d| d.pred_opt())
            }
            Period::Day(d) => Some(*d),
        }
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Period::All => f.write_str("all"),
            Period::Month { year, month } => write!(f, "{year:04}-{month:02}"),
            Period::Day(d) => write!(f, "{}", d.format("%Y-%m-%d")),
        }
    }
}

impl FromStr for Period {
    type Err = StreamError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// Logical partition address. Maps one-to-one onto an object path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PartitionKey {
    category: PartitionCategory,
    period: Period,
}

impl PartitionKey {
    pub fn new(category: PartitionCategory, period: Period) -> Result<Self> {
        if category.requires_period() && period.is_all() {
            return Err(StreamError::InvalidArgument(format!(
                "category {:?} requires a concrete period",
                category.name()
            )));
        }
        Ok(Self { category, period })
    }

    /// Monthly raw partition, the unit the streaming endpoint reads
    pub fn raw_month(year: i32, month: u32) -> Result<Self> {
        Self::new(PartitionCategory::Raw, Period::month(year, month)?)
    }

    pub fn category(&self) -> PartitionCategory {
        self.category
    }

    pub fn period(&self) -> Period {
        self.period
    }

    pub fn file_name(&self) -> String {
        let stem = self.category.file_stem();
        match self.period {
            Period::All => format!("{stem}{PARQUET_EXT}"),
            p => format!("{stem}_{}{PARQUET_EXT}", p.key()),
        }
    }

    pub fn path(&self) -> String {
        build_timeseries_path(self.category.directory().unwrap_or(""), &self.file_name())
    }

    /// Inverse of [`PartitionKey::path`]. Only the canonical spelling of a
    /// key's path is accepted, so distinct objects never share a key.
    pub fn from_path(path: &str) -> Result<Self> {
        let invalid = || StreamError::InvalidArgument(format!("not a partition path: {path:?}"));

        let path = path.trim_start_matches('/');
        let rest = path
            .strip_prefix(TIMESERIES_ROOT)
            .and_then(|r| r.strip_prefix('/'))
            .ok_or_else(invalid)?;

        let (dir, file) = match rest.split_once('/') {
            Some((dir, file)) => (Some(dir), file),
            None => (None, rest),
        };
        if file.contains('/') {
            return Err(invalid());
        }

        let category = PartitionCategory::from_directory(dir).ok_or_else(invalid)?;
        let stem = file.strip_suffix(PARQUET_EXT).ok_or_else(invalid)?;
        let suffix = stem
            .strip_prefix(category.file_stem())
            .ok_or_else(invalid)?;

        let period = if suffix.is_empty() {
            Period::All
        } else {
            let key = suffix.strip_prefix('_').ok_or_else(invalid)?;
            match Period::parse(key)? {
                Period::All => return Err(invalid()),
                p => p,
            }
        };

        let key = Self::new(category, period)?;
        if key.path() != path {
            return Err(invalid());
        }
        Ok(key)
    }
}

impl Serialize for PartitionKey {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.category, self.period)
    }
}

/// `timeseries_data/{dir}/{file}`, or `timeseries_data/{file}` when `dir` is empty.
pub fn build_timeseries_path(dir: &str, file: &str) -> String {
    if dir.is_empty() {
        format!("{TIMESERIES_ROOT}/{file}")
    } else {
        format!("{TIMESERIES_ROOT}/{dir}/{file}")
    }
}

/// Resolve a `(category, period)` pair given as strings into an object path
pub fn resolve_path(category: &str, period: &str) -> Result<String> {
    let key = PartitionKey::new(PartitionCategory::parse(category)?, Period::parse(period)?)?;
    Ok(key.path())
}

/// Calendar month containing `date`
pub fn period_key(date: NaiveDate) -> Period {
    Period::Month {
        year: date.year(),
        month: date.month(),
    }
}

/// Parse a date given as `YYYY-MM-DD`, or a month `YYYY-MM` (first day)
pub fn parse_date(raw: &str) -> Result<NaiveDate> {
    Period::parse(raw)?
        .start_date()
        .ok_or_else(|| StreamError::InvalidArgument(format!("not a date: {raw:?}")))
}

/// Every calendar month touched by `[start, end]`, in order. Empty if `end < start`.
pub fn months_between(start: NaiveDate, end: NaiveDate) -> Vec<Period> {
    let mut out = Vec::new();
    if end < start {
        return out;
    }
    let (mut year, mut month) = (start.year(), start.month());
    let last = (end.year(), end.month());
    while (year, month) <= last {
        out.push(Period::Month { year, month });
        if month == 12 {
            year += 1;
            month = 1;
        } else {
            month += 1;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashSet;

    #[test]
    fn test_root_category_has_no_directory() {
        assert_eq!(
            resolve_path("", "").unwrap(),
            "timeseries_data/timeseries.parquet"
        );
        assert_eq!(
            build_timeseries_path("", "x.parquet"),
            "timeseries_data/x.parquet"
        );
        assert_eq!(
            build_timeseries_path("daily", "x.parquet"),
            "timeseries_data/daily/x.parquet"
        );
    }

    #[test]
    fn test_raw_month_path() {
        assert_eq!(
            resolve_path("raw", "2025-03").unwrap(),
            "timeseries_data/raw_consolidated/consolidated_2025_03.parquet"
        );
        assert_eq!(
            resolve_path("raw_consolidated", "2025_03").unwrap(),
            resolve_path("raw", "2025-03").unwrap()
        );
    }

    #[test]
    fn test_summary_paths() {
        assert_eq!(
            resolve_path("by_platform", "").unwrap(),
            "timeseries_data/by_platform/platform_timeseries.parquet"
        );
        assert_eq!(
            resolve_path("monthly", "all").unwrap(),
            "timeseries_data/monthly/monthly_aggregation.parquet"
        );
    }

    #[test]
    fn test_invalid_inputs() {
        assert!(matches!(
            resolve_path("hourly", "2024-01"),
            Err(StreamError::InvalidArgument(_))
        ));
        assert!(resolve_path("raw", "2024-13").is_err());
        assert!(resolve_path("raw", "24-01").is_err());
        assert!(resolve_path("raw", "2024-02-30").is_err());
        // raw has no whole-series file
        assert!(resolve_path("raw", "").is_err());
    }

    #[test]
    fn test_period_key_and_month_end() {
        let d = NaiveDate::from_ymd_opt(2024, 2, 17).unwrap();
        let p = period_key(d);
        assert_eq!(p.key(), "2024_02");
        assert_eq!(p.end_date(), NaiveDate::from_ymd_opt(2024, 2, 29));
        let dec = Period::month(2023, 12).unwrap();
        assert_eq!(dec.end_date(), NaiveDate::from_ymd_opt(2023, 12, 31));
    }

    #[test]
    fn test_months_between() {
        let start = NaiveDate::from_ymd_opt(2023, 11, 20).unwrap();
        let end = NaiveDate::from_ymd_opt(2024, 2, 1).unwrap();
        let keys: Vec<String> = months_between(start, end).iter().map(Period::key).collect();
        assert_eq!(keys, vec!["2023_11", "2023_12", "2024_01", "2024_02"]);
        assert!(months_between(end, start).is_empty());
    }

    #[test]
    fn test_from_path_rejects_foreign_objects() {
        assert!(PartitionKey::from_path("timeseries_data/raw_consolidated/consolidation_results.json").is_err());
        assert!(PartitionKey::from_path("other/raw_consolidated/consolidated_2024_01.parquet").is_err());
        assert!(PartitionKey::from_path("timeseries_data/daily/weekly_aggregation.parquet").is_err());
    }

    #[test]
    fn test_period_fields_are_fixed_width_digits() {
        for raw in ["2024-3", "2024_3", "2024-+3", "2024_+3", "2024-03-7", "2024-03-+7", "+2024-03", "2024- 3"] {
            assert!(Period::parse(raw).is_err(), "{raw} should be rejected");
        }
        assert_eq!(Period::parse("2024-03").unwrap(), Period::month(2024, 3).unwrap());
        assert_eq!(
            Period::parse("2024_03_07").unwrap(),
            Period::Day(NaiveDate::from_ymd_opt(2024, 3, 7).unwrap())
        );
    }

    #[test]
    fn test_from_path_rejects_non_canonical_names() {
        for path in [
            "timeseries_data/raw_consolidated/consolidated_2024_3.parquet",
            "timeseries_data/raw_consolidated/consolidated_2024_+3.parquet",
            "timeseries_data/raw_consolidated/consolidated_2024-03.parquet",
            "timeseries_data/daily/daily_aggregation_2024_03_7.parquet",
        ] {
            assert!(PartitionKey::from_path(path).is_err(), "{path} should be rejected");
        }
        let key = PartitionKey::from_path("timeseries_data/raw_consolidated/consolidated_2024_03.parquet").unwrap();
        assert_eq!(key, PartitionKey::raw_month(2024, 3).unwrap());
    }

    #[test]
    fn test_all_paths_distinct() {
        let mut keys = Vec::new();
        for c in PartitionCategory::ALL {
            for p in [
                Period::All,
                Period::month(2024, 1).unwrap(),
                Period::Day(NaiveDate::from_ymd_opt(2024, 1, 1).unwrap()),
            ] {
                if let Ok(k) = PartitionKey::new(c, p) {
                    keys.push(k);
                }
            }
        }
        let paths: HashSet<String> = keys.iter().map(PartitionKey::path).collect();
        assert_eq!(paths.len(), keys.len());
    }

    fn arb_period() -> impl Strategy<Value = Period> {
        prop_oneof![
            Just(Period::All),
            (1990i32..2100, 1u32..=12).prop_map(|(y, m)| Period::Month { year: y, month: m }),
            (1990i32..2100, 1u32..=12, 1u32..=28).prop_map(|(y, m, d)| {
                Period::Day(NaiveDate::from_ymd_opt(y, m, d).unwrap())
            }),
        ]
    }

    fn arb_category() -> impl Strategy<Value = PartitionCategory> {
        (0usize..PartitionCategory::ALL.len()).prop_map(|i| PartitionCategory::ALL[i])
    }

    proptest! {
        #[test]
        fn prop_path_round_trips(category in arb_category(), period in arb_period()) {
            prop_assume!(!(category.requires_period() && period.is_all()));
            let key = PartitionKey::new(category, period).unwrap();
            let back = PartitionKey::from_path(&key.path()).unwrap();
            prop_assert_eq!(back, key);
        }

        #[test]
        fn prop_path_is_injective(
            a in (arb_category(), arb_period()),
            b in (arb_category(), arb_period()),
        ) {
            let (ka, kb) = (PartitionKey::new(a.0, a.1), PartitionKey::new(b.0, b.1));
            if let (Ok(ka), Ok(kb)) = (ka, kb) {
                prop_assert_eq!(ka == kb, ka.path() == kb.path());
            }
        }

        #[test]
        fn prop_parsed_paths_are_canonical(
            category in arb_category(),
            fields in prop::collection::vec(
                prop::collection::vec(prop::sample::select(vec!['-', '+', '0', '1', '2', '3', '9']), 1..=5),
                0..=3,
            ),
        ) {
            let suffix: String = fields
                .iter()
                .map(|f| format!("_{}", f.iter().collect::<String>()))
                .collect();
            let name = format!("{}{}{PARQUET_EXT}", category.file_stem(), suffix);
            let path = build_timeseries_path(category.directory().unwrap_or(""), &name);
            if let Ok(key) = PartitionKey::from_path(&path) {
                prop_assert_eq!(key.path(), path);
            }
        }

        #[test]
        fn prop_period_key_parses_back(y in 1990i32..2100, m in 1u32..=12) {
            let p = Period::month(y, m).unwrap();
            prop_assert_eq!(Period::parse(&p.key()).unwrap(), p);
            prop_assert_eq!(Period::parse(&p.to_string()).unwrap(), p);
        }
    }
}
