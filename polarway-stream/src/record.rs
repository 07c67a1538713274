//! Decoded row representation

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Well-known column names of the consolidated ad dataset
pub mod columns {
    pub const PRODUCT_ID: &str = "product_id";
    pub const PRODUCT_NAME: &str = "product_name";
    pub const ADVERTISER_ID: &str = "advertiser_id";
    pub const ADVERTISER_NAME: &str = "advertiser_name";
    pub const GENRE_ID: &str = "genre_id";
    pub const GENRE_NAME: &str = "genre_name";
    pub const TRANSITION_URL: &str = "transition_url";
    pub const CREATION_TIME: &str = "creation_time";
    pub const APP_NAME: &str = "app_name";
    pub const AD_SENTENCE: &str = "ad_sentence";
    pub const AD_START_SENTENCE: &str = "ad_start_sentence";
    pub const AD_ALL_SENTENCE: &str = "ad_all_sentence";
    pub const PLAY_COUNT: &str = "play_count";
    pub const DIGG_COUNT: &str = "digg_count";
    pub const COST: &str = "cost";
    pub const DATE: &str = "date";
    pub const STREAMING_PERIOD: &str = "streaming_period";

    // Pre-aggregated summary partitions
    pub const AD_COUNT: &str = "ad_count";
    pub const TOTAL_ADS: &str = "total_ads";
    pub const TOTAL_COST: &str = "total_cost";
    pub const TOTAL_PLAY_COUNT: &str = "total_play_count";
    pub const TOTAL_DIGG_COUNT: &str = "total_digg_count";
}

/// A single cell value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl FieldValue {
    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Numeric view. Strings holding a number are accepted, since some
    /// exports store counts as text.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Int(i) => Some(*i as f64),
            FieldValue::Float(f) => Some(*f),
            FieldValue::Str(s) => s.trim().parse::<f64>().ok(),
            FieldValue::Bool(_) | FieldValue::Null => None,
        }
    }

    /// Rendering used for equality filters and document text
    pub fn render(&self) -> String {
        match self {
            FieldValue::Null => String::new(),
            FieldValue::Bool(b) => b.to_string(),
            FieldValue::Int(i) => i.to_string(),
            FieldValue::Float(f) => f.to_string(),
            FieldValue::Str(s) => s.clone(),
        }
    }
}

impl From<&str> for FieldValue {
    fn from(s: &str) -> Self {
        FieldValue::Str(s.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(s: String) -> Self {
        FieldValue::Str(s)
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        FieldValue::Int(v)
    }
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        FieldValue::Float(v)
    }
}

impl From<bool> for FieldValue {
    fn from(v: bool) -> Self {
        FieldValue::Bool(v)
    }
}

impl<T: Into<FieldValue>> From<Option<T>> for FieldValue {
    fn from(v: Option<T>) -> Self {
        v.map_or(FieldValue::Null, Into::into)
    }
}

/// One decoded row: column name to value, in file column order.
///
/// Records are values. Once produced by a decoder they are moved, never shared.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RawRecord {
    fields: IndexMap<String, FieldValue>,
}

impl RawRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(n: usize) -> Self {
        Self {
            fields: IndexMap::with_capacity(n),
        }
    }

    /// Append a column; a repeated name overwrites in place.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<FieldValue>) {
        self.fields.insert(name.into(), value.into());
    }

    /// Builder-style insert, handy for fixtures
    pub fn with(mut self, name: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.insert(name, value);
        self
    }

    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }

    /// Non-empty string value of a column
    pub fn text(&self, name: &str) -> Option<&str> {
        self.get(name)
            .and_then(FieldValue::as_str)
            .filter(|s| !s.is_empty())
    }

    pub fn number(&self, name: &str) -> Option<f64> {
        self.get(name).and_then(FieldValue::as_f64)
    }

    /// Numeric value with missing/null treated as zero, as the summary endpoints do
    pub fn number_or_zero(&self, name: &str) -> f64 {
        self.number(name).unwrap_or(0.0)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &FieldValue)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

impl FromIterator<(String, FieldValue)> for RawRecord {
    fn from_iter<I: IntoIterator<Item = (String, FieldValue)>>(iter: I) -> Self {
        Self {
            fields: iter.into_iter().collect(),
        }
    }
}

/// Column description returned by schema inspection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldInfo {
    pub name: String,
    #[serde(rename = "type")]
    pub data_type: String,
    pub nullable: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_serializes_as_flat_object() {
        let rec = RawRecord::new()
            .with(columns::PRODUCT_NAME, "Sparkling Water")
            .with(columns::PLAY_COUNT, 1200i64)
            .with(columns::COST, 35.5)
            .with(columns::AD_SENTENCE, None::<String>);

        assert_eq!(
            rec.to_json().unwrap(),
            r#"{"product_name":"Sparkling Water","play_count":1200,"cost":35.5,"ad_sentence":null}"#
        );
    }

    #[test]
    fn test_accessors() {
        let rec = RawRecord::new()
            .with(columns::APP_NAME, "instagram")
            .with(columns::GENRE_NAME, "")
            .with(columns::DIGG_COUNT, "42");

        assert_eq!(rec.text(columns::APP_NAME), Some("instagram"));
        assert_eq!(rec.text(columns::GENRE_NAME), None);
        assert_eq!(rec.number(columns::DIGG_COUNT), Some(42.0));
        assert_eq!(rec.number_or_zero(columns::COST), 0.0);
    }

    #[test]
    fn test_column_order_preserved() {
        let rec = RawRecord::new().with("b", 1i64).with("a", 2i64).with("c", 3i64);
        let names: Vec<&str> = rec.column_names().collect();
        assert_eq!(names, vec!["b", "a", "c"]);
    }

    #[test]
    fn test_field_info_json() {
        let info = FieldInfo {
            name: "cost".into(),
            data_type: "f64".into(),
            nullable: true,
        };
        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["type"], "f64");
    }
}
