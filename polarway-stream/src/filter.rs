//! Row-level predicate filtering

use std::cmp::Ordering;
use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::error::{Result, StreamError};
use crate::locator::Period;
use crate::record::{columns, FieldValue, RawRecord};

/// Row-acceptance test. Stateless per record.
pub trait RowPredicate: Send + Sync {
    fn matches(&self, record: &RawRecord) -> bool;
}

/// Inclusive date bounds given as `YYYY-MM` or `YYYY-MM-DD`.
/// A month bound covers the whole month on either side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: String,
    pub end: String,
}

impl DateRange {
    pub fn new(start: impl Into<String>, end: impl Into<String>) -> Self {
        Self {
            start: start.into(),
            end: end.into(),
        }
    }

    /// Resolve to concrete first/last days. Fails on unparseable or inverted bounds.
    pub fn bounds(&self) -> Result<(NaiveDate, NaiveDate)> {
        let invalid = || StreamError::InvalidArgument(format!("invalid date range {}..{}", self.start, self.end));
        let start = Period::parse(&self.start)?.start_date().ok_or_else(invalid)?;
        let end = Period::parse(&self.end)?.end_date().ok_or_else(invalid)?;
        if end < start {
            return Err(invalid());
        }
        Ok((start, end))
    }
}

/// Query filter. Every field is optional; absence means no constraint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FilterSpec {
    pub platform: Option<String>,
    pub genre: Option<String>,
    pub advertiser: Option<String>,
    #[serde(alias = "min_play_count")]
    pub min_play_count: Option<f64>,
    #[serde(alias = "min_cost")]
    pub min_cost: Option<f64>,
    #[serde(alias = "date_range")]
    pub date_range: Option<DateRange>,
    pub limit: Option<usize>,
}

impl FilterSpec {
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

    pub fn with_date_range(mut self, range: DateRange) -> Self {
        self.date_range = Some(range);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Whether no clause constrains records (the limit is not a clause)
    pub fn is_unconstrained(&self) -> bool {
        non_empty(&self.platform).is_none()
            && non_empty(&self.genre).is_none()
            && non_empty(&self.advertiser).is_none()
            && self.min_play_count.is_none()
            && self.min_cost.is_none()
            && self.date_range.is_none()
    }
}

fn non_empty(v: &Option<String>) -> Option<&str> {
    v.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOp {
    Eq,
    Neq,
    Lt,
    Le,
    Gt,
    Ge,
    /// Membership in a value set
    In,
}

impl FilterOp {
    /// Parse `==`/`eq`, `!=`/`neq`, `<`/`lt`, `<=`/`le`, `>`/`gt`, `>=`/`ge`, `in`
    pub fn parse(op: &str) -> Result<Self> {
        match op.trim() {
            "==" | "eq" => Ok(FilterOp::Eq),
            "!=" | "neq" => Ok(FilterOp::Neq),
            "<" | "lt" => Ok(FilterOp::Lt),
            "<=" | "le" => Ok(FilterOp::Le),
            ">" | "gt" => Ok(FilterOp::Gt),
            ">=" | "ge" => Ok(FilterOp::Ge),
            "in" => Ok(FilterOp::In),
            other => Err(StreamError::InvalidArgument(format!("unknown filter operator: {other:?}"))),
        }
    }
}

/// Compare a record column against constant operands
#[derive(Debug, Clone)]
pub struct ColumnPredicate {
    column: String,
    op: FilterOp,
    operands: Vec<FieldValue>,
}

impl ColumnPredicate {
    pub fn new(column: impl Into<String>, op: FilterOp, value: impl Into<FieldValue>) -> Self {
        Self {
            column: column.into(),
            op,
            operands: vec![value.into()],
        }
    }

    /// Membership test: the column equals any of `values`
    pub fn one_of<V: Into<FieldValue>>(column: impl Into<String>, values: impl IntoIterator<Item = V>) -> Self {
        Self {
            column: column.into(),
            op: FilterOp::In,
            operands: values.into_iter().map(Into::into).collect(),
        }
    }

    pub fn column(&self) -> &str {
        &self.column
    }

    pub fn op(&self) -> FilterOp {
        self.op
    }
}

/// Equality: numeric when both sides are numbers, textual otherwise
fn values_equal(lhs: &FieldValue, rhs: &FieldValue) -> bool {
    match (lhs, rhs) {
        (FieldValue::Null, _) | (_, FieldValue::Null) => false,
        (FieldValue::Str(a), FieldValue::Str(b)) => a == b,
        _ => match (lhs.as_f64(), rhs.as_f64()) {
            (Some(a), Some(b)) => a == b,
            _ => lhs.render() == rhs.render(),
        },
    }
}

/// Ordering for threshold clauses. A numeric operand compares numerically with
/// a missing or null cell counted as zero; a textual operand (such as a date)
/// compares lexicographically and a missing cell never matches.
fn compare(lhs: Option<&FieldValue>, rhs: &FieldValue) -> Option<Ordering> {
    match rhs {
        FieldValue::Int(_) | FieldValue::Float(_) => {
            let a = lhs.and_then(FieldValue::as_f64).unwrap_or(0.0);
            a.partial_cmp(&rhs.as_f64()?)
        }
        FieldValue::Str(b) => match lhs? {
            FieldValue::Null => None,
            other => Some(other.render().as_str().cmp(b.as_str())),
        },
        FieldValue::Bool(_) | FieldValue::Null => None,
    }
}

impl RowPredicate for ColumnPredicate {
    fn matches(&self, record: &RawRecord) -> bool {
        let cell = record.get(&self.column);
        let Some(first) = self.operands.first() else {
            return false;
        };

        match self.op {
            FilterOp::Eq => cell.is_some_and(|c| values_equal(c, first)),
            FilterOp::Neq => !cell.is_some_and(|c| values_equal(c, first)),
            FilterOp::In => cell.is_some_and(|c| self.operands.iter().any(|v| values_equal(c, v))),
            FilterOp::Lt => compare(cell, first) == Some(Ordering::Less),
            FilterOp::Le => matches!(compare(cell, first), Some(Ordering::Less | Ordering::Equal)),
            FilterOp::Gt => compare(cell, first) == Some(Ordering::Greater),
            FilterOp::Ge => matches!(compare(cell, first), Some(Ordering::Greater | Ordering::Equal)),
        }
    }
}

/// Conjunction with short-circuit in insertion order. An empty conjunction accepts everything.
#[derive(Default)]
pub struct AndPredicate {
    predicates: Vec<Box<dyn RowPredicate>>,
}

impl fmt::Debug for AndPredicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AndPredicate")
            .field("clauses", &self.predicates.len())
            .finish()
    }
}

impl AndPredicate {
    pub fn new(predicates: Vec<Box<dyn RowPredicate>>) -> Self {
        Self { predicates }
    }

    pub fn and(mut self, predicate: impl RowPredicate + 'static) -> Self {
        self.predicates.push(Box::new(predicate));
        self
    }

    pub fn len(&self) -> usize {
        self.predicates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.predicates.is_empty()
    }
}

impl RowPredicate for AndPredicate {
    fn matches(&self, record: &RawRecord) -> bool {
        self.predicates.iter().all(|p| p.matches(record))
    }
}

/// Build the predicate for a spec. Clause order: platform, genre, advertiser,
/// minPlayCount, minCost, then the date range.
pub fn compose(spec: &FilterSpec) -> Result<AndPredicate> {
    let mut pred = AndPredicate::default();

    if let Some(platform) = non_empty(&spec.platform) {
        pred = pred.and(ColumnPredicate::new(columns::APP_NAME, FilterOp::Eq, platform));
    }
    if let Some(genre) = non_empty(&spec.genre) {
        pred = pred.and(ColumnPredicate::new(columns::GENRE_NAME, FilterOp::Eq, genre));
    }
    if let Some(advertiser) = non_empty(&spec.advertiser) {
        pred = pred.and(ColumnPredicate::new(columns::ADVERTISER_NAME, FilterOp::Eq, advertiser));
    }
    if let Some(min) = spec.min_play_count {
        pred = pred.and(ColumnPredicate::new(columns::PLAY_COUNT, FilterOp::Ge, min));
    }
    if let Some(min) = spec.min_cost {
        pred = pred.and(ColumnPredicate::new(columns::COST, FilterOp::Ge, min));
    }
    if let Some(range) = &spec.date_range {
        let (start, end) = range.bounds()?;
        pred = pred
            .and(ColumnPredicate::new(columns::DATE, FilterOp::Ge, start.format("%Y-%m-%d").to_string()))
            .and(ColumnPredicate::new(columns::DATE, FilterOp::Le, end.format("%Y-%m-%d").to_string()));
    }

    Ok(pred)
}

/// Running result counter. The cap lives here, outside the stateless predicate.
#[derive(Debug, Clone, Copy)]
pub struct RecordLimit {
    limit: Option<usize>,
    accepted: usize,
}

impl RecordLimit {
    pub fn new(limit: Option<usize>) -> Self {
        Self { limit, accepted: 0 }
    }

    pub fn unlimited() -> Self {
        Self::new(None)
    }

    /// Count one record if the cap allows it
    pub fn admit(&mut self) -> bool {
        if self.is_reached() {
            return false;
        }
        self.accepted += 1;
        true
    }

    pub fn is_reached(&self) -> bool {
        self.limit.is_some_and(|l| self.accepted >= l)
    }

    pub fn accepted(&self) -> usize {
        self.accepted
    }

    pub fn remaining(&self) -> Option<usize> {
        self.limit.map(|l| l.saturating_sub(self.accepted))
    }
}

/// Free-text match: any whitespace-separated term of the query occurs,
/// case-insensitively, in the product name, ad copy or genre.
#[derive(Debug, Clone)]
pub struct TermPredicate {
    terms: Vec<String>,
}

impl TermPredicate {
    pub fn new(query: &str) -> Self {
        Self {
            terms: query
                .split_whitespace()
                .map(str::to_lowercase)
                .collect(),
        }
    }

    pub fn terms(&self) -> &[String] {
        &self.terms
    }
}

impl RowPredicate for TermPredicate {
    fn matches(&self, record: &RawRecord) -> bool {
        if self.terms.is_empty() {
            return true;
        }
        let haystack = [columns::PRODUCT_NAME, columns::AD_SENTENCE, columns::GENRE_NAME]
            .iter()
            .filter_map(|c| record.text(c))
            .collect::<Vec<_>>()
            .join(" ")
            .to_lowercase();
        self.terms.iter().any(|t| haystack.contains(t.as_str()))
    }
}
