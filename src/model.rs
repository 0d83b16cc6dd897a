//! Core data model: samples, metric catalog entries and selectors.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Result, StoreError};

/// Number of sample slots a freshly allocated buffer holds.
pub const BUFFER_CAP: usize = 512;

/// A single point-in-time measurement. The value uses the NaN bit
/// pattern to mean "missing"; samples are never optional.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub name: String,
    pub value: f32,
    pub timestamp: i64,
}

impl Sample {
    pub fn new(name: impl Into<String>, value: f32, timestamp: i64) -> Self {
        Self {
            name: name.into(),
            value,
            timestamp,
        }
    }
}

/// Spatial combination across sibling scopes at the same timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregationStrategy {
    #[default]
    #[serde(alias = "")]
    None,
    Sum,
    Avg,
}

impl AggregationStrategy {
    pub fn assign_aggregation_strategy(s: &str) -> Result<Self> {
        match s {
            "" | "none" => Ok(AggregationStrategy::None),
            "sum" => Ok(AggregationStrategy::Sum),
            "avg" => Ok(AggregationStrategy::Avg),
            other => Err(StoreError::Config(format!(
                "unknown aggregation strategy: {other:?}"
            ))),
        }
    }
}

/// Catalog entry as configured: how often a metric ticks and how it
/// combines across sibling scopes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricSpec {
    /// Seconds between samples of this metric.
    pub frequency: i64,
    #[serde(default)]
    pub aggregation: AggregationStrategy,
}

/// Per-metric-name configuration. `offset` is assigned once at store
/// construction and indexes into every level's per-metric slot array.
#[derive(Debug, Clone)]
pub struct MetricConfig {
    /// Seconds between samples of this metric.
    pub frequency: i64,
    pub aggregation: AggregationStrategy,
    pub offset: usize,
}

/// One element of a query selector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelectorElement {
    /// Match exactly one child by name.
    String(String),
    /// Match any child whose name is in the group.
    Group(Vec<String>),
    /// Match every child.
    Any,
}

impl SelectorElement {
    pub fn matches(&self, name: &str) -> bool {
        match self {
            SelectorElement::String(s) => s == name,
            SelectorElement::Group(g) => g.iter().any(|s| s == name),
            SelectorElement::Any => true,
        }
    }
}

impl fmt::Display for SelectorElement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SelectorElement::String(s) => write!(f, "{s}"),
            SelectorElement::Group(g) => write!(f, "[{}]", g.join("|")),
            SelectorElement::Any => write!(f, "*"),
        }
    }
}

/// Ordered path of pattern elements tracing levels from the root.
pub type Selector = Vec<SelectorElement>;

/// Builds an exact-match query selector from path segments.
pub fn selector_from_path<I, S>(path: I) -> Selector
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    path.into_iter()
        .map(|s| SelectorElement::String(s.into()))
        .collect()
}
