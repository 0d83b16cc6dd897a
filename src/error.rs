use std::io;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("write to the past: timestamp {ts} precedes buffer start {start}")]
    FromPast { ts: i64, start: i64 },
    #[error("unknown metric: {0}")]
    UnknownMetric(String),
    #[error("unknown field: {0}")]
    UnknownField(String),
    #[error("missing required tag: {0}")]
    MissingTag(&'static str),
    #[error("missing required field: {0}")]
    MissingField(&'static str),
    #[error("unsupported value kind: {0}")]
    UnsupportedKind(&'static str),
    #[error("invalid time range: from={from} > to={to}")]
    InvalidTimeRange { from: i64, to: i64 },
    #[error("no data for this selector and metric")]
    NoHostOrMetric,
    #[error("data from sibling levels does not align")]
    DataDoesNotAlign,
    #[error("invalid aggregation: more than one source but no aggregation strategy")]
    InvalidAggregation,
    #[error("resolution {resolution} is not a multiple of the metric frequency {frequency}")]
    UnsupportedResolution { resolution: i64, frequency: i64 },
    #[error("no new data to checkpoint")]
    NoNewData,
    #[error("no new data to archive")]
    NoNewArchiveData,
    #[error("corruption detected: {0}")]
    Corrupted(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("initialization failed: {0}")]
    Init(String),
}

impl StoreError {
    /// Outcomes a background worker treats as success at the next tick.
    pub fn is_informational(&self) -> bool {
        matches!(self, StoreError::NoNewData | StoreError::NoNewArchiveData)
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

impl From<csv::Error> for StoreError {
    fn from(err: csv::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}
