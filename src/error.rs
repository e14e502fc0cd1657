//! Error types shared across the acquisition and query layers.

use thiserror::Error;

/// Failure to obtain bytes for one upstream resource.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FetchError {
    /// The anti-bot challenge was still served after every attempt, or a
    /// fresh session could not be acquired.
    #[error("blocked by upstream challenge: {0}")]
    Blocked(String),

    /// Transport failure, timeout or unexpected HTTP status.
    #[error("network error: {0}")]
    Network(String),

    /// Upstream confirmed the resource has not changed since the last fetch.
    #[error("resource not modified")]
    NotModified,
}

impl FetchError {
    /// Short machine-readable name, used in health reports and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            FetchError::Blocked(_) => "blocked",
            FetchError::Network(_) => "network_error",
            FetchError::NotModified => "not_modified",
        }
    }
}

/// Malformed upstream payload for a single dataset file or feed.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("csv error in {file}: {source}")]
    Csv {
        file: String,
        #[source]
        source: csv::Error,
    },

    #[error("protobuf decode error: {0}")]
    Protobuf(#[from] prost::DecodeError),

    #[error("archive error: {0}")]
    Archive(String),

    #[error("schema of {file} changed: expected [{expected}], found [{found}]")]
    Schema {
        file: String,
        expected: String,
        found: String,
    },

    #[error("{0} has no header row")]
    Empty(String),
}

/// Caller input errors reported synchronously by the query engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QueryError {
    #[error("unknown dataset '{0}'")]
    UnknownDataset(String),

    #[error("unknown field '{field}' for dataset '{dataset}'")]
    UnknownField { dataset: String, field: String },

    #[error("invalid page '{0}': expected a non-negative integer")]
    InvalidPage(String),

    #[error("invalid limit '{0}': expected an integer between 1 and 5000")]
    LimitExceeded(String),

    /// A dataset the request joins against has not been published yet.
    #[error("{0} not available yet")]
    Unavailable(String),
}

impl QueryError {
    pub fn kind(&self) -> &'static str {
        match self {
            QueryError::UnknownDataset(_) => "UnknownDataset",
            QueryError::UnknownField { .. } => "UnknownField",
            QueryError::InvalidPage(_) => "InvalidPage",
            QueryError::LimitExceeded(_) => "LimitExceeded",
            QueryError::Unavailable(_) => "Unavailable",
        }
    }
}
