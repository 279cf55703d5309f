use thiserror::Error;

/// A quota could not cover the requested cost.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{actor} exceeded the {operation} quota: {used}+{requested} > {limit}")]
pub struct QuotaExceeded {
    pub actor: String,
    pub operation: String,
    pub limit: u64,
    pub used: u64,
    pub requested: u64,
}

/// A `traceparent` value that does not follow the W3C format.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("malformed traceparent {value:?}: {reason}")]
pub struct TraceparentError {
    pub value: String,
    pub reason: &'static str,
}
