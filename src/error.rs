//! Custom error types for the signal relay
//!
//! Rejections are ordinary outcomes of the pipeline and carry the values that
//! drove the decision, so a caller can diagnose them without re-parsing.

use thiserror::Error;

/// Reason-coded rejection of an alert or a dispatch attempt.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Rejection {
    #[error("Confidence {confidence:.2} below threshold {min_confidence:.2}")]
    BelowConfidenceThreshold { confidence: f64, min_confidence: f64 },

    #[error("Missing required fields: {}", fields.join(", "))]
    MissingFields {
        fields: Vec<&'static str>,
        confidence: f64,
    },

    #[error("Duplicate signal: {signal_hash}")]
    DuplicateSignal { signal_hash: String },

    #[error("Invalid risk input for {symbol}: {reason}")]
    InvalidRiskInput {
        symbol: String,
        reason: String,
        pip_distance: Option<f64>,
    },

    #[error("Unknown instrument: {symbol}")]
    UnknownInstrument { symbol: String },

    #[error("Pair {symbol} not allowed for account {account}")]
    PairNotAllowed { account: String, symbol: String },

    #[error("Daily trade limit {limit} reached for account {account}")]
    DailyLimitReached { account: String, limit: u32 },

    #[error("Confirmation not found: {id}")]
    ConfirmationNotFound { id: String },

    #[error("Store error: {0}")]
    Store(String),
}

impl Rejection {
    /// Stable machine-readable code, used by the journal and the HTTP surface.
    pub fn reason_code(&self) -> &'static str {
        match self {
            Rejection::BelowConfidenceThreshold { .. } => "below_confidence_threshold",
            Rejection::MissingFields { .. } => "missing_fields",
            Rejection::DuplicateSignal { .. } => "duplicate_signal",
            Rejection::InvalidRiskInput { .. } => "invalid_risk_input",
            Rejection::UnknownInstrument { .. } => "unknown_instrument",
            Rejection::PairNotAllowed { .. } => "pair_not_allowed",
            Rejection::DailyLimitReached { .. } => "daily_limit_reached",
            Rejection::ConfirmationNotFound { .. } => "confirmation_not_found",
            Rejection::Store(_) => "store_error",
        }
    }

    /// Confidence that drove the decision, when one was computed.
    pub fn confidence(&self) -> Option<f64> {
        match self {
            Rejection::BelowConfidenceThreshold { confidence, .. }
            | Rejection::MissingFields { confidence, .. } => Some(*confidence),
            _ => None,
        }
    }

    pub fn pip_distance(&self) -> Option<f64> {
        match self {
            Rejection::InvalidRiskInput { pip_distance, .. } => *pip_distance,
            _ => None,
        }
    }
}

impl From<StoreError> for Rejection {
    fn from(err: StoreError) -> Self {
        Rejection::Store(err.to_string())
    }
}

/// Persistence errors raised by a `KeyValueStore`.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Invalid store key: {key}")]
    InvalidKey { key: String },

    #[error("Timed out waiting for lock on {key}")]
    LockTimeout { key: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors raised by a trading terminal.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TerminalError {
    #[error("Order rejected: {reason}")]
    OrderRejected { reason: String },

    #[error("Unknown symbol: {symbol}")]
    UnknownSymbol { symbol: String },

    #[error("No quote available for {symbol}")]
    NoQuote { symbol: String },

    #[error("Position not found: {ticket}")]
    PositionNotFound { ticket: u64 },

    #[error("Order not found: {ticket}")]
    OrderNotFound { ticket: u64 },

    #[error("Invalid volume {volume} for {symbol}")]
    InvalidVolume { symbol: String, volume: f64 },

    #[error("Terminal disconnected")]
    Disconnected,
}

/// Manual rule errors.
#[derive(Error, Debug)]
pub enum RuleError {
    #[error("Invalid pattern for rule {id}: {source}")]
    InvalidPattern {
        id: String,
        #[source]
        source: regex::Error,
    },

    #[error("Rule not found: {id}")]
    NotFound { id: String },
}

/// Configuration loading and validation errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

impl From<String> for ConfigError {
    fn from(err: String) -> Self {
        ConfigError::Invalid(err)
    }
}

impl From<&str> for ConfigError {
    fn from(err: &str) -> Self {
        ConfigError::Invalid(err.to_string())
    }
}
