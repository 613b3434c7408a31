//! Application-wide constants and magic numbers
//!
//! Centralizes the tunables the pipeline and the execution engine share.

/// Signal parser constants
pub mod parser {
    /// Confidence weights of the reference heuristic scorer
    pub const WEIGHT_PAIR: f64 = 0.30;
    pub const WEIGHT_ACTION: f64 = 0.30;
    pub const WEIGHT_ENTRY: f64 = 0.20;
    pub const WEIGHT_STOP_LOSS: f64 = 0.10;
    pub const WEIGHT_TAKE_PROFIT: f64 = 0.10;
    pub const BONUS_SEPARATOR: f64 = 0.05;
    pub const BONUS_DECIMAL: f64 = 0.05;

    /// Characters that count as a field separator for the structure bonus
    pub const FIELD_SEPARATORS: &[char] = &[':', ',', '@', '|', ';'];

    /// At most this many TP levels are read per indicator
    pub const MAX_TP_PER_INDICATOR: usize = 3;
}

/// Manual rule engine constants
pub mod rules {
    /// Fixed confidence of a signal produced by a manual rule
    pub const RULE_CONFIDENCE: f64 = 0.95;

    /// Scope value that applies a rule to every channel
    pub const GLOBAL_SCOPE: &str = "*";
}

/// Store key prefixes
pub mod keys {
    pub const DEDUP: &str = "dedup.";
    pub const CHANNEL: &str = "channel.";
    pub const CONFIRMATION: &str = "confirm.";
    pub const DAILY_COUNT: &str = "daily.";
    pub const RULE_USAGE: &str = "rule_usage.";
}

/// File store locking
pub mod store {
    /// Pause between attempts to take a key's lock file (ms)
    pub const LOCK_RETRY_MS: u64 = 2;

    /// Give up waiting for a lock after this long (ms)
    pub const LOCK_TIMEOUT_MS: u64 = 2000;

    /// A lock file older than this is left over from a crashed writer (ms)
    pub const STALE_LOCK_MS: u64 = 10_000;
}

/// Risk dispatcher constants
pub mod dispatch {
    /// Default comment attached to dispatched orders
    pub const DEFAULT_COMMENT: &str = "AI Signal";

    /// Human-like delay window written into the payload (ms)
    pub const DEFAULT_DELAY_MIN_MS: u64 = 500;
    pub const DEFAULT_DELAY_MAX_MS: u64 = 3000;

    /// Lot used when a signal has no stop-loss to size against
    pub const DEFAULT_FALLBACK_LOT: f64 = 0.01;

    /// Float slack when snapping values to a step
    pub const STEP_EPSILON: f64 = 1e-9;

    /// Pip distances are rounded to this precision to drop float noise
    pub const PIP_PRECISION: f64 = 1e-6;

    /// Length of the payload checksum (hex chars)
    pub const CHECKSUM_LEN: usize = 8;
}

/// Stealth execution engine constants
pub mod stealth {
    pub const DEFAULT_POLL_INTERVAL_MS: u64 = 1000;
    pub const DEFAULT_MIN_DELAY_MS: u64 = 500;
    pub const DEFAULT_MAX_DELAY_MS: u64 = 3000;
    pub const DEFAULT_MAX_JITTER_PIPS: f64 = 0.5;
    pub const DEFAULT_BREAKEVEN_TRIGGER_PIPS: f64 = 15.0;
    pub const DEFAULT_OWNERSHIP_TAG: &str = "relay-7701";

    /// Two prices closer than this are considered equal (SL at entry)
    pub const PRICE_EPSILON: f64 = 1e-9;
}

/// Logging event names for structured logging
pub mod events {
    pub const SIGNAL_PARSED: &str = "signal_parsed";
    pub const RULE_MATCHED: &str = "rule_matched";
    pub const DUPLICATE_REJECTED: &str = "duplicate_rejected";
    pub const ORDER_DISPATCHED: &str = "order_dispatched";
    pub const ORDER_REJECTED: &str = "order_rejected";
    pub const SIGNAL_DETECTED: &str = "signal_detected";
    pub const ORDER_PLACED: &str = "order_placed";
    pub const ORDER_FAILED: &str = "order_failed";
    pub const BREAKEVEN_APPLIED: &str = "breakeven_applied";
    pub const PARTIAL_CLOSED: &str = "partial_closed";
    pub const POSITION_CLOSED: &str = "position_closed";
    pub const CHANNEL_CONSUMED: &str = "channel_consumed";
}
