//! Signal Parser: raw alert text to a structured candidate signal plus a
//! confidence score.

pub mod heuristic;
pub mod instruments;
pub mod scorer;

use sha2::{Digest, Sha256};

use crate::events::{ParsedSignal, RawAlert};

pub use heuristic::HeuristicParser;
pub use instruments::{InstrumentSpec, InstrumentTable};
pub use scorer::{ConfidenceScorer, ExtractedFields, WeightedScorer};

/// Stable parsing interface. A learned model can stand in for the heuristic
/// parser without touching the confidence gate downstream.
pub trait SignalParser: Send + Sync {
    fn name(&self) -> &str;

    /// Must not fail: unrecognised input yields a low-confidence signal.
    fn parse(&self, alert: &RawAlert) -> ParsedSignal;
}

/// Lowercase, trim, and collapse whitespace runs.
pub fn normalize(text: &str) -> String {
    text.split_whitespace()
        .map(|w| w.to_lowercase())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Time-independent fingerprint of normalized text + channel.
pub fn signal_hash(text: &str, channel_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalize(text).as_bytes());
    hasher.update([0x1f]);
    hasher.update(channel_id.as_bytes());
    hex::encode(hasher.finalize())
}
