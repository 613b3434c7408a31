//! Single-slot execution channel, one mailbox per target account.
//!
//! The dispatcher overwrites the slot (last write wins); the execution engine
//! replaces it with an empty placeholder once it has acted on the order.

use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::constants::{dispatch::CHECKSUM_LEN, keys};
use crate::data::store::KeyValueStore;
use crate::error::StoreError;
use crate::events::DispatchedOrder;

pub const EMPTY_PLACEHOLDER: &str = "{}";

/// What the engine observes when it looks at its mailbox.
#[derive(Clone, Debug, PartialEq)]
pub enum ChannelRead {
    Empty,
    Malformed { hash: String, reason: String },
    Order { order: DispatchedOrder, hash: String },
}

impl ChannelRead {
    pub fn hash(&self) -> Option<&str> {
        match self {
            ChannelRead::Empty => None,
            ChannelRead::Malformed { hash, .. } | ChannelRead::Order { hash, .. } => Some(hash),
        }
    }
}

#[derive(Clone)]
pub struct ExecutionChannel {
    store: Arc<dyn KeyValueStore>,
}

impl ExecutionChannel {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    fn key(account: &str) -> String {
        format!("{}{}", keys::CHANNEL, account)
    }

    /// Overwrite the account's slot with `order`, sealed with its checksum.
    /// Returns the sealed order as written.
    pub fn publish(&self, account: &str, order: &DispatchedOrder) -> Result<DispatchedOrder, StoreError> {
        let sealed = seal(order.clone());
        let payload = serde_json::to_string_pretty(&sealed)?;
        self.store.set(&Self::key(account), &payload)?;
        debug!("[CHANNEL] {} <- {} {} ({})", account, sealed.action.as_str(), sealed.symbol, sealed.checksum);
        Ok(sealed)
    }

    pub fn raw(&self, account: &str) -> Result<Option<String>, StoreError> {
        self.store.get(&Self::key(account))
    }

    pub fn read(&self, account: &str) -> Result<ChannelRead, StoreError> {
        let raw = match self.raw(account)? {
            Some(raw) => raw,
            None => return Ok(ChannelRead::Empty),
        };
        Ok(interpret(&raw))
    }

    /// Replace the slot with the empty placeholder, but only if it still holds
    /// the content identified by `expected_hash`. A newer order written in the
    /// meantime is left for the next poll.
    pub fn mark_consumed(&self, account: &str, expected_hash: &str) -> Result<bool, StoreError> {
        let key = Self::key(account);
        match self.store.get(&key)? {
            Some(raw) if content_hash(&raw) == expected_hash => {
                if self.store.compare_and_swap(&key, &raw, Some(EMPTY_PLACEHOLDER))? {
                    return Ok(true);
                }
                warn!("[CHANNEL] {} republished during consume; leaving newer content", account);
                Ok(false)
            }
            Some(_) => {
                warn!("[CHANNEL] {} changed before consume; leaving newer content", account);
                Ok(false)
            }
            None => Ok(false),
        }
    }
}

fn interpret(raw: &str) -> ChannelRead {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return ChannelRead::Empty;
    }
    let hash = content_hash(raw);

    let value: serde_json::Value = match serde_json::from_str(trimmed) {
        Ok(v) => v,
        Err(e) => {
            return ChannelRead::Malformed {
                hash,
                reason: format!("invalid json: {}", e),
            }
        }
    };
    if value.as_object().map(|o| o.is_empty()).unwrap_or(false) {
        return ChannelRead::Empty;
    }

    let order: DispatchedOrder = match serde_json::from_value(value) {
        Ok(o) => o,
        Err(e) => {
            return ChannelRead::Malformed {
                hash,
                reason: format!("invalid payload: {}", e),
            }
        }
    };
    if order.consumed {
        return ChannelRead::Empty;
    }
    if !order.checksum.is_empty() && order.checksum != checksum(&order) {
        return ChannelRead::Malformed {
            hash,
            reason: "checksum mismatch".to_string(),
        };
    }
    if order.symbol.trim().is_empty() {
        return ChannelRead::Malformed {
            hash,
            reason: "empty symbol".to_string(),
        };
    }
    ChannelRead::Order { order, hash }
}

/// SHA-256 of the raw slot content, used to detect new content.
pub fn content_hash(raw: &str) -> String {
    hex::encode(Sha256::digest(raw.as_bytes()))
}

/// Checksum over the order's canonical fields. Prices are rendered at fixed
/// precision so a JSON round-trip never changes the result.
pub fn checksum(order: &DispatchedOrder) -> String {
    let opt = |v: Option<f64>| v.map(|x| format!("{:.8}", x)).unwrap_or_default();
    let tps: Vec<String> = order.take_profits.iter().map(|t| format!("{:.8}", t)).collect();
    let canonical = format!(
        "{}|{}|{}|{:?}|{}|{}|{}|{:.8}|{:?}|{}|{:.4}|{}|{}|{}",
        order.signal_id,
        order.symbol,
        order.action.as_str(),
        order.intent,
        opt(order.entry),
        opt(order.stop_loss),
        tps.join(","),
        order.lot_size,
        order.order_type,
        order.delay_ms,
        order.partial_close_percent,
        order.move_sl_to_breakeven,
        opt(order.sl_increase_pips),
        order.comment,
    );
    let digest = hex::encode(Sha256::digest(canonical.as_bytes()));
    digest[..CHECKSUM_LEN].to_string()
}

pub fn seal(mut order: DispatchedOrder) -> DispatchedOrder {
    order.consumed = false;
    order.checksum = checksum(&order);
    order
}
