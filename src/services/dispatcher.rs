//! Risk-Based Dispatcher: gates an accepted signal against an account's risk
//! profile, sizes it, and delivers it according to the execution mode.

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::DispatcherConfig;
use crate::constants::keys;
use crate::data::channel::ExecutionChannel;
use crate::data::store::KeyValueStore;
use crate::error::Rejection;
use crate::events::{
    Delivery, DispatchOutcome, DispatchedOrder, ExecutionMode, ParsedSignal, RiskProfile,
    SignalIntent,
};
use crate::parser::{InstrumentSpec, InstrumentTable};
use crate::services::sizing::{self, clamp_lot, compute_lot_size, round_down_to_step, round_price};

/// Sized order parked in semi-auto mode until an operator confirms it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PendingConfirmation {
    pub confirmation_id: String,
    pub account: String,
    pub channel_id: String,
    pub order: DispatchedOrder,
    pub created_at: DateTime<Utc>,
}

pub struct RiskDispatcher {
    store: Arc<dyn KeyValueStore>,
    channel: ExecutionChannel,
    instruments: Arc<InstrumentTable>,
    config: DispatcherConfig,
}

impl RiskDispatcher {
    pub fn new(store: Arc<dyn KeyValueStore>, instruments: Arc<InstrumentTable>, config: DispatcherConfig) -> Self {
        Self {
            channel: ExecutionChannel::new(store.clone()),
            store,
            instruments,
            config,
        }
    }

    pub fn channel(&self) -> &ExecutionChannel {
        &self.channel
    }

    /// Gate and size `signal` for `account`, then deliver it per the
    /// profile's execution mode.
    pub fn dispatch(&self, account: &str, signal: &ParsedSignal, profile: &RiskProfile) -> Result<DispatchOutcome, Rejection> {
        let order = self.size_order(account, signal, profile)?;
        let opens_trade = order.intent == SignalIntent::OpenTrade;

        match profile.execution_mode {
            ExecutionMode::Shadow => {
                if opens_trade {
                    self.bump_daily_count(account)?;
                }
                info!(
                    "👻 [DISPATCH] Shadow {} {} {} lot {:.2} (not sent)",
                    account,
                    order.action.as_str(),
                    order.symbol,
                    order.lot_size
                );
                Ok(DispatchOutcome {
                    account: account.to_string(),
                    channel_id: signal.channel_id.clone(),
                    order,
                    delivery: Delivery::Shadow,
                })
            }
            ExecutionMode::SemiAuto => {
                let confirmation_id = uuid::Uuid::new_v4().to_string();
                let pending = PendingConfirmation {
                    confirmation_id: confirmation_id.clone(),
                    account: account.to_string(),
                    channel_id: signal.channel_id.clone(),
                    order: order.clone(),
                    created_at: Utc::now(),
                };
                let payload = serde_json::to_string(&pending).map_err(|e| Rejection::Store(e.to_string()))?;
                self.store.set(&confirmation_key(&confirmation_id), &payload)?;
                info!(
                    "⏸️ [DISPATCH] {} {} {} parked for confirmation {}",
                    account,
                    order.action.as_str(),
                    order.symbol,
                    confirmation_id
                );
                Ok(DispatchOutcome {
                    account: account.to_string(),
                    channel_id: signal.channel_id.clone(),
                    order,
                    delivery: Delivery::AwaitingConfirmation { confirmation_id },
                })
            }
            ExecutionMode::Auto => {
                if opens_trade {
                    self.bump_daily_count(account)?;
                }
                let sealed = self.channel.publish(account, &order)?;
                info!(
                    "📤 [DISPATCH] {} <- {} {} lot {:.2} (entry {:?}, sl {:?}, tp {:?})",
                    account,
                    sealed.action.as_str(),
                    sealed.symbol,
                    sealed.lot_size,
                    sealed.entry,
                    sealed.stop_loss,
                    sealed.take_profits
                );
                Ok(DispatchOutcome {
                    account: account.to_string(),
                    channel_id: signal.channel_id.clone(),
                    order: sealed,
                    delivery: Delivery::Channel,
                })
            }
        }
    }

    /// Release a semi-auto order to its account's channel. The daily limit
    /// is checked again at release time.
    pub fn confirm(&self, confirmation_id: &str, profile: Option<&RiskProfile>) -> Result<DispatchOutcome, Rejection> {
        let pending = self
            .pending_confirmation(confirmation_id)?
            .ok_or_else(|| Rejection::ConfirmationNotFound {
                id: confirmation_id.to_string(),
            })?;

        if pending.order.intent == SignalIntent::OpenTrade {
            if let Some(profile) = profile {
                self.check_daily_limit(&pending.account, profile)?;
            }
            self.bump_daily_count(&pending.account)?;
        }

        let sealed = self.channel.publish(&pending.account, &pending.order)?;
        self.store.remove(&confirmation_key(confirmation_id))?;
        info!(
            "✅ [DISPATCH] Confirmation {} released {} {} to {}",
            confirmation_id,
            sealed.action.as_str(),
            sealed.symbol,
            pending.account
        );
        Ok(DispatchOutcome {
            account: pending.account,
            channel_id: pending.channel_id,
            order: sealed,
            delivery: Delivery::Channel,
        })
    }

    pub fn pending_confirmation(&self, confirmation_id: &str) -> Result<Option<PendingConfirmation>, Rejection> {
        let key = confirmation_key(confirmation_id);
        if store_key_invalid(&key) {
            return Ok(None);
        }
        match self.store.get(&key)? {
            Some(raw) => serde_json::from_str(&raw)
                .map(Some)
                .map_err(|e| Rejection::Store(e.to_string())),
            None => Ok(None),
        }
    }

    pub fn pending_confirmations(&self) -> Result<Vec<PendingConfirmation>, Rejection> {
        let mut pending = Vec::new();
        for key in self.store.list(keys::CONFIRMATION)? {
            if let Some(raw) = self.store.get(&key)? {
                match serde_json::from_str::<PendingConfirmation>(&raw) {
                    Ok(p) => pending.push(p),
                    Err(e) => warn!("[DISPATCH] Unreadable confirmation {}: {}", key, e),
                }
            }
        }
        Ok(pending)
    }

    /// Confidence gate, required fields, instrument and account policy
    /// checks, then sizing. Reads the daily count but writes nothing.
    pub fn size_order(&self, account: &str, signal: &ParsedSignal, profile: &RiskProfile) -> Result<DispatchedOrder, Rejection> {
        if signal.confidence < profile.min_confidence {
            debug!(
                "[DISPATCH] {} below threshold ({:.2} < {:.2})",
                signal.signal_id, signal.confidence, profile.min_confidence
            );
            return Err(Rejection::BelowConfidenceThreshold {
                confidence: signal.confidence,
                min_confidence: profile.min_confidence,
            });
        }

        let missing = missing_fields(signal);
        if !missing.is_empty() {
            return Err(Rejection::MissingFields {
                fields: missing,
                confidence: signal.confidence,
            });
        }

        // Pair is present past the field check.
        let pair = signal.pair.clone().unwrap_or_default();
        let spec = self
            .instruments
            .get(&pair)
            .cloned()
            .ok_or_else(|| Rejection::UnknownInstrument { symbol: pair.clone() })?;

        if !profile.allowed_pairs.is_empty()
            && !profile
                .allowed_pairs
                .iter()
                .any(|p| p.eq_ignore_ascii_case(&spec.symbol))
        {
            return Err(Rejection::PairNotAllowed {
                account: account.to_string(),
                symbol: spec.symbol,
            });
        }

        if signal.intent.is_management() {
            return Ok(self.management_order(signal, &spec));
        }

        self.check_daily_limit(account, profile)?;
        self.open_order(signal, profile, &spec)
    }

    fn management_order(&self, signal: &ParsedSignal, spec: &InstrumentSpec) -> DispatchedOrder {
        let mods = &signal.modifications;
        DispatchedOrder {
            signal_id: signal.signal_id.clone(),
            symbol: spec.symbol.clone(),
            action: signal.action,
            intent: signal.intent,
            entry: signal.entry,
            stop_loss: signal.stop_loss,
            take_profits: signal.take_profits.clone(),
            lot_size: 0.0,
            order_type: signal.order_type,
            delay_ms: 0,
            partial_close_percent: mods.partial_close_percent.unwrap_or(0.0),
            move_sl_to_breakeven: mods.move_sl_to_breakeven,
            sl_increase_pips: mods.sl_increase_pips,
            risk_amount: None,
            pip_distance: None,
            comment: self.config.comment.clone(),
            consumed: false,
            checksum: String::new(),
        }
    }

    fn open_order(&self, signal: &ParsedSignal, profile: &RiskProfile, spec: &InstrumentSpec) -> Result<DispatchedOrder, Rejection> {
        let entry = signal.entry.unwrap_or_default();
        let direction = signal.action.direction();

        // Widen the stop and push the targets out before sizing.
        let stop_loss = signal.stop_loss.map(|sl| {
            round_price(sl - direction * profile.sl_adjustment_pips * spec.pip_size, spec.digits)
        });
        let take_profits: Vec<f64> = signal
            .take_profits
            .iter()
            .map(|tp| round_price(tp + direction * profile.tp_adjustment_pips * spec.pip_size, spec.digits))
            .collect();

        let (lot_size, risk_amount, pip_distance) = match stop_loss {
            Some(sl) => {
                let distance = sizing::pip_distance(entry, sl, spec.pip_size);
                if distance <= 0.0 {
                    warn!("[DISPATCH] {} stop-loss equals entry {}", spec.symbol, entry);
                    return Err(Rejection::InvalidRiskInput {
                        symbol: spec.symbol.clone(),
                        reason: "zero pip distance between entry and stop-loss".to_string(),
                        pip_distance: Some(distance),
                    });
                }
                let sized = compute_lot_size(
                    profile.account_balance,
                    profile.risk_percent,
                    distance,
                    spec.pip_value_per_lot,
                    profile.min_lot,
                    profile.max_lot,
                    spec.volume_step,
                )
                .ok_or_else(|| Rejection::InvalidRiskInput {
                    symbol: spec.symbol.clone(),
                    reason: "balance or pip value cannot size a position".to_string(),
                    pip_distance: Some(distance),
                })?;
                (sized.lot, Some(sized.risk_amount), Some(distance))
            }
            None if self.config.require_stop_loss => {
                return Err(Rejection::InvalidRiskInput {
                    symbol: spec.symbol.clone(),
                    reason: "missing stop-loss".to_string(),
                    pip_distance: None,
                });
            }
            None => {
                debug!("[DISPATCH] {} has no stop-loss, using fallback lot", spec.symbol);
                let lot = round_down_to_step(self.config.fallback_lot.min(profile.max_lot), spec.volume_step);
                (clamp_lot(lot, profile.min_lot, profile.max_lot), None, None)
            }
        };

        let lot_size = match signal.modifications.volume_percent {
            Some(pct) if pct > 0.0 && pct < 100.0 => {
                let scaled = round_down_to_step(lot_size * pct / 100.0, spec.volume_step);
                clamp_lot(scaled, profile.min_lot, profile.max_lot)
            }
            _ => lot_size,
        };

        let mods = &signal.modifications;
        Ok(DispatchedOrder {
            signal_id: signal.signal_id.clone(),
            symbol: spec.symbol.clone(),
            action: signal.action,
            intent: SignalIntent::OpenTrade,
            entry: Some(entry),
            stop_loss,
            take_profits,
            lot_size,
            order_type: signal.order_type,
            delay_ms: self.human_delay(),
            partial_close_percent: mods.partial_close_percent.unwrap_or(0.0),
            move_sl_to_breakeven: mods.move_sl_to_breakeven || profile.auto_breakeven,
            sl_increase_pips: mods.sl_increase_pips,
            risk_amount,
            pip_distance,
            comment: self.config.comment.clone(),
            consumed: false,
            checksum: String::new(),
        })
    }

    fn human_delay(&self) -> u64 {
        let (min, max) = (self.config.delay_min_ms, self.config.delay_max_ms);
        if min >= max {
            return min;
        }
        rand::thread_rng().gen_range(min..=max)
    }

    fn daily_key(account: &str) -> String {
        format!("{}{}.{}", keys::DAILY_COUNT, account, Utc::now().format("%Y%m%d"))
    }

    /// Orders already sent today for `account`.
    pub fn daily_count(&self, account: &str) -> Result<u32, Rejection> {
        let count = self
            .store
            .get(&Self::daily_key(account))?
            .and_then(|raw| raw.trim().parse().ok())
            .unwrap_or(0);
        Ok(count)
    }

    fn check_daily_limit(&self, account: &str, profile: &RiskProfile) -> Result<(), Rejection> {
        if let Some(limit) = profile.max_daily_trades {
            if self.daily_count(account)? >= limit {
                warn!("🛑 [DISPATCH] {} reached daily limit {}", account, limit);
                return Err(Rejection::DailyLimitReached {
                    account: account.to_string(),
                    limit,
                });
            }
        }
        Ok(())
    }

    fn bump_daily_count(&self, account: &str) -> Result<(), Rejection> {
        let count = self.daily_count(account)? + 1;
        self.store.set(&Self::daily_key(account), &count.to_string())?;
        Ok(())
    }
}

fn confirmation_key(confirmation_id: &str) -> String {
    format!("{}{}", keys::CONFIRMATION, confirmation_id)
}

fn store_key_invalid(key: &str) -> bool {
    crate::data::store::validate_key(key).is_err()
}

/// Fields an order needs before it can be sized. Management intents only
/// need to know which instrument they apply to.
pub fn missing_fields(signal: &ParsedSignal) -> Vec<&'static str> {
    let mut missing = Vec::new();
    if signal.pair.is_none() {
        missing.push("pair");
    }
    if signal.intent.is_management() {
        return missing;
    }
    if !signal.action.is_present() {
        missing.push("action");
    }
    if signal.entry.is_none() {
        missing.push("entry");
    }
    missing
}
