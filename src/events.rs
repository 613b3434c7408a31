use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AlertSource {
    #[default]
    Text,
    Ocr,
}

/// Alert text as handed over by the channel listener.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RawAlert {
    pub text: String,
    #[serde(default)]
    pub source: AlertSource,
    pub channel_id: String,
    #[serde(default)]
    pub external_message_id: String,
    #[serde(default = "Utc::now")]
    pub received_at: DateTime<Utc>,
}

impl RawAlert {
    pub fn text(text: impl Into<String>, channel_id: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            source: AlertSource::Text,
            channel_id: channel_id.into(),
            external_message_id: String::new(),
            received_at: Utc::now(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TradeAction {
    Buy,
    Sell,
    BuyStop,
    SellStop,
    #[default]
    None,
}

impl TradeAction {
    pub fn is_buy(&self) -> bool {
        matches!(self, TradeAction::Buy | TradeAction::BuyStop)
    }

    pub fn is_sell(&self) -> bool {
        matches!(self, TradeAction::Sell | TradeAction::SellStop)
    }

    pub fn is_present(&self) -> bool {
        !matches!(self, TradeAction::None)
    }

    /// +1 for buy-side actions, -1 for sell-side, 0 otherwise.
    pub fn direction(&self) -> f64 {
        if self.is_buy() {
            1.0
        } else if self.is_sell() {
            -1.0
        } else {
            0.0
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TradeAction::Buy => "buy",
            TradeAction::Sell => "sell",
            TradeAction::BuyStop => "buystop",
            TradeAction::SellStop => "sellstop",
            TradeAction::None => "none",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SignalIntent {
    #[default]
    OpenTrade,
    ModifySl,
    ClosePartial,
    Cancel,
}

impl SignalIntent {
    pub fn is_management(&self) -> bool {
        !matches!(self, SignalIntent::OpenTrade)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum OrderType {
    #[default]
    Market,
    Pending,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Modifications {
    pub move_sl_to_breakeven: bool,
    pub sl_increase_pips: Option<f64>,
    pub partial_close_percent: Option<f64>,
    pub volume_percent: Option<f64>,
}

/// Structured reading of one alert. Never mutated after creation.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ParsedSignal {
    pub signal_id: String,
    pub pair: Option<String>,
    pub action: TradeAction,
    pub entry: Option<f64>,
    pub stop_loss: Option<f64>,
    pub take_profits: Vec<f64>,
    pub intent: SignalIntent,
    pub order_type: OrderType,
    pub modifications: Modifications,
    pub confidence: f64,
    pub source: AlertSource,
    pub signal_hash: String,
    pub channel_id: String,
    pub raw_text: String,
    /// Id of the manual rule that produced this signal, if any.
    pub matched_rule: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ExecutionMode {
    Shadow,
    SemiAuto,
    #[default]
    Auto,
}

/// Per-account risk budget, injected by the caller on every dispatch.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RiskProfile {
    pub account_balance: f64,
    pub risk_percent: f64,
    pub max_lot: f64,
    #[serde(default = "default_min_lot")]
    pub min_lot: f64,
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f64,
    #[serde(default)]
    pub execution_mode: ExecutionMode,
    /// Empty means every instrument is allowed.
    #[serde(default)]
    pub allowed_pairs: Vec<String>,
    #[serde(default)]
    pub max_daily_trades: Option<u32>,
    #[serde(default)]
    pub sl_adjustment_pips: f64,
    #[serde(default)]
    pub tp_adjustment_pips: f64,
    #[serde(default = "default_true")]
    pub auto_breakeven: bool,
}

fn default_min_lot() -> f64 {
    0.01
}

fn default_min_confidence() -> f64 {
    0.85
}

fn default_true() -> bool {
    true
}

impl RiskProfile {
    pub fn new(account_balance: f64, risk_percent: f64, max_lot: f64) -> Self {
        Self {
            account_balance,
            risk_percent,
            max_lot,
            min_lot: default_min_lot(),
            min_confidence: default_min_confidence(),
            execution_mode: ExecutionMode::Auto,
            allowed_pairs: Vec::new(),
            max_daily_trades: None,
            sl_adjustment_pips: 0.0,
            tp_adjustment_pips: 0.0,
            auto_breakeven: true,
        }
    }
}

/// Sized instruction written to an account's execution channel.
///
/// Field names on the wire follow the channel payload contract
/// (`sl`, `tp`, `lot`, `partial_close`, `move_sl_to_be`).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DispatchedOrder {
    #[serde(default)]
    pub signal_id: String,
    pub symbol: String,
    pub action: TradeAction,
    #[serde(default)]
    pub intent: SignalIntent,
    pub entry: Option<f64>,
    #[serde(rename = "sl")]
    pub stop_loss: Option<f64>,
    #[serde(rename = "tp", default)]
    pub take_profits: Vec<f64>,
    #[serde(rename = "lot")]
    pub lot_size: f64,
    #[serde(default)]
    pub order_type: OrderType,
    #[serde(default)]
    pub delay_ms: u64,
    #[serde(rename = "partial_close", default)]
    pub partial_close_percent: f64,
    #[serde(rename = "move_sl_to_be", default)]
    pub move_sl_to_breakeven: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sl_increase_pips: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub risk_amount: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pip_distance: Option<f64>,
    #[serde(default)]
    pub comment: String,
    #[serde(default)]
    pub consumed: bool,
    #[serde(default)]
    pub checksum: String,
}

/// How a sized order was delivered.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "delivery", rename_all = "snake_case")]
pub enum Delivery {
    /// Written to the execution channel.
    Channel,
    /// Shadow mode: journaled only.
    Shadow,
    /// Semi-auto mode: parked until confirmed.
    AwaitingConfirmation { confirmation_id: String },
}

#[derive(Clone, Debug, Serialize)]
pub struct DispatchOutcome {
    pub account: String,
    /// Source channel of the signal behind the order.
    pub channel_id: String,
    pub order: DispatchedOrder,
    #[serde(flatten)]
    pub delivery: Delivery,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Placed,
    Failed,
    Modified,
    PartiallyClosed,
    Cancelled,
    Closed,
    Skipped,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExecutionReport {
    pub account: String,
    pub symbol: String,
    pub ticket: Option<u64>,
    pub status: ExecutionStatus,
    pub price: Option<f64>,
    pub volume: Option<f64>,
    pub detail: Option<String>,
}

// Global Event Enum
#[derive(Clone, Debug)]
pub enum Event {
    Parsed(ParsedSignal),
    Rejected {
        channel_id: String,
        account: Option<String>,
        rejection: crate::error::Rejection,
    },
    Dispatched(DispatchOutcome),
    Execution(ExecutionReport),
}
