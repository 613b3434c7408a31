use chrono::NaiveTime;
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;

use crate::constants::{dispatch, stealth};
use crate::error::ConfigError;
use crate::events::RiskProfile;
use crate::services::rules::ManualRule;

#[derive(Clone, Debug, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self { bind: default_bind() }
    }
}

fn default_bind() -> String {
    "0.0.0.0:3000".to_string()
}

/// Weights of the heuristic confidence scorer.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct ScorerWeights {
    pub pair: f64,
    pub action: f64,
    pub entry: f64,
    pub stop_loss: f64,
    pub take_profit: f64,
    pub separator_bonus: f64,
    pub decimal_bonus: f64,
}

impl Default for ScorerWeights {
    fn default() -> Self {
        use crate::constants::parser::*;
        Self {
            pair: WEIGHT_PAIR,
            action: WEIGHT_ACTION,
            entry: WEIGHT_ENTRY,
            stop_loss: WEIGHT_STOP_LOSS,
            take_profit: WEIGHT_TAKE_PROFIT,
            separator_bonus: BONUS_SEPARATOR,
            decimal_bonus: BONUS_DECIMAL,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct ParserConfig {
    /// A manual rule result is used only when it meets this confidence.
    #[serde(default = "default_rule_gate")]
    pub rule_gate_confidence: f64,
    #[serde(default)]
    pub weights: ScorerWeights,
}

impl Default for ParserConfig {
    fn default() -> Self {
        Self {
            rule_gate_confidence: default_rule_gate(),
            weights: ScorerWeights::default(),
        }
    }
}

fn default_rule_gate() -> f64 {
    0.85
}

#[derive(Clone, Debug, Deserialize)]
pub struct DedupConfig {
    #[serde(default = "default_window_hours")]
    pub window_hours: u64,
    /// Cron schedule of the eviction sweep (6 fields, seconds first).
    #[serde(default = "default_sweep_cron")]
    pub sweep_cron: String,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            window_hours: default_window_hours(),
            sweep_cron: default_sweep_cron(),
        }
    }
}

fn default_window_hours() -> u64 {
    24
}

fn default_sweep_cron() -> String {
    "0 */10 * * * *".to_string()
}

#[derive(Clone, Debug, Deserialize)]
pub struct DispatcherConfig {
    #[serde(default = "default_fallback_lot")]
    pub fallback_lot: f64,
    #[serde(default = "default_delay_min")]
    pub delay_min_ms: u64,
    #[serde(default = "default_delay_max")]
    pub delay_max_ms: u64,
    #[serde(default = "default_comment")]
    pub comment: String,
    /// Reject signals without a stop-loss instead of using `fallback_lot`.
    #[serde(default)]
    pub require_stop_loss: bool,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            fallback_lot: default_fallback_lot(),
            delay_min_ms: default_delay_min(),
            delay_max_ms: default_delay_max(),
            comment: default_comment(),
            require_stop_loss: false,
        }
    }
}

fn default_fallback_lot() -> f64 {
    dispatch::DEFAULT_FALLBACK_LOT
}
fn default_delay_min() -> u64 {
    dispatch::DEFAULT_DELAY_MIN_MS
}
fn default_delay_max() -> u64 {
    dispatch::DEFAULT_DELAY_MAX_MS
}
fn default_comment() -> String {
    dispatch::DEFAULT_COMMENT.to_string()
}

#[derive(Clone, Debug, Deserialize)]
pub struct AccountConfig {
    /// Source channels this account follows. Empty follows every channel.
    #[serde(default)]
    pub channels: Vec<String>,
    pub risk: RiskProfile,
}

impl AccountConfig {
    pub fn follows(&self, channel_id: &str) -> bool {
        self.channels.is_empty() || self.channels.iter().any(|c| c == channel_id)
    }
}

/// Daily window in UTC, "HH:MM" bounds. A window with start > end wraps
/// midnight.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct TradingHours {
    pub start: String,
    pub end: String,
}

impl TradingHours {
    pub fn bounds(&self) -> Result<(NaiveTime, NaiveTime), ConfigError> {
        let parse = |s: &str| {
            NaiveTime::parse_from_str(s, "%H:%M")
                .map_err(|e| ConfigError::Invalid(format!("trading hours '{}': {}", s, e)))
        };
        Ok((parse(&self.start)?, parse(&self.end)?))
    }

    pub fn contains(&self, time: NaiveTime) -> bool {
        match self.bounds() {
            Ok((start, end)) if start <= end => time >= start && time < end,
            Ok((start, end)) => time >= start || time < end,
            Err(_) => true,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct StealthConfig {
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_min_delay")]
    pub min_delay_ms: u64,
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,
    #[serde(default = "default_jitter")]
    pub max_jitter_pips: f64,
    #[serde(default = "default_breakeven_trigger")]
    pub breakeven_trigger_pips: f64,
    #[serde(default = "default_ownership_tag")]
    pub ownership_tag: String,
    #[serde(default = "default_true")]
    pub split_take_profits: bool,
    #[serde(default)]
    pub trading_hours: Option<TradingHours>,
}

impl Default for StealthConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval(),
            min_delay_ms: default_min_delay(),
            max_delay_ms: default_max_delay(),
            max_jitter_pips: default_jitter(),
            breakeven_trigger_pips: default_breakeven_trigger(),
            ownership_tag: default_ownership_tag(),
            split_take_profits: true,
            trading_hours: None,
        }
    }
}

fn default_poll_interval() -> u64 {
    stealth::DEFAULT_POLL_INTERVAL_MS
}
fn default_min_delay() -> u64 {
    stealth::DEFAULT_MIN_DELAY_MS
}
fn default_max_delay() -> u64 {
    stealth::DEFAULT_MAX_DELAY_MS
}
fn default_jitter() -> f64 {
    stealth::DEFAULT_MAX_JITTER_PIPS
}
fn default_breakeven_trigger() -> f64 {
    stealth::DEFAULT_BREAKEVEN_TRIGGER_PIPS
}
fn default_ownership_tag() -> String {
    stealth::DEFAULT_OWNERSHIP_TAG.to_string()
}
fn default_true() -> bool {
    true
}

/// Per-symbol override of the built-in instrument table.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct InstrumentOverride {
    pub pip_size: Option<f64>,
    pub pip_value_per_lot: Option<f64>,
    pub volume_min: Option<f64>,
    pub volume_step: Option<f64>,
    pub volume_max: Option<f64>,
    pub digits: Option<u32>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub parser: ParserConfig,
    #[serde(default)]
    pub dedup: DedupConfig,
    #[serde(default)]
    pub dispatcher: DispatcherConfig,
    #[serde(default)]
    pub accounts: HashMap<String, AccountConfig>,
    #[serde(default)]
    pub stealth: StealthConfig,
    #[serde(default)]
    pub rules: Vec<ManualRule>,
    #[serde(default)]
    pub instruments: HashMap<String, InstrumentOverride>,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

impl AppConfig {
    /// Load `config.yaml` (or `$RELAY_CONFIG`) and apply environment overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let path = std::env::var("RELAY_CONFIG").unwrap_or_else(|_| "config.yaml".to_string());
        let mut config = Self::load_from(&path)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn load_from(path: &str) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_string(),
            source,
        })?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        // Strip BOM if present
        let content = content.strip_prefix('\u{feff}').unwrap_or(content);
        Ok(serde_yaml::from_str(content)?)
    }

    pub fn apply_env_overrides(&mut self) {
        if let Ok(dir) = std::env::var("RELAY_DATA_DIR") {
            self.data_dir = PathBuf::from(dir);
        }
        if let Ok(bind) = std::env::var("RELAY_API_BIND") {
            self.api.bind = bind;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let gate = self.parser.rule_gate_confidence;
        if !(0.0..=1.0).contains(&gate) {
            return Err(format!("parser.rule_gate_confidence {} outside [0,1]", gate).into());
        }
        if self.dispatcher.delay_min_ms > self.dispatcher.delay_max_ms {
            return Err("dispatcher.delay_min_ms exceeds delay_max_ms".into());
        }
        if self.stealth.min_delay_ms > self.stealth.max_delay_ms {
            return Err("stealth.min_delay_ms exceeds max_delay_ms".into());
        }
        if self.stealth.poll_interval_ms == 0 {
            return Err("stealth.poll_interval_ms must be positive".into());
        }
        if let Some(hours) = &self.stealth.trading_hours {
            hours.bounds()?;
        }
        for (name, account) in &self.accounts {
            let risk = &account.risk;
            if risk.min_lot <= 0.0 || risk.min_lot > risk.max_lot {
                return Err(format!(
                    "account {}: lot bounds [{}, {}] invalid",
                    name, risk.min_lot, risk.max_lot
                )
                .into());
            }
            if !(0.0..=1.0).contains(&risk.min_confidence) {
                return Err(format!("account {}: min_confidence outside [0,1]", name).into());
            }
            if risk.risk_percent <= 0.0 || risk.risk_percent > 100.0 {
                return Err(format!("account {}: risk_percent outside (0,100]", name).into());
            }
        }
        Ok(())
    }
}
