//! Manual Rule Engine: per-channel regular-expression overrides that preempt
//! the statistical parser.

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{info, warn};

use crate::constants::keys;
use crate::constants::rules::{GLOBAL_SCOPE, RULE_CONFIDENCE};
use crate::data::store::KeyValueStore;
use crate::error::{RuleError, StoreError};
use crate::events::{AlertSource, ParsedSignal, RawAlert, SignalIntent, TradeAction};
use crate::parser::heuristic::{classify_intent, determine_order_type, extract_modifications};
use crate::parser::{signal_hash, InstrumentTable};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ManualRule {
    #[serde(default = "new_rule_id")]
    pub id: String,
    pub pattern: String,
    /// Channel id the rule applies to, or `*` for every channel.
    #[serde(default = "global_scope")]
    pub channel_scope: String,
    #[serde(default)]
    pub default_pair: Option<String>,
    #[serde(default)]
    pub default_action: TradeAction,
    #[serde(default)]
    pub default_entry: Option<f64>,
    #[serde(default)]
    pub default_sl: Option<f64>,
    #[serde(default)]
    pub default_tp: Vec<f64>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "default_active")]
    pub is_active: bool,
    #[serde(default)]
    pub usage_count: u64,
}

fn new_rule_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn global_scope() -> String {
    GLOBAL_SCOPE.to_string()
}

fn default_active() -> bool {
    true
}

impl ManualRule {
    pub fn new(pattern: impl Into<String>, channel_scope: impl Into<String>) -> Self {
        Self {
            id: new_rule_id(),
            pattern: pattern.into(),
            channel_scope: channel_scope.into(),
            default_pair: None,
            default_action: TradeAction::None,
            default_entry: None,
            default_sl: None,
            default_tp: Vec::new(),
            priority: 0,
            is_active: true,
            usage_count: 0,
        }
    }

    pub fn applies_to(&self, channel_id: &str) -> bool {
        self.channel_scope == GLOBAL_SCOPE || self.channel_scope == channel_id
    }
}

struct CompiledRule {
    rule: ManualRule,
    regex: Regex,
    usage: AtomicU64,
}

impl CompiledRule {
    fn compile(rule: ManualRule) -> Result<Self, RuleError> {
        let regex = RegexBuilder::new(&rule.pattern)
            .case_insensitive(true)
            .build()
            .map_err(|source| RuleError::InvalidPattern {
                id: rule.id.clone(),
                source,
            })?;
        let usage = AtomicU64::new(rule.usage_count);
        Ok(Self { rule, regex, usage })
    }

    fn snapshot(&self) -> ManualRule {
        let mut rule = self.rule.clone();
        rule.usage_count = self.usage.load(Ordering::SeqCst);
        rule
    }
}

pub struct RuleEngine {
    // Kept sorted by descending priority; ties keep insertion order.
    rules: RwLock<Vec<Arc<CompiledRule>>>,
    instruments: Arc<InstrumentTable>,
    usage_store: Option<Arc<dyn KeyValueStore>>,
}

impl RuleEngine {
    pub fn new(instruments: Arc<InstrumentTable>) -> Self {
        Self {
            rules: RwLock::new(Vec::new()),
            instruments,
            usage_store: None,
        }
    }

    /// Keep usage counts in `store`, shared by every engine pointing at it and
    /// surviving restarts. Counts already stored are picked up.
    pub fn with_usage_store(mut self, store: Arc<dyn KeyValueStore>) -> Self {
        self.usage_store = Some(store);
        let rules = self.rules.read().unwrap_or_else(PoisonError::into_inner).clone();
        for compiled in rules {
            self.load_usage(&compiled);
        }
        self
    }

    fn usage_key(id: &str) -> String {
        format!("{}{}", keys::RULE_USAGE, id)
    }

    fn stored_usage(&self, id: &str) -> Option<u64> {
        let store = self.usage_store.as_ref()?;
        match store.get(&Self::usage_key(id)) {
            Ok(value) => value.and_then(|v| v.trim().parse().ok()),
            Err(e) => {
                warn!("[RULES] Could not read usage of {}: {}", id, e);
                None
            }
        }
    }

    fn load_usage(&self, compiled: &CompiledRule) {
        if let Some(stored) = self.stored_usage(&compiled.rule.id) {
            compiled.usage.fetch_max(stored, Ordering::SeqCst);
        }
    }

    /// Count one accepted use of `compiled`. Returns the new count.
    fn record_use(&self, compiled: &CompiledRule) -> u64 {
        let Some(store) = &self.usage_store else {
            return compiled.usage.fetch_add(1, Ordering::SeqCst) + 1;
        };
        match bump_counter(store.as_ref(), &Self::usage_key(&compiled.rule.id)) {
            Ok(count) => {
                compiled.usage.fetch_max(count, Ordering::SeqCst);
                count
            }
            Err(e) => {
                warn!("[RULES] Usage of {} kept in memory only: {}", compiled.rule.id, e);
                compiled.usage.fetch_add(1, Ordering::SeqCst) + 1
            }
        }
    }

    fn snapshot(&self, compiled: &CompiledRule) -> ManualRule {
        self.load_usage(compiled);
        compiled.snapshot()
    }

    /// Build from a seed list. Rules with invalid patterns are skipped and
    /// logged.
    pub fn from_rules(rules: Vec<ManualRule>, instruments: Arc<InstrumentTable>) -> Self {
        let engine = Self::new(instruments);
        for rule in rules {
            if let Err(e) = engine.upsert(rule) {
                warn!("[RULES] Skipping rule: {}", e);
            }
        }
        engine
    }

    /// Insert or replace (by id) a rule.
    pub fn upsert(&self, rule: ManualRule) -> Result<(), RuleError> {
        let compiled = Arc::new(CompiledRule::compile(rule)?);
        self.load_usage(&compiled);
        let mut rules = self.rules.write().unwrap_or_else(PoisonError::into_inner);
        rules.retain(|r| r.rule.id != compiled.rule.id);
        rules.push(compiled);
        rules.sort_by(|a, b| b.rule.priority.cmp(&a.rule.priority));
        Ok(())
    }

    pub fn remove(&self, id: &str) -> Result<ManualRule, RuleError> {
        let mut rules = self.rules.write().unwrap_or_else(PoisonError::into_inner);
        let idx = rules
            .iter()
            .position(|r| r.rule.id == id)
            .ok_or_else(|| RuleError::NotFound { id: id.to_string() })?;
        let removed = rules.remove(idx);
        drop(rules);
        Ok(self.snapshot(&removed))
    }

    pub fn set_active(&self, id: &str, active: bool) -> Result<(), RuleError> {
        let mut rule = self
            .get(id)
            .ok_or_else(|| RuleError::NotFound { id: id.to_string() })?;
        rule.is_active = active;
        self.upsert(rule)
    }

    pub fn get(&self, id: &str) -> Option<ManualRule> {
        let rules = self.rules.read().unwrap_or_else(PoisonError::into_inner);
        rules.iter().find(|r| r.rule.id == id).map(|r| self.snapshot(r))
    }

    /// Snapshot of all rules in evaluation order, with current usage counts.
    pub fn rules(&self) -> Vec<ManualRule> {
        let rules = self.rules.read().unwrap_or_else(PoisonError::into_inner);
        rules.iter().map(|r| self.snapshot(r)).collect()
    }

    /// First active rule scoped to `channel_id` whose pattern matches, as a
    /// signal at fixed confidence. Increments that rule's usage count once.
    pub fn match_rule(&self, raw_text: &str, channel_id: &str) -> Option<ParsedSignal> {
        self.match_with_source(raw_text, channel_id, AlertSource::Text, 0.0)
    }

    /// Like [`match_rule`](Self::match_rule), but only when a rule signal
    /// would clear `gate`. Below the gate nothing matches and no usage is
    /// counted.
    pub fn match_alert(&self, alert: &RawAlert, gate: f64) -> Option<ParsedSignal> {
        self.match_with_source(&alert.text, &alert.channel_id, alert.source, gate)
    }

    fn match_with_source(
        &self,
        raw_text: &str,
        channel_id: &str,
        source: AlertSource,
        gate: f64,
    ) -> Option<ParsedSignal> {
        if RULE_CONFIDENCE < gate {
            return None;
        }
        let hit = {
            let rules = self.rules.read().unwrap_or_else(PoisonError::into_inner);
            rules
                .iter()
                .find(|r| r.rule.is_active && r.rule.applies_to(channel_id) && r.regex.is_match(raw_text))
                .cloned()
        }?;

        let uses = self.record_use(&hit);
        let rule = &hit.rule;
        info!(
            "[RULES] Rule {} (priority {}) matched on channel {} (uses: {})",
            rule.id, rule.priority, channel_id, uses
        );

        let pair = rule
            .default_pair
            .as_deref()
            .map(|p| {
                self.instruments
                    .find_in_text(p)
                    .unwrap_or_else(|| p.to_uppercase())
            })
            .or_else(|| self.instruments.find_in_text(raw_text));

        let order_type = determine_order_type(raw_text, rule.default_action);
        // A rule that names a side opens a trade unless the text cancels.
        let intent = match classify_intent(raw_text) {
            SignalIntent::ModifySl | SignalIntent::ClosePartial if rule.default_action.is_present() => {
                SignalIntent::OpenTrade
            }
            intent => intent,
        };

        Some(ParsedSignal {
            signal_id: uuid::Uuid::new_v4().to_string(),
            pair,
            action: rule.default_action,
            entry: rule.default_entry,
            stop_loss: rule.default_sl,
            take_profits: rule.default_tp.clone(),
            intent,
            order_type,
            modifications: extract_modifications(raw_text),
            confidence: RULE_CONFIDENCE,
            source,
            signal_hash: signal_hash(raw_text, channel_id),
            channel_id: channel_id.to_string(),
            raw_text: raw_text.to_string(),
            matched_rule: Some(rule.id.clone()),
        })
    }
}

/// Increment the decimal counter at `key`, safe against other writers.
fn bump_counter(store: &dyn KeyValueStore, key: &str) -> Result<u64, StoreError> {
    loop {
        match store.get(key)? {
            None => {
                if store.insert_if_absent(key, "1")? {
                    return Ok(1);
                }
            }
            Some(current) => {
                let next = current.trim().parse::<u64>().unwrap_or(0) + 1;
                if store.compare_and_swap(key, &current, Some(&next.to_string()))? {
                    return Ok(next);
                }
            }
        }
    }
}
