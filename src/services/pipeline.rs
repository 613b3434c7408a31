//! Alert pipeline: rule engine or parser, dedup gate, then one dispatch per
//! account that follows the alert's channel. Only signals some follower
//! would act on are marked as seen.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::bus::EventBus;
use crate::config::{AccountConfig, AppConfig};
use crate::constants::events as names;
use crate::data::store::KeyValueStore;
use crate::error::Rejection;
use crate::events::{DispatchOutcome, Event, ParsedSignal, RawAlert};
use crate::parser::{HeuristicParser, InstrumentTable, SignalParser, WeightedScorer};
use crate::services::dedup::{DedupStore, Deduplicator};
use crate::services::dispatcher::RiskDispatcher;
use crate::services::rules::RuleEngine;

/// Per-account rejection in a form callers can serialize.
#[derive(Clone, Debug, Serialize)]
pub struct AccountRejection {
    pub account: String,
    pub reason_code: &'static str,
    pub message: String,
    pub confidence: Option<f64>,
    pub pip_distance: Option<f64>,
}

impl AccountRejection {
    pub fn new(account: &str, rejection: &Rejection) -> Self {
        Self {
            account: account.to_string(),
            reason_code: rejection.reason_code(),
            message: rejection.to_string(),
            confidence: rejection.confidence(),
            pip_distance: rejection.pip_distance(),
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct AlertOutcome {
    pub signal: ParsedSignal,
    pub dispatched: Vec<DispatchOutcome>,
    pub rejected: Vec<AccountRejection>,
}

pub struct SignalPipeline {
    parser: Arc<dyn SignalParser>,
    rules: Arc<RuleEngine>,
    dedup: Arc<dyn DedupStore>,
    dispatcher: Arc<RiskDispatcher>,
    accounts: HashMap<String, AccountConfig>,
    rule_gate_confidence: f64,
    bus: EventBus,
}

impl SignalPipeline {
    pub fn new(
        parser: Arc<dyn SignalParser>,
        rules: Arc<RuleEngine>,
        dedup: Arc<dyn DedupStore>,
        dispatcher: Arc<RiskDispatcher>,
        accounts: HashMap<String, AccountConfig>,
        rule_gate_confidence: f64,
        bus: EventBus,
    ) -> Self {
        Self {
            parser,
            rules,
            dedup,
            dispatcher,
            accounts,
            rule_gate_confidence,
            bus,
        }
    }

    /// Wire the default components from configuration over one shared store.
    pub fn from_config(config: &AppConfig, store: Arc<dyn KeyValueStore>, bus: EventBus) -> Self {
        let instruments = Arc::new(InstrumentTable::with_overrides(&config.instruments));
        let parser = HeuristicParser::new(
            instruments.clone(),
            Arc::new(WeightedScorer::new(config.parser.weights.clone())),
        );
        let rules =
            RuleEngine::from_rules(config.rules.clone(), instruments.clone()).with_usage_store(store.clone());
        let dedup = Deduplicator::new(store.clone(), config.dedup.window_hours);
        let dispatcher = RiskDispatcher::new(store, instruments, config.dispatcher.clone());

        Self::new(
            Arc::new(parser),
            Arc::new(rules),
            Arc::new(dedup),
            Arc::new(dispatcher),
            config.accounts.clone(),
            config.parser.rule_gate_confidence,
            bus,
        )
    }

    pub fn rules(&self) -> &Arc<RuleEngine> {
        &self.rules
    }

    pub fn dispatcher(&self) -> &Arc<RiskDispatcher> {
        &self.dispatcher
    }

    /// A manual rule wins when it clears the gate; the statistical parser is
    /// not consulted in that case.
    pub fn parse(&self, alert: &RawAlert) -> ParsedSignal {
        if let Some(signal) = self.rules.match_alert(alert, self.rule_gate_confidence) {
            debug!("[PIPELINE] {} via rule {:?}", names::RULE_MATCHED, signal.matched_rule);
            return signal;
        }
        self.parser.parse(alert)
    }

    /// Run one alert through the whole pipeline. Errors only for rejections
    /// that stop the alert before any account sees it (duplicates, store
    /// failures); per-account rejections are part of the outcome.
    pub fn process(&self, alert: &RawAlert) -> Result<AlertOutcome, Rejection> {
        let signal = self.parse(alert);
        info!(
            "📨 [PIPELINE] {} {:?} {} {:?} conf={:.2} from {}",
            names::SIGNAL_PARSED,
            signal.pair,
            signal.action.as_str(),
            signal.intent,
            signal.confidence,
            signal.channel_id
        );
        self.bus.emit(Event::Parsed(signal.clone()));

        let mut targets: Vec<(&String, &AccountConfig)> = self
            .accounts
            .iter()
            .filter(|(_, account)| account.follows(&signal.channel_id))
            .collect();
        targets.sort_by(|a, b| a.0.cmp(b.0));
        if targets.is_empty() {
            debug!("[PIPELINE] No account follows channel {}", signal.channel_id);
        }

        // Signals no follower would act on are never marked as seen.
        let actionable = targets
            .iter()
            .any(|(_, account)| signal.confidence >= account.risk.min_confidence);
        if actionable {
            self.check_duplicate(&signal)?;
        } else {
            debug!(
                "[PIPELINE] conf={:.2} below every follower of {}; not marked",
                signal.confidence, signal.channel_id
            );
        }

        let mut dispatched = Vec::new();
        let mut rejected = Vec::new();
        for (name, account) in targets {
            match self.dispatcher.dispatch(name, &signal, &account.risk) {
                Ok(outcome) => {
                    info!("✅ [PIPELINE] {} to {} ({:?})", names::ORDER_DISPATCHED, name, outcome.delivery);
                    self.bus.emit(Event::Dispatched(outcome.clone()));
                    dispatched.push(outcome);
                }
                Err(rejection) => {
                    info!(
                        "🚫 [PIPELINE] {} for {}: {} ({})",
                        names::ORDER_REJECTED,
                        name,
                        rejection,
                        rejection.reason_code()
                    );
                    rejected.push(AccountRejection::new(name, &rejection));
                    self.bus.emit(Event::Rejected {
                        channel_id: signal.channel_id.clone(),
                        account: Some(name.clone()),
                        rejection,
                    });
                }
            }
        }

        Ok(AlertOutcome {
            signal,
            dispatched,
            rejected,
        })
    }

    fn check_duplicate(&self, signal: &ParsedSignal) -> Result<(), Rejection> {
        let check = self.dedup.check_and_mark(&signal.signal_hash).map_err(Rejection::from);
        let rejection = match check {
            Ok(outcome) if outcome.is_duplicate => Rejection::DuplicateSignal {
                signal_hash: signal.signal_hash.clone(),
            },
            Ok(_) => return Ok(()),
            Err(e) => e,
        };
        warn!("🔁 [PIPELINE] {}: {}", names::DUPLICATE_REJECTED, rejection);
        self.bus.emit(Event::Rejected {
            channel_id: signal.channel_id.clone(),
            account: None,
            rejection: rejection.clone(),
        });
        Err(rejection)
    }

    /// Release a parked semi-auto order.
    pub fn confirm(&self, confirmation_id: &str) -> Result<DispatchOutcome, Rejection> {
        let pending = self.dispatcher.pending_confirmation(confirmation_id)?;
        let profile = pending
            .as_ref()
            .and_then(|p| self.accounts.get(&p.account))
            .map(|a| &a.risk);

        match self.dispatcher.confirm(confirmation_id, profile) {
            Ok(outcome) => {
                self.bus.emit(Event::Dispatched(outcome.clone()));
                Ok(outcome)
            }
            Err(rejection) => {
                if let Some(p) = pending {
                    self.bus.emit(Event::Rejected {
                        channel_id: p.channel_id,
                        account: Some(p.account),
                        rejection: rejection.clone(),
                    });
                }
                Err(rejection)
            }
        }
    }
}
