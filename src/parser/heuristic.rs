//! Reference regex/keyword extractor.
//!
//! Total over its input: anything it cannot find is left empty and simply
//! lowers the confidence.

use regex::Regex;
use std::sync::{Arc, LazyLock};
use tracing::debug;

use crate::constants::parser::MAX_TP_PER_INDICATOR;
use crate::events::{
    Modifications, OrderType, ParsedSignal, RawAlert, SignalIntent, TradeAction,
};
use crate::parser::instruments::InstrumentTable;
use crate::parser::scorer::{ConfidenceScorer, ExtractedFields, WeightedScorer};
use crate::parser::{signal_hash, SignalParser};

fn re(pattern: &str) -> Regex {
    Regex::new(pattern).expect("built-in pattern must compile")
}

const NUM: &str = r"(\d+(?:\.\d+)?)";

// Checked in order; the first family found anywhere in the text wins.
static ACTION_DICTIONARY: LazyLock<Vec<(TradeAction, Regex)>> = LazyLock::new(|| {
    vec![
        (TradeAction::BuyStop, re(r"(?i)\bbuy\s*-?\s*stop\b")),
        (TradeAction::SellStop, re(r"(?i)\bsell\s*-?\s*stop\b")),
        (
            TradeAction::Buy,
            re(r"(?i)\b(?:buy|long|bull|bullish|call)\b|买入|上涨|做多"),
        ),
        (
            TradeAction::Sell,
            re(r"(?i)\b(?:sell|short|bear|bearish|put)\b|卖出|下跌|做空"),
        ),
    ]
});

// Entry indicators by priority: "entry", "@", then a number right after the verb.
static ENTRY_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    vec![
        re(&format!(r"(?i)\b(?:entry|enter)(?:\s+price)?\s*[:/@=]?\s*{}", NUM)),
        re(&format!(r"@\s*{}", NUM)),
        re(&format!(
            r"(?i)\b(?:buy|sell|long|short)(?:\s*(?:now|limit|stop))?\s+(?:at\s+)?{}",
            NUM
        )),
    ]
});

static SL_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| re(&format!(r"(?i)\bsl\s*[:/@=]?\s*{}", NUM)));

// Group 1 catches "buy stop"/"sell stop", which name an order type, not a stop-loss.
static STOP_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    re(&format!(
        r"(?i)(\b(?:buy|sell)\s*-?\s*)?\bstop(?:\s*-?\s*loss)?\s*[:/@=]?\s*{}",
        NUM
    ))
});

static TP_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    re(&format!(
        r"(?i)\b(?:tp(?:[1-9](?:\s*[:=]|\s+))?|take\s*-?\s*profits?|targets?)\s*[:/@=]?\s*{n}(?:\s*[,/\s]\s*{n})?(?:\s*[,/\s]\s*{n})?",
        n = NUM
    ))
});

// "remove"/"delete" only cancel when they name an order; "remove SL" is a
// modification.
static CANCEL_KEYWORDS: LazyLock<Regex> = LazyLock::new(|| {
    re(r"(?i)\bcancel(?:l?ed)?\b|\b(?:delete|remove)\s+(?:the\s+|all\s+|my\s+)?(?:buy\s+|sell\s+)?(?:pending\s+|limit\s+|stop\s+)?(?:orders?|pending|limits?|entry|entries)\b")
});

static MODIFY_KEYWORDS: LazyLock<Regex> = LazyLock::new(|| {
    re(r"(?i)\b(?:break\s*-?\s*even|b/e|move|modify|adjust|trail(?:ing)?)\b|\bsl\s+to\b|\bto\s+be\b|\b(?:remove|delete)\s+(?:the\s+)?(?:sl|tp|stop(?:\s*-?\s*loss)?|take\s*-?\s*profits?)\b|保本")
});

static CLOSE_KEYWORDS: LazyLock<Regex> = LazyLock::new(|| {
    re(r"(?i)\b(?:close|exit|partial(?:ly)?|secure|book)\b|平仓")
});

static PENDING_KEYWORDS: LazyLock<Regex> =
    LazyLock::new(|| re(r"(?i)\b(?:pending|limit)\b|\bstop\s+order\b"));

static BREAKEVEN: LazyLock<Regex> = LazyLock::new(|| {
    re(r"(?i)\bbreak\s*-?\s*even\b|\bb/e\b|\b(?:to|at)\s+be\b|\bsl\s+be\b|\bbe\s+sl\b|保本")
});

static PARTIAL_CLOSE: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    vec![
        re(&format!(
            r"(?i)\b(?:close|exit|partial|secure|take|book)\w*\s+(?:of\s+)?{}\s*%",
            NUM
        )),
        re(&format!(
            r"(?i){}\s*%\s*(?:of\s+)?(?:close|partial|profit|position)",
            NUM
        )),
    ]
});

static SL_INCREASE: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    vec![
        re(&format!(
            r"(?i)\b(?:increase|raise|tighten|move|trail)\s+(?:the\s+)?(?:sl|stop(?:\s*-?\s*loss)?)\s+(?:up\s+)?(?:by\s+)?\+?{}\s*pips?\b",
            NUM
        )),
        re(&format!(r"(?i)\bsl\s*\+\s*{}\s*pips?\b", NUM)),
    ]
});

static VOLUME_PERCENT: LazyLock<Regex> = LazyLock::new(|| {
    re(&format!(
        r"(?i)\b(?:volume|vol|risk|lot(?:\s*size)?)\s*[:=]?\s*{}\s*%",
        NUM
    ))
});

pub struct HeuristicParser {
    instruments: Arc<InstrumentTable>,
    scorer: Arc<dyn ConfidenceScorer>,
}

impl HeuristicParser {
    pub fn new(instruments: Arc<InstrumentTable>, scorer: Arc<dyn ConfidenceScorer>) -> Self {
        Self { instruments, scorer }
    }

    /// Parser over the built-in instrument table and default weights.
    pub fn with_defaults() -> Self {
        Self::new(
            Arc::new(InstrumentTable::builtin()),
            Arc::new(WeightedScorer::default()),
        )
    }

    pub fn extract(&self, text: &str) -> ExtractedFields {
        ExtractedFields {
            pair: self.instruments.find_in_text(text),
            action: extract_action(text),
            entry: extract_entry(text),
            stop_loss: extract_stop_loss(text),
            take_profits: extract_take_profits(text),
        }
    }
}

impl SignalParser for HeuristicParser {
    fn name(&self) -> &str {
        "heuristic"
    }

    fn parse(&self, alert: &RawAlert) -> ParsedSignal {
        let text = alert.text.as_str();
        let fields = self.extract(text);
        let confidence = self.scorer.confidence(&fields, text);
        let intent = classify_intent(text);
        let order_type = determine_order_type(text, fields.action);
        let modifications = extract_modifications(text);

        debug!(
            "[PARSER] {:?} {} entry={:?} sl={:?} tp={:?} intent={:?} conf={:.2}",
            fields.pair,
            fields.action.as_str(),
            fields.entry,
            fields.stop_loss,
            fields.take_profits,
            intent,
            confidence
        );

        ParsedSignal {
            signal_id: uuid::Uuid::new_v4().to_string(),
            pair: fields.pair,
            action: fields.action,
            entry: fields.entry,
            stop_loss: fields.stop_loss,
            take_profits: fields.take_profits,
            intent,
            order_type,
            modifications,
            confidence,
            source: alert.source,
            signal_hash: signal_hash(text, &alert.channel_id),
            channel_id: alert.channel_id.clone(),
            raw_text: alert.text.clone(),
            matched_rule: None,
        }
    }
}

pub fn extract_action(text: &str) -> TradeAction {
    ACTION_DICTIONARY
        .iter()
        .find(|(_, pattern)| pattern.is_match(text))
        .map(|(action, _)| *action)
        .unwrap_or(TradeAction::None)
}

fn first_number(pattern: &Regex, text: &str) -> Option<f64> {
    pattern
        .captures(text)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

pub fn extract_entry(text: &str) -> Option<f64> {
    ENTRY_PATTERNS.iter().find_map(|p| first_number(p, text))
}

pub fn extract_stop_loss(text: &str) -> Option<f64> {
    first_number(&SL_PATTERN, text).or_else(|| {
        STOP_PATTERN
            .captures_iter(text)
            .filter(|c| c.get(1).is_none())
            .find_map(|c| c.get(2).and_then(|m| m.as_str().parse().ok()))
    })
}

/// TP levels in the order they appear, without duplicates.
pub fn extract_take_profits(text: &str) -> Vec<f64> {
    let mut levels: Vec<f64> = Vec::new();
    for caps in TP_PATTERN.captures_iter(text) {
        for idx in 1..=MAX_TP_PER_INDICATOR {
            if let Some(tp) = caps.get(idx).and_then(|m| m.as_str().parse::<f64>().ok()) {
                if !levels.contains(&tp) {
                    levels.push(tp);
                }
            }
        }
    }
    levels
}

/// Ranked classification. Cancel instructions go first; after
/// that trade verbs beat modify clauses, which beat close clauses, so
/// "buy now, then SL to BE" stays an open trade.
pub fn classify_intent(text: &str) -> SignalIntent {
    if CANCEL_KEYWORDS.is_match(text) {
        SignalIntent::Cancel
    } else if extract_action(text).is_present() {
        SignalIntent::OpenTrade
    } else if MODIFY_KEYWORDS.is_match(text) {
        SignalIntent::ModifySl
    } else if CLOSE_KEYWORDS.is_match(text) {
        SignalIntent::ClosePartial
    } else {
        SignalIntent::OpenTrade
    }
}

pub fn determine_order_type(text: &str, action: TradeAction) -> OrderType {
    if matches!(action, TradeAction::BuyStop | TradeAction::SellStop) || PENDING_KEYWORDS.is_match(text) {
        OrderType::Pending
    } else {
        OrderType::Market
    }
}

pub fn extract_modifications(text: &str) -> Modifications {
    let partial_close_percent = PARTIAL_CLOSE
        .iter()
        .find_map(|p| first_number(p, text))
        .filter(|pct| *pct > 0.0 && *pct <= 100.0);

    Modifications {
        move_sl_to_breakeven: BREAKEVEN.is_match(text),
        sl_increase_pips: SL_INCREASE.iter().find_map(|p| first_number(p, text)),
        partial_close_percent,
        volume_percent: first_number(&VOLUME_PERCENT, text),
    }
}
