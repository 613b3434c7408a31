use crate::config::ScorerWeights;
use crate::constants::parser::FIELD_SEPARATORS;
use crate::events::TradeAction;

/// Fields the extractor pulled out of an alert, as seen by a scorer.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ExtractedFields {
    pub pair: Option<String>,
    pub action: TradeAction,
    pub entry: Option<f64>,
    pub stop_loss: Option<f64>,
    pub take_profits: Vec<f64>,
}

/// Confidence contract consumed by the dispatcher's gate. Implementations
/// must return a value in [0, 1].
pub trait ConfidenceScorer: Send + Sync {
    fn confidence(&self, fields: &ExtractedFields, raw_text: &str) -> f64;
}

/// Reference heuristic: weighted presence of structural fields plus two
/// small formatting bonuses, capped at 1.0.
#[derive(Clone, Debug, Default)]
pub struct WeightedScorer {
    weights: ScorerWeights,
}

impl WeightedScorer {
    pub fn new(weights: ScorerWeights) -> Self {
        Self { weights }
    }
}

impl ConfidenceScorer for WeightedScorer {
    fn confidence(&self, fields: &ExtractedFields, raw_text: &str) -> f64 {
        let w = &self.weights;
        let mut score = 0.0;

        if fields.pair.is_some() {
            score += w.pair;
        }
        if fields.action.is_present() {
            score += w.action;
        }
        if fields.entry.is_some() {
            score += w.entry;
        }
        if fields.stop_loss.is_some() {
            score += w.stop_loss;
        }
        if !fields.take_profits.is_empty() {
            score += w.take_profit;
        }

        if raw_text.contains(FIELD_SEPARATORS) {
            score += w.separator_bonus;
        }
        if has_decimal_number(raw_text) {
            score += w.decimal_bonus;
        }

        score.clamp(0.0, 1.0)
    }
}

/// True if the text holds a digit, a dot, then another digit.
pub fn has_decimal_number(text: &str) -> bool {
    text.as_bytes()
        .windows(3)
        .any(|w| w[0].is_ascii_digit() && w[1] == b'.' && w[2].is_ascii_digit())
}
