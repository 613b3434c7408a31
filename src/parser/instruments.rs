//! Instrument table: canonical symbols, text aliases, and the contract
//! details the dispatcher sizes against.

use std::collections::HashMap;

use crate::config::InstrumentOverride;

#[derive(Clone, Debug, PartialEq)]
pub struct InstrumentSpec {
    pub symbol: String,
    /// Price distance of one pip
    pub pip_size: f64,
    /// Account-currency value of one pip for one standard lot
    pub pip_value_per_lot: f64,
    pub volume_min: f64,
    pub volume_step: f64,
    pub volume_max: f64,
    pub digits: u32,
}

// symbol, pip size, pip value per lot, digits
const BUILTIN: &[(&str, f64, f64, u32)] = &[
    ("XAUUSD", 0.1, 10.0, 2),
    ("XAGUSD", 0.01, 50.0, 3),
    ("EURUSD", 0.0001, 10.0, 5),
    ("GBPUSD", 0.0001, 10.0, 5),
    ("USDJPY", 0.01, 6.7, 3),
    ("USDCHF", 0.0001, 11.0, 5),
    ("AUDUSD", 0.0001, 10.0, 5),
    ("USDCAD", 0.0001, 7.3, 5),
    ("NZDUSD", 0.0001, 10.0, 5),
    ("EURJPY", 0.01, 6.7, 3),
    ("GBPJPY", 0.01, 6.7, 3),
    ("EURGBP", 0.0001, 12.7, 5),
    ("AUDJPY", 0.01, 6.7, 3),
    ("EURAUD", 0.0001, 6.5, 5),
    ("BTCUSD", 1.0, 1.0, 2),
    ("ETHUSD", 0.1, 0.1, 2),
    ("USOIL", 0.01, 10.0, 2),
    ("US30", 1.0, 1.0, 1),
    ("NAS100", 1.0, 1.0, 1),
    ("SPX500", 0.1, 0.1, 1),
];

// Search order for pair extraction: alias as written, canonical symbol.
// Longer codes come before their prefixes (BTCUSD before BTC).
const ALIASES: &[(&str, &str)] = &[
    ("XAUUSD", "XAUUSD"),
    ("XAGUSD", "XAGUSD"),
    ("GOLD", "XAUUSD"),
    ("SILVER", "XAGUSD"),
    ("EURUSD", "EURUSD"),
    ("GBPUSD", "GBPUSD"),
    ("USDJPY", "USDJPY"),
    ("USDCHF", "USDCHF"),
    ("AUDUSD", "AUDUSD"),
    ("USDCAD", "USDCAD"),
    ("NZDUSD", "NZDUSD"),
    ("EURJPY", "EURJPY"),
    ("GBPJPY", "GBPJPY"),
    ("EURGBP", "EURGBP"),
    ("AUDJPY", "AUDJPY"),
    ("EURAUD", "EURAUD"),
    ("BTCUSD", "BTCUSD"),
    ("BTC", "BTCUSD"),
    ("ETHUSD", "ETHUSD"),
    ("ETH", "ETHUSD"),
    ("USOIL", "USOIL"),
    ("WTI", "USOIL"),
    ("OIL", "USOIL"),
    ("US30", "US30"),
    ("NAS100", "NAS100"),
    ("SPX500", "SPX500"),
];

#[derive(Clone, Debug)]
pub struct InstrumentTable {
    specs: HashMap<String, InstrumentSpec>,
}

impl Default for InstrumentTable {
    fn default() -> Self {
        Self::builtin()
    }
}

impl InstrumentTable {
    pub fn builtin() -> Self {
        let specs = BUILTIN
            .iter()
            .map(|(symbol, pip_size, pip_value, digits)| {
                (
                    symbol.to_string(),
                    InstrumentSpec {
                        symbol: symbol.to_string(),
                        pip_size: *pip_size,
                        pip_value_per_lot: *pip_value,
                        volume_min: 0.01,
                        volume_step: 0.01,
                        volume_max: 100.0,
                        digits: *digits,
                    },
                )
            })
            .collect();
        Self { specs }
    }

    /// Built-in table with per-symbol overrides applied. Unknown symbols in
    /// the overrides are added, with forex-style defaults for missing fields.
    pub fn with_overrides(overrides: &HashMap<String, InstrumentOverride>) -> Self {
        let mut table = Self::builtin();
        for (symbol, o) in overrides {
            let symbol = symbol.to_uppercase();
            let base = table.specs.get(&symbol).cloned().unwrap_or_else(|| InstrumentSpec {
                symbol: symbol.clone(),
                pip_size: fallback_pip_size(&symbol),
                pip_value_per_lot: 10.0,
                volume_min: 0.01,
                volume_step: 0.01,
                volume_max: 100.0,
                digits: 5,
            });
            let spec = InstrumentSpec {
                symbol: symbol.clone(),
                pip_size: o.pip_size.unwrap_or(base.pip_size),
                pip_value_per_lot: o.pip_value_per_lot.unwrap_or(base.pip_value_per_lot),
                volume_min: o.volume_min.unwrap_or(base.volume_min),
                volume_step: o.volume_step.unwrap_or(base.volume_step),
                volume_max: o.volume_max.unwrap_or(base.volume_max),
                digits: o.digits.unwrap_or(base.digits),
            };
            table.specs.insert(symbol, spec);
        }
        table
    }

    pub fn get(&self, symbol: &str) -> Option<&InstrumentSpec> {
        self.specs.get(&symbol.to_uppercase())
    }

    pub fn symbols(&self) -> Vec<String> {
        let mut symbols: Vec<String> = self.specs.keys().cloned().collect();
        symbols.sort();
        symbols
    }

    /// First instrument of the search list found in `text`, as its canonical
    /// symbol. Case-insensitive; slashes inside pairs are ignored
    /// (`EUR/USD`). An alias preceded by another letter does not count, so
    /// `ETH` does not fire inside `SOMETHING`.
    pub fn find_in_text(&self, text: &str) -> Option<String> {
        let haystack = text.to_uppercase().replace('/', "");
        ALIASES
            .iter()
            .find(|(alias, _)| contains_code(&haystack, alias))
            .map(|(_, canonical)| canonical.to_string())
            .or_else(|| {
                // Symbols only known through config overrides
                self.symbols()
                    .into_iter()
                    .find(|symbol| contains_code(&haystack, symbol))
            })
    }
}

fn contains_code(haystack: &str, code: &str) -> bool {
    haystack.match_indices(code).any(|(idx, _)| {
        haystack[..idx]
            .chars()
            .next_back()
            .map(|c| !c.is_ascii_alphabetic())
            .unwrap_or(true)
    })
}

pub fn fallback_pip_size(symbol: &str) -> f64 {
    if symbol.to_uppercase().contains("JPY") {
        0.01
    } else {
        0.0001
    }
}
