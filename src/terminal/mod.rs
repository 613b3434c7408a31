pub mod paper;
pub mod traits;
pub mod types;

pub use paper::PaperTerminal;
pub use traits::{TerminalResult, TradingTerminal};

#[cfg(test)]
mod paper_tests;
