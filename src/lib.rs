//! Signal Relay - trading alert relay
//!
//! Parses free-text trading alerts into structured signals, gates them on
//! confidence and duplicates, sizes them against per-account risk, and hands
//! them to a stealth execution engine that drives a trading terminal.

pub mod api;
pub mod bus;
pub mod config;
pub mod constants;
pub mod data;
pub mod error;
pub mod events;
pub mod parser;
pub mod services;
pub mod terminal;

// Re-export commonly used types
pub use bus::EventBus;
pub use config::AppConfig;
pub use error::Rejection;
pub use events::{DispatchedOrder, Event, ExecutionReport, ParsedSignal, RawAlert, RiskProfile};

#[cfg(test)]
mod config_tests;
