use async_trait::async_trait;

use crate::error::TerminalError;

use super::types::{OrderAck, PendingOrder, PlaceOrderRequest, Quote, SymbolSpec, TerminalPosition};

pub type TerminalResult<T> = Result<T, TerminalError>;

/// The trading terminal the execution engine drives. Broker routing lives
/// behind this boundary.
#[async_trait]
pub trait TradingTerminal: Send + Sync {
    fn name(&self) -> &'static str;

    async fn symbol_spec(&self, symbol: &str) -> TerminalResult<SymbolSpec>;
    async fn quote(&self, symbol: &str) -> TerminalResult<Quote>;

    async fn place_order(&self, request: PlaceOrderRequest) -> TerminalResult<OrderAck>;
    async fn modify_position(&self, ticket: u64, stop_loss: Option<f64>, take_profit: Option<f64>) -> TerminalResult<()>;
    /// Close `volume` of the position; closing the full volume removes it.
    async fn close_position(&self, ticket: u64, volume: f64) -> TerminalResult<f64>;
    async fn cancel_order(&self, ticket: u64) -> TerminalResult<()>;

    async fn positions(&self) -> TerminalResult<Vec<TerminalPosition>>;
    async fn pending_orders(&self) -> TerminalResult<Vec<PendingOrder>>;
}
