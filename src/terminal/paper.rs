//! In-process paper terminal.
//!
//! Fills market orders at the current quote, rests pending orders until the
//! quote crosses them, and closes positions whose SL/TP is hit on a quote
//! update. Used by the binary when no broker is attached and by the tests.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info};

use crate::constants::dispatch::STEP_EPSILON;
use crate::error::TerminalError;
use crate::parser::InstrumentTable;

use super::traits::{TerminalResult, TradingTerminal};
use super::types::{
    OrderAck, OrderKind, PendingOrder, PlaceOrderRequest, Quote, Side, SymbolSpec, TerminalPosition,
};

#[derive(Default)]
struct PaperState {
    specs: HashMap<String, SymbolSpec>,
    quotes: HashMap<String, Quote>,
    positions: BTreeMap<u64, TerminalPosition>,
    pending: BTreeMap<u64, PendingOrder>,
    next_ticket: u64,
    reject_next: Option<String>,
    connected: bool,
    requests: Vec<PlaceOrderRequest>,
}

impl PaperState {
    fn ticket(&mut self) -> u64 {
        self.next_ticket += 1;
        self.next_ticket
    }

    fn ensure_connected(&self) -> TerminalResult<()> {
        if self.connected {
            Ok(())
        } else {
            Err(TerminalError::Disconnected)
        }
    }

    /// Fill pending orders crossed by the quote and close positions whose
    /// SL/TP it reached.
    fn reprice(&mut self, symbol: &str) {
        let quote = match self.quotes.get(symbol) {
            Some(q) => *q,
            None => return,
        };

        let triggered: Vec<u64> = self
            .pending
            .values()
            .filter(|o| o.symbol == symbol && pending_triggered(o.kind, o.price, &quote))
            .map(|o| o.ticket)
            .collect();
        for ticket in triggered {
            if let Some(order) = self.pending.remove(&ticket) {
                debug!("[PAPER] Pending #{} {} filled at {}", ticket, order.symbol, order.price);
                self.positions.insert(
                    ticket,
                    TerminalPosition {
                        ticket,
                        symbol: order.symbol,
                        side: order.kind.side(),
                        volume: order.volume,
                        open_price: order.price,
                        stop_loss: order.stop_loss,
                        take_profit: order.take_profit,
                        tag: order.tag,
                    },
                );
            }
        }

        let hit: Vec<u64> = self
            .positions
            .values()
            .filter(|p| p.symbol == symbol && exit_triggered(p, &quote))
            .map(|p| p.ticket)
            .collect();
        for ticket in hit {
            if let Some(p) = self.positions.remove(&ticket) {
                info!("[PAPER] Position #{} {} closed by SL/TP", ticket, p.symbol);
            }
        }
    }
}

fn pending_triggered(kind: OrderKind, price: f64, quote: &Quote) -> bool {
    match kind {
        OrderKind::BuyLimit => quote.ask <= price,
        OrderKind::SellLimit => quote.bid >= price,
        OrderKind::BuyStop => quote.ask >= price,
        OrderKind::SellStop => quote.bid <= price,
        OrderKind::Buy | OrderKind::Sell => true,
    }
}

fn exit_triggered(position: &TerminalPosition, quote: &Quote) -> bool {
    let price = quote.close_price(position.side);
    match position.side {
        Side::Buy => {
            position.stop_loss.map(|sl| price <= sl).unwrap_or(false)
                || position.take_profit.map(|tp| price >= tp).unwrap_or(false)
        }
        Side::Sell => {
            position.stop_loss.map(|sl| price >= sl).unwrap_or(false)
                || position.take_profit.map(|tp| price <= tp).unwrap_or(false)
        }
    }
}

fn volume_on_step(volume: f64, spec: &SymbolSpec) -> bool {
    if spec.volume_step <= 0.0 {
        return true;
    }
    let steps = volume / spec.volume_step;
    (steps - steps.round()).abs() < 1e-6
}

#[derive(Clone)]
pub struct PaperTerminal {
    state: Arc<Mutex<PaperState>>,
}

impl Default for PaperTerminal {
    fn default() -> Self {
        Self::new()
    }
}

impl PaperTerminal {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(PaperState {
                connected: true,
                ..PaperState::default()
            })),
        }
    }

    /// Paper terminal that knows every symbol of the instrument table.
    pub fn from_instruments(instruments: &InstrumentTable) -> Self {
        let terminal = Self::new();
        for symbol in instruments.symbols() {
            if let Some(spec) = instruments.get(&symbol) {
                terminal.add_symbol(SymbolSpec {
                    symbol: spec.symbol.clone(),
                    pip_size: spec.pip_size,
                    digits: spec.digits,
                    volume_min: spec.volume_min,
                    volume_step: spec.volume_step,
                    volume_max: spec.volume_max,
                });
            }
        }
        terminal
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PaperState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add_symbol(&self, spec: SymbolSpec) {
        self.lock().specs.insert(spec.symbol.clone(), spec);
    }

    /// Update the quote and run fills/exits it triggers.
    pub fn set_quote(&self, symbol: &str, bid: f64, ask: f64) {
        let mut state = self.lock();
        state.quotes.insert(symbol.to_string(), Quote { bid, ask });
        state.reprice(symbol);
    }

    /// Reject the next `place_order` call with `reason`.
    pub fn fail_next_order(&self, reason: impl Into<String>) {
        self.lock().reject_next = Some(reason.into());
    }

    pub fn set_connected(&self, connected: bool) {
        self.lock().connected = connected;
    }

    /// Open a position directly, e.g. one placed by hand or another tool.
    pub fn inject_position(&self, mut position: TerminalPosition) -> u64 {
        let mut state = self.lock();
        let ticket = state.ticket();
        position.ticket = ticket;
        state.positions.insert(ticket, position);
        ticket
    }

    /// Every order request received, in order.
    pub fn requests(&self) -> Vec<PlaceOrderRequest> {
        self.lock().requests.clone()
    }

    pub fn position(&self, ticket: u64) -> Option<TerminalPosition> {
        self.lock().positions.get(&ticket).cloned()
    }
}

#[async_trait]
impl TradingTerminal for PaperTerminal {
    fn name(&self) -> &'static str {
        "paper"
    }

    async fn symbol_spec(&self, symbol: &str) -> TerminalResult<SymbolSpec> {
        let state = self.lock();
        state.ensure_connected()?;
        state.specs.get(symbol).cloned().ok_or_else(|| TerminalError::UnknownSymbol {
            symbol: symbol.to_string(),
        })
    }

    async fn quote(&self, symbol: &str) -> TerminalResult<Quote> {
        let state = self.lock();
        state.ensure_connected()?;
        state.quotes.get(symbol).copied().ok_or_else(|| TerminalError::NoQuote {
            symbol: symbol.to_string(),
        })
    }

    async fn place_order(&self, request: PlaceOrderRequest) -> TerminalResult<OrderAck> {
        let mut state = self.lock();
        state.ensure_connected()?;
        state.requests.push(request.clone());

        if let Some(reason) = state.reject_next.take() {
            return Err(TerminalError::OrderRejected { reason });
        }

        let spec = state
            .specs
            .get(&request.symbol)
            .cloned()
            .ok_or_else(|| TerminalError::UnknownSymbol {
                symbol: request.symbol.clone(),
            })?;
        if request.volume + STEP_EPSILON < spec.volume_min
            || request.volume > spec.volume_max + STEP_EPSILON
            || !volume_on_step(request.volume, &spec)
        {
            return Err(TerminalError::InvalidVolume {
                symbol: request.symbol.clone(),
                volume: request.volume,
            });
        }

        let ticket = state.ticket();
        if request.kind.is_pending() {
            state.pending.insert(
                ticket,
                PendingOrder {
                    ticket,
                    symbol: request.symbol.clone(),
                    kind: request.kind,
                    volume: request.volume,
                    price: request.price,
                    stop_loss: request.stop_loss,
                    take_profit: request.take_profit,
                    tag: request.tag.clone(),
                },
            );
            return Ok(OrderAck {
                ticket,
                filled: false,
                price: request.price,
            });
        }

        let quote = state
            .quotes
            .get(&request.symbol)
            .copied()
            .ok_or_else(|| TerminalError::NoQuote {
                symbol: request.symbol.clone(),
            })?;
        let side = request.kind.side();
        let fill = quote.fill_price(side);
        if request.deviation > 0.0 && (fill - request.price).abs() > request.deviation + STEP_EPSILON {
            return Err(TerminalError::OrderRejected {
                reason: format!("requote: fill {} outside deviation {}", fill, request.deviation),
            });
        }

        state.positions.insert(
            ticket,
            TerminalPosition {
                ticket,
                symbol: request.symbol,
                side,
                volume: request.volume,
                open_price: fill,
                stop_loss: request.stop_loss,
                take_profit: request.take_profit,
                tag: request.tag,
            },
        );
        Ok(OrderAck {
            ticket,
            filled: true,
            price: fill,
        })
    }

    async fn modify_position(&self, ticket: u64, stop_loss: Option<f64>, take_profit: Option<f64>) -> TerminalResult<()> {
        let mut state = self.lock();
        state.ensure_connected()?;
        let position = state
            .positions
            .get_mut(&ticket)
            .ok_or(TerminalError::PositionNotFound { ticket })?;
        position.stop_loss = stop_loss;
        position.take_profit = take_profit;
        Ok(())
    }

    async fn close_position(&self, ticket: u64, volume: f64) -> TerminalResult<f64> {
        let mut state = self.lock();
        state.ensure_connected()?;
        let position = state
            .positions
            .get(&ticket)
            .cloned()
            .ok_or(TerminalError::PositionNotFound { ticket })?;
        let price = state
            .quotes
            .get(&position.symbol)
            .map(|q| q.close_price(position.side))
            .unwrap_or(position.open_price);

        if volume + STEP_EPSILON >= position.volume {
            state.positions.remove(&ticket);
        } else if let Some(p) = state.positions.get_mut(&ticket) {
            p.volume = ((p.volume - volume) * 1e8).round() / 1e8;
        }
        Ok(price)
    }

    async fn cancel_order(&self, ticket: u64) -> TerminalResult<()> {
        let mut state = self.lock();
        state.ensure_connected()?;
        state
            .pending
            .remove(&ticket)
            .map(|_| ())
            .ok_or(TerminalError::OrderNotFound { ticket })
    }

    async fn positions(&self) -> TerminalResult<Vec<TerminalPosition>> {
        let state = self.lock();
        state.ensure_connected()?;
        Ok(state.positions.values().cloned().collect())
    }

    async fn pending_orders(&self) -> TerminalResult<Vec<PendingOrder>> {
        let state = self.lock();
        state.ensure_connected()?;
        Ok(state.pending.values().cloned().collect())
    }
}
