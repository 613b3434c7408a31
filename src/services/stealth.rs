//! Stealth Execution Engine.
//!
//! One engine per account. Polls the account's execution channel on a fixed
//! cadence, holds a new open order for a randomized human-like delay, then
//! places it on the terminal with spread/jitter slippage. Management intents
//! and the per-position breakeven check run every cycle, including while an
//! order is being delayed.

use chrono::{DateTime, Duration, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::bus::EventBus;
use crate::config::StealthConfig;
use crate::constants::events as names;
use crate::data::channel::{ChannelRead, ExecutionChannel};
use crate::events::{
    DispatchedOrder, Event, ExecutionReport, ExecutionStatus, OrderType, SignalIntent, TradeAction,
};
use crate::services::position_monitor::{PendingPlacement, PositionTracker, TrackedPosition};
use crate::services::sizing::{partial_close_volume, round_down_to_step, round_price, slippage_offset, split_volume};
use crate::terminal::traits::TradingTerminal;
use crate::terminal::types::{OrderKind, PlaceOrderRequest, Quote, Side, SymbolSpec};

#[derive(Clone, Debug, PartialEq)]
pub enum EngineState {
    Idle,
    SignalDetected { hash: String },
    /// Waiting out the human delay. Resumed by a later poll once `wake_at`
    /// has passed.
    Delaying {
        order: DispatchedOrder,
        hash: String,
        wake_at: DateTime<Utc>,
    },
    Executing { hash: String },
}

pub struct StealthEngine {
    account: String,
    channel: ExecutionChannel,
    terminal: Arc<dyn TradingTerminal>,
    tracker: PositionTracker,
    config: StealthConfig,
    bus: EventBus,
    state: EngineState,
    last_seen_hash: Option<String>,
    rng: StdRng,
}

impl StealthEngine {
    pub fn new(
        account: impl Into<String>,
        channel: ExecutionChannel,
        terminal: Arc<dyn TradingTerminal>,
        config: StealthConfig,
        bus: EventBus,
    ) -> Self {
        Self {
            account: account.into(),
            channel,
            terminal,
            tracker: PositionTracker::new(),
            config,
            bus,
            state: EngineState::Idle,
            last_seen_hash: None,
            rng: StdRng::from_entropy(),
        }
    }

    /// Deterministic delay and jitter draws.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    pub fn account(&self) -> &str {
        &self.account
    }

    pub fn state(&self) -> &EngineState {
        &self.state
    }

    pub fn tracker(&self) -> &PositionTracker {
        &self.tracker
    }

    /// Poll loop. Never returns.
    pub async fn run(mut self) {
        info!(
            "🕵️ [STEALTH] Engine for {} started on {} (poll {}ms, delay {}-{}ms, tag {})",
            self.account,
            self.terminal.name(),
            self.config.poll_interval_ms,
            self.config.min_delay_ms,
            self.config.max_delay_ms,
            self.config.ownership_tag
        );
        let mut interval = tokio::time::interval(std::time::Duration::from_millis(self.config.poll_interval_ms));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            self.tick(Utc::now()).await;
        }
    }

    /// One engine cycle at `now`: reconcile positions, look at the channel,
    /// resume a due delayed order, run the breakeven check.
    pub async fn tick(&mut self, now: DateTime<Utc>) -> Vec<ExecutionReport> {
        let mut reports = Vec::new();

        self.sync_positions(&mut reports).await;
        self.poll_channel(now, &mut reports).await;

        let due = matches!(&self.state, EngineState::Delaying { wake_at, .. } if *wake_at <= now);
        if due {
            if let EngineState::Delaying { order, hash, .. } = std::mem::replace(&mut self.state, EngineState::Idle) {
                // The window may have closed while the delay ran.
                if !self.skip_outside_hours(now, &order.symbol, &mut reports) {
                    self.state = EngineState::Executing { hash: hash.clone() };
                    self.execute_open(&order, &mut reports).await;
                }
                self.consume(&hash);
                self.state = EngineState::Idle;
            }
        }

        self.breakeven_check(&mut reports).await;

        for report in &reports {
            self.bus.emit(Event::Execution(report.clone()));
        }
        reports
    }

    async fn poll_channel(&mut self, now: DateTime<Utc>, reports: &mut Vec<ExecutionReport>) {
        let read = match self.channel.read(&self.account) {
            Ok(read) => read,
            Err(e) => {
                warn!("[STEALTH] {} channel unreadable: {}", self.account, e);
                return;
            }
        };
        let hash = match read.hash() {
            Some(h) if self.last_seen_hash.as_deref() != Some(h) => h.to_string(),
            Some(_) => return,
            None => {
                self.last_seen_hash = None;
                return;
            }
        };
        self.last_seen_hash = Some(hash.clone());

        let order = match read {
            ChannelRead::Order { order, .. } => order,
            ChannelRead::Malformed { reason, .. } => {
                warn!("[STEALTH] {} malformed channel content ignored: {}", self.account, reason);
                self.consume(&hash);
                return;
            }
            ChannelRead::Empty => return,
        };

        info!(
            "👀 [STEALTH] {} {} {} {:?} lot {:.2}",
            names::SIGNAL_DETECTED,
            self.account,
            order.symbol,
            order.intent,
            order.lot_size
        );
        let resume = std::mem::replace(&mut self.state, EngineState::SignalDetected { hash: hash.clone() });

        if order.intent.is_management() {
            self.state = resume;
            if order.intent == SignalIntent::Cancel {
                self.drop_delayed_for(&order.symbol, reports);
            }
            self.manage(&order, reports).await;
            self.consume(&hash);
            return;
        }

        if self.skip_outside_hours(now, &order.symbol, reports) {
            self.state = resume;
            self.consume(&hash);
            return;
        }

        if let EngineState::Delaying { order: previous, .. } = &resume {
            warn!(
                "[STEALTH] {} delayed {} replaced by newer {}",
                self.account, previous.symbol, order.symbol
            );
        }

        let delay_ms = self.draw_delay(order.delay_ms);
        debug!("[STEALTH] {} delaying {} by {}ms", self.account, order.symbol, delay_ms);
        self.state = EngineState::Delaying {
            order,
            hash,
            wake_at: now + Duration::milliseconds(delay_ms as i64),
        };
    }

    /// Reports `symbol` as skipped when `now` falls outside the configured
    /// trading hours.
    fn skip_outside_hours(&self, now: DateTime<Utc>, symbol: &str, reports: &mut Vec<ExecutionReport>) -> bool {
        let Some(hours) = &self.config.trading_hours else {
            return false;
        };
        if hours.contains(now.time()) {
            return false;
        }
        info!(
            "🌙 [STEALTH] {} outside trading hours {}-{}, skipping {}",
            self.account, hours.start, hours.end, symbol
        );
        reports.push(self.report(symbol, None, ExecutionStatus::Skipped, None, None, Some("outside trading hours".into())));
        true
    }

    fn draw_delay(&mut self, floor_ms: u64) -> u64 {
        let (min, max) = (self.config.min_delay_ms, self.config.max_delay_ms);
        let drawn = if min < max { self.rng.gen_range(min..=max) } else { min };
        drawn.max(floor_ms)
    }

    fn drop_delayed_for(&mut self, symbol: &str, reports: &mut Vec<ExecutionReport>) {
        let matches = matches!(&self.state, EngineState::Delaying { order, .. } if order.symbol == symbol);
        if matches {
            if let EngineState::Delaying { order, hash, .. } = std::mem::replace(&mut self.state, EngineState::Idle) {
                info!("[STEALTH] {} cancel dropped delayed {} order", self.account, order.symbol);
                reports.push(self.report(&order.symbol, None, ExecutionStatus::Cancelled, None, Some(order.lot_size), Some("dropped during delay".into())));
                self.consume(&hash);
            }
        }
    }

    fn consume(&self, hash: &str) {
        match self.channel.mark_consumed(&self.account, hash) {
            Ok(true) => debug!("[STEALTH] {} {}", self.account, names::CHANNEL_CONSUMED),
            Ok(false) => {}
            Err(e) => error!("❌ [STEALTH] {} failed to clear channel: {}", self.account, e),
        }
    }

    fn report(
        &self,
        symbol: &str,
        ticket: Option<u64>,
        status: ExecutionStatus,
        price: Option<f64>,
        volume: Option<f64>,
        detail: Option<String>,
    ) -> ExecutionReport {
        ExecutionReport {
            account: self.account.clone(),
            symbol: symbol.to_string(),
            ticket,
            status,
            price,
            volume,
            detail,
        }
    }

    async fn market_context(&self, symbol: &str) -> Result<(SymbolSpec, Quote), String> {
        let spec = self.terminal.symbol_spec(symbol).await.map_err(|e| e.to_string())?;
        let quote = self.terminal.quote(symbol).await.map_err(|e| e.to_string())?;
        Ok((spec, quote))
    }

    async fn execute_open(&mut self, order: &DispatchedOrder, reports: &mut Vec<ExecutionReport>) {
        let side = match order.action {
            a if a.is_buy() => Side::Buy,
            a if a.is_sell() => Side::Sell,
            _ => {
                warn!("[STEALTH] {} order for {} has no action", self.account, order.symbol);
                reports.push(self.report(&order.symbol, None, ExecutionStatus::Failed, None, None, Some("missing action".into())));
                return;
            }
        };

        let (spec, quote) = match self.market_context(&order.symbol).await {
            Ok(ctx) => ctx,
            Err(e) => {
                error!("❌ [STEALTH] {} {}: {}", names::ORDER_FAILED, order.symbol, e);
                reports.push(self.report(&order.symbol, None, ExecutionStatus::Failed, None, Some(order.lot_size), Some(e)));
                return;
            }
        };

        let jitter_pips = if self.config.max_jitter_pips > 0.0 {
            self.rng.gen_range(0.0..=self.config.max_jitter_pips)
        } else {
            0.0
        };
        let offset = slippage_offset(quote.spread(), jitter_pips, spec.pip_size);
        let (kind, price) = order_kind_and_price(order, side, &quote, offset);
        let price = round_price(price, spec.digits);
        // One quote tick of slack for the rounding above.
        let deviation = offset + 10f64.powi(-(spec.digits as i32));

        let lot = round_down_to_step(order.lot_size, spec.volume_step);
        let legs = self.ladder_legs(order, lot, &spec);

        for (volume, take_profit) in legs {
            let request = PlaceOrderRequest {
                symbol: order.symbol.clone(),
                kind,
                volume,
                price,
                stop_loss: order.stop_loss,
                take_profit,
                deviation: if kind.is_pending() { 0.0 } else { deviation },
                tag: self.config.ownership_tag.clone(),
                comment: order.comment.clone(),
            };

            match self.terminal.place_order(request).await {
                Ok(ack) if ack.filled => {
                    info!(
                        "✅ [STEALTH] {} {:?} {} {:.2} @ {} (#{})",
                        names::ORDER_PLACED,
                        kind,
                        order.symbol,
                        volume,
                        ack.price,
                        ack.ticket
                    );
                    self.tracker.add_position(TrackedPosition {
                        ticket: ack.ticket,
                        ownership_tag: self.config.ownership_tag.clone(),
                        signal_id: order.signal_id.clone(),
                        symbol: order.symbol.clone(),
                        side,
                        entry_price: ack.price,
                        stop_loss: order.stop_loss,
                        take_profit,
                        volume,
                        move_sl_to_breakeven: order.move_sl_to_breakeven,
                        breakeven_applied: false,
                        opened_at: Utc::now(),
                    });
                    reports.push(self.report(&order.symbol, Some(ack.ticket), ExecutionStatus::Placed, Some(ack.price), Some(volume), None));
                }
                Ok(ack) => {
                    info!(
                        "✅ [STEALTH] {} pending {:?} {} {:.2} @ {} (#{})",
                        names::ORDER_PLACED,
                        kind,
                        order.symbol,
                        volume,
                        ack.price,
                        ack.ticket
                    );
                    self.tracker.add_pending(PendingPlacement {
                        ticket: ack.ticket,
                        symbol: order.symbol.clone(),
                        signal_id: order.signal_id.clone(),
                        move_sl_to_breakeven: order.move_sl_to_breakeven,
                    });
                    reports.push(self.report(&order.symbol, Some(ack.ticket), ExecutionStatus::Placed, Some(ack.price), Some(volume), Some("pending".into())));
                }
                Err(e) => {
                    // Not retried: the channel is consumed regardless.
                    error!("❌ [STEALTH] {} {} {}: {}", names::ORDER_FAILED, self.account, order.symbol, e);
                    reports.push(self.report(&order.symbol, None, ExecutionStatus::Failed, Some(price), Some(volume), Some(e.to_string())));
                    return;
                }
            }
        }
    }

    /// Volume and TP per sub-position. With splitting on, one leg per TP
    /// level; otherwise a single leg carrying the first TP.
    fn ladder_legs(&self, order: &DispatchedOrder, lot: f64, spec: &SymbolSpec) -> Vec<(f64, Option<f64>)> {
        let first_tp = order.take_profits.first().copied();
        if order.take_profits.len() <= 1 {
            return vec![(lot, first_tp)];
        }
        if !self.config.split_take_profits {
            warn!(
                "[STEALTH] {} TP ladder of {} levels: only the first is attached",
                order.symbol,
                order.take_profits.len()
            );
            return vec![(lot, first_tp)];
        }
        match split_volume(lot, order.take_profits.len(), spec.volume_step, spec.volume_min) {
            Some(volumes) => volumes
                .into_iter()
                .zip(order.take_profits.iter().map(|tp| Some(*tp)))
                .collect(),
            None => {
                warn!(
                    "[STEALTH] {} lot {:.2} too small to split over {} TPs, using first TP only",
                    order.symbol,
                    lot,
                    order.take_profits.len()
                );
                vec![(lot, first_tp)]
            }
        }
    }

    async fn manage(&mut self, order: &DispatchedOrder, reports: &mut Vec<ExecutionReport>) {
        match order.intent {
            SignalIntent::Cancel => self.cancel_pending(&order.symbol, reports).await,
            SignalIntent::ModifySl => self.modify_stop_loss(order, reports).await,
            SignalIntent::ClosePartial => {
                self.close_partial(order, reports).await;
                if order.move_sl_to_breakeven {
                    self.modify_stop_loss(order, reports).await;
                }
            }
            SignalIntent::OpenTrade => {}
        }
    }

    async fn cancel_pending(&mut self, symbol: &str, reports: &mut Vec<ExecutionReport>) {
        let pending = match self.terminal.pending_orders().await {
            Ok(p) => p,
            Err(e) => {
                error!("❌ [STEALTH] {} cannot list pending orders: {}", self.account, e);
                reports.push(self.report(symbol, None, ExecutionStatus::Failed, None, None, Some(e.to_string())));
                return;
            }
        };

        let ours: Vec<_> = pending
            .into_iter()
            .filter(|o| o.tag == self.config.ownership_tag && o.symbol == symbol)
            .collect();
        if ours.is_empty() {
            debug!("[STEALTH] {} no pending {} orders to cancel", self.account, symbol);
            return;
        }

        for order in ours {
            match self.terminal.cancel_order(order.ticket).await {
                Ok(()) => {
                    self.tracker.remove_pending(order.ticket);
                    info!("🗑️ [STEALTH] Cancelled pending #{} {}", order.ticket, symbol);
                    reports.push(self.report(symbol, Some(order.ticket), ExecutionStatus::Cancelled, Some(order.price), Some(order.volume), None));
                }
                Err(e) => {
                    error!("❌ [STEALTH] Cancel #{} failed: {}", order.ticket, e);
                    reports.push(self.report(symbol, Some(order.ticket), ExecutionStatus::Failed, None, None, Some(e.to_string())));
                }
            }
        }
    }

    /// Breakeven, tighten by N pips, or an explicit new SL, in that order.
    async fn modify_stop_loss(&mut self, order: &DispatchedOrder, reports: &mut Vec<ExecutionReport>) {
        let positions = self.tracker.positions_for_symbol(&order.symbol);
        if positions.is_empty() {
            debug!("[STEALTH] {} no tracked {} positions to modify", self.account, order.symbol);
            return;
        }
        let spec = match self.terminal.symbol_spec(&order.symbol).await {
            Ok(spec) => spec,
            Err(e) => {
                reports.push(self.report(&order.symbol, None, ExecutionStatus::Failed, None, None, Some(e.to_string())));
                return;
            }
        };

        for position in positions {
            let (new_sl, to_breakeven) = if order.move_sl_to_breakeven {
                if position.stop_secures_entry() {
                    continue;
                }
                (position.entry_price, true)
            } else if let Some(pips) = order.sl_increase_pips {
                match position.stop_loss {
                    Some(sl) => (sl + position.side.sign() * pips * spec.pip_size, false),
                    None => continue,
                }
            } else if let Some(sl) = order.stop_loss {
                (sl, false)
            } else {
                reports.push(self.report(&order.symbol, Some(position.ticket), ExecutionStatus::Skipped, None, None, Some("no stop-loss change given".into())));
                continue;
            };
            let new_sl = round_price(new_sl, spec.digits);

            match self
                .terminal
                .modify_position(position.ticket, Some(new_sl), position.take_profit)
                .await
            {
                Ok(()) => {
                    if to_breakeven {
                        self.tracker.mark_breakeven(position.ticket);
                    } else {
                        self.tracker.set_stop_loss(position.ticket, Some(new_sl));
                    }
                    info!("🛠️ [STEALTH] #{} {} SL -> {}", position.ticket, position.symbol, new_sl);
                    reports.push(self.report(&position.symbol, Some(position.ticket), ExecutionStatus::Modified, Some(new_sl), Some(position.volume), None));
                }
                Err(e) => {
                    error!("❌ [STEALTH] Modify #{} failed: {}", position.ticket, e);
                    reports.push(self.report(&position.symbol, Some(position.ticket), ExecutionStatus::Failed, None, None, Some(e.to_string())));
                }
            }
        }
    }

    async fn close_partial(&mut self, order: &DispatchedOrder, reports: &mut Vec<ExecutionReport>) {
        let positions = self.tracker.positions_for_symbol(&order.symbol);
        if positions.is_empty() {
            debug!("[STEALTH] {} no tracked {} positions to close", self.account, order.symbol);
            return;
        }
        let spec = match self.terminal.symbol_spec(&order.symbol).await {
            Ok(spec) => spec,
            Err(e) => {
                reports.push(self.report(&order.symbol, None, ExecutionStatus::Failed, None, None, Some(e.to_string())));
                return;
            }
        };
        // A close without a percentage closes everything.
        let percent = if order.partial_close_percent > 0.0 {
            order.partial_close_percent
        } else {
            100.0
        };

        for position in positions {
            let volume = match partial_close_volume(position.volume, percent, spec.volume_step, spec.volume_min) {
                Ok(v) => v,
                Err(reason) => {
                    warn!("[STEALTH] #{} partial close rejected: {}", position.ticket, reason);
                    reports.push(self.report(&position.symbol, Some(position.ticket), ExecutionStatus::Skipped, None, Some(position.volume), Some(reason)));
                    continue;
                }
            };

            match self.terminal.close_position(position.ticket, volume).await {
                Ok(price) => {
                    let remaining = round_down_to_step(position.volume - volume, spec.volume_step);
                    if remaining <= 0.0 {
                        self.tracker.remove_position(position.ticket);
                        info!("🏁 [STEALTH] {} #{} {}", names::POSITION_CLOSED, position.ticket, position.symbol);
                        reports.push(self.report(&position.symbol, Some(position.ticket), ExecutionStatus::Closed, Some(price), Some(volume), None));
                    } else {
                        self.tracker.set_volume(position.ticket, remaining);
                        info!(
                            "✂️ [STEALTH] {} #{} {} closed {:.2}, {:.2} left",
                            names::PARTIAL_CLOSED,
                            position.ticket,
                            position.symbol,
                            volume,
                            remaining
                        );
                        reports.push(self.report(&position.symbol, Some(position.ticket), ExecutionStatus::PartiallyClosed, Some(price), Some(volume), None));
                    }
                }
                Err(e) => {
                    error!("❌ [STEALTH] Close #{} failed: {}", position.ticket, e);
                    reports.push(self.report(&position.symbol, Some(position.ticket), ExecutionStatus::Failed, None, Some(volume), Some(e.to_string())));
                }
            }
        }
    }

    async fn breakeven_check(&mut self, reports: &mut Vec<ExecutionReport>) {
        for position in self.tracker.get_all_positions() {
            if !position.move_sl_to_breakeven || position.breakeven_applied {
                continue;
            }
            let (spec, quote) = match self.market_context(&position.symbol).await {
                Ok(ctx) => ctx,
                Err(e) => {
                    debug!("[STEALTH] No market context for #{}: {}", position.ticket, e);
                    continue;
                }
            };
            let close_price = quote.close_price(position.side);
            if !position.needs_breakeven(close_price, spec.pip_size, self.config.breakeven_trigger_pips) {
                continue;
            }

            match self
                .terminal
                .modify_position(position.ticket, Some(position.entry_price), position.take_profit)
                .await
            {
                Ok(()) => {
                    self.tracker.mark_breakeven(position.ticket);
                    info!(
                        "🛡️ [STEALTH] {} #{} {} at +{:.1} pips",
                        names::BREAKEVEN_APPLIED,
                        position.ticket,
                        position.symbol,
                        position.profit_pips(close_price, spec.pip_size)
                    );
                    reports.push(self.report(&position.symbol, Some(position.ticket), ExecutionStatus::Modified, Some(position.entry_price), Some(position.volume), Some("breakeven".into())));
                }
                Err(e) => {
                    error!("❌ [STEALTH] Breakeven #{} failed: {}", position.ticket, e);
                }
            }
        }
    }

    async fn sync_positions(&mut self, reports: &mut Vec<ExecutionReport>) {
        let positions = match self.terminal.positions().await {
            Ok(p) => p,
            Err(e) => {
                warn!("[STEALTH] {} position sync skipped: {}", self.account, e);
                return;
            }
        };
        let pending = match self.terminal.pending_orders().await {
            Ok(p) => p,
            Err(e) => {
                warn!("[STEALTH] {} position sync skipped: {}", self.account, e);
                return;
            }
        };

        let sync = self.tracker.sync(&self.config.ownership_tag, &positions, &pending, true);
        for position in sync.closed {
            reports.push(self.report(&position.symbol, Some(position.ticket), ExecutionStatus::Closed, None, Some(position.volume), Some("closed on terminal".into())));
        }
    }
}

/// Terminal order kind and requested price. Slippage always works against
/// the trader: buys pay up, sells give up.
fn order_kind_and_price(order: &DispatchedOrder, side: Side, quote: &Quote, offset: f64) -> (OrderKind, f64) {
    let market = || match side {
        Side::Buy => (OrderKind::Buy, quote.fill_price(side) + offset),
        Side::Sell => (OrderKind::Sell, quote.fill_price(side) - offset),
    };

    let entry = match (order.order_type, order.entry) {
        (OrderType::Pending, Some(entry)) => entry,
        _ => return market(),
    };

    let kind = match (order.action, side) {
        (TradeAction::BuyStop, _) => OrderKind::BuyStop,
        (TradeAction::SellStop, _) => OrderKind::SellStop,
        (_, Side::Buy) if entry < quote.ask => OrderKind::BuyLimit,
        (_, Side::Buy) => OrderKind::BuyStop,
        (_, Side::Sell) if entry > quote.bid => OrderKind::SellLimit,
        (_, Side::Sell) => OrderKind::SellStop,
    };
    (kind, entry + side.sign() * offset)
}
