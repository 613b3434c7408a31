use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{info, warn};

use crate::constants::stealth::PRICE_EPSILON;
use crate::terminal::types::{PendingOrder, Side, TerminalPosition};

/// Open position the engine manages. Only positions carrying the engine's
/// ownership tag are ever tracked.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TrackedPosition {
    pub ticket: u64,
    pub ownership_tag: String,
    pub signal_id: String,
    pub symbol: String,
    pub side: Side,
    pub entry_price: f64,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    pub volume: f64,
    pub move_sl_to_breakeven: bool,
    pub breakeven_applied: bool,
    pub opened_at: DateTime<Utc>,
}

impl TrackedPosition {
    pub fn from_terminal(position: &TerminalPosition, signal_id: &str, move_sl_to_breakeven: bool) -> Self {
        Self {
            ticket: position.ticket,
            ownership_tag: position.tag.clone(),
            signal_id: signal_id.to_string(),
            symbol: position.symbol.clone(),
            side: position.side,
            entry_price: position.open_price,
            stop_loss: position.stop_loss,
            take_profit: position.take_profit,
            volume: position.volume,
            move_sl_to_breakeven,
            breakeven_applied: false,
            opened_at: Utc::now(),
        }
    }

    /// Unrealized profit in pips at `close_price`.
    pub fn profit_pips(&self, close_price: f64, pip_size: f64) -> f64 {
        if pip_size <= 0.0 {
            return 0.0;
        }
        (close_price - self.entry_price) * self.side.sign() / pip_size
    }

    /// Stop-loss at entry, or already past it on the profit side.
    pub fn stop_secures_entry(&self) -> bool {
        match self.stop_loss {
            Some(sl) => (sl - self.entry_price) * self.side.sign() >= -PRICE_EPSILON,
            None => false,
        }
    }

    /// Breakeven guard: enabled, not yet applied, stop not already at entry,
    /// and profit at or past the trigger.
    pub fn needs_breakeven(&self, close_price: f64, pip_size: f64, trigger_pips: f64) -> bool {
        self.move_sl_to_breakeven
            && !self.breakeven_applied
            && !self.stop_secures_entry()
            && self.profit_pips(close_price, pip_size) >= trigger_pips
    }
}

/// Pending order placed by the engine, waiting to fill.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PendingPlacement {
    pub ticket: u64,
    pub symbol: String,
    pub signal_id: String,
    pub move_sl_to_breakeven: bool,
}

/// What one reconciliation with the terminal changed.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SyncReport {
    pub adopted: Vec<u64>,
    pub closed: Vec<TrackedPosition>,
    pub dropped_pending: Vec<u64>,
}

#[derive(Default)]
struct TrackerState {
    positions: BTreeMap<u64, TrackedPosition>,
    pending: BTreeMap<u64, PendingPlacement>,
}

#[derive(Clone, Default)]
pub struct PositionTracker {
    state: Arc<Mutex<TrackerState>>,
}

impl PositionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add_position(&self, position: TrackedPosition) {
        info!(
            "📊 [TRACKER] Added #{} {} {:?} {:.2} @ {} (SL: {:?}, TP: {:?})",
            position.ticket,
            position.symbol,
            position.side,
            position.volume,
            position.entry_price,
            position.stop_loss,
            position.take_profit
        );
        let mut state = self.lock();
        state.pending.remove(&position.ticket);
        state.positions.insert(position.ticket, position);
    }

    pub fn add_pending(&self, pending: PendingPlacement) {
        info!("📊 [TRACKER] Pending #{} {} awaiting fill", pending.ticket, pending.symbol);
        self.lock().pending.insert(pending.ticket, pending);
    }

    pub fn remove_position(&self, ticket: u64) -> Option<TrackedPosition> {
        let removed = self.lock().positions.remove(&ticket);
        if removed.is_some() {
            info!("📊 [TRACKER] Removed position #{}", ticket);
        }
        removed
    }

    pub fn remove_pending(&self, ticket: u64) -> Option<PendingPlacement> {
        self.lock().pending.remove(&ticket)
    }

    pub fn get_position(&self, ticket: u64) -> Option<TrackedPosition> {
        self.lock().positions.get(&ticket).cloned()
    }

    pub fn has_position(&self, ticket: u64) -> bool {
        self.lock().positions.contains_key(&ticket)
    }

    pub fn get_all_positions(&self) -> Vec<TrackedPosition> {
        self.lock().positions.values().cloned().collect()
    }

    pub fn get_all_pending(&self) -> Vec<PendingPlacement> {
        self.lock().pending.values().cloned().collect()
    }

    pub fn positions_for_symbol(&self, symbol: &str) -> Vec<TrackedPosition> {
        self.lock()
            .positions
            .values()
            .filter(|p| p.symbol == symbol)
            .cloned()
            .collect()
    }

    pub fn set_stop_loss(&self, ticket: u64, stop_loss: Option<f64>) {
        if let Some(p) = self.lock().positions.get_mut(&ticket) {
            p.stop_loss = stop_loss;
        }
    }

    pub fn mark_breakeven(&self, ticket: u64) {
        if let Some(p) = self.lock().positions.get_mut(&ticket) {
            p.stop_loss = Some(p.entry_price);
            p.breakeven_applied = true;
        }
    }

    pub fn set_volume(&self, ticket: u64, volume: f64) {
        if let Some(p) = self.lock().positions.get_mut(&ticket) {
            p.volume = volume;
        }
    }

    /// Reconcile with the terminal's view. Filled pending placements and
    /// untracked positions carrying `ownership_tag` are adopted; tracked
    /// positions the terminal no longer reports are closed and removed;
    /// placements that vanished without filling are dropped. Positions with
    /// another tag are never touched.
    pub fn sync(
        &self,
        ownership_tag: &str,
        terminal_positions: &[TerminalPosition],
        terminal_pending: &[PendingOrder],
        default_breakeven: bool,
    ) -> SyncReport {
        let mut report = SyncReport::default();
        let mut state = self.lock();

        let owned: Vec<&TerminalPosition> = terminal_positions
            .iter()
            .filter(|p| p.tag == ownership_tag)
            .collect();
        let live: HashSet<u64> = owned.iter().map(|p| p.ticket).collect();

        for position in &owned {
            match state.positions.get_mut(&position.ticket) {
                Some(tracked) => {
                    // Terminal is the source of truth for volume and levels.
                    tracked.volume = position.volume;
                    tracked.stop_loss = position.stop_loss;
                    tracked.take_profit = position.take_profit;
                }
                None => {
                    let (signal_id, breakeven) = match state.pending.remove(&position.ticket) {
                        Some(p) => (p.signal_id, p.move_sl_to_breakeven),
                        None => {
                            warn!(
                                "⚠️  [TRACKER] Adopting untracked #{} {} carrying our tag",
                                position.ticket, position.symbol
                            );
                            (String::new(), default_breakeven)
                        }
                    };
                    let tracked = TrackedPosition::from_terminal(position, &signal_id, breakeven);
                    info!("📊 [TRACKER] Adopted #{} {}", tracked.ticket, tracked.symbol);
                    state.positions.insert(tracked.ticket, tracked);
                    report.adopted.push(position.ticket);
                }
            }
        }

        let gone: Vec<u64> = state
            .positions
            .keys()
            .filter(|t| !live.contains(t))
            .copied()
            .collect();
        for ticket in gone {
            if let Some(p) = state.positions.remove(&ticket) {
                info!("🏁 [TRACKER] #{} {} closed on terminal", ticket, p.symbol);
                report.closed.push(p);
            }
        }

        let resting: HashSet<u64> = terminal_pending.iter().map(|o| o.ticket).collect();
        let vanished: Vec<u64> = state
            .pending
            .keys()
            .filter(|t| !resting.contains(t))
            .copied()
            .collect();
        for ticket in vanished {
            state.pending.remove(&ticket);
            report.dropped_pending.push(ticket);
        }

        report
    }
}
