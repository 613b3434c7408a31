use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, PoisonError},
};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::{
    bus::EventBus,
    error::{Rejection, StoreError},
    events::{Delivery, DispatchOutcome, Event, ExecutionReport, ExecutionStatus},
};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JournalEntry {
    pub ts: String,

    /// "dispatched" | "shadow" | "awaiting_confirmation" | "rejected" | "execution"
    pub kind: String,

    pub account: Option<String>,
    pub channel_id: Option<String>,
    pub symbol: Option<String>,
    pub action: Option<String>,

    /// Reason code for rejections, execution status otherwise
    pub status: Option<String>,

    pub lot: Option<f64>,
    pub price: Option<f64>,
    pub ticket: Option<u64>,

    /// Extra context (best-effort)
    pub notes: Option<String>,
}

/// Per-source-channel provider statistics.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ChannelStats {
    pub parsed: u64,
    pub accepted: u64,
    pub rejected: u64,
    pub duplicates: u64,
    pub confidence_sum: f64,
}

impl ChannelStats {
    pub fn average_confidence(&self) -> f64 {
        if self.parsed == 0 {
            0.0
        } else {
            self.confidence_sum / self.parsed as f64
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct JournalSummary {
    pub total_parsed: u64,
    pub total_dispatched: u64,
    pub total_shadow: u64,
    pub total_awaiting_confirmation: u64,
    pub total_rejected: u64,
    pub total_duplicates: u64,
    pub total_exec_reports: u64,

    /// Rejection counts by reason code
    pub per_reason: HashMap<String, u64>,

    /// Accepted order counts by symbol
    pub per_symbol: HashMap<String, u64>,

    pub per_channel: HashMap<String, ChannelStats>,

    /// Execution report counts by status
    pub per_execution_status: HashMap<String, u64>,
}

/// Journal of everything the pipeline and the engines decide: a JSONL line
/// per event plus a summary rewritten next to it.
#[derive(Clone)]
pub struct TradeJournal {
    summary: Arc<Mutex<JournalSummary>>,
    log_path: PathBuf,
}

impl TradeJournal {
    pub fn new(log_path: PathBuf) -> Self {
        Self {
            summary: Arc::new(Mutex::new(JournalSummary::default())),
            log_path,
        }
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    pub fn summary_path(&self) -> PathBuf {
        self.log_path.with_file_name("journal_summary.json")
    }

    pub fn summary(&self) -> JournalSummary {
        self.summary.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub async fn start(&self, event_bus: EventBus) {
        let mut rx = event_bus.subscribe();
        let journal = self.clone();

        tokio::spawn(async move {
            info!("📒 [JOURNAL] Started (log: {})", journal.log_path.display());

            loop {
                match rx.recv().await {
                    Ok(event) => {
                        journal.record(&event);
                        if let Err(e) = journal.flush_summary() {
                            error!("❌ [JOURNAL] Failed to flush summary: {}", e);
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        error!("❌ [JOURNAL] Lagged, {} events not journaled", n);
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    /// Fold one event into the summary and append its journal line.
    pub fn record(&self, event: &Event) {
        let entry = match event {
            Event::Parsed(signal) => {
                let mut s = self.lock();
                s.total_parsed += 1;
                let channel = s.per_channel.entry(signal.channel_id.clone()).or_default();
                channel.parsed += 1;
                channel.confidence_sum += signal.confidence;
                None
            }
            Event::Dispatched(outcome) => Some(self.on_dispatched(outcome)),
            Event::Rejected {
                channel_id,
                account,
                rejection,
            } => Some(self.on_rejected(channel_id, account.as_deref(), rejection)),
            Event::Execution(report) => Some(self.on_execution(report)),
        };

        if let Some(entry) = entry {
            if let Err(e) = self.append_jsonl(&entry) {
                error!("❌ [JOURNAL] Failed to append entry: {}", e);
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, JournalSummary> {
        self.summary.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn on_dispatched(&self, outcome: &DispatchOutcome) -> JournalEntry {
        let kind = match &outcome.delivery {
            Delivery::Channel => "dispatched",
            Delivery::Shadow => "shadow",
            Delivery::AwaitingConfirmation { .. } => "awaiting_confirmation",
        };

        let mut s = self.lock();
        match &outcome.delivery {
            Delivery::Channel => s.total_dispatched += 1,
            Delivery::Shadow => s.total_shadow += 1,
            Delivery::AwaitingConfirmation { .. } => s.total_awaiting_confirmation += 1,
        }
        *s.per_symbol.entry(outcome.order.symbol.clone()).or_insert(0) += 1;
        if !outcome.channel_id.is_empty() {
            s.per_channel.entry(outcome.channel_id.clone()).or_default().accepted += 1;
        }
        drop(s);

        let order = &outcome.order;
        JournalEntry {
            ts: Utc::now().to_rfc3339(),
            kind: kind.to_string(),
            account: Some(outcome.account.clone()),
            channel_id: Some(outcome.channel_id.clone()),
            symbol: Some(order.symbol.clone()),
            action: Some(order.action.as_str().to_string()),
            status: Some(format!("{:?}", order.intent).to_lowercase()),
            lot: Some(order.lot_size),
            price: order.entry,
            ticket: None,
            notes: Some(match &outcome.delivery {
                Delivery::AwaitingConfirmation { confirmation_id } => format!("confirmation={}", confirmation_id),
                _ => format!(
                    "sl={:?} tp={:?} pips={:?} risk={:?}",
                    order.stop_loss, order.take_profits, order.pip_distance, order.risk_amount
                ),
            }),
        }
    }

    fn on_rejected(&self, channel_id: &str, account: Option<&str>, rejection: &Rejection) -> JournalEntry {
        let mut s = self.lock();
        let duplicate = matches!(rejection, Rejection::DuplicateSignal { .. });
        if duplicate {
            s.total_duplicates += 1;
        } else {
            s.total_rejected += 1;
        }
        *s.per_reason.entry(rejection.reason_code().to_string()).or_insert(0) += 1;
        if !channel_id.is_empty() {
            let channel = s.per_channel.entry(channel_id.to_string()).or_default();
            if duplicate {
                channel.duplicates += 1;
            } else {
                channel.rejected += 1;
            }
        }
        drop(s);

        JournalEntry {
            ts: Utc::now().to_rfc3339(),
            kind: "rejected".to_string(),
            account: account.map(str::to_string),
            channel_id: Some(channel_id.to_string()),
            symbol: None,
            action: None,
            status: Some(rejection.reason_code().to_string()),
            lot: None,
            price: None,
            ticket: None,
            notes: Some(rejection.to_string()),
        }
    }

    fn on_execution(&self, report: &ExecutionReport) -> JournalEntry {
        let status = execution_status_name(report.status);
        let mut s = self.lock();
        s.total_exec_reports += 1;
        *s.per_execution_status.entry(status.to_string()).or_insert(0) += 1;
        drop(s);

        JournalEntry {
            ts: Utc::now().to_rfc3339(),
            kind: "execution".to_string(),
            account: Some(report.account.clone()),
            channel_id: None,
            symbol: Some(report.symbol.clone()),
            action: None,
            status: Some(status.to_string()),
            lot: report.volume,
            price: report.price,
            ticket: report.ticket,
            notes: report.detail.clone(),
        }
    }

    fn append_jsonl(&self, entry: &JournalEntry) -> Result<(), StoreError> {
        use std::io::Write;

        if let Some(parent) = self.log_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut f = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)?;

        let line = serde_json::to_string(entry)?;
        writeln!(f, "{}", line)?;
        Ok(())
    }

    pub fn flush_summary(&self) -> Result<(), StoreError> {
        let summary_path = self.summary_path();

        if let Some(parent) = summary_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let s = self.summary();
        std::fs::write(summary_path, serde_json::to_vec_pretty(&s)?)?;
        Ok(())
    }
}

fn execution_status_name(status: ExecutionStatus) -> &'static str {
    match status {
        ExecutionStatus::Placed => "placed",
        ExecutionStatus::Failed => "failed",
        ExecutionStatus::Modified => "modified",
        ExecutionStatus::PartiallyClosed => "partially_closed",
        ExecutionStatus::Cancelled => "cancelled",
        ExecutionStatus::Closed => "closed",
        ExecutionStatus::Skipped => "skipped",
    }
}
