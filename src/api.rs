use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::info;

use crate::config::AppConfig;
use crate::error::Rejection;
use crate::events::RawAlert;
use crate::services::journal::TradeJournal;
use crate::services::pipeline::SignalPipeline;
use crate::services::rules::ManualRule;
use crate::terminal::PaperTerminal;

pub struct AppState {
    pub pipeline: Arc<SignalPipeline>,
    pub journal: TradeJournal,
    /// Paper terminals of the running engines; quotes posted to the API are
    /// fanned out to all of them.
    pub paper_terminals: Vec<PaperTerminal>,
    pub config: AppConfig,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/alerts", post(submit_alert))
        .route("/confirmations", get(list_confirmations))
        .route("/confirmations/{id}", post(confirm_order))
        .route("/channels/{account}", get(get_channel))
        .route("/rules", get(list_rules).post(upsert_rule))
        .route("/quotes", post(post_quote))
        .route("/report", get(get_report))
        .with_state(state)
}

pub async fn run_server(state: Arc<AppState>) -> std::io::Result<()> {
    let bind = state.config.api.bind.clone();
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(&bind).await?;
    info!("API Server listening on {}", bind);
    axum::serve(listener, app).await
}

fn rejection_response(rejection: &Rejection) -> axum::response::Response {
    let status = match rejection {
        Rejection::DuplicateSignal { .. } => StatusCode::CONFLICT,
        Rejection::ConfirmationNotFound { .. } => StatusCode::NOT_FOUND,
        Rejection::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        _ => StatusCode::UNPROCESSABLE_ENTITY,
    };
    (
        status,
        Json(json!({
            "reason_code": rejection.reason_code(),
            "message": rejection.to_string(),
            "confidence": rejection.confidence(),
            "pip_distance": rejection.pip_distance(),
        })),
    )
        .into_response()
}

async fn health() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

async fn submit_alert(State(state): State<Arc<AppState>>, Json(alert): Json<RawAlert>) -> impl IntoResponse {
    match state.pipeline.process(&alert) {
        Ok(outcome) => (StatusCode::OK, Json(outcome)).into_response(),
        Err(rejection) => rejection_response(&rejection),
    }
}

async fn list_confirmations(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.pipeline.dispatcher().pending_confirmations() {
        Ok(pending) => Json(pending).into_response(),
        Err(rejection) => rejection_response(&rejection),
    }
}

async fn confirm_order(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> impl IntoResponse {
    match state.pipeline.confirm(&id) {
        Ok(outcome) => Json(outcome).into_response(),
        Err(rejection) => rejection_response(&rejection),
    }
}

async fn get_channel(State(state): State<Arc<AppState>>, Path(account): Path<String>) -> impl IntoResponse {
    if !state.config.accounts.contains_key(&account) {
        return (StatusCode::NOT_FOUND, format!("Unknown account {}", account)).into_response();
    }
    match state.pipeline.dispatcher().channel().raw(&account) {
        Ok(raw) => {
            let content = raw
                .as_deref()
                .and_then(|r| serde_json::from_str::<serde_json::Value>(r).ok())
                .unwrap_or_else(|| json!({}));
            Json(json!({"account": account, "content": content})).into_response()
        }
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

async fn list_rules(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.pipeline.rules().rules())
}

async fn upsert_rule(State(state): State<Arc<AppState>>, Json(rule): Json<ManualRule>) -> impl IntoResponse {
    let id = rule.id.clone();
    match state.pipeline.rules().upsert(rule) {
        Ok(()) => Json(json!({"status": "ok", "id": id})).into_response(),
        Err(e) => (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
    }
}

#[derive(Deserialize)]
struct QuoteUpdate {
    symbol: String,
    bid: f64,
    ask: f64,
}

async fn post_quote(State(state): State<Arc<AppState>>, Json(update): Json<QuoteUpdate>) -> impl IntoResponse {
    if update.bid <= 0.0 || update.ask < update.bid {
        return (StatusCode::BAD_REQUEST, "bid must be positive and not above ask").into_response();
    }
    for terminal in &state.paper_terminals {
        terminal.set_quote(&update.symbol.to_uppercase(), update.bid, update.ask);
    }
    Json(json!({"status": "ok", "terminals": state.paper_terminals.len()})).into_response()
}

async fn get_report(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.journal.summary())
}
