//! HTTP surface: health, cost reporting, completions and key issuance.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::costing::{micros_to_usd, usd_to_micros};
use crate::error::GatewayError;
use crate::gateway::{
    CACHE_HINT_HEADER_PREFIX, CompletionRequest, Gateway, ObservabilitySnapshot,
};
use crate::issuance;
use crate::keys::ResetPeriod;
use crate::ledger::LedgerEntry;
#[cfg(feature = "store-redis")]
use crate::redis_store::RedisStore;
use crate::state_file::KeyStateFile;

static REQUEST_ID_SEQ: AtomicU64 = AtomicU64::new(0);

#[derive(Clone)]
pub struct GatewayHttpState {
    gateway: Arc<Gateway>,
    admin_token: Option<String>,
    state_file: Option<PathBuf>,
    #[cfg(feature = "store-redis")]
    redis_store: Option<RedisStore>,
    json_logs: bool,
}

impl GatewayHttpState {
    pub fn new(gateway: Gateway) -> Self {
        Self {
            gateway: Arc::new(gateway),
            admin_token: None,
            state_file: None,
            #[cfg(feature = "store-redis")]
            redis_store: None,
            json_logs: false,
        }
    }

    pub fn with_admin_token(mut self, token: impl Into<String>) -> Self {
        self.admin_token = Some(token.into());
        self
    }

    pub fn with_state_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.state_file = Some(path.into());
        self
    }

    #[cfg(feature = "store-redis")]
    pub fn with_redis_store(mut self, store: RedisStore) -> Self {
        self.redis_store = Some(store);
        self
    }

    pub fn with_json_logs(mut self) -> Self {
        self.json_logs = true;
        self
    }
}

#[derive(Debug, Serialize)]
struct ErrorDetail {
    code: &'static str,
    message: String,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: ErrorDetail,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Serialize)]
struct CostReport {
    total_usd: f64,
    total_usd_micros: u64,
    per_model: BTreeMap<String, f64>,
    last_reset_ms: u64,
}

impl CostReport {
    fn from_entry(entry: LedgerEntry) -> Self {
        Self {
            total_usd: micros_to_usd(entry.total_usd_micros),
            total_usd_micros: entry.total_usd_micros,
            per_model: entry
                .per_model
                .into_iter()
                .map(|(model, micros)| (model, micros_to_usd(micros)))
                .collect(),
            last_reset_ms: entry.last_reset_ms,
        }
    }
}

#[derive(Debug, Deserialize)]
struct KeyNewRequest {
    #[serde(default)]
    total_budget: Option<f64>,
    #[serde(default)]
    duration: Option<ResetPeriod>,
}

#[derive(Debug, Serialize)]
struct KeyNewResponse {
    api_key: String,
    total_budget: f64,
    duration: &'static str,
}

pub fn router(state: GatewayHttpState) -> Router {
    let mut router = Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/cost/current", get(cost_current))
        .route("/cost/reset", get(cost_reset))
        .route("/chat/completions", post(chat_completions));

    if state.admin_token.is_some() {
        router = router.route("/key/new", post(key_new));
    }

    router.with_state(state)
}

async fn health(
    State(state): State<GatewayHttpState>,
) -> Result<Json<HealthResponse>, (StatusCode, Json<ErrorResponse>)> {
    state.gateway.ledger().ping().await.map_err(|err| {
        error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "storage_error",
            err.to_string(),
        )
    })?;
    Ok(Json(HealthResponse { status: "ok" }))
}

async fn metrics(State(state): State<GatewayHttpState>) -> Json<ObservabilitySnapshot> {
    Json(state.gateway.observability())
}

async fn cost_current(
    State(state): State<GatewayHttpState>,
    headers: HeaderMap,
) -> Result<Json<CostReport>, (StatusCode, Json<ErrorResponse>)> {
    let token = require_user_key(&state, &headers)?;
    let entry = state
        .gateway
        .ledger()
        .current_spend(&token)
        .await
        .map_err(map_gateway_error)?;
    Ok(Json(CostReport::from_entry(entry)))
}

async fn cost_reset(
    State(state): State<GatewayHttpState>,
    headers: HeaderMap,
) -> Result<Json<CostReport>, (StatusCode, Json<ErrorResponse>)> {
    let token = require_user_key(&state, &headers)?;
    let entry = state
        .gateway
        .ledger()
        .reset(&token)
        .await
        .map_err(map_gateway_error)?;
    emit_json_log(
        &state,
        "cost.reset",
        serde_json::json!({ "key": redact_token(&token) }),
    );
    Ok(Json(CostReport::from_entry(entry)))
}

async fn chat_completions(
    State(state): State<GatewayHttpState>,
    headers: HeaderMap,
    Json(payload): Json<Value>,
) -> Result<Json<Value>, (StatusCode, Json<ErrorResponse>)> {
    let token = require_user_key(&state, &headers)?;
    let model = payload
        .get("model")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| {
            error_response(
                StatusCode::BAD_REQUEST,
                "invalid_request",
                "missing model in request payload",
            )
        })?;

    let request_id = extract_header(&headers, "x-request-id").unwrap_or_else(generate_request_id);
    emit_json_log(
        &state,
        "completion.request",
        serde_json::json!({
            "request_id": &request_id,
            "key": redact_token(&token),
            "model": &model,
        }),
    );

    let request = CompletionRequest {
        token,
        model,
        payload,
        cache_hints: collect_cache_hints(&headers),
    };

    match state.gateway.handle(request).await {
        Ok(body) => {
            emit_json_log(
                &state,
                "completion.response",
                serde_json::json!({ "request_id": &request_id }),
            );
            Ok(Json(body))
        }
        Err(err) => {
            emit_json_log(
                &state,
                "completion.error",
                serde_json::json!({
                    "request_id": &request_id,
                    "error": err.to_string(),
                }),
            );
            Err(map_gateway_error(err))
        }
    }
}

async fn key_new(
    State(state): State<GatewayHttpState>,
    headers: HeaderMap,
    Json(payload): Json<KeyNewRequest>,
) -> Result<Json<KeyNewResponse>, (StatusCode, Json<ErrorResponse>)> {
    ensure_admin(&state, &headers)?;

    let total_budget = payload.total_budget.ok_or_else(|| {
        error_response(
            StatusCode::BAD_REQUEST,
            "invalid_budget",
            "missing total_budget",
        )
    })?;
    let total_usd_micros = usd_to_micros(total_budget).ok_or_else(|| {
        error_response(
            StatusCode::BAD_REQUEST,
            "invalid_budget",
            format!("total_budget must be a non-negative finite number, got {total_budget}"),
        )
    })?;
    let period = payload.duration.unwrap_or(ResetPeriod::Monthly);

    let key = issuance::issue(state.gateway.keys(), total_usd_micros, period)
        .map_err(map_gateway_error)?;
    persist_keys(&state, &key).await?;

    emit_json_log(
        &state,
        "admin.key.issued",
        serde_json::json!({
            "key": redact_token(&key.token),
            "total_usd_micros": total_usd_micros,
            "duration": period.as_str(),
        }),
    );

    Ok(Json(KeyNewResponse {
        api_key: key.token,
        total_budget,
        duration: period.as_str(),
    }))
}

fn require_user_key(
    state: &GatewayHttpState,
    headers: &HeaderMap,
) -> Result<String, (StatusCode, Json<ErrorResponse>)> {
    let token = extract_bearer(headers).ok_or_else(|| {
        error_response(StatusCode::UNAUTHORIZED, "unauthorized", "missing api key")
    })?;
    if !state.gateway.keys().is_valid(&token) {
        return Err(error_response(
            StatusCode::UNAUTHORIZED,
            "unauthorized",
            "unauthorized api key",
        ));
    }
    Ok(token)
}

fn ensure_admin(
    state: &GatewayHttpState,
    headers: &HeaderMap,
) -> Result<(), (StatusCode, Json<ErrorResponse>)> {
    let Some(expected) = state.admin_token.as_deref() else {
        return Err(error_response(
            StatusCode::NOT_FOUND,
            "not_configured",
            "admin auth not configured",
        ));
    };

    let provided = extract_bearer(headers)
        .or_else(|| extract_header(headers, "x-admin-token"))
        .unwrap_or_default();
    if provided != expected {
        return Err(error_response(
            StatusCode::UNAUTHORIZED,
            "unauthorized",
            "invalid admin token",
        ));
    }
    Ok(())
}

async fn persist_keys(
    state: &GatewayHttpState,
    #[allow(unused_variables)] key: &crate::keys::ApiKey,
) -> Result<(), (StatusCode, Json<ErrorResponse>)> {
    #[cfg(feature = "store-redis")]
    if let Some(store) = state.redis_store.as_ref() {
        return store.save_key(key).await.map_err(map_gateway_error);
    }

    if let Some(path) = state.state_file.as_ref() {
        KeyStateFile {
            keys: state.gateway.keys().list(),
        }
        .save(path)
        .map_err(|err| {
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "storage_error",
                err.to_string(),
            )
        })?;
    }
    Ok(())
}

fn extract_header(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn extract_bearer(headers: &HeaderMap) -> Option<String> {
    let auth = headers
        .get("authorization")
        .and_then(|value| value.to_str().ok())?
        .trim()
        .to_string();
    let rest = auth
        .strip_prefix("Bearer ")
        .or_else(|| auth.strip_prefix("bearer "))?;
    let token = rest.trim();
    (!token.is_empty()).then(|| token.to_string())
}

fn collect_cache_hints(headers: &HeaderMap) -> BTreeMap<String, String> {
    let mut hints = BTreeMap::new();
    for (name, value) in headers.iter() {
        if !name.as_str().starts_with(CACHE_HINT_HEADER_PREFIX) {
            continue;
        }
        let Ok(value) = value.to_str() else {
            continue;
        };
        hints.insert(name.as_str().to_string(), value.to_string());
    }
    hints
}

fn map_gateway_error(err: GatewayError) -> (StatusCode, Json<ErrorResponse>) {
    match err {
        GatewayError::Unauthorized => error_response(
            StatusCode::UNAUTHORIZED,
            "unauthorized",
            "unauthorized api key",
        ),
        GatewayError::UnknownKey => error_response(
            StatusCode::UNAUTHORIZED,
            "unknown_key",
            "no budget policy registered for key",
        ),
        GatewayError::BudgetExceeded {
            limit_usd_micros,
            spent_usd_micros,
        } => error_response(
            StatusCode::PAYMENT_REQUIRED,
            "budget_exceeded",
            format!(
                "budget exceeded: limit_usd_micros={limit_usd_micros} spent_usd_micros={spent_usd_micros}"
            ),
        ),
        GatewayError::InvalidCost { reason } => {
            error_response(StatusCode::BAD_REQUEST, "invalid_cost", reason)
        }
        GatewayError::InvalidBudget { reason } => {
            error_response(StatusCode::BAD_REQUEST, "invalid_budget", reason)
        }
        GatewayError::DuplicateKey => error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "registration_conflict",
            "api key already registered",
        ),
        GatewayError::Backend { message } => {
            error_response(StatusCode::BAD_GATEWAY, "backend_error", message)
        }
        GatewayError::Store { message } => {
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "storage_error", message)
        }
    }
}

fn error_response(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> (StatusCode, Json<ErrorResponse>) {
    (
        status,
        Json(ErrorResponse {
            error: ErrorDetail {
                code,
                message: message.into(),
            },
        }),
    )
}

fn generate_request_id() -> String {
    let seq = REQUEST_ID_SEQ.fetch_add(1, Ordering::Relaxed);
    let ts_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis())
        .unwrap_or(0);
    format!("spendgate-{ts_ms}-{seq}")
}

fn emit_json_log(state: &GatewayHttpState, event: &str, payload: serde_json::Value) {
    if !state.json_logs {
        return;
    }

    let record = serde_json::json!({
        "ts_ms": SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|duration| duration.as_millis())
            .unwrap_or(0),
        "event": event,
        "payload": payload,
    });
    eprintln!("{record}");
}

fn redact_token(token: &str) -> String {
    let visible: String = token.chars().take(10).collect();
    format!("{visible}…")
}

#[cfg(test)]
mod admin_auth_tests {
    use super::*;
    use crate::gateway::{Backend, CompletionOutcome};
    use crate::keys::KeyStore;
    use crate::ledger::{CostLedger, MemoryLedger};
    use async_trait::async_trait;

    struct NullBackend;

    #[async_trait]
    impl Backend for NullBackend {
        async fn complete(
            &self,
            _request: &CompletionRequest,
        ) -> Result<CompletionOutcome, GatewayError> {
            Err(GatewayError::Backend {
                message: "no backend configured".to_string(),
            })
        }
    }

    fn test_state() -> GatewayHttpState {
        let gateway = Gateway::new(
            Arc::new(KeyStore::new()),
            Arc::new(MemoryLedger::new()) as Arc<dyn CostLedger>,
            Arc::new(NullBackend),
        );
        GatewayHttpState::new(gateway)
    }

    #[test]
    fn ensure_admin_rejects_when_not_configured() {
        let state = test_state();
        let headers = HeaderMap::new();
        let (status, Json(body)) = ensure_admin(&state, &headers).unwrap_err();
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body.error.code, "not_configured");
    }

    #[test]
    fn ensure_admin_rejects_wrong_token() {
        let state = test_state().with_admin_token("admin-token");
        let mut headers = HeaderMap::new();
        headers.insert("authorization", "Bearer nope".parse().unwrap());
        let (status, Json(body)) = ensure_admin(&state, &headers).unwrap_err();
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body.error.code, "unauthorized");
    }

    #[test]
    fn ensure_admin_accepts_bearer_and_header_forms() {
        let state = test_state().with_admin_token("admin-token");

        let mut headers = HeaderMap::new();
        headers.insert("authorization", "Bearer admin-token".parse().unwrap());
        ensure_admin(&state, &headers).expect("bearer");

        let mut headers = HeaderMap::new();
        headers.insert("x-admin-token", "admin-token".parse().unwrap());
        ensure_admin(&state, &headers).expect("header");
    }

    #[test]
    fn cache_hints_are_prefix_filtered() {
        let mut headers = HeaderMap::new();
        headers.insert("x-spendgate-cache-ttl", "60".parse().unwrap());
        headers.insert("x-spendgate-cache-scope", "team".parse().unwrap());
        headers.insert("x-request-id", "abc".parse().unwrap());
        headers.insert("authorization", "Bearer sk-x".parse().unwrap());

        let hints = collect_cache_hints(&headers);
        assert_eq!(hints.len(), 2);
        assert_eq!(hints.get("x-spendgate-cache-ttl").map(String::as_str), Some("60"));
        assert_eq!(
            hints.get("x-spendgate-cache-scope").map(String::as_str),
            Some("team")
        );
    }
}
