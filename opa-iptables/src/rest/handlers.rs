use std::sync::Arc;

use axum::{
    Json,
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};
use utoipa::{IntoParams, ToSchema};

use crate::api::RuleService;
use crate::clients::RuleSource;
use crate::error::{ApplyError, BatchError, Operation, PolicyError, WatcherError};
use crate::rule::RuleSet;
use crate::watcher::{TargetStatus, WatchTarget, WatcherHandle};

/// Shared application state
pub struct AppState {
    pub rules: RuleService,
    pub source: Arc<dyn RuleSource>,
    /// `None` when the watcher is disabled.
    pub watcher: Option<WatcherHandle>,
}

/// API error response
#[derive(Debug, Serialize, ToSchema)]
pub struct ApiError {
    pub error: String,
    pub code: u32,
}

impl ApiError {
    fn new(code: u32, error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            code,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let status = match self.code {
            400 => StatusCode::BAD_REQUEST,
            409 => StatusCode::CONFLICT,
            502 => StatusCode::BAD_GATEWAY,
            503 => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(self)).into_response()
    }
}

impl From<PolicyError> for ApiError {
    fn from(e: PolicyError) -> Self {
        match e {
            PolicyError::Decode(_) | PolicyError::InvalidPath(_) => {
                ApiError::new(400, e.to_string())
            }
            _ => ApiError::new(502, e.to_string()),
        }
    }
}

impl From<BatchError> for ApiError {
    fn from(e: BatchError) -> Self {
        ApiError::new(500, e.to_string())
    }
}

impl From<ApplyError> for ApiError {
    fn from(e: ApplyError) -> Self {
        ApiError::new(500, e.to_string())
    }
}

impl From<WatcherError> for ApiError {
    fn from(e: WatcherError) -> Self {
        ApiError::new(503, e.to_string())
    }
}

/// Result of a rule operation
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct RuleOpResponse {
    pub message: String,
    pub rules: usize,
    /// Set when the document path is now watched.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub watched: bool,
}

/// Query parameters of the insert and delete endpoints
#[derive(Debug, Deserialize, IntoParams)]
pub struct RuleQuery {
    /// Policy document path
    pub q: String,
    /// Keep the document reconciled by the watcher (insert only)
    #[serde(default)]
    pub watch: bool,
}

/// Query parameters of the JSON endpoint
#[derive(Debug, Deserialize, IntoParams)]
pub struct JsonQuery {
    /// Operation to perform, defaults to insert
    pub op: Option<Operation>,
}

/// Request bodies carry the query input; an empty body means no input.
fn parse_input(body: &Bytes) -> Result<Value, ApiError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(Value::Null);
    }
    serde_json::from_slice(body).map_err(|e| ApiError::new(400, format!("invalid input: {e}")))
}

// === Version ===

/// Version information
#[derive(Serialize, ToSchema)]
pub struct VersionInfo {
    pub version: String,
}

/// Get service version
#[utoipa::path(
    get,
    path = "/v1/version",
    responses(
        (status = 200, description = "Service version", body = VersionInfo)
    ),
    tag = "system"
)]
pub async fn get_version() -> Json<VersionInfo> {
    Json(VersionInfo {
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// === Rules ===

/// Query a policy document and insert its rules
#[utoipa::path(
    post,
    path = "/v1/iptables/insert",
    params(RuleQuery),
    request_body(content = Object, description = "Query input", content_type = "application/json"),
    responses(
        (status = 200, description = "All rules inserted", body = RuleOpResponse),
        (status = 400, description = "Invalid input or policy document", body = ApiError),
        (status = 409, description = "Watcher disabled", body = ApiError),
        (status = 500, description = "Some rules failed", body = ApiError),
        (status = 502, description = "Policy engine error", body = ApiError)
    ),
    tag = "iptables"
)]
pub async fn insert_rules(
    State(state): State<Arc<AppState>>,
    Query(query): Query<RuleQuery>,
    body: Bytes,
) -> Result<Json<RuleOpResponse>, ApiError> {
    let input = parse_input(&body)?;
    let watcher = match (query.watch, &state.watcher) {
        (false, _) => None,
        (true, Some(w)) => Some(w),
        (true, None) => return Err(ApiError::new(409, "watcher is disabled")),
    };

    let rules = state.source.fetch_rules(&query.q, &input).await?;
    info!(path = %query.q, rules = rules.len(), "Inserting rules from policy document");
    let result = state.rules.insert_rules(&rules).await;

    // The target is watched even if some rules failed; the watcher owns it from here.
    if let Some(watcher) = watcher {
        let target = WatchTarget::new(query.q.clone()).with_input(input);
        watcher.register_applied(target, rules.clone()).await?;
    }
    result?;

    Ok(Json(RuleOpResponse {
        message: format!("inserted {} rules", rules.len()),
        rules: rules.len(),
        watched: watcher.is_some(),
    }))
}

/// Query a policy document and delete its rules
#[utoipa::path(
    post,
    path = "/v1/iptables/delete",
    params(RuleQuery),
    request_body(content = Object, description = "Query input", content_type = "application/json"),
    responses(
        (status = 200, description = "All rules deleted", body = RuleOpResponse),
        (status = 400, description = "Invalid input or policy document", body = ApiError),
        (status = 500, description = "Some rules failed", body = ApiError),
        (status = 502, description = "Policy engine error", body = ApiError)
    ),
    tag = "iptables"
)]
pub async fn delete_rules(
    State(state): State<Arc<AppState>>,
    Query(query): Query<RuleQuery>,
    body: Bytes,
) -> Result<Json<RuleOpResponse>, ApiError> {
    let input = parse_input(&body)?;
    let rules = state.source.fetch_rules(&query.q, &input).await?;

    // Stop reconciling first so the watcher does not put the rules back.
    if let Some(watcher) = &state.watcher {
        match watcher.unregister(&query.q).await {
            Ok(true) => info!(path = %query.q, "Target no longer watched"),
            Ok(false) => {}
            Err(e) => warn!(path = %query.q, "Failed to unregister target: {}", e),
        }
    }

    info!(path = %query.q, rules = rules.len(), "Deleting rules from policy document");
    state.rules.delete_rules(&rules).await?;

    Ok(Json(RuleOpResponse {
        message: format!("deleted {} rules", rules.len()),
        rules: rules.len(),
        watched: false,
    }))
}

/// Insert or delete rules given directly in the body
#[utoipa::path(
    post,
    path = "/v1/iptables/json",
    params(JsonQuery),
    request_body = RuleSet,
    responses(
        (status = 200, description = "All rules applied", body = RuleOpResponse),
        (status = 500, description = "Some rules failed", body = ApiError)
    ),
    tag = "iptables"
)]
pub async fn json_rules(
    State(state): State<Arc<AppState>>,
    Query(query): Query<JsonQuery>,
    Json(rules): Json<RuleSet>,
) -> Result<Json<RuleOpResponse>, ApiError> {
    let op = query.op.unwrap_or(Operation::Insert);
    let message = match op {
        Operation::Insert => {
            state.rules.insert_rules(&rules).await?;
            format!("inserted {} rules", rules.len())
        }
        Operation::Delete => {
            state.rules.delete_rules(&rules).await?;
            format!("deleted {} rules", rules.len())
        }
    };

    Ok(Json(RuleOpResponse {
        message,
        rules: rules.len(),
        watched: false,
    }))
}

/// List the rules of one chain
#[utoipa::path(
    get,
    path = "/v1/iptables/list/{table}/{chain}",
    params(
        ("table" = String, Path, description = "Table name"),
        ("chain" = String, Path, description = "Chain name")
    ),
    responses(
        (status = 200, description = "Rules of the chain", body = RuleSet),
        (status = 500, description = "Listing failed", body = ApiError)
    ),
    tag = "iptables"
)]
pub async fn list_rules(
    State(state): State<Arc<AppState>>,
    Path((table, chain)): Path<(String, String)>,
) -> Result<Json<RuleSet>, ApiError> {
    Ok(Json(state.rules.list_rules(&table, &chain).await?))
}

/// List every rule of every table
#[utoipa::path(
    get,
    path = "/v1/iptables/list/all",
    responses(
        (status = 200, description = "All rules", body = RuleSet),
        (status = 500, description = "Listing failed", body = ApiError)
    ),
    tag = "iptables"
)]
pub async fn list_all_rules(
    State(state): State<Arc<AppState>>,
) -> Result<Json<RuleSet>, ApiError> {
    Ok(Json(state.rules.list_all_rules().await?))
}

// === Watcher ===

/// Status of every watched target
#[utoipa::path(
    get,
    path = "/v1/watcher/targets",
    responses(
        (status = 200, description = "Watched targets", body = [TargetStatus]),
        (status = 503, description = "Watcher disabled or stopped", body = ApiError)
    ),
    tag = "watcher"
)]
pub async fn list_targets(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<TargetStatus>>, ApiError> {
    let watcher = state
        .watcher
        .as_ref()
        .ok_or_else(|| ApiError::new(503, "watcher is disabled"))?;
    Ok(Json(watcher.status().await?))
}
