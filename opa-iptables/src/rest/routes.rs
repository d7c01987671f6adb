use axum::{
    Json, Router,
    routing::{get, post},
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use utoipa::OpenApi;

use super::handlers::{self, AppState};
use crate::error::Operation;
use crate::reconciler::CycleOutcome;
use crate::rule::{Rule, RuleSet};
use crate::watcher::TargetStatus;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "opa-iptables controller",
        version = "0.1.0",
        description = "Applies iptables rules served by Open Policy Agent, once or continuously through the watcher."
    ),
    tags(
        (name = "system", description = "System information"),
        (name = "iptables", description = "One-shot rule insertion, deletion and listing"),
        (name = "watcher", description = "Reconciled policy documents")
    ),
    paths(
        handlers::get_version,
        handlers::insert_rules,
        handlers::delete_rules,
        handlers::json_rules,
        handlers::list_rules,
        handlers::list_all_rules,
        handlers::list_targets,
    ),
    components(schemas(
        handlers::VersionInfo,
        handlers::RuleOpResponse,
        handlers::ApiError,
        Rule,
        RuleSet,
        Operation,
        TargetStatus,
        CycleOutcome,
    ))
)]
pub struct ApiDoc;

async fn openapi_json() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}

pub fn create_router(state: Arc<AppState>) -> Router {
    let iptables_routes = Router::new()
        .route("/insert", post(handlers::insert_rules))
        .route("/delete", post(handlers::delete_rules))
        .route("/json", post(handlers::json_rules))
        .route("/list/all", get(handlers::list_all_rules))
        .route("/list/{table}/{chain}", get(handlers::list_rules));

    let v1_routes = Router::new()
        .route("/version", get(handlers::get_version))
        .route("/watcher/targets", get(handlers::list_targets))
        .nest("/iptables", iptables_routes);

    Router::new()
        .route("/api-docs/openapi.json", get(openapi_json))
        .nest("/v1", v1_routes)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
