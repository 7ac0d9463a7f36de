//! Route definitions and router setup
//!
//! Configures all API routes and middleware.

mod audit;
mod catalog;
mod changes;
mod runs;

use crate::config::Settings;
use crate::state::SharedState;
use axum::{
    http::{header, HeaderName, Method},
    routing::{get, post, put},
    Router,
};
use std::time::Duration;
use tower::ServiceBuilder;
use tower_http::{
    compression::CompressionLayer,
    cors::{Any, CorsLayer},
    request_id::MakeRequestUuid,
    trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer},
    ServiceBuilderExt,
};
use tracing::Level;

/// Create the application router with all routes and middleware
pub fn create_router(state: SharedState, settings: &Settings) -> Router {
    // Build CORS layer
    let cors = build_cors_layer(settings);

    // Build tracing/logging layer
    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
        .on_request(DefaultOnRequest::new().level(Level::INFO))
        .on_response(DefaultOnResponse::new().level(Level::INFO));

    // Build middleware stack
    let middleware = ServiceBuilder::new()
        .set_x_request_id(MakeRequestUuid)
        .layer(trace_layer)
        .layer(CompressionLayer::new())
        .layer(cors)
        .propagate_x_request_id();

    Router::new()
        // Health check
        .route("/health", get(health_check))

        // Catalog routes
        .route("/api/scopes/tables", post(catalog::create_table_scope))
        .route(
            "/api/environments",
            post(catalog::create_environment).get(catalog::list_environments),
        )
        .route("/api/pipelines", post(catalog::create_pipeline))
        .route("/api/pipelines/{id}", get(catalog::get_pipeline))
        .route("/api/pipelines/{id}/runs", post(runs::start_run))

        // Change routes
        .route("/api/changes", post(changes::submit_change).get(changes::list_changes))
        .route("/api/changes/{id}", get(changes::get_change))
        .route("/api/changes/{id}/draft", put(changes::update_draft))
        .route("/api/changes/{id}/submit", post(changes::submit_draft))
        .route(
            "/api/changes/{id}/votes",
            post(changes::cast_vote).get(changes::list_votes),
        )
        .route("/api/changes/{id}/withdraw", post(changes::withdraw_change))
        .route("/api/changes/{id}/apply", post(changes::apply_change))
        .route("/api/changes/{id}/rollback", post(changes::rollback_change))

        // Pipeline run routes
        .route("/api/runs/{id}", get(runs::get_run))
        .route("/api/runs/{id}/promote", post(runs::promote_next))

        // Audit log
        .route("/api/audit", get(audit::list_audit_log))

        // Apply middleware and state
        .layer(middleware)
        .with_state(state)
}

/// Build CORS layer from settings
fn build_cors_layer(settings: &Settings) -> CorsLayer {
    let origins: Vec<_> = settings
        .cors
        .allowed_origins
        .iter()
        .filter_map(|s| s.parse().ok())
        .collect();

    let headers = [
        header::CONTENT_TYPE,
        header::ACCEPT,
        HeaderName::from_static(crate::auth::ACTOR_ID_HEADER),
        HeaderName::from_static(crate::auth::ACTOR_ROLE_HEADER),
    ];
    let methods = [Method::GET, Method::POST, Method::PUT, Method::OPTIONS];

    if origins.is_empty() {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(methods)
            .allow_headers(headers)
            .max_age(Duration::from_secs(3600))
    } else {
        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(methods)
            .allow_headers(headers)
            .max_age(Duration::from_secs(3600))
    }
}

/// Health check endpoint
async fn health_check() -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({
        "success": true,
        "message": "Server is running fine.",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "version": env!("CARGO_PKG_VERSION")
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{ACTOR_ID_HEADER, ACTOR_ROLE_HEADER};
    use crate::config::{CorsConfig, EngineConfig, ServerConfig};
    use crate::effector::SandboxEffector;
    use crate::engine::ApprovalEngine;
    use crate::state::AppState;
    use crate::store::InMemoryChangeStore;
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use pretty_assertions::assert_eq;
    use serde_json::{json, Value};
    use std::sync::Arc;
    use tower::ServiceExt;
    use uuid::Uuid;

    fn app() -> Router {
        let settings = Settings {
            server: ServerConfig::default(),
            database: None,
            cors: CorsConfig::default(),
            engine: EngineConfig::default(),
        };
        let engine = ApprovalEngine::new(
            Arc::new(InMemoryChangeStore::new()),
            Arc::new(SandboxEffector::new()),
            settings.engine.clone(),
        );
        create_router(Arc::new(AppState::new(Arc::new(engine))), &settings)
    }

    async fn call(
        app: &Router,
        method: Method,
        uri: &str,
        role: Option<&str>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(role) = role {
            builder = builder
                .header(ACTOR_ID_HEADER, Uuid::new_v4().to_string())
                .header(ACTOR_ROLE_HEADER, role);
        }
        let request = match body {
            Some(body) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };

        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, json)
    }

    async fn register_scope(app: &Router) -> String {
        let (status, body) = call(
            app,
            Method::POST,
            "/api/scopes/tables",
            Some("admin"),
            Some(json!({"name": "orders"})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        body["scope"]["id"].as_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn test_health_check() {
        let (status, body) = call(&app(), Method::GET, "/health", None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], json!(true));
    }

    #[tokio::test]
    async fn test_missing_actor_is_unauthenticated() {
        let (status, body) = call(&app(), Method::GET, "/api/changes", None, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["success"], json!(false));
    }

    #[tokio::test]
    async fn test_catalog_writes_need_admin() {
        let (status, _) = call(
            &app(),
            Method::POST,
            "/api/environments",
            Some("developer"),
            Some(json!({"name": "prod", "type": "production"})),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_table_create_flow_over_http() {
        let app = app();
        let scope_id = register_scope(&app).await;

        let (status, body) = call(
            &app,
            Method::POST,
            "/api/changes",
            Some("developer"),
            Some(json!({
                "kind": "table_create",
                "scopeId": scope_id,
                "payload": {"name": "orders", "fields": [{"name": "total", "fieldType": "number"}]}
            })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["change"]["status"], json!("pending"));
        let id = body["change"]["id"].as_str().unwrap().to_string();

        // Not yet approved
        let (status, _) = call(&app, Method::POST, &format!("/api/changes/{id}/apply"), Some("developer"), None).await;
        assert_eq!(status, StatusCode::CONFLICT);

        for role in ["developer", "manager"] {
            let (status, _) = call(
                &app,
                Method::POST,
                &format!("/api/changes/{id}/votes"),
                Some(role),
                Some(json!({"decision": "approved"})),
            )
            .await;
            assert_eq!(status, StatusCode::OK);
        }

        let (status, body) = call(&app, Method::POST, &format!("/api/changes/{id}/apply"), Some("developer"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["change"]["status"], json!("applied"));

        let (status, body) = call(&app, Method::POST, &format!("/api/changes/{id}/rollback"), Some("developer"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["rollback"]["outcome"], json!("rolled_back"));

        let (status, body) = call(&app, Method::GET, &format!("/api/changes/{id}/votes"), Some("viewer"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["approvals"].as_array().unwrap().len(), 2);

        let (status, body) = call(&app, Method::GET, "/api/audit", Some("viewer"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["total"].as_u64().unwrap() >= 4);
    }

    #[tokio::test]
    async fn test_viewer_cannot_submit_or_vote() {
        let app = app();
        let scope_id = register_scope(&app).await;

        let (status, _) = call(
            &app,
            Method::POST,
            "/api/changes",
            Some("viewer"),
            Some(json!({"kind": "table_delete", "scopeId": scope_id, "payload": {"tableId": "tbl_orders"}})),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (_, body) = call(
            &app,
            Method::POST,
            "/api/changes",
            Some("developer"),
            Some(json!({"kind": "table_delete", "scopeId": scope_id, "payload": {"tableId": "tbl_orders"}})),
        )
        .await;
        let id = body["change"]["id"].as_str().unwrap().to_string();

        let (status, _) = call(
            &app,
            Method::POST,
            &format!("/api/changes/{id}/votes"),
            Some("viewer"),
            Some(json!({"decision": "approved"})),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_pending_queue_filters_by_status() {
        let app = app();
        let scope_id = register_scope(&app).await;

        for draft in [false, true] {
            let (status, _) = call(
                &app,
                Method::POST,
                "/api/changes",
                Some("developer"),
                Some(json!({
                    "kind": "field_update",
                    "scopeId": scope_id,
                    "draft": draft,
                    "payload": {"tableId": "tbl_orders", "fieldId": "fld_total", "required": true}
                })),
            )
            .await;
            assert_eq!(status, StatusCode::CREATED);
        }

        let (status, body) = call(&app, Method::GET, "/api/changes?status=pending", Some("viewer"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["total"], json!(1));
    }

    #[tokio::test]
    async fn test_pipeline_needs_known_environments() {
        let (status, _) = call(
            &app(),
            Method::POST,
            "/api/pipelines",
            Some("admin"),
            Some(json!({"name": "release", "environments": [Uuid::new_v4()]})),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_unknown_change_is_not_found() {
        let uri = format!("/api/changes/{}", Uuid::new_v4());
        let (status, body) = call(&app(), Method::GET, &uri, Some("viewer"), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["success"], json!(false));
    }
}
