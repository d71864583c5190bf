//! Admin HTTP surface: settings, delivery log, test send.

use crate::api::is_valid_email_format;
use crate::email::MailRequest;
use crate::error::Error;
use crate::settings::SettingsPatch;
use crate::store::{run_blocking, LogQuery, LogStore};
use crate::Relay;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;

type AppState = Arc<Relay>;

#[derive(Debug, Deserialize)]
struct TestRequest {
    to: String,
}

/// Run the admin server until the shutdown signal fires.
pub async fn run_http_server(
    listener: TcpListener,
    relay: Arc<Relay>,
    mut shutdown: broadcast::Receiver<()>,
) {
    if let Err(e) = axum::serve(listener, router(relay))
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
        })
        .await
    {
        tracing::error!(error = %e, "HTTP server error");
    }
}

fn router(relay: Arc<Relay>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/status", get(status))
        .route("/settings", get(get_settings).put(update_settings))
        .route("/logs", get(get_logs).delete(clear_logs))
        .route("/logs/cleanup", post(cleanup_logs))
        .route("/logs/{id}", get(get_log))
        .route("/stats", get(stats))
        .route("/test", post(send_test))
        .route("/send", post(send_mail))
        .fallback(not_found)
        .with_state(relay)
}

fn internal_error(e: &Error) -> Response {
    tracing::error!(error = %e, "admin request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": e.to_string() })),
    )
        .into_response()
}

async fn health_check() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn status(State(relay): State<AppState>) -> Response {
    let db = relay.database();
    match (db.is_installed(), db.schema_version()) {
        (Ok(installed), Ok(schema_version)) => Json(json!({
            "enabled": relay.settings().is_enabled(),
            "configured": relay.settings().is_configured(),
            "errors": relay.settings().configuration_errors(),
            "installed": installed,
            "schema_version": schema_version,
            "endpoint": relay.api().endpoint(),
            "last_error": relay.api().last_error(),
        }))
        .into_response(),
        (Err(e), _) | (_, Err(e)) => internal_error(&e),
    }
}

async fn get_settings(State(relay): State<AppState>) -> Response {
    Json(relay.settings().current().redacted()).into_response()
}

async fn update_settings(
    State(relay): State<AppState>,
    Json(patch): Json<SettingsPatch>,
) -> Response {
    match relay.settings().update(patch) {
        Ok(updated) => Json(json!({
            "updated": updated,
            "settings": relay.settings().current().redacted(),
        }))
        .into_response(),
        Err(e) => internal_error(&e),
    }
}

async fn get_logs(State(relay): State<AppState>, Query(query): Query<LogQuery>) -> Response {
    match run_blocking(relay.logs(), move |logs| logs.get_logs(&query)).await {
        Ok(page) => Json(page).into_response(),
        Err(e) => internal_error(&e),
    }
}

async fn get_log(State(relay): State<AppState>, Path(id): Path<i64>) -> Response {
    match run_blocking(relay.logs(), move |logs| logs.get_log(id)).await {
        Ok(Some(record)) => Json(record).into_response(),
        Ok(None) => (StatusCode::NOT_FOUND, "Log record not found").into_response(),
        Err(e) => internal_error(&e),
    }
}

async fn clear_logs(State(relay): State<AppState>) -> Response {
    match run_blocking(relay.logs(), LogStore::clear_all_logs).await {
        Ok(deleted) => Json(json!({ "deleted": deleted })).into_response(),
        Err(e) => internal_error(&e),
    }
}

async fn cleanup_logs(State(relay): State<AppState>) -> Response {
    match run_blocking(relay.logs(), LogStore::cleanup_old_logs).await {
        Ok(deleted) => Json(json!({ "deleted": deleted })).into_response(),
        Err(e) => internal_error(&e),
    }
}

async fn stats(State(relay): State<AppState>) -> Response {
    match run_blocking(relay.logs(), LogStore::get_stats).await {
        Ok(stats) => Json(stats).into_response(),
        Err(e) => internal_error(&e),
    }
}

async fn send_test(State(relay): State<AppState>, Json(body): Json<TestRequest>) -> Response {
    let to = body.to.trim();
    if !is_valid_email_format(to) {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({
                "success": false,
                "message": "Please enter a valid email address.",
            })),
        )
            .into_response();
    }

    match relay.api().test_connection(to).await {
        Ok(_) => Json(json!({
            "success": true,
            "message": format!("Test email sent to {to}."),
        }))
        .into_response(),
        Err(e) => Json(json!({
            "success": false,
            "code": e.code(),
            "message": e.to_string(),
        }))
        .into_response(),
    }
}

async fn send_mail(State(relay): State<AppState>, Json(request): Json<MailRequest>) -> Json<serde_json::Value> {
    let success = relay.send_mail(&request).await;
    Json(json!({ "success": success }))
}

async fn not_found() -> (StatusCode, &'static str) {
    (StatusCode::NOT_FOUND, "Not found")
}
