//! Inbound provider webhooks.
//!
//! Every accepted event is answered `200 {"ok": true}` whatever its outcome; the router logs
//! what happened. Only an unknown provider (404) and a
//! failed verification (401) are reported to the caller.

use crate::error::ApiError;
use crate::server::AppState;
use axum::body::Bytes;
use axum::extract::Path;
use axum::http::HeaderMap;
use axum::routing::post;
use axum::{Extension, Json, Router};
use resync_core::WebhookEvent;
use serde::Serialize;
use std::sync::Arc;

const GITLAB: &str = "gitlab";

#[derive(Debug, Serialize)]
pub struct WebhookAck {
    pub ok: bool,
}

#[tracing::instrument(level = "debug", skip_all)]
pub fn router() -> Router {
    Router::new()
        .route("/integration/{provider}/webhook", post(provider_webhook))
        .route("/integration/gitlab/hook/{group_id}", post(gitlab_group_hook))
        .route("/integration/gitlab/system/hook", post(gitlab_system_hook))
}

fn to_event(provider: &str, headers: &HeaderMap, body: &Bytes) -> WebhookEvent {
    let payload = if body.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(body).unwrap_or_else(|e| {
            tracing::warn!(provider, error = %e, "webhook body is not JSON");
            serde_json::Value::Null
        })
    };
    headers
        .iter()
        .filter_map(|(name, value)| Some((name.as_str(), value.to_str().ok()?)))
        .fold(WebhookEvent::new(provider, payload), |event, (name, value)| {
            event.with_header(name, value)
        })
}

async fn dispatch(
    state: &AppState,
    provider: &str,
    headers: &HeaderMap,
    body: &Bytes,
) -> Result<Json<WebhookAck>, ApiError> {
    let entry = state.ctx.provider(provider)?;
    let event = to_event(entry.id(), headers, body);
    state
        .ctx
        .router()
        .handle(entry.client.as_ref(), &event)
        .await?;
    Ok(Json(WebhookAck { ok: true }))
}

#[tracing::instrument(level = "info", skip(state, headers, body))]
pub async fn provider_webhook(
    Extension(state): Extension<Arc<AppState>>,
    Path(provider): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WebhookAck>, ApiError> {
    dispatch(&state, &provider, &headers, &body).await
}

/// Group hook registered per root group; GitLab names the event in `X-Gitlab-Event`.
#[tracing::instrument(level = "info", skip(state, headers, body))]
pub async fn gitlab_group_hook(
    Extension(state): Extension<Arc<AppState>>,
    Path(group_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WebhookAck>, ApiError> {
    dispatch(&state, GITLAB, &headers, &body).await
}

#[tracing::instrument(level = "info", skip_all)]
pub async fn gitlab_system_hook(
    Extension(state): Extension<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WebhookAck>, ApiError> {
    dispatch(&state, GITLAB, &headers, &body).await
}
