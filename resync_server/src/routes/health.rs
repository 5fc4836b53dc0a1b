use crate::server::AppState;
use axum::{Extension, Json};
use serde::Serialize;
use std::sync::Arc;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub uptime_secs: u64,
    pub providers: Vec<&'static str>,
    pub running_passes: usize,
}

#[tracing::instrument(level = "debug", skip_all)]
pub async fn get_health(Extension(state): Extension<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        uptime_secs: state.started_at.elapsed().as_secs(),
        providers: state.ctx.providers().map(|p| p.id()).collect(),
        running_passes: state.scheduler.running().len(),
    })
}

#[cfg(test)]
mod tests {
    use crate::routes::test_support::{app, json_body};
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use resync_core::testing::FixtureProvider;
    use tower::ServiceExt;

    #[tokio::test]
    async fn lists_configured_providers() {
        let t = app(vec![FixtureProvider::new("fixture")]);
        let resp = t
            .app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = json_body(resp).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["providers"], serde_json::json!(["fixture"]));
    }
}
