use crate::error::ApiError;
use crate::server::AppState;
use axum::extract::Path;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use resync_core::{PassReport, ResourceKind};
use serde::Serialize;
use std::sync::Arc;

#[derive(Debug, Serialize)]
pub struct ResyncAccepted {
    pub provider: String,
    pub kind: ResourceKind,
    pub status: &'static str,
}

#[derive(Debug, Serialize)]
pub struct RunningPass {
    pub provider: String,
    pub kind: ResourceKind,
}

#[derive(Debug, Serialize)]
pub struct ResyncStatus {
    pub running: Vec<RunningPass>,
    pub last_runs: Vec<PassReport>,
}

#[tracing::instrument(level = "debug", skip_all)]
pub fn router() -> Router {
    Router::new()
        .route("/resync/status", get(get_status))
        .route("/resync/{provider}/{kind}", post(start_resync))
}

/// Start an on-demand pass in the background. `409` while that kind is already running.
#[tracing::instrument(level = "info", skip(state))]
pub async fn start_resync(
    Extension(state): Extension<Arc<AppState>>,
    Path((provider, kind)): Path<(String, String)>,
) -> Result<(StatusCode, Json<ResyncAccepted>), ApiError> {
    let kind: ResourceKind = kind.parse()?;
    state
        .scheduler
        .spawn_kind(&provider, kind, state.cancel.child_token())?;
    Ok((
        StatusCode::ACCEPTED,
        Json(ResyncAccepted {
            provider,
            kind,
            status: "started",
        }),
    ))
}

#[tracing::instrument(level = "debug", skip_all)]
pub async fn get_status(Extension(state): Extension<Arc<AppState>>) -> Json<ResyncStatus> {
    let running = state
        .scheduler
        .running()
        .into_iter()
        .map(|(provider, kind)| RunningPass { provider, kind })
        .collect();
    Json(ResyncStatus {
        running,
        last_runs: state.scheduler.status(),
    })
}

#[cfg(test)]
mod tests {
    use crate::routes::test_support::{app, json_body, post_json};
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use resync_core::testing::FixtureProvider;
    use resync_core::{KindSpec, ResourceKind};
    use serde_json::json;
    use std::time::Duration;
    use tower::ServiceExt;

    fn provider() -> FixtureProvider {
        FixtureProvider::new("fixture")
            .with_kind(KindSpec::new(ResourceKind::Issue, "id"))
            .with_numbered(ResourceKind::Issue, 5, 2)
    }

    fn status_request() -> Request<Body> {
        Request::builder()
            .uri("/resync/status")
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn accepted_then_conflict_while_running() {
        let p = provider();
        p.set_listing_open(false);
        let t = app(vec![p.clone()]);

        let resp = t
            .app
            .clone()
            .oneshot(post_json("/resync/fixture/issue", json!({}), &[]))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
        assert_eq!(json_body(resp).await["kind"], "issue");

        let resp = t
            .app
            .clone()
            .oneshot(post_json("/resync/fixture/issue", json!({}), &[]))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CONFLICT);

        let running = json_body(t.app.clone().oneshot(status_request()).await.unwrap()).await;
        assert_eq!(running["running"], json!([{"provider": "fixture", "kind": "issue"}]));

        p.set_listing_open(true);
        for _ in 0..200 {
            if !t.state.scheduler.is_running("fixture", ResourceKind::Issue) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let status = json_body(t.app.oneshot(status_request()).await.unwrap()).await;
        assert_eq!(status["running"], json!([]));
        assert_eq!(status["last_runs"][0]["records"], 5);
        assert_eq!(t.sink.upserted(ResourceKind::Issue).await.len(), 5);
    }

    #[tokio::test]
    async fn bad_kind_and_provider() {
        let t = app(vec![provider()]);
        let resp = t
            .app
            .clone()
            .oneshot(post_json("/resync/fixture/banana", json!({}), &[]))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let resp = t
            .app
            .clone()
            .oneshot(post_json("/resync/fixture/incident", json!({}), &[]))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let resp = t
            .app
            .oneshot(post_json("/resync/other/issue", json!({}), &[]))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
