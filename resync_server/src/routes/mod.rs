use axum::Router;
use axum::routing::get;

pub mod health;
pub mod resync;
pub mod webhooks;

#[tracing::instrument(level = "debug", skip_all)]
pub fn router() -> Router {
    Router::new()
        .route("/health", get(health::get_health))
        .merge(webhooks::router())
        .merge(resync::router())
}

#[cfg(test)]
pub(crate) mod test_support {
    use crate::server::{AppState, router};
    use axum::Router;
    use axum::body::Body;
    use axum::http::{Request, Response};
    use resync_core::testing::FixtureProvider;
    use resync_core::{IntegrationConfig, MemorySink, ProviderConfig, SyncContext};
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    pub struct TestApp {
        pub app: Router,
        pub state: AppState,
        pub sink: MemorySink,
    }

    pub fn app(providers: Vec<FixtureProvider>) -> TestApp {
        let sink = MemorySink::new();
        let mut ctx = SyncContext::new(IntegrationConfig::default(), Arc::new(sink.clone()));
        for p in providers {
            let id = resync_core::ProviderClient::id(&p);
            ctx = ctx
                .with_provider(Arc::new(p), ProviderConfig::new(id))
                .unwrap();
        }
        let state = AppState::new(Arc::new(ctx), CancellationToken::new());
        TestApp {
            app: router(state.clone()),
            state,
            sink,
        }
    }

    pub async fn json_body(resp: Response<Body>) -> serde_json::Value {
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    pub fn post_json(uri: &str, body: serde_json::Value, headers: &[(&str, &str)]) -> Request<Body> {
        let mut req = Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json");
        for (name, value) in headers {
            req = req.header(*name, *value);
        }
        req.body(Body::from(body.to_string())).unwrap()
    }
}
