use crate::routes;
use axum::{Extension, Router};
use resync_core::context::sink_from_config;
use resync_core::{IntegrationConfig, ResyncScheduler, SyncContext};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;

const REQUEST_ID_HEADER: &str = "x-request-id";

#[derive(Clone)]
pub struct AppState {
    pub ctx: Arc<SyncContext>,
    pub scheduler: ResyncScheduler,
    /// Parent of every pass token; cancelled on shutdown.
    pub cancel: CancellationToken,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(ctx: Arc<SyncContext>, cancel: CancellationToken) -> Self {
        Self {
            scheduler: ResyncScheduler::new(ctx.clone()),
            ctx,
            cancel,
            started_at: Instant::now(),
        }
    }
}

/// Load the config at `path` and build the context with every provider it names.
#[tracing::instrument(level = "info", skip_all, fields(path = %path.display()))]
pub fn build_context(path: &Path) -> anyhow::Result<Arc<SyncContext>> {
    let config = IntegrationConfig::load(path)?;
    let sink = sink_from_config(&config)?;
    let ctx = SyncContext::build(config, sink, resync_integrations::build_provider)?;
    Ok(Arc::new(ctx))
}

#[tracing::instrument(level = "debug", skip_all)]
pub fn router(state: AppState) -> Router {
    let state = Arc::new(state);
    let request_id = axum::http::HeaderName::from_static(REQUEST_ID_HEADER);

    Router::new()
        .merge(routes::router())
        .layer(Extension(state))
        .layer(PropagateRequestIdLayer::new(request_id.clone()))
        .layer(TraceLayer::new_for_http())
        .layer(SetRequestIdLayer::new(request_id, MakeRequestUuid))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
}

/// Register webhooks, start the scheduler and serve until Ctrl-C. Shutdown cancels every
/// in-flight pass and waits for the scheduler to stop.
#[tracing::instrument(level = "info", skip_all, fields(%addr))]
pub async fn serve(addr: SocketAddr, state: AppState) -> anyhow::Result<()> {
    let registered = state.ctx.setup_webhooks().await;
    tracing::info!(registered, "webhook setup finished");

    let scheduler = state.scheduler.clone();
    let scheduler_cancel = state.cancel.child_token();
    let scheduler_task = tokio::spawn(async move { scheduler.run_loop(scheduler_cancel).await });

    let cancel = state.cancel.clone();
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("resync server listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(cancel.clone()))
        .await?;

    cancel.cancel();
    if let Err(e) = scheduler_task.await {
        tracing::error!(error = %e, "scheduler task panicked");
    }
    tracing::info!("resync server stopped");
    Ok(())
}

async fn shutdown_signal(cancel: CancellationToken) {
    tokio::select! {
        res = tokio::signal::ctrl_c() => match res {
            Ok(()) => tracing::info!("shutdown requested"),
            Err(e) => {
                tracing::error!(error = %e, "failed to listen for ctrl_c");
                cancel.cancelled().await;
            }
        },
        _ = cancel.cancelled() => {}
    }
    cancel.cancel();
}
