//! Subcommand bodies for the `resync` binary.

use crate::server::{self, AppState};
use resync_core::{IntegrationConfig, PassReport, ResourceKind, ResyncScheduler, Result};
use std::net::SocketAddr;
use std::path::Path;
use tokio_util::sync::CancellationToken;

pub async fn serve(host: &str, port: u16, config: &Path) -> anyhow::Result<()> {
    let addr: SocketAddr = format!("{host}:{port}").parse()?;
    let ctx = server::build_context(config)?;
    server::serve(addr, AppState::new(ctx, CancellationToken::new())).await
}

/// One-shot resync of everything, one provider, or one (provider, kind).
pub async fn run_selected(
    scheduler: &ResyncScheduler,
    provider: Option<&str>,
    kind: Option<ResourceKind>,
    cancel: &CancellationToken,
) -> Result<Vec<PassReport>> {
    match (provider, kind) {
        (Some(provider), Some(kind)) => Ok(vec![scheduler.run_kind(provider, kind, cancel).await?]),
        (Some(provider), None) => {
            let kinds = scheduler.context().provider(provider)?.declared_kinds();
            let mut reports = Vec::with_capacity(kinds.len());
            for kind in kinds {
                reports.push(scheduler.run_kind(provider, kind, cancel).await?);
            }
            Ok(reports)
        }
        (None, _) => Ok(scheduler.run_once(cancel).await),
    }
}

pub async fn resync(
    config: &Path,
    provider: Option<String>,
    kind: Option<String>,
) -> anyhow::Result<()> {
    let kind = kind.map(|k| k.parse::<ResourceKind>()).transpose()?;
    let ctx = server::build_context(config)?;
    let scheduler = ResyncScheduler::new(ctx);

    let cancel = CancellationToken::new();
    let on_ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupted, cancelling passes");
            on_ctrl_c.cancel();
        }
    });

    let reports = run_selected(&scheduler, provider.as_deref(), kind, &cancel).await?;
    println!("{}", serde_json::to_string_pretty(&reports)?);
    let failed = reports.iter().filter(|r| !r.is_done()).count();
    if failed > 0 {
        anyhow::bail!("{failed} of {} resync passes failed", reports.len());
    }
    Ok(())
}

pub fn check_config(config: &Path) -> anyhow::Result<()> {
    let cfg = IntegrationConfig::load(config)?;
    for pc in &cfg.providers {
        if let Err(e) = resync_integrations::build_provider(pc) {
            tracing::warn!(provider = %pc.provider, error = %e, "provider would be disabled");
        }
    }
    println!("{}", serde_json::to_string_pretty(&cfg.redacted())?);
    Ok(())
}
