use crate::config::EventListenerType;
use crate::context::{ProviderEntry, SyncContext};
use crate::models::ResourceKind;
use crate::orchestrator::{PassReport, ResyncOrchestrator};
use crate::{Error, Result};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::Arc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

type PassKey = (String, ResourceKind);

/// Removes its key from the running set when dropped, whatever way the pass ends.
struct RunningGuard {
    running: Arc<DashMap<PassKey, ()>>,
    key: PassKey,
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.running.remove(&self.key);
    }
}

/// Owns resync cadence for a [`SyncContext`].
///
/// - `ONCE`: every declared kind runs a single time.
/// - `POLLING`: every declared kind runs each `resync_interval_secs` until cancelled.
///
/// At most one pass per (provider, kind) is in flight; a busy kind is skipped. The last
/// report per kind is kept in memory only.
#[derive(Clone)]
pub struct ResyncScheduler {
    ctx: Arc<SyncContext>,
    orchestrator: ResyncOrchestrator,
    running: Arc<DashMap<PassKey, ()>>,
    last_runs: Arc<DashMap<PassKey, PassReport>>,
}

impl ResyncScheduler {
    pub fn new(ctx: Arc<SyncContext>) -> Self {
        Self {
            orchestrator: ResyncOrchestrator::new(ctx.sink()),
            ctx,
            running: Arc::new(DashMap::new()),
            last_runs: Arc::new(DashMap::new()),
        }
    }

    pub fn context(&self) -> &Arc<SyncContext> {
        &self.ctx
    }

    fn try_claim(&self, provider: &str, kind: ResourceKind) -> Option<RunningGuard> {
        let key = (provider.to_string(), kind);
        match self.running.entry(key.clone()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                slot.insert(());
                Some(RunningGuard {
                    running: self.running.clone(),
                    key,
                })
            }
        }
    }

    fn resolve(&self, provider: &str, kind: ResourceKind) -> Result<&ProviderEntry> {
        let entry = self.ctx.provider(provider)?;
        if !entry.client.kinds().supports(kind) {
            return Err(Error::unsupported_kind(entry.id(), kind));
        }
        Ok(entry)
    }

    fn claim(&self, provider: &str, kind: ResourceKind) -> Result<RunningGuard> {
        self.try_claim(provider, kind).ok_or_else(|| {
            Error::Conflict(format!("a {kind} resync for '{provider}' is already running"))
        })
    }

    async fn run_claimed(
        &self,
        entry: &ProviderEntry,
        kind: ResourceKind,
        guard: RunningGuard,
        cancel: &CancellationToken,
    ) -> PassReport {
        let options = entry.pass_options(kind);
        let report = self
            .orchestrator
            .run_pass(entry.client.as_ref(), kind, &options, cancel)
            .await;
        self.last_runs.insert(guard.key.clone(), report.clone());
        drop(guard);
        report
    }

    /// Run one (provider, kind) pass now. `Conflict` if that kind is already running.
    #[tracing::instrument(level = "info", skip(self, cancel))]
    pub async fn run_kind(
        &self,
        provider: &str,
        kind: ResourceKind,
        cancel: &CancellationToken,
    ) -> Result<PassReport> {
        let entry = self.resolve(provider, kind)?;
        let guard = self.claim(provider, kind)?;
        Ok(self.run_claimed(entry, kind, guard, cancel).await)
    }

    /// Claim the kind now and run its pass in the background.
    ///
    /// Fails synchronously (`NotFound`, `UnsupportedKind`, `Conflict`) so callers can answer
    /// before the pass starts.
    pub fn spawn_kind(
        &self,
        provider: &str,
        kind: ResourceKind,
        cancel: CancellationToken,
    ) -> Result<()> {
        let id = self.resolve(provider, kind)?.id();
        let guard = self.claim(provider, kind)?;
        let this = self.clone();
        tokio::spawn(async move {
            match this.ctx.provider(id) {
                Ok(entry) => {
                    this.run_claimed(entry, kind, guard, &cancel).await;
                }
                Err(e) => tracing::error!(provider = id, error = %e, "provider vanished"),
            }
        });
        Ok(())
    }

    /// Run every declared kind once, concurrently. Busy kinds are skipped.
    #[tracing::instrument(level = "info", skip_all)]
    pub async fn run_once(&self, cancel: &CancellationToken) -> Vec<PassReport> {
        let passes = self.ctx.passes().into_iter().map(|(provider, kind)| async move {
            match self.run_kind(provider, kind, cancel).await {
                Ok(report) => Some(report),
                Err(Error::Conflict(msg)) => {
                    tracing::info!(provider, %kind, %msg, "resync skipped, pass in flight");
                    None
                }
                Err(e) => {
                    tracing::warn!(provider, %kind, error = %e, "resync not started");
                    None
                }
            }
        });
        futures_util::future::join_all(passes)
            .await
            .into_iter()
            .flatten()
            .collect()
    }

    /// Run per the configured listener mode until done (`ONCE`) or cancelled (`POLLING`).
    #[tracing::instrument(level = "info", skip_all)]
    pub async fn run_loop(&self, cancel: CancellationToken) {
        let cfg = self.ctx.config();
        if cfg.event_listener_type == EventListenerType::Once {
            let reports = self.run_once(&cancel).await;
            log_summary(&reports);
            return;
        }

        let mut ticker = tokio::time::interval(cfg.resync_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let reports = self.run_once(&cancel).await;
            log_summary(&reports);
        }
        tracing::info!("resync scheduler stopped");
    }

    /// Last report per (provider, kind), ordered by provider then kind.
    pub fn status(&self) -> Vec<PassReport> {
        let mut reports: Vec<PassReport> =
            self.last_runs.iter().map(|e| e.value().clone()).collect();
        reports.sort_by(|a, b| (&a.provider, a.kind).cmp(&(&b.provider, b.kind)));
        reports
    }

    pub fn is_running(&self, provider: &str, kind: ResourceKind) -> bool {
        self.running.contains_key(&(provider.to_string(), kind))
    }

    pub fn running(&self) -> Vec<(String, ResourceKind)> {
        let mut keys: Vec<PassKey> = self.running.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        keys
    }
}

fn log_summary(reports: &[PassReport]) {
    let failed = reports.iter().filter(|r| !r.is_done()).count();
    let records: u64 = reports.iter().map(|r| r.records).sum();
    tracing::info!(passes = reports.len(), failed, records, "resync round finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{IntegrationConfig, ProviderConfig};
    use crate::kinds::KindSpec;
    use crate::orchestrator::PassState;
    use crate::sink::MemorySink;
    use crate::testing::FixtureProvider;
    use std::time::Duration;

    fn fixture() -> FixtureProvider {
        FixtureProvider::new("fixture")
            .with_kind(KindSpec::new(ResourceKind::Issue, "id"))
            .with_kind(KindSpec::new(ResourceKind::Project, "id"))
            .with_numbered(ResourceKind::Issue, 3, 3)
            .with_numbered(ResourceKind::Project, 2, 2)
    }

    fn scheduler(provider: FixtureProvider, config: IntegrationConfig) -> ResyncScheduler {
        let ctx = SyncContext::new(config, Arc::new(MemorySink::new()))
            .with_provider(Arc::new(provider), ProviderConfig::new("fixture"))
            .unwrap();
        ResyncScheduler::new(Arc::new(ctx))
    }

    #[tokio::test]
    async fn run_once_records_last_runs() {
        let sched = scheduler(fixture(), IntegrationConfig::default());
        let reports = sched.run_once(&CancellationToken::new()).await;
        assert_eq!(reports.len(), 2);
        let status = sched.status();
        assert_eq!(status.len(), 2);
        assert_eq!(status[0].kind, ResourceKind::Project);
        assert!(status.iter().all(|r| r.state == PassState::Done));
        assert!(sched.running().is_empty());
    }

    #[tokio::test]
    async fn busy_kind_is_a_conflict() {
        let sched = scheduler(fixture(), IntegrationConfig::default());
        let _guard = sched.try_claim("fixture", ResourceKind::Issue).unwrap();
        let err = sched
            .run_kind("fixture", ResourceKind::Issue, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));

        let reports = sched.run_once(&CancellationToken::new()).await;
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].kind, ResourceKind::Project);
    }

    #[tokio::test]
    async fn unknown_provider_and_kind_are_rejected() {
        let sched = scheduler(fixture(), IntegrationConfig::default());
        let cancel = CancellationToken::new();
        assert!(matches!(
            sched.run_kind("nope", ResourceKind::Issue, &cancel).await,
            Err(Error::NotFound(_))
        ));
        assert!(matches!(
            sched.run_kind("fixture", ResourceKind::Incident, &cancel).await,
            Err(Error::UnsupportedKind { .. })
        ));
    }

    #[tokio::test]
    async fn spawned_pass_holds_its_kind_until_done() {
        let provider = fixture();
        provider.set_listing_open(false);
        let sched = scheduler(provider.clone(), IntegrationConfig::default());
        sched
            .spawn_kind("fixture", ResourceKind::Issue, CancellationToken::new())
            .unwrap();
        assert!(sched.is_running("fixture", ResourceKind::Issue));
        assert!(matches!(
            sched.spawn_kind("fixture", ResourceKind::Issue, CancellationToken::new()),
            Err(Error::Conflict(_))
        ));

        provider.set_listing_open(true);
        for _ in 0..200 {
            if !sched.is_running("fixture", ResourceKind::Issue) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(!sched.is_running("fixture", ResourceKind::Issue));
        assert_eq!(sched.status().len(), 1);
    }

    #[tokio::test]
    async fn once_mode_returns_after_a_single_round() {
        let provider = fixture();
        let config = IntegrationConfig {
            event_listener_type: EventListenerType::Once,
            ..IntegrationConfig::default()
        };
        let sched = scheduler(provider.clone(), config);
        sched.run_loop(CancellationToken::new()).await;
        assert_eq!(provider.page_fetches(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn polling_mode_repeats_until_cancelled() {
        let provider = fixture();
        let config = IntegrationConfig {
            resync_interval_secs: 1,
            ..IntegrationConfig::default()
        };
        let sched = scheduler(provider.clone(), config);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn({
            let sched = sched.clone();
            let cancel = cancel.clone();
            async move { sched.run_loop(cancel).await }
        });
        tokio::time::sleep(Duration::from_millis(2500)).await;
        cancel.cancel();
        handle.await.unwrap();
        // Rounds at t=0s, 1s and 2s, two kinds each.
        assert_eq!(provider.page_fetches(), 6);
    }
}
