use crate::config::{EventListenerType, IntegrationConfig, ProviderConfig};
use crate::models::ResourceKind;
use crate::orchestrator::PassOptions;
use crate::provider::ProviderClient;
use crate::sink::{HttpSink, Sink, TracingSink};
use crate::webhook::WebhookRouter;
use crate::{Error, Result};
use std::collections::BTreeMap;
use std::sync::Arc;

/// A constructed provider client with the config it was built from.
#[derive(Clone)]
pub struct ProviderEntry {
    pub client: Arc<dyn ProviderClient>,
    pub config: ProviderConfig,
}

impl ProviderEntry {
    pub fn new(client: Arc<dyn ProviderClient>, config: ProviderConfig) -> Result<Self> {
        config.validate()?;
        for k in &config.kinds {
            if !client.kinds().supports(k.kind) {
                return Err(Error::Configuration(
                    Error::unsupported_kind(client.id(), k.kind).to_string(),
                ));
            }
        }
        Ok(Self { client, config })
    }

    pub fn id(&self) -> &'static str {
        self.client.id()
    }

    /// Kinds to resync: the configured ones, or every supported kind when none are listed.
    pub fn declared_kinds(&self) -> Vec<ResourceKind> {
        if self.config.kinds.is_empty() {
            self.client.kinds().kinds().collect()
        } else {
            self.config.kinds.iter().map(|k| k.kind).collect()
        }
    }

    pub fn pass_options(&self, kind: ResourceKind) -> PassOptions {
        let kind_cfg = self.config.kind(kind);
        PassOptions {
            batch_size: kind_cfg.and_then(|k| k.batch_size),
            enrich_concurrency: kind_cfg
                .and_then(|k| k.enrich_concurrency)
                .unwrap_or(self.config.enrich_concurrency),
            selector: kind_cfg.map(|k| k.selector.clone()).unwrap_or_default(),
        }
    }
}

/// Everything an operation needs, built once at startup and passed down.
#[derive(Clone)]
pub struct SyncContext {
    config: IntegrationConfig,
    providers: BTreeMap<&'static str, ProviderEntry>,
    sink: Arc<dyn Sink>,
    router: WebhookRouter,
}

impl SyncContext {
    pub fn new(config: IntegrationConfig, sink: Arc<dyn Sink>) -> Self {
        Self {
            config,
            providers: BTreeMap::new(),
            router: WebhookRouter::new(sink.clone()),
            sink,
        }
    }

    /// Build every configured provider through `factory`.
    ///
    /// A provider that fails with a configuration error is logged and skipped; the others
    /// are still built. Any other error aborts.
    #[tracing::instrument(level = "info", skip_all, fields(providers = config.providers.len()))]
    pub fn build<F>(config: IntegrationConfig, sink: Arc<dyn Sink>, factory: F) -> Result<Self>
    where
        F: Fn(&ProviderConfig) -> Result<Arc<dyn ProviderClient>>,
    {
        let provider_configs = config.providers.clone();
        let mut ctx = Self::new(config, sink);
        for pc in provider_configs {
            let entry = factory(&pc).and_then(|client| ProviderEntry::new(client, pc.clone()));
            match entry {
                Ok(entry) => {
                    tracing::info!(provider = entry.id(), kinds = ?entry.declared_kinds(), "provider ready");
                    ctx.providers.insert(entry.id(), entry);
                }
                Err(Error::Configuration(msg)) => {
                    tracing::error!(provider = %pc.provider, error = %msg, "provider disabled by configuration error");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(ctx)
    }

    pub fn with_provider(
        mut self,
        client: Arc<dyn ProviderClient>,
        config: ProviderConfig,
    ) -> Result<Self> {
        let entry = ProviderEntry::new(client, config)?;
        self.providers.insert(entry.id(), entry);
        Ok(self)
    }

    pub fn config(&self) -> &IntegrationConfig {
        &self.config
    }

    pub fn sink(&self) -> Arc<dyn Sink> {
        self.sink.clone()
    }

    pub fn router(&self) -> &WebhookRouter {
        &self.router
    }

    pub fn provider(&self, id: &str) -> Result<&ProviderEntry> {
        self.providers
            .get(id)
            .ok_or_else(|| Error::NotFound(format!("provider '{id}' is not configured")))
    }

    pub fn providers(&self) -> impl Iterator<Item = &ProviderEntry> + '_ {
        self.providers.values()
    }

    /// Every (provider, kind) pair a full resync covers.
    pub fn passes(&self) -> Vec<(&'static str, ResourceKind)> {
        self.providers
            .values()
            .flat_map(|p| p.declared_kinds().into_iter().map(move |k| (p.id(), k)))
            .collect()
    }

    /// Register provider webhooks against `app_host`.
    ///
    /// Skipped in one-shot mode and when no `app_host` is configured. A provider that fails
    /// to register is logged; the rest still register. Returns how many providers registered.
    #[tracing::instrument(level = "info", skip(self))]
    pub async fn setup_webhooks(&self) -> usize {
        if self.config.event_listener_type == EventListenerType::Once {
            tracing::info!("event listener type is ONCE, skipping webhook setup");
            return 0;
        }
        let Some(app_host) = self.config.app_host() else {
            tracing::warn!("no app_host configured; live changes will not be exported");
            return 0;
        };
        let mut registered = 0;
        for entry in self.providers.values() {
            match entry.client.register_webhooks(app_host).await {
                Ok(()) => {
                    registered += 1;
                    tracing::info!(provider = entry.id(), %app_host, "webhooks registered");
                }
                Err(e) => {
                    tracing::warn!(provider = entry.id(), error = %e, "webhook registration failed");
                }
            }
        }
        registered
    }
}

/// Sink selected by the config: HTTP when `sink_url` is set, logging otherwise.
pub fn sink_from_config(config: &IntegrationConfig) -> Result<Arc<dyn Sink>> {
    match config.sink_url.as_deref().filter(|u| !u.trim().is_empty()) {
        Some(url) => Ok(Arc::new(HttpSink::new(url)?)),
        None => Ok(Arc::new(TracingSink)),
    }
}
