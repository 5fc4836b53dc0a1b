use crate::config::Selector;
use crate::kinds::KindTable;
use crate::models::{Fields, RawRecord, ResourceKind, WebhookEvent};
use crate::pager::PageStream;
use crate::webhook::EventTable;
use crate::Result;
use async_trait::async_trait;

/// One upstream provider's resource kinds as a set of operations.
///
/// Implementations live in `resync_integrations` (or test fixtures). They hold their own HTTP
/// gate and credentials and carry no per-pass state: every `list_all` starts from a fresh
/// cursor.
#[async_trait]
pub trait ProviderClient: Send + Sync {
    /// Provider identifier (stable; used in config, routes and logs).
    fn id(&self) -> &'static str;

    fn kinds(&self) -> &KindTable;

    fn events(&self) -> &EventTable;

    /// Lazy page sequence over every record of `kind` matching `selector`.
    ///
    /// An unsupported kind yields a sequence holding a single `UnsupportedKind` error.
    fn list_all<'a>(&'a self, kind: ResourceKind, selector: &'a Selector) -> PageStream<'a>;

    /// Extra fields for one record. Only called for kinds whose `KindSpec` is marked enriched.
    async fn enrich(&self, kind: ResourceKind, record: RawRecord) -> Result<Fields> {
        let _ = (kind, record);
        Ok(Fields::new())
    }

    /// Fetch a single record by id. A missing record is `Error::NotFound`.
    async fn get_one(&self, kind: ResourceKind, id: &str) -> Result<RawRecord>;

    /// Authenticate an inbound webhook before it is routed.
    fn verify_webhook(&self, event: &WebhookEvent) -> Result<()> {
        let _ = event;
        Ok(())
    }

    /// Register (idempotently) the webhooks pointing at `app_host`.
    async fn register_webhooks(&self, app_host: &str) -> Result<()> {
        let _ = app_host;
        Ok(())
    }
}
