//! PagerDuty connector.
//!
//! REST API v2. Lists are offset/limit paged and wrapped in a key named after the resource
//! (`{"services": [...], "more": true}`).

use async_trait::async_trait;
use futures_util::StreamExt;
use resync_core::config::{ProviderConfig, Selector};
use resync_core::http::ProviderHttp;
use resync_core::kinds::{KindSpec, KindTable};
use resync_core::models::{RawRecord, ResourceKind, records_from_value};
use resync_core::pager::{Fetched, PageStream, failed, paginate};
use resync_core::provider::ProviderClient;
use resync_core::webhook::{EventRoute, EventTable};
use resync_core::{Error, Result};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::instrument;

pub const PROVIDER: &str = "pagerduty";
const DEFAULT_BASE_URL: &str = "https://api.pagerduty.com";
const PAGE_LIMIT: usize = 100;

const WEBHOOK_EVENTS: &[&str] = &[
    "incident.acknowledged",
    "incident.annotated",
    "incident.delegated",
    "incident.escalated",
    "incident.priority_updated",
    "incident.reassigned",
    "incident.reopened",
    "incident.resolved",
    "incident.triggered",
    "incident.unacknowledged",
    "service.created",
    "service.deleted",
    "service.updated",
];

#[derive(Debug, Deserialize)]
struct Subscription {
    #[serde(default)]
    delivery_method: Option<DeliveryMethod>,
}

#[derive(Debug, Deserialize)]
struct DeliveryMethod {
    #[serde(default)]
    url: Option<String>,
}

pub struct PagerDutyProvider {
    http: ProviderHttp,
    kinds: KindTable,
    events: EventTable,
}

impl PagerDutyProvider {
    pub fn from_config(cfg: &ProviderConfig) -> Result<Self> {
        let token = cfg.require_credential("token")?;
        let http = ProviderHttp::new(
            PROVIDER,
            cfg.base_url_or(DEFAULT_BASE_URL),
            cfg.rate_limit,
        )?
        .with_header("authorization", &format!("Token token={token}"))?
        .with_header("accept", "application/vnd.pagerduty+json;version=2")?;
        Ok(Self {
            http,
            kinds: Self::kind_table(),
            events: Self::event_table(),
        })
    }

    pub fn kind_table() -> KindTable {
        KindTable::new(PROVIDER)
            .with(KindSpec::new(ResourceKind::Service, "id").page_size(PAGE_LIMIT))
            .with(KindSpec::new(ResourceKind::Incident, "id").page_size(PAGE_LIMIT))
    }

    pub fn event_table() -> EventTable {
        EventTable::new(&["/event/event_type", "/event/type"])
            .on(
                "incident.*",
                EventRoute::upsert(ResourceKind::Incident, &["/event/data/id"]),
            )
            .on_each(
                &["service.created", "service.updated"],
                EventRoute::upsert(ResourceKind::Service, &["/event/data/id"]),
            )
            .on(
                "service.deleted",
                EventRoute::delete(ResourceKind::Service, &["/event/data/id"])
                    .with_record("/event/data"),
            )
    }

    fn list(
        &self,
        path: &'static str,
        data_key: &'static str,
        query: Vec<(String, String)>,
        limit: usize,
    ) -> PageStream<'_> {
        paginate(0usize, move |offset| {
            let query = query.clone();
            async move { self.fetch_page(path, data_key, &query, offset, limit).await }
        })
        .boxed()
    }

    #[instrument(level = "debug", skip(self, query))]
    async fn fetch_page(
        &self,
        path: &str,
        data_key: &str,
        query: &[(String, String)],
        offset: usize,
        limit: usize,
    ) -> Result<Fetched<usize>> {
        let req = self
            .http
            .get(path)
            .query(query)
            .query(&page_window(offset, limit));
        let mut body = self.http.send(req).await?.body;
        let more = body.get("more").and_then(Value::as_bool).unwrap_or(false);
        let page = records_from_value(body.get_mut(data_key).map(Value::take).unwrap_or(Value::Null))?;
        let next = (more && !page.is_empty()).then_some(offset + page.len());
        Ok(Fetched::new(page, next))
    }

    async fn get_wrapped(&self, path: &str, key: &str) -> Result<RawRecord> {
        let mut body = self.http.send(self.http.get(path)).await?.body;
        match body.get_mut(key).map(Value::take) {
            Some(record) => RawRecord::from_value(record),
            None => Err(Error::BackendMessage(format!(
                "pagerduty response for {path} has no '{key}'"
            ))),
        }
    }
}

/// `limit` is capped at the API maximum.
fn page_window(offset: usize, limit: usize) -> [(&'static str, usize); 2] {
    [("offset", offset), ("limit", limit.clamp(1, PAGE_LIMIT))]
}

/// String-valued selector extras are passed through as list query parameters
/// (e.g. `since`, `statuses[]`).
fn extra_query(selector: &Selector) -> Vec<(String, String)> {
    selector
        .extra
        .iter()
        .flat_map(|(key, value)| match value {
            Value::String(s) => vec![(key.clone(), s.clone())],
            Value::Array(items) => items
                .iter()
                .filter_map(Value::as_str)
                .map(|s| (key.clone(), s.to_string()))
                .collect(),
            _ => Vec::new(),
        })
        .collect()
}

fn subscription_exists(subscriptions: &[Subscription], url: &str) -> bool {
    subscriptions.iter().any(|s| {
        s.delivery_method
            .as_ref()
            .and_then(|d| d.url.as_deref())
            == Some(url)
    })
}

#[async_trait]
impl ProviderClient for PagerDutyProvider {
    fn id(&self) -> &'static str {
        PROVIDER
    }

    fn kinds(&self) -> &KindTable {
        &self.kinds
    }

    fn events(&self) -> &EventTable {
        &self.events
    }

    fn list_all<'a>(&'a self, kind: ResourceKind, selector: &'a Selector) -> PageStream<'a> {
        let limit = match self.kinds.get(kind) {
            Ok(spec) => spec.page_size,
            Err(e) => return failed(e),
        };
        match kind {
            ResourceKind::Service => self.list("services", "services", extra_query(selector), limit),
            ResourceKind::Incident => {
                self.list("incidents", "incidents", extra_query(selector), limit)
            }
            other => failed(Error::unsupported_kind(PROVIDER, other)),
        }
    }

    #[instrument(level = "debug", skip(self))]
    async fn get_one(&self, kind: ResourceKind, id: &str) -> Result<RawRecord> {
        match kind {
            ResourceKind::Incident => self.get_wrapped(&format!("incidents/{id}"), "incident").await,
            ResourceKind::Service => self.get_wrapped(&format!("services/{id}"), "service").await,
            other => Err(Error::unsupported_kind(PROVIDER, other)),
        }
    }

    #[instrument(level = "info", skip(self))]
    async fn register_webhooks(&self, app_host: &str) -> Result<()> {
        let url = format!("{app_host}/integration/pagerduty/webhook");
        let body = self
            .http
            .send(self.http.get("webhook_subscriptions"))
            .await?
            .body;
        let subscriptions: Vec<Subscription> = serde_json::from_value(
            body.get("webhook_subscriptions").cloned().unwrap_or(Value::Array(Vec::new())),
        )
        .map_err(|e| Error::backend("decode pagerduty webhook subscriptions", e))?;
        if subscription_exists(&subscriptions, &url) {
            tracing::info!(%url, "pagerduty webhook subscription already present");
            return Ok(());
        }

        let payload = json!({
            "webhook_subscription": {
                "type": "webhook_subscription",
                "delivery_method": {"type": "http_delivery_method", "url": url},
                "description": "resync live changes",
                "events": WEBHOOK_EVENTS,
                "filter": {"type": "account_reference"},
            }
        });
        self.http
            .send(self.http.post("webhook_subscriptions").json(&payload))
            .await?;
        tracing::info!(%url, "pagerduty webhook subscription created");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use resync_core::models::WebhookEvent;
    use resync_core::webhook::Action;

    fn event(event_type: &str, data: Value) -> WebhookEvent {
        WebhookEvent::new(
            PROVIDER,
            json!({"event": {"event_type": event_type, "data": data}}),
        )
    }

    #[test]
    fn incident_lifecycle_events_refetch() {
        let table = PagerDutyProvider::event_table();
        for t in ["incident.triggered", "incident.resolved", "incident.priority_updated"] {
            assert_eq!(
                table.classify(&event(t, json!({"id": "P1"}))).unwrap(),
                Action::Upsert {
                    kind: ResourceKind::Incident,
                    id: "P1".to_string(),
                    identity: None,
                }
            );
        }
    }

    #[test]
    fn service_delete_carries_embedded_record() {
        let table = PagerDutyProvider::event_table();
        let action = table
            .classify(&event("service.deleted", json!({"id": "S9", "name": "api"})))
            .unwrap();
        match action {
            Action::Delete { kind, id, record, .. } => {
                assert_eq!(kind, ResourceKind::Service);
                assert_eq!(id, "S9");
                assert_eq!(record.unwrap().get("name"), Some(&json!("api")));
            }
            other => panic!("unexpected action {other:?}"),
        }
    }

    #[test]
    fn legacy_type_field_and_unmapped_events() {
        let table = PagerDutyProvider::event_table();
        let legacy = WebhookEvent::new(
            PROVIDER,
            json!({"event": {"type": "service.updated", "data": {"id": "S1"}}}),
        );
        assert!(matches!(
            table.classify(&legacy).unwrap(),
            Action::Upsert { kind: ResourceKind::Service, .. }
        ));
        assert!(matches!(
            table.classify(&event("pagey.ping", json!({}))).unwrap(),
            Action::Ignore { .. }
        ));
        let no_id = event("incident.triggered", json!({}));
        assert!(matches!(table.classify(&no_id), Err(Error::MalformedEvent(_))));
    }

    #[test]
    fn selector_extras_become_query_params() {
        let mut selector = Selector::default();
        selector.extra.insert("since".into(), json!("2024-01-01"));
        selector
            .extra
            .insert("statuses[]".into(), json!(["triggered", "acknowledged"]));
        selector.extra.insert("ignored".into(), json!(3));
        let query = extra_query(&selector);
        assert_eq!(query.len(), 3);
        assert!(query.contains(&("since".to_string(), "2024-01-01".to_string())));
    }

    #[test]
    fn page_window_follows_kind_page_size() {
        let table = PagerDutyProvider::kind_table();
        let spec = table.get(ResourceKind::Incident).unwrap();
        assert_eq!(page_window(200, spec.page_size), [("offset", 200), ("limit", 100)]);
        assert_eq!(page_window(0, 25), [("offset", 0), ("limit", 25)]);
        assert_eq!(page_window(0, 500), [("offset", 0), ("limit", 100)]);
    }

    #[test]
    fn existing_subscription_is_detected() {
        let subs: Vec<Subscription> = serde_json::from_value(json!([
            {"delivery_method": {"url": "https://hooks.example.com/integration/pagerduty/webhook"}},
            {"delivery_method": null}
        ]))
        .unwrap();
        assert!(subscription_exists(
            &subs,
            "https://hooks.example.com/integration/pagerduty/webhook"
        ));
        assert!(!subscription_exists(&subs, "https://other.example.com"));
    }

    #[test]
    fn token_required() {
        assert!(matches!(
            PagerDutyProvider::from_config(&ProviderConfig::new(PROVIDER)),
            Err(Error::Configuration(_))
        ));
        let cfg = ProviderConfig::new(PROVIDER).with_credential("token", "u+abc");
        let provider = PagerDutyProvider::from_config(&cfg).unwrap();
        assert!(provider.kinds().supports(ResourceKind::Incident));
        assert!(!provider.kinds().supports(ResourceKind::Project));
    }
}
