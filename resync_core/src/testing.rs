//! In-memory provider used by unit tests here and in the integrations/server crates.

use crate::config::Selector;
use crate::kinds::{KindSpec, KindTable};
use crate::models::{Fields, Page, RawRecord, ResourceKind, WebhookEvent};
use crate::pager::{Fetched, PageStream, failed, paginate};
use crate::provider::ProviderClient;
use crate::webhook::EventTable;
use crate::{Error, Result};
use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::json;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;

#[derive(Default)]
struct Counters {
    page_fetches: AtomicUsize,
    get_one_calls: AtomicUsize,
    enrich_calls: AtomicUsize,
    enrich_in_flight: AtomicUsize,
    enrich_peak: AtomicUsize,
}

/// Scripted provider: fixed pages per kind, live records for refetch, injectable failures
/// and enrichment latency, plus call counters.
#[derive(Clone)]
pub struct FixtureProvider {
    id: &'static str,
    kinds: KindTable,
    events: EventTable,
    pages: BTreeMap<ResourceKind, Vec<Page>>,
    live: BTreeMap<(ResourceKind, String), RawRecord>,
    fail_page: Option<(ResourceKind, usize)>,
    enrich_failures: HashSet<String>,
    enrich_delays: BTreeMap<String, Duration>,
    page_delay: Option<Duration>,
    token: Option<String>,
    fail_registration: bool,
    registered: Arc<Mutex<Vec<String>>>,
    counters: Arc<Counters>,
    listing_gate: Arc<AtomicBool>,
}

impl FixtureProvider {
    pub fn new(id: &'static str) -> Self {
        Self {
            id,
            kinds: KindTable::new(id),
            events: EventTable::default(),
            pages: BTreeMap::new(),
            live: BTreeMap::new(),
            fail_page: None,
            enrich_failures: HashSet::new(),
            enrich_delays: BTreeMap::new(),
            page_delay: None,
            token: None,
            fail_registration: false,
            registered: Arc::new(Mutex::new(Vec::new())),
            counters: Arc::new(Counters::default()),
            listing_gate: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn with_kinds(mut self, kinds: KindTable) -> Self {
        self.kinds = kinds;
        self
    }

    pub fn with_kind(mut self, spec: KindSpec) -> Self {
        self.kinds = self.kinds.with(spec);
        self
    }

    pub fn with_events(mut self, events: EventTable) -> Self {
        self.events = events;
        self
    }

    pub fn with_pages(mut self, kind: ResourceKind, pages: Vec<Page>) -> Self {
        self.pages.insert(kind, pages);
        self
    }

    /// `count` records with ids `0..count` split into pages of `page_size`.
    pub fn with_numbered(self, kind: ResourceKind, count: usize, page_size: usize) -> Self {
        let records: Vec<RawRecord> = (0..count).map(numbered).collect();
        let pages = records.chunks(page_size.max(1)).map(<[RawRecord]>::to_vec).collect();
        self.with_pages(kind, pages)
    }

    pub fn with_live(mut self, kind: ResourceKind, id: &str, record: RawRecord) -> Self {
        self.live.insert((kind, id.to_string()), record);
        self
    }

    /// Fetching page `index` of `kind` fails with a transient error.
    pub fn fail_page(mut self, kind: ResourceKind, index: usize) -> Self {
        self.fail_page = Some((kind, index));
        self
    }

    pub fn fail_enrich(mut self, id: &str) -> Self {
        self.enrich_failures.insert(id.to_string());
        self
    }

    pub fn enrich_delay(mut self, id: &str, delay: Duration) -> Self {
        self.enrich_delays.insert(id.to_string(), delay);
        self
    }

    pub fn page_delay(mut self, delay: Duration) -> Self {
        self.page_delay = Some(delay);
        self
    }

    /// Webhooks must carry `Authorization: Bearer <token>`.
    pub fn require_token(mut self, token: &str) -> Self {
        self.token = Some(token.to_string());
        self
    }

    pub fn fail_registration(mut self) -> Self {
        self.fail_registration = true;
        self
    }

    pub fn page_fetches(&self) -> usize {
        self.counters.page_fetches.load(Ordering::SeqCst)
    }

    pub fn get_one_calls(&self) -> usize {
        self.counters.get_one_calls.load(Ordering::SeqCst)
    }

    pub fn enrich_calls(&self) -> usize {
        self.counters.enrich_calls.load(Ordering::SeqCst)
    }

    /// Highest number of enrichment calls observed in flight at once.
    pub fn enrich_peak(&self) -> usize {
        self.counters.enrich_peak.load(Ordering::SeqCst)
    }

    pub async fn registered(&self) -> Vec<String> {
        self.registered.lock().await.clone()
    }

    /// Block (`false`) or release (`true`) page fetches. Blocked fetches poll until released.
    pub fn set_listing_open(&self, open: bool) {
        self.listing_gate.store(open, Ordering::SeqCst);
    }

    async fn fetch_page(&self, kind: ResourceKind, index: usize) -> Result<Fetched<usize>> {
        while !self.listing_gate.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        self.counters.page_fetches.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.page_delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_page == Some((kind, index)) {
            return Err(Error::transient(format!("{kind} page {index} unavailable")));
        }
        let pages = self.pages.get(&kind);
        let page = pages.and_then(|p| p.get(index)).cloned().unwrap_or_default();
        let total = pages.map(Vec::len).unwrap_or(0);
        Ok(Fetched::new(page, (index + 1 < total).then_some(index + 1)))
    }
}

/// `{"id": i, "name": "record-i"}`
pub fn numbered(i: usize) -> RawRecord {
    let value = json!({ "id": i, "name": format!("record-{i}") });
    match value {
        serde_json::Value::Object(map) => RawRecord::new(map),
        _ => RawRecord::default(),
    }
}

#[async_trait]
impl ProviderClient for FixtureProvider {
    fn id(&self) -> &'static str {
        self.id
    }

    fn kinds(&self) -> &KindTable {
        &self.kinds
    }

    fn events(&self) -> &EventTable {
        &self.events
    }

    fn list_all<'a>(&'a self, kind: ResourceKind, _selector: &'a Selector) -> PageStream<'a> {
        if let Err(e) = self.kinds.get(kind) {
            return failed(e);
        }
        paginate(0usize, move |index| self.fetch_page(kind, index)).boxed()
    }

    async fn enrich(&self, kind: ResourceKind, record: RawRecord) -> Result<Fields> {
        let id = record.id(self.kinds.get(kind)?.id_field).unwrap_or_default();
        self.counters.enrich_calls.fetch_add(1, Ordering::SeqCst);
        let now = self.counters.enrich_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.counters.enrich_peak.fetch_max(now, Ordering::SeqCst);
        let delay = self
            .enrich_delays
            .get(&id)
            .copied()
            .unwrap_or(Duration::from_millis(1));
        tokio::time::sleep(delay).await;
        self.counters.enrich_in_flight.fetch_sub(1, Ordering::SeqCst);
        if self.enrich_failures.contains(&id) {
            return Err(Error::transient(format!("enrichment of {id} failed")));
        }
        let mut extra = Fields::new();
        extra.insert("__enriched".to_string(), json!(id));
        Ok(extra)
    }

    async fn get_one(&self, kind: ResourceKind, id: &str) -> Result<RawRecord> {
        self.counters.get_one_calls.fetch_add(1, Ordering::SeqCst);
        self.live
            .get(&(kind, id.to_string()))
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("{kind} {id}")))
    }

    fn verify_webhook(&self, event: &WebhookEvent) -> Result<()> {
        let Some(token) = &self.token else {
            return Ok(());
        };
        let expected = format!("Bearer {token}");
        match event.header("authorization") {
            Some(got) if got == expected => Ok(()),
            _ => Err(Error::Unauthorized(format!(
                "{} webhook failed verification",
                self.id
            ))),
        }
    }

    async fn register_webhooks(&self, app_host: &str) -> Result<()> {
        if self.fail_registration {
            return Err(Error::transient("hook registration unavailable"));
        }
        self.registered.lock().await.push(app_host.to_string());
        Ok(())
    }
}
