//! Resync passes: paginate, regroup into emission batches, enrich, emit.
//!
//! A pass is stateless. Each call to [`ResyncOrchestrator::batches`] or
//! [`ResyncOrchestrator::run_pass`] starts from a fresh cursor, and nothing survives it
//! apart from the returned [`PassReport`].

use crate::config::Selector;
use crate::context::SyncContext;
use crate::enricher::{BoundedEnricher, DEFAULT_ENRICH_CONCURRENCY};
use crate::models::{Batch, RawRecord, ResourceKind};
use crate::pager::rechunk;
use crate::provider::ProviderClient;
use crate::sink::Sink;
use crate::{Error, Result};
use async_stream::try_stream;
use chrono::{DateTime, Utc};
use futures_util::stream::BoxStream;
use futures_util::{Stream, StreamExt};
use serde::Serialize;
use std::borrow::BorrowMut;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PassState {
    Idle,
    Paginating,
    Enriching,
    Emitting,
    Done,
    Failed,
}

impl PassState {
    pub fn is_terminal(self) -> bool {
        matches!(self, PassState::Done | PassState::Failed)
    }

    pub fn can_transition_to(self, next: PassState) -> bool {
        use PassState::*;
        match (self, next) {
            (Done | Failed, _) => false,
            (_, Failed) => true,
            (Idle, Paginating) => true,
            (Paginating, Enriching | Emitting | Done) => true,
            (Enriching, Emitting) => true,
            (Emitting, Paginating | Done) => true,
            _ => false,
        }
    }
}

/// Tracks and logs one pass's lifecycle.
struct PassMachine {
    provider: &'static str,
    kind: ResourceKind,
    state: PassState,
}

impl PassMachine {
    fn new(provider: &'static str, kind: ResourceKind) -> Self {
        Self {
            provider,
            kind,
            state: PassState::Idle,
        }
    }

    fn advance(&mut self, next: PassState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(Error::BackendMessage(format!(
                "illegal pass transition {:?} -> {next:?}",
                self.state
            )));
        }
        tracing::debug!(provider = self.provider, kind = %self.kind, from = ?self.state, to = ?next, "pass transition");
        self.state = next;
        Ok(())
    }

    fn fail(&mut self) {
        if !self.state.is_terminal() {
            self.state = PassState::Failed;
        }
    }
}

/// Per-pass knobs, resolved from the provider and kind config.
#[derive(Debug, Clone, PartialEq)]
pub struct PassOptions {
    /// Overrides the kind's emission batch size.
    pub batch_size: Option<usize>,
    pub enrich_concurrency: usize,
    pub selector: Selector,
}

impl Default for PassOptions {
    fn default() -> Self {
        Self {
            batch_size: None,
            enrich_concurrency: DEFAULT_ENRICH_CONCURRENCY,
            selector: Selector::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PassReport {
    pub pass_id: Uuid,
    pub provider: String,
    pub kind: ResourceKind,
    pub state: PassState,
    pub batches: u64,
    pub records: u64,
    pub sink_failures: u64,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    /// The failure is eligible for retry on the next scheduled pass.
    pub transient: bool,
}

impl PassReport {
    fn start(provider: &str, kind: ResourceKind) -> Self {
        Self {
            pass_id: Uuid::new_v4(),
            provider: provider.to_string(),
            kind,
            state: PassState::Idle,
            batches: 0,
            records: 0,
            sink_failures: 0,
            started_at: Utc::now(),
            finished_at: None,
            error: None,
            transient: false,
        }
    }

    pub fn is_done(&self) -> bool {
        self.state == PassState::Done
    }
}

/// One open pass: the chunked page sequence plus the enrichment policy for the kind.
struct PassRun<'a> {
    provider: &'a dyn ProviderClient,
    kind: ResourceKind,
    enriched: bool,
    enricher: BoundedEnricher,
    chunks: BoxStream<'a, Result<Vec<RawRecord>>>,
}

impl<'a> PassRun<'a> {
    fn open(
        provider: &'a dyn ProviderClient,
        kind: ResourceKind,
        options: &'a PassOptions,
    ) -> Result<Self> {
        let spec = provider.kinds().get(kind)?;
        let batch_size = options.batch_size.unwrap_or(spec.batch_size);
        let enricher = BoundedEnricher::new(options.enrich_concurrency)?;
        let pages = provider.list_all(kind, &options.selector);
        Ok(Self {
            provider,
            kind,
            enriched: spec.enrich,
            enricher,
            chunks: rechunk(pages, batch_size).boxed(),
        })
    }

    /// Next emission chunk, or `Cancelled` if the token fires first.
    async fn next_chunk(&mut self, cancel: &CancellationToken) -> Result<Option<Vec<RawRecord>>> {
        next_or_cancelled(&mut self.chunks, cancel).await?.transpose()
    }

    async fn enrich(&mut self, records: Vec<RawRecord>) -> Result<Vec<RawRecord>> {
        let (provider, kind) = (self.provider, self.kind);
        self.enricher
            .enrich(records, |record| provider.enrich(kind, record))
            .await
    }
}

async fn next_or_cancelled<S>(stream: &mut S, cancel: &CancellationToken) -> Result<Option<S::Item>>
where
    S: Stream + Unpin,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Error::Cancelled),
        item = stream.next() => Ok(item),
    }
}

/// The one pass pipeline: page, rechunk, enrich, yield. `machine` follows every step; the
/// final `Done` is left to the consumer.
fn pipeline<'a, M>(
    provider: &'a dyn ProviderClient,
    kind: ResourceKind,
    options: &'a PassOptions,
    cancel: CancellationToken,
    machine: M,
) -> BoxStream<'a, Result<Batch>>
where
    M: BorrowMut<PassMachine> + Send + 'a,
{
    let stream = try_stream! {
        let mut owned = machine;
        let machine = owned.borrow_mut();
        let mut run = PassRun::open(provider, kind, options)?;
        let mut seq = 0u64;
        loop {
            machine.advance(PassState::Paginating)?;
            let Some(mut records) = run.next_chunk(&cancel).await? else {
                break;
            };
            if run.enriched {
                machine.advance(PassState::Enriching)?;
                records = run.enrich(records).await?;
            }
            machine.advance(PassState::Emitting)?;
            yield Batch { kind, seq, records };
            seq += 1;
        }
    };
    stream.boxed()
}

#[derive(Clone)]
pub struct ResyncOrchestrator {
    sink: Arc<dyn Sink>,
}

impl ResyncOrchestrator {
    pub fn new(sink: Arc<dyn Sink>) -> Self {
        Self { sink }
    }

    /// Restartable producer of enriched batches for one (provider, kind).
    ///
    /// Every call is a fresh pass. Batches come out in pagination order. Cancellation is only
    /// observed between batches: a batch that started enriching is finished and yielded, and
    /// the next pull returns `Error::Cancelled`.
    pub fn batches<'a>(
        &self,
        provider: &'a dyn ProviderClient,
        kind: ResourceKind,
        options: &'a PassOptions,
        cancel: CancellationToken,
    ) -> BoxStream<'a, Result<Batch>> {
        pipeline(
            provider,
            kind,
            options,
            cancel,
            PassMachine::new(provider.id(), kind),
        )
    }

    /// Drive one pass into the sink.
    ///
    /// Pagination and enrichment errors end the pass as `Failed`. Sink errors are logged and
    /// counted; the pass keeps going.
    #[tracing::instrument(level = "info", skip_all, fields(provider = provider.id(), kind = %kind))]
    pub async fn run_pass(
        &self,
        provider: &dyn ProviderClient,
        kind: ResourceKind,
        options: &PassOptions,
        cancel: &CancellationToken,
    ) -> PassReport {
        let mut report = PassReport::start(provider.id(), kind);
        let mut machine = PassMachine::new(provider.id(), kind);

        let batches = pipeline(provider, kind, options, cancel.clone(), &mut machine);
        let emitted = self.emit_all(batches, &mut report).await;
        let result = emitted.and_then(|()| machine.advance(PassState::Done));
        if let Err(e) = result {
            machine.fail();
            report.transient = e.is_transient();
            report.error = Some(e.to_string());
            tracing::warn!(batches = report.batches, records = report.records, error = %e, "resync pass failed");
        } else {
            tracing::info!(batches = report.batches, records = report.records, sink_failures = report.sink_failures, "resync pass done");
        }
        report.state = machine.state;
        report.finished_at = Some(Utc::now());
        report
    }

    async fn emit_all(
        &self,
        mut batches: BoxStream<'_, Result<Batch>>,
        report: &mut PassReport,
    ) -> Result<()> {
        while let Some(batch) = batches.next().await {
            let Batch { kind, seq, records } = batch?;
            let count = records.len() as u64;
            if let Err(e) = self.sink.upsert_batch(kind, records).await {
                report.sink_failures += 1;
                tracing::warn!(batch = seq, records = count, error = %e, "sink rejected batch");
            }
            tracing::debug!(batch = seq, records = count, "batch emitted");
            report.batches += 1;
            report.records += count;
        }
        Ok(())
    }

    /// Run every configured (provider, kind) pass concurrently.
    #[tracing::instrument(level = "info", skip_all)]
    pub async fn run_all(&self, ctx: &SyncContext, cancel: &CancellationToken) -> Vec<PassReport> {
        let passes = ctx.passes().into_iter().filter_map(|(provider, kind)| {
            let entry = ctx.provider(provider).ok()?;
            Some(async move {
                let options = entry.pass_options(kind);
                self.run_pass(entry.client.as_ref(), kind, &options, cancel)
                    .await
            })
        });
        futures_util::future::join_all(passes).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProviderConfig;
    use crate::kinds::KindSpec;
    use crate::sink::MemorySink;
    use crate::testing::FixtureProvider;
    use futures_util::TryStreamExt;
    use std::time::Duration;

    fn ids(records: &[RawRecord]) -> Vec<String> {
        records.iter().filter_map(|r| r.id("id")).collect()
    }

    fn expected_ids(n: usize) -> Vec<String> {
        (0..n).map(|i| i.to_string()).collect()
    }

    fn issues(count: usize, page_size: usize, batch_size: usize) -> FixtureProvider {
        FixtureProvider::new("fixture")
            .with_kind(KindSpec::new(ResourceKind::Issue, "id").batch_size(batch_size))
            .with_numbered(ResourceKind::Issue, count, page_size)
    }

    fn projects(count: usize, batch_size: usize) -> FixtureProvider {
        FixtureProvider::new("fixture")
            .with_kind(
                KindSpec::new(ResourceKind::Project, "id")
                    .batch_size(batch_size)
                    .enriched(),
            )
            .with_numbered(ResourceKind::Project, count, 100)
    }

    #[tokio::test]
    async fn every_record_lands_in_exactly_one_batch() {
        let provider = issues(23, 5, 10);
        let options = PassOptions::default();
        let orch = ResyncOrchestrator::new(Arc::new(MemorySink::new()));
        let batches: Vec<Batch> = orch
            .batches(&provider, ResourceKind::Issue, &options, CancellationToken::new())
            .try_collect()
            .await
            .unwrap();
        let sizes: Vec<usize> = batches.iter().map(Batch::len).collect();
        assert_eq!(sizes, vec![10, 10, 3]);
        assert_eq!(
            batches.iter().map(|b| b.seq).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
        let all: Vec<RawRecord> = batches.into_iter().flat_map(|b| b.records).collect();
        assert_eq!(ids(&all), expected_ids(23));
    }

    #[tokio::test]
    async fn repeated_passes_are_identical() {
        let provider = projects(17, 4);
        let options = PassOptions::default();
        let orch = ResyncOrchestrator::new(Arc::new(MemorySink::new()));
        let first: Vec<Batch> = orch
            .batches(&provider, ResourceKind::Project, &options, CancellationToken::new())
            .try_collect()
            .await
            .unwrap();
        let second: Vec<Batch> = orch
            .batches(&provider, ResourceKind::Project, &options, CancellationToken::new())
            .try_collect()
            .await
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(first.len(), 5);
    }

    #[tokio::test]
    async fn enriched_batches_keep_order_and_original_fields() {
        let provider = projects(6, 6)
            .enrich_delay("0", Duration::from_millis(30))
            .enrich_delay("1", Duration::from_millis(20));
        let sink = MemorySink::new();
        let orch = ResyncOrchestrator::new(Arc::new(sink.clone()));
        let report = orch
            .run_pass(
                &provider,
                ResourceKind::Project,
                &PassOptions::default(),
                &CancellationToken::new(),
            )
            .await;
        assert!(report.is_done());
        let out = sink.upserted(ResourceKind::Project).await;
        assert_eq!(ids(&out), expected_ids(6));
        for (i, r) in out.iter().enumerate() {
            assert_eq!(r.get("__enriched"), Some(&serde_json::json!(i.to_string())));
            assert_eq!(r.get("name"), Some(&serde_json::json!(format!("record-{i}"))));
        }
    }

    #[tokio::test]
    async fn enrichment_ceiling_holds_through_a_pass() {
        let provider = projects(20, 20);
        let options = PassOptions {
            enrich_concurrency: 3,
            ..PassOptions::default()
        };
        let orch = ResyncOrchestrator::new(Arc::new(MemorySink::new()));
        let report = orch
            .run_pass(&provider, ResourceKind::Project, &options, &CancellationToken::new())
            .await;
        assert!(report.is_done());
        assert_eq!(provider.enrich_calls(), 20);
        assert!(provider.enrich_peak() <= 3);
    }

    #[tokio::test]
    async fn failed_enrichment_emits_nothing_from_that_batch() {
        let provider = projects(30, 10).fail_enrich("12");
        let sink = MemorySink::new();
        let orch = ResyncOrchestrator::new(Arc::new(sink.clone()));
        let report = orch
            .run_pass(
                &provider,
                ResourceKind::Project,
                &PassOptions::default(),
                &CancellationToken::new(),
            )
            .await;
        assert_eq!(report.state, PassState::Failed);
        assert!(report.transient);
        assert_eq!(report.batches, 1);
        let emitted = ids(&sink.upserted(ResourceKind::Project).await);
        assert_eq!(emitted, expected_ids(10));
    }

    #[tokio::test]
    async fn page_error_fails_the_pass_after_earlier_batches() {
        let provider = issues(20, 5, 5).fail_page(ResourceKind::Issue, 2);
        let sink = MemorySink::new();
        let orch = ResyncOrchestrator::new(Arc::new(sink.clone()));
        let report = orch
            .run_pass(
                &provider,
                ResourceKind::Issue,
                &PassOptions::default(),
                &CancellationToken::new(),
            )
            .await;
        assert_eq!(report.state, PassState::Failed);
        assert!(report.transient);
        assert_eq!(sink.upsert_batches(ResourceKind::Issue).await.len(), 2);
    }

    #[tokio::test]
    async fn plain_kinds_skip_enrichment() {
        let provider = issues(8, 4, 4);
        let orch = ResyncOrchestrator::new(Arc::new(MemorySink::new()));
        let report = orch
            .run_pass(
                &provider,
                ResourceKind::Issue,
                &PassOptions::default(),
                &CancellationToken::new(),
            )
            .await;
        assert!(report.is_done());
        assert_eq!(report.records, 8);
        assert_eq!(provider.enrich_calls(), 0);
    }

    #[tokio::test]
    async fn cancellation_stops_at_the_next_batch_boundary() {
        let provider = issues(30, 5, 5);
        let options = PassOptions::default();
        let cancel = CancellationToken::new();
        let orch = ResyncOrchestrator::new(Arc::new(MemorySink::new()));
        let mut stream = orch.batches(&provider, ResourceKind::Issue, &options, cancel.clone());
        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first.len(), 5);
        cancel.cancel();
        assert!(matches!(stream.next().await, Some(Err(Error::Cancelled))));
        assert!(stream.next().await.is_none());
        assert_eq!(provider.page_fetches(), 1);
    }

    #[tokio::test]
    async fn run_pass_emits_exactly_what_batches_yields() {
        let provider = projects(17, 4);
        let options = PassOptions::default();
        let sink = MemorySink::new();
        let orch = ResyncOrchestrator::new(Arc::new(sink.clone()));
        let produced: Vec<Batch> = orch
            .batches(&provider, ResourceKind::Project, &options, CancellationToken::new())
            .try_collect()
            .await
            .unwrap();
        let report = orch
            .run_pass(&provider, ResourceKind::Project, &options, &CancellationToken::new())
            .await;
        assert!(report.is_done());
        assert_eq!(report.batches, produced.len() as u64);
        let emitted = sink.upsert_batches(ResourceKind::Project).await;
        let expected: Vec<Vec<RawRecord>> = produced.into_iter().map(|b| b.records).collect();
        assert_eq!(emitted, expected);
    }

    #[tokio::test]
    async fn spawned_pass_stops_when_cancelled() {
        let provider = Arc::new(issues(50, 5, 5).page_delay(Duration::from_millis(20)));
        let sink = MemorySink::new();
        let orch = ResyncOrchestrator::new(Arc::new(sink.clone()));
        let cancel = CancellationToken::new();
        let task = {
            let provider = provider.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                orch.run_pass(provider.as_ref(), ResourceKind::Issue, &PassOptions::default(), &cancel)
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        let report = task.await.unwrap();
        assert_eq!(report.state, PassState::Failed);
        assert!(report.batches < 10);
        assert_eq!(
            sink.upsert_batches(ResourceKind::Issue).await.len() as u64,
            report.batches
        );
    }

    #[tokio::test]
    async fn cancelled_pass_reports_failed() {
        let provider = issues(10, 5, 5);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let sink = MemorySink::new();
        let orch = ResyncOrchestrator::new(Arc::new(sink.clone()));
        let report = orch
            .run_pass(&provider, ResourceKind::Issue, &PassOptions::default(), &cancel)
            .await;
        assert_eq!(report.state, PassState::Failed);
        assert_eq!(report.error.as_deref(), Some(Error::Cancelled.to_string().as_str()));
        assert!(sink.calls().await.is_empty());
    }

    #[tokio::test]
    async fn sink_failures_are_counted_not_fatal() {
        let provider = issues(10, 5, 5);
        let sink = MemorySink::new();
        sink.set_failing(true);
        let orch = ResyncOrchestrator::new(Arc::new(sink));
        let report = orch
            .run_pass(
                &provider,
                ResourceKind::Issue,
                &PassOptions::default(),
                &CancellationToken::new(),
            )
            .await;
        assert!(report.is_done());
        assert_eq!(report.sink_failures, 2);
        assert_eq!(report.batches, 2);
    }

    #[tokio::test]
    async fn unsupported_kind_fails_immediately() {
        let provider = issues(3, 3, 3);
        let orch = ResyncOrchestrator::new(Arc::new(MemorySink::new()));
        let report = orch
            .run_pass(
                &provider,
                ResourceKind::Incident,
                &PassOptions::default(),
                &CancellationToken::new(),
            )
            .await;
        assert_eq!(report.state, PassState::Failed);
        assert!(!report.transient);
        assert_eq!(provider.page_fetches(), 0);
    }

    #[tokio::test]
    async fn run_all_covers_every_declared_kind() {
        let provider = issues(7, 3, 3)
            .with_kind(KindSpec::new(ResourceKind::Project, "id").enriched())
            .with_numbered(ResourceKind::Project, 4, 2);
        let sink = MemorySink::new();
        let ctx = SyncContext::new(Default::default(), Arc::new(sink.clone()))
            .with_provider(Arc::new(provider), ProviderConfig::new("fixture"))
            .unwrap();
        let orch = ResyncOrchestrator::new(ctx.sink());
        let reports = orch.run_all(&ctx, &CancellationToken::new()).await;
        assert_eq!(reports.len(), 2);
        assert!(reports.iter().all(PassReport::is_done));
        assert_eq!(sink.upserted(ResourceKind::Issue).await.len(), 7);
        assert_eq!(sink.upserted(ResourceKind::Project).await.len(), 4);
    }

    #[test]
    fn pass_transitions() {
        use PassState::*;
        assert!(Idle.can_transition_to(Paginating));
        assert!(Paginating.can_transition_to(Emitting));
        assert!(Paginating.can_transition_to(Enriching));
        assert!(Emitting.can_transition_to(Paginating));
        assert!(Enriching.can_transition_to(Failed));
        assert!(!Enriching.can_transition_to(Done));
        assert!(!Idle.can_transition_to(Emitting));
        assert!(!Done.can_transition_to(Failed));
    }
}
