use crate::http::ProviderHttp;
use crate::models::{RawRecord, ResourceKind};
use crate::{Error, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;

/// Downstream catalog contract.
///
/// Both calls are fire-and-forget from the pipeline's point of view: a failure is logged and
/// counted by the caller, never retried there.
#[async_trait]
pub trait Sink: Send + Sync {
    async fn upsert_batch(&self, kind: ResourceKind, records: Vec<RawRecord>) -> Result<()>;

    async fn delete_batch(&self, kind: ResourceKind, records: Vec<RawRecord>) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum SinkCall {
    Upsert {
        kind: ResourceKind,
        records: Vec<RawRecord>,
    },
    Delete {
        kind: ResourceKind,
        records: Vec<RawRecord>,
    },
}

/// In-memory sink for local development and unit tests.
#[derive(Clone, Default)]
pub struct MemorySink {
    calls: Arc<Mutex<Vec<SinkCall>>>,
    failing: Arc<AtomicBool>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call fail (or succeed again).
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub async fn calls(&self) -> Vec<SinkCall> {
        self.calls.lock().await.clone()
    }

    /// Upserted batches for `kind`, in call order.
    pub async fn upsert_batches(&self, kind: ResourceKind) -> Vec<Vec<RawRecord>> {
        self.calls
            .lock()
            .await
            .iter()
            .filter_map(|c| match c {
                SinkCall::Upsert { kind: k, records } if *k == kind => Some(records.clone()),
                _ => None,
            })
            .collect()
    }

    pub async fn upserted(&self, kind: ResourceKind) -> Vec<RawRecord> {
        self.upsert_batches(kind).await.into_iter().flatten().collect()
    }

    pub async fn deleted(&self, kind: ResourceKind) -> Vec<RawRecord> {
        self.calls
            .lock()
            .await
            .iter()
            .filter_map(|c| match c {
                SinkCall::Delete { kind: k, records } if *k == kind => Some(records.clone()),
                _ => None,
            })
            .flatten()
            .collect()
    }

    async fn record(&self, call: SinkCall) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::BackendMessage("memory sink set to fail".to_string()));
        }
        self.calls.lock().await.push(call);
        Ok(())
    }
}

#[async_trait]
impl Sink for MemorySink {
    async fn upsert_batch(&self, kind: ResourceKind, records: Vec<RawRecord>) -> Result<()> {
        self.record(SinkCall::Upsert { kind, records }).await
    }

    async fn delete_batch(&self, kind: ResourceKind, records: Vec<RawRecord>) -> Result<()> {
        self.record(SinkCall::Delete { kind, records }).await
    }
}

/// Sink used when no downstream is configured: logs what would have been sent.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

#[async_trait]
impl Sink for TracingSink {
    async fn upsert_batch(&self, kind: ResourceKind, records: Vec<RawRecord>) -> Result<()> {
        tracing::info!(%kind, records = records.len(), "upsert batch");
        Ok(())
    }

    async fn delete_batch(&self, kind: ResourceKind, records: Vec<RawRecord>) -> Result<()> {
        tracing::info!(%kind, records = records.len(), "delete batch");
        Ok(())
    }
}

/// Posts `{"kind", "records"}` to `{sink_url}/upsert` and `{sink_url}/delete`.
#[derive(Debug, Clone)]
pub struct HttpSink {
    http: ProviderHttp,
}

impl HttpSink {
    pub fn new(sink_url: &str) -> Result<Self> {
        if sink_url.trim().is_empty() {
            return Err(Error::Configuration("sink_url is empty".to_string()));
        }
        Ok(Self {
            http: ProviderHttp::new("sink", sink_url, 4)?,
        })
    }

    #[tracing::instrument(level = "debug", skip(self, records), fields(records = records.len()))]
    async fn post(&self, op: &str, kind: ResourceKind, records: Vec<RawRecord>) -> Result<()> {
        let body = serde_json::json!({ "kind": kind, "records": records });
        self.http.send(self.http.post(op).json(&body)).await?;
        Ok(())
    }
}

#[async_trait]
impl Sink for HttpSink {
    async fn upsert_batch(&self, kind: ResourceKind, records: Vec<RawRecord>) -> Result<()> {
        self.post("upsert", kind, records).await
    }

    async fn delete_batch(&self, kind: ResourceKind, records: Vec<RawRecord>) -> Result<()> {
        self.post("delete", kind, records).await
    }
}
