use crate::models::{Fields, RawRecord};
use crate::{Error, Result};
use futures_util::StreamExt;
use futures_util::stream::FuturesUnordered;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;

/// Default number of enrichment calls in flight for one batch.
pub const DEFAULT_ENRICH_CONCURRENCY: usize = 10;

/// Runs per-record enrichment with at most `concurrency` calls in flight and re-joins the
/// results in input order.
///
/// The ceiling is local to one call of [`BoundedEnricher::enrich`]; provider-wide throttling
/// lives in the provider's HTTP gate.
#[derive(Debug, Clone, Copy)]
pub struct BoundedEnricher {
    concurrency: usize,
}

impl BoundedEnricher {
    pub fn new(concurrency: usize) -> Result<Self> {
        if concurrency == 0 {
            return Err(Error::InvalidInput(
                "enrich concurrency must be > 0".to_string(),
            ));
        }
        Ok(Self { concurrency })
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Enrich every record of `records`, fail-fast.
    ///
    /// The first failing call aborts the batch: outstanding calls are dropped and no record of
    /// the batch is returned.
    #[tracing::instrument(level = "debug", skip(self, records, enrich), fields(records = records.len(), concurrency = self.concurrency))]
    pub async fn enrich<F, Fut>(&self, records: Vec<RawRecord>, enrich: F) -> Result<Vec<RawRecord>>
    where
        F: Fn(RawRecord) -> Fut,
        Fut: Future<Output = Result<Fields>>,
    {
        if records.is_empty() {
            return Ok(records);
        }
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut in_flight = FuturesUnordered::new();
        for (idx, record) in records.iter().cloned().enumerate() {
            let semaphore = semaphore.clone();
            let call = &enrich;
            in_flight.push(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .map_err(|_| Error::BackendMessage("enrich semaphore closed".to_string()))?;
                let extra = call(record).await?;
                Ok::<_, Error>((idx, extra))
            });
        }

        let mut slots: Vec<Option<Fields>> = (0..records.len()).map(|_| None).collect();
        while let Some(res) = in_flight.next().await {
            let (idx, extra) = res?;
            slots[idx] = Some(extra);
        }
        drop(in_flight);

        records
            .into_iter()
            .zip(slots)
            .map(|(record, extra)| match extra {
                Some(extra) => record.augment(extra),
                None => Err(Error::BackendMessage(
                    "enrichment result missing".to_string(),
                )),
            })
            .collect()
    }
}

impl Default for BoundedEnricher {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_ENRICH_CONCURRENCY,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn rec(id: usize) -> RawRecord {
        RawRecord::from_value(json!({ "id": id })).unwrap()
    }

    fn extra(key: &str, value: serde_json::Value) -> Fields {
        let mut f = Fields::new();
        f.insert(key.to_string(), value);
        f
    }

    #[tokio::test]
    async fn output_keeps_input_order_under_inverse_latency() {
        let enricher = BoundedEnricher::new(3).unwrap();
        let records = vec![rec(0), rec(1), rec(2)];
        let out = enricher
            .enrich(records, |r| async move {
                let id: u64 = r.id("id").unwrap().parse().unwrap();
                tokio::time::sleep(Duration::from_millis(30 - id * 10)).await;
                Ok(extra("__seen", json!(id)))
            })
            .await
            .unwrap();
        let seen: Vec<_> = out.iter().map(|r| r.get("__seen").cloned().unwrap()).collect();
        assert_eq!(seen, vec![json!(0), json!(1), json!(2)]);
        assert_eq!(out[1].id("id").as_deref(), Some("1"));
    }

    #[tokio::test]
    async fn never_exceeds_the_ceiling() {
        let enricher = BoundedEnricher::new(3).unwrap();
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let records: Vec<RawRecord> = (0..20).map(rec).collect();
        let out = enricher
            .enrich(records, |_r| {
                let current = current.clone();
                let peak = peak.clone();
                async move {
                    let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    current.fetch_sub(1, Ordering::SeqCst);
                    Ok(Fields::new())
                }
            })
            .await
            .unwrap();
        assert_eq!(out.len(), 20);
        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert!(peak.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn one_failure_fails_the_whole_batch() {
        let enricher = BoundedEnricher::new(2).unwrap();
        let records = vec![rec(1), rec(2), rec(3)];
        let err = enricher
            .enrich(records, |r| async move {
                if r.id("id").as_deref() == Some("2") {
                    return Err(Error::transient("languages endpoint 502"));
                }
                Ok(extra("__languages", json!({})))
            })
            .await
            .unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn colliding_enrichment_key_is_an_error() {
        let enricher = BoundedEnricher::default();
        let err = enricher
            .enrich(vec![rec(1)], |_r| async move { Ok(extra("id", json!(99))) })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        assert!(BoundedEnricher::new(0).is_err());
    }
}
