//! Cursor-driven pagination and lazy page adapters.
//!
//! Every adapter pulls from its upstream only when polled, so a pipeline built from them
//! never holds more than the page being processed plus the batch being assembled.

use crate::models::{Page, RawRecord};
use crate::{Error, Result};
use async_stream::try_stream;
use futures_util::stream::BoxStream;
use futures_util::{Stream, StreamExt};
use std::collections::HashSet;
use std::future::Future;

/// Boxed page sequence as returned by provider clients.
pub type PageStream<'a> = BoxStream<'a, Result<Page>>;

/// Output of one fetch step: the page and the cursor for the next step, if any.
#[derive(Debug, Clone, PartialEq)]
pub struct Fetched<C> {
    pub page: Page,
    pub next: Option<C>,
}

impl<C> Fetched<C> {
    pub fn new(page: Page, next: Option<C>) -> Self {
        Self { page, next }
    }
}

/// Drive `fetch` from `initial` until it returns no next cursor or an empty page.
///
/// The cursor is owned by the sequence and dropped with it. A fetch error is yielded once
/// and ends the sequence; pages yielded before it stay valid.
pub fn paginate<'a, C, F, Fut>(initial: C, mut fetch: F) -> impl Stream<Item = Result<Page>> + Send + 'a
where
    C: Send + 'a,
    F: FnMut(C) -> Fut + Send + 'a,
    Fut: Future<Output = Result<Fetched<C>>> + Send + 'a,
{
    try_stream! {
        let mut cursor = Some(initial);
        while let Some(current) = cursor.take() {
            let Fetched { page, next } = fetch(current).await?;
            if page.is_empty() {
                break;
            }
            cursor = next;
            yield page;
        }
    }
}

/// Two-level fetch: for every parent record, yield all pages of its children.
pub fn flatten_children<'a, S, F, T>(parents: S, mut children: F) -> impl Stream<Item = Result<Page>> + Send + 'a
where
    S: Stream<Item = Result<Page>> + Send + 'a,
    F: FnMut(RawRecord) -> T + Send + 'a,
    T: Stream<Item = Result<Page>> + Send + 'a,
{
    try_stream! {
        let mut parents = Box::pin(parents);
        while let Some(parent_page) = parents.next().await {
            for parent in parent_page? {
                let mut child_pages = Box::pin(children(parent));
                while let Some(child_page) = child_pages.next().await {
                    let child_page = child_page?;
                    if !child_page.is_empty() {
                        yield child_page;
                    }
                }
            }
        }
    }
}

/// Replace every record by zero or more derived records. Pages left empty are dropped.
pub fn flat_map_records<'a, S, F, I>(pages: S, mut f: F) -> impl Stream<Item = Result<Page>> + Send + 'a
where
    S: Stream<Item = Result<Page>> + Send + 'a,
    F: FnMut(RawRecord) -> I + Send + 'a,
    I: IntoIterator<Item = RawRecord>,
{
    try_stream! {
        let mut pages = Box::pin(pages);
        while let Some(page) = pages.next().await {
            let mapped: Page = page?.into_iter().flat_map(&mut f).collect();
            if !mapped.is_empty() {
                yield mapped;
            }
        }
    }
}

pub fn map_records<'a, S, F>(pages: S, mut f: F) -> impl Stream<Item = Result<Page>> + Send + 'a
where
    S: Stream<Item = Result<Page>> + Send + 'a,
    F: FnMut(RawRecord) -> RawRecord + Send + 'a,
{
    flat_map_records(pages, move |record| std::iter::once(f(record)))
}

/// Client-side filter (e.g. a time window the provider cannot apply itself).
pub fn filter_records<'a, S, P>(pages: S, mut keep: P) -> impl Stream<Item = Result<Page>> + Send + 'a
where
    S: Stream<Item = Result<Page>> + Send + 'a,
    P: FnMut(&RawRecord) -> bool + Send + 'a,
{
    flat_map_records(pages, move |record| keep(&record).then_some(record))
}

/// Drop records whose identity was already seen in this sequence.
///
/// Records without an identity are passed through untouched.
pub fn dedupe_by_id<'a, S>(pages: S, id_field: &'static str) -> impl Stream<Item = Result<Page>> + Send + 'a
where
    S: Stream<Item = Result<Page>> + Send + 'a,
{
    let mut seen = HashSet::new();
    flat_map_records(pages, move |record| {
        if let Some(id) = record.id(id_field) {
            if !seen.insert(id) {
                return None;
            }
        }
        Some(record)
    })
}

/// Regroup the concatenated records of `pages` into chunks of exactly `size`
/// (the final chunk may be shorter). Chunk boundaries ignore page boundaries.
pub fn rechunk<'a, S>(pages: S, size: usize) -> impl Stream<Item = Result<Vec<RawRecord>>> + Send + 'a
where
    S: Stream<Item = Result<Page>> + Send + 'a,
{
    try_stream! {
        if size == 0 {
            Err(Error::InvalidInput("batch size must be > 0".to_string()))?;
        }
        let mut pages = Box::pin(pages);
        let mut buf: Vec<RawRecord> = Vec::with_capacity(size);
        while let Some(page) = pages.next().await {
            buf.extend(page?);
            while buf.len() >= size {
                let rest = buf.split_off(size);
                let chunk = std::mem::replace(&mut buf, rest);
                yield chunk;
            }
        }
        if !buf.is_empty() {
            yield buf;
        }
    }
}

/// A page sequence that fails immediately (unsupported kind, bad selector, ...).
pub fn failed<'a>(err: Error) -> PageStream<'a> {
    futures_util::stream::once(async move { Err(err) }).boxed()
}
