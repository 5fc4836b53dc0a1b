//! Per-provider lookup table from resource kind to its pagination and emission policy.
//!
//! Adding a kind to a provider means adding one `KindSpec` entry; the orchestrator never
//! branches on the kind itself.

use crate::models::ResourceKind;
use crate::{Error, Result};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KindSpec {
    pub kind: ResourceKind,
    /// Name of the provider-native identity field.
    pub id_field: &'static str,
    /// Records requested per pagination step.
    pub page_size: usize,
    /// Records per emitted batch (may be smaller than `page_size` when enrichment is costly).
    pub batch_size: usize,
    /// Whether records go through the provider's `enrich` before emission.
    pub enrich: bool,
}

impl KindSpec {
    pub fn new(kind: ResourceKind, id_field: &'static str) -> Self {
        Self {
            kind,
            id_field,
            page_size: 100,
            batch_size: 100,
            enrich: false,
        }
    }

    pub fn page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn enriched(mut self) -> Self {
        self.enrich = true;
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct KindTable {
    provider: &'static str,
    specs: BTreeMap<ResourceKind, KindSpec>,
}

impl KindTable {
    pub fn new(provider: &'static str) -> Self {
        Self {
            provider,
            specs: BTreeMap::new(),
        }
    }

    pub fn with(mut self, spec: KindSpec) -> Self {
        self.specs.insert(spec.kind, spec);
        self
    }

    pub fn get(&self, kind: ResourceKind) -> Result<&KindSpec> {
        self.specs
            .get(&kind)
            .ok_or_else(|| Error::unsupported_kind(self.provider, kind))
    }

    pub fn supports(&self, kind: ResourceKind) -> bool {
        self.specs.contains_key(&kind)
    }

    pub fn kinds(&self) -> impl Iterator<Item = ResourceKind> + '_ {
        self.specs.keys().copied()
    }
}
