//! Resync core library: the paginate/enrich/emit pipeline, webhook routing and the shared
//! models and traits every provider integration builds on.

pub mod config;
pub mod context;
pub mod enricher;
pub mod error;
pub mod http;
pub mod kinds;
pub mod models;
pub mod o11y;
pub mod orchestrator;
pub mod pager;
pub mod provider;
pub mod scheduler;
pub mod sink;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod webhook;

pub use config::{
    EventListenerType, FolderSelector, IntegrationConfig, KindConfig, ProviderConfig, Selector,
};
pub use context::{ProviderEntry, SyncContext};
pub use enricher::BoundedEnricher;
pub use error::{Error, Result};
pub use kinds::{KindSpec, KindTable};
pub use models::{Batch, Fields, Page, RawRecord, ResourceKind, WebhookEvent, records_from_value};
pub use orchestrator::{PassOptions, PassReport, PassState, ResyncOrchestrator};
pub use pager::PageStream;
pub use provider::ProviderClient;
pub use scheduler::ResyncScheduler;
pub use sink::{HttpSink, MemorySink, Sink, TracingSink};
pub use webhook::{Action, EventRoute, EventTable, WebhookOutcome, WebhookRouter};
