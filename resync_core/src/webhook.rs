//! Webhook classification and the refetch-or-delete path.
//!
//! Each provider declares an [`EventTable`]: where the event type lives in the payload, and a
//! static map from event type to `(kind, action, identifier pointers)`. The [`WebhookRouter`]
//! turns a classified event into exactly one sink call. Nothing that happens here is fatal to
//! the HTTP endpoint: every event ends in a [`WebhookOutcome`], only failed verification is
//! reported as an error.

use crate::models::{RawRecord, ResourceKind, WebhookEvent, value_as_id};
use crate::provider::ProviderClient;
use crate::sink::Sink;
use crate::{Error, Result};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventAction {
    Upsert,
    Delete,
}

/// Where an event type leads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventRoute {
    pub kind: ResourceKind,
    pub action: EventAction,
    /// JSON pointers whose values, joined with `/`, form the record id.
    pub id_pointers: Vec<&'static str>,
    /// Pointer to an embedded record handed to the sink on delete.
    pub record_pointer: Option<&'static str>,
    /// Pointer to the record's native identity when `id_pointers` build a lookup key
    /// (e.g. `project/iid`) rather than the synced id.
    pub identity_pointer: Option<&'static str>,
}

impl EventRoute {
    pub fn upsert(kind: ResourceKind, id_pointers: &[&'static str]) -> Self {
        Self {
            kind,
            action: EventAction::Upsert,
            id_pointers: id_pointers.to_vec(),
            record_pointer: None,
            identity_pointer: None,
        }
    }

    pub fn delete(kind: ResourceKind, id_pointers: &[&'static str]) -> Self {
        Self {
            kind,
            action: EventAction::Delete,
            id_pointers: id_pointers.to_vec(),
            record_pointer: None,
            identity_pointer: None,
        }
    }

    pub fn with_record(mut self, pointer: &'static str) -> Self {
        self.record_pointer = Some(pointer);
        self
    }

    pub fn with_identity(mut self, pointer: &'static str) -> Self {
        self.identity_pointer = Some(pointer);
        self
    }
}

/// Result of classifying one event.
///
/// `id` is what `get_one` understands; `identity` is the synced record's own id when the two
/// differ, used to build the delete payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Upsert {
        kind: ResourceKind,
        id: String,
        identity: Option<Value>,
    },
    Delete {
        kind: ResourceKind,
        id: String,
        record: Option<RawRecord>,
        identity: Option<Value>,
    },
    Ignore {
        reason: String,
    },
}

#[derive(Debug, Clone, Default)]
pub struct EventTable {
    type_pointers: Vec<&'static str>,
    type_header: Option<&'static str>,
    fallback_type: Option<&'static str>,
    exact: BTreeMap<&'static str, EventRoute>,
    prefixed: Vec<(&'static str, EventRoute)>,
}

impl EventTable {
    /// `type_pointers` are tried in order; the first non-empty string wins.
    pub fn new(type_pointers: &[&'static str]) -> Self {
        Self {
            type_pointers: type_pointers.to_vec(),
            ..Self::default()
        }
    }

    /// Header consulted when no type pointer matches.
    pub fn type_header(mut self, name: &'static str) -> Self {
        self.type_header = Some(name);
        self
    }

    /// Type assumed for payloads that carry none (single-shape providers).
    pub fn fallback_type(mut self, event_type: &'static str) -> Self {
        self.fallback_type = Some(event_type);
        self
    }

    /// Map an event type to a route. A trailing `*` matches any suffix.
    pub fn on(mut self, event_type: &'static str, route: EventRoute) -> Self {
        match event_type.strip_suffix('*') {
            Some(prefix) => self.prefixed.push((prefix, route)),
            None => {
                self.exact.insert(event_type, route);
            }
        }
        self
    }

    pub fn on_each(mut self, event_types: &[&'static str], route: EventRoute) -> Self {
        for event_type in event_types {
            self = self.on(*event_type, route.clone());
        }
        self
    }

    pub fn event_type(&self, event: &WebhookEvent) -> Option<String> {
        self.type_pointers
            .iter()
            .filter_map(|p| event.body.pointer(p).and_then(|v| v.as_str()))
            .map(str::trim)
            .find(|s| !s.is_empty())
            .or_else(|| {
                self.type_header
                    .and_then(|h| event.header(h))
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
            })
            .or(self.fallback_type)
            .map(str::to_string)
    }

    pub fn lookup(&self, event_type: &str) -> Option<&EventRoute> {
        self.exact.get(event_type).or_else(|| {
            self.prefixed
                .iter()
                .find(|(prefix, _)| event_type.starts_with(prefix))
                .map(|(_, route)| route)
        })
    }

    /// Classify `event`. Unmapped types are `Ignore`; a missing type or identifier is a
    /// `MalformedEvent` error.
    pub fn classify(&self, event: &WebhookEvent) -> Result<Action> {
        let Some(event_type) = self.event_type(event) else {
            return Err(Error::MalformedEvent(format!(
                "{} event carries no event type",
                event.provider
            )));
        };
        let Some(route) = self.lookup(&event_type) else {
            return Ok(Action::Ignore {
                reason: format!("unmapped event type '{event_type}'"),
            });
        };

        let mut parts = Vec::with_capacity(route.id_pointers.len());
        for pointer in &route.id_pointers {
            let part = event.body.pointer(pointer).and_then(value_as_id).ok_or_else(|| {
                Error::MalformedEvent(format!(
                    "'{event_type}' event is missing identifier at {pointer}"
                ))
            })?;
            parts.push(part);
        }
        if parts.is_empty() {
            return Err(Error::MalformedEvent(format!(
                "'{event_type}' route declares no identifier"
            )));
        }
        let id = parts.join("/");
        let identity = route
            .identity_pointer
            .and_then(|p| event.body.pointer(p))
            .filter(|v| value_as_id(v).is_some())
            .cloned();

        Ok(match route.action {
            EventAction::Upsert => Action::Upsert {
                kind: route.kind,
                id,
                identity,
            },
            EventAction::Delete => {
                let record = route
                    .record_pointer
                    .and_then(|p| event.body.pointer(p))
                    .cloned()
                    .and_then(|v| RawRecord::from_value(v).ok());
                Action::Delete {
                    kind: route.kind,
                    id,
                    record,
                    identity,
                }
            }
        })
    }
}

/// What happened to one webhook event.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum WebhookOutcome {
    Upserted {
        kind: ResourceKind,
        id: String,
    },
    Deleted {
        kind: ResourceKind,
        id: String,
        /// The refetch found nothing, so the record was deleted instead.
        implicit: bool,
    },
    Ignored {
        reason: String,
    },
    Failed {
        kind: ResourceKind,
        id: String,
        error: String,
    },
}

/// Turns webhook events into single-record sink calls.
///
/// Handling is independent of any resync pass running for the same kind: a pass whose snapshot
/// predates the event may still overwrite the webhook's write when it emits later.
#[derive(Clone)]
pub struct WebhookRouter {
    sink: Arc<dyn Sink>,
}

impl WebhookRouter {
    pub fn new(sink: Arc<dyn Sink>) -> Self {
        Self { sink }
    }

    /// Classify without side effects. Malformed events and kinds the provider does not serve
    /// come back as `Ignore`.
    pub fn route(&self, provider: &dyn ProviderClient, event: &WebhookEvent) -> Action {
        let action = match provider.events().classify(event) {
            Ok(action) => action,
            Err(e) => {
                tracing::warn!(provider = provider.id(), error = %e, "ignoring malformed webhook event");
                return Action::Ignore {
                    reason: e.to_string(),
                };
            }
        };
        let kind = match &action {
            Action::Upsert { kind, .. } | Action::Delete { kind, .. } => *kind,
            Action::Ignore { .. } => return action,
        };
        if !provider.kinds().supports(kind) {
            return Action::Ignore {
                reason: Error::unsupported_kind(provider.id(), kind).to_string(),
            };
        }
        action
    }

    /// Verify, classify and apply one event.
    ///
    /// Returns `Err` only when the provider rejects the event's credentials.
    #[tracing::instrument(level = "info", skip(self, provider, event), fields(provider = provider.id()))]
    pub async fn handle(
        &self,
        provider: &dyn ProviderClient,
        event: &WebhookEvent,
    ) -> Result<WebhookOutcome> {
        provider.verify_webhook(event)?;

        let outcome = match self.route(provider, event) {
            Action::Ignore { reason } => {
                tracing::debug!(%reason, "webhook event ignored");
                WebhookOutcome::Ignored { reason }
            }
            Action::Upsert { kind, id, identity } => {
                self.refetch_and_upsert(provider, kind, id, identity).await
            }
            Action::Delete {
                kind,
                id,
                record,
                identity,
            } => {
                let record =
                    record.unwrap_or_else(|| identity_record(provider, kind, &id, identity));
                self.delete(kind, id, record, false).await
            }
        };
        tracing::info!(?outcome, "webhook event handled");
        Ok(outcome)
    }

    async fn refetch_and_upsert(
        &self,
        provider: &dyn ProviderClient,
        kind: ResourceKind,
        id: String,
        identity: Option<Value>,
    ) -> WebhookOutcome {
        match provider.get_one(kind, &id).await {
            Ok(record) => match self.sink.upsert_batch(kind, vec![record]).await {
                Ok(()) => WebhookOutcome::Upserted { kind, id },
                Err(e) => failed(kind, id, e),
            },
            Err(Error::NotFound(_)) => {
                let record = identity_record(provider, kind, &id, identity);
                self.delete(kind, id, record, true).await
            }
            Err(e) => failed(kind, id, e),
        }
    }

    async fn delete(
        &self,
        kind: ResourceKind,
        id: String,
        record: RawRecord,
        implicit: bool,
    ) -> WebhookOutcome {
        match self.sink.delete_batch(kind, vec![record]).await {
            Ok(()) => WebhookOutcome::Deleted { kind, id, implicit },
            Err(e) => failed(kind, id, e),
        }
    }
}

fn identity_record(
    provider: &dyn ProviderClient,
    kind: ResourceKind,
    id: &str,
    identity: Option<Value>,
) -> RawRecord {
    let id_field = provider
        .kinds()
        .get(kind)
        .map(|spec| spec.id_field)
        .unwrap_or("id");
    RawRecord::identity(id_field, identity.unwrap_or_else(|| Value::from(id)))
}

fn failed(kind: ResourceKind, id: String, error: Error) -> WebhookOutcome {
    tracing::warn!(%kind, %id, error = %error, "webhook event failed");
    WebhookOutcome::Failed {
        kind,
        id,
        error: error.to_string(),
    }
}
