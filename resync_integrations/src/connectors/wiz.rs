//! Wiz connector.
//!
//! GraphQL API behind OAuth client credentials. The access token is cached until shortly
//! before it expires and refreshed once on a 401. Connections are paged with
//! `pageInfo { hasNextPage endCursor }`.
//!
//! Controls and service tickets are not listed directly: both are derived from issues
//! (`sourceRule` and `serviceTickets`).

use async_trait::async_trait;
use futures_util::StreamExt;
use resync_core::config::{ProviderConfig, Selector};
use resync_core::http::ProviderHttp;
use resync_core::kinds::{KindSpec, KindTable};
use resync_core::models::{RawRecord, ResourceKind, WebhookEvent, records_from_value};
use resync_core::pager::{Fetched, PageStream, dedupe_by_id, failed, flat_map_records, paginate};
use resync_core::provider::ProviderClient;
use resync_core::webhook::{EventRoute, EventTable};
use resync_core::{Error, Result};
use serde::Deserialize;
use serde_json::{Value, json};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::instrument;

pub const PROVIDER: &str = "wiz";
const DEFAULT_TOKEN_URL: &str = "https://auth.app.wiz.io/oauth/token";
const AUDIENCE: &str = "wiz-api";
const PAGE_SIZE: usize = 100;
const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(60);
const DEFAULT_ISSUE_STATUSES: &[&str] = &["OPEN", "IN_PROGRESS"];

const PROJECTS_QUERY: &str = r#"
query Projects($first: Int, $after: String) {
  projects(first: $first, after: $after) {
    nodes { id name isFolder archived businessUnit description }
    pageInfo { hasNextPage endCursor }
  }
}"#;

const ISSUES_QUERY: &str = r#"
query Issues($first: Int, $after: String, $filterBy: IssueFilters) {
  issuesV2(first: $first, after: $after, filterBy: $filterBy) {
    nodes {
      id type status severity createdAt updatedAt dueAt resolvedAt statusChangedAt
      projects { id name slug businessUnit riskProfile { businessImpact } }
      sourceRule { __typename ... on Control { id name controlDescription: description resolutionRecommendation securitySubCategories { title category { name framework { name } } } } }
      entitySnapshot { id type nativeType name status cloudPlatform cloudProviderURL providerId region resourceGroupExternalId subscriptionExternalId subscriptionName tags externalId }
      serviceTickets { externalId name url }
      notes { createdAt updatedAt text user { name email } serviceAccount { name } }
    }
    pageInfo { hasNextPage endCursor }
  }
}"#;

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

#[derive(Debug, Clone)]
struct CachedToken {
    value: String,
    refresh_at: Instant,
}

pub struct WizProvider {
    http: ProviderHttp,
    token_url: String,
    client_id: String,
    client_secret: String,
    webhook_token: Option<String>,
    token: RwLock<Option<CachedToken>>,
    kinds: KindTable,
    events: EventTable,
}

impl WizProvider {
    pub fn from_config(cfg: &ProviderConfig) -> Result<Self> {
        let api_url = cfg
            .base_url
            .as_deref()
            .or_else(|| cfg.credential("api_url"))
            .ok_or_else(|| {
                Error::Configuration("wiz requires base_url (the GraphQL API url)".to_string())
            })?;
        Ok(Self {
            http: ProviderHttp::new(PROVIDER, api_url, cfg.rate_limit)?,
            token_url: cfg
                .credential("token_url")
                .unwrap_or(DEFAULT_TOKEN_URL)
                .to_string(),
            client_id: cfg.require_credential("client_id")?.to_string(),
            client_secret: cfg.require_credential("client_secret")?.to_string(),
            webhook_token: cfg
                .credential("webhook_verification_token")
                .map(str::to_string),
            token: RwLock::new(None),
            kinds: Self::kind_table(),
            events: Self::event_table(),
        })
    }

    pub fn kind_table() -> KindTable {
        KindTable::new(PROVIDER)
            .with(KindSpec::new(ResourceKind::Project, "id").page_size(PAGE_SIZE))
            .with(KindSpec::new(ResourceKind::Issue, "id").page_size(PAGE_SIZE))
            .with(KindSpec::new(ResourceKind::Control, "id"))
            .with(KindSpec::new(ResourceKind::ServiceTicket, "externalId"))
    }

    /// Wiz only sends issue notifications, and they carry no type field.
    pub fn event_table() -> EventTable {
        EventTable::new(&[])
            .fallback_type("issue")
            .on("issue", EventRoute::upsert(ResourceKind::Issue, &["/issue/id"]))
    }

    #[instrument(level = "debug", skip(self))]
    async fn access_token(&self) -> Result<String> {
        if let Some(cached) = self.token.read().await.as_ref() {
            if Instant::now() < cached.refresh_at {
                return Ok(cached.value.clone());
            }
        }

        let mut slot = self.token.write().await;
        if let Some(cached) = slot.as_ref() {
            if Instant::now() < cached.refresh_at {
                return Ok(cached.value.clone());
            }
        }
        let form = [
            ("grant_type", "client_credentials"),
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
            ("audience", AUDIENCE),
        ];
        let resp = self
            .http
            .send(self.http.post(&self.token_url).form(&form))
            .await?;
        let token: TokenResponse = serde_json::from_value(resp.body)
            .map_err(|e| Error::backend("decode wiz token response", e))?;
        let lifetime = Duration::from_secs(token.expires_in.unwrap_or(3600));
        let refresh_at = Instant::now() + lifetime.saturating_sub(TOKEN_REFRESH_MARGIN);
        *slot = Some(CachedToken {
            value: token.access_token.clone(),
            refresh_at,
        });
        tracing::debug!(expires_in = lifetime.as_secs(), "wiz access token refreshed");
        Ok(token.access_token)
    }

    async fn forget_token(&self) {
        *self.token.write().await = None;
    }

    /// Run a GraphQL query and return its `data`. A 401 drops the cached token and retries once.
    async fn graphql(&self, query: &str, variables: &Value) -> Result<Value> {
        match self.graphql_once(query, variables).await {
            Err(Error::Unauthorized(_)) => {
                self.forget_token().await;
                self.graphql_once(query, variables).await
            }
            other => other,
        }
    }

    async fn graphql_once(&self, query: &str, variables: &Value) -> Result<Value> {
        let token = self.access_token().await?;
        let req = self
            .http
            .post(self.http.base_url())
            .bearer_auth(token)
            .json(&json!({"query": query, "variables": variables}));
        let body = self.http.send(req).await?.body;
        graphql_data(body)
    }

    /// Page through the connection at `data.<root>`.
    fn connection(
        &self,
        query: &'static str,
        root: &'static str,
        variables: Value,
        first: usize,
    ) -> PageStream<'_> {
        paginate(String::new(), move |cursor| {
            let variables = page_variables(variables.clone(), first, cursor);
            async move {
                let data = self.graphql(query, &variables).await?;
                connection_page(data, root)
            }
        })
        .boxed()
    }

    fn issues<'a>(&'a self, selector: &'a Selector, first: usize) -> PageStream<'a> {
        self.connection(
            ISSUES_QUERY,
            "issuesV2",
            json!({"filterBy": issue_filter(selector)}),
            first,
        )
    }
}

fn graphql_data(mut body: Value) -> Result<Value> {
    if let Some(errors) = body.get("errors").and_then(Value::as_array).filter(|e| !e.is_empty()) {
        let messages: Vec<&str> = errors
            .iter()
            .filter_map(|e| e.get("message").and_then(Value::as_str))
            .collect();
        return Err(Error::Provider {
            status: 200,
            context: format!("wiz graphql: {}", messages.join("; ")),
        });
    }
    match body.get_mut("data").map(Value::take) {
        Some(data) if !data.is_null() => Ok(data),
        _ => Err(Error::BackendMessage(
            "wiz graphql response has no data".to_string(),
        )),
    }
}

/// `first`/`after` for one connection step; an empty cursor starts from the beginning.
fn page_variables(mut variables: Value, first: usize, cursor: String) -> Value {
    variables["first"] = json!(first);
    variables["after"] = if cursor.is_empty() {
        Value::Null
    } else {
        Value::String(cursor)
    };
    variables
}

fn connection_page(mut data: Value, root: &str) -> Result<Fetched<String>> {
    let mut conn = data.get_mut(root).map(Value::take).unwrap_or(Value::Null);
    let page = records_from_value(conn.get_mut("nodes").map(Value::take).unwrap_or(Value::Null))?;
    let info = conn.get("pageInfo");
    let has_next = info
        .and_then(|i| i.get("hasNextPage"))
        .and_then(Value::as_bool)
        .unwrap_or(false);
    let next = info
        .and_then(|i| i.get("endCursor"))
        .and_then(Value::as_str)
        .filter(|c| has_next && !c.is_empty())
        .map(str::to_string);
    Ok(Fetched::new(page, next))
}

/// `filterBy` for issue listings: `status` from the selector (string or list), defaulting to
/// open and in-progress issues.
fn issue_filter(selector: &Selector) -> Value {
    let statuses: Vec<String> = match selector.extra.get("status") {
        Some(Value::String(s)) => vec![s.clone()],
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect(),
        _ => DEFAULT_ISSUE_STATUSES.iter().map(|s| s.to_string()).collect(),
    };
    let mut filter = json!({"status": statuses});
    if let Some(severity) = selector.extra.get("severity") {
        filter["severity"] = severity.clone();
    }
    filter
}

fn source_rule(issue: &RawRecord) -> Option<RawRecord> {
    issue
        .get("sourceRule")
        .filter(|v| v.is_object())
        .cloned()
        .and_then(|v| RawRecord::from_value(v).ok())
}

fn service_tickets(issue: &RawRecord) -> Vec<RawRecord> {
    issue
        .get("serviceTickets")
        .and_then(Value::as_array)
        .map(|tickets| {
            tickets
                .iter()
                .cloned()
                .filter_map(|t| RawRecord::from_value(t).ok())
                .collect()
        })
        .unwrap_or_default()
}

#[async_trait]
impl ProviderClient for WizProvider {
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
        let first = match self.kinds.get(kind) {
            Ok(spec) => spec.page_size,
            Err(e) => return failed(e),
        };
        match kind {
            ResourceKind::Project => self.connection(PROJECTS_QUERY, "projects", json!({}), first),
            ResourceKind::Issue => self.issues(selector, first),
            ResourceKind::Control => {
                let rules =
                    flat_map_records(self.issues(selector, first), |issue| source_rule(&issue));
                dedupe_by_id(rules, "id").boxed()
            }
            ResourceKind::ServiceTicket => {
                flat_map_records(self.issues(selector, first), |issue| service_tickets(&issue))
                    .boxed()
            }
            other => failed(Error::unsupported_kind(PROVIDER, other)),
        }
    }

    #[instrument(level = "debug", skip(self))]
    async fn get_one(&self, kind: ResourceKind, id: &str) -> Result<RawRecord> {
        if kind != ResourceKind::Issue {
            return Err(Error::unsupported_kind(PROVIDER, kind));
        }
        let variables = json!({"first": 1, "after": null, "filterBy": {"id": id}});
        let data = self.graphql(ISSUES_QUERY, &variables).await?;
        connection_page(data, "issuesV2")?
            .page
            .into_iter()
            .next()
            .ok_or_else(|| Error::NotFound(format!("wiz issue '{id}'")))
    }

    fn verify_webhook(&self, event: &WebhookEvent) -> Result<()> {
        let expected = self
            .webhook_token
            .as_deref()
            .map(|token| format!("Bearer {token}"));
        match (expected, event.header("authorization")) {
            (Some(expected), Some(got)) if expected == got.trim() => Ok(()),
            _ => Err(Error::Unauthorized(
                "wiz webhook bearer token mismatch".to_string(),
            )),
        }
    }
}
