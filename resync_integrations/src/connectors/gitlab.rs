//! GitLab connector.
//!
//! REST API v4 with a `PRIVATE-TOKEN`. Lists are paged with `page`/`per_page`; the next page
//! number comes back in the `x-next-page` header (empty on the last page).
//!
//! Merge requests, issues and folders hang off parents (root groups or projects), so those
//! kinds are two-level page sequences. Several tokens may be configured; every listing walks
//! each token in turn and drops records an earlier token already produced.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures_util::StreamExt;
use resync_core::config::{FolderSelector, ProviderConfig, Selector};
use resync_core::http::ProviderHttp;
use resync_core::kinds::{KindSpec, KindTable};
use resync_core::models::{Fields, RawRecord, ResourceKind, WebhookEvent, records_from_value};
use resync_core::pager::{
    Fetched, PageStream, dedupe_by_id, failed, filter_records, flatten_children, map_records,
    paginate,
};
use resync_core::provider::ProviderClient;
use resync_core::webhook::{EventRoute, EventTable};
use resync_core::{Error, Result};
use serde::Deserialize;
use serde_json::{Value, json};
use std::future::Future;
use tracing::instrument;

pub const PROVIDER: &str = "gitlab";
const DEFAULT_BASE_URL: &str = "https://gitlab.com/api/v4";
const PER_PAGE: usize = 100;
const PROJECT_BATCH_SIZE: usize = 10;
pub const DEFAULT_MR_WINDOW_DAYS: u32 = 14;
const ALL_GROUPS: &str = "**";

type Query = Vec<(&'static str, String)>;

#[derive(Debug, Deserialize)]
struct GroupHook {
    #[serde(default)]
    url: String,
}

/// One access token and the root groups whose hooks it manages.
struct GitlabService {
    http: ProviderHttp,
    hook_groups: Vec<String>,
}

impl GitlabService {
    fn new(cfg: &ProviderConfig, token: &str, hook_groups: Vec<String>) -> Result<Self> {
        let http = ProviderHttp::new(
            PROVIDER,
            cfg.base_url_or(DEFAULT_BASE_URL),
            cfg.rate_limit,
        )?
        .with_header("private-token", token)?;
        Ok(Self { http, hook_groups })
    }

    fn list(&self, path: String, query: Query, per_page: usize) -> PageStream<'_> {
        paginate(1u32, move |page| {
            let path = path.clone();
            let query = query.clone();
            async move { self.fetch_page(&path, &query, page, per_page).await }
        })
        .boxed()
    }

    #[instrument(level = "debug", skip(self, query))]
    async fn fetch_page(
        &self,
        path: &str,
        query: &Query,
        page: u32,
        per_page: usize,
    ) -> Result<Fetched<u32>> {
        let req = self
            .http
            .get(path)
            .query(query)
            .query(&[("page", page as usize), ("per_page", per_page)]);
        let resp = self.http.send(req).await?;
        let next = next_page(resp.header("x-next-page"));
        Ok(Fetched::new(records_from_value(resp.body)?, next))
    }

    /// Concatenated listings under one parent record.
    fn per_parent(&self, parent: &RawRecord, listings: Vec<(String, Query)>, per_page: usize) -> PageStream<'_> {
        if parent.id("id").is_none() {
            return failed(Error::InvalidInput(
                "gitlab parent record has no id".to_string(),
            ));
        }
        futures_util::stream::iter(
            listings
                .into_iter()
                .map(move |(path, query)| self.list(path, query, per_page)),
        )
        .flatten()
        .boxed()
    }

    fn root_groups(&self, per_page: usize) -> PageStream<'_> {
        let groups = self.list(
            "groups".to_string(),
            vec![("top_level_only", "true".to_string())],
            per_page,
        );
        filter_records(groups, |g| g.get("parent_id").is_none_or(Value::is_null)).boxed()
    }

    fn projects(&self, per_page: usize) -> PageStream<'_> {
        self.list(
            "projects".to_string(),
            vec![("membership", "true".to_string())],
            per_page,
        )
    }

    fn merge_requests(&self, window_days: u32, per_page: usize) -> PageStream<'_> {
        let updated_after = window_start(Utc::now(), window_days);
        flatten_children(self.root_groups(per_page), move |group| {
            let listings = group
                .id("id")
                .map(|id| merge_request_listings(&id, &updated_after))
                .unwrap_or_default();
            self.per_parent(&group, listings, per_page)
        })
        .boxed()
    }

    fn issues(&self, per_page: usize) -> PageStream<'_> {
        flatten_children(self.root_groups(per_page), move |group| {
            let listings = group
                .id("id")
                .map(|id| vec![(format!("groups/{id}/issues"), Query::new())])
                .unwrap_or_default();
            self.per_parent(&group, listings, per_page)
        })
        .boxed()
    }

    fn folders<'a>(&'a self, selectors: &'a [FolderSelector], per_page: usize) -> PageStream<'a> {
        let wanted = filter_records(self.projects(per_page), move |p| wants_project(selectors, p));
        flatten_children(wanted, move |project| {
            let Some(id) = project.id("id") else {
                return failed(Error::InvalidInput(
                    "gitlab project has no id".to_string(),
                ));
            };
            let name = project_name(&project).unwrap_or_default().to_string();
            let default_branch = project
                .get("default_branch")
                .and_then(Value::as_str)
                .unwrap_or("main")
                .to_string();
            let snapshot = project.into_value();
            let listings = selectors
                .iter()
                .filter(|s| s.repos.iter().any(|r| *r == name))
                .map(|s| {
                    let git_ref = s.branch.clone().unwrap_or_else(|| default_branch.clone());
                    let mut query = vec![("ref", git_ref)];
                    if let Some(path) = tree_path(&s.path) {
                        query.push(("path", path.to_string()));
                    }
                    self.list(format!("projects/{id}/repository/tree"), query, per_page)
                })
                .collect::<Vec<_>>();
            let trees = futures_util::stream::iter(listings).flatten();
            let dirs = filter_records(trees, is_directory);
            map_records(dirs, move |r| r.tag("__project", snapshot.clone())).boxed()
        })
        .boxed()
    }

    fn per_project(&self, resource: &'static str, tag_project: bool, per_page: usize) -> PageStream<'_> {
        flatten_children(self.projects(per_page), move |project| {
            let listings = project
                .id("id")
                .map(|id| vec![(format!("projects/{id}/{resource}"), Query::new())])
                .unwrap_or_default();
            let pages = self.per_parent(&project, listings, per_page);
            if tag_project {
                let snapshot = project.into_value();
                map_records(pages, move |r| r.tag("__project", snapshot.clone())).boxed()
            } else {
                pages
            }
        })
        .boxed()
    }

    fn list_kind<'a>(&'a self, kind: ResourceKind, selector: &'a Selector, per_page: usize) -> PageStream<'a> {
        match kind {
            ResourceKind::Group => self.list(
                "groups".to_string(),
                vec![("all_available", "false".to_string())],
                per_page,
            ),
            ResourceKind::Project => self.projects(per_page),
            ResourceKind::Folder => self.folders(&selector.folders, per_page),
            ResourceKind::MergeRequest => {
                self.merge_requests(selector.window_days_or(DEFAULT_MR_WINDOW_DAYS), per_page)
            }
            ResourceKind::Issue => self.issues(per_page),
            ResourceKind::Job => self.per_project("jobs", false, per_page),
            ResourceKind::Pipeline => self.per_project("pipelines", true, per_page),
            other => failed(Error::unsupported_kind(PROVIDER, other)),
        }
    }

    async fn get_json(&self, path: &str) -> Result<Value> {
        Ok(self.http.send(self.http.get(path)).await?.body)
    }

    async fn languages(&self, project_id: &str) -> Result<Value> {
        self.get_json(&format!("projects/{project_id}/languages"))
            .await
    }

    async fn fetch_one(&self, kind: ResourceKind, id: &str) -> Result<RawRecord> {
        let path = record_path(kind, id)?;
        let record = RawRecord::from_value(self.get_json(&path).await?)?;
        match kind {
            ResourceKind::Project => {
                let languages = self.languages(id).await?;
                let mut extra = Fields::new();
                extra.insert("__languages".to_string(), languages);
                record.augment(extra)
            }
            ResourceKind::Pipeline => {
                let (project_id, _) = split_composite(id)?;
                let project = self.get_json(&format!("projects/{project_id}")).await?;
                Ok(record.tag("__project", project))
            }
            _ => Ok(record),
        }
    }

    #[instrument(level = "debug", skip(self, secret))]
    async fn ensure_group_hook(&self, group_id: &str, url: &str, secret: Option<&str>) -> Result<bool> {
        let existing = self.get_json(&format!("groups/{group_id}/hooks")).await?;
        let hooks: Vec<GroupHook> = serde_json::from_value(existing)
            .map_err(|e| Error::backend("decode gitlab group hooks", e))?;
        if hooks.iter().any(|h| h.url == url) {
            return Ok(false);
        }
        let body = json!({
            "url": url,
            "push_events": true,
            "merge_requests_events": true,
            "issues_events": true,
            "pipeline_events": true,
            "job_events": true,
            "token": secret,
        });
        self.http
            .send(self.http.post(&format!("groups/{group_id}/hooks")).json(&body))
            .await?;
        Ok(true)
    }

    async fn register_hooks(&self, app_host: &str, secret: Option<&str>) -> Result<usize> {
        let mut groups = self.root_groups(PER_PAGE);
        let mut created = 0usize;
        while let Some(page) = groups.next().await {
            for group in page? {
                if !manages_hook_for(&self.hook_groups, &group) {
                    continue;
                }
                let Some(group_id) = group.id("id") else {
                    continue;
                };
                let url = format!("{app_host}/integration/gitlab/hook/{group_id}");
                if self.ensure_group_hook(&group_id, &url, secret).await? {
                    created += 1;
                }
            }
        }
        Ok(created)
    }
}

pub struct GitlabProvider {
    services: Vec<GitlabService>,
    kinds: KindTable,
    events: EventTable,
    webhook_secret: Option<String>,
}

impl GitlabProvider {
    /// One service for `token` (hooks on every root group) plus one per `token_mapping` entry.
    pub fn from_config(cfg: &ProviderConfig) -> Result<Self> {
        let mut services = Vec::new();
        if let Some(token) = cfg.credential("token") {
            services.push(GitlabService::new(cfg, token, vec![ALL_GROUPS.to_string()])?);
        }
        for (token, groups) in &cfg.token_mapping {
            if token.trim().is_empty() || Some(token.as_str()) == cfg.credential("token") {
                continue;
            }
            services.push(GitlabService::new(cfg, token, groups.clone())?);
        }
        if services.is_empty() {
            return Err(Error::Configuration(
                "provider 'gitlab' needs a 'token' credential or a token_mapping entry"
                    .to_string(),
            ));
        }
        Ok(Self {
            services,
            kinds: Self::kind_table(),
            events: Self::event_table(),
            webhook_secret: cfg.credential("webhook_secret").map(str::to_string),
        })
    }

    pub fn kind_table() -> KindTable {
        KindTable::new(PROVIDER)
            .with(KindSpec::new(ResourceKind::Group, "id").page_size(PER_PAGE))
            .with(
                KindSpec::new(ResourceKind::Project, "id")
                    .page_size(PER_PAGE)
                    .batch_size(PROJECT_BATCH_SIZE)
                    .enriched(),
            )
            .with(KindSpec::new(ResourceKind::Folder, "path").page_size(PER_PAGE))
            .with(KindSpec::new(ResourceKind::MergeRequest, "id").page_size(PER_PAGE))
            .with(KindSpec::new(ResourceKind::Issue, "id").page_size(PER_PAGE))
            .with(KindSpec::new(ResourceKind::Job, "id").page_size(PER_PAGE))
            .with(KindSpec::new(ResourceKind::Pipeline, "id").page_size(PER_PAGE))
    }

    /// System hooks name the event in `event_name`/`event_type`, group hooks in `object_kind`
    /// (and the `X-Gitlab-Event` header).
    ///
    /// Merge requests, issues, pipelines and jobs are fetched by `project/iid`-style keys but
    /// synced under their global `id`, which the payload carries separately.
    pub fn event_table() -> EventTable {
        let project = EventRoute::upsert(ResourceKind::Project, &["/project_id"]);
        let merge_request =
            EventRoute::upsert(ResourceKind::MergeRequest, &["/project/id", "/object_attributes/iid"])
                .with_identity("/object_attributes/id");
        let issue = EventRoute::upsert(ResourceKind::Issue, &["/project/id", "/object_attributes/iid"])
            .with_identity("/object_attributes/id");
        let pipeline =
            EventRoute::upsert(ResourceKind::Pipeline, &["/project/id", "/object_attributes/id"])
                .with_identity("/object_attributes/id");
        let job = EventRoute::upsert(ResourceKind::Job, &["/project_id", "/build_id"])
            .with_identity("/build_id");

        EventTable::new(&["/event_name", "/event_type", "/object_kind"])
            .type_header("x-gitlab-event")
            .on_each(
                &[
                    "project_create",
                    "project_update",
                    "project_rename",
                    "project_transfer",
                    "push",
                    "Push Hook",
                ],
                project,
            )
            .on(
                "project_destroy",
                EventRoute::delete(ResourceKind::Project, &["/project_id"]),
            )
            .on_each(
                &["group_create", "group_rename"],
                EventRoute::upsert(ResourceKind::Group, &["/group_id"]),
            )
            .on(
                "group_destroy",
                EventRoute::delete(ResourceKind::Group, &["/group_id"]),
            )
            .on_each(&["merge_request", "Merge Request Hook"], merge_request)
            .on_each(&["issue", "Issue Hook"], issue)
            .on_each(&["pipeline", "Pipeline Hook"], pipeline)
            .on_each(&["build", "Job Hook"], job)
    }

    /// First answer from any token; `NotFound` only when no token can see the record.
    async fn first_found<'a, T, F, Fut>(&'a self, what: &str, call: F) -> Result<T>
    where
        F: Fn(&'a GitlabService) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        for service in &self.services {
            match call(service).await {
                Err(Error::NotFound(_)) => continue,
                other => return other,
            }
        }
        Err(Error::NotFound(format!("gitlab {what}")))
    }
}

#[async_trait]
impl ProviderClient for GitlabProvider {
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
        let spec = match self.kinds.get(kind) {
            Ok(spec) => spec,
            Err(e) => return failed(e),
        };
        let per_page = spec.page_size;
        let pages = futures_util::stream::iter(&self.services)
            .flat_map(move |service| service.list_kind(kind, selector, per_page));
        if self.services.len() > 1 && kind != ResourceKind::Folder {
            dedupe_by_id(pages, spec.id_field).boxed()
        } else {
            pages.boxed()
        }
    }

    #[instrument(level = "debug", skip(self, record))]
    async fn enrich(&self, kind: ResourceKind, record: RawRecord) -> Result<Fields> {
        let mut extra = Fields::new();
        if kind == ResourceKind::Project {
            let id = record
                .id("id")
                .ok_or_else(|| Error::InvalidInput("gitlab project has no id".to_string()))?;
            let languages = self
                .first_found("project languages", |service| service.languages(&id))
                .await?;
            extra.insert("__languages".to_string(), languages);
        }
        Ok(extra)
    }

    #[instrument(level = "debug", skip(self))]
    async fn get_one(&self, kind: ResourceKind, id: &str) -> Result<RawRecord> {
        record_path(kind, id)?;
        self.first_found(&format!("{kind} '{id}'"), |service| service.fetch_one(kind, id))
            .await
    }

    fn verify_webhook(&self, event: &WebhookEvent) -> Result<()> {
        match &self.webhook_secret {
            Some(secret) if event.header("x-gitlab-token") != Some(secret.as_str()) => Err(
                Error::Unauthorized("gitlab webhook token mismatch".to_string()),
            ),
            _ => Ok(()),
        }
    }

    #[instrument(level = "info", skip(self))]
    async fn register_webhooks(&self, app_host: &str) -> Result<()> {
        let mut created = 0usize;
        for service in &self.services {
            created += service
                .register_hooks(app_host, self.webhook_secret.as_deref())
                .await?;
        }
        tracing::info!(created, tokens = self.services.len(), "gitlab group hooks ensured");
        Ok(())
    }
}

fn next_page(header: Option<&str>) -> Option<u32> {
    header.map(str::trim).and_then(|h| h.parse().ok())
}

/// Lower bound of the closed merge request window.
fn window_start(now: DateTime<Utc>, window_days: u32) -> String {
    (now - ChronoDuration::days(i64::from(window_days))).to_rfc3339()
}

/// Open merge requests are always listed; closed ones only within the window.
fn merge_request_listings(group_id: &str, updated_after: &str) -> Vec<(String, Query)> {
    let path = format!("groups/{group_id}/merge_requests");
    vec![
        (path.clone(), vec![("state", "opened".to_string())]),
        (
            path,
            vec![
                ("state", "closed".to_string()),
                ("updated_after", updated_after.to_string()),
            ],
        ),
    ]
}

fn manages_hook_for(patterns: &[String], group: &RawRecord) -> bool {
    let full_path = group
        .get("full_path")
        .and_then(Value::as_str)
        .unwrap_or_default();
    patterns.is_empty()
        || patterns.iter().any(|p| {
            let p = p.trim().trim_end_matches("/**");
            p == ALL_GROUPS || p == "*" || p == full_path
        })
}

fn split_composite(id: &str) -> Result<(&str, &str)> {
    id.split_once('/')
        .filter(|(a, b)| !a.is_empty() && !b.is_empty())
        .ok_or_else(|| Error::InvalidInput(format!("expected '<project_id>/<id>', got '{id}'")))
}

/// API path that returns the single record `id` of `kind`.
fn record_path(kind: ResourceKind, id: &str) -> Result<String> {
    Ok(match kind {
        ResourceKind::Group => format!("groups/{id}"),
        ResourceKind::Project => format!("projects/{id}"),
        ResourceKind::MergeRequest => {
            let (project, iid) = split_composite(id)?;
            format!("projects/{project}/merge_requests/{iid}")
        }
        ResourceKind::Issue => {
            let (project, iid) = split_composite(id)?;
            format!("projects/{project}/issues/{iid}")
        }
        ResourceKind::Job => {
            let (project, job) = split_composite(id)?;
            format!("projects/{project}/jobs/{job}")
        }
        ResourceKind::Pipeline => {
            let (project, pipeline) = split_composite(id)?;
            format!("projects/{project}/pipelines/{pipeline}")
        }
        other => return Err(Error::unsupported_kind(PROVIDER, other)),
    })
}

fn project_name(project: &RawRecord) -> Option<&str> {
    project.get("name").and_then(Value::as_str)
}

fn wants_project(selectors: &[FolderSelector], project: &RawRecord) -> bool {
    project_name(project)
        .is_some_and(|name| selectors.iter().any(|s| s.repos.iter().any(|r| r == name)))
}

fn is_directory(entry: &RawRecord) -> bool {
    entry.get("type").and_then(Value::as_str) == Some("tree")
}

/// Repository path to list; `*`, `/` and empty mean the root.
fn tree_path(path: &str) -> Option<&str> {
    let trimmed = path.trim().trim_matches('/');
    (!trimmed.is_empty() && trimmed != "*").then_some(trimmed)
}
