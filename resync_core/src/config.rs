use crate::models::ResourceKind;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

pub const ENV_APP_HOST: &str = "RESYNC_APP_HOST";
pub const ENV_EVENT_LISTENER_TYPE: &str = "RESYNC_EVENT_LISTENER_TYPE";
pub const ENV_SINK_URL: &str = "RESYNC_SINK_URL";

/// How the service listens for changes.
///
/// `Once` runs every kind a single time and skips webhook setup entirely.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventListenerType {
    #[default]
    Polling,
    Once,
}

impl FromStr for EventListenerType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "POLLING" => Ok(Self::Polling),
            "ONCE" => Ok(Self::Once),
            other => Err(Error::Configuration(format!(
                "unknown event listener type '{other}'"
            ))),
        }
    }
}

/// Restricts a folder-style kind to named repositories under a path.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FolderSelector {
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub repos: Vec<String>,
    #[serde(default)]
    pub branch: Option<String>,
}

/// Per-kind filters handed to `ProviderClient::list_all`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Selector {
    #[serde(default)]
    pub folders: Vec<FolderSelector>,
    /// Time window for kinds that only sync recent items (e.g. closed merge requests).
    #[serde(default)]
    pub window_days: Option<u32>,
    /// Provider-specific options (e.g. a Wiz issue filter).
    #[serde(default, flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl Selector {
    pub fn window_days_or(&self, default: u32) -> u32 {
        self.window_days.unwrap_or(default)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KindConfig {
    pub kind: ResourceKind,
    #[serde(default)]
    pub selector: Selector,
    /// Overrides the kind's default emission batch size.
    #[serde(default)]
    pub batch_size: Option<usize>,
    #[serde(default)]
    pub enrich_concurrency: Option<usize>,
}

impl KindConfig {
    pub fn new(kind: ResourceKind) -> Self {
        Self {
            kind,
            selector: Selector::default(),
            batch_size: None,
            enrich_concurrency: None,
        }
    }
}

fn default_rate_limit() -> usize {
    8
}

fn default_enrich_concurrency() -> usize {
    crate::enricher::DEFAULT_ENRICH_CONCURRENCY
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// `gitlab`, `pagerduty` or `wiz`.
    pub provider: String,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub credentials: BTreeMap<String, String>,
    /// Extra access tokens, each with the group paths whose webhooks it manages (`**` for
    /// all). GitLab syncs through `token` and every token listed here.
    #[serde(default)]
    pub token_mapping: BTreeMap<String, Vec<String>>,
    /// Concurrent requests allowed through the provider's HTTP gate.
    #[serde(default = "default_rate_limit")]
    pub rate_limit: usize,
    #[serde(default = "default_enrich_concurrency")]
    pub enrich_concurrency: usize,
    /// Kinds to resync. Empty means every kind the provider supports.
    #[serde(default)]
    pub kinds: Vec<KindConfig>,
}

impl ProviderConfig {
    pub fn new(provider: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            base_url: None,
            credentials: BTreeMap::new(),
            token_mapping: BTreeMap::new(),
            rate_limit: default_rate_limit(),
            enrich_concurrency: default_enrich_concurrency(),
            kinds: Vec::new(),
        }
    }

    pub fn with_credential(mut self, name: &str, value: &str) -> Self {
        self.credentials.insert(name.to_string(), value.to_string());
        self
    }

    pub fn with_token_mapping(mut self, token: &str, groups: &[&str]) -> Self {
        self.token_mapping.insert(
            token.to_string(),
            groups.iter().map(|g| g.to_string()).collect(),
        );
        self
    }

    pub fn with_kind(mut self, kind: KindConfig) -> Self {
        self.kinds.push(kind);
        self
    }

    pub fn credential(&self, name: &str) -> Option<&str> {
        self.credentials
            .get(name)
            .map(String::as_str)
            .filter(|v| !v.trim().is_empty())
    }

    pub fn require_credential(&self, name: &str) -> Result<&str> {
        self.credential(name).ok_or_else(|| {
            Error::Configuration(format!(
                "provider '{}' is missing credential '{name}'",
                self.provider
            ))
        })
    }

    pub fn base_url_or<'a>(&'a self, default: &'a str) -> &'a str {
        self.base_url
            .as_deref()
            .filter(|u| !u.trim().is_empty())
            .unwrap_or(default)
    }

    pub fn kind(&self, kind: ResourceKind) -> Option<&KindConfig> {
        self.kinds.iter().find(|k| k.kind == kind)
    }

    pub fn validate(&self) -> Result<()> {
        if self.provider.trim().is_empty() {
            return Err(Error::Configuration("provider name is empty".to_string()));
        }
        if self.rate_limit == 0 {
            return Err(Error::Configuration(format!(
                "provider '{}': rate_limit must be > 0",
                self.provider
            )));
        }
        if self.enrich_concurrency == 0 {
            return Err(Error::Configuration(format!(
                "provider '{}': enrich_concurrency must be > 0",
                self.provider
            )));
        }
        for k in &self.kinds {
            if k.batch_size == Some(0) || k.enrich_concurrency == Some(0) {
                return Err(Error::Configuration(format!(
                    "provider '{}' kind '{}': sizes must be > 0",
                    self.provider, k.kind
                )));
            }
        }
        Ok(())
    }
}

fn default_resync_interval_secs() -> u64 {
    3600
}

/// Service-wide configuration: listener mode, webhook host, sink and providers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntegrationConfig {
    /// Public base URL of this service. Enables webhook self-registration.
    #[serde(default)]
    pub app_host: Option<String>,
    #[serde(default)]
    pub event_listener_type: EventListenerType,
    #[serde(default = "default_resync_interval_secs")]
    pub resync_interval_secs: u64,
    /// Downstream catalog ingest URL; batches are only logged when absent.
    #[serde(default)]
    pub sink_url: Option<String>,
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
}

impl Default for IntegrationConfig {
    fn default() -> Self {
        Self {
            app_host: None,
            event_listener_type: EventListenerType::default(),
            resync_interval_secs: default_resync_interval_secs(),
            sink_url: None,
            providers: Vec::new(),
        }
    }
}

impl IntegrationConfig {
    /// Read a YAML (`.yaml`/`.yml`) or JSON file, then apply environment overrides.
    #[tracing::instrument(level = "debug", skip_all, fields(path = %path.as_ref().display()))]
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::Configuration(format!("read config {}: {e}", path.display()))
        })?;
        let mut cfg = match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => Self::from_yaml(&text)?,
            _ => Self::from_json(&text)?,
        };
        cfg.apply_overrides(|key| std::env::var(key).ok())?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        serde_yaml::from_str(text)
            .map_err(|e| Error::Configuration(format!("parse yaml config: {e}")))
    }

    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text)
            .map_err(|e| Error::Configuration(format!("parse json config: {e}")))
    }

    /// Apply `RESYNC_*` overrides looked up through `lookup` (normally the process env).
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let lookup = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        if let Some(host) = lookup(ENV_APP_HOST) {
            self.app_host = Some(host);
        }
        if let Some(mode) = lookup(ENV_EVENT_LISTENER_TYPE) {
            self.event_listener_type = mode.parse()?;
        }
        if let Some(url) = lookup(ENV_SINK_URL) {
            self.sink_url = Some(url);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.resync_interval_secs == 0 {
            return Err(Error::Configuration(
                "resync_interval_secs must be > 0".to_string(),
            ));
        }
        let mut seen = std::collections::BTreeSet::new();
        for p in &self.providers {
            if !seen.insert(p.provider.as_str()) {
                return Err(Error::Configuration(format!(
                    "provider '{}' is configured twice",
                    p.provider
                )));
            }
        }
        Ok(())
    }

    pub fn resync_interval(&self) -> Duration {
        Duration::from_secs(self.resync_interval_secs)
    }

    /// `app_host` without a trailing slash, if set and non-blank.
    pub fn app_host(&self) -> Option<&str> {
        self.app_host
            .as_deref()
            .map(|h| h.trim().trim_end_matches('/'))
            .filter(|h| !h.is_empty())
    }

    /// The effective config with every credential value masked.
    pub fn redacted(&self) -> serde_json::Value {
        let mut copy = self.clone();
        for p in &mut copy.providers {
            for value in p.credentials.values_mut() {
                *value = redact(value);
            }
            p.token_mapping = std::mem::take(&mut p.token_mapping)
                .into_iter()
                .map(|(token, groups)| (redact(&token), groups))
                .collect();
        }
        serde_json::to_value(copy).unwrap_or(serde_json::Value::Null)
    }
}

fn redact(s: &str) -> String {
    let chars: Vec<char> = s.chars().collect();
    if chars.len() <= 8 {
        return "***".to_string();
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{head}***{tail}")
}

#[cfg(test)]
mod tests {
    use super::*;

    const YAML: &str = r#"
app_host: https://resync.example.com/
event_listener_type: ONCE
providers:
  - provider: gitlab
    credentials:
      token: glpat-0123456789abcdef
    token_mapping:
      glpat-second-token-9999: ["platform/**"]
    kinds:
      - kind: folder
        selector:
          folders:
            - path: "*"
              repos: [backend, frontend]
              branch: main
      - kind: mergeRequest
        selector:
          window_days: 7
        batch_size: 50
  - provider: pagerduty
    rate_limit: 2
    credentials:
      token: short
"#;

    #[test]
    fn parses_yaml_with_defaults() {
        let cfg = IntegrationConfig::from_yaml(YAML).unwrap();
        assert_eq!(cfg.event_listener_type, EventListenerType::Once);
        assert_eq!(cfg.resync_interval_secs, 3600);
        assert_eq!(cfg.app_host(), Some("https://resync.example.com"));

        let gitlab = &cfg.providers[0];
        assert_eq!(gitlab.rate_limit, 8);
        assert_eq!(gitlab.enrich_concurrency, 10);
        let folder = gitlab.kind(ResourceKind::Folder).unwrap();
        assert_eq!(folder.selector.folders[0].repos, vec!["backend", "frontend"]);
        let mr = gitlab.kind(ResourceKind::MergeRequest).unwrap();
        assert_eq!(mr.selector.window_days_or(14), 7);
        assert_eq!(mr.batch_size, Some(50));
        assert_eq!(cfg.providers[1].rate_limit, 2);
        cfg.validate().unwrap();
    }

    #[test]
    fn env_overrides_win() {
        let mut cfg = IntegrationConfig::from_yaml(YAML).unwrap();
        cfg.apply_overrides(|key| match key {
            ENV_EVENT_LISTENER_TYPE => Some("polling".to_string()),
            ENV_SINK_URL => Some("http://catalog:9000".to_string()),
            ENV_APP_HOST => Some("  ".to_string()),
            _ => None,
        })
        .unwrap();
        assert_eq!(cfg.event_listener_type, EventListenerType::Polling);
        assert_eq!(cfg.sink_url.as_deref(), Some("http://catalog:9000"));
        assert_eq!(cfg.app_host(), Some("https://resync.example.com"));

        let err = cfg
            .apply_overrides(|key| (key == ENV_EVENT_LISTENER_TYPE).then(|| "sometimes".to_string()))
            .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn missing_credential_is_a_configuration_error() {
        let p = ProviderConfig::new("wiz").with_credential("client_id", " ");
        assert!(matches!(
            p.require_credential("client_id"),
            Err(Error::Configuration(_))
        ));
        assert!(p.require_credential("client_secret").is_err());
    }

    #[test]
    fn redaction_masks_credentials() {
        let cfg = IntegrationConfig::from_yaml(YAML).unwrap();
        let v = cfg.redacted();
        assert_eq!(v["providers"][0]["credentials"]["token"], "glpa***cdef");
        assert_eq!(v["providers"][1]["credentials"]["token"], "***");
        assert_eq!(
            v["providers"][0]["token_mapping"],
            serde_json::json!({"glpa***9999": ["platform/**"]})
        );
    }

    #[test]
    fn duplicate_providers_are_rejected() {
        let cfg = IntegrationConfig {
            providers: vec![ProviderConfig::new("gitlab"), ProviderConfig::new("gitlab")],
            ..IntegrationConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn json_config_is_accepted() {
        let cfg = IntegrationConfig::from_json(
            r#"{"providers":[{"provider":"wiz","kinds":[{"kind":"serviceTicket"}]}]}"#,
        )
        .unwrap();
        assert_eq!(cfg.providers[0].kinds[0].kind, ResourceKind::ServiceTicket);
        assert_eq!(cfg.event_listener_type, EventListenerType::Polling);
    }
}
