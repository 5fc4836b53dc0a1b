//! Provider integrations for the resync engine.
//!
//! Each connector implements [`resync_core::ProviderClient`]; [`build_provider`] picks one by
//! the `provider` field of its config.

pub mod connectors;

use resync_core::{Error, ProviderClient, ProviderConfig, Result};
use std::sync::Arc;

/// Providers compiled into this build.
pub fn available_providers() -> Vec<&'static str> {
    let mut ids = Vec::new();
    #[cfg(feature = "gitlab")]
    ids.push(connectors::gitlab::PROVIDER);
    #[cfg(feature = "pagerduty")]
    ids.push(connectors::pagerduty::PROVIDER);
    #[cfg(feature = "wiz")]
    ids.push(connectors::wiz::PROVIDER);
    ids
}

/// Construct the client for `cfg.provider`.
///
/// Missing credentials and unknown provider names are `Error::Configuration`, which
/// `SyncContext::build` treats as "disable this provider".
pub fn build_provider(cfg: &ProviderConfig) -> Result<Arc<dyn ProviderClient>> {
    match cfg.provider.trim().to_ascii_lowercase().as_str() {
        #[cfg(feature = "gitlab")]
        connectors::gitlab::PROVIDER => {
            Ok(Arc::new(connectors::gitlab::GitlabProvider::from_config(cfg)?))
        }
        #[cfg(feature = "pagerduty")]
        connectors::pagerduty::PROVIDER => Ok(Arc::new(
            connectors::pagerduty::PagerDutyProvider::from_config(cfg)?,
        )),
        #[cfg(feature = "wiz")]
        connectors::wiz::PROVIDER => Ok(Arc::new(connectors::wiz::WizProvider::from_config(cfg)?)),
        other => Err(Error::Configuration(format!(
            "unknown provider '{other}' (available: {})",
            available_providers().join(", ")
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use resync_core::{IntegrationConfig, MemorySink, SyncContext};

    #[test]
    fn unknown_provider_is_a_configuration_error() {
        let err = build_provider(&ProviderConfig::new("jenkins")).err().unwrap();
        assert!(matches!(err, Error::Configuration(ref m) if m.contains("jenkins")));
    }

    #[test]
    fn builds_each_provider_from_credentials() {
        let gitlab = ProviderConfig::new("GitLab").with_credential("token", "glpat");
        assert_eq!(build_provider(&gitlab).unwrap().id(), "gitlab");

        let pd = ProviderConfig::new("pagerduty").with_credential("token", "pd");
        assert_eq!(build_provider(&pd).unwrap().id(), "pagerduty");

        let mut wiz = ProviderConfig::new("wiz")
            .with_credential("client_id", "id")
            .with_credential("client_secret", "secret");
        wiz.base_url = Some("https://api.us1.app.wiz.io/graphql".to_string());
        assert_eq!(build_provider(&wiz).unwrap().id(), "wiz");
    }

    #[test]
    fn context_skips_misconfigured_providers() {
        let config = IntegrationConfig {
            providers: vec![
                ProviderConfig::new("pagerduty").with_credential("token", "pd"),
                ProviderConfig::new("gitlab"),
            ],
            ..IntegrationConfig::default()
        };
        let ctx = SyncContext::build(config, Arc::new(MemorySink::new()), build_provider).unwrap();
        assert!(ctx.provider("pagerduty").is_ok());
        assert!(ctx.provider("gitlab").is_err());
    }
}
