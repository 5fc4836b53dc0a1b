//! Provider connectors, one per cargo feature.

#[cfg(feature = "gitlab")]
pub mod gitlab;
#[cfg(feature = "pagerduty")]
pub mod pagerduty;
#[cfg(feature = "wiz")]
pub mod wiz;
