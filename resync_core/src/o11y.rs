use crate::{Error, Result};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

pub const ENV_LOG_FORMAT: &str = "RESYNC_LOG_FORMAT";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

impl LogFormat {
    pub fn parse(value: Option<&str>) -> Result<Self> {
        match value.map(|v| v.trim().to_ascii_lowercase()).as_deref() {
            None | Some("") | Some("json") => Ok(Self::Json),
            Some("pretty") | Some("text") => Ok(Self::Pretty),
            Some(other) => Err(Error::Configuration(format!(
                "{ENV_LOG_FORMAT} must be 'json' or 'pretty', got '{other}'"
            ))),
        }
    }
}

/// Install the global subscriber: `RUST_LOG` filter (default `info`) and JSON or pretty
/// stdout output per `RESYNC_LOG_FORMAT`.
pub fn init_tracing_from_env() -> Result<()> {
    let format = LogFormat::parse(std::env::var(ENV_LOG_FORMAT).ok().as_deref())?;
    init_tracing(format)
}

pub fn init_tracing(format: LogFormat) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt = match format {
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .boxed(),
        LogFormat::Pretty => tracing_subscriber::fmt::layer()
            .with_target(true)
            .boxed(),
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt)
        .try_init()
        .map_err(|e| Error::backend("init tracing subscriber", e))
}
