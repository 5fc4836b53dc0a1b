use std::error::Error as StdError;

/// Common error type for `resync_core`.
///
/// Variants follow the ingestion error taxonomy: transient provider failures are
/// left for the next scheduled pass, `NotFound` is the permanent 404 case that the
/// webhook path converts into a delete, and configuration problems only disable the
/// affected provider.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("transient provider error: {context}")]
    Transient {
        context: String,
        #[source]
        source: Option<Box<dyn StdError + Send + Sync + 'static>>,
    },

    #[error("provider rejected request ({status}): {context}")]
    Provider { status: u16, context: String },

    #[error("malformed event: {0}")]
    MalformedEvent(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("provider '{provider}' does not support resource kind '{kind}'")]
    UnsupportedKind { provider: String, kind: String },

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("resync pass cancelled")]
    Cancelled,

    #[error("backend error: {context}")]
    Backend {
        context: String,
        #[source]
        source: Box<dyn StdError + Send + Sync + 'static>,
    },

    #[error("backend error: {0}")]
    BackendMessage(String),
}

impl Error {
    #[tracing::instrument(level = "debug", name = "resync.error.backend", skip(source))]
    pub fn backend(
        context: impl Into<String> + std::fmt::Debug,
        source: impl StdError + Send + Sync + 'static,
    ) -> Self {
        Self::Backend {
            context: context.into(),
            source: Box::new(source),
        }
    }

    /// Wrap a reqwest failure. Timeouts and connection failures are transient.
    pub fn backend_reqwest(source: reqwest::Error) -> Self {
        if source.is_timeout() || source.is_connect() {
            return Self::Transient {
                context: "reqwest".into(),
                source: Some(Box::new(source)),
            };
        }
        if let Some(status) = source.status() {
            return Self::from_status(status.as_u16(), source.to_string());
        }
        Self::Backend {
            context: "reqwest".into(),
            source: Box::new(source),
        }
    }

    pub fn transient(context: impl Into<String>) -> Self {
        Self::Transient {
            context: context.into(),
            source: None,
        }
    }

    /// Classify a non-success HTTP status returned by a provider.
    pub fn from_status(status: u16, context: impl Into<String>) -> Self {
        let context = context.into();
        match status {
            404 => Self::NotFound(context),
            401 | 403 => Self::Unauthorized(context),
            408 | 429 | 500..=599 => Self::Transient {
                context: format!("status {status}: {context}"),
                source: None,
            },
            _ => Self::Provider { status, context },
        }
    }

    /// True for failures the scheduler may retry on its next pass.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }

    pub fn unsupported_kind(provider: &str, kind: impl std::fmt::Display) -> Self {
        Self::UnsupportedKind {
            provider: provider.to_string(),
            kind: kind.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
