use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use resync_core::Error;
use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
}

#[derive(thiserror::Error, Debug)]
pub enum ApiError {
    #[error("{0}")]
    Core(#[from] Error),
}

impl ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::Core(err) => match err {
                Error::InvalidInput(_)
                | Error::UnsupportedKind { .. }
                | Error::MalformedEvent(_) => StatusCode::BAD_REQUEST,
                Error::NotFound(_) => StatusCode::NOT_FOUND,
                Error::Conflict(_) => StatusCode::CONFLICT,
                Error::Unauthorized(_) => StatusCode::UNAUTHORIZED,
                Error::Transient { .. } | Error::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
                Error::Provider { .. } | Error::Backend { .. } | Error::BackendMessage(_) => {
                    StatusCode::BAD_GATEWAY
                }
                Error::Configuration(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let code = self.status_code();
        if code.is_server_error() {
            tracing::warn!(status = code.as_u16(), error = %self, "request failed");
        }
        let body = ErrorBody {
            error: self.to_string(),
        };
        (code, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn core_errors_map_to_statuses() {
        let cases = [
            (Error::NotFound("p".into()), StatusCode::NOT_FOUND),
            (Error::Conflict("busy".into()), StatusCode::CONFLICT),
            (Error::Unauthorized("token".into()), StatusCode::UNAUTHORIZED),
            (
                Error::unsupported_kind("wiz", resync_core::ResourceKind::Job),
                StatusCode::BAD_REQUEST,
            ),
            (Error::BackendMessage("boom".into()), StatusCode::BAD_GATEWAY),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError::from(err).into_response().status(), status);
        }
    }
}
