use axum::{
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

/// Errors surfaced by the asset resolver and the HTTP layer.
///
/// The type is `Clone` so a single origin outcome can be broadcast to every
/// request waiting on the same in-flight fetch.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum VcServeError {
    #[error("asset not found: {0}")]
    NotFound(String),

    #[error("rejected asset path: {0}")]
    PathRejected(String),

    #[error("requested range not satisfiable for {size} byte asset")]
    RangeNotSatisfiable { size: u64 },

    /// Origin answered with a non-2xx status; the status is surfaced verbatim.
    #[error("origin returned {0}")]
    OriginStatus(StatusCode),

    #[error("origin unavailable: {0}")]
    OriginUnavailable(String),

    #[error("origin timed out after {0:?}")]
    OriginTimeout(Duration),

    #[error("cache write failed: {0}")]
    WriteFailed(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("internal error: {0}")]
    InternalError(String),
}

pub type Result<T> = std::result::Result<T, VcServeError>;

impl VcServeError {
    /// HTTP status this error maps to.
    pub fn status(&self) -> StatusCode {
        match self {
            VcServeError::NotFound(_) => StatusCode::NOT_FOUND,
            VcServeError::PathRejected(_) => StatusCode::BAD_REQUEST,
            VcServeError::RangeNotSatisfiable { .. } => StatusCode::RANGE_NOT_SATISFIABLE,
            VcServeError::OriginStatus(status) => *status,
            VcServeError::OriginUnavailable(_) => StatusCode::BAD_GATEWAY,
            VcServeError::OriginTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            VcServeError::WriteFailed(_)
            | VcServeError::Config(_)
            | VcServeError::InternalError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<std::io::Error> for VcServeError {
    fn from(e: std::io::Error) -> Self {
        if e.kind() == std::io::ErrorKind::NotFound {
            VcServeError::NotFound(e.to_string())
        } else {
            VcServeError::InternalError(e.to_string())
        }
    }
}

impl From<reqwest::Error> for VcServeError {
    fn from(e: reqwest::Error) -> Self {
        match e.status() {
            Some(status) => VcServeError::OriginStatus(status),
            None => VcServeError::OriginUnavailable(e.to_string()),
        }
    }
}

impl IntoResponse for VcServeError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            warn!("Request failed with {}: {}", status, self);
        }

        match self {
            VcServeError::RangeNotSatisfiable { size } => (
                status,
                [(header::CONTENT_RANGE, format!("bytes */{}", size))],
                format!("{}\n", self),
            )
                .into_response(),
            other => (status, format!("{}\n", other)).into_response(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn origin_status_is_surfaced_verbatim() {
        let err = VcServeError::OriginStatus(StatusCode::FORBIDDEN);
        assert_eq!(err.status(), StatusCode::FORBIDDEN);
    }

    #[test]
    fn gateway_statuses() {
        assert_eq!(
            VcServeError::OriginUnavailable("refused".into()).status(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            VcServeError::OriginTimeout(Duration::from_secs(1)).status(),
            StatusCode::GATEWAY_TIMEOUT
        );
    }

    #[test]
    fn rejected_path_is_bad_request() {
        let err = VcServeError::PathRejected("../etc/passwd".into());
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn io_not_found_maps_to_not_found() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        assert!(matches!(VcServeError::from(io), VcServeError::NotFound(_)));

        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "nope");
        assert!(matches!(
            VcServeError::from(io),
            VcServeError::InternalError(_)
        ));
    }

    #[test]
    fn unsatisfiable_range_carries_content_range() {
        let resp = VcServeError::RangeNotSatisfiable { size: 1000 }.into_response();
        assert_eq!(resp.status(), StatusCode::RANGE_NOT_SATISFIABLE);
        assert_eq!(
            resp.headers().get(header::CONTENT_RANGE).unwrap(),
            "bytes */1000"
        );
    }
}
