//! Optional HTTP basic-auth gate.
//!
//! Installed only when both `AUTH_LOGIN` and `AUTH_PASSWORD` are set. Every
//! route sits behind it, including the app shell and `/health`.

use axum::{
    extract::{Request, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use axum_extra::headers::{Authorization, HeaderMapExt, authorization::Basic};
use subtle::ConstantTimeEq;
use tracing::warn;

use super::state::AppState;
use crate::config::BasicAuth;

pub const REALM: &str = "vcserve";

/// Compare without short-circuiting on the first differing byte.
///
/// A length mismatch still runs a same-length comparison before failing.
fn constant_time_eq(provided: &str, expected: &str) -> bool {
    let provided = provided.as_bytes();
    let expected = expected.as_bytes();
    if provided.len() != expected.len() {
        let _ = expected.ct_eq(expected);
        return false;
    }
    provided.ct_eq(expected).into()
}

/// True when `headers` carry credentials matching `expected`.
fn is_authorized(headers: &HeaderMap, expected: &BasicAuth) -> bool {
    match headers.typed_get::<Authorization<Basic>>() {
        Some(Authorization(basic)) => {
            // Both halves are always compared.
            let login = constant_time_eq(basic.username(), &expected.login);
            let password = constant_time_eq(basic.password(), &expected.password);
            login & password
        }
        None => false,
    }
}

fn challenge() -> Response {
    let mut resp = (StatusCode::UNAUTHORIZED, "Unauthorized\n").into_response();
    if let Ok(value) = HeaderValue::from_str(&format!("Basic realm=\"{}\"", REALM)) {
        resp.headers_mut().insert(header::WWW_AUTHENTICATE, value);
    }
    resp
}

/// Axum middleware: reject requests without valid basic credentials.
pub async fn basic_auth_middleware(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Response {
    if let Some(ref expected) = state.config.auth
        && !is_authorized(req.headers(), expected)
    {
        warn!("Rejected unauthenticated request for {}", req.uri().path());
        return challenge();
    }

    next.run(req).await
}
