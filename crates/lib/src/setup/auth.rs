//! HTTP Basic auth gate for the setup surface. The username is ignored.

use axum::{
    extract::{Request, State},
    http::{header, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use base64::Engine as _;
use std::sync::Arc;

const REALM: &str = "Basic realm=\"openclaw setup\"";

#[derive(Clone)]
pub struct SetupAuth {
    password: Option<Arc<str>>,
}

impl SetupAuth {
    pub fn new(password: Option<String>) -> Self {
        Self {
            password: password.map(Arc::from),
        }
    }
}

/// Password from an `Authorization: Basic ...` value.
pub fn basic_password(value: &str) -> Option<String> {
    let encoded = value.strip_prefix("Basic ").or_else(|| value.strip_prefix("basic "))?;
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .ok()?;
    let text = String::from_utf8(decoded).ok()?;
    let (_, password) = text.split_once(':')?;
    Some(password.to_string())
}

pub fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.bytes().zip(b.bytes()).fold(0, |acc, (x, y)| acc | (x ^ y)) == 0
}

pub async fn require_password(
    State(auth): State<SetupAuth>,
    request: Request,
    next: Next,
) -> Response {
    let Some(expected) = auth.password.as_deref() else {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            "SETUP_PASSWORD is not set. Set it in the service variables before using /setup.",
        )
            .into_response();
    };
    let provided = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(basic_password);
    match provided {
        Some(p) if constant_time_eq(&p, expected) => next.run(request).await,
        _ => (
            StatusCode::UNAUTHORIZED,
            [(header::WWW_AUTHENTICATE, REALM)],
            "Auth required",
        )
            .into_response(),
    }
}
