//! Shared bearer token for worker callbacks.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::Response;
use secrecy::{ExposeSecret, SecretString};
use subtle::ConstantTimeEq;

/// Expected callback token; `None` disables the check.
#[derive(Clone, Default)]
pub struct CallbackAuth {
    token: Option<Arc<SecretString>>,
}

impl CallbackAuth {
    pub fn new(token: Option<SecretString>) -> Self {
        Self {
            token: token.map(Arc::new),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.token.is_some()
    }

    fn accepts(&self, presented: Option<&str>) -> bool {
        match (&self.token, presented) {
            (None, _) => true,
            (Some(expected), Some(presented)) => {
                constant_time_eq(expected.expose_secret().as_bytes(), presented.as_bytes())
            }
            (Some(_), None) => false,
        }
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    bool::from(a.ct_eq(b))
}

/// Reject callbacks without the configured `Authorization: Bearer` token.
pub async fn callback_auth_middleware(
    State(auth): State<CallbackAuth>,
    request: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let presented = request
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    if !auth.accepts(presented) {
        tracing::warn!(path = %request.uri().path(), "Rejected callback with bad or missing token");
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(next.run(request).await)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_accepts_anything() {
        let auth = CallbackAuth::new(None);
        assert!(!auth.is_enabled());
        assert!(auth.accepts(None));
        assert!(auth.accepts(Some("whatever")));
    }

    #[test]
    fn enabled_requires_exact_token() {
        let auth = CallbackAuth::new(Some(SecretString::from("tok-123".to_string())));
        assert!(auth.accepts(Some("tok-123")));
        assert!(!auth.accepts(Some("tok-124")));
        assert!(!auth.accepts(Some("tok-1234")));
        assert!(!auth.accepts(None));
    }

    #[test]
    fn token_compare_needs_equal_length_and_bytes() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"abcd"));
        assert!(constant_time_eq(b"", b""));
    }
}
