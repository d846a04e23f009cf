//! Token check for the control API.
//!
//! Every request must carry the configured token in `X-Keeper-Token`;
//! anything else is rejected with 401 Unauthorized.

use axum::{
    body::Body,
    extract::State,
    http::{Request, StatusCode},
    middleware::Next,
    response::Response,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use super::IPCServer;

pub const TOKEN_HEADER: &str = "X-Keeper-Token";

/// At most one auth-failure warning per window; the rest are counted.
const FAIL_LOG_WINDOW: Duration = Duration::from_secs(30);

#[derive(Default)]
pub struct AuthFailLog {
    last: Mutex<Option<Instant>>,
    suppressed: AtomicU64,
}

impl AuthFailLog {
    fn record(&self, uri: &axum::http::Uri, provided: &str) {
        let should_log = {
            let mut last = self.last.lock().unwrap_or_else(|e| e.into_inner());
            match *last {
                Some(t) if t.elapsed() < FAIL_LOG_WINDOW => false,
                _ => {
                    *last = Some(Instant::now());
                    true
                }
            }
        };
        if !should_log {
            self.suppressed.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let provided_hint = if provided.is_empty() { "(empty)" } else { "(mismatch)" };
        let suppressed = self.suppressed.swap(0, Ordering::Relaxed);
        if suppressed > 0 {
            tracing::warn!(
                "Control API auth failed for {}: token {} (suppressed {} previous)",
                uri,
                provided_hint,
                suppressed
            );
        } else {
            tracing::warn!("Control API auth failed for {}: token {}", uri, provided_hint);
        }
    }
}

/// axum middleware: `X-Keeper-Token` must equal the configured token.
pub async fn auth_middleware(
    State(state): State<IPCServer>,
    req: Request<Body>,
    next: Next,
) -> Result<Response, StatusCode> {
    let provided = req
        .headers()
        .get(TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    if constant_time_eq(provided.as_bytes(), state.token.as_bytes()) {
        Ok(next.run(req).await)
    } else {
        state.auth_failures.record(req.uri(), provided);
        Err(StatusCode::UNAUTHORIZED)
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
