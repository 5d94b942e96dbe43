//! Token-bucket rate limiting for the caller-facing API.
//!
//! One bucket per caller. When caller auth is enabled the bucket key is the
//! presented Bearer token (so agents behind one NAT are limited separately);
//! otherwise it falls back to the client IP. Tokens refill at `rpm / 60`
//! per second and the burst cap is `ceil(rpm / 2)`.
//!
//! Rejected requests get `429` with:
//! - `Retry-After: <seconds>` — wait before a token is available again
//! - `X-RateLimit-Limit: <rpm>` — configured limit
//! - `X-RateLimit-Policy: <N>;w=60` — standard hint: N per 60-second window

use std::{
    net::{IpAddr, SocketAddr},
    sync::Arc,
    time::Instant,
};

use axum::{
    extract::{ConnectInfo, Request, State},
    http::{header, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use dashmap::DashMap;

use crate::state::GatewayState;

/// Bucket identity: caller token when auth is on, client IP otherwise.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CallerKey {
    Token(String),
    Ip(IpAddr),
}

#[derive(Debug, Clone)]
struct Bucket {
    last_refill: Instant,
    /// Fractional to avoid refill drift.
    tokens: f64,
}

pub struct RateLimiter {
    pub rpm: u32,
    fill_rate: f64,
    capacity: f64,
    buckets: DashMap<CallerKey, Bucket>,
}

impl RateLimiter {
    pub fn new(rpm: u32) -> Self {
        let capacity = ((rpm + 1) / 2) as f64; // ceil(rpm / 2)
        Self {
            rpm,
            fill_rate: rpm as f64 / 60.0,
            capacity,
            buckets: DashMap::new(),
        }
    }

    /// Consume one token for the caller, or return the retry-after seconds.
    pub fn check(&self, key: CallerKey) -> Result<(), f64> {
        let now = Instant::now();
        let mut bucket = self.buckets.entry(key).or_insert_with(|| Bucket {
            last_refill: now,
            tokens: self.capacity,
        });

        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        let refilled = (bucket.tokens + elapsed * self.fill_rate).min(self.capacity);

        if refilled < 1.0 {
            let retry_after = (1.0 - refilled) / self.fill_rate;
            return Err(retry_after.ceil());
        }

        bucket.last_refill = now;
        bucket.tokens = refilled - 1.0;
        Ok(())
    }
}

/// Axum middleware enforcing per-caller limits. No-ops when the limiter is
/// disabled in config.
pub async fn rate_limit_middleware(
    State(state): State<Arc<GatewayState>>,
    req: Request,
    next: Next,
) -> Response {
    if let Some(limiter) = &state.rate_limiter {
        let key = caller_key(&state, &req);
        if let Err(retry_after) = limiter.check(key) {
            return (
                StatusCode::TOO_MANY_REQUESTS,
                [
                    ("retry-after", retry_after.to_string()),
                    ("x-ratelimit-limit", limiter.rpm.to_string()),
                    ("x-ratelimit-policy", format!("{};w=60", limiter.rpm)),
                    ("content-type", "text/plain".into()),
                ],
                "Rate limit exceeded. Please retry after the indicated delay.",
            )
                .into_response();
        }
    }

    next.run(req).await
}

fn caller_key(state: &GatewayState, req: &Request) -> CallerKey {
    if !state.client_tokens.is_empty() {
        if let Some(token) = req
            .headers()
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
        {
            return CallerKey::Token(token.to_string());
        }
    }

    let ip = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|c| c.0.ip())
        .unwrap_or(IpAddr::V4(std::net::Ipv4Addr::LOCALHOST));
    CallerKey::Ip(ip)
}
