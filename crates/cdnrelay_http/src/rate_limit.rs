use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use axum::{
    extract::{ConnectInfo, Request, State},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use http::{header, HeaderMap, HeaderValue, StatusCode};
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::app::AppState;

const MAX_BUCKETS: usize = 10_000;

#[derive(Debug, Clone, Copy)]
struct Bucket {
    count: u32,
    reset_at: Instant,
}

/// Fixed-window request counter per client key.
#[derive(Debug)]
pub struct RateLimiter {
    buckets: Mutex<HashMap<String, Bucket>>,
    limit: u32,
    window: Duration,
}

impl RateLimiter {
    pub fn new(limit: u32, window: Duration) -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
            limit,
            window,
        }
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    /// `Ok(remaining)` when admitted, `Err(time until reset)` otherwise.
    pub async fn check(&self, key: &str) -> Result<u32, Duration> {
        let now = Instant::now();
        let mut buckets = self.buckets.lock().await;

        if buckets.len() >= MAX_BUCKETS {
            let before = buckets.len();
            buckets.retain(|_, bucket| bucket.reset_at > now);
            debug!(evicted = before - buckets.len(), "expired rate limit buckets dropped");
        }

        let bucket = buckets.entry(key.to_string()).or_insert(Bucket {
            count: 0,
            reset_at: now + self.window,
        });
        if now >= bucket.reset_at {
            bucket.count = 0;
            bucket.reset_at = now + self.window;
        }

        if bucket.count < self.limit {
            bucket.count += 1;
            Ok(self.limit - bucket.count)
        } else {
            Err(bucket.reset_at.saturating_duration_since(now))
        }
    }
}

pub async fn rate_limit(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let key = client_key(&request);
    let limiter = &state.limiter;

    match limiter.check(&key).await {
        Ok(remaining) => {
            let mut response = next.run(request).await;
            set_limit_headers(response.headers_mut(), limiter.limit(), remaining);
            response
        }
        Err(reset_in) => {
            warn!(client = %key, path = %request.uri().path(), "rate limit exceeded");
            let mut response = (
                StatusCode::TOO_MANY_REQUESTS,
                Json(json!({ "error": "rate_limited", "kind": "rate_limited" })),
            )
                .into_response();
            set_limit_headers(response.headers_mut(), limiter.limit(), 0);
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(reset_in.as_secs().max(1)));
            response
        }
    }
}

fn set_limit_headers(headers: &mut HeaderMap, limit: u32, remaining: u32) {
    headers.insert("x-ratelimit-limit", HeaderValue::from(limit));
    headers.insert("x-ratelimit-remaining", HeaderValue::from(remaining));
}

fn client_key(request: &Request) -> String {
    if let Some(ConnectInfo(addr)) = request.extensions().get::<ConnectInfo<SocketAddr>>() {
        return addr.ip().to_string();
    }
    request
        .headers()
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(|ip| ip.trim().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}
