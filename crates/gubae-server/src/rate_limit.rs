use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{ConnectInfo, Request, State},
    middleware::Next,
    response::Response,
};
use tokio::sync::Mutex;
use tracing::warn;

use gubae_shared::constants::HEADER_USER_ID;

use crate::error::ApiError;

#[derive(Debug, Clone)]
struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(capacity: f64) -> Self {
        Self {
            tokens: capacity,
            last_refill: Instant::now(),
        }
    }

    fn try_consume(&mut self, rate: f64, capacity: f64) -> bool {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.last_refill = now;

        self.tokens = (self.tokens + elapsed * rate).min(capacity);

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// Identified callers are limited per user, anonymous ones per address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RateKey {
    User(String),
    Ip(IpAddr),
}

#[derive(Clone)]
pub struct RateLimiter {
    buckets: Arc<Mutex<HashMap<RateKey, TokenBucket>>>,
    rate: f64,
    capacity: f64,
}

impl RateLimiter {
    pub fn new(rate: f64, capacity: f64) -> Self {
        Self {
            buckets: Arc::new(Mutex::new(HashMap::new())),
            rate,
            capacity,
        }
    }

    pub async fn check(&self, key: RateKey) -> bool {
        let mut buckets = self.buckets.lock().await;
        let bucket = buckets
            .entry(key)
            .or_insert_with(|| TokenBucket::new(self.capacity));
        bucket.try_consume(self.rate, self.capacity)
    }

    pub async fn purge_stale(&self, max_idle_secs: f64) {
        let mut buckets = self.buckets.lock().await;
        let now = Instant::now();
        buckets.retain(|_, bucket| {
            now.duration_since(bucket.last_refill).as_secs_f64() < max_idle_secs
        });
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(10.0, 30.0)
    }
}

pub async fn rate_limit_middleware(
    State(limiter): State<RateLimiter>,
    req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    if let Some(key) = rate_key(&req) {
        if !limiter.check(key.clone()).await {
            warn!(key = ?key, "Rate limit exceeded");
            return Err(ApiError::RateLimited);
        }
    }

    Ok(next.run(req).await)
}

fn rate_key<B>(req: &axum::http::Request<B>) -> Option<RateKey> {
    if let Some(user) = req
        .headers()
        .get(HEADER_USER_ID)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
    {
        return Some(RateKey::User(user.to_string()));
    }
    extract_client_ip(req).map(RateKey::Ip)
}

/// Try ConnectInfo first, then X-Forwarded-For, then X-Real-IP.
fn extract_client_ip<B>(req: &axum::http::Request<B>) -> Option<IpAddr> {
    if let Some(connect_info) = req.extensions().get::<ConnectInfo<std::net::SocketAddr>>() {
        return Some(connect_info.0.ip());
    }

    if let Some(forwarded) = req.headers().get("x-forwarded-for") {
        if let Ok(value) = forwarded.to_str() {
            if let Some(first) = value.split(',').next() {
                if let Ok(ip) = first.trim().parse::<IpAddr>() {
                    return Some(ip);
                }
            }
        }
    }

    if let Some(real_ip) = req.headers().get("x-real-ip") {
        if let Ok(value) = real_ip.to_str() {
            if let Ok(ip) = value.trim().parse::<IpAddr>() {
                return Some(ip);
            }
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(id: &str) -> RateKey {
        RateKey::User(id.to_string())
    }

    #[tokio::test]
    async fn test_rate_limiter_allows_burst() {
        let limiter = RateLimiter::new(10.0, 5.0);

        for _ in 0..5 {
            assert!(limiter.check(user("alice")).await);
        }

        assert!(!limiter.check(user("alice")).await);
    }

    #[tokio::test]
    async fn test_rate_limiter_separate_keys() {
        let limiter = RateLimiter::new(10.0, 2.0);
        let ip: IpAddr = "10.0.0.1".parse().unwrap();

        assert!(limiter.check(RateKey::Ip(ip)).await);
        assert!(limiter.check(RateKey::Ip(ip)).await);
        assert!(!limiter.check(RateKey::Ip(ip)).await);

        assert!(limiter.check(user("bob")).await);
    }

    #[tokio::test]
    async fn test_purge_stale() {
        let limiter = RateLimiter::new(10.0, 5.0);
        assert!(limiter.check(user("carol")).await);

        limiter.purge_stale(0.0).await;

        let buckets = limiter.buckets.lock().await;
        assert!(buckets.is_empty());
    }

    #[test]
    fn test_user_header_wins_over_address() {
        let req = axum::http::Request::builder()
            .header(HEADER_USER_ID, "alice")
            .header("x-forwarded-for", "10.0.0.9")
            .body(())
            .unwrap();
        assert_eq!(rate_key(&req), Some(user("alice")));

        let anon = axum::http::Request::builder()
            .header("x-forwarded-for", "10.0.0.9, 10.0.0.1")
            .body(())
            .unwrap();
        assert_eq!(rate_key(&anon), Some(RateKey::Ip("10.0.0.9".parse().unwrap())));
    }
}
