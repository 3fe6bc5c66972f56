use crate::error::ApiError;
use axum::{
    extract::{ConnectInfo, Request, State},
    http::{HeaderMap, HeaderValue},
    middleware::Next,
    response::Response,
};
use chrono::Utc;
use std::{collections::HashMap, net::SocketAddr, sync::Arc};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const WINDOW_SECS: i64 = 60;
const GENERAL_LIMIT: u32 = 30;
const STRICT_LIMIT: u32 = 5;
const BLOCK_SECS: i64 = 15 * 60;
const SWEEP_SECS: u64 = 5 * 60;

/// Which limit applies to a request. The two kinds keep independent window
/// counters but share one block list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitKind {
    /// Any endpoint.
    General,
    /// Credential-sensitive endpoints; exceeding this one escalates to a
    /// temporary full block.
    Strict,
}

impl LimitKind {
    fn limit(&self) -> u32 {
        match self {
            LimitKind::General => GENERAL_LIMIT,
            LimitKind::Strict => STRICT_LIMIT,
        }
    }
}

#[derive(Debug, Clone)]
struct ClientWindow {
    started: i64,
    count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allowed { remaining: u32, resets_in_secs: i64 },
    /// Over the window limit; only this request is rejected.
    Limited { retry_after_secs: i64 },
    /// On the block list; everything from this client is rejected until the
    /// block expires.
    Blocked { retry_after_secs: i64 },
}

/// Sliding-window request throttle, process-local by design: losing this
/// state on restart degrades abuse protection briefly but never correctness.
pub struct RateLimiter {
    general: Mutex<HashMap<String, ClientWindow>>,
    strict: Mutex<HashMap<String, ClientWindow>>,
    blocks: Mutex<HashMap<String, i64>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self {
            general: Mutex::new(HashMap::new()),
            strict: Mutex::new(HashMap::new()),
            blocks: Mutex::new(HashMap::new()),
        }
    }

    pub async fn admit(&self, client_id: &str, kind: LimitKind) -> Decision {
        self.admit_at(client_id, kind, Utc::now().timestamp()).await
    }

    async fn admit_at(&self, client_id: &str, kind: LimitKind, now: i64) -> Decision {
        {
            let mut blocks = self.blocks.lock().await;
            if let Some(&blocked_at) = blocks.get(client_id) {
                let elapsed = now - blocked_at;
                if elapsed < BLOCK_SECS {
                    return Decision::Blocked {
                        retry_after_secs: BLOCK_SECS - elapsed,
                    };
                }
                blocks.remove(client_id);
            }
        }

        let windows = match kind {
            LimitKind::General => &self.general,
            LimitKind::Strict => &self.strict,
        };
        // Single lock scope per client+kind: the read-modify-write below is
        // one atomic step, so concurrent requests cannot lose an increment.
        let mut windows = windows.lock().await;
        let entry = windows
            .entry(client_id.to_string())
            .or_insert(ClientWindow { started: now, count: 0 });
        if now - entry.started >= WINDOW_SECS {
            entry.started = now;
            entry.count = 0;
        }
        entry.count += 1;
        let limit = kind.limit();
        if entry.count > limit {
            let resets_in = entry.started + WINDOW_SECS - now;
            if kind == LimitKind::Strict {
                windows.remove(client_id);
                self.blocks.lock().await.insert(client_id.to_string(), now);
                warn!("Client {} exceeded strict limit, blocked for {}s", client_id, BLOCK_SECS);
                return Decision::Blocked {
                    retry_after_secs: BLOCK_SECS,
                };
            }
            debug!("Client {} over general limit, rejecting request", client_id);
            return Decision::Limited {
                retry_after_secs: resets_in,
            };
        }
        Decision::Allowed {
            remaining: limit - entry.count,
            resets_in_secs: entry.started + WINDOW_SECS - now,
        }
    }

    /// Evict expired windows and blocks so the maps stay bounded.
    pub async fn sweep(&self) {
        self.sweep_at(Utc::now().timestamp()).await;
    }

    async fn sweep_at(&self, now: i64) {
        let mut removed = 0usize;
        for windows in [&self.general, &self.strict] {
            let mut windows = windows.lock().await;
            let before = windows.len();
            windows.retain(|_, w| now - w.started < WINDOW_SECS);
            removed += before - windows.len();
        }
        let mut blocks = self.blocks.lock().await;
        let before = blocks.len();
        blocks.retain(|_, blocked_at| now - *blocked_at < BLOCK_SECS);
        removed += before - blocks.len();
        if removed > 0 {
            debug!("Rate limiter sweep evicted {} entries", removed);
        }
    }

    /// Periodic sweep task, owned by the limiter's lifecycle.
    pub fn spawn_sweeper(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs(SWEEP_SECS));
            ticker.tick().await; // first tick fires immediately
            loop {
                ticker.tick().await;
                self.sweep().await;
            }
        })
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

/// Derive a client identifier from proxy headers, falling back to the socket
/// address. This is a heuristic, not authentication: without a trusted proxy
/// in front, x-forwarded-for and x-real-ip are client-controlled.
pub fn client_id(headers: &HeaderMap, addr: Option<SocketAddr>) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.split(',').next().unwrap_or(s).trim().to_string())
        .filter(|s| !s.is_empty())
        .or_else(|| {
            headers
                .get("x-real-ip")
                .and_then(|v| v.to_str().ok())
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
        })
        .or_else(|| addr.map(|a| a.ip().to_string()))
        .unwrap_or_else(|| "unknown".to_string())
}

fn throttled(retry_after_secs: i64) -> ApiError {
    ApiError::Throttled {
        retry_after_secs: retry_after_secs.max(0) as u64,
    }
}

async fn enforce(
    limiter: &RateLimiter,
    kind: LimitKind,
    headers: &HeaderMap,
    addr: Option<SocketAddr>,
    req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let client = client_id(headers, addr);
    match limiter.admit(&client, kind).await {
        Decision::Allowed { remaining, resets_in_secs } => {
            let mut res = next.run(req).await;
            if let Ok(v) = HeaderValue::from_str(&remaining.to_string()) {
                res.headers_mut().insert("x-ratelimit-remaining", v);
            }
            if let Ok(v) = HeaderValue::from_str(&resets_in_secs.to_string()) {
                res.headers_mut().insert("x-ratelimit-reset", v);
            }
            Ok(res)
        }
        Decision::Limited { retry_after_secs } => {
            warn!("Rate limit exceeded for {}", client);
            Err(throttled(retry_after_secs))
        }
        Decision::Blocked { retry_after_secs } => {
            let minutes = (retry_after_secs + 59) / 60;
            info!("Blocked client {} rejected, {}m remaining", client, minutes);
            Err(throttled(retry_after_secs))
        }
    }
}

pub async fn general_limit(
    State(limiter): State<Arc<RateLimiter>>,
    headers: HeaderMap,
    addr: Option<ConnectInfo<SocketAddr>>,
    req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    enforce(
        limiter.as_ref(),
        LimitKind::General,
        &headers,
        addr.map(|ConnectInfo(a)| a),
        req,
        next,
    )
    .await
}

pub async fn strict_limit(
    State(limiter): State<Arc<RateLimiter>>,
    headers: HeaderMap,
    addr: Option<ConnectInfo<SocketAddr>>,
    req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    enforce(
        limiter.as_ref(),
        LimitKind::Strict,
        &headers,
        addr.map(|ConnectInfo(a)| a),
        req,
        next,
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allowed(d: Decision) -> bool {
        matches!(d, Decision::Allowed { .. })
    }

    #[tokio::test]
    async fn strict_limit_escalates_to_block() {
        let limiter = RateLimiter::new();
        let t0 = 1_000_000;
        for i in 0..STRICT_LIMIT {
            let d = limiter.admit_at("10.0.0.1", LimitKind::Strict, t0 + i as i64).await;
            assert!(allowed(d), "request {} should pass", i + 1);
        }
        let sixth = limiter.admit_at("10.0.0.1", LimitKind::Strict, t0 + 5).await;
        assert!(matches!(sixth, Decision::Blocked { .. }));

        // Anything before the block elapses is rejected, even general traffic.
        let during = limiter
            .admit_at("10.0.0.1", LimitKind::General, t0 + BLOCK_SECS - 1)
            .await;
        assert!(matches!(during, Decision::Blocked { retry_after_secs } if retry_after_secs > 0));

        // After the block duration the client is clean again.
        let after = limiter
            .admit_at("10.0.0.1", LimitKind::Strict, t0 + 5 + BLOCK_SECS)
            .await;
        assert!(allowed(after));
    }

    #[tokio::test]
    async fn general_limit_never_blocks() {
        let limiter = RateLimiter::new();
        let t0 = 2_000_000;
        for _ in 0..GENERAL_LIMIT {
            assert!(allowed(limiter.admit_at("10.0.0.2", LimitKind::General, t0).await));
        }
        let over = limiter.admit_at("10.0.0.2", LimitKind::General, t0).await;
        assert!(matches!(over, Decision::Limited { .. }));

        // Not on the block list: next window admits again.
        let next_window = limiter
            .admit_at("10.0.0.2", LimitKind::General, t0 + WINDOW_SECS)
            .await;
        assert!(allowed(next_window));
    }

    #[tokio::test]
    async fn window_resets_after_expiry() {
        let limiter = RateLimiter::new();
        let t0 = 3_000_000;
        for _ in 0..STRICT_LIMIT {
            assert!(allowed(limiter.admit_at("c", LimitKind::Strict, t0).await));
        }
        // New window, fresh counter; no escalation happened.
        assert!(allowed(limiter.admit_at("c", LimitKind::Strict, t0 + WINDOW_SECS).await));
    }

    #[tokio::test]
    async fn kinds_do_not_share_counters() {
        let limiter = RateLimiter::new();
        let t0 = 4_000_000;
        for _ in 0..STRICT_LIMIT {
            assert!(allowed(limiter.admit_at("c", LimitKind::Strict, t0).await));
        }
        // Strict window is saturated but general still admits.
        assert!(allowed(limiter.admit_at("c", LimitKind::General, t0).await));
    }

    #[tokio::test]
    async fn sweep_evicts_expired_entries() {
        let limiter = RateLimiter::new();
        let t0 = 5_000_000;
        limiter.admit_at("old", LimitKind::General, t0).await;
        for _ in 0..=STRICT_LIMIT {
            limiter.admit_at("bad", LimitKind::Strict, t0).await;
        }
        limiter.sweep_at(t0 + BLOCK_SECS + 1).await;
        assert!(limiter.general.lock().await.is_empty());
        assert!(limiter.blocks.lock().await.is_empty());
    }

    #[test]
    fn client_id_prefers_forwarded_for() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "203.0.113.9, 10.0.0.1".parse().unwrap());
        headers.insert("x-real-ip", "198.51.100.2".parse().unwrap());
        assert_eq!(client_id(&headers, None), "203.0.113.9");

        let mut headers = HeaderMap::new();
        headers.insert("x-real-ip", "198.51.100.2".parse().unwrap());
        assert_eq!(client_id(&headers, None), "198.51.100.2");

        let addr: SocketAddr = "192.0.2.4:9000".parse().unwrap();
        assert_eq!(client_id(&HeaderMap::new(), Some(addr)), "192.0.2.4");
        assert_eq!(client_id(&HeaderMap::new(), None), "unknown");
    }
}
