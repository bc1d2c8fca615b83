//! OSRM `match` client with rate limiting.
//!
//! This module provides the network [`MatchService`] with:
//! - Connection pooling and a per-request timeout
//! - Dispatch rate limiting (spaces out request starts)
//! - Automatic retry with exponential backoff on transient failures
//!
//! Public OSRM servers throttle aggressively; set
//! [`OsrmConfig::dispatch_interval`] when talking to one.

use async_trait::async_trait;
use log::{debug, info, warn};
use reqwest::Client;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use url::Url;

use crate::error::MatchError;
use crate::matching::{build_match_url, decode_match_response, MatchService};
use crate::{MatchedRoute, Sample};

const MAX_CONCURRENCY: usize = 16;
const MAX_ERROR_BODY: usize = 200;

/// Connection and retry settings for [`OsrmClient`].
#[derive(Debug, Clone)]
pub struct OsrmConfig {
    /// Server root; the `match/v1/...` path is appended to it
    pub base_url: String,
    /// Per-request timeout, covering connect through body download
    pub timeout: Duration,
    /// Retries after the first attempt for transient failures
    pub max_retries: u32,
    /// Backoff before retry `n` is `retry_base_delay * 2^n`
    pub retry_base_delay: Duration,
    /// Minimum spacing between request starts (zero disables throttling)
    pub dispatch_interval: Duration,
    /// Radius sent for samples without a recorded accuracy (meters)
    pub default_radius: f64,
    /// Matchings below this confidence are dropped
    pub min_confidence: f64,
}

impl Default for OsrmConfig {
    fn default() -> Self {
        Self {
            base_url: "https://router.project-osrm.org/".to_string(),
            timeout: Duration::from_secs(30),
            max_retries: 3,
            retry_base_delay: Duration::from_millis(200),
            dispatch_interval: Duration::ZERO,
            default_radius: 5.0, // OSRM's own default
            min_confidence: 0.0,
        }
    }
}

/// Dispatch rate limiter - spaces out when requests START.
///
/// Every caller reserves the next slot `interval` after the previous one, so
/// concurrent batches never start closer together than the interval. A 429
/// pushes the next slot out for everyone.
struct DispatchRateLimiter {
    interval: Duration,
    next_dispatch: Mutex<Instant>,
    dispatched_count: AtomicU32,
    consecutive_429s: AtomicU32,
}

impl DispatchRateLimiter {
    fn new(interval: Duration) -> Self {
        Self {
            interval,
            next_dispatch: Mutex::new(Instant::now()),
            dispatched_count: AtomicU32::new(0),
            consecutive_429s: AtomicU32::new(0),
        }
    }

    /// Wait for our dispatch slot. Returns the dispatch number.
    async fn wait_for_dispatch_slot(&self) -> u32 {
        let (wait_duration, dispatch_num) = {
            let mut next = self.next_dispatch.lock().await;
            let now = Instant::now();

            let dispatch_at = if *next > now { *next } else { now };
            *next = dispatch_at + self.interval;

            let num = self.dispatched_count.fetch_add(1, Ordering::Relaxed) + 1;
            (dispatch_at.saturating_duration_since(now), num)
        };

        // Wait outside the lock
        if wait_duration > Duration::from_millis(5) {
            debug!("[Dispatch #{}] Waiting {:?} for slot", dispatch_num, wait_duration);
            tokio::time::sleep(wait_duration).await;
        }

        dispatch_num
    }

    fn record_success(&self) {
        self.consecutive_429s.store(0, Ordering::Relaxed);
    }

    /// Delays every future dispatch by an exponentially growing backoff.
    async fn record_429(&self, base: Duration) -> Duration {
        let count = self.consecutive_429s.fetch_add(1, Ordering::Relaxed) + 1;
        let backoff = base * (1 << count.min(4));
        let mut next = self.next_dispatch.lock().await;
        let resume_at = Instant::now() + backoff;
        if *next < resume_at {
            *next = resume_at;
        }
        warn!("[DispatchRateLimiter] Got 429! Consecutive: {}, backing off {:?}", count, backoff);
        backoff
    }
}

/// [`MatchService`] backed by an OSRM HTTP server.
pub struct OsrmClient {
    client: Client,
    config: OsrmConfig,
    rate_limiter: Arc<DispatchRateLimiter>,
}

impl OsrmClient {
    pub fn new(config: OsrmConfig) -> Result<Self, MatchError> {
        let client = Client::builder()
            .pool_max_idle_per_host(MAX_CONCURRENCY)
            .pool_idle_timeout(Duration::from_secs(60))
            .tcp_keepalive(Duration::from_secs(30))
            .timeout(config.timeout)
            .build()
            .map_err(|e| MatchError::Transport(format!("failed to create HTTP client: {e}")))?;

        info!(
            "[OsrmClient] Using {} (timeout {:?}, {} retries, dispatch interval {:?})",
            config.base_url, config.timeout, config.max_retries, config.dispatch_interval
        );

        Ok(Self {
            client,
            rate_limiter: Arc::new(DispatchRateLimiter::new(config.dispatch_interval)),
            config,
        })
    }

    pub fn config(&self) -> &OsrmConfig {
        &self.config
    }

    async fn fetch_once(&self, url: &Url) -> Result<MatchedRoute, MatchError> {
        let req_start = Instant::now();

        // Phase 1: Send request, receive headers
        let resp = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(transport_error)?;
        let status = resp.status();
        let headers_elapsed = req_start.elapsed();

        // Phase 2: Download response body
        let bytes = resp.bytes().await.map_err(transport_error)?;

        if !status.is_success() {
            let message: String = String::from_utf8_lossy(&bytes)
                .chars()
                .take(MAX_ERROR_BODY)
                .collect();
            return Err(MatchError::Status {
                status: status.as_u16(),
                message,
            });
        }

        // Phase 3: JSON + polyline decoding
        let route = decode_match_response(&bytes, self.config.min_confidence)?;

        debug!(
            "[OsrmClient] headers={:?} total={:?} body={:.1}KB legs={}",
            headers_elapsed,
            req_start.elapsed(),
            bytes.len() as f64 / 1024.0,
            route.legs.len()
        );

        Ok(route)
    }
}

#[async_trait]
impl MatchService for OsrmClient {
    async fn match_batch(&self, profile: &str, samples: &[Sample]) -> Result<MatchedRoute, MatchError> {
        match samples.len() {
            0 => return Err(MatchError::EmptyBatch),
            1 => return Err(MatchError::TooFewSamples { count: 1 }),
            _ => {}
        }

        let url = build_match_url(
            &self.config.base_url,
            profile,
            samples,
            self.config.default_radius,
        )?;
        debug!("[OsrmClient] GET {} ({} samples)", url, samples.len());

        let mut retries = 0;
        loop {
            let dispatch_num = self.rate_limiter.wait_for_dispatch_slot().await;

            let err = match self.fetch_once(&url).await {
                Ok(route) => {
                    self.rate_limiter.record_success();
                    return Ok(route);
                }
                Err(e) => e,
            };

            if !err.is_transient() || retries >= self.config.max_retries {
                return Err(err);
            }
            retries += 1;

            if matches!(err, MatchError::Status { status: 429, .. }) {
                // The limiter holds back the next slot; waiting for it is the backoff.
                let wait = self.rate_limiter.record_429(self.config.retry_base_delay).await;
                warn!(
                    "[OsrmClient #{}] {}, retry {} at next dispatch slot (+{:?})",
                    dispatch_num, err, retries, wait
                );
            } else {
                let wait = backoff_delay(self.config.retry_base_delay, retries);
                warn!(
                    "[OsrmClient #{}] {}, retry {} after {:?}",
                    dispatch_num, err, retries, wait
                );
                tokio::time::sleep(wait).await;
            }
        }
    }
}

/// Exponential backoff for retry number `retry` (1-based).
fn backoff_delay(base: Duration, retry: u32) -> Duration {
    base * (1 << retry.min(6))
}

fn transport_error(e: reqwest::Error) -> MatchError {
    if e.is_timeout() {
        MatchError::Timeout
    } else {
        MatchError::Transport(e.to_string())
    }
}
