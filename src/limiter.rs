//! Distributed rate limiter: three counters per API account (requests and
//! tokens per rolling minute, requests per day), shared by every worker of
//! that account through a strongly-consistent key-value store with
//! compare-and-swap updates.
//!
//! Admission is first-come-first-served under contention: conflicting
//! conditional writes simply retry. There is no reservation queue; callers
//! bound their own retries and propagate `RetryAfter` upward instead of
//! busy-waiting. When the backing store is unreachable the limiter fails
//! closed and returns `Denied`, never open: falling open would burn the
//! account's quota unchecked.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use tracing::{debug, warn};

use crate::config::RateLimitsConfig;
use crate::store::{BucketState, BucketWrite, RateLimitStore};

/// Bounded spin on version conflicts before giving up on this acquire.
const MAX_CAS_ATTEMPTS: u32 = 8;

const MINUTE_WINDOW: i64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowKind {
    RequestsPerMinute,
    TokensPerMinute,
    RequestsPerDay,
}

impl WindowKind {
    pub const ALL: [WindowKind; 3] = [
        WindowKind::RequestsPerMinute,
        WindowKind::TokensPerMinute,
        WindowKind::RequestsPerDay,
    ];

    fn name(&self) -> &'static str {
        match self {
            WindowKind::RequestsPerMinute => "requests_per_minute",
            WindowKind::TokensPerMinute => "tokens_per_minute",
            WindowKind::RequestsPerDay => "requests_per_day",
        }
    }
}

pub fn bucket_key(account: &str, kind: WindowKind) -> String {
    format!("{}#{}", account, kind.name())
}

/// Result of an admission attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Granted,
    /// Capacity exhausted in at least one window; come back after the
    /// soonest blocking window resets.
    RetryAfter(Duration),
    /// The wait would overrun the caller's deadline, or the backing store
    /// is unreachable.
    Denied,
}

pub struct RateLimiter {
    store: Arc<dyn RateLimitStore>,
    limits: RateLimitsConfig,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn RateLimitStore>, limits: RateLimitsConfig) -> Self {
        Self { store, limits }
    }

    /// Reserve capacity in all three windows atomically before an LLM call.
    pub async fn acquire(
        &self,
        account: &str,
        estimated_input_tokens: u64,
        estimated_output_tokens: u64,
        deadline: DateTime<Utc>,
    ) -> Admission {
        self.acquire_at(
            account,
            estimated_input_tokens,
            estimated_output_tokens,
            deadline,
            Utc::now(),
        )
        .await
    }

    /// Clock-explicit variant of [`acquire`](Self::acquire).
    pub async fn acquire_at(
        &self,
        account: &str,
        estimated_input_tokens: u64,
        estimated_output_tokens: u64,
        deadline: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Admission {
        let token_charge = estimated_input_tokens + estimated_output_tokens;
        let keys: Vec<String> = WindowKind::ALL
            .iter()
            .map(|k| bucket_key(account, *k))
            .collect();

        for attempt in 0..MAX_CAS_ATTEMPTS {
            let current = match self.store.read_buckets(&keys).await {
                Ok(current) => current,
                Err(e) => {
                    warn!("rate-limit store read failed, denying: {}", e);
                    return Admission::Denied;
                }
            };

            let mut writes = Vec::with_capacity(WindowKind::ALL.len());
            let mut blocked: Option<Duration> = None;

            for ((kind, key), existing) in WindowKind::ALL.iter().zip(&keys).zip(current) {
                let limit = self.limit_for(*kind);
                let charge = match kind {
                    WindowKind::TokensPerMinute => token_charge,
                    _ => 1,
                };

                // A lapsed window counts as empty with its reset advanced.
                let (count, reset, expected_version) = match existing {
                    Some(b) if now < b.window_reset_at => {
                        (b.count, b.window_reset_at, Some(b.version))
                    }
                    Some(b) => (0, self.next_reset(*kind, now), Some(b.version)),
                    None => (0, self.next_reset(*kind, now), None),
                };

                if count + charge > limit {
                    let wait = (reset - now).to_std().unwrap_or_default();
                    blocked = Some(blocked.map_or(wait, |w| w.min(wait)));
                } else {
                    writes.push(BucketWrite {
                        key: key.clone(),
                        expected_version,
                        next: BucketState {
                            count: count + charge,
                            window_reset_at: reset,
                            version: expected_version.map_or(1, |v| v + 1),
                        },
                    });
                }
            }

            if let Some(retry_after) = blocked {
                let resume = now
                    + ChronoDuration::from_std(retry_after).unwrap_or_else(|_| {
                        ChronoDuration::seconds(MINUTE_WINDOW)
                    });
                if resume > deadline {
                    return Admission::Denied;
                }
                return Admission::RetryAfter(retry_after);
            }

            match self.store.write_buckets(writes).await {
                Ok(true) => return Admission::Granted,
                Ok(false) => {
                    debug!(
                        "rate-limit CAS conflict for {} (attempt {})",
                        account,
                        attempt + 1
                    );
                    continue;
                }
                Err(e) => {
                    warn!("rate-limit store write failed, denying: {}", e);
                    return Admission::Denied;
                }
            }
        }

        // Contention exhausted the retry budget; the caller treats this as
        // transient and backs off.
        Admission::Denied
    }

    /// Best-effort reconciliation when the granted estimate overshot the
    /// provider's actual usage: refund the difference to the current
    /// tokens-per-minute window. A lost CAS race is simply dropped, the
    /// estimate stays charged.
    pub async fn release(&self, account: &str, estimated_tokens: u64, actual_tokens: u64) {
        self.release_at(account, estimated_tokens, actual_tokens, Utc::now())
            .await;
    }

    pub async fn release_at(
        &self,
        account: &str,
        estimated_tokens: u64,
        actual_tokens: u64,
        now: DateTime<Utc>,
    ) {
        if actual_tokens >= estimated_tokens {
            return;
        }
        let refund = estimated_tokens - actual_tokens;
        let key = bucket_key(account, WindowKind::TokensPerMinute);

        let Ok(buckets) = self.store.read_buckets(std::slice::from_ref(&key)).await else {
            return;
        };
        let Some(Some(bucket)) = buckets.into_iter().next() else {
            return;
        };
        if now >= bucket.window_reset_at {
            return;
        }

        let next = BucketState {
            count: bucket.count.saturating_sub(refund),
            window_reset_at: bucket.window_reset_at,
            version: bucket.version + 1,
        };
        let _ = self
            .store
            .write_buckets(vec![BucketWrite {
                key,
                expected_version: Some(bucket.version),
                next,
            }])
            .await;
    }

    fn limit_for(&self, kind: WindowKind) -> u64 {
        match kind {
            WindowKind::RequestsPerMinute => self.limits.requests_per_minute,
            WindowKind::TokensPerMinute => self.limits.tokens_per_minute,
            WindowKind::RequestsPerDay => self.limits.requests_per_day,
        }
    }

    fn next_reset(&self, kind: WindowKind, now: DateTime<Utc>) -> DateTime<Utc> {
        match kind {
            WindowKind::RequestsPerMinute | WindowKind::TokensPerMinute => {
                now + ChronoDuration::seconds(MINUTE_WINDOW)
            }
            WindowKind::RequestsPerDay => {
                next_day_boundary(now, self.limits.day_boundary_utc_offset_minutes)
            }
        }
    }
}

/// The next local midnight under the configured fixed UTC offset, returned
/// as a UTC instant. Storing resets in UTC sidesteps DST ambiguity.
fn next_day_boundary(now: DateTime<Utc>, offset_minutes: i32) -> DateTime<Utc> {
    let offset = ChronoDuration::minutes(offset_minutes as i64);
    let shifted = now + offset;
    let day_start = shifted
        .date_naive()
        .and_hms_opt(0, 0, 0)
        .unwrap_or_else(|| shifted.naive_utc());
    let next_local = day_start + ChronoDuration::days(1);
    Utc.from_utc_datetime(&next_local) - offset
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryRateLimitStore;

    fn limiter(limits: RateLimitsConfig) -> (RateLimiter, Arc<MemoryRateLimitStore>) {
        let store = Arc::new(MemoryRateLimitStore::new());
        (RateLimiter::new(store.clone(), limits), store)
    }

    fn limits(rpm: u64, tpm: u64, rpd: u64) -> RateLimitsConfig {
        RateLimitsConfig {
            requests_per_minute: rpm,
            tokens_per_minute: tpm,
            requests_per_day: rpd,
            day_boundary_utc_offset_minutes: 0,
        }
    }

    fn at(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn test_grant_within_limits() {
        let (limiter, store) = limiter(limits(5, 1000, 100));
        let now = at("2026-03-01T10:00:00Z");
        let deadline = now + ChronoDuration::seconds(300);

        assert_eq!(
            limiter.acquire_at("acct", 100, 100, deadline, now).await,
            Admission::Granted
        );

        let buckets = store
            .read_buckets(&[
                bucket_key("acct", WindowKind::RequestsPerMinute),
                bucket_key("acct", WindowKind::TokensPerMinute),
                bucket_key("acct", WindowKind::RequestsPerDay),
            ])
            .await
            .unwrap();
        assert_eq!(buckets[0].as_ref().unwrap().count, 1);
        assert_eq!(buckets[1].as_ref().unwrap().count, 200);
        assert_eq!(buckets[2].as_ref().unwrap().count, 1);
    }

    #[tokio::test]
    async fn test_rpm_exhaustion_returns_retry_after() {
        let (limiter, _) = limiter(limits(2, 1_000_000, 100));
        let now = at("2026-03-01T10:00:00Z");
        let deadline = now + ChronoDuration::seconds(300);

        for _ in 0..2 {
            assert_eq!(
                limiter.acquire_at("acct", 10, 10, deadline, now).await,
                Admission::Granted
            );
        }

        let later = now + ChronoDuration::seconds(15);
        match limiter.acquire_at("acct", 10, 10, deadline, later).await {
            Admission::RetryAfter(wait) => {
                assert_eq!(wait, Duration::from_secs(45));
            }
            other => panic!("expected RetryAfter, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_minute_boundary_resets_window() {
        let (limiter, _) = limiter(limits(1, 1_000_000, 100));
        let now = at("2026-03-01T10:00:00Z");
        let deadline = now + ChronoDuration::seconds(600);

        assert_eq!(
            limiter.acquire_at("acct", 10, 10, deadline, now).await,
            Admission::Granted
        );
        assert!(matches!(
            limiter.acquire_at("acct", 10, 10, deadline, now).await,
            Admission::RetryAfter(_)
        ));

        // The next acquire after the reset observes a fresh window.
        let after_reset = now + ChronoDuration::seconds(61);
        assert_eq!(
            limiter
                .acquire_at("acct", 10, 10, deadline, after_reset)
                .await,
            Admission::Granted
        );
    }

    #[tokio::test]
    async fn test_token_window_blocks_independently() {
        let (limiter, _) = limiter(limits(100, 500, 100));
        let now = at("2026-03-01T10:00:00Z");
        let deadline = now + ChronoDuration::seconds(300);

        assert_eq!(
            limiter.acquire_at("acct", 200, 200, deadline, now).await,
            Admission::Granted
        );
        // 400 charged; another 200 would exceed 500 even though requests
        // remain plentiful.
        assert!(matches!(
            limiter.acquire_at("acct", 100, 100, deadline, now).await,
            Admission::RetryAfter(_)
        ));
    }

    #[tokio::test]
    async fn test_deadline_overrun_is_denied() {
        let (limiter, _) = limiter(limits(1, 1_000_000, 100));
        let now = at("2026-03-01T10:00:00Z");
        let deadline = now + ChronoDuration::seconds(300);

        assert_eq!(
            limiter.acquire_at("acct", 10, 10, deadline, now).await,
            Admission::Granted
        );

        // The window resets in 60s but the caller can only wait 5s.
        let tight = now + ChronoDuration::seconds(5);
        assert_eq!(
            limiter.acquire_at("acct", 10, 10, tight, now).await,
            Admission::Denied
        );
    }

    #[tokio::test]
    async fn test_daily_budget_and_boundary() {
        let (limiter, _) = limiter(limits(100, 1_000_000, 3));
        let now = at("2026-03-01T23:50:00Z");
        let deadline = now + ChronoDuration::days(2);

        for _ in 0..3 {
            assert_eq!(
                limiter.acquire_at("acct", 1, 1, deadline, now).await,
                Admission::Granted
            );
        }
        match limiter.acquire_at("acct", 1, 1, deadline, now).await {
            Admission::RetryAfter(wait) => {
                // Ten minutes to midnight UTC.
                assert_eq!(wait, Duration::from_secs(600));
            }
            other => panic!("expected RetryAfter, got {:?}", other),
        }

        // Crossing the day boundary: the previous day's grants do not leak
        // into the new budget.
        let next_day = at("2026-03-02T00:00:01Z");
        for _ in 0..3 {
            assert_eq!(
                limiter.acquire_at("acct", 1, 1, deadline, next_day).await,
                Admission::Granted
            );
        }
        assert!(matches!(
            limiter.acquire_at("acct", 1, 1, deadline, next_day).await,
            Admission::RetryAfter(_)
        ));
    }

    #[tokio::test]
    async fn test_day_boundary_honors_utc_offset() {
        assert_eq!(
            next_day_boundary(at("2026-03-01T10:00:00Z"), 0),
            at("2026-03-02T00:00:00Z")
        );
        // UTC+2: local midnight is 22:00 UTC.
        assert_eq!(
            next_day_boundary(at("2026-03-01T10:00:00Z"), 120),
            at("2026-03-01T22:00:00Z")
        );
        // UTC-5: local midnight is 05:00 UTC the next day.
        assert_eq!(
            next_day_boundary(at("2026-03-01T10:00:00Z"), -300),
            at("2026-03-02T05:00:00Z")
        );
    }

    #[tokio::test]
    async fn test_saturation_caps_grants_per_window() {
        // Two jobs' workers interleaving against R/min = 5: at most five
        // grants per simulated minute, and the daily counter accumulates.
        let (limiter, store) = limiter(limits(5, 250_000, 25));
        let deadline = at("2026-03-01T12:00:00Z");

        let mut total_granted = 0;
        for window in 0..4 {
            let now = at("2026-03-01T10:00:00Z") + ChronoDuration::seconds(61 * window);
            let mut granted_this_window = 0;
            for i in 0..10 {
                let account = "shared";
                let job_tokens = 100 + i; // jobs differ, account is shared
                match limiter
                    .acquire_at(account, job_tokens, job_tokens, deadline, now)
                    .await
                {
                    Admission::Granted => granted_this_window += 1,
                    Admission::RetryAfter(_) => {}
                    Admission::Denied => panic!("unexpected denial"),
                }
            }
            assert_eq!(granted_this_window, 5);
            total_granted += granted_this_window;
        }
        assert_eq!(total_granted, 20);

        let daily = store
            .read_buckets(&[bucket_key("shared", WindowKind::RequestsPerDay)])
            .await
            .unwrap();
        assert_eq!(daily[0].as_ref().unwrap().count, 20);
    }

    #[tokio::test]
    async fn test_fails_closed_when_store_unreachable() {
        let (limiter, store) = limiter(limits(5, 1000, 100));
        store.set_unavailable(true);
        let now = at("2026-03-01T10:00:00Z");
        assert_eq!(
            limiter
                .acquire_at("acct", 1, 1, now + ChronoDuration::seconds(60), now)
                .await,
            Admission::Denied
        );
    }

    #[tokio::test]
    async fn test_release_refunds_token_overestimate() {
        let (limiter, store) = limiter(limits(100, 10_000, 100));
        let now = at("2026-03-01T10:00:00Z");
        let deadline = now + ChronoDuration::seconds(300);

        limiter.acquire_at("acct", 500, 500, deadline, now).await;
        limiter.release_at("acct", 1000, 400, now).await;

        let buckets = store
            .read_buckets(&[bucket_key("acct", WindowKind::TokensPerMinute)])
            .await
            .unwrap();
        assert_eq!(buckets[0].as_ref().unwrap().count, 400);
    }

    #[tokio::test]
    async fn test_release_ignores_undershoot_and_lapsed_window() {
        let (limiter, store) = limiter(limits(100, 10_000, 100));
        let now = at("2026-03-01T10:00:00Z");
        let deadline = now + ChronoDuration::seconds(300);

        limiter.acquire_at("acct", 100, 100, deadline, now).await;
        // Actual exceeded the estimate: nothing to refund.
        limiter.release_at("acct", 200, 300, now).await;
        // Window already lapsed: refund dropped.
        limiter
            .release_at("acct", 200, 100, now + ChronoDuration::seconds(120))
            .await;

        let buckets = store
            .read_buckets(&[bucket_key("acct", WindowKind::TokensPerMinute)])
            .await
            .unwrap();
        assert_eq!(buckets[0].as_ref().unwrap().count, 200);
    }
}
