use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use once_cell::sync::Lazy;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;

use super::diff::SyncError;

/// Outbound API requests per second across every drive sharing an account.
const REQUEST_LIMIT: u32 = 8;

/// How many drive syncs may run at once per account, across all triggers.
const SYNC_LIMIT: usize = 5;

/// Per-account limiter pair: a token bucket pacing individual API requests
/// and a semaphore bounding whole-sync concurrency.
pub struct AccountLimiter {
    bucket: TokenBucket,
    sync_slots: Arc<Semaphore>,
}

impl AccountLimiter {
    fn new() -> Self {
        Self {
            bucket: TokenBucket::new(REQUEST_LIMIT, REQUEST_LIMIT),
            sync_slots: Arc::new(Semaphore::new(SYNC_LIMIT)),
        }
    }

    /// Blocks until the next API request is allowed to go out.
    pub async fn wait(&self) {
        self.bucket.wait().await;
    }

    /// Takes one sync slot; the permit releases the slot on drop.
    /// Honours cancellation: dropping the future gives nothing away.
    pub async fn acquire_sync_slot(&self) -> Result<OwnedSemaphorePermit, SyncError> {
        self.sync_slots
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| SyncError::Fatal(format!("acquiring sync semaphore: {e}")))
    }

    #[cfg(test)]
    pub fn available_slots(&self) -> usize {
        self.sync_slots.available_permits()
    }
}

/// Registry of limiters keyed by account. Entries materialise on first use
/// and live for the whole process: syncs registered at any point share the
/// same pacing.
static LIMITERS: Lazy<StdMutex<HashMap<String, Arc<AccountLimiter>>>> =
    Lazy::new(|| StdMutex::new(HashMap::new()));

pub fn for_account(account: &str) -> Arc<AccountLimiter> {
    let mut limiters = LIMITERS.lock().unwrap();
    limiters
        .entry(account.to_string())
        .or_insert_with(|| Arc::new(AccountLimiter::new()))
        .clone()
}

/// A token bucket over the tokio clock: `rate` tokens refill per second up
/// to `burst`; each `wait` consumes one token, sleeping for the deficit
/// when the bucket is empty.
pub struct TokenBucket {
    per_token: Duration,
    burst: f64,
    state: Mutex<BucketState>,
}

struct BucketState {
    tokens: f64,
    refilled_at: Instant,
}

impl TokenBucket {
    pub fn new(rate: u32, burst: u32) -> Self {
        Self {
            per_token: Duration::from_secs(1) / rate,
            burst: burst as f64,
            state: Mutex::new(BucketState {
                tokens: burst as f64,
                refilled_at: Instant::now(),
            }),
        }
    }

    pub async fn wait(&self) {
        loop {
            let deficit = {
                let mut state = self.state.lock().await;

                let now = Instant::now();
                let refill =
                    now.duration_since(state.refilled_at).as_secs_f64() / self.per_token.as_secs_f64();
                state.tokens = (state.tokens + refill).min(self.burst);
                state.refilled_at = now;

                if state.tokens >= 1.0 {
                    state.tokens -= 1.0;
                    return;
                }

                self.per_token.mul_f64(1.0 - state.tokens)
            };

            tokio::time::sleep(deficit).await;
        }
    }
}
