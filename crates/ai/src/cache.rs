//! Fingerprinted result cache with request coalescing.
//!
//! One live entry per fingerprint, expired lazily at read time by timestamp
//! comparison; there is no background sweeper. While a computation for a
//! fingerprint is outstanding, later callers become waiters on the leader's
//! broadcast channel instead of invoking the model themselves. Coalescing is
//! per-process and best-effort: duplicate upstream calls across processes
//! cost money, not correctness, since the budget ledger stays authoritative.

use std::collections::HashMap;
use std::future::Future;
use std::time::{Duration, Instant};

use tokio::sync::{broadcast, Mutex};

use advisor_core::domain::feature::FeatureResult;
use advisor_core::errors::AiError;
use advisor_core::prompt::Fingerprint;

struct CacheEntry {
    payload: FeatureResult,
    created_at: Instant,
    ttl: Duration,
}

impl CacheEntry {
    fn is_fresh(&self) -> bool {
        self.created_at.elapsed() < self.ttl
    }
}

type Shared = Result<FeatureResult, AiError>;

#[derive(Default)]
struct CacheState {
    entries: HashMap<String, CacheEntry>,
    in_flight: HashMap<String, broadcast::Sender<Shared>>,
}

enum Role {
    Hit(FeatureResult),
    Waiter(broadcast::Receiver<Shared>),
    Leader(broadcast::Sender<Shared>),
}

#[derive(Default)]
pub struct ResponseCache {
    state: Mutex<CacheState>,
}

impl ResponseCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fresh hit: cached payload, zero budget, zero upstream calls. Miss with
    /// an in-flight leader: wait for and share the leader's result (errors
    /// included; each waiter may then retry under its own reservation). Miss
    /// without a leader: become leader, run `compute`, store on success and
    /// fan the result out. The in-flight record is removed on resolution
    /// either way.
    pub async fn get_or_compute<F, Fut>(
        &self,
        fingerprint: &Fingerprint,
        ttl: Duration,
        compute: F,
    ) -> Result<FeatureResult, AiError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<FeatureResult, AiError>>,
    {
        let role = {
            let mut state = self.state.lock().await;
            match state.entries.get(&fingerprint.0) {
                Some(entry) if entry.is_fresh() => Role::Hit(entry.payload.clone()),
                _ => {
                    state.entries.remove(&fingerprint.0);
                    if let Some(tx) = state.in_flight.get(&fingerprint.0) {
                        Role::Waiter(tx.subscribe())
                    } else {
                        let (tx, _) = broadcast::channel(1);
                        state.in_flight.insert(fingerprint.0.clone(), tx.clone());
                        Role::Leader(tx)
                    }
                }
            }
        };

        match role {
            Role::Hit(payload) => Ok(payload),
            Role::Waiter(mut rx) => match rx.recv().await {
                Ok(shared) => shared,
                // Leader dropped without resolving; treat as a transient
                // failure the caller may retry.
                Err(_) => Err(AiError::UpstreamUnavailable(
                    "coalesced computation was abandoned".to_owned(),
                )),
            },
            Role::Leader(tx) => {
                let result = compute().await;
                {
                    let mut state = self.state.lock().await;
                    state.in_flight.remove(&fingerprint.0);
                    if let Ok(payload) = &result {
                        state.entries.insert(
                            fingerprint.0.clone(),
                            CacheEntry {
                                payload: payload.clone(),
                                created_at: Instant::now(),
                                ttl,
                            },
                        );
                    }
                }
                // No receivers is fine; the leader keeps its own copy.
                let _ = tx.send(result.clone());
                result
            }
        }
    }

    #[cfg(test)]
    pub(crate) async fn live_entries(&self) -> usize {
        self.state.lock().await.entries.len()
    }
}
