//! Per-user, per-day token budget ledger.
//!
//! Reserve/commit is linearizable per (user, date): one mutex guards the
//! whole counter map, and every operation inside it is a short in-memory
//! update. Counters are created lazily and never deleted, so a day's
//! consumption survives for as long as the process does.

use std::collections::HashMap;

use chrono::{NaiveDate, Utc};
use tokio::sync::Mutex;

use advisor_core::domain::budget::BudgetCounter;
use advisor_core::domain::UserId;

/// Rough request sizing for reservations: ~4 characters per prompt token,
/// plus the output ceiling the call will be made with.
pub fn estimate_request_tokens(prompt: &str, max_output_tokens: u32) -> u64 {
    (prompt.len() as u64 / 4) + 16 + u64::from(max_output_tokens)
}

/// Proof that budget was reserved; must be committed exactly once.
/// Carries the reservation date so a call that straddles midnight commits
/// against the day it reserved on.
#[derive(Debug)]
#[must_use = "a reservation must be committed, or the estimate stays charged"]
pub struct BudgetReservation {
    user_id: UserId,
    date: NaiveDate,
    estimated_tokens: u64,
}

impl BudgetReservation {
    pub fn estimated_tokens(&self) -> u64 {
        self.estimated_tokens
    }
}

#[derive(Debug)]
pub enum ReserveOutcome {
    Allowed(BudgetReservation),
    Denied { remaining: u64 },
}

pub struct BudgetLedger {
    daily_limit: u64,
    counters: Mutex<HashMap<(UserId, NaiveDate), u64>>,
}

impl BudgetLedger {
    pub fn new(daily_limit: u64) -> Self {
        Self { daily_limit, counters: Mutex::new(HashMap::new()) }
    }

    /// Denies when `consumed + estimated > limit`; on denial no downstream
    /// call may be made. On allow, the estimate is charged immediately and
    /// later replaced by `commit`.
    pub async fn reserve(&self, user: &UserId, estimated_tokens: u64) -> ReserveOutcome {
        let date = today();
        let mut counters = self.counters.lock().await;
        let consumed = counters.entry((user.clone(), date)).or_insert(0);
        if consumed.saturating_add(estimated_tokens) > self.daily_limit {
            return ReserveOutcome::Denied { remaining: self.daily_limit.saturating_sub(*consumed) };
        }
        *consumed += estimated_tokens;
        ReserveOutcome::Allowed(BudgetReservation {
            user_id: user.clone(),
            date,
            estimated_tokens,
        })
    }

    /// Replaces the reservation's estimate with actual usage. Under-use is
    /// released; over-use is charged in full, which is the single-call
    /// overshoot the ledger tolerates.
    pub async fn commit(&self, reservation: BudgetReservation, actual_tokens: u64) {
        let mut counters = self.counters.lock().await;
        let consumed = counters
            .entry((reservation.user_id.clone(), reservation.date))
            .or_insert(reservation.estimated_tokens);
        *consumed =
            consumed.saturating_sub(reservation.estimated_tokens).saturating_add(actual_tokens);
    }

    /// Unrecoverable-failure path: the full estimate stays charged so that
    /// repeated failing requests cannot bypass the budget. Documented policy
    /// trade-off, applied to sync failures, stalled streams and caller
    /// cancellation alike.
    pub async fn commit_failure(&self, reservation: BudgetReservation) {
        let estimated = reservation.estimated_tokens;
        self.commit(reservation, estimated).await;
    }

    pub async fn remaining_today(&self, user: &UserId) -> u64 {
        self.counter_today(user).await.remaining()
    }

    /// Surfaced read-only state for display.
    pub async fn counter_today(&self, user: &UserId) -> BudgetCounter {
        let date = today();
        let counters = self.counters.lock().await;
        let consumed = counters.get(&(user.clone(), date)).copied().unwrap_or(0);
        BudgetCounter {
            user_id: user.clone(),
            date,
            tokens_consumed: consumed,
            limit: self.daily_limit,
        }
    }
}

fn today() -> NaiveDate {
    Utc::now().date_naive()
}
