use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use super::UserId;

/// Token usage reported by the provider for one model call.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl TokenUsage {
    pub fn total(&self) -> u64 {
        self.input_tokens.saturating_add(self.output_tokens)
    }
}

/// One user's consumption for one calendar day. Created lazily on first
/// reservation, never deleted. `tokens_consumed <= limit` holds at
/// reservation time; a single in-flight call's estimate may transiently
/// overshoot when its actual usage comes in higher.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetCounter {
    pub user_id: UserId,
    pub date: NaiveDate,
    pub tokens_consumed: u64,
    pub limit: u64,
}

impl BudgetCounter {
    pub fn remaining(&self) -> u64 {
        self.limit.saturating_sub(self.tokens_consumed)
    }
}
