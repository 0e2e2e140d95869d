use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ApplicationId;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FlagSetId(pub String);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Advisory,
    Warning,
    Blocking,
}

impl Severity {
    /// Blocking items gate application submission until acknowledged.
    pub fn is_blocking(&self) -> bool {
        matches!(self, Self::Blocking)
    }
}

/// A single issue raised by the suitability model, before any acknowledgment
/// workflow state is attached.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RaisedFlag {
    pub item_id: String,
    pub field: String,
    pub severity: Severity,
    pub issue: String,
    pub suggestion: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Acknowledgment {
    pub override_reason: String,
    pub acknowledged_at: DateTime<Utc>,
    pub acknowledged_by: String,
}

/// Per-item state machine: Raised -> Acknowledged, terminal. There is no
/// un-acknowledge; a fresh suitability run produces a fresh flag set instead.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FlagItem {
    pub item_id: String,
    pub field: String,
    pub severity: Severity,
    pub issue: String,
    pub suggestion: String,
    pub acknowledgment: Option<Acknowledgment>,
}

impl FlagItem {
    pub fn from_raised(raised: RaisedFlag) -> Self {
        Self {
            item_id: raised.item_id,
            field: raised.field,
            severity: raised.severity,
            issue: raised.issue,
            suggestion: raised.suggestion,
            acknowledgment: None,
        }
    }

    pub fn is_acknowledged(&self) -> bool {
        self.acknowledgment.is_some()
    }
}

/// One suitability run over an application. At most one non-superseded set
/// exists per application; a re-run supersedes the prior set but retains it
/// for audit.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SuitabilityFlagSet {
    pub id: FlagSetId,
    pub application_id: ApplicationId,
    pub items: Vec<FlagItem>,
    pub model_version: String,
    pub created_at: DateTime<Utc>,
    pub superseded: bool,
}

impl SuitabilityFlagSet {
    /// True iff every blocking-severity item carries an acknowledgment.
    /// Advisory and warning items never gate submission.
    pub fn all_acknowledged(&self) -> bool {
        self.items
            .iter()
            .filter(|item| item.severity.is_blocking())
            .all(FlagItem::is_acknowledged)
    }

    pub fn item(&self, item_id: &str) -> Option<&FlagItem> {
        self.items.iter().find(|item| item.item_id == item_id)
    }
}
