use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::Row;
use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;

use advisor_core::domain::suitability::{
    Acknowledgment, FlagItem, FlagSetId, RaisedFlag, SuitabilityFlagSet,
};
use advisor_core::domain::ApplicationId;

use crate::DbPool;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("decode error: {0}")]
    Decode(String),
}

/// Result of an acknowledgment attempt. `AlreadyAcknowledged` carries the
/// existing item so re-acknowledging is idempotent rather than an error.
#[derive(Clone, Debug, PartialEq)]
pub enum AcknowledgeOutcome {
    Acknowledged(FlagItem),
    AlreadyAcknowledged(FlagItem),
    SetNotFound,
    ItemNotFound,
}

#[async_trait]
pub trait FlagSetRepository: Send + Sync {
    /// Persists a new flag set and marks any prior non-superseded set for the
    /// same application as superseded. Superseded sets are retained for audit.
    async fn create_flag_set(
        &self,
        application_id: &ApplicationId,
        flags: Vec<RaisedFlag>,
        model_version: &str,
    ) -> Result<SuitabilityFlagSet, RepositoryError>;

    async fn find_by_id(
        &self,
        id: &FlagSetId,
    ) -> Result<Option<SuitabilityFlagSet>, RepositoryError>;

    async fn current_for_application(
        &self,
        application_id: &ApplicationId,
    ) -> Result<Option<SuitabilityFlagSet>, RepositoryError>;

    /// Raised -> Acknowledged, terminal. No reversal operation exists.
    async fn acknowledge(
        &self,
        flag_set_id: &FlagSetId,
        item_id: &str,
        override_reason: &str,
        acknowledged_by: &str,
    ) -> Result<AcknowledgeOutcome, RepositoryError>;
}

fn new_flag_set(
    application_id: &ApplicationId,
    flags: Vec<RaisedFlag>,
    model_version: &str,
) -> SuitabilityFlagSet {
    SuitabilityFlagSet {
        id: FlagSetId(Uuid::new_v4().to_string()),
        application_id: application_id.clone(),
        items: flags.into_iter().map(FlagItem::from_raised).collect(),
        model_version: model_version.to_owned(),
        created_at: Utc::now(),
        superseded: false,
    }
}

fn acknowledge_item(
    set: &mut SuitabilityFlagSet,
    item_id: &str,
    override_reason: &str,
    acknowledged_by: &str,
) -> AcknowledgeOutcome {
    let Some(item) = set.items.iter_mut().find(|item| item.item_id == item_id) else {
        return AcknowledgeOutcome::ItemNotFound;
    };
    if item.acknowledgment.is_some() {
        return AcknowledgeOutcome::AlreadyAcknowledged(item.clone());
    }
    item.acknowledgment = Some(Acknowledgment {
        override_reason: override_reason.to_owned(),
        acknowledged_at: Utc::now(),
        acknowledged_by: acknowledged_by.to_owned(),
    });
    AcknowledgeOutcome::Acknowledged(item.clone())
}

pub struct SqlFlagSetRepository {
    pool: DbPool,
}

impl SqlFlagSetRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

fn row_to_flag_set(row: &sqlx::sqlite::SqliteRow) -> Result<SuitabilityFlagSet, RepositoryError> {
    let id: String = row.try_get("id").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let application_id: String =
        row.try_get("application_id").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let items_json: String =
        row.try_get("items").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let model_version: String =
        row.try_get("model_version").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let superseded: i64 =
        row.try_get("superseded").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let created_at_str: String =
        row.try_get("created_at").map_err(|e| RepositoryError::Decode(e.to_string()))?;

    let items: Vec<FlagItem> = serde_json::from_str(&items_json)
        .map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let created_at = DateTime::parse_from_rfc3339(&created_at_str)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now());

    Ok(SuitabilityFlagSet {
        id: FlagSetId(id),
        application_id: ApplicationId(application_id),
        items,
        model_version,
        created_at,
        superseded: superseded != 0,
    })
}

impl SqlFlagSetRepository {
    async fn save_items(
        &self,
        flag_set_id: &FlagSetId,
        items: &[FlagItem],
    ) -> Result<(), RepositoryError> {
        let items_json =
            serde_json::to_string(items).map_err(|e| RepositoryError::Decode(e.to_string()))?;
        sqlx::query("UPDATE suitability_flag_set SET items = ? WHERE id = ?")
            .bind(items_json)
            .bind(&flag_set_id.0)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl FlagSetRepository for SqlFlagSetRepository {
    async fn create_flag_set(
        &self,
        application_id: &ApplicationId,
        flags: Vec<RaisedFlag>,
        model_version: &str,
    ) -> Result<SuitabilityFlagSet, RepositoryError> {
        let set = new_flag_set(application_id, flags, model_version);
        let items_json = serde_json::to_string(&set.items)
            .map_err(|e| RepositoryError::Decode(e.to_string()))?;

        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "UPDATE suitability_flag_set SET superseded = 1
             WHERE application_id = ? AND superseded = 0",
        )
        .bind(&application_id.0)
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            "INSERT INTO suitability_flag_set
                 (id, application_id, items, model_version, superseded, created_at)
             VALUES (?, ?, ?, ?, 0, ?)",
        )
        .bind(&set.id.0)
        .bind(&application_id.0)
        .bind(items_json)
        .bind(model_version)
        .bind(set.created_at.to_rfc3339())
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        Ok(set)
    }

    async fn find_by_id(
        &self,
        id: &FlagSetId,
    ) -> Result<Option<SuitabilityFlagSet>, RepositoryError> {
        let row = sqlx::query(
            "SELECT id, application_id, items, model_version, superseded, created_at
             FROM suitability_flag_set WHERE id = ?",
        )
        .bind(&id.0)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(ref r) => Ok(Some(row_to_flag_set(r)?)),
            None => Ok(None),
        }
    }

    async fn current_for_application(
        &self,
        application_id: &ApplicationId,
    ) -> Result<Option<SuitabilityFlagSet>, RepositoryError> {
        let row = sqlx::query(
            "SELECT id, application_id, items, model_version, superseded, created_at
             FROM suitability_flag_set
             WHERE application_id = ? AND superseded = 0",
        )
        .bind(&application_id.0)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(ref r) => Ok(Some(row_to_flag_set(r)?)),
            None => Ok(None),
        }
    }

    async fn acknowledge(
        &self,
        flag_set_id: &FlagSetId,
        item_id: &str,
        override_reason: &str,
        acknowledged_by: &str,
    ) -> Result<AcknowledgeOutcome, RepositoryError> {
        let Some(mut set) = self.find_by_id(flag_set_id).await? else {
            return Ok(AcknowledgeOutcome::SetNotFound);
        };
        let outcome = acknowledge_item(&mut set, item_id, override_reason, acknowledged_by);
        if matches!(outcome, AcknowledgeOutcome::Acknowledged(_)) {
            self.save_items(flag_set_id, &set.items).await?;
        }
        Ok(outcome)
    }
}

#[derive(Default)]
pub struct InMemoryFlagSetRepository {
    sets: RwLock<HashMap<String, SuitabilityFlagSet>>,
}

#[async_trait]
impl FlagSetRepository for InMemoryFlagSetRepository {
    async fn create_flag_set(
        &self,
        application_id: &ApplicationId,
        flags: Vec<RaisedFlag>,
        model_version: &str,
    ) -> Result<SuitabilityFlagSet, RepositoryError> {
        let set = new_flag_set(application_id, flags, model_version);
        let mut sets = self.sets.write().await;
        for existing in sets.values_mut() {
            if existing.application_id == *application_id && !existing.superseded {
                existing.superseded = true;
            }
        }
        sets.insert(set.id.0.clone(), set.clone());
        Ok(set)
    }

    async fn find_by_id(
        &self,
        id: &FlagSetId,
    ) -> Result<Option<SuitabilityFlagSet>, RepositoryError> {
        let sets = self.sets.read().await;
        Ok(sets.get(&id.0).cloned())
    }

    async fn current_for_application(
        &self,
        application_id: &ApplicationId,
    ) -> Result<Option<SuitabilityFlagSet>, RepositoryError> {
        let sets = self.sets.read().await;
        Ok(sets
            .values()
            .find(|set| set.application_id == *application_id && !set.superseded)
            .cloned())
    }

    async fn acknowledge(
        &self,
        flag_set_id: &FlagSetId,
        item_id: &str,
        override_reason: &str,
        acknowledged_by: &str,
    ) -> Result<AcknowledgeOutcome, RepositoryError> {
        let mut sets = self.sets.write().await;
        let Some(set) = sets.get_mut(&flag_set_id.0) else {
            return Ok(AcknowledgeOutcome::SetNotFound);
        };
        Ok(acknowledge_item(set, item_id, override_reason, acknowledged_by))
    }
}
