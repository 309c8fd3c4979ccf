//! The slice of the project store the conversion flow depends on.

use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::db;
use crate::errors::Result;
use crate::models::{AttemptStatus, Project, Referral, SettlementRecord};

#[async_trait]
pub trait ProjectStore: Send + Sync {
    async fn get_referral(&self, id: &str) -> Result<Option<Referral>>;

    async fn get_project(&self, id: &str) -> Result<Option<Project>>;

    /// Claim an idempotency key for `referral`. `false` if it is already taken.
    async fn claim_conversion(&self, conversion_id: &str, referral: &Referral) -> Result<bool>;

    async fn record_failure(
        &self,
        referral: &Referral,
        conversion_id: Option<&str>,
        status: AttemptStatus,
    ) -> Result<()>;

    async fn record_settlement(&self, record: &SettlementRecord) -> Result<()>;
}

/// [`ProjectStore`] backed by the SQLite pool.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ProjectStore for SqliteStore {
    async fn get_referral(&self, id: &str) -> Result<Option<Referral>> {
        db::get_referral(&self.pool, id).await
    }

    async fn get_project(&self, id: &str) -> Result<Option<Project>> {
        db::get_project(&self.pool, id).await
    }

    async fn claim_conversion(&self, conversion_id: &str, referral: &Referral) -> Result<bool> {
        let now = chrono::Utc::now().timestamp();
        db::claim_conversion(
            &self.pool,
            conversion_id,
            &referral.id,
            &referral.project_id,
            now,
        )
        .await
    }

    async fn record_failure(
        &self,
        referral: &Referral,
        conversion_id: Option<&str>,
        status: AttemptStatus,
    ) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        db::record_failure(
            &self.pool,
            &referral.id,
            &referral.project_id,
            conversion_id,
            status,
            now,
        )
        .await
    }

    async fn record_settlement(&self, record: &SettlementRecord) -> Result<()> {
        db::record_settlement(&self.pool, record).await
    }
}
