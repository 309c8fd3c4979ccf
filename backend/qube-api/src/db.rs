//! Database layer: migrations, project/referral queries, and conversion
//! bookkeeping.

use std::str::FromStr;

use ethers::types::U256;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use tracing::info;

use crate::errors::{QubeError, Result};
use crate::models::{
    AttemptStatus, ConversionLog, Project, ProjectRow, Referral, SettlementRecord,
};
use crate::reward::add_base_units;

/// Establish a SQLite connection pool and run pending migrations.
pub async fn init_pool(database_url: &str) -> Result<SqlitePool> {
    let url = if database_url.starts_with("sqlite:") {
        database_url.to_string()
    } else {
        format!("sqlite:{database_url}")
    };

    let options = SqliteConnectOptions::from_str(&url)?.create_if_missing(true);

    // Every connection to `:memory:` is its own database, so keep exactly one
    // and never let it expire.
    let pool = if url.contains(":memory:") {
        SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?
    } else {
        SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?
    };

    sqlx::migrate!("./migrations").run(&pool).await?;
    info!("Database migrations applied successfully");
    Ok(pool)
}

fn conflict_on_unique(err: sqlx::Error, message: &str) -> QubeError {
    if let sqlx::Error::Database(db) = &err {
        if db.is_unique_violation() {
            return QubeError::Conflict(message.to_string());
        }
    }
    QubeError::Database(err)
}

// ─────────────────────────────────────────────────────────
// Projects
// ─────────────────────────────────────────────────────────

const PROJECT_COLUMNS: &str = r#"
    id, name, slug, description, owner_address, token_address, payment_mode,
    payment_type, reward_amount, tiers, redirect_url, whitelist, total_paid_out,
    last_paid_at, created_at, updated_at, version
"#;

pub async fn insert_project(pool: &SqlitePool, project: &Project) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO projects
            (id, name, slug, description, owner_address, token_address, payment_mode,
             payment_type, reward_amount, tiers, redirect_url, whitelist, total_paid_out,
             last_paid_at, created_at, updated_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)
        "#,
    )
    .bind(&project.id)
    .bind(&project.name)
    .bind(&project.slug)
    .bind(&project.description)
    .bind(&project.owner_address)
    .bind(&project.token_address)
    .bind(project.payment_mode.as_str())
    .bind(project.payment_type.as_str())
    .bind(&project.reward_amount)
    .bind(serde_json::to_string(&project.tiers)?)
    .bind(&project.redirect_url)
    .bind(serde_json::to_string(&project.whitelist)?)
    .bind(&project.total_paid_out)
    .bind(project.last_paid_at)
    .bind(project.created_at)
    .bind(project.updated_at)
    .execute(pool)
    .await
    .map_err(|e| conflict_on_unique(e, "Project slug is already taken"))?;
    Ok(())
}

pub async fn get_project(pool: &SqlitePool, id: &str) -> Result<Option<Project>> {
    let row = sqlx::query_as::<_, ProjectRow>(&format!(
        "SELECT {PROJECT_COLUMNS} FROM projects WHERE id = ?1"
    ))
    .bind(id)
    .fetch_optional(pool)
    .await?;
    row.map(Project::try_from).transpose()
}

/// All projects, newest first, optionally restricted to one owner wallet.
pub async fn list_projects(pool: &SqlitePool, owner: Option<&str>) -> Result<Vec<Project>> {
    let rows = match owner {
        Some(owner) => {
            sqlx::query_as::<_, ProjectRow>(&format!(
                "SELECT {PROJECT_COLUMNS} FROM projects
                 WHERE owner_address = ?1 COLLATE NOCASE
                 ORDER BY created_at DESC, id ASC"
            ))
            .bind(owner)
            .fetch_all(pool)
            .await?
        }
        None => {
            sqlx::query_as::<_, ProjectRow>(&format!(
                "SELECT {PROJECT_COLUMNS} FROM projects ORDER BY created_at DESC, id ASC"
            ))
            .fetch_all(pool)
            .await?
        }
    };
    rows.into_iter().map(Project::try_from).collect()
}

/// Persist the editable columns of `project`. Paid-out accounting is owned
/// by [`record_settlement`] and is never overwritten here.
///
/// The write only applies while the stored version still equals
/// `project.version`; `false` means the project is gone or was changed since
/// it was read.
pub async fn update_project(pool: &SqlitePool, project: &Project) -> Result<bool> {
    let rows = sqlx::query(
        r#"
        UPDATE projects
        SET    name = ?2, slug = ?3, description = ?4, token_address = ?5,
               reward_amount = ?6, tiers = ?7, redirect_url = ?8, whitelist = ?9,
               updated_at = ?10, version = version + 1
        WHERE  id = ?1 AND version = ?11
        "#,
    )
    .bind(&project.id)
    .bind(&project.name)
    .bind(&project.slug)
    .bind(&project.description)
    .bind(&project.token_address)
    .bind(&project.reward_amount)
    .bind(serde_json::to_string(&project.tiers)?)
    .bind(&project.redirect_url)
    .bind(serde_json::to_string(&project.whitelist)?)
    .bind(project.updated_at)
    .bind(project.version)
    .execute(pool)
    .await
    .map_err(|e| conflict_on_unique(e, "Project slug is already taken"))?
    .rows_affected();
    Ok(rows > 0)
}

/// Delete a project together with its referrals. Conversion logs are kept.
pub async fn delete_project(pool: &SqlitePool, id: &str) -> Result<bool> {
    let mut tx = pool.begin().await?;
    sqlx::query("DELETE FROM referrals WHERE project_id = ?1")
        .bind(id)
        .execute(&mut *tx)
        .await?;
    let rows = sqlx::query("DELETE FROM projects WHERE id = ?1")
        .bind(id)
        .execute(&mut *tx)
        .await?
        .rows_affected();
    tx.commit().await?;
    Ok(rows > 0)
}

// ─────────────────────────────────────────────────────────
// Referrals
// ─────────────────────────────────────────────────────────

pub async fn insert_referral(pool: &SqlitePool, referral: &Referral) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO referrals
            (id, project_id, affiliate_wallet, conversions, earnings, last_conversion_at, created_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
        "#,
    )
    .bind(&referral.id)
    .bind(&referral.project_id)
    .bind(&referral.affiliate_wallet)
    .bind(referral.conversions)
    .bind(&referral.earnings)
    .bind(referral.last_conversion_at)
    .bind(referral.created_at)
    .execute(pool)
    .await
    .map_err(|e| conflict_on_unique(e, "Affiliate has already joined this project"))?;
    Ok(())
}

pub async fn get_referral(pool: &SqlitePool, id: &str) -> Result<Option<Referral>> {
    let row = sqlx::query_as::<_, Referral>(
        r#"
        SELECT id, project_id, affiliate_wallet, conversions, earnings,
               last_conversion_at, created_at
        FROM   referrals
        WHERE  id = ?1
        "#,
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

/// Fetch all referrals of a project, oldest first.
pub async fn get_referrals_for_project(
    pool: &SqlitePool,
    project_id: &str,
) -> Result<Vec<Referral>> {
    let rows = sqlx::query_as::<_, Referral>(
        r#"
        SELECT id, project_id, affiliate_wallet, conversions, earnings,
               last_conversion_at, created_at
        FROM   referrals
        WHERE  project_id = ?1
        ORDER  BY created_at ASC, id ASC
        "#,
    )
    .bind(project_id)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

// ─────────────────────────────────────────────────────────
// Conversion bookkeeping
// ─────────────────────────────────────────────────────────

/// Atomically claim `conversion_id` for settlement.
///
/// Returns `false` when the id is already pending or settled. A previously
/// failed id may be claimed again.
pub async fn claim_conversion(
    pool: &SqlitePool,
    conversion_id: &str,
    referral_id: &str,
    project_id: &str,
    now: i64,
) -> Result<bool> {
    let rows = sqlx::query(
        r#"
        INSERT INTO conversion_logs
            (referral_id, project_id, conversion_id, status, created_at)
        VALUES (?1, ?2, ?3, 'pending', ?4)
        ON CONFLICT (conversion_id) DO UPDATE
            SET status      = 'pending',
                referral_id = excluded.referral_id,
                project_id  = excluded.project_id,
                created_at  = excluded.created_at
            WHERE conversion_logs.status = 'failed'
        "#,
    )
    .bind(referral_id)
    .bind(project_id)
    .bind(conversion_id)
    .bind(now)
    .execute(pool)
    .await?
    .rows_affected();
    Ok(rows > 0)
}

/// Log an unsuccessful attempt. Only [`AttemptStatus::Failed`] releases a
/// claimed conversion id for retry; `unknown` ids are never claimed again.
pub async fn record_failure(
    pool: &SqlitePool,
    referral_id: &str,
    project_id: &str,
    conversion_id: Option<&str>,
    status: AttemptStatus,
    now: i64,
) -> Result<()> {
    match conversion_id {
        Some(key) => {
            sqlx::query(
                "UPDATE conversion_logs SET status = ?2
                 WHERE conversion_id = ?1 AND status = 'pending'",
            )
            .bind(key)
            .bind(status.as_str())
            .execute(pool)
            .await?;
        }
        None => {
            sqlx::query(
                r#"
                INSERT INTO conversion_logs (referral_id, project_id, status, created_at)
                VALUES (?1, ?2, ?3, ?4)
                "#,
            )
            .bind(referral_id)
            .bind(project_id)
            .bind(status.as_str())
            .bind(now)
            .execute(pool)
            .await?;
        }
    }
    Ok(())
}

/// Log a settled conversion and roll its amount into the referral's and the
/// project's running totals, all in one transaction.
pub async fn record_settlement(pool: &SqlitePool, record: &SettlementRecord) -> Result<()> {
    let amount = U256::from_dec_str(&record.amount)
        .map_err(|_| QubeError::invalid(format!("Invalid settled amount: {}", record.amount)))?;

    let mut tx = pool.begin().await?;

    match &record.conversion_id {
        Some(key) => {
            sqlx::query(
                r#"
                UPDATE conversion_logs
                SET    status = 'settled', amount = ?2, tx_hash = ?3, created_at = ?4
                WHERE  conversion_id = ?1
                "#,
            )
            .bind(key)
            .bind(&record.amount)
            .bind(&record.tx_hash)
            .bind(record.settled_at)
            .execute(&mut *tx)
            .await?;
        }
        None => {
            sqlx::query(
                r#"
                INSERT INTO conversion_logs
                    (referral_id, project_id, amount, tx_hash, status, created_at)
                VALUES (?1, ?2, ?3, ?4, 'settled', ?5)
                "#,
            )
            .bind(&record.referral_id)
            .bind(&record.project_id)
            .bind(&record.amount)
            .bind(&record.tx_hash)
            .bind(record.settled_at)
            .execute(&mut *tx)
            .await?;
        }
    }

    let earnings: Option<(String,)> = sqlx::query_as("SELECT earnings FROM referrals WHERE id = ?1")
        .bind(&record.referral_id)
        .fetch_optional(&mut *tx)
        .await?;
    if let Some((earnings,)) = earnings {
        let earnings = add_base_units(&earnings, amount)?;
        sqlx::query(
            r#"
            UPDATE referrals
            SET    conversions = conversions + 1, earnings = ?2, last_conversion_at = ?3
            WHERE  id = ?1
            "#,
        )
        .bind(&record.referral_id)
        .bind(earnings.to_string())
        .bind(record.settled_at)
        .execute(&mut *tx)
        .await?;
    }

    let paid: Option<(String,)> = sqlx::query_as("SELECT total_paid_out FROM projects WHERE id = ?1")
        .bind(&record.project_id)
        .fetch_optional(&mut *tx)
        .await?;
    if let Some((paid,)) = paid {
        let paid = add_base_units(&paid, amount)?;
        sqlx::query("UPDATE projects SET total_paid_out = ?2, last_paid_at = ?3 WHERE id = ?1")
            .bind(&record.project_id)
            .bind(paid.to_string())
            .bind(record.settled_at)
            .execute(&mut *tx)
            .await?;
    }

    tx.commit().await?;
    Ok(())
}

/// Fetch a referral's conversion log, newest first.
pub async fn get_conversion_logs(
    pool: &SqlitePool,
    referral_id: &str,
) -> Result<Vec<ConversionLog>> {
    let rows = sqlx::query_as::<_, ConversionLog>(
        r#"
        SELECT id, referral_id, project_id, conversion_id, amount, tx_hash, status, created_at
        FROM   conversion_logs
        WHERE  referral_id = ?1
        ORDER  BY created_at DESC, id DESC
        "#,
    )
    .bind(referral_id)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

// ─────────────────────────────────────────────────────────
// Unit tests
// ─────────────────────────────────────────────────────────
