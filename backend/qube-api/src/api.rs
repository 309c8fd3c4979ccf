//! Axum REST API handlers.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use ethers::types::U256;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tracing::{error, info};
use uuid::Uuid;

use crate::conversion::{ConversionRequest, ConversionService};
use crate::db;
use crate::errors::{NotFoundKind, QubeError, Result};
use crate::models::{
    ConversionLog, JoinProject, NewProject, NewWhitelistEntry, PaymentMode, Project,
    ProjectUpdate, Referral, WhitelistEntry,
};
use crate::reward::format_amount;
use crate::validation::{is_valid_address, validate_project, validate_whitelist_entry};

/// Body of every 500 response. Callers never see the underlying cause.
const GENERIC_FAILURE: &str = "An error has occured";

#[derive(Clone)]
pub struct ApiState {
    pub pool: SqlitePool,
    pub conversions: ConversionService,
}

pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/conversion", post(post_conversion))
        .route("/api/projects", get(list_projects).post(create_project))
        .route(
            "/api/projects/:id",
            get(get_project).patch(update_project).delete(delete_project),
        )
        .route("/api/projects/:id/whitelist", post(add_whitelist_entry))
        .route(
            "/api/projects/:id/whitelist/:wallet",
            delete(remove_whitelist_entry),
        )
        .route(
            "/api/projects/:id/referrals",
            get(list_referrals).post(join_project),
        )
        .route("/api/referrals/:id", get(get_referral))
        .route("/api/referrals/:id/conversions", get(get_referral_conversions))
        .with_state(state)
}

// ─────────────────────────────────────────────────────────
// Response shapes
// ─────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Serialize)]
pub struct MessageResponse {
    pub message: String,
}

#[derive(Serialize)]
pub struct ProjectsResponse {
    pub count: usize,
    pub projects: Vec<Project>,
}

/// One row of the publisher dashboard's affiliate table.
#[derive(Serialize)]
pub struct AffiliateSummary {
    pub referral_id: String,
    pub affiliate_wallet: String,
    pub conversions: i64,
    /// Earnings in whole tokens.
    pub earnings: String,
    pub last_conversion_date: Option<String>,
    pub creation_date: Option<String>,
}

#[derive(Serialize)]
pub struct AffiliatesResponse {
    pub project_id: String,
    pub token_address: String,
    pub count: usize,
    pub affiliates: Vec<AffiliateSummary>,
}

#[derive(Serialize)]
pub struct ConversionsResponse {
    pub referral_id: String,
    pub count: usize,
    pub conversions: Vec<ConversionLog>,
}

#[derive(Debug, Deserialize)]
pub struct ProjectFilter {
    pub owner: Option<String>,
}

impl IntoResponse for QubeError {
    fn into_response(self) -> Response {
        let status = match &self {
            QubeError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            QubeError::NotFound(_) => StatusCode::NOT_FOUND,
            QubeError::Conflict(_) => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let message = if self.is_internal() {
            error!("Request failed: {self}");
            GENERIC_FAILURE.to_string()
        } else {
            self.to_string()
        };
        (status, Json(ErrorResponse { error: message })).into_response()
    }
}

fn format_date(ts: Option<i64>) -> Option<String> {
    ts.and_then(|t| DateTime::<Utc>::from_timestamp(t, 0))
        .map(|d| d.to_rfc3339())
}

async fn load_project(pool: &SqlitePool, id: &str) -> Result<Project> {
    db::get_project(pool, id)
        .await?
        .ok_or(QubeError::NotFound(NotFoundKind::Project))
}

/// Write back a project loaded earlier in the same request. Another request
/// changing it in between is a 409; the caller reloads and retries.
async fn save_project(pool: &SqlitePool, project: &mut Project) -> Result<()> {
    if db::update_project(pool, project).await? {
        project.version += 1;
        return Ok(());
    }
    if db::get_project(pool, &project.id).await?.is_none() {
        return Err(QubeError::NotFound(NotFoundKind::Project));
    }
    Err(QubeError::Conflict(
        "Project was modified by another request".to_string(),
    ))
}

// ─────────────────────────────────────────────────────────
// Handlers
// ─────────────────────────────────────────────────────────

/// `GET /health`
pub async fn health() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// `POST /api/conversion?referral=<id>[&conversion=<id>][&revenue=<amount>]`
///
/// Pays the referral's affiliate for one conversion out of the escrow.
pub async fn post_conversion(
    State(state): State<Arc<ApiState>>,
    Query(request): Query<ConversionRequest>,
) -> Result<Json<MessageResponse>> {
    let outcome = state.conversions.settle(&request).await?;
    info!(
        "Conversion settled for referral {} (project {}): {} base units to {:?} in tx {:?}",
        outcome.referral_id, outcome.project_id, outcome.amount, outcome.payee, outcome.tx_hash
    );
    Ok(Json(MessageResponse {
        message: format!("Conversion successful : {}", outcome.referral_id),
    }))
}

/// `POST /api/projects`
pub async fn create_project(
    State(state): State<Arc<ApiState>>,
    Json(body): Json<NewProject>,
) -> Result<(StatusCode, Json<Project>)> {
    let project = body.into_project(Uuid::new_v4().to_string(), Utc::now().timestamp());
    validate_project(&project, state.conversions.token_decimals())?;
    db::insert_project(&state.pool, &project).await?;
    info!("Project {} ({}) created by {}", project.id, project.slug, project.owner_address);
    Ok((StatusCode::CREATED, Json(project)))
}

/// `GET /api/projects[?owner=<wallet>]`
pub async fn list_projects(
    State(state): State<Arc<ApiState>>,
    Query(filter): Query<ProjectFilter>,
) -> Result<Json<ProjectsResponse>> {
    let projects = db::list_projects(&state.pool, filter.owner.as_deref()).await?;
    Ok(Json(ProjectsResponse {
        count: projects.len(),
        projects,
    }))
}

/// `GET /api/projects/:id`
pub async fn get_project(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> Result<Json<Project>> {
    Ok(Json(load_project(&state.pool, &id).await?))
}

/// `PATCH /api/projects/:id`
///
/// Settings update. Payment mode and payment type are fixed at creation.
pub async fn update_project(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
    Json(update): Json<ProjectUpdate>,
) -> Result<Json<Project>> {
    let mut project = load_project(&state.pool, &id).await?;
    update.apply(&mut project, Utc::now().timestamp())?;
    validate_project(&project, state.conversions.token_decimals())?;
    save_project(&state.pool, &mut project).await?;
    Ok(Json(project))
}

/// `DELETE /api/projects/:id`
pub async fn delete_project(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> Result<StatusCode> {
    if !db::delete_project(&state.pool, &id).await? {
        return Err(QubeError::NotFound(NotFoundKind::Project));
    }
    info!("Project {id} deleted");
    Ok(StatusCode::NO_CONTENT)
}

/// `POST /api/projects/:id/whitelist`
pub async fn add_whitelist_entry(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
    Json(body): Json<NewWhitelistEntry>,
) -> Result<(StatusCode, Json<Project>)> {
    let mut project = load_project(&state.pool, &id).await?;
    if project.payment_mode != PaymentMode::DirectPayment {
        return Err(QubeError::invalid(
            "Whitelist is only used by direct payment projects",
        ));
    }

    let entry = WhitelistEntry {
        redirect_url: body.redirect_url,
        reward_amount: body.reward_amount,
    };
    validate_whitelist_entry(&body.address, &entry, state.conversions.token_decimals())?;
    if project.whitelist_entry(&body.address).is_some() {
        return Err(QubeError::Conflict(
            "Address already exists in the whitelist.".to_string(),
        ));
    }

    project.whitelist.insert(body.address, entry);
    project.updated_at = Utc::now().timestamp();
    save_project(&state.pool, &mut project).await?;
    Ok((StatusCode::CREATED, Json(project)))
}

/// `DELETE /api/projects/:id/whitelist/:wallet`
pub async fn remove_whitelist_entry(
    State(state): State<Arc<ApiState>>,
    Path((id, wallet)): Path<(String, String)>,
) -> Result<Json<Project>> {
    let mut project = load_project(&state.pool, &id).await?;
    let key = project
        .whitelist
        .keys()
        .find(|addr| addr.eq_ignore_ascii_case(&wallet))
        .cloned()
        .ok_or(QubeError::NotFound(NotFoundKind::WhitelistEntry))?;

    project.whitelist.remove(&key);
    project.updated_at = Utc::now().timestamp();
    // A direct payment project may not end up with an empty whitelist.
    validate_project(&project, state.conversions.token_decimals())?;
    save_project(&state.pool, &mut project).await?;
    info!("Address {key} removed from the whitelist of project {id}");
    Ok(Json(project))
}

/// `POST /api/projects/:id/referrals`
///
/// An affiliate joins a project and receives its referral code.
pub async fn join_project(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
    Json(body): Json<JoinProject>,
) -> Result<(StatusCode, Json<Referral>)> {
    let project = load_project(&state.pool, &id).await?;
    if !is_valid_address(&body.affiliate_wallet) {
        return Err(QubeError::invalid("Invalid wallet address."));
    }
    if project.payment_mode == PaymentMode::DirectPayment
        && project.whitelist_entry(&body.affiliate_wallet).is_none()
    {
        return Err(QubeError::invalid(
            "Only whitelisted affiliates can join this project",
        ));
    }

    let referral = Referral {
        id: Uuid::new_v4().simple().to_string(),
        project_id: project.id,
        affiliate_wallet: body.affiliate_wallet,
        conversions: 0,
        earnings: "0".to_string(),
        last_conversion_at: None,
        created_at: Utc::now().timestamp(),
    };
    db::insert_referral(&state.pool, &referral).await?;
    info!(
        "Affiliate {} joined project {} with referral {}",
        referral.affiliate_wallet, referral.project_id, referral.id
    );
    Ok((StatusCode::CREATED, Json(referral)))
}

/// `GET /api/projects/:id/referrals`
///
/// Dashboard listing of a project's affiliates and what they have earned.
pub async fn list_referrals(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> Result<Json<AffiliatesResponse>> {
    let project = load_project(&state.pool, &id).await?;
    let decimals = state.conversions.token_decimals();

    let affiliates: Vec<AffiliateSummary> = db::get_referrals_for_project(&state.pool, &id)
        .await?
        .into_iter()
        .map(|r| AffiliateSummary {
            earnings: U256::from_dec_str(&r.earnings)
                .map(|e| format_amount(e, decimals))
                .unwrap_or(r.earnings),
            last_conversion_date: format_date(r.last_conversion_at),
            creation_date: format_date(Some(r.created_at)),
            referral_id: r.id,
            affiliate_wallet: r.affiliate_wallet,
            conversions: r.conversions,
        })
        .collect();

    Ok(Json(AffiliatesResponse {
        project_id: project.id,
        token_address: project.token_address,
        count: affiliates.len(),
        affiliates,
    }))
}

/// `GET /api/referrals/:id`
pub async fn get_referral(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> Result<Json<Referral>> {
    db::get_referral(&state.pool, &id)
        .await?
        .map(Json)
        .ok_or(QubeError::NotFound(NotFoundKind::Referral))
}

/// `GET /api/referrals/:id/conversions`
pub async fn get_referral_conversions(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> Result<Json<ConversionsResponse>> {
    if db::get_referral(&state.pool, &id).await?.is_none() {
        return Err(QubeError::NotFound(NotFoundKind::Referral));
    }
    let conversions = db::get_conversion_logs(&state.pool, &id).await?;
    Ok(Json(ConversionsResponse {
        referral_id: id,
        count: conversions.len(),
        conversions,
    }))
}

// ─────────────────────────────────────────────────────────
// Unit tests
// ─────────────────────────────────────────────────────────
