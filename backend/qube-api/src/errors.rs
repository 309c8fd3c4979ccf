//! Application-wide error types.

use std::fmt;

use thiserror::Error;

/// Which lookup came back empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotFoundKind {
    Referral,
    Project,
    WhitelistEntry,
}

impl fmt::Display for NotFoundKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Self::Referral => "Referral data not found",
            Self::Project => "Project data not found",
            Self::WhitelistEntry => "Whitelist entry not found",
        };
        f.write_str(msg)
    }
}

#[derive(Debug, Error)]
pub enum QubeError {
    #[error("{0}")]
    InvalidInput(String),

    #[error("{0}")]
    NotFound(NotFoundKind),

    #[error("{0}")]
    Conflict(String),

    #[error("Settlement error: {0}")]
    Settlement(String),

    /// The withdrawal may or may not have been broadcast.
    #[error("Settlement outcome unknown: {0}")]
    SettlementUnknown(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl QubeError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// True for failures whose detail must stay out of the response body.
    pub fn is_internal(&self) -> bool {
        !matches!(
            self,
            Self::InvalidInput(_) | Self::NotFound(_) | Self::Conflict(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, QubeError>;
