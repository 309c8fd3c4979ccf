//! Records persisted by the project store and the payloads that create or
//! modify them.

use std::collections::BTreeMap;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::QubeError;

/// How a project pays its affiliates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PaymentMode {
    /// Publisher pays whitelisted affiliates individually.
    DirectPayment,
    /// Rewards are deposited into the escrow contract and withdrawn per conversion.
    EscrowPayment,
}

impl PaymentMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DirectPayment => "DirectPayment",
            Self::EscrowPayment => "EscrowPayment",
        }
    }
}

impl FromStr for PaymentMode {
    type Err = QubeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "DirectPayment" => Ok(Self::DirectPayment),
            "EscrowPayment" => Ok(Self::EscrowPayment),
            other => Err(QubeError::invalid(format!("Unknown payment mode: {other}"))),
        }
    }
}

/// Reward terms for escrow-paid projects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PaymentType {
    /// A fixed token amount per conversion.
    FixedAmount,
    /// A percentage of the revenue reported with the conversion.
    RevenueShare,
    /// A token amount that grows with the affiliate's conversion count.
    Tiered,
}

impl PaymentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FixedAmount => "FixedAmount",
            Self::RevenueShare => "RevenueShare",
            Self::Tiered => "Tiered",
        }
    }
}

impl FromStr for PaymentType {
    type Err = QubeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "FixedAmount" => Ok(Self::FixedAmount),
            "RevenueShare" => Ok(Self::RevenueShare),
            "Tiered" => Ok(Self::Tiered),
            other => Err(QubeError::invalid(format!("Unknown payment type: {other}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tier {
    /// Conversion count (including the one being paid) at which the tier applies.
    pub conversions_required: u32,
    pub reward_amount: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WhitelistEntry {
    pub redirect_url: String,
    pub reward_amount: String,
}

/// Wallet address → individual terms. Ordered so serialized output is stable.
pub type Whitelist = BTreeMap<String, WhitelistEntry>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub id: String,
    pub name: String,
    pub slug: String,
    pub description: String,
    pub owner_address: String,
    pub token_address: String,
    pub payment_mode: PaymentMode,
    pub payment_type: PaymentType,
    /// Token amount for `FixedAmount`, percentage for `RevenueShare`.
    pub reward_amount: Option<String>,
    #[serde(default)]
    pub tiers: Vec<Tier>,
    pub redirect_url: Option<String>,
    #[serde(default)]
    pub whitelist: Whitelist,
    /// Sum of settled rewards, in token base units.
    pub total_paid_out: String,
    pub last_paid_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
    /// Bumped by every settings write.
    #[serde(default)]
    pub version: i64,
}

impl Project {
    /// Whitelist lookup that ignores address case.
    pub fn whitelist_entry(&self, wallet: &str) -> Option<&WhitelistEntry> {
        self.whitelist
            .iter()
            .find(|(addr, _)| addr.eq_ignore_ascii_case(wallet))
            .map(|(_, entry)| entry)
    }
}

/// Row shape of the `projects` table; JSON columns are decoded on conversion.
#[derive(Debug, sqlx::FromRow)]
pub struct ProjectRow {
    pub id: String,
    pub name: String,
    pub slug: String,
    pub description: String,
    pub owner_address: String,
    pub token_address: String,
    pub payment_mode: String,
    pub payment_type: String,
    pub reward_amount: Option<String>,
    pub tiers: String,
    pub redirect_url: Option<String>,
    pub whitelist: String,
    pub total_paid_out: String,
    pub last_paid_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
    pub version: i64,
}

impl TryFrom<ProjectRow> for Project {
    type Error = QubeError;

    fn try_from(row: ProjectRow) -> Result<Self, Self::Error> {
        Ok(Project {
            payment_mode: row.payment_mode.parse()?,
            payment_type: row.payment_type.parse()?,
            tiers: serde_json::from_str(&row.tiers)?,
            whitelist: serde_json::from_str(&row.whitelist)?,
            id: row.id,
            name: row.name,
            slug: row.slug,
            description: row.description,
            owner_address: row.owner_address,
            token_address: row.token_address,
            reward_amount: row.reward_amount,
            redirect_url: row.redirect_url,
            total_paid_out: row.total_paid_out,
            last_paid_at: row.last_paid_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
            version: row.version,
        })
    }
}

/// Body of `POST /api/projects`.
#[derive(Debug, Clone, Deserialize)]
pub struct NewProject {
    pub name: String,
    pub slug: String,
    pub description: String,
    pub owner_address: String,
    pub token_address: String,
    pub payment_mode: PaymentMode,
    pub payment_type: PaymentType,
    pub reward_amount: Option<String>,
    #[serde(default)]
    pub tiers: Vec<Tier>,
    pub redirect_url: Option<String>,
    #[serde(default)]
    pub whitelist: Whitelist,
}

impl NewProject {
    pub fn into_project(self, id: String, now: i64) -> Project {
        Project {
            id,
            name: self.name,
            slug: self.slug,
            description: self.description,
            owner_address: self.owner_address,
            token_address: self.token_address,
            payment_mode: self.payment_mode,
            payment_type: self.payment_type,
            reward_amount: self.reward_amount,
            tiers: self.tiers,
            redirect_url: self.redirect_url,
            whitelist: self.whitelist,
            total_paid_out: "0".to_string(),
            last_paid_at: None,
            created_at: now,
            updated_at: now,
            version: 0,
        }
    }
}

/// Body of `PATCH /api/projects/:id`. Absent fields are left untouched.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProjectUpdate {
    pub name: Option<String>,
    pub slug: Option<String>,
    pub description: Option<String>,
    pub token_address: Option<String>,
    pub payment_mode: Option<PaymentMode>,
    pub payment_type: Option<PaymentType>,
    pub reward_amount: Option<String>,
    pub tiers: Option<Vec<Tier>>,
    pub redirect_url: Option<String>,
    pub whitelist: Option<Whitelist>,
}

impl ProjectUpdate {
    /// Apply onto `project`. Payment mode and type are fixed at creation.
    pub fn apply(self, project: &mut Project, now: i64) -> Result<(), QubeError> {
        if self.payment_mode.is_some_and(|m| m != project.payment_mode) {
            return Err(QubeError::invalid(
                "Payment mode cannot be edited after initial setup",
            ));
        }
        if self.payment_type.is_some_and(|t| t != project.payment_type) {
            return Err(QubeError::invalid(
                "Payment type cannot be edited after initial setup",
            ));
        }

        if let Some(v) = self.name {
            project.name = v;
        }
        if let Some(v) = self.slug {
            project.slug = v;
        }
        if let Some(v) = self.description {
            project.description = v;
        }
        if let Some(v) = self.token_address {
            project.token_address = v;
        }
        if let Some(v) = self.reward_amount {
            project.reward_amount = Some(v);
        }
        if let Some(v) = self.tiers {
            project.tiers = v;
        }
        if let Some(v) = self.redirect_url {
            project.redirect_url = Some(v);
        }
        if let Some(v) = self.whitelist {
            project.whitelist = v;
        }
        project.updated_at = now;
        Ok(())
    }
}

/// Body of `POST /api/projects/:id/whitelist`.
#[derive(Debug, Clone, Deserialize)]
pub struct NewWhitelistEntry {
    pub address: String,
    pub redirect_url: String,
    pub reward_amount: String,
}

/// An affiliate's tracked link into a project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Referral {
    pub id: String,
    pub project_id: String,
    pub affiliate_wallet: String,
    pub conversions: i64,
    /// Sum of settled rewards, in token base units.
    pub earnings: String,
    pub last_conversion_at: Option<i64>,
    pub created_at: i64,
}

/// Body of `POST /api/projects/:id/referrals`.
#[derive(Debug, Clone, Deserialize)]
pub struct JoinProject {
    pub affiliate_wallet: String,
}

/// Outcome of a settled conversion, written to `conversion_logs`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SettlementRecord {
    pub referral_id: String,
    pub project_id: String,
    pub conversion_id: Option<String>,
    /// Paid amount in token base units.
    pub amount: String,
    pub tx_hash: String,
    pub settled_at: i64,
}

/// How an unsuccessful withdrawal is logged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptStatus {
    /// Rejected before it reached the chain. A claimed conversion id may be
    /// claimed again.
    Failed,
    /// Submission outcome is not known; the transaction may still land. A
    /// claimed conversion id stays taken.
    Unknown,
}

impl AttemptStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Failed => "failed",
            Self::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ConversionLog {
    pub id: i64,
    pub referral_id: String,
    pub project_id: String,
    pub conversion_id: Option<String>,
    pub amount: Option<String>,
    pub tx_hash: Option<String>,
    pub status: String,
    pub created_at: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Project {
        NewProject {
            name: "Quest".into(),
            slug: "quest".into(),
            description: "A game".into(),
            owner_address: "0x0000000000000000000000000000000000000001".into(),
            token_address: "0x0000000000000000000000000000000000000002".into(),
            payment_mode: PaymentMode::EscrowPayment,
            payment_type: PaymentType::FixedAmount,
            reward_amount: Some("10".into()),
            tiers: vec![],
            redirect_url: Some("https://quest.example".into()),
            whitelist: Whitelist::new(),
        }
        .into_project("p1".into(), 100)
    }

    #[test]
    fn payment_enums_parse_their_own_names() {
        for mode in [PaymentMode::DirectPayment, PaymentMode::EscrowPayment] {
            assert_eq!(mode.as_str().parse::<PaymentMode>().unwrap(), mode);
        }
        for ty in [
            PaymentType::FixedAmount,
            PaymentType::RevenueShare,
            PaymentType::Tiered,
        ] {
            assert_eq!(ty.as_str().parse::<PaymentType>().unwrap(), ty);
        }
        assert!("Escrow".parse::<PaymentMode>().is_err());
    }

    #[test]
    fn payment_mode_serializes_as_variant_name() {
        let json = serde_json::to_string(&PaymentMode::EscrowPayment).unwrap();
        assert_eq!(json, r#""EscrowPayment""#);
    }

    #[test]
    fn new_project_starts_with_nothing_paid() {
        let p = sample();
        assert_eq!(p.total_paid_out, "0");
        assert_eq!(p.last_paid_at, None);
        assert_eq!(p.created_at, p.updated_at);
    }

    #[test]
    fn update_rejects_payment_mode_change() {
        let mut p = sample();
        let update = ProjectUpdate {
            payment_mode: Some(PaymentMode::DirectPayment),
            ..Default::default()
        };
        assert!(update.apply(&mut p, 200).is_err());
        assert_eq!(p.payment_mode, PaymentMode::EscrowPayment);
    }

    #[test]
    fn update_applies_only_present_fields() {
        let mut p = sample();
        let update = ProjectUpdate {
            name: Some("Quest II".into()),
            payment_type: Some(PaymentType::FixedAmount),
            ..Default::default()
        };
        update.apply(&mut p, 200).unwrap();
        assert_eq!(p.name, "Quest II");
        assert_eq!(p.description, "A game");
        assert_eq!(p.updated_at, 200);
    }

    #[test]
    fn whitelist_lookup_ignores_case() {
        let mut p = sample();
        p.whitelist.insert(
            "0xAbCd000000000000000000000000000000000001".into(),
            WhitelistEntry {
                redirect_url: "https://a.example".into(),
                reward_amount: "5".into(),
            },
        );
        assert!(p
            .whitelist_entry("0xabcd000000000000000000000000000000000001")
            .is_some());
        assert!(p
            .whitelist_entry("0x0000000000000000000000000000000000000009")
            .is_none());
    }
}
