//! Token amount handling and per-conversion reward resolution.
//!
//! Amounts travel through the API as decimal strings ("12.5") and are turned
//! into base units with the configured token decimals before they reach the
//! escrow contract. Aggregates (earnings, total paid out) are kept in base
//! units so repeated additions never lose precision.

use ethers::types::U256;
use ethers::utils::{format_units, parse_units};

use crate::errors::{QubeError, Result};
use crate::models::{PaymentMode, PaymentType, Project, Referral};

/// Percentages are parsed with two decimals, i.e. into basis points.
const PERCENT_DECIMALS: u32 = 2;
const FULL_SHARE_BPS: u64 = 100 * 100;

/// Parse a non-negative decimal token amount into base units.
pub fn parse_amount(raw: &str, decimals: u32) -> Result<U256> {
    let raw = raw.trim();
    if raw.is_empty() || raw.starts_with('-') || raw.starts_with('+') {
        return Err(QubeError::invalid(format!("Invalid token amount: {raw:?}")));
    }
    // parse_units truncates extra fractional digits instead of failing.
    if let Some((_, fraction)) = raw.split_once('.') {
        if fraction.len() > decimals as usize {
            return Err(QubeError::invalid(format!(
                "Token amount {raw:?} has more than {decimals} decimal places"
            )));
        }
    }
    let parsed = parse_units(raw, decimals)
        .map_err(|_| QubeError::invalid(format!("Invalid token amount: {raw:?}")))?;
    Ok(parsed.into())
}

/// Parse an amount that must be strictly positive.
pub fn parse_positive_amount(raw: &str, decimals: u32) -> Result<U256> {
    let amount = parse_amount(raw, decimals)?;
    if amount.is_zero() {
        return Err(QubeError::invalid("Reward amount must be greater than zero"));
    }
    Ok(amount)
}

/// Parse a revenue-share percentage into basis points, accepting (0, 100].
pub fn parse_percentage_bps(raw: &str) -> Result<U256> {
    let bps = parse_amount(raw, PERCENT_DECIMALS)
        .map_err(|_| QubeError::invalid(format!("Invalid percentage: {raw:?}")))?;
    if bps.is_zero() || bps > U256::from(FULL_SHARE_BPS) {
        return Err(QubeError::invalid(
            "Percentage must be greater than 0 and at most 100",
        ));
    }
    Ok(bps)
}

/// Render base units as a trimmed decimal string ("12.5", not "12.500000").
pub fn format_amount(amount: U256, decimals: u32) -> String {
    let Ok(formatted) = format_units(amount, decimals) else {
        return amount.to_string();
    };
    if formatted.contains('.') {
        formatted
            .trim_end_matches('0')
            .trim_end_matches('.')
            .to_string()
    } else {
        formatted
    }
}

/// Add `delta` base units to a stored base-unit string.
pub fn add_base_units(stored: &str, delta: U256) -> Result<U256> {
    let current = U256::from_dec_str(stored.trim())
        .map_err(|_| QubeError::invalid(format!("Invalid stored amount: {stored:?}")))?;
    current
        .checked_add(delta)
        .ok_or_else(|| QubeError::invalid("Amount overflow"))
}

/// Work out how much a single conversion on `referral` pays.
///
/// `revenue` is only consulted for revenue-share projects. A zero result is
/// rejected so no withdrawal is ever issued for nothing.
pub fn resolve_reward(
    project: &Project,
    referral: &Referral,
    revenue: Option<&str>,
    decimals: u32,
) -> Result<U256> {
    let amount = match project.payment_mode {
        PaymentMode::DirectPayment => {
            let entry = project
                .whitelist_entry(&referral.affiliate_wallet)
                .ok_or_else(|| {
                    QubeError::invalid("Affiliate is not whitelisted for this project")
                })?;
            parse_amount(&entry.reward_amount, decimals)?
        }
        PaymentMode::EscrowPayment => match project.payment_type {
            PaymentType::FixedAmount => {
                let raw = project
                    .reward_amount
                    .as_deref()
                    .ok_or_else(|| QubeError::invalid("Project reward amount is not set"))?;
                parse_amount(raw, decimals)?
            }
            PaymentType::RevenueShare => {
                let pct = project
                    .reward_amount
                    .as_deref()
                    .ok_or_else(|| QubeError::invalid("Project percentage is not set"))?;
                let bps = parse_percentage_bps(pct)?;
                let revenue = revenue
                    .filter(|r| !r.trim().is_empty())
                    .ok_or_else(|| QubeError::invalid("Revenue is missing"))?;
                let revenue = parse_amount(revenue, decimals)?;
                revenue
                    .checked_mul(bps)
                    .ok_or_else(|| QubeError::invalid("Revenue is too large"))?
                    / U256::from(FULL_SHARE_BPS)
            }
            PaymentType::Tiered => {
                // The conversion being paid counts towards the tier.
                let reached = referral.conversions.max(0) + 1;
                let tier = project
                    .tiers
                    .iter()
                    .filter(|t| i64::from(t.conversions_required) <= reached)
                    .max_by_key(|t| t.conversions_required)
                    .ok_or_else(|| {
                        QubeError::invalid("No reward tier applies to this referral")
                    })?;
                parse_amount(&tier.reward_amount, decimals)?
            }
        },
    };

    if amount.is_zero() {
        return Err(QubeError::invalid("Reward amount must be greater than zero"));
    }
    Ok(amount)
}
