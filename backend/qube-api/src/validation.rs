//! Publisher-side checks applied before a project or whitelist entry is
//! stored.

use ethers::types::Address;

use crate::errors::{QubeError, Result};
use crate::models::{PaymentMode, PaymentType, Project, WhitelistEntry};
use crate::reward::{parse_percentage_bps, parse_positive_amount};

/// `0x`-prefixed 20-byte hex address. Checksum casing is not enforced.
pub fn is_valid_address(addr: &str) -> bool {
    addr.starts_with("0x") && addr.parse::<Address>().is_ok()
}

/// Absolute http(s) URL with a non-empty host and no whitespace.
pub fn is_valid_url(url: &str) -> bool {
    let rest = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"));
    match rest {
        Some(rest) => {
            let host = rest.split(['/', '?', '#']).next().unwrap_or_default();
            !host.is_empty() && !url.chars().any(char::is_whitespace)
        }
        None => false,
    }
}

fn is_valid_slug(slug: &str) -> bool {
    !slug.is_empty()
        && !slug.starts_with('-')
        && !slug.ends_with('-')
        && slug
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}

pub fn validate_whitelist_entry(address: &str, entry: &WhitelistEntry, decimals: u32) -> Result<()> {
    if !is_valid_address(address) {
        return Err(QubeError::invalid("Invalid wallet address."));
    }
    if !is_valid_url(&entry.redirect_url) {
        return Err(QubeError::invalid("Invalid URL."));
    }
    parse_positive_amount(&entry.reward_amount, decimals)?;
    Ok(())
}

/// Full check of a project as it would be stored.
pub fn validate_project(project: &Project, decimals: u32) -> Result<()> {
    if project.name.trim().is_empty() {
        return Err(QubeError::invalid("Project name is required"));
    }
    if project.description.trim().is_empty() {
        return Err(QubeError::invalid("Project description is required"));
    }
    if !is_valid_slug(&project.slug) {
        return Err(QubeError::invalid(
            "Slug may only contain lowercase letters, digits and hyphens",
        ));
    }
    if !is_valid_address(&project.owner_address) {
        return Err(QubeError::invalid("Invalid owner address"));
    }
    if !is_valid_address(&project.token_address) {
        return Err(QubeError::invalid("Invalid token address"));
    }

    match project.payment_mode {
        PaymentMode::DirectPayment => {
            if project.whitelist.is_empty() {
                return Err(QubeError::invalid(
                    "Direct payment projects need at least one whitelisted address",
                ));
            }
            for (address, entry) in &project.whitelist {
                validate_whitelist_entry(address, entry, decimals)?;
            }
        }
        PaymentMode::EscrowPayment => {
            let redirect = project.redirect_url.as_deref().unwrap_or_default();
            if !is_valid_url(redirect) {
                return Err(QubeError::invalid("Invalid redirect URL."));
            }
            validate_terms(project, decimals)?;
        }
    }
    Ok(())
}

fn validate_terms(project: &Project, decimals: u32) -> Result<()> {
    match project.payment_type {
        PaymentType::FixedAmount => {
            let raw = project.reward_amount.as_deref().unwrap_or_default();
            parse_positive_amount(raw, decimals)?;
        }
        PaymentType::RevenueShare => {
            let raw = project.reward_amount.as_deref().unwrap_or_default();
            parse_percentage_bps(raw)?;
        }
        PaymentType::Tiered => {
            if project.tiers.is_empty() {
                return Err(QubeError::invalid("At least one reward tier is required"));
            }
            let mut previous: Option<u32> = None;
            for tier in &project.tiers {
                if tier.conversions_required == 0 {
                    return Err(QubeError::invalid(
                        "Tier thresholds must be at least one conversion",
                    ));
                }
                if previous.is_some_and(|p| tier.conversions_required <= p) {
                    return Err(QubeError::invalid(
                        "Tier thresholds must be strictly increasing",
                    ));
                }
                parse_positive_amount(&tier.reward_amount, decimals)?;
                previous = Some(tier.conversions_required);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{NewProject, Tier, Whitelist};

    const OWNER: &str = "0x0000000000000000000000000000000000000001";
    const TOKEN: &str = "0x0000000000000000000000000000000000000002";

    fn escrow(ty: PaymentType, reward: Option<&str>) -> Project {
        NewProject {
            name: "Quest".into(),
            slug: "quest-2".into(),
            description: "A game".into(),
            owner_address: OWNER.into(),
            token_address: TOKEN.into(),
            payment_mode: PaymentMode::EscrowPayment,
            payment_type: ty,
            reward_amount: reward.map(String::from),
            tiers: vec![],
            redirect_url: Some("https://quest.example/play".into()),
            whitelist: Whitelist::new(),
        }
        .into_project("p1".into(), 0)
    }

    #[test]
    fn address_format() {
        assert!(is_valid_address("0xe5502c6a5a6e4Aa86ACc87Aa3aAAD1B87BCFFA93"));
        assert!(!is_valid_address("e5502c6a5a6e4Aa86ACc87Aa3aAAD1B87BCFFA93"));
        assert!(!is_valid_address("0x1234"));
        assert!(!is_valid_address("0xg5502c6a5a6e4Aa86ACc87Aa3aAAD1B87BCFFA93"));
        assert!(!is_valid_address("0x0xe5502c6a5a6e4Aa86ACc87Aa3aAAD1B87BCFFA"));
    }

    #[test]
    fn url_format() {
        assert!(is_valid_url("https://example.com"));
        assert!(is_valid_url("http://example.com/a?b=c"));
        assert!(!is_valid_url("ftp://example.com"));
        assert!(!is_valid_url("https://"));
        assert!(!is_valid_url("https://exa mple.com"));
    }

    #[test]
    fn escrow_fixed_amount_project_is_valid() {
        validate_project(&escrow(PaymentType::FixedAmount, Some("10")), 18).unwrap();
    }

    #[test]
    fn reward_finer_than_token_decimals_is_rejected() {
        let p = escrow(PaymentType::FixedAmount, Some("1.9999999"));
        let err = validate_project(&p, 6).unwrap_err();
        assert!(matches!(err, QubeError::InvalidInput(_)));
        validate_project(&escrow(PaymentType::FixedAmount, Some("1.999999")), 6).unwrap();
    }

    #[test]
    fn escrow_requires_positive_reward_and_redirect() {
        assert!(validate_project(&escrow(PaymentType::FixedAmount, Some("0")), 18).is_err());
        assert!(validate_project(&escrow(PaymentType::FixedAmount, None), 18).is_err());

        let mut p = escrow(PaymentType::FixedAmount, Some("1"));
        p.redirect_url = Some("not a url".into());
        assert!(validate_project(&p, 18).is_err());
    }

    #[test]
    fn revenue_share_needs_sane_percentage() {
        validate_project(&escrow(PaymentType::RevenueShare, Some("5")), 18).unwrap();
        assert!(validate_project(&escrow(PaymentType::RevenueShare, Some("150")), 18).is_err());
    }

    #[test]
    fn tiers_must_increase() {
        let mut p = escrow(PaymentType::Tiered, None);
        assert!(validate_project(&p, 18).is_err());

        p.tiers = vec![
            Tier { conversions_required: 1, reward_amount: "1".into() },
            Tier { conversions_required: 10, reward_amount: "2".into() },
        ];
        validate_project(&p, 18).unwrap();

        p.tiers.push(Tier { conversions_required: 10, reward_amount: "3".into() });
        assert!(validate_project(&p, 18).is_err());
    }

    #[test]
    fn direct_payment_needs_valid_whitelist() {
        let mut p = escrow(PaymentType::FixedAmount, None);
        p.payment_mode = PaymentMode::DirectPayment;
        assert!(validate_project(&p, 18).is_err());

        p.whitelist.insert(
            "0x00000000000000000000000000000000000000aa".into(),
            WhitelistEntry {
                redirect_url: "https://kol.example".into(),
                reward_amount: "3".into(),
            },
        );
        validate_project(&p, 18).unwrap();

        p.whitelist.insert(
            "bogus".into(),
            WhitelistEntry {
                redirect_url: "https://kol.example".into(),
                reward_amount: "3".into(),
            },
        );
        assert!(validate_project(&p, 18).is_err());
    }

    #[test]
    fn slug_rules() {
        let mut p = escrow(PaymentType::FixedAmount, Some("1"));
        p.slug = "Quest Two".into();
        assert!(validate_project(&p, 18).is_err());
        p.slug = "-quest".into();
        assert!(validate_project(&p, 18).is_err());
    }
}
