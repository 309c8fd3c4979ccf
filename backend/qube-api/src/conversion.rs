//! Conversion settlement: referral → project terms → escrow withdrawal.
//!
//! Each call is one linear attempt. Reads from the store and the on-chain
//! submission are awaited strictly in order. Two calls for the same referral
//! are NOT serialised against each other; only a caller-supplied conversion
//! id deduplicates, by being claimed in the store before the withdrawal.

use std::sync::Arc;

use ethers::types::{Address, TxHash, U256};
use serde::Deserialize;
use tracing::{error, info, warn};

use crate::errors::{NotFoundKind, QubeError, Result};
use crate::ledger::SettlementLedger;
use crate::models::{AttemptStatus, SettlementRecord};
use crate::reward::resolve_reward;
use crate::store::ProjectStore;

/// Query parameters of `POST /api/conversion`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConversionRequest {
    /// Referral code from the tracking link.
    pub referral: Option<String>,
    /// Optional idempotency key for this conversion event.
    pub conversion: Option<String>,
    /// Revenue generated by the conversion; revenue-share projects only.
    pub revenue: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConversionOutcome {
    pub referral_id: String,
    pub project_id: String,
    pub payee: Address,
    pub amount: U256,
    pub tx_hash: TxHash,
}

#[derive(Clone)]
pub struct ConversionService {
    store: Arc<dyn ProjectStore>,
    ledger: Arc<dyn SettlementLedger>,
    fee_recipient: Address,
    token_decimals: u32,
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

impl ConversionService {
    pub fn new(
        store: Arc<dyn ProjectStore>,
        ledger: Arc<dyn SettlementLedger>,
        fee_recipient: Address,
        token_decimals: u32,
    ) -> Self {
        Self {
            store,
            ledger,
            fee_recipient,
            token_decimals,
        }
    }

    pub fn token_decimals(&self) -> u32 {
        self.token_decimals
    }

    /// Settle one conversion for the referral named in `request`.
    pub async fn settle(&self, request: &ConversionRequest) -> Result<ConversionOutcome> {
        let referral_id =
            non_empty(&request.referral).ok_or_else(|| QubeError::invalid("Referral ID is missing"))?;

        let referral = self
            .store
            .get_referral(referral_id)
            .await?
            .ok_or(QubeError::NotFound(NotFoundKind::Referral))?;

        let project = self
            .store
            .get_project(&referral.project_id)
            .await?
            .ok_or(QubeError::NotFound(NotFoundKind::Project))?;

        let amount = resolve_reward(
            &project,
            &referral,
            non_empty(&request.revenue),
            self.token_decimals,
        )?;

        let payee = referral.affiliate_wallet.parse::<Address>().map_err(|_| {
            QubeError::Settlement(format!(
                "referral {} has malformed affiliate wallet {:?}",
                referral.id, referral.affiliate_wallet
            ))
        })?;

        let conversion_id = non_empty(&request.conversion);
        if let Some(key) = conversion_id {
            if !self.store.claim_conversion(key, &referral).await? {
                return Err(QubeError::Conflict("Conversion already settled".to_string()));
            }
        }

        info!(
            "Settling conversion for referral {} (project {}): {amount} base units to {payee:?}",
            referral.id, project.id
        );

        let tx_hash = match self.ledger.withdraw(self.fee_recipient, payee, amount).await {
            Ok(tx_hash) => tx_hash,
            Err(e) => {
                let status = match e {
                    QubeError::SettlementUnknown(_) => AttemptStatus::Unknown,
                    _ => AttemptStatus::Failed,
                };
                if status == AttemptStatus::Unknown {
                    warn!(
                        "Withdrawal for referral {} may still land; conversion id {:?} stays claimed",
                        referral.id, conversion_id
                    );
                }
                if let Err(log_err) = self
                    .store
                    .record_failure(&referral, conversion_id, status)
                    .await
                {
                    warn!(
                        "Could not record failed settlement for referral {}: {log_err}",
                        referral.id
                    );
                }
                return Err(e);
            }
        };

        let record = SettlementRecord {
            referral_id: referral.id.clone(),
            project_id: project.id.clone(),
            conversion_id: conversion_id.map(String::from),
            amount: amount.to_string(),
            tx_hash: format!("{tx_hash:?}"),
            settled_at: chrono::Utc::now().timestamp(),
        };

        // Funds have moved; a bookkeeping failure is reported, not returned.
        if let Err(e) = self.store.record_settlement(&record).await {
            error!(
                "Withdrawal {} for referral {} succeeded but was not recorded: {e}",
                record.tx_hash, record.referral_id
            );
        }

        Ok(ConversionOutcome {
            referral_id: referral.id,
            project_id: project.id,
            payee,
            amount,
            tx_hash,
        })
    }
}

// ─────────────────────────────────────────────────────────
// Unit tests
// ─────────────────────────────────────────────────────────

#[cfg(test)]
pub mod testing {
    //! In-memory [`ProjectStore`] that counts lookups.

    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::models::{Project, Referral};

    #[derive(Default)]
    pub struct MemoryStore {
        pub referrals: HashMap<String, Referral>,
        pub projects: HashMap<String, Project>,
        pub claims: Mutex<HashMap<String, &'static str>>,
        pub settlements: Mutex<Vec<SettlementRecord>>,
        pub failures: Mutex<Vec<(String, Option<String>)>>,
        pub referral_reads: AtomicUsize,
        pub project_reads: AtomicUsize,
        pub reject_settlement_writes: bool,
    }

    impl MemoryStore {
        pub fn referral_reads(&self) -> usize {
            self.referral_reads.load(Ordering::SeqCst)
        }

        pub fn project_reads(&self) -> usize {
            self.project_reads.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ProjectStore for MemoryStore {
        async fn get_referral(&self, id: &str) -> Result<Option<Referral>> {
            self.referral_reads.fetch_add(1, Ordering::SeqCst);
            Ok(self.referrals.get(id).cloned())
        }

        async fn get_project(&self, id: &str) -> Result<Option<Project>> {
            self.project_reads.fetch_add(1, Ordering::SeqCst);
            Ok(self.projects.get(id).cloned())
        }

        async fn claim_conversion(&self, conversion_id: &str, _referral: &Referral) -> Result<bool> {
            let mut claims = self.claims.lock().unwrap();
            let state = claims.get(conversion_id).copied();
            match state {
                Some("failed") | None => {
                    claims.insert(conversion_id.to_string(), "pending");
                    Ok(true)
                }
                Some(_) => Ok(false),
            }
        }

        async fn record_failure(
            &self,
            referral: &Referral,
            conversion_id: Option<&str>,
            status: AttemptStatus,
        ) -> Result<()> {
            if let Some(key) = conversion_id {
                self.claims
                    .lock()
                    .unwrap()
                    .insert(key.to_string(), status.as_str());
            }
            self.failures
                .lock()
                .unwrap()
                .push((referral.id.clone(), conversion_id.map(String::from)));
            Ok(())
        }

        async fn record_settlement(&self, record: &SettlementRecord) -> Result<()> {
            if self.reject_settlement_writes {
                return Err(QubeError::Database(sqlx::Error::PoolClosed));
            }
            if let Some(key) = &record.conversion_id {
                self.claims.lock().unwrap().insert(key.clone(), "settled");
            }
            self.settlements.lock().unwrap().push(record.clone());
            Ok(())
        }
    }
}
