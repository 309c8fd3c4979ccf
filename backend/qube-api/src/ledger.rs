//! Escrow contract client: submits reward withdrawals on-chain.
//!
//! A withdrawal is a single signed transaction. The client does not wait for
//! confirmation, does not retry, and does not check the escrow balance; the
//! only guard is an upper bound on how long submission may take. Running out
//! of that time once submission has started leaves the outcome unknown.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ethers::contract::abigen;
use ethers::middleware::SignerMiddleware;
use ethers::providers::{Http, Middleware, Provider};
use ethers::signers::{LocalWallet, Signer};
use ethers::types::{Address, TxHash, U256};
use tokio::sync::OnceCell;
use tracing::{debug, info};

use crate::config::Config;
use crate::errors::{QubeError, Result};

abigen!(
    QubeEscrow,
    r#"[
        function withdraw(address protocolFeeRecipient, address affiliate, uint256 amount) external
    ]"#
);

/// Anything able to move escrowed rewards to an affiliate.
#[async_trait]
pub trait SettlementLedger: Send + Sync {
    /// Withdraw `amount` base units to `payee`, crediting the protocol fee to
    /// `fee_recipient`. Returns the submitted transaction hash.
    async fn withdraw(&self, fee_recipient: Address, payee: Address, amount: U256)
        -> Result<TxHash>;
}

type EscrowClient = SignerMiddleware<Provider<Http>, LocalWallet>;

pub struct EscrowLedger {
    provider: Provider<Http>,
    signer: LocalWallet,
    escrow_contract: Address,
    /// Bound on first use when the chain id has to be asked for.
    contract: OnceCell<QubeEscrow<EscrowClient>>,
    timeout: Duration,
}

impl EscrowLedger {
    /// Build the ledger from validated configuration. No request is made to
    /// the provider here; an unset chain id is queried on the first withdrawal.
    pub fn connect(config: &Config) -> Result<Self> {
        let provider = Provider::<Http>::try_from(config.provider_url.as_str())
            .map_err(|e| QubeError::Config(format!("Invalid PROVIDER_URL: {e}")))?;

        info!(
            "Escrow ledger targeting {:?} (signer {:?})",
            config.escrow_contract,
            config.signer_address()
        );

        Ok(Self::new(
            provider,
            config.signer.clone(),
            config.escrow_contract,
            config.chain_id,
            Duration::from_secs(config.settlement_timeout_secs),
        ))
    }

    pub fn new(
        provider: Provider<Http>,
        signer: LocalWallet,
        escrow_contract: Address,
        chain_id: Option<u64>,
        timeout: Duration,
    ) -> Self {
        let mut ledger = Self {
            provider,
            signer,
            escrow_contract,
            contract: OnceCell::new(),
            timeout,
        };
        if let Some(chain_id) = chain_id {
            ledger.contract = OnceCell::new_with(Some(ledger.bind(chain_id)));
        }
        ledger
    }

    fn bind(&self, chain_id: u64) -> QubeEscrow<EscrowClient> {
        let signer = self.signer.clone().with_chain_id(chain_id);
        let client = Arc::new(SignerMiddleware::new(self.provider.clone(), signer));
        QubeEscrow::new(self.escrow_contract, client)
    }

    async fn contract(&self) -> Result<&QubeEscrow<EscrowClient>> {
        self.contract
            .get_or_try_init(|| async {
                let chain_id = self
                    .provider
                    .get_chainid()
                    .await
                    .map_err(|e| QubeError::Settlement(format!("Could not query chain id: {e}")))?
                    .as_u64();
                info!("Escrow ledger bound to chain {chain_id}");
                Ok::<_, QubeError>(self.bind(chain_id))
            })
            .await
    }
}

#[async_trait]
impl SettlementLedger for EscrowLedger {
    async fn withdraw(
        &self,
        fee_recipient: Address,
        payee: Address,
        amount: U256,
    ) -> Result<TxHash> {
        // Nothing has been signed yet, so a slow chain id lookup is a plain failure.
        let contract = tokio::time::timeout(self.timeout, self.contract())
            .await
            .map_err(|_| {
                QubeError::Settlement(format!(
                    "chain id not resolved within {}s",
                    self.timeout.as_secs()
                ))
            })??;

        let call = contract.withdraw(fee_recipient, payee, amount);

        let submit = async {
            let pending = call
                .send()
                .await
                .map_err(|e| QubeError::Settlement(e.to_string()))?;
            Ok::<TxHash, QubeError>(*pending)
        };

        // Once submission has started the transaction may reach the mempool
        // even if no answer comes back in time.
        let tx_hash = tokio::time::timeout(self.timeout, submit)
            .await
            .map_err(|_| {
                QubeError::SettlementUnknown(format!(
                    "withdrawal not submitted within {}s",
                    self.timeout.as_secs()
                ))
            })??;

        debug!("Submitted escrow withdrawal {tx_hash:?}");
        Ok(tx_hash)
    }
}


// ─────────────────────────────────────────────────────────
// Unit tests
// ─────────────────────────────────────────────────────────
