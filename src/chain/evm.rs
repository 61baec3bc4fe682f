//! EVM-backed chain clients
//!
//! Wraps `ethers` providers with multi-RPC failover and bounded timeouts.
//! Releases are plain value transfers that carry the bridge's idempotency
//! token in calldata, so a restarted dispatcher can find a submission it
//! does not remember making.

use super::{DepositLocusIssuer, DestinationChainClient, PaymentSighting, SourceChainClient};
use crate::config::ChainConfig;
use crate::error::{BridgeError, BridgeResult};

use async_trait::async_trait;
use ethers::prelude::*;
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::utils::to_checksum;
use rust_decimal::Decimal;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Decimal source-asset units per whole coin
const WEI_SCALE: u32 = 18;

/// Convert a decimal asset amount to wei
pub fn decimal_to_wei(amount: Decimal) -> BridgeResult<U256> {
    if amount.is_sign_negative() {
        return Err(BridgeError::Internal("negative amount".to_string()));
    }
    let scale = amount.scale();
    if scale > WEI_SCALE {
        return Err(BridgeError::Internal(
            "amount precision exceeds wei".to_string(),
        ));
    }
    let mantissa = amount.mantissa() as u128;
    Ok(U256::from(mantissa) * U256::exp10((WEI_SCALE - scale) as usize))
}

/// Convert wei back to a decimal asset amount
pub fn wei_to_decimal(value: U256) -> Option<Decimal> {
    if value > U256::from(u128::MAX) {
        return None;
    }
    Decimal::try_from_i128_with_scale(value.as_u128() as i128, WEI_SCALE)
        .ok()
        .map(|d| d.normalize())
}

/// Multi-provider wrapper with automatic failover
pub struct EvmProvider {
    config: ChainConfig,
    http_providers: Vec<Provider<Http>>,
    current_provider: AtomicUsize,
}

impl EvmProvider {
    pub fn new(config: ChainConfig) -> BridgeResult<Self> {
        let mut http_providers = Vec::new();

        for url in &config.rpc_urls {
            match Provider::<Http>::try_from(url.as_str()) {
                Ok(provider) => {
                    let provider = provider.interval(Duration::from_millis(100));
                    http_providers.push(provider);
                    debug!("Added HTTP provider for {}: {}", config.name, url);
                }
                Err(e) => {
                    warn!("Failed to create provider for {}: {}", url, e);
                }
            }
        }

        if http_providers.is_empty() {
            return Err(BridgeError::TransientChain {
                chain: config.name.clone(),
                message: "No valid RPC providers".to_string(),
            });
        }

        Ok(Self {
            config,
            http_providers,
            current_provider: AtomicUsize::new(0),
        })
    }

    /// Get the active HTTP provider
    pub fn http(&self) -> &Provider<Http> {
        let idx = self.current_provider.load(Ordering::Relaxed);
        &self.http_providers[idx % self.http_providers.len()]
    }

    /// Switch to next available provider
    pub fn failover(&self) {
        let current = self.current_provider.load(Ordering::Relaxed);
        let next = (current + 1) % self.http_providers.len();
        self.current_provider.store(next, Ordering::Relaxed);
        warn!("Chain {} failover to provider {}", self.config.name, next);
    }

    pub fn chain_name(&self) -> &str {
        &self.config.name
    }

    pub fn chain_id(&self) -> u64 {
        self.config.chain_id
    }

    pub fn scan_depth(&self) -> u64 {
        self.config.scan_depth
    }

    fn chain_err(&self, message: impl ToString) -> BridgeError {
        BridgeError::TransientChain {
            chain: self.config.name.clone(),
            message: message.to_string(),
        }
    }

    /// Get current block number with failover
    pub async fn get_block_number(&self) -> BridgeResult<u64> {
        for _ in 0..self.http_providers.len() {
            match self.http().get_block_number().await {
                Ok(block) => return Ok(block.as_u64()),
                Err(e) => {
                    warn!(
                        "Failed to get block number from {}: {}",
                        self.config.name, e
                    );
                    self.failover();
                }
            }
        }

        Err(self.chain_err("All providers failed"))
    }

    /// Get a block with full transaction bodies
    pub async fn get_block_with_txs(
        &self,
        block_number: u64,
    ) -> BridgeResult<Option<Block<Transaction>>> {
        for _ in 0..self.http_providers.len() {
            match self.http().get_block_with_txs(block_number).await {
                Ok(block) => return Ok(block),
                Err(e) => {
                    warn!("Failed to get block from {}: {}", self.config.name, e);
                    self.failover();
                }
            }
        }

        Err(self.chain_err("All providers failed to get block"))
    }

    /// Get transaction receipt
    pub async fn get_transaction_receipt(
        &self,
        tx_hash: H256,
    ) -> BridgeResult<Option<TransactionReceipt>> {
        self.http()
            .get_transaction_receipt(tx_hash)
            .await
            .map_err(|e| self.chain_err(e))
    }

    /// Health check
    pub async fn health_check(&self) -> bool {
        self.get_block_number().await.is_ok()
    }
}

/// Scans the source chain for payments into deposit loci
pub struct EvmSourceClient {
    provider: std::sync::Arc<EvmProvider>,
}

impl EvmSourceClient {
    pub fn new(provider: std::sync::Arc<EvmProvider>) -> Self {
        Self { provider }
    }
}

#[async_trait]
impl SourceChainClient for EvmSourceClient {
    async fn payments_to(&self, locus: &str) -> BridgeResult<Vec<PaymentSighting>> {
        let target: Address = locus
            .parse()
            .map_err(|_| BridgeError::Internal(format!("bad deposit locus: {}", locus)))?;

        let current = self.provider.get_block_number().await?;
        let depth = self.provider.scan_depth().max(1);
        let from = current.saturating_sub(depth - 1);

        let mut sightings = Vec::new();
        for number in from..=current {
            let Some(block) = self.provider.get_block_with_txs(number).await? else {
                continue;
            };
            for tx in &block.transactions {
                if tx.to == Some(target) && !tx.value.is_zero() {
                    let Some(amount) = wei_to_decimal(tx.value) else {
                        continue;
                    };
                    sightings.push(PaymentSighting {
                        amount,
                        confirmations: current - number + 1,
                        tx_ref: format!("{:?}", tx.hash),
                    });
                }
            }
        }

        Ok(sightings)
    }
}

/// Submits and tracks destination-chain releases
pub struct EvmDestinationClient {
    provider: std::sync::Arc<EvmProvider>,
    wallet: LocalWallet,
}

impl EvmDestinationClient {
    pub fn new(provider: std::sync::Arc<EvmProvider>, config: &ChainConfig) -> BridgeResult<Self> {
        let wallet = Self::load_wallet(config)?.with_chain_id(config.chain_id);
        info!(
            "Destination client initialized with wallet {:?} on {}",
            wallet.address(),
            config.name
        );
        Ok(Self { provider, wallet })
    }

    /// Load the treasury signing key from the configured environment variable
    fn load_wallet(config: &ChainConfig) -> BridgeResult<LocalWallet> {
        let var = config.wallet_key_env.as_deref().unwrap_or("BRIDGE_SIGNER_KEY");
        let key = std::env::var(var).map_err(|_| {
            BridgeError::Wallet(format!("No signing key configured. Set {}", var))
        })?;
        key.parse::<LocalWallet>()
            .map_err(|e| BridgeError::Wallet(format!("Invalid signing key: {}", e)))
    }

    async fn sign_and_send(&self, tx: TypedTransaction) -> BridgeResult<H256> {
        let signature = self
            .wallet
            .sign_transaction(&tx)
            .await
            .map_err(|e| BridgeError::Wallet(e.to_string()))?;
        let raw = tx.rlp_signed(&signature);

        let pending = self
            .provider
            .http()
            .send_raw_transaction(raw)
            .await
            .map_err(|e| {
                let message = e.to_string();
                // An explicit node rejection is not retryable; wire trouble is
                if message.contains("insufficient funds") || message.contains("invalid") {
                    BridgeError::PermanentSettlement {
                        id: String::new(),
                        reason: message,
                    }
                } else {
                    BridgeError::TransientChain {
                        chain: self.provider.chain_name().to_string(),
                        message,
                    }
                }
            })?;

        Ok(pending.tx_hash())
    }
}

#[async_trait]
impl DestinationChainClient for EvmDestinationClient {
    async fn submit_release(
        &self,
        address: &str,
        amount: Decimal,
        token: &str,
    ) -> BridgeResult<String> {
        let to: Address = address.parse().map_err(|_| BridgeError::PermanentSettlement {
            id: String::new(),
            reason: format!("invalid destination address: {}", address),
        })?;

        let value = decimal_to_wei(amount)?;
        let nonce = self
            .provider
            .http()
            .get_transaction_count(self.wallet.address(), None)
            .await
            .map_err(|e| BridgeError::TransientChain {
                chain: self.provider.chain_name().to_string(),
                message: e.to_string(),
            })?;
        let gas_price = self
            .provider
            .http()
            .get_gas_price()
            .await
            .map_err(|e| BridgeError::TransientChain {
                chain: self.provider.chain_name().to_string(),
                message: e.to_string(),
            })?;

        let request = TransactionRequest::new()
            .to(to)
            .value(value)
            .data(token.as_bytes().to_vec())
            .nonce(nonce)
            .gas(60_000u64)
            .gas_price(gas_price)
            .chain_id(self.provider.chain_id());

        let tx_hash = self.sign_and_send(TypedTransaction::Legacy(request)).await?;
        debug!("Release submitted: {:?} (token {})", tx_hash, token);
        Ok(format!("{:?}", tx_hash))
    }

    async fn confirmations(&self, tx_ref: &str) -> BridgeResult<u64> {
        let tx_hash: H256 = tx_ref
            .parse()
            .map_err(|_| BridgeError::Internal(format!("bad tx ref: {}", tx_ref)))?;

        let Some(receipt) = self.provider.get_transaction_receipt(tx_hash).await? else {
            return Ok(0);
        };
        let Some(included_in) = receipt.block_number else {
            return Ok(0);
        };

        let current = self.provider.get_block_number().await?;
        Ok(current.saturating_sub(included_in.as_u64()) + 1)
    }

    async fn find_release(&self, token: &str) -> BridgeResult<Option<String>> {
        let current = self.provider.get_block_number().await?;
        let depth = self.provider.scan_depth().max(1);
        let from = current.saturating_sub(depth - 1);
        let own = self.wallet.address();

        for number in from..=current {
            let Some(block) = self.provider.get_block_with_txs(number).await? else {
                continue;
            };
            for tx in &block.transactions {
                if tx.from == own && tx.input.as_ref() == token.as_bytes() {
                    return Ok(Some(format!("{:?}", tx.hash)));
                }
            }
        }

        Ok(None)
    }
}

/// Issues fresh deposit addresses, persisting key material to a keystore.
/// Key custody beyond the keystore file is the treasury's concern.
pub struct EvmLocusIssuer {
    keystore_dir: PathBuf,
    password_env: String,
}

impl EvmLocusIssuer {
    pub fn new(config: &ChainConfig) -> BridgeResult<Self> {
        let dir = config
            .keystore_dir
            .as_deref()
            .ok_or_else(|| BridgeError::Config("source_chain.keystore_dir is required".into()))?;
        std::fs::create_dir_all(dir)
            .map_err(|e| BridgeError::Config(format!("keystore dir: {}", e)))?;
        Ok(Self {
            keystore_dir: PathBuf::from(dir),
            password_env: "CONDUIT_KEYSTORE_PASSWORD".to_string(),
        })
    }
}

#[async_trait]
impl DepositLocusIssuer for EvmLocusIssuer {
    async fn issue_deposit_locus(&self) -> BridgeResult<String> {
        let password = std::env::var(&self.password_env).map_err(|_| {
            BridgeError::Wallet(format!("Set {} to issue deposit keys", self.password_env))
        })?;

        let mut rng = ethers::core::rand::thread_rng();
        let (wallet, _uuid) =
            LocalWallet::new_keystore(&self.keystore_dir, &mut rng, password, None)
                .map_err(|e| BridgeError::Wallet(e.to_string()))?;

        Ok(to_checksum(&wallet.address(), None))
    }
}
