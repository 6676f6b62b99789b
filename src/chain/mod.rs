//! Chain module - ledger seams and their EVM implementations
//!
//! This module provides:
//! - `EscrowLedger` / `AuctionLedger` traits the protocol core drives
//! - Multi-RPC provider management with automatic failover
//! - EVM escrow and auction adapters built on raw ABI calls
//! - A `ChainManager` owning both ledgers for the running agent

pub mod abi;
pub mod auction;
pub mod escrow;
#[cfg(test)]
pub mod memory;
pub mod provider;

pub use auction::EvmAuctionHouse;
pub use escrow::EvmEscrow;
pub use provider::{ChainProvider, GasPrice};

use crate::config::Settings;
use crate::error::{SwapError, SwapResult};
use crate::events::{AuctionEvent, EscrowEvent};
use crate::swap::{Auction, ChainSide, HashedSecret, Leg, Secret, SwapId};
use crate::tx::TransactionSender;

use async_trait::async_trait;
use ethers::signers::{LocalWallet, Signer};
use ethers::types::{Address, TxHash, U256};
use std::sync::Arc;
use tracing::{info, warn};

/// Arguments of an escrow `initiate` call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitiateRequest {
    pub swap_id: SwapId,
    pub recipient: Address,
    pub token: Address,
    pub amount: U256,
    pub hashed_secret: HashedSecret,
    pub timelock: u64,
}

/// Arguments of an auction `createAuction` call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateAuctionRequest {
    pub token_a: Address,
    pub amount_a: U256,
    pub token_b: Address,
    pub min_amount_b: U256,
    pub duration_secs: u64,
}

/// HTLC escrow on one chain
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EscrowLedger: Send + Sync {
    fn chain(&self) -> ChainSide;

    /// Latest block timestamp; the escrow compares timelocks against it
    async fn chain_time(&self) -> SwapResult<u64>;

    /// Direct record lookup; `None` when no leg exists for `swap_id`
    async fn swap_record(&self, swap_id: SwapId) -> SwapResult<Option<Leg>>;

    /// Escrow events for `swap_id` within the last `lookback_blocks` blocks
    async fn scan_swap_events(
        &self,
        swap_id: SwapId,
        lookback_blocks: u64,
    ) -> SwapResult<Vec<EscrowEvent>>;

    /// ERC-20 approval of the escrow as spender
    async fn approve(&self, token: Address, amount: U256) -> SwapResult<TxHash>;

    async fn initiate(&self, request: InitiateRequest) -> SwapResult<TxHash>;

    async fn claim(&self, swap_id: SwapId, secret: Secret) -> SwapResult<TxHash>;

    async fn refund(&self, swap_id: SwapId) -> SwapResult<TxHash>;
}

/// English auction ledger on chain A
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AuctionLedger: Send + Sync {
    async fn auction(&self, auction_id: u64) -> SwapResult<Option<Auction>>;

    /// Number of auctions ever created; ids run from 1 to this value
    async fn auction_count(&self) -> SwapResult<u64>;

    async fn create_auction(&self, request: CreateAuctionRequest) -> SwapResult<u64>;

    async fn bid(&self, auction_id: u64, amount_b: U256) -> SwapResult<TxHash>;

    /// Ends the auction; returns the `AuctionEnded` event when there was a winner
    async fn end_auction(&self, auction_id: u64) -> SwapResult<Option<AuctionEvent>>;
}

/// Owns the ledgers for both chains
pub struct ChainManager {
    escrow_a: Arc<dyn EscrowLedger>,
    escrow_b: Arc<dyn EscrowLedger>,
    auctions: Arc<dyn AuctionLedger>,
    providers: Vec<Arc<ChainProvider>>,
    account: Address,
}

impl ChainManager {
    /// Connect both configured chains with the wallet key from the environment
    pub async fn connect(settings: &Settings) -> SwapResult<Self> {
        let wallet = load_wallet(&settings.wallet.private_key_env)?;
        let account = settings.account()?;
        if wallet.address() != account {
            return Err(SwapError::Wallet(format!(
                "wallet address {:?} does not match configured account {:?}",
                wallet.address(),
                account
            )));
        }

        let mut providers = Vec::new();
        let mut escrows = Vec::new();
        let mut auction_house = None;

        for side in [ChainSide::A, ChainSide::B] {
            let chain_config = settings.chain(side).clone();
            info!(
                "Initializing chain {} ({}, ID: {})",
                side, chain_config.name, chain_config.chain_id
            );

            let provider = Arc::new(ChainProvider::new(side, chain_config.clone()).await?);
            let sender = Arc::new(
                TransactionSender::new(
                    provider.clone(),
                    wallet.clone(),
                    settings.agent.clone(),
                )
                .await?,
            );

            let escrow = EvmEscrow::new(
                provider.clone(),
                sender.clone(),
                chain_config.escrow()?,
                settings.agent.log_chunk_blocks,
            );
            escrows.push(Arc::new(escrow) as Arc<dyn EscrowLedger>);

            if side == ChainSide::A {
                auction_house = Some(Arc::new(EvmAuctionHouse::new(
                    provider.clone(),
                    sender,
                    chain_config.auction_house()?,
                )) as Arc<dyn AuctionLedger>);
            }

            providers.push(provider);
            info!("Chain {} initialized successfully", chain_config.name);
        }

        let escrow_b = escrows.pop().ok_or_else(|| SwapError::Internal("missing escrow B".into()))?;
        let escrow_a = escrows.pop().ok_or_else(|| SwapError::Internal("missing escrow A".into()))?;
        let auctions =
            auction_house.ok_or_else(|| SwapError::Internal("missing auction house".into()))?;

        Ok(Self {
            escrow_a,
            escrow_b,
            auctions,
            providers,
            account,
        })
    }

    /// Assemble from already-built ledgers
    #[cfg(test)]
    pub fn from_parts(
        escrow_a: Arc<dyn EscrowLedger>,
        escrow_b: Arc<dyn EscrowLedger>,
        auctions: Arc<dyn AuctionLedger>,
        account: Address,
    ) -> Self {
        Self {
            escrow_a,
            escrow_b,
            auctions,
            providers: Vec::new(),
            account,
        }
    }

    pub fn escrow(&self, side: ChainSide) -> Arc<dyn EscrowLedger> {
        match side {
            ChainSide::A => self.escrow_a.clone(),
            ChainSide::B => self.escrow_b.clone(),
        }
    }

    pub fn auctions(&self) -> Arc<dyn AuctionLedger> {
        self.auctions.clone()
    }

    pub fn account(&self) -> Address {
        self.account
    }

    /// Health check for all chains
    pub async fn health_check(&self) -> Vec<(ChainSide, bool)> {
        let mut results = Vec::new();

        for provider in &self.providers {
            let healthy = provider.health_check().await;
            results.push((provider.side(), healthy));

            crate::metrics::record_chain_health(provider.side(), healthy);
        }

        results
    }
}

/// Load the signing key from the configured environment variable
fn load_wallet(private_key_env: &str) -> SwapResult<LocalWallet> {
    match std::env::var(private_key_env) {
        Ok(key) => key
            .trim()
            .parse::<LocalWallet>()
            .map_err(|e| SwapError::Wallet(format!("Invalid private key: {}", e))),
        Err(_) => {
            warn!("Environment variable {} is not set", private_key_env);
            Err(SwapError::Wallet(format!(
                "No wallet configured. Set {}",
                private_key_env
            )))
        }
    }
}
