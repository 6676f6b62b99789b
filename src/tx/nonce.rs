//! Nonce management for reliable transaction submission
//!
//! Handles:
//! - Local nonce tracking so concurrent swaps never reuse a nonce
//! - Nonce gap detection and recovery against the pending on-chain count

use crate::chain::ChainProvider;
use crate::error::SwapResult;
use crate::swap::ChainSide;

use ethers::types::{Address, TxHash};
use std::collections::BTreeMap;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Nonce state for the wallet on one chain
#[derive(Debug, Default)]
struct NonceState {
    /// Next nonce to hand out
    current: u64,
    /// Submitted but unconfirmed: nonce -> tx hash
    pending: BTreeMap<u64, TxHash>,
    /// Highest nonce known to be mined
    confirmed: Option<u64>,
}

/// Hands out nonces for one wallet on one chain
pub struct NonceManager {
    side: ChainSide,
    wallet_address: Address,
    state: Mutex<NonceState>,
}

impl NonceManager {
    pub fn new(side: ChainSide, wallet_address: Address) -> Self {
        Self {
            side,
            wallet_address,
            state: Mutex::new(NonceState::default()),
        }
    }

    /// Initialize from the chain's pending transaction count
    pub async fn init(&self, provider: &ChainProvider) -> SwapResult<()> {
        let on_chain = provider.get_transaction_count(self.wallet_address).await?;
        self.reset_to(on_chain).await;
        debug!("Initialized nonce for chain {}: {}", self.side, on_chain);
        Ok(())
    }

    /// Allocate the next nonce
    pub async fn next_nonce(&self) -> u64 {
        let mut state = self.state.lock().await;
        let nonce = state.current;
        state.current += 1;
        debug!("Allocated nonce {} for chain {}", nonce, self.side);
        nonce
    }

    pub async fn mark_pending(&self, nonce: u64, tx_hash: TxHash) {
        self.state.lock().await.pending.insert(nonce, tx_hash);
    }

    /// Transaction with `nonce` was mined
    pub async fn confirm(&self, nonce: u64) {
        let mut state = self.state.lock().await;
        state.pending.remove(&nonce);
        if state.confirmed.map_or(true, |c| nonce > c) {
            state.confirmed = Some(nonce);
        }
    }

    /// Transaction was never broadcast; the nonce can be reused
    pub async fn release(&self, nonce: u64) {
        let mut state = self.state.lock().await;
        state.pending.remove(&nonce);
        if nonce + 1 == state.current {
            state.current = nonce;
        }
    }

    /// Re-align with the on-chain count after a nonce error
    pub async fn sync(&self, provider: &ChainProvider) -> SwapResult<()> {
        let on_chain = provider.get_transaction_count(self.wallet_address).await?;
        self.reset_to(on_chain).await;
        Ok(())
    }

    /// After a receipt timeout: if the node's pending count shows `nonce` was
    /// never taken, hand it out again. Returns whether it was rewound.
    pub async fn forget_unseen(&self, provider: &ChainProvider, nonce: u64) -> SwapResult<bool> {
        let on_chain = provider.get_transaction_count(self.wallet_address).await?;
        Ok(self.rewind_to(on_chain, nonce).await)
    }

    async fn rewind_to(&self, on_chain: u64, nonce: u64) -> bool {
        if on_chain > nonce {
            return false;
        }
        let mut state = self.state.lock().await;
        state.pending.retain(|n, _| *n < nonce);
        state.current = state.current.min(nonce);
        warn!(
            "Submission with nonce {} never reached chain {}, reusing it",
            nonce, self.side
        );
        true
    }

    pub async fn pending_count(&self) -> usize {
        self.state.lock().await.pending.len()
    }

    async fn reset_to(&self, on_chain: u64) {
        let mut state = self.state.lock().await;

        let expected = state.confirmed.map_or(0, |c| c + 1);
        if on_chain > expected && state.confirmed.is_some() {
            warn!(
                "Nonce gap detected on chain {}: expected {}, got {}",
                self.side, expected, on_chain
            );
        }

        state.pending.retain(|nonce, _| *nonce >= on_chain);
        state.confirmed = on_chain.checked_sub(1);
        if state.current < on_chain {
            state.current = on_chain;
        }
    }
}
