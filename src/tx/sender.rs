//! Transaction sender with retry logic and confirmation tracking

use super::gas::GasEstimator;
use super::nonce::NonceManager;
use crate::chain::{ChainProvider, GasPrice};
use crate::config::AgentConfig;
use crate::error::{SwapError, SwapResult};

use ethers::signers::{LocalWallet, Signer};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{
    Address, Bytes, Eip1559TransactionRequest, TransactionReceipt, TransactionRequest, TxHash, U64,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// Signs and submits contract calls on one chain
pub struct TransactionSender {
    provider: Arc<ChainProvider>,
    nonce_manager: NonceManager,
    gas_estimator: GasEstimator,
    /// Wallet bound to the chain id
    wallet: LocalWallet,
    config: AgentConfig,
}

impl TransactionSender {
    pub async fn new(
        provider: Arc<ChainProvider>,
        wallet: LocalWallet,
        config: AgentConfig,
    ) -> SwapResult<Self> {
        let wallet = wallet.with_chain_id(provider.chain_id());
        let nonce_manager = NonceManager::new(provider.side(), wallet.address());
        if let Err(e) = nonce_manager.init(&provider).await {
            warn!("Failed to init nonce for chain {}: {}", provider.side(), e);
        }

        info!(
            "Transaction sender for chain {} initialized with wallet: {:?}",
            provider.side(),
            wallet.address()
        );

        Ok(Self {
            provider,
            nonce_manager,
            gas_estimator: GasEstimator::new(),
            wallet,
            config,
        })
    }

    pub fn wallet_address(&self) -> Address {
        self.wallet.address()
    }

    /// Submit a call to `to` and wait for its confirmations.
    ///
    /// A receipt with a failed status is reported as `ChainCallFailed`.
    pub async fn send_call(
        &self,
        to: Address,
        data: Bytes,
        operation: &str,
    ) -> SwapResult<TransactionReceipt> {
        let side = self.provider.side();
        let started = Instant::now();

        let result: SwapResult<TransactionReceipt> = async {
            let estimate_tx = self.build_tx(to, data.clone(), None, None, None);
            let gas_limit = self
                .gas_estimator
                .estimate_limit(&self.provider, &estimate_tx, operation)
                .await?;
            let gas_price = self.gas_estimator.get_gas_price(&self.provider).await?;
            debug!(
                "{} on chain {}: gas limit {}, max cost {} wei, {} writes in flight",
                operation,
                side,
                gas_limit,
                GasEstimator::calculate_cost(gas_limit, &gas_price),
                self.nonce_manager.pending_count().await
            );

            let (tx_hash, nonce) = self
                .send_with_retry(to, data, gas_limit, &gas_price, operation)
                .await?;
            let receipt = self.wait_for_receipt(tx_hash, nonce, operation).await?;
            self.nonce_manager.confirm(nonce).await;

            if receipt.status != Some(U64::from(1)) {
                return Err(SwapError::ChainCallFailed {
                    chain: side,
                    operation: operation.to_string(),
                    reason: format!("transaction {:?} reverted", tx_hash),
                });
            }
            Ok(receipt)
        }
        .await;

        match &result {
            Ok(receipt) => {
                info!(
                    "{} confirmed on chain {}: {:?} (block {:?})",
                    operation, side, receipt.transaction_hash, receipt.block_number
                );
                crate::metrics::record_chain_write(side, operation, "confirmed");
                crate::metrics::record_write_latency(side, started.elapsed().as_secs_f64());
            }
            Err(e) => {
                error!("{} on chain {} failed: {}", operation, side, e);
                crate::metrics::record_chain_write(side, operation, e.kind());
            }
        }
        result
    }

    fn build_tx(
        &self,
        to: Address,
        data: Bytes,
        nonce: Option<u64>,
        gas_limit: Option<ethers::types::U256>,
        gas_price: Option<&GasPrice>,
    ) -> TypedTransaction {
        let from = self.wallet.address();
        let mut tx: TypedTransaction = match gas_price {
            Some(GasPrice::Eip1559 {
                max_fee_per_gas,
                max_priority_fee_per_gas,
            }) => Eip1559TransactionRequest::new()
                .from(from)
                .to(to)
                .data(data)
                .max_fee_per_gas(*max_fee_per_gas)
                .max_priority_fee_per_gas(*max_priority_fee_per_gas)
                .into(),
            Some(GasPrice::Legacy(price)) => TransactionRequest::new()
                .from(from)
                .to(to)
                .data(data)
                .gas_price(*price)
                .into(),
            None => TransactionRequest::new().from(from).to(to).data(data).into(),
        };
        if let Some(nonce) = nonce {
            tx.set_nonce(nonce);
        }
        if let Some(gas) = gas_limit {
            tx.set_gas(gas);
        }
        tx.set_chain_id(self.provider.chain_id());
        tx
    }

    /// Sign and broadcast once. Only rejections that prove the node did not
    /// take the transaction are retried here; a send that may have landed is
    /// reported as submitted under its locally computed hash and never signed
    /// a second time.
    async fn send_with_retry(
        &self,
        to: Address,
        data: Bytes,
        gas_limit: ethers::types::U256,
        gas_price: &GasPrice,
        operation: &str,
    ) -> SwapResult<(TxHash, u64)> {
        let side = self.provider.side();
        let max_attempts = self.config.max_retries.max(1);
        let send_timeout = Duration::from_millis(self.config.rpc_timeout_ms);
        let mut last_error = None;

        for attempt in 1..=max_attempts {
            let nonce = self.nonce_manager.next_nonce().await;
            let tx = self.build_tx(to, data.clone(), Some(nonce), Some(gas_limit), Some(gas_price));

            let signature = self
                .wallet
                .sign_transaction(&tx)
                .await
                .map_err(|e| SwapError::Wallet(e.to_string()))?;
            let local_hash = tx.hash(&signature);
            let raw = tx.rlp_signed(&signature);

            let sent = timeout(send_timeout, self.provider.send_raw_transaction(raw))
                .await
                .ok();
            match disposition(sent, local_hash) {
                Disposition::Sent(tx_hash) => {
                    info!(
                        "{} sent on chain {}: {:?} (attempt {}/{})",
                        operation, side, tx_hash, attempt, max_attempts
                    );
                    self.nonce_manager.mark_pending(nonce, tx_hash).await;
                    return Ok((tx_hash, nonce));
                }
                Disposition::MaybeSent(tx_hash) => {
                    warn!(
                        "{} on chain {} may already be pending as {:?}, waiting for it",
                        operation, side, tx_hash
                    );
                    self.nonce_manager.mark_pending(nonce, tx_hash).await;
                    return Ok((tx_hash, nonce));
                }
                Disposition::Resync(e) => {
                    warn!("Nonce rejected on chain {} ({}), syncing", side, e);
                    self.nonce_manager.sync(&self.provider).await?;
                    last_error = Some(e);
                }
                Disposition::Retry(e) => {
                    self.nonce_manager.release(nonce).await;
                    last_error = Some(e);
                }
                Disposition::Fail(e) => {
                    self.nonce_manager.release(nonce).await;
                    return Err(e);
                }
            }

            if attempt < max_attempts {
                tokio::time::sleep(Duration::from_millis(self.config.retry_delay_ms)).await;
            }
        }

        Err(last_error.unwrap_or_else(|| SwapError::ChainCallFailed {
            chain: side,
            operation: operation.to_string(),
            reason: "no attempt made".to_string(),
        }))
    }

    /// Poll until the receipt has the chain's configured confirmations
    async fn wait_for_receipt(
        &self,
        tx_hash: TxHash,
        nonce: u64,
        operation: &str,
    ) -> SwapResult<TransactionReceipt> {
        let deadline = Instant::now() + Duration::from_secs(self.config.receipt_timeout_secs);
        let poll = Duration::from_millis(self.config.poll_interval_ms);
        let confirmations = self.provider.confirmation_blocks().max(1);

        loop {
            if let Some(receipt) = self.provider.get_transaction_receipt(tx_hash).await? {
                if let Some(mined_at) = receipt.block_number {
                    let head = self.provider.get_block_number().await?;
                    let depth = head.saturating_sub(mined_at.as_u64()) + 1;
                    if depth >= confirmations {
                        return Ok(receipt);
                    }
                    debug!(
                        "{:?} has {}/{} confirmations on chain {}",
                        tx_hash,
                        depth,
                        confirmations,
                        self.provider.side()
                    );
                }
            }

            if Instant::now() >= deadline {
                if let Err(e) = self.nonce_manager.forget_unseen(&self.provider, nonce).await {
                    warn!("Nonce check after receipt timeout failed on chain {}: {}", self.provider.side(), e);
                }
                return Err(SwapError::Timeout {
                    operation: format!(
                        "{} receipt {:?} on chain {}",
                        operation,
                        tx_hash,
                        self.provider.side()
                    ),
                });
            }
            tokio::time::sleep(poll).await;
        }
    }
}

/// What a single broadcast attempt means for the write
#[derive(Debug, PartialEq)]
enum Disposition {
    /// Accepted by the node
    Sent(TxHash),
    /// Timed out or already in the node's pool; treated as submitted
    MaybeSent(TxHash),
    /// Nonce rejected; nothing was broadcast
    Resync(SwapError),
    /// Rejected before broadcast, safe to resend
    Retry(SwapError),
    Fail(SwapError),
}

/// Classify a send result; `None` means the call timed out
fn disposition(sent: Option<SwapResult<TxHash>>, local_hash: TxHash) -> Disposition {
    match sent {
        Some(Ok(tx_hash)) => Disposition::Sent(tx_hash),
        None | Some(Err(SwapError::AlreadyKnown { .. })) => Disposition::MaybeSent(local_hash),
        Some(Err(e @ SwapError::Nonce { .. })) => Disposition::Resync(e),
        Some(Err(e @ SwapError::RateLimited { .. })) => Disposition::Retry(e),
        Some(Err(e)) => Disposition::Fail(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::swap::ChainSide;

    #[test]
    fn test_uncertain_send_is_never_resent() {
        let local = TxHash::repeat_byte(0x0a);
        assert_eq!(disposition(None, local), Disposition::MaybeSent(local));
        assert_eq!(
            disposition(Some(Err(SwapError::AlreadyKnown { chain: ChainSide::A })), local),
            Disposition::MaybeSent(local)
        );
        assert_eq!(
            disposition(Some(Ok(TxHash::repeat_byte(0x0b))), local),
            Disposition::Sent(TxHash::repeat_byte(0x0b))
        );
    }

    #[test]
    fn test_only_provable_rejections_are_retried() {
        let local = TxHash::zero();
        let nonce = SwapError::Nonce {
            chain: ChainSide::B,
            message: "nonce too low".into(),
        };
        assert_eq!(disposition(Some(Err(nonce.clone())), local), Disposition::Resync(nonce));

        let limited = SwapError::RateLimited { chain: ChainSide::B };
        assert_eq!(disposition(Some(Err(limited.clone())), local), Disposition::Retry(limited));

        // Ambiguous failures go back to the agent, which reconciles first
        let dropped = SwapError::ChainConnection {
            chain: ChainSide::B,
            message: "connection reset".into(),
        };
        assert_eq!(disposition(Some(Err(dropped.clone())), local), Disposition::Fail(dropped));
    }
}
