//! RPC access for one swap chain, rotating across endpoints on failure

use crate::config::{ChainConfig, GasPriceStrategy};
use crate::error::{SwapError, SwapResult};
use crate::swap::ChainSide;

use ethers::providers::{Http, Middleware, Provider};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{
    Address, BlockNumber, Bytes, Filter, Log, TransactionReceipt, TransactionRequest, TxHash, U256,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, error, warn};

/// JSON-RPC client for a single chain with endpoint rotation
pub struct ChainProvider {
    /// Which side of the swap this chain serves
    side: ChainSide,
    /// Endpoint, contract and gas settings
    config: ChainConfig,
    /// One client per configured RPC url
    http_providers: Vec<Provider<Http>>,
    /// Index into `http_providers` used for the next call
    current_provider: AtomicUsize,
    /// Highest block number seen so far
    last_block: RwLock<u64>,
}

impl ChainProvider {
    /// Connect every configured endpoint, failing if none parse
    pub async fn new(side: ChainSide, config: ChainConfig) -> SwapResult<Self> {
        let mut http_providers = Vec::new();

        for url in &config.rpc_urls {
            match Provider::<Http>::try_from(url.as_str()) {
                Ok(provider) => {
                    let provider = provider.interval(Duration::from_millis(100));
                    http_providers.push(provider);
                    debug!("Added HTTP provider for chain {}: {}", side, url);
                }
                Err(e) => {
                    warn!("Failed to create provider for {}: {}", url, e);
                }
            }
        }

        if http_providers.is_empty() {
            return Err(SwapError::ChainConnection {
                chain: side,
                message: "No valid RPC providers".to_string(),
            });
        }

        let initial_block = http_providers[0]
            .get_block_number()
            .await
            .map(|b| b.as_u64())
            .unwrap_or(0);

        Ok(Self {
            side,
            config,
            http_providers,
            current_provider: AtomicUsize::new(0),
            last_block: RwLock::new(initial_block),
        })
    }

    /// Client currently in rotation
    pub fn http(&self) -> &Provider<Http> {
        let idx = self.current_provider.load(Ordering::Relaxed);
        &self.http_providers[idx % self.http_providers.len()]
    }

    /// Rotate to the next endpoint
    pub fn failover(&self) {
        let current = self.current_provider.load(Ordering::Relaxed);
        let next = (current + 1) % self.http_providers.len();
        self.current_provider.store(next, Ordering::Relaxed);
        warn!("Chain {} failover to provider {}", self.side, next);
    }

    fn connection_error(&self, message: impl ToString) -> SwapError {
        SwapError::ChainConnection {
            chain: self.side,
            message: message.to_string(),
        }
    }

    /// Latest block number, trying each endpoint once
    pub async fn get_block_number(&self) -> SwapResult<u64> {
        for _ in 0..self.http_providers.len() {
            match self.http().get_block_number().await {
                Ok(block) => {
                    let block_num = block.as_u64();
                    *self.last_block.write().await = block_num;
                    return Ok(block_num);
                }
                Err(e) => {
                    warn!("Failed to get block number from chain {}: {}", self.side, e);
                    self.failover();
                }
            }
        }

        Err(self.connection_error("All providers failed"))
    }

    /// Timestamp of the latest block
    pub async fn latest_timestamp(&self) -> SwapResult<u64> {
        let block = self
            .http()
            .get_block(BlockNumber::Latest)
            .await
            .map_err(|e| self.connection_error(e))?
            .ok_or_else(|| self.connection_error("No latest block"))?;
        Ok(block.timestamp.as_u64())
    }

    /// Read-only contract call
    pub async fn call(&self, to: Address, data: Bytes) -> SwapResult<Bytes> {
        let tx: TypedTransaction = TransactionRequest::new().to(to).data(data).into();
        for _ in 0..self.http_providers.len() {
            match self.http().call(&tx, None).await {
                Ok(output) => return Ok(output),
                Err(e) => {
                    warn!("eth_call to {:?} failed on chain {}: {}", to, self.side, e);
                    self.failover();
                }
            }
        }
        Err(self.connection_error(format!("All providers failed eth_call to {:?}", to)))
    }

    /// Logs matching `filter`, trying each endpoint once
    pub async fn get_logs(&self, filter: &Filter) -> SwapResult<Vec<Log>> {
        for _ in 0..self.http_providers.len() {
            match self.http().get_logs(filter).await {
                Ok(logs) => return Ok(logs),
                Err(e) => {
                    warn!("Failed to get logs from chain {}: {}", self.side, e);
                    self.failover();
                }
            }
        }

        Err(self.connection_error("All providers failed to get logs"))
    }

    /// Logs in `[from_block, to_block]`, queried in chunks to keep RPC ranges small
    pub async fn scan_logs(
        &self,
        filter: &Filter,
        from_block: u64,
        to_block: u64,
        chunk: u64,
    ) -> SwapResult<Vec<Log>> {
        let mut logs = Vec::new();
        let mut start = from_block;
        while start <= to_block {
            let end = std::cmp::min(to_block, start.saturating_add(chunk.max(1) - 1));
            debug!("Chain {}: scanning blocks {} to {}", self.side, start, end);
            let ranged = filter.clone().from_block(start).to_block(end);
            logs.extend(self.get_logs(&ranged).await?);
            if end == u64::MAX {
                break;
            }
            start = end + 1;
        }
        Ok(logs)
    }

    /// Receipt for `tx_hash`, if mined
    pub async fn get_transaction_receipt(
        &self,
        tx_hash: TxHash,
    ) -> SwapResult<Option<TransactionReceipt>> {
        self.http()
            .get_transaction_receipt(tx_hash)
            .await
            .map_err(|e| self.connection_error(e))
    }

    /// Gas limit the node estimates for `tx`
    pub async fn estimate_gas(&self, tx: &TypedTransaction) -> SwapResult<U256> {
        self.http()
            .estimate_gas(tx, None)
            .await
            .map_err(|e| SwapError::GasEstimation(e.to_string()))
    }

    /// Pending-inclusive transaction count for `address`
    pub async fn get_transaction_count(&self, address: Address) -> SwapResult<u64> {
        self.http()
            .get_transaction_count(address, Some(BlockNumber::Pending.into()))
            .await
            .map(|n| n.as_u64())
            .map_err(|e| SwapError::Nonce {
                chain: self.side,
                message: e.to_string(),
            })
    }

    /// Fee parameters for the configured gas strategy
    pub async fn get_gas_price(&self) -> SwapResult<GasPrice> {
        match self.config.gas_price_strategy {
            GasPriceStrategy::Legacy => {
                let price = self
                    .http()
                    .get_gas_price()
                    .await
                    .map_err(|e| SwapError::GasEstimation(e.to_string()))?;
                Ok(GasPrice::Legacy(std::cmp::min(price, self.max_gas_price())))
            }
            GasPriceStrategy::Eip1559 => {
                let (max_fee, priority_fee) = self.estimate_eip1559_fees().await?;
                Ok(GasPrice::Eip1559 {
                    max_fee_per_gas: max_fee,
                    max_priority_fee_per_gas: priority_fee,
                })
            }
        }
    }

    /// Base fee of the latest block plus a fixed tip
    async fn estimate_eip1559_fees(&self) -> SwapResult<(U256, U256)> {
        let block = self
            .http()
            .get_block(BlockNumber::Latest)
            .await
            .map_err(|e| SwapError::GasEstimation(e.to_string()))?
            .ok_or_else(|| SwapError::GasEstimation("No latest block".to_string()))?;

        let base_fee = block
            .base_fee_per_gas
            .ok_or_else(|| SwapError::GasEstimation("No base fee in block".to_string()))?;

        let priority_fee = U256::from(2_000_000_000u64); // 2 gwei

        // Headroom for two full blocks of base fee growth
        let max_fee = base_fee * 2 + priority_fee;
        let max_fee = std::cmp::min(max_fee, self.max_gas_price());

        Ok((max_fee, std::cmp::min(priority_fee, max_fee)))
    }

    fn max_gas_price(&self) -> U256 {
        U256::from(self.config.max_gas_price_gwei) * U256::from(1_000_000_000u64)
    }

    /// Broadcast a signed transaction
    pub async fn send_raw_transaction(&self, raw: Bytes) -> SwapResult<TxHash> {
        self.http()
            .send_raw_transaction(raw)
            .await
            .map(|pending| pending.tx_hash())
            .map_err(|e| classify_send_error(self.side, e.to_string()))
    }

    /// True when some endpoint returns a block number
    pub async fn health_check(&self) -> bool {
        match self.get_block_number().await {
            Ok(_) => true,
            Err(e) => {
                error!("Health check failed for chain {}: {}", self.side, e);
                false
            }
        }
    }

    pub fn side(&self) -> ChainSide {
        self.side
    }

    pub fn chain_id(&self) -> u64 {
        self.config.chain_id
    }

    pub fn confirmation_blocks(&self) -> u64 {
        self.config.confirmation_blocks
    }
}

/// Map a node's send error onto the retry taxonomy
pub fn classify_send_error(side: ChainSide, message: String) -> SwapError {
    let lower = message.to_lowercase();
    if lower.contains("already known") || lower.contains("already imported") {
        SwapError::AlreadyKnown { chain: side }
    } else if lower.contains("nonce too low") {
        SwapError::Nonce {
            chain: side,
            message,
        }
    } else if lower.contains("insufficient funds") {
        SwapError::InsufficientBalance { chain: side }
    } else if lower.contains("rate limit") || lower.contains("429") {
        SwapError::RateLimited { chain: side }
    } else {
        SwapError::ChainCallFailed {
            chain: side,
            operation: "send transaction".to_string(),
            reason: message,
        }
    }
}

/// Gas price types
#[derive(Debug, Clone)]
pub enum GasPrice {
    Legacy(U256),
    Eip1559 {
        max_fee_per_gas: U256,
        max_priority_fee_per_gas: U256,
    },
}
