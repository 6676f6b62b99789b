//! Gas estimation with safety buffers

use crate::chain::{ChainProvider, GasPrice};
use crate::error::{SwapError, SwapResult};

use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::U256;
use tracing::debug;

/// Gas estimator for escrow and auction calls
pub struct GasEstimator {
    /// Buffer percentage for gas limit (e.g., 20 = 20% buffer)
    gas_limit_buffer_percent: u64,
    /// Buffer percentage for gas price
    gas_price_buffer_percent: u64,
}

impl GasEstimator {
    pub fn new() -> Self {
        Self {
            gas_limit_buffer_percent: 20,
            gas_price_buffer_percent: 10,
        }
    }

    /// Node estimate plus buffer.
    ///
    /// A failed estimate almost always means the call would revert, so it is
    /// reported as a failed call for `operation` carrying the node's reason.
    pub async fn estimate_limit(
        &self,
        provider: &ChainProvider,
        tx: &TypedTransaction,
        operation: &str,
    ) -> SwapResult<U256> {
        let estimate = provider.estimate_gas(tx).await.map_err(|e| match e {
            SwapError::GasEstimation(reason) => SwapError::ChainCallFailed {
                chain: provider.side(),
                operation: operation.to_string(),
                reason,
            },
            other => other,
        })?;
        Ok(self.buffer_limit(estimate))
    }

    pub fn buffer_limit(&self, estimate: U256) -> U256 {
        estimate + estimate * self.gas_limit_buffer_percent / 100
    }

    /// Chain gas price with buffer
    pub async fn get_gas_price(&self, provider: &ChainProvider) -> SwapResult<GasPrice> {
        let buffered = self.buffer_price(provider.get_gas_price().await?);
        debug!("Gas price for chain {}: {:?}", provider.side(), buffered);
        Ok(buffered)
    }

    pub fn buffer_price(&self, gas_price: GasPrice) -> GasPrice {
        match gas_price {
            GasPrice::Legacy(price) => {
                GasPrice::Legacy(price + price * self.gas_price_buffer_percent / 100)
            }
            GasPrice::Eip1559 {
                max_fee_per_gas,
                max_priority_fee_per_gas,
            } => GasPrice::Eip1559 {
                max_fee_per_gas: max_fee_per_gas + max_fee_per_gas * self.gas_price_buffer_percent / 100,
                max_priority_fee_per_gas: max_priority_fee_per_gas
                    + max_priority_fee_per_gas * self.gas_price_buffer_percent / 100,
            },
        }
    }

    /// Worst-case cost in wei
    pub fn calculate_cost(gas_limit: U256, gas_price: &GasPrice) -> U256 {
        match gas_price {
            GasPrice::Legacy(price) => gas_limit * *price,
            GasPrice::Eip1559 { max_fee_per_gas, .. } => gas_limit * *max_fee_per_gas,
        }
    }
}

impl Default for GasEstimator {
    fn default() -> Self {
        Self::new()
    }
}
