//! HTLC escrow adapter over raw ABI calls

use super::abi::{self, bytes32, take_address, take_bytes32, take_u64, take_uint};
use super::{ChainProvider, EscrowLedger, InitiateRequest};
use crate::error::{SwapError, SwapResult};
use crate::events::{topics, EscrowEvent, EventParser};
use crate::swap::{ChainSide, HashedSecret, Leg, LegPhase, Secret, SwapId};
use crate::tx::TransactionSender;

use async_trait::async_trait;
use ethers::abi::{ParamType, Token};
use ethers::types::{Address, Filter, TxHash, U256};
use std::sync::Arc;
use tracing::{debug, warn};

/// Return layout of `swaps(bytes32)`
fn swap_record_types() -> Vec<ParamType> {
    vec![
        ParamType::Address,       // initiator
        ParamType::Address,       // recipient
        ParamType::Address,       // token
        ParamType::Uint(256),     // amount
        ParamType::FixedBytes(32), // hashedSecret
        ParamType::Uint(256),     // timelock
        ParamType::Uint(8),       // phase
    ]
}

impl Leg {
    /// Decode and validate a `swaps(swapId)` record
    pub fn from_record(swap_id: SwapId, chain: ChainSide, tokens: &[Token]) -> SwapResult<Leg> {
        if tokens.len() != 7 {
            return Err(SwapError::InvalidRecord {
                kind: "leg",
                message: format!("expected 7 fields, got {}", tokens.len()),
            });
        }
        let phase = take_u64(&tokens[6], "phase")?;
        let phase = u8::try_from(phase)
            .map_err(|_| SwapError::InvalidRecord {
                kind: "leg",
                message: format!("phase {} out of range", phase),
            })
            .and_then(LegPhase::from_u8)?;

        let leg = Leg {
            swap_id,
            chain,
            initiator: take_address(&tokens[0], "initiator")?,
            recipient: take_address(&tokens[1], "recipient")?,
            token: take_address(&tokens[2], "token")?,
            amount: take_uint(&tokens[3], "amount")?,
            hashed_secret: HashedSecret(take_bytes32(&tokens[4], "hashedSecret")?),
            timelock: take_u64(&tokens[5], "timelock")?,
            phase,
        };
        leg.validate()?;
        Ok(leg)
    }
}

/// Escrow contract on one chain
pub struct EvmEscrow {
    provider: Arc<ChainProvider>,
    sender: Arc<TransactionSender>,
    address: Address,
    parser: EventParser,
    log_chunk_blocks: u64,
}

impl EvmEscrow {
    pub fn new(
        provider: Arc<ChainProvider>,
        sender: Arc<TransactionSender>,
        address: Address,
        log_chunk_blocks: u64,
    ) -> Self {
        let parser = EventParser::new(provider.side(), address);
        Self {
            provider,
            sender,
            address,
            parser,
            log_chunk_blocks,
        }
    }

    async fn write(&self, data: ethers::types::Bytes, operation: &str) -> SwapResult<TxHash> {
        let receipt = self.sender.send_call(self.address, data, operation).await?;
        Ok(receipt.transaction_hash)
    }
}

#[async_trait]
impl EscrowLedger for EvmEscrow {
    fn chain(&self) -> ChainSide {
        self.provider.side()
    }

    async fn chain_time(&self) -> SwapResult<u64> {
        self.provider.latest_timestamp().await
    }

    async fn swap_record(&self, swap_id: SwapId) -> SwapResult<Option<Leg>> {
        let data = abi::encode_call(abi::escrow::SWAPS, &[bytes32(swap_id.as_bytes())]);
        let output = self.provider.call(self.address, data).await?;
        let tokens = abi::decode(&swap_record_types(), &output).map_err(|e| {
            SwapError::InvalidRecord {
                kind: "leg",
                message: e.to_string(),
            }
        })?;

        // Unknown swap ids read back as an all-zero record
        let leg = Leg::from_record(swap_id, self.chain(), &tokens)?;
        if leg.phase == LegPhase::Absent {
            return Ok(None);
        }
        Ok(Some(leg))
    }

    async fn scan_swap_events(
        &self,
        swap_id: SwapId,
        lookback_blocks: u64,
    ) -> SwapResult<Vec<EscrowEvent>> {
        let head = self.provider.get_block_number().await?;
        let from = head.saturating_sub(lookback_blocks);
        let filter = Filter::new()
            .address(self.address)
            .topic0(vec![
                *topics::SWAP_INITIATED,
                *topics::SWAP_CLAIMED,
                *topics::SWAP_REFUNDED,
            ])
            .topic1(swap_id.as_h256());

        let logs = self
            .provider
            .scan_logs(&filter, from, head, self.log_chunk_blocks)
            .await?;

        let mut events = Vec::new();
        for log in &logs {
            match self.parser.parse_escrow_log(log) {
                Ok(Some(event)) => events.push(event),
                Ok(None) => {}
                Err(e) => warn!(
                    "Skipping malformed escrow log {:?} on chain {}: {}",
                    log.transaction_hash,
                    self.chain(),
                    e
                ),
            }
        }
        events.sort_by_key(|e| e.block_number());
        debug!(
            "Swap {}: {} escrow events on chain {} in blocks {}..={}",
            swap_id,
            events.len(),
            self.chain(),
            from,
            head
        );
        Ok(events)
    }

    async fn approve(&self, token: Address, amount: U256) -> SwapResult<TxHash> {
        let data = abi::encode_call(
            abi::erc20::APPROVE,
            &[Token::Address(self.address), Token::Uint(amount)],
        );
        let receipt = self.sender.send_call(token, data, "approve").await?;
        Ok(receipt.transaction_hash)
    }

    async fn initiate(&self, request: InitiateRequest) -> SwapResult<TxHash> {
        let data = abi::encode_call(
            abi::escrow::INITIATE,
            &[
                bytes32(request.swap_id.as_bytes()),
                Token::Address(request.recipient),
                Token::Address(request.token),
                Token::Uint(request.amount),
                bytes32(&request.hashed_secret.0),
                Token::Uint(U256::from(request.timelock)),
            ],
        );
        self.write(data, "initiate").await
    }

    async fn claim(&self, swap_id: SwapId, secret: Secret) -> SwapResult<TxHash> {
        let data = abi::encode_call(
            abi::escrow::CLAIM,
            &[bytes32(swap_id.as_bytes()), bytes32(secret.as_bytes())],
        );
        self.write(data, "claim").await
    }

    async fn refund(&self, swap_id: SwapId) -> SwapResult<TxHash> {
        let data = abi::encode_call(abi::escrow::REFUND, &[bytes32(swap_id.as_bytes())]);
        self.write(data, "refund").await
    }
}
