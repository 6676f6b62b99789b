//! English auction adapter on chain A

use super::abi::{self, take_address, take_bool, take_u64, take_uint};
use super::{AuctionLedger, ChainProvider, CreateAuctionRequest};
use crate::error::{SwapError, SwapResult};
use crate::events::{AuctionEvent, EventParser};
use crate::swap::{Auction, ChainSide};
use crate::tx::TransactionSender;

use async_trait::async_trait;
use ethers::abi::{ParamType, Token};
use ethers::types::{Address, TransactionReceipt, TxHash, U256};
use std::sync::Arc;
use tracing::info;

fn auction_record_types() -> Vec<ParamType> {
    vec![
        ParamType::Address,   // maker
        ParamType::Address,   // tokenA
        ParamType::Uint(256), // amountA
        ParamType::Address,   // tokenB
        ParamType::Uint(256), // minAmountB
        ParamType::Uint(256), // endTime
        ParamType::Address,   // highestBidder
        ParamType::Uint(256), // highestBid
        ParamType::Bool,      // ended
    ]
}

impl Auction {
    /// Decode an `auctions(id)` record; `None` for ids never created
    pub fn from_record(id: u64, tokens: &[Token]) -> SwapResult<Option<Auction>> {
        if tokens.len() != 9 {
            return Err(SwapError::InvalidRecord {
                kind: "auction",
                message: format!("expected 9 fields, got {}", tokens.len()),
            });
        }
        let maker = take_address(&tokens[0], "maker")?;
        if maker.is_zero() {
            return Ok(None);
        }
        let auction = Auction {
            id,
            maker,
            token_a: take_address(&tokens[1], "tokenA")?,
            amount_a: take_uint(&tokens[2], "amountA")?,
            token_b: take_address(&tokens[3], "tokenB")?,
            min_amount_b: take_uint(&tokens[4], "minAmountB")?,
            end_time: take_u64(&tokens[5], "endTime")?,
            highest_bidder: take_address(&tokens[6], "highestBidder")?,
            highest_bid: take_uint(&tokens[7], "highestBid")?,
            ended: take_bool(&tokens[8], "ended")?,
        };
        auction.validate()?;
        Ok(Some(auction))
    }
}

/// Auction contract on chain A
pub struct EvmAuctionHouse {
    provider: Arc<ChainProvider>,
    sender: Arc<TransactionSender>,
    address: Address,
    parser: EventParser,
}

impl EvmAuctionHouse {
    pub fn new(provider: Arc<ChainProvider>, sender: Arc<TransactionSender>, address: Address) -> Self {
        Self {
            provider,
            sender,
            address,
            parser: EventParser::new(ChainSide::A, address),
        }
    }

    fn events_in(&self, receipt: &TransactionReceipt) -> SwapResult<Vec<AuctionEvent>> {
        let mut events = Vec::new();
        for log in &receipt.logs {
            if let Some(event) = self.parser.parse_auction_log(log)? {
                events.push(event);
            }
        }
        Ok(events)
    }
}

#[async_trait]
impl AuctionLedger for EvmAuctionHouse {
    async fn auction(&self, auction_id: u64) -> SwapResult<Option<Auction>> {
        let data = abi::encode_call(abi::auction::AUCTIONS, &[Token::Uint(U256::from(auction_id))]);
        let output = self.provider.call(self.address, data).await?;
        let tokens = abi::decode(&auction_record_types(), &output).map_err(|e| {
            SwapError::InvalidRecord {
                kind: "auction",
                message: e.to_string(),
            }
        })?;
        Auction::from_record(auction_id, &tokens)
    }

    async fn auction_count(&self) -> SwapResult<u64> {
        let data = abi::encode_call(abi::auction::AUCTION_COUNTER, &[]);
        let output = self.provider.call(self.address, data).await?;
        let tokens = abi::decode(&[ParamType::Uint(256)], &output)?;
        take_u64(&tokens[0], "auctionCounter")
    }

    async fn create_auction(&self, request: CreateAuctionRequest) -> SwapResult<u64> {
        let data = abi::encode_call(
            abi::auction::CREATE_AUCTION,
            &[
                Token::Address(request.token_a),
                Token::Uint(request.amount_a),
                Token::Address(request.token_b),
                Token::Uint(request.min_amount_b),
                Token::Uint(U256::from(request.duration_secs)),
            ],
        );
        let receipt = self.sender.send_call(self.address, data, "createAuction").await?;

        self.events_in(&receipt)?
            .into_iter()
            .find_map(|event| match event {
                AuctionEvent::Created { auction_id, end_time, .. } => {
                    info!("Auction {} created, ends at {}", auction_id, end_time);
                    Some(auction_id)
                }
                _ => None,
            })
            .ok_or_else(|| {
                SwapError::EventParsing(format!(
                    "no AuctionCreated event in {:?}",
                    receipt.transaction_hash
                ))
            })
    }

    async fn bid(&self, auction_id: u64, amount_b: U256) -> SwapResult<TxHash> {
        let data = abi::encode_call(
            abi::auction::BID,
            &[Token::Uint(U256::from(auction_id)), Token::Uint(amount_b)],
        );
        let receipt = self.sender.send_call(self.address, data, "bid").await?;
        Ok(receipt.transaction_hash)
    }

    async fn end_auction(&self, auction_id: u64) -> SwapResult<Option<AuctionEvent>> {
        let data = abi::encode_call(abi::auction::END_AUCTION, &[Token::Uint(U256::from(auction_id))]);
        let receipt = self.sender.send_call(self.address, data, "endAuction").await?;

        Ok(self
            .events_in(&receipt)?
            .into_iter()
            .find(|event| matches!(event, AuctionEvent::Ended { .. }) && event.auction_id() == auction_id))
    }
}
