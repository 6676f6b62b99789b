//! Contract event types and parsing
//!
//! Defines the events emitted by the HTLC escrow (on both chains) and by the
//! auction contract (chain A), and decodes raw logs into them.

use crate::chain::abi::{self, take_address, take_bytes32, take_u64, take_uint, topic_address};
use crate::error::{SwapError, SwapResult};
use crate::swap::{ChainSide, HashedSecret, Secret, SwapId};

use ethers::abi::ParamType;
use ethers::types::{Address, Log, H256, U256};

/// Events emitted by the escrow contract
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EscrowEvent {
    /// Funds locked under a hashlock
    Initiated {
        chain: ChainSide,
        swap_id: SwapId,
        initiator: Address,
        recipient: Address,
        hashed_secret: HashedSecret,
        timelock: u64,
        block_number: u64,
        tx_hash: H256,
    },

    /// Funds released to the recipient; reveals the secret
    Claimed {
        chain: ChainSide,
        swap_id: SwapId,
        secret: Secret,
        block_number: u64,
        tx_hash: H256,
    },

    /// Funds returned to the initiator after the timelock
    Refunded {
        chain: ChainSide,
        swap_id: SwapId,
        block_number: u64,
        tx_hash: H256,
    },
}

impl EscrowEvent {
    pub fn swap_id(&self) -> SwapId {
        match self {
            EscrowEvent::Initiated { swap_id, .. } => *swap_id,
            EscrowEvent::Claimed { swap_id, .. } => *swap_id,
            EscrowEvent::Refunded { swap_id, .. } => *swap_id,
        }
    }

    pub fn chain(&self) -> ChainSide {
        match self {
            EscrowEvent::Initiated { chain, .. } => *chain,
            EscrowEvent::Claimed { chain, .. } => *chain,
            EscrowEvent::Refunded { chain, .. } => *chain,
        }
    }

    pub fn block_number(&self) -> u64 {
        match self {
            EscrowEvent::Initiated { block_number, .. } => *block_number,
            EscrowEvent::Claimed { block_number, .. } => *block_number,
            EscrowEvent::Refunded { block_number, .. } => *block_number,
        }
    }

    /// Get event name for metrics
    pub fn name(&self) -> &'static str {
        match self {
            EscrowEvent::Initiated { .. } => "swap_initiated",
            EscrowEvent::Claimed { .. } => "swap_claimed",
            EscrowEvent::Refunded { .. } => "swap_refunded",
        }
    }
}

/// Events emitted by the auction contract
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuctionEvent {
    Created {
        auction_id: u64,
        maker: Address,
        token_a: Address,
        amount_a: U256,
        token_b: Address,
        min_amount_b: U256,
        end_time: u64,
    },

    /// Absent when the auction closed without bids
    Ended {
        auction_id: u64,
        maker: Address,
        taker: Address,
        token_a: Address,
        amount_a: U256,
        token_b: Address,
        amount_b: U256,
    },
}

impl AuctionEvent {
    pub fn auction_id(&self) -> u64 {
        match self {
            AuctionEvent::Created { auction_id, .. } => *auction_id,
            AuctionEvent::Ended { auction_id, .. } => *auction_id,
        }
    }
}

/// Event topic signatures (keccak256 of event signature)
pub mod topics {
    use crate::chain::abi::{self, event_topic};
    use ethers::types::H256;
    use lazy_static::lazy_static;

    lazy_static! {
        pub static ref SWAP_INITIATED: H256 = event_topic(abi::escrow::SWAP_INITIATED);
        pub static ref SWAP_CLAIMED: H256 = event_topic(abi::escrow::SWAP_CLAIMED);
        pub static ref SWAP_REFUNDED: H256 = event_topic(abi::escrow::SWAP_REFUNDED);
        pub static ref AUCTION_CREATED: H256 = event_topic(abi::auction::AUCTION_CREATED);
        pub static ref AUCTION_ENDED: H256 = event_topic(abi::auction::AUCTION_ENDED);
    }
}

/// Log decoder for one escrow or auction contract
pub struct EventParser {
    chain: ChainSide,
    contract_address: Address,
}

impl EventParser {
    pub fn new(chain: ChainSide, contract_address: Address) -> Self {
        Self {
            chain,
            contract_address,
        }
    }

    /// Decode an escrow log; logs from other contracts or with unknown topics yield `None`
    pub fn parse_escrow_log(&self, log: &Log) -> SwapResult<Option<EscrowEvent>> {
        if log.address != self.contract_address {
            return Ok(None);
        }
        let Some(topic) = log.topics.first() else {
            return Ok(None);
        };

        let block_number = log.block_number.map(|b| b.as_u64()).unwrap_or(0);
        let tx_hash = log.transaction_hash.unwrap_or_default();
        let swap_id = || -> SwapResult<SwapId> {
            log.topics
                .get(1)
                .map(|t| SwapId::from(*t))
                .ok_or_else(|| missing_topic("swapId"))
        };

        if *topic == *topics::SWAP_INITIATED {
            let initiator = log.topics.get(2).map(topic_address).ok_or_else(|| missing_topic("initiator"))?;
            let recipient = log.topics.get(3).map(topic_address).ok_or_else(|| missing_topic("recipient"))?;
            let data = abi::decode(&[ParamType::FixedBytes(32), ParamType::Uint(256)], &log.data)?;
            Ok(Some(EscrowEvent::Initiated {
                chain: self.chain,
                swap_id: swap_id()?,
                initiator,
                recipient,
                hashed_secret: HashedSecret(take_bytes32(&data[0], "hashedSecret")?),
                timelock: take_u64(&data[1], "timelock")?,
                block_number,
                tx_hash,
            }))
        } else if *topic == *topics::SWAP_CLAIMED {
            let data = abi::decode(&[ParamType::FixedBytes(32)], &log.data)?;
            Ok(Some(EscrowEvent::Claimed {
                chain: self.chain,
                swap_id: swap_id()?,
                secret: Secret::from_bytes(take_bytes32(&data[0], "secret")?),
                block_number,
                tx_hash,
            }))
        } else if *topic == *topics::SWAP_REFUNDED {
            Ok(Some(EscrowEvent::Refunded {
                chain: self.chain,
                swap_id: swap_id()?,
                block_number,
                tx_hash,
            }))
        } else {
            Ok(None)
        }
    }

    /// Decode an auction log; unknown topics yield `None`
    pub fn parse_auction_log(&self, log: &Log) -> SwapResult<Option<AuctionEvent>> {
        if log.address != self.contract_address {
            return Ok(None);
        }
        let Some(topic) = log.topics.first() else {
            return Ok(None);
        };
        let auction_id = || -> SwapResult<u64> {
            log.topics
                .get(1)
                .ok_or_else(|| missing_topic("auctionId"))
                .and_then(|t| abi::topic_u64(t, "auctionId"))
        };

        if *topic == *topics::AUCTION_CREATED {
            let maker = log.topics.get(2).map(topic_address).ok_or_else(|| missing_topic("maker"))?;
            let data = abi::decode(
                &[
                    ParamType::Address,
                    ParamType::Uint(256),
                    ParamType::Address,
                    ParamType::Uint(256),
                    ParamType::Uint(256),
                ],
                &log.data,
            )?;
            Ok(Some(AuctionEvent::Created {
                auction_id: auction_id()?,
                maker,
                token_a: take_address(&data[0], "tokenA")?,
                amount_a: take_uint(&data[1], "amountA")?,
                token_b: take_address(&data[2], "tokenB")?,
                min_amount_b: take_uint(&data[3], "minAmountB")?,
                end_time: take_u64(&data[4], "endTime")?,
            }))
        } else if *topic == *topics::AUCTION_ENDED {
            let maker = log.topics.get(2).map(topic_address).ok_or_else(|| missing_topic("maker"))?;
            let taker = log.topics.get(3).map(topic_address).ok_or_else(|| missing_topic("taker"))?;
            let data = abi::decode(
                &[
                    ParamType::Address,
                    ParamType::Uint(256),
                    ParamType::Address,
                    ParamType::Uint(256),
                ],
                &log.data,
            )?;
            Ok(Some(AuctionEvent::Ended {
                auction_id: auction_id()?,
                maker,
                taker,
                token_a: take_address(&data[0], "tokenA")?,
                amount_a: take_uint(&data[1], "amountA")?,
                token_b: take_address(&data[2], "tokenB")?,
                amount_b: take_uint(&data[3], "amountB")?,
            }))
        } else {
            Ok(None)
        }
    }
}

fn missing_topic(field: &str) -> SwapError {
    SwapError::EventParsing(format!("missing indexed topic {}", field))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethers::abi::{encode, Token};
    use ethers::types::{Bytes, U64};

    fn escrow_address() -> Address {
        Address::repeat_byte(0xee)
    }

    fn log(topics: Vec<H256>, data: Vec<u8>) -> Log {
        Log {
            address: escrow_address(),
            topics,
            data: Bytes::from(data),
            block_number: Some(U64::from(42)),
            transaction_hash: Some(H256::repeat_byte(0x01)),
            ..Default::default()
        }
    }

    #[test]
    fn test_parse_swap_initiated() {
        let parser = EventParser::new(ChainSide::A, escrow_address());
        let swap_id = SwapId::from_auction_id(5);
        let initiator = Address::repeat_byte(0x11);
        let recipient = Address::repeat_byte(0x22);
        let data = encode(&[Token::FixedBytes(vec![0x33; 32]), Token::Uint(U256::from(9_999))]);

        let event = parser
            .parse_escrow_log(&log(
                vec![
                    *topics::SWAP_INITIATED,
                    swap_id.as_h256(),
                    H256::from(initiator),
                    H256::from(recipient),
                ],
                data,
            ))
            .unwrap()
            .unwrap();

        assert_eq!(
            event,
            EscrowEvent::Initiated {
                chain: ChainSide::A,
                swap_id,
                initiator,
                recipient,
                hashed_secret: HashedSecret([0x33; 32]),
                timelock: 9_999,
                block_number: 42,
                tx_hash: H256::repeat_byte(0x01),
            }
        );
    }

    #[test]
    fn test_parse_swap_claimed_carries_secret() {
        let parser = EventParser::new(ChainSide::B, escrow_address());
        let swap_id = SwapId::from_auction_id(6);
        let data = encode(&[Token::FixedBytes(vec![0x44; 32])]);

        let event = parser
            .parse_escrow_log(&log(vec![*topics::SWAP_CLAIMED, swap_id.as_h256()], data))
            .unwrap()
            .unwrap();

        match event {
            EscrowEvent::Claimed { secret, chain, .. } => {
                assert_eq!(secret.as_bytes(), &[0x44; 32]);
                assert_eq!(chain, ChainSide::B);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_unknown_topic_and_foreign_contract_are_skipped() {
        let parser = EventParser::new(ChainSide::A, escrow_address());
        let unknown = log(vec![H256::repeat_byte(0x99)], vec![]);
        assert!(parser.parse_escrow_log(&unknown).unwrap().is_none());

        let mut foreign = log(vec![*topics::SWAP_REFUNDED, H256::zero()], vec![]);
        foreign.address = Address::repeat_byte(0x01);
        assert!(parser.parse_escrow_log(&foreign).unwrap().is_none());
    }

    #[test]
    fn test_truncated_data_is_an_error() {
        let parser = EventParser::new(ChainSide::A, escrow_address());
        let swap_id = SwapId::from_auction_id(1);
        let bad = log(
            vec![
                *topics::SWAP_INITIATED,
                swap_id.as_h256(),
                H256::zero(),
                H256::zero(),
            ],
            vec![0u8; 16],
        );
        assert!(matches!(
            parser.parse_escrow_log(&bad),
            Err(SwapError::EventParsing(_))
        ));
    }

    #[test]
    fn test_parse_auction_ended() {
        let house = Address::repeat_byte(0xab);
        let parser = EventParser::new(ChainSide::A, house);
        let maker = Address::repeat_byte(0x11);
        let taker = Address::repeat_byte(0x22);
        let data = encode(&[
            Token::Address(Address::repeat_byte(0xaa)),
            Token::Uint(U256::from(1)),
            Token::Address(Address::repeat_byte(0xbb)),
            Token::Uint(U256::from(2)),
        ]);
        let mut raw = log(
            vec![
                *topics::AUCTION_ENDED,
                H256::from_low_u64_be(3),
                H256::from(maker),
                H256::from(taker),
            ],
            data,
        );
        raw.address = house;

        let event = parser.parse_auction_log(&raw).unwrap().unwrap();
        assert_eq!(event.auction_id(), 3);
        assert!(matches!(event, AuctionEvent::Ended { amount_b, .. } if amount_b == U256::from(2)));
    }
}
