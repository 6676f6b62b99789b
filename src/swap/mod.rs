//! Swap protocol core
//!
//! This module provides:
//! - Strongly typed auction, leg and swap context records
//! - Auction result resolution and role assignment
//! - Secret generation and verification
//! - Timelock ordering policy
//! - Chain state reconciliation from direct lookups and bounded log scans

pub mod reconcile;
pub mod resolver;
pub mod secret;
pub mod timelock;

pub use reconcile::{reconcile_legs, LegObservation, LegView, Reconciler, SwapSnapshot};
pub use resolver::{resolve, resolve_for, resolve_role, swap_id_for};
pub use secret::{HashedSecret, Secret, SecretManager, SecretStore};
pub use timelock::TimelockPolicy;

use crate::error::{SwapError, SwapResult};

use ethers::types::{Address, H256, U256};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Account identity on either chain
pub type Identity = Address;

/// One of the two ledgers involved in a swap
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChainSide {
    /// Maker's chain, also hosts the auction
    A,
    /// Taker's chain
    B,
}

impl ChainSide {
    pub fn label(self) -> &'static str {
        match self {
            ChainSide::A => "a",
            ChainSide::B => "b",
        }
    }

    pub fn other(self) -> Self {
        match self {
            ChainSide::A => ChainSide::B,
            ChainSide::B => ChainSide::A,
        }
    }
}

impl fmt::Display for ChainSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChainSide::A => write!(f, "A"),
            ChainSide::B => write!(f, "B"),
        }
    }
}

/// 32-byte swap identifier shared by both legs
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct SwapId(pub [u8; 32]);

impl SwapId {
    /// Auction id as a big-endian integer, left-padded to 32 bytes
    pub fn from_auction_id(auction_id: u64) -> Self {
        let mut bytes = [0u8; 32];
        bytes[24..].copy_from_slice(&auction_id.to_be_bytes());
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        format!("0x{}", hex::encode(self.0))
    }

    pub fn as_h256(&self) -> H256 {
        H256::from(self.0)
    }
}

impl fmt::Display for SwapId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for SwapId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SwapId({})", self.to_hex())
    }
}

impl From<H256> for SwapId {
    fn from(value: H256) -> Self {
        Self(value.0)
    }
}

/// Finalized or open English auction on chain A
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Auction {
    pub id: u64,
    pub maker: Identity,
    pub token_a: Address,
    pub amount_a: U256,
    pub token_b: Address,
    pub min_amount_b: U256,
    pub end_time: u64,
    pub highest_bidder: Identity,
    pub highest_bid: U256,
    pub ended: bool,
}

impl Auction {
    /// Boundary validation for records read from the auction ledger
    pub fn validate(&self) -> SwapResult<()> {
        let invalid = |message: &str| SwapError::InvalidRecord {
            kind: "auction",
            message: format!("auction {}: {}", self.id, message),
        };

        if self.id == 0 {
            return Err(invalid("id must be positive"));
        }
        if self.maker.is_zero() {
            return Err(invalid("maker is the zero address"));
        }
        if self.amount_a.is_zero() {
            return Err(invalid("amountA is zero"));
        }
        if !self.highest_bidder.is_zero() && self.highest_bid < self.min_amount_b {
            return Err(invalid("highest bid below minimum"));
        }
        Ok(())
    }

    pub fn has_winning_bid(&self) -> bool {
        !self.highest_bidder.is_zero()
    }
}

/// Phase of a single HTLC leg
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LegPhase {
    Absent,
    Initiated,
    Claimed,
    Refunded,
}

impl LegPhase {
    /// Decode the escrow's phase discriminant
    pub fn from_u8(value: u8) -> SwapResult<Self> {
        match value {
            0 => Ok(LegPhase::Absent),
            1 => Ok(LegPhase::Initiated),
            2 => Ok(LegPhase::Claimed),
            3 => Ok(LegPhase::Refunded),
            other => Err(SwapError::InvalidRecord {
                kind: "leg",
                message: format!("unknown phase {}", other),
            }),
        }
    }

    /// Absent < Initiated < Claimed/Refunded
    pub fn rank(self) -> u8 {
        match self {
            LegPhase::Absent => 0,
            LegPhase::Initiated => 1,
            LegPhase::Claimed | LegPhase::Refunded => 2,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, LegPhase::Claimed | LegPhase::Refunded)
    }
}

impl fmt::Display for LegPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LegPhase::Absent => "absent",
            LegPhase::Initiated => "initiated",
            LegPhase::Claimed => "claimed",
            LegPhase::Refunded => "refunded",
        };
        f.write_str(name)
    }
}

/// One side of the HTLC as recorded by an escrow
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Leg {
    pub swap_id: SwapId,
    pub chain: ChainSide,
    pub initiator: Identity,
    pub recipient: Identity,
    pub token: Address,
    pub amount: U256,
    pub hashed_secret: HashedSecret,
    pub timelock: u64,
    pub phase: LegPhase,
}

impl Leg {
    /// Boundary validation for records read from an escrow
    pub fn validate(&self) -> SwapResult<()> {
        if self.phase == LegPhase::Absent {
            return Ok(());
        }
        let invalid = |message: &str| SwapError::InvalidRecord {
            kind: "leg",
            message: format!("swap {} on chain {}: {}", self.swap_id, self.chain, message),
        };
        if self.initiator.is_zero() {
            return Err(invalid("initiator is the zero address"));
        }
        if self.recipient.is_zero() {
            return Err(invalid("recipient is the zero address"));
        }
        if self.amount.is_zero() {
            return Err(invalid("amount is zero"));
        }
        if self.timelock == 0 {
            return Err(invalid("timelock is zero"));
        }
        Ok(())
    }

    /// Whether this leg matches the terms derived from the auction
    pub fn matches_terms(&self, terms: &LegTerms) -> bool {
        self.chain == terms.chain
            && self.initiator == terms.sender
            && self.recipient == terms.recipient
            && self.token == terms.token
            && self.amount == terms.amount
    }
}

/// Economic terms of one leg as derived from an ended auction
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LegTerms {
    pub chain: ChainSide,
    /// Party that locks funds on this leg
    pub sender: Identity,
    pub recipient: Identity,
    pub token: Address,
    pub amount: U256,
}

/// Read-only projection of an ended auction into swap terms
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwapContext {
    pub auction_id: u64,
    pub swap_id: SwapId,
    pub maker: Identity,
    pub taker: Identity,
    pub leg_a: LegTerms,
    pub leg_b: LegTerms,
}

impl SwapContext {
    pub fn terms(&self, chain: ChainSide) -> &LegTerms {
        match chain {
            ChainSide::A => &self.leg_a,
            ChainSide::B => &self.leg_b,
        }
    }
}

/// Role of the local account in one auction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Maker,
    Taker,
    Observer,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Role::Maker => "maker",
            Role::Taker => "taker",
            Role::Observer => "observer",
        };
        f.write_str(name)
    }
}

/// Combined on-chain phase of both legs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SwapPhase {
    pub leg_a: LegPhase,
    pub leg_b: LegPhase,
}

impl SwapPhase {
    pub fn both_terminal(&self) -> bool {
        self.leg_a.is_terminal() && self.leg_b.is_terminal()
    }
}

impl fmt::Display for SwapPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "A:{} B:{}", self.leg_a, self.leg_b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_swap_id_left_pads_auction_id() {
        let id = SwapId::from_auction_id(1);
        assert_eq!(
            id.to_hex(),
            "0x0000000000000000000000000000000000000000000000000000000000000001"
        );
        assert_eq!(SwapId::from_auction_id(258).0[30..], [1, 2]);
    }

    #[test]
    fn test_leg_phase_rank_order() {
        assert!(LegPhase::Absent.rank() < LegPhase::Initiated.rank());
        assert!(LegPhase::Initiated.rank() < LegPhase::Claimed.rank());
        assert_eq!(LegPhase::Claimed.rank(), LegPhase::Refunded.rank());
        assert!(LegPhase::from_u8(4).is_err());
    }

    #[test]
    fn test_auction_validation_rejects_zero_maker() {
        let auction = Auction {
            id: 1,
            maker: Address::zero(),
            token_a: Address::repeat_byte(0xa),
            amount_a: U256::from(1),
            token_b: Address::repeat_byte(0xb),
            min_amount_b: U256::from(1),
            end_time: 100,
            highest_bidder: Address::zero(),
            highest_bid: U256::zero(),
            ended: false,
        };
        assert!(matches!(
            auction.validate(),
            Err(SwapError::InvalidRecord { kind: "auction", .. })
        ));
    }
}
