//! Error types for the swap agent

use crate::swap::ChainSide;

use thiserror::Error;

/// Main error type for the swap agent
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SwapError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Auction {auction_id} has not ended")]
    AuctionNotEnded { auction_id: u64 },

    #[error("Auction {auction_id} ended without a winning bid")]
    NoWinningBid { auction_id: u64 },

    #[error("Auction {auction_id} not found")]
    AuctionNotFound { auction_id: u64 },

    #[error("Auction {auction_id} is degenerate: maker and highest bidder are the same account")]
    DegenerateAuction { auction_id: u64 },

    #[error("Account {account} has role {actual} in auction {auction_id}, expected {expected}")]
    WrongRole {
        auction_id: u64,
        account: String,
        expected: String,
        actual: String,
    },

    #[error("Chain {chain} connection error: {message}")]
    ChainConnection { chain: ChainSide, message: String },

    #[error("{operation} on chain {chain} failed: {reason}")]
    ChainCallFailed {
        chain: ChainSide,
        operation: String,
        reason: String,
    },

    #[error("Nonce error on chain {chain}: {message}")]
    Nonce { chain: ChainSide, message: String },

    #[error("Transaction already known to the node on chain {chain}")]
    AlreadyKnown { chain: ChainSide },

    #[error("Gas estimation error: {0}")]
    GasEstimation(String),

    #[error("Insufficient balance on chain {chain}")]
    InsufficientBalance { chain: ChainSide },

    #[error("Rate limited on chain {chain}")]
    RateLimited { chain: ChainSide },

    #[error("Timeout waiting for {operation}")]
    Timeout { operation: String },

    #[error("Invalid {kind} record: {message}")]
    InvalidRecord { kind: &'static str, message: String },

    #[error("Event parsing error: {0}")]
    EventParsing(String),

    #[error("Wallet error: {0}")]
    Wallet(String),

    #[error("Entropy source failure: {0}")]
    Entropy(String),

    #[error("Hashlock mismatch for swap {swap_id}: leg A {hash_a}, leg B {hash_b}")]
    HashlockMismatch {
        swap_id: String,
        hash_a: String,
        hash_b: String,
    },

    #[error("Revealed secret for swap {swap_id} does not hash to {expected}")]
    SecretMismatch { swap_id: String, expected: String },

    #[error("Timelock ordering violated: leg A {timelock_a} must be >= leg B {timelock_b} + {margin}")]
    TimelockOrdering {
        timelock_a: u64,
        timelock_b: u64,
        margin: u64,
    },

    #[error("Leg on chain {chain} for swap {swap_id} is corrupt: {message}")]
    CorruptLeg {
        chain: ChainSide,
        swap_id: String,
        message: String,
    },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl SwapError {
    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SwapError::ChainConnection { .. }
                | SwapError::ChainCallFailed { .. }
                | SwapError::Nonce { .. }
                | SwapError::GasEstimation(_)
                | SwapError::RateLimited { .. }
                | SwapError::Timeout { .. }
        )
    }

    /// Protocol violations halt forward progress for the swap
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            SwapError::HashlockMismatch { .. }
                | SwapError::SecretMismatch { .. }
                | SwapError::TimelockOrdering { .. }
                | SwapError::CorruptLeg { .. }
        )
    }

    /// Caller logic errors, surfaced immediately
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            SwapError::AuctionNotEnded { .. }
                | SwapError::NoWinningBid { .. }
                | SwapError::AuctionNotFound { .. }
                | SwapError::DegenerateAuction { .. }
                | SwapError::WrongRole { .. }
        )
    }

    /// Check if error should trigger an alert
    pub fn should_alert(&self) -> bool {
        self.is_protocol_violation()
            || matches!(
                self,
                SwapError::InsufficientBalance { .. }
                    | SwapError::Wallet(_)
                    | SwapError::Entropy(_)
            )
    }

    /// Short label for metrics
    pub fn kind(&self) -> &'static str {
        if self.is_protocol_violation() {
            "protocol_violation"
        } else if self.is_precondition() {
            "precondition"
        } else if self.is_retryable() {
            "transient"
        } else {
            "fatal"
        }
    }
}

/// Result type for swap agent operations
pub type SwapResult<T> = Result<T, SwapError>;
