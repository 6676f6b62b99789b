//! Signed chain writes
//!
//! Every escrow and auction write goes through a per-chain `TransactionSender`,
//! which owns the account nonce, prices gas and waits for confirmations.

mod gas;
mod nonce;
mod sender;

pub use sender::TransactionSender;
