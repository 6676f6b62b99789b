//! Swap coordination
//!
//! The coordinator:
//! 1. Builds the watch list from configured ids and auction discovery
//! 2. Resolves the account's role in each ended auction
//! 3. Spawns one agent loop per swap and publishes its status

pub mod engine;

pub use engine::{SwapCoordinator, SwapStatus};
