//! Deterministic in-memory ledgers for scenario tests
//!
//! Both ledgers follow the contract rules the agents rely on: duplicate
//! initiation reverts, claims need the preimage before the timelock, refunds
//! need the timelock to have passed. Each party gets its own handle via
//! `as_account`, sharing state and clock.

use super::{AuctionLedger, CreateAuctionRequest, EscrowLedger, InitiateRequest};
use crate::error::{SwapError, SwapResult};
use crate::events::{AuctionEvent, EscrowEvent};
use crate::swap::{Auction, ChainSide, Leg, LegPhase, Secret, SecretManager, SwapId};

use async_trait::async_trait;
use ethers::types::{Address, TxHash, H256, U256};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Shared wall clock for both chains
#[derive(Debug, Clone, Default)]
pub struct TestClock(Arc<AtomicU64>);

impl TestClock {
    pub fn new(start: u64) -> Self {
        Self(Arc::new(AtomicU64::new(start)))
    }

    pub fn now(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }

    pub fn set(&self, now: u64) {
        self.0.store(now, Ordering::SeqCst);
    }

    pub fn advance(&self, secs: u64) {
        self.0.fetch_add(secs, Ordering::SeqCst);
    }
}

#[derive(Debug, Default)]
struct EscrowState {
    block: u64,
    legs: HashMap<SwapId, Leg>,
    events: Vec<EscrowEvent>,
    balances: HashMap<(Address, Address), U256>,
    allowances: HashMap<(Address, Address), U256>,
    writes: Vec<(Address, &'static str, SwapId)>,
    hide_records: bool,
}

impl EscrowState {
    fn next_tx(&mut self) -> (u64, TxHash) {
        self.block += 1;
        (self.block, H256::from_low_u64_be(self.block))
    }
}

/// In-memory HTLC escrow
#[derive(Clone)]
pub struct MemoryEscrow {
    side: ChainSide,
    caller: Address,
    clock: TestClock,
    state: Arc<Mutex<EscrowState>>,
}

impl MemoryEscrow {
    pub fn new(side: ChainSide, clock: TestClock) -> Self {
        Self {
            side,
            caller: Address::zero(),
            clock,
            state: Arc::new(Mutex::new(EscrowState::default())),
        }
    }

    /// Handle acting as `account`
    pub fn as_account(&self, account: Address) -> Self {
        Self {
            caller: account,
            ..self.clone()
        }
    }

    pub fn mint(&self, token: Address, owner: Address, amount: U256) {
        let mut state = self.state.lock().unwrap();
        *state.balances.entry((token, owner)).or_default() += amount;
    }

    pub fn balance(&self, token: Address, owner: Address) -> U256 {
        let state = self.state.lock().unwrap();
        state.balances.get(&(token, owner)).copied().unwrap_or_default()
    }

    pub fn leg(&self, swap_id: SwapId) -> Option<Leg> {
        self.state.lock().unwrap().legs.get(&swap_id).cloned()
    }

    /// Escrow writes (initiate, claim, refund) made by `account`
    pub fn writes_by(&self, account: Address) -> Vec<&'static str> {
        let state = self.state.lock().unwrap();
        state
            .writes
            .iter()
            .filter(|(who, _, _)| *who == account)
            .map(|(_, op, _)| *op)
            .collect()
    }

    /// Make `swaps(swapId)` return nothing so only events are visible
    pub fn hide_records(&self) {
        self.state.lock().unwrap().hide_records = true;
    }

    fn revert(&self, operation: &str, reason: &str) -> SwapError {
        SwapError::ChainCallFailed {
            chain: self.side,
            operation: operation.to_string(),
            reason: reason.to_string(),
        }
    }
}

#[async_trait]
impl EscrowLedger for MemoryEscrow {
    fn chain(&self) -> ChainSide {
        self.side
    }

    async fn chain_time(&self) -> SwapResult<u64> {
        Ok(self.clock.now())
    }

    async fn swap_record(&self, swap_id: SwapId) -> SwapResult<Option<Leg>> {
        let state = self.state.lock().unwrap();
        if state.hide_records {
            return Ok(None);
        }
        Ok(state.legs.get(&swap_id).cloned())
    }

    async fn scan_swap_events(
        &self,
        swap_id: SwapId,
        lookback_blocks: u64,
    ) -> SwapResult<Vec<EscrowEvent>> {
        let state = self.state.lock().unwrap();
        let from = state.block.saturating_sub(lookback_blocks);
        Ok(state
            .events
            .iter()
            .filter(|e| e.swap_id() == swap_id && e.block_number() >= from)
            .cloned()
            .collect())
    }

    async fn approve(&self, token: Address, amount: U256) -> SwapResult<TxHash> {
        let mut state = self.state.lock().unwrap();
        state.allowances.insert((token, self.caller), amount);
        Ok(state.next_tx().1)
    }

    async fn initiate(&self, request: InitiateRequest) -> SwapResult<TxHash> {
        let mut state = self.state.lock().unwrap();
        if state.legs.contains_key(&request.swap_id) {
            return Err(self.revert("initiate", "swap already exists"));
        }
        if request.timelock <= self.clock.now() {
            return Err(self.revert("initiate", "timelock in the past"));
        }
        let key = (request.token, self.caller);
        let allowance = state.allowances.get(&key).copied().unwrap_or_default();
        let balance = state.balances.get(&key).copied().unwrap_or_default();
        if allowance < request.amount || balance < request.amount {
            return Err(self.revert("initiate", "insufficient allowance or balance"));
        }
        state.allowances.insert(key, allowance - request.amount);
        state.balances.insert(key, balance - request.amount);

        let (block, tx_hash) = state.next_tx();
        state.legs.insert(
            request.swap_id,
            Leg {
                swap_id: request.swap_id,
                chain: self.side,
                initiator: self.caller,
                recipient: request.recipient,
                token: request.token,
                amount: request.amount,
                hashed_secret: request.hashed_secret,
                timelock: request.timelock,
                phase: LegPhase::Initiated,
            },
        );
        state.events.push(EscrowEvent::Initiated {
            chain: self.side,
            swap_id: request.swap_id,
            initiator: self.caller,
            recipient: request.recipient,
            hashed_secret: request.hashed_secret,
            timelock: request.timelock,
            block_number: block,
            tx_hash,
        });
        let caller = self.caller;
        state.writes.push((caller, "initiate", request.swap_id));
        Ok(tx_hash)
    }

    async fn claim(&self, swap_id: SwapId, secret: Secret) -> SwapResult<TxHash> {
        let mut state = self.state.lock().unwrap();
        let leg = state
            .legs
            .get(&swap_id)
            .cloned()
            .ok_or_else(|| self.revert("claim", "unknown swap"))?;
        if leg.phase != LegPhase::Initiated {
            return Err(self.revert("claim", "swap not claimable"));
        }
        if self.clock.now() >= leg.timelock {
            return Err(self.revert("claim", "timelock expired"));
        }
        if !SecretManager::verify(&secret, &leg.hashed_secret) {
            return Err(self.revert("claim", "invalid secret"));
        }

        *state.balances.entry((leg.token, leg.recipient)).or_default() += leg.amount;
        if let Some(stored) = state.legs.get_mut(&swap_id) {
            stored.phase = LegPhase::Claimed;
        }
        let (block, tx_hash) = state.next_tx();
        state.events.push(EscrowEvent::Claimed {
            chain: self.side,
            swap_id,
            secret,
            block_number: block,
            tx_hash,
        });
        let caller = self.caller;
        state.writes.push((caller, "claim", swap_id));
        Ok(tx_hash)
    }

    async fn refund(&self, swap_id: SwapId) -> SwapResult<TxHash> {
        let mut state = self.state.lock().unwrap();
        let leg = state
            .legs
            .get(&swap_id)
            .cloned()
            .ok_or_else(|| self.revert("refund", "unknown swap"))?;
        if leg.phase != LegPhase::Initiated {
            return Err(self.revert("refund", "swap not refundable"));
        }
        if self.clock.now() < leg.timelock {
            return Err(self.revert("refund", "timelock not expired"));
        }
        if self.caller != leg.initiator {
            return Err(self.revert("refund", "only initiator"));
        }

        *state.balances.entry((leg.token, leg.initiator)).or_default() += leg.amount;
        if let Some(stored) = state.legs.get_mut(&swap_id) {
            stored.phase = LegPhase::Refunded;
        }
        let (block, tx_hash) = state.next_tx();
        state.events.push(EscrowEvent::Refunded {
            chain: self.side,
            swap_id,
            block_number: block,
            tx_hash,
        });
        let caller = self.caller;
        state.writes.push((caller, "refund", swap_id));
        Ok(tx_hash)
    }
}

#[derive(Debug, Default)]
struct AuctionState {
    counter: u64,
    auctions: HashMap<u64, Auction>,
}

/// In-memory English auction
#[derive(Clone)]
pub struct MemoryAuctionHouse {
    caller: Address,
    clock: TestClock,
    state: Arc<Mutex<AuctionState>>,
}

impl MemoryAuctionHouse {
    pub fn new(clock: TestClock) -> Self {
        Self {
            caller: Address::zero(),
            clock,
            state: Arc::new(Mutex::new(AuctionState::default())),
        }
    }

    pub fn as_account(&self, account: Address) -> Self {
        Self {
            caller: account,
            ..self.clone()
        }
    }

    fn revert(operation: &str, reason: &str) -> SwapError {
        SwapError::ChainCallFailed {
            chain: ChainSide::A,
            operation: operation.to_string(),
            reason: reason.to_string(),
        }
    }
}

#[async_trait]
impl AuctionLedger for MemoryAuctionHouse {
    async fn auction(&self, auction_id: u64) -> SwapResult<Option<Auction>> {
        Ok(self.state.lock().unwrap().auctions.get(&auction_id).cloned())
    }

    async fn auction_count(&self) -> SwapResult<u64> {
        Ok(self.state.lock().unwrap().counter)
    }

    async fn create_auction(&self, request: CreateAuctionRequest) -> SwapResult<u64> {
        let mut state = self.state.lock().unwrap();
        state.counter += 1;
        let id = state.counter;
        state.auctions.insert(
            id,
            Auction {
                id,
                maker: self.caller,
                token_a: request.token_a,
                amount_a: request.amount_a,
                token_b: request.token_b,
                min_amount_b: request.min_amount_b,
                end_time: self.clock.now() + request.duration_secs,
                highest_bidder: Address::zero(),
                highest_bid: U256::zero(),
                ended: false,
            },
        );
        Ok(id)
    }

    async fn bid(&self, auction_id: u64, amount_b: U256) -> SwapResult<TxHash> {
        let mut state = self.state.lock().unwrap();
        let now = self.clock.now();
        let caller = self.caller;
        let auction = state
            .auctions
            .get_mut(&auction_id)
            .ok_or_else(|| Self::revert("bid", "unknown auction"))?;
        if auction.ended || now >= auction.end_time {
            return Err(Self::revert("bid", "auction over"));
        }
        if caller == auction.maker {
            return Err(Self::revert("bid", "maker cannot bid"));
        }
        if amount_b < auction.min_amount_b || amount_b <= auction.highest_bid {
            return Err(Self::revert("bid", "bid too low"));
        }
        auction.highest_bidder = caller;
        auction.highest_bid = amount_b;
        Ok(H256::from_low_u64_be(auction_id))
    }

    async fn end_auction(&self, auction_id: u64) -> SwapResult<Option<AuctionEvent>> {
        let mut state = self.state.lock().unwrap();
        let now = self.clock.now();
        let auction = state
            .auctions
            .get_mut(&auction_id)
            .ok_or_else(|| Self::revert("endAuction", "unknown auction"))?;
        if auction.ended || now < auction.end_time {
            return Err(Self::revert("endAuction", "auction not over"));
        }
        auction.ended = true;
        if !auction.has_winning_bid() {
            return Ok(None);
        }
        Ok(Some(AuctionEvent::Ended {
            auction_id,
            maker: auction.maker,
            taker: auction.highest_bidder,
            token_a: auction.token_a,
            amount_a: auction.amount_a,
            token_b: auction.token_b,
            amount_b: auction.highest_bid,
        }))
    }
}
