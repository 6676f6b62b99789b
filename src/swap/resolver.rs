//! Auction result resolution
//!
//! Maps an ended auction to the two-party swap terms and decides the local
//! account's role. Pure functions only.

use super::{Auction, ChainSide, Identity, LegTerms, Role, SwapContext, SwapId};
use crate::error::{SwapError, SwapResult};

/// Deterministic swap id for an auction; both parties compute it independently
pub fn swap_id_for(auction_id: u64) -> SwapId {
    SwapId::from_auction_id(auction_id)
}

/// Project an ended auction into swap terms
pub fn resolve(auction: &Auction) -> SwapResult<SwapContext> {
    if !auction.ended {
        return Err(SwapError::AuctionNotEnded {
            auction_id: auction.id,
        });
    }
    if !auction.has_winning_bid() {
        return Err(SwapError::NoWinningBid {
            auction_id: auction.id,
        });
    }
    if auction.maker == auction.highest_bidder {
        return Err(SwapError::DegenerateAuction {
            auction_id: auction.id,
        });
    }

    let maker = auction.maker;
    let taker = auction.highest_bidder;

    Ok(SwapContext {
        auction_id: auction.id,
        swap_id: swap_id_for(auction.id),
        maker,
        taker,
        leg_a: LegTerms {
            chain: ChainSide::A,
            sender: maker,
            recipient: taker,
            token: auction.token_a,
            amount: auction.amount_a,
        },
        leg_b: LegTerms {
            chain: ChainSide::B,
            sender: taker,
            recipient: maker,
            token: auction.token_b,
            amount: auction.highest_bid,
        },
    })
}

/// Role of `account` in `auction`.
///
/// Addresses are compared as parsed 20-byte values, so checksum casing in
/// the original strings does not matter.
pub fn resolve_role(account: Identity, auction: &Auction) -> Role {
    if account.is_zero() {
        return Role::Observer;
    }
    if account == auction.maker {
        Role::Maker
    } else if auction.has_winning_bid() && account == auction.highest_bidder {
        Role::Taker
    } else {
        Role::Observer
    }
}

/// Resolve and check the expected role in one step
pub fn resolve_for(account: Identity, auction: &Auction, expected: Role) -> SwapResult<SwapContext> {
    let context = resolve(auction)?;
    let actual = resolve_role(account, auction);
    if actual != expected {
        return Err(SwapError::WrongRole {
            auction_id: auction.id,
            account: format!("{:?}", account),
            expected: expected.to_string(),
            actual: actual.to_string(),
        });
    }
    Ok(context)
}
