//! ABI encoding helpers for the escrow, auction and ERC-20 contracts

use crate::error::{SwapError, SwapResult};

use ethers::abi::{self, ParamType, Token};
use ethers::types::{Address, Bytes, H256, U256};
use sha3::{Digest, Keccak256};

/// Function signatures consumed from the escrow contract
pub mod escrow {
    pub const INITIATE: &str = "initiate(bytes32,address,address,uint256,bytes32,uint256)";
    pub const CLAIM: &str = "claim(bytes32,bytes32)";
    pub const REFUND: &str = "refund(bytes32)";
    pub const SWAPS: &str = "swaps(bytes32)";

    pub const SWAP_INITIATED: &str = "SwapInitiated(bytes32,address,address,bytes32,uint256)";
    pub const SWAP_CLAIMED: &str = "SwapClaimed(bytes32,bytes32)";
    pub const SWAP_REFUNDED: &str = "SwapRefunded(bytes32)";
}

/// Function signatures consumed from the auction contract
pub mod auction {
    pub const CREATE_AUCTION: &str = "createAuction(address,uint256,address,uint256,uint256)";
    pub const BID: &str = "bid(uint256,uint256)";
    pub const END_AUCTION: &str = "endAuction(uint256)";
    pub const AUCTIONS: &str = "auctions(uint256)";
    pub const AUCTION_COUNTER: &str = "auctionCounter()";

    pub const AUCTION_CREATED: &str =
        "AuctionCreated(uint256,address,address,uint256,address,uint256,uint256)";
    pub const AUCTION_ENDED: &str =
        "AuctionEnded(uint256,address,address,address,uint256,address,uint256)";
}

pub mod erc20 {
    pub const APPROVE: &str = "approve(address,uint256)";
}

pub fn keccak256(input: &[u8]) -> [u8; 32] {
    let mut out = [0u8; 32];
    out.copy_from_slice(&Keccak256::digest(input));
    out
}

/// First four bytes of the keccak of a function signature
pub fn selector(signature: &str) -> [u8; 4] {
    let hash = keccak256(signature.as_bytes());
    [hash[0], hash[1], hash[2], hash[3]]
}

/// Topic zero for an event signature
pub fn event_topic(signature: &str) -> H256 {
    H256::from(keccak256(signature.as_bytes()))
}

/// Selector followed by the ABI-encoded arguments
pub fn encode_call(signature: &str, args: &[Token]) -> Bytes {
    let mut data = selector(signature).to_vec();
    data.extend_from_slice(&abi::encode(args));
    Bytes::from(data)
}

pub fn decode(types: &[ParamType], data: &[u8]) -> SwapResult<Vec<Token>> {
    abi::decode(types, data).map_err(|e| SwapError::EventParsing(e.to_string()))
}

pub fn bytes32(bytes: &[u8; 32]) -> Token {
    Token::FixedBytes(bytes.to_vec())
}

// Token accessors used by the boundary decoders

pub fn take_address(token: &Token, field: &str) -> SwapResult<Address> {
    match token {
        Token::Address(address) => Ok(*address),
        other => Err(field_error(field, other)),
    }
}

pub fn take_uint(token: &Token, field: &str) -> SwapResult<U256> {
    match token {
        Token::Uint(value) => Ok(*value),
        other => Err(field_error(field, other)),
    }
}

pub fn take_u64(token: &Token, field: &str) -> SwapResult<u64> {
    let value = take_uint(token, field)?;
    if value > U256::from(u64::MAX) {
        return Err(SwapError::EventParsing(format!(
            "field {} does not fit in u64: {}",
            field, value
        )));
    }
    Ok(value.as_u64())
}

pub fn take_bool(token: &Token, field: &str) -> SwapResult<bool> {
    match token {
        Token::Bool(value) => Ok(*value),
        other => Err(field_error(field, other)),
    }
}

pub fn take_bytes32(token: &Token, field: &str) -> SwapResult<[u8; 32]> {
    match token {
        Token::FixedBytes(bytes) if bytes.len() == 32 => {
            let mut out = [0u8; 32];
            out.copy_from_slice(bytes);
            Ok(out)
        }
        other => Err(field_error(field, other)),
    }
}

/// Address stored in an indexed topic
pub fn topic_address(topic: &H256) -> Address {
    Address::from_slice(&topic.0[12..32])
}

/// Unsigned integer stored in an indexed topic
pub fn topic_u64(topic: &H256, field: &str) -> SwapResult<u64> {
    take_u64(&Token::Uint(U256::from_big_endian(&topic.0)), field)
}

fn field_error(field: &str, token: &Token) -> SwapError {
    SwapError::EventParsing(format!("unexpected token for {}: {:?}", field, token))
}
