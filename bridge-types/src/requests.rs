// Copyright (c) Oppy Finance
// SPDX-License-Identifier: Apache-2.0

//! Inbound and outbound transfer requests and their deterministic identity.
//!
//! Every request hashes to `keccak256(destination_bytes || tx_id_bytes)`;
//! its queue index is the decimal concatenation of the originating block
//! height and that hash interpreted as an unsigned integer. The height
//! occupies the high-order digits, so the queue orders by origin height
//! first and hash second, and the index survives any serialization round
//! trip because it is always re-derived from the request fields.

use crate::address::AccAddress;
use crate::constants::PRECISION;
use ethers::types::{Address as EthAddress, H256, U256, U512};
use ethers::utils::keccak256;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Which destination chain an outbound request belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChainClass {
    Native,
    Ibc,
}

/// A denominated amount in app-chain base units.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Coin {
    pub denom: String,
    pub amount: U256,
}

impl Coin {
    pub fn new(denom: &str, amount: U256) -> Self {
        Self {
            denom: denom.to_string(),
            amount,
        }
    }

    /// Rescale an amount quoted with `decimals` into the app chain's fixed
    /// precision.
    pub fn adjust_precision(&mut self, decimals: u32) {
        if decimals < PRECISION {
            self.amount *= U256::exp10((PRECISION - decimals) as usize);
        }
    }

    /// Rescale an app-chain amount back into `decimals` for the pub chain.
    pub fn external_amount(&self, decimals: u32) -> U256 {
        if decimals < PRECISION {
            self.amount / U256::exp10((PRECISION - decimals) as usize)
        } else {
            self.amount
        }
    }
}

impl fmt::Display for Coin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.amount, self.denom)
    }
}

/// Queue priority of a request. Ordering is total; the queue pops the
/// maximum.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ReqIndex(U512);

impl ReqIndex {
    pub fn derive(original_height: i64, hash: H256) -> Self {
        let lower = U256::from_big_endian(hash.as_bytes());
        let decimal = format!("{}{}", original_height, lower);
        // 19 height digits plus 78 hash digits stay well inside U512.
        let value = U512::from_dec_str(&decimal)
            .expect("decimal concatenation of two unsigned integers always parses");
        Self(value)
    }
}

impl fmt::Debug for ReqIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ReqIndex({})", self.0)
    }
}

/// A deposit observed on the pub chain, to be issued on the app chain.
///
/// The account fields after `round_block_height` stay zeroed until the
/// request is pulled into a signing batch.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundReq {
    pub dest: AccAddress,
    pub tx_id: Vec<u8>,
    pub to_pool_addr: EthAddress,
    pub coin: Coin,
    pub chain_class: ChainClass,
    pub original_height: i64,
    pub block_height: i64,
    pub round_block_height: i64,
    pub acc_num: u64,
    pub acc_seq: u64,
    pub pool_app_address: Option<AccAddress>,
    pub pool_pubkey: String,
}

impl InboundReq {
    pub fn new(
        dest: AccAddress,
        tx_id: Vec<u8>,
        to_pool_addr: EthAddress,
        coin: Coin,
        chain_class: ChainClass,
        block_height: i64,
    ) -> Self {
        Self {
            dest,
            tx_id,
            to_pool_addr,
            coin,
            chain_class,
            original_height: block_height,
            block_height,
            round_block_height: 0,
            acc_num: 0,
            acc_seq: 0,
            pool_app_address: None,
            pool_pubkey: String::new(),
        }
    }

    pub fn hash(&self) -> H256 {
        let mut data = self.dest.as_bytes().to_vec();
        data.extend_from_slice(&self.tx_id);
        H256::from(keccak256(data))
    }

    pub fn index(&self) -> ReqIndex {
        ReqIndex::derive(self.original_height, self.hash())
    }

    /// Stamp the batch assignment: pool account coordinates and the signing
    /// round.
    pub fn set_account_info(
        &mut self,
        acc_num: u64,
        acc_seq: u64,
        pool_app_address: AccAddress,
        pool_pubkey: &str,
        round_block_height: i64,
    ) {
        self.acc_num = acc_num;
        self.acc_seq = acc_seq;
        self.pool_app_address = Some(pool_app_address);
        self.pool_pubkey = pool_pubkey.to_string();
        self.round_block_height = round_block_height;
    }
}

/// A withdrawal observed on the app chain, to be paid out on the pub chain
/// (or forwarded over IBC).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutBoundReq {
    pub tx_id: String,
    pub receiver: EthAddress,
    pub from_pool_addr: EthAddress,
    pub coin: Coin,
    pub chain_class: ChainClass,
    /// Bech32 destination on the side chain; empty for native payouts.
    pub ibc_receiver: String,
    pub round_block_height: i64,
    pub block_height: i64,
    pub original_height: i64,
    pub nonce: u64,
    pub submitted_tx_hash: Option<H256>,
    pub cos_acc_num: u64,
    pub cos_acc_seq: u64,
}

impl OutBoundReq {
    pub fn new(
        tx_id: String,
        receiver: EthAddress,
        from_pool_addr: EthAddress,
        coin: Coin,
        chain_class: ChainClass,
        ibc_receiver: String,
        block_height: i64,
    ) -> Self {
        Self {
            tx_id,
            receiver,
            from_pool_addr,
            coin,
            chain_class,
            ibc_receiver,
            round_block_height: 0,
            block_height,
            original_height: block_height,
            nonce: 0,
            submitted_tx_hash: None,
            cos_acc_num: 0,
            cos_acc_seq: 0,
        }
    }

    pub fn hash(&self) -> H256 {
        let mut data = self.receiver.as_bytes().to_vec();
        data.extend_from_slice(self.tx_id.as_bytes());
        H256::from(keccak256(data))
    }

    pub fn index(&self) -> ReqIndex {
        ReqIndex::derive(self.original_height, self.hash())
    }

    pub fn set_height_and_nonce(&mut self, round_block_height: i64, block_height: i64, nonce: u64) {
        self.round_block_height = round_block_height;
        self.block_height = block_height;
        self.nonce = nonce;
    }

    pub fn set_ibc_account_info(&mut self, acc_num: u64, acc_seq: u64) {
        self.cos_acc_num = acc_num;
        self.cos_acc_seq = acc_seq;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::APP_CHAIN_HRP;

    fn inbound(height: i64, tx_id: u8) -> InboundReq {
        InboundReq::new(
            AccAddress::new(APP_CHAIN_HRP, [9u8; 20]),
            vec![tx_id; 32],
            EthAddress::repeat_byte(2),
            Coin::new("abnb", U256::from(1000u64)),
            ChainClass::Native,
            height,
        )
    }

    #[test]
    fn height_occupies_high_order_digits() {
        let older = inbound(100, 0xff);
        let newer = inbound(101, 0x01);
        assert!(newer.index() > older.index());
    }

    #[test]
    fn same_height_breaks_ties_on_hash() {
        let a = inbound(500, 1);
        let b = inbound(500, 2);
        let (small, large) = if a.hash() < b.hash() { (a, b) } else { (b, a) };
        assert!(large.index() > small.index());
    }

    #[test]
    fn hash_is_stable_across_serde_round_trip() {
        let mut req = inbound(1000, 7);
        req.set_account_info(
            3,
            42,
            AccAddress::new(APP_CHAIN_HRP, [5u8; 20]),
            "oppypub1xyz",
            20,
        );
        let json = serde_json::to_string(&req).unwrap();
        let restored: InboundReq = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.hash(), req.hash());
        assert_eq!(restored.index(), req.index());
        assert_eq!(restored, req);
    }

    #[test]
    fn outbound_hash_covers_receiver_and_tx_id() {
        let base = OutBoundReq::new(
            "a1b2".to_string(),
            EthAddress::repeat_byte(1),
            EthAddress::repeat_byte(2),
            Coin::new("abnb", U256::from(77u64)),
            ChainClass::Native,
            String::new(),
            50,
        );
        let mut other_receiver = base.clone();
        other_receiver.receiver = EthAddress::repeat_byte(3);
        let mut other_tx = base.clone();
        other_tx.tx_id = "ffff".to_string();
        assert_ne!(base.hash(), other_receiver.hash());
        assert_ne!(base.hash(), other_tx.hash());
    }

    #[test]
    fn precision_adjustment_scales_up_and_back() {
        let mut coin = Coin::new("ausdt", U256::from(1_000_000u64));
        coin.adjust_precision(6);
        assert_eq!(coin.amount, U256::exp10(12) * U256::from(1_000_000u64));
        assert_eq!(coin.external_amount(6), U256::from(1_000_000u64));
    }
}
