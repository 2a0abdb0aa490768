// Copyright (c) Oppy Finance
// SPDX-License-Identifier: Apache-2.0

use crate::address::{decode_bech32_pubkey, pubkey_to_eth_address, AccAddress, AddressError};
use crate::constants::APP_CHAIN_HRP;
use ethers::types::Address as EthAddress;
use serde::{Deserialize, Serialize};

/// The pool record as published by the app chain's vault module.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawPoolDescriptor {
    pub pool_pubkey: String,
    pub nodes: Vec<AccAddress>,
    pub block_height: i64,
}

/// One custody pool with both of its address renderings.
///
/// The two addresses are derived from the pool public key exactly once, at
/// construction; everything downstream reads the cached values so the
/// derivation can never diverge.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolInfo {
    pub pub_key: String,
    pub app_address: AccAddress,
    pub eth_address: EthAddress,
    pub raw: RawPoolDescriptor,
}

impl PoolInfo {
    pub fn from_descriptor(raw: RawPoolDescriptor) -> Result<Self, AddressError> {
        let compressed = decode_bech32_pubkey(&raw.pool_pubkey)?;
        let eth_address = pubkey_to_eth_address(&compressed)?;
        let app_address = AccAddress::from_eth(APP_CHAIN_HRP, eth_address);
        Ok(Self {
            pub_key: raw.pool_pubkey.clone(),
            app_address,
            eth_address,
            raw,
        })
    }

    pub fn created_block_height(&self) -> i64 {
        self.raw.block_height
    }
}
