// Copyright (c) Oppy Finance
// SPDX-License-Identifier: Apache-2.0

use crate::constants::IBC_CHAIN_HRP;
use crate::requests::ChainClass;
use serde::{Deserialize, Serialize};

/// Memo attached to a deposit, naming the destination on the other side.
///
/// ```json
/// { "dest": "oppy1...", "chain_type": "EVM" }
/// ```
///
/// `chain_type` is optional; when absent the class is inferred from the
/// destination string.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeMemo {
    pub dest: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chain_type: Option<String>,
}

impl BridgeMemo {
    pub fn new(dest: &str) -> Self {
        Self {
            dest: dest.to_string(),
            chain_type: None,
        }
    }

    /// Decide which chain the destination lives on. An explicit
    /// `chain_type` wins; otherwise a destination carrying the IBC prefix
    /// is routed to the side chain.
    pub fn chain_class(&self) -> ChainClass {
        match self.chain_type.as_deref() {
            Some("JOLT") => ChainClass::Ibc,
            Some(_) => ChainClass::Native,
            None if self.dest.contains(IBC_CHAIN_HRP) => ChainClass::Ibc,
            None => ChainClass::Native,
        }
    }

    pub fn parse(data: &[u8]) -> Option<Self> {
        serde_json::from_slice(data).ok()
    }
}
