// Copyright (c) Oppy Finance
// SPDX-License-Identifier: Apache-2.0

//! The token allow-list.
//!
//! A JSON file maps pub-chain token contract addresses to app-chain denoms
//! and their decimals; the special address `native` describes the chain's
//! base coin. The file is re-read on a block cadence so new listings do
//! not require a restart.

use crate::error::{BridgeError, BridgeResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::RwLock;
use tracing::{info, warn};

pub const NATIVE_TOKEN_ADDRESS: &str = "native";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenEntry {
    pub address: String,
    pub denom: String,
    pub decimals: u32,
}

pub struct TokenList {
    path: PathBuf,
    update_gap: i64,
    last_update_height: AtomicI64,
    by_address: RwLock<HashMap<String, TokenEntry>>,
}

impl TokenList {
    pub fn load(path: &Path, update_gap: i64) -> BridgeResult<Self> {
        let entries = read_entries(path)?;
        info!("loaded token list with {} entries", entries.len());
        Ok(Self {
            path: path.to_path_buf(),
            update_gap,
            last_update_height: AtomicI64::new(0),
            by_address: RwLock::new(entries),
        })
    }

    /// Look up a token by its pub-chain contract address.
    pub fn get_by_address(&self, address: &str) -> Option<TokenEntry> {
        self.by_address
            .read()
            .expect("token list lock poisoned")
            .get(&address.to_lowercase())
            .cloned()
    }

    /// Look up a token by its app-chain denom.
    pub fn get_by_denom(&self, denom: &str) -> Option<TokenEntry> {
        self.by_address
            .read()
            .expect("token list lock poisoned")
            .values()
            .find(|entry| entry.denom == denom)
            .cloned()
    }

    pub fn native(&self) -> Option<TokenEntry> {
        self.get_by_address(NATIVE_TOKEN_ADDRESS)
    }

    pub fn is_allowed(&self, address: &str) -> bool {
        self.get_by_address(address).is_some()
    }

    /// Snapshot of every listed token.
    pub fn entries(&self) -> Vec<TokenEntry> {
        self.by_address
            .read()
            .expect("token list lock poisoned")
            .values()
            .cloned()
            .collect()
    }

    /// Re-read the file once `update_gap` blocks have passed since the
    /// last refresh. A broken file keeps the previous list.
    pub fn update(&self, current_height: i64) {
        let last = self.last_update_height.load(Ordering::Relaxed);
        if current_height - last < self.update_gap {
            return;
        }
        self.last_update_height
            .store(current_height, Ordering::Relaxed);
        match read_entries(&self.path) {
            Ok(entries) => {
                info!(
                    "token list refreshed at height {}: {} entries",
                    current_height,
                    entries.len()
                );
                *self.by_address.write().expect("token list lock poisoned") = entries;
            }
            Err(err) => warn!("token list refresh failed, keeping old list: {}", err),
        }
    }
}

fn read_entries(path: &Path) -> BridgeResult<HashMap<String, TokenEntry>> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| BridgeError::Storage(format!("cannot read token list {:?}: {}", path, e)))?;
    let entries: Vec<TokenEntry> = serde_json::from_str(&content)
        .map_err(|e| BridgeError::Storage(format!("malformed token list {:?}: {}", path, e)))?;
    Ok(entries
        .into_iter()
        .map(|entry| (entry.address.to_lowercase(), entry))
        .collect())
}
