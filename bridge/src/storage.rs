// Copyright (c) Oppy Finance
// SPDX-License-Identifier: Apache-2.0

//! Snapshot persistence for the four live collections.
//!
//! Written once on clean shutdown and read once at start. The files are
//! plain JSON arrays; queue ordering is not stored because every request
//! re-derives its index on insert. A missing file simply yields an empty
//! collection.

use crate::error::{BridgeError, BridgeResult};
use crate::move_fund::MoveFundItem;
use oppy_bridge_types::{InboundReq, OutBoundReq};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

const OUTBOUND_STATE_FILE: &str = "outbound_state";
const INBOUND_STATE_FILE: &str = "inbound_state";
const PENDING_OUTBOUND_FILE: &str = "pending_outbound";
const MOVE_FUND_STATE_FILE: &str = "movefund_state";

/// Move-fund lists for both chain sides, persisted together.
#[derive(Default, Serialize, Deserialize)]
pub struct MoveFundSnapshot {
    pub app_chain: Vec<MoveFundItem>,
    pub pub_chain: Vec<MoveFundItem>,
}

pub struct StateStorage {
    home_dir: PathBuf,
}

impl StateStorage {
    pub fn new(home_dir: &Path) -> Self {
        Self {
            home_dir: home_dir.to_path_buf(),
        }
    }

    pub fn save_outbound(&self, items: &[OutBoundReq]) -> BridgeResult<()> {
        self.write(OUTBOUND_STATE_FILE, items)
    }

    pub fn load_outbound(&self) -> BridgeResult<Vec<OutBoundReq>> {
        self.read(OUTBOUND_STATE_FILE)
    }

    pub fn save_inbound(&self, items: &[InboundReq]) -> BridgeResult<()> {
        self.write(INBOUND_STATE_FILE, items)
    }

    pub fn load_inbound(&self) -> BridgeResult<Vec<InboundReq>> {
        self.read(INBOUND_STATE_FILE)
    }

    pub fn save_pending_outbound(&self, items: &[OutBoundReq]) -> BridgeResult<()> {
        self.write(PENDING_OUTBOUND_FILE, items)
    }

    pub fn load_pending_outbound(&self) -> BridgeResult<Vec<OutBoundReq>> {
        self.read(PENDING_OUTBOUND_FILE)
    }

    pub fn save_move_fund(&self, snapshot: &MoveFundSnapshot) -> BridgeResult<()> {
        self.write(MOVE_FUND_STATE_FILE, snapshot)
    }

    pub fn load_move_fund(&self) -> BridgeResult<MoveFundSnapshot> {
        let path = self.home_dir.join(MOVE_FUND_STATE_FILE);
        if !path.exists() {
            return Ok(MoveFundSnapshot::default());
        }
        self.read_file(&path)
    }

    fn write<T: Serialize + ?Sized>(&self, name: &str, value: &T) -> BridgeResult<()> {
        let path = self.home_dir.join(name);
        let content = serde_json::to_vec_pretty(value)
            .map_err(|e| BridgeError::Storage(format!("cannot encode {}: {}", name, e)))?;
        std::fs::write(&path, content)
            .map_err(|e| BridgeError::Storage(format!("cannot write {:?}: {}", path, e)))?;
        info!("saved snapshot {:?}", path);
        Ok(())
    }

    fn read<T: DeserializeOwned>(&self, name: &str) -> BridgeResult<Vec<T>> {
        let path = self.home_dir.join(name);
        if !path.exists() {
            return Ok(Vec::new());
        }
        self.read_file(&path)
    }

    fn read_file<T: DeserializeOwned>(&self, path: &Path) -> BridgeResult<T> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| BridgeError::Storage(format!("cannot read {:?}: {}", path, e)))?;
        serde_json::from_str(&content)
            .map_err(|e| BridgeError::Storage(format!("malformed snapshot {:?}: {}", path, e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethers::types::{Address as EthAddress, U256};
    use oppy_bridge_types::pool::RawPoolDescriptor;
    use oppy_bridge_types::{AccAddress, ChainClass, Coin, PoolInfo};

    fn storage(tag: &str) -> StateStorage {
        let dir = std::env::temp_dir().join(format!("oppy-bridge-storage-{}", tag));
        std::fs::create_dir_all(&dir).unwrap();
        StateStorage::new(&dir)
    }

    fn outbound(tag: u8) -> OutBoundReq {
        OutBoundReq::new(
            format!("{:02x}", tag),
            EthAddress::repeat_byte(tag),
            EthAddress::repeat_byte(1),
            Coin::new("abnb", U256::from(100u8)),
            ChainClass::Native,
            String::new(),
            40,
        )
    }

    #[test]
    fn missing_files_yield_empty_collections() {
        let storage = storage("missing");
        assert!(storage.load_outbound().unwrap().is_empty());
        assert!(storage.load_inbound().unwrap().is_empty());
        assert!(storage.load_pending_outbound().unwrap().is_empty());
        let move_fund = storage.load_move_fund().unwrap();
        assert!(move_fund.app_chain.is_empty());
        assert!(move_fund.pub_chain.is_empty());
    }

    #[test]
    fn outbound_round_trip_preserves_requests() {
        let storage = storage("outbound");
        let mut item = outbound(7);
        item.set_height_and_nonce(2, 120, 9);
        storage.save_outbound(&[item.clone()]).unwrap();

        let restored = storage.load_outbound().unwrap();
        assert_eq!(restored, vec![item.clone()]);
        assert_eq!(restored[0].index(), item.index());
    }

    #[test]
    fn inbound_round_trip_preserves_requests() {
        let storage = storage("inbound");
        let item = InboundReq::new(
            AccAddress::new("oppy", [3u8; 20]),
            vec![0xaa; 32],
            EthAddress::repeat_byte(4),
            Coin::new("ausdt", U256::exp10(12)),
            ChainClass::Native,
            1000,
        );
        storage.save_inbound(&[item.clone()]).unwrap();
        assert_eq!(storage.load_inbound().unwrap(), vec![item]);
    }

    #[test]
    fn move_fund_snapshot_round_trip() {
        let storage = storage("movefund");
        let pool = PoolInfo {
            pub_key: "oppypub1old".into(),
            app_address: AccAddress::new("oppy", [8u8; 20]),
            eth_address: EthAddress::repeat_byte(8),
            raw: RawPoolDescriptor {
                pool_pubkey: "oppypub1old".into(),
                nodes: vec![],
                block_height: 77,
            },
        };
        let snapshot = MoveFundSnapshot {
            app_chain: vec![MoveFundItem {
                pool: pool.clone(),
                not_before_height: 80,
            }],
            pub_chain: vec![MoveFundItem {
                pool,
                not_before_height: 81,
            }],
        };
        storage.save_move_fund(&snapshot).unwrap();

        let restored = storage.load_move_fund().unwrap();
        assert_eq!(restored.app_chain.len(), 1);
        assert_eq!(restored.pub_chain[0].not_before_height, 81);
    }
}
