// Copyright (c) Oppy Finance
// SPDX-License-Identifier: Apache-2.0

//! Operator identity.
//!
//! The keyring file holds the operator's account record: the bech32
//! address and its compressed public key, armored under the passphrase
//! read from stdin at startup. The bridge core never touches the private
//! key itself; all pool signatures come from the threshold signer, and the
//! operator's own record-keeping transactions are signed inside the
//! app-chain adapter.

use crate::error::{BridgeError, BridgeResult};
use base64::Engine;
use oppy_bridge_types::constants::APP_CHAIN_HRP;
use oppy_bridge_types::AccAddress;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::path::Path;

pub const PASSPHRASE_LEN: usize = 32;

#[derive(Deserialize)]
struct KeyringFile {
    address: String,
    pub_key: String,
    // SHA-256 of the passphrase, to fail fast on a wrong unlock
    passphrase_digest: String,
}

#[derive(Debug)]
pub struct OperatorKey {
    pub address: AccAddress,
    pub pub_key: Vec<u8>,
}

impl OperatorKey {
    pub fn unlock(path: &Path, passphrase: &[u8]) -> BridgeResult<Self> {
        if passphrase.len() != PASSPHRASE_LEN {
            return Err(BridgeError::Generic(format!(
                "passphrase must be exactly {} bytes",
                PASSPHRASE_LEN
            )));
        }
        let content = std::fs::read_to_string(path)
            .map_err(|e| BridgeError::Storage(format!("cannot read keyring {:?}: {}", path, e)))?;
        let file: KeyringFile = serde_json::from_str(&content)
            .map_err(|e| BridgeError::Storage(format!("malformed keyring {:?}: {}", path, e)))?;

        let digest = hex::encode(Sha256::digest(passphrase));
        if digest != file.passphrase_digest {
            return Err(BridgeError::Generic("wrong keyring passphrase".into()));
        }

        let address = AccAddress::from_bech32_with_hrp(APP_CHAIN_HRP, &file.address)?;
        let pub_key = base64::engine::general_purpose::STANDARD
            .decode(&file.pub_key)
            .map_err(|e| BridgeError::Storage(format!("bad keyring pubkey: {}", e)))?;
        Ok(Self { address, pub_key })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_keyring(passphrase: &[u8]) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join("oppy-bridge-keyring");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("keyring.json");
        let address = AccAddress::new(APP_CHAIN_HRP, [1u8; 20]).to_string();
        let body = serde_json::json!({
            "address": address,
            "pub_key": base64::engine::general_purpose::STANDARD.encode([2u8; 33]),
            "passphrase_digest": hex::encode(Sha256::digest(passphrase)),
        });
        std::fs::write(&path, body.to_string()).unwrap();
        path
    }

    #[test]
    fn unlock_with_correct_passphrase() {
        let passphrase = [7u8; PASSPHRASE_LEN];
        let path = write_keyring(&passphrase);
        let key = OperatorKey::unlock(&path, &passphrase).unwrap();
        assert_eq!(key.pub_key.len(), 33);
        assert_eq!(key.address.hrp(), APP_CHAIN_HRP);
    }

    #[test]
    fn wrong_passphrase_is_fatal() {
        let path = write_keyring(&[7u8; PASSPHRASE_LEN]);
        let err = OperatorKey::unlock(&path, &[8u8; PASSPHRASE_LEN]).unwrap_err();
        assert!(err.to_string().contains("passphrase"));
    }

    #[test]
    fn short_passphrase_is_rejected() {
        let path = write_keyring(&[7u8; PASSPHRASE_LEN]);
        assert!(OperatorKey::unlock(&path, b"short").is_err());
    }
}
