// Copyright (c) Oppy Finance
// SPDX-License-Identifier: Apache-2.0

use oppy_bridge_config::Config;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct AppChainConfig {
    // gRPC endpoint for module queries
    pub grpc_addr: String,
    // Websocket endpoint for the event subscription
    pub ws_addr: String,
    // HTTP gateway used for queries and broadcast
    pub http_addr: String,
    // Blocks behind the tip at which blocks are scanned
    pub rollback_gap: i64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct PubChainConfig {
    pub ws_addr: String,
    pub rollback_gap: u64,
    // The bridge smart contract handling ERC-20 deposits
    pub bridge_contract_addr: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct TssConfig {
    pub http_addr: String,
    // Opaque settings handed to the signer sidecar
    #[serde(default)]
    pub internal: serde_json::Value,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct BridgeNodeConfig {
    pub home_dir: PathBuf,
    // Operator keyring, relative to home-dir
    pub keyring_path: String,
    // Token allow-list, relative to home-dir
    pub token_list_path: String,
    pub token_list_update_gap: i64,
    pub app_chain: AppChainConfig,
    pub pub_chain: PubChainConfig,
    pub tss: TssConfig,
    #[serde(default)]
    pub enable_monitor: bool,
    #[serde(default = "default_monitor_port")]
    pub monitor_port: u16,
}

fn default_monitor_port() -> u16 {
    9090
}

impl Config for BridgeNodeConfig {}

impl BridgeNodeConfig {
    pub fn keyring_file(&self) -> PathBuf {
        self.home_dir.join(&self.keyring_path)
    }

    pub fn token_list_file(&self) -> PathBuf {
        self.home_dir.join(&self.token_list_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kebab_case_round_trip() {
        let raw = r#"{
            "home-dir": "/var/lib/oppy-bridge",
            "keyring-path": "keyring.json",
            "token-list-path": "tokens.json",
            "token-list-update-gap": 100,
            "app-chain": {
                "grpc-addr": "127.0.0.1:9090",
                "ws-addr": "ws://127.0.0.1:26657/websocket",
                "http-addr": "http://127.0.0.1:1317",
                "rollback-gap": 10
            },
            "pub-chain": {
                "ws-addr": "ws://127.0.0.1:8546",
                "rollback-gap": 15,
                "bridge-contract-addr": "0x94277968dff216265313657425d9d7577ad32dd1"
            },
            "tss": { "http-addr": "127.0.0.1:8320" },
            "enable-monitor": true
        }"#;
        let config: BridgeNodeConfig = serde_json::from_str(raw).unwrap();
        assert_eq!(config.app_chain.rollback_gap, 10);
        assert_eq!(config.pub_chain.rollback_gap, 15);
        assert_eq!(config.monitor_port, 9090);
        assert!(config.enable_monitor);
        assert_eq!(
            config.token_list_file(),
            PathBuf::from("/var/lib/oppy-bridge/tokens.json")
        );
    }
}
