// Copyright (c) Oppy Finance
// SPDX-License-Identifier: Apache-2.0

//! Client for the threshold-signature service.
//!
//! The signer is a sidecar process reached over HTTP. A sign request names
//! the pool public key, the 32-byte digests to sign, the round block height
//! (replay protection) and optionally the participant subset; the response
//! carries one `(r, s, recovery_id)` triple per digest, or a blame record
//! when the quorum failed.

use crate::error::{BridgeError, BridgeResult};
use async_trait::async_trait;
use base64::Engine;
use oppy_bridge_types::constants::QUERY_TIMEOUT;
use oppy_bridge_types::TssSignature;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

pub const TSS_VERSION: &str = "0.14.0";

#[async_trait]
pub trait TssRpc: Send + Sync + 'static {
    /// Ask the committee to sign `messages` (32-byte digests) with the key
    /// behind `pool_pubkey`, bucketed at `block_height`.
    async fn key_sign(
        &self,
        pool_pubkey: &str,
        messages: &[[u8; 32]],
        block_height: i64,
        signers: Option<Vec<String>>,
    ) -> BridgeResult<Vec<TssSignature>>;

    /// Trigger a keygen ceremony among `participants`; returns the new
    /// pool public key.
    async fn key_gen(
        &self,
        block_height: i64,
        participants: Vec<String>,
    ) -> BridgeResult<String>;
}

#[derive(Serialize)]
struct KeySignRequest<'a> {
    pool_pub_key: &'a str,
    messages: Vec<String>,
    block_height: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    signer_pub_keys: Option<Vec<String>>,
    version: &'a str,
}

#[derive(Deserialize)]
struct Blame {
    fail_reason: String,
    #[serde(default)]
    blame_nodes: Vec<String>,
}

#[derive(Deserialize)]
struct KeySignResponse {
    #[serde(default)]
    signatures: Vec<TssSignature>,
    status: u8,
    #[serde(default)]
    blame: Option<Blame>,
}

#[derive(Serialize)]
struct KeyGenRequest<'a> {
    keys: Vec<String>,
    block_height: i64,
    version: &'a str,
}

#[derive(Deserialize)]
struct KeyGenResponse {
    pub_key: String,
    status: u8,
    #[serde(default)]
    blame: Option<Blame>,
}

pub struct HttpTssClient {
    base_url: String,
    client: reqwest::Client,
}

impl HttpTssClient {
    /// Dial the signer and require it to answer; an unreachable signer is
    /// a bootstrap failure.
    pub async fn connect(addr: &str) -> BridgeResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(QUERY_TIMEOUT)
            .build()
            .map_err(|e| BridgeError::Generic(format!("cannot build http client: {}", e)))?;
        let base_url = format!("http://{}", addr.trim_start_matches("http://"));
        let ping = client
            .get(format!("{}/ping", base_url))
            .send()
            .await
            .map_err(|e| BridgeError::Generic(format!("tss unreachable at {}: {}", base_url, e)))?;
        if !ping.status().is_success() {
            return Err(BridgeError::Generic(format!(
                "tss at {} answered ping with {}",
                base_url,
                ping.status()
            )));
        }
        info!("connected to tss signer at {}", base_url);
        Ok(Self { base_url, client })
    }
}

#[async_trait]
impl TssRpc for HttpTssClient {
    async fn key_sign(
        &self,
        pool_pubkey: &str,
        messages: &[[u8; 32]],
        block_height: i64,
        signers: Option<Vec<String>>,
    ) -> BridgeResult<Vec<TssSignature>> {
        let engine = base64::engine::general_purpose::STANDARD;
        let request = KeySignRequest {
            pool_pub_key: pool_pubkey,
            messages: messages.iter().map(|m| engine.encode(m)).collect(),
            block_height,
            signer_pub_keys: signers,
            version: TSS_VERSION,
        };

        // keysign waits for the whole committee; give it well beyond the
        // default RPC deadline
        let response = self
            .client
            .post(format!("{}/keysign", self.base_url))
            .timeout(QUERY_TIMEOUT * 10)
            .json(&request)
            .send()
            .await
            .map_err(|e| BridgeError::TransientRpc(format!("tss keysign: {}", e)))?
            .json::<KeySignResponse>()
            .await
            .map_err(|e| BridgeError::Rpc(format!("tss keysign response: {}", e)))?;

        if response.status != 1 {
            let reason = response
                .blame
                .map(|b| format!("{} (blamed: {:?})", b.fail_reason, b.blame_nodes))
                .unwrap_or_else(|| "no quorum".to_string());
            warn!("tss keysign failed: {}", reason);
            return Err(BridgeError::TssSign(reason));
        }
        if response.signatures.len() != messages.len() {
            return Err(BridgeError::TssSign(format!(
                "expected {} signatures, got {}",
                messages.len(),
                response.signatures.len()
            )));
        }
        Ok(response.signatures)
    }

    async fn key_gen(
        &self,
        block_height: i64,
        participants: Vec<String>,
    ) -> BridgeResult<String> {
        let request = KeyGenRequest {
            keys: participants,
            block_height,
            version: TSS_VERSION,
        };
        let response = self
            .client
            .post(format!("{}/keygen", self.base_url))
            .timeout(QUERY_TIMEOUT * 20)
            .json(&request)
            .send()
            .await
            .map_err(|e| BridgeError::TransientRpc(format!("tss keygen: {}", e)))?
            .json::<KeyGenResponse>()
            .await
            .map_err(|e| BridgeError::Rpc(format!("tss keygen response: {}", e)))?;
        if response.status != 1 {
            let reason = response
                .blame
                .map(|b| b.fail_reason)
                .unwrap_or_else(|| "keygen failed".to_string());
            return Err(BridgeError::TssSign(reason));
        }
        Ok(response.pub_key)
    }
}
