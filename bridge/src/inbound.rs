// Copyright (c) Oppy Finance
// SPDX-License-Identifier: Apache-2.0

//! Inbound pipeline: pub-chain deposits become app-chain issue
//! transactions.
//!
//! Detection walks every transaction of a confirmed block (the event loop
//! stays `rollback_gap` behind the tip), either through the bridge
//! contract's `oppyTransfer` call or as a native transfer straight to a
//! pool address with a JSON memo. Batching and queueing stay in the event
//! loop; the processor here performs the per-item submission and status
//! verification.

use crate::app_chain::{AppChainMsg, AppChainRpc, BroadcastMode, SignDoc, SignedAppTx};
use crate::error::{BridgeError, BridgeResult};
use crate::pool_registry::PoolRegistry;
use crate::pub_chain::{PubChainRpc, PubTx};
use crate::token_list::{TokenList, NATIVE_TOKEN_ADDRESS};
use crate::tss::TssRpc;
use crate::retry_with_max_elapsed_time;
use ethers::abi::ParamType;
use ethers::types::Address as EthAddress;
use ethers::utils::id as selector_of;
use once_cell::sync::Lazy;
use oppy_bridge_types::constants::{APP_CHAIN_HRP, IBC_CHAIN_HRP};
use oppy_bridge_types::{AccAddress, BridgeMemo, ChainClass, Coin, InboundReq};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

static OPPY_TRANSFER_SELECTOR: Lazy<[u8; 4]> =
    Lazy::new(|| selector_of("oppyTransfer(address,uint256,address,bytes)"));

/// Decoded `oppyTransfer` call.
struct ContractDeposit {
    to_addr: EthAddress,
    amount: ethers::types::U256,
    token_address: EthAddress,
    memo: BridgeMemo,
}

fn decode_oppy_transfer(data: &[u8]) -> Option<ContractDeposit> {
    if data.len() < 4 || data[..4] != *OPPY_TRANSFER_SELECTOR {
        return None;
    }
    let tokens = ethers::abi::decode(
        &[
            ParamType::Address,
            ParamType::Uint(256),
            ParamType::Address,
            ParamType::Bytes,
        ],
        &data[4..],
    )
    .ok()?;
    let memo = BridgeMemo::parse(&tokens[3].clone().into_bytes()?)?;
    Some(ContractDeposit {
        to_addr: tokens[0].clone().into_address()?,
        amount: tokens[1].clone().into_uint()?,
        token_address: tokens[2].clone().into_address()?,
        memo,
    })
}

fn parse_destination(memo: &BridgeMemo) -> BridgeResult<(AccAddress, ChainClass)> {
    match memo.chain_class() {
        ChainClass::Ibc => {
            let addr = AccAddress::from_bech32_with_hrp(IBC_CHAIN_HRP, &memo.dest)
                .map_err(|e| BridgeError::InvalidDeposit(e.to_string()))?;
            Ok((addr, ChainClass::Ibc))
        }
        ChainClass::Native => {
            let addr = AccAddress::from_bech32_with_hrp(APP_CHAIN_HRP, &memo.dest)
                .map_err(|e| BridgeError::InvalidDeposit(e.to_string()))?;
            Ok((addr, ChainClass::Native))
        }
    }
}

/// Scans confirmed pub-chain blocks for deposits into the custody pools.
pub struct InboundScanner<P> {
    pub_chain: Arc<P>,
    token_list: Arc<TokenList>,
    registry: Arc<PoolRegistry>,
    bridge_contract: EthAddress,
}

impl<P: PubChainRpc> InboundScanner<P> {
    pub fn new(
        pub_chain: Arc<P>,
        token_list: Arc<TokenList>,
        registry: Arc<PoolRegistry>,
        bridge_contract: EthAddress,
    ) -> Self {
        Self {
            pub_chain,
            token_list,
            registry,
            bridge_contract,
        }
    }

    /// Scan one block and return every valid deposit found in it.
    /// Invalid candidates are logged and dropped; they never enter the
    /// queue.
    pub async fn process_new_block(&self, height: u64) -> BridgeResult<Vec<InboundReq>> {
        let block = self.pub_chain.block_by_number(height).await?;
        let mut deposits = Vec::new();
        for tx in &block.txs {
            match self.check_tx(tx, height).await {
                Ok(Some(req)) => deposits.push(req),
                Ok(None) => {}
                Err(err) => debug!("deposit candidate {} dropped: {}", tx.hash, err),
            }
        }
        if !deposits.is_empty() {
            info!("found {} deposits in pub block {}", deposits.len(), height);
        }
        Ok(deposits)
    }

    async fn check_tx(&self, tx: &PubTx, height: u64) -> BridgeResult<Option<InboundReq>> {
        let Some(to) = tx.to else { return Ok(None) };

        if to == self.bridge_contract {
            let Some(call) = decode_oppy_transfer(&tx.data) else {
                return Ok(None);
            };
            if !self.registry.contains_eth_address(call.to_addr) {
                return Err(BridgeError::InvalidDeposit(
                    "transfer is not into a custody pool".into(),
                ));
            }
            let token = self
                .token_list
                .get_by_address(&format!("{:#x}", call.token_address))
                .ok_or_else(|| {
                    BridgeError::InvalidDeposit(format!(
                        "token {:#x} is not on the allow-list",
                        call.token_address
                    ))
                })?;
            if !self.pub_chain.receipt_status_ok(tx.hash).await? {
                return Err(BridgeError::InvalidDeposit("deposit tx reverted".into()));
            }
            let (dest, chain_class) = parse_destination(&call.memo)?;
            let mut coin = Coin::new(&token.denom, call.amount);
            coin.adjust_precision(token.decimals);
            return Ok(Some(InboundReq::new(
                dest,
                tx.hash.as_bytes().to_vec(),
                call.to_addr,
                coin,
                chain_class,
                height as i64,
            )));
        }

        if self.registry.contains_eth_address(to) {
            // native coin straight to the pool, memo in calldata
            let Some(memo) = BridgeMemo::parse(&tx.data) else {
                return Ok(None);
            };
            let token = self
                .token_list
                .get_by_address(NATIVE_TOKEN_ADDRESS)
                .ok_or_else(|| BridgeError::InvalidDeposit("native token not listed".into()))?;
            if tx.value.is_zero() {
                return Err(BridgeError::InvalidDeposit("zero value deposit".into()));
            }
            if !self.pub_chain.receipt_status_ok(tx.hash).await? {
                return Err(BridgeError::InvalidDeposit("deposit tx reverted".into()));
            }
            let (dest, chain_class) = parse_destination(&memo)?;
            let mut coin = Coin::new(&token.denom, tx.value);
            coin.adjust_precision(token.decimals);
            return Ok(Some(InboundReq::new(
                dest,
                tx.hash.as_bytes().to_vec(),
                to,
                coin,
                chain_class,
                height as i64,
            )));
        }

        Ok(None)
    }
}

/// Submits batched inbound requests to the app chain and verifies their
/// landing.
pub struct InboundProcessor<A, T> {
    app: Arc<A>,
    tss: Arc<T>,
}

/// Outcome of one submission attempt.
#[derive(Debug)]
pub enum InboundSubmission {
    /// We broadcast the issue tx ourselves.
    Broadcast { tx_hash: String, index: String },
    /// The record already exists; another signer was faster.
    AlreadyIssued { index: String },
}

impl<A: AppChainRpc, T: TssRpc> InboundProcessor<A, T> {
    pub fn new(app: Arc<A>, tss: Arc<T>) -> Self {
        Self { app, tss }
    }

    /// Build, co-sign and broadcast the issue transaction for one batched
    /// request.
    pub async fn process_inbound(&self, item: &InboundReq) -> BridgeResult<InboundSubmission> {
        let index = format!("{:#x}", item.hash());
        if self.app.issue_token_exists(&index).await? {
            info!("issue record {} already on chain, skipping", index);
            return Ok(InboundSubmission::AlreadyIssued { index });
        }

        let pool_address = item
            .pool_app_address
            .clone()
            .ok_or_else(|| BridgeError::Generic("request was never batched".into()))?;
        let sign_doc = SignDoc {
            chain_id: self.app.chain_id(),
            account_number: item.acc_num,
            sequence: item.acc_seq,
            msgs: vec![AppChainMsg::IssueToken {
                creator: pool_address.to_string(),
                index: index.clone(),
                coin: item.coin.clone(),
                receiver: item.dest.to_string(),
            }],
            memo: String::new(),
        };

        let signatures = self
            .tss
            .key_sign(
                &item.pool_pubkey,
                &[sign_doc.sign_bytes()],
                item.round_block_height,
                None,
            )
            .await?;
        let signed = SignedAppTx::assemble(sign_doc, &item.pool_pubkey, &signatures[0])?;

        let response = self.app.broadcast_tx(&signed, BroadcastMode::Block).await?;
        if response.code != 0 {
            // another operator landing the same index first is a success
            if self.app.issue_token_exists(&index).await? {
                return Ok(InboundSubmission::AlreadyIssued { index });
            }
            return Err(BridgeError::BroadcastRejected {
                code: response.code,
                log: response.raw_log,
            });
        }
        info!("issue tx {} broadcast for index {}", response.tx_hash, index);
        Ok(InboundSubmission::Broadcast {
            tx_hash: response.tx_hash,
            index,
        })
    }

    /// Poll until the issue record appears on chain, up to about a minute.
    pub async fn check_issue_status(&self, index: &str) -> BridgeResult<()> {
        let result = retry_with_max_elapsed_time!(
            async {
                if self.app.issue_token_exists(index).await? {
                    Ok(())
                } else {
                    Err(BridgeError::StatusUnconfirmed(index.to_string()))
                }
            },
            Duration::from_secs(60)
        );
        match result {
            Ok(Ok(())) => Ok(()),
            _ => {
                warn!("issue record {} still unseen after retries", index);
                Err(BridgeError::StatusUnconfirmed(index.to_string()))
            }
        }
    }
}
