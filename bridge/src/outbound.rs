// Copyright (c) Oppy Finance
// SPDX-License-Identifier: Apache-2.0

//! Outbound pipeline: app-chain withdrawals become pub-chain payouts.
//!
//! Detection reads bank sends into the custody pools carrying a
//! token + fee coin pair; submission builds the EVM transfer, has the
//! committee sign its EIP-155 digest, broadcasts it and finally records
//! the payout hash back on the app chain so the other operators can skip
//! the item.

use crate::app_chain::{
    AppChainMsg, AppChainRpc, AppMsg, AppTx, BroadcastMode, SignDoc, SignedAppTx,
};
use crate::error::{BridgeError, BridgeResult};
use crate::pool_registry::PoolRegistry;
use crate::pub_chain::{build_transfer_tx, PubChainRpc};
use crate::retry_with_max_elapsed_time;
use crate::token_list::{TokenEntry, TokenList, NATIVE_TOKEN_ADDRESS};
use crate::tss::TssRpc;
use ethers::types::{Address as EthAddress, H256, U256};
use oppy_bridge_types::address::pubkey_to_eth_address;
use oppy_bridge_types::constants::{
    GAS_FEE_RATIO, IBC_CHAIN_HRP, IBC_TIMEOUT_BLOCKS, OUT_BOUND_DENOM_FEE, OUT_BOUND_FEE_MIN,
    PUB_CHAIN_ERC20_GAS, PUB_CHAIN_GAS_FEE_RATIO,
};
use oppy_bridge_types::{AccAddress, BridgeMemo, ChainClass, Coin, OutBoundReq};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const IBC_CHANNEL: &str = "channel-0";

/// Scans processable app-chain blocks for withdrawals to the pools.
pub struct OutboundScanner<A> {
    app: Arc<A>,
    token_list: Arc<TokenList>,
    registry: Arc<PoolRegistry>,
}

impl<A: AppChainRpc> OutboundScanner<A> {
    pub fn new(app: Arc<A>, token_list: Arc<TokenList>, registry: Arc<PoolRegistry>) -> Self {
        Self {
            app,
            token_list,
            registry,
        }
    }

    /// Walk one block's transactions and return every valid withdrawal.
    pub async fn process_block(&self, height: i64) -> BridgeResult<Vec<OutBoundReq>> {
        let txs = self.app.get_block_txs(height).await?;
        let mut requests = Vec::new();
        for tx in &txs {
            match self.check_tx(tx, height).await {
                Ok(Some(req)) => requests.push(req),
                Ok(None) => {}
                Err(err) => debug!(
                    "withdrawal candidate {} dropped: {}",
                    hex::encode(&tx.hash),
                    err
                ),
            }
        }
        if !requests.is_empty() {
            info!(
                "found {} withdrawals in app block {}",
                requests.len(),
                height
            );
        }
        Ok(requests)
    }

    async fn check_tx(&self, tx: &AppTx, height: i64) -> BridgeResult<Option<OutBoundReq>> {
        let pools = self.registry.get();
        let Some(current) = pools[1].as_ref() else {
            return Ok(None);
        };
        let previous = pools[0].as_ref();

        for msg in &tx.msgs {
            let AppMsg::Send {
                from_address,
                to_address,
                amount,
            } = msg;
            let to_pool = *to_address == current.app_address
                || previous.map(|p| *to_address == p.app_address).unwrap_or(false);
            if !to_pool {
                continue;
            }
            if amount.len() != 2 {
                return Err(BridgeError::InvalidDeposit(
                    "exactly one token and one fee coin are required".into(),
                ));
            }

            let (token, fee) = match (
                amount[0].denom == OUT_BOUND_DENOM_FEE,
                amount[1].denom == OUT_BOUND_DENOM_FEE,
            ) {
                (false, true) => (&amount[0], &amount[1]),
                (true, false) => (&amount[1], &amount[0]),
                _ => {
                    return Err(BridgeError::InvalidDeposit("invalid fee pair".into()));
                }
            };
            if fee.amount < U256::from(OUT_BOUND_FEE_MIN) {
                return Err(BridgeError::InvalidDeposit(format!(
                    "fee {} below the minimum {}",
                    fee.amount, OUT_BOUND_FEE_MIN
                )));
            }
            if self.token_list.get_by_denom(&token.denom).is_none() {
                return Err(BridgeError::InvalidDeposit(format!(
                    "denom {} is not bridgeable",
                    token.denom
                )));
            }

            // the sender must be a proper secp256k1 account; its pub-chain
            // address anchors the request identity on disputes
            let account = self.app.query_account(from_address).await?;
            let sender_pubkey = account.pub_key.ok_or_else(|| {
                BridgeError::InvalidDeposit("sender account has no public key".into())
            })?;
            pubkey_to_eth_address(&sender_pubkey)
                .map_err(|e| BridgeError::InvalidDeposit(e.to_string()))?;

            let (receiver, chain_class, ibc_receiver) = parse_outbound_target(&tx.memo)?;
            let tx_id = hex::encode(&tx.hash);
            return Ok(Some(OutBoundReq::new(
                tx_id,
                receiver,
                current.eth_address,
                token.clone(),
                chain_class,
                ibc_receiver,
                height,
            )));
        }
        Ok(None)
    }
}

/// Resolve the payout target from a withdrawal memo: either a raw EVM
/// address or a JSON memo routing to the IBC side chain.
fn parse_outbound_target(memo: &str) -> BridgeResult<(EthAddress, ChainClass, String)> {
    let trimmed = memo.trim();
    if let Some(parsed) = BridgeMemo::parse(trimmed.as_bytes()) {
        match parsed.chain_class() {
            ChainClass::Ibc => {
                let dest = AccAddress::from_bech32_with_hrp(IBC_CHAIN_HRP, &parsed.dest)
                    .map_err(|e| BridgeError::InvalidDeposit(e.to_string()))?;
                return Ok((dest.to_eth(), ChainClass::Ibc, parsed.dest));
            }
            ChainClass::Native => {
                let addr = EthAddress::from_str(parsed.dest.trim())
                    .map_err(|e| BridgeError::InvalidDeposit(format!("bad dest: {}", e)))?;
                return Ok((addr, ChainClass::Native, String::new()));
            }
        }
    }
    if trimmed.contains(IBC_CHAIN_HRP) {
        let dest = AccAddress::from_bech32_with_hrp(IBC_CHAIN_HRP, trimmed)
            .map_err(|e| BridgeError::InvalidDeposit(e.to_string()))?;
        return Ok((dest.to_eth(), ChainClass::Ibc, trimmed.to_string()));
    }
    let addr = EthAddress::from_str(trimmed)
        .map_err(|e| BridgeError::InvalidDeposit(format!("bad memo address: {}", e)))?;
    Ok((addr, ChainClass::Native, String::new()))
}

/// Outcome of one native payout attempt.
pub enum OutboundSubmission {
    Broadcast { tx_hash: H256 },
    /// Another operator already landed it.
    AlreadyPaid,
}

/// Builds, co-signs and broadcasts outbound payouts.
pub struct OutboundProcessor<A, P, T> {
    app: Arc<A>,
    pub_chain: Arc<P>,
    tss: Arc<T>,
    token_list: Arc<TokenList>,
    /// Serializes the record-keeping submissions back to the app chain.
    submit_lock: Arc<Mutex<()>>,
}

impl<A: AppChainRpc, P: PubChainRpc, T: TssRpc> OutboundProcessor<A, P, T> {
    pub fn new(app: Arc<A>, pub_chain: Arc<P>, tss: Arc<T>, token_list: Arc<TokenList>) -> Self {
        Self {
            app,
            pub_chain,
            tss,
            token_list,
            submit_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Pay out one native outbound request on the pub chain.
    pub async fn process_outbound(
        &self,
        item: &OutBoundReq,
        pool_pubkey: &str,
        gas_price: U256,
    ) -> BridgeResult<OutboundSubmission> {
        let index = format!("{:#x}", item.hash());

        // another operator may have been faster; trust the on-chain record
        // only if its receipt checks out
        if let Some(recorded) = self.app.get_pub_chain_submitted_tx(&index).await? {
            if let Ok(hash) = H256::from_str(recorded.trim_start_matches("0x")) {
                if self.pub_chain.receipt_status_ok(hash).await.unwrap_or(false) {
                    info!("outbound {} already paid in {}, skipping", index, recorded);
                    return Ok(OutboundSubmission::AlreadyPaid);
                }
            }
        }

        let token = self
            .token_list_entry(&item.coin)
            .ok_or_else(|| BridgeError::Generic(format!("denom {} unlisted", item.coin.denom)))?;
        let contract = match token.address.as_str() {
            NATIVE_TOKEN_ADDRESS => None,
            addr => Some(
                EthAddress::from_str(addr)
                    .map_err(|e| BridgeError::Generic(format!("bad token address: {}", e)))?,
            ),
        };
        let amount = item.coin.external_amount(token.decimals);
        let chain_id = self.pub_chain.chain_id();
        let priced = gas_price * U256::from(PUB_CHAIN_GAS_FEE_RATIO);

        let mut tx = build_transfer_tx(
            item.receiver,
            contract,
            amount,
            item.nonce,
            priced,
            U256::from(PUB_CHAIN_ERC20_GAS),
            chain_id,
        );
        let gas_limit = match self.pub_chain.estimate_gas(&tx).await {
            Ok(estimate) => {
                U256::from((estimate.as_u64() as f64 * GAS_FEE_RATIO) as u64)
            }
            Err(err) => {
                debug!("gas estimation failed, using default: {}", err);
                U256::from(PUB_CHAIN_ERC20_GAS)
            }
        };
        tx.set_gas(gas_limit);

        let sighash = tx.sighash();
        let signatures = self
            .tss
            .key_sign(
                pool_pubkey,
                &[sighash.into()],
                item.round_block_height,
                None,
            )
            .await?;
        let signature = signatures[0].to_eth_signature(chain_id)?;
        let raw = tx.rlp_signed(&signature);

        let tx_hash = self.pub_chain.send_raw_transaction(raw).await?;
        info!(
            "outbound payout {} broadcast as {:#x} ({} to {:#x})",
            index, tx_hash, item.coin, item.receiver
        );
        Ok(OutboundSubmission::Broadcast { tx_hash })
    }

    fn token_list_entry(&self, coin: &Coin) -> Option<TokenEntry> {
        self.token_list.get_by_denom(&coin.denom)
    }

    /// Poll the payout receipt; on success record the pub-chain hash back
    /// on the app chain so peers drop the item.
    pub async fn verify_and_record(
        &self,
        item: &OutBoundReq,
        tx_hash: H256,
        pool_create_height: i64,
    ) -> BridgeResult<()> {
        let confirmed = retry_with_max_elapsed_time!(
            async {
                if self.pub_chain.receipt_status_ok(tx_hash).await? {
                    Ok(())
                } else {
                    Err(BridgeError::StatusUnconfirmed(format!("{:#x}", tx_hash)))
                }
            },
            Duration::from_secs(60)
        );
        if !matches!(confirmed, Ok(Ok(()))) {
            return Err(BridgeError::StatusUnconfirmed(format!("{:#x}", tx_hash)));
        }

        let index = format!("{:#x}", item.hash());
        let _guard = self.submit_lock.lock().await;
        let result = retry_with_max_elapsed_time!(
            self.app
                .submit_outbound_tx(&index, pool_create_height, &format!("{:#x}", tx_hash)),
            Duration::from_secs(60)
        );
        match result {
            Ok(Ok(())) => {
                info!("recorded outbound {} -> {:#x} on app chain", index, tx_hash);
                Ok(())
            }
            _ => {
                warn!("failed to record outbound {} after backoff", index);
                Err(BridgeError::Rpc(format!(
                    "submit record for {} failed",
                    index
                )))
            }
        }
    }

    /// Submit one IBC batch: transfers leave the pool account with
    /// consecutive sequences, each co-signed by the committee.
    pub async fn process_ibc_batch(
        &self,
        items: &[OutBoundReq],
        pool_pubkey: &str,
        pool_address: &AccAddress,
        pool_create_height: i64,
        latest_height: i64,
    ) -> BridgeResult<()> {
        let timeout_height = latest_height + IBC_TIMEOUT_BLOCKS;
        let mut failures = 0usize;
        for item in items {
            let sign_doc = SignDoc {
                chain_id: self.app.chain_id(),
                account_number: item.cos_acc_num,
                sequence: item.cos_acc_seq,
                msgs: vec![AppChainMsg::IbcTransfer {
                    source_channel: IBC_CHANNEL.to_string(),
                    token: item.coin.clone(),
                    sender: pool_address.to_string(),
                    receiver: item.ibc_receiver.clone(),
                    timeout_height,
                }],
                memo: String::new(),
            };
            let signatures = self
                .tss
                .key_sign(
                    pool_pubkey,
                    &[sign_doc.sign_bytes()],
                    item.round_block_height,
                    None,
                )
                .await?;
            let signed = SignedAppTx::assemble(sign_doc, pool_pubkey, &signatures[0])?;
            let response = self.app.broadcast_tx(&signed, BroadcastMode::Sync).await?;
            if response.code != 0 {
                warn!(
                    "ibc transfer for {} rejected: {}",
                    item.tx_id, response.raw_log
                );
                failures += 1;
                continue;
            }
            let index = format!("{:#x}", item.hash());
            let _guard = self.submit_lock.lock().await;
            let record = retry_with_max_elapsed_time!(
                self.app
                    .submit_outbound_tx(&index, pool_create_height, &response.tx_hash),
                Duration::from_secs(60)
            );
            if !matches!(record, Ok(Ok(()))) {
                warn!("failed to record ibc outbound {}", index);
            }
        }
        if failures > 0 {
            return Err(BridgeError::Generic(format!(
                "{} of {} ibc transfers failed",
                failures,
                items.len()
            )));
        }
        Ok(())
    }
}
