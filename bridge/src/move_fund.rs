// Copyright (c) Oppy Finance
// SPDX-License-Identifier: Apache-2.0

//! Deferred tasks that drain retired custody pools.
//!
//! When a pool rotates out, a move-fund item is recorded for each chain
//! side with a height before which the drain must not be attempted. Each
//! tick pops at most one eligible item; a failed attempt is re-scheduled
//! at the current height and retried on the next tick.

use crate::app_chain::{AppChainMsg, AppChainRpc, BroadcastMode, SignDoc, SignedAppTx};
use crate::error::{BridgeError, BridgeResult};
use crate::pub_chain::{build_transfer_tx, PubChainRpc};
use crate::token_list::{TokenList, NATIVE_TOKEN_ADDRESS};
use crate::tss::TssRpc;
use ethers::types::{Address as EthAddress, U256};
use oppy_bridge_types::constants::{
    MOVEFUND_PUB_CHAIN_GAS_FEE_RATIO, PUB_CHAIN_ERC20_GAS, PUB_CHAIN_TRANSFER_GAS, ROUND_BLOCK,
};
use oppy_bridge_types::{AccAddress, PoolInfo};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MoveFundItem {
    pub pool: PoolInfo,
    pub not_before_height: i64,
}

#[derive(Default)]
pub struct MoveFundTracker {
    items: Vec<MoveFundItem>,
}

impl MoveFundTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_move_fund_item(&mut self, pool: PoolInfo, not_before_height: i64) {
        self.items.push(MoveFundItem {
            pool,
            not_before_height,
        });
    }

    /// Remove and return the earliest item whose gate height has passed.
    pub fn pop_move_fund_item_after_block(&mut self, current_height: i64) -> Option<MoveFundItem> {
        let pos = self
            .items
            .iter()
            .enumerate()
            .filter(|(_, item)| item.not_before_height <= current_height)
            .min_by_key(|(_, item)| item.not_before_height)
            .map(|(pos, _)| pos)?;
        Some(self.items.remove(pos))
    }

    pub fn import(&mut self, items: Vec<MoveFundItem>) {
        for item in items {
            self.items.push(item);
        }
    }

    pub fn export(&self) -> Vec<MoveFundItem> {
        self.items.clone()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Drain the retired pool's app-chain account into the current pool.
/// Returns `Ok(true)` once the account is empty, which also makes the
/// whole operation idempotent under re-drives.
pub async fn drain_app_pool<A: AppChainRpc, T: TssRpc>(
    app: &Arc<A>,
    tss: &Arc<T>,
    retired: &PoolInfo,
    destination: &AccAddress,
    current_height: i64,
) -> BridgeResult<bool> {
    let balance = app.query_balance(&retired.app_address).await?;
    if balance.is_empty() || balance.iter().all(|coin| coin.amount.is_zero()) {
        info!("retired pool {} already empty", retired.app_address);
        return Ok(true);
    }

    let account = app.query_account(&retired.app_address).await?;
    let sign_doc = SignDoc {
        chain_id: app.chain_id(),
        account_number: account.account_number,
        sequence: account.sequence,
        msgs: vec![AppChainMsg::Send {
            from_address: retired.app_address.to_string(),
            to_address: destination.to_string(),
            amount: balance.clone(),
        }],
        memo: String::new(),
    };
    // every committee member derives the same round from the gate height
    let signatures = tss
        .key_sign(
            &retired.pub_key,
            &[sign_doc.sign_bytes()],
            current_height / ROUND_BLOCK,
            None,
        )
        .await?;
    let signed = SignedAppTx::assemble(sign_doc, &retired.pub_key, &signatures[0])?;
    let response = app.broadcast_tx(&signed, BroadcastMode::Block).await?;
    if response.code != 0 {
        return Err(BridgeError::BroadcastRejected {
            code: response.code,
            log: response.raw_log,
        });
    }
    info!(
        "moved {} coins from retired pool {} to {}",
        balance.len(),
        retired.app_address,
        destination
    );
    Ok(false)
}

/// Drain the retired pool's pub-chain holdings: listed ERC-20 balances
/// first, then the native coin minus the gas needed to move it.
pub async fn drain_pub_pool<P: PubChainRpc, T: TssRpc>(
    pub_chain: &Arc<P>,
    tss: &Arc<T>,
    token_list: &Arc<TokenList>,
    retired: &PoolInfo,
    destination: EthAddress,
    current_height: i64,
) -> BridgeResult<bool> {
    let chain_id = pub_chain.chain_id();
    let gas_price = pub_chain.suggest_gas_price().await?;
    let priced = U256::from(
        (gas_price.as_u128() as f64 * MOVEFUND_PUB_CHAIN_GAS_FEE_RATIO) as u128,
    );
    let round = current_height / ROUND_BLOCK;
    let mut moved_any = false;

    let mut nonce = pub_chain.pending_nonce(retired.eth_address).await?;
    for entry in token_list.entries() {
        if entry.address == NATIVE_TOKEN_ADDRESS {
            continue;
        }
        let Ok(token) = EthAddress::from_str(&entry.address) else {
            continue;
        };
        let balance = pub_chain.erc20_balance(token, retired.eth_address).await?;
        if balance.is_zero() {
            continue;
        }
        let tx = build_transfer_tx(
            destination,
            Some(token),
            balance,
            nonce,
            priced,
            U256::from(PUB_CHAIN_ERC20_GAS),
            chain_id,
        );
        let signatures = tss
            .key_sign(&retired.pub_key, &[tx.sighash().into()], round, None)
            .await?;
        let raw = tx.rlp_signed(&signatures[0].to_eth_signature(chain_id)?);
        let hash = pub_chain.send_raw_transaction(raw).await?;
        info!(
            "moving {} {} out of retired pool in {:#x}",
            balance, entry.denom, hash
        );
        nonce += 1;
        moved_any = true;
    }

    let native = pub_chain.native_balance(retired.eth_address).await?;
    let gas_cost = priced * U256::from(PUB_CHAIN_TRANSFER_GAS);
    if native <= gas_cost {
        if moved_any {
            // token transfers are still in flight; check again next tick
            return Ok(false);
        }
        info!("retired pool {:#x} holds dust only", retired.eth_address);
        return Ok(true);
    }
    let amount = native - gas_cost;
    let tx = build_transfer_tx(
        destination,
        None,
        amount,
        nonce,
        priced,
        U256::from(PUB_CHAIN_TRANSFER_GAS),
        chain_id,
    );
    let signatures = tss
        .key_sign(&retired.pub_key, &[tx.sighash().into()], round, None)
        .await?;
    let raw = tx.rlp_signed(&signatures[0].to_eth_signature(chain_id)?);
    let hash = pub_chain.send_raw_transaction(raw).await?;
    info!(
        "moving native balance {} out of retired pool in {:#x}",
        amount, hash
    );
    if !pub_chain.receipt_status_ok(hash).await.unwrap_or(false) {
        warn!("move-fund receipt not yet confirmed, will re-check");
    }
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use oppy_bridge_types::pool::RawPoolDescriptor;

    fn pool(height: i64, seed: u8) -> PoolInfo {
        PoolInfo {
            pub_key: format!("oppypub1seed{}", seed),
            app_address: oppy_bridge_types::AccAddress::new("oppy", [seed; 20]),
            eth_address: EthAddress::repeat_byte(seed),
            raw: RawPoolDescriptor {
                pool_pubkey: format!("oppypub1seed{}", seed),
                nodes: vec![],
                block_height: height,
            },
        }
    }

    #[test]
    fn pop_respects_gate_height() {
        let mut tracker = MoveFundTracker::new();
        tracker.add_move_fund_item(pool(1, 1), 100);
        assert!(tracker.pop_move_fund_item_after_block(99).is_none());
        let item = tracker.pop_move_fund_item_after_block(100).unwrap();
        assert_eq!(item.not_before_height, 100);
        assert!(tracker.is_empty());
    }

    #[test]
    fn earliest_eligible_item_pops_first() {
        let mut tracker = MoveFundTracker::new();
        tracker.add_move_fund_item(pool(1, 1), 50);
        tracker.add_move_fund_item(pool(2, 2), 30);
        tracker.add_move_fund_item(pool(3, 3), 500);

        let first = tracker.pop_move_fund_item_after_block(100).unwrap();
        assert_eq!(first.not_before_height, 30);
        let second = tracker.pop_move_fund_item_after_block(100).unwrap();
        assert_eq!(second.not_before_height, 50);
        // the far-future item stays behind its gate
        assert!(tracker.pop_move_fund_item_after_block(100).is_none());
        assert_eq!(tracker.len(), 1);
    }

    #[test]
    fn failed_drain_reschedules_for_next_tick() {
        let mut tracker = MoveFundTracker::new();
        tracker.add_move_fund_item(pool(1, 1), 10);
        let item = tracker.pop_move_fund_item_after_block(20).unwrap();
        // the drain failed; put it back at the current height
        tracker.add_move_fund_item(item.pool, 20);
        assert!(tracker.pop_move_fund_item_after_block(20).is_some());
    }

    #[test]
    fn export_import_round_trip() {
        let mut tracker = MoveFundTracker::new();
        tracker.add_move_fund_item(pool(1, 1), 5);
        tracker.add_move_fund_item(pool(2, 2), 6);
        let snapshot = tracker.export();

        let mut restored = MoveFundTracker::new();
        restored.import(snapshot);
        assert_eq!(restored.len(), 2);
    }
}
