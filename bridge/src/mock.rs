// Copyright (c) Oppy Finance
// SPDX-License-Identifier: Apache-2.0

//! Mock chain and signer adapters backing the test suite. Each mock keeps
//! its scripted state behind a mutex so tests can adjust behavior while
//! the code under test holds an `Arc` to it.

use crate::app_chain::{
    AppAccount, AppChainEvent, AppChainRpc, AppTx, BroadcastMode, SignedAppTx, TxResponse,
};
use crate::error::{BridgeError, BridgeResult};
use crate::pub_chain::{BlockHead, PubBlock, PubChainRpc};
use crate::tss::TssRpc;
use async_trait::async_trait;
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address as EthAddress, Bytes, H256, U256};
use oppy_bridge_types::pool::RawPoolDescriptor;
use oppy_bridge_types::{AccAddress, Coin, TssSignature};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Default)]
pub struct MockAppChain {
    pub operator: Mutex<Option<AccAddress>>,
    pub latest_height: AtomicU64,
    pub blocks: Mutex<HashMap<i64, Vec<AppTx>>>,
    pub accounts: Mutex<HashMap<String, AppAccount>>,
    pub balances: Mutex<HashMap<String, Vec<Coin>>>,
    pub pools: Mutex<Vec<RawPoolDescriptor>>,
    pub issued_indices: Mutex<HashSet<String>>,
    pub submitted_records: Mutex<HashMap<String, String>>,
    pub broadcasts: Mutex<Vec<SignedAppTx>>,
    /// Scripted responses for upcoming broadcasts; empty means accept.
    pub broadcast_results: Mutex<Vec<TxResponse>>,
    /// When set, broadcasting an issue tx also lands the record.
    pub auto_issue_on_broadcast: Mutex<bool>,
}

impl MockAppChain {
    pub fn new() -> Self {
        let mock = Self::default();
        *mock.auto_issue_on_broadcast.lock().unwrap() = true;
        mock
    }

    pub fn set_operator(&self, operator: AccAddress) {
        *self.operator.lock().unwrap() = Some(operator);
    }

    pub fn put_account(&self, account: AppAccount) {
        self.accounts
            .lock()
            .unwrap()
            .insert(account.address.to_string(), account);
    }

    pub fn mark_issued(&self, index: &str) {
        self.issued_indices.lock().unwrap().insert(index.to_string());
    }
}

#[async_trait]
impl AppChainRpc for MockAppChain {
    async fn subscribe_events(
        &self,
        _cancel: CancellationToken,
    ) -> BridgeResult<mpsc::Receiver<AppChainEvent>> {
        let (_tx, rx) = mpsc::channel(8);
        Ok(rx)
    }

    async fn get_last_block_height(&self) -> BridgeResult<i64> {
        Ok(self.latest_height.load(Ordering::SeqCst) as i64)
    }

    async fn get_block_txs(&self, height: i64) -> BridgeResult<Vec<AppTx>> {
        Ok(self
            .blocks
            .lock()
            .unwrap()
            .get(&height)
            .cloned()
            .unwrap_or_default())
    }

    async fn query_account(&self, address: &AccAddress) -> BridgeResult<AppAccount> {
        self.accounts
            .lock()
            .unwrap()
            .get(&address.to_string())
            .cloned()
            .ok_or_else(|| BridgeError::Rpc(format!("no account {}", address)))
    }

    async fn query_balance(&self, address: &AccAddress) -> BridgeResult<Vec<Coin>> {
        Ok(self
            .balances
            .lock()
            .unwrap()
            .get(&address.to_string())
            .cloned()
            .unwrap_or_default())
    }

    async fn query_last_pool_address(&self) -> BridgeResult<Vec<RawPoolDescriptor>> {
        Ok(self.pools.lock().unwrap().clone())
    }

    async fn issue_token_exists(&self, index: &str) -> BridgeResult<bool> {
        Ok(self.issued_indices.lock().unwrap().contains(index))
    }

    async fn get_pub_chain_submitted_tx(&self, index: &str) -> BridgeResult<Option<String>> {
        Ok(self.submitted_records.lock().unwrap().get(index).cloned())
    }

    async fn broadcast_tx(
        &self,
        tx: &SignedAppTx,
        _mode: BroadcastMode,
    ) -> BridgeResult<TxResponse> {
        self.broadcasts.lock().unwrap().push(tx.clone());
        let scripted = self.broadcast_results.lock().unwrap().pop();
        let response = scripted.unwrap_or(TxResponse {
            code: 0,
            tx_hash: format!("{:064x}", self.broadcasts.lock().unwrap().len()),
            raw_log: String::new(),
        });
        if response.code == 0 && *self.auto_issue_on_broadcast.lock().unwrap() {
            for msg in &tx.sign_doc.msgs {
                if let crate::app_chain::AppChainMsg::IssueToken { index, .. } = msg {
                    self.mark_issued(index);
                }
            }
        }
        Ok(response)
    }

    async fn submit_outbound_tx(
        &self,
        index: &str,
        _pool_create_height: i64,
        pub_tx_hash: &str,
    ) -> BridgeResult<()> {
        self.submitted_records
            .lock()
            .unwrap()
            .insert(index.to_string(), pub_tx_hash.to_string());
        Ok(())
    }

    async fn check_whether_signer(&self, pool: &RawPoolDescriptor) -> BridgeResult<bool> {
        let operator = self.operator.lock().unwrap().clone();
        Ok(operator
            .map(|op| pool.nodes.iter().any(|node| *node == op))
            .unwrap_or(false))
    }

    fn chain_id(&self) -> String {
        "oppyChain-1".to_string()
    }

    async fn redial(&self) -> BridgeResult<()> {
        Ok(())
    }
}

#[derive(Default)]
pub struct MockPubChain {
    pub chain_id: u64,
    pub latest: AtomicU64,
    pub blocks: Mutex<HashMap<u64, PubBlock>>,
    pub receipts: Mutex<HashMap<H256, bool>>,
    pub nonces: Mutex<HashMap<EthAddress, u64>>,
    pub erc20_balances: Mutex<HashMap<(EthAddress, EthAddress), U256>>,
    pub native_balances: Mutex<HashMap<EthAddress, U256>>,
    pub sent_raw: Mutex<Vec<Bytes>>,
    /// Receipt status handed to txs broadcast through this mock.
    pub next_receipt_ok: Mutex<bool>,
}

impl MockPubChain {
    pub fn new(chain_id: u64) -> Self {
        let mock = Self {
            chain_id,
            ..Default::default()
        };
        *mock.next_receipt_ok.lock().unwrap() = true;
        mock
    }

    pub fn put_block(&self, block: PubBlock) {
        self.latest.fetch_max(block.height, Ordering::SeqCst);
        self.blocks.lock().unwrap().insert(block.height, block);
    }

    pub fn set_receipt(&self, hash: H256, ok: bool) {
        self.receipts.lock().unwrap().insert(hash, ok);
    }
}

#[async_trait]
impl PubChainRpc for MockPubChain {
    async fn subscribe_heads(
        &self,
        _cancel: CancellationToken,
    ) -> BridgeResult<mpsc::Receiver<BlockHead>> {
        let (_tx, rx) = mpsc::channel(8);
        Ok(rx)
    }

    async fn latest_height(&self) -> BridgeResult<u64> {
        Ok(self.latest.load(Ordering::SeqCst))
    }

    async fn block_by_number(&self, number: u64) -> BridgeResult<PubBlock> {
        self.blocks
            .lock()
            .unwrap()
            .get(&number)
            .cloned()
            .ok_or_else(|| BridgeError::Rpc(format!("block {} not found", number)))
    }

    async fn receipt_status_ok(&self, tx: H256) -> BridgeResult<bool> {
        Ok(self.receipts.lock().unwrap().get(&tx).copied().unwrap_or(false))
    }

    async fn suggest_gas_price(&self) -> BridgeResult<U256> {
        Ok(U256::from(1_000_000_000u64))
    }

    async fn pending_nonce(&self, address: EthAddress) -> BridgeResult<u64> {
        Ok(self.nonces.lock().unwrap().get(&address).copied().unwrap_or(0))
    }

    async fn estimate_gas(&self, _tx: &TypedTransaction) -> BridgeResult<U256> {
        Ok(U256::from(40_000u64))
    }

    async fn send_raw_transaction(&self, raw: Bytes) -> BridgeResult<H256> {
        let hash = H256::from(ethers::utils::keccak256(&raw));
        self.sent_raw.lock().unwrap().push(raw);
        let ok = *self.next_receipt_ok.lock().unwrap();
        self.receipts.lock().unwrap().insert(hash, ok);
        Ok(hash)
    }

    async fn erc20_balance(&self, token: EthAddress, owner: EthAddress) -> BridgeResult<U256> {
        Ok(self
            .erc20_balances
            .lock()
            .unwrap()
            .get(&(token, owner))
            .copied()
            .unwrap_or_default())
    }

    async fn native_balance(&self, owner: EthAddress) -> BridgeResult<U256> {
        Ok(self
            .native_balances
            .lock()
            .unwrap()
            .get(&owner)
            .copied()
            .unwrap_or_default())
    }

    fn chain_id(&self) -> u64 {
        self.chain_id
    }

    async fn redial(&self) -> BridgeResult<()> {
        Ok(())
    }
}

/// A deterministic signer: every request yields a fixed, well-formed
/// signature. Set `fail_remaining` to script a failure streak.
#[derive(Default)]
pub struct MockTss {
    pub fail_remaining: Mutex<u32>,
    pub sign_calls: Mutex<Vec<(String, usize, i64)>>,
}

impl MockTss {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self, n: u32) {
        *self.fail_remaining.lock().unwrap() = n;
    }
}

#[async_trait]
impl TssRpc for MockTss {
    async fn key_sign(
        &self,
        pool_pubkey: &str,
        messages: &[[u8; 32]],
        block_height: i64,
        _signers: Option<Vec<String>>,
    ) -> BridgeResult<Vec<TssSignature>> {
        self.sign_calls.lock().unwrap().push((
            pool_pubkey.to_string(),
            messages.len(),
            block_height,
        ));
        {
            let mut remaining = self.fail_remaining.lock().unwrap();
            if *remaining > 0 {
                *remaining -= 1;
                return Err(BridgeError::TssSign("quorum not reached".into()));
            }
        }
        Ok(messages
            .iter()
            .map(|_| TssSignature::from_scalars(U256::from(11u64), U256::from(7u64), 0))
            .collect())
    }

    async fn key_gen(
        &self,
        _block_height: i64,
        _participants: Vec<String>,
    ) -> BridgeResult<String> {
        Ok("oppypub1newpool".to_string())
    }
}
