// Copyright (c) Oppy Finance
// SPDX-License-Identifier: Apache-2.0

//! The pub-chain adapter: a narrow view of an EVM node.
//!
//! Everything the bridge needs from the public chain fits in a dozen
//! calls; the production implementation sits on an ethers websocket
//! provider that can be re-dialed when the watchdog fires.

use crate::error::{BridgeError, BridgeResult};
use async_trait::async_trait;
use ethers::abi::{self, Token};
use ethers::providers::{Middleware, Provider, Ws};
use futures::StreamExt;
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{
    Address as EthAddress, BlockId, Bytes, TransactionRequest, H256, U256,
};
use oppy_bridge_types::constants::QUERY_TIMEOUT;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// `transfer(address,uint256)`
const ERC20_TRANSFER_SELECTOR: [u8; 4] = [0xa9, 0x05, 0x9c, 0xbb];
/// `balanceOf(address)`
const ERC20_BALANCE_OF_SELECTOR: [u8; 4] = [0x70, 0xa0, 0x82, 0x31];

const HEAD_CHANNEL_SIZE: usize = 256;

/// A new chain tip, as delivered by the head subscription.
#[derive(Clone, Debug)]
pub struct BlockHead {
    pub height: u64,
    pub hash: H256,
}

/// One transaction of a scanned block, reduced to the fields the deposit
/// scanner looks at.
#[derive(Clone, Debug)]
pub struct PubTx {
    pub hash: H256,
    pub to: Option<EthAddress>,
    pub value: U256,
    pub data: Vec<u8>,
}

#[derive(Clone, Debug)]
pub struct PubBlock {
    pub height: u64,
    pub txs: Vec<PubTx>,
}

#[async_trait]
pub trait PubChainRpc: Send + Sync + 'static {
    /// Stream of new block heads; ends when the connection drops or the
    /// token fires, after which the watchdog re-subscribes.
    async fn subscribe_heads(
        &self,
        cancel: CancellationToken,
    ) -> BridgeResult<mpsc::Receiver<BlockHead>>;

    async fn latest_height(&self) -> BridgeResult<u64>;
    async fn block_by_number(&self, number: u64) -> BridgeResult<PubBlock>;
    /// `Ok(true)` iff the receipt exists with success status.
    async fn receipt_status_ok(&self, tx: H256) -> BridgeResult<bool>;
    async fn suggest_gas_price(&self) -> BridgeResult<U256>;
    async fn pending_nonce(&self, address: EthAddress) -> BridgeResult<u64>;
    async fn estimate_gas(&self, tx: &TypedTransaction) -> BridgeResult<U256>;
    async fn send_raw_transaction(&self, raw: Bytes) -> BridgeResult<H256>;
    async fn erc20_balance(&self, token: EthAddress, owner: EthAddress) -> BridgeResult<U256>;
    async fn native_balance(&self, owner: EthAddress) -> BridgeResult<U256>;
    fn chain_id(&self) -> u64;

    /// Drop and re-establish the underlying connection.
    async fn redial(&self) -> BridgeResult<()>;
}

/// Calldata of an ERC-20 `transfer(to, amount)`.
pub fn erc20_transfer_data(to: EthAddress, amount: U256) -> Vec<u8> {
    let mut data = ERC20_TRANSFER_SELECTOR.to_vec();
    data.extend(abi::encode(&[Token::Address(to), Token::Uint(amount)]));
    data
}

/// Assemble the legacy transfer transaction for one outbound payout.
/// `token = None` moves the native coin.
pub fn build_transfer_tx(
    to: EthAddress,
    token: Option<EthAddress>,
    amount: U256,
    nonce: u64,
    gas_price: U256,
    gas_limit: U256,
    chain_id: u64,
) -> TypedTransaction {
    let request = match token {
        Some(contract) => TransactionRequest::new()
            .to(contract)
            .value(0)
            .data(erc20_transfer_data(to, amount)),
        None => TransactionRequest::new().to(to).value(amount),
    };
    request
        .nonce(nonce)
        .gas_price(gas_price)
        .gas(gas_limit)
        .chain_id(chain_id)
        .into()
}

pub struct EthPubChainClient {
    ws_url: String,
    chain_id: u64,
    provider: tokio::sync::RwLock<Provider<Ws>>,
}

impl EthPubChainClient {
    pub async fn connect(ws_url: &str) -> BridgeResult<Self> {
        let provider = Self::dial(ws_url).await?;
        let chain_id = provider
            .get_chainid()
            .await
            .map_err(|e| BridgeError::TransientRpc(format!("chain id: {}", e)))?
            .as_u64();
        info!("connected to pub chain {} at {}", chain_id, ws_url);
        Ok(Self {
            ws_url: ws_url.to_string(),
            chain_id,
            provider: tokio::sync::RwLock::new(provider),
        })
    }

    async fn dial(ws_url: &str) -> BridgeResult<Provider<Ws>> {
        let ws = Ws::connect(ws_url)
            .await
            .map_err(|e| BridgeError::TransientRpc(format!("dial {}: {}", ws_url, e)))?;
        Ok(Provider::new(ws).interval(std::time::Duration::from_millis(500)))
    }

    async fn provider(&self) -> Provider<Ws> {
        self.provider.read().await.clone()
    }
}

#[async_trait]
impl PubChainRpc for EthPubChainClient {
    async fn subscribe_heads(
        &self,
        cancel: CancellationToken,
    ) -> BridgeResult<mpsc::Receiver<BlockHead>> {
        let provider = self.provider().await;
        let (tx, rx) = mpsc::channel(HEAD_CHANNEL_SIZE);
        tokio::spawn(async move {
            let mut stream = match provider.subscribe_blocks().await {
                Ok(stream) => stream,
                Err(err) => {
                    warn!("pub chain head subscription failed: {}", err);
                    return;
                }
            };
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    block = stream.next() => {
                        let Some(block) = block else { break };
                        let head = BlockHead {
                            height: block.number.map(|n| n.as_u64()).unwrap_or_default(),
                            hash: block.hash.unwrap_or_default(),
                        };
                        if tx.send(head).await.is_err() {
                            break;
                        }
                    }
                }
            }
            info!("pub chain head subscription closed");
        });
        Ok(rx)
    }

    async fn latest_height(&self) -> BridgeResult<u64> {
        let number = self
            .provider()
            .await
            .get_block_number()
            .await
            .map_err(|e| BridgeError::TransientRpc(format!("block number: {}", e)))?;
        Ok(number.as_u64())
    }

    async fn block_by_number(&self, number: u64) -> BridgeResult<PubBlock> {
        let block = self
            .provider()
            .await
            .get_block_with_txs(BlockId::from(number))
            .await
            .map_err(|e| BridgeError::TransientRpc(format!("block {}: {}", number, e)))?
            .ok_or_else(|| BridgeError::Rpc(format!("block {} not found", number)))?;
        let txs = block
            .transactions
            .into_iter()
            .map(|tx| PubTx {
                hash: tx.hash,
                to: tx.to,
                value: tx.value,
                data: tx.input.to_vec(),
            })
            .collect();
        Ok(PubBlock {
            height: number,
            txs,
        })
    }

    async fn receipt_status_ok(&self, tx: H256) -> BridgeResult<bool> {
        let receipt = self
            .provider()
            .await
            .get_transaction_receipt(tx)
            .await
            .map_err(|e| BridgeError::TransientRpc(format!("receipt {}: {}", tx, e)))?;
        Ok(receipt
            .and_then(|r| r.status)
            .map(|status| status.as_u64() == 1)
            .unwrap_or(false))
    }

    async fn suggest_gas_price(&self) -> BridgeResult<U256> {
        self.provider()
            .await
            .get_gas_price()
            .await
            .map_err(|e| BridgeError::TransientRpc(format!("gas price: {}", e)))
    }

    async fn pending_nonce(&self, address: EthAddress) -> BridgeResult<u64> {
        let nonce = self
            .provider()
            .await
            .get_transaction_count(address, Some(ethers::types::BlockNumber::Pending.into()))
            .await
            .map_err(|e| BridgeError::TransientRpc(format!("nonce {}: {}", address, e)))?;
        Ok(nonce.as_u64())
    }

    async fn estimate_gas(&self, tx: &TypedTransaction) -> BridgeResult<U256> {
        self.provider()
            .await
            .estimate_gas(tx, None)
            .await
            .map_err(|e| BridgeError::TransientRpc(format!("estimate gas: {}", e)))
    }

    async fn send_raw_transaction(&self, raw: Bytes) -> BridgeResult<H256> {
        let provider = self.provider().await;
        let pending = provider
            .send_raw_transaction(raw)
            .await
            .map_err(|e| BridgeError::TransientRpc(format!("broadcast: {}", e)))?;
        Ok(pending.tx_hash())
    }

    async fn erc20_balance(&self, token: EthAddress, owner: EthAddress) -> BridgeResult<U256> {
        let mut data = ERC20_BALANCE_OF_SELECTOR.to_vec();
        data.extend(abi::encode(&[Token::Address(owner)]));
        let call: TypedTransaction = TransactionRequest::new()
            .to(token)
            .data(Bytes::from(data))
            .into();
        let raw = tokio::time::timeout(QUERY_TIMEOUT, async {
            self.provider().await.call(&call, None).await
        })
        .await
        .map_err(|_| BridgeError::TransientRpc("balanceOf timed out".into()))?
        .map_err(|e| BridgeError::TransientRpc(format!("balanceOf: {}", e)))?;
        Ok(U256::from_big_endian(&raw))
    }

    async fn native_balance(&self, owner: EthAddress) -> BridgeResult<U256> {
        self.provider()
            .await
            .get_balance(owner, None)
            .await
            .map_err(|e| BridgeError::TransientRpc(format!("balance {}: {}", owner, e)))
    }

    fn chain_id(&self) -> u64 {
        self.chain_id
    }

    async fn redial(&self) -> BridgeResult<()> {
        let fresh = Self::dial(&self.ws_url).await?;
        *self.provider.write().await = fresh;
        info!("pub chain connection re-established");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn erc20_transfer_calldata_layout() {
        let to = EthAddress::repeat_byte(0x11);
        let data = erc20_transfer_data(to, U256::from(1_000_000u64));
        assert_eq!(&data[..4], &ERC20_TRANSFER_SELECTOR);
        assert_eq!(data.len(), 4 + 32 + 32);
        // address is right-aligned in its 32-byte slot
        assert_eq!(&data[16..36], to.as_bytes());
        assert_eq!(U256::from_big_endian(&data[36..68]), U256::from(1_000_000u64));
    }

    #[test]
    fn native_transfer_has_no_calldata() {
        let tx = build_transfer_tx(
            EthAddress::repeat_byte(1),
            None,
            U256::from(5u8),
            7,
            U256::from(10u8),
            U256::from(21_000u64),
            56,
        );
        assert_eq!(tx.value(), Some(&U256::from(5u8)));
        assert!(tx.data().is_none());
        assert_eq!(tx.nonce(), Some(&U256::from(7u8)));
        assert_eq!(tx.chain_id().map(|id| id.as_u64()), Some(56));
    }

    #[test]
    fn erc20_transfer_moves_no_native_value() {
        let token = EthAddress::repeat_byte(0xee);
        let tx = build_transfer_tx(
            EthAddress::repeat_byte(1),
            Some(token),
            U256::exp10(12),
            0,
            U256::one(),
            U256::from(80_000u64),
            56,
        );
        assert_eq!(tx.value(), Some(&U256::zero()));
        assert_eq!(tx.to().and_then(|t| t.as_address()), Some(&token));
        assert!(tx.data().is_some());
    }

    #[test]
    fn sighash_changes_with_chain_id() {
        let build = |chain_id| {
            build_transfer_tx(
                EthAddress::repeat_byte(1),
                None,
                U256::one(),
                0,
                U256::one(),
                U256::from(21_000u64),
                chain_id,
            )
            .sighash()
        };
        assert_ne!(build(1), build(56));
    }
}
