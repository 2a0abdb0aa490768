// Copyright (c) Oppy Finance
// SPDX-License-Identifier: Apache-2.0

//! Bootstrap and teardown of the bridge node: adapters, restored state,
//! the event loop, and final persistence.

use crate::app_chain::HttpAppChainClient;
use crate::config::BridgeNodeConfig;
use crate::event_loop::BridgeEventLoop;
use crate::inbound::{InboundProcessor, InboundScanner};
use crate::keyring::OperatorKey;
use crate::metrics::BridgeMetrics;
use crate::monitor::start_monitor_server;
use crate::outbound::{OutboundProcessor, OutboundScanner};
use crate::pool_registry::PoolRegistry;
use crate::pub_chain::EthPubChainClient;
use crate::storage::StateStorage;
use crate::token_list::TokenList;
use crate::tss::HttpTssClient;
use anyhow::Context;
use ethers::types::Address as EthAddress;
use std::str::FromStr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

pub async fn run_bridge_node(
    config: BridgeNodeConfig,
    passphrase: Vec<u8>,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let operator =
        OperatorKey::unlock(&config.keyring_file(), &passphrase).context("cannot unlock keyring")?;
    info!("operator {} unlocked", operator.address);

    let token_list = Arc::new(
        TokenList::load(&config.token_list_file(), config.token_list_update_gap)
            .context("cannot load token list")?,
    );

    let tss = Arc::new(
        HttpTssClient::connect(&config.tss.http_addr)
            .await
            .context("cannot reach the tss signer")?,
    );
    let app = Arc::new(
        HttpAppChainClient::connect(&config.app_chain.http_addr, operator.address.clone())
            .await
            .context("cannot reach the app chain")?,
    );
    let pub_chain = Arc::new(
        EthPubChainClient::connect(&config.pub_chain.ws_addr)
            .await
            .context("cannot reach the pub chain")?,
    );
    let bridge_contract = EthAddress::from_str(&config.pub_chain.bridge_contract_addr)
        .context("bad bridge contract address")?;

    let registry = Arc::new(PoolRegistry::new());
    let prometheus_registry = prometheus::Registry::new();
    let metrics = Arc::new(BridgeMetrics::new(&prometheus_registry));

    let monitor_handle = config.enable_monitor.then(|| {
        start_monitor_server(
            config.monitor_port,
            prometheus_registry.clone(),
            cancel.child_token(),
        )
    });

    let inbound_scanner = Arc::new(InboundScanner::new(
        pub_chain.clone(),
        token_list.clone(),
        registry.clone(),
        bridge_contract,
    ));
    let outbound_scanner = Arc::new(OutboundScanner::new(
        app.clone(),
        token_list.clone(),
        registry.clone(),
    ));
    let inbound_processor = Arc::new(InboundProcessor::new(app.clone(), tss.clone()));
    let outbound_processor = Arc::new(OutboundProcessor::new(
        app.clone(),
        pub_chain.clone(),
        tss.clone(),
        token_list.clone(),
    ));

    let mut event_loop = BridgeEventLoop::new(
        app,
        pub_chain,
        tss,
        token_list,
        registry,
        inbound_scanner,
        outbound_scanner,
        inbound_processor,
        outbound_processor,
        metrics,
        config.app_chain.rollback_gap,
        config.pub_chain.rollback_gap,
    );

    let storage = StateStorage::new(&config.home_dir);
    event_loop.restore(
        storage.load_inbound().unwrap_or_default(),
        storage.load_outbound().unwrap_or_default(),
        storage.load_pending_outbound().unwrap_or_default(),
        storage.load_move_fund().unwrap_or_default(),
    );

    let final_state = event_loop.run(cancel).await;

    // persistence must complete even on a rough shutdown path
    if let Err(err) = storage.save_inbound(&final_state.inbound) {
        error!("failed to save inbound queue: {}", err);
    }
    if let Err(err) = storage.save_outbound(&final_state.outbound) {
        error!("failed to save outbound queue: {}", err);
    }
    if let Err(err) = storage.save_pending_outbound(&final_state.pending_outbound) {
        error!("failed to save pending outbound: {}", err);
    }
    if let Err(err) = storage.save_move_fund(&final_state.move_funds) {
        error!("failed to save move-fund lists: {}", err);
    }

    if let Some(handle) = monitor_handle {
        let _ = handle.await;
    }
    info!("bridge stopped cleanly");
    Ok(())
}
