// Copyright (c) Oppy Finance
// SPDX-License-Identifier: Apache-2.0

//! The bridge event loop: a single task owning all mutable bridge state.
//!
//! One `select!` multiplexes app-chain events, pub-chain heads, completion
//! reports from child tasks, a 15 second idle watchdog and the root
//! cancellation token. Handlers only issue RPCs that are bounded by the
//! query timeout; anything that can stall (signing, broadcast, status
//! polling, pool drains) runs in a spawned child task whose only way back
//! into the core is the completion channel and the atomic failure
//! counters.

use crate::app_chain::{AppChainEvent, AppChainRpc};
use crate::error::BridgeError;
use crate::inbound::{InboundProcessor, InboundScanner, InboundSubmission};
use crate::metrics::BridgeMetrics;
use crate::move_fund::{drain_app_pool, drain_pub_pool, MoveFundTracker};
use crate::outbound::{OutboundProcessor, OutboundScanner, OutboundSubmission};
use crate::pool_registry::PoolRegistry;
use crate::pub_chain::{BlockHead, PubChainRpc};
use crate::queue::{PendingMap, RequestQueue};
use crate::storage::MoveFundSnapshot;
use crate::token_list::TokenList;
use crate::tss::TssRpc;
use ethers::types::U256;
use oppy_bridge_types::constants::{
    DUMP_ITEMS_GAP, MIN_CHECK_BLOCK_GAP, PRICE_UPDATE_GAP, ROUND_BLOCK, TX_TIMEOUT_BLOCKS,
};
use oppy_bridge_types::{ChainClass, InboundReq, OutBoundReq, PoolInfo};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const COMPLETION_CHANNEL_SIZE: usize = 512;
const IDLE_WATCHDOG: Duration = Duration::from_secs(15);
/// Consecutive failures tolerated before a pipeline pauses.
const FAILURE_STREAK_LIMIT: i64 = 5;

/// Batch quorum and cadence, derived from the validator set size.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BatchPolicy {
    pub group_sign: usize,
    pub group_block_gap: i64,
}

impl Default for BatchPolicy {
    fn default() -> Self {
        Self {
            group_sign: 4,
            group_block_gap: 10,
        }
    }
}

impl BatchPolicy {
    pub fn from_validator_count(n: usize) -> Self {
        Self {
            group_sign: ((2 * n).div_ceil(3)).max(1),
            group_block_gap: ((n / 2) as i64).max(5),
        }
    }
}

/// Shared failure accounting. Child tasks increment; the loop reads and
/// resets. The wait flags stop increments while a pause is already
/// scheduled.
#[derive(Default)]
pub struct FailureCounters {
    pub inbound: AtomicI64,
    pub outbound: AtomicI64,
    pub inbound_wait: AtomicBool,
    pub outbound_wait: AtomicBool,
}

impl FailureCounters {
    pub fn record_inbound_failure(&self) {
        if !self.inbound_wait.load(Ordering::SeqCst) {
            self.inbound.fetch_add(1, Ordering::SeqCst);
        }
    }

    pub fn record_outbound_failure(&self) {
        if !self.outbound_wait.load(Ordering::SeqCst) {
            self.outbound.fetch_add(1, Ordering::SeqCst);
        }
    }
}

/// Which side a move-fund item belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChainSide {
    App,
    Pub,
}

/// Reports flowing from child tasks back into the loop. This channel and
/// the failure counters are the only write paths into the core.
pub enum Completion {
    NewInbound(Vec<InboundReq>),
    NewOutbound(Vec<OutBoundReq>),
    RequeueInbound(Vec<InboundReq>),
    RequeueOutbound(Vec<OutBoundReq>),
    InboundDone(String),
    InboundFailed(InboundReq),
    OutboundDone(OutBoundReq),
    OutboundFailed(OutBoundReq),
    OutboundBatchFinished,
    MoveFundRetry {
        side: ChainSide,
        pool: PoolInfo,
        height: i64,
    },
}

/// Everything the loop exports for persistence when it stops.
pub struct FinalState {
    pub inbound: Vec<InboundReq>,
    pub outbound: Vec<OutBoundReq>,
    pub pending_outbound: Vec<OutBoundReq>,
    pub move_funds: MoveFundSnapshot,
}

pub struct BridgeEventLoop<A, P, T> {
    app: Arc<A>,
    pub_chain: Arc<P>,
    token_list: Arc<TokenList>,
    registry: Arc<PoolRegistry>,
    inbound_scanner: Arc<InboundScanner<P>>,
    outbound_scanner: Arc<OutboundScanner<A>>,
    inbound_processor: Arc<InboundProcessor<A, T>>,
    outbound_processor: Arc<OutboundProcessor<A, P, T>>,
    tss: Arc<T>,
    metrics: Arc<BridgeMetrics>,

    pub counters: Arc<FailureCounters>,
    gas_price: Arc<AtomicU64>,

    inbound_queue: RequestQueue<InboundReq>,
    outbound_queue: RequestQueue<OutBoundReq>,
    pending_outbound: PendingMap,
    app_move_funds: MoveFundTracker,
    pub_move_funds: MoveFundTracker,

    completion_tx: mpsc::Sender<Completion>,
    completion_rx: mpsc::Receiver<Completion>,

    policy: BatchPolicy,
    app_rollback_gap: i64,
    pub_rollback_gap: u64,

    app_height: i64,
    pub_height: u64,
    previous_tss_block_inbound: i64,
    previous_tss_block_outbound: i64,
    first_time_inbound: bool,
    first_time_outbound: bool,
    feed_ibc: bool,
    inbound_pause_height: i64,
    outbound_pause_height: u64,
    outbound_in_flight: Arc<AtomicBool>,
}

impl<A, P, T> BridgeEventLoop<A, P, T>
where
    A: AppChainRpc,
    P: PubChainRpc,
    T: TssRpc,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        app: Arc<A>,
        pub_chain: Arc<P>,
        tss: Arc<T>,
        token_list: Arc<TokenList>,
        registry: Arc<PoolRegistry>,
        inbound_scanner: Arc<InboundScanner<P>>,
        outbound_scanner: Arc<OutboundScanner<A>>,
        inbound_processor: Arc<InboundProcessor<A, T>>,
        outbound_processor: Arc<OutboundProcessor<A, P, T>>,
        metrics: Arc<BridgeMetrics>,
        app_rollback_gap: i64,
        pub_rollback_gap: u64,
    ) -> Self {
        let (completion_tx, completion_rx) = mpsc::channel(COMPLETION_CHANNEL_SIZE);
        Self {
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
            counters: Arc::new(FailureCounters::default()),
            gas_price: Arc::new(AtomicU64::new(0)),
            inbound_queue: RequestQueue::new("inbound"),
            outbound_queue: RequestQueue::new("outbound"),
            pending_outbound: PendingMap::new(),
            app_move_funds: MoveFundTracker::new(),
            pub_move_funds: MoveFundTracker::new(),
            completion_tx,
            completion_rx,
            policy: BatchPolicy::default(),
            app_rollback_gap,
            pub_rollback_gap,
            app_height: 0,
            pub_height: 0,
            previous_tss_block_inbound: 0,
            previous_tss_block_outbound: 0,
            first_time_inbound: true,
            first_time_outbound: true,
            feed_ibc: false,
            inbound_pause_height: 0,
            outbound_pause_height: 0,
            outbound_in_flight: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Restore collections persisted by a previous run.
    pub fn restore(
        &mut self,
        inbound: Vec<InboundReq>,
        outbound: Vec<OutBoundReq>,
        pending: Vec<OutBoundReq>,
        move_funds: MoveFundSnapshot,
    ) {
        for item in inbound {
            self.inbound_queue.add_item(item);
        }
        for item in outbound {
            self.outbound_queue.add_item(item);
        }
        self.pending_outbound.import(pending);
        for item in move_funds.app_chain {
            self.app_move_funds
                .add_move_fund_item(item.pool, item.not_before_height);
        }
        for item in move_funds.pub_chain {
            self.pub_move_funds
                .add_move_fund_item(item.pool, item.not_before_height);
        }
        info!(
            "restored state: {} inbound, {} outbound, {} pending",
            self.inbound_queue.size(),
            self.outbound_queue.size(),
            self.pending_outbound.len()
        );
    }

    /// Run until cancelled; returns the collections to persist.
    pub async fn run(mut self, cancel: CancellationToken) -> FinalState {
        let mut app_events = match self.app.subscribe_events(cancel.child_token()).await {
            Ok(rx) => rx,
            Err(err) => {
                error!("cannot subscribe to app chain: {}", err);
                return self.export();
            }
        };
        let mut pub_heads = match self.pub_chain.subscribe_heads(cancel.child_token()).await {
            Ok(rx) => rx,
            Err(err) => {
                error!("cannot subscribe to pub chain: {}", err);
                return self.export();
            }
        };

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("bridge event loop cancelled, persisting state");
                    break;
                }
                Some(event) = app_events.recv() => match event {
                    AppChainEvent::NewBlock { height } => self.handle_app_block(height).await,
                    AppChainEvent::ValidatorSetUpdate { height, size } => {
                        self.policy = BatchPolicy::from_validator_count(size);
                        info!(
                            "validator set of {} at height {}: group_sign={}, gap={}",
                            size, height, self.policy.group_sign, self.policy.group_block_gap
                        );
                    }
                },
                Some(head) = pub_heads.recv() => self.handle_pub_block(head).await,
                Some(completion) = self.completion_rx.recv() => self.handle_completion(completion),
                _ = tokio::time::sleep(IDLE_WATCHDOG) => {
                    warn!("no events for {:?}, re-dialing subscriptions", IDLE_WATCHDOG);
                    if let Err(err) = self.pub_chain.redial().await {
                        warn!("pub chain re-dial failed: {}", err);
                    }
                    if let Err(err) = self.app.redial().await {
                        warn!("app chain re-dial failed: {}", err);
                    }
                    if let Ok(rx) = self.app.subscribe_events(cancel.child_token()).await {
                        app_events = rx;
                    }
                    if let Ok(rx) = self.pub_chain.subscribe_heads(cancel.child_token()).await {
                        pub_heads = rx;
                    }
                }
            }
        }
        self.export()
    }

    fn export(&self) -> FinalState {
        FinalState {
            inbound: self.inbound_queue.export_items(),
            outbound: self.outbound_queue.export_items(),
            pending_outbound: self.pending_outbound.export(),
            move_funds: MoveFundSnapshot {
                app_chain: self.app_move_funds.export(),
                pub_chain: self.pub_move_funds.export(),
            },
        }
    }

    // -- app chain ---------------------------------------------------------

    async fn handle_app_block(&mut self, height: i64) {
        self.app_height = height;
        self.metrics.app_chain_height.set(height);
        self.token_list.update(height);
        self.refresh_gas_price(height);

        let processable = height - self.app_rollback_gap;
        if processable > 0 && self.registry.is_ready() {
            let scanner = self.outbound_scanner.clone();
            let completions = self.completion_tx.clone();
            tokio::spawn(async move {
                match scanner.process_block(processable).await {
                    Ok(items) if !items.is_empty() => {
                        let _ = completions.send(Completion::NewOutbound(items)).await;
                    }
                    Ok(_) => {}
                    Err(err) => debug!("outbound scan of block {} failed: {}", processable, err),
                }
            });
        }

        if let Err(err) = self.check_pool_rotation(height).await {
            warn!("pool rotation check failed: {}", err);
            return;
        }
        if !self.registry.is_ready() {
            warn!("custody pools not yet published, bridge idle");
            return;
        }

        if self.dispatch_app_move_fund(height) {
            // a drain is running; do not also build a batch this tick
            return;
        }

        if !self.inbound_allowed(height) {
            return;
        }
        self.maybe_batch_inbound(processable, height);

        if height % DUMP_ITEMS_GAP == 0 {
            self.sweep_queues();
        }
    }

    fn refresh_gas_price(&self, height: i64) {
        if height % PRICE_UPDATE_GAP != 0 {
            return;
        }
        let pub_chain = self.pub_chain.clone();
        let cell = self.gas_price.clone();
        tokio::spawn(async move {
            match pub_chain.suggest_gas_price().await {
                Ok(price) => cell.store(price.low_u64(), Ordering::Relaxed),
                Err(err) => debug!("gas price refresh failed: {}", err),
            }
        });
    }

    async fn check_pool_rotation(&mut self, latest: i64) -> Result<(), BridgeError> {
        let descriptors = self.app.query_last_pool_address().await?;
        if descriptors.len() < 2 {
            warn!(
                "only {} pool addresses published, bridge cannot run",
                descriptors.len()
            );
            return Ok(());
        }

        if !self.registry.is_ready() {
            // newest first on the wire; install the older one first so the
            // newest ends up current
            let older = PoolInfo::from_descriptor(descriptors[1].clone())?;
            let newest = PoolInfo::from_descriptor(descriptors[0].clone())?;
            self.registry.update(older);
            self.registry.update(newest);
            info!("custody pools initialised");
            return Ok(());
        }

        if self.registry.is_current(&descriptors[0].pool_pubkey) {
            return Ok(());
        }

        let incoming = PoolInfo::from_descriptor(descriptors[0].clone())?;
        info!(
            "pool rotation: new pool {} at height {}",
            incoming.eth_address, incoming.created_block_height()
        );
        let displaced = self.registry.update(incoming.clone());
        if let Some(retired) = displaced {
            if retired.pub_key != incoming.pub_key {
                // schedule early so the first drain attempt runs without
                // waiting out a full gap
                let gate = latest - MIN_CHECK_BLOCK_GAP + 5;
                self.app_move_funds.add_move_fund_item(retired.clone(), gate);
                self.pub_move_funds.add_move_fund_item(retired, gate);
            }
        }
        Ok(())
    }

    fn dispatch_app_move_fund(&mut self, height: i64) -> bool {
        let Some(item) = self.app_move_funds.pop_move_fund_item_after_block(height) else {
            return false;
        };
        let Some(current) = self.registry.current() else {
            self.app_move_funds
                .add_move_fund_item(item.pool, item.not_before_height);
            return false;
        };
        self.metrics.move_fund_attempts.inc();
        let app = self.app.clone();
        let tss = self.tss.clone();
        let completions = self.completion_tx.clone();
        tokio::spawn(async move {
            let retired = item.pool.clone();
            let is_signer = app
                .check_whether_signer(&retired.raw)
                .await
                .unwrap_or(false);
            if !is_signer {
                debug!("not in the retired pool committee, skipping drain");
                return;
            }
            match drain_app_pool(&app, &tss, &retired, &current.app_address, height).await {
                Ok(true) => info!("retired pool drained on the app chain"),
                Ok(false) | Err(_) => {
                    let _ = completions
                        .send(Completion::MoveFundRetry {
                            side: ChainSide::App,
                            pool: retired,
                            height,
                        })
                        .await;
                }
            }
        });
        true
    }

    /// Backpressure gate for the inbound pipeline; also flushes the
    /// on-hold buffer right before the pause window ends.
    fn inbound_allowed(&mut self, latest: i64) -> bool {
        if self.counters.inbound.load(Ordering::SeqCst) > FAILURE_STREAK_LIMIT {
            self.counters.inbound.store(0, Ordering::SeqCst);
            self.inbound_pause_height = (latest / ROUND_BLOCK + 1) * ROUND_BLOCK;
            self.counters.inbound_wait.store(true, Ordering::SeqCst);
            self.metrics.pipeline_paused.with_label_values(&["inbound"]).inc();
            warn!(
                "too many inbound failures, pausing until height {}",
                self.inbound_pause_height
            );
        }
        if latest < self.inbound_pause_height {
            if latest == self.inbound_pause_height - 1 {
                self.inbound_queue.flush_on_hold();
            }
            warn!(
                "inbound paused for {} more blocks",
                self.inbound_pause_height - latest
            );
            return false;
        }
        self.counters.inbound_wait.store(false, Ordering::SeqCst);
        !near_churn_boundary(latest)
    }

    fn maybe_batch_inbound(&mut self, processable: i64, latest: i64) {
        self.metrics
            .inbound_queue_size
            .set(self.inbound_queue.size() as i64);
        if processable - self.previous_tss_block_inbound < self.policy.group_block_gap
            || self.inbound_queue.is_empty()
        {
            return;
        }
        if self.inbound_queue.size() < self.policy.group_sign && self.first_time_inbound {
            // wait one extra round for a fuller batch
            self.first_time_inbound = false;
            return;
        }
        let Some(pool) = self.registry.current() else {
            return;
        };
        let Some(items) = self.inbound_queue.pop_items(self.policy.group_sign, None) else {
            return;
        };
        self.previous_tss_block_inbound = processable;
        self.first_time_inbound = true;
        info!(
            "feeding {} inbound requests through pool {}",
            items.len(),
            pool.app_address
        );

        let app = self.app.clone();
        let processor = self.inbound_processor.clone();
        let completions = self.completion_tx.clone();
        let counters = self.counters.clone();
        let metrics = self.metrics.clone();
        let round_block_height = latest / ROUND_BLOCK;
        tokio::spawn(async move {
            if !app
                .check_whether_signer(&pool.raw)
                .await
                .unwrap_or(false)
            {
                debug!("not a signer of the current pool, requeueing batch");
                let _ = completions.send(Completion::RequeueInbound(items)).await;
                return;
            }
            let account = match app.query_account(&pool.app_address).await {
                Ok(account) => account,
                Err(err) => {
                    warn!("pool account query failed: {}", err);
                    let _ = completions.send(Completion::RequeueInbound(items)).await;
                    return;
                }
            };

            let mut stamped = items;
            for (i, item) in stamped.iter_mut().enumerate() {
                item.set_account_info(
                    account.account_number,
                    account.sequence + i as u64,
                    pool.app_address.clone(),
                    &pool.pub_key,
                    round_block_height,
                );
            }

            // broadcast strictly in pop order so the consecutive account
            // sequences land in order; verification runs concurrently
            for item in stamped {
                let submission = processor.process_inbound(&item).await;
                let index = match submission {
                    Ok(InboundSubmission::Broadcast { index, .. }) => {
                        metrics.inbound_submitted.inc();
                        index
                    }
                    Ok(InboundSubmission::AlreadyIssued { index }) => index,
                    Err(err) => {
                        warn!("inbound submission failed: {}", err);
                        metrics.record_error(&err);
                        counters.record_inbound_failure();
                        let _ = completions.send(Completion::InboundFailed(item)).await;
                        continue;
                    }
                };
                let processor = processor.clone();
                let completions = completions.clone();
                let counters = counters.clone();
                let metrics = metrics.clone();
                tokio::spawn(async move {
                    match processor.check_issue_status(&index).await {
                        Ok(()) => {
                            let _ = completions.send(Completion::InboundDone(index)).await;
                        }
                        Err(err) => {
                            metrics.record_error(&err);
                            counters.record_inbound_failure();
                            let _ = completions.send(Completion::InboundFailed(item)).await;
                        }
                    }
                });
            }
        });
    }

    // -- pub chain ---------------------------------------------------------

    async fn handle_pub_block(&mut self, head: BlockHead) {
        let latest = head.height;
        self.pub_height = latest;
        self.metrics.pub_chain_height.set(latest as i64);

        if !self.registry.is_ready() {
            return;
        }

        if latest > self.pub_rollback_gap {
            let processable = latest - self.pub_rollback_gap;
            let scanner = self.inbound_scanner.clone();
            let completions = self.completion_tx.clone();
            tokio::spawn(async move {
                match scanner.process_new_block(processable).await {
                    Ok(items) if !items.is_empty() => {
                        let _ = completions.send(Completion::NewInbound(items)).await;
                    }
                    Ok(_) => {}
                    Err(err) => debug!("inbound scan of block {} failed: {}", processable, err),
                }
            });
        }

        if self.dispatch_pub_move_fund(latest as i64) {
            return;
        }

        if !self.outbound_allowed(latest) {
            return;
        }
        self.maybe_batch_outbound(latest).await;
    }

    fn dispatch_pub_move_fund(&mut self, height: i64) -> bool {
        let Some(item) = self.pub_move_funds.pop_move_fund_item_after_block(height) else {
            return false;
        };
        let Some(current) = self.registry.current() else {
            self.pub_move_funds
                .add_move_fund_item(item.pool, item.not_before_height);
            return false;
        };
        self.metrics.move_fund_attempts.inc();
        let app = self.app.clone();
        let pub_chain = self.pub_chain.clone();
        let tss = self.tss.clone();
        let token_list = self.token_list.clone();
        let completions = self.completion_tx.clone();
        tokio::spawn(async move {
            let retired = item.pool.clone();
            let is_signer = app
                .check_whether_signer(&retired.raw)
                .await
                .unwrap_or(false);
            if !is_signer {
                debug!("not in the retired pool committee, skipping drain");
                return;
            }
            match drain_pub_pool(
                &pub_chain,
                &tss,
                &token_list,
                &retired,
                current.eth_address,
                height,
            )
            .await
            {
                Ok(true) => info!("retired pool drained on the pub chain"),
                Ok(false) | Err(_) => {
                    let _ = completions
                        .send(Completion::MoveFundRetry {
                            side: ChainSide::Pub,
                            pool: retired,
                            height,
                        })
                        .await;
                }
            }
        });
        true
    }

    fn outbound_allowed(&mut self, latest: u64) -> bool {
        if self.counters.outbound.load(Ordering::SeqCst) > FAILURE_STREAK_LIMIT {
            self.counters.outbound.store(0, Ordering::SeqCst);
            self.outbound_pause_height = (latest / ROUND_BLOCK as u64 + 1) * ROUND_BLOCK as u64;
            self.counters.outbound_wait.store(true, Ordering::SeqCst);
            self.metrics.pipeline_paused.with_label_values(&["outbound"]).inc();
            warn!(
                "too many outbound failures, pausing until height {}",
                self.outbound_pause_height
            );
        }
        if latest < self.outbound_pause_height {
            if latest == self.outbound_pause_height - 1 {
                self.outbound_queue.flush_on_hold();
            }
            warn!(
                "outbound paused for {} more blocks",
                self.outbound_pause_height - latest
            );
            return false;
        }
        self.counters.outbound_wait.store(false, Ordering::SeqCst);

        if self.outbound_in_flight.load(Ordering::SeqCst) {
            debug!("previous outbound batch still in flight");
            return false;
        }
        if self.outbound_queue.is_empty() {
            // nothing queued; give parked items their retry
            self.outbound_queue.flush_on_hold();
        }
        !near_churn_boundary(latest as i64)
    }

    async fn maybe_batch_outbound(&mut self, latest: u64) {
        self.metrics
            .outbound_queue_size
            .set(self.outbound_queue.size() as i64);
        let processable = latest.saturating_sub(self.pub_rollback_gap) as i64;
        if processable - self.previous_tss_block_outbound < self.policy.group_block_gap
            || self.outbound_queue.is_empty()
        {
            return;
        }
        if self.outbound_queue.size() < self.policy.group_sign && self.first_time_outbound {
            self.first_time_outbound = false;
            return;
        }
        let Some(pool) = self.registry.current() else {
            return;
        };
        match self.app.check_whether_signer(&pool.raw).await {
            Ok(true) => {}
            Ok(false) => {
                debug!("not a signer of the current pool");
                return;
            }
            Err(err) => {
                warn!("signer check failed: {}", err);
                return;
            }
        }

        // strict alternation between native and IBC batches
        let class = if self.feed_ibc {
            ChainClass::Ibc
        } else {
            ChainClass::Native
        };
        self.feed_ibc = !self.feed_ibc;
        let Some(mut items) = self
            .outbound_queue
            .pop_items(self.policy.group_sign, Some(class))
        else {
            debug!("empty queue for {:?} outbound", class);
            return;
        };
        self.previous_tss_block_outbound = processable;
        self.first_time_outbound = true;
        self.outbound_in_flight.store(true, Ordering::SeqCst);
        info!("feeding {} {:?} outbound requests", items.len(), class);

        let round_block_height = (latest / ROUND_BLOCK as u64) as i64;
        for item in items.iter_mut() {
            item.round_block_height = round_block_height;
            self.pending_outbound.insert(item.clone());
        }
        self.metrics
            .pending_outbound_size
            .set(self.pending_outbound.len() as i64);

        match class {
            ChainClass::Native => self.dispatch_native_batch(items, pool, latest),
            ChainClass::Ibc => self.dispatch_ibc_batch(items, pool),
        }
    }

    fn dispatch_native_batch(
        &self,
        items: Vec<OutBoundReq>,
        pool: PoolInfo,
        latest: u64,
    ) {
        let pub_chain = self.pub_chain.clone();
        let processor = self.outbound_processor.clone();
        let completions = self.completion_tx.clone();
        let counters = self.counters.clone();
        let metrics = self.metrics.clone();
        let gas_price_cell = self.gas_price.clone();
        let in_flight = self.outbound_in_flight.clone();

        tokio::spawn(async move {
            let mut nonce = match pub_chain.pending_nonce(pool.eth_address).await {
                Ok(nonce) => nonce,
                Err(err) => {
                    warn!("pool nonce query failed: {}", err);
                    let _ = completions.send(Completion::RequeueOutbound(items)).await;
                    in_flight.store(false, Ordering::SeqCst);
                    return;
                }
            };
            let cached = gas_price_cell.load(Ordering::Relaxed);
            let gas_price = if cached == 0 {
                pub_chain
                    .suggest_gas_price()
                    .await
                    .unwrap_or_else(|_| U256::from(5_000_000_000u64))
            } else {
                U256::from(cached)
            };

            let mut stamped = items;
            for item in stamped.iter_mut() {
                item.set_height_and_nonce(item.round_block_height, latest as i64, nonce);
                nonce += 1;
            }

            // broadcasts stay in pop order so the pool nonces land in order
            for mut item in stamped {
                match processor
                    .process_outbound(&item, &pool.pub_key, gas_price)
                    .await
                {
                    Ok(OutboundSubmission::AlreadyPaid) => {
                        let _ = completions.send(Completion::OutboundDone(item)).await;
                    }
                    Ok(OutboundSubmission::Broadcast { tx_hash }) => {
                        metrics.outbound_submitted.inc();
                        item.submitted_tx_hash = Some(tx_hash);
                        let processor = processor.clone();
                        let completions = completions.clone();
                        let counters = counters.clone();
                        let metrics = metrics.clone();
                        let pool_create_height = pool.created_block_height();
                        tokio::spawn(async move {
                            match processor
                                .verify_and_record(&item, tx_hash, pool_create_height)
                                .await
                            {
                                Ok(()) => {
                                    let _ =
                                        completions.send(Completion::OutboundDone(item)).await;
                                }
                                Err(err) => {
                                    metrics.record_error(&err);
                                    counters.record_outbound_failure();
                                    let _ =
                                        completions.send(Completion::OutboundFailed(item)).await;
                                }
                            }
                        });
                    }
                    Err(err) => {
                        warn!("outbound submission failed: {}", err);
                        metrics.record_error(&err);
                        counters.record_outbound_failure();
                        let _ = completions.send(Completion::OutboundFailed(item)).await;
                    }
                }
            }
            let _ = completions.send(Completion::OutboundBatchFinished).await;
        });
    }

    fn dispatch_ibc_batch(&self, items: Vec<OutBoundReq>, pool: PoolInfo) {
        let app = self.app.clone();
        let processor = self.outbound_processor.clone();
        let completions = self.completion_tx.clone();
        let counters = self.counters.clone();
        let metrics = self.metrics.clone();
        let in_flight = self.outbound_in_flight.clone();
        let latest_app_height = self.app_height;

        tokio::spawn(async move {
            let account = match app.query_account(&pool.app_address).await {
                Ok(account) => account,
                Err(err) => {
                    warn!("pool account query failed: {}", err);
                    let _ = completions.send(Completion::RequeueOutbound(items)).await;
                    in_flight.store(false, Ordering::SeqCst);
                    return;
                }
            };
            let mut stamped = items;
            for (i, item) in stamped.iter_mut().enumerate() {
                item.set_ibc_account_info(account.account_number, account.sequence + i as u64);
            }

            let result = processor
                .process_ibc_batch(
                    &stamped,
                    &pool.pub_key,
                    &pool.app_address,
                    pool.created_block_height(),
                    latest_app_height,
                )
                .await;
            match result {
                Ok(()) => {
                    for item in stamped {
                        let _ = completions.send(Completion::OutboundDone(item)).await;
                    }
                }
                Err(err) => {
                    metrics.record_error(&err);
                    counters.record_outbound_failure();
                    for item in stamped {
                        let _ = completions.send(Completion::OutboundFailed(item)).await;
                    }
                }
            }
            let _ = completions.send(Completion::OutboundBatchFinished).await;
        });
    }

    // -- sweep and completions --------------------------------------------

    /// Dump both queues and spawn a task that re-checks every item against
    /// its destination chain: confirmed items are dropped, the rest come
    /// back through the completion channel.
    fn sweep_queues(&mut self) {
        let inbound = self.inbound_queue.dump();
        let outbound = self.outbound_queue.dump();
        if inbound.is_empty() && outbound.is_empty() {
            return;
        }
        info!(
            "sweep: re-checking {} inbound and {} outbound items",
            inbound.len(),
            outbound.len()
        );
        let app = self.app.clone();
        let pub_chain = self.pub_chain.clone();
        let completions = self.completion_tx.clone();
        tokio::spawn(async move {
            let mut keep_inbound = Vec::new();
            for item in inbound {
                let index = format!("{:#x}", item.hash());
                match app.issue_token_exists(&index).await {
                    Ok(true) => {
                        info!("sweep: inbound {} already issued elsewhere", index);
                    }
                    _ => keep_inbound.push(item),
                }
            }
            if !keep_inbound.is_empty() {
                let _ = completions
                    .send(Completion::RequeueInbound(keep_inbound))
                    .await;
            }

            let mut keep_outbound = Vec::new();
            for item in outbound {
                match item.submitted_tx_hash {
                    Some(hash) => match pub_chain.receipt_status_ok(hash).await {
                        Ok(true) => {
                            info!("sweep: outbound {:#x} confirmed elsewhere", hash);
                        }
                        _ => keep_outbound.push(item),
                    },
                    None => keep_outbound.push(item),
                }
            }
            if !keep_outbound.is_empty() {
                let _ = completions
                    .send(Completion::RequeueOutbound(keep_outbound))
                    .await;
            }
        });
    }

    fn handle_completion(&mut self, completion: Completion) {
        match completion {
            Completion::NewInbound(items) => {
                for item in items {
                    // deposits past the timeout window are abandoned
                    let age = self.pub_height.saturating_sub(item.original_height as u64);
                    if age > TX_TIMEOUT_BLOCKS {
                        warn!("dropping expired inbound deposit {:#x}", item.hash());
                        continue;
                    }
                    self.inbound_queue.add_item(item);
                }
                self.metrics
                    .inbound_queue_size
                    .set(self.inbound_queue.size() as i64);
            }
            Completion::NewOutbound(items) => {
                for item in items {
                    self.outbound_queue.add_item(item);
                }
                self.metrics
                    .outbound_queue_size
                    .set(self.outbound_queue.size() as i64);
            }
            Completion::RequeueInbound(items) => {
                for item in items {
                    self.inbound_queue.add_item(item);
                }
            }
            Completion::RequeueOutbound(items) => {
                for item in items {
                    self.pending_outbound.remove(&item.index());
                    self.outbound_queue.add_item(item);
                }
            }
            Completion::InboundDone(index) => {
                self.counters.inbound.store(0, Ordering::SeqCst);
                self.metrics.inbound_confirmed.inc();
                debug!("inbound {} confirmed", index);
            }
            Completion::InboundFailed(item) => {
                self.inbound_queue.add_on_hold(item);
            }
            Completion::OutboundDone(item) => {
                self.counters.outbound.store(0, Ordering::SeqCst);
                self.metrics.outbound_confirmed.inc();
                self.pending_outbound.remove(&item.index());
                self.metrics
                    .pending_outbound_size
                    .set(self.pending_outbound.len() as i64);
            }
            Completion::OutboundFailed(item) => {
                self.pending_outbound.remove(&item.index());
                self.outbound_queue.add_on_hold(item);
            }
            Completion::OutboundBatchFinished => {
                self.outbound_in_flight.store(false, Ordering::SeqCst);
            }
            Completion::MoveFundRetry { side, pool, height } => match side {
                ChainSide::App => self.app_move_funds.add_move_fund_item(pool, height),
                ChainSide::Pub => self.pub_move_funds.add_move_fund_item(pool, height),
            },
        }
    }
}

/// No batch may be proposed within `MIN_CHECK_BLOCK_GAP` blocks of a
/// ROUNDBLOCK churn boundary.
fn near_churn_boundary(height: i64) -> bool {
    let next_boundary = (height / ROUND_BLOCK + 1) * ROUND_BLOCK;
    next_boundary - height <= MIN_CHECK_BLOCK_GAP
}
