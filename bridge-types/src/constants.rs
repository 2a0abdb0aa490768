// Copyright (c) Oppy Finance
// SPDX-License-Identifier: Apache-2.0

//! Wire-visible constants shared by both pipelines.

use std::time::Duration;

/// Bech32 account prefix of the app chain.
pub const APP_CHAIN_HRP: &str = "oppy";
/// Bech32 account prefix of the IBC side chain.
pub const IBC_CHAIN_HRP: &str = "jolt";

/// Block bucket used as a coarse nonce in TSS signing payloads and as the
/// granularity of backpressure pauses.
pub const ROUND_BLOCK: i64 = 50;

/// Cadence, in app-chain blocks, of the requeue sweep over both queues.
pub const DUMP_ITEMS_GAP: i64 = 40;

/// Minimum distance to a churn boundary at which batches may still be
/// proposed, and the base offset for the first move-fund attempt.
pub const MIN_CHECK_BLOCK_GAP: i64 = 6;

/// Inbound deposits older than this many pub-chain blocks are discarded.
pub const TX_TIMEOUT_BLOCKS: u64 = 300;

/// Fixed decimal precision of the app chain.
pub const PRECISION: u32 = 18;

/// Gas limit multiplier applied on top of the estimate for outbound txs.
pub const GAS_FEE_RATIO: f64 = 1.5;
/// Gas price multiplier for outbound transfers.
pub const PUB_CHAIN_GAS_FEE_RATIO: u64 = 3;
/// Gas price multiplier when draining a retired pool.
pub const MOVEFUND_PUB_CHAIN_GAS_FEE_RATIO: f64 = 1.2;

/// Gas limit of a plain value transfer on the pub chain.
pub const PUB_CHAIN_TRANSFER_GAS: u64 = 21_000;
/// Gas limit used for ERC-20 transfers when estimation is unavailable.
pub const PUB_CHAIN_ERC20_GAS: u64 = 80_000;

/// App-chain blocks between refreshes of the cached pub-chain gas price.
pub const PRICE_UPDATE_GAP: i64 = 10;

/// Relative timeout, in app-chain blocks, stamped on IBC transfers.
pub const IBC_TIMEOUT_BLOCKS: i64 = 150;

/// Default deadline for a single chain or TSS RPC.
pub const QUERY_TIMEOUT: Duration = Duration::from_secs(6);

/// Fee denom that outbound requests must carry next to the bridged token.
pub const OUT_BOUND_DENOM_FEE: &str = "pjolt";
/// Minimum fee amount, in base units of [`OUT_BOUND_DENOM_FEE`].
pub const OUT_BOUND_FEE_MIN: u64 = 10;
