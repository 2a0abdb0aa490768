// Copyright (c) Oppy Finance
// SPDX-License-Identifier: Apache-2.0

//! Shared types for the oppy bridge: request records with their
//! deterministic ordering index, custody pool descriptions, deposit memos
//! and the signature material exchanged with the threshold signer.

pub mod address;
pub mod constants;
pub mod memo;
pub mod pool;
pub mod requests;
pub mod signature;

pub use address::AccAddress;
pub use memo::BridgeMemo;
pub use pool::PoolInfo;
pub use requests::{ChainClass, Coin, InboundReq, OutBoundReq, ReqIndex};
pub use signature::TssSignature;
