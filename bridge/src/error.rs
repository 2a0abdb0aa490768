// Copyright (c) Oppy Finance
// SPDX-License-Identifier: Apache-2.0

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeError {
    // The chain RPC failed or timed out; safe to retry
    TransientRpc(String),
    // The chain RPC returned a malformed or unexpected payload
    Rpc(String),
    // The threshold signer could not produce a quorum signature
    TssSign(String),
    // Broadcast was accepted by the node but rejected with a non-zero code
    BroadcastRejected { code: u32, log: String },
    // The destination record for this request was not observed in time
    StatusUnconfirmed(String),
    // Deposit failed validation and never enters the queue
    InvalidDeposit(String),
    // A pool descriptor or address failed to decode
    Address(String),
    // Persistence failure
    Storage(String),
    // Uncategorized
    Generic(String),
}

impl BridgeError {
    /// Short stable label for metrics.
    pub fn error_type(&self) -> &'static str {
        match self {
            BridgeError::TransientRpc(_) => "transient_rpc",
            BridgeError::Rpc(_) => "rpc",
            BridgeError::TssSign(_) => "tss_sign",
            BridgeError::BroadcastRejected { .. } => "broadcast_rejected",
            BridgeError::StatusUnconfirmed(_) => "status_unconfirmed",
            BridgeError::InvalidDeposit(_) => "invalid_deposit",
            BridgeError::Address(_) => "address",
            BridgeError::Storage(_) => "storage",
            BridgeError::Generic(_) => "generic",
        }
    }
}

impl std::fmt::Display for BridgeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BridgeError::TransientRpc(msg) => write!(f, "transient rpc error: {}", msg),
            BridgeError::Rpc(msg) => write!(f, "rpc error: {}", msg),
            BridgeError::TssSign(msg) => write!(f, "tss signing failed: {}", msg),
            BridgeError::BroadcastRejected { code, log } => {
                write!(f, "broadcast rejected with code {}: {}", code, log)
            }
            BridgeError::StatusUnconfirmed(id) => {
                write!(f, "tx {} not confirmed on destination", id)
            }
            BridgeError::InvalidDeposit(msg) => write!(f, "invalid deposit: {}", msg),
            BridgeError::Address(msg) => write!(f, "address error: {}", msg),
            BridgeError::Storage(msg) => write!(f, "storage error: {}", msg),
            BridgeError::Generic(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for BridgeError {}

impl From<oppy_bridge_types::address::AddressError> for BridgeError {
    fn from(e: oppy_bridge_types::address::AddressError) -> Self {
        BridgeError::Address(e.to_string())
    }
}

impl From<oppy_bridge_types::signature::SignatureError> for BridgeError {
    fn from(e: oppy_bridge_types::signature::SignatureError) -> Self {
        BridgeError::TssSign(e.to_string())
    }
}

pub type BridgeResult<T> = Result<T, BridgeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_types_are_valid_metric_labels() {
        let errors = [
            BridgeError::TransientRpc("t".into()),
            BridgeError::TssSign("t".into()),
            BridgeError::BroadcastRejected {
                code: 4,
                log: "t".into(),
            },
            BridgeError::StatusUnconfirmed("t".into()),
            BridgeError::InvalidDeposit("t".into()),
            BridgeError::Storage("t".into()),
        ];
        for err in errors {
            let label = err.error_type();
            assert!(!label.is_empty());
            assert!(label.chars().all(|c| c.is_ascii_lowercase() || c == '_'));
        }
    }

    #[test]
    fn display_includes_rejection_code() {
        let err = BridgeError::BroadcastRejected {
            code: 13,
            log: "insufficient fee".into(),
        };
        let rendered = err.to_string();
        assert!(rendered.contains("13"));
        assert!(rendered.contains("insufficient fee"));
    }
}
