// Copyright (c) Oppy Finance
// SPDX-License-Identifier: Apache-2.0

//! Signature material returned by the threshold signer.
//!
//! The signer hands back `(r, s, recovery_id)` base64-encoded. Before a
//! signature goes on a wire it is normalized to low-S (flipping the
//! recovery bit alongside), and for EIP-155 protected transactions the
//! recovery id is folded into `v = recovery_id + 35 + 2 * chain_id`.

use base64::Engine;
use ethers::types::{Signature as EthSignature, U256};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Order of the secp256k1 group.
const CURVE_N: &str = "fffffffffffffffffffffffffffffffebaaedce6af48a03bbfd25e8cd0364141";

#[derive(Debug, Error)]
pub enum SignatureError {
    #[error("invalid base64 field {field}: {source}")]
    Base64 {
        field: &'static str,
        source: base64::DecodeError,
    },
    #[error("scalar {0} exceeds 32 bytes")]
    ScalarTooLarge(&'static str),
    #[error("recovery id {0} out of range")]
    RecoveryId(u64),
}

/// One threshold signature as it appears on the TSS wire.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TssSignature {
    pub r: String,
    pub s: String,
    pub recovery_id: String,
}

impl TssSignature {
    /// Assemble from raw scalars; used by mock signers in tests.
    pub fn from_scalars(r: U256, s: U256, recovery_id: u8) -> Self {
        let engine = base64::engine::general_purpose::STANDARD;
        let mut r_bytes = [0u8; 32];
        let mut s_bytes = [0u8; 32];
        r.to_big_endian(&mut r_bytes);
        s.to_big_endian(&mut s_bytes);
        Self {
            r: engine.encode(r_bytes),
            s: engine.encode(s_bytes),
            recovery_id: engine.encode([recovery_id]),
        }
    }

    fn decode_scalar(
        field: &'static str,
        value: &str,
    ) -> Result<U256, SignatureError> {
        let raw = base64::engine::general_purpose::STANDARD
            .decode(value)
            .map_err(|source| SignatureError::Base64 { field, source })?;
        if raw.len() > 32 {
            return Err(SignatureError::ScalarTooLarge(field));
        }
        Ok(U256::from_big_endian(&raw))
    }

    /// Decode into `(r, s, recovery_id)` with `s` normalized to the low
    /// half of the group order.
    pub fn to_scalars(&self) -> Result<(U256, U256, u8), SignatureError> {
        let r = Self::decode_scalar("r", &self.r)?;
        let mut s = Self::decode_scalar("s", &self.s)?;
        let v = Self::decode_scalar("recovery_id", &self.recovery_id)?;
        if v > U256::from(1u8) {
            return Err(SignatureError::RecoveryId(v.low_u64()));
        }
        let mut recovery_id = v.low_u64() as u8;

        let n = U256::from_str_radix(CURVE_N, 16).expect("curve order constant parses");
        if s > n / 2 {
            s = n - s;
            recovery_id ^= 1;
        }
        Ok((r, s, recovery_id))
    }

    /// Produce an EIP-155 protected signature for the given chain.
    pub fn to_eth_signature(&self, chain_id: u64) -> Result<EthSignature, SignatureError> {
        let (r, s, recovery_id) = self.to_scalars()?;
        Ok(EthSignature {
            r,
            s,
            v: recovery_id as u64 + 35 + chain_id * 2,
        })
    }

    /// Serialize to the 64-byte `r || s` compact form used in app-chain
    /// transactions.
    pub fn to_compact(&self) -> Result<[u8; 64], SignatureError> {
        let (r, s, _) = self.to_scalars()?;
        let mut out = [0u8; 64];
        r.to_big_endian(&mut out[..32]);
        s.to_big_endian(&mut out[32..]);
        Ok(out)
    }
}

/// Strip EIP-155 protection from a `v` value, recovering the plain
/// recovery id.
pub fn recover_rec_id(chain_id: u64, v: u64) -> u64 {
    match v {
        0 | 1 => v,
        27 | 28 => v - 27,
        _ => v - 35 - 2 * chain_id,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalars_round_trip() {
        let sig = TssSignature::from_scalars(U256::from(11u8), U256::from(22u8), 1);
        let (r, s, rec) = sig.to_scalars().unwrap();
        assert_eq!(r, U256::from(11u8));
        assert_eq!(s, U256::from(22u8));
        assert_eq!(rec, 1);
    }

    #[test]
    fn high_s_is_flipped_with_recovery_bit() {
        let n = U256::from_str_radix(CURVE_N, 16).unwrap();
        let high_s = n - U256::from(5u8);
        let sig = TssSignature::from_scalars(U256::from(1u8), high_s, 0);
        let (_, s, rec) = sig.to_scalars().unwrap();
        assert_eq!(s, U256::from(5u8));
        assert_eq!(rec, 1);
    }

    #[test]
    fn eip155_v_encoding() {
        let sig = TssSignature::from_scalars(U256::from(1u8), U256::from(2u8), 1);
        let eth = sig.to_eth_signature(56).unwrap();
        assert_eq!(eth.v, 1 + 35 + 112);
        assert_eq!(recover_rec_id(56, eth.v), 1);
    }

    #[test]
    fn legacy_v_values_recover() {
        assert_eq!(recover_rec_id(1, 27), 0);
        assert_eq!(recover_rec_id(1, 28), 1);
        assert_eq!(recover_rec_id(1, 0), 0);
    }

    #[test]
    fn invalid_wire_fields_are_rejected() {
        let sig = TssSignature {
            r: "!!not-base64!!".into(),
            s: TssSignature::from_scalars(U256::one(), U256::one(), 0).s,
            recovery_id: "AA==".into(),
        };
        assert!(matches!(
            sig.to_scalars(),
            Err(SignatureError::Base64 { field: "r", .. })
        ));
    }

    #[test]
    fn compact_form_is_64_bytes_big_endian() {
        let sig = TssSignature::from_scalars(U256::from(0x0102u16), U256::from(3u8), 0);
        let compact = sig.to_compact().unwrap();
        assert_eq!(compact[30..32], [0x01, 0x02]);
        assert_eq!(compact[63], 3);
    }
}
