// Copyright (c) Oppy Finance
// SPDX-License-Identifier: Apache-2.0

//! Account addresses of the app chain and their derivations.
//!
//! The app chain is ethermint-style: an account address is the keccak160 of
//! the uncompressed secp256k1 public key, rendered as bech32 with a
//! chain-specific prefix. The same 20 bytes therefore convert losslessly to
//! and from an EVM address.

use bech32::{FromBase32, ToBase32, Variant};
use ethers::core::k256::ecdsa::VerifyingKey;
use ethers::core::k256::elliptic_curve::sec1::ToEncodedPoint;
use ethers::types::Address as EthAddress;
use ethers::utils::keccak256;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use thiserror::Error;

/// Amino type tag prepended to bech32-encoded account public keys.
const AMINO_SECP256K1_PUBKEY_PREFIX: [u8; 5] = [0xeb, 0x5a, 0xe9, 0x87, 0x21];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AddressError {
    #[error("empty address string is not allowed")]
    Empty,
    #[error("invalid bech32 payload: {0}")]
    Bech32(String),
    #[error("expected bech32 prefix {expected}, got {actual}")]
    WrongPrefix { expected: String, actual: String },
    #[error("account address must be 20 bytes, got {0}")]
    WrongLength(usize),
    #[error("invalid secp256k1 public key: {0}")]
    InvalidPubKey(String),
}

/// A 20-byte account address together with the prefix it renders under.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct AccAddress {
    hrp: String,
    bytes: [u8; 20],
}

impl AccAddress {
    pub fn new(hrp: &str, bytes: [u8; 20]) -> Self {
        Self {
            hrp: hrp.to_string(),
            bytes,
        }
    }

    /// Parse a bech32 account address, accepting any prefix.
    pub fn from_bech32(s: &str) -> Result<Self, AddressError> {
        if s.trim().is_empty() {
            return Err(AddressError::Empty);
        }
        let (hrp, data, _) = bech32::decode(s).map_err(|e| AddressError::Bech32(e.to_string()))?;
        let raw =
            Vec::<u8>::from_base32(&data).map_err(|e| AddressError::Bech32(e.to_string()))?;
        let bytes: [u8; 20] = raw
            .as_slice()
            .try_into()
            .map_err(|_| AddressError::WrongLength(raw.len()))?;
        Ok(Self { hrp, bytes })
    }

    /// Parse a bech32 account address and require the given prefix.
    pub fn from_bech32_with_hrp(expected_hrp: &str, s: &str) -> Result<Self, AddressError> {
        let addr = Self::from_bech32(s)?;
        if addr.hrp != expected_hrp {
            return Err(AddressError::WrongPrefix {
                expected: expected_hrp.to_string(),
                actual: addr.hrp,
            });
        }
        Ok(addr)
    }

    /// Derive the account address of a compressed secp256k1 public key.
    pub fn from_pubkey(hrp: &str, compressed: &[u8]) -> Result<Self, AddressError> {
        let eth = pubkey_to_eth_address(compressed)?;
        Ok(Self::from_eth(hrp, eth))
    }

    pub fn from_eth(hrp: &str, addr: EthAddress) -> Self {
        Self {
            hrp: hrp.to_string(),
            bytes: addr.0,
        }
    }

    pub fn to_eth(&self) -> EthAddress {
        EthAddress::from(self.bytes)
    }

    pub fn hrp(&self) -> &str {
        &self.hrp
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

impl fmt::Display for AccAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let encoded = bech32::encode(&self.hrp, self.bytes.to_base32(), Variant::Bech32)
            .expect("bech32 encoding of a fixed-size payload cannot fail");
        write!(f, "{}", encoded)
    }
}

// Debug renders the bech32 form; the raw bytes are never useful in logs.
impl fmt::Debug for AccAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}

impl Serialize for AccAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for AccAddress {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_bech32(&s).map_err(serde::de::Error::custom)
    }
}

/// Derive the EVM address of a compressed secp256k1 public key
/// (decompress, keccak256 the 64-byte point, keep the low 20 bytes).
pub fn pubkey_to_eth_address(compressed: &[u8]) -> Result<EthAddress, AddressError> {
    let key = VerifyingKey::from_sec1_bytes(compressed)
        .map_err(|e| AddressError::InvalidPubKey(e.to_string()))?;
    let point = key.to_encoded_point(false);
    let raw = &point.as_bytes()[1..];
    let hash = keccak256(raw);
    Ok(EthAddress::from_slice(&hash[12..]))
}

/// Decode a bech32-encoded account public key (legacy amino framing) into
/// its 33 compressed bytes.
pub fn decode_bech32_pubkey(pk: &str) -> Result<Vec<u8>, AddressError> {
    let (_, data, _) = bech32::decode(pk).map_err(|e| AddressError::Bech32(e.to_string()))?;
    let raw = Vec::<u8>::from_base32(&data).map_err(|e| AddressError::Bech32(e.to_string()))?;
    if raw.len() == 38 && raw[..5] == AMINO_SECP256K1_PUBKEY_PREFIX {
        return Ok(raw[5..].to_vec());
    }
    if raw.len() == 33 {
        return Ok(raw);
    }
    Err(AddressError::InvalidPubKey(format!(
        "unexpected public key payload of {} bytes",
        raw.len()
    )))
}

/// Encode a compressed account public key into its bech32 form.
pub fn encode_bech32_pubkey(hrp_pub: &str, compressed: &[u8]) -> Result<String, AddressError> {
    let mut framed = AMINO_SECP256K1_PUBKEY_PREFIX.to_vec();
    framed.extend_from_slice(compressed);
    bech32::encode(hrp_pub, framed.to_base32(), Variant::Bech32)
        .map_err(|e| AddressError::Bech32(e.to_string()))
}
