//! Account address derivation from secp256k1 public keys.
//!
//! Every account held in the security module is identified by a 20-byte
//! address computed the same way Ethereum computes it:
//!
//! 1. Take the uncompressed public key (65 bytes: `0x04 || x || y`)
//! 2. Remove the `0x04` prefix to get 64 bytes (`x || y`)
//! 3. Compute the Keccak-256 hash of the 64 bytes
//! 4. Take the last 20 bytes of the hash as the address
//!
//! # Example
//!
//! ```
//! use pkcs11_evm_signer_core::Address;
//!
//! let addr: Address = "0x6038dc01869425004ca0b8370f6c81cf464213b3".parse().unwrap();
//! assert_eq!(addr.hex_id(), "6038dc01869425004ca0b8370f6c81cf464213b3");
//! ```

use std::fmt;
use std::str::FromStr;

use alloy_primitives::{Address as AlloyAddress, keccak256};
use k256::elliptic_curve::sec1::{FromEncodedPoint, ToEncodedPoint};
use k256::{EncodedPoint, PublicKey};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// A 20-byte account address.
///
/// Equality is byte-wise; the hex form is only a presentation detail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Address(AlloyAddress);

impl Address {
    /// The length of an address in bytes.
    pub const BYTE_LEN: usize = 20;

    /// Creates a new address from a 20-byte array.
    #[must_use]
    pub const fn new(bytes: [u8; Self::BYTE_LEN]) -> Self {
        Self(AlloyAddress::new(bytes))
    }

    /// Returns the zero address (`0x0000...0000`).
    #[must_use]
    pub const fn zero() -> Self {
        Self(AlloyAddress::ZERO)
    }

    /// Checks if this is the zero address.
    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    /// Derives the address of a secp256k1 public key.
    ///
    /// A [`PublicKey`] is always a valid, non-identity curve point, so this
    /// cannot fail.
    #[must_use]
    pub fn from_public_key(public_key: &PublicKey) -> Self {
        let encoded = public_key.to_encoded_point(false);
        Self::from_coordinates(&encoded.as_bytes()[1..])
    }

    /// Derives the address of an encoded curve point.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidKey`] if either coordinate is absent (identity
    /// or compressed encodings) or if the point does not lie on secp256k1.
    pub fn from_encoded_point(point: &EncodedPoint) -> Result<Self> {
        if point.x().is_none() || point.y().is_none() {
            return Err(Error::InvalidKey);
        }

        let public_key: Option<PublicKey> = PublicKey::from_encoded_point(point).into();
        public_key
            .map(|key| Self::from_public_key(&key))
            .ok_or(Error::InvalidKey)
    }

    /// Derives an address from raw uncompressed public key bytes.
    ///
    /// # Arguments
    ///
    /// * `bytes` - Either 65 bytes (`0x04 || x || y`) or 64 bytes (`x || y`)
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidPublicKey`] if:
    /// - The byte length is not 64 or 65
    /// - For 65-byte input, the first byte is not `0x04`
    /// - The coordinates do not describe a point on secp256k1
    ///
    /// # Example
    ///
    /// ```
    /// use pkcs11_evm_signer_core::Address;
    ///
    /// // Not a point on the curve.
    /// assert!(Address::from_public_key_bytes(&[0u8; 64]).is_err());
    /// ```
    pub fn from_public_key_bytes(bytes: &[u8]) -> Result<Self> {
        let mut uncompressed = [0u8; 65];
        match bytes.len() {
            64 => {
                uncompressed[0] = 0x04;
                uncompressed[1..].copy_from_slice(bytes);
            }
            65 => {
                if bytes[0] != 0x04 {
                    return Err(Error::InvalidPublicKey(
                        "65-byte public key must start with 0x04".to_string(),
                    ));
                }
                uncompressed.copy_from_slice(bytes);
            }
            len => {
                return Err(Error::InvalidPublicKey(format!(
                    "expected 64 or 65 bytes, got {len}"
                )));
            }
        }

        PublicKey::from_sec1_bytes(&uncompressed)
            .map(|key| Self::from_public_key(&key))
            .map_err(|_| Error::InvalidPublicKey("point is not on secp256k1".to_string()))
    }

    /// Hashes `x || y` and keeps the low-order 20 bytes.
    fn from_coordinates(xy: &[u8]) -> Self {
        let hash = keccak256(xy);

        let mut address_bytes = [0u8; Self::BYTE_LEN];
        address_bytes.copy_from_slice(&hash[12..]);

        Self::new(address_bytes)
    }

    /// Returns the address as a byte slice.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; Self::BYTE_LEN] {
        self.0.as_ref()
    }

    /// Returns the address as a 20-byte array.
    #[must_use]
    pub const fn to_bytes(&self) -> [u8; Self::BYTE_LEN] {
        self.0.0.0
    }

    /// Returns the address as an EIP-55 checksummed hex string with `0x` prefix.
    #[must_use]
    pub fn to_checksum_hex(&self) -> String {
        self.0.to_checksum(None)
    }

    /// Returns the address as a lowercase hex string with `0x` prefix.
    #[must_use]
    pub fn to_hex(&self) -> String {
        format!("0x{}", self.hex_id())
    }

    /// Returns the normalized identifier form: lowercase hex, no prefix.
    ///
    /// This is the form stored as the key identifier on token objects.
    #[must_use]
    pub fn hex_id(&self) -> String {
        hex::encode(self.as_bytes())
    }

    /// Parses an address from a hex string.
    ///
    /// The `0x` prefix is optional and hex digits are case-insensitive.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidAddress`] if the string is not hex or does not
    /// decode to exactly 20 bytes.
    ///
    /// # Example
    ///
    /// ```
    /// use pkcs11_evm_signer_core::Address;
    ///
    /// let addr = Address::from_hex("0x0000000000000000000000000000000000000000").unwrap();
    /// assert!(addr.is_zero());
    /// assert!(Address::from_hex("0x1234").is_err());
    /// ```
    pub fn from_hex(hex_str: &str) -> Result<Self> {
        let stripped = hex_str
            .strip_prefix("0x")
            .or_else(|| hex_str.strip_prefix("0X"))
            .unwrap_or(hex_str);

        let mut address_bytes = [0u8; Self::BYTE_LEN];
        hex::decode_to_slice(stripped, &mut address_bytes).map_err(|err| {
            Error::InvalidAddress(format!("{hex_str:?}: {err}"))
        })?;

        Ok(Self::new(address_bytes))
    }

    /// Returns the inner [`alloy_primitives::Address`].
    #[must_use]
    pub const fn inner(&self) -> AlloyAddress {
        self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", self.hex_id())
    }
}

impl FromStr for Address {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_hex(s)
    }
}

impl From<AlloyAddress> for Address {
    fn from(addr: AlloyAddress) -> Self {
        Self(addr)
    }
}

impl From<Address> for AlloyAddress {
    fn from(addr: Address) -> Self {
        addr.0
    }
}

impl From<[u8; 20]> for Address {
    fn from(bytes: [u8; 20]) -> Self {
        Self::new(bytes)
    }
}
