//! secp256k1 private key material supplied by callers for import.
//!
//! A [`PrivateKey`] only exists on its way into the security module. It wraps
//! a [`k256::SecretKey`], which zeroes its scalar when dropped, and every
//! byte copy handed out is wrapped in [`Zeroizing`].
//!
//! # Example
//!
//! ```
//! use pkcs11_evm_signer_core::PrivateKey;
//!
//! let key = PrivateKey::from_hex(
//!     "0x1fe8f1ad4053326db20529257ac9401f2e6c769ef1d736b8c2f5aba5f787c72b",
//! )
//! .unwrap();
//! assert_eq!(
//!     key.address().to_hex(),
//!     "0x6038dc01869425004ca0b8370f6c81cf464213b3"
//! );
//! ```

use std::fmt;

use k256::{PublicKey, SecretKey};
use zeroize::{Zeroize, Zeroizing};

use crate::address::Address;
use crate::error::{Error, Result};

/// A secp256k1 private scalar.
pub struct PrivateKey {
    secret: SecretKey,
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrivateKey")
            .field("address", &self.address().to_hex())
            .finish_non_exhaustive()
    }
}

impl PrivateKey {
    /// The length of a private scalar in bytes.
    pub const BYTE_LEN: usize = 32;

    /// Parses a private key from a hex string, optionally prefixed with `0x`.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidHex`] if the string is not hex
    /// - [`Error::InvalidPrivateKeyLength`] if it does not decode to 32 bytes
    /// - [`Error::InvalidPrivateKey`] if the scalar is zero or not below the
    ///   curve order
    pub fn from_hex(hex_str: &str) -> Result<Self> {
        let stripped = hex_str
            .strip_prefix("0x")
            .or_else(|| hex_str.strip_prefix("0X"))
            .unwrap_or(hex_str);

        let bytes = Zeroizing::new(hex::decode(stripped)?);
        Self::from_slice(&bytes)
    }

    /// Builds a private key from its big-endian scalar bytes.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidPrivateKeyLength`] unless `bytes` is exactly 32 bytes
    /// - [`Error::InvalidPrivateKey`] if the scalar is zero or not below the
    ///   curve order
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != Self::BYTE_LEN {
            return Err(Error::InvalidPrivateKeyLength(bytes.len()));
        }

        let secret = SecretKey::from_slice(bytes).map_err(|_| {
            Error::InvalidPrivateKey("scalar is zero or exceeds the curve order".to_string())
        })?;

        Ok(Self { secret })
    }

    /// Returns the matching public key.
    #[must_use]
    pub fn public_key(&self) -> PublicKey {
        self.secret.public_key()
    }

    /// Returns the address of the matching public key.
    #[must_use]
    pub fn address(&self) -> Address {
        Address::from_public_key(&self.public_key())
    }

    /// Returns a copy of the scalar that is wiped when dropped.
    #[must_use]
    pub fn to_bytes(&self) -> Zeroizing<[u8; Self::BYTE_LEN]> {
        let mut field = self.secret.to_bytes();

        let mut bytes = Zeroizing::new([0u8; Self::BYTE_LEN]);
        bytes.copy_from_slice(&field);
        field.zeroize();

        bytes
    }

    pub(crate) fn secret(&self) -> &SecretKey {
        &self.secret
    }
}

impl From<SecretKey> for PrivateKey {
    fn from(secret: SecretKey) -> Self {
        Self { secret }
    }
}
