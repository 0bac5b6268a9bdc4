//! Error types for the PKCS#11 EVM signer library.
//!
//! This module provides a single error type [`enum@Error`] covering every
//! failure mode of the account manager, the security module adapters and the
//! address/key codecs.
//!
//! # Error Categories
//!
//! - **Account errors**: the account does not exist, or exists but is locked
//! - **Security module errors**: library loading, slot selection, login, key
//!   lookup and any other failure reported by the token
//! - **Input errors**: malformed addresses, public keys, private keys and
//!   configuration
//!
//! Callers that need a stable, coarse classification (for example to map onto
//! response codes) should use [`Error::kind`].
//!
//! # Example
//!
//! ```
//! use pkcs11_evm_signer_core::{Address, Error, ErrorKind};
//!
//! let err = Error::AccountLocked(Address::zero());
//! assert_eq!(err.kind(), ErrorKind::Locked);
//! ```

use core::result::Result as CoreResult;
use std::path::PathBuf;

use hex::FromHexError;
use serde_json::Error as SerdeJsonError;
use thiserror::Error;

use crate::address::Address;

/// The main error type for the PKCS#11 EVM signer library.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    // =========================================================================
    // Account Errors
    // =========================================================================
    /// The account is not present in the security module.
    #[error("account does not exist: {0}")]
    AccountNotFound(Address),

    /// The account exists but is not currently unlocked for signing.
    #[error("account locked: {0}")]
    AccountLocked(Address),

    // =========================================================================
    // Security Module Errors
    // =========================================================================
    /// The PKCS#11 library could not be found at the configured path.
    #[error("PKCS#11 library not found at {}", .0.display())]
    LibraryNotFound(PathBuf),

    /// The PKCS#11 library has already been initialized in this process.
    #[error("PKCS#11 library already initialized")]
    AlreadyInitialized,

    /// No slot carries a token with the configured label.
    #[error("no slot found with token label {0:?}")]
    SlotNotFound(String),

    /// Logging in to the token failed.
    #[error("login failed: {0}")]
    LoginFailed(String),

    /// An operation needing a session was called before `open_session`.
    #[error("no open session with the security module")]
    SessionNotOpen,

    /// No private key object is tagged with the given address.
    #[error("key not found: {0}")]
    KeyNotFound(Address),

    /// Any other failure reported by the security module.
    #[error("security module error: {0}")]
    Module(String),

    /// Timed unlocks need a Tokio runtime to arm their expiry timers.
    #[error("no Tokio runtime available to schedule unlock timers")]
    RuntimeUnavailable,

    // =========================================================================
    // Input Errors
    // =========================================================================
    /// The public key encoding is malformed or not on the curve.
    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),

    /// A public key is missing a coordinate or lies off the curve.
    #[error("invalid key: unable to derive address")]
    InvalidKey,

    /// The address string is malformed.
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    /// The private key is not valid hex.
    #[error("invalid hex private key: {0}")]
    InvalidHex(String),

    /// The private key does not decode to exactly 32 bytes.
    #[error("private key must have length 32 bytes")]
    InvalidPrivateKeyLength(usize),

    /// The private key bytes are not a valid secp256k1 scalar.
    #[error("invalid private key: {0}")]
    InvalidPrivateKey(String),

    /// The configuration failed validation.
    #[error("{0}")]
    InvalidConfig(String),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(String),
}

/// Coarse classification of an [`enum@Error`].
///
/// The RPC layer maps each kind onto a distinct response code, so the mapping
/// from variant to kind is part of the public contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The account (or its key) is absent from the security module.
    NotFound,

    /// The account exists but is not unlocked.
    Locked,

    /// The security module, or the machinery around it, failed.
    ModuleFailure,

    /// The caller supplied malformed input.
    InvalidInput,
}

impl Error {
    /// Returns the [`ErrorKind`] of this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::AccountNotFound(_) | Self::KeyNotFound(_) => ErrorKind::NotFound,
            Self::AccountLocked(_) => ErrorKind::Locked,
            Self::LibraryNotFound(_)
            | Self::AlreadyInitialized
            | Self::SlotNotFound(_)
            | Self::LoginFailed(_)
            | Self::SessionNotOpen
            | Self::Module(_)
            | Self::RuntimeUnavailable => ErrorKind::ModuleFailure,
            Self::InvalidPublicKey(_)
            | Self::InvalidKey
            | Self::InvalidAddress(_)
            | Self::InvalidHex(_)
            | Self::InvalidPrivateKeyLength(_)
            | Self::InvalidPrivateKey(_)
            | Self::InvalidConfig(_)
            | Self::Json(_) => ErrorKind::InvalidInput,
        }
    }
}

impl From<FromHexError> for Error {
    fn from(err: FromHexError) -> Self {
        Error::InvalidHex(err.to_string())
    }
}

impl From<SerdeJsonError> for Error {
    fn from(err: SerdeJsonError) -> Self {
        Error::Json(err.to_string())
    }
}

#[cfg(feature = "pkcs11")]
impl From<cryptoki::error::Error> for Error {
    fn from(err: cryptoki::error::Error) -> Self {
        use cryptoki::error::{Error as CryptokiError, RvError};

        match err {
            CryptokiError::Pkcs11(RvError::CryptokiAlreadyInitialized, _) => {
                Error::AlreadyInitialized
            }
            other => Error::Module(other.to_string()),
        }
    }
}

/// A specialized [`Result`] type for signer operations.
pub type Result<T> = CoreResult<T, Error>;

#[cfg(test)]
mod tests {
    use serde_json::{Value, from_str};

    use super::*;

    #[test]
    fn error_display() {
        let err = Error::InvalidPrivateKeyLength(2);
        assert_eq!(err.to_string(), "private key must have length 32 bytes");

        let err = Error::InvalidKey;
        assert_eq!(err.to_string(), "invalid key: unable to derive address");

        let err = Error::AccountNotFound(Address::new([0xab; 20]));
        assert_eq!(
            err.to_string(),
            "account does not exist: 0xabababababababababababababababababababab"
        );
    }

    #[test]
    fn error_kinds_are_distinct() {
        let addr = Address::zero();
        assert_eq!(Error::AccountNotFound(addr).kind(), ErrorKind::NotFound);
        assert_eq!(Error::KeyNotFound(addr).kind(), ErrorKind::NotFound);
        assert_eq!(Error::AccountLocked(addr).kind(), ErrorKind::Locked);
        assert_eq!(
            Error::LoginFailed("CKR_PIN_INCORRECT".into()).kind(),
            ErrorKind::ModuleFailure
        );
        assert_eq!(
            Error::InvalidAddress("0x12".into()).kind(),
            ErrorKind::InvalidInput
        );
    }

    #[test]
    fn from_hex_error() {
        let hex_err = FromHexError::InvalidHexCharacter { c: 'g', index: 0 };
        let err: Error = hex_err.into();
        assert!(matches!(err, Error::InvalidHex(_)));
        assert!(err.to_string().starts_with("invalid hex private key"));
    }

    #[test]
    fn from_json_error() {
        let json_err = from_str::<Value>("not valid json{").unwrap_err();
        let err: Error = json_err.into();
        assert!(matches!(err, Error::Json(_)));
    }
}
