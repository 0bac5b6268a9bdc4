//! Security module abstraction.
//!
//! A security module is a token-based cryptographic device (an HSM, a smart
//! card, or a software token such as SoftHSM) that holds the account keys.
//! The [`SecurityModule`] trait is the only capability the account manager
//! needs from it:
//!
//! - Session management (open, log in, log out, close)
//! - Key discovery by address
//! - Key generation and import
//! - Raw signing
//!
//! The module knows nothing about locked or unlocked accounts. Once a session
//! is open it signs whatever it is asked to; authorization is enforced by
//! [`AccountManager`](crate::AccountManager).
//!
//! # Adapters
//!
//! - [`Pkcs11Module`]: a real token reached through a PKCS#11 library
//!   (requires the `pkcs11` feature, enabled by default)
//! - [`MemoryModule`]: an in-process software token for tests and local
//!   development

pub mod memory;

#[cfg(feature = "pkcs11")]
pub mod pkcs11;

use std::sync::Arc;

pub use memory::MemoryModule;

#[cfg(feature = "pkcs11")]
pub use pkcs11::Pkcs11Module;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::address::Address;
use crate::config::NewAccountConfig;
use crate::error::Result;
use crate::key::PrivateKey;

/// An addressable signing identity backed by a key pair in the module.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Account {
    /// The account address.
    pub address: Address,

    /// Optional locator owned by the adapter; never interpreted by the manager.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<Url>,
}

impl Account {
    /// Creates an account without a locator.
    #[must_use]
    pub const fn new(address: Address) -> Self {
        Self { address, url: None }
    }
}

/// A token-based cryptographic device holding account keys.
///
/// Every method except [`open_session`](Self::open_session) requires an open
/// session and fails with [`Error::SessionNotOpen`](crate::Error::SessionNotOpen)
/// otherwise.
pub trait SecurityModule: Send + Sync {
    /// Selects the configured slot, opens a read/write session and logs in.
    ///
    /// # Errors
    ///
    /// - [`Error::SlotNotFound`](crate::Error::SlotNotFound) if no token
    ///   carries the configured label
    /// - [`Error::LoginFailed`](crate::Error::LoginFailed) on bad credentials
    fn open_session(&self) -> Result<()>;

    /// Logs out and closes the session.
    ///
    /// Calling it again without reopening surfaces the device error.
    fn close_session(&self) -> Result<()>;

    /// Enumerates every account on the token.
    ///
    /// A key object without a valid address identifier fails the whole call.
    fn accounts(&self) -> Result<Vec<Account>>;

    /// Checks whether a private key tagged with `address` exists.
    ///
    /// Not finding the key is `Ok(false)`; only lookup failures are errors.
    fn contains(&self, address: &Address) -> Result<bool>;

    /// Signs `payload` with ECDSA over SHA-256 using the key for `address`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::KeyNotFound`](crate::Error::KeyNotFound) if no private
    /// key is tagged with `address`.
    fn sign(&self, payload: &[u8], address: &Address) -> Result<Vec<u8>>;

    /// Generates a non-extractable secp256k1 key pair labelled with the
    /// configured secret name.
    fn new_account(&self, config: &NewAccountConfig) -> Result<Account>;

    /// Imports caller-supplied key material as an extractable key pair.
    ///
    /// The key is consumed and its scalar is wiped from process memory when
    /// the call returns, whether or not the import succeeded.
    fn import_private_key(&self, key: PrivateKey, config: &NewAccountConfig) -> Result<Account>;
}

impl<M: SecurityModule + ?Sized> SecurityModule for Arc<M> {
    fn open_session(&self) -> Result<()> {
        (**self).open_session()
    }

    fn close_session(&self) -> Result<()> {
        (**self).close_session()
    }

    fn accounts(&self) -> Result<Vec<Account>> {
        (**self).accounts()
    }

    fn contains(&self, address: &Address) -> Result<bool> {
        (**self).contains(address)
    }

    fn sign(&self, payload: &[u8], address: &Address) -> Result<Vec<u8>> {
        (**self).sign(payload, address)
    }

    fn new_account(&self, config: &NewAccountConfig) -> Result<Account> {
        (**self).new_account(config)
    }

    fn import_private_key(&self, key: PrivateKey, config: &NewAccountConfig) -> Result<Account> {
        (**self).import_private_key(key, config)
    }
}
