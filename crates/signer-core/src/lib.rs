//! PKCS#11 EVM Signer Core Library
//!
//! This crate manages Ethereum signing accounts whose secp256k1 keys live in a
//! token-based security module (an HSM, a smart card, SoftHSM, ...) reached
//! through PKCS#11.
//!
//! # Overview
//!
//! Keys never leave the token. The library discovers them, generates or
//! imports them, and asks the token to sign, but only for accounts that are
//! currently unlocked: an account is signable during an explicit,
//! optionally time-bounded, unlock window and locked otherwise.
//!
//! This library provides:
//!
//! - **Address Derivation**: Ethereum addresses from secp256k1 public keys
//! - **Security Modules**: a capability trait with a PKCS#11 adapter and an
//!   in-memory software token
//! - **Account Manager**: the unlock state machine and its expiry timers
//! - **Configuration**: library path, slot label and PIN indirection through
//!   environment variables
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 Application Layer (RPC shell)               │
//! ├─────────────────────────────────────────────────────────────┤
//! │                       AccountManager                        │
//! │     ┌──────────────────────┐    ┌───────────────────────┐   │
//! │     │  Unlock table        │    │  Expiry timers        │   │
//! │     │  (address → entry)   │    │  (Tokio tasks)        │   │
//! │     └──────────────────────┘    └───────────────────────┘   │
//! ├─────────────────────────────────────────────────────────────┤
//! │                  SecurityModule (trait)                     │
//! │     ┌──────────────────────┐    ┌───────────────────────┐   │
//! │     │  Pkcs11Module        │    │  MemoryModule         │   │
//! │     └──────────────────────┘    └───────────────────────┘   │
//! ├─────────────────────────────────────────────────────────────┤
//! │        PKCS#11 library (SoftHSM, vendor HSM, ...)           │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Quick Start
//!
//! ## Address Derivation
//!
//! ```rust
//! use pkcs11_evm_signer_core::{Address, PrivateKey};
//!
//! let key = PrivateKey::from_hex(
//!     "1fe8f1ad4053326db20529257ac9401f2e6c769ef1d736b8c2f5aba5f787c72b",
//! )
//! .unwrap();
//!
//! let expected: Address = "0x6038dc01869425004ca0b8370f6c81cf464213b3".parse().unwrap();
//! assert_eq!(key.address(), expected);
//! ```
//!
//! ## Unlocking and Signing
//!
//! ```rust
//! use std::time::Duration;
//!
//! use pkcs11_evm_signer_core::{AccountManager, MemoryModule, NewAccountConfig};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> pkcs11_evm_signer_core::Result<()> {
//! let manager = AccountManager::new(MemoryModule::new(), &[] as &[&str])?;
//! manager.open()?;
//!
//! let account = manager.new_account(&NewAccountConfig::new("alice"))?;
//! manager.timed_unlock(&account.address, Duration::from_secs(30))?;
//!
//! let signature = manager.sign(&account.address, b"payload")?;
//! println!("{}", manager.status());
//! # let _ = signature;
//! # Ok(())
//! # }
//! ```
//!
//! ## Using a PKCS#11 Token
//!
//! ```ignore
//! use pkcs11_evm_signer_core::{AccountManager, Config, Pkcs11Module};
//!
//! let config = Config::from_json(&std::fs::read("config.json")?)?;
//! config.validate()?;
//!
//! let module = Pkcs11Module::new(&config.library)?;
//! let manager = AccountManager::new(module, &config.unlock)?;
//! manager.open()?;
//! ```
//!
//! # Feature Flags
//!
//! - `pkcs11` (default): the [`Pkcs11Module`] adapter, built on `cryptoki`.
//!   Without it only [`MemoryModule`] is available.
//!
//! # Security Considerations
//!
//! - Generated private keys are sensitive and non-extractable
//! - Imported key material is wiped from process memory after the import
//! - Signing requires an unlocked account; unlocks live only in memory
//! - The slot PIN is resolved from the environment, never from the config file

// Modules
pub mod address;
pub mod config;
pub mod error;
pub mod key;
pub mod manager;
pub mod module;

mod unlock;

// Re-exports for convenience
pub use address::Address;
pub use config::{Config, EnvironmentVariable, NewAccountConfig, Pkcs11Library};
pub use error::{Error, ErrorKind, Result};
pub use key::PrivateKey;
pub use manager::AccountManager;
pub use module::{Account, MemoryModule, SecurityModule};

#[cfg(feature = "pkcs11")]
pub use module::Pkcs11Module;

#[cfg(test)]
use tracing_subscriber as _;
