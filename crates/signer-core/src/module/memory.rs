//! In-process software token.
//!
//! [`MemoryModule`] keeps its keys in memory and behaves like a freshly
//! initialized token: sessions must be opened before use, generated keys are
//! non-extractable, imported keys are extractable, and signatures are
//! deterministic ECDSA over SHA-256 (RFC 6979) in raw `r || s` form, the same
//! shape a PKCS#11 token returns for `CKM_ECDSA_SHA256`.
//!
//! Nothing is persisted. The module backs the test-suite and local
//! development where no hardware is available.
//!
//! # Example
//!
//! ```
//! use pkcs11_evm_signer_core::config::NewAccountConfig;
//! use pkcs11_evm_signer_core::module::{MemoryModule, SecurityModule};
//!
//! let module = MemoryModule::new();
//! module.open_session().unwrap();
//!
//! let account = module.new_account(&NewAccountConfig::new("alice")).unwrap();
//! let signature = module.sign(b"hello", &account.address).unwrap();
//! assert_eq!(signature.len(), 64);
//! ```

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use k256::{PublicKey, SecretKey};
use k256::ecdsa::signature::Signer;
use k256::ecdsa::{Signature, SigningKey, VerifyingKey};
use rand_core::OsRng;
use tracing::{debug, info};

use super::{Account, SecurityModule};
use crate::address::Address;
use crate::config::NewAccountConfig;
use crate::error::{Error, Result};
use crate::key::PrivateKey;

/// A key pair held by the software token.
struct StoredKey {
    address: Address,
    label: String,
    signing_key: SigningKey,
    extractable: bool,
}

#[derive(Default)]
struct State {
    session_open: bool,
    keys: Vec<StoredKey>,
}

impl State {
    fn find(&self, address: &Address) -> Option<&StoredKey> {
        self.keys.iter().find(|key| key.address == *address)
    }

    fn require_session(&self) -> Result<()> {
        if self.session_open {
            Ok(())
        } else {
            Err(Error::SessionNotOpen)
        }
    }
}

/// An in-memory [`SecurityModule`].
#[derive(Default)]
pub struct MemoryModule {
    state: Mutex<State>,
    fail_signing: AtomicBool,
}

impl fmt::Debug for MemoryModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state();
        f.debug_struct("MemoryModule")
            .field("session_open", &state.session_open)
            .field("keys", &state.keys.len())
            .finish_non_exhaustive()
    }
}

impl MemoryModule {
    /// Creates an empty token with no open session.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Provisions a key directly, as a token administrator would.
    ///
    /// Does not need an open session. The key is stored as extractable.
    pub fn provision(&self, key: &PrivateKey, label: &str) -> Address {
        let address = key.address();
        self.state().keys.push(StoredKey {
            address,
            label: label.to_string(),
            signing_key: SigningKey::from(key.secret()),
            extractable: true,
        });
        address
    }

    /// Deletes the key pair for `address`, as a token administrator would.
    pub fn remove(&self, address: &Address) -> bool {
        let mut state = self.state();
        let before = state.keys.len();
        state.keys.retain(|key| key.address != *address);
        state.keys.len() != before
    }

    /// Makes every subsequent [`sign`](SecurityModule::sign) call fail.
    pub fn set_fail_signing(&self, fail: bool) {
        self.fail_signing.store(fail, Ordering::SeqCst);
    }

    /// Returns `true` while a session is open.
    #[must_use]
    pub fn is_session_open(&self) -> bool {
        self.state().session_open
    }

    /// Returns the label attached to the key for `address`.
    #[must_use]
    pub fn label(&self, address: &Address) -> Option<String> {
        self.state().find(address).map(|key| key.label.clone())
    }

    /// Returns whether the key for `address` may leave the token.
    #[must_use]
    pub fn is_extractable(&self, address: &Address) -> Option<bool> {
        self.state().find(address).map(|key| key.extractable)
    }

    /// Returns the public half of the key for `address`.
    #[must_use]
    pub fn verifying_key(&self, address: &Address) -> Option<VerifyingKey> {
        self.state()
            .find(address)
            .map(|key| *key.signing_key.verifying_key())
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn store(&self, signing_key: SigningKey, label: &str, extractable: bool) -> Result<Account> {
        let address = Address::from_public_key(&PublicKey::from(signing_key.verifying_key()));

        let mut state = self.state();
        state.require_session()?;
        if state.find(&address).is_some() {
            return Err(Error::Module(format!(
                "a key tagged {} already exists",
                address.hex_id()
            )));
        }

        state.keys.push(StoredKey {
            address,
            label: label.to_string(),
            signing_key,
            extractable,
        });
        Ok(Account::new(address))
    }
}

impl SecurityModule for MemoryModule {
    fn open_session(&self) -> Result<()> {
        self.state().session_open = true;
        debug!("opened in-memory session");
        Ok(())
    }

    fn close_session(&self) -> Result<()> {
        let mut state = self.state();
        state.require_session()?;
        state.session_open = false;
        debug!("closed in-memory session");
        Ok(())
    }

    fn accounts(&self) -> Result<Vec<Account>> {
        let state = self.state();
        state.require_session()?;
        Ok(state
            .keys
            .iter()
            .map(|key| Account::new(key.address))
            .collect())
    }

    fn contains(&self, address: &Address) -> Result<bool> {
        let state = self.state();
        state.require_session()?;
        Ok(state.find(address).is_some())
    }

    fn sign(&self, payload: &[u8], address: &Address) -> Result<Vec<u8>> {
        let state = self.state();
        state.require_session()?;
        let key = state.find(address).ok_or(Error::KeyNotFound(*address))?;

        if self.fail_signing.load(Ordering::SeqCst) {
            return Err(Error::Module("CKR_FUNCTION_FAILED".to_string()));
        }

        let signature: Signature = key.signing_key.sign(payload);
        Ok(signature.to_bytes().to_vec())
    }

    fn new_account(&self, config: &NewAccountConfig) -> Result<Account> {
        let secret = SecretKey::random(&mut OsRng);
        let account = self.store(SigningKey::from(&secret), &config.secret_name, false)?;
        info!(address = %account.address, label = %config.secret_name, "generated key pair");
        Ok(account)
    }

    fn import_private_key(&self, key: PrivateKey, config: &NewAccountConfig) -> Result<Account> {
        let account = self.store(SigningKey::from(key.secret()), &config.secret_name, true)?;
        info!(address = %account.address, label = %config.secret_name, "imported key pair");
        Ok(account)
    }
}

#[cfg(test)]
mod tests {
    use k256::ecdsa::signature::Verifier;

    use super::*;

    const HEX_KEY: &str = "1fe8f1ad4053326db20529257ac9401f2e6c769ef1d736b8c2f5aba5f787c72b";

    fn open_module() -> MemoryModule {
        let module = MemoryModule::new();
        module.open_session().unwrap();
        module
    }

    #[test]
    fn operations_require_session() {
        let module = MemoryModule::new();
        let addr = Address::zero();

        assert!(matches!(module.accounts(), Err(Error::SessionNotOpen)));
        assert!(matches!(module.contains(&addr), Err(Error::SessionNotOpen)));
        assert!(matches!(module.sign(b"x", &addr), Err(Error::SessionNotOpen)));
        assert!(matches!(
            module.new_account(&NewAccountConfig::new("a")),
            Err(Error::SessionNotOpen)
        ));
    }

    #[test]
    fn close_twice_surfaces_error() {
        let module = open_module();
        module.close_session().unwrap();
        assert!(matches!(module.close_session(), Err(Error::SessionNotOpen)));
    }

    #[test]
    fn generated_keys_are_labelled_and_non_extractable() {
        let module = open_module();
        let account = module.new_account(&NewAccountConfig::new("alice")).unwrap();

        assert_eq!(module.label(&account.address).as_deref(), Some("alice"));
        assert_eq!(module.is_extractable(&account.address), Some(false));
        assert_eq!(module.accounts().unwrap(), vec![account]);
    }

    #[test]
    fn imported_keys_keep_their_address() {
        let module = open_module();
        let key = PrivateKey::from_hex(HEX_KEY).unwrap();

        let account = module
            .import_private_key(key, &NewAccountConfig::new("imported"))
            .unwrap();

        assert_eq!(
            account.address.hex_id(),
            "6038dc01869425004ca0b8370f6c81cf464213b3"
        );
        assert_eq!(module.is_extractable(&account.address), Some(true));
        assert!(module.contains(&account.address).unwrap());
    }

    #[test]
    fn duplicate_import_is_rejected() {
        let module = open_module();
        let config = NewAccountConfig::new("dup");

        module
            .import_private_key(PrivateKey::from_hex(HEX_KEY).unwrap(), &config)
            .unwrap();
        let err = module
            .import_private_key(PrivateKey::from_hex(HEX_KEY).unwrap(), &config)
            .unwrap_err();
        assert!(matches!(err, Error::Module(_)));
    }

    #[test]
    fn contains_distinguishes_absent_keys() {
        let module = open_module();
        assert!(!module.contains(&Address::new([0x42; 20])).unwrap());
    }

    #[test]
    fn signatures_verify_and_are_deterministic() {
        let module = open_module();
        let account = module.new_account(&NewAccountConfig::new("signer")).unwrap();

        let first = module.sign(b"payload", &account.address).unwrap();
        let second = module.sign(b"payload", &account.address).unwrap();
        assert_eq!(first, second);

        let signature = Signature::from_slice(&first).unwrap();
        let verifying_key = module.verifying_key(&account.address).unwrap();
        verifying_key.verify(b"payload", &signature).unwrap();
    }

    #[test]
    fn sign_unknown_key() {
        let module = open_module();
        let addr = Address::new([0x42; 20]);
        assert!(matches!(
            module.sign(b"payload", &addr),
            Err(Error::KeyNotFound(a)) if a == addr
        ));
    }

    #[test]
    fn injected_signing_failure() {
        let module = open_module();
        let account = module.new_account(&NewAccountConfig::new("signer")).unwrap();

        module.set_fail_signing(true);
        assert!(matches!(
            module.sign(b"payload", &account.address),
            Err(Error::Module(_))
        ));

        module.set_fail_signing(false);
        module.sign(b"payload", &account.address).unwrap();
    }

    #[test]
    fn provision_and_remove() {
        let module = MemoryModule::new();
        let key = PrivateKey::from_hex(HEX_KEY).unwrap();
        let address = module.provision(&key, "admin");

        module.open_session().unwrap();
        assert!(module.contains(&address).unwrap());
        assert!(module.remove(&address));
        assert!(!module.contains(&address).unwrap());
        assert!(!module.remove(&address));
    }
}
