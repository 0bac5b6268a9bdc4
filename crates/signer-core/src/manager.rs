//! Account lifecycle and signing authorization.
//!
//! [`AccountManager`] sits between callers and a [`SecurityModule`]. The
//! module signs whatever it is asked to once a session is open; the manager
//! decides whether it should be asked, by tracking which accounts are
//! currently unlocked.
//!
//! # State Machine
//!
//! Each account is independently either locked (the initial state) or
//! unlocked:
//!
//! ```text
//!            timed_unlock(d)               timed_unlock(d')
//!   LOCKED ──────────────────► UNLOCKED ◄──────────────────┐
//!     ▲                          │  │                       │
//!     │   lock() / timer fires   │  └───────────────────────┘
//!     └──────────────────────────┘
//! ```
//!
//! A zero duration unlocks until an explicit [`lock`](AccountManager::lock).
//! A positive duration arms an expiry task on the Tokio runtime; unlocking
//! again supersedes the previous window and its task.
//!
//! # Example
//!
//! ```
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
//! assert!(manager.sign(&account.address, b"payload").is_err());
//!
//! manager.timed_unlock(&account.address, Duration::from_secs(60))?;
//! let signature = manager.sign(&account.address, b"payload")?;
//! assert_eq!(signature.len(), 64);
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::fmt::Write as _;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::runtime::Handle;
use tracing::{debug, info, warn};

use crate::address::Address;
use crate::config::NewAccountConfig;
use crate::error::{Error, Result};
use crate::key::PrivateKey;
use crate::module::{Account, SecurityModule};
use crate::unlock::{Generation, UnlockTable};

/// Tracks unlocked accounts and mediates signing against a security module.
pub struct AccountManager<M> {
    module: M,
    unlocked: UnlockTable,
    runtime: Handle,

    /// Addresses still waiting for their startup unlock.
    unlock_on_start: Mutex<Vec<Address>>,
}

impl<M: fmt::Debug> fmt::Debug for AccountManager<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccountManager")
            .field("module", &self.module)
            .field("unlocked", &self.unlocked.addresses())
            .finish_non_exhaustive()
    }
}

impl<M: SecurityModule> AccountManager<M> {
    /// Creates a manager scheduling its expiry timers on the current Tokio
    /// runtime.
    ///
    /// # Arguments
    ///
    /// * `module` - The security module holding the account keys
    /// * `unlock_on_start` - Addresses to unlock indefinitely once the first
    ///   session opens; malformed entries are logged and skipped
    ///
    /// # Errors
    ///
    /// Returns [`Error::RuntimeUnavailable`] when called outside a Tokio
    /// runtime.
    pub fn new<S: AsRef<str>>(module: M, unlock_on_start: &[S]) -> Result<Self> {
        let runtime = Handle::try_current().map_err(|_| Error::RuntimeUnavailable)?;
        Ok(Self::with_runtime(module, unlock_on_start, runtime))
    }

    /// Creates a manager scheduling its expiry timers on `runtime`.
    pub fn with_runtime<S: AsRef<str>>(module: M, unlock_on_start: &[S], runtime: Handle) -> Self {
        let unlock_on_start = unlock_on_start
            .iter()
            .filter_map(|raw| {
                let raw = raw.as_ref();
                Address::from_hex(raw)
                    .inspect_err(|err| warn!(address = raw, error = %err, "skipping startup unlock"))
                    .ok()
            })
            .collect();

        Self {
            module,
            unlocked: UnlockTable::new(),
            runtime,
            unlock_on_start: Mutex::new(unlock_on_start),
        }
    }

    /// Returns the underlying security module.
    #[must_use]
    pub const fn module(&self) -> &M {
        &self.module
    }

    /// Opens a session with the security module.
    ///
    /// The first successful call also performs the startup unlocks. Each one
    /// is best-effort: failures are logged and do not fail `open`.
    pub fn open(&self) -> Result<()> {
        self.module.open_session()?;

        let pending = std::mem::take(
            &mut *self
                .unlock_on_start
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for address in pending {
            if let Err(err) = self.timed_unlock(&address, Duration::ZERO) {
                warn!(%address, error = %err, "startup unlock failed");
            }
        }

        Ok(())
    }

    /// Closes the session with the security module.
    pub fn close(&self) -> Result<()> {
        self.module.close_session()
    }

    /// Reports the unlocked accounts.
    ///
    /// `"0 unlocked account(s)"` when none are unlocked, otherwise the count
    /// followed by the addresses in ascending order, e.g.
    /// `"2 unlocked account(s): [0x11.. 0x22..]"`.
    #[must_use]
    pub fn status(&self) -> String {
        let addresses = self.unlocked.addresses();

        let mut status = format!("{} unlocked account(s)", addresses.len());
        if !addresses.is_empty() {
            let listed: Vec<String> = addresses.iter().map(Address::to_hex).collect();
            let _ = write!(status, ": [{}]", listed.join(" "));
        }
        status
    }

    /// Lists every account on the security module.
    pub fn accounts(&self) -> Result<Vec<Account>> {
        self.module.accounts()
    }

    /// Checks whether the security module holds a key for `address`.
    pub fn contains(&self, address: &Address) -> Result<bool> {
        self.module.contains(address)
    }

    /// Signs `payload` with an account that must already be unlocked.
    ///
    /// # Errors
    ///
    /// - [`Error::AccountNotFound`] if the module has no key for `address`
    /// - [`Error::AccountLocked`] if the account is not unlocked
    /// - Any error from the module's signing operation
    pub fn sign(&self, address: &Address, payload: &[u8]) -> Result<Vec<u8>> {
        self.require_account(address)?;

        if !self.unlocked.contains(address) {
            return Err(Error::AccountLocked(*address));
        }

        self.module.sign(payload, address)
    }

    /// Signs `payload`, unlocking the account for the duration of the call if
    /// it is locked.
    ///
    /// An account that was already unlocked keeps its existing window. An
    /// account unlocked here is locked again before returning, whether or not
    /// signing succeeded.
    pub fn unlock_and_sign(&self, address: &Address, payload: &[u8]) -> Result<Vec<u8>> {
        self.require_account(address)?;

        let _relock = self
            .unlocked
            .install_if_absent(*address)
            .map(|generation| Relock {
                table: &self.unlocked,
                address: *address,
                generation,
            });

        self.module.sign(payload, address)
    }

    /// Unlocks an account for `duration`, or until [`lock`](Self::lock) when
    /// `duration` is zero.
    ///
    /// Replaces any existing unlock window for the account.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AccountNotFound`] if the module has no key for
    /// `address`.
    pub fn timed_unlock(&self, address: &Address, duration: Duration) -> Result<()> {
        self.require_account(address)?;

        let generation = self.unlocked.install(*address, duration, &self.runtime);
        info!(%address, ?duration, generation, "unlocked account");
        Ok(())
    }

    /// Locks an account immediately, cancelling any pending expiry.
    ///
    /// Locking an account that is not unlocked does nothing.
    pub fn lock(&self, address: &Address) {
        if self.unlocked.remove(address) {
            info!(%address, "locked account");
        }
    }

    /// Generates a new account on the security module. The account starts
    /// locked.
    pub fn new_account(&self, config: &NewAccountConfig) -> Result<Account> {
        self.module.new_account(config)
    }

    /// Imports a private key into the security module. The account starts
    /// locked.
    pub fn import_private_key(&self, key: PrivateKey, config: &NewAccountConfig) -> Result<Account> {
        self.module.import_private_key(key, config)
    }

    fn require_account(&self, address: &Address) -> Result<()> {
        if self.module.contains(address)? {
            Ok(())
        } else {
            Err(Error::AccountNotFound(*address))
        }
    }
}

/// Locks an implicitly unlocked account when dropped.
struct Relock<'a> {
    table: &'a UnlockTable,
    address: Address,
    generation: Generation,
}

impl Drop for Relock<'_> {
    fn drop(&mut self) {
        if self.table.expire(&self.address, self.generation) {
            debug!(address = %self.address, "relocked after signing");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::error::ErrorKind;
    use crate::module::MemoryModule;

    const HEX_KEY: &str = "1fe8f1ad4053326db20529257ac9401f2e6c769ef1d736b8c2f5aba5f787c72b";
    const ADDRESS: &str = "0x6038dc01869425004ca0b8370f6c81cf464213b3";

    fn manager_with_key() -> (AccountManager<Arc<MemoryModule>>, Arc<MemoryModule>, Address) {
        let module = Arc::new(MemoryModule::new());
        let address = module.provision(&PrivateKey::from_hex(HEX_KEY).unwrap(), "test");

        let manager = AccountManager::new(Arc::clone(&module), &[] as &[&str]).unwrap();
        manager.open().unwrap();
        (manager, module, address)
    }

    #[test]
    fn new_requires_runtime() {
        let err = AccountManager::new(MemoryModule::new(), &[] as &[&str]).unwrap_err();
        assert!(matches!(err, Error::RuntimeUnavailable));
    }

    #[tokio::test]
    async fn status_empty() {
        let (manager, _, _) = manager_with_key();
        assert_eq!(manager.status(), "0 unlocked account(s)");
    }

    #[tokio::test]
    async fn status_lists_sorted_addresses() {
        let (manager, module, address) = manager_with_key();
        let other = module
            .new_account(&NewAccountConfig::new("other"))
            .unwrap()
            .address;

        manager.timed_unlock(&address, Duration::ZERO).unwrap();
        assert_eq!(manager.status(), format!("1 unlocked account(s): [{ADDRESS}]"));

        manager.timed_unlock(&other, Duration::ZERO).unwrap();
        let (first, second) = if address < other {
            (address, other)
        } else {
            (other, address)
        };
        assert_eq!(
            manager.status(),
            format!("2 unlocked account(s): [{first} {second}]")
        );
    }

    #[tokio::test]
    async fn sign_requires_unlock() {
        let (manager, _, address) = manager_with_key();

        let err = manager.sign(&address, b"payload").unwrap_err();
        assert!(matches!(err, Error::AccountLocked(a) if a == address));
        assert_eq!(err.kind(), ErrorKind::Locked);
    }

    #[tokio::test]
    async fn sign_absent_account_is_not_found() {
        let (manager, _, _) = manager_with_key();
        let absent = Address::new([0x42; 20]);

        let err = manager.sign(&absent, b"payload").unwrap_err();
        assert!(matches!(err, Error::AccountNotFound(a) if a == absent));
        assert_eq!(err.kind(), ErrorKind::NotFound);

        // Even a stale unlock entry cannot turn "absent" into "locked".
        assert!(matches!(
            manager.timed_unlock(&absent, Duration::ZERO),
            Err(Error::AccountNotFound(_))
        ));
        assert!(matches!(
            manager.unlock_and_sign(&absent, b"payload"),
            Err(Error::AccountNotFound(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn indefinite_unlock_until_lock() {
        let (manager, _, address) = manager_with_key();

        manager.timed_unlock(&address, Duration::ZERO).unwrap();
        tokio::time::sleep(Duration::from_secs(86_400)).await;
        manager.sign(&address, b"payload").unwrap();

        manager.lock(&address);
        assert!(matches!(
            manager.sign(&address, b"payload"),
            Err(Error::AccountLocked(_))
        ));

        // Locking again is a no-op.
        manager.lock(&address);
    }

    #[tokio::test(start_paused = true)]
    async fn timed_unlock_expires() {
        let (manager, _, address) = manager_with_key();

        manager
            .timed_unlock(&address, Duration::from_secs(30))
            .unwrap();

        tokio::time::sleep(Duration::from_secs(29)).await;
        manager.sign(&address, b"payload").unwrap();

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(matches!(
            manager.sign(&address, b"payload"),
            Err(Error::AccountLocked(_))
        ));
        assert_eq!(manager.status(), "0 unlocked account(s)");
    }

    #[tokio::test(start_paused = true)]
    async fn relock_then_unlock_survives_stale_timer() {
        let (manager, _, address) = manager_with_key();

        manager
            .timed_unlock(&address, Duration::from_secs(10))
            .unwrap();
        manager.lock(&address);
        manager.timed_unlock(&address, Duration::ZERO).unwrap();

        tokio::time::sleep(Duration::from_secs(11)).await;
        manager.sign(&address, b"payload").unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn unlock_and_sign_relocks() {
        let (manager, _, address) = manager_with_key();

        let signature = manager.unlock_and_sign(&address, b"payload").unwrap();
        assert_eq!(signature.len(), 64);
        assert!(matches!(
            manager.sign(&address, b"payload"),
            Err(Error::AccountLocked(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn unlock_and_sign_relocks_on_failure() {
        let (manager, module, address) = manager_with_key();

        module.set_fail_signing(true);
        let err = manager.unlock_and_sign(&address, b"payload").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ModuleFailure);
        assert_eq!(manager.status(), "0 unlocked account(s)");
    }

    #[tokio::test(start_paused = true)]
    async fn unlock_and_sign_keeps_existing_window() {
        let (manager, _, address) = manager_with_key();

        manager
            .timed_unlock(&address, Duration::from_secs(30))
            .unwrap();
        manager.unlock_and_sign(&address, b"payload").unwrap();
        manager.sign(&address, b"payload").unwrap();

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert!(matches!(
            manager.sign(&address, b"payload"),
            Err(Error::AccountLocked(_))
        ));
    }

    #[tokio::test]
    async fn new_and_imported_accounts_start_locked() {
        let module = MemoryModule::new();
        let manager = AccountManager::new(module, &[] as &[&str]).unwrap();
        manager.open().unwrap();

        let generated = manager
            .new_account(&NewAccountConfig::new("generated"))
            .unwrap();
        let imported = manager
            .import_private_key(
                PrivateKey::from_hex(HEX_KEY).unwrap(),
                &NewAccountConfig::new("imported"),
            )
            .unwrap();

        assert_eq!(manager.status(), "0 unlocked account(s)");
        assert_eq!(manager.accounts().unwrap().len(), 2);
        assert!(manager.contains(&generated.address).unwrap());
        assert!(manager.contains(&imported.address).unwrap());
        assert_eq!(manager.module().label(&imported.address).as_deref(), Some("imported"));
    }

    #[tokio::test]
    async fn startup_unlock_is_best_effort() {
        let module = Arc::new(MemoryModule::new());
        let address = module.provision(&PrivateKey::from_hex(HEX_KEY).unwrap(), "startup");

        let manager = AccountManager::new(
            Arc::clone(&module),
            &["not-an-address", "0x4242424242424242424242424242424242424242", ADDRESS],
        )
        .unwrap();
        assert_eq!(manager.status(), "0 unlocked account(s)");

        manager.open().unwrap();
        assert_eq!(manager.status(), format!("1 unlocked account(s): [{ADDRESS}]"));
        manager.sign(&address, b"payload").unwrap();

        // Reopening does not unlock again.
        manager.lock(&address);
        manager.close().unwrap();
        manager.open().unwrap();
        assert_eq!(manager.status(), "0 unlocked account(s)");
    }

    #[tokio::test]
    async fn close_delegates_to_module() {
        let (manager, module, _) = manager_with_key();

        manager.close().unwrap();
        assert!(!module.is_session_open());
        assert!(matches!(manager.close(), Err(Error::SessionNotOpen)));
    }
}
