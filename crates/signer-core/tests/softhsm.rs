//! Round trip against a real PKCS#11 token.
//!
//! Requires an initialized SoftHSM (or any PKCS#11) token:
//!
//! ```text
//! softhsm2-util --init-token --free --label signer --pin 1234 --so-pin 1234
//! PKCS11_LIBRARY=/usr/lib/softhsm/libsofthsm2.so SLOT_LABEL=signer SLOT_PIN=1234 \
//!     cargo test -p pkcs11-evm-signer-core --test softhsm -- --ignored
//! ```
#![cfg(feature = "pkcs11")]

// Silence unused crate dependency warnings for test binary
use alloy_primitives as _;
use cryptoki as _;
use hex as _;
use rand_core as _;
use serde as _;
use serde_json as _;
use thiserror as _;
use tracing as _;
use url as _;
use zeroize as _;

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use k256::ecdsa::signature::hazmat::PrehashVerifier;
use k256::ecdsa::{Signature, VerifyingKey};
use k256::sha2::{Digest, Sha256};
use pkcs11_evm_signer_core::{
    AccountManager, ErrorKind, NewAccountConfig, Pkcs11Module, PrivateKey,
};
use tracing_subscriber::EnvFilter;

const HEX_KEY: &str = "1fe8f1ad4053326db20529257ac9401f2e6c769ef1d736b8c2f5aba5f787c72b";

fn module_from_env() -> Pkcs11Module {
    let library = PathBuf::from(env::var("PKCS11_LIBRARY").expect("PKCS11_LIBRARY must be set"));
    let label = env::var("SLOT_LABEL").expect("SLOT_LABEL must be set");
    let pin = env::var("SLOT_PIN").unwrap_or_default();

    Pkcs11Module::load(&library, label, &pin).expect("Failed to load PKCS#11 library")
}

#[tokio::test]
#[ignore = "requires a PKCS#11 token"]
async fn test_softhsm_round_trip() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();

    let manager = AccountManager::new(module_from_env(), &[] as &[&str]).unwrap();
    manager.open().unwrap();

    // Generated key
    let account = manager
        .new_account(&NewAccountConfig::new("softhsm-generated"))
        .unwrap();
    assert!(manager.contains(&account.address).unwrap());
    assert!(
        manager
            .accounts()
            .unwrap()
            .iter()
            .any(|listed| listed.address == account.address)
    );
    assert_eq!(
        manager.sign(&account.address, b"payload").unwrap_err().kind(),
        ErrorKind::Locked
    );

    manager
        .timed_unlock(&account.address, Duration::from_secs(30))
        .unwrap();
    let signature = manager.sign(&account.address, b"payload").unwrap();
    assert_eq!(signature.len(), 64);
    manager.lock(&account.address);

    // Imported key verifies against its known public key
    let key = PrivateKey::from_hex(HEX_KEY).unwrap();
    let verifying_key = VerifyingKey::from(&key.public_key());
    let imported = match manager.import_private_key(key, &NewAccountConfig::new("softhsm-imported")) {
        Ok(account) => account,
        // Left over from a previous run.
        Err(err) => {
            eprintln!("import skipped: {err}");
            let address = "6038dc01869425004ca0b8370f6c81cf464213b3".parse().unwrap();
            assert!(manager.contains(&address).unwrap());
            pkcs11_evm_signer_core::Account::new(address)
        }
    };

    let signature = manager.unlock_and_sign(&imported.address, b"payload").unwrap();
    let signature = Signature::from_slice(&signature).unwrap();
    let digest = Sha256::digest(b"payload");
    verifying_key
        .verify_prehash(&digest, &signature)
        .unwrap();
    assert_eq!(manager.status(), "0 unlocked account(s)");

    manager.close().unwrap();
}
