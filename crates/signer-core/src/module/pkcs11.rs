//! PKCS#11 security module adapter.
//!
//! This module provides a [`SecurityModule`] implementation backed by a
//! PKCS#11 library (SoftHSM, a network HSM, a smart card middleware, ...)
//! loaded at runtime through [`cryptoki`].
//!
//! # Key Objects
//!
//! Every account is a secp256k1 key pair stored as two token objects:
//!
//! | Attribute      | Public key                  | Private key                   |
//! |----------------|-----------------------------|-------------------------------|
//! | `CKA_LABEL`    | secret name                 | secret name                   |
//! | `CKA_ID`       | lowercase hex address       | lowercase hex address         |
//! | `CKA_EC_PARAMS`| secp256k1 OID               | secp256k1 OID (imports only)  |
//! | `CKA_EC_POINT` | DER OCTET STRING of `04‖x‖y`| n/a                           |
//!
//! Generated private keys are sensitive and non-extractable. Imported private
//! keys are extractable, since the material already existed outside the
//! token.
//!
//! # Example
//!
//! ```ignore
//! use pkcs11_evm_signer_core::config::Config;
//! use pkcs11_evm_signer_core::module::{Pkcs11Module, SecurityModule};
//!
//! let config = Config::from_json(&raw)?;
//! config.validate()?;
//!
//! let module = Pkcs11Module::new(&config.library)?;
//! module.open_session()?;
//! let accounts = module.accounts()?;
//! ```

use std::fmt;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use cryptoki::context::{CInitializeArgs, Pkcs11};
use cryptoki::mechanism::Mechanism;
use cryptoki::object::{Attribute, AttributeType, KeyType, ObjectClass, ObjectHandle};
use cryptoki::session::{Session, UserType};
use cryptoki::slot::Slot;
use cryptoki::types::AuthPin;
use k256::elliptic_curve::sec1::ToEncodedPoint;
use tracing::{debug, info, warn};
use zeroize::Zeroize;

use super::{Account, SecurityModule};
use crate::address::Address;
use crate::config::{NewAccountConfig, Pkcs11Library};
use crate::error::{Error, Result};
use crate::key::PrivateKey;

/// DER encoding of the secp256k1 OID (1.3.132.0.10), used as `CKA_EC_PARAMS`.
const SECP256K1_PARAMS: [u8; 7] = [0x06, 0x05, 0x2B, 0x81, 0x04, 0x00, 0x0A];

/// Length of an uncompressed secp256k1 point (`04 || x || y`).
const UNCOMPRESSED_POINT_LEN: usize = 65;

/// DER tag of an OCTET STRING.
const DER_OCTET_STRING: u8 = 0x04;

/// A [`SecurityModule`] backed by a PKCS#11 token.
///
/// The library is initialized on construction and finalized when the last
/// handle to it is dropped; an open session is closed on drop as well.
/// Calls into the token are serialized on the single session.
pub struct Pkcs11Module {
    /// The loaded PKCS#11 library.
    context: Pkcs11,

    /// Label of the token to open.
    slot_label: String,

    /// User PIN, possibly empty.
    pin: AuthPin,

    /// The logged-in session, once opened.
    session: Mutex<Option<Session>>,
}

impl fmt::Debug for Pkcs11Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pkcs11Module")
            .field("slot_label", &self.slot_label)
            .field("session_open", &self.session_guard().is_some())
            .finish_non_exhaustive()
    }
}

impl Pkcs11Module {
    /// Loads the configured library, resolving the slot label and PIN from
    /// the process environment.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidConfig`] if the path or slot label does not resolve
    /// - [`Error::LibraryNotFound`] if the library file does not exist
    /// - [`Error::AlreadyInitialized`] if the library is already initialized
    ///   in this process
    pub fn new(library: &Pkcs11Library) -> Result<Self> {
        let path = library.library_path()?;
        let slot_label = library.slot_label()?;
        let pin = library.slot_pin();

        Self::load(&path, slot_label, &pin)
    }

    /// Loads the library at `path` for the token labelled `slot_label`.
    pub fn load(path: &Path, slot_label: impl Into<String>, pin: &str) -> Result<Self> {
        if !path.is_file() {
            return Err(Error::LibraryNotFound(path.to_path_buf()));
        }

        let context = Pkcs11::new(path)?;
        context.initialize(CInitializeArgs::OsThreads)?;
        debug!(path = %path.display(), "initialized PKCS#11 library");

        Ok(Self {
            context,
            slot_label: slot_label.into(),
            pin: AuthPin::new(pin.to_owned().into()),
            session: Mutex::new(None),
        })
    }

    fn session_guard(&self) -> MutexGuard<'_, Option<Session>> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Runs `op` against the open session.
    fn with_session<T>(&self, op: impl FnOnce(&Session) -> Result<T>) -> Result<T> {
        let guard = self.session_guard();
        let session = guard.as_ref().ok_or(Error::SessionNotOpen)?;
        op(session)
    }

    fn find_slot(&self) -> Result<Slot> {
        for slot in self.context.get_slots_with_token()? {
            let Ok(info) = self.context.get_token_info(slot) else {
                continue;
            };
            if info.label().trim_end() == self.slot_label {
                return Ok(slot);
            }
        }

        Err(Error::SlotNotFound(self.slot_label.clone()))
    }
}

impl SecurityModule for Pkcs11Module {
    fn open_session(&self) -> Result<()> {
        let slot = self.find_slot()?;

        let session = self.context.open_rw_session(slot)?;
        session
            .login(UserType::User, Some(&self.pin))
            .map_err(|err| Error::LoginFailed(err.to_string()))?;

        *self.session_guard() = Some(session);
        info!(slot_label = %self.slot_label, "opened PKCS#11 session");
        Ok(())
    }

    fn close_session(&self) -> Result<()> {
        let session = self.session_guard().take().ok_or(Error::SessionNotOpen)?;

        // Dropping the session closes it, even when logout fails.
        session.logout()?;
        info!(slot_label = %self.slot_label, "closed PKCS#11 session");
        Ok(())
    }

    fn accounts(&self) -> Result<Vec<Account>> {
        self.with_session(|session| {
            let handles = session.find_objects(&[Attribute::Class(ObjectClass::PUBLIC_KEY)])?;

            handles
                .into_iter()
                .map(|handle| read_key_id(session, handle).map(Account::new))
                .collect()
        })
    }

    fn contains(&self, address: &Address) -> Result<bool> {
        self.with_session(|session| Ok(find_private_key(session, address)?.is_some()))
    }

    fn sign(&self, payload: &[u8], address: &Address) -> Result<Vec<u8>> {
        self.with_session(|session| {
            let key = find_private_key(session, address)?.ok_or(Error::KeyNotFound(*address))?;

            debug!(%address, len = payload.len(), "signing payload");
            Ok(session.sign(&Mechanism::EcdsaSha256, key, payload)?)
        })
    }

    fn new_account(&self, config: &NewAccountConfig) -> Result<Account> {
        let label = config.secret_name.as_bytes().to_vec();

        let public_template = [
            Attribute::Class(ObjectClass::PUBLIC_KEY),
            Attribute::KeyType(KeyType::EC),
            Attribute::Token(true),
            Attribute::Verify(true),
            Attribute::Encrypt(false),
            Attribute::Wrap(false),
            Attribute::EcParams(SECP256K1_PARAMS.to_vec()),
            Attribute::Label(label.clone()),
        ];
        let private_template = [
            Attribute::Class(ObjectClass::PRIVATE_KEY),
            Attribute::Token(true),
            Attribute::Sign(true),
            Attribute::Decrypt(false),
            Attribute::Label(label),
            Attribute::Sensitive(true),
            Attribute::Extractable(false),
            Attribute::Private(true),
        ];

        self.with_session(|session| {
            let (public_key, private_key) = session.generate_key_pair(
                &Mechanism::EccKeyPairGen,
                &public_template,
                &private_template,
            )?;

            let address = read_public_address(session, public_key)?;
            tag_key_pair(session, public_key, private_key, &address)?;

            info!(%address, label = %config.secret_name, "generated key pair");
            Ok(Account::new(address))
        })
    }

    fn import_private_key(&self, key: PrivateKey, config: &NewAccountConfig) -> Result<Account> {
        let address = key.address();
        let label = config.secret_name.as_bytes().to_vec();
        let point = key.public_key().to_encoded_point(false);

        let public_template = [
            Attribute::KeyType(KeyType::EC),
            Attribute::Class(ObjectClass::PUBLIC_KEY),
            Attribute::Private(false),
            Attribute::Token(true),
            Attribute::Verify(true),
            Attribute::EcParams(SECP256K1_PARAMS.to_vec()),
            Attribute::Label(label.clone()),
            Attribute::EcPoint(encode_ec_point(point.as_bytes())),
        ];
        let mut private_template = vec![
            Attribute::KeyType(KeyType::EC),
            Attribute::Class(ObjectClass::PRIVATE_KEY),
            Attribute::Private(true),
            Attribute::Token(true),
            Attribute::Sign(true),
            Attribute::EcParams(SECP256K1_PARAMS.to_vec()),
            Attribute::Label(label),
            Attribute::Extractable(true),
            Attribute::Value(key.to_bytes().to_vec()),
        ];
        drop(key);

        let result = self.with_session(|session| {
            let public_key = session.create_object(&public_template)?;

            let private_key = match session.create_object(&private_template) {
                Ok(handle) => handle,
                Err(err) => {
                    if let Err(cleanup) = session.destroy_object(public_key) {
                        warn!(%address, error = %cleanup, "failed to remove orphaned public key");
                    }
                    return Err(err.into());
                }
            };

            tag_key_pair(session, public_key, private_key, &address)?;
            Ok(Account::new(address))
        });
        wipe_values(&mut private_template);

        if result.is_ok() {
            info!(%address, label = %config.secret_name, "imported key pair");
        }
        result
    }
}

/// Looks up the private key tagged with `address`.
fn find_private_key(session: &Session, address: &Address) -> Result<Option<ObjectHandle>> {
    let template = [
        Attribute::Id(key_id(address)),
        Attribute::Class(ObjectClass::PRIVATE_KEY),
    ];
    Ok(session.find_objects(&template)?.into_iter().next())
}

/// Writes the address identifier onto both halves of a key pair.
fn tag_key_pair(
    session: &Session,
    public_key: ObjectHandle,
    private_key: ObjectHandle,
    address: &Address,
) -> Result<()> {
    let template = [Attribute::Id(key_id(address))];
    session.update_attributes(public_key, &template)?;
    session.update_attributes(private_key, &template)?;
    Ok(())
}

/// Derives the address from a public key object's `CKA_EC_POINT`.
fn read_public_address(session: &Session, public_key: ObjectHandle) -> Result<Address> {
    let attributes = session.get_attributes(public_key, &[AttributeType::EcPoint])?;
    let point = attributes
        .into_iter()
        .find_map(|attribute| match attribute {
            Attribute::EcPoint(point) => Some(point),
            _ => None,
        })
        .ok_or_else(|| Error::Module("public key has no CKA_EC_POINT".to_string()))?;

    Address::from_public_key_bytes(decode_ec_point(&point)?)
}

/// Reads and decodes the `CKA_ID` of a key object.
fn read_key_id(session: &Session, handle: ObjectHandle) -> Result<Address> {
    let attributes = session.get_attributes(handle, &[AttributeType::Id])?;
    let id = attributes
        .into_iter()
        .find_map(|attribute| match attribute {
            Attribute::Id(id) => Some(id),
            _ => None,
        })
        .ok_or_else(|| Error::Module("key object has no CKA_ID".to_string()))?;

    address_from_key_id(&id)
}

/// Returns the `CKA_ID` value for `address`: its lowercase hex, as ASCII.
fn key_id(address: &Address) -> Vec<u8> {
    address.hex_id().into_bytes()
}

/// Decodes a `CKA_ID` written by [`key_id`], or a raw 20-byte identifier.
fn address_from_key_id(id: &[u8]) -> Result<Address> {
    if let Ok(bytes) = <[u8; Address::BYTE_LEN]>::try_from(id) {
        return Ok(Address::new(bytes));
    }

    let hex_id = std::str::from_utf8(id)
        .map_err(|_| Error::Module("CKA_ID is neither an address nor hex text".to_string()))?;
    Address::from_hex(hex_id).map_err(|err| Error::Module(format!("invalid CKA_ID: {err}")))
}

/// Wraps an uncompressed point in a DER OCTET STRING.
#[expect(
    clippy::cast_possible_truncation,
    reason = "uncompressed points fit a short-form length"
)]
fn encode_ec_point(point: &[u8]) -> Vec<u8> {
    let mut encoded = Vec::with_capacity(point.len() + 2);
    encoded.push(DER_OCTET_STRING);
    encoded.push(point.len() as u8);
    encoded.extend_from_slice(point);
    encoded
}

/// Unwraps a `CKA_EC_POINT` value into the 65-byte uncompressed point.
///
/// Tokens disagree on whether the DER wrapper is present, so both forms are
/// accepted. The form is decided by total length: a raw point starts with
/// `0x04` too, and its X coordinate may well start with `0x41`.
fn decode_ec_point(value: &[u8]) -> Result<&[u8]> {
    const SHORT_DER_LEN: usize = UNCOMPRESSED_POINT_LEN + 2;
    const LONG_DER_LEN: usize = UNCOMPRESSED_POINT_LEN + 3;

    let point = match (value.len(), value) {
        (SHORT_DER_LEN, [DER_OCTET_STRING, 0x41, point @ ..])
        | (LONG_DER_LEN, [DER_OCTET_STRING, 0x81, 0x41, point @ ..])
        | (UNCOMPRESSED_POINT_LEN, point @ [0x04, ..]) => point,
        _ => {
            return Err(Error::InvalidPublicKey(format!(
                "expected a {UNCOMPRESSED_POINT_LEN}-byte uncompressed point, got {} bytes",
                value.len()
            )));
        }
    };

    Ok(point)
}

/// Zeroes every `CKA_VALUE` carried by an attribute template.
fn wipe_values(template: &mut [Attribute]) {
    for attribute in template {
        if let Attribute::Value(value) = attribute {
            value.zeroize();
        }
    }
}
