//! Configuration consumed by the security module adapter and the manager.
//!
//! The host process hands the signer a JSON document shaped like:
//!
//! ```json
//! {
//!     "library": {
//!         "path": "file:///usr/local/lib/softhsm/libsofthsm2.so",
//!         "slotLabel": "env://SLOT_LABEL",
//!         "slotPin": "env://SLOT_PIN"
//!     },
//!     "unlock": ["0x6038dc01869425004ca0b8370f6c81cf464213b3"]
//! }
//! ```
//!
//! Secrets are never written inline: `slotLabel` and `slotPin` are
//! [`EnvironmentVariable`] indirections whose host component names the
//! variable to read.
//!
//! # Example
//!
//! ```
//! use pkcs11_evm_signer_core::config::Config;
//!
//! let raw = br#"{"library": {"path": "file:///lib/softhsm.so", "slotLabel": "env://SLOT_LABEL"}}"#;
//! let config = Config::from_json(raw).unwrap();
//!
//! let lookup = |name: &str| (name == "SLOT_LABEL").then(|| "signer".to_string());
//! config.validate_with(lookup).unwrap();
//! assert_eq!(config.library.slot_label_with(lookup).unwrap(), "signer");
//! assert_eq!(config.library.slot_pin_with(lookup).as_str(), "");
//! ```

use std::env;
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Deserializer, Serialize, de};
use url::Url;
use zeroize::Zeroizing;

use crate::error::{Error, Result};

/// Validation message for a library path that is not an absolute file URL.
pub const INVALID_LIBRARY_PATH: &str = "'path' must be a valid absolute file url";

/// Validation message for an unresolvable slot label.
pub const MISSING_SLOT_LABEL: &str =
    "the given given environment for 'SlotLabel' variables must be set";

/// Validation message for a new-account request without a secret name.
pub const INVALID_SECRET_NAME: &str = "secretName must be set";

/// Top-level signer configuration.
///
/// Keys are camelCase; the PascalCase spelling (`Library`, `SlotLabel`, ...)
/// is accepted as well.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// The PKCS#11 library and slot to use.
    #[serde(alias = "Library")]
    pub library: Pkcs11Library,

    /// Addresses to unlock indefinitely once the session is open.
    #[serde(default, alias = "Unlock", deserialize_with = "null_as_empty")]
    pub unlock: Vec<String>,
}

impl Config {
    /// Parses a configuration from JSON bytes.
    ///
    /// Parsing does not validate; call [`validate`](Self::validate) afterwards.
    pub fn from_json(raw: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(raw)?)
    }

    /// Validates the configuration against the process environment.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] carrying [`INVALID_LIBRARY_PATH`] or
    /// [`MISSING_SLOT_LABEL`].
    pub fn validate(&self) -> Result<()> {
        self.validate_with(process_env)
    }

    /// Validates the configuration, resolving variables through `lookup`.
    pub fn validate_with<F>(&self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        self.library.library_path()?;
        self.library.slot_label_with(lookup)?;
        Ok(())
    }
}

/// Location of the PKCS#11 library and the credentials for its slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pkcs11Library {
    /// Absolute `file://` URL of the PKCS#11 shared library.
    #[serde(default, alias = "Path")]
    pub path: String,

    /// Indirection to the label of the token to open.
    #[serde(
        default,
        alias = "SlotLabel",
        deserialize_with = "empty_as_none",
        skip_serializing_if = "Option::is_none"
    )]
    pub slot_label: Option<EnvironmentVariable>,

    /// Optional indirection to the user PIN. An empty string means unset.
    #[serde(
        default,
        alias = "SlotPin",
        deserialize_with = "empty_as_none",
        skip_serializing_if = "Option::is_none"
    )]
    pub slot_pin: Option<EnvironmentVariable>,
}

impl Pkcs11Library {
    /// Returns the filesystem path of the library.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] unless `path` is a `file` URL with an
    /// empty host and a non-empty path.
    pub fn library_path(&self) -> Result<PathBuf> {
        let invalid = || Error::InvalidConfig(INVALID_LIBRARY_PATH.to_string());

        let url = Url::parse(&self.path).map_err(|_| invalid())?;
        let host_is_empty = url.host_str().is_none_or(str::is_empty);
        let has_path = !url.path().is_empty() && url.path() != "/";
        if url.scheme() != "file" || !host_is_empty || !has_path {
            return Err(invalid());
        }

        url.to_file_path().map_err(|()| invalid())
    }

    /// Resolves the slot label from the process environment.
    pub fn slot_label(&self) -> Result<String> {
        self.slot_label_with(process_env)
    }

    /// Resolves the slot label through `lookup`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] carrying [`MISSING_SLOT_LABEL`] when
    /// the indirection is absent or its variable is unset.
    pub fn slot_label_with<F>(&self, lookup: F) -> Result<String>
    where
        F: Fn(&str) -> Option<String>,
    {
        self.slot_label
            .as_ref()
            .and_then(|label| label.get_with(lookup))
            .ok_or_else(|| Error::InvalidConfig(MISSING_SLOT_LABEL.to_string()))
    }

    /// Resolves the PIN from the process environment.
    #[must_use]
    pub fn slot_pin(&self) -> Zeroizing<String> {
        self.slot_pin_with(process_env)
    }

    /// Resolves the PIN through `lookup`; an unset PIN is empty.
    #[must_use]
    pub fn slot_pin_with<F>(&self, lookup: F) -> Zeroizing<String>
    where
        F: Fn(&str) -> Option<String>,
    {
        Zeroizing::new(
            self.slot_pin
                .as_ref()
                .and_then(|pin| pin.get_with(lookup))
                .unwrap_or_default(),
        )
    }
}

/// A reference to an environment variable, written as `env://NAME`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EnvironmentVariable(Url);

impl EnvironmentVariable {
    /// Parses an indirection such as `env://SLOT_PIN`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if `raw` is not a URL.
    pub fn parse(raw: &str) -> Result<Self> {
        Url::parse(raw).map(Self).map_err(|err| {
            Error::InvalidConfig(format!("invalid variable reference {raw:?}: {err}"))
        })
    }

    /// Returns the name of the referenced variable.
    #[must_use]
    pub fn name(&self) -> &str {
        self.0.host_str().unwrap_or_default()
    }

    /// Reads the variable from the process environment.
    #[must_use]
    pub fn get(&self) -> Option<String> {
        self.get_with(process_env)
    }

    /// Reads the variable through `lookup`.
    #[must_use]
    pub fn get_with<F>(&self, lookup: F) -> Option<String>
    where
        F: Fn(&str) -> Option<String>,
    {
        match self.name() {
            "" => None,
            name => lookup(name),
        }
    }

    /// Checks whether the variable is set in the process environment.
    #[must_use]
    pub fn is_set(&self) -> bool {
        self.get().is_some()
    }
}

impl fmt::Display for EnvironmentVariable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for EnvironmentVariable {
    type Error = Error;

    fn try_from(raw: String) -> Result<Self> {
        Self::parse(&raw)
    }
}

impl From<EnvironmentVariable> for String {
    fn from(var: EnvironmentVariable) -> Self {
        var.0.into()
    }
}

/// Parameters for generating or importing an account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewAccountConfig {
    /// Human-readable label written onto the key objects.
    #[serde(default, alias = "SecretName")]
    pub secret_name: String,
}

impl NewAccountConfig {
    /// Creates a request with the given label.
    #[must_use]
    pub fn new(secret_name: impl Into<String>) -> Self {
        Self {
            secret_name: secret_name.into(),
        }
    }

    /// Parses a request from JSON bytes.
    pub fn from_json(raw: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(raw)?)
    }

    /// Validates the request.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] carrying [`INVALID_SECRET_NAME`] when
    /// the label is empty.
    pub fn validate(&self) -> Result<()> {
        if self.secret_name.is_empty() {
            return Err(Error::InvalidConfig(INVALID_SECRET_NAME.to_string()));
        }
        Ok(())
    }
}

fn process_env(name: &str) -> Option<String> {
    env::var(name).ok()
}

/// Reads an optional indirection, treating `null` and `""` as unset.
fn empty_as_none<'de, D>(
    deserializer: D,
) -> core::result::Result<Option<EnvironmentVariable>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<String>::deserialize(deserializer)? {
        Some(raw) if !raw.is_empty() => EnvironmentVariable::parse(&raw)
            .map(Some)
            .map_err(de::Error::custom),
        _ => Ok(None),
    }
}

/// Reads a list, treating `null` as empty.
fn null_as_empty<'de, D>(deserializer: D) -> core::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Vec<String>>::deserialize(deserializer)?.unwrap_or_default())
}
