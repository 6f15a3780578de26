//! Login credentials and thread-safe credential pools.
//!
//! An [`Account`] is immutable once created; its identity is the SHA-256
//! hash of all credential fields. Pools hand out exclusive access to
//! accounts to worker threads.
//!
//! # Main Components
//!
//! - [`Account`] - A username with its secrets
//! - [`AccountPool`] - Fairness-ordered pool with blocking acquisition
//! - [`AccountManager`] - Routes hosts to pools through matcher functions

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, RwLock};

use log::{debug, trace};
use sha2::{Digest, Sha256};

use crate::error::FleetError;
use crate::host::Host;

pub use manager::{AccountManager, PoolMatcher};
pub use pool::AccountPool;

/// SHA-256 identity of an account.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AccountHash([u8; 32]);

impl AccountHash {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for AccountHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for AccountHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AccountHash({self})")
    }
}

impl FromStr for AccountHash {
    type Err = FleetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 64 || !s.is_ascii() {
            return Err(FleetError::UnknownAccount(s.to_string()));
        }
        let mut out = [0u8; 32];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&s[i * 2..i * 2 + 2], 16)
                .map_err(|_| FleetError::UnknownAccount(s.to_string()))?;
        }
        Ok(Self(out))
    }
}

/// Private key material attached to an account.
#[derive(Clone, PartialEq, Eq)]
pub struct PrivateKey {
    pub algorithm: String,
    pub material: String,
    pub passphrase: Option<String>,
}

impl PrivateKey {
    pub fn new(algorithm: impl Into<String>, material: impl Into<String>) -> Self {
        Self {
            algorithm: algorithm.into(),
            material: material.into(),
            passphrase: None,
        }
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrivateKey")
            .field("algorithm", &self.algorithm)
            .finish_non_exhaustive()
    }
}

/// A user account.
///
/// The authorization password is only needed on devices that separate
/// authentication from privilege escalation; it defaults to the login
/// password.
#[derive(Clone)]
pub struct Account {
    name: String,
    password: String,
    authorization_password: Option<String>,
    key: Option<PrivateKey>,
    hash: AccountHash,
}

impl Account {
    /// Creates an account from a username and password.
    pub fn new(name: impl Into<String>, password: impl Into<String>) -> Self {
        Self::build(name.into(), password.into(), None, None)
    }

    /// Returns a copy of this account with an authorization password.
    pub fn with_authorization_password(self, password: impl Into<String>) -> Self {
        Self::build(self.name, self.password, Some(password.into()), self.key)
    }

    /// Returns a copy of this account with a private key.
    pub fn with_key(self, key: PrivateKey) -> Self {
        Self::build(self.name, self.password, self.authorization_password, Some(key))
    }

    fn build(
        name: String,
        password: String,
        authorization_password: Option<String>,
        key: Option<PrivateKey>,
    ) -> Self {
        let hash = Self::calculate_hash(&name, &password, &authorization_password, &key);
        Self {
            name,
            password,
            authorization_password,
            key,
            hash,
        }
    }

    /// Calculates the identity hash over every credential field.
    fn calculate_hash(
        name: &str,
        password: &str,
        authorization_password: &Option<String>,
        key: &Option<PrivateKey>,
    ) -> AccountHash {
        let mut hasher = Sha256::new();
        hasher.update(name.as_bytes());
        hasher.update([0u8]);
        hasher.update(password.as_bytes());
        hasher.update([0u8]);
        if let Some(pwd) = authorization_password {
            hasher.update([1u8]);
            hasher.update(pwd.as_bytes());
        }
        hasher.update([0u8]);
        if let Some(key) = key {
            hasher.update([1u8]);
            hasher.update(key.algorithm.as_bytes());
            hasher.update([0u8]);
            hasher.update(key.material.as_bytes());
            hasher.update([0u8]);
            if let Some(passphrase) = &key.passphrase {
                hasher.update(passphrase.as_bytes());
            }
        }
        AccountHash(hasher.finalize().into())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn password(&self) -> &str {
        &self.password
    }

    /// Returns the authorization password, falling back to the login password.
    pub fn authorization_password(&self) -> &str {
        self.authorization_password
            .as_deref()
            .unwrap_or(&self.password)
    }

    pub fn key(&self) -> Option<&PrivateKey> {
        self.key.as_ref()
    }

    /// Identity of this account.
    pub fn hash(&self) -> AccountHash {
        self.hash
    }
}

impl PartialEq for Account {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash
    }
}

impl Eq for Account {}

impl std::hash::Hash for Account {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.hash.hash(state);
    }
}

impl fmt::Debug for Account {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Account")
            .field("name", &self.name)
            .field("hash", &self.hash)
            .finish_non_exhaustive()
    }
}

/// An external store of credentials.
pub trait CredentialSource {
    fn load_accounts(&self) -> Result<Vec<Account>, FleetError>;
}

impl<F> CredentialSource for F
where
    F: Fn() -> Result<Vec<Account>, FleetError>,
{
    fn load_accounts(&self) -> Result<Vec<Account>, FleetError> {
        self()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

mod manager;
mod pool;
