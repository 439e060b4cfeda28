use std::collections::BTreeMap;
use std::sync::Mutex;

use keyring::Entry;
use tracing::{debug, warn};
use upshift_common::{Error, Result};

/// Opaque key/value secrets grouped under an external identity (an account
/// on some remote service). Only specific migration steps touch this; the
/// engine itself never does.
pub trait CredentialStore: Send + Sync {
    /// Identities that currently hold at least one key.
    fn identities(&self) -> Result<Vec<String>>;

    fn keys(&self, identity: &str) -> Result<Vec<String>>;

    fn get(&self, identity: &str, key: &str) -> Result<Option<String>>;

    fn set(&self, identity: &str, key: &str, value: &str) -> Result<()>;

    /// Drop every key stored for `identity`. Unknown identities are a no-op.
    fn remove_identity(&self, identity: &str) -> Result<()>;
}

/// Process-local credential store, used by tests and by dry runs.
#[derive(Default)]
pub struct MemoryCredentialStore {
    entries: Mutex<BTreeMap<String, BTreeMap<String, String>>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<String, BTreeMap<String, String>>>> {
        self.entries
            .lock()
            .map_err(|_| Error::Credential("credential store lock poisoned".into()))
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn identities(&self) -> Result<Vec<String>> {
        Ok(self.lock()?.keys().cloned().collect())
    }

    fn keys(&self, identity: &str) -> Result<Vec<String>> {
        Ok(self
            .lock()?
            .get(identity)
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default())
    }

    fn get(&self, identity: &str, key: &str) -> Result<Option<String>> {
        Ok(self
            .lock()?
            .get(identity)
            .and_then(|m| m.get(key))
            .cloned())
    }

    fn set(&self, identity: &str, key: &str, value: &str) -> Result<()> {
        self.lock()?
            .entry(identity.to_string())
            .or_default()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove_identity(&self, identity: &str) -> Result<()> {
        self.lock()?.remove(identity);
        Ok(())
    }
}

const IDENTITY_INDEX: &str = "__identities__";

/// Credential store backed by the OS keychain.
///
/// The keychain cannot enumerate entries, so two JSON index entries are
/// maintained alongside the secrets: one listing identities, and one per
/// identity listing its keys.
pub struct KeyringCredentialStore {
    service: String,
}

impl KeyringCredentialStore {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }

    fn entry(&self, user: &str) -> Result<Entry> {
        Entry::new(&self.service, user)
            .map_err(|e| Error::Credential(format!("failed to open keychain entry {user}: {e}")))
    }

    fn read(&self, user: &str) -> Result<Option<String>> {
        match self.entry(user)?.get_password() {
            Ok(value) => Ok(Some(value)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(Error::Credential(format!("failed to read {user}: {e}"))),
        }
    }

    fn write(&self, user: &str, value: &str) -> Result<()> {
        self.entry(user)?
            .set_password(value)
            .map_err(|e| Error::Credential(format!("failed to write {user}: {e}")))
    }

    fn delete(&self, user: &str) -> Result<()> {
        match self.entry(user)?.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(Error::Credential(format!("failed to delete {user}: {e}"))),
        }
    }

    fn read_index(&self, user: &str) -> Result<Vec<String>> {
        match self.read(user)? {
            Some(raw) => Ok(serde_json::from_str(&raw)?),
            None => Ok(Vec::new()),
        }
    }

    fn write_index(&self, user: &str, items: &[String]) -> Result<()> {
        if items.is_empty() {
            return self.delete(user);
        }
        self.write(user, &serde_json::to_string(items)?)
    }

    fn index_user(identity: &str) -> String {
        format!("{identity}#keys")
    }

    fn secret_user(identity: &str, key: &str) -> String {
        format!("{identity}/{key}")
    }
}

impl CredentialStore for KeyringCredentialStore {
    fn identities(&self) -> Result<Vec<String>> {
        self.read_index(IDENTITY_INDEX)
    }

    fn keys(&self, identity: &str) -> Result<Vec<String>> {
        self.read_index(&Self::index_user(identity))
    }

    fn get(&self, identity: &str, key: &str) -> Result<Option<String>> {
        self.read(&Self::secret_user(identity, key))
    }

    fn set(&self, identity: &str, key: &str, value: &str) -> Result<()> {
        self.write(&Self::secret_user(identity, key), value)?;

        let mut keys = self.keys(identity)?;
        if !keys.iter().any(|k| k == key) {
            keys.push(key.to_string());
            self.write_index(&Self::index_user(identity), &keys)?;
        }

        let mut identities = self.identities()?;
        if !identities.iter().any(|i| i == identity) {
            identities.push(identity.to_string());
            self.write_index(IDENTITY_INDEX, &identities)?;
        }
        debug!("stored credential {key} for {identity}");
        Ok(())
    }

    fn remove_identity(&self, identity: &str) -> Result<()> {
        for key in self.keys(identity)? {
            if let Err(e) = self.delete(&Self::secret_user(identity, &key)) {
                warn!("failed to delete credential {key} for {identity}: {e}");
            }
        }
        self.delete(&Self::index_user(identity))?;

        let mut identities = self.identities()?;
        identities.retain(|i| i != identity);
        self.write_index(IDENTITY_INDEX, &identities)
    }
}
