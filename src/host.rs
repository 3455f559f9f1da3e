//! Remote hosts.
//!
//! A `Host` describes one machine and how to reach it. Connections are opened through the
//! `Connector` registered for the host's protocol tag, and the pool caches them under
//! `Host::get_key`, which never depends on the credential.

use std::collections::HashMap;
use std::fmt;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, Mutex, RwLock};

use serde::{Deserialize, Serialize};
use void::Void;

use crate::error::RemoteError;
use crate::serde::string_or_mapping;
use crate::session::{Connection, Connectors};

fn default_protocol() -> String {
    "ssh".to_string()
}

fn default_port() -> u16 {
    22
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Host {
    /// Name, unique within a `TargetRegistry`.
    pub name: String,
    /// Protocol tag used to pick the `Connector`.
    #[serde(default = "default_protocol")]
    pub protocol: String,
    /// Hostname or IP address.
    pub address: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// Private key to authenticate with.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_filename: Option<PathBuf>,
    #[serde(skip)]
    credential: Credential,
}

impl Host {
    pub fn new(name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            protocol: default_protocol(),
            address: address.into(),
            port: default_port(),
            username: None,
            key_filename: None,
            credential: Credential::default(),
        }
    }

    pub fn with_protocol(mut self, protocol: impl Into<String>) -> Self {
        self.protocol = protocol.into();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    pub fn with_key_filename(mut self, path: impl Into<PathBuf>) -> Self {
        self.key_filename = Some(path.into());
        self
    }

    /// Identity used for pooling connections.
    pub fn get_key(&self) -> String {
        format!("{}://{}", self.protocol, self.address)
    }

    pub fn credential(&self) -> &Credential {
        &self.credential
    }

    /// Opens a new connection through the connector registered for `self.protocol`.
    ///
    /// A supplied password is cached on the host (first write wins) and the cached value is
    /// what gets handed to the connector.
    pub async fn connect(
        &self,
        connectors: &Connectors,
        user: Option<&str>,
        password: Option<&str>,
    ) -> Result<Arc<dyn Connection>, RemoteError> {
        let connector = connectors
            .get(&self.protocol)
            .ok_or_else(|| RemoteError::UnknownProtocol(self.protocol.clone()))?;
        if let Some(password) = password {
            self.credential.set_once(password);
        }
        let user = user.or(self.username.as_deref());
        let password = self.credential.get();
        connector.connect(self, user, password.as_deref()).await
    }

    /// Forgets the cached credential and purges it from `store`.
    pub fn delete_password(&self, store: &dyn SecretStore) {
        self.credential.clear();
        store.delete_password(&self.get_key());
    }

    pub fn to_dict(&self) -> serde_json::Value {
        // A struct of strings and integers always serializes.
        serde_json::to_value(self).unwrap_or_default()
    }

    pub fn from_dict(value: serde_json::Value) -> Result<Self, RemoteError> {
        Ok(serde_json::from_value(value)?)
    }
}

/// Reads a single host descriptor from a YAML or JSON file.
///
/// The file may also hold a bare string, which is used as both the name and the address.
pub fn load_host(path: impl AsRef<Path>) -> Result<Host, RemoteError> {
    let path = path.as_ref();
    let fd = File::open(path)?;
    let HostSpec(host) = serde_yaml::from_reader(fd)?;
    if host.name.is_empty() || host.address.is_empty() {
        return Err(RemoteError::Config(format!(
            "{} needs both 'name' and 'address'",
            path.display()
        )));
    }
    Ok(host)
}

#[derive(Debug, Deserialize)]
struct HostSpec(#[serde(deserialize_with = "string_or_mapping")] Host);

impl FromStr for Host {
    type Err = Void;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Host::new(s, s))
    }
}

impl PartialEq for Host {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
            && self.protocol == other.protocol
            && self.address == other.address
            && self.port == other.port
            && self.username == other.username
            && self.key_filename == other.key_filename
    }
}

impl Eq for Host {}

impl fmt::Display for Host {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "[{} (", self.name)?;
        if let Some(user) = &self.username {
            write!(f, "{}@", user)?;
        }
        write!(f, "{}:{})]", self.address, self.port)
    }
}

/// Write-once password cell shared by all clones of a `Host`.
#[derive(Clone, Default)]
pub struct Credential(Arc<RwLock<Option<String>>>);

impl Credential {
    pub fn get(&self) -> Option<String> {
        self.0.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn is_set(&self) -> bool {
        self.0.read().unwrap_or_else(|e| e.into_inner()).is_some()
    }

    /// Stores `secret` unless a credential is already cached. Returns whether it was stored.
    pub fn set_once(&self, secret: &str) -> bool {
        let mut slot = self.0.write().unwrap_or_else(|e| e.into_inner());
        if slot.is_some() {
            return false;
        }
        *slot = Some(secret.to_string());
        true
    }

    pub fn clear(&self) {
        *self.0.write().unwrap_or_else(|e| e.into_inner()) = None;
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_set() {
            f.write_str("Credential(<set>)")
        } else {
            f.write_str("Credential(<empty>)")
        }
    }
}

/// Where passwords live between runs. Keys are `Host::get_key` values.
pub trait SecretStore: Send + Sync {
    fn get_password(&self, key: &str) -> Option<String>;
    fn set_password(&self, key: &str, password: &str);
    fn delete_password(&self, key: &str);
}

/// Process-local `SecretStore`.
#[derive(Debug, Default)]
pub struct MemorySecretStore {
    secrets: Mutex<HashMap<String, String>>,
}

impl SecretStore for MemorySecretStore {
    fn get_password(&self, key: &str) -> Option<String> {
        self.secrets
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned()
    }

    fn set_password(&self, key: &str, password: &str) {
        self.secrets
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.to_string(), password.to_string());
    }

    fn delete_password(&self, key: &str) {
        self.secrets
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_key_ignores_credential_and_name() {
        let a = Host::new("a", "cluster.example.org");
        let b = Host::new("b", "cluster.example.org");
        b.credential().set_once("hunter2");
        assert_eq!(a.get_key(), b.get_key());
        assert_eq!(a.get_key(), "ssh://cluster.example.org");
        let c = Host::new("a", "cluster.example.org").with_protocol("mock");
        assert_ne!(a.get_key(), c.get_key());
    }

    #[test]
    fn test_credential_is_write_once() {
        let host = Host::new("a", "10.0.0.1");
        assert!(host.credential().set_once("first"));
        assert!(!host.credential().set_once("second"));
        assert_eq!(host.credential().get().as_deref(), Some("first"));
        host.credential().clear();
        assert!(host.credential().set_once("second"));
    }

    #[test]
    fn test_clones_share_credential() {
        let host = Host::new("a", "10.0.0.1");
        let copy = host.clone();
        copy.credential().set_once("pw");
        assert!(host.credential().is_set());
        host.credential().clear();
        assert!(!copy.credential().is_set());
    }

    #[test]
    fn test_dict_round_trip_drops_credential() {
        let host = Host::new("gpu", "gpu.example.org")
            .with_port(2222)
            .with_username("alice")
            .with_key_filename("/home/alice/.ssh/id_ed25519");
        host.credential().set_once("pw");
        let dict = host.to_dict();
        assert!(dict.get("credential").is_none());
        let back = Host::from_dict(dict).unwrap();
        assert_eq!(back, host);
        assert!(!back.credential().is_set());
    }

    #[test]
    fn test_from_dict_defaults() {
        let host = Host::from_dict(serde_json::json!({"name": "n", "address": "h"})).unwrap();
        assert_eq!(host.protocol, "ssh");
        assert_eq!(host.port, 22);
        assert!(host.key_filename.is_none());
    }

    #[test]
    fn test_delete_password_purges_store() {
        let store = MemorySecretStore::default();
        let host = Host::new("a", "10.0.0.1");
        store.set_password(&host.get_key(), "pw");
        host.credential().set_once("pw");
        host.delete_password(&store);
        assert!(!host.credential().is_set());
        assert!(store.get_password(&host.get_key()).is_none());
    }

    #[test]
    fn test_load_host_mapping_and_bare_string() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "name: login\naddress: login.example.org\nport: 2200").unwrap();
        let host = load_host(file.path()).unwrap();
        assert_eq!(host.name, "login");
        assert_eq!(host.port, 2200);

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "login.example.org").unwrap();
        let host = load_host(file.path()).unwrap();
        assert_eq!(host.name, "login.example.org");
        assert_eq!(host.address, "login.example.org");

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, r#"{{"name": "j", "address": "j.example.org", "protocol": "ssh"}}"#)
            .unwrap();
        assert_eq!(load_host(file.path()).unwrap().address, "j.example.org");
    }

    #[test]
    fn test_display() {
        let host = Host::new("gpu", "gpu.example.org").with_username("bob");
        assert_eq!(host.to_string(), "[gpu (bob@gpu.example.org:22)]");
    }
}
