//! Persisted collection of known hosts.
//!
//! The registry file is a single JSON record: `{"hosts": [...], "default": "<name>"}`.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::error::RemoteError;
use crate::host::{Host, SecretStore};

#[derive(Debug, Default, Serialize, Deserialize)]
struct RegistryFile {
    hosts: Vec<Host>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    default: Option<String>,
}

pub struct TargetRegistry {
    path: PathBuf,
    targets: BTreeMap<String, Host>,
    default: Option<String>,
    secrets: Arc<dyn SecretStore>,
}

impl TargetRegistry {
    /// An empty registry that will be saved to `path`.
    pub fn new(path: impl Into<PathBuf>, secrets: Arc<dyn SecretStore>) -> Self {
        Self {
            path: path.into(),
            targets: BTreeMap::new(),
            default: None,
            secrets,
        }
    }

    /// A registry populated from `path` (or empty, see `load_targets`).
    pub fn open(path: impl Into<PathBuf>, secrets: Arc<dyn SecretStore>) -> Self {
        let mut registry = Self::new(path, secrets);
        registry.load_targets();
        registry
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, name: &str) -> Option<&Host> {
        self.targets.get(name)
    }

    /// Hosts ordered by name.
    pub fn targets(&self) -> impl Iterator<Item = &Host> {
        self.targets.values()
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    pub fn default_name(&self) -> Option<&str> {
        self.default.as_deref()
    }

    pub fn default_target(&self) -> Option<&Host> {
        self.default.as_ref().and_then(|name| self.targets.get(name))
    }

    pub fn add_target(&mut self, host: Host) -> Result<(), RemoteError> {
        if self.targets.contains_key(&host.name) {
            return Err(RemoteError::DuplicateName(host.name));
        }
        debug!(host = %host, "adding target");
        self.targets.insert(host.name.clone(), host);
        Ok(())
    }

    /// Removes a target and purges its credential.
    pub fn del_target(&mut self, name: &str) -> Result<Host, RemoteError> {
        let host = self
            .targets
            .remove(name)
            .ok_or_else(|| RemoteError::UnknownTarget(name.to_string()))?;
        host.delete_password(&*self.secrets);
        if self.default.as_deref() == Some(name) {
            self.default = None;
        }
        Ok(host)
    }

    pub fn set_default(&mut self, name: &str) -> Result<(), RemoteError> {
        if !self.targets.contains_key(name) {
            return Err(RemoteError::UnknownTarget(name.to_string()));
        }
        self.default = Some(name.to_string());
        Ok(())
    }

    /// Writes the registry to a temporary file beside `path` and renames it into place.
    pub fn save_targets(&self) -> Result<(), RemoteError> {
        let record = RegistryFile {
            hosts: self.targets.values().cloned().collect(),
            default: self.default.clone(),
        };
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let mut file = NamedTempFile::new_in(dir)?;
        serde_json::to_writer_pretty(&mut file, &record)?;
        file.write_all(b"\n")?;
        file.as_file().sync_all()?;
        file.persist(&self.path).map_err(|e| e.error)?;
        debug!(path = %self.path.display(), targets = record.hosts.len(), "saved targets");
        Ok(())
    }

    /// Replaces the in-memory registry with the file's contents.
    ///
    /// A missing or unreadable file leaves an empty registry and a warning.
    pub fn load_targets(&mut self) {
        self.targets.clear();
        self.default = None;

        let record = match read_registry(&self.path) {
            Ok(record) => record,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "resetting to an empty target registry");
                return;
            }
        };
        for host in record.hosts {
            if self.targets.contains_key(&host.name) {
                warn!(name = %host.name, "skipping duplicate target");
                continue;
            }
            self.targets.insert(host.name.clone(), host);
        }
        match record.default {
            Some(name) if self.targets.contains_key(&name) => self.default = Some(name),
            Some(name) => warn!(name = %name, "default target is not registered, ignoring"),
            None => {}
        }
    }
}

fn read_registry(path: &Path) -> Result<RegistryFile, RemoteError> {
    let file = File::open(path)?;
    Ok(serde_json::from_reader(BufReader::new(file))?)
}
