//! Connection pooling.
//!
//! Connections are cached per `Host::get_key`, so every job against the same host shares one
//! session. Commands from different jobs on a shared connection may interleave; callers that
//! need them ordered must serialize the jobs themselves.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, warn};

use crate::error::RemoteError;
use crate::host::{Host, SecretStore};
use crate::session::{Connection, Connectors};

/// One pool slot. Filled at most once; concurrent connects to the same key wait on it.
type Slot = Arc<OnceCell<Arc<dyn Connection>>>;

pub struct ConnectionPool {
    connectors: Connectors,
    secrets: Option<Arc<dyn SecretStore>>,
    clients: Mutex<HashMap<String, Slot>>,
}

impl ConnectionPool {
    pub fn new(connectors: Connectors) -> Self {
        Self {
            connectors,
            secrets: None,
            clients: Mutex::new(HashMap::new()),
        }
    }

    /// Seeds empty host credentials from `store` and saves working ones back to it.
    pub fn with_secrets(mut self, store: Arc<dyn SecretStore>) -> Self {
        self.secrets = Some(store);
        self
    }

    pub fn connectors(&self) -> &Connectors {
        &self.connectors
    }

    /// Returns the cached connection for `host`, opening one on first use.
    ///
    /// The map lock is only held to find the host's slot. The handshake runs on the slot, so a
    /// slow host never blocks other hosts, and a key never gets two connections.
    ///
    /// When opening fails the host's cached credential is cleared, so the next attempt has to
    /// authenticate from scratch, and the error is returned unchanged.
    pub async fn connect(&self, host: &Host) -> Result<Arc<dyn Connection>, RemoteError> {
        let key = host.get_key();
        let slot = Arc::clone(self.clients.lock().await.entry(key.clone()).or_default());

        let client = slot
            .get_or_try_init(|| async {
                if let Some(store) = &self.secrets {
                    if !host.credential().is_set() {
                        if let Some(password) = store.get_password(&key) {
                            host.credential().set_once(&password);
                        }
                    }
                }

                match host.connect(&self.connectors, None, None).await {
                    Ok(client) => {
                        if let (Some(store), Some(password)) =
                            (&self.secrets, host.credential().get())
                        {
                            store.set_password(&key, &password);
                        }
                        debug!(key = %key, "caching connection");
                        Ok(client)
                    }
                    Err(e) => {
                        warn!(host = %host, error = %e, "connect failed, clearing cached credential");
                        host.credential().clear();
                        Err(e)
                    }
                }
            })
            .await;

        match client {
            Ok(client) => Ok(Arc::clone(client)),
            Err(e) => {
                self.forget_empty(&key, &slot).await;
                Err(e)
            }
        }
    }

    /// Removes `slot` if it is still the entry for `key` and was never filled.
    async fn forget_empty(&self, key: &str, slot: &Slot) {
        let mut clients = self.clients.lock().await;
        if let Some(current) = clients.get(key) {
            if Arc::ptr_eq(current, slot) && !current.initialized() {
                clients.remove(key);
            }
        }
    }

    /// Cached connection for `host`, if any. Never connects.
    pub async fn check_host(&self, host: &Host) -> Option<Arc<dyn Connection>> {
        self.clients
            .lock()
            .await
            .get(&host.get_key())
            .and_then(|slot| slot.get().cloned())
    }

    /// Evicts and closes the cached connection for `host`.
    pub async fn drop_client(&self, host: &Host) -> Option<Arc<dyn Connection>> {
        let key = host.get_key();
        let client = {
            let mut clients = self.clients.lock().await;
            let client = clients.get(&key)?.get().cloned()?;
            clients.remove(&key);
            client
        };
        if let Err(e) = client.close().await {
            warn!(host = %host, error = %e, "error while closing evicted connection");
        }
        Some(client)
    }

    /// Closes and evicts every cached connection.
    pub async fn close_all(&self) {
        let clients: Vec<_> = self
            .clients
            .lock()
            .await
            .drain()
            .filter_map(|(_, slot)| slot.get().cloned())
            .collect();
        for result in join_all(clients.iter().map(|c| c.close())).await {
            if let Err(e) = result {
                warn!(error = %e, "error while closing connection");
            }
        }
    }

    /// Number of open cached connections.
    pub async fn len(&self) -> usize {
        self.clients
            .lock()
            .await
            .values()
            .filter(|slot| slot.initialized())
            .count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl Default for ConnectionPool {
    fn default() -> Self {
        Self::new(Connectors::default())
    }
}
