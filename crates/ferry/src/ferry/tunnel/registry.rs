use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use serde::Serialize;

use crate::ferry::{
    telemetry,
    tunnel::{
        client::{GracePeriod, TunnelClient},
        pool::ConnectionPool,
    },
};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("Client with id \"{0}\" already exists.")]
    DuplicateId(String),
    #[error("Duplicate secret.")]
    DuplicateSecret,
    #[error("Client with id \"{0}\" does not exist.")]
    NotFound(String),
    #[error("Client not found.")]
    SecretNotFound,
}

/// What a tunnel client needs to know after registering.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Registration {
    pub id: String,
    pub secret: String,
    pub max_sockets: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RegistryStats {
    pub tunnels: usize,
}

#[derive(Default)]
struct State {
    by_id: HashMap<String, Arc<TunnelClient>>,
    by_secret: HashMap<String, Arc<TunnelClient>>,
}

/// Live tunnels, indexed by public id and by secret.
///
/// Both indexes change together under one lock; ids and secrets are unique
/// among live tunnels.
pub struct ClientRegistry {
    max_sockets: usize,
    grace: GracePeriod,
    state: Mutex<State>,
}

impl std::fmt::Debug for ClientRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientRegistry")
            .field("max_sockets", &self.max_sockets)
            .field("grace", &self.grace)
            .field("tunnels", &self.stats().tunnels)
            .finish()
    }
}

impl ClientRegistry {
    pub fn new(max_sockets: usize, grace: GracePeriod) -> Self {
        Self {
            max_sockets,
            grace,
            state: Mutex::new(State::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn max_sockets(&self) -> usize {
        self.max_sockets
    }

    /// Creates a tunnel for `id`/`secret`. `grace` overrides the registry
    /// default for this tunnel only.
    ///
    /// The tunnel leaves the registry on its own once it closes.
    pub fn register(
        self: &Arc<Self>,
        id: &str,
        secret: &str,
        grace: Option<GracePeriod>,
    ) -> Result<Registration, RegistryError> {
        let client = {
            let mut st = self.lock();
            if st.by_id.contains_key(id) {
                return Err(RegistryError::DuplicateId(id.to_string()));
            }
            if st.by_secret.contains_key(secret) {
                return Err(RegistryError::DuplicateSecret);
            }

            let (pool, events) = ConnectionPool::new(id, self.max_sockets);
            let client =
                TunnelClient::new(id, secret, pool, events, grace.unwrap_or(self.grace));
            st.by_id.insert(id.to_string(), client.clone());
            st.by_secret.insert(secret.to_string(), client.clone());
            metrics::gauge!(telemetry::TUNNELS_ACTIVE).set(st.by_id.len() as f64);
            client
        };

        let registry = Arc::downgrade(self);
        let watched = client.clone();
        tokio::spawn(async move {
            watched.closed().await;
            if let Some(registry) = registry.upgrade() {
                registry.remove_instance(&watched);
            }
        });

        tracing::info!(client = %id, max_sockets = self.max_sockets, "registry: client registered");
        Ok(Registration {
            id: id.to_string(),
            secret: secret.to_string(),
            max_sockets: self.max_sockets,
        })
    }

    /// Removes and closes the tunnel for `id`; absent ids are ignored.
    pub fn remove(&self, id: &str) {
        let removed = {
            let mut st = self.lock();
            let Some(client) = st.by_id.remove(id) else {
                return;
            };
            st.by_secret.remove(client.secret());
            metrics::gauge!(telemetry::TUNNELS_ACTIVE).set(st.by_id.len() as f64);
            client
        };
        removed.close();
        tracing::info!(client = %id, "registry: client removed");
    }

    /// Removes `client` only if it is still the instance registered under its
    /// id; a later registration reusing the id is left alone.
    fn remove_instance(&self, client: &Arc<TunnelClient>) {
        {
            let mut st = self.lock();
            match st.by_id.get(client.id()) {
                Some(current) if Arc::ptr_eq(current, client) => {}
                _ => return,
            }
            st.by_id.remove(client.id());
            st.by_secret.remove(client.secret());
            metrics::gauge!(telemetry::TUNNELS_ACTIVE).set(st.by_id.len() as f64);
        }
        client.close();
        tracing::info!(client = %client.id(), "registry: client removed after close");
    }

    pub fn lookup_by_id(&self, id: &str) -> Result<Arc<TunnelClient>, RegistryError> {
        self.lock()
            .by_id
            .get(id)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))
    }

    pub fn lookup_by_secret(&self, secret: &str) -> Result<Arc<TunnelClient>, RegistryError> {
        self.lock()
            .by_secret
            .get(secret)
            .cloned()
            .ok_or(RegistryError::SecretNotFound)
    }

    pub fn has_id(&self, id: &str) -> bool {
        self.lock().by_id.contains_key(id)
    }

    pub fn has_secret(&self, secret: &str) -> bool {
        self.lock().by_secret.contains_key(secret)
    }

    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            tunnels: self.lock().by_id.len(),
        }
    }

    /// Closes every live tunnel. Used on shutdown.
    pub fn close_all(&self) {
        let clients: Vec<_> = {
            let mut st = self.lock();
            st.by_secret.clear();
            st.by_id.drain().map(|(_, c)| c).collect()
        };
        metrics::gauge!(telemetry::TUNNELS_ACTIVE).set(0.0);
        for client in clients {
            client.close();
        }
    }
}
