use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use log::info;

use super::connection::RdmaConnection;
use super::SessionId;
use crate::config::EngineConfig;
use crate::rdma::{LinkType, PortNum, Provider};
use crate::{Error, Result};

/// Connections of one process, keyed by session id.
///
/// Dropping the engine stops every connection it holds.
pub struct TransferEngine {
    provider: Arc<dyn Provider>,
    config: EngineConfig,
    links: HashMap<SessionId, RdmaConnection>,
}

impl fmt::Debug for TransferEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferEngine")
            .field("config", &self.config)
            .field("sessions", &self.session_ids())
            .finish()
    }
}

impl TransferEngine {
    /// Create an engine with the default configuration.
    pub fn new(provider: Arc<dyn Provider>) -> Self {
        Self {
            provider,
            config: EngineConfig::default(),
            links: HashMap::new(),
        }
    }

    /// Create an engine with the given configuration.
    pub fn with_config(provider: Arc<dyn Provider>, config: EngineConfig) -> Result<Self> {
        config.connection.validate()?;
        Ok(Self {
            provider,
            config,
            links: HashMap::new(),
        })
    }

    #[inline]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// List the devices the provider can open.
    pub fn device_names(&self) -> Result<Vec<String>> {
        self.provider.device_names().map_err(Error::Device)
    }

    /// Create and initialize the connection of session `id`.
    ///
    /// The session is only recorded if initialization succeeds.
    pub fn init_link(
        &mut self,
        id: SessionId,
        dev_name: &str,
        port_num: PortNum,
        link_type: LinkType,
    ) -> Result<&RdmaConnection> {
        let Entry::Vacant(slot) = self.links.entry(id) else {
            return Err(Error::AlreadyExists(id));
        };
        let conn = RdmaConnection::new(self.provider.clone(), self.config.connection.clone())?;
        conn.initialize(dev_name, port_num, link_type)?;
        info!("session {} bound to {} port {}", id, dev_name, port_num);
        Ok(slot.insert(conn))
    }

    /// Stop the connection of session `id` and forget the session.
    pub fn stop_link(&mut self, id: SessionId) -> Result<()> {
        let conn = self.links.remove(&id).ok_or(Error::NotFound(id))?;
        conn.stop();
        info!("session {} stopped", id);
        Ok(())
    }

    /// Get the connection of session `id`.
    pub fn link(&self, id: SessionId) -> Result<&RdmaConnection> {
        self.links.get(&id).ok_or(Error::NotFound(id))
    }

    #[inline]
    pub fn contains(&self, id: SessionId) -> bool {
        self.links.contains_key(&id)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.links.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    /// Ids of all live sessions, in ascending order.
    pub fn session_ids(&self) -> Vec<SessionId> {
        let mut ids = self.links.keys().copied().collect::<Vec<_>>();
        ids.sort_unstable();
        ids
    }

    /// Stop every connection.
    pub fn stop_all(&mut self) {
        for (id, conn) in self.links.drain() {
            conn.stop();
            info!("session {} stopped", id);
        }
    }
}

impl Drop for TransferEngine {
    fn drop(&mut self) {
        self.stop_all();
    }
}
