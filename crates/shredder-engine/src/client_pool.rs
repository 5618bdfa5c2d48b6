//! Bounded pool of warehouse clients with rotating billing projects.
//!
//! Each task checks a client out for its whole duration and returns it when
//! the guard drops, so jobs from concurrent tasks spread across the billing
//! projects round-robin.

use std::collections::VecDeque;
use std::ops::Deref;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::errors::ShredError;
use crate::warehouse::Warehouse;

pub struct ClientPool {
    clients: Mutex<VecDeque<Arc<dyn Warehouse>>>,
    available: Arc<Semaphore>,
    default_client: Arc<dyn Warehouse>,
    size: usize,
}

impl std::fmt::Debug for ClientPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientPool")
            .field("size", &self.size)
            .field("default_project", &self.default_client.project())
            .finish_non_exhaustive()
    }
}

impl ClientPool {
    /// Pool over `clients`. The first client also serves as the default
    /// client for discovery, planning and ledger access.
    ///
    /// # Errors
    ///
    /// Returns [`ShredError::InvalidConfig`] if `clients` is empty.
    pub fn new(clients: Vec<Arc<dyn Warehouse>>) -> Result<Self, ShredError> {
        let default_client = clients
            .first()
            .cloned()
            .ok_or_else(|| ShredError::InvalidConfig(vec!["client pool needs at least one client".into()]))?;
        let size = clients.len();
        Ok(Self {
            clients: Mutex::new(clients.into_iter().collect()),
            available: Arc::new(Semaphore::new(size)),
            default_client,
            size,
        })
    }

    /// Build `size` clients, assigning `billing_projects` round-robin.
    ///
    /// # Errors
    ///
    /// Returns [`ShredError::InvalidConfig`] if there are no billing
    /// projects or `size` is zero.
    pub fn round_robin<F>(billing_projects: &[String], size: usize, mut factory: F) -> Result<Self, ShredError>
    where
        F: FnMut(&str) -> Arc<dyn Warehouse>,
    {
        if billing_projects.is_empty() {
            return Err(ShredError::InvalidConfig(vec![
                "at least one billing project is required".into(),
            ]));
        }
        let clients = billing_projects
            .iter()
            .cycle()
            .take(size)
            .map(|project| factory(project))
            .collect();
        Self::new(clients)
    }

    #[must_use]
    pub fn default_client(&self) -> Arc<dyn Warehouse> {
        Arc::clone(&self.default_client)
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Wait for a free client.
    ///
    /// # Errors
    ///
    /// Returns [`ShredError::TaskPanicked`] if the pool was closed.
    pub async fn checkout(self: &Arc<Self>) -> Result<ClientGuard, ShredError> {
        let permit = Arc::clone(&self.available)
            .acquire_owned()
            .await
            .map_err(|e| ShredError::TaskPanicked(format!("client pool closed: {e}")))?;
        let client = self
            .clients
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
            .ok_or_else(|| ShredError::TaskPanicked("client pool is empty".into()))?;
        Ok(ClientGuard {
            client: Some(client),
            pool: Arc::clone(self),
            _permit: permit,
        })
    }

    fn give_back(&self, client: Arc<dyn Warehouse>) {
        self.clients
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(client);
    }
}

/// A checked-out client. Returned to the back of the pool on drop.
pub struct ClientGuard {
    client: Option<Arc<dyn Warehouse>>,
    pool: Arc<ClientPool>,
    _permit: OwnedSemaphorePermit,
}

impl ClientGuard {
    /// Shared handle to the checked-out client, for nested tasks.
    #[must_use]
    pub fn shared(&self) -> Arc<dyn Warehouse> {
        self.client
            .as_ref()
            .map_or_else(|| self.pool.default_client(), Arc::clone)
    }
}

impl Deref for ClientGuard {
    type Target = dyn Warehouse;

    fn deref(&self) -> &Self::Target {
        match &self.client {
            Some(client) => client.as_ref(),
            None => self.pool.default_client.as_ref(),
        }
    }
}

impl Drop for ClientGuard {
    fn drop(&mut self) {
        if let Some(client) = self.client.take() {
            self.pool.give_back(client);
        }
    }
}
