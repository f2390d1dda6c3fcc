// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Table of connected drivers, keyed by load address.
//!
//! The table holds weak references only: a connection lives as long as its
//! driver holds the [`DriverHandle`](crate::DriverHandle) or a call is in
//! flight, and removes itself when it goes away.

use crate::connection::DriverConnection;
use crate::irql::IrqlSpinLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::Weak;
use thiserror::Error;

/// Errors looking up or registering driver connections.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// No live connection has the load address.
    #[error("no driver connected at {0:#x}")]
    NotFound(u64),
    /// A live connection already has the load address.
    #[error("a driver is already connected at {0:#x}")]
    AlreadyRegistered(u64),
    /// The shim is unloading and accepts no new drivers.
    #[error("connection registry has been torn down")]
    TornDown,
}

#[derive(Default)]
struct RegistryState {
    torn_down: bool,
    connections: BTreeMap<u64, Weak<DriverConnection>>,
}

/// Result of [`ConnectionRegistry::driver_connections`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ConnectionList {
    /// Number of addresses written to the output slice.
    pub written: usize,
    /// Number of connected drivers.
    pub available: usize,
}

impl ConnectionList {
    /// Whether every connected driver was written.
    pub fn is_complete(&self) -> bool {
        self.written == self.available
    }
}

/// The connected drivers, keyed by load address. Holds weak references, so
/// a connection leaves the registry when its driver disconnects.
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    state: Arc<IrqlSpinLock<RegistryState>>,
}

impl ConnectionRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `connection` under its load address.
    pub fn register(&self, connection: &Arc<DriverConnection>) -> Result<(), RegistryError> {
        let load_address = connection.load_address();
        let mut state = self.state.lock();
        if state.torn_down {
            return Err(RegistryError::TornDown);
        }
        if let Some(existing) = state.connections.get(&load_address) {
            if existing.strong_count() > 0 {
                return Err(RegistryError::AlreadyRegistered(load_address));
            }
        }
        state
            .connections
            .insert(load_address, Arc::downgrade(connection));
        Ok(())
    }

    /// Removes `connection` if it is the one registered at `load_address`.
    /// Does nothing once the registry has been torn down.
    pub fn unregister(&self, load_address: u64, connection: &DriverConnection) {
        let mut state = self.state.lock();
        if state.torn_down {
            return;
        }
        let registered = state
            .connections
            .get(&load_address)
            .is_some_and(|entry| std::ptr::eq(entry.as_ptr(), connection));
        if registered {
            state.connections.remove(&load_address);
        }
    }

    /// Looks up the connection at `load_address` and takes a reference to it.
    pub fn lookup(&self, load_address: u64) -> Result<Arc<DriverConnection>, RegistryError> {
        let state = self.state.lock();
        if state.torn_down {
            return Err(RegistryError::TornDown);
        }
        state
            .connections
            .get(&load_address)
            .and_then(Weak::upgrade)
            .ok_or(RegistryError::NotFound(load_address))
    }

    /// Writes the load addresses of connected drivers to `addresses`, in
    /// ascending order, as far as they fit.
    pub fn driver_connections(&self, addresses: &mut [u64]) -> ConnectionList {
        let state = self.state.lock();
        let mut available = 0;
        for (&load_address, _) in state
            .connections
            .iter()
            .filter(|(_, connection)| connection.strong_count() > 0)
        {
            if let Some(slot) = addresses.get_mut(available) {
                *slot = load_address;
            }
            available += 1;
        }
        ConnectionList {
            written: available.min(addresses.len()),
            available,
        }
    }

    /// Number of live connections.
    pub fn len(&self) -> usize {
        self.state
            .lock()
            .connections
            .values()
            .filter(|connection| connection.strong_count() > 0)
            .count()
    }

    /// Whether no driver is connected.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops all entries. Connections that go away afterwards find the
    /// registry torn down and skip unregistering.
    pub fn teardown(&self) {
        let connections = {
            let mut state = self.state.lock();
            state.torn_down = true;
            std::mem::take(&mut state.connections)
        };
        tracing::info!(
            remaining = connections.len(),
            "connection registry torn down"
        );
    }
}
