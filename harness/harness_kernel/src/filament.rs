// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Per-driver filament registry.
//!
//! Lookups happen from whatever level test code reports at, so the bindings
//! are kept behind a spin lock held at [`Irql::SYNCH`]. There is no default
//! filament: drivers start their threads through the report sink.

use crate::irql::IrqlSpinLock;
use harness_core::FilamentBinder;
use harness_core::FilamentError;
use harness_core::filament::Binding;
use harness_core::filament::CurrentThread;
use harness_core::filament::Filament;
use harness_core::filament::ThreadBindings;
use harness_core::filament::UnknownThreadPolicy;
use std::sync::Arc;

/// Filament registry of a driver connection.
#[derive(Clone)]
pub struct KernelFilamentRegistry {
    bindings: Arc<IrqlSpinLock<ThreadBindings>>,
}

impl KernelFilamentRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self {
            bindings: Arc::new(IrqlSpinLock::new(ThreadBindings::new())),
        }
    }

    /// Number of bound threads.
    pub fn bound_threads(&self) -> usize {
        self.bindings.lock().len()
    }
}

impl Default for KernelFilamentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl FilamentBinder for KernelFilamentRegistry {
    fn set_current_filament(&self, filament: &Arc<Filament>) -> Result<(), FilamentError> {
        // Counting the child takes the filament's mutex, which must not
        // happen at SYNCH.
        let binding = Binding::new(std::thread::current().id(), filament, true)?;
        let bound = self.bindings.lock().bind(binding);
        bound.map_err(|rejected| rejected.error)
    }

    fn get_current(&self, _derive_default: bool) -> Result<CurrentThread, FilamentError> {
        self.bindings
            .lock()
            .lookup(std::thread::current().id())
            .ok_or(FilamentError::UnknownThread)
    }

    fn reset_current_filament(&self) {
        let released = self.bindings.lock().unbind(std::thread::current().id());
        drop(released);
    }

    fn unknown_thread_policy(&self) -> UnknownThreadPolicy {
        UnknownThreadPolicy::Ignore
    }
}
