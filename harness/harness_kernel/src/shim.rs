// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The shim device that test drivers connect to.

use crate::connection::ConnectError;
use crate::connection::DriverConnection;
use crate::connection::DriverHandle;
use crate::registry::ConnectionRegistry;
use crate::sink::ReportSink;
use harness_core::catalog::Module;
use std::sync::Arc;
use std::time::Duration;

const DEFAULT_JOIN_TIMEOUT: Duration = Duration::from_secs(60);

/// The kernel-mode side of the harness.
///
/// Cloning yields another reference to the same device.
#[derive(Clone)]
pub struct KernelShim {
    registry: ConnectionRegistry,
    join_timeout: Duration,
}

impl KernelShim {
    /// Creates a shim with no connected drivers.
    pub fn new() -> Self {
        Self {
            registry: ConnectionRegistry::new(),
            join_timeout: DEFAULT_JOIN_TIMEOUT,
        }
    }

    /// Sets how long a routine call waits for the system threads it
    /// started. Applies to drivers connecting afterwards.
    pub fn with_join_timeout(mut self, join_timeout: Duration) -> Self {
        self.join_timeout = join_timeout;
        self
    }

    /// Connects the driver loaded at `load_address`.
    ///
    /// `init` is the driver's entry point: it receives the report sink of the
    /// requested version and returns the driver's test module. The driver
    /// stays connected until the returned handle is dropped.
    pub fn connect_driver(
        &self,
        load_address: u64,
        sink_version: u32,
        init: impl FnOnce(ReportSink) -> Arc<Module>,
    ) -> Result<DriverHandle, ConnectError> {
        DriverConnection::connect(
            &self.registry,
            load_address,
            sink_version,
            self.join_timeout,
            init,
        )
        .inspect_err(|err| {
            tracing::error!(
                load_address = format_args!("{load_address:#x}"),
                error = err as &dyn std::error::Error,
                "failed to connect driver"
            );
        })
    }

    /// The drivers connected to this shim.
    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    /// Tears down the connection registry. Drivers still connected keep
    /// their handles, but can no longer be reached.
    pub fn unload(&self) {
        self.registry.teardown();
    }
}

impl Default for KernelShim {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::RegistryError;
    use crate::sink::SinkError;
    use harness_core::catalog::FixtureBuilder;
    use harness_core::catalog::ModuleBuilder;
    use harness_defs::SINK_VERSION_1;

    fn module(_sink: ReportSink) -> Arc<Module> {
        ModuleBuilder::new("driver")
            .fixture(FixtureBuilder::new("F").test_case("A", || {}))
            .build()
    }

    #[test]
    fn connect_and_unload() {
        let shim = KernelShim::new();
        let handle = shim.connect_driver(0x1000, SINK_VERSION_1, module).unwrap();
        assert_eq!(handle.connection().sink_version(), SINK_VERSION_1);
        assert!(matches!(
            shim.connect_driver(0x1000, SINK_VERSION_1, module),
            Err(ConnectError::Registry(RegistryError::AlreadyRegistered(0x1000)))
        ));
        assert!(matches!(
            shim.connect_driver(0x2000, 0x4000, module),
            Err(ConnectError::Sink(SinkError::UnsupportedVersion(0x4000)))
        ));
        assert!(matches!(
            shim.connect_driver(0, SINK_VERSION_1, module),
            Err(ConnectError::InvalidAddress)
        ));

        shim.unload();
        assert!(matches!(
            shim.connect_driver(0x2000, SINK_VERSION_1, module),
            Err(ConnectError::Registry(RegistryError::TornDown))
        ));
        drop(handle);
    }
}
