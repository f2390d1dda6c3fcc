// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The bridge between the shim and one connected test driver.
//!
//! A connection has two kinds of owners. Internal references are plain
//! [`Arc`] clones, taken by the registry lookup for the duration of a call.
//! The external reference is the [`DriverHandle`] held by the driver itself.
//! Dropping the handle waits for calls in flight to finish and makes every
//! later call fail with [`ConnectionError::Unavailable`], so driver code
//! never runs once its driver started unloading.

use crate::adapter::AdapterError;
use crate::adapter::TestAdapter;
use crate::channel::ReportChannel;
use crate::filament::KernelFilamentRegistry;
use crate::irql;
use crate::registry::ConnectionRegistry;
use crate::registry::RegistryError;
use crate::sink::ReportSink;
use crate::sink::SinkError;
use harness_core::FilamentBinder;
use harness_core::FilamentError;
use harness_core::catalog::Module;
use harness_core::event::ExecutionEvent;
use harness_core::event::MessageEvent;
use harness_core::filament::Filament;
use harness_core::filament::FilamentFlags;
use harness_core::filament::ValueTag;
use harness_core::guard::RoutineOutcome;
use harness_core::guard::join_and_fold;
use harness_core::guard::run_guarded;
use parking_lot::RwLock;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;
use thiserror::Error;

/// Errors connecting a driver to the shim.
#[derive(Debug, Error)]
pub enum ConnectError {
    /// The load address is zero.
    #[error("invalid load address")]
    InvalidAddress,
    /// The requested report sink version is not offered.
    #[error("unsupported report sink")]
    Sink(#[from] SinkError),
    /// The driver's module cannot be keyed.
    #[error("invalid test module")]
    Adapter(#[from] AdapterError),
    /// A driver is already connected at the load address.
    #[error("failed to register connection")]
    Registry(#[from] RegistryError),
}

/// Errors calling into a connected driver.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// The keys name no routine of the driver's module.
    #[error("no routine {routine_key} in fixture {fixture_key}")]
    EntryPointNotFound {
        /// Key of the fixture.
        fixture_key: u16,
        /// Key of the routine within the fixture.
        routine_key: u16,
    },
    /// The driver is disconnecting.
    #[error("driver is unloading")]
    Unavailable,
    /// The calling thread could not be bound to the routine's filament.
    #[error("failed to bind routine thread")]
    Filament(#[from] FilamentError),
}

/// Result of [`DriverConnection::call_routine`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct CallOutcome {
    /// The routine and its child threads finished without failing.
    pub ran_to_completion: bool,
    /// The run must stop after this call.
    pub abort_run: bool,
    /// The per-test value as the routine left it.
    pub tls_value: u64,
}

/// A connected test driver: its keyed module, the filaments its routines
/// run in, and the sink it reports through.
pub struct DriverConnection {
    load_address: u64,
    adapter: TestAdapter,
    filaments: KernelFilamentRegistry,
    sink_version: u32,
    join_timeout: Duration,
    registry: ConnectionRegistry,
    external: AtomicBool,
    // Held shared by calls, exclusively by the unloading driver.
    unload_lock: RwLock<()>,
}

impl DriverConnection {
    /// Connects the driver at `load_address`. `init` receives the sink the
    /// driver reports through and returns the driver's test module.
    pub(crate) fn connect(
        registry: &ConnectionRegistry,
        load_address: u64,
        sink_version: u32,
        join_timeout: Duration,
        init: impl FnOnce(ReportSink) -> Arc<Module>,
    ) -> Result<DriverHandle, ConnectError> {
        if load_address == 0 {
            return Err(ConnectError::InvalidAddress);
        }
        let filaments = KernelFilamentRegistry::new();
        let sink = ReportSink::new(sink_version, filaments.clone())?;
        let module = init(sink);
        let adapter = TestAdapter::new(&module)?;

        let connection = Arc::new(Self {
            load_address,
            adapter,
            filaments,
            sink_version,
            join_timeout,
            registry: registry.clone(),
            external: AtomicBool::new(true),
            unload_lock: RwLock::new(()),
        });
        registry.register(&connection)?;

        tracing::info!(
            load_address = format_args!("{load_address:#x}"),
            module = module.name(),
            sink_version = format_args!("{sink_version:#x}"),
            fixtures = connection.adapter.fixture_count(),
            "driver connected"
        );
        Ok(DriverHandle { connection })
    }

    /// Address the driver was loaded at, which identifies the connection.
    pub fn load_address(&self) -> u64 {
        self.load_address
    }

    /// Version of the report sink handed to the driver.
    pub fn sink_version(&self) -> u32 {
        self.sink_version
    }

    /// Keys of the driver's fixtures and routines.
    pub fn adapter(&self) -> &TestAdapter {
        &self.adapter
    }

    /// Whether the driver still holds its handle.
    pub fn is_available(&self) -> bool {
        self.external.load(Ordering::Acquire)
    }

    /// Runs one routine of the driver on the calling thread, reporting to
    /// `channel`.
    ///
    /// The routine must return at the level it was called at. If it does
    /// not, the level is restored and a log event is queued.
    pub fn call_routine(
        &self,
        fixture_key: u16,
        routine_key: u16,
        channel: &Arc<ReportChannel>,
        tls_value: u64,
    ) -> Result<CallOutcome, ConnectionError> {
        let _protection = self.unload_lock.read();
        if !self.external.load(Ordering::Acquire) {
            return Err(ConnectionError::Unavailable);
        }
        let routine = self
            .adapter
            .routine(fixture_key, routine_key)
            .ok_or(ConnectionError::EntryPointNotFound {
                fixture_key,
                routine_key,
            })?;

        let filament = Filament::new(channel.clone(), FilamentFlags::new());
        filament.set_value(ValueTag::Default, tls_value);
        self.filaments.set_current_filament(&filament)?;
        let thread = filament.identity(std::thread::current().id());

        let entry_irql = irql::current();
        let (outcome, reraise) = run_guarded(&filament, &thread, || routine()).into_parts();
        let exit_irql = irql::current();
        if exit_irql != entry_irql {
            tracing::warn!(
                fixture_key,
                routine_key,
                %entry_irql,
                %exit_irql,
                "routine returned at a different IRQL"
            );
            channel.queue_event(&ExecutionEvent::Log(MessageEvent::new(format!(
                "Routine returned at {exit_irql}, restoring {entry_irql}"
            ))));
            irql::restore(entry_irql);
        }

        let outcome = join_and_fold(&filament, &thread, self.join_timeout, outcome);
        let tls_value = filament.get_value(ValueTag::Default);
        self.filaments.reset_current_filament();

        if let Some(payload) = reraise {
            std::panic::resume_unwind(payload);
        }
        Ok(CallOutcome {
            ran_to_completion: outcome == RoutineOutcome::RanToCompletion,
            abort_run: outcome == RoutineOutcome::RunAborted,
            tls_value,
        })
    }
}

impl Drop for DriverConnection {
    fn drop(&mut self) {
        self.registry.unregister(self.load_address, self);
        tracing::debug!(
            load_address = format_args!("{:#x}", self.load_address),
            "driver connection freed"
        );
    }
}

/// The driver's reference to its connection. Dropping it disconnects the
/// driver.
#[must_use]
pub struct DriverHandle {
    connection: Arc<DriverConnection>,
}

impl DriverHandle {
    /// The connection this handle keeps alive.
    pub fn connection(&self) -> &Arc<DriverConnection> {
        &self.connection
    }

    /// Disconnects the driver, waiting for calls in flight.
    pub fn disconnect(self) {}
}

impl Drop for DriverHandle {
    fn drop(&mut self) {
        let _unload = self.connection.unload_lock.write();
        self.connection.external.store(false, Ordering::Release);
        tracing::info!(
            load_address = format_args!("{:#x}", self.connection.load_address),
            "driver disconnected"
        );
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::channel::Dispositions;
    use crate::event_buffer::EventReader;
    use crate::irql::Irql;
    use harness_core::Disposition;
    use harness_core::catalog::FixtureBuilder;
    use harness_core::catalog::ModuleBuilder;
    use harness_defs::SINK_VERSION_3;
    use std::sync::atomic::AtomicU32;
    use std::sync::mpsc;
    use std::time::Instant;

    pub(crate) fn connect(registry: &ConnectionRegistry, load_address: u64) -> DriverHandle {
        DriverConnection::connect(
            registry,
            load_address,
            SINK_VERSION_3,
            Duration::from_secs(5),
            |_| {
                ModuleBuilder::new("empty")
                    .fixture(FixtureBuilder::new("F").test_case("A", || {}))
                    .build()
            },
        )
        .unwrap()
    }

    fn channel(disposition: Disposition) -> Arc<ReportChannel> {
        ReportChannel::new(
            Dispositions {
                failed_assertion: disposition,
                unhandled_exception: disposition,
            },
            4096,
        )
    }

    #[test]
    fn outcomes_and_tls_value() {
        let registry = ConnectionRegistry::new();
        let handle = DriverConnection::connect(
            &registry,
            0x1000,
            SINK_VERSION_3,
            Duration::from_secs(5),
            |sink| {
                let passing = sink.clone();
                let failing = sink.clone();
                let halting = sink;
                ModuleBuilder::new("driver")
                    .fixture(
                        FixtureBuilder::new("F")
                            .test_case("Pass", move || {
                                let value = passing.get_value(ValueTag::Default).unwrap();
                                passing.set_value(ValueTag::Default, value + 1).unwrap();
                            })
                            .test_case("Fail", move || {
                                failing.report_failed_assertion("f.rs", "Fail", 1, "false");
                            })
                            .test_case("Halt", move || {
                                halting.fail().unwrap();
                            }),
                    )
                    .build()
            },
        )
        .unwrap();
        let connection = handle.connection();

        let outcome = connection
            .call_routine(0, 0, &channel(Disposition::Continue), 41)
            .unwrap();
        assert_eq!(
            outcome,
            CallOutcome {
                ran_to_completion: true,
                abort_run: false,
                tls_value: 42
            }
        );

        let failing = channel(Disposition::Break);
        let outcome = connection.call_routine(0, 1, &failing, 0).unwrap();
        assert!(!outcome.ran_to_completion);
        assert!(!outcome.abort_run);
        assert_eq!(failing.take_events().event_count(), 1);

        let outcome = connection
            .call_routine(0, 1, &channel(Disposition::Abort), 0)
            .unwrap();
        assert!(outcome.abort_run);

        let outcome = connection
            .call_routine(0, 2, &channel(Disposition::Continue), 0)
            .unwrap();
        assert!(!outcome.ran_to_completion);

        assert!(matches!(
            connection.call_routine(0, 3, &channel(Disposition::Continue), 0),
            Err(ConnectionError::EntryPointNotFound {
                fixture_key: 0,
                routine_key: 3
            })
        ));
    }

    #[test]
    fn elevated_irql_is_restored() {
        let registry = ConnectionRegistry::new();
        let handle = DriverConnection::connect(
            &registry,
            0x1000,
            SINK_VERSION_3,
            Duration::from_secs(5),
            |_| {
                ModuleBuilder::new("driver")
                    .fixture(FixtureBuilder::new("F").test_case("LeavesRaised", || {
                        irql::raise(Irql::DISPATCH);
                    }))
                    .build()
            },
        )
        .unwrap();

        let channel = channel(Disposition::Continue);
        let outcome = handle.connection().call_routine(0, 0, &channel, 0).unwrap();
        assert!(outcome.ran_to_completion);
        assert_eq!(irql::current(), Irql::PASSIVE);

        let events = channel.take_events();
        let events: Vec<_> = EventReader::new(events.as_bytes())
            .map(|event| event.unwrap().event)
            .collect();
        assert!(matches!(
            &events[..],
            [ExecutionEvent::Log(message)] if message.message.contains("DISPATCH_LEVEL")
        ));
    }

    #[test]
    fn system_threads_are_joined() {
        let finished = Arc::new(AtomicU32::new(0));
        let registry = ConnectionRegistry::new();
        let handle = DriverConnection::connect(
            &registry,
            0x1000,
            SINK_VERSION_3,
            Duration::from_secs(5),
            |sink| {
                let finished = finished.clone();
                ModuleBuilder::new("driver")
                    .fixture(FixtureBuilder::new("F").test_case("Threads", move || {
                        let finished = finished.clone();
                        let reporter = sink.clone();
                        sink.create_system_thread(move || {
                            std::thread::sleep(Duration::from_millis(50));
                            finished.fetch_add(1, Ordering::SeqCst);
                            reporter.report_failed_assertion("f.rs", "worker", 1, "worker");
                        })
                        .unwrap();
                    }))
                    .build()
            },
        )
        .unwrap();

        let channel = channel(Disposition::Break);
        let outcome = handle.connection().call_routine(0, 0, &channel, 0).unwrap();
        assert_eq!(finished.load(Ordering::SeqCst), 1);
        assert!(!outcome.ran_to_completion);
        assert_eq!(channel.take_events().event_count(), 1);
    }

    #[test]
    fn disconnect_waits_for_calls_in_flight() {
        let (started_send, started_recv) = mpsc::channel();
        let returned = Arc::new(AtomicBool::new(false));
        let registry = ConnectionRegistry::new();
        let handle = DriverConnection::connect(
            &registry,
            0x1000,
            SINK_VERSION_3,
            Duration::from_secs(5),
            |_| {
                let returned = returned.clone();
                ModuleBuilder::new("driver")
                    .fixture(FixtureBuilder::new("F").test_case("Sleep", move || {
                        started_send.send(()).unwrap();
                        std::thread::sleep(Duration::from_millis(200));
                        returned.store(true, Ordering::SeqCst);
                    }))
                    .build()
            },
        )
        .unwrap();

        let connection = registry.lookup(0x1000).unwrap();
        let caller = std::thread::spawn(move || {
            connection
                .call_routine(0, 0, &channel(Disposition::Continue), 0)
                .unwrap();
            connection
        });

        started_recv.recv().unwrap();
        let start = Instant::now();
        handle.disconnect();
        assert!(returned.load(Ordering::SeqCst));
        assert!(start.elapsed() >= Duration::from_millis(100));

        let connection = caller.join().unwrap();
        assert!(!connection.is_available());
        assert!(matches!(
            connection.call_routine(0, 0, &channel(Disposition::Continue), 0),
            Err(ConnectionError::Unavailable)
        ));
        // Still registered while the caller holds a reference.
        assert!(registry.lookup(0x1000).is_ok());
        drop(connection);
        assert!(matches!(
            registry.lookup(0x1000),
            Err(RegistryError::NotFound(0x1000))
        ));
    }
}
