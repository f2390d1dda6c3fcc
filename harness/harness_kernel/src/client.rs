// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! User-mode client of the shim.
//!
//! Turns the catalog of a connected driver into a [`Module`] whose routines
//! call into the driver, so that kernel fixtures run through the same
//! [`FixtureExecutionAction`](harness_core::FixtureExecutionAction) as
//! user-mode ones. Events reported by the driver are forwarded to the
//! execution context of the calling routine.

use crate::adapter::CatalogParseError;
use crate::adapter::ModuleDescription;
use crate::adapter::parse_module;
use crate::event_buffer::EventReader;
use crate::ioctl::IoStatus;
use crate::ioctl::IoctlError;
use crate::shim::KernelShim;
use harness_core::EventType;
use harness_core::FilamentBinder;
use harness_core::FilamentRegistry;
use harness_core::catalog::FixtureBuilder;
use harness_core::catalog::Module;
use harness_core::catalog::ModuleBuilder;
use harness_core::event::ExecutionEvent;
use harness_core::event::MessageEvent;
use harness_core::filament::CurrentThread;
use harness_core::filament::ValueTag;
use harness_core::signal;
use harness_core::signal::Signal;
use harness_defs::EntryType;
use harness_defs::ioctl::CALL_ROUTINE_FLAG_EVENTS_TRUNCATED;
use harness_defs::ioctl::CallRoutineRequest;
use harness_defs::ioctl::CallRoutineResponse;
use harness_defs::ioctl::GetTestModulesHeader;
use harness_defs::ioctl::IOCTL_CALL_ROUTINE;
use harness_defs::ioctl::IOCTL_GET_TEST_MODULES;
use harness_defs::ioctl::IOCTL_QUERY_TEST_MODULE;
use harness_defs::ioctl::QueryTestModuleOverflow;
use harness_defs::ioctl::QueryTestModuleRequest;
use std::sync::Arc;
use thiserror::Error;
use zerocopy::FromBytes;
use zerocopy::IntoBytes;

const DEFAULT_EVENT_BUFFER_SIZE: usize = 64 * 1024;
const INITIAL_CATALOG_SIZE: usize = 1024;
const MAX_QUERY_ATTEMPTS: usize = 4;

/// Errors talking to the shim from user mode.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The shim rejected a control request.
    #[error("device control failed")]
    Ioctl(#[from] IoctlError),
    /// The serialized catalog of a driver could not be decoded.
    #[error("malformed test module")]
    Catalog(#[from] CatalogParseError),
    /// A response header or event record is inconsistent.
    #[error("malformed response: {0}")]
    Response(&'static str),
}

/// Runs the fixtures of connected drivers from user mode.
#[derive(Clone)]
pub struct KernelClient {
    shim: KernelShim,
    registry: FilamentRegistry,
    event_buffer_size: usize,
}

impl KernelClient {
    /// Creates a client of `shim` binding routine threads in the global
    /// filament registry.
    pub fn new(shim: KernelShim) -> Self {
        Self {
            shim,
            registry: FilamentRegistry::global().clone(),
            event_buffer_size: DEFAULT_EVENT_BUFFER_SIZE,
        }
    }

    /// Looks up routine threads in `registry` instead of the global
    /// registry. Must match the registry the fixtures are run with.
    pub fn with_registry(mut self, registry: FilamentRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Space for the events of a single routine call.
    pub fn with_event_buffer_size(mut self, size: usize) -> Self {
        self.event_buffer_size = size;
        self
    }

    /// Load addresses of the connected drivers.
    pub fn test_modules(&self) -> Result<Vec<u64>, ClientError> {
        let header_size = size_of::<GetTestModulesHeader>();
        let mut slots = 4;
        for _ in 0..MAX_QUERY_ATTEMPTS {
            let mut output = vec![0u8; header_size + slots * size_of::<u64>()];
            let completion = self
                .shim
                .device_control(IOCTL_GET_TEST_MODULES, &[], &mut output)?;
            let (header, body) = GetTestModulesHeader::read_from_prefix(&output)
                .map_err(|_| ClientError::Response("module list header"))?;
            if completion.status == IoStatus::Success {
                return body
                    .chunks_exact(size_of::<u64>())
                    .take(header.count as usize)
                    .map(|address| {
                        u64::read_from_bytes(address)
                            .map_err(|_| ClientError::Response("module list"))
                    })
                    .collect();
            }
            slots = header.count as usize;
        }
        Err(ClientError::Response("module list keeps growing"))
    }

    /// Queries and decodes the catalog of the driver at `load_address`.
    pub fn query_module(&self, load_address: u64) -> Result<ModuleDescription, ClientError> {
        let request = QueryTestModuleRequest {
            driver_base_address: load_address,
        };
        let mut size = INITIAL_CATALOG_SIZE;
        for _ in 0..MAX_QUERY_ATTEMPTS {
            let mut output = vec![0u8; size];
            let completion =
                self.shim
                    .device_control(IOCTL_QUERY_TEST_MODULE, request.as_bytes(), &mut output)?;
            match completion.status {
                IoStatus::Success => return Ok(parse_module(&output[..completion.bytes_written])?),
                IoStatus::BufferOverflow => {
                    let (overflow, _) = QueryTestModuleOverflow::read_from_prefix(&output)
                        .map_err(|_| ClientError::Response("required size"))?;
                    tracing::debug!(
                        load_address = format_args!("{load_address:#x}"),
                        size_required = overflow.size_required,
                        "catalog buffer too small, retrying"
                    );
                    size = overflow.size_required as usize;
                }
            }
        }
        Err(ClientError::Response("catalog keeps growing"))
    }

    /// Builds a module named `name` that runs the fixtures of the driver at
    /// `load_address`.
    pub fn load_module(&self, load_address: u64, name: &str) -> Result<Arc<Module>, ClientError> {
        let description = self.query_module(load_address)?;
        let mut module = ModuleBuilder::new(name);
        for fixture in description.fixtures {
            let mut builder = FixtureBuilder::new(fixture.name);
            for entry in fixture.entries {
                let routine = RemoteRoutine {
                    client: self.clone(),
                    load_address,
                    fixture_key: fixture.key,
                    routine_key: entry.key,
                };
                let call = move || routine.call();
                builder = match entry.entry_type {
                    EntryType::Setup => builder.setup(call),
                    EntryType::Teardown => builder.teardown(call),
                    EntryType::Before => builder.before(call),
                    EntryType::After => builder.after(call),
                    EntryType::TestCase => builder.test_case(entry.name, call),
                };
            }
            module = module.fixture(builder);
        }
        Ok(module.build())
    }
}

/// One driver routine, called from a user-mode routine thread.
struct RemoteRoutine {
    client: KernelClient,
    load_address: u64,
    fixture_key: u16,
    routine_key: u16,
}

impl RemoteRoutine {
    fn call(&self) {
        let current = match self.client.registry.get_current(false) {
            Ok(current) => current,
            Err(err) => {
                tracing::error!(
                    error = &err as &dyn std::error::Error,
                    "driver routine called outside of a routine thread"
                );
                signal::raise(Signal::ThreadTerminated)
            }
        };

        let response = match self.call_driver(&current) {
            Ok(response) => response,
            Err(err) => {
                tracing::error!(
                    load_address = format_args!("{:#x}", self.load_address),
                    fixture_key = self.fixture_key,
                    routine_key = self.routine_key,
                    error = &err as &dyn std::error::Error,
                    "driver routine call failed"
                );
                report(&current, format!("Calling the driver routine failed: {err}"));
                signal::raise(Signal::TestFailed)
            }
        };

        if response.abort_run != 0 {
            signal::raise(Signal::TestFailedAbort);
        }
        if response.routine_ran_to_completion == 0 {
            signal::raise(Signal::TestFailed);
        }
    }

    fn call_driver(&self, current: &CurrentThread) -> Result<CallRoutineResponse, ClientError> {
        let context = current.filament.context();
        let thread = &current.identity;
        let request = CallRoutineRequest {
            driver_base_address: self.load_address,
            fixture_key: self.fixture_key,
            routine_key: self.routine_key,
            failed_assertion_disposition: context
                .query_default_disposition(thread, EventType::FailedAssertion)
                as u32,
            unhandled_exception_disposition: context
                .query_default_disposition(thread, EventType::UncaughtException)
                as u32,
            reserved: 0,
            tls_value: current.filament.get_value(ValueTag::Default),
        };

        let mut output =
            vec![0u8; size_of::<CallRoutineResponse>() + self.client.event_buffer_size];
        let completion =
            self.client
                .shim
                .device_control(IOCTL_CALL_ROUTINE, request.as_bytes(), &mut output)?;
        let (response, events) =
            CallRoutineResponse::read_from_prefix(&output[..completion.bytes_written])
                .map_err(|_| ClientError::Response("call routine header"))?;
        current
            .filament
            .set_value(ValueTag::Default, response.tls_value);

        for event in EventReader::new(events) {
            match event {
                Ok(decoded) => {
                    context.report_event(thread, &decoded.event);
                }
                Err(err) => {
                    tracing::warn!(
                        error = &err as &dyn std::error::Error,
                        "malformed event from driver"
                    );
                    report(current, format!("Malformed event from driver: {err}"));
                }
            }
        }
        if response.event_flags & CALL_ROUTINE_FLAG_EVENTS_TRUNCATED != 0 {
            report(
                current,
                format!(
                    "Event buffer full, only the first {} events were delivered",
                    response.event_count
                ),
            );
        }
        Ok(response)
    }
}

fn report(current: &CurrentThread, message: String) {
    current.filament.context().report_event(
        &current.identity,
        &ExecutionEvent::Log(MessageEvent::new(message)),
    );
}
