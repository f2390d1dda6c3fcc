// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Device control dispatch of the shim.

use crate::channel::Dispositions;
use crate::channel::ReportChannel;
use crate::connection::ConnectionError;
use crate::registry::RegistryError;
use crate::shim::KernelShim;
use harness_defs::Disposition;
use harness_defs::ioctl::CALL_ROUTINE_FLAG_EVENTS_TRUNCATED;
use harness_defs::ioctl::CallRoutineRequest;
use harness_defs::ioctl::CallRoutineResponse;
use harness_defs::ioctl::GetTestModulesHeader;
use harness_defs::ioctl::IOCTL_CALL_ROUTINE;
use harness_defs::ioctl::IOCTL_GET_TEST_MODULES;
use harness_defs::ioctl::IOCTL_QUERY_TEST_MODULE;
use harness_defs::ioctl::QueryTestModuleOverflow;
use harness_defs::ioctl::QueryTestModuleRequest;
use thiserror::Error;
use zerocopy::FromBytes;
use zerocopy::IntoBytes;

/// Errors completing a control request.
#[derive(Debug, Error)]
pub enum IoctlError {
    /// An input or output buffer has the wrong size or contents.
    #[error("invalid parameter: {0}")]
    InvalidParameter(&'static str),
    /// The control code is not one the shim handles.
    #[error("unknown control code {0:#x}")]
    InvalidDeviceRequest(u32),
    /// No driver is connected at the requested address.
    #[error("driver lookup failed")]
    Registry(#[from] RegistryError),
    /// The routine could not be called.
    #[error("routine call failed")]
    Connection(#[from] ConnectionError),
}

/// Completion status of a successful request.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum IoStatus {
    /// The output holds the complete result.
    Success,
    /// The output holds a partial result; see the request's documentation
    /// for what was written.
    BufferOverflow,
}

/// Status and output size of a completed request.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct IoctlCompletion {
    /// Whether the output is complete.
    pub status: IoStatus,
    /// Bytes written to the output buffer.
    pub bytes_written: usize,
}

impl IoctlCompletion {
    fn success(bytes_written: usize) -> Self {
        Self {
            status: IoStatus::Success,
            bytes_written,
        }
    }

    fn overflow(bytes_written: usize) -> Self {
        Self {
            status: IoStatus::BufferOverflow,
            bytes_written,
        }
    }
}

fn read_request<T: FromBytes>(input: &[u8]) -> Result<T, IoctlError> {
    T::read_from_prefix(input)
        .map(|(request, _)| request)
        .map_err(|_| IoctlError::InvalidParameter("input buffer too small"))
}

fn disposition(value: u32) -> Result<Disposition, IoctlError> {
    Disposition::try_from(value).map_err(|_| IoctlError::InvalidParameter("disposition"))
}

impl KernelShim {
    /// Handles a device control request from user mode.
    pub fn device_control(
        &self,
        code: u32,
        input: &[u8],
        output: &mut [u8],
    ) -> Result<IoctlCompletion, IoctlError> {
        let result = match code {
            IOCTL_QUERY_TEST_MODULE => self.query_test_module(input, output),
            IOCTL_GET_TEST_MODULES => self.get_test_modules(output),
            IOCTL_CALL_ROUTINE => self.call_routine(input, output),
            _ => Err(IoctlError::InvalidDeviceRequest(code)),
        };
        if let Err(err) = &result {
            tracing::debug!(
                code = format_args!("{code:#x}"),
                error = err as &dyn std::error::Error,
                "device control failed"
            );
        }
        result
    }

    fn query_test_module(&self, input: &[u8], output: &mut [u8]) -> Result<IoctlCompletion, IoctlError> {
        let request: QueryTestModuleRequest = read_request(input)?;
        let connection = self.registry().lookup(request.driver_base_address)?;
        let adapter = connection.adapter();
        match adapter.serialize(output) {
            Ok(written) => Ok(IoctlCompletion::success(written)),
            Err(err) => {
                let overflow = QueryTestModuleOverflow {
                    size_required: err.required as u32,
                };
                overflow
                    .write_to_prefix(output)
                    .map_err(|_| IoctlError::InvalidParameter("output buffer too small"))?;
                Ok(IoctlCompletion::overflow(size_of::<QueryTestModuleOverflow>()))
            }
        }
    }

    fn get_test_modules(&self, output: &mut [u8]) -> Result<IoctlCompletion, IoctlError> {
        let header_size = size_of::<GetTestModulesHeader>();
        if output.len() < header_size + size_of::<u64>() {
            return Err(IoctlError::InvalidParameter("output buffer too small"));
        }

        let mut addresses = vec![0u64; (output.len() - header_size) / size_of::<u64>()];
        let list = self.registry().driver_connections(&mut addresses);
        let written = &addresses[..list.written];
        let (header, body) = output.split_at_mut(header_size);
        body[..written.as_bytes().len()].copy_from_slice(written.as_bytes());

        // On overflow the count tells the caller how many slots to provide.
        GetTestModulesHeader {
            count: list.available as u32,
            reserved: 0,
        }
        .write_to(header)
        .map_err(|_| IoctlError::InvalidParameter("output buffer too small"))?;
        let bytes_written = header_size + written.as_bytes().len();
        if list.is_complete() {
            Ok(IoctlCompletion::success(bytes_written))
        } else {
            Ok(IoctlCompletion::overflow(bytes_written))
        }
    }

    fn call_routine(&self, input: &[u8], output: &mut [u8]) -> Result<IoctlCompletion, IoctlError> {
        let request: CallRoutineRequest = read_request(input)?;
        if request.driver_base_address == 0 {
            return Err(IoctlError::InvalidParameter("driver base address"));
        }
        let dispositions = Dispositions {
            failed_assertion: disposition(request.failed_assertion_disposition)?,
            unhandled_exception: disposition(request.unhandled_exception_disposition)?,
        };
        let header_size = size_of::<CallRoutineResponse>();
        if output.len() < header_size {
            return Err(IoctlError::InvalidParameter("output buffer too small"));
        }

        let connection = self.registry().lookup(request.driver_base_address)?;
        let channel = ReportChannel::new(dispositions, output.len() - header_size);
        let outcome = connection.call_routine(
            request.fixture_key,
            request.routine_key,
            &channel,
            request.tls_value,
        )?;
        drop(connection);

        let events = channel.take_events();
        if events.is_truncated() {
            tracing::warn!(
                fixture_key = request.fixture_key,
                routine_key = request.routine_key,
                event_count = events.event_count(),
                "routine events truncated"
            );
        }
        let response = CallRoutineResponse {
            routine_ran_to_completion: outcome.ran_to_completion.into(),
            abort_run: outcome.abort_run.into(),
            reserved: 0,
            event_count: events.event_count(),
            event_flags: if events.is_truncated() {
                CALL_ROUTINE_FLAG_EVENTS_TRUNCATED
            } else {
                0
            },
            reserved2: 0,
            tls_value: outcome.tls_value,
        };
        let (header, body) = output.split_at_mut(header_size);
        header.copy_from_slice(response.as_bytes());
        body[..events.len()].copy_from_slice(events.as_bytes());
        Ok(IoctlCompletion::success(header_size + events.len()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DriverHandle;
    use crate::ReportSink;
    use crate::adapter::parse_module;
    use crate::event_buffer::EventReader;
    use harness_core::catalog::FixtureBuilder;
    use harness_core::catalog::ModuleBuilder;
    use harness_core::event::ExecutionEvent;
    use harness_defs::SINK_VERSION_2;

    fn shim_with_driver() -> (KernelShim, DriverHandle) {
        let shim = KernelShim::new();
        let handle = shim
            .connect_driver(0x1000, SINK_VERSION_2, |sink| {
                ModuleBuilder::new("driver")
                    .fixture(
                        FixtureBuilder::new("Chatty")
                            .test_case("Logs", {
                                let sink = sink.clone();
                                move || {
                                    for i in 0..100 {
                                        sink.report_log(format_args!("log line {i}"));
                                    }
                                }
                            })
                            .test_case("Asserts", move || {
                                sink.report_failed_assertion("f.rs", "Asserts", 7, "x == y");
                            }),
                    )
                    .build()
            })
            .unwrap();
        (shim, handle)
    }

    fn call_request(routine_key: u16, disposition: Disposition) -> CallRoutineRequest {
        CallRoutineRequest {
            driver_base_address: 0x1000,
            fixture_key: 0,
            routine_key,
            failed_assertion_disposition: disposition as u32,
            unhandled_exception_disposition: disposition as u32,
            reserved: 0,
            tls_value: 5,
        }
    }

    #[test]
    fn query_test_module_overflow_then_success() {
        let (shim, _handle) = shim_with_driver();
        let request = QueryTestModuleRequest {
            driver_base_address: 0x1000,
        };

        let mut small = [0u8; 8];
        let completion = shim
            .device_control(IOCTL_QUERY_TEST_MODULE, request.as_bytes(), &mut small)
            .unwrap();
        assert_eq!(completion.status, IoStatus::BufferOverflow);
        let (overflow, _) = QueryTestModuleOverflow::read_from_prefix(&small).unwrap();
        let required = overflow.size_required as usize;
        assert!(required > small.len());

        let mut output = vec![0; required];
        let completion = shim
            .device_control(IOCTL_QUERY_TEST_MODULE, request.as_bytes(), &mut output)
            .unwrap();
        assert_eq!(completion, IoctlCompletion::success(required));
        let module = parse_module(&output).unwrap();
        assert_eq!(module.fixtures[0].name, "Chatty");
        assert_eq!(module.fixtures[0].entries.len(), 2);

        let missing = QueryTestModuleRequest {
            driver_base_address: 0x2000,
        };
        assert!(matches!(
            shim.device_control(IOCTL_QUERY_TEST_MODULE, missing.as_bytes(), &mut output),
            Err(IoctlError::Registry(RegistryError::NotFound(0x2000)))
        ));
    }

    #[test]
    fn get_test_modules_overflow() {
        let shim = KernelShim::new();
        let module = |_: ReportSink| {
            ModuleBuilder::new("driver")
                .fixture(FixtureBuilder::new("F").test_case("A", || {}))
                .build()
        };
        let _handles: Vec<_> = [0x1000, 0x2000, 0x3000]
            .into_iter()
            .map(|address| shim.connect_driver(address, SINK_VERSION_2, module).unwrap())
            .collect();

        let mut output = [0u8; 8 + 2 * 8];
        let completion = shim
            .device_control(IOCTL_GET_TEST_MODULES, &[], &mut output)
            .unwrap();
        assert_eq!(completion, IoctlCompletion::overflow(output.len()));
        let (header, rest) = GetTestModulesHeader::read_from_prefix(&output).unwrap();
        assert_eq!(header.count, 3);
        let (first, _) = u64::read_from_prefix(rest).unwrap();
        assert_eq!(first, 0x1000);

        let mut output = [0u8; 8 + 4 * 8];
        let completion = shim
            .device_control(IOCTL_GET_TEST_MODULES, &[], &mut output)
            .unwrap();
        assert_eq!(completion, IoctlCompletion::success(8 + 3 * 8));

        let mut tiny = [0u8; 8];
        assert!(matches!(
            shim.device_control(IOCTL_GET_TEST_MODULES, &[], &mut tiny),
            Err(IoctlError::InvalidParameter(_))
        ));
    }

    #[test]
    fn call_routine_response_and_events() {
        let (shim, _handle) = shim_with_driver();
        let mut output = vec![0u8; 4096];
        let completion = shim
            .device_control(
                IOCTL_CALL_ROUTINE,
                call_request(1, Disposition::Break).as_bytes(),
                &mut output,
            )
            .unwrap();
        assert_eq!(completion.status, IoStatus::Success);

        let (response, events) = CallRoutineResponse::read_from_prefix(&output).unwrap();
        assert_eq!(response.routine_ran_to_completion, 0);
        assert_eq!(response.abort_run, 0);
        assert_eq!(response.event_count, 1);
        assert_eq!(response.event_flags, 0);
        assert_eq!(response.tls_value, 5);

        let events = &events[..completion.bytes_written - size_of::<CallRoutineResponse>()];
        let events: Vec<_> = EventReader::new(events)
            .map(|event| event.unwrap().event)
            .collect();
        assert!(matches!(
            &events[..],
            [ExecutionEvent::FailedAssertion(assertion)]
                if assertion.line == 7 && assertion.expression == "x == y"
        ));
    }

    #[test]
    fn call_routine_truncates_events() {
        let (shim, _handle) = shim_with_driver();
        let mut output = vec![0u8; 512];
        let completion = shim
            .device_control(
                IOCTL_CALL_ROUTINE,
                call_request(0, Disposition::Continue).as_bytes(),
                &mut output,
            )
            .unwrap();

        let (response, events) = CallRoutineResponse::read_from_prefix(&output).unwrap();
        assert_eq!(response.routine_ran_to_completion, 1);
        assert_eq!(response.event_flags, CALL_ROUTINE_FLAG_EVENTS_TRUNCATED);
        assert!(response.event_count < 100);

        let length = completion.bytes_written - size_of::<CallRoutineResponse>();
        let mut count = 0;
        for event in EventReader::new(&events[..length]) {
            let event = event.unwrap();
            assert!(event.offset + event.size <= length);
            count += 1;
        }
        assert_eq!(count, response.event_count);
    }

    #[test]
    fn call_routine_validation() {
        let (shim, handle) = shim_with_driver();
        let mut output = vec![0u8; 256];

        let mut request = call_request(0, Disposition::Continue);
        request.failed_assertion_disposition = 4;
        assert!(matches!(
            shim.device_control(IOCTL_CALL_ROUTINE, request.as_bytes(), &mut output),
            Err(IoctlError::InvalidParameter("disposition"))
        ));

        let mut request = call_request(0, Disposition::Continue);
        request.driver_base_address = 0;
        assert!(matches!(
            shim.device_control(IOCTL_CALL_ROUTINE, request.as_bytes(), &mut output),
            Err(IoctlError::InvalidParameter(_))
        ));

        assert!(matches!(
            shim.device_control(IOCTL_CALL_ROUTINE, &[0; 4], &mut output),
            Err(IoctlError::InvalidParameter(_))
        ));

        assert!(matches!(
            shim.device_control(
                IOCTL_CALL_ROUTINE,
                call_request(9, Disposition::Continue).as_bytes(),
                &mut output
            ),
            Err(IoctlError::Connection(ConnectionError::EntryPointNotFound { .. }))
        ));

        assert!(matches!(
            shim.device_control(0x1234, &[], &mut output),
            Err(IoctlError::InvalidDeviceRequest(0x1234))
        ));

        drop(handle);
        assert!(matches!(
            shim.device_control(
                IOCTL_CALL_ROUTINE,
                call_request(0, Disposition::Continue).as_bytes(),
                &mut output
            ),
            Err(IoctlError::Registry(RegistryError::NotFound(0x1000)))
        ));
    }
}
