// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Control codes and request/response layouts of the kernel shim device.

use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

const FILE_DEVICE_UNKNOWN: u32 = 0x22;
const METHOD_BUFFERED: u32 = 0;
const FILE_READ_WRITE_DATA: u32 = 3;

const fn ctl_code(function: u32) -> u32 {
    (FILE_DEVICE_UNKNOWN << 16) | (FILE_READ_WRITE_DATA << 14) | (function << 2) | METHOD_BUFFERED
}

/// Serialize the catalog of a connected driver.
///
/// Input: [`QueryTestModuleRequest`]. Output: a serialized module (see
/// [`crate::catalog`]) or, with a buffer-overflow status,
/// [`QueryTestModuleOverflow`].
pub const IOCTL_QUERY_TEST_MODULE: u32 = ctl_code(0x801);

/// List the load addresses of all connected drivers.
///
/// Input: none. Output: [`GetTestModulesHeader`] followed by `u64` load
/// addresses.
pub const IOCTL_GET_TEST_MODULES: u32 = ctl_code(0x802);

/// Run one routine of a connected driver.
///
/// Input: [`CallRoutineRequest`]. Output: [`CallRoutineResponse`] followed by
/// event records (see [`crate::event`]).
pub const IOCTL_CALL_ROUTINE: u32 = ctl_code(0x803);

/// Request for [`IOCTL_QUERY_TEST_MODULE`].
#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct QueryTestModuleRequest {
    /// Load address of the driver.
    pub driver_base_address: u64,
}

/// Written instead of the module when the output buffer is too small.
#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct QueryTestModuleOverflow {
    /// Output buffer size needed to hold the module.
    pub size_required: u32,
}

/// Response header for [`IOCTL_GET_TEST_MODULES`].
#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct GetTestModulesHeader {
    /// Number of addresses written, or the number available if the buffer
    /// overflowed.
    pub count: u32,
    /// Must be zero.
    pub reserved: u32,
}

/// Request for [`IOCTL_CALL_ROUTINE`].
#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct CallRoutineRequest {
    /// Load address of the driver.
    pub driver_base_address: u64,
    /// Fixture key from the serialized module.
    pub fixture_key: u16,
    /// Routine key from the serialized module.
    pub routine_key: u16,
    /// [`crate::Disposition`] for failed assertions.
    pub failed_assertion_disposition: u32,
    /// [`crate::Disposition`] for uncaught exceptions.
    pub unhandled_exception_disposition: u32,
    /// Must be zero.
    pub reserved: u32,
    /// Initial per-test value, handed back in the response.
    pub tls_value: u64,
}

/// Set in [`CallRoutineResponse::event_flags`] when events were dropped.
pub const CALL_ROUTINE_FLAG_EVENTS_TRUNCATED: u32 = 1;

/// Response header for [`IOCTL_CALL_ROUTINE`].
#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct CallRoutineResponse {
    /// Non-zero if the routine ran to completion.
    pub routine_ran_to_completion: u8,
    /// Non-zero if the run must be aborted.
    pub abort_run: u8,
    /// Must be zero.
    pub reserved: u16,
    /// Number of event records following the header.
    pub event_count: u32,
    /// `CALL_ROUTINE_FLAG_*` bits.
    pub event_flags: u32,
    /// Must be zero.
    pub reserved2: u32,
    /// Per-test value after the routine ran.
    pub tls_value: u64,
}

static_assertions::const_assert_eq!(size_of::<CallRoutineRequest>(), 32);
static_assertions::const_assert_eq!(size_of::<CallRoutineResponse>(), 24);
static_assertions::const_assert_eq!(size_of::<GetTestModulesHeader>(), 8);
