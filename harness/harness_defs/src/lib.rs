// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Definitions shared by the fixture execution engine, the kernel shim and
//! the user-mode clients that talk to the shim.
//!
//! Everything in this crate is plain data: closed enums, flag words, version
//! tags, and the byte layouts used on the shim's IOCTL surface.

#![no_std]
#![forbid(unsafe_code)]

pub mod catalog;
pub mod event;
pub mod ioctl;

use bitfield_struct::bitfield;
use thiserror::Error;

/// Version tag of the execution context callback contract. Contexts that
/// report a different version are rejected.
pub const EXECUTION_CONTEXT_VERSION: u32 = 0x0001_0000;

/// Initial report sink interface: failed assertions, `u32` comparisons,
/// inconclusiveness and logging.
pub const SINK_VERSION_1: u32 = 0x1000;

/// Adds formatted assertions, explicit failure and per-test values.
pub const SINK_VERSION_2: u32 = 0x2000;

/// Adds child thread creation.
pub const SINK_VERSION_3: u32 = 0x3000;

/// A raw value could not be converted into one of the closed enums.
#[derive(Debug, Error)]
#[error("invalid {kind} value {value:#x}")]
pub struct InvalidValue {
    kind: &'static str,
    value: u32,
}

/// The reaction requested by the execution context for a reported event.
#[repr(u32)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Disposition {
    /// Keep running the routine.
    Continue = 0,
    /// Break into the debugger if one is attached, otherwise fail the
    /// routine.
    Break = 1,
    /// Break, whether or not a debugger is attached.
    BreakAlways = 2,
    /// Fail the routine and abort the run.
    Abort = 3,
}

impl TryFrom<u32> for Disposition {
    type Error = InvalidValue;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => Self::Continue,
            1 => Self::Break,
            2 => Self::BreakAlways,
            3 => Self::Abort,
            _ => {
                return Err(InvalidValue {
                    kind: "disposition",
                    value,
                });
            }
        })
    }
}

/// Kinds of execution events.
#[repr(u32)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum EventType {
    /// An assertion in test code did not hold.
    FailedAssertion = 0,
    /// Test code panicked outside of the assertion machinery.
    UncaughtException = 1,
    /// Test code could not decide the outcome.
    Inconclusiveness = 2,
    /// Informational message.
    Log = 3,
}

impl TryFrom<u32> for EventType {
    type Error = InvalidValue;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => Self::FailedAssertion,
            1 => Self::UncaughtException,
            2 => Self::Inconclusiveness,
            3 => Self::Log,
            _ => {
                return Err(InvalidValue {
                    kind: "event type",
                    value,
                });
            }
        })
    }
}

/// Role of a routine within a fixture.
#[repr(u32)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum EntryType {
    /// Runs once before the first test case.
    Setup = 1,
    /// Runs once after the last test case.
    Teardown = 2,
    /// A test case.
    TestCase = 3,
    /// Runs before every test case.
    Before = 4,
    /// Runs after every test case.
    After = 5,
}

impl TryFrom<u32> for EntryType {
    type Error = InvalidValue;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Ok(match value {
            1 => Self::Setup,
            2 => Self::Teardown,
            3 => Self::TestCase,
            4 => Self::Before,
            5 => Self::After,
            _ => {
                return Err(InvalidValue {
                    kind: "entry type",
                    value,
                });
            }
        })
    }
}

/// Short-circuit policy of a fixture execution.
#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct ExecutionFlags {
    /// Skip the remaining test cases of a fixture once one of them failed.
    pub short_circuit_fixture_on_failure: bool,
    /// Abort the run when a setup routine fails.
    pub short_circuit_run_on_setup_failure: bool,
    /// Abort the run on any routine failure.
    pub short_circuit_run_on_failure: bool,
    /// Let a short-circuited fixture fail the run.
    pub escalate_fixture_failures: bool,
    #[bits(28)]
    _reserved: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disposition_values_round_trip() {
        for raw in 0..4 {
            let disposition = Disposition::try_from(raw).unwrap();
            assert_eq!(disposition as u32, raw);
        }
        assert!(Disposition::try_from(4).is_err());
    }

    #[test]
    fn entry_type_rejects_terminator() {
        assert!(EntryType::try_from(0).is_err());
        assert_eq!(EntryType::try_from(5).unwrap(), EntryType::After);
    }

    #[test]
    fn execution_flags_bits() {
        let flags = ExecutionFlags::new()
            .with_short_circuit_fixture_on_failure(true)
            .with_escalate_fixture_failures(true);
        assert_eq!(flags.into_bits(), 0b1001);
        assert!(!ExecutionFlags::from_bits(0b0100).short_circuit_fixture_on_failure());
        assert!(ExecutionFlags::from_bits(0b0100).short_circuit_run_on_failure());
    }
}
