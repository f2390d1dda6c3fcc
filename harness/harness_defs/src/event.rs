// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Layout of the event records the kernel shim appends to a `CallRoutine`
//! response.
//!
//! Each record starts with an [`EventHeader`], followed by the fixed body for
//! its event type and then the record's strings. String references are
//! relative to the start of the record. Records are padded to
//! [`EVENT_ALIGNMENT`].

use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

/// Every record starts on an 8-byte boundary.
pub const EVENT_ALIGNMENT: usize = 8;

/// Alignment mask for records.
pub const EVENT_ALIGNMENT_MASK: usize = EVENT_ALIGNMENT - 1;

/// Maximum number of stack frames carried by a record.
pub const MAX_STACK_FRAMES: usize = 32;

/// Maximum length of a single string within a record, in bytes.
pub const MAX_STRING_LENGTH: usize = 0xffff;

/// Common record header.
#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct EventHeader {
    /// A [`crate::EventType`] value.
    pub event_type: u32,
    /// Size of the whole record including header, body, strings and padding.
    pub size: u32,
}

/// Location of a string inside a record.
#[repr(C)]
#[derive(Debug, Copy, Clone, Default, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct StringRef {
    /// Offset from the start of the record.
    pub offset: u32,
    /// Length in bytes. Zero for absent strings.
    pub length: u32,
}

/// Body of a failed assertion record.
#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct FailedAssertionRecord {
    /// Source line of the assertion.
    pub line: u32,
    /// Number of frames in `stack_trace`.
    pub frame_count: u32,
    /// Source file.
    pub file: StringRef,
    /// Enclosing routine.
    pub routine: StringRef,
    /// The expression or message that failed.
    pub expression: StringRef,
    /// Newline-separated stack frames.
    pub stack_trace: StringRef,
}

/// Body of uncaught exception, inconclusiveness and log records.
#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct MessageRecord {
    /// Must be zero.
    pub reserved: u32,
    /// Number of frames in `stack_trace`.
    pub frame_count: u32,
    /// The message.
    pub message: StringRef,
    /// Newline-separated stack frames.
    pub stack_trace: StringRef,
}

/// Size of the largest fixed part (header and body) of any record.
pub const MAX_FIXED_RECORD_SIZE: usize = size_of::<EventHeader>() + size_of::<FailedAssertionRecord>();

static_assertions::const_assert_eq!(size_of::<EventHeader>(), 8);
static_assertions::const_assert_eq!(size_of::<FailedAssertionRecord>(), 40);
static_assertions::const_assert_eq!(size_of::<MessageRecord>(), 24);
static_assertions::const_assert_eq!(MAX_FIXED_RECORD_SIZE % EVENT_ALIGNMENT, 0);
