// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Layout of a serialized test module, as returned by `QueryTestModule`.
//!
//! The buffer holds all records first and all strings after them:
//!
//! ```text
//! ModuleRecord
//! u32 fixture offsets[fixture_count]
//! FixtureRecord, EntryRecord[entry_count]   (per fixture)
//! ...
//! strings (UTF-8, not terminated)
//! ```
//!
//! All offsets are relative to the start of the buffer.

use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

/// Module header.
#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct ModuleRecord {
    /// Number of fixture offsets that follow.
    pub fixture_count: u32,
}

/// Fixture header, followed by `entry_count` entry records.
#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct FixtureRecord {
    /// Key to pass as `fixture_key` to `CallRoutine`.
    pub key: u16,
    /// Number of entry records that follow.
    pub entry_count: u16,
    /// Offset of the fixture name.
    pub name_offset: u32,
    /// Length of the fixture name in bytes.
    pub name_length: u32,
}

/// One routine of a fixture.
#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct EntryRecord {
    /// A [`crate::EntryType`] value.
    pub entry_type: u32,
    /// Key to pass as `routine_key` to `CallRoutine`.
    pub key: u16,
    /// Must be zero.
    pub reserved: u16,
    /// Offset of the routine name.
    pub name_offset: u32,
    /// Length of the routine name in bytes.
    pub name_length: u32,
}

static_assertions::const_assert_eq!(size_of::<ModuleRecord>(), 4);
static_assertions::const_assert_eq!(size_of::<FixtureRecord>(), 12);
static_assertions::const_assert_eq!(size_of::<EntryRecord>(), 16);
