// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Routine table of a connected driver and its serialized form.
//!
//! Each fixture's routines are numbered in the order setup, before, after,
//! test cases, teardown, skipping the ones the fixture does not have. The
//! numbers are the routine keys user mode passes back to `CallRoutine`.

use harness_core::catalog::Module;
use harness_core::catalog::Routine;
use harness_defs::EntryType;
use harness_defs::InvalidValue;
use harness_defs::catalog::EntryRecord;
use harness_defs::catalog::FixtureRecord;
use harness_defs::catalog::ModuleRecord;
use thiserror::Error;
use zerocopy::FromBytes;
use zerocopy::IntoBytes;

/// Errors building a [`TestAdapter`] for a module.
#[derive(Debug, Error)]
pub enum AdapterError {
    /// Fixture keys are 16 bits wide.
    #[error("module has too many fixtures ({0})")]
    TooManyFixtures(usize),
    /// Routine keys are 16 bits wide.
    #[error("fixture {fixture} has too many routines ({count})")]
    TooManyRoutines {
        /// Name of the fixture.
        fixture: String,
        /// Number of routines it holds.
        count: usize,
    },
    /// Offsets in the serialized catalog are 32 bits wide.
    #[error("serialized module does not fit a 32-bit size")]
    TooLarge,
}

/// The catalog did not fit the output buffer.
#[derive(Debug, Error)]
#[error("output buffer too small, {required:#x} bytes required")]
pub struct BufferTooSmall {
    /// Size of the complete serialized catalog.
    pub required: usize,
}

struct AdapterEntry {
    entry_type: EntryType,
    name: String,
    routine: Routine,
}

struct AdapterFixture {
    name: String,
    entries: Vec<AdapterEntry>,
}

/// Maps fixture and routine keys to the routines of a driver's module.
pub struct TestAdapter {
    fixtures: Vec<AdapterFixture>,
    records_size: usize,
    strings_size: usize,
}

impl TestAdapter {
    /// Assigns keys to the fixtures and routines of `module`.
    pub fn new(module: &Module) -> Result<Self, AdapterError> {
        if module.fixtures().len() > u16::MAX as usize {
            return Err(AdapterError::TooManyFixtures(module.fixtures().len()));
        }

        let mut fixtures = Vec::with_capacity(module.fixtures().len());
        for fixture in module.fixtures() {
            let mut entries = Vec::new();
            let mut push = |entry_type, name: &str, routine: &Routine| {
                entries.push(AdapterEntry {
                    entry_type,
                    name: name.to_owned(),
                    routine: routine.clone(),
                })
            };
            if let Some(routine) = fixture.setup() {
                push(EntryType::Setup, "Setup", routine);
            }
            if let Some(routine) = fixture.before() {
                push(EntryType::Before, "Before", routine);
            }
            if let Some(routine) = fixture.after() {
                push(EntryType::After, "After", routine);
            }
            for test_case in fixture.test_cases() {
                push(EntryType::TestCase, test_case.name(), test_case.routine());
            }
            if let Some(routine) = fixture.teardown() {
                push(EntryType::Teardown, "Teardown", routine);
            }
            if entries.len() > u16::MAX as usize {
                return Err(AdapterError::TooManyRoutines {
                    fixture: fixture.name().to_owned(),
                    count: entries.len(),
                });
            }
            fixtures.push(AdapterFixture {
                name: fixture.name().to_owned(),
                entries,
            });
        }

        let records_size = size_of::<ModuleRecord>()
            + fixtures
                .iter()
                .map(|fixture| {
                    size_of::<u32>()
                        + size_of::<FixtureRecord>()
                        + fixture.entries.len() * size_of::<EntryRecord>()
                })
                .sum::<usize>();
        let strings_size = fixtures
            .iter()
            .map(|fixture| {
                fixture.name.len()
                    + fixture
                        .entries
                        .iter()
                        .map(|entry| entry.name.len())
                        .sum::<usize>()
            })
            .sum::<usize>();
        if records_size + strings_size > u32::MAX as usize {
            return Err(AdapterError::TooLarge);
        }

        Ok(Self {
            fixtures,
            records_size,
            strings_size,
        })
    }

    /// Number of fixtures in the module.
    pub fn fixture_count(&self) -> usize {
        self.fixtures.len()
    }

    /// The routine with the given keys, if both are in range.
    pub fn routine(&self, fixture_key: u16, routine_key: u16) -> Option<&Routine> {
        self.fixtures
            .get(fixture_key as usize)?
            .entries
            .get(routine_key as usize)
            .map(|entry| &entry.routine)
    }

    /// Size of the serialized module.
    pub fn required_size(&self) -> usize {
        self.records_size + self.strings_size
    }

    /// Serializes the module into `buffer` and returns the number of bytes
    /// written.
    pub fn serialize(&self, buffer: &mut [u8]) -> Result<usize, BufferTooSmall> {
        let required = self.required_size();
        if buffer.len() < required {
            return Err(BufferTooSmall { required });
        }
        let buffer = &mut buffer[..required];

        let mut writer = CatalogWriter {
            buffer,
            record_offset: 0,
            string_offset: self.records_size,
        };
        writer.put(
            ModuleRecord {
                fixture_count: self.fixtures.len() as u32,
            }
            .as_bytes(),
        );

        // The offset table comes first, so the fixture positions are known
        // up front.
        let mut fixture_offset = size_of::<ModuleRecord>() + self.fixtures.len() * size_of::<u32>();
        for fixture in &self.fixtures {
            writer.put((fixture_offset as u32).as_bytes());
            fixture_offset +=
                size_of::<FixtureRecord>() + fixture.entries.len() * size_of::<EntryRecord>();
        }

        for (key, fixture) in self.fixtures.iter().enumerate() {
            let (name_offset, name_length) = writer.put_string(&fixture.name);
            writer.put(
                FixtureRecord {
                    key: key as u16,
                    entry_count: fixture.entries.len() as u16,
                    name_offset,
                    name_length,
                }
                .as_bytes(),
            );
            for (key, entry) in fixture.entries.iter().enumerate() {
                let (name_offset, name_length) = writer.put_string(&entry.name);
                writer.put(
                    EntryRecord {
                        entry_type: entry.entry_type as u32,
                        key: key as u16,
                        reserved: 0,
                        name_offset,
                        name_length,
                    }
                    .as_bytes(),
                );
            }
        }
        Ok(required)
    }
}

struct CatalogWriter<'a> {
    buffer: &'a mut [u8],
    record_offset: usize,
    string_offset: usize,
}

impl CatalogWriter<'_> {
    fn put(&mut self, bytes: &[u8]) {
        self.buffer[self.record_offset..self.record_offset + bytes.len()].copy_from_slice(bytes);
        self.record_offset += bytes.len();
    }

    fn put_string(&mut self, s: &str) -> (u32, u32) {
        let offset = self.string_offset;
        self.buffer[offset..offset + s.len()].copy_from_slice(s.as_bytes());
        self.string_offset += s.len();
        (offset as u32, s.len() as u32)
    }
}

/// Errors that occur when decoding a serialized module.
#[derive(Debug, Error)]
pub enum CatalogParseError {
    /// A header or record is cut off by the end of the buffer.
    #[error("Failed to read from buffer slice")]
    SliceRead,
    /// An offset computation overflowed.
    #[error("Arithmetic overflow in {0}")]
    Overflow(&'static str),
    /// A record offset points past the buffer.
    #[error("offset {0:#x} exceeds buffer length {1:#x}")]
    BadOffset(usize, usize),
    /// A name runs past the buffer.
    #[error("string end ({0:#x}) exceeds buffer length ({1:#x})")]
    BadStringEnd(usize, usize),
    /// A name is not valid UTF-8.
    #[error("Failed to read UTF-8 string: {0}")]
    Utf8Error(#[from] std::str::Utf8Error),
    /// A routine entry carries an unknown type.
    #[error("invalid entry type")]
    EntryType(#[source] InvalidValue),
}

/// A decoded routine entry.
#[derive(Debug, Clone, PartialEq, Eq)]
#[expect(missing_docs)] // Self-describing names.
pub struct EntryDescription {
    pub entry_type: EntryType,
    pub key: u16,
    pub name: String,
}

/// A decoded fixture.
#[derive(Debug, Clone, PartialEq, Eq)]
#[expect(missing_docs)] // Self-describing names.
pub struct FixtureDescription {
    pub key: u16,
    pub name: String,
    pub entries: Vec<EntryDescription>,
}

/// A decoded module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleDescription {
    /// Fixtures in key order.
    pub fixtures: Vec<FixtureDescription>,
}

fn read_name(buffer: &[u8], offset: u32, length: u32) -> Result<String, CatalogParseError> {
    let start = offset as usize;
    let end = start
        .checked_add(length as usize)
        .ok_or(CatalogParseError::Overflow("string_end"))?;
    if end > buffer.len() {
        return Err(CatalogParseError::BadStringEnd(end, buffer.len()));
    }
    Ok(std::str::from_utf8(&buffer[start..end])?.to_owned())
}

fn tail(buffer: &[u8], offset: usize) -> Result<&[u8], CatalogParseError> {
    buffer
        .get(offset..)
        .ok_or(CatalogParseError::BadOffset(offset, buffer.len()))
}

/// Decodes a module serialized by [`TestAdapter::serialize`].
pub fn parse_module(buffer: &[u8]) -> Result<ModuleDescription, CatalogParseError> {
    let (module, mut rest) =
        ModuleRecord::read_from_prefix(buffer).map_err(|_| CatalogParseError::SliceRead)?;

    let mut fixtures = Vec::new();
    for _ in 0..module.fixture_count {
        let (offset, next) =
            u32::read_from_prefix(rest).map_err(|_| CatalogParseError::SliceRead)?;
        rest = next;
        let (fixture, mut records) =
            FixtureRecord::read_from_prefix(tail(buffer, offset as usize)?)
                .map_err(|_| CatalogParseError::SliceRead)?;
        let mut entries = Vec::with_capacity(fixture.entry_count as usize);
        for _ in 0..fixture.entry_count {
            let (entry, next) =
                EntryRecord::read_from_prefix(records).map_err(|_| CatalogParseError::SliceRead)?;
            records = next;
            entries.push(EntryDescription {
                entry_type: EntryType::try_from(entry.entry_type)
                    .map_err(CatalogParseError::EntryType)?,
                key: entry.key,
                name: read_name(buffer, entry.name_offset, entry.name_length)?,
            });
        }
        fixtures.push(FixtureDescription {
            key: fixture.key,
            name: read_name(buffer, fixture.name_offset, fixture.name_length)?,
            entries,
        });
    }
    Ok(ModuleDescription { fixtures })
}

#[cfg(test)]
mod tests {
    use super::*;
    use harness_core::catalog::FixtureBuilder;
    use harness_core::catalog::ModuleBuilder;
    use std::sync::Arc;
    use std::sync::atomic::AtomicU32;
    use std::sync::atomic::Ordering;

    fn module() -> Arc<Module> {
        ModuleBuilder::new("driver")
            .fixture(
                FixtureBuilder::new("Full")
                    .setup(|| {})
                    .teardown(|| {})
                    .before(|| {})
                    .after(|| {})
                    .test_case("First", || {})
                    .test_case("Second", || {}),
            )
            .fixture(FixtureBuilder::new("Bare").test_case("Only", || {}))
            .build()
    }

    #[test]
    fn routine_keys_follow_entry_order() {
        let adapter = TestAdapter::new(&module()).unwrap();
        let mut buffer = vec![0; adapter.required_size()];
        adapter.serialize(&mut buffer).unwrap();
        let description = parse_module(&buffer).unwrap();

        assert_eq!(description.fixtures.len(), 2);
        let full = &description.fixtures[0];
        assert_eq!(full.name, "Full");
        let layout: Vec<_> = full
            .entries
            .iter()
            .map(|entry| (entry.entry_type, entry.key, entry.name.as_str()))
            .collect();
        assert_eq!(
            layout,
            [
                (EntryType::Setup, 0, "Setup"),
                (EntryType::Before, 1, "Before"),
                (EntryType::After, 2, "After"),
                (EntryType::TestCase, 3, "First"),
                (EntryType::TestCase, 4, "Second"),
                (EntryType::Teardown, 5, "Teardown"),
            ]
        );
        let bare = &description.fixtures[1];
        assert_eq!(bare.key, 1);
        assert_eq!(bare.entries.len(), 1);
        assert_eq!(bare.entries[0].name, "Only");
    }

    #[test]
    fn routine_lookup() {
        let hits = Arc::new(AtomicU32::new(0));
        let module = ModuleBuilder::new("driver")
            .fixture(FixtureBuilder::new("F").test_case("A", {
                let hits = hits.clone();
                move || {
                    hits.fetch_add(1, Ordering::SeqCst);
                }
            }))
            .build();
        let adapter = TestAdapter::new(&module).unwrap();
        (adapter.routine(0, 0).unwrap())();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(adapter.routine(0, 1).is_none());
        assert!(adapter.routine(1, 0).is_none());
    }

    #[test]
    fn buffer_too_small_reports_required_size() {
        let adapter = TestAdapter::new(&module()).unwrap();
        let required = adapter.required_size();
        let mut buffer = vec![0; required - 1];
        let err = adapter.serialize(&mut buffer).unwrap_err();
        assert_eq!(err.required, required);

        let mut buffer = vec![0xff; required + 16];
        assert_eq!(adapter.serialize(&mut buffer).unwrap(), required);
    }

    #[test]
    fn truncated_catalog_is_rejected() {
        let adapter = TestAdapter::new(&module()).unwrap();
        let mut buffer = vec![0; adapter.required_size()];
        adapter.serialize(&mut buffer).unwrap();

        assert!(matches!(
            parse_module(&buffer[..2]),
            Err(CatalogParseError::SliceRead)
        ));
        // Cutting off the strings leaves the records intact.
        assert!(matches!(
            parse_module(&buffer[..adapter.records_size]),
            Err(CatalogParseError::BadStringEnd(..))
        ));
    }
}
