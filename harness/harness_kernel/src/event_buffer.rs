// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Encoding of execution events into a bounded buffer, and decoding them
//! back.

use harness_core::event::ExecutionEvent;
use harness_core::event::FailedAssertion;
use harness_core::event::MessageEvent;
use harness_core::event::StackTrace;
use harness_core::event::UncaughtException;
use harness_defs::EventType;
use harness_defs::InvalidValue;
use harness_defs::event::EVENT_ALIGNMENT_MASK;
use harness_defs::event::EventHeader;
use harness_defs::event::FailedAssertionRecord;
use harness_defs::event::MAX_STACK_FRAMES;
use harness_defs::event::MAX_STRING_LENGTH;
use harness_defs::event::MessageRecord;
use harness_defs::event::StringRef;
use std::mem::size_of;
use thiserror::Error;
use zerocopy::FromBytes;
use zerocopy::IntoBytes;

/// Truncates `s` to at most `max` bytes on a character boundary.
fn truncate_str(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Builds the string area of one record.
struct RecordWriter {
    fixed_size: usize,
    strings: Vec<u8>,
}

impl RecordWriter {
    fn new<T>() -> Self {
        Self {
            fixed_size: size_of::<EventHeader>() + size_of::<T>(),
            strings: Vec::new(),
        }
    }

    fn push(&mut self, s: &str) -> StringRef {
        let s = truncate_str(s, MAX_STRING_LENGTH);
        if s.is_empty() {
            return StringRef::default();
        }
        let offset = self.fixed_size + self.strings.len();
        self.strings.extend_from_slice(s.as_bytes());
        StringRef {
            offset: offset as u32,
            length: s.len() as u32,
        }
    }

    /// Returns the frame count and the joined frames.
    fn push_stack(&mut self, stack_trace: Option<&StackTrace>) -> (u32, StringRef) {
        let Some(stack_trace) = stack_trace else {
            return (0, StringRef::default());
        };
        let frames = &stack_trace.frames[..stack_trace.frames.len().min(MAX_STACK_FRAMES)];
        let joined = frames.join("\n");
        let joined = truncate_str(&joined, MAX_STRING_LENGTH);
        // Only count the frames that survived truncation.
        let frame_count = joined.split('\n').filter(|frame| !frame.is_empty()).count();
        (frame_count as u32, self.push(joined))
    }

    fn finish(self, event_type: EventType, body: &[u8]) -> Vec<u8> {
        let unpadded = self.fixed_size + self.strings.len();
        let size = (unpadded + EVENT_ALIGNMENT_MASK) & !EVENT_ALIGNMENT_MASK;
        let header = EventHeader {
            event_type: event_type as u32,
            size: size as u32,
        };
        let mut record = Vec::with_capacity(size);
        record.extend_from_slice(header.as_bytes());
        record.extend_from_slice(body);
        record.extend_from_slice(&self.strings);
        record.resize(size, 0);
        record
    }
}

fn encode_message(event_type: EventType, message: &str, stack_trace: Option<&StackTrace>) -> Vec<u8> {
    let mut writer = RecordWriter::new::<MessageRecord>();
    let message = writer.push(message);
    let (frame_count, stack_trace) = writer.push_stack(stack_trace);
    let body = MessageRecord {
        reserved: 0,
        frame_count,
        message,
        stack_trace,
    };
    writer.finish(event_type, body.as_bytes())
}

/// Encodes one event as a complete, padded record.
pub fn encode_event(event: &ExecutionEvent) -> Vec<u8> {
    match event {
        ExecutionEvent::FailedAssertion(assertion) => {
            let mut writer = RecordWriter::new::<FailedAssertionRecord>();
            let file = writer.push(&assertion.file);
            let routine = writer.push(&assertion.routine);
            let expression = writer.push(&assertion.expression);
            let (frame_count, stack_trace) = writer.push_stack(assertion.stack_trace.as_ref());
            let body = FailedAssertionRecord {
                line: assertion.line,
                frame_count,
                file,
                routine,
                expression,
                stack_trace,
            };
            writer.finish(EventType::FailedAssertion, body.as_bytes())
        }
        ExecutionEvent::UncaughtException(exception) => encode_message(
            EventType::UncaughtException,
            &exception.message,
            exception.stack_trace.as_ref(),
        ),
        ExecutionEvent::Inconclusiveness(event) => encode_message(
            EventType::Inconclusiveness,
            &event.message,
            event.stack_trace.as_ref(),
        ),
        ExecutionEvent::Log(event) => {
            encode_message(EventType::Log, &event.message, event.stack_trace.as_ref())
        }
    }
}

/// A bounded, append-only sequence of event records.
///
/// A record that does not fit is dropped whole and the buffer is marked
/// truncated; the buffer never holds a partial record.
#[derive(Debug)]
pub struct EventBuffer {
    data: Vec<u8>,
    capacity: usize,
    event_count: u32,
    truncated: bool,
}

impl EventBuffer {
    /// A buffer holding at most `capacity` bytes of records.
    pub fn new(capacity: usize) -> Self {
        Self {
            data: Vec::new(),
            capacity,
            event_count: 0,
            truncated: false,
        }
    }

    /// Appends `event`. Returns false if it was dropped for lack of space.
    pub fn queue(&mut self, event: &ExecutionEvent) -> bool {
        let record = encode_event(event);
        if record.len() > self.capacity - self.data.len() {
            if !self.truncated {
                tracing::debug!(
                    event_type = ?event.event_type(),
                    size = record.len(),
                    remaining = self.capacity - self.data.len(),
                    "event buffer full, dropping events"
                );
            }
            self.truncated = true;
            return false;
        }
        self.data.extend_from_slice(&record);
        self.event_count += 1;
        true
    }

    /// Number of records written.
    pub fn event_count(&self) -> u32 {
        self.event_count
    }

    /// Whether a record was dropped for lack of space.
    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    /// Bytes written.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether no record was written.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Maximum number of bytes the buffer holds.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// The records written, back to back.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }
}

/// Errors that occur when decoding event records.
#[derive(Debug, Error)]
pub enum EventParseError {
    /// A record header is cut off by the end of the buffer.
    #[error("Failed to read from buffer slice")]
    SliceRead,
    /// A record carries an unknown event type.
    #[error("invalid event type")]
    EventType(#[source] InvalidValue),
    /// A record's size is too small for its header or runs past the buffer.
    #[error("record size {0:#x} is invalid for remaining buffer length {1:#x}")]
    BadSize(usize, usize),
    /// A string offset computation overflowed.
    #[error("Arithmetic overflow in {0}")]
    Overflow(&'static str),
    /// A string runs past its record.
    #[error("string end ({0:#x}) exceeds record length ({1:#x})")]
    BadStringEnd(usize, usize),
    /// A string is not valid UTF-8.
    #[error("Failed to read UTF-8 string: {0}")]
    Utf8Error(#[from] std::str::Utf8Error),
}

/// A decoded record and its position in the buffer.
#[derive(Debug)]
pub struct DecodedEvent {
    /// Offset of the record in the buffer.
    pub offset: usize,
    /// Size of the record, including its strings.
    pub size: usize,
    /// The decoded event.
    pub event: ExecutionEvent,
}

fn read_string(record: &[u8], string: StringRef) -> Result<String, EventParseError> {
    let start = string.offset as usize;
    let end = start
        .checked_add(string.length as usize)
        .ok_or(EventParseError::Overflow("string_end"))?;
    if end > record.len() {
        return Err(EventParseError::BadStringEnd(end, record.len()));
    }
    Ok(std::str::from_utf8(&record[start..end])?.to_owned())
}

fn read_stack(record: &[u8], stack_trace: StringRef, frame_count: u32) -> Result<Option<StackTrace>, EventParseError> {
    if frame_count == 0 {
        return Ok(None);
    }
    let joined = read_string(record, stack_trace)?;
    Ok(Some(StackTrace {
        frames: joined.split('\n').map(str::to_owned).collect(),
    }))
}

/// Decodes the record at the start of `buffer`. Returns the event and the
/// record size.
pub fn parse_event(buffer: &[u8]) -> Result<(ExecutionEvent, usize), EventParseError> {
    let (header, _) = EventHeader::read_from_prefix(buffer).map_err(|_| EventParseError::SliceRead)?;

    let size = header.size as usize;
    if size < size_of::<EventHeader>() || size & EVENT_ALIGNMENT_MASK != 0 || size > buffer.len() {
        return Err(EventParseError::BadSize(size, buffer.len()));
    }
    let record = &buffer[..size];
    let body = &record[size_of::<EventHeader>()..];

    let event = match EventType::try_from(header.event_type).map_err(EventParseError::EventType)? {
        EventType::FailedAssertion => {
            let (body, _) =
                FailedAssertionRecord::read_from_prefix(body).map_err(|_| EventParseError::SliceRead)?;
            ExecutionEvent::FailedAssertion(FailedAssertion {
                file: read_string(record, body.file)?,
                routine: read_string(record, body.routine)?,
                line: body.line,
                expression: read_string(record, body.expression)?,
                stack_trace: read_stack(record, body.stack_trace, body.frame_count)?,
            })
        }
        event_type => {
            let (body, _) =
                MessageRecord::read_from_prefix(body).map_err(|_| EventParseError::SliceRead)?;
            let message = read_string(record, body.message)?;
            let stack_trace = read_stack(record, body.stack_trace, body.frame_count)?;
            match event_type {
                EventType::UncaughtException => {
                    ExecutionEvent::UncaughtException(UncaughtException {
                        message,
                        stack_trace,
                    })
                }
                EventType::Inconclusiveness => ExecutionEvent::Inconclusiveness(MessageEvent {
                    message,
                    stack_trace,
                }),
                _ => ExecutionEvent::Log(MessageEvent {
                    message,
                    stack_trace,
                }),
            }
        }
    };
    Ok((event, size))
}

/// Iterates over the records of an event buffer. Stops after the first
/// malformed record.
pub struct EventReader<'a> {
    buffer: &'a [u8],
    offset: usize,
}

impl<'a> EventReader<'a> {
    /// Starts reading at the beginning of `buffer`.
    pub fn new(buffer: &'a [u8]) -> Self {
        Self { buffer, offset: 0 }
    }
}

impl Iterator for EventReader<'_> {
    type Item = Result<DecodedEvent, EventParseError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.offset >= self.buffer.len() {
            return None;
        }
        match parse_event(&self.buffer[self.offset..]) {
            Ok((event, size)) => {
                let offset = self.offset;
                self.offset += size;
                Some(Ok(DecodedEvent {
                    offset,
                    size,
                    event,
                }))
            }
            Err(err) => {
                self.offset = self.buffer.len();
                Some(Err(err))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use harness_defs::event::EVENT_ALIGNMENT;

    fn assertion(expression: &str) -> ExecutionEvent {
        ExecutionEvent::FailedAssertion(FailedAssertion {
            file: "driver.rs".into(),
            routine: "driver::tests::basic".into(),
            line: 42,
            expression: expression.into(),
            stack_trace: None,
        })
    }

    #[test]
    fn records_decode() {
        let events = [
            assertion("x == 1"),
            ExecutionEvent::Log(MessageEvent::new("hello")),
            ExecutionEvent::Inconclusiveness(MessageEvent {
                message: "unsure".into(),
                stack_trace: Some(StackTrace {
                    frames: vec!["frame_a".into(), "frame_b".into()],
                }),
            }),
            ExecutionEvent::UncaughtException(UncaughtException {
                message: String::new(),
                stack_trace: None,
            }),
        ];
        let mut buffer = EventBuffer::new(4096);
        for event in &events {
            assert!(buffer.queue(event));
        }
        assert_eq!(buffer.event_count(), 4);
        assert!(!buffer.is_truncated());

        let decoded: Vec<_> = EventReader::new(buffer.as_bytes())
            .map(|event| event.unwrap().event)
            .collect();
        assert_eq!(decoded, events);
    }

    #[test]
    fn records_are_aligned() {
        let record = encode_event(&ExecutionEvent::Log(MessageEvent::new("abc")));
        assert_eq!(record.len() % EVENT_ALIGNMENT, 0);
        assert_eq!(
            record.len(),
            size_of::<EventHeader>() + size_of::<MessageRecord>() + 8
        );
    }

    #[test]
    fn truncation_drops_whole_records() {
        let record_size = encode_event(&assertion("0123456789")).len();
        let capacity = record_size * 3 + record_size / 2;
        let mut buffer = EventBuffer::new(capacity);
        let mut queued = 0;
        for _ in 0..10 {
            if buffer.queue(&assertion("0123456789")) {
                queued += 1;
            }
        }
        assert_eq!(queued, 3);
        assert!(buffer.is_truncated());
        assert!(buffer.len() <= capacity);

        // A smaller record still fits in the remaining space.
        assert!(buffer.queue(&ExecutionEvent::Log(MessageEvent::new("x"))));

        let mut count = 0;
        for event in EventReader::new(buffer.as_bytes()) {
            let event = event.unwrap();
            assert!(event.offset + event.size <= buffer.len());
            count += 1;
        }
        assert_eq!(count, buffer.event_count());
    }

    #[test]
    fn long_strings_are_capped() {
        let long = "a".repeat(MAX_STRING_LENGTH + 100);
        let record = encode_event(&ExecutionEvent::Log(MessageEvent::new(long)));
        let (event, _) = parse_event(&record).unwrap();
        let ExecutionEvent::Log(message) = event else {
            panic!("unexpected event {event:?}");
        };
        assert_eq!(message.message.len(), MAX_STRING_LENGTH);
    }

    #[test]
    fn stack_traces_are_capped() {
        let trace = StackTrace {
            frames: (0..MAX_STACK_FRAMES + 10).map(|i| format!("frame{i}")).collect(),
        };
        let record = encode_event(&ExecutionEvent::Log(MessageEvent {
            message: "m".into(),
            stack_trace: Some(trace),
        }));
        let (event, _) = parse_event(&record).unwrap();
        assert_eq!(event.stack_trace().unwrap().frames.len(), MAX_STACK_FRAMES);
    }

    #[test]
    fn malformed_records_are_rejected() {
        let mut record = encode_event(&assertion("x"));
        assert!(matches!(
            parse_event(&record[..record.len() - 8]),
            Err(EventParseError::BadSize(..))
        ));

        record[0] = 9;
        assert!(matches!(
            parse_event(&record),
            Err(EventParseError::EventType(_))
        ));

        let mut record = encode_event(&assertion("x"));
        // Point the expression past the end of the record.
        let expression_offset = size_of::<EventHeader>() + 24;
        record[expression_offset..expression_offset + 4].copy_from_slice(&0x1000u32.to_le_bytes());
        assert!(matches!(
            parse_event(&record),
            Err(EventParseError::BadStringEnd(..))
        ));
    }
}
