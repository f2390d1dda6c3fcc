// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Execution events reported by test code.

use harness_defs::EventType;
use std::fmt;

/// Default number of frames captured for an event.
pub const MAX_STACK_FRAMES: usize = 64;

/// Symbolized stack frames, innermost first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StackTrace {
    /// One entry per frame.
    pub frames: Vec<String>,
}

impl StackTrace {
    /// Captures the calling thread's stack, keeping at most `max_frames`
    /// frames.
    pub fn capture(max_frames: usize) -> Self {
        let backtrace = std::backtrace::Backtrace::force_capture().to_string();
        let frames = backtrace
            .lines()
            .filter_map(|line| {
                // Frames render as "  N: symbol", source locations as
                // "      at file:line" on the following line.
                let (index, symbol) = line.trim_start().split_once(": ")?;
                index.parse::<usize>().ok()?;
                Some(symbol.to_owned())
            })
            .take(max_frames)
            .collect();
        Self { frames }
    }

    /// Returns true if no frames were captured.
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

/// An assertion in test code did not hold.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedAssertion {
    /// Source file of the assertion.
    pub file: String,
    /// Enclosing routine.
    pub routine: String,
    /// Source line of the assertion.
    pub line: u32,
    /// The expression or message that failed.
    pub expression: String,
    /// Stack at the time of the report, if captured.
    pub stack_trace: Option<StackTrace>,
}

/// Test code panicked outside of the assertion machinery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UncaughtException {
    /// The panic message.
    pub message: String,
    /// Stack at the time of the report, if captured.
    pub stack_trace: Option<StackTrace>,
}

/// Payload of inconclusiveness and log events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageEvent {
    /// The message.
    pub message: String,
    /// Stack at the time of the report, if captured.
    pub stack_trace: Option<StackTrace>,
}

impl MessageEvent {
    /// A message without a stack trace.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stack_trace: None,
        }
    }
}

/// An event delivered to [`crate::ExecutionContext::report_event`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionEvent {
    /// An assertion in test code did not hold.
    FailedAssertion(FailedAssertion),
    /// Test code panicked with a payload other than a harness signal.
    UncaughtException(UncaughtException),
    /// The test could not decide whether it passed.
    Inconclusiveness(MessageEvent),
    /// A log message.
    Log(MessageEvent),
}

impl ExecutionEvent {
    /// The wire tag of this event.
    pub fn event_type(&self) -> EventType {
        match self {
            ExecutionEvent::FailedAssertion(_) => EventType::FailedAssertion,
            ExecutionEvent::UncaughtException(_) => EventType::UncaughtException,
            ExecutionEvent::Inconclusiveness(_) => EventType::Inconclusiveness,
            ExecutionEvent::Log(_) => EventType::Log,
        }
    }

    /// The stack trace attached to the event, if one was captured.
    pub fn stack_trace(&self) -> Option<&StackTrace> {
        match self {
            ExecutionEvent::FailedAssertion(event) => event.stack_trace.as_ref(),
            ExecutionEvent::UncaughtException(event) => event.stack_trace.as_ref(),
            ExecutionEvent::Inconclusiveness(event) | ExecutionEvent::Log(event) => {
                event.stack_trace.as_ref()
            }
        }
    }
}

impl fmt::Display for ExecutionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionEvent::FailedAssertion(event) => write!(
                f,
                "assertion failed at {}:{} in {}: {}",
                event.file, event.line, event.routine, event.expression
            ),
            ExecutionEvent::UncaughtException(event) => {
                write!(f, "uncaught exception: {}", event.message)
            }
            ExecutionEvent::Inconclusiveness(event) => {
                write!(f, "inconclusive: {}", event.message)
            }
            ExecutionEvent::Log(event) => f.write_str(&event.message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capture_respects_frame_limit() {
        let trace = StackTrace::capture(3);
        assert!(trace.frames.len() <= 3);
        assert!(StackTrace::capture(0).is_empty());
    }

    #[test]
    fn display() {
        let event = ExecutionEvent::FailedAssertion(FailedAssertion {
            file: "lib.rs".into(),
            routine: "tests::basic".into(),
            line: 12,
            expression: "x == 1".into(),
            stack_trace: None,
        });
        assert_eq!(event.event_type(), EventType::FailedAssertion);
        assert_eq!(
            event.to_string(),
            "assertion failed at lib.rs:12 in tests::basic: x == 1"
        );
        assert_eq!(
            ExecutionEvent::Log(MessageEvent::new("hello")).to_string(),
            "hello"
        );
    }
}
