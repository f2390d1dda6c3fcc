// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The execution context of a single kernel routine call.

use crate::event_buffer::EventBuffer;
use harness_core::ContextError;
use harness_core::Disposition;
use harness_core::EventType;
use harness_core::ExecutionContext;
use harness_core::ThreadIdentity;
use harness_core::catalog::Fixture;
use harness_core::catalog::TestCase;
use harness_core::event::ExecutionEvent;
use harness_core::event::UncaughtException;
use parking_lot::Mutex;
use std::sync::Arc;

/// Dispositions requested by the user-mode caller.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Dispositions {
    /// Returned for failed assertions.
    pub failed_assertion: Disposition,
    /// Returned for uncaught exceptions.
    pub unhandled_exception: Disposition,
}

/// Collects the events of one routine call into an [`EventBuffer`] and
/// answers with the caller's dispositions.
///
/// Fixture and test case callbacks are driven by the user-mode side, so
/// they do nothing here.
pub struct ReportChannel {
    dispositions: Dispositions,
    events: Mutex<EventBuffer>,
}

impl ReportChannel {
    /// A channel whose events may occupy at most `capacity` bytes.
    pub fn new(dispositions: Dispositions, capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            dispositions,
            events: Mutex::new(EventBuffer::new(capacity)),
        })
    }

    /// Appends an event without consulting the dispositions.
    pub fn queue_event(&self, event: &ExecutionEvent) -> bool {
        self.events.lock().queue(event)
    }

    /// Takes the collected events, leaving an empty buffer of the same
    /// capacity.
    pub fn take_events(&self) -> EventBuffer {
        let mut events = self.events.lock();
        let capacity = events.capacity();
        std::mem::replace(&mut *events, EventBuffer::new(capacity))
    }
}

impl ExecutionContext for ReportChannel {
    fn report_event(&self, thread: &ThreadIdentity, event: &ExecutionEvent) -> Disposition {
        self.queue_event(event);
        self.query_default_disposition(thread, event.event_type())
    }

    fn query_default_disposition(&self, _thread: &ThreadIdentity, event_type: EventType) -> Disposition {
        match event_type {
            EventType::FailedAssertion => self.dispositions.failed_assertion,
            EventType::UncaughtException => self.dispositions.unhandled_exception,
            EventType::Inconclusiveness | EventType::Log => Disposition::Continue,
        }
    }

    fn before_fixture_start(&self, _thread: &ThreadIdentity, _fixture: &Fixture) -> Result<(), ContextError> {
        Ok(())
    }

    fn after_fixture_finish(&self, _thread: &ThreadIdentity, _fixture: &Fixture, _ran_to_completion: bool) {}

    fn before_test_case_start(
        &self,
        _thread: &ThreadIdentity,
        _test_case: &TestCase,
    ) -> Result<(), ContextError> {
        Ok(())
    }

    fn after_test_case_finish(
        &self,
        _thread: &ThreadIdentity,
        _test_case: &TestCase,
        _ran_to_completion: bool,
    ) {
    }

    fn on_unhandled_exception(&self, thread: &ThreadIdentity, exception: &UncaughtException) {
        tracing::debug!(
            thread = ?thread.thread,
            message = exception.message.as_str(),
            "unhandled exception in driver routine"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use harness_core::event::MessageEvent;

    #[test]
    fn dispositions_and_queueing() {
        let channel = ReportChannel::new(
            Dispositions {
                failed_assertion: Disposition::Abort,
                unhandled_exception: Disposition::Break,
            },
            1024,
        );
        let thread = ThreadIdentity::current();
        assert_eq!(
            channel.query_default_disposition(&thread, EventType::FailedAssertion),
            Disposition::Abort
        );
        assert_eq!(
            channel.query_default_disposition(&thread, EventType::UncaughtException),
            Disposition::Break
        );
        assert_eq!(
            channel.report_event(&thread, &ExecutionEvent::Log(MessageEvent::new("a"))),
            Disposition::Continue
        );

        let events = channel.take_events();
        assert_eq!(events.event_count(), 1);
        assert_eq!(events.capacity(), 1024);
        assert_eq!(channel.take_events().event_count(), 0);
    }
}
