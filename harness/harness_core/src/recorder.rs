// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! An execution context that records everything it is told.

use crate::catalog::Fixture;
use crate::catalog::TestCase;
use crate::context::ContextError;
use crate::context::ExecutionContext;
use crate::context::ThreadIdentity;
use crate::event::ExecutionEvent;
use crate::event::UncaughtException;
use harness_defs::Disposition;
use harness_defs::EXECUTION_CONTEXT_VERSION;
use harness_defs::EventType;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::thread::ThreadId;
use thiserror::Error;

/// Callback counts of one routine thread and its children.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
#[expect(missing_docs)] // Self-describing names.
pub struct EventCounts {
    pub before_fixture: u32,
    pub after_fixture: u32,
    pub fixtures_ran_to_completion: u32,
    pub before_test_case: u32,
    pub after_test_case: u32,
    pub test_cases_ran_to_completion: u32,
    pub failed_assertions: u32,
    pub uncaught_exceptions: u32,
    pub inconclusive: u32,
    pub logs: u32,
    pub child_threads_started: u32,
    pub child_threads_finished: u32,
}

impl EventCounts {
    fn accumulate(&mut self, other: &Self) {
        self.before_fixture += other.before_fixture;
        self.after_fixture += other.after_fixture;
        self.fixtures_ran_to_completion += other.fixtures_ran_to_completion;
        self.before_test_case += other.before_test_case;
        self.after_test_case += other.after_test_case;
        self.test_cases_ran_to_completion += other.test_cases_ran_to_completion;
        self.failed_assertions += other.failed_assertions;
        self.uncaught_exceptions += other.uncaught_exceptions;
        self.inconclusive += other.inconclusive;
        self.logs += other.logs;
        self.child_threads_started += other.child_threads_started;
        self.child_threads_finished += other.child_threads_finished;
    }

    /// The counts of `factor` identical runs.
    pub fn scaled(&self, factor: u32) -> Self {
        let mut scaled = Self::default();
        for _ in 0..factor {
            scaled.accumulate(self);
        }
        scaled
    }
}

/// One callback, in the order it was received.
#[derive(Debug, Clone, PartialEq, Eq)]
#[expect(missing_docs)] // Named after the callbacks they record.
pub enum CallbackRecord {
    BeforeFixtureStart {
        fixture: String,
    },
    AfterFixtureFinish {
        fixture: String,
        ran_to_completion: bool,
    },
    BeforeTestCaseStart {
        test_case: String,
    },
    AfterTestCaseFinish {
        test_case: String,
        ran_to_completion: bool,
    },
    FailedAssertion {
        expression: String,
    },
    UncaughtException {
        message: String,
    },
    Inconclusiveness {
        message: String,
    },
    Log {
        message: String,
    },
}

#[derive(Debug, Error)]
#[error("fixture {0} refused by the execution context")]
struct FixtureRefused(String);

struct RecorderState {
    failed_assertion: Disposition,
    unhandled_exception: Disposition,
    refused_fixtures: Vec<String>,
    history: Vec<CallbackRecord>,
    events: Vec<ExecutionEvent>,
    unhandled_exceptions: Vec<String>,
}

/// Counts callbacks per routine thread and keeps a callback history.
///
/// Counts are kept per main thread. Child threads report with their
/// parent's main thread, so their events land in the parent's record.
pub struct RecordingContext {
    version: u32,
    state: Mutex<RecorderState>,
    records: Mutex<HashMap<ThreadId, Arc<Mutex<EventCounts>>>>,
}

impl RecordingContext {
    /// Answers failed assertions and uncaught exceptions with `disposition`.
    pub fn new(disposition: Disposition) -> Self {
        Self {
            version: EXECUTION_CONTEXT_VERSION,
            state: Mutex::new(RecorderState {
                failed_assertion: disposition,
                unhandled_exception: disposition,
                refused_fixtures: Vec::new(),
                history: Vec::new(),
                events: Vec::new(),
                unhandled_exceptions: Vec::new(),
            }),
            records: Mutex::new(HashMap::new()),
        }
    }

    /// Reports `version` as the callback contract version.
    pub fn with_version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    /// Disposition returned for subsequent failed assertions.
    pub fn set_failed_assertion_disposition(&self, disposition: Disposition) {
        self.state.lock().failed_assertion = disposition;
    }

    /// Disposition returned for subsequent uncaught exceptions.
    pub fn set_unhandled_exception_disposition(&self, disposition: Disposition) {
        self.state.lock().unhandled_exception = disposition;
    }

    /// Makes `before_fixture_start` fail for the fixture named `fixture`.
    pub fn fail_fixture_start(&self, fixture: &str) {
        self.state.lock().refused_fixtures.push(fixture.to_owned());
    }

    fn record(&self, thread: &ThreadIdentity) -> Arc<Mutex<EventCounts>> {
        self.records
            .lock()
            .entry(thread.main_thread)
            .or_default()
            .clone()
    }

    fn update(&self, thread: &ThreadIdentity, f: impl FnOnce(&mut EventCounts)) {
        let record = self.record(thread);
        f(&mut record.lock());
    }

    /// Counts summed over all routine threads.
    pub fn totals(&self) -> EventCounts {
        let records: Vec<_> = self.records.lock().values().cloned().collect();
        let mut totals = EventCounts::default();
        for record in records {
            totals.accumulate(&record.lock());
        }
        totals
    }

    /// Counts of the routine thread `main_thread`.
    pub fn counts_for(&self, main_thread: ThreadId) -> EventCounts {
        self.records
            .lock()
            .get(&main_thread)
            .map(|record| *record.lock())
            .unwrap_or_default()
    }

    /// All callbacks received so far.
    pub fn history(&self) -> Vec<CallbackRecord> {
        self.state.lock().history.clone()
    }

    /// All events reported so far.
    pub fn events(&self) -> Vec<ExecutionEvent> {
        self.state.lock().events.clone()
    }

    /// Messages passed to `on_unhandled_exception`.
    pub fn unhandled_exceptions(&self) -> Vec<String> {
        self.state.lock().unhandled_exceptions.clone()
    }
}

impl ExecutionContext for RecordingContext {
    fn version(&self) -> u32 {
        self.version
    }

    fn report_event(&self, thread: &ThreadIdentity, event: &ExecutionEvent) -> Disposition {
        self.update(thread, |counts| match event {
            ExecutionEvent::FailedAssertion(_) => counts.failed_assertions += 1,
            ExecutionEvent::UncaughtException(_) => counts.uncaught_exceptions += 1,
            ExecutionEvent::Inconclusiveness(_) => counts.inconclusive += 1,
            ExecutionEvent::Log(_) => counts.logs += 1,
        });

        let record = match event {
            ExecutionEvent::FailedAssertion(event) => CallbackRecord::FailedAssertion {
                expression: event.expression.clone(),
            },
            ExecutionEvent::UncaughtException(event) => CallbackRecord::UncaughtException {
                message: event.message.clone(),
            },
            ExecutionEvent::Inconclusiveness(event) => CallbackRecord::Inconclusiveness {
                message: event.message.clone(),
            },
            ExecutionEvent::Log(event) => CallbackRecord::Log {
                message: event.message.clone(),
            },
        };
        {
            let mut state = self.state.lock();
            state.history.push(record);
            state.events.push(event.clone());
        }
        self.query_default_disposition(thread, event.event_type())
    }

    fn query_default_disposition(
        &self,
        _thread: &ThreadIdentity,
        event_type: EventType,
    ) -> Disposition {
        let state = self.state.lock();
        match event_type {
            EventType::FailedAssertion => state.failed_assertion,
            EventType::UncaughtException => state.unhandled_exception,
            EventType::Inconclusiveness | EventType::Log => Disposition::Continue,
        }
    }

    fn before_fixture_start(
        &self,
        thread: &ThreadIdentity,
        fixture: &Fixture,
    ) -> Result<(), ContextError> {
        self.update(thread, |counts| counts.before_fixture += 1);
        let mut state = self.state.lock();
        state.history.push(CallbackRecord::BeforeFixtureStart {
            fixture: fixture.name().to_owned(),
        });
        if state.refused_fixtures.iter().any(|name| name == fixture.name()) {
            return Err(ContextError::CallbackFailed {
                callback: "before_fixture_start",
                source: Box::new(FixtureRefused(fixture.name().to_owned())),
            });
        }
        Ok(())
    }

    fn after_fixture_finish(&self, thread: &ThreadIdentity, fixture: &Fixture, ran_to_completion: bool) {
        self.update(thread, |counts| {
            counts.after_fixture += 1;
            counts.fixtures_ran_to_completion += u32::from(ran_to_completion);
        });
        self.state
            .lock()
            .history
            .push(CallbackRecord::AfterFixtureFinish {
                fixture: fixture.name().to_owned(),
                ran_to_completion,
            });
    }

    fn before_test_case_start(
        &self,
        thread: &ThreadIdentity,
        test_case: &TestCase,
    ) -> Result<(), ContextError> {
        self.update(thread, |counts| counts.before_test_case += 1);
        self.state
            .lock()
            .history
            .push(CallbackRecord::BeforeTestCaseStart {
                test_case: test_case.name().to_owned(),
            });
        Ok(())
    }

    fn after_test_case_finish(
        &self,
        thread: &ThreadIdentity,
        test_case: &TestCase,
        ran_to_completion: bool,
    ) {
        self.update(thread, |counts| {
            counts.after_test_case += 1;
            counts.test_cases_ran_to_completion += u32::from(ran_to_completion);
        });
        self.state
            .lock()
            .history
            .push(CallbackRecord::AfterTestCaseFinish {
                test_case: test_case.name().to_owned(),
                ran_to_completion,
            });
    }

    fn before_child_thread_start(&self, thread: &ThreadIdentity) {
        self.update(thread, |counts| counts.child_threads_started += 1);
    }

    fn after_child_thread_finish(&self, thread: &ThreadIdentity) {
        self.update(thread, |counts| counts.child_threads_finished += 1);
    }

    fn on_unhandled_exception(&self, _thread: &ThreadIdentity, exception: &UncaughtException) {
        self.state
            .lock()
            .unhandled_exceptions
            .push(exception.message.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::MessageEvent;

    #[test]
    fn counts_are_kept_per_main_thread() {
        let context = RecordingContext::new(Disposition::Abort);
        let here = ThreadIdentity::current();
        let elsewhere = std::thread::spawn(ThreadIdentity::current).join().unwrap();
        let child = ThreadIdentity {
            main_thread: here.main_thread,
            thread: elsewhere.thread,
        };

        context.report_event(&here, &ExecutionEvent::Log(MessageEvent::new("a")));
        context.report_event(&child, &ExecutionEvent::Log(MessageEvent::new("b")));
        context.report_event(&elsewhere, &ExecutionEvent::Log(MessageEvent::new("c")));

        assert_eq!(context.counts_for(here.main_thread).logs, 2);
        assert_eq!(context.counts_for(elsewhere.main_thread).logs, 1);
        assert_eq!(context.totals().logs, 3);
    }

    #[test]
    fn dispositions_by_event_type() {
        let context = RecordingContext::new(Disposition::Abort);
        context.set_unhandled_exception_disposition(Disposition::Break);
        let thread = ThreadIdentity::current();
        assert_eq!(
            context.query_default_disposition(&thread, EventType::FailedAssertion),
            Disposition::Abort
        );
        assert_eq!(
            context.query_default_disposition(&thread, EventType::UncaughtException),
            Disposition::Break
        );
        assert_eq!(
            context.report_event(&thread, &ExecutionEvent::Log(MessageEvent::new("x"))),
            Disposition::Continue
        );
    }

    #[test]
    fn scaled_counts() {
        let counts = EventCounts {
            logs: 2,
            before_fixture: 1,
            ..Default::default()
        };
        assert_eq!(counts.scaled(0), EventCounts::default());
        assert_eq!(counts.scaled(3).logs, 6);
        assert_eq!(counts.scaled(3).before_fixture, 3);
    }
}
