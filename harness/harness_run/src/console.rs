// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Execution context that prints results to the console.

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

/// Fixture and test case tallies printed at the end of a run.
#[derive(Debug, Default, Copy, Clone)]
pub struct Summary {
    pub fixtures: u32,
    pub fixtures_completed: u32,
    pub passed: u32,
    pub failed: u32,
}

/// Prints events to stdout and answers every event with one disposition.
pub struct ConsoleContext {
    disposition: Disposition,
    summary: Mutex<Summary>,
}

impl ConsoleContext {
    /// Creates a context answering every event with `disposition`.
    pub fn new(disposition: Disposition) -> Self {
        Self {
            disposition,
            summary: Mutex::new(Summary::default()),
        }
    }

    /// The tallies so far.
    pub fn summary(&self) -> Summary {
        *self.summary.lock()
    }
}

fn test_case_name(test_case: &TestCase) -> String {
    match test_case.fixture() {
        Some(fixture) => format!("{}::{}", fixture.name(), test_case.name()),
        None => test_case.name().to_owned(),
    }
}

impl ExecutionContext for ConsoleContext {
    fn report_event(&self, thread: &ThreadIdentity, event: &ExecutionEvent) -> Disposition {
        let origin = if thread.is_child() { " (child thread)" } else { "" };
        println!("    {event}{origin}");
        if let Some(stack_trace) = event.stack_trace() {
            for frame in &stack_trace.frames {
                println!("        {frame}");
            }
        }
        self.query_default_disposition(thread, event.event_type())
    }

    fn query_default_disposition(&self, _thread: &ThreadIdentity, event_type: EventType) -> Disposition {
        match event_type {
            EventType::FailedAssertion | EventType::UncaughtException => self.disposition,
            EventType::Inconclusiveness | EventType::Log => Disposition::Continue,
        }
    }

    fn before_fixture_start(&self, _thread: &ThreadIdentity, fixture: &Fixture) -> Result<(), ContextError> {
        println!("[----------] {}", fixture.name());
        self.summary.lock().fixtures += 1;
        Ok(())
    }

    fn after_fixture_finish(&self, _thread: &ThreadIdentity, fixture: &Fixture, ran_to_completion: bool) {
        if ran_to_completion {
            self.summary.lock().fixtures_completed += 1;
            println!("[----------] {} completed", fixture.name());
        } else {
            println!("[----------] {} did not complete", fixture.name());
        }
    }

    fn before_test_case_start(
        &self,
        _thread: &ThreadIdentity,
        test_case: &TestCase,
    ) -> Result<(), ContextError> {
        println!("[ RUN      ] {}", test_case_name(test_case));
        Ok(())
    }

    fn after_test_case_finish(
        &self,
        _thread: &ThreadIdentity,
        test_case: &TestCase,
        ran_to_completion: bool,
    ) {
        let mut summary = self.summary.lock();
        if ran_to_completion {
            summary.passed += 1;
            println!("[       OK ] {}", test_case_name(test_case));
        } else {
            summary.failed += 1;
            println!("[  FAILED  ] {}", test_case_name(test_case));
        }
    }

    fn on_unhandled_exception(&self, thread: &ThreadIdentity, exception: &UncaughtException) {
        tracing::debug!(
            thread = ?thread.thread,
            message = exception.message.as_str(),
            "unhandled exception"
        );
    }
}
