// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The callback contract between the execution engine and whoever is
//! observing the run.

use crate::catalog::Fixture;
use crate::catalog::TestCase;
use crate::event::ExecutionEvent;
use crate::event::UncaughtException;
use harness_defs::Disposition;
use harness_defs::EXECUTION_CONTEXT_VERSION;
use harness_defs::EventType;
use std::thread::JoinHandle;
use std::thread::ThreadId;
use thiserror::Error;

/// Identifies a reporting thread and the routine thread it belongs to.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct ThreadIdentity {
    /// The thread that invoked the routine.
    pub main_thread: ThreadId,
    /// The thread doing the reporting. Equal to `main_thread` unless the
    /// report comes from a child thread.
    pub thread: ThreadId,
}

impl ThreadIdentity {
    /// The identity of the calling thread as the main thread of its own
    /// filament.
    pub fn current() -> Self {
        let thread = std::thread::current().id();
        Self {
            main_thread: thread,
            thread,
        }
    }

    /// Returns true if the reporting thread is a child thread.
    pub fn is_child(&self) -> bool {
        self.main_thread != self.thread
    }
}

/// Errors raised by an [`ExecutionContext`] or while validating one.
#[derive(Debug, Error)]
pub enum ContextError {
    /// The context implements a different callback contract.
    #[error("execution context version {found:#x} does not match {expected:#x}")]
    VersionMismatch {
        /// Version reported by the context.
        found: u32,
        /// Version this engine implements.
        expected: u32,
    },
    /// A lifecycle callback refused to proceed.
    #[error("{callback} callback failed")]
    CallbackFailed {
        /// Name of the callback.
        callback: &'static str,
        /// Error returned by the callback.
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

/// Entry point of a child thread, handed to
/// [`ExecutionContext::create_child_thread`].
pub type ChildThreadStart = Box<dyn FnOnce() + Send>;

/// Receives events and lifecycle callbacks for a run.
///
/// All methods may be called concurrently from any thread of a filament.
pub trait ExecutionContext: Send + Sync {
    /// Version of the callback contract this context implements.
    fn version(&self) -> u32 {
        EXECUTION_CONTEXT_VERSION
    }

    /// Records an event and decides how the reporting thread proceeds.
    fn report_event(&self, thread: &ThreadIdentity, event: &ExecutionEvent) -> Disposition;

    /// The disposition that [`Self::report_event`] would return for events of
    /// `event_type`, without reporting anything.
    fn query_default_disposition(
        &self,
        thread: &ThreadIdentity,
        event_type: EventType,
    ) -> Disposition;

    /// Called before a fixture's setup routine. An error skips the fixture
    /// and stops the run.
    fn before_fixture_start(
        &self,
        thread: &ThreadIdentity,
        fixture: &Fixture,
    ) -> Result<(), ContextError>;

    /// Called after a fixture's teardown routine.
    fn after_fixture_finish(&self, thread: &ThreadIdentity, fixture: &Fixture, ran_to_completion: bool);

    /// Called before a test case's before routine. An error stops the run.
    fn before_test_case_start(
        &self,
        thread: &ThreadIdentity,
        test_case: &TestCase,
    ) -> Result<(), ContextError>;

    /// Called once a test case and its after routine are done.
    fn after_test_case_finish(
        &self,
        thread: &ThreadIdentity,
        test_case: &TestCase,
        ran_to_completion: bool,
    );

    /// Starts a child thread of the routine running on `parent`.
    ///
    /// Contexts that track per-thread state wrap `start` to set it up.
    fn create_child_thread(
        &self,
        parent: &ThreadIdentity,
        builder: std::thread::Builder,
        start: ChildThreadStart,
    ) -> std::io::Result<JoinHandle<()>> {
        let _ = parent;
        builder.spawn(start)
    }

    /// Called on a child thread once it is bound to its filament.
    fn before_child_thread_start(&self, thread: &ThreadIdentity) {
        let _ = thread;
    }

    /// Called on a child thread after its routine returned or unwound.
    fn after_child_thread_finish(&self, thread: &ThreadIdentity) {
        let _ = thread;
    }

    /// Called for every panic that escapes test code without going through
    /// the reporting primitives, before the matching event is reported.
    fn on_unhandled_exception(&self, thread: &ThreadIdentity, exception: &UncaughtException);
}

/// Rejects contexts built against a different callback contract.
pub fn validate_context(context: &dyn ExecutionContext) -> Result<(), ContextError> {
    let found = context.version();
    if found != EXECUTION_CONTEXT_VERSION {
        return Err(ContextError::VersionMismatch {
            found,
            expected: EXECUTION_CONTEXT_VERSION,
        });
    }
    Ok(())
}
