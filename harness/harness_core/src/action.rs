// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Runnable units of a test run.

use crate::context::ContextError;
use crate::context::ExecutionContext;
use crate::filament::FilamentError;
use harness_defs::ExecutionFlags;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Something that can be run against an execution context.
pub trait Action: Send + Sync {
    /// Runs the action. An error means the remainder of the run must not
    /// continue.
    fn run(&self, context: &Arc<dyn ExecutionContext>) -> Result<(), RunError>;
}

/// The routine slot that failed.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FailureKind {
    /// The fixture setup routine.
    Setup,
    /// The fixture teardown routine.
    Teardown,
    /// The routine run before each test case.
    Before,
    /// A test case.
    TestCase,
    /// The routine run after each test case.
    After,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FailureKind::Setup => "setup",
            FailureKind::Teardown => "teardown",
            FailureKind::Before => "before",
            FailureKind::TestCase => "test case",
            FailureKind::After => "after",
        })
    }
}

/// Why an action stopped the run.
#[derive(Debug, Error)]
pub enum RunError {
    /// The context asked for the whole run to be aborted.
    #[error("test run aborted")]
    Aborted,
    /// A routine failed and the execution flags propagate the failure.
    #[error("{kind} routine of fixture {fixture} failed")]
    RoutineFailed {
        /// Name of the fixture the routine belongs to.
        fixture: String,
        /// Which routine failed.
        kind: FailureKind,
    },
    /// A single test case was selected by a name the fixture lacks.
    #[error("fixture {fixture} has no test case {name}")]
    UnknownTestCase {
        /// Name of the fixture.
        fixture: String,
        /// The requested test case name.
        name: String,
    },
    /// A context callback failed or the context is incompatible.
    #[error("execution context error")]
    Context(#[from] ContextError),
    /// A routine's filament could not be set up or joined.
    #[error("filament error")]
    Filament(#[from] FilamentError),
}

/// Options shared by all actions of a run.
#[derive(Debug, Copy, Clone)]
pub struct ExecutionOptions {
    /// Short-circuit and escalation policy.
    pub flags: ExecutionFlags,
    /// How long a routine call waits for its child threads.
    pub join_timeout: Duration,
    /// Attach stack traces to reported events.
    pub capture_stack_traces: bool,
}

impl Default for ExecutionOptions {
    fn default() -> Self {
        Self {
            flags: ExecutionFlags::new(),
            join_timeout: Duration::from_secs(60),
            capture_stack_traces: false,
        }
    }
}
