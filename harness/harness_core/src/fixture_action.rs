// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Execution of a single fixture.

use crate::action::Action;
use crate::action::ExecutionOptions;
use crate::action::FailureKind;
use crate::action::RunError;
use crate::catalog::Fixture;
use crate::catalog::Routine;
use crate::catalog::TestCase;
use crate::context::ExecutionContext;
use crate::context::ThreadIdentity;
use crate::context::validate_context;
use crate::event::ExecutionEvent;
use crate::event::MessageEvent;
use crate::filament::Filament;
use crate::filament::FilamentFlags;
use crate::filament::FilamentRegistry;
use crate::guard::RoutineOutcome;
use crate::guard::call_routine;
use std::sync::Arc;

enum CaseOutcome {
    Completed,
    Failed(FailureKind),
    Aborted,
}

/// Runs setup, each selected test case framed by before/after, and
/// teardown of one fixture, applying the short-circuit policy of
/// [`ExecutionOptions::flags`].
pub struct FixtureExecutionAction {
    fixture: Arc<Fixture>,
    options: ExecutionOptions,
    selection: Option<usize>,
    registry: FilamentRegistry,
}

impl FixtureExecutionAction {
    /// Creates an action running every test case of `fixture` with the
    /// global filament registry.
    pub fn new(fixture: Arc<Fixture>, options: ExecutionOptions) -> Self {
        Self {
            fixture,
            options,
            selection: None,
            registry: FilamentRegistry::global().clone(),
        }
    }

    /// Runs only the test case named `name`.
    pub fn with_test_case(mut self, name: &str) -> Result<Self, RunError> {
        let index = self
            .fixture
            .test_cases()
            .iter()
            .position(|test_case| test_case.name() == name)
            .ok_or_else(|| RunError::UnknownTestCase {
                fixture: self.fixture.name().to_owned(),
                name: name.to_owned(),
            })?;
        self.selection = Some(index);
        Ok(self)
    }

    /// Binds routine threads in `registry` instead of the global registry.
    pub fn with_registry(mut self, registry: FilamentRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// The fixture this action runs.
    pub fn fixture(&self) -> &Arc<Fixture> {
        &self.fixture
    }

    fn filament_flags(&self) -> FilamentFlags {
        FilamentFlags::new().with_capture_stack_traces(self.options.capture_stack_traces)
    }

    fn selected_test_cases(&self) -> &[TestCase] {
        let test_cases = self.fixture.test_cases();
        match self.selection {
            Some(index) => &test_cases[index..=index],
            None => test_cases,
        }
    }

    fn failure(&self, kind: FailureKind) -> RunError {
        RunError::RoutineFailed {
            fixture: self.fixture.name().to_owned(),
            kind,
        }
    }

    /// Runs one routine in a filament of its own. Absent routines complete
    /// trivially.
    fn call(
        &self,
        context: &Arc<dyn ExecutionContext>,
        routine: Option<&Routine>,
    ) -> Result<RoutineOutcome, RunError> {
        let Some(routine) = routine else {
            return Ok(RoutineOutcome::RanToCompletion);
        };
        let filament = Filament::new(context.clone(), self.filament_flags());
        let outcome = call_routine(
            &self.registry,
            &filament,
            self.options.join_timeout,
            &|| routine(),
        )?;
        Ok(outcome)
    }

    fn run_test_case(
        &self,
        context: &Arc<dyn ExecutionContext>,
        test_case: &TestCase,
    ) -> Result<CaseOutcome, RunError> {
        match self.call(context, self.fixture.before())? {
            RoutineOutcome::RanToCompletion => {}
            RoutineOutcome::RoutineFailed => return Ok(CaseOutcome::Failed(FailureKind::Before)),
            RoutineOutcome::RunAborted => return Ok(CaseOutcome::Aborted),
        }

        // After runs whatever the test case did.
        let test = self.call(context, Some(test_case.routine()))?;
        let after = self.call(context, self.fixture.after())?;

        Ok(match (test, after) {
            (RoutineOutcome::RunAborted, _) | (_, RoutineOutcome::RunAborted) => {
                CaseOutcome::Aborted
            }
            (RoutineOutcome::RoutineFailed, _) => CaseOutcome::Failed(FailureKind::TestCase),
            (_, RoutineOutcome::RoutineFailed) => CaseOutcome::Failed(FailureKind::After),
            (RoutineOutcome::RanToCompletion, RoutineOutcome::RanToCompletion) => {
                CaseOutcome::Completed
            }
        })
    }

    /// Returns whether the loop ran to completion, and the error to
    /// propagate.
    fn run_test_cases(
        &self,
        context: &Arc<dyn ExecutionContext>,
        thread: &ThreadIdentity,
    ) -> (bool, Result<(), RunError>) {
        let flags = self.options.flags;
        let test_cases = self.selected_test_cases();
        for (index, test_case) in test_cases.iter().enumerate() {
            if let Err(err) = context.before_test_case_start(thread, test_case) {
                return (false, Err(err.into()));
            }

            let (completed, stop, error) = match self.run_test_case(context, test_case) {
                Ok(CaseOutcome::Completed) => (true, false, None),
                Ok(CaseOutcome::Failed(kind)) => {
                    tracing::debug!(
                        fixture = self.fixture.name(),
                        test_case = test_case.name(),
                        %kind,
                        "test case failed"
                    );
                    let stop = flags.short_circuit_fixture_on_failure()
                        || flags.short_circuit_run_on_failure();
                    let propagate = flags.short_circuit_run_on_failure()
                        || (flags.short_circuit_fixture_on_failure()
                            && flags.escalate_fixture_failures());
                    (false, stop, propagate.then(|| self.failure(kind)))
                }
                Ok(CaseOutcome::Aborted) => (false, true, Some(RunError::Aborted)),
                Err(err) => (false, true, Some(err)),
            };

            context.after_test_case_finish(thread, test_case, completed);

            if stop {
                let skipped = index + 1 < test_cases.len();
                if skipped {
                    tracing::debug!(
                        fixture = self.fixture.name(),
                        skipped = test_cases.len() - index - 1,
                        "short-circuiting fixture"
                    );
                }
                return (!skipped && error.is_none(), error.map_or(Ok(()), Err));
            }
        }
        (true, Ok(()))
    }

    fn run_routines(
        &self,
        context: &Arc<dyn ExecutionContext>,
        thread: &ThreadIdentity,
    ) -> (bool, Result<(), RunError>) {
        let flags = self.options.flags;
        let mut ran_to_completion = true;
        let mut result = Ok(());

        let run_test_cases = match self.call(context, self.fixture.setup()) {
            Ok(RoutineOutcome::RanToCompletion) => true,
            Ok(RoutineOutcome::RoutineFailed) => {
                tracing::debug!(fixture = self.fixture.name(), "setup failed");
                if flags.short_circuit_run_on_setup_failure() || flags.short_circuit_run_on_failure()
                {
                    return (false, Err(self.failure(FailureKind::Setup)));
                }
                // Teardown still runs and the run goes on.
                ran_to_completion = false;
                false
            }
            Ok(RoutineOutcome::RunAborted) => return (false, Err(RunError::Aborted)),
            Err(err) => return (false, Err(err)),
        };

        if run_test_cases {
            let (completed, cases_result) = self.run_test_cases(context, thread);
            ran_to_completion &= completed;
            result = cases_result;
        }

        match self.call(context, self.fixture.teardown()) {
            Ok(RoutineOutcome::RanToCompletion) => {}
            Ok(RoutineOutcome::RoutineFailed) => {
                tracing::debug!(fixture = self.fixture.name(), "teardown failed");
                ran_to_completion = false;
                if result.is_ok()
                    && (flags.escalate_fixture_failures() || flags.short_circuit_run_on_failure())
                {
                    result = Err(self.failure(FailureKind::Teardown));
                }
            }
            Ok(RoutineOutcome::RunAborted) => {
                ran_to_completion = false;
                result = Err(RunError::Aborted);
            }
            Err(err) => {
                ran_to_completion = false;
                if result.is_ok() {
                    result = Err(err);
                }
            }
        }

        (ran_to_completion, result)
    }
}

impl Action for FixtureExecutionAction {
    fn run(&self, context: &Arc<dyn ExecutionContext>) -> Result<(), RunError> {
        validate_context(context.as_ref())?;
        let fixture = &*self.fixture;
        let thread = ThreadIdentity::current();

        tracing::debug!(fixture = fixture.name(), "starting fixture");
        context.before_fixture_start(&thread, fixture)?;

        let default_filament = if fixture.flags().uses_anonymous_threads() {
            match self
                .registry
                .install_default_filament(context.clone(), self.filament_flags())
            {
                Ok(default_filament) => Some(default_filament),
                Err(err) => {
                    context.after_fixture_finish(&thread, fixture, false);
                    return Err(err.into());
                }
            }
        } else {
            None
        };

        let (mut ran_to_completion, result) = self.run_routines(context, &thread);

        if let Some(default_filament) = default_filament {
            if let Err(err) = default_filament
                .filament()
                .join_child_threads(self.options.join_timeout)
            {
                tracing::warn!(
                    fixture = fixture.name(),
                    error = &err as &dyn std::error::Error,
                    "anonymous threads did not finish"
                );
                context.report_event(
                    &thread,
                    &ExecutionEvent::Log(MessageEvent::new(format!(
                        "Threads of fixture {} still running after {:?}",
                        fixture.name(),
                        self.options.join_timeout
                    ))),
                );
                ran_to_completion = false;
            }
        }

        context.after_fixture_finish(&thread, fixture, ran_to_completion);
        tracing::debug!(
            fixture = fixture.name(),
            ran_to_completion,
            "finished fixture"
        );
        result
    }
}
