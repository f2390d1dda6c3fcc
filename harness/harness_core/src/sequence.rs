// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Composition of actions into a run.

use crate::action::Action;
use crate::action::RunError;
use crate::context::ExecutionContext;
use parking_lot::Mutex;
use std::sync::Arc;
use thiserror::Error;

/// Errors from composing a [`SequenceAction`].
#[derive(Debug, Error)]
pub enum SequenceError {
    /// The sequence was added to itself.
    #[error("a sequence cannot contain itself")]
    SelfReference,
}

/// Runs its actions in order, stopping at the first one that fails the run.
#[derive(Default)]
pub struct SequenceAction {
    actions: Mutex<Vec<Arc<dyn Action>>>,
}

impl SequenceAction {
    /// Creates an empty sequence.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `action`.
    pub fn add(&self, action: Arc<dyn Action>) -> Result<(), SequenceError> {
        if std::ptr::addr_eq(Arc::as_ptr(&action), self as *const Self) {
            return Err(SequenceError::SelfReference);
        }
        self.actions.lock().push(action);
        Ok(())
    }

    /// Number of actions in the sequence.
    pub fn len(&self) -> usize {
        self.actions.lock().len()
    }

    /// Whether the sequence has no actions.
    pub fn is_empty(&self) -> bool {
        self.actions.lock().is_empty()
    }
}

impl Action for SequenceAction {
    fn run(&self, context: &Arc<dyn ExecutionContext>) -> Result<(), RunError> {
        // Actions added while the sequence runs take effect on the next run.
        let actions = self.actions.lock().clone();
        for action in actions {
            action.run(context)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::ExecutionOptions;
    use crate::catalog::FixtureBuilder;
    use crate::catalog::ModuleBuilder;
    use crate::fixture_action::FixtureExecutionAction;
    use crate::recorder::EventCounts;
    use crate::recorder::RecordingContext;
    use harness_defs::Disposition;
    use harness_defs::ExecutionFlags;

    fn module_sequence(flags: ExecutionFlags) -> Arc<SequenceAction> {
        let module = ModuleBuilder::new("module")
            .fixture(FixtureBuilder::new("A").setup(|| {}).teardown(|| {}))
            .fixture(
                FixtureBuilder::new("B")
                    .setup(|| {})
                    .test_case("one", || crate::harness_log!("one"))
                    .test_case("two", || crate::harness_assert!(false))
                    .teardown(|| {}),
            )
            .fixture(
                FixtureBuilder::new("C")
                    .before(|| {})
                    .after(|| {})
                    .test_case("three", || {})
                    .test_case("four", || crate::harness_inconclusive!("not sure")),
            )
            .build();

        let sequence = Arc::new(SequenceAction::new());
        let options = ExecutionOptions {
            flags,
            ..Default::default()
        };
        for fixture in module.fixtures() {
            sequence
                .add(Arc::new(FixtureExecutionAction::new(fixture.clone(), options)))
                .unwrap();
        }
        sequence
    }

    #[test]
    fn repeated_sequence_scales_counts() {
        let single = {
            let recorder = Arc::new(RecordingContext::new(Disposition::Continue));
            let context: Arc<dyn ExecutionContext> = recorder.clone();
            module_sequence(ExecutionFlags::new()).run(&context).unwrap();
            recorder.totals()
        };
        assert_eq!(single.before_fixture, 3);
        assert_eq!(single.after_test_case, 4);
        assert_eq!(single.test_cases_ran_to_completion, 3);
        assert_eq!(single.logs, 1);
        assert_eq!(single.failed_assertions, 1);
        assert_eq!(single.inconclusive, 1);

        for repeat in 0..=3u32 {
            let outer = SequenceAction::new();
            let inner = module_sequence(ExecutionFlags::new());
            for _ in 0..repeat {
                outer.add(inner.clone()).unwrap();
            }
            let recorder = Arc::new(RecordingContext::new(Disposition::Continue));
            let context: Arc<dyn ExecutionContext> = recorder.clone();
            outer.run(&context).unwrap();
            assert_eq!(recorder.totals(), single.scaled(repeat), "repeat {repeat}");
        }
    }

    #[test]
    fn empty_sequence_is_noop() {
        let recorder = Arc::new(RecordingContext::new(Disposition::Continue));
        let context: Arc<dyn ExecutionContext> = recorder.clone();
        SequenceAction::new().run(&context).unwrap();
        assert_eq!(recorder.totals(), EventCounts::default());
    }

    #[test]
    fn failure_stops_sequence() {
        let flags = ExecutionFlags::new().with_short_circuit_run_on_failure(true);
        // Without a debugger, Break fails the assertion's routine.
        let recorder = Arc::new(RecordingContext::new(Disposition::Break));
        let context: Arc<dyn ExecutionContext> = recorder.clone();
        let result = module_sequence(flags).run(&context);
        assert!(matches!(result, Err(RunError::RoutineFailed { ref fixture, .. }) if fixture == "B"));
        assert_eq!(recorder.totals().before_fixture, 2);
    }

    #[test]
    fn cannot_contain_itself() {
        let sequence = Arc::new(SequenceAction::new());
        assert!(matches!(
            sequence.add(sequence.clone()),
            Err(SequenceError::SelfReference)
        ));
        assert!(sequence.is_empty());
    }
}
