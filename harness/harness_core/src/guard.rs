// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The routine boundary.
//!
//! Test code is run under [`run_guarded`], which catches every unwind that
//! leaves it and classifies the result. Signals raised by the reporting
//! primitives map to outcomes directly. Anything else is an uncaught
//! exception that is reported to the execution context first.

use crate::context::ThreadIdentity;
use crate::event::ExecutionEvent;
use crate::event::MAX_STACK_FRAMES;
use crate::event::MessageEvent;
use crate::event::StackTrace;
use crate::event::UncaughtException;
use crate::filament::Filament;
use crate::filament::FilamentBinder;
use crate::filament::FilamentError;
use crate::signal::Signal;
use harness_defs::Disposition;
use std::any::Any;
use std::cell::Cell;
use std::cell::RefCell;
use std::panic::AssertUnwindSafe;
use std::panic::catch_unwind;
use std::sync::Arc;
use std::sync::Once;
use std::time::Duration;

thread_local! {
    // Set while guarded code that wants stack traces runs on this thread.
    static CAPTURE_ON_PANIC: Cell<bool> = const { Cell::new(false) };
    // Stack of the last panic on this thread, captured by the panic hook.
    static PANIC_STACK: RefCell<Option<StackTrace>> = const { RefCell::new(None) };
}

static PANIC_HOOK: Once = Once::new();

/// Chains a panic hook that records the panicking stack for guarded code, since
/// the stack is gone by the time the unwind reaches the boundary.
fn install_panic_hook() {
    PANIC_HOOK.call_once(|| {
        let hook = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            if CAPTURE_ON_PANIC.try_with(Cell::get).unwrap_or(false) {
                let stack = StackTrace::capture(MAX_STACK_FRAMES);
                let _ = PANIC_STACK.try_with(|slot| *slot.borrow_mut() = Some(stack));
            }
            hook(info);
        }));
    });
}

/// How a routine ended, ordered by severity.
#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum RoutineOutcome {
    /// The routine returned normally.
    RanToCompletion = 0,
    /// The routine failed.
    RoutineFailed = 1,
    /// The routine failed and the run must stop.
    RunAborted = 2,
}

impl RoutineOutcome {
    pub(crate) fn from_raw(value: u8) -> Self {
        match value {
            0 => Self::RanToCompletion,
            1 => Self::RoutineFailed,
            _ => Self::RunAborted,
        }
    }
}

/// Result of running code under the routine boundary.
pub enum Guarded {
    /// The code finished or unwound to the boundary.
    Outcome(RoutineOutcome),
    /// The unwind must continue past the boundary once the caller has
    /// cleaned up. Pass the payload to [`std::panic::resume_unwind`].
    Reraise(Box<dyn Any + Send>),
}

impl Guarded {
    /// The outcome to record, and the payload to re-raise, if any.
    pub fn into_parts(self) -> (RoutineOutcome, Option<Box<dyn Any + Send>>) {
        match self {
            Guarded::Outcome(outcome) => (outcome, None),
            Guarded::Reraise(payload) => (RoutineOutcome::RoutineFailed, Some(payload)),
        }
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    // The payload is almost always either a `&str` or a `String`, since
    // that's what `panic!` produces.
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(|x| x.as_str()))
        .unwrap_or("panic (unknown payload type)")
        .to_owned()
}

/// Runs `f` on the calling thread, which reports as `thread` of `filament`.
pub fn run_guarded(filament: &Filament, thread: &ThreadIdentity, f: impl FnOnce()) -> Guarded {
    let capture = filament.flags().capture_stack_traces();
    if capture {
        install_panic_hook();
    }
    PANIC_STACK.take();
    let previous = CAPTURE_ON_PANIC.replace(capture);
    let result = catch_unwind(AssertUnwindSafe(f));
    CAPTURE_ON_PANIC.set(previous);
    let panic_stack = PANIC_STACK.take();

    let payload = match result {
        Ok(()) => return Guarded::Outcome(RoutineOutcome::RanToCompletion),
        Err(payload) => payload,
    };

    let payload = match payload.downcast::<Signal>() {
        Ok(signal) => {
            tracing::debug!(signal = ?*signal, thread = ?thread.thread, "routine unwound");
            return match *signal {
                Signal::TestFailed | Signal::TestInconclusive | Signal::ThreadTerminated => {
                    Guarded::Outcome(RoutineOutcome::RoutineFailed)
                }
                Signal::TestFailedAbort => Guarded::Outcome(RoutineOutcome::RunAborted),
                Signal::Breakpoint => Guarded::Reraise(signal),
            };
        }
        Err(payload) => payload,
    };

    let exception = UncaughtException {
        message: panic_message(&*payload),
        // Unwinds that skip the panic hook have no recorded stack.
        stack_trace: panic_stack.or_else(|| filament.capture_stack_trace()),
    };
    tracing::warn!(
        thread = ?thread.thread,
        message = exception.message.as_str(),
        "uncaught exception in test code"
    );

    let context = filament.context();
    context.on_unhandled_exception(thread, &exception);
    match context.report_event(thread, &ExecutionEvent::UncaughtException(exception)) {
        Disposition::Break | Disposition::BreakAlways => Guarded::Reraise(payload),
        Disposition::Abort => Guarded::Outcome(RoutineOutcome::RunAborted),
        Disposition::Continue => Guarded::Outcome(RoutineOutcome::RoutineFailed),
    }
}

/// Waits for the child threads of `filament` and folds their outcomes into
/// `outcome`. Child threads still running after `join_timeout` fail the
/// routine.
pub fn join_and_fold(
    filament: &Filament,
    thread: &ThreadIdentity,
    join_timeout: Duration,
    outcome: RoutineOutcome,
) -> RoutineOutcome {
    let mut outcome = outcome;
    if let Err(err) = filament.join_child_threads(join_timeout) {
        tracing::warn!(
            error = &err as &dyn std::error::Error,
            "child threads did not finish"
        );
        filament.context().report_event(
            thread,
            &ExecutionEvent::Log(MessageEvent::new(format!(
                "Child threads still running after {join_timeout:?}, failing routine"
            ))),
        );
        outcome = outcome.max(RoutineOutcome::RoutineFailed);
    }
    outcome.max(filament.child_outcome())
}

/// Runs `routine` as the main thread of `filament`.
///
/// Binds the calling thread for the duration of the call, waits for child
/// threads, and unbinds again. A breakpoint that could not be delivered
/// keeps unwinding after the cleanup.
pub fn call_routine(
    binder: &dyn FilamentBinder,
    filament: &Arc<Filament>,
    join_timeout: Duration,
    routine: &dyn Fn(),
) -> Result<RoutineOutcome, FilamentError> {
    binder.set_current_filament(filament)?;
    let thread = filament.identity(std::thread::current().id());

    let (outcome, reraise) = run_guarded(filament, &thread, routine).into_parts();
    let outcome = join_and_fold(filament, &thread, join_timeout, outcome);
    binder.reset_current_filament();

    if let Some(payload) = reraise {
        std::panic::resume_unwind(payload);
    }
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filament::FilamentFlags;
    use crate::filament::FilamentRegistry;
    use crate::recorder::RecordingContext;
    use crate::signal;

    fn new_filament(disposition: Disposition) -> (Arc<RecordingContext>, Arc<Filament>) {
        let context = Arc::new(RecordingContext::new(disposition));
        let filament = Filament::new(context.clone(), FilamentFlags::new());
        (context, filament)
    }

    #[test]
    fn signals_map_to_outcomes() {
        let (_, filament) = new_filament(Disposition::Continue);
        let thread = filament.identity(std::thread::current().id());
        let run = |signal| {
            run_guarded(&filament, &thread, || signal::raise(signal))
                .into_parts()
                .0
        };
        assert_eq!(run(Signal::TestFailed), RoutineOutcome::RoutineFailed);
        assert_eq!(run(Signal::TestInconclusive), RoutineOutcome::RoutineFailed);
        assert_eq!(run(Signal::ThreadTerminated), RoutineOutcome::RoutineFailed);
        assert_eq!(run(Signal::TestFailedAbort), RoutineOutcome::RunAborted);

        let guarded = run_guarded(&filament, &thread, || signal::raise(Signal::Breakpoint));
        let (_, payload) = guarded.into_parts();
        assert_eq!(
            *payload.unwrap().downcast::<Signal>().unwrap(),
            Signal::Breakpoint
        );
    }

    #[test]
    fn uncaught_panic_is_reported() {
        let (context, filament) = new_filament(Disposition::Continue);
        let thread = filament.identity(std::thread::current().id());
        let (outcome, payload) =
            run_guarded(&filament, &thread, || panic!("boom {}", 1)).into_parts();
        assert_eq!(outcome, RoutineOutcome::RoutineFailed);
        assert!(payload.is_none());

        let totals = context.totals();
        assert_eq!(totals.uncaught_exceptions, 1);
        assert_eq!(context.unhandled_exceptions(), ["boom 1"]);
    }

    #[test]
    fn uncaught_panic_dispositions() {
        let (_, filament) = new_filament(Disposition::Abort);
        let thread = filament.identity(std::thread::current().id());
        let (outcome, _) = run_guarded(&filament, &thread, || panic!("boom")).into_parts();
        assert_eq!(outcome, RoutineOutcome::RunAborted);

        let (_, filament) = new_filament(Disposition::Break);
        let (_, payload) = run_guarded(&filament, &thread, || panic!("boom")).into_parts();
        assert_eq!(panic_message(&*payload.unwrap()), "boom");
    }

    #[test]
    fn call_routine_unbinds() {
        let registry = FilamentRegistry::new();
        let (_, filament) = new_filament(Disposition::Continue);
        let outcome = call_routine(&registry, &filament, Duration::from_secs(1), &|| {
            assert!(registry.get_current(false).is_ok());
        })
        .unwrap();
        assert_eq!(outcome, RoutineOutcome::RanToCompletion);
        assert_eq!(registry.bound_threads(), 0);
    }

    #[test]
    fn breakpoint_propagates_after_cleanup() {
        let registry = FilamentRegistry::new();
        let (_, filament) = new_filament(Disposition::Continue);
        let payload = catch_unwind(AssertUnwindSafe(|| {
            call_routine(&registry, &filament, Duration::from_secs(1), &|| {
                signal::raise(Signal::Breakpoint)
            })
        }))
        .unwrap_err();
        assert_eq!(*payload.downcast::<Signal>().unwrap(), Signal::Breakpoint);
        assert_eq!(registry.bound_threads(), 0);
    }

    #[inline(never)]
    fn panicking_routine() {
        panic!("out of range");
    }

    #[test]
    fn uncaught_panic_carries_panicking_stack() {
        let context = Arc::new(RecordingContext::new(Disposition::Continue));
        let filament = Filament::new(
            context.clone(),
            FilamentFlags::new().with_capture_stack_traces(true),
        );
        let thread = filament.identity(std::thread::current().id());
        let (outcome, _) = run_guarded(&filament, &thread, panicking_routine).into_parts();
        assert_eq!(outcome, RoutineOutcome::RoutineFailed);

        let stack_trace = context
            .events()
            .into_iter()
            .find_map(|event| match event {
                ExecutionEvent::UncaughtException(exception) => exception.stack_trace,
                _ => None,
            })
            .unwrap();
        assert!(
            stack_trace
                .frames
                .iter()
                .any(|frame| frame.contains("panicking_routine")),
            "{stack_trace:?}"
        );

        // Signals unwind without a panic and leave nothing behind.
        run_guarded(&filament, &thread, || signal::raise(Signal::TestFailed));
        assert!(PANIC_STACK.take().is_none());
    }
}
