// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Reporting primitives for test code.
//!
//! The `evaluate_*` functions report an event to the calling thread's
//! filament and return a [`Verdict`] without acting on it, so that callers
//! running in a restricted environment can prepare before unwinding. The
//! `report_*` functions and the `harness_*!` macros act on the verdict
//! directly, using [`FilamentRegistry::global`].

use crate::event::ExecutionEvent;
use crate::event::FailedAssertion;
use crate::event::MessageEvent;
use crate::filament::CurrentThread;
use crate::filament::FilamentBinder;
use crate::filament::FilamentError;
use crate::filament::FilamentRegistry;
use crate::filament::UnknownThreadPolicy;
use crate::filament::ValueTag;
use crate::signal;
use crate::signal::Signal;
use harness_defs::Disposition;
use std::fmt;

/// What the reporting thread must do next.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Return to test code.
    Continue,
    /// Return to test code, which breaks into the debugger.
    Break,
    /// Unwind with the signal.
    Raise(Signal),
}

impl Verdict {
    /// Acts on the verdict. Returns only for [`Verdict::Continue`] and
    /// [`Verdict::Break`].
    pub fn apply(self) -> Disposition {
        match self {
            Verdict::Continue => Disposition::Continue,
            Verdict::Break => Disposition::Break,
            Verdict::Raise(signal) => signal::raise(signal),
        }
    }
}

fn current(binder: &dyn FilamentBinder, what: &str) -> Result<CurrentThread, Verdict> {
    binder.get_current(true).map_err(|err| match binder.unknown_thread_policy() {
        UnknownThreadPolicy::Terminate => {
            tracing::error!(
                error = &err as &dyn std::error::Error,
                "{what} reported on a thread without filament, terminating thread"
            );
            Verdict::Raise(Signal::ThreadTerminated)
        }
        UnknownThreadPolicy::Ignore => {
            tracing::warn!(
                error = &err as &dyn std::error::Error,
                "{what} reported on a thread without filament, ignoring"
            );
            Verdict::Continue
        }
    })
}

/// Threads without a routine boundary cannot fail a routine; they end
/// instead.
fn failure(current: &CurrentThread, signal: Signal) -> Verdict {
    if current.guarded {
        Verdict::Raise(signal)
    } else {
        Verdict::Raise(Signal::ThreadTerminated)
    }
}

/// Reports a failed assertion.
pub fn evaluate_failed_assertion(
    binder: &dyn FilamentBinder,
    file: &str,
    routine: &str,
    line: u32,
    expression: String,
) -> Verdict {
    let current = match current(binder, "failed assertion") {
        Ok(current) => current,
        Err(verdict) => return verdict,
    };
    let event = ExecutionEvent::FailedAssertion(FailedAssertion {
        file: file.to_owned(),
        routine: routine.to_owned(),
        line,
        expression,
        stack_trace: current.filament.capture_stack_trace(),
    });
    match current
        .filament
        .context()
        .report_event(&current.identity, &event)
    {
        Disposition::Continue => Verdict::Continue,
        Disposition::BreakAlways => Verdict::Break,
        Disposition::Break => {
            if signal::is_debugger_present() {
                Verdict::Break
            } else {
                failure(&current, Signal::TestFailed)
            }
        }
        Disposition::Abort => failure(&current, Signal::TestFailedAbort),
    }
}

/// Compares two values and reports a failed assertion if they differ.
pub fn evaluate_equals_u32(
    binder: &dyn FilamentBinder,
    expected: u32,
    actual: u32,
    file: &str,
    routine: &str,
    line: u32,
    expression: &str,
) -> Verdict {
    if expected == actual {
        return Verdict::Continue;
    }
    evaluate_failed_assertion(
        binder,
        file,
        routine,
        line,
        comparison_message(expected, actual, expression),
    )
}

/// The expression text reported for a failed `u32` comparison.
pub fn comparison_message(expected: u32, actual: u32, expression: &str) -> String {
    format!(
        "Comparison failed. Expected: 0x{expected:08X}, Actual: 0x{actual:08X} (Expression: {expression})"
    )
}

/// Reports that the routine cannot decide its outcome. The verdict always
/// ends the routine on threads with a filament.
pub fn evaluate_inconclusiveness(binder: &dyn FilamentBinder, message: String) -> Verdict {
    let current = match current(binder, "inconclusiveness") {
        Ok(current) => current,
        Err(verdict) => return verdict,
    };
    let event = ExecutionEvent::Inconclusiveness(MessageEvent {
        message,
        stack_trace: current.filament.capture_stack_trace(),
    });
    current
        .filament
        .context()
        .report_event(&current.identity, &event);
    failure(&current, Signal::TestInconclusive)
}

/// Reports an informational message.
pub fn evaluate_log(binder: &dyn FilamentBinder, message: String) -> Verdict {
    let current = match current(binder, "log message") {
        Ok(current) => current,
        Err(verdict) => return verdict,
    };
    let event = ExecutionEvent::Log(MessageEvent {
        message,
        stack_trace: current.filament.capture_stack_trace(),
    });
    current
        .filament
        .context()
        .report_event(&current.identity, &event);
    Verdict::Continue
}

/// Fails the routine without reporting an event.
pub fn evaluate_fail(binder: &dyn FilamentBinder) -> Verdict {
    match current(binder, "failure") {
        Ok(current) => failure(&current, Signal::TestFailed),
        Err(verdict) => verdict,
    }
}

/// Reports a failed assertion of the calling thread to its filament's
/// context. Used by [`harness_assert!`](crate::harness_assert).
pub fn report_failed_assertion(file: &str, routine: &str, line: u32, expression: &str) -> Disposition {
    evaluate_failed_assertion(
        FilamentRegistry::global(),
        file,
        routine,
        line,
        expression.to_owned(),
    )
    .apply()
}

/// Like [`report_failed_assertion`] with a formatted message in place of
/// the expression.
pub fn report_failed_assertion_format(
    file: &str,
    routine: &str,
    line: u32,
    message: fmt::Arguments<'_>,
) -> Disposition {
    evaluate_failed_assertion(
        FilamentRegistry::global(),
        file,
        routine,
        line,
        message.to_string(),
    )
    .apply()
}

/// Reports a failed assertion if `expected` and `actual` differ.
pub fn assert_equals_u32(
    expected: u32,
    actual: u32,
    file: &str,
    routine: &str,
    line: u32,
    expression: &str,
) -> Disposition {
    evaluate_equals_u32(
        FilamentRegistry::global(),
        expected,
        actual,
        file,
        routine,
        line,
        expression,
    )
    .apply()
}

/// Reports that the calling test is inconclusive and fails its routine.
pub fn report_inconclusiveness(message: fmt::Arguments<'_>) {
    evaluate_inconclusiveness(FilamentRegistry::global(), message.to_string()).apply();
}

/// Reports a log message of the calling thread.
pub fn report_log(message: fmt::Arguments<'_>) {
    evaluate_log(FilamentRegistry::global(), message.to_string()).apply();
}

/// Fails the calling routine without reporting an event.
pub fn fail() {
    evaluate_fail(FilamentRegistry::global()).apply();
}

/// Reads a value slot of the calling thread's filament.
pub fn get_value(tag: ValueTag) -> Result<u64, FilamentError> {
    Ok(FilamentRegistry::global()
        .get_current_filament(true)?
        .get_value(tag))
}

/// Writes a value slot of the calling thread's filament.
pub fn set_value(tag: ValueTag, value: u64) -> Result<(), FilamentError> {
    FilamentRegistry::global()
        .get_current_filament(true)?
        .set_value(tag, value);
    Ok(())
}

/// Fails the routine if `cond` does not hold.
#[macro_export]
macro_rules! harness_assert {
    ($cond:expr $(,)?) => {
        if !$cond
            && $crate::report::report_failed_assertion(
                file!(),
                module_path!(),
                line!(),
                stringify!($cond),
            ) == $crate::Disposition::Break
        {
            $crate::signal::debug_break();
        }
    };
}

/// Fails the routine with a formatted message if `cond` does not hold.
#[macro_export]
macro_rules! harness_assert_msg {
    ($cond:expr, $($arg:tt)+) => {
        if !$cond
            && $crate::report::report_failed_assertion_format(
                file!(),
                module_path!(),
                line!(),
                format_args!($($arg)+),
            ) == $crate::Disposition::Break
        {
            $crate::signal::debug_break();
        }
    };
}

/// Fails the routine if two `u32` values differ.
#[macro_export]
macro_rules! harness_assert_eq_u32 {
    ($expected:expr, $actual:expr $(,)?) => {
        if $crate::report::assert_equals_u32(
            $expected,
            $actual,
            file!(),
            module_path!(),
            line!(),
            stringify!($actual),
        ) == $crate::Disposition::Break
        {
            $crate::signal::debug_break();
        }
    };
}

/// Ends the routine as inconclusive.
#[macro_export]
macro_rules! harness_inconclusive {
    ($($arg:tt)+) => {
        $crate::report::report_inconclusiveness(format_args!($($arg)+))
    };
}

/// Logs a message to the execution context.
#[macro_export]
macro_rules! harness_log {
    ($($arg:tt)+) => {
        $crate::report::report_log(format_args!($($arg)+))
    };
}

/// Fails the routine.
#[macro_export]
macro_rules! harness_fail {
    () => {
        $crate::report::fail()
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filament::Filament;
    use crate::filament::FilamentFlags;
    use crate::recorder::RecordingContext;
    use std::sync::Arc;

    fn bound(disposition: Disposition) -> (FilamentRegistry, Arc<RecordingContext>, Arc<Filament>) {
        let registry = FilamentRegistry::new();
        let context = Arc::new(RecordingContext::new(disposition));
        let filament = Filament::new(context.clone(), FilamentFlags::new());
        registry.set_current_filament(&filament).unwrap();
        (registry, context, filament)
    }

    #[test]
    fn failed_assertion_dispositions() {
        let (registry, context, _filament) = bound(Disposition::Continue);
        let verdict = evaluate_failed_assertion(&registry, "f.rs", "r", 1, "x".into());
        assert_eq!(verdict, Verdict::Continue);

        context.set_failed_assertion_disposition(Disposition::BreakAlways);
        let verdict = evaluate_failed_assertion(&registry, "f.rs", "r", 1, "x".into());
        assert_eq!(verdict, Verdict::Break);

        context.set_failed_assertion_disposition(Disposition::Abort);
        let verdict = evaluate_failed_assertion(&registry, "f.rs", "r", 1, "x".into());
        assert_eq!(verdict, Verdict::Raise(Signal::TestFailedAbort));

        context.set_failed_assertion_disposition(Disposition::Break);
        let verdict = evaluate_failed_assertion(&registry, "f.rs", "r", 1, "x".into());
        if signal::is_debugger_present() {
            assert_eq!(verdict, Verdict::Break);
        } else {
            assert_eq!(verdict, Verdict::Raise(Signal::TestFailed));
        }

        assert_eq!(context.totals().failed_assertions, 4);
        registry.reset_current_filament();
    }

    #[test]
    fn comparison() {
        let (registry, context, _filament) = bound(Disposition::Continue);
        assert_eq!(
            evaluate_equals_u32(&registry, 1, 1, "f.rs", "r", 3, "x"),
            Verdict::Continue
        );
        assert_eq!(context.totals().failed_assertions, 0);

        evaluate_equals_u32(&registry, 0x10, 0xabc, "f.rs", "r", 3, "x");
        let events = context.events();
        let ExecutionEvent::FailedAssertion(assertion) = &events[0] else {
            panic!("unexpected event {:?}", events[0]);
        };
        assert_eq!(
            assertion.expression,
            "Comparison failed. Expected: 0x00000010, Actual: 0x00000ABC (Expression: x)"
        );
        assert_eq!(assertion.line, 3);
        registry.reset_current_filament();
    }

    #[test]
    fn inconclusive_and_log() {
        let (registry, context, _filament) = bound(Disposition::Continue);
        assert_eq!(evaluate_log(&registry, "hi".into()), Verdict::Continue);
        assert_eq!(
            evaluate_inconclusiveness(&registry, "unsure".into()),
            Verdict::Raise(Signal::TestInconclusive)
        );
        assert_eq!(evaluate_fail(&registry), Verdict::Raise(Signal::TestFailed));

        let totals = context.totals();
        assert_eq!(totals.logs, 1);
        assert_eq!(totals.inconclusive, 1);
        registry.reset_current_filament();
    }

    #[test]
    fn unknown_thread_terminates() {
        let registry = FilamentRegistry::new();
        assert_eq!(
            evaluate_failed_assertion(&registry, "f.rs", "r", 1, "x".into()),
            Verdict::Raise(Signal::ThreadTerminated)
        );
        assert_eq!(
            evaluate_log(&registry, "lost".into()),
            Verdict::Raise(Signal::ThreadTerminated)
        );
    }

    #[test]
    fn anonymous_thread_failure_terminates_thread() {
        let registry = FilamentRegistry::new();
        let context = Arc::new(RecordingContext::new(Disposition::Abort));
        let _default = registry
            .install_default_filament(context.clone(), FilamentFlags::new())
            .unwrap();
        let thread_registry = registry.clone();
        let verdict = std::thread::spawn(move || {
            evaluate_failed_assertion(&thread_registry, "f.rs", "r", 1, "x".into())
        })
        .join()
        .unwrap();
        assert_eq!(verdict, Verdict::Raise(Signal::ThreadTerminated));
        assert_eq!(context.totals().failed_assertions, 1);
    }
}
