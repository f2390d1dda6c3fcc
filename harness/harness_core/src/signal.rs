// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Non-local exits out of test code.
//!
//! Test code that has to stop (a failed assertion with a failing
//! disposition, an inconclusive result, an explicit failure) unwinds with a
//! [`Signal`] payload. The routine boundary in [`crate::guard`] catches it and
//! maps it to a routine outcome. Any other unwind payload is treated as an
//! uncaught exception.

/// Unwind payloads raised by the reporting primitives.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Signal {
    /// The routine failed.
    TestFailed,
    /// The routine failed and the run must be aborted.
    TestFailedAbort,
    /// The routine could not decide its outcome.
    TestInconclusive,
    /// A debugger break was requested but no debugger is attached. Always
    /// propagates past the routine boundary.
    Breakpoint,
    /// The reporting thread has no routine boundary to unwind to.
    ThreadTerminated,
}

/// Unwinds the calling thread with `signal`.
pub fn raise(signal: Signal) -> ! {
    tracing::trace!(?signal, "raising");
    std::panic::resume_unwind(Box::new(signal))
}

/// Returns true if a debugger is attached to the process.
pub fn is_debugger_present() -> bool {
    sys::is_debugger_present()
}

/// Breaks into the attached debugger. Without one, unwinds with
/// [`Signal::Breakpoint`].
pub fn debug_break() {
    if !sys::debug_break() {
        raise(Signal::Breakpoint);
    }
}

#[cfg(windows)]
mod sys {
    #![expect(unsafe_code)]

    use windows_sys::Win32::System::Diagnostics::Debug::DebugBreak;
    use windows_sys::Win32::System::Diagnostics::Debug::IsDebuggerPresent;

    pub fn is_debugger_present() -> bool {
        // SAFETY: Function has no preconditions.
        unsafe { IsDebuggerPresent() != 0 }
    }

    pub fn debug_break() -> bool {
        if !is_debugger_present() {
            return false;
        }
        // SAFETY: A debugger is attached to handle the breakpoint exception.
        unsafe { DebugBreak() };
        true
    }
}

#[cfg(not(windows))]
mod sys {
    pub fn is_debugger_present() -> bool {
        false
    }

    pub fn debug_break() -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raise_carries_signal() {
        let payload = std::panic::catch_unwind(|| raise(Signal::TestInconclusive)).unwrap_err();
        assert_eq!(
            *payload.downcast::<Signal>().unwrap(),
            Signal::TestInconclusive
        );
    }

    #[cfg(not(windows))]
    #[test]
    fn break_without_debugger_raises() {
        let payload = std::panic::catch_unwind(debug_break).unwrap_err();
        assert_eq!(*payload.downcast::<Signal>().unwrap(), Signal::Breakpoint);
    }
}
