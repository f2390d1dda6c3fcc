// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The interface test drivers report through.

use crate::filament::KernelFilamentRegistry;
use crate::irql;
use crate::irql::Irql;
use harness_core::Disposition;
use harness_core::FilamentBinder;
use harness_core::event::ExecutionEvent;
use harness_core::event::MessageEvent;
use harness_core::filament::ValueTag;
use harness_core::report;
use harness_core::report::Verdict;
use harness_core::thread::SpawnError;
use harness_core::thread::spawn_child_thread;
use harness_defs::SINK_VERSION_1;
use harness_defs::SINK_VERSION_2;
use harness_defs::SINK_VERSION_3;
use std::fmt;
use std::thread::JoinHandle;
use thiserror::Error;

/// Errors from the report sink.
#[derive(Debug, Error)]
pub enum SinkError {
    /// The driver asked for a sink version the shim does not offer.
    #[error("report sink version {0:#x} is not supported")]
    UnsupportedVersion(u32),
    /// The method is newer than the sink version the driver asked for.
    #[error("{method} requires report sink version {required:#x}, the driver requested {version:#x}")]
    NotSupported {
        /// Name of the method.
        method: &'static str,
        /// First version offering the method.
        required: u32,
        /// Version the driver asked for.
        version: u32,
    },
    /// A system thread could not be started.
    #[error("failed to create system thread")]
    Spawn(#[from] SpawnError),
    /// The calling thread is not bound to a routine's filament.
    #[error("routine thread has no filament")]
    UnknownThread,
}

/// The versioned call-in interface handed to a connecting driver.
///
/// Methods report to the filament of the calling thread. Methods that end
/// the routine do so by unwinding, after lowering the level to
/// [`Irql::PASSIVE`] if needed.
#[derive(Clone)]
pub struct ReportSink {
    version: u32,
    registry: KernelFilamentRegistry,
}

impl ReportSink {
    pub(crate) fn new(version: u32, registry: KernelFilamentRegistry) -> Result<Self, SinkError> {
        match version {
            SINK_VERSION_1 | SINK_VERSION_2 | SINK_VERSION_3 => Ok(Self { version, registry }),
            _ => Err(SinkError::UnsupportedVersion(version)),
        }
    }

    /// The sink version the driver connected with.
    pub fn version(&self) -> u32 {
        self.version
    }

    fn require(&self, method: &'static str, required: u32) -> Result<(), SinkError> {
        if self.version < required {
            return Err(SinkError::NotSupported {
                method,
                required,
                version: self.version,
            });
        }
        Ok(())
    }

    fn apply(&self, verdict: Verdict) -> Disposition {
        if let Verdict::Raise(signal) = verdict {
            let level = irql::current();
            if level > Irql::PASSIVE {
                tracing::warn!(%level, ?signal, "routine unwinding at elevated IRQL");
                if let Ok(current) = self.registry.get_current(false) {
                    current.filament.context().report_event(
                        &current.identity,
                        &ExecutionEvent::Log(MessageEvent::new(format!(
                            "Testcase aborted at elevated IRQL {level}, lowering to PASSIVE_LEVEL"
                        ))),
                    );
                }
                irql::lower(Irql::PASSIVE);
            }
        }
        verdict.apply()
    }

    /// Reports a failed assertion.
    pub fn report_failed_assertion(
        &self,
        file: &str,
        routine: &str,
        line: u32,
        expression: &str,
    ) -> Disposition {
        self.apply(report::evaluate_failed_assertion(
            &self.registry,
            file,
            routine,
            line,
            expression.to_owned(),
        ))
    }

    /// Reports a failed assertion if `expected` and `actual` differ.
    pub fn assert_equals_u32(
        &self,
        expected: u32,
        actual: u32,
        file: &str,
        routine: &str,
        line: u32,
        expression: &str,
    ) -> Disposition {
        self.apply(report::evaluate_equals_u32(
            &self.registry,
            expected,
            actual,
            file,
            routine,
            line,
            expression,
        ))
    }

    /// Reports that the test is inconclusive and ends the routine.
    pub fn report_inconclusiveness(&self, message: &str) {
        self.apply(report::evaluate_inconclusiveness(
            &self.registry,
            message.to_owned(),
        ));
    }

    /// Reports a log message.
    pub fn report_log(&self, message: fmt::Arguments<'_>) {
        self.apply(report::evaluate_log(&self.registry, message.to_string()));
    }

    /// Reports a failed assertion with a formatted message. Version 2 and
    /// later.
    pub fn report_failed_assertion_format(
        &self,
        file: &str,
        routine: &str,
        line: u32,
        message: fmt::Arguments<'_>,
    ) -> Result<Disposition, SinkError> {
        self.require("report_failed_assertion_format", SINK_VERSION_2)?;
        Ok(self.apply(report::evaluate_failed_assertion(
            &self.registry,
            file,
            routine,
            line,
            message.to_string(),
        )))
    }

    /// Fails the routine without reporting an event. Version 2 and later.
    pub fn fail(&self) -> Result<(), SinkError> {
        self.require("fail", SINK_VERSION_2)?;
        self.apply(report::evaluate_fail(&self.registry));
        Ok(())
    }

    /// Reads a value slot of the routine's filament. Version 2 and later.
    pub fn get_value(&self, tag: ValueTag) -> Result<u64, SinkError> {
        self.require("get_value", SINK_VERSION_2)?;
        let filament = self
            .registry
            .get_current_filament(false)
            .map_err(|_| SinkError::UnknownThread)?;
        Ok(filament.get_value(tag))
    }

    /// Writes a value slot of the routine's filament. Version 2 and later.
    pub fn set_value(&self, tag: ValueTag, value: u64) -> Result<(), SinkError> {
        self.require("set_value", SINK_VERSION_2)?;
        let filament = self
            .registry
            .get_current_filament(false)
            .map_err(|_| SinkError::UnknownThread)?;
        filament.set_value(tag, value);
        Ok(())
    }

    /// Starts a thread that belongs to the calling routine. The routine
    /// call does not complete before the thread has finished.
    pub fn create_system_thread<F>(&self, f: F) -> Result<JoinHandle<()>, SinkError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.require("create_system_thread", SINK_VERSION_3)?;
        Ok(spawn_child_thread(&self.registry, None, f)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use harness_core::filament::Filament;
    use harness_core::filament::FilamentFlags;
    use harness_core::recorder::RecordingContext;
    use harness_core::signal::Signal;
    use std::panic::AssertUnwindSafe;
    use std::panic::catch_unwind;
    use std::sync::Arc;

    #[test]
    fn versions() {
        let registry = KernelFilamentRegistry::new();
        assert!(matches!(
            ReportSink::new(0x1500, registry.clone()),
            Err(SinkError::UnsupportedVersion(0x1500))
        ));

        let sink = ReportSink::new(SINK_VERSION_1, registry.clone()).unwrap();
        assert!(matches!(
            sink.fail(),
            Err(SinkError::NotSupported { required: SINK_VERSION_2, .. })
        ));
        assert!(matches!(
            sink.get_value(ValueTag::Default),
            Err(SinkError::NotSupported { .. })
        ));

        let sink = ReportSink::new(SINK_VERSION_2, registry).unwrap();
        assert!(matches!(
            sink.create_system_thread(|| {}),
            Err(SinkError::NotSupported { required: SINK_VERSION_3, .. })
        ));
    }

    #[test]
    fn unknown_thread_continues() {
        let sink = ReportSink::new(SINK_VERSION_3, KernelFilamentRegistry::new()).unwrap();
        assert_eq!(
            sink.report_failed_assertion("f.rs", "r", 1, "x"),
            Disposition::Continue
        );
        sink.report_inconclusiveness("nobody listens");
        assert!(matches!(
            sink.get_value(ValueTag::Default),
            Err(SinkError::UnknownThread)
        ));
    }

    #[test]
    fn abort_at_elevated_irql_lowers_first() {
        let registry = KernelFilamentRegistry::new();
        let sink = ReportSink::new(SINK_VERSION_2, registry.clone()).unwrap();
        let context = Arc::new(RecordingContext::new(Disposition::Abort));
        let filament = Filament::new(context.clone(), FilamentFlags::new());
        registry.set_current_filament(&filament).unwrap();

        irql::raise(Irql::DISPATCH);
        let payload = catch_unwind(AssertUnwindSafe(|| {
            sink.report_failed_assertion("f.rs", "r", 1, "x");
        }))
        .unwrap_err();
        assert_eq!(*payload.downcast::<Signal>().unwrap(), Signal::TestFailedAbort);
        assert_eq!(irql::current(), Irql::PASSIVE);

        let totals = context.totals();
        assert_eq!(totals.failed_assertions, 1);
        assert_eq!(totals.logs, 1);
        registry.reset_current_filament();
    }
}
