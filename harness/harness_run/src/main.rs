// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Console runner for harness test modules.

#![forbid(unsafe_code)]

mod console;
mod sample;

use anyhow::Context as _;
use clap::Parser;
use clap::ValueEnum;
use console::ConsoleContext;
use harness_core::Action;
use harness_core::Disposition;
use harness_core::ExecutionContext;
use harness_core::ExecutionFlags;
use harness_core::ExecutionOptions;
use harness_core::FixtureExecutionAction;
use harness_core::RunError;
use harness_core::SequenceAction;
use harness_core::catalog::Module;
use harness_defs::SINK_VERSION_3;
use harness_kernel::KernelClient;
use harness_kernel::KernelShim;
use std::sync::Arc;
use std::time::Duration;

const SAMPLE_DRIVER_ADDRESS: u64 = 0xffff_f800_1000_0000;

#[derive(Parser, Debug)]
#[command(
    name = "harness_run",
    about = "Run test fixtures and report the results",
    version,
    long_about = None
)]
struct Options {
    /// Skip the remaining test cases of a fixture after a failure
    #[arg(long)]
    short_circuit_fixture: bool,

    /// Abort the run when a setup routine fails
    #[arg(long)]
    short_circuit_setup: bool,

    /// Abort the run on any failure
    #[arg(long)]
    short_circuit_run: bool,

    /// Fail the run when a fixture was short-circuited
    #[arg(long)]
    escalate_fixture_failures: bool,

    /// Reaction to failed assertions and uncaught exceptions
    #[arg(long, value_enum, default_value_t = DispositionArg::Break)]
    disposition: DispositionArg,

    /// Seconds a routine waits for its child threads
    #[arg(long, value_name = "SECONDS", default_value_t = 60)]
    join_timeout_secs: u64,

    /// Attach stack traces to reported events
    #[arg(long)]
    stack_traces: bool,

    /// Run only the named fixture
    #[arg(long, value_name = "NAME")]
    fixture: Option<String>,

    /// Run only the named test case of the selected fixture
    #[arg(long, value_name = "NAME", requires = "fixture")]
    test_case: Option<String>,

    /// Run the sample driver through the kernel shim instead of the
    /// user-mode sample module
    #[arg(long)]
    kernel: bool,

    /// Maximum level of diagnostic output
    #[arg(long, default_value = "warn")]
    log_level: tracing::Level,
}

#[derive(ValueEnum, Debug, Copy, Clone)]
enum DispositionArg {
    Continue,
    Break,
    BreakAlways,
    Abort,
}

impl From<DispositionArg> for Disposition {
    fn from(value: DispositionArg) -> Self {
        match value {
            DispositionArg::Continue => Disposition::Continue,
            DispositionArg::Break => Disposition::Break,
            DispositionArg::BreakAlways => Disposition::BreakAlways,
            DispositionArg::Abort => Disposition::Abort,
        }
    }
}

impl Options {
    fn execution_options(&self) -> ExecutionOptions {
        ExecutionOptions {
            flags: ExecutionFlags::new()
                .with_short_circuit_fixture_on_failure(self.short_circuit_fixture)
                .with_short_circuit_run_on_setup_failure(self.short_circuit_setup)
                .with_short_circuit_run_on_failure(self.short_circuit_run)
                .with_escalate_fixture_failures(self.escalate_fixture_failures),
            join_timeout: Duration::from_secs(self.join_timeout_secs),
            capture_stack_traces: self.stack_traces,
        }
    }
}

fn build_sequence(module: &Module, options: &Options) -> anyhow::Result<SequenceAction> {
    let execution_options = options.execution_options();
    let sequence = SequenceAction::new();
    for fixture in module.fixtures() {
        if options
            .fixture
            .as_deref()
            .is_some_and(|name| name != fixture.name())
        {
            continue;
        }
        let mut action = FixtureExecutionAction::new(fixture.clone(), execution_options);
        if let Some(test_case) = &options.test_case {
            action = action.with_test_case(test_case)?;
        }
        sequence.add(Arc::new(action))?;
    }
    if let Some(name) = &options.fixture {
        anyhow::ensure!(!sequence.is_empty(), "no fixture named {name}");
    }
    Ok(sequence)
}

fn main() -> anyhow::Result<()> {
    let options = Options::parse();
    tracing_subscriber::fmt()
        .with_max_level(options.log_level)
        .with_writer(std::io::stderr)
        .init();

    // The driver handle keeps the sample driver connected for the run.
    let (module, _driver) = if options.kernel {
        let shim = KernelShim::new()
            .with_join_timeout(Duration::from_secs(options.join_timeout_secs));
        let driver = shim
            .connect_driver(SAMPLE_DRIVER_ADDRESS, SINK_VERSION_3, sample::driver_module)
            .context("failed to connect the sample driver")?;
        let module = KernelClient::new(shim)
            .load_module(SAMPLE_DRIVER_ADDRESS, "sample_driver")
            .context("failed to load the sample driver's module")?;
        (module, Some(driver))
    } else {
        (sample::user_module(), None)
    };

    let sequence = build_sequence(&module, &options)?;
    let console = Arc::new(ConsoleContext::new(options.disposition.into()));
    let context: Arc<dyn ExecutionContext> = console.clone();
    let result = sequence.run(&context);

    let summary = console.summary();
    println!(
        "[==========] {} of {} fixtures completed, {} test cases passed, {} failed",
        summary.fixtures_completed, summary.fixtures, summary.passed, summary.failed
    );
    match result {
        Ok(()) if summary.failed == 0 => Ok(()),
        Ok(()) => anyhow::bail!("{} test cases failed", summary.failed),
        Err(RunError::Aborted) => anyhow::bail!("run aborted"),
        Err(err) => Err(err).context("run failed"),
    }
}
