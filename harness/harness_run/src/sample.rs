// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Built-in test modules.

use harness_core::catalog::FixtureBuilder;
use harness_core::catalog::FixtureFlags;
use harness_core::catalog::Module;
use harness_core::catalog::ModuleBuilder;
use harness_core::filament::ValueTag;
use harness_core::harness_assert;
use harness_core::harness_assert_eq_u32;
use harness_core::harness_assert_msg;
use harness_core::harness_inconclusive;
use harness_core::harness_log;
use harness_core::report;
use harness_core::thread;
use harness_kernel::ReportSink;
use std::sync::Arc;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;

/// A user-mode module with passing and failing fixtures.
pub fn user_module() -> Arc<Module> {
    let counter = Arc::new(AtomicU32::new(0));
    ModuleBuilder::new("sample")
        .fixture(
            FixtureBuilder::new("Counter")
                .setup({
                    let counter = counter.clone();
                    move || counter.store(1, Ordering::SeqCst)
                })
                .before({
                    let counter = counter.clone();
                    move || harness_assert!(counter.load(Ordering::SeqCst) > 0)
                })
                .test_case("Increments", {
                    let counter = counter.clone();
                    move || {
                        let previous = counter.fetch_add(1, Ordering::SeqCst);
                        harness_assert_eq_u32!(previous + 1, counter.load(Ordering::SeqCst));
                    }
                })
                .test_case("ChildThreads", {
                    let counter = counter.clone();
                    move || {
                        let handles: Vec<_> = (0..4)
                            .filter_map(|_| {
                                let counter = counter.clone();
                                let spawned = thread::spawn(move || {
                                    counter.fetch_add(1, Ordering::SeqCst);
                                });
                                harness_assert_msg!(spawned.is_ok(), "spawn failed: {spawned:?}");
                                spawned.ok()
                            })
                            .collect();
                        for handle in handles {
                            harness_assert!(handle.join().is_ok());
                        }
                        harness_log!("counter at {}", counter.load(Ordering::SeqCst));
                    }
                })
                .test_case("PerTestValue", || {
                    if report::set_value(ValueTag::Default, 7).is_err() {
                        harness_inconclusive!("no filament");
                    }
                    harness_assert!(report::get_value(ValueTag::Default).ok() == Some(7));
                })
                .teardown(move || counter.store(0, Ordering::SeqCst)),
        )
        .fixture(
            FixtureBuilder::new("Failures")
                .test_case("FailedAssertion", || {
                    let answer = 6 * 7;
                    harness_assert_eq_u32!(41, answer);
                })
                .test_case("Panic", || panic!("unexpected state"))
                .test_case("Inconclusive", || harness_inconclusive!("needs hardware")),
        )
        .fixture(
            FixtureBuilder::new("AnonymousThreads")
                .flags(FixtureFlags::new().with_uses_anonymous_threads(true))
                .test_case("Worker", || {
                    let worker = std::thread::spawn(|| harness_log!("hello from a worker"));
                    harness_assert!(worker.join().is_ok());
                }),
        )
        .build()
}

/// The module of the sample driver, reporting through `sink`.
pub fn driver_module(sink: ReportSink) -> Arc<Module> {
    let passing = sink.clone();
    let failing = sink.clone();
    let threads = sink;
    ModuleBuilder::new("sample_driver")
        .fixture(
            FixtureBuilder::new("Driver")
                .test_case("Passes", move || {
                    passing.report_log(format_args!("running at passive level"));
                })
                .test_case("Compares", move || {
                    let value = 3u32;
                    failing.assert_equals_u32(4, value, file!(), "Compares", line!(), "value");
                })
                .test_case("SystemThread", move || {
                    let reporter = threads.clone();
                    let started = threads.create_system_thread(move || {
                        reporter.report_log(format_args!("system thread running"));
                    });
                    if started.is_err() {
                        threads.report_failed_assertion(
                            file!(),
                            "SystemThread",
                            line!(),
                            "create_system_thread",
                        );
                    }
                }),
        )
        .build()
}
