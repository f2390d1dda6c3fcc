// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Fixture execution engine.
//!
//! A test module is a static table of fixtures, each holding optional
//! setup/teardown/before/after routines and an ordered list of test cases
//! (see [`catalog`]). Running a fixture is the job of
//! [`FixtureExecutionAction`]; several of them are composed into one run with
//! [`SequenceAction`].
//!
//! Every routine runs inside a *filament*: the group made up of the thread
//! that invoked the routine and any child threads it spawned. Threads are
//! bound to their filament through a [`FilamentRegistry`], which is how
//! assertion macros deep inside test code find the [`ExecutionContext`] to
//! report to without being handed one.
//!
//! A failed assertion does not return an error code through every frame of
//! test code. It unwinds to the routine boundary with a typed payload (see
//! [`signal`]), where [`guard::run_guarded`] turns it into a
//! [`RoutineOutcome`].

#![cfg_attr(not(windows), forbid(unsafe_code))]

pub mod action;
pub mod catalog;
pub mod context;
pub mod event;
pub mod filament;
pub mod fixture_action;
pub mod guard;
pub mod recorder;
pub mod report;
pub mod sequence;
pub mod signal;
pub mod thread;

pub use action::Action;
pub use action::ExecutionOptions;
pub use action::FailureKind;
pub use action::RunError;
pub use context::ContextError;
pub use context::ExecutionContext;
pub use context::ThreadIdentity;
pub use filament::Filament;
pub use filament::FilamentBinder;
pub use filament::FilamentError;
pub use filament::FilamentRegistry;
pub use fixture_action::FixtureExecutionAction;
pub use guard::RoutineOutcome;
pub use harness_defs::Disposition;
pub use harness_defs::EventType;
pub use harness_defs::ExecutionFlags;
pub use sequence::SequenceAction;
