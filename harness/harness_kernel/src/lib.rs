// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Kernel-mode side of the harness, hosted in-process.
//!
//! Test drivers connect to the [`KernelShim`] with their fixture catalog and
//! receive a [`ReportSink`] to report through. User-mode clients drive the
//! shim through [`KernelShim::device_control`]: they query the serialized
//! catalog of a connected driver, then call its routines one at a time and
//! receive the outcome together with the events the routine reported,
//! serialized into the output buffer.
//!
//! Interrupt request levels are simulated per thread (see [`irql`]) so that
//! the rules around elevated priority can be exercised.

#![forbid(unsafe_code)]

pub mod adapter;
pub mod channel;
pub mod client;
pub mod connection;
pub mod event_buffer;
pub mod filament;
pub mod ioctl;
pub mod irql;
pub mod registry;
pub mod shim;
pub mod sink;

pub use client::KernelClient;
pub use connection::DriverConnection;
pub use connection::DriverHandle;
pub use registry::ConnectionRegistry;
pub use shim::KernelShim;
pub use sink::ReportSink;
