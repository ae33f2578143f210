// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! The preemptive, multi-CPU task scheduler core: task/thread
//! lifecycle, VM bookkeeping, socket IPC, interrupt and page-fault
//! routing, and kill machinery, all sitting on top of a host-supplied
//! [`platform::Platform`] implementation.
//!
//! This crate owns no architecture code of its own — a host binary
//! supplies one `Platform` implementation (real page tables, a real
//! timer, a real UART) and calls [`init`], then [`scheduler::run`].

#![no_std]

extern crate alloc;

pub mod config;
pub mod interrupts;
mod kill;
pub mod logging;
pub mod pid;
pub mod platform;
pub mod scheduler;
pub mod socket;
pub mod task;
pub mod thread;
pub mod vm;

/// Brings up logging against the already-installed platform. Hosts
/// call [`platform::init`] first, then this, before calling
/// [`scheduler::run`].
pub fn init(level: log::LevelFilter) {
    logging::init(level);
}
