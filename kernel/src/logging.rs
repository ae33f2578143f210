// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Routes the `log` facade through the installed [`crate::platform::
//! LogSink`] — the no_std analogue of the teacher's `_print` macro
//! writing to its `SerialPort`, minus the host-specific transport.

use crate::platform;
use alloc::string::String;
use core::fmt::Write;
use log::{LevelFilter, Log, Metadata, Record};

struct KernelLogger;

static LOGGER: KernelLogger = KernelLogger;

impl Log for KernelLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let mut line = String::new();
        let _ = write!(line, "[{}] {}\n", record.level(), record.args());
        platform::platform().write_str(&line);
    }

    fn flush(&self) {}
}

/// Installs the global logger at `level`. Call once, after
/// `platform::init`.
///
/// # Panics
///
/// Panics if called more than once.
pub fn init(level: LevelFilter) {
    log::set_logger(&LOGGER).expect("logging::init called more than once");
    log::set_max_level(level);
}
