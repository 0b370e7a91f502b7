// Copyright 2023 The TandemOS Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Log facade backend for the init domain.
//!
//! Formats records into a bounded buffer and hands them to a sink: the
//! kernel console syscall on hardware, a collector in tests. Oversize
//! messages are truncated with a trailing "...".

use core::fmt;
use core::fmt::Write;
use log::{Metadata, Record};
use spin::Mutex;

pub const MAX_MSG_LEN: usize = 2048;

pub type LogSink = fn(level: log::Level, msg: &str);

struct BoundedWriter {
    buf: [u8; MAX_MSG_LEN],
    pos: usize,
}

impl BoundedWriter {
    fn new() -> Self {
        BoundedWriter {
            buf: [0u8; MAX_MSG_LEN],
            pos: 0,
        }
    }
    fn truncate_with_ellipsis(&mut self) {
        self.pos = MAX_MSG_LEN - 3;
        self.buf[self.pos..].copy_from_slice(b"...");
        self.pos = MAX_MSG_LEN;
    }
    fn as_str(&self) -> &str {
        // Only complete &str fragments are ever written.
        unsafe { core::str::from_utf8_unchecked(&self.buf[..self.pos]) }
    }
}

impl fmt::Write for BoundedWriter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let bytes = s.as_bytes();
        if self.pos + bytes.len() > MAX_MSG_LEN {
            return Err(fmt::Error);
        }
        self.buf[self.pos..self.pos + bytes.len()].copy_from_slice(bytes);
        self.pos += bytes.len();
        Ok(())
    }
}

pub struct TandemLogger {
    sink: Mutex<LogSink>,
}

impl TandemLogger {
    pub const fn new(sink: LogSink) -> Self {
        TandemLogger {
            sink: Mutex::new(sink),
        }
    }

    pub fn set_sink(&self, sink: LogSink) { *self.sink.lock() = sink; }
}

impl log::Log for TandemLogger {
    fn enabled(&self, _metadata: &Metadata) -> bool { true }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let mut writer = BoundedWriter::new();
        // Log msgs are of the form: <target>::<fmt'd-msg>
        if write!(&mut writer, "{}::{}", record.target(), record.args()).is_err() {
            writer.truncate_with_ellipsis();
        }
        (self.sink.lock())(record.level(), writer.as_str());
    }

    fn flush(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use log::{debug, info};
    use std::string::String;
    use std::sync::Mutex as StdMutex;
    use std::vec::Vec;

    static MSGS: StdMutex<Vec<String>> = StdMutex::new(Vec::new());
    static LOGGER: TandemLogger = TandemLogger::new(collect);

    fn collect(_level: log::Level, msg: &str) { MSGS.lock().unwrap().push(msg.into()); }

    fn pop() -> Option<String> { MSGS.lock().unwrap().pop() }

    // NB: the global logger is shared; run with --test-threads=1 when
    // adding tests that depend on message ordering.

    #[test]
    fn test_format_and_truncate() {
        let _ = log::set_logger(&LOGGER);
        log::set_max_level(log::LevelFilter::Trace);

        info!("hello {}", 42);
        let msg = pop().expect("no log collected");
        assert!(msg.ends_with("::hello 42"), "got {msg}");

        let long = "x".repeat(MAX_MSG_LEN);
        debug!("{}", long);
        let msg = pop().expect("no log collected");
        assert_eq!(msg.len(), MAX_MSG_LEN);
        assert!(msg.ends_with("..."));
    }
}
