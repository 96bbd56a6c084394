// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::io;
use std::io::Write;
use std::sync::Arc;

use base::syslog::test_only_ensure_inited;
use base::syslog::LogConfig;
use base::syslog::State;
use env_logger::fmt;
use log::Level;
use log::Log;
use log::Record;
use sync::Mutex;

#[derive(Clone)]
struct MockWrite {
    buffer: Arc<Mutex<Vec<u8>>>,
}

impl MockWrite {
    fn new() -> Self {
        Self {
            buffer: Arc::new(Mutex::new(vec![])),
        }
    }

    fn contents(&self) -> String {
        String::from_utf8_lossy(&self.buffer.lock()).into_owned()
    }
}

impl Write for MockWrite {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buffer.lock().write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn pipe_formatter(buf: &mut fmt::Formatter, record: &Record<'_>) -> io::Result<()> {
    writeln!(buf, "{}", record.args())
}

fn piped_state(filter: &str, formatter: Option<base::syslog::PipeFormatter>) -> (State, MockWrite) {
    let output = MockWrite::new();
    let state = State::new(LogConfig {
        filter,
        stderr: false,
        pipe: Some(Box::new(output.clone())),
        pipe_formatter: formatter,
        ..Default::default()
    })
    .unwrap();
    (state, output)
}

#[test]
fn syslog_log() {
    let state = State::default();
    state.log(
        &log::RecordBuilder::new()
            .level(Level::Error)
            .file(Some(file!()))
            .line(Some(line!()))
            .args(format_args!("hello syslog"))
            .build(),
    );
}

#[test]
fn macros() {
    test_only_ensure_inited().unwrap();
    log::error!("this is an error {}", 3);
    log::warn!("this is a warning {}", "uh oh");
    log::info!("this is info {}", true);
    log::debug!("this is debug info {:?}", Some("helpful stuff"));
}

#[test]
fn pipe_receives_custom_format() {
    let (state, output) = piped_state("info", Some(pipe_formatter));
    state.log(
        &log::RecordBuilder::new()
            .level(Level::Warn)
            .args(format_args!("guest wrote to a read-only register"))
            .build(),
    );
    state.flush();
    assert_eq!(output.contents(), "guest wrote to a read-only register\n");
}

#[test]
fn default_format_has_level_and_location() {
    let (state, output) = piped_state("info", None);
    state.log(
        &log::RecordBuilder::new()
            .level(Level::Error)
            .file(Some("devices/src/bus.rs"))
            .line(Some(42))
            .args(format_args!("no device"))
            .build(),
    );
    state.flush();
    let line = output.contents();
    assert!(line.contains("el2vmm: ERROR devices/src/bus.rs:42] no device"));
}

#[test]
fn filtered_records_are_dropped() {
    let (state, output) = piped_state("warn", Some(pipe_formatter));
    state.log(
        &log::RecordBuilder::new()
            .level(Level::Debug)
            .args(format_args!("noise"))
            .build(),
    );
    state.flush();
    assert_eq!(output.contents(), "");
}

fn enabled(state: &State, level: Level, target: &str) -> bool {
    state.enabled(
        log::RecordBuilder::new()
            .level(level)
            .target(target)
            .build()
            .metadata(),
    )
}

#[test]
fn filter_levels() {
    let cases = [
        ("trace", Level::Trace, "el2vmm", true),
        ("off", Level::Error, "el2vmm", false),
        ("info", Level::Info, "el2vmm", true),
        ("info", Level::Warn, "el2vmm", true),
        ("info", Level::Debug, "el2vmm", false),
        ("warn,devices=debug", Level::Debug, "el2vmm", false),
        ("warn,devices=debug", Level::Debug, "devices", true),
        ("warn,devices=debug", Level::Debug, "devices::virtio::net", true),
        ("info,devices=trace,devices::irqchip=off", Level::Trace, "devices::pl011", true),
        ("info,devices=trace,devices::irqchip=off", Level::Error, "devices::irqchip::vgic", false),
    ];
    for (filter, level, target, expected) in cases {
        let state = State::new(LogConfig {
            filter,
            stderr: false,
            ..Default::default()
        })
        .unwrap();
        assert_eq!(
            enabled(&state, level, target),
            expected,
            "{} at {} with filter {}",
            target,
            level,
            filter
        );
    }
}
