// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Process-wide logger for the log crate macros re-exported by base.
//!
//! Every message passes a filter parsed with env_logger's directive syntax (for example
//! `"info,devices::irqchip=trace"`) and is then written to stderr and/or an optional pipe.
//!
//! # Examples
//!
//! ```
//! use base::syslog;
//! use base::warn;
//!
//! if let Err(e) = syslog::init() {
//!     println!("failed to initialize syslog: {}", e);
//!     return;
//! }
//! warn!("this is your {} warning", "final");
//! ```

use std::io;
use std::io::Write;
use std::sync::Once;

use env_logger::filter::Builder as FilterBuilder;
use env_logger::filter::Filter;
use env_logger::fmt;
use remain::sorted;
use thiserror::Error as ThisError;

/// Formats one record written to a `LogConfig::pipe`.
pub type PipeFormatter = fn(&mut fmt::Formatter, &log::Record<'_>) -> io::Result<()>;

/// Errors returned by `syslog::init()`.
#[sorted]
#[derive(ThisError, Debug)]
pub enum Error {
    /// A logger was already installed for this process.
    #[error("a logger was already installed for this process")]
    AlreadyInitialized,
    /// The filter directive could not be used.
    #[error("invalid log filter \"{0}\"")]
    InvalidFilter(String),
}

/// Configuration of the process logger.
pub struct LogConfig<'a> {
    /// Filter directives in env_logger syntax.
    pub filter: &'a str,
    /// Name printed in front of each line written to stderr.
    pub proc_name: String,
    /// Whether to write log lines to stderr.
    pub stderr: bool,
    /// Additional sink receiving every enabled record.
    pub pipe: Option<Box<dyn Write + Send>>,
    /// Overrides the line format used for `pipe`.
    pub pipe_formatter: Option<PipeFormatter>,
}

impl<'a> Default for LogConfig<'a> {
    fn default() -> Self {
        LogConfig {
            filter: "info",
            proc_name: String::from("el2vmm"),
            stderr: true,
            pipe: None,
            pipe_formatter: None,
        }
    }
}

/// The installed logger: a filter and the set of sinks it feeds.
pub struct State {
    filter: Filter,
    loggers: Vec<env_logger::Logger>,
}

macro_rules! CHRONO_TIMESTAMP_FIXED_FMT {
    () => {
        "%F %T%.9f"
    };
}

fn default_format(
    proc_name: &str,
    buf: &mut fmt::Formatter,
    record: &log::Record<'_>,
) -> io::Result<()> {
    let now = chrono::Utc::now().format(CHRONO_TIMESTAMP_FIXED_FMT!());
    match (record.file(), record.line()) {
        (Some(file), Some(line)) => writeln!(
            buf,
            "[{} {}: {} {}:{}] {}",
            now,
            proc_name,
            record.level(),
            file,
            line,
            record.args()
        ),
        _ => writeln!(
            buf,
            "[{} {}: {}] {}",
            now,
            proc_name,
            record.level(),
            record.args()
        ),
    }
}

fn build_logger(
    filter: &str,
    proc_name: &str,
    target: env_logger::Target,
    formatter: Option<PipeFormatter>,
) -> env_logger::Logger {
    let mut builder = env_logger::Builder::new();
    builder.parse_filters(filter).target(target);
    match formatter {
        Some(formatter) => {
            builder.format(formatter);
        }
        None => {
            let proc_name = proc_name.to_owned();
            builder.format(move |buf, record| default_format(&proc_name, buf, record));
        }
    }
    builder.build()
}

impl State {
    pub fn new(cfg: LogConfig) -> Result<State, Error> {
        if cfg.filter.trim().is_empty() {
            return Err(Error::InvalidFilter(cfg.filter.to_owned()));
        }
        let filter = FilterBuilder::new().parse(cfg.filter).build();
        let mut loggers = Vec::new();
        if cfg.stderr {
            loggers.push(build_logger(
                cfg.filter,
                &cfg.proc_name,
                env_logger::Target::Stderr,
                None,
            ));
        }
        if let Some(pipe) = cfg.pipe {
            loggers.push(build_logger(
                cfg.filter,
                &cfg.proc_name,
                env_logger::Target::Pipe(pipe),
                cfg.pipe_formatter,
            ));
        }
        Ok(State { filter, loggers })
    }

    /// The most verbose level any record may pass the filter with.
    pub fn max_level(&self) -> log::LevelFilter {
        self.filter.filter()
    }
}

impl Default for State {
    fn default() -> Self {
        State {
            filter: FilterBuilder::new().parse("info").build(),
            loggers: vec![build_logger(
                "info",
                "el2vmm",
                env_logger::Target::Stderr,
                None,
            )],
        }
    }
}

impl log::Log for State {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        self.filter.enabled(metadata)
    }

    fn log(&self, record: &log::Record) {
        if !self.filter.matches(record) {
            return;
        }
        for logger in &self.loggers {
            logger.log(record);
        }
    }

    fn flush(&self) {
        for logger in &self.loggers {
            logger.flush();
        }
    }
}

/// Installs the process logger described by `cfg`.
///
/// Only the first successful call has an effect; later calls return
/// `Error::AlreadyInitialized`.
pub fn init_with(cfg: LogConfig) -> Result<(), Error> {
    let state = State::new(cfg)?;
    let max_level = state.max_level();
    log::set_boxed_logger(Box::new(state)).map_err(|_| Error::AlreadyInitialized)?;
    log::set_max_level(max_level);
    Ok(())
}

/// Installs the process logger with the default configuration.
pub fn init() -> Result<(), Error> {
    init_with(Default::default())
}

/// Makes sure a logger is installed, whichever test got there first.
pub fn test_only_ensure_inited() -> Result<(), Error> {
    static INIT: Once = Once::new();
    let mut result = Ok(());
    INIT.call_once(|| {
        result = match init_with(LogConfig {
            filter: "trace",
            ..Default::default()
        }) {
            Err(Error::AlreadyInitialized) => Ok(()),
            other => other,
        };
    });
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_filter_is_rejected() {
        assert!(matches!(
            State::new(LogConfig {
                filter: " ",
                ..Default::default()
            }),
            Err(Error::InvalidFilter(_))
        ));
    }

    #[test]
    fn max_level_follows_filter() {
        let state = State::new(LogConfig {
            filter: "warn,devices=trace",
            stderr: false,
            ..Default::default()
        })
        .unwrap();
        assert_eq!(state.max_level(), log::LevelFilter::Trace);
    }

    #[test]
    fn second_init_fails() {
        test_only_ensure_inited().unwrap();
        assert!(matches!(init(), Err(Error::AlreadyInitialized)));
    }
}
