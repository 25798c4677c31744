// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2024 Oxide Computer Company

use std::io::Write;
use std::str::FromStr;
use std::sync::Mutex;

use anyhow::Context;
use slog::o;
use slog::Drain;

#[derive(Debug, Eq, PartialEq, Clone, Copy)]
pub enum LogFormat {
    Human,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "h" | "human" => Ok(LogFormat::Human),
            "j" | "json" => Ok(LogFormat::Json),
            _ => Err("invalid log format".to_string()),
        }
    }
}

/// Records waiting for the logging thread before new ones are dropped
const LOG_CHAN_SIZE: usize = 32768;

type BoxedDrain = Box<dyn Drain<Ok = (), Err = slog::Never> + Send>;

/// Format records as `format`, writing them to `out`
fn formatted<W>(name: &'static str, format: LogFormat, out: W) -> BoxedDrain
where
    W: Write + Send + 'static,
{
    match format {
        LogFormat::Json => {
            Box::new(slog_bunyan::with_name(name, out).build().fuse())
        }
        LogFormat::Human => {
            let decorator = slog_term::PlainDecorator::new(out);
            Box::new(slog_term::FullFormat::new(decorator).build().fuse())
        }
    }
}

/// Build the root logger for the daemon.  Output goes to `log_file` if
/// given, and to the console otherwise.  Records are written by a
/// background thread, which is flushed when the last logger is dropped.
pub fn init(
    name: &'static str,
    log_file: Option<&str>,
    format: LogFormat,
) -> anyhow::Result<slog::Logger> {
    let drain = match log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("opening log file {path}"))?;
            formatted(name, format, file)
        }
        None if format == LogFormat::Human => {
            let decorator = slog_term::TermDecorator::new().build();
            Box::new(slog_term::FullFormat::new(decorator).build().fuse())
        }
        None => formatted(name, format, std::io::stdout()),
    };
    let drain = slog_async::Async::new(drain)
        .chan_size(LOG_CHAN_SIZE)
        .build()
        .fuse();
    Ok(slog::Logger::root(drain, o!()))
}

/// Logger for unit tests.  Output is discarded unless LLDPD_TEST_LOG is set
/// in the environment, naming the format to write to stderr.
pub fn test_logger() -> slog::Logger {
    match std::env::var("LLDPD_TEST_LOG") {
        Ok(format) => {
            let format = format.parse().unwrap_or(LogFormat::Human);
            let drain = formatted("lldpd-test", format, std::io::stderr());
            slog::Logger::root(Mutex::new(drain).fuse(), o!())
        }
        Err(_) => slog::Logger::root(slog::Discard, o!()),
    }
}
