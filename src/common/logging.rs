// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.
//! Process-wide tracing setup for the exchange service.
//!
//! Lines use the glog layout the rest of the cluster emits:
//! `Lyyyymmdd hh:mm:ss.uuuuuu thread file:line] message`.

use std::fmt;
use std::fs::{self, OpenOptions};
use std::io;
use std::path::PathBuf;
use std::sync::{Mutex, OnceLock};

use chrono::{DateTime, Datelike, Local, Timelike};
use tracing::Level;
use tracing_subscriber::fmt::format::{FormatEvent, FormatFields, Writer};
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{EnvFilter, fmt as tracing_fmt};

pub use tracing::{debug, error, info, warn};

const LOG_FILE_ENV: &str = "MPP_EXCHANGE_LOG_FILE";
const LOG_DIR_ENV: &str = "MPP_EXCHANGE_LOG_DIR";
const DEFAULT_LOG_FILE_NAME: &str = "mpp_exchange.log";

static INIT: OnceLock<()> = OnceLock::new();

/// Where log lines go. An explicit file wins over a directory.
#[derive(Debug, PartialEq, Eq)]
enum LogTarget {
    File(PathBuf),
    Stderr,
}

impl LogTarget {
    fn resolve(file: Option<String>, dir: Option<String>) -> Self {
        let trimmed = |value: Option<String>| {
            value
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        if let Some(file) = trimmed(file) {
            return LogTarget::File(PathBuf::from(file));
        }
        match trimmed(dir) {
            Some(dir) => LogTarget::File(PathBuf::from(dir).join(DEFAULT_LOG_FILE_NAME)),
            None => LogTarget::Stderr,
        }
    }

    fn from_env() -> Self {
        Self::resolve(std::env::var(LOG_FILE_ENV).ok(), std::env::var(LOG_DIR_ENV).ok())
    }

    /// Writer plus whether ANSI colors apply. A file that cannot be opened
    /// degrades to stderr.
    fn into_writer(self) -> (BoxMakeWriter, bool) {
        let stderr = || (BoxMakeWriter::new(io::stderr), atty::is(atty::Stream::Stderr));
        let LogTarget::File(path) = self else {
            return stderr();
        };
        if let Some(parent) = path.parent()
            && let Err(err) = fs::create_dir_all(parent)
        {
            eprintln!(
                "failed to create log directory {}: {}, logging to stderr",
                parent.display(),
                err
            );
            return stderr();
        }
        match OpenOptions::new().create(true).append(true).open(&path) {
            Ok(file) => (BoxMakeWriter::new(Mutex::new(file)), false),
            Err(err) => {
                eprintln!(
                    "failed to open log file {}: {}, logging to stderr",
                    path.display(),
                    err
                );
                stderr()
            }
        }
    }
}

fn level_char(level: &Level) -> char {
    match *level {
        Level::ERROR => 'E',
        Level::WARN => 'W',
        Level::INFO => 'I',
        Level::DEBUG => 'D',
        Level::TRACE => 'T',
    }
}

fn current_thread_number() -> u64 {
    format!("{:?}", std::thread::current().id())
        .trim_start_matches("ThreadId(")
        .trim_end_matches(')')
        .parse()
        .unwrap_or(0)
}

fn line_prefix(level: &Level, now: &DateTime<Local>, thread: u64, file: &str, line: u32) -> String {
    format!(
        "{}{:04}{:02}{:02} {:02}:{:02}:{:02}.{:06} {} {}:{}] ",
        level_char(level),
        now.year() % 10000,
        now.month(),
        now.day(),
        now.hour(),
        now.minute(),
        now.second(),
        now.timestamp_subsec_micros(),
        thread,
        file,
        line
    )
}

struct ExchangeLogFormatter;

impl<S, N> FormatEvent<S, N> for ExchangeLogFormatter
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &tracing_fmt::FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &tracing::Event<'_>,
    ) -> fmt::Result {
        let metadata = event.metadata();
        writer.write_str(&line_prefix(
            metadata.level(),
            &Local::now(),
            current_thread_number(),
            metadata.file().unwrap_or("unknown"),
            metadata.line().unwrap_or(0),
        ))?;
        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

/// Install the global subscriber once. `filter` is an `EnvFilter` expression,
/// e.g. `info,h2=warn,tonic=warn`. Later calls are no-ops.
pub fn init_with_level(filter: &str) {
    INIT.get_or_init(|| {
        let (make_writer, use_ansi) = LogTarget::from_env().into_writer();
        let _ = tracing_fmt()
            .with_env_filter(EnvFilter::new(filter))
            .with_writer(make_writer)
            .with_ansi(use_ansi)
            .event_format(ExchangeLogFormatter)
            .try_init();
    });
}
