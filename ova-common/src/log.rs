// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use slog::{Drain, Logger};
use std::fs::OpenOptions;
use std::io::Write;

pub fn init_logger() -> Logger {
    build_logger(std::io::stdout())
}

/// Build a logger that appends bunyan records to `filename`.
pub fn init_file_logger(filename: &str) -> std::io::Result<Logger> {
    let f = OpenOptions::new().create(true).append(true).open(filename)?;
    Ok(build_logger(f))
}

pub fn build_logger<W: Write + Send + 'static>(w: W) -> Logger {
    let drain = slog_bunyan::new(w).build().fuse();
    let drain = slog_async::Async::new(drain)
        .chan_size(0x8000)
        .build()
        .fuse();
    slog::Logger::root(drain, slog::o!())
}

/// Terminal logger for tests, filtered through `RUST_LOG`.
pub fn test_logger() -> Logger {
    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_envlogger::new(drain).fuse();
    let drain = slog_async::Async::new(drain)
        .chan_size(0x2000)
        .build()
        .fuse();
    slog::Logger::root(drain, slog::o!())
}
