// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::sync::Inbound;
use slog::{error, warn, Logger};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{SyncSender, TrySendError};
use std::sync::Arc;
use std::thread::{sleep, JoinHandle};
use std::time::Duration;

/// Drives the periodic full resync. The timer fires `Inbound::Resync` into
/// the sync loop's queue, independent of any push traffic.
pub struct Clock {
    join_handle: Option<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
}

impl Clock {
    /// Start a clock whose resync timer first fires after `delay` and then
    /// every `interval`.
    pub fn new(
        resolution: Duration,
        interval: Duration,
        delay: Duration,
        s: SyncSender<Inbound>,
        log: Logger,
    ) -> std::io::Result<Self> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let timer = Countdown::new(interval, delay);
        let join_handle =
            Self::run(resolution, timer, s, shutdown.clone(), log)?;
        Ok(Self {
            join_handle: Some(join_handle),
            shutdown,
        })
    }

    fn run(
        resolution: Duration,
        mut timer: Countdown,
        s: SyncSender<Inbound>,
        shutdown: Arc<AtomicBool>,
        log: Logger,
    ) -> std::io::Result<JoinHandle<()>> {
        std::thread::Builder::new()
            .name("ctlp-clock".into())
            .spawn(move || loop {
                if shutdown.load(Ordering::Relaxed) {
                    return;
                }
                if timer.tick(resolution) && !Self::fire(&s, &log) {
                    return;
                }
                sleep(resolution);
            })
    }

    /// Returns false once the receiving side is gone.
    fn fire(s: &SyncSender<Inbound>, log: &Logger) -> bool {
        match s.try_send(Inbound::Resync) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(log, "sync queue full, skipping periodic resync");
                true
            }
            Err(TrySendError::Disconnected(_)) => {
                error!(log, "sync loop gone, stopping clock");
                false
            }
        }
    }

    pub fn shutdown(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(h) = self.join_handle.take() {
            let _ = h.join();
        }
    }
}

impl Drop for Clock {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }
}

/// A repeating countdown stepped by the clock thread.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Countdown {
    interval: Duration,
    remaining: Duration,
}

impl Countdown {
    /// The first expiry is after `first` rather than a full interval.
    fn new(interval: Duration, first: Duration) -> Self {
        Self {
            interval,
            remaining: first,
        }
    }

    /// Advance by `resolution`. Returns true when the countdown expires,
    /// which also rearms it for another interval.
    fn tick(&mut self, resolution: Duration) -> bool {
        self.remaining = self.remaining.saturating_sub(resolution);
        if !self.remaining.is_zero() {
            return false;
        }
        self.remaining = self.interval;
        true
    }
}
