// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Watch the integration bridge for VM interfaces coming and going.

use ova_lower::platform::PortResolver;
use ova_lower::Notifier;
use slog::{debug, error, info, Logger};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use topodb::PortEvent;

pub struct PortMonitor<R: PortResolver> {
    resolver: R,
    known: BTreeSet<String>,
    log: Logger,
}

impl<R: PortResolver> PortMonitor<R> {
    pub fn new(resolver: R, log: Logger) -> Self {
        Self {
            resolver,
            known: BTreeSet::new(),
            log,
        }
    }

    /// List the bridge once and return what changed since the last poll.
    /// A failed listing changes nothing.
    pub fn poll(&mut self) -> Vec<PortEvent> {
        let current = match self.resolver.local_ports() {
            Ok(ports) => ports,
            Err(e) => {
                error!(self.log, "listing local ports failed: {e}";
                    "component" => crate::COMPONENT_OVAD,
                    "module" => crate::MOD_MONITOR,
                );
                return Vec::new();
            }
        };
        let mut events: Vec<PortEvent> = current
            .difference(&self.known)
            .map(PortEvent::add)
            .collect();
        events.extend(self.known.difference(&current).map(PortEvent::del));
        self.known = current;
        events
    }

    pub fn run(
        mut self,
        notifier: Notifier,
        interval: Duration,
        shutdown: Arc<AtomicBool>,
    ) {
        info!(self.log, "port monitor started";
            "component" => crate::COMPONENT_OVAD,
            "module" => crate::MOD_MONITOR,
        );
        while !shutdown.load(Ordering::Relaxed) {
            for e in self.poll() {
                debug!(self.log, "local port {} {}", e.kind, e.port_id;
                    "component" => crate::COMPONENT_OVAD,
                    "module" => crate::MOD_MONITOR,
                );
                notifier.notify_port_event(e);
            }
            std::thread::sleep(interval);
        }
    }
}
