// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Lower the replicated topology onto the local virtual switch.
//!
//! Port events and vlan changes are collected into a set of tenants. Each
//! tenant's rules are compiled from a consistent snapshot of the store,
//! diffed against what was last installed and only the difference is sent
//! to the switch.

use crate::compile::{compile, miss_rules, Category};
use crate::diff::FlowTable;
use crate::log::sched_log;
use crate::platform::{PortResolver, SwitchSink};
use crate::scheduler::Scheduler;
use ova_common::gate::Gate;
use slog::Logger;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender, TrySendError};
use std::sync::Arc;
use std::time::Duration;
use topodb::{Db, PortEvent, EVENT_QUEUE_DEPTH};

pub mod compile;
pub mod diff;
pub mod error;
mod log;
pub mod platform;
pub mod scheduler;

pub use error::Error;

pub const COMPONENT_OVA_LOWER: &str = "ova-lower";
pub const MOD_FLOWS: &str = "flows";
pub const MOD_SCHEDULER: &str = "scheduler";

const WATCH_TAG: &str = "ova-lower";

#[derive(Debug, Clone)]
pub struct LowerConfig {
    /// Switch port of the uplink towards the top of rack switch.
    pub uplink: u32,

    /// Pause between cycles that found nothing to do.
    pub tick: Duration,

    /// Cycles a port event may wait for its port to reach the store.
    pub wait_retries: u32,
}

impl Default for LowerConfig {
    fn default() -> Self {
        Self {
            uplink: 1,
            tick: Duration::from_millis(100),
            wait_retries: 10,
        }
    }
}

/// Hands port events to the recompute loop from other threads.
#[derive(Clone)]
pub struct Notifier {
    events: SyncSender<PortEvent>,
    db: Db,
    log: Logger,
}

impl Notifier {
    pub fn notify_port_event(&self, event: PortEvent) {
        match self.events.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(e)) => {
                sched_log!(self, warn,
                    "port event queue full, dropping {} {}",
                    e.kind, e.port_id
                );
            }
            Err(TrySendError::Disconnected(_)) => {
                sched_log!(self, error, "port event queue disconnected");
            }
        }
    }

    pub fn notify_vlan_changed(&self, tenant_id: &str) {
        self.db.mark_vlan_changed(tenant_id);
    }
}

pub struct Lower<S: SwitchSink, R: PortResolver> {
    db: Db,
    gate: Gate,
    sink: S,
    resolver: R,
    events: Receiver<PortEvent>,
    tx: SyncSender<PortEvent>,
    scheduler: Scheduler,
    flows: FlowTable,
    config: LowerConfig,

    /// Whether the local host link was present at the last cycle. Unknown
    /// until it has been seen once, so startup does not count as a loss.
    switch_link: Option<bool>,
    log: Logger,
}

impl<S: SwitchSink, R: PortResolver> Lower<S, R> {
    pub fn new(
        db: Db,
        gate: Gate,
        sink: S,
        resolver: R,
        config: LowerConfig,
        log: Logger,
    ) -> Self {
        let (tx, events) = sync_channel(EVENT_QUEUE_DEPTH);
        db.watch(WATCH_TAG, tx.clone());
        Self {
            db,
            gate,
            sink,
            resolver,
            events,
            tx,
            scheduler: Scheduler::new(config.wait_retries, log.clone()),
            flows: FlowTable::new(),
            config,
            switch_link: None,
            log,
        }
    }

    pub fn notifier(&self) -> Notifier {
        Notifier {
            events: self.tx.clone(),
            db: self.db.clone(),
            log: self.log.clone(),
        }
    }

    /// Put the switch into a known state: no groups and the table miss
    /// rules every pipeline stage falls back to.
    pub fn init(&self) {
        self.sink.clear_groups();
        self.sink.install(Category::Identify, &miss_rules(), &[], &[]);
        sched_log!(self, info, "switch initialized";
            "uplink" => self.config.uplink
        );
    }

    pub fn run(mut self, shutdown: Arc<AtomicBool>) {
        self.init();
        while !shutdown.load(Ordering::Relaxed) {
            if !self.cycle() {
                std::thread::sleep(self.config.tick);
            }
        }
        sched_log!(self, info, "recompute loop exiting");
    }

    /// One recompute cycle. Returns false if the cycle was skipped because
    /// the sync loop holds the topology, or there was nothing to do.
    pub fn cycle(&mut self) -> bool {
        let Some(_guard) = self.gate.topo_enter() else {
            return false;
        };

        let events: Vec<PortEvent> = self.events.try_iter().collect();
        let mut tenants = self.scheduler.collect(events, &self.db);
        tenants.extend(self.db.take_vlan_changes());

        match (self.db.local_link(), self.switch_link) {
            (None, Some(true)) => {
                sched_log!(self, warn, "lost contact with switch");
                self.switch_link = Some(false);
            }
            (Some(l), None | Some(false)) => {
                sched_log!(self, info, "switch link known";
                    "switch" => l.tor_id
                );
                self.switch_link = Some(true);
            }
            _ => {}
        }

        if tenants.is_empty() {
            return false;
        }
        for t in &tenants {
            self.recompute(t);
        }
        true
    }

    /// Recompile one tenant and push the difference to the switch.
    pub fn recompute(&mut self, tenant: &str) {
        self.resolve_handles(tenant);
        let view = self.db.tenant_view(tenant);
        let rules = compile(&view, self.config.uplink);
        let delta = self.flows.reconcile(tenant, rules);
        if delta.is_empty() {
            return;
        }
        sched_log!(self, debug, "updating switch";
            "tenant" => tenant,
            "operations" => delta.count()
        );
        delta.flush(&self.sink);
    }

    /// Refresh the switch handle of every local port of a tenant.
    fn resolve_handles(&self, tenant: &str) {
        let view = self.db.tenant_view(tenant);
        let local = view
            .networks
            .iter()
            .flat_map(|n| n.subnets.iter())
            .flat_map(|s| s.ports.iter())
            .filter(|p| p.local);
        for p in local {
            match self.resolver.ofport(&p.id) {
                Ok(handle) if handle != p.handle => {
                    self.db.set_port_handle(&p.id, handle);
                }
                Ok(_) => {}
                Err(e) => {
                    sched_log!(self, error, "port lookup failed: {}", e;
                        "port" => &p.id
                    );
                }
            }
        }
    }

    pub fn flows(&self) -> &FlowTable {
        &self.flows
    }

    /// Tenants with rules installed on the switch.
    pub fn tenants(&self) -> BTreeSet<String> {
        self.flows.tenants().cloned().collect()
    }
}

#[cfg(test)]
mod test;
