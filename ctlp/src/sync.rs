// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The sync engine keeps the topology replica in step with the controller.
//!
//! Push messages are applied as they arrive. Children that show up before
//! their parents are parked on a deferred queue and replayed whenever the
//! inbound queue is quiet, losing one color step per replay. Replies to a
//! full sync carry a key to checksum map for a table: keys we hold that
//! the controller no longer has are deleted, keys whose checksum differs
//! are fetched again by key, and everything else is left alone.

use crate::log::sync_log;
use crate::messages::{Color, Kind, Message, MessageType};
use ova_common::gate::Gate;
use serde_json::{Map, Value};
use slog::Logger;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError, SyncSender, TrySendError};
use std::sync::Arc;
use std::thread::sleep;
use std::time::Duration;
use topodb::{Apply, Db, Record, Table};

const UNIT_SYNC: &str = "engine";

/// Everything the sync loop consumes.
#[derive(Debug)]
pub enum Inbound {
    /// A new controller session is up.
    Connected,

    /// A decoded controller message.
    Message(Message),

    /// The periodic resync timer fired.
    Resync,
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// How long the loop waits for inbound traffic before it counts as
    /// idle.
    pub tick: Duration,

    /// Pause between attempts to take the gate from a recompute cycle.
    pub gate_retry: Duration,

    pub deferred_depth: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(1),
            gate_retry: Duration::from_millis(50),
            deferred_depth: crate::DEFERRED_QUEUE_DEPTH,
        }
    }
}

type Handler = fn(&mut SyncEngine, Message);

/// Outcome of comparing a checksum reply with the local table.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ChecksumDiff {
    /// Held locally, gone at the controller.
    pub delete: Vec<String>,

    /// New or changed at the controller.
    pub fetch: Vec<String>,

    pub unchanged: usize,
}

impl ChecksumDiff {
    pub fn new(
        local: &BTreeMap<String, String>,
        remote: &BTreeMap<String, String>,
    ) -> Self {
        let mut diff = ChecksumDiff {
            delete: local
                .keys()
                .filter(|k| !remote.contains_key(*k))
                .cloned()
                .collect(),
            ..Default::default()
        };
        for (key, sum) in remote {
            match local.get(key) {
                Some(s) if s == sum => diff.unchanged += 1,
                _ => diff.fetch.push(key.clone()),
            }
        }
        diff
    }
}

pub struct SyncEngine {
    db: Db,
    gate: Gate,
    outbound: SyncSender<Message>,
    deferred: VecDeque<Message>,
    handlers: HashMap<MessageType, Handler>,
    config: SyncConfig,
    log: Logger,
}

impl SyncEngine {
    pub fn new(
        db: Db,
        gate: Gate,
        outbound: SyncSender<Message>,
        config: SyncConfig,
        log: Logger,
    ) -> Self {
        Self {
            db,
            gate,
            outbound,
            deferred: VecDeque::with_capacity(config.deferred_depth),
            handlers: Self::dispatch_table(),
            config,
            log,
        }
    }

    fn dispatch_table() -> HashMap<MessageType, Handler> {
        use MessageType::*;
        let mut h: HashMap<MessageType, Handler> = HashMap::new();
        for t in [
            CreateNetwork,
            UpdateNetwork,
            CreateSubnet,
            UpdateSubnet,
            CreatePort,
            UpdatePort,
            CreateVlan,
            UpdateVlan,
            UpdateHostLink,
        ] {
            h.insert(t, Self::apply_records);
        }
        for t in [DeleteNetwork, DeleteSubnet, DeletePort, DeleteVlan] {
            h.insert(t, Self::delete_records);
        }
        for t in [ReplyNetwork, ReplySubnet, ReplyPort, ReplyVlan] {
            h.insert(t, Self::reconcile);
        }
        h.insert(ReplyHostLink, Self::reply_links);
        h.insert(ReplyError, Self::controller_error);
        h
    }

    /// Run the sync loop until the inbound queue disconnects or `shutdown`
    /// is raised.
    pub fn run(mut self, inbound: Receiver<Inbound>, shutdown: Arc<AtomicBool>) {
        sync_log!(self, info, "sync loop started");
        loop {
            if shutdown.load(Ordering::Relaxed) {
                sync_log!(self, info, "sync loop shutting down");
                self.gate.sync_idle();
                return;
            }
            match inbound.recv_timeout(self.config.tick) {
                Ok(ev) => self.handle(ev),
                Err(RecvTimeoutError::Timeout) => self.idle(),
                Err(RecvTimeoutError::Disconnected) => {
                    sync_log!(self, info, "inbound queue closed");
                    self.gate.sync_idle();
                    return;
                }
            }
        }
    }

    pub fn handle(&mut self, ev: Inbound) {
        match ev {
            Inbound::Connected => {
                if !self.deferred.is_empty() {
                    sync_log!(self, info,
                        "session restarted, dropping {} deferred messages",
                        self.deferred.len()
                    );
                    self.deferred.clear();
                }
                self.full_sync();
            }
            Inbound::Resync => self.full_sync(),
            Inbound::Message(m) => {
                self.enter();
                self.dispatch(m);
            }
        }
    }

    /// Nothing arrived within a tick. Replay deferred messages if the gate
    /// allows it and release the gate for recompute.
    pub fn idle(&mut self) {
        if self.gate.sync_enter() {
            self.drain_deferred();
        }
        self.gate.sync_idle();
    }

    fn enter(&self) {
        while !self.gate.sync_enter() {
            sleep(self.config.gate_retry);
        }
    }

    pub fn dispatch(&mut self, m: Message) {
        sync_log!(self, trace, "dispatch {}", m.typ;
            "xid" => m.xid,
            "keys" => m.body.len()
        );
        match self.handlers.get(&m.typ).copied() {
            Some(h) => h(self, m),
            None => {
                sync_log!(self, warn, "unexpected message type {}", m.typ;
                    "xid" => m.xid
                );
            }
        }
    }

    /// Ask for every table, parents first.
    pub fn full_sync(&mut self) {
        sync_log!(self, debug, "requesting full sync");
        for table in Table::ALL {
            self.send(Message::request(table, None));
        }
    }

    fn send(&self, m: Message) {
        match self.outbound.try_send(m) {
            Ok(()) => {}
            Err(TrySendError::Full(m)) => {
                sync_log!(self, warn, "send queue full, dropping {}", m.typ);
            }
            Err(TrySendError::Disconnected(m)) => {
                sync_log!(self, error, "send queue closed, dropping {}", m.typ);
            }
        }
    }

    fn apply_records(&mut self, m: Message) {
        let Some(table) = m.typ.table() else {
            return;
        };
        let mut parked = Map::new();
        for (key, value) in m.body {
            let record = match Record::from_json(table, &key, value.clone()) {
                Ok(r) => r,
                Err(e) => {
                    sync_log!(self, warn, "bad {} record {}: {}", table, key, e);
                    continue;
                }
            };
            let result = match m.typ.kind() {
                Kind::Update => self.db.update(record),
                _ => self.db.add(record),
            };
            match result {
                Ok(Apply::Applied) => {}
                Ok(Apply::Deferred) => {
                    parked.insert(key, value);
                }
                Err(e) => {
                    sync_log!(self, warn, "apply {} {}: {}", table, key, e);
                }
            }
        }
        if !parked.is_empty() {
            self.defer(Message {
                typ: m.typ,
                xid: m.xid,
                body: parked,
                color: m.color,
            });
        }
    }

    fn delete_records(&mut self, m: Message) {
        let Some(table) = m.typ.table() else {
            return;
        };
        for key in m.body.keys() {
            self.db.delete(table, key);
        }
    }

    /// Handle a reply for a checksummed table.
    fn reconcile(&mut self, m: Message) {
        let Some(table) = m.typ.table() else {
            return;
        };
        if m.body.is_empty() {
            let n = self.db.clear(table);
            sync_log!(self, info, "controller has no {} records", table;
                "removed" => n
            );
            return;
        }
        if carries_records(&m.body) {
            self.apply_records(m);
            return;
        }

        let remote: BTreeMap<String, String> = m
            .body
            .iter()
            .map(|(k, v)| {
                let sum = v.get("md5sum").and_then(Value::as_str).unwrap_or("");
                (k.clone(), sum.to_string())
            })
            .collect();
        let diff = ChecksumDiff::new(&self.db.checksums(table), &remote);
        sync_log!(self, debug, "{} checksum diff", table;
            "delete" => diff.delete.len(),
            "fetch" => diff.fetch.len(),
            "unchanged" => diff.unchanged
        );
        for key in &diff.delete {
            self.db.delete(table, key);
        }
        if !diff.fetch.is_empty() {
            self.send(Message::request(table, Some(diff.fetch)));
        }
    }

    /// Host-link replies carry records rather than checksums.
    fn reply_links(&mut self, m: Message) {
        if m.body.is_empty() {
            let n = self.db.clear(Table::HostLink);
            sync_log!(self, info, "controller has no host links";
                "removed" => n
            );
            return;
        }
        self.apply_records(m);
    }

    fn controller_error(&mut self, m: Message) {
        sync_log!(self, warn, "controller error: {}", Value::Object(m.body);
            "xid" => m.xid
        );
    }

    fn defer(&mut self, m: Message) {
        if self.deferred.len() >= self.config.deferred_depth {
            if let Some(old) = self.deferred.pop_front() {
                sync_log!(self, warn,
                    "deferred queue full, dropping {}", old.typ;
                    "xid" => old.xid
                );
            }
        }
        sync_log!(self, debug, "deferring {}", m.typ;
            "keys" => m.body.len(),
            "color" => format!("{:?}", m.color)
        );
        self.deferred.push_back(m);
    }

    /// Replay each message that was deferred before this call once.
    /// Anything that is deferred again goes to the back of the queue and
    /// waits for the next idle tick.
    fn drain_deferred(&mut self) {
        let n = self.deferred.len();
        for _ in 0..n {
            let Some(mut m) = self.deferred.pop_front() else {
                break;
            };
            if m.color == Color::Red {
                sync_log!(self, warn, "giving up on deferred {}", m.typ;
                    "xid" => m.xid,
                    "keys" => format!("{:?}", m.body.keys().collect::<Vec<_>>())
                );
                continue;
            }
            m.color = m.color.degrade();
            self.apply_records(m);
        }
    }

    pub fn deferred_len(&self) -> usize {
        self.deferred.len()
    }
}

/// A reply whose values hold anything besides a checksum is a targeted
/// reply with full records.
fn carries_records(body: &Map<String, Value>) -> bool {
    body.values().any(|v| match v {
        Value::Object(o) => o.keys().any(|k| k != "md5sum"),
        _ => false,
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::sync::mpsc::sync_channel;

    const HOST: &str = "host-a";

    fn engine() -> (SyncEngine, Receiver<Message>, Db) {
        let log = ova_common::log::test_logger();
        let db = Db::new(HOST, log.clone());
        let (tx, rx) = sync_channel(crate::SEND_QUEUE_DEPTH);
        let e = SyncEngine::new(
            db.clone(),
            Gate::new(),
            tx,
            SyncConfig::default(),
            log,
        );
        (e, rx, db)
    }

    fn msg(typ: MessageType, body: Value) -> Message {
        match body {
            Value::Object(m) => Message::new(typ, m),
            _ => panic!("body must be an object"),
        }
    }

    fn network(id: &str, sum: &str) -> Message {
        msg(
            MessageType::CreateNetwork,
            json!({ id: {
                "tenant_id": "t1",
                "network_name": id,
                "network_type": "vlan",
                "md5sum": sum,
            }}),
        )
    }

    fn subnet(id: &str, network: &str) -> Message {
        msg(
            MessageType::CreateSubnet,
            json!({ id: {
                "tenant_id": "t1",
                "network_id": network,
                "network": "10.0.0.0",
                "network_mask": "24",
                "md5sum": "s",
            }}),
        )
    }

    fn sent(rx: &Receiver<Message>) -> Vec<Message> {
        rx.try_iter().collect()
    }

    #[test]
    fn dispatch_covers_every_inbound_type() {
        let (e, _, _) = engine();
        for code in 0..=u8::MAX {
            let Ok(t) = MessageType::try_from(code) else {
                continue;
            };
            assert_eq!(
                e.handlers.contains_key(&t),
                t.kind() != Kind::Request,
                "{t}"
            );
        }
    }

    #[test]
    fn full_sync_requests_every_table_in_order() {
        let (mut e, rx, _) = engine();
        e.handle(Inbound::Connected);
        let types: Vec<MessageType> = sent(&rx).iter().map(|m| m.typ).collect();
        assert_eq!(
            types,
            vec![
                MessageType::RequestVlan,
                MessageType::RequestHostLink,
                MessageType::RequestNetwork,
                MessageType::RequestSubnet,
                MessageType::RequestPort,
            ]
        );
        assert!(sent(&rx).is_empty());
    }

    #[test]
    fn checksum_diff_is_minimal() {
        let (mut e, rx, db) = engine();
        for i in 0..10 {
            e.dispatch(network(&format!("n{i}"), "old"));
        }
        assert_eq!(db.checksums(Table::Network).len(), 10);

        // n0..n2 changed, n3 and n4 are gone, n5..n9 unchanged
        let mut reply = Map::new();
        for i in 0..3 {
            reply.insert(format!("n{i}"), json!({"md5sum": "new"}));
        }
        for i in 5..10 {
            reply.insert(format!("n{i}"), json!({"md5sum": "old"}));
        }
        e.dispatch(Message::new(MessageType::ReplyNetwork, reply));

        let local = db.checksums(Table::Network);
        assert!(!local.contains_key("n3"));
        assert!(!local.contains_key("n4"));
        assert_eq!(local.len(), 8);
        for i in 5..10 {
            assert_eq!(local[&format!("n{i}")], "old");
        }

        let out = sent(&rx);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].typ, MessageType::RequestNetwork);
        assert_eq!(
            out[0].body.get("keys"),
            Some(&json!(["n0", "n1", "n2"]))
        );
    }

    #[test]
    fn checksum_diff_counts() {
        let local: BTreeMap<String, String> =
            [("a", "1"), ("b", "1"), ("c", "1")]
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect();
        let remote: BTreeMap<String, String> = [("b", "2"), ("c", "1"), ("d", "1")]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        assert_eq!(
            ChecksumDiff::new(&local, &remote),
            ChecksumDiff {
                delete: vec!["a".into()],
                fetch: vec!["b".into(), "d".into()],
                unchanged: 1,
            }
        );
    }

    #[test]
    fn targeted_reply_applies_records() {
        let (mut e, rx, db) = engine();
        e.dispatch(network("n1", "old"));
        e.dispatch(network("n2", "old"));

        let mut reply = network("n1", "new");
        reply.typ = MessageType::ReplyNetwork;
        e.dispatch(reply);

        assert_eq!(db.network("n1").unwrap().md5sum, "new");
        assert!(db.network("n2").is_some(), "targeted replies never delete");
        assert!(sent(&rx).is_empty());
    }

    #[test]
    fn empty_reply_clears_table() {
        let (mut e, _rx, db) = engine();
        e.dispatch(network("n1", "x"));
        e.dispatch(subnet("s1", "n1"));
        e.dispatch(Message::new(MessageType::ReplyNetwork, Map::new()));
        assert!(db.network("n1").is_none());
        assert!(db.subnet("s1").is_none());
    }

    #[test]
    fn out_of_order_recovery() {
        let (mut e, _rx, db) = engine();
        e.dispatch(subnet("s1", "n1"));
        assert!(db.subnet("s1").is_none());
        assert_eq!(e.deferred_len(), 1);

        e.dispatch(network("n1", "x"));
        e.idle();

        assert_eq!(e.deferred_len(), 0);
        assert!(db.subnet("s1").is_some());
        assert!(db.network("n1").unwrap().subnets.contains("s1"));
    }

    #[test]
    fn deferred_messages_expire() {
        let (mut e, _rx, db) = engine();
        e.dispatch(subnet("s1", "nope"));
        assert_eq!(e.deferred.front().map(|m| m.color), Some(Color::Green));

        e.idle();
        assert_eq!(e.deferred.front().map(|m| m.color), Some(Color::Yellow));
        e.idle();
        assert_eq!(e.deferred.front().map(|m| m.color), Some(Color::Red));
        e.idle();
        assert_eq!(e.deferred_len(), 0);
        assert!(db.subnet("s1").is_none());
    }

    #[test]
    fn only_deferred_keys_are_replayed() {
        let (mut e, _rx, db) = engine();
        e.dispatch(network("n1", "x"));
        let body = json!({
            "s1": {"tenant_id": "t1", "network_id": "n1", "md5sum": "a"},
            "s2": {"tenant_id": "t1", "network_id": "n2", "md5sum": "b"},
        });
        e.dispatch(msg(MessageType::CreateSubnet, body));
        assert!(db.subnet("s1").is_some());
        assert_eq!(e.deferred_len(), 1);
        let parked: Vec<&String> = e.deferred[0].body.keys().collect();
        assert_eq!(parked, vec!["s2"]);
    }

    #[test]
    fn deferred_queue_drops_oldest() {
        let (mut e, _rx, _db) = engine();
        e.config.deferred_depth = 2;
        for i in 0..3 {
            e.dispatch(subnet(&format!("s{i}"), "missing"));
        }
        assert_eq!(e.deferred_len(), 2);
        assert!(e.deferred[0].body.contains_key("s1"));
        assert!(e.deferred[1].body.contains_key("s2"));
    }

    #[test]
    fn reconnect_drops_deferred() {
        let (mut e, _rx, _db) = engine();
        e.dispatch(subnet("s1", "missing"));
        e.handle(Inbound::Connected);
        assert_eq!(e.deferred_len(), 0);
    }

    #[test]
    fn deletes_cascade() {
        let (mut e, _rx, db) = engine();
        e.dispatch(network("n1", "x"));
        e.dispatch(subnet("s1", "n1"));
        e.dispatch(msg(MessageType::DeleteNetwork, json!({"n1": null})));
        assert!(db.network("n1").is_none());
        assert!(db.subnet("s1").is_none());
    }

    #[test]
    fn host_link_reply() {
        let (mut e, _rx, db) = engine();
        e.dispatch(msg(
            MessageType::ReplyHostLink,
            json!({HOST: {"10.0.0.1": {}}}),
        ));
        assert_eq!(db.local_link().unwrap().tor_id, "10.0.0.1");

        e.dispatch(Message::new(MessageType::ReplyHostLink, Map::new()));
        assert!(db.local_link().is_none());
    }

    #[test]
    fn idle_releases_gate() {
        let (mut e, _rx, _db) = engine();
        e.dispatch(network("n1", "x"));
        e.handle(Inbound::Message(network("n2", "x")));
        assert!(e.gate.sync_busy());
        e.idle();
        assert!(!e.gate.sync_busy());
    }
}
