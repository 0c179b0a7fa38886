// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Session and sync engine against a fake controller on loopback.

use crate::connection::{recv_msg, send_msg};
use crate::{
    Inbound, Message, MessageType, Session, SessionConfig, SyncConfig,
    SyncEngine, RECV_QUEUE_DEPTH, SEND_QUEUE_DEPTH,
};
use ova_common::gate::Gate;
use ova_common::wait_for_eq;
use pretty_assertions::assert_eq;
use serde_json::{json, Map, Value};
use std::io::Write;
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::sync_channel;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use topodb::{Db, Table};

struct Agent {
    db: Db,
    session: Session,
    engine: Option<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
}

impl Agent {
    fn start(listener: &TcpListener) -> Agent {
        let log = ova_common::log::test_logger();
        let db = Db::new("host-a", log.clone());
        let (out_tx, out_rx) = sync_channel(SEND_QUEUE_DEPTH);
        let (in_tx, in_rx) = sync_channel::<Inbound>(RECV_QUEUE_DEPTH);

        let mut config = SessionConfig::new(listener.local_addr().unwrap());
        config.reconnect_interval = Duration::from_millis(50);
        config.poll_interval = Duration::from_millis(20);
        let session = Session::start(config, in_tx, out_rx, log.clone()).unwrap();

        let engine = SyncEngine::new(
            db.clone(),
            Gate::new(),
            out_tx,
            SyncConfig {
                tick: Duration::from_millis(50),
                ..Default::default()
            },
            log,
        );
        let shutdown = Arc::new(AtomicBool::new(false));
        let s = shutdown.clone();
        let engine = std::thread::spawn(move || engine.run(in_rx, s));

        Agent {
            db,
            session,
            engine: Some(engine),
            shutdown,
        }
    }
}

impl Drop for Agent {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        self.session.shutdown();
        if let Some(h) = self.engine.take() {
            let _ = h.join();
        }
    }
}

/// The controller end of a session.
struct Controller {
    stream: TcpStream,
    live: AtomicBool,
    done: AtomicBool,
}

impl Controller {
    fn accept(listener: &TcpListener) -> Controller {
        let (stream, _) = listener.accept().unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(10)))
            .unwrap();
        Controller {
            stream,
            live: AtomicBool::new(true),
            done: AtomicBool::new(false),
        }
    }

    fn recv(&mut self) -> Message {
        recv_msg(&mut self.stream, &self.live, &self.done).unwrap()
    }

    fn send(&mut self, typ: MessageType, body: Value) {
        let body = match body {
            Value::Object(m) => m,
            _ => Map::new(),
        };
        send_msg(&mut self.stream, &Message::new(typ, body)).unwrap();
    }

    /// Read the requests a full sync starts with and return their types.
    fn full_sync(&mut self) -> Vec<MessageType> {
        (0..Table::ALL.len())
            .map(|_| {
                let m = self.recv();
                assert!(m.body.is_empty(), "full sync carries no keys");
                m.typ
            })
            .collect()
    }
}

#[test]
fn sync_over_session() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let agent = Agent::start(&listener);
    let mut ctl = Controller::accept(&listener);

    assert_eq!(
        ctl.full_sync(),
        Table::ALL.map(MessageType::request).to_vec()
    );

    ctl.send(MessageType::ReplyHostLink, json!({"host-a": {"tor1": {}}}));
    ctl.send(MessageType::ReplyVlan, json!({}));
    ctl.send(MessageType::ReplyNetwork, json!({"n1": {"md5sum": "a"}}));

    let req = ctl.recv();
    assert_eq!(req.typ, MessageType::RequestNetwork);
    assert_eq!(req.body.get("keys"), Some(&json!(["n1"])));

    ctl.send(
        MessageType::ReplyNetwork,
        json!({"n1": {"tenant_id": "t1", "network_name": "blue", "md5sum": "a"}}),
    );
    wait_for_eq!(agent.db.network("n1").is_some(), true);
    assert_eq!(agent.db.local_link().unwrap().tor_id, "tor1");

    // a child ahead of its parent is recovered once the parent shows up
    ctl.send(
        MessageType::CreateSubnet,
        json!({"s1": {"tenant_id": "t2", "network_id": "n2", "md5sum": "b"}}),
    );
    ctl.send(
        MessageType::CreateNetwork,
        json!({"n2": {"tenant_id": "t2", "network_name": "red", "md5sum": "c"}}),
    );
    wait_for_eq!(agent.db.subnet("s1").is_some(), true);
    assert!(agent.db.network("n2").unwrap().subnets.contains("s1"));

    ctl.send(MessageType::DeleteNetwork, json!({"n2": null}));
    wait_for_eq!(agent.db.subnet("s1").is_none(), true);
}

#[test]
fn decode_error_resets_session() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let agent = Agent::start(&listener);

    let mut first = Controller::accept(&listener);
    first.full_sync();
    ctl_garbage(&mut first.stream);

    // the agent reconnects and starts over with a full sync
    let mut second = Controller::accept(&listener);
    assert_eq!(second.full_sync().len(), Table::ALL.len());

    second.send(
        MessageType::CreateNetwork,
        json!({"n1": {"tenant_id": "t1", "md5sum": "a"}}),
    );
    wait_for_eq!(agent.db.network("n1").is_some(), true);
}

fn ctl_garbage(s: &mut TcpStream) {
    // version 9 is unknown
    s.write_all(&[9, 52, 0, 0, 0, 0, 0, 8]).unwrap();
}
