// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::error::Error;
use crate::log::session_log;
use crate::messages::{Header, Message};
use crate::sync::Inbound;
use slog::Logger;
use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError, SyncSender, TrySendError};
use std::sync::Arc;
use std::thread::{sleep, JoinHandle};
use std::time::Duration;

const UNIT_SESSION: &str = "controller";

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub peer: SocketAddr,

    /// Fixed pause between connection attempts, and before reconnecting a
    /// dropped session.
    pub reconnect_interval: Duration,

    /// Attempts per round before backing off for a whole round.
    pub connect_retries: u32,

    pub connect_timeout: Duration,

    /// How often blocked reads and the send queue check for shutdown.
    pub poll_interval: Duration,
}

impl SessionConfig {
    pub fn new(peer: SocketAddr) -> Self {
        Self {
            peer,
            reconnect_interval: Duration::from_secs(2),
            connect_retries: 5,
            connect_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(100),
        }
    }
}

/// The single TCP session to the controller.
///
/// A manager thread connects, spawns a receive thread for the socket and
/// then acts as the send loop. When either side of the socket fails the
/// session is torn down and rebuilt after the reconnect interval. Frames
/// queued while disconnected are discarded on connect since a full sync
/// follows every new session.
pub struct Session {
    shutdown: Arc<AtomicBool>,
    join_handle: Option<JoinHandle<()>>,
}

impl Session {
    pub fn start(
        config: SessionConfig,
        inbound: SyncSender<Inbound>,
        outbound: Receiver<Message>,
        log: Logger,
    ) -> Result<Session, Error> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let dropped = shutdown.clone();
        let join_handle = std::thread::Builder::new()
            .name("ctlp-session".into())
            .spawn(move || Self::run(config, inbound, outbound, dropped, log))?;
        Ok(Session {
            shutdown,
            join_handle: Some(join_handle),
        })
    }

    pub fn shutdown(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(h) = self.join_handle.take() {
            let _ = h.join();
        }
    }

    fn run(
        config: SessionConfig,
        inbound: SyncSender<Inbound>,
        outbound: Receiver<Message>,
        shutdown: Arc<AtomicBool>,
        log: Logger,
    ) {
        let mut xid: u16 = 0;
        loop {
            let Some(stream) = Self::connect(&config, &shutdown, &log) else {
                return;
            };

            let stale = outbound.try_iter().count();
            if stale > 0 {
                session_log!(log, debug, "discarded {} stale frames", stale);
            }

            // Queued before any message of the new session.
            if inbound.send(Inbound::Connected).is_err() {
                session_log!(log, info, "sync loop gone, closing session");
                shutdown.store(true, Ordering::Relaxed);
            }

            let alive = Arc::new(AtomicBool::new(true));
            let recv = match Self::spawn_recv(
                &stream,
                inbound.clone(),
                alive.clone(),
                shutdown.clone(),
                &config,
                log.clone(),
            ) {
                Ok(h) => h,
                Err(e) => {
                    session_log!(log, error, "failed to start receiver: {}", e);
                    let _ = stream.shutdown(Shutdown::Both);
                    sleep(config.reconnect_interval);
                    continue;
                }
            };

            let mut stream = stream;
            Self::send_loop(
                &mut stream,
                &outbound,
                &alive,
                &shutdown,
                &mut xid,
                &config,
                &log,
            );
            alive.store(false, Ordering::Relaxed);
            let _ = stream.shutdown(Shutdown::Both);
            let _ = recv.join();

            if shutdown.load(Ordering::Relaxed) {
                session_log!(log, info, "session shut down");
                return;
            }
            session_log!(log, warn, "controller session lost, reconnecting";
                "peer" => config.peer.to_string()
            );
            sleep(config.reconnect_interval);
        }
    }

    /// Keep trying until a connection is made or the session is shut down.
    /// Each round makes `connect_retries` attempts; a failed round backs
    /// off for as long as the round took before starting over.
    fn connect(
        config: &SessionConfig,
        shutdown: &AtomicBool,
        log: &Logger,
    ) -> Option<TcpStream> {
        let retries = config.connect_retries.max(1);
        loop {
            for attempt in 1..=retries {
                if shutdown.load(Ordering::Relaxed) {
                    return None;
                }
                match TcpStream::connect_timeout(
                    &config.peer,
                    config.connect_timeout,
                ) {
                    Ok(s) => {
                        session_log!(log, info, "connected to controller";
                            "peer" => config.peer.to_string()
                        );
                        return Some(s);
                    }
                    Err(e) => {
                        session_log!(log, warn,
                            "connect attempt {}/{} failed: {}",
                            attempt, retries, e;
                            "peer" => config.peer.to_string()
                        );
                        sleep(config.reconnect_interval);
                    }
                }
            }
            session_log!(log, warn,
                "controller unreachable after {} attempts, backing off",
                retries;
                "peer" => config.peer.to_string()
            );
            sleep(config.reconnect_interval * retries);
        }
    }

    fn spawn_recv(
        stream: &TcpStream,
        inbound: SyncSender<Inbound>,
        alive: Arc<AtomicBool>,
        shutdown: Arc<AtomicBool>,
        config: &SessionConfig,
        log: Logger,
    ) -> Result<JoinHandle<()>, Error> {
        let mut reader = stream.try_clone()?;
        reader.set_read_timeout(Some(config.poll_interval))?;
        let h = std::thread::Builder::new()
            .name("ctlp-recv".into())
            .spawn(move || {
                loop {
                    match recv_msg(&mut reader, &alive, &shutdown) {
                        Ok(m) => {
                            session_log!(log, trace, "recv {}", m.typ;
                                "xid" => m.xid
                            );
                            match inbound.try_send(Inbound::Message(m)) {
                                Ok(()) => {}
                                Err(TrySendError::Full(_)) => {
                                    session_log!(log, warn,
                                        "recv queue full, dropping message"
                                    );
                                }
                                Err(TrySendError::Disconnected(_)) => break,
                            }
                        }
                        Err(Error::Shutdown) => break,
                        Err(e) => {
                            session_log!(log, warn,
                                "recv failed, resetting session: {}", e
                            );
                            break;
                        }
                    }
                }
                alive.store(false, Ordering::Relaxed);
                let _ = reader.shutdown(Shutdown::Both);
            })?;
        Ok(h)
    }

    fn send_loop(
        stream: &mut TcpStream,
        outbound: &Receiver<Message>,
        alive: &AtomicBool,
        shutdown: &AtomicBool,
        xid: &mut u16,
        config: &SessionConfig,
        log: &Logger,
    ) {
        loop {
            if shutdown.load(Ordering::Relaxed) || !alive.load(Ordering::Relaxed)
            {
                return;
            }
            let mut m = match outbound.recv_timeout(config.poll_interval) {
                Ok(m) => m,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => {
                    session_log!(log, info, "send queue closed");
                    shutdown.store(true, Ordering::Relaxed);
                    return;
                }
            };
            m.xid = *xid;
            *xid = xid.wrapping_add(1);
            if let Err(e) = send_msg(stream, &m) {
                session_log!(log, warn, "send {} failed: {}", m.typ, e);
                return;
            }
            session_log!(log, trace, "sent {}", m.typ; "xid" => m.xid);
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }
}

pub(crate) fn send_msg<W: Write>(w: &mut W, m: &Message) -> Result<(), Error> {
    w.write_all(&m.to_wire()?)?;
    Ok(())
}

/// Read one frame. Read timeouts only serve to notice shutdown, so they
/// are retried without losing the bytes read so far.
pub(crate) fn recv_msg<R: Read>(
    r: &mut R,
    alive: &AtomicBool,
    shutdown: &AtomicBool,
) -> Result<Message, Error> {
    let mut buf = [0u8; Header::WIRE_SIZE];
    read_full(r, &mut buf, alive, shutdown)?;
    let header = Header::from_wire(&buf)?;
    let mut body = vec![0u8; header.body_len()];
    read_full(r, &mut body, alive, shutdown)?;
    Message::from_parts(header, &body)
}

fn read_full<R: Read>(
    r: &mut R,
    buf: &mut [u8],
    alive: &AtomicBool,
    shutdown: &AtomicBool,
) -> Result<(), Error> {
    let mut i = 0;
    while i < buf.len() {
        if shutdown.load(Ordering::Relaxed) || !alive.load(Ordering::Relaxed) {
            return Err(Error::Shutdown);
        }
        match r.read(&mut buf[i..]) {
            Ok(0) => return Err(Error::Disconnected),
            Ok(n) => i += n,
            Err(e)
                if matches!(
                    e.kind(),
                    ErrorKind::WouldBlock
                        | ErrorKind::TimedOut
                        | ErrorKind::Interrupted
                ) =>
            {
                continue
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::messages::MessageType;
    use pretty_assertions::assert_eq;
    use std::io::Cursor;
    use topodb::Table;

    /// Hands out its data a few bytes at a time with timeouts in between.
    struct Trickle {
        data: Vec<u8>,
        pos: usize,
        stall: bool,
    }

    impl Read for Trickle {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            self.stall = !self.stall;
            if self.stall {
                return Err(ErrorKind::WouldBlock.into());
            }
            let n = buf.len().min(3).min(self.data.len() - self.pos);
            buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
            self.pos += n;
            Ok(n)
        }
    }

    #[test]
    fn frames_survive_read_timeouts() {
        let alive = AtomicBool::new(true);
        let shutdown = AtomicBool::new(false);
        let mut data = Vec::new();
        send_msg(
            &mut data,
            &Message::request(Table::Port, Some(vec!["p1".into()])),
        )
        .unwrap();
        send_msg(&mut data, &Message::request(Table::Vlan, None)).unwrap();

        let mut r = Trickle {
            data,
            pos: 0,
            stall: false,
        };
        let a = recv_msg(&mut r, &alive, &shutdown).unwrap();
        let b = recv_msg(&mut r, &alive, &shutdown).unwrap();
        assert_eq!(a.typ, MessageType::RequestPort);
        assert_eq!(a.body["keys"], serde_json::json!(["p1"]));
        assert_eq!(b.typ, MessageType::RequestVlan);
        assert!(matches!(
            recv_msg(&mut r, &alive, &shutdown),
            Err(Error::Disconnected)
        ));
    }

    #[test]
    fn truncated_frame_is_an_error() {
        let alive = AtomicBool::new(true);
        let shutdown = AtomicBool::new(false);
        let mut c = Cursor::new(vec![1u8, 52, 0, 0, 0, 0, 0, 20, b'{']);
        assert!(matches!(
            recv_msg(&mut c, &alive, &shutdown),
            Err(Error::Disconnected)
        ));
    }

    #[test]
    fn reads_stop_on_shutdown() {
        let alive = AtomicBool::new(true);
        let shutdown = AtomicBool::new(true);
        let mut c = Cursor::new(vec![1u8, 52, 0, 0, 0, 0, 0, 8]);
        assert!(matches!(
            recv_msg(&mut c, &alive, &shutdown),
            Err(Error::Shutdown)
        ));
    }
}
