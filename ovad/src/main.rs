// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use anyhow::{anyhow, Result};
use clap::Parser;
use ctlp::clock::Clock;
use ctlp::{
    Inbound, Session, SessionConfig, SyncConfig, SyncEngine, RECV_QUEUE_DEPTH,
    SEND_QUEUE_DEPTH,
};
use monitor::PortMonitor;
use ova_common::cli::get_styles;
use ova_common::gate::Gate;
use ova_common::log::{init_file_logger, init_logger};
use ova_lower::platform::{OfctlSink, OvsResolver};
use ova_lower::{Lower, LowerConfig};
use slog::{info, Logger};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::sync_channel;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use topodb::Db;

mod monitor;

pub(crate) const COMPONENT_OVAD: &str = "ovad";
pub(crate) const MOD_DAEMON: &str = "daemon";
pub(crate) const MOD_MONITOR: &str = "monitor";

#[derive(Parser, Debug)]
#[command(version, about, long_about = None, styles = get_styles())]
/// Overlay network agent: mirrors controller topology into the local
/// virtual switch.
struct Cli {
    /// Address of the network controller.
    #[arg(long, env = "OVAD_MANAGER_ADDR", default_value_t = Ipv4Addr::LOCALHOST.into())]
    manager_addr: IpAddr,

    #[arg(long, env = "OVAD_MANAGER_PORT", default_value_t = 16888)]
    manager_port: u16,

    /// Integration bridge the rules are installed on.
    #[arg(long, env = "OVAD_BRIDGE", default_value_t = String::from("br-int"))]
    bridge: String,

    /// Switch port handle of the uplink.
    #[arg(long, env = "OVAD_UPLINK", default_value_t = 1)]
    uplink: u32,

    /// Name this host is known by at the controller. Defaults to the
    /// system host name.
    #[arg(long, env = "OVAD_HOST_NAME")]
    host_name: Option<String>,

    /// Sync and recompute loop tick.
    #[arg(long, env = "OVAD_TICK_MS", default_value_t = 1000)]
    tick_ms: u64,

    #[arg(long, env = "OVAD_RECONNECT_MS", default_value_t = 2000)]
    reconnect_ms: u64,

    #[arg(long, env = "OVAD_CONNECT_RETRIES", default_value_t = 5)]
    connect_retries: u32,

    /// Ticks between periodic full resyncs.
    #[arg(long, env = "OVAD_RESYNC_TICKS", default_value_t = 60)]
    resync_ticks: u32,

    /// Ticks before the first periodic resync.
    #[arg(long, env = "OVAD_RESYNC_DELAY_TICKS", default_value_t = 5)]
    resync_delay_ticks: u32,

    /// Recompute cycles a port event waits for its port to arrive.
    #[arg(long, env = "OVAD_WAIT_RETRIES", default_value_t = 10)]
    wait_retries: u32,

    /// Local port monitor interval.
    #[arg(long, env = "OVAD_POLL_MS", default_value_t = 2000)]
    poll_ms: u64,

    /// Write bunyan logs here instead of stdout.
    #[arg(long, env = "OVAD_LOG_FILE")]
    log_file: Option<String>,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    let log = match &args.log_file {
        Some(path) => init_file_logger(path)?,
        None => init_logger(),
    };
    run(args, log)
}

fn host_name(args: &Cli) -> Result<String> {
    if let Some(h) = &args.host_name {
        return Ok(h.clone());
    }
    let h = hostname::get()?.to_string_lossy().into_owned();
    if h.is_empty() {
        return Err(anyhow!("system host name is empty"));
    }
    Ok(h)
}

fn spawn<F>(name: &str, f: F) -> Result<JoinHandle<()>>
where
    F: FnOnce() + Send + 'static,
{
    Ok(std::thread::Builder::new().name(name.into()).spawn(f)?)
}

fn run(args: Cli, log: Logger) -> Result<()> {
    let host = host_name(&args)?;
    let tick = Duration::from_millis(args.tick_ms);
    let peer = SocketAddr::new(args.manager_addr, args.manager_port);
    info!(log, "starting overlay agent";
        "component" => COMPONENT_OVAD,
        "module" => MOD_DAEMON,
        "host" => &host,
        "controller" => peer.to_string(),
        "bridge" => &args.bridge,
    );

    let db = Db::new(&host, log.clone());
    let gate = Gate::new();
    let shutdown = Arc::new(AtomicBool::new(false));

    let (out_tx, out_rx) = sync_channel(SEND_QUEUE_DEPTH);
    let (in_tx, in_rx) = sync_channel::<Inbound>(RECV_QUEUE_DEPTH);

    let mut session_config = SessionConfig::new(peer);
    session_config.reconnect_interval = Duration::from_millis(args.reconnect_ms);
    session_config.connect_retries = args.connect_retries;
    let mut session =
        Session::start(session_config, in_tx.clone(), out_rx, log.clone())?;

    let mut clock = Clock::new(
        tick,
        tick * args.resync_ticks,
        tick * args.resync_delay_ticks,
        in_tx,
        log.clone(),
    )?;

    let engine = SyncEngine::new(
        db.clone(),
        gate.clone(),
        out_tx,
        SyncConfig {
            tick,
            ..Default::default()
        },
        log.clone(),
    );
    let s = shutdown.clone();
    let sync = spawn("ovad-sync", move || engine.run(in_rx, s))?;

    let lower = Lower::new(
        db,
        gate,
        OfctlSink::new(&args.bridge, log.clone()),
        OvsResolver::new(&args.bridge),
        LowerConfig {
            uplink: args.uplink,
            tick,
            wait_retries: args.wait_retries,
        },
        log.clone(),
    );
    let notifier = lower.notifier();
    let s = shutdown.clone();
    let recompute = spawn("ovad-lower", move || lower.run(s))?;

    let monitor = PortMonitor::new(OvsResolver::new(&args.bridge), log.clone());
    let poll = Duration::from_millis(args.poll_ms);
    let s = shutdown.clone();
    let watcher = spawn("ovad-monitor", move || monitor.run(notifier, poll, s))?;

    let main = std::thread::current();
    let s = shutdown.clone();
    ctrlc::set_handler(move || {
        s.store(true, Ordering::Relaxed);
        main.unpark();
    })?;

    while !shutdown.load(Ordering::Relaxed) {
        std::thread::park();
    }

    info!(log, "shutting down";
        "component" => COMPONENT_OVAD,
        "module" => MOD_DAEMON,
    );
    session.shutdown();
    clock.shutdown();
    for t in [sync, recompute, watcher] {
        if t.join().is_err() {
            return Err(anyhow!("worker thread panicked"));
        }
    }
    Ok(())
}
