//! Supervisor event loop
//!
//! A single-threaded reactive loop over every event source the gateway
//! has: listening sockets, per-worker control channels, the sec-mod
//! channel, signals and the maintenance timer. All gateway state lives in
//! the [`Supervisor`] value and is only touched from this loop, so
//! nothing here needs a lock. Callbacks never block; the only sleeps are
//! the sec-mod startup delay, the reload serialization delay, and the
//! bounded reap loop during termination.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use tokio::signal::unix::{signal, Signal, SignalKind};

use crate::ban::BanDb;
use crate::config::GatewayConfig;
use crate::ctrl::{cmd, ChannelEvent, WorkerRequest};
use crate::dispatch;
use crate::lease::IpLeaseTable;
use crate::listener::{self, Listener, ListenerSet};
use crate::registry::{Pid, ProcTable, RemoveMode};
use crate::secmod::SecMod;
use crate::spawner::{self, AcceptOutcome};
use crate::GatewayError;

/// Bounded reap during termination: iterations x interval, then SIGKILL.
const REAP_ITERATIONS: u32 = 10;
const REAP_INTERVAL: Duration = Duration::from_millis(500);

/// Grace period for sec-mod to bring its worker-facing socket up.
const SECMOD_STARTUP_DELAY: Duration = Duration::from_millis(100);

/// Reload on main must happen after sec-mod has reloaded, so that the
/// certificate-vs-key consistency check sees matching material.
const RELOAD_SECMOD_DELAY: Duration = Duration::from_millis(1500);

/// Scratch buffer for UDP sniffing; larger than any DTLS record we relay
/// and comfortably inside a control frame.
const MSG_BUF_SIZE: usize = 16 * 1024;

#[derive(Debug, Clone, Copy)]
enum Event {
    Terminate,
    Reload,
    ChildExited,
    Maintenance,
    ListenerReadable(usize),
    WorkerReadable(Pid),
    SecModReadable,
}

/// Gateway-wide counters.
pub struct Stats {
    pub start_time: Instant,
    pub active_clients: u32,
    pub total_sessions: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
}

impl Default for Stats {
    fn default() -> Self {
        Self {
            start_time: Instant::now(),
            active_clients: 0,
            total_sessions: 0,
            bytes_in: 0,
            bytes_out: 0,
        }
    }
}

/// A hook script whose exit status is still owed to us.
struct ScriptWait {
    pid: Pid,
    worker_pid: Pid,
    disconnect: bool,
}

enum Reap {
    Child(Pid, libc::c_int),
    NonePending,
    NoChildren,
}

fn waitpid_nohang() -> Reap {
    let mut status: libc::c_int = 0;
    // SAFETY: waitpid with a stack-owned status slot.
    let pid = unsafe { libc::waitpid(-1, &mut status, libc::WNOHANG) };
    match pid {
        0 => Reap::NonePending,
        p if p > 0 => Reap::Child(p, status),
        _ => Reap::NoChildren,
    }
}

fn exit_summary(status: libc::c_int) -> (u32, Option<libc::c_int>) {
    if libc::WIFSIGNALED(status) {
        (1, Some(libc::WTERMSIG(status)))
    } else {
        (libc::WEXITSTATUS(status) as u32, None)
    }
}

/// The owning value of all main-process state.
pub struct Supervisor {
    config: Arc<GatewayConfig>,
    /// Aged-out config snapshots, kept while something still references
    /// them and discarded by the maintenance timer.
    old_configs: Vec<Arc<GatewayConfig>>,
    config_path: Option<PathBuf>,
    listeners: ListenerSet,
    table: ProcTable,
    scripts: Vec<ScriptWait>,
    leases: IpLeaseTable,
    ban: BanDb,
    secmod: SecMod,
    pub stats: Stats,
    default_nofile: libc::rlimit,
    msg_buf: Vec<u8>,
    /// Rotates the listener poll order so one busy socket cannot starve
    /// the others.
    listener_rr: usize,
}

impl Supervisor {
    /// Bind the listening surface and start the security module.
    /// Failures here are fatal for startup.
    pub async fn new(
        config: GatewayConfig,
        config_path: Option<PathBuf>,
    ) -> Result<Self, GatewayError> {
        // a worker or sec-mod closing a channel mid-write must not kill us
        // SAFETY: installing SIG_IGN for SIGPIPE process-wide.
        unsafe {
            libc::signal(libc::SIGPIPE, libc::SIG_IGN);
        }

        let default_nofile = spawner::raise_fd_limit(config.limits.max_clients)
            .map_err(GatewayError::Io)?;

        let listeners = listener::open_listeners(&config)?;
        let ban = BanDb::new(config.limits.ban_reset_time);

        let secmod = SecMod::spawn(&config)?;
        // give sec-mod a moment to bring its listening socket up before
        // the first worker tries to reach it
        tokio::time::sleep(SECMOD_STARTUP_DELAY).await;

        Ok(Self {
            config: Arc::new(config),
            old_configs: Vec::new(),
            config_path,
            listeners,
            table: ProcTable::new(),
            scripts: Vec::new(),
            leases: IpLeaseTable::new(),
            ban,
            secmod,
            stats: Stats::default(),
            default_nofile,
            msg_buf: vec![0u8; MSG_BUF_SIZE],
            listener_rr: 0,
        })
    }

    /// Run the event loop until a termination signal (or a sec-mod
    /// failure) breaks it. On return all children have been collected.
    pub async fn run(&mut self) -> Result<(), GatewayError> {
        let mut sigterm = watcher(SignalKind::terminate())?;
        let mut sigint = watcher(SignalKind::interrupt())?;
        let mut sighup = watcher(SignalKind::hangup())?;
        let mut sigchld = watcher(SignalKind::child())?;

        let mut maintenance = tokio::time::interval(self.config.limits.maintenance_interval);
        maintenance.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        maintenance.tick().await; // the immediate first tick

        info!(
            "initialized darvazeh {} ({} listeners)",
            env!("CARGO_PKG_VERSION"),
            self.listeners.listeners.len()
        );

        loop {
            let event = tokio::select! {
                _ = sigterm.recv() => Event::Terminate,
                _ = sigint.recv() => Event::Terminate,
                _ = sighup.recv() => Event::Reload,
                _ = sigchld.recv() => Event::ChildExited,
                _ = maintenance.tick() => Event::Maintenance,
                idx = next_ready_listener(&self.listeners.listeners, self.listener_rr) => Event::ListenerReadable(idx),
                pid = next_ready_worker(&self.table) => Event::WorkerReadable(pid),
                _ = self.secmod.ctrl.wait_readable() => Event::SecModReadable,
            };

            match event {
                Event::Terminate => {
                    self.terminate().await;
                    break;
                }
                Event::Reload => self.reload().await,
                Event::ChildExited => {
                    if self.reap_children() {
                        // sec-mod is gone and with it all auth state
                        self.terminate().await;
                        break;
                    }
                }
                Event::Maintenance => self.maintenance(),
                Event::ListenerReadable(idx) => {
                    self.listener_rr = self.listener_rr.wrapping_add(1);
                    self.listener_event(idx).await;
                }
                Event::WorkerReadable(pid) => self.worker_event(pid).await,
                Event::SecModReadable => {
                    if self.secmod_event().await {
                        error!("error in command from sec-mod");
                        self.terminate().await;
                        break;
                    }
                }
            }
        }

        self.listeners.cleanup_paths();
        Ok(())
    }

    async fn listener_event(&mut self, idx: usize) {
        let Some(l) = self.listeners.listeners.get(idx) else {
            return;
        };

        if l.is_stream() {
            let outcome = spawner::accept_and_spawn(
                &self.listeners.listeners[idx],
                &mut self.table,
                &self.ban,
                &self.config,
                self.stats.active_clients,
                self.default_nofile,
            )
            .await;
            match outcome {
                Ok(AcceptOutcome::Spawned(_)) => {
                    self.stats.active_clients += 1;
                    self.stats.total_sessions += 1;
                }
                Ok(_) => {}
                Err(e) => error!("accept handling failed: {}", e),
            }
        } else {
            let trusted_unix = self.listeners.has_unix();
            let res = dispatch::forward_udp_to_owner(
                &self.listeners.listeners[idx],
                &mut self.table,
                &self.config,
                trusted_unix,
                &mut self.msg_buf,
            )
            .await;
            if let Err(e) = res {
                error!("UDP dispatch failed: {}", e);
            }
        }

        if !self.config.limits.rate_limit.is_zero() {
            tokio::time::sleep(self.config.limits.rate_limit).await;
        }
    }

    async fn worker_event(&mut self, pid: Pid) {
        let event = match self.table.get_mut(pid).and_then(|p| p.ctrl.as_mut()) {
            Some(ctrl) => ctrl.recv().await,
            None => return,
        };

        match event {
            Ok(ChannelEvent::Closed) => {
                // worker said goodbye; the record goes once it is reaped
                self.shutdown_worker(pid, RemoveMode::Graceful);
            }
            Ok(ChannelEvent::Frames(frames)) => {
                for frame in frames {
                    match WorkerRequest::parse(&frame) {
                        Ok(req) => self.worker_request(pid, req),
                        Err(e) => {
                            warn!("bad control message from worker {}: {}", pid, e);
                            self.shutdown_worker(pid, RemoveMode::Kill);
                            return;
                        }
                    }
                }
            }
            Err(e) => {
                warn!("control channel error for worker {}: {}", pid, e);
                self.shutdown_worker(pid, RemoveMode::Kill);
            }
        }
    }

    fn worker_request(&mut self, pid: Pid, req: WorkerRequest) {
        match req {
            WorkerRequest::SessionSetup(setup) => {
                debug!(
                    "worker {} session setup ({} routes)",
                    pid,
                    setup.routes.len()
                );
                if let Some(ip) = setup.lease_ip {
                    if let Err(e) = self.leases.acquire(ip, pid) {
                        warn!("refusing session of worker {}: {}", pid, e);
                        self.shutdown_worker(pid, RemoveMode::Kill);
                        return;
                    }
                }
                if let Err(e) = self.secmod.forward(cmd::SESSION_SETUP, &setup.cookie) {
                    error!("could not forward session to sec-mod: {}", e);
                }
                self.run_hook(pid, false);
            }
            WorkerRequest::SessionTeardown => {
                debug!("worker {} session teardown", pid);
                self.leases.release_for(pid);
                self.run_hook(pid, true);
            }
            WorkerRequest::Stats(stats) => {
                self.stats.bytes_in = self.stats.bytes_in.wrapping_add(stats.bytes_in);
                self.stats.bytes_out = self.stats.bytes_out.wrapping_add(stats.bytes_out);
            }
        }
    }

    /// Spawn the connect/disconnect hook for a worker, when configured.
    fn run_hook(&mut self, worker_pid: Pid, disconnect: bool) {
        let script = if disconnect {
            self.config.scripts.disconnect.clone()
        } else {
            self.config.scripts.connect.clone()
        };
        let Some(script) = script else { return };
        let Some(proc) = self.table.get(worker_pid) else {
            return;
        };

        let mut env = vec![
            (
                "REASON".to_string(),
                if disconnect { "disconnect" } else { "connect" }.to_string(),
            ),
            ("DARVAZEH_SESSION_ID".to_string(), hex::encode(proc.sid)),
        ];
        if let Some(addr) = proc.client_addr() {
            env.push(("DARVAZEH_REMOTE_ADDR".to_string(), addr.to_string()));
        }

        match spawner::spawn_script(&script, &env) {
            Ok(pid) => self.scripts.push(ScriptWait {
                pid,
                worker_pid,
                disconnect,
            }),
            Err(e) => {
                error!("could not run {} hook: {}", if disconnect { "disconnect" } else { "connect" }, e);
                if !disconnect {
                    // a session whose connect hook cannot run is refused
                    self.shutdown_worker(worker_pid, RemoveMode::Kill);
                }
            }
        }
    }

    /// Opaque messages from the security module. A framing error, an
    /// unknown command or EOF is fatal: sec-mod holds authoritative auth
    /// state that we cannot continue without.
    async fn secmod_event(&mut self) -> bool {
        match self.secmod.ctrl.recv().await {
            Ok(ChannelEvent::Frames(frames)) => {
                for frame in frames {
                    match frame.cmd {
                        cmd::SECMOD_BAN => {
                            if !self.apply_ban_report(&frame.payload) {
                                return true;
                            }
                        }
                        other => {
                            error!("unknown sec-mod command {}", other);
                            return true;
                        }
                    }
                }
                false
            }
            Ok(ChannelEvent::Closed) => true,
            Err(e) => {
                error!("sec-mod channel error: {}", e);
                true
            }
        }
    }

    /// `score(4) || utf8 address`, reported by sec-mod on auth failures.
    fn apply_ban_report(&mut self, payload: &[u8]) -> bool {
        if payload.len() < 5 {
            return false;
        }
        let score = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
        let Ok(addr) = std::str::from_utf8(&payload[4..]) else {
            return false;
        };
        let Ok(ip) = addr.parse() else {
            return false;
        };
        self.ban.report(ip, score);
        true
    }

    /// Take a worker out of service, telling sec-mod to forget the
    /// session when the mode asks for it.
    fn shutdown_worker(&mut self, pid: Pid, mode: RemoveMode) {
        let release = self.table.shutdown(pid, mode);
        if release {
            if let Some(proc) = self.table.get(pid) {
                if let Err(e) = self.secmod.release_session(&proc.sid) {
                    debug!("could not release session of {}: {}", pid, e);
                }
            }
        }
    }

    /// Collect every exited child and route it: sec-mod exit is fatal
    /// (returns true), a worker exit retires its record, a hook exit
    /// feeds the hook handler.
    fn reap_children(&mut self) -> bool {
        loop {
            match waitpid_nohang() {
                Reap::NonePending | Reap::NoChildren => return false,
                Reap::Child(pid, status) => {
                    let (estatus, sig) = exit_summary(status);

                    if pid == self.secmod.pid {
                        match sig {
                            Some(libc::SIGSEGV) => error!("sec-mod {} died with sigsegv", pid),
                            Some(libc::SIGSYS) => error!("sec-mod {} died with sigsys", pid),
                            Some(s) => error!("sec-mod {} died with signal {}", pid, s),
                            None => error!("sec-mod {} exited with status {}", pid, estatus),
                        }
                        error!("sec-mod died unexpectedly");
                        return true;
                    }

                    if let Some(i) = self.scripts.iter().position(|s| s.pid == pid) {
                        let script = self.scripts.swap_remove(i);
                        self.script_exit(script, estatus);
                        continue;
                    }

                    if self.table.get(pid).is_some() {
                        match sig {
                            Some(libc::SIGSEGV) => error!("child {} died with sigsegv", pid),
                            Some(libc::SIGSYS) => error!("child {} died with sigsys", pid),
                            Some(s) => error!("child {} died with signal {}", pid, s),
                            None => debug!("worker {} exited with status {}", pid, estatus),
                        }
                        self.table.remove_reaped(pid);
                        self.leases.release_for(pid);
                        self.stats.active_clients = self.stats.active_clients.saturating_sub(1);
                        continue;
                    }

                    debug!("collected unknown child {}", pid);
                }
            }
        }
    }

    fn script_exit(&mut self, script: ScriptWait, estatus: u32) {
        debug!(
            "{} script for worker {} exited with {}",
            if script.disconnect { "disconnect" } else { "connect" },
            script.worker_pid,
            estatus
        );
        if !script.disconnect && estatus != 0 {
            info!(
                "connect script refused session of worker {} (status {})",
                script.worker_pid, estatus
            );
            self.shutdown_worker(script.worker_pid, RemoveMode::Kill);
        }
    }

    /// SIGHUP: sec-mod reloads first, then a new config snapshot replaces
    /// the current one. Listeners are left untouched, so repeated reloads
    /// with unchanged configuration are idempotent.
    async fn reload(&mut self) {
        info!("reloading configuration");
        self.secmod.signal(libc::SIGHUP);
        tokio::time::sleep(RELOAD_SECMOD_DELAY).await;

        let Some(path) = self.config_path.clone() else {
            info!("no configuration file to reload");
            return;
        };

        match GatewayConfig::from_file(&path) {
            Ok(new_config) => {
                if let Err(e) = new_config.validate() {
                    error!("reloaded configuration invalid, keeping old: {}", e);
                    return;
                }
                let old = std::mem::replace(&mut self.config, Arc::new(new_config));
                self.old_configs.push(old);

                for pid in self.table.pids() {
                    if let Some(ctrl) = self.table.get(pid).and_then(|p| p.ctrl.as_ref()) {
                        if let Err(e) = ctrl.send(cmd::RELOAD_NOTIFY, &[], None) {
                            debug!("could not notify worker {} of reload: {}", pid, e);
                        }
                    }
                }
            }
            Err(e) => error!("could not reload {}: {}", path.display(), e),
        }
    }

    /// Periodic maintenance: ban aging, stale snapshot collection, and a
    /// revocation-refresh nudge to sec-mod, which owns the certificate
    /// material in this architecture.
    fn maintenance(&mut self) {
        debug!("performing maintenance (banned IPs: {})", self.ban.len());
        self.ban.cleanup();
        self.old_configs.retain(|c| Arc::strong_count(c) > 1);
        if let Err(e) = self.secmod.forward(cmd::SECMOD_CRL_REFRESH, &[]) {
            debug!("could not nudge sec-mod for CRL refresh: {}", e);
        }
    }

    /// Broadcast termination and collect every child, escalating to
    /// SIGKILL when the bounded reap window runs out.
    async fn terminate(&mut self) {
        info!("termination request received; waiting for children to die");

        for pid in self.table.pids() {
            self.shutdown_worker(pid, RemoveMode::KillAndQuit);
        }
        self.secmod.signal(libc::SIGTERM);

        let mut remaining = REAP_ITERATIONS;
        let mut forced = false;
        loop {
            match waitpid_nohang() {
                Reap::Child(pid, _) => {
                    self.table.remove_reaped(pid);
                    self.leases.release_for(pid);
                    if let Some(i) = self.scripts.iter().position(|s| s.pid == pid) {
                        self.scripts.swap_remove(i);
                    }
                }
                Reap::NoChildren => break,
                Reap::NonePending => {
                    if remaining == 0 && !forced {
                        info!("not everyone died; forcing kill");
                        for pid in self.table.pids() {
                            // SAFETY: last-resort SIGKILL to our children.
                            unsafe { libc::kill(pid, libc::SIGKILL) };
                        }
                        for script in &self.scripts {
                            // SAFETY: as above.
                            unsafe { libc::kill(script.pid, libc::SIGKILL) };
                        }
                        self.secmod.signal(libc::SIGKILL);
                        forced = true;
                    }
                    remaining = remaining.saturating_sub(1);
                    tokio::time::sleep(REAP_INTERVAL).await;
                }
            }
        }

        self.stats.active_clients = 0;
    }
}

fn watcher(kind: SignalKind) -> Result<Signal, GatewayError> {
    signal(kind).map_err(GatewayError::Io)
}

/// Resolve once any listener becomes readable; pends forever when there
/// are none. `start` rotates the poll order because `select_all` prefers
/// lower indices when several sockets are ready at once.
async fn next_ready_listener(listeners: &[Listener], start: usize) -> usize {
    if listeners.is_empty() {
        return futures::future::pending::<usize>().await;
    }
    let n = listeners.len();
    let futs: Vec<_> = (0..n)
        .map(|off| {
            let i = (start + off) % n;
            let l = &listeners[i];
            Box::pin(async move {
                let _ = l.io.readable().await;
                i
            })
        })
        .collect();
    let (i, _, _) = futures::future::select_all(futs).await;
    i
}

/// Resolve once any live worker control channel becomes readable.
async fn next_ready_worker(table: &ProcTable) -> Pid {
    let futs: Vec<_> = table
        .iter()
        .filter_map(|p| p.ctrl.as_ref().map(|c| (p.pid, c)))
        .map(|(pid, c)| {
            Box::pin(async move {
                c.wait_readable().await;
                pid
            })
        })
        .collect();
    if futs.is_empty() {
        return futures::future::pending::<Pid>().await;
    }
    let (pid, _, _) = futures::future::select_all(futs).await;
    pid
}
