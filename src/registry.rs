//! Process registry
//!
//! The supervisor's in-memory directory of live workers. One owning map
//! keyed by PID, plus two secondary indices (session-ID and DTLS-ID)
//! holding PIDs; all three mutate together so the indices stay strict
//! functions of the primary set.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::os::unix::io::OwnedFd;
use std::time::Instant;

use log::debug;

use crate::ctrl::CtrlChannel;
use crate::listener::SockKind;
use crate::GatewayError;

/// Size of the per-client session token generated at accept time.
pub const SESSION_ID_LEN: usize = 32;

pub type Pid = libc::pid_t;

/// Tunnel device lease handed to a worker, owned by its record.
#[derive(Debug)]
pub struct TunLease {
    pub name: String,
    pub fd: Option<OwnedFd>,
}

/// How a worker is taken out of service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveMode {
    /// Close the control channel and let the worker wind down on its own.
    Graceful,
    /// Additionally deliver SIGTERM.
    Kill,
    /// Kill, and have sec-mod drop all state for the session.
    KillAndQuit,
}

/// A live worker.
pub struct Proc {
    pub pid: Pid,
    /// Main side of the worker control channel. Taken (closed) when the
    /// worker is shut down; the record itself stays until the child has
    /// been reaped.
    pub ctrl: Option<CtrlChannel>,
    /// Per-client session token, unique across live workers.
    pub sid: [u8; SESSION_ID_LEN],
    /// Session identifier observed in DTLS ClientHellos, set after the
    /// first successful hand-off.
    pub dtls_id: Option<Vec<u8>>,
    /// First observed DTLS source address.
    pub dtls_addr: Option<SocketAddr>,
    /// Peer address seen at accept; UNIX peers have none until the worker
    /// reports one.
    pub remote_addr: Option<SocketAddr>,
    /// Locally bound address seen by accept.
    pub our_addr: Option<SocketAddr>,
    /// Transport the client arrived over.
    pub conn_kind: SockKind,
    pub tun_lease: Option<TunLease>,
    /// Time of the last UDP descriptor hand-off.
    pub udp_fd_sent_at: Option<Instant>,
}

impl Proc {
    pub fn new(
        pid: Pid,
        ctrl: CtrlChannel,
        sid: [u8; SESSION_ID_LEN],
        remote_addr: Option<SocketAddr>,
        our_addr: Option<SocketAddr>,
        conn_kind: SockKind,
    ) -> Self {
        Self {
            pid,
            ctrl: Some(ctrl),
            sid,
            dtls_id: None,
            dtls_addr: None,
            remote_addr,
            our_addr,
            conn_kind,
            tun_lease: None,
            udp_fd_sent_at: None,
        }
    }

    /// The address the client is currently known by, preferring the DTLS
    /// source over the accept-time peer.
    pub fn client_addr(&self) -> Option<SocketAddr> {
        self.dtls_addr.or(self.remote_addr)
    }
}

/// Registry of live workers with PID, session-ID and DTLS-ID indices.
#[derive(Default)]
pub struct ProcTable {
    procs: HashMap<Pid, Proc>,
    by_sid: HashMap<[u8; SESSION_ID_LEN], Pid>,
    by_dtls: HashMap<Vec<u8>, Pid>,
}

impl ProcTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.procs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.procs.is_empty()
    }

    pub fn get(&self, pid: Pid) -> Option<&Proc> {
        self.procs.get(&pid)
    }

    pub fn get_mut(&mut self, pid: Pid) -> Option<&mut Proc> {
        self.procs.get_mut(&pid)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Proc> {
        self.procs.values()
    }

    pub fn pids(&self) -> Vec<Pid> {
        self.procs.keys().copied().collect()
    }

    /// Insert a new worker record, indexing it by PID and session-ID.
    /// Any index collision leaves the table untouched.
    pub fn insert(&mut self, proc: Proc) -> Result<(), GatewayError> {
        if self.procs.contains_key(&proc.pid) {
            return Err(GatewayError::Registry(format!(
                "pid {} already registered",
                proc.pid
            )));
        }
        if self.by_sid.contains_key(&proc.sid) {
            return Err(GatewayError::Registry(format!(
                "session id {} already registered",
                hex::encode(&proc.sid[..8])
            )));
        }
        if let Some(id) = &proc.dtls_id {
            if self.by_dtls.contains_key(id) {
                return Err(GatewayError::Registry(format!(
                    "dtls id {} already registered",
                    hex::encode(id)
                )));
            }
            self.by_dtls.insert(id.clone(), proc.pid);
        }
        self.by_sid.insert(proc.sid, proc.pid);
        self.procs.insert(proc.pid, proc);
        Ok(())
    }

    /// Find the worker owning a sniffed session identifier.
    ///
    /// The DTLS-ID index covers re-handshakes of sessions already
    /// dispatched once. A full-length identifier is then matched against
    /// the session-ID index directly, and a shorter one is treated as a
    /// session-ID prefix (linear over live workers).
    pub fn find_by_dtls_id(&self, id: &[u8]) -> Option<Pid> {
        if id.is_empty() {
            return None;
        }
        if let Some(&pid) = self.by_dtls.get(id) {
            return Some(pid);
        }
        if id.len() == SESSION_ID_LEN {
            let key: [u8; SESSION_ID_LEN] = id.try_into().ok()?;
            return self.by_sid.get(&key).copied();
        }
        if id.len() < SESSION_ID_LEN {
            let mut found = None;
            for proc in self.procs.values() {
                if proc.sid.starts_with(id) {
                    if found.is_some() {
                        // ambiguous prefix; refuse to guess
                        return None;
                    }
                    found = Some(proc.pid);
                }
            }
            return found;
        }
        None
    }

    /// IP-only fallback for datagrams that are not ClientHellos. The
    /// match is by host address, ignoring ports, and only an unambiguous
    /// match is returned.
    pub fn find_by_client_ip(&self, addr: &SocketAddr) -> Option<Pid> {
        let mut found = None;
        for proc in self.procs.values() {
            match proc.client_addr() {
                Some(known) if known.ip() == addr.ip() => {
                    if found.is_some() {
                        return None;
                    }
                    found = Some(proc.pid);
                }
                _ => {}
            }
        }
        found
    }

    /// Record the session identifier and source address observed in the
    /// first successfully dispatched ClientHello of a worker.
    pub fn update_dtls_ip(
        &mut self,
        pid: Pid,
        id: &[u8],
        addr: SocketAddr,
    ) -> Result<(), GatewayError> {
        match self.by_dtls.get(id) {
            Some(&owner) if owner != pid => {
                return Err(GatewayError::Registry(format!(
                    "dtls id {} already owned by pid {}",
                    hex::encode(id),
                    owner
                )));
            }
            _ => {}
        }
        let proc = self
            .procs
            .get_mut(&pid)
            .ok_or_else(|| GatewayError::Registry(format!("unknown pid {}", pid)))?;

        if let Some(old) = proc.dtls_id.take() {
            self.by_dtls.remove(&old);
        }
        proc.dtls_id = Some(id.to_vec());
        proc.dtls_addr = Some(addr);
        self.by_dtls.insert(id.to_vec(), pid);
        Ok(())
    }

    /// Take a worker out of service: close its control channel and signal
    /// it according to `mode`. The record stays in the table until
    /// [`remove_reaped`](Self::remove_reaped) collects it, so a PID is
    /// never recycled under us while the child is a zombie.
    ///
    /// Returns whether sec-mod must be told to drop the session.
    pub fn shutdown(&mut self, pid: Pid, mode: RemoveMode) -> bool {
        let Some(proc) = self.procs.get_mut(&pid) else {
            return false;
        };
        // dropping the channel closes our endpoint
        proc.ctrl = None;
        if matches!(mode, RemoveMode::Kill | RemoveMode::KillAndQuit) {
            // SAFETY: signalling a child we spawned and have not reaped.
            unsafe {
                libc::kill(pid, libc::SIGTERM);
            }
        }
        debug!("worker {} shut down ({:?})", pid, mode);
        matches!(mode, RemoveMode::KillAndQuit)
    }

    /// Drop the record of a reaped child, unindexing it everywhere.
    /// All descriptors the record still owns are closed here, exactly
    /// once, by drop.
    pub fn remove_reaped(&mut self, pid: Pid) -> Option<Proc> {
        let proc = self.procs.remove(&pid)?;
        self.by_sid.remove(&proc.sid);
        if let Some(id) = &proc.dtls_id {
            self.by_dtls.remove(id);
        }
        Some(proc)
    }

    #[cfg(test)]
    fn assert_consistent(&self) {
        assert_eq!(self.by_sid.len(), self.procs.len());
        for (sid, pid) in &self.by_sid {
            assert_eq!(&self.procs[pid].sid, sid);
        }
        for (id, pid) in &self.by_dtls {
            assert_eq!(self.procs[pid].dtls_id.as_ref(), Some(id));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ctrl::CtrlChannel;

    fn test_proc(pid: Pid, sid_seed: u8, addr: &str) -> (Proc, OwnedFd) {
        let (ctrl, peer) = CtrlChannel::pair().unwrap();
        let proc = Proc::new(
            pid,
            ctrl,
            [sid_seed; SESSION_ID_LEN],
            Some(addr.parse().unwrap()),
            None,
            SockKind::Tcp,
        );
        (proc, peer)
    }

    #[tokio::test]
    async fn test_insert_and_indices() {
        let mut table = ProcTable::new();
        let (p1, _k1) = test_proc(100, 1, "203.0.113.7:40000");
        let (p2, _k2) = test_proc(101, 2, "198.51.100.9:1234");
        table.insert(p1).unwrap();
        table.insert(p2).unwrap();
        table.assert_consistent();

        assert_eq!(table.len(), 2);
        assert_eq!(table.find_by_dtls_id(&[1u8; SESSION_ID_LEN]), Some(100));
        assert_eq!(
            table.find_by_client_ip(&"198.51.100.9:999".parse().unwrap()),
            Some(101)
        );
    }

    #[tokio::test]
    async fn test_duplicate_pid_and_sid_rejected() {
        let mut table = ProcTable::new();
        let (p1, _k1) = test_proc(100, 1, "203.0.113.7:40000");
        table.insert(p1).unwrap();

        let (dup_pid, _k2) = test_proc(100, 9, "203.0.113.8:40000");
        assert!(table.insert(dup_pid).is_err());

        let (dup_sid, _k3) = test_proc(101, 1, "203.0.113.8:40000");
        assert!(table.insert(dup_sid).is_err());

        table.assert_consistent();
        assert_eq!(table.len(), 1);
    }

    #[tokio::test]
    async fn test_sid_prefix_lookup() {
        let mut table = ProcTable::new();
        let (p1, _k1) = test_proc(100, 0xab, "203.0.113.7:40000");
        table.insert(p1).unwrap();

        assert_eq!(table.find_by_dtls_id(&[0xab, 0xab, 0xab, 0xab]), Some(100));
        assert_eq!(table.find_by_dtls_id(&[0xab, 0xcd]), None);
        assert_eq!(table.find_by_dtls_id(&[]), None);

        // ambiguous prefixes refuse to guess; vary the sid tail so the
        // two workers only share a prefix
        let (mut p2, _k2) = test_proc(101, 0xab, "203.0.113.8:40000");
        p2.sid[31] = 0;
        table.insert(p2).unwrap();
        assert_eq!(table.find_by_dtls_id(&[0xab, 0xab]), None);
    }

    #[tokio::test]
    async fn test_update_dtls_ip_and_rebind_lookup() {
        let mut table = ProcTable::new();
        let (p1, _k1) = test_proc(100, 1, "203.0.113.7:40000");
        table.insert(p1).unwrap();

        let dtls_src: SocketAddr = "203.0.113.7:40555".parse().unwrap();
        table.update_dtls_ip(100, b"abcd", dtls_src).unwrap();
        table.assert_consistent();

        assert_eq!(table.find_by_dtls_id(b"abcd"), Some(100));
        assert_eq!(table.get(100).unwrap().dtls_addr, Some(dtls_src));

        // the observed DTLS address takes over for IP matching
        assert_eq!(
            table.find_by_client_ip(&"203.0.113.7:5".parse().unwrap()),
            Some(100)
        );

        // a second worker may not claim the same DTLS id
        let (p2, _k2) = test_proc(101, 2, "198.51.100.9:1234");
        table.insert(p2).unwrap();
        assert!(table
            .update_dtls_ip(101, b"abcd", "198.51.100.9:1234".parse().unwrap())
            .is_err());
    }

    #[tokio::test]
    async fn test_ambiguous_ip_match_refused() {
        let mut table = ProcTable::new();
        let (p1, _k1) = test_proc(100, 1, "203.0.113.7:40000");
        let (p2, _k2) = test_proc(101, 2, "203.0.113.7:40001");
        table.insert(p1).unwrap();
        table.insert(p2).unwrap();

        assert_eq!(
            table.find_by_client_ip(&"203.0.113.7:9".parse().unwrap()),
            None
        );
    }

    #[tokio::test]
    async fn test_shutdown_then_reap_lifecycle() {
        let mut table = ProcTable::new();
        let (p1, _k1) = test_proc(std::process::id() as Pid, 1, "203.0.113.7:40000");
        let pid = p1.pid;
        table.insert(p1).unwrap();
        table.update_dtls_ip(pid, b"abcd", "203.0.113.7:40000".parse().unwrap()).unwrap();

        // graceful shutdown closes the channel but keeps the record
        assert!(!table.shutdown(pid, RemoveMode::Graceful));
        assert!(table.get(pid).unwrap().ctrl.is_none());
        assert_eq!(table.len(), 1);

        let proc = table.remove_reaped(pid).unwrap();
        assert_eq!(proc.pid, pid);
        assert!(table.is_empty());
        assert_eq!(table.find_by_dtls_id(b"abcd"), None);
        table.assert_consistent();
    }
}
