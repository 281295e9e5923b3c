//! Listener set
//!
//! The supervisor owns every bound socket for its whole lifetime. Sockets
//! come from one of three sources: descriptors inherited from a
//! supervising init system (socket activation), explicitly configured
//! TCP/UDP addresses, and an optional trusted UNIX stream socket. Every
//! descriptor ends up non-blocking and close-on-exec.

use std::ffi::CString;
use std::io;
use std::mem;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};

use log::{info, warn};
use tokio::io::unix::AsyncFd;

use crate::config::GatewayConfig;
use crate::sockopt;
use crate::GatewayError;

/// First descriptor passed by socket activation.
const SD_LISTEN_FDS_START: RawFd = 3;

/// Transport role of a listening socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SockKind {
    Tcp,
    Udp,
    Unix,
}

/// A bound listening socket. Immutable after creation.
pub struct Listener {
    pub io: AsyncFd<OwnedFd>,
    pub family: libc::c_int,
    pub kind: SockKind,
    pub protocol: libc::c_int,
    pub local_addr: Option<SocketAddr>,
    pub unix_path: Option<PathBuf>,
}

impl Listener {
    pub fn raw_fd(&self) -> RawFd {
        self.io.get_ref().as_raw_fd()
    }

    pub fn is_stream(&self) -> bool {
        matches!(self.kind, SockKind::Tcp | SockKind::Unix)
    }

    fn wrap(
        fd: OwnedFd,
        family: libc::c_int,
        kind: SockKind,
        protocol: libc::c_int,
        local_addr: Option<SocketAddr>,
        unix_path: Option<PathBuf>,
    ) -> io::Result<Self> {
        sockopt::set_nonblock(fd.as_raw_fd())?;
        sockopt::set_cloexec(fd.as_raw_fd())?;
        Ok(Self {
            io: AsyncFd::new(fd)?,
            family,
            kind,
            protocol,
            local_addr,
            unix_path,
        })
    }
}

/// The complete listening surface plus the effective port numbers
/// (re-derived from activation sockets when those are in use).
pub struct ListenerSet {
    pub listeners: Vec<Listener>,
    pub tcp_port: Option<u16>,
    pub udp_port: Option<u16>,
}

impl ListenerSet {
    pub fn has_unix(&self) -> bool {
        self.listeners.iter().any(|l| l.kind == SockKind::Unix)
    }

    /// Remove any UNIX socket paths we created.
    pub fn cleanup_paths(&self) {
        for l in &self.listeners {
            if let Some(path) = &l.unix_path {
                let _ = std::fs::remove_file(path);
            }
        }
    }
}

/// Build the listening surface described by the configuration.
pub fn open_listeners(config: &GatewayConfig) -> Result<ListenerSet, GatewayError> {
    if let Some(set) = adopt_activation_sockets(config)? {
        info!("listening on {} activation sockets", set.listeners.len());
        return Ok(set);
    }

    let mut listeners = Vec::new();

    if let Some(port) = config.listen.tcp_port {
        bind_inet_role(config, port, SockKind::Tcp, &mut listeners);
    }

    if let Some(path) = &config.listen.unix_socket {
        match bind_unix(config, path) {
            Ok(l) => listeners.push(l),
            Err(e) => {
                return Err(GatewayError::Listen(format!(
                    "could not listen on {}: {}",
                    path.display(),
                    e
                )))
            }
        }
    }

    if listeners.is_empty() {
        return Err(GatewayError::Listen(
            "could not listen on any TCP or UNIX port".to_string(),
        ));
    }

    if let Some(port) = config.listen.udp_port {
        bind_inet_role(config, port, SockKind::Udp, &mut listeners);
    }

    Ok(ListenerSet {
        listeners,
        tcp_port: config.listen.tcp_port,
        udp_port: config.listen.udp_port,
    })
}

/// Adopt descriptors passed by a supervising init system, if any.
/// Returns `None` when no activation environment is present.
fn adopt_activation_sockets(config: &GatewayConfig) -> Result<Option<ListenerSet>, GatewayError> {
    let Some(count) = activation_fd_count(
        std::env::var("LISTEN_PID").ok().as_deref(),
        std::env::var("LISTEN_FDS").ok().as_deref(),
        std::process::id(),
    ) else {
        return Ok(None);
    };

    let mut listeners = Vec::new();
    let mut tcp_port = None;
    let mut udp_port = None;

    for i in 0..count {
        let fd = SD_LISTEN_FDS_START + i as RawFd;
        let family = match getsockopt_int(fd, libc::SOL_SOCKET, libc::SO_DOMAIN) {
            Ok(f @ (libc::AF_INET | libc::AF_INET6)) => f,
            Ok(_) => {
                warn!("activation fd {} is not an internet socket, skipping", fd);
                continue;
            }
            Err(e) => {
                warn!("activation fd {} rejected: {}", fd, e);
                continue;
            }
        };
        let kind = match getsockopt_int(fd, libc::SOL_SOCKET, libc::SO_TYPE) {
            Ok(t) if t == libc::SOCK_STREAM => SockKind::Tcp,
            Ok(t) if t == libc::SOCK_DGRAM => SockKind::Udp,
            _ => {
                warn!("activation fd {} is neither stream nor datagram, skipping", fd);
                continue;
            }
        };

        if kind == SockKind::Udp {
            set_udp_socket_options(config, fd, family);
        }

        let local = match sockopt::local_addr(fd) {
            Ok(addr) => addr,
            Err(e) => {
                warn!("getsockname on activation fd {} failed: {}", fd, e);
                continue;
            }
        };

        // the effective listen port comes from the inherited socket
        if let Some(addr) = local {
            match kind {
                SockKind::Tcp => tcp_port = Some(addr.port()),
                SockKind::Udp => udp_port = Some(addr.port()),
                SockKind::Unix => {}
            }
        }

        // SAFETY: activation descriptors are ours by contract and are not
        // owned by any other value in this process.
        let owned = unsafe { OwnedFd::from_raw_fd(fd) };
        listeners.push(Listener::wrap(owned, family, kind, 0, local, None).map_err(GatewayError::Io)?);
    }

    if listeners.is_empty() {
        return Err(GatewayError::Listen(
            "no usable sockets were provided by the init system".to_string(),
        ));
    }

    Ok(Some(ListenerSet {
        listeners,
        tcp_port,
        udp_port,
    }))
}

/// Parse the activation environment. Returns the descriptor count when it
/// names this very process.
fn activation_fd_count(listen_pid: Option<&str>, listen_fds: Option<&str>, my_pid: u32) -> Option<u32> {
    let pid: u32 = listen_pid?.parse().ok()?;
    if pid != my_pid {
        return None;
    }
    let count: u32 = listen_fds?.parse().ok()?;
    if count == 0 {
        return None;
    }
    Some(count)
}

fn getsockopt_int(fd: RawFd, level: libc::c_int, opt: libc::c_int) -> io::Result<libc::c_int> {
    let mut val: libc::c_int = 0;
    let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;
    // SAFETY: val/len reference stack storage of the advertised size.
    let ret = unsafe {
        libc::getsockopt(fd, level, opt, &mut val as *mut _ as *mut libc::c_void, &mut len)
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(val)
}

/// Resolve the configured host for `port` and bind every usable address.
/// Individual failures are logged and skipped.
fn bind_inet_role(config: &GatewayConfig, port: u16, kind: SockKind, out: &mut Vec<Listener>) {
    let addrs: Vec<SocketAddr> = match &config.listen.host {
        Some(host) => match (host.as_str(), port).to_socket_addrs() {
            Ok(iter) => iter.collect(),
            Err(e) => {
                warn!("could not resolve listen host {}: {}", host, e);
                return;
            }
        },
        None => vec![
            SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), port),
            SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port),
        ],
    };

    for addr in addrs {
        match bind_inet(config, addr, kind) {
            Ok(listener) => {
                info!(
                    "listening ({:?}) on {}...",
                    kind,
                    listener.local_addr.unwrap_or(addr)
                );
                out.push(listener);
            }
            Err(e) => warn!("bind {:?} {} failed: {}", kind, addr, e),
        }
    }
}

fn bind_inet(config: &GatewayConfig, addr: SocketAddr, kind: SockKind) -> io::Result<Listener> {
    let family = if addr.is_ipv4() { libc::AF_INET } else { libc::AF_INET6 };
    let sock_type = match kind {
        SockKind::Udp => libc::SOCK_DGRAM,
        _ => libc::SOCK_STREAM,
    };

    // SAFETY: plain socket creation; ownership is taken immediately below.
    let fd = unsafe { libc::socket(family, sock_type | libc::SOCK_CLOEXEC | libc::SOCK_NONBLOCK, 0) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: fresh descriptor, not owned elsewhere.
    let owned = unsafe { OwnedFd::from_raw_fd(fd) };

    if family == libc::AF_INET6 {
        sockopt::set_ipv6_only(fd)?;
    }
    sockopt::set_reuseaddr(fd)?;
    if kind == SockKind::Udp {
        set_udp_socket_options(config, fd, family);
    }

    let (storage, len) = sockopt::to_sockaddr(&addr);
    // SAFETY: storage/len describe a valid sockaddr for this family.
    let ret = unsafe { libc::bind(fd, &storage as *const _ as *const libc::sockaddr, len) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }

    if kind == SockKind::Tcp {
        // SAFETY: listen on a bound stream socket.
        let ret = unsafe { libc::listen(fd, config.listen.backlog as libc::c_int) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
    }

    let local = sockopt::local_addr(fd).ok().flatten().or(Some(addr));
    Listener::wrap(owned, family, kind, 0, local, None)
}

/// Per-datagram destination recovery and MTU discovery on a UDP socket.
/// Option failures are reported but never abort startup.
fn set_udp_socket_options(config: &GatewayConfig, fd: RawFd, family: libc::c_int) {
    if let Err(e) = sockopt::set_recv_pktinfo(fd, family) {
        warn!("setsockopt(PKTINFO) failed: {}", e);
    }
    if config.listen.try_mtu {
        if let Err(e) = sockopt::set_mtu_discover(fd, family) {
            warn!("setsockopt(MTU_DISCOVER) failed: {}", e);
        }
    }
}

fn bind_unix(config: &GatewayConfig, path: &Path) -> io::Result<Listener> {
    // a previous instance may have left the path behind
    let _ = std::fs::remove_file(path);

    // SAFETY: plain socket creation; ownership is taken immediately below.
    let fd = unsafe {
        libc::socket(
            libc::AF_UNIX,
            libc::SOCK_STREAM | libc::SOCK_CLOEXEC | libc::SOCK_NONBLOCK,
            0,
        )
    };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: fresh descriptor, not owned elsewhere.
    let owned = unsafe { OwnedFd::from_raw_fd(fd) };

    // SAFETY: zeroed sockaddr_un is valid; the path copy below is bounds
    // checked first.
    let mut sa: libc::sockaddr_un = unsafe { mem::zeroed() };
    sa.sun_family = libc::AF_UNIX as libc::sa_family_t;
    let bytes = path.as_os_str().as_bytes();
    if bytes.len() >= sa.sun_path.len() {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "unix socket path too long"));
    }
    for (dst, src) in sa.sun_path.iter_mut().zip(bytes) {
        *dst = *src as libc::c_char;
    }

    // restrict the socket while it exists on disk
    // SAFETY: umask manipulation around the bind; the original mask is
    // restored on every path.
    let old_mask = unsafe { libc::umask(0o006) };
    let ret = unsafe {
        libc::bind(
            fd,
            &sa as *const _ as *const libc::sockaddr,
            mem::size_of::<libc::sockaddr_un>() as libc::socklen_t,
        )
    };
    unsafe { libc::umask(old_mask) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }

    let uid = config.privileges.uid.map(|u| u as libc::uid_t).unwrap_or(u32::MAX);
    let gid = config.privileges.gid.map(|g| g as libc::gid_t).unwrap_or(u32::MAX);
    if uid != u32::MAX || gid != u32::MAX {
        let c_path = CString::new(bytes).map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "nul in path"))?;
        // SAFETY: c_path is a valid nul-terminated string.
        if unsafe { libc::chown(c_path.as_ptr(), uid, gid) } < 0 {
            warn!("could not chown socket {}: {}", path.display(), io::Error::last_os_error());
        }
    }

    // SAFETY: listen on a bound stream socket.
    let ret = unsafe { libc::listen(fd, config.listen.backlog as libc::c_int) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }

    info!("listening (UNIX) on {}...", path.display());
    Listener::wrap(owned, libc::AF_UNIX, SockKind::Unix, 0, None, Some(path.to_path_buf()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GatewayConfig;

    fn localhost_config(tcp: Option<u16>, udp: Option<u16>) -> GatewayConfig {
        let mut config = GatewayConfig::default();
        config.listen.host = Some("127.0.0.1".to_string());
        config.listen.tcp_port = tcp;
        config.listen.udp_port = udp;
        config
    }

    #[test]
    fn test_activation_env_parsing() {
        assert_eq!(activation_fd_count(Some("42"), Some("2"), 42), Some(2));
        assert_eq!(activation_fd_count(Some("42"), Some("2"), 43), None);
        assert_eq!(activation_fd_count(Some("42"), Some("0"), 42), None);
        assert_eq!(activation_fd_count(None, Some("2"), 42), None);
        assert_eq!(activation_fd_count(Some("x"), Some("2"), 42), None);
    }

    #[tokio::test]
    async fn test_bind_ephemeral_tcp_and_udp() {
        let config = localhost_config(Some(0), Some(0));

        let mut listeners = Vec::new();
        bind_inet_role(&config, 0, SockKind::Tcp, &mut listeners);
        bind_inet_role(&config, 0, SockKind::Udp, &mut listeners);
        assert_eq!(listeners.len(), 2);
        assert_eq!(listeners[0].kind, SockKind::Tcp);
        assert!(listeners[0].is_stream());
        assert_eq!(listeners[1].kind, SockKind::Udp);
        assert!(!listeners[1].is_stream());

        // descriptors are non-blocking and close-on-exec
        for l in &listeners {
            // SAFETY: querying flags of descriptors owned by this test.
            let fl = unsafe { libc::fcntl(l.raw_fd(), libc::F_GETFL) };
            assert!(fl & libc::O_NONBLOCK != 0);
            let fd_flags = unsafe { libc::fcntl(l.raw_fd(), libc::F_GETFD) };
            assert!(fd_flags & libc::FD_CLOEXEC != 0);
        }
    }

    #[tokio::test]
    async fn test_no_surface_is_fatal() {
        let mut config = localhost_config(None, None);
        config.listen.unix_socket = None;
        assert!(open_listeners(&config).is_err());
    }

    #[tokio::test]
    async fn test_unix_listener() {
        let dir = std::env::temp_dir().join(format!("darvazeh-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("gw.sock");

        let mut config = localhost_config(None, None);
        config.listen.unix_socket = Some(path.clone());

        let set = open_listeners(&config).unwrap();
        assert!(set.has_unix());
        assert!(path.exists());

        set.cleanup_paths();
        assert!(!path.exists());
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
