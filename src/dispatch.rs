//! UDP dispatcher
//!
//! When a datagram listener becomes readable the dispatcher performs one
//! hand-off attempt: receive a single datagram, identify the owning
//! worker, build a connected per-flow socket and pass it over the
//! worker's control channel. The worker owns the descriptor from the
//! moment the send succeeds; the local copy is closed on every path.

use std::io;
use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd};
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::config::GatewayConfig;
use crate::ctrl::{cmd, UdpFdMsg};
use crate::listener::Listener;
use crate::registry::{Pid, ProcTable};
use crate::sniffer::{self, RECORD_PAYLOAD_POS};
use crate::sockopt;
use crate::GatewayError;

/// A worker is not handed a new UDP descriptor before this much time has
/// passed since the previous one, deduplicating retransmitted hellos the
/// worker has not consumed yet.
pub const UDP_FD_RESEND_TIME: Duration = Duration::from_secs(3);

/// DTLS record content type of handshake messages.
const CONTENT_HANDSHAKE: u8 = 22;

/// What a dispatch attempt did, for logging and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Descriptor passed to the owning worker.
    Forwarded { pid: Pid, hello: bool },
    /// Datagram discarded.
    Dropped,
    /// The readiness event was stale; nothing was read.
    NotReady,
}

/// Accept DTLS 1.x record versions, or the legacy pre-standard pair, at
/// either the record or the handshake offset.
fn dtls_version_ok(buf: &[u8]) -> bool {
    fn ok(major: u8, minor: u8) -> bool {
        major == 254 || (major == 1 && minor == 0)
    }
    if buf.len() >= 3 && ok(buf[1], buf[2]) {
        return true;
    }
    buf.len() >= RECORD_PAYLOAD_POS + 2 && ok(buf[RECORD_PAYLOAD_POS], buf[RECORD_PAYLOAD_POS + 1])
}

/// Handle one readable event on a UDP listener.
///
/// `trusted_unix` disables the IP-only fallback; with a front-end feeding
/// workers over the UNIX socket, source addresses on the UDP port are not
/// authoritative.
pub async fn forward_udp_to_owner(
    listener: &Listener,
    table: &mut ProcTable,
    config: &GatewayConfig,
    trusted_unix: bool,
    buf: &mut [u8],
) -> Result<DispatchOutcome, GatewayError> {
    let local_port = listener.local_addr.map(|a| a.port()).unwrap_or(0);

    let mut guard = listener.io.readable().await.map_err(GatewayError::Io)?;
    let datagram = match guard.try_io(|inner| {
        sockopt::recv_with_dest(inner.get_ref().as_raw_fd(), buf, local_port)
    }) {
        Ok(Ok(d)) => d,
        Ok(Err(e)) => {
            info!("error receiving in UDP socket: {}", e);
            return Ok(DispatchOutcome::Dropped);
        }
        Err(_would_block) => return Ok(DispatchOutcome::NotReady),
    };
    drop(guard);

    let data = &buf[..datagram.len];
    let src = datagram.src;

    if data.len() < RECORD_PAYLOAD_POS {
        info!("{}: too short UDP packet", src);
        return Ok(DispatchOutcome::Dropped);
    }

    if data[0] == CONTENT_HANDSHAKE {
        debug!(
            "new DTLS session from {} (record v{}.{})",
            src, data[1], data[2]
        );
    }

    if !dtls_version_ok(data) {
        info!("{}: unknown DTLS record version: {}.{}", src, data[1], data[2]);
        return Ok(DispatchOutcome::Dropped);
    }

    // a non-handshake datagram can still belong to a session whose NAT
    // changed the source port; fall back to matching the address alone
    let mut session_id: Option<&[u8]> = None;
    let match_ip_only = data[0] != CONTENT_HANDSHAKE;
    if match_ip_only {
        debug!(
            "{}: unexpected DTLS content type {}; possibly a rebound UDP session",
            src, data[0]
        );
        if trusted_unix {
            return Ok(DispatchOutcome::Dropped);
        }
    } else {
        match sniffer::extract_session_id(data, config.dtls_app_id) {
            Some(id) => session_id = Some(id),
            None => {
                info!("{}: too short handshake packet", src);
                return Ok(DispatchOutcome::Dropped);
            }
        }
    }

    let pid = if match_ip_only {
        table.find_by_client_ip(&src)
    } else {
        session_id.and_then(|id| table.find_by_dtls_id(id))
    };
    let Some(pid) = pid else {
        debug!("{}: no owner for UDP flow", src);
        return Ok(DispatchOutcome::Dropped);
    };

    let now = Instant::now();
    {
        let proc = table
            .get(pid)
            .ok_or_else(|| GatewayError::Registry(format!("unknown pid {}", pid)))?;
        if let Some(last) = proc.udp_fd_sent_at {
            if now.duration_since(last) <= UDP_FD_RESEND_TIME {
                debug!("received UDP connection too soon from {}", src);
                return Ok(DispatchOutcome::Dropped);
            }
        }
    }

    let flow_fd = match new_flow_socket(listener, config, datagram.dst, src) {
        Ok(fd) => fd,
        Err(e) => {
            warn!("new UDP socket for {} failed: {}", src, e);
            return Ok(DispatchOutcome::Dropped);
        }
    };

    let hello = !match_ip_only;
    let msg = UdpFdMsg {
        hello,
        data: data.to_vec(),
    };

    let sent = {
        let proc = table
            .get(pid)
            .ok_or_else(|| GatewayError::Registry(format!("unknown pid {}", pid)))?;
        match &proc.ctrl {
            Some(ctrl) => ctrl.send(cmd::UDP_FD, &msg.encode(), Some(flow_fd.as_raw_fd())),
            None => Err(io::Error::new(io::ErrorKind::NotConnected, "worker shutting down")),
        }
    };

    // the worker owns the descriptor now (or never will); either way our
    // copy goes
    drop(flow_fd);

    if let Err(e) = sent {
        warn!("error passing UDP socket from {}: {}", src, e);
        return Ok(DispatchOutcome::Dropped);
    }

    debug!("passed UDP socket from {} (hello: {})", src, hello);
    if let Some(proc) = table.get_mut(pid) {
        proc.udp_fd_sent_at = Some(now);
    }
    if hello {
        if let Some(id) = session_id {
            if let Err(e) = table.update_dtls_ip(pid, id, src) {
                warn!("could not index DTLS session for pid {}: {}", pid, e);
            }
        }
    }

    Ok(DispatchOutcome::Forwarded { pid, hello })
}

/// Create the connected per-flow socket handed to the worker: same family
/// and protocol as the listener, bound to the address the client
/// targeted, connected to the client.
fn new_flow_socket(
    listener: &Listener,
    config: &GatewayConfig,
    local_dst: Option<SocketAddr>,
    remote: SocketAddr,
) -> io::Result<OwnedFd> {
    // SAFETY: plain socket creation; ownership is taken immediately below.
    let fd = unsafe {
        libc::socket(
            listener.family,
            libc::SOCK_DGRAM | libc::SOCK_CLOEXEC,
            listener.protocol,
        )
    };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: fresh descriptor, not owned elsewhere.
    let owned = unsafe { OwnedFd::from_raw_fd(fd) };

    if listener.family == libc::AF_INET6 {
        let _ = sockopt::set_ipv6_only(fd);
    }
    sockopt::set_reuseaddr(fd)?;
    if config.listen.try_mtu {
        let _ = sockopt::set_mtu_discover(fd, listener.family);
    }

    if let Some(dst) = local_dst {
        let (storage, len) = sockopt::to_sockaddr(&dst);
        // SAFETY: storage/len describe a valid sockaddr for this family.
        let ret = unsafe { libc::bind(fd, &storage as *const _ as *const libc::sockaddr, len) };
        if ret < 0 {
            // replies will egress from whatever the kernel picks
            info!("bind UDP to {} failed: {}", dst, io::Error::last_os_error());
        }
    }

    let (storage, len) = sockopt::to_sockaddr(&remote);
    // SAFETY: storage/len describe a valid sockaddr for this family.
    let ret = unsafe { libc::connect(fd, &storage as *const _ as *const libc::sockaddr, len) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(owned)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dtls_version_check() {
        // DTLS 1.2 record
        let mut rec = vec![22u8, 254, 253];
        rec.resize(64, 0);
        assert!(dtls_version_ok(&rec));

        // legacy pre-standard pair
        rec[1] = 1;
        rec[2] = 0;
        assert!(dtls_version_ok(&rec));

        // garbage at the record offset but DTLS at the handshake offset
        rec[1] = 9;
        rec[2] = 9;
        rec[RECORD_PAYLOAD_POS] = 254;
        rec[RECORD_PAYLOAD_POS + 1] = 255;
        assert!(dtls_version_ok(&rec));

        // nothing valid anywhere
        rec[RECORD_PAYLOAD_POS] = 9;
        rec[RECORD_PAYLOAD_POS + 1] = 9;
        assert!(!dtls_version_ok(&rec));

        // too short for either offset
        assert!(!dtls_version_ok(&[22, 9]));
    }
}
