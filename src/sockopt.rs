//! Low-level socket plumbing shared by the listener set and the dispatcher.
//!
//! Everything in this module is a thin wrapper over libc: option setters
//! that must run before `bind`, sockaddr conversions, and the two cmsg
//! operations the supervisor needs (destination-address recovery on UDP
//! receive, SCM_RIGHTS descriptor passing on send).

use std::io;
use std::mem;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::unix::io::RawFd;

fn setsockopt_int(fd: RawFd, level: libc::c_int, opt: libc::c_int, val: libc::c_int) -> io::Result<()> {
    // SAFETY: fd is a valid descriptor owned by the caller; the value is a
    // plain int with matching length.
    let ret = unsafe {
        libc::setsockopt(
            fd,
            level,
            opt,
            &val as *const libc::c_int as *const libc::c_void,
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

pub fn set_reuseaddr(fd: RawFd) -> io::Result<()> {
    setsockopt_int(fd, libc::SOL_SOCKET, libc::SO_REUSEADDR, 1)
}

/// Avoid an AF_INET6 listener claiming the IPv4 port as well, so parallel
/// IPv4 sockets can bind.
pub fn set_ipv6_only(fd: RawFd) -> io::Result<()> {
    setsockopt_int(fd, libc::IPPROTO_IPV6, libc::IPV6_V6ONLY, 1)
}

/// Ask the kernel to report each datagram's destination address, so replies
/// can egress from the address the client targeted.
pub fn set_recv_pktinfo(fd: RawFd, family: libc::c_int) -> io::Result<()> {
    match family {
        libc::AF_INET => setsockopt_int(fd, libc::IPPROTO_IP, libc::IP_PKTINFO, 1),
        libc::AF_INET6 => setsockopt_int(fd, libc::IPPROTO_IPV6, libc::IPV6_RECVPKTINFO, 1),
        _ => Ok(()),
    }
}

/// Enable path-MTU discovery on a UDP socket.
pub fn set_mtu_discover(fd: RawFd, family: libc::c_int) -> io::Result<()> {
    match family {
        libc::AF_INET => setsockopt_int(fd, libc::IPPROTO_IP, libc::IP_MTU_DISCOVER, libc::IP_PMTUDISC_DO),
        libc::AF_INET6 => setsockopt_int(
            fd,
            libc::IPPROTO_IPV6,
            libc::IPV6_MTU_DISCOVER,
            libc::IP_PMTUDISC_DO,
        ),
        _ => Ok(()),
    }
}

pub fn set_nonblock(fd: RawFd) -> io::Result<()> {
    // SAFETY: plain fcntl flag manipulation on a caller-owned descriptor.
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags < 0 || libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

pub fn set_block(fd: RawFd) -> io::Result<()> {
    // SAFETY: as above.
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags < 0 || libc::fcntl(fd, libc::F_SETFL, flags & !libc::O_NONBLOCK) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

pub fn set_cloexec(fd: RawFd) -> io::Result<()> {
    // SAFETY: as above.
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFD);
        if flags < 0 || libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Convert a `SocketAddr` into a sockaddr_storage suitable for bind/connect.
pub fn to_sockaddr(addr: &SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    // SAFETY: zeroed storage is a valid bit pattern for sockaddr_storage.
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    match addr {
        SocketAddr::V4(v4) => {
            let sin = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: v4.port().to_be(),
                sin_addr: libc::in_addr {
                    s_addr: u32::from_ne_bytes(v4.ip().octets()),
                },
                sin_zero: [0; 8],
            };
            // SAFETY: sockaddr_in fits inside sockaddr_storage.
            unsafe {
                std::ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in, sin);
            }
            (storage, mem::size_of::<libc::sockaddr_in>() as libc::socklen_t)
        }
        SocketAddr::V6(v6) => {
            let sin6 = libc::sockaddr_in6 {
                sin6_family: libc::AF_INET6 as libc::sa_family_t,
                sin6_port: v6.port().to_be(),
                sin6_flowinfo: v6.flowinfo(),
                sin6_addr: libc::in6_addr {
                    s6_addr: v6.ip().octets(),
                },
                sin6_scope_id: v6.scope_id(),
            };
            // SAFETY: sockaddr_in6 fits inside sockaddr_storage.
            unsafe {
                std::ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in6, sin6);
            }
            (storage, mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t)
        }
    }
}

/// Convert a filled sockaddr_storage back into a `SocketAddr`. Returns
/// `None` for non-internet families (e.g. AF_UNIX peers).
pub fn from_sockaddr(storage: &libc::sockaddr_storage) -> Option<SocketAddr> {
    match storage.ss_family as libc::c_int {
        libc::AF_INET => {
            // SAFETY: family says the storage holds a sockaddr_in.
            let sin = unsafe { &*(storage as *const _ as *const libc::sockaddr_in) };
            let ip = Ipv4Addr::from(sin.sin_addr.s_addr.to_ne_bytes());
            Some(SocketAddr::V4(SocketAddrV4::new(ip, u16::from_be(sin.sin_port))))
        }
        libc::AF_INET6 => {
            // SAFETY: family says the storage holds a sockaddr_in6.
            let sin6 = unsafe { &*(storage as *const _ as *const libc::sockaddr_in6) };
            let ip = Ipv6Addr::from(sin6.sin6_addr.s6_addr);
            Some(SocketAddr::V6(SocketAddrV6::new(
                ip,
                u16::from_be(sin6.sin6_port),
                sin6.sin6_flowinfo,
                sin6.sin6_scope_id,
            )))
        }
        _ => None,
    }
}

/// Local socket name of `fd`, when it has an internet address.
pub fn local_addr(fd: RawFd) -> io::Result<Option<SocketAddr>> {
    // SAFETY: getsockname writes at most addr_len bytes into storage.
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut addr_len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    let ret = unsafe {
        libc::getsockname(fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut addr_len)
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(from_sockaddr(&storage))
}

/// One datagram received together with its addressing.
pub struct RecvDatagram {
    pub len: usize,
    pub src: SocketAddr,
    /// Destination address the client targeted, recovered from
    /// IP_PKTINFO / IPV6_PKTINFO. The port is the listener's own, which
    /// the kernel does not repeat in the control message.
    pub dst: Option<SocketAddr>,
}

/// Receive a single datagram with `recvmsg`, recovering source and
/// destination addresses. `local_port` fills in the destination port.
pub fn recv_with_dest(fd: RawFd, buf: &mut [u8], local_port: u16) -> io::Result<RecvDatagram> {
    // SAFETY: all pointers handed to recvmsg reference stack storage that
    // outlives the call; cmsg parsing only walks buffers the kernel filled.
    unsafe {
        let mut src: libc::sockaddr_storage = mem::zeroed();
        let mut iov = libc::iovec {
            iov_base: buf.as_mut_ptr() as *mut libc::c_void,
            iov_len: buf.len(),
        };
        let mut cmsg_space = [0u8; 128];

        let mut msg: libc::msghdr = mem::zeroed();
        msg.msg_name = &mut src as *mut _ as *mut libc::c_void;
        msg.msg_namelen = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        msg.msg_control = cmsg_space.as_mut_ptr() as *mut libc::c_void;
        msg.msg_controllen = cmsg_space.len();

        let n = libc::recvmsg(fd, &mut msg, 0);
        if n < 0 {
            return Err(io::Error::last_os_error());
        }

        let src = from_sockaddr(&src)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "non-inet datagram source"))?;

        let mut dst = None;
        let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
        while !cmsg.is_null() {
            let hdr = &*cmsg;
            if hdr.cmsg_level == libc::IPPROTO_IP && hdr.cmsg_type == libc::IP_PKTINFO {
                let info = &*(libc::CMSG_DATA(cmsg) as *const libc::in_pktinfo);
                let ip = Ipv4Addr::from(info.ipi_addr.s_addr.to_ne_bytes());
                dst = Some(SocketAddr::new(IpAddr::V4(ip), local_port));
            } else if hdr.cmsg_level == libc::IPPROTO_IPV6 && hdr.cmsg_type == libc::IPV6_PKTINFO {
                let info = &*(libc::CMSG_DATA(cmsg) as *const libc::in6_pktinfo);
                let ip = Ipv6Addr::from(info.ipi6_addr.s6_addr);
                dst = Some(SocketAddr::new(IpAddr::V6(ip), local_port));
            }
            cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
        }

        Ok(RecvDatagram {
            len: n as usize,
            src,
            dst,
        })
    }
}

/// Send `bufs` as one message, attaching `fd_to_pass` as SCM_RIGHTS
/// ancillary data when present. Returns the number of payload bytes sent.
pub fn send_with_fd(sock: RawFd, bufs: &[&[u8]], fd_to_pass: Option<RawFd>) -> io::Result<usize> {
    // SAFETY: iovecs and the cmsg buffer live on the stack for the whole
    // call; CMSG_* macro arithmetic stays inside that buffer.
    unsafe {
        let mut iov: Vec<libc::iovec> = bufs
            .iter()
            .map(|b| libc::iovec {
                iov_base: b.as_ptr() as *mut libc::c_void,
                iov_len: b.len(),
            })
            .collect();

        let mut cmsg_space = [0u8; 32];
        let mut msg: libc::msghdr = mem::zeroed();
        msg.msg_iov = iov.as_mut_ptr();
        msg.msg_iovlen = iov.len();

        if let Some(fd) = fd_to_pass {
            msg.msg_control = cmsg_space.as_mut_ptr() as *mut libc::c_void;
            msg.msg_controllen = libc::CMSG_SPACE(mem::size_of::<libc::c_int>() as u32) as usize;

            let cmsg = libc::CMSG_FIRSTHDR(&msg);
            (*cmsg).cmsg_level = libc::SOL_SOCKET;
            (*cmsg).cmsg_type = libc::SCM_RIGHTS;
            (*cmsg).cmsg_len = libc::CMSG_LEN(mem::size_of::<libc::c_int>() as u32) as usize;
            std::ptr::write_unaligned(libc::CMSG_DATA(cmsg) as *mut libc::c_int, fd);
        }

        let n = libc::sendmsg(sock, &msg, libc::MSG_NOSIGNAL);
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }
}

/// Receive one message of at most `buf.len()` bytes, collecting a passed
/// descriptor when the sender attached one.
pub fn recv_with_fd(sock: RawFd, buf: &mut [u8]) -> io::Result<(usize, Option<RawFd>)> {
    // SAFETY: see send_with_fd; the received descriptor is owned by the
    // caller from here on.
    unsafe {
        let mut iov = libc::iovec {
            iov_base: buf.as_mut_ptr() as *mut libc::c_void,
            iov_len: buf.len(),
        };
        let mut cmsg_space = [0u8; 32];
        let mut msg: libc::msghdr = mem::zeroed();
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        msg.msg_control = cmsg_space.as_mut_ptr() as *mut libc::c_void;
        msg.msg_controllen = cmsg_space.len();

        let n = libc::recvmsg(sock, &mut msg, 0);
        if n < 0 {
            return Err(io::Error::last_os_error());
        }

        let mut passed = None;
        let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
        while !cmsg.is_null() {
            let hdr = &*cmsg;
            if hdr.cmsg_level == libc::SOL_SOCKET && hdr.cmsg_type == libc::SCM_RIGHTS {
                passed = Some(std::ptr::read_unaligned(libc::CMSG_DATA(cmsg) as *const libc::c_int));
            }
            cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
        }

        Ok((n as usize, passed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sockaddr_roundtrip_v4() {
        let addr: SocketAddr = "203.0.113.7:40000".parse().unwrap();
        let (storage, _) = to_sockaddr(&addr);
        assert_eq!(from_sockaddr(&storage), Some(addr));
    }

    #[test]
    fn test_sockaddr_roundtrip_v6() {
        let addr: SocketAddr = "[2001:db8::17]:443".parse().unwrap();
        let (storage, _) = to_sockaddr(&addr);
        assert_eq!(from_sockaddr(&storage), Some(addr));
    }

    #[test]
    fn test_non_inet_family_is_none() {
        // SAFETY: zeroed storage with an AF_UNIX family tag is a valid
        // (if empty) sockaddr_storage.
        let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        storage.ss_family = libc::AF_UNIX as libc::sa_family_t;
        assert!(from_sockaddr(&storage).is_none());
    }
}
