//! Worker and sec-mod control channels
//!
//! Both channels speak the same envelope: a 4-byte big-endian length, a
//! command byte, and a command-specific payload, with an optional
//! descriptor attached as SCM_RIGHTS ancillary data. The payloads are
//! hand-encoded; the channel never interprets sec-mod payloads beyond the
//! envelope.

use std::io;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use bytes::{Buf, BytesMut};
use tokio::io::unix::AsyncFd;

use crate::sockopt;
use crate::GatewayError;

/// Upper bound on a frame payload; a frame declaring more is a protocol
/// violation from the peer.
pub const MAX_FRAME_PAYLOAD: usize = 64 * 1024;

/// Frame header: length (4, covers cmd + payload) + command (1).
const FRAME_HEADER: usize = 4;

/// Command bytes of the control protocol.
pub mod cmd {
    /// main -> worker: connected UDP descriptor hand-off
    pub const UDP_FD: u8 = 1;
    /// main -> worker: terminate the session
    pub const TERMINATE: u8 = 2;
    /// main -> worker: configuration was reloaded
    pub const RELOAD_NOTIFY: u8 = 3;

    /// worker -> main: session establishment request
    pub const SESSION_SETUP: u8 = 16;
    /// worker -> main: session closed
    pub const SESSION_TEARDOWN: u8 = 17;
    /// worker -> main: transfer statistics update
    pub const STATS: u8 = 18;

    /// main -> sec-mod: release all state held for a session
    pub const SECMOD_RELEASE: u8 = 32;
    /// sec-mod -> main: score an address in the ban database
    pub const SECMOD_BAN: u8 = 33;
    /// main -> sec-mod: maintenance nudge to re-read revocation data
    pub const SECMOD_CRL_REFRESH: u8 = 34;
}

/// One decoded control frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub cmd: u8,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(FRAME_HEADER + 1 + self.payload.len());
        out.extend_from_slice(&((self.payload.len() + 1) as u32).to_be_bytes());
        out.push(self.cmd);
        out.extend_from_slice(&self.payload);
        out
    }
}

/// Incremental frame decoder over a stream of bytes.
#[derive(Default)]
pub struct FrameDecoder {
    buf: BytesMut,
}

impl FrameDecoder {
    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Pop the next complete frame, if any.
    pub fn next(&mut self) -> Result<Option<Frame>, GatewayError> {
        if self.buf.len() < FRAME_HEADER {
            return Ok(None);
        }
        let declared = u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]) as usize;
        if declared == 0 || declared > MAX_FRAME_PAYLOAD + 1 {
            return Err(GatewayError::Ctrl(format!(
                "invalid frame length {}",
                declared
            )));
        }
        if self.buf.len() < FRAME_HEADER + declared {
            return Ok(None);
        }
        self.buf.advance(FRAME_HEADER);
        let cmd = self.buf[0];
        self.buf.advance(1);
        let payload = self.buf.split_to(declared - 1).to_vec();
        Ok(Some(Frame { cmd, payload }))
    }
}

/// UDP descriptor hand-off payload: `hello(1) || datagram`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpFdMsg {
    /// True for a new DTLS session, false for a NAT rebind.
    pub hello: bool,
    /// The raw datagram, replayed by the worker as the first DTLS record.
    pub data: Vec<u8>,
}

impl UdpFdMsg {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(1 + self.data.len());
        out.push(self.hello as u8);
        out.extend_from_slice(&self.data);
        out
    }

    pub fn parse(payload: &[u8]) -> Result<Self, GatewayError> {
        if payload.is_empty() {
            return Err(GatewayError::Ctrl("empty UDP_FD payload".to_string()));
        }
        Ok(Self {
            hello: payload[0] != 0,
            data: payload[1..].to_vec(),
        })
    }
}

/// Session establishment request from a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSetupMsg {
    /// Opaque auth cookie, forwarded to sec-mod.
    pub cookie: Vec<u8>,
    /// Routes the client requested.
    pub routes: Vec<String>,
    /// Tunnel address the worker wants leased.
    pub lease_ip: Option<std::net::IpAddr>,
}

impl SessionSetupMsg {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&(self.cookie.len() as u16).to_be_bytes());
        out.extend_from_slice(&self.cookie);
        out.extend_from_slice(&(self.routes.len() as u16).to_be_bytes());
        for route in &self.routes {
            out.extend_from_slice(&(route.len() as u16).to_be_bytes());
            out.extend_from_slice(route.as_bytes());
        }
        match &self.lease_ip {
            Some(ip) => {
                let text = ip.to_string();
                out.push(1);
                out.extend_from_slice(&(text.len() as u16).to_be_bytes());
                out.extend_from_slice(text.as_bytes());
            }
            None => out.push(0),
        }
        out
    }

    pub fn parse(payload: &[u8]) -> Result<Self, GatewayError> {
        let mut pos = 0usize;
        let take = |pos: &mut usize, n: usize| -> Result<&[u8], GatewayError> {
            let end = pos
                .checked_add(n)
                .filter(|&e| e <= payload.len())
                .ok_or_else(|| GatewayError::Ctrl("truncated session-setup".to_string()))?;
            let out = &payload[*pos..end];
            *pos = end;
            Ok(out)
        };

        let cookie_len = u16::from_be_bytes(take(&mut pos, 2)?.try_into().unwrap()) as usize;
        let cookie = take(&mut pos, cookie_len)?.to_vec();
        let n_routes = u16::from_be_bytes(take(&mut pos, 2)?.try_into().unwrap()) as usize;
        let mut routes = Vec::with_capacity(n_routes.min(64));
        for _ in 0..n_routes {
            let len = u16::from_be_bytes(take(&mut pos, 2)?.try_into().unwrap()) as usize;
            let raw = take(&mut pos, len)?;
            let route = std::str::from_utf8(raw)
                .map_err(|_| GatewayError::Ctrl("non-utf8 route in session-setup".to_string()))?;
            routes.push(route.to_string());
        }
        let lease_ip = match take(&mut pos, 1)?[0] {
            0 => None,
            _ => {
                let len = u16::from_be_bytes(take(&mut pos, 2)?.try_into().unwrap()) as usize;
                let raw = take(&mut pos, len)?;
                let text = std::str::from_utf8(raw)
                    .map_err(|_| GatewayError::Ctrl("non-utf8 lease in session-setup".to_string()))?;
                Some(text.parse().map_err(|_| {
                    GatewayError::Ctrl("bad lease address in session-setup".to_string())
                })?)
            }
        };
        Ok(Self {
            cookie,
            routes,
            lease_ip,
        })
    }
}

/// Transfer statistics from a worker: `bytes_in(8) || bytes_out(8)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsMsg {
    pub bytes_in: u64,
    pub bytes_out: u64,
}

impl StatsMsg {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(16);
        out.extend_from_slice(&self.bytes_in.to_be_bytes());
        out.extend_from_slice(&self.bytes_out.to_be_bytes());
        out
    }

    pub fn parse(payload: &[u8]) -> Result<Self, GatewayError> {
        if payload.len() != 16 {
            return Err(GatewayError::Ctrl("bad stats payload".to_string()));
        }
        Ok(Self {
            bytes_in: u64::from_be_bytes(payload[..8].try_into().unwrap()),
            bytes_out: u64::from_be_bytes(payload[8..].try_into().unwrap()),
        })
    }
}

/// A request arriving from a worker on its control channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerRequest {
    SessionSetup(SessionSetupMsg),
    SessionTeardown,
    Stats(StatsMsg),
}

impl WorkerRequest {
    pub fn parse(frame: &Frame) -> Result<Self, GatewayError> {
        match frame.cmd {
            cmd::SESSION_SETUP => Ok(Self::SessionSetup(SessionSetupMsg::parse(&frame.payload)?)),
            cmd::SESSION_TEARDOWN => Ok(Self::SessionTeardown),
            cmd::STATS => Ok(Self::Stats(StatsMsg::parse(&frame.payload)?)),
            other => Err(GatewayError::Ctrl(format!(
                "unknown worker command {}",
                other
            ))),
        }
    }
}

/// What a channel read produced.
#[derive(Debug)]
pub enum ChannelEvent {
    Frames(Vec<Frame>),
    Closed,
}

/// One endpoint of a framed control channel.
pub struct CtrlChannel {
    io: AsyncFd<OwnedFd>,
    decoder: FrameDecoder,
}

impl CtrlChannel {
    /// Create a stream socketpair; the first endpoint becomes the main
    /// side of the channel, the second is handed to the child.
    pub fn pair() -> io::Result<(Self, OwnedFd)> {
        let mut fds = [0 as RawFd; 2];
        // SAFETY: socketpair fills fds on success; both descriptors are
        // owned exclusively from here on.
        let ret = unsafe {
            libc::socketpair(
                libc::AF_UNIX,
                libc::SOCK_STREAM | libc::SOCK_CLOEXEC,
                0,
                fds.as_mut_ptr(),
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: fresh descriptors from socketpair, not owned elsewhere.
        let (main_fd, child_fd) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
        Ok((Self::from_fd(main_fd)?, child_fd))
    }

    pub fn from_fd(fd: OwnedFd) -> io::Result<Self> {
        sockopt::set_nonblock(fd.as_raw_fd())?;
        sockopt::set_cloexec(fd.as_raw_fd())?;
        Ok(Self {
            io: AsyncFd::new(fd)?,
            decoder: FrameDecoder::default(),
        })
    }

    pub fn raw_fd(&self) -> RawFd {
        self.io.get_ref().as_raw_fd()
    }

    /// Wait until the channel has data (or EOF) pending.
    pub async fn wait_readable(&self) {
        let _ = self.io.readable().await;
    }

    /// Read whatever is pending and decode complete frames. Returns
    /// `Closed` once the peer has shut its end down.
    pub async fn recv(&mut self) -> Result<ChannelEvent, GatewayError> {
        loop {
            let mut guard = self
                .io
                .readable()
                .await
                .map_err(GatewayError::Io)?;

            let mut chunk = [0u8; 4096];
            match guard.try_io(|inner| {
                // SAFETY: plain nonblocking read into a stack buffer.
                let n = unsafe {
                    libc::read(
                        inner.get_ref().as_raw_fd(),
                        chunk.as_mut_ptr() as *mut libc::c_void,
                        chunk.len(),
                    )
                };
                if n < 0 {
                    Err(io::Error::last_os_error())
                } else {
                    Ok(n as usize)
                }
            }) {
                Ok(Ok(0)) => return Ok(ChannelEvent::Closed),
                Ok(Ok(n)) => {
                    self.decoder.push(&chunk[..n]);
                    let mut frames = Vec::new();
                    while let Some(frame) = self.decoder.next()? {
                        frames.push(frame);
                    }
                    if !frames.is_empty() {
                        return Ok(ChannelEvent::Frames(frames));
                    }
                    // partial frame; wait for the rest
                }
                Ok(Err(e)) => return Err(GatewayError::Io(e)),
                Err(_would_block) => continue,
            }
        }
    }

    /// Send one frame, attaching `fd` as ancillary data when present.
    ///
    /// The attached descriptor rides on the first `sendmsg`; any remainder
    /// of the frame is flushed with plain writes.
    pub fn send(&self, cmd: u8, payload: &[u8], fd: Option<RawFd>) -> io::Result<()> {
        let frame = Frame {
            cmd,
            payload: payload.to_vec(),
        }
        .encode();

        let mut written = sockopt::send_with_fd(self.raw_fd(), &[frame.as_slice()], fd)?;
        while written < frame.len() {
            // SAFETY: writing the unsent tail of a stack-owned buffer.
            let n = unsafe {
                libc::write(
                    self.raw_fd(),
                    frame[written..].as_ptr() as *const libc::c_void,
                    frame.len() - written,
                )
            };
            if n <= 0 {
                return Err(io::Error::last_os_error());
            }
            written += n as usize;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_roundtrip() {
        let frame = Frame {
            cmd: cmd::SESSION_TEARDOWN,
            payload: b"hello".to_vec(),
        };
        let mut decoder = FrameDecoder::default();
        decoder.push(&frame.encode());
        assert_eq!(decoder.next().unwrap(), Some(frame));
        assert_eq!(decoder.next().unwrap(), None);
    }

    #[test]
    fn test_decoder_handles_partial_and_coalesced_frames() {
        let a = Frame {
            cmd: cmd::STATS,
            payload: StatsMsg {
                bytes_in: 1,
                bytes_out: 2,
            }
            .encode(),
        };
        let b = Frame {
            cmd: cmd::SESSION_TEARDOWN,
            payload: Vec::new(),
        };

        let mut wire = a.encode();
        wire.extend_from_slice(&b.encode());

        let mut decoder = FrameDecoder::default();
        decoder.push(&wire[..3]);
        assert_eq!(decoder.next().unwrap(), None);
        decoder.push(&wire[3..]);
        assert_eq!(decoder.next().unwrap(), Some(a));
        assert_eq!(decoder.next().unwrap(), Some(b));
        assert_eq!(decoder.next().unwrap(), None);
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let mut decoder = FrameDecoder::default();
        decoder.push(&(u32::MAX).to_be_bytes());
        decoder.push(&[0u8; 16]);
        assert!(decoder.next().is_err());
    }

    #[test]
    fn test_udp_fd_msg_roundtrip() {
        let msg = UdpFdMsg {
            hello: true,
            data: vec![0x16, 0xfe, 0xfd, 0x00],
        };
        let parsed = UdpFdMsg::parse(&msg.encode()).unwrap();
        assert_eq!(parsed, msg);
        assert!(UdpFdMsg::parse(&[]).is_err());
    }

    #[test]
    fn test_session_setup_roundtrip() {
        let msg = SessionSetupMsg {
            cookie: vec![9; 16],
            routes: vec!["10.0.0.0/8".to_string(), "192.168.1.0/24".to_string()],
            lease_ip: Some("192.0.2.17".parse().unwrap()),
        };
        let parsed = SessionSetupMsg::parse(&msg.encode()).unwrap();
        assert_eq!(parsed, msg);

        let no_lease = SessionSetupMsg {
            cookie: vec![1, 2, 3],
            routes: Vec::new(),
            lease_ip: None,
        };
        assert_eq!(SessionSetupMsg::parse(&no_lease.encode()).unwrap(), no_lease);
    }

    #[test]
    fn test_session_setup_truncated() {
        let msg = SessionSetupMsg {
            cookie: vec![9; 16],
            routes: vec!["10.0.0.0/8".to_string()],
            lease_ip: None,
        };
        let wire = msg.encode();
        assert!(SessionSetupMsg::parse(&wire[..wire.len() - 1]).is_err());
    }

    #[tokio::test]
    async fn test_channel_send_recv_with_fd() {
        let (main_side, child_fd) = CtrlChannel::pair().unwrap();

        // a pipe whose read end travels over the channel
        let mut pipe = [0 as RawFd; 2];
        // SAFETY: pipe2 fills the array on success.
        assert_eq!(unsafe { libc::pipe2(pipe.as_mut_ptr(), libc::O_CLOEXEC) }, 0);

        let msg = UdpFdMsg {
            hello: true,
            data: vec![0x16, 0xfe, 0xfd],
        };
        main_side
            .send(cmd::UDP_FD, &msg.encode(), Some(pipe[0]))
            .unwrap();
        // SAFETY: we still own pipe[0] here; the kernel duplicated it into
        // the message.
        unsafe { libc::close(pipe[0]) };

        let mut buf = [0u8; 256];
        let (n, passed) = sockopt::recv_with_fd(child_fd.as_raw_fd(), &mut buf).unwrap();
        let passed = passed.expect("expected a descriptor");

        let mut decoder = FrameDecoder::default();
        decoder.push(&buf[..n]);
        let frame = decoder.next().unwrap().unwrap();
        assert_eq!(frame.cmd, cmd::UDP_FD);
        assert_eq!(UdpFdMsg::parse(&frame.payload).unwrap(), msg);

        // prove the passed descriptor is the pipe's read end
        // SAFETY: write/read on descriptors owned by this test.
        unsafe {
            assert_eq!(libc::write(pipe[1], b"ok".as_ptr() as *const _, 2), 2);
            let mut out = [0u8; 2];
            assert_eq!(libc::read(passed, out.as_mut_ptr() as *mut _, 2), 2);
            assert_eq!(&out, b"ok");
            libc::close(passed);
            libc::close(pipe[1]);
        }
    }
}
