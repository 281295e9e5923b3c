//! Security module handle
//!
//! The sec-mod process holds private keys and authoritative auth state;
//! the supervisor only spawns it, watches its liveness, and exchanges
//! opaque framed messages with it. A sec-mod failure is fatal for the
//! whole gateway.

use std::ffi::CString;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::{AsRawFd, RawFd};

use log::info;

use crate::config::GatewayConfig;
use crate::ctrl::{cmd, CtrlChannel};
use crate::registry::{Pid, SESSION_ID_LEN};
use crate::GatewayError;

/// Descriptor number the sec-mod finds its control channel on.
pub const SECMOD_CTRL_FD: RawFd = 3;

/// A running security module child.
pub struct SecMod {
    pub pid: Pid,
    pub ctrl: CtrlChannel,
}

impl SecMod {
    /// Fork and exec the security module, leaving a control channel
    /// behind. The caller should give the child a moment to bring its
    /// worker-facing socket up before spawning workers.
    pub fn spawn(config: &GatewayConfig) -> Result<Self, GatewayError> {
        let bin = CString::new(config.process.secmod_bin.as_os_str().as_bytes())
            .map_err(|_| GatewayError::Spawn("nul byte in secmod path".to_string()))?;
        let socket_env = CString::new(format!(
            "DARVAZEH_SECMOD_SOCKET={}",
            config.process.secmod_socket.display()
        ))
        .map_err(|_| GatewayError::Spawn("nul byte in secmod socket path".to_string()))?;

        let (ctrl, child_fd) = CtrlChannel::pair().map_err(GatewayError::Io)?;

        // SAFETY: the child branch performs only dup2/execve/_exit on data
        // prepared before the fork.
        let pid = unsafe { libc::fork() };
        match pid {
            0 => {
                // SAFETY: freshly forked child; replaced by execve below.
                unsafe {
                    let tmp = libc::fcntl(child_fd.as_raw_fd(), libc::F_DUPFD_CLOEXEC, 16);
                    if tmp < 0 || libc::dup2(tmp, SECMOD_CTRL_FD) < 0 {
                        libc::_exit(1);
                    }
                    let argv = [bin.as_ptr(), std::ptr::null()];
                    let envp = [socket_env.as_ptr(), std::ptr::null()];
                    libc::execve(bin.as_ptr(), argv.as_ptr(), envp.as_ptr());
                    libc::_exit(1)
                }
            }
            -1 => Err(GatewayError::Spawn(format!(
                "fork for sec-mod failed: {}",
                io::Error::last_os_error()
            ))),
            pid => {
                drop(child_fd);
                info!("started sec-mod (pid {})", pid);
                Ok(Self { pid, ctrl })
            }
        }
    }

    /// Ask sec-mod to drop every piece of state held for a session.
    pub fn release_session(&self, sid: &[u8; SESSION_ID_LEN]) -> io::Result<()> {
        self.ctrl.send(cmd::SECMOD_RELEASE, sid, None)
    }

    /// Forward an opaque payload (e.g. a worker's auth cookie) to
    /// sec-mod under the given command byte.
    pub fn forward(&self, command: u8, payload: &[u8]) -> io::Result<()> {
        self.ctrl.send(command, payload, None)
    }

    pub fn signal(&self, sig: libc::c_int) {
        // SAFETY: signalling the child we spawned.
        unsafe {
            libc::kill(self.pid, sig);
        }
    }
}
