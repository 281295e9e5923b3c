//! Worker spawner
//!
//! Accepts a stream connection, applies the admission policy, and forks a
//! privilege-separated worker for it. The child inherits exactly two
//! descriptors - the accepted connection and its end of the control
//! socketpair - mapped to fixed numbers; everything else the supervisor
//! owns is close-on-exec and vanishes at `execv`. Privileges are dropped
//! before the worker image runs.

use std::ffi::CString;
use std::io;
use std::mem;
use std::net::SocketAddr;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::path::Path;

use log::{debug, error, info};
use rand::RngCore;

use crate::ban::BanDb;
use crate::config::GatewayConfig;
use crate::ctrl::CtrlChannel;
use crate::listener::{Listener, SockKind};
use crate::registry::{Pid, Proc, ProcTable, SESSION_ID_LEN};
use crate::sockopt;
use crate::GatewayError;

/// Descriptor numbers the worker finds its sockets on.
pub const WORKER_CONN_FD: RawFd = 3;
pub const WORKER_CTRL_FD: RawFd = 4;

/// What a stream readable event produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcceptOutcome {
    /// A worker now serves the connection.
    Spawned(Pid),
    /// The connection was refused (ceiling, ban, transient failure).
    Refused,
    /// The readiness event was stale; nothing was accepted.
    NotReady,
}

/// Generate the per-client session token.
pub fn new_sid() -> [u8; SESSION_ID_LEN] {
    let mut sid = [0u8; SESSION_ID_LEN];
    rand::thread_rng().fill_bytes(&mut sid);
    sid
}

/// Raise RLIMIT_NOFILE for the supervisor and return the previous limit,
/// which workers are put back to.
pub fn raise_fd_limit(max_clients: u32) -> io::Result<libc::rlimit> {
    // SAFETY: get/setrlimit with stack-owned structs.
    unsafe {
        let mut def: libc::rlimit = mem::zeroed();
        if libc::getrlimit(libc::RLIMIT_NOFILE, &mut def) < 0 {
            return Err(io::Error::last_os_error());
        }

        let want = if max_clients > 0 {
            (max_clients as u64 + 32).max(def.rlim_cur)
        } else {
            (4 * 1024).max(def.rlim_cur)
        };

        if want > def.rlim_cur {
            let new = libc::rlimit {
                rlim_cur: want.min(def.rlim_max),
                rlim_max: def.rlim_max,
            };
            if libc::setrlimit(libc::RLIMIT_NOFILE, &new) < 0 {
                info!(
                    "could not raise file limit to {}: {}",
                    want,
                    io::Error::last_os_error()
                );
            }
        }
        Ok(def)
    }
}

/// Everything the post-fork child needs, prepared while allocation is
/// still allowed. After `fork` only raw pointers into this data are
/// touched; the child never allocates.
struct ChildPlan {
    argv: Vec<CString>,
    envp: Vec<CString>,
    chroot_dir: Option<CString>,
    uid: Option<libc::uid_t>,
    gid: Option<libc::gid_t>,
    nofile: libc::rlimit,
}

fn nul_terminated(strings: &[CString]) -> Vec<*const libc::c_char> {
    strings
        .iter()
        .map(|s| s.as_ptr())
        .chain(std::iter::once(std::ptr::null()))
        .collect()
}

impl ChildPlan {
    fn new(
        config: &GatewayConfig,
        sid: &[u8; SESSION_ID_LEN],
        remote: Option<SocketAddr>,
        kind: SockKind,
        nofile: libc::rlimit,
    ) -> Result<Self, GatewayError> {
        let cstr = |s: &str| {
            CString::new(s.as_bytes())
                .map_err(|_| GatewayError::Spawn("nul byte in worker environment".to_string()))
        };
        let path_cstr = |p: &Path| {
            CString::new(p.as_os_str().as_bytes())
                .map_err(|_| GatewayError::Spawn("nul byte in configured path".to_string()))
        };

        let argv = vec![path_cstr(&config.process.worker_bin)?];

        let kind_str = match kind {
            SockKind::Tcp => "tcp",
            SockKind::Unix => "unix",
            SockKind::Udp => "udp",
        };
        let mut envp = vec![
            cstr(&format!(
                "DARVAZEH_SECMOD_SOCKET={}",
                config.worker_secmod_path().display()
            ))?,
            cstr(&format!("DARVAZEH_SESSION_ID={}", hex::encode(sid)))?,
            cstr(&format!("DARVAZEH_CONN_TYPE={}", kind_str))?,
        ];
        if let Some(addr) = remote {
            envp.push(cstr(&format!("DARVAZEH_REMOTE_ADDR={}", addr))?);
        }
        if config.listen.proxy_proto {
            envp.push(cstr("DARVAZEH_PROXY_PROTO=1")?);
        }

        Ok(Self {
            argv,
            envp,
            chroot_dir: match &config.privileges.chroot_dir {
                Some(dir) => Some(path_cstr(dir)?),
                None => None,
            },
            uid: config.privileges.uid.map(|u| u as libc::uid_t),
            gid: config.privileges.gid.map(|g| g as libc::gid_t),
            nofile,
        })
    }
}

/// Handle one readable event on a stream listener.
pub async fn accept_and_spawn(
    listener: &Listener,
    table: &mut ProcTable,
    ban: &BanDb,
    config: &GatewayConfig,
    active_clients: u32,
    default_nofile: libc::rlimit,
) -> Result<AcceptOutcome, GatewayError> {
    let mut guard = listener.io.readable().await.map_err(GatewayError::Io)?;
    let accepted = match guard.try_io(|inner| accept_conn(inner.get_ref().as_raw_fd())) {
        Ok(Ok(pair)) => pair,
        Ok(Err(e)) => {
            error!("error in accept(): {}", e);
            return Ok(AcceptOutcome::Refused);
        }
        Err(_would_block) => return Ok(AcceptOutcome::NotReady),
    };
    drop(guard);

    let (conn, remote) = accepted;

    if config.limits.max_clients > 0 && active_clients >= config.limits.max_clients {
        info!(
            "reached maximum client limit (active: {})",
            active_clients
        );
        return Ok(AcceptOutcome::Refused);
    }

    // for trusted transports the authoritative peer address is learned by
    // the worker, so neither the ban check nor getsockname apply
    let mut our_addr = None;
    if listener.kind != SockKind::Unix && !config.listen.proxy_proto {
        our_addr = sockopt::local_addr(conn.as_raw_fd()).ok().flatten();

        if let Some(peer) = remote {
            if ban.is_banned(&peer.ip()) {
                info!("dropping connection from banned address {}", peer.ip());
                return Ok(AcceptOutcome::Refused);
            }
        }
    }

    let (ctrl, child_ctrl) = CtrlChannel::pair().map_err(GatewayError::Io)?;
    let sid = new_sid();
    let plan = ChildPlan::new(config, &sid, remote, listener.kind, default_nofile)?;
    let argv_ptrs = nul_terminated(&plan.argv);
    let envp_ptrs = nul_terminated(&plan.envp);

    // SAFETY: the child branch only performs async-signal-safe operations
    // (signal mask, prctl, dup2, privilege syscalls, execve) on data
    // prepared before the fork.
    let pid = unsafe { libc::fork() };
    match pid {
        0 => {
            // child: never returns
            // SAFETY: see above; this process image is replaced or exits.
            unsafe {
                child_exec(
                    &plan,
                    &argv_ptrs,
                    &envp_ptrs,
                    conn.as_raw_fd(),
                    child_ctrl.as_raw_fd(),
                )
            }
        }
        -1 => {
            error!("fork failed: {}", io::Error::last_os_error());
            Ok(AcceptOutcome::Refused)
        }
        pid => {
            drop(child_ctrl);
            drop(conn);

            let proc = Proc::new(pid, ctrl, sid, remote, our_addr, listener.kind);
            if let Err(e) = table.insert(proc) {
                error!("could not register worker {}: {}", pid, e);
                // SAFETY: signalling the child we just forked.
                unsafe { libc::kill(pid, libc::SIGTERM) };
                return Ok(AcceptOutcome::Refused);
            }
            debug!(
                "spawned worker {} for {}",
                pid,
                remote.map(|a| a.to_string()).unwrap_or_else(|| "unix peer".to_string())
            );
            Ok(AcceptOutcome::Spawned(pid))
        }
    }
}

fn accept_conn(fd: RawFd) -> io::Result<(OwnedFd, Option<SocketAddr>)> {
    // SAFETY: accept4 fills the sockaddr storage up to the advertised
    // length; the descriptor is owned immediately.
    unsafe {
        let mut storage: libc::sockaddr_storage = mem::zeroed();
        let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        let conn = libc::accept4(
            fd,
            &mut storage as *mut _ as *mut libc::sockaddr,
            &mut len,
            libc::SOCK_CLOEXEC,
        );
        if conn < 0 {
            return Err(io::Error::last_os_error());
        }
        let owned = OwnedFd::from_raw_fd(conn);
        // the listener is non-blocking; the worker wants plain blocking I/O
        sockopt::set_block(conn)?;
        Ok((owned, sockopt::from_sockaddr(&storage)))
    }
}

/// Post-fork half of the spawn. Only async-signal-safe calls; on any
/// failure the child exits with status 1 and the supervisor observes it
/// through the reaper.
///
/// # Safety
///
/// Must only be called in a freshly forked child. `plan` and the pointer
/// arrays must outlive the call (they do; the parent's stack is ours
/// until `execve`).
unsafe fn child_exec(
    plan: &ChildPlan,
    argv_ptrs: &[*const libc::c_char],
    envp_ptrs: &[*const libc::c_char],
    conn_fd: RawFd,
    ctrl_fd: RawFd,
) -> ! {
    // default signal dispositions and an unblocked mask
    let mut set: libc::sigset_t = mem::zeroed();
    libc::sigemptyset(&mut set);
    libc::sigprocmask(libc::SIG_SETMASK, &set, std::ptr::null_mut());

    // die with the supervisor
    libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM as libc::c_ulong, 0, 0, 0);

    // move the allow-listed descriptors to their fixed numbers; the
    // temporaries stay close-on-exec, everything else already is
    let conn_tmp = libc::fcntl(conn_fd, libc::F_DUPFD_CLOEXEC, 16);
    let ctrl_tmp = libc::fcntl(ctrl_fd, libc::F_DUPFD_CLOEXEC, 16);
    if conn_tmp < 0
        || ctrl_tmp < 0
        || libc::dup2(conn_tmp, WORKER_CONN_FD) < 0
        || libc::dup2(ctrl_tmp, WORKER_CTRL_FD) < 0
    {
        libc::_exit(1);
    }

    // privilege drop: chroot, groups, uid, and no further processes
    if let Some(dir) = &plan.chroot_dir {
        if libc::chdir(dir.as_ptr()) != 0 || libc::chroot(dir.as_ptr()) != 0 {
            libc::_exit(1);
        }
    }
    if let Some(gid) = plan.gid {
        if libc::setgid(gid) != 0 || libc::setgroups(1, &gid) != 0 {
            libc::_exit(1);
        }
    }
    if let Some(uid) = plan.uid {
        if libc::setuid(uid) != 0 {
            libc::_exit(1);
        }
    }

    // workers run with the limits the supervisor started with
    libc::setrlimit(libc::RLIMIT_NOFILE, &plan.nofile);
    let nproc = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    libc::setrlimit(libc::RLIMIT_NPROC, &nproc);

    libc::execve(plan.argv[0].as_ptr(), argv_ptrs.as_ptr(), envp_ptrs.as_ptr());
    libc::_exit(1)
}

/// Fork+exec a connect/disconnect hook script with the given environment.
/// The caller tracks the returned pid and routes its exit status.
pub fn spawn_script(script: &Path, env: &[(String, String)]) -> Result<Pid, GatewayError> {
    let path = CString::new(script.as_os_str().as_bytes())
        .map_err(|_| GatewayError::Spawn("nul byte in script path".to_string()))?;
    let envp_owned: Vec<CString> = env
        .iter()
        .map(|(k, v)| CString::new(format!("{}={}", k, v)))
        .collect::<Result<_, _>>()
        .map_err(|_| GatewayError::Spawn("nul byte in script environment".to_string()))?;

    let argv = [path.as_ptr(), std::ptr::null()];
    let envp = nul_terminated(&envp_owned);

    // SAFETY: the child branch only calls execve/_exit on pre-built data.
    let pid = unsafe { libc::fork() };
    match pid {
        0 => {
            // SAFETY: freshly forked child; pointers outlive the call.
            unsafe {
                libc::execve(path.as_ptr(), argv.as_ptr(), envp.as_ptr());
                libc::_exit(1)
            }
        }
        -1 => Err(GatewayError::Spawn(format!(
            "fork for script failed: {}",
            io::Error::last_os_error()
        ))),
        pid => Ok(pid),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_sid_is_unique_and_sized() {
        let a = new_sid();
        let b = new_sid();
        assert_eq!(a.len(), SESSION_ID_LEN);
        assert_ne!(a, b);
    }

    #[test]
    fn test_child_plan_environment() {
        let config = GatewayConfig::default();
        let sid = [7u8; SESSION_ID_LEN];
        let plan = ChildPlan::new(
            &config,
            &sid,
            Some("203.0.113.7:40000".parse().unwrap()),
            SockKind::Tcp,
            libc::rlimit {
                rlim_cur: 1024,
                rlim_max: 4096,
            },
        )
        .unwrap();

        let env: Vec<String> = plan
            .envp
            .iter()
            .map(|c| c.to_str().unwrap().to_string())
            .collect();
        assert!(env.iter().any(|e| e.starts_with("DARVAZEH_SECMOD_SOCKET=")));
        assert!(env.contains(&format!("DARVAZEH_SESSION_ID={}", hex::encode(sid))));
        assert!(env.contains(&"DARVAZEH_CONN_TYPE=tcp".to_string()));
        assert!(env.contains(&"DARVAZEH_REMOTE_ADDR=203.0.113.7:40000".to_string()));
    }

    #[test]
    fn test_child_plan_chroot_relative_secmod() {
        let mut config = GatewayConfig::default();
        config.privileges.chroot_dir = Some("/var/lib/darvazeh".into());
        let plan = ChildPlan::new(
            &config,
            &new_sid(),
            None,
            SockKind::Unix,
            libc::rlimit {
                rlim_cur: 1024,
                rlim_max: 4096,
            },
        )
        .unwrap();

        let env: Vec<String> = plan
            .envp
            .iter()
            .map(|c| c.to_str().unwrap().to_string())
            .collect();
        assert!(env.contains(&"DARVAZEH_SECMOD_SOCKET=var/run/darvazeh-secmod.sock".to_string()));
        assert!(plan.chroot_dir.is_some());
    }
}
