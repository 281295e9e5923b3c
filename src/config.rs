//! Darvazeh configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

fn default_backlog() -> u32 {
    1024
}

fn default_maintenance_interval() -> Duration {
    Duration::from_secs(300)
}

fn default_ban_reset_time() -> Duration {
    Duration::from_secs(300)
}

fn default_worker_bin() -> PathBuf {
    PathBuf::from("/usr/sbin/darvazeh-worker")
}

fn default_secmod_bin() -> PathBuf {
    PathBuf::from("/usr/sbin/darvazeh-secmod")
}

fn default_secmod_socket() -> PathBuf {
    PathBuf::from("/var/run/darvazeh-secmod.sock")
}

fn default_pid_file() -> PathBuf {
    PathBuf::from("/var/run/darvazeh.pid")
}

fn default_true() -> bool {
    true
}

/// Main gateway configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Whether clients are expected to carry the ApplicationID extension
    /// in their DTLS ClientHello (new protocol). When disabled only the
    /// legacy SessionID field is consulted.
    #[serde(default = "default_true")]
    pub dtls_app_id: bool,

    /// Listening surface
    #[serde(default)]
    pub listen: ListenConfig,

    /// Credentials the workers and the UNIX socket run under
    #[serde(default)]
    pub privileges: PrivilegeConfig,

    /// Child process images and rendezvous paths
    #[serde(default)]
    pub process: ProcessConfig,

    /// Operational limits
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Connect/disconnect hook scripts
    #[serde(default)]
    pub scripts: ScriptConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            dtls_app_id: true,
            listen: ListenConfig::default(),
            privileges: PrivilegeConfig::default(),
            process: ProcessConfig::default(),
            limits: LimitsConfig::default(),
            scripts: ScriptConfig::default(),
        }
    }
}

/// Listening surface configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenConfig {
    /// Host to resolve and bind; wildcard when absent
    pub host: Option<String>,

    /// TCP port for the TLS handshake path
    pub tcp_port: Option<u16>,

    /// UDP port for the DTLS data path
    pub udp_port: Option<u16>,

    /// UNIX stream socket for trusted front-end integration. When set,
    /// the UDP dispatcher's IP-only fallback is disabled.
    pub unix_socket: Option<PathBuf>,

    /// Expect the PROXY protocol on accepted connections; the worker
    /// learns the authoritative peer address
    #[serde(default)]
    pub proxy_proto: bool,

    /// Enable path-MTU discovery on UDP sockets
    #[serde(default = "default_true")]
    pub try_mtu: bool,

    /// Stream listen backlog
    #[serde(default = "default_backlog")]
    pub backlog: u32,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            host: None,
            tcp_port: Some(443),
            udp_port: Some(443),
            unix_socket: None,
            proxy_proto: false,
            try_mtu: true,
            backlog: 1024,
        }
    }
}

/// Privilege-drop configuration for workers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrivilegeConfig {
    /// UID workers run as (and owner of the UNIX listen socket)
    pub uid: Option<u32>,

    /// GID workers run as
    pub gid: Option<u32>,

    /// Directory workers are chrooted into
    pub chroot_dir: Option<PathBuf>,
}

impl Default for PrivilegeConfig {
    fn default() -> Self {
        Self {
            uid: None,
            gid: None,
            chroot_dir: None,
        }
    }
}

/// Child process images and rendezvous paths
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessConfig {
    /// Worker binary, exec'd once per accepted client
    #[serde(default = "default_worker_bin")]
    pub worker_bin: PathBuf,

    /// Security module binary
    #[serde(default = "default_secmod_bin")]
    pub secmod_bin: PathBuf,

    /// UNIX socket the security module serves workers on
    #[serde(default = "default_secmod_socket")]
    pub secmod_socket: PathBuf,

    /// Management socket path (served by the control handler)
    pub occtl_socket: Option<PathBuf>,

    /// PID file written at startup, removed at exit
    #[serde(default = "default_pid_file")]
    pub pid_file: PathBuf,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            worker_bin: default_worker_bin(),
            secmod_bin: default_secmod_bin(),
            secmod_socket: default_secmod_socket(),
            occtl_socket: None,
            pid_file: default_pid_file(),
        }
    }
}

/// Operational limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum concurrently active clients; 0 means unlimited
    #[serde(default)]
    pub max_clients: u32,

    /// Pause after each accepted event, as a crude accept-rate limit
    #[serde(default, with = "humantime_serde")]
    pub rate_limit: Duration,

    /// How long a banned address stays banned
    #[serde(default = "default_ban_reset_time", with = "humantime_serde")]
    pub ban_reset_time: Duration,

    /// Period of the maintenance timer (ban age-out, stale config
    /// cleanup, CRL refresh)
    #[serde(default = "default_maintenance_interval", with = "humantime_serde")]
    pub maintenance_interval: Duration,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_clients: 0,
            rate_limit: Duration::ZERO,
            ban_reset_time: default_ban_reset_time(),
            maintenance_interval: default_maintenance_interval(),
        }
    }
}

/// Connect/disconnect hook scripts
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScriptConfig {
    /// Run when a worker establishes a session
    pub connect: Option<PathBuf>,

    /// Run when a worker tears its session down
    pub disconnect: Option<PathBuf>,
}

impl GatewayConfig {
    /// Load configuration from TOML file
    pub fn from_file(path: &std::path::Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Save configuration to TOML file
    pub fn to_file(&self, path: &std::path::Path) -> anyhow::Result<()> {
        let contents = toml::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.listen.tcp_port.is_none() && self.listen.unix_socket.is_none() {
            return Err("either listen.tcp_port or listen.unix_socket is required".to_string());
        }

        if self.listen.backlog == 0 {
            return Err("listen.backlog must be positive".to_string());
        }

        if self.process.worker_bin.as_os_str().is_empty() {
            return Err("process.worker_bin must not be empty".to_string());
        }

        if self.limits.maintenance_interval < Duration::from_secs(1) {
            return Err("limits.maintenance_interval must be at least 1s".to_string());
        }

        Ok(())
    }

    /// The sec-mod socket path workers should connect to. Inside a chroot
    /// the path is interpreted relative to the new root.
    pub fn worker_secmod_path(&self) -> PathBuf {
        if self.privileges.chroot_dir.is_some() {
            let p = self.process.secmod_socket.to_string_lossy();
            PathBuf::from(p.trim_start_matches('/'))
        } else {
            self.process.secmod_socket.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = GatewayConfig::default();
        assert_eq!(config.listen.tcp_port, Some(443));
        assert!(config.dtls_app_id);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_no_listen_surface_rejected() {
        let mut config = GatewayConfig::default();
        config.listen.tcp_port = None;
        config.listen.unix_socket = None;
        assert!(config.validate().is_err());

        config.listen.unix_socket = Some(PathBuf::from("/run/darvazeh.sock"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_toml_roundtrip() {
        let mut config = GatewayConfig::default();
        config.limits.max_clients = 16;
        config.limits.rate_limit = Duration::from_millis(100);

        let text = toml::to_string_pretty(&config).unwrap();
        let parsed: GatewayConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed.limits.max_clients, 16);
        assert_eq!(parsed.limits.rate_limit, Duration::from_millis(100));
        assert_eq!(parsed.listen.udp_port, config.listen.udp_port);
    }

    #[test]
    fn test_minimal_file() {
        let config: GatewayConfig = toml::from_str(
            r#"
            [listen]
            tcp_port = 8443
            udp_port = 8443
            "#,
        )
        .unwrap();
        assert_eq!(config.listen.tcp_port, Some(8443));
        assert_eq!(config.limits.max_clients, 0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_chroot_relative_secmod_path() {
        let mut config = GatewayConfig::default();
        assert_eq!(config.worker_secmod_path(), default_secmod_socket());

        config.privileges.chroot_dir = Some(PathBuf::from("/var/lib/darvazeh"));
        assert_eq!(
            config.worker_secmod_path(),
            PathBuf::from("var/run/darvazeh-secmod.sock")
        );
    }
}
