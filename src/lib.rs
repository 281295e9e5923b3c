//! Darvazeh: Privilege-Separated VPN Gateway
//!
//! Darvazeh is the supervisor process of a privilege-separated VPN
//! gateway. It owns every listening socket, accepts clients over TCP and
//! UNIX transports, forks one unprivileged worker per client, and routes
//! UDP datagrams to the worker owning each DTLS session - including the
//! session-affinity logic that keeps clients connected across NAT
//! rebinding. Authentication and key material live in a separate
//! security-module process; TLS/DTLS termination lives in the workers.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐  TCP/UNIX accept   ┌────────────┐
//! │ Clients  │───────────────────▶│ supervisor │──fork──▶ worker (per client)
//! │          │  UDP datagrams     │ (this      │              │
//! │          │───────────────────▶│  crate)    │◀─ctrl chan──┘
//! └──────────┘                    └─────┬──────┘
//!                                       │ ctrl chan
//!                                  ┌────▼──────┐
//!                                  │  sec-mod  │  keys, auth state
//!                                  └───────────┘
//! ```
//!
//! The supervisor is strictly single-threaded: one event loop multiplexes
//! listeners, worker control channels, the sec-mod channel, signals and a
//! maintenance timer. State is never shared across threads and never
//! locked.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use darvazeh::{GatewayConfig, Supervisor};
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<(), darvazeh::GatewayError> {
//!     let config = GatewayConfig::default();
//!     let mut supervisor = Supervisor::new(config, None).await?;
//!     supervisor.run().await
//! }
//! ```

pub mod ban;
pub mod config;
pub mod ctrl;
pub mod dispatch;
pub mod lease;
pub mod listener;
pub mod registry;
pub mod secmod;
pub mod sniffer;
pub mod sockopt;
pub mod spawner;
pub mod supervisor;

// Re-export core types
pub use ban::BanDb;
pub use config::{GatewayConfig, LimitsConfig, ListenConfig, PrivilegeConfig, ProcessConfig};
pub use ctrl::{CtrlChannel, Frame, FrameDecoder, SessionSetupMsg, StatsMsg, UdpFdMsg, WorkerRequest};
pub use dispatch::{DispatchOutcome, UDP_FD_RESEND_TIME};
pub use lease::IpLeaseTable;
pub use listener::{Listener, ListenerSet, SockKind};
pub use registry::{Proc, ProcTable, RemoveMode, SESSION_ID_LEN};
pub use sniffer::extract_session_id;
pub use supervisor::Supervisor;

/// Gateway error types
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// No usable listening socket could be created
    #[error("listen error: {0}")]
    Listen(String),

    /// Invalid configuration
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Control channel protocol violation
    #[error("control channel error: {0}")]
    Ctrl(String),

    /// Process registry inconsistency
    #[error("registry error: {0}")]
    Registry(String),

    /// Child process creation failure
    #[error("spawn error: {0}")]
    Spawn(String),

    /// I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let e = GatewayError::Listen("no ports".to_string());
        assert_eq!(e.to_string(), "listen error: no ports");

        let io: GatewayError = std::io::Error::new(std::io::ErrorKind::Other, "boom").into();
        assert!(io.to_string().contains("boom"));
    }
}
