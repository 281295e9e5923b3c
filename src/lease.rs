//! IP lease table
//!
//! Minimal accounting of which worker holds which tunnel address. Lease
//! selection policy lives elsewhere; the supervisor only enforces that no
//! two live workers hold the same address and that leases die with their
//! worker.

use std::collections::HashMap;
use std::net::IpAddr;

use log::debug;

use crate::registry::Pid;
use crate::GatewayError;

/// Tunnel addresses currently leased to workers.
#[derive(Default)]
pub struct IpLeaseTable {
    leases: HashMap<IpAddr, Pid>,
}

impl IpLeaseTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.leases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.leases.is_empty()
    }

    pub fn holder(&self, ip: &IpAddr) -> Option<Pid> {
        self.leases.get(ip).copied()
    }

    /// Grant `ip` to `pid`. Re-acquiring an address a worker already
    /// holds is fine; an address held by another live worker is not.
    pub fn acquire(&mut self, ip: IpAddr, pid: Pid) -> Result<(), GatewayError> {
        match self.leases.get(&ip) {
            Some(&holder) if holder != pid => Err(GatewayError::Registry(format!(
                "lease {} already held by pid {}",
                ip, holder
            ))),
            _ => {
                self.leases.insert(ip, pid);
                debug!("leased {} to worker {}", ip, pid);
                Ok(())
            }
        }
    }

    /// Return every lease held by `pid`.
    pub fn release_for(&mut self, pid: Pid) {
        self.leases.retain(|_, holder| *holder != pid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_and_conflict() {
        let mut table = IpLeaseTable::new();
        let ip: IpAddr = "192.0.2.17".parse().unwrap();

        table.acquire(ip, 100).unwrap();
        assert_eq!(table.holder(&ip), Some(100));

        // idempotent for the same worker, refused for another
        table.acquire(ip, 100).unwrap();
        assert!(table.acquire(ip, 101).is_err());
    }

    #[test]
    fn test_release_for_clears_all_worker_leases() {
        let mut table = IpLeaseTable::new();
        table.acquire("192.0.2.17".parse().unwrap(), 100).unwrap();
        table.acquire("192.0.2.18".parse().unwrap(), 100).unwrap();
        table.acquire("192.0.2.19".parse().unwrap(), 101).unwrap();

        table.release_for(100);
        assert_eq!(table.len(), 1);
        assert_eq!(table.holder(&"192.0.2.19".parse().unwrap()), Some(101));
    }
}
