//! Ban database
//!
//! Accept-time policy fed by the security module: addresses that
//! accumulate too many failures are refused before a worker is forked for
//! them. Entries age out on the maintenance timer.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

use log::{debug, info};

/// Score above which an address is refused.
pub const BAN_THRESHOLD: u32 = 100;

struct BanEntry {
    score: u32,
    last_seen: Instant,
}

/// In-memory ban database, owned by the supervisor.
pub struct BanDb {
    entries: HashMap<IpAddr, BanEntry>,
    reset_time: Duration,
}

impl BanDb {
    pub fn new(reset_time: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            reset_time,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Add `score` points against an address.
    pub fn report(&mut self, ip: IpAddr, score: u32) {
        let entry = self.entries.entry(ip).or_insert(BanEntry {
            score: 0,
            last_seen: Instant::now(),
        });
        entry.score = entry.score.saturating_add(score);
        entry.last_seen = Instant::now();
        if entry.score >= BAN_THRESHOLD {
            info!("address {} is banned (score {})", ip, entry.score);
        }
    }

    pub fn is_banned(&self, ip: &IpAddr) -> bool {
        self.entries
            .get(ip)
            .map(|e| e.score >= BAN_THRESHOLD)
            .unwrap_or(false)
    }

    /// Drop entries older than the reset time. Runs on the maintenance
    /// timer.
    pub fn cleanup(&mut self) {
        let reset = self.reset_time;
        let before = self.entries.len();
        self.entries.retain(|_, e| e.last_seen.elapsed() < reset);
        if before != self.entries.len() {
            debug!("ban db aged out {} entries", before - self.entries.len());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scores_accumulate_to_ban() {
        let mut db = BanDb::new(Duration::from_secs(300));
        let ip: IpAddr = "198.51.100.9".parse().unwrap();

        db.report(ip, BAN_THRESHOLD / 2);
        assert!(!db.is_banned(&ip));
        db.report(ip, BAN_THRESHOLD / 2);
        assert!(db.is_banned(&ip));
        assert!(!db.is_banned(&"203.0.113.7".parse().unwrap()));
    }

    #[test]
    fn test_cleanup_ages_entries_out() {
        let mut db = BanDb::new(Duration::ZERO);
        let ip: IpAddr = "198.51.100.9".parse().unwrap();
        db.report(ip, BAN_THRESHOLD);
        assert!(db.is_banned(&ip));

        db.cleanup();
        assert!(db.is_empty());
        assert!(!db.is_banned(&ip));
    }
}
