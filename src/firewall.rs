//! IP-level admission state: the sliding connection-attempt log and the
//! blocked-IP set. Both are keyed by IP, never by peer identity.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, SystemTime};

#[derive(Debug, Default)]
pub struct AttemptLog {
    attempts: HashMap<String, VecDeque<SystemTime>>,
}

impl AttemptLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, ip: &str, at: SystemTime) {
        self.attempts.entry(ip.to_string()).or_default().push_back(at);
    }

    pub fn count(&self, ip: &str) -> usize {
        self.attempts.get(ip).map_or(0, VecDeque::len)
    }

    pub fn forget(&mut self, ip: &str) {
        self.attempts.remove(ip);
    }

    pub fn tracked_ips(&self) -> usize {
        self.attempts.len()
    }

    /// Drop attempts older than `window` and return the surviving count per IP.
    /// IPs left with no attempts are forgotten.
    pub fn prune(&mut self, now: SystemTime, window: Duration) -> Vec<(String, usize)> {
        let mut counts = Vec::with_capacity(self.attempts.len());
        self.attempts.retain(|ip, stamps| {
            // Timestamps arrive in order, so the stale ones sit at the front.
            while stamps
                .front()
                .is_some_and(|ts| now.duration_since(*ts).unwrap_or_default() >= window)
            {
                stamps.pop_front();
            }
            if stamps.is_empty() {
                return false;
            }
            counts.push((ip.clone(), stamps.len()));
            true
        });
        counts.sort();
        counts
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct IpBan {
    pub reason: String,
    /// `None` is permanent.
    pub until: Option<SystemTime>,
}

impl IpBan {
    fn active_at(&self, now: SystemTime) -> bool {
        self.until.map_or(true, |until| until > now)
    }
}

#[derive(Debug, Default)]
pub struct BlockedIps {
    bans: HashMap<String, IpBan>,
}

impl BlockedIps {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn block(&mut self, ip: &str, reason: &str, until: Option<SystemTime>) {
        self.bans.insert(ip.to_string(), IpBan { reason: reason.to_string(), until });
    }

    pub fn unblock(&mut self, ip: &str) -> bool {
        self.bans.remove(ip).is_some()
    }

    pub fn is_blocked(&self, ip: &str, now: SystemTime) -> bool {
        self.bans.get(ip).is_some_and(|ban| ban.active_at(now))
    }

    pub fn get(&self, ip: &str) -> Option<&IpBan> {
        self.bans.get(ip)
    }

    pub fn len(&self) -> usize {
        self.bans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bans.is_empty()
    }

    /// Remove lapsed bans, returning the freed IPs.
    pub fn gc_expired(&mut self, now: SystemTime) -> Vec<String> {
        let expired: Vec<String> = self
            .bans
            .iter()
            .filter(|(_, ban)| !ban.active_at(now))
            .map(|(ip, _)| ip.clone())
            .collect();
        for ip in &expired {
            self.bans.remove(ip);
        }
        expired
    }
}
