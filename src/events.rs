//! Security event log.

use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, SystemTime};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AttackType {
    Sybil,
    Dos,
    Eclipse,
    SelfishMining,
    VdfManipulation,
    RateLimit,
    Unknown,
}

impl AttackType {
    pub fn as_str(self) -> &'static str {
        match self {
            AttackType::Sybil => "sybil",
            AttackType::Dos => "dos",
            AttackType::Eclipse => "eclipse",
            AttackType::SelfishMining => "selfish_mining",
            AttackType::VdfManipulation => "vdf_manipulation",
            AttackType::RateLimit => "rate_limit",
            AttackType::Unknown => "unknown",
        }
    }
}

impl fmt::Display for AttackType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ordered from harmless to banned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Severity {
    Safe,
    Caution,
    Warning,
    Critical,
    Blocked,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Severity::Safe => "safe",
            Severity::Caution => "caution",
            Severity::Warning => "warning",
            Severity::Critical => "critical",
            Severity::Blocked => "blocked",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Monitored,
    Penalized,
    Blocked,
    Investigated,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Action::Monitored => "MONITORED",
            Action::Penalized => "PENALIZED",
            Action::Blocked => "BLOCKED",
            Action::Investigated => "INVESTIGATED",
        })
    }
}

/// One detector finding. `subject` is a peer id, or an IP for IP-level events.
#[derive(Debug, Clone, PartialEq)]
pub struct SecurityEvent {
    pub timestamp: SystemTime,
    pub attack_type: AttackType,
    pub subject: String,
    pub severity: Severity,
    pub description: String,
    pub action_taken: Action,
}

impl fmt::Display for SecurityEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {} {}: {} ({})",
            self.severity, self.attack_type, self.subject, self.description, self.action_taken
        )
    }
}

/// Append-only log, trimmed by age.
#[derive(Debug, Default)]
pub struct EventLog {
    events: VecDeque<SecurityEvent>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, event: SecurityEvent) {
        self.events.push_back(event);
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &SecurityEvent> {
        self.events.iter()
    }

    /// Events newer than `window` at `now`.
    pub fn recent(&self, now: SystemTime, window: Duration) -> impl Iterator<Item = &SecurityEvent> {
        self.events.iter().filter(move |e| age(e, now) < window)
    }

    /// Drop events at least `retention` old. Returns how many were purged.
    pub fn purge_older_than(&mut self, now: SystemTime, retention: Duration) -> usize {
        let before = self.events.len();
        self.events.retain(|e| age(e, now) < retention);
        before - self.events.len()
    }
}

fn age(event: &SecurityEvent, now: SystemTime) -> Duration {
    now.duration_since(event.timestamp).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(at: SystemTime) -> SecurityEvent {
        SecurityEvent {
            timestamp: at,
            attack_type: AttackType::Eclipse,
            subject: "peer".into(),
            severity: Severity::Caution,
            description: "test".into(),
            action_taken: Action::Monitored,
        }
    }

    #[test]
    fn purge_respects_retention_horizon() {
        let now = SystemTime::UNIX_EPOCH + Duration::from_secs(100 * 86_400);
        let mut log = EventLog::new();
        log.push(event(now - Duration::from_secs(31 * 86_400)));
        log.push(event(now - Duration::from_secs(29 * 86_400)));
        log.push(event(now));
        assert_eq!(log.purge_older_than(now, Duration::from_secs(30 * 86_400)), 1);
        assert_eq!(log.len(), 2);
        assert_eq!(log.recent(now, Duration::from_secs(300)).count(), 1);
    }

    #[test]
    fn severities_are_ordered() {
        assert!(Severity::Critical > Severity::Warning);
        assert!(Severity::Caution > Severity::Safe);
        assert_eq!(AttackType::VdfManipulation.to_string(), "vdf_manipulation");
    }
}
