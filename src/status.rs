use std::fmt;

/// Human-readable summary of registry, threat and health state.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatusReport {
    pub peers_total: usize,
    pub peers_active: usize,
    pub trusted_peers: usize,
    pub blocked_peers: usize,
    pub blocked_ips: usize,
    /// Events from the last five minutes.
    pub recent_threats: usize,
    pub total_events: usize,
    pub preferred_outbound: usize,
    pub max_peers: usize,
    pub avg_latency_ms: f64,
    pub bandwidth_mbps: f64,
    pub history_len: usize,
    pub congested: bool,
}

impl fmt::Display for StatusReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rule = "=".repeat(60);
        writeln!(f, "{rule}")?;
        writeln!(f, "🛡️  PEER GUARD STATUS")?;
        writeln!(f, "{rule}")?;
        writeln!(f, "Peers (active/total):  {}/{} of {}", self.peers_active, self.peers_total, self.max_peers)?;
        writeln!(f, "Trusted Peers:         {}", self.trusted_peers)?;
        writeln!(f, "Blocked Peers:         {}", self.blocked_peers)?;
        writeln!(f, "Blocked IPs:           {}", self.blocked_ips)?;
        writeln!(f, "Recent Threats (5m):   {}", self.recent_threats)?;
        writeln!(f, "Total Events:          {}", self.total_events)?;
        writeln!(f, "Preferred Outbound:    {}", self.preferred_outbound)?;
        writeln!(f, "Average Latency:       {:.1} ms", self.avg_latency_ms)?;
        writeln!(f, "Bandwidth:             {:.2} Mbps", self.bandwidth_mbps)?;
        writeln!(f, "Snapshots Kept:        {}", self.history_len)?;
        writeln!(f, "Congestion:            {}", if self.congested { "🔴 DETECTED" } else { "✅ CLEAR" })?;
        write!(f, "{rule}")
    }
}
