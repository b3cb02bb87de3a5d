/// Hook into the connection layer. The engine never opens or closes sockets
/// itself; it asks the transport to drop peers it has evicted.
pub trait PeerTransport: Send + Sync {
    fn disconnect(&self, peer_id: &str, reason: &str);
}

/// Transport that ignores teardown requests; used when the engine runs stand-alone.
#[derive(Debug, Default, Clone, Copy)]
pub struct DetachedTransport;

impl PeerTransport for DetachedTransport {
    fn disconnect(&self, peer_id: &str, reason: &str) {
        tracing::debug!(peer = %peer_id, %reason, "no transport attached, eviction is logical only");
    }
}
