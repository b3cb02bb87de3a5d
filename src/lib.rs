// Library interface for the peerguard engine
// Lets the node binary, tests and an embedding transport share one engine.

pub mod config;
pub mod error;
pub mod registry;
pub mod events;
pub mod firewall;
pub mod threat;
pub mod pool;
pub mod history;
pub mod congestion;
pub mod sampler;
pub mod transport;
pub mod status;
pub mod metrics;
pub mod guard;
pub mod scheduler;

pub use config::Config;
pub use error::GuardError;
pub use guard::{Admission, Guard, GuardHandle, HealthReport};
pub use registry::{PeerRecord, PeerRegistry};
pub use events::{AttackType, SecurityEvent, Severity};
pub use congestion::{PropagationPolicy, Priority};
pub use threat::{PeerFeatures, ThreatClassifier, ThreatReport};
pub use sampler::{ResourceSampler, ResourceUsage};
pub use transport::PeerTransport;
