pub mod api;
pub mod config;
pub mod daemon;
pub mod dreaming;
pub mod federation;
pub mod peer_keys;
pub mod persistence;
pub mod proximity;
pub mod security;
pub mod telemetry;
pub mod transport;

pub use federation::{EchoGenerator, FederationConfig, FederationHandle, FederationNode, Generator, RequestConsensusArgs};
pub use persistence::{PersistenceHandle, PersistenceLayer, Record, RecordKind, RecordQuery};
pub use proximity::{ProximityBackend, ProximityLayer, UdpProximityBackend};
pub use telemetry::{DropReason, Telemetry, TracingTelemetry};
pub use transport::{TransportError, TransportHandle, TransportLayer};
