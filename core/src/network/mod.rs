//! Gossip networking: transport seam, peer tracking, dissemination, and
//! convergence detection

pub mod convergence;
pub mod gossip;
pub mod peers;
pub mod transport;

pub use convergence::{ConvergenceDetector, ConvergenceStatus};
pub use gossip::{Disseminator, GossipMessage};
pub use peers::{PeerRecord, PeerStatus, PeerTable};
pub use transport::{InMemoryNetwork, InMemoryTransport, MessageHandler, Transport};
