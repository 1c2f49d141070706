//! Session-layer collaborators: peer directory, game session host and the
//! bundled session resolver

pub mod directory;
pub mod host;
pub mod resolver;

pub use directory::{InMemoryPeerDirectory, PeerDirectory};
pub use host::{HostedSession, LocalSessionHost, SessionHost};
pub use resolver::SessionResolver;
