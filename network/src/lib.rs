//! Networking substrate for the Beaver triple generation protocols.
//!
//! The crate provides the party registry, a symmetric TCP mesh in which
//! every pair of parties shares exactly one full-duplex connection, the
//! big-endian wire framing used by the protocols, and the per-edge
//! send/receive tasks that bridge sockets and bounded channels.

use thiserror::Error;

pub mod framing;
pub mod io;
pub mod party;
pub mod tcp;

pub use party::{LocalParty, PartyId, RemoteParty};
pub use tcp::TcpNetwork;

/// Error type for network related failures. Every variant is fatal to the
/// protocol run; only connection dialing is retried internally.
#[derive(Debug, Error)]
pub enum NetworkError {
    /// Listening or dialing failed permanently.
    #[error("network setup failed: {0}")]
    Setup(String),
    /// A read or write on an established connection failed, including an
    /// EOF in the middle of a frame.
    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),
    /// A per-read deadline expired on a socket.
    #[error("read deadline exceeded")]
    ReadTimeout,
    /// A party identified itself with an ID that was not expected on this
    /// connection.
    #[error("unexpected party id {0} on incoming connection")]
    UnexpectedPeer(PartyId),
}
