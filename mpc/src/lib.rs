//! Distributed generation of Beaver multiplication triples.
//!
//! A fixed set of parties produces batches of triples (a, b, c) with
//! a·b ≡ c (mod q), additively secret-shared so that only the sum of all
//! parties' vectors reveals a triple in the clear. Two protocols coexist:
//! a pairwise one built on homomorphic encryption ([`he`]) and a
//! tree-structured multi-party one ([`mhe`]) that first needs a shared
//! relinearization key produced by [`rlk`].

use thiserror::Error;

use beavergen_network::{NetworkError, PartyId};

pub mod client;
pub mod he;
pub mod lattice;
pub mod math;
pub mod mhe;
pub mod params;
pub mod rlk;
pub mod tree;

/// One Beaver triple share. Summing the `a`, `b` and `c` components of all
/// parties modulo the plaintext modulus yields (A, B, C) with A·B ≡ C.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Triple {
    pub a: u64,
    pub b: u64,
    pub c: u64,
}

/// Error type shared by the triple generation protocols. Every variant is
/// fatal; errors propagate to the caller and abort the run.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Bad caller-supplied input (CLI arguments, empty peer set, zero
    /// branching factor, missing relinearization key at the root).
    #[error("invalid input: {0}")]
    InvalidInput(String),
    /// Failure in the network substrate.
    #[error(transparent)]
    Network(#[from] NetworkError),
    /// A ciphertext, polynomial or key share could not be unmarshalled.
    #[error("deserialization failed: {0}")]
    Deserialize(String),
    /// A homomorphic operation failed.
    #[error("lattice operation failed: {0}")]
    Lattice(#[from] fhe::Error),
    /// A polynomial ring operation failed.
    #[error("ring operation failed: {0}")]
    Math(#[from] fhe_math::Error),
    /// A peer sent a duplicate or otherwise impossible message.
    #[error("unexpected {kind} from party {from}")]
    UnexpectedMessage { from: PartyId, kind: &'static str },
    /// A peer sent a round tag the state machine cannot accept.
    #[error("unexpected round {round} from party {from}")]
    UnexpectedRound { from: PartyId, round: u64 },
    /// A message channel closed before the protocol completed, meaning a
    /// peer went away mid-run.
    #[error("message channel closed before the protocol completed")]
    ChannelClosed,
}
