//! Identities and the address book shared by all parties.

use std::collections::BTreeMap;
use std::fmt;

use crate::NetworkError;

/// Type identifying a party in a protocol. IDs are `0..n_parties` and
/// totally ordered.
pub type PartyId = u64;

/// A party other than the local one, known by its ID and endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteParty {
    pub id: PartyId,
    pub addr: String,
}

impl RemoteParty {
    pub fn new(id: PartyId, addr: impl Into<String>) -> Self {
        Self {
            id,
            addr: addr.into(),
        }
    }
}

impl fmt::Display for RemoteParty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "party-{}", self.id)
    }
}

/// The local party: its own identity plus the full peer table. The table
/// contains an entry for the local ID as well, so that every party holds a
/// byte-identical view of the address book.
#[derive(Debug, Clone)]
pub struct LocalParty {
    pub id: PartyId,
    pub addr: String,
    /// Ordered so that all parties iterate peers in the same order.
    pub peers: BTreeMap<PartyId, RemoteParty>,
}

impl LocalParty {
    /// Builds the local party from the shared address book. Fails if the
    /// book has no entry for `id`.
    pub fn new(id: PartyId, peers: &BTreeMap<PartyId, String>) -> Result<Self, NetworkError> {
        let addr = peers
            .get(&id)
            .ok_or_else(|| NetworkError::Setup(format!("no address for party-{id}")))?
            .clone();
        let peers = peers
            .iter()
            .map(|(&pid, paddr)| (pid, RemoteParty::new(pid, paddr.clone())))
            .collect();
        Ok(Self { id, addr, peers })
    }

    /// Number of parties in the protocol, including the local one.
    pub fn n_parties(&self) -> usize {
        self.peers.len()
    }

    /// IDs of every party except the local one, in increasing order.
    pub fn remote_ids(&self) -> Vec<PartyId> {
        self.peers.keys().copied().filter(|&p| p != self.id).collect()
    }
}

impl fmt::Display for LocalParty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "party-{}", self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn address_book(n: u64) -> BTreeMap<PartyId, String> {
        (0..n).map(|i| (i, format!("party-{i}:50000"))).collect()
    }

    #[test]
    fn local_party_holds_its_own_entry() {
        let book = address_book(3);
        let lp = LocalParty::new(1, &book).unwrap();
        assert_eq!(lp.addr, "party-1:50000");
        assert_eq!(lp.peers[&lp.id].addr, lp.addr);
        assert_eq!(lp.n_parties(), 3);
        assert_eq!(lp.remote_ids(), vec![0, 2]);
        assert_eq!(lp.to_string(), "party-1");
    }

    #[test]
    fn unknown_id_is_rejected() {
        let book = address_book(2);
        assert!(LocalParty::new(5, &book).is_err());
    }
}
