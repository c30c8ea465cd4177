//! Collective relinearization key generation over the broadcast tree.
//!
//! All parties expand a common reference polynomial vector from a seed the
//! root distributes in round 0. Round-1 shares are aggregated bottom-up;
//! the root redistributes the aggregate top-down in round 2, from which
//! every party derives its round-2 share; those aggregate bottom-up in
//! round 3 and the root combines them into the relinearization key.
//!
//! Only the root ends up holding the key; the MHE triple protocol
//! multiplies at the root alone.

use std::sync::Arc;
use std::time::Duration;

use fhe::bfv::{BfvParameters, RelinearizationKey, SecretKey};
use fhe::mbfv::{
    round::{R1, R2},
    Aggregate, CommonRandomPoly, RelinKeyGenerator, RelinKeyShare,
};
use fhe_traits::Serialize;
use rand::{thread_rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tracing::debug;

use beavergen_network::framing::TreeMessage;
use beavergen_network::io::{spawn_tree_links, TreeChannels};
use beavergen_network::{LocalParty, PartyId, TcpNetwork};

use crate::tree::Tree;
use crate::ProtocolError;

/// Seed of the common reference polynomials, distributed by the root.
pub const DEFAULT_CRP_SEED: &[u8] = b"beavers";

/// Receive deadline on the key generation sockets; a peer that stays
/// silent longer is treated as gone.
pub const READ_DEADLINE: Duration = Duration::from_secs(20);

/// Driver for one relinearization key generation run.
pub struct RlkGenProtocol {
    local_id: PartyId,
    parent: Option<PartyId>,
    children: Vec<PartyId>,
    par: Arc<BfvParameters>,
    sk: SecretKey,
    seed: Vec<u8>,
    links: Option<TreeChannels>,
}

impl RlkGenProtocol {
    /// Creates a protocol instance with the shipped CRP seed.
    pub fn new(
        local: &LocalParty,
        par: Arc<BfvParameters>,
        sk: SecretKey,
        tree: &Tree,
    ) -> Result<Self, ProtocolError> {
        Self::with_seed(local, par, sk, tree, DEFAULT_CRP_SEED)
    }

    /// Creates a protocol instance with a caller-chosen CRP seed (up to 32
    /// bytes are used).
    pub fn with_seed(
        local: &LocalParty,
        par: Arc<BfvParameters>,
        sk: SecretKey,
        tree: &Tree,
        seed: &[u8],
    ) -> Result<Self, ProtocolError> {
        let node = tree.get(&local.id).ok_or_else(|| {
            ProtocolError::InvalidInput(format!("party-{} is not in the tree", local.id))
        })?;
        Ok(Self {
            local_id: local.id,
            parent: (node.parent != local.id).then_some(node.parent),
            children: node.children.clone(),
            par,
            sk,
            seed: seed.to_vec(),
            links: None,
        })
    }

    /// Spawns the parent/child send/receive tasks on an established
    /// network, with the per-read deadline armed.
    pub fn bind_network(&mut self, net: &mut TcpNetwork) -> Result<(), ProtocolError> {
        let mut neighbours = Vec::new();
        neighbours.extend(self.parent);
        neighbours.extend(self.children.iter().copied());
        self.links = Some(spawn_tree_links(net, &neighbours, Some(READ_DEADLINE))?);
        Ok(())
    }

    /// Runs the protocol to completion. The root returns the key; every
    /// other party returns `None`.
    pub async fn run(&mut self) -> Result<Option<RelinearizationKey>, ProtocolError> {
        let mut links = self
            .links
            .take()
            .ok_or_else(|| ProtocolError::InvalidInput("protocol not bound to a network".into()))?;
        let mut rng = thread_rng();

        // Round 0: the root distributes the CRP seed; everyone else
        // receives it from its parent and forwards the identical frame.
        let seed = match self.parent {
            None => {
                let m = TreeMessage {
                    sender: self.local_id,
                    data: self.seed.clone(),
                    round: 0,
                };
                self.send_to_children(&mut links, &m).await?;
                self.seed.clone()
            }
            Some(_) => {
                let m = recv_round(&mut links, &[0]).await?;
                self.send_to_children(&mut links, &m).await?;
                m.data
            }
        };
        let crp = expand_crp(&self.par, &seed)?;
        let generator = RelinKeyGenerator::new(&self.sk, &crp, &mut rng)?;
        let mut share1: RelinKeyShare<R1> = generator.round_1(&mut rng)?;
        debug!(party = self.local_id, "round 1 share generated");

        // Round 1: aggregate the children's round-1 shares into the own
        // one (leaves skip straight past this).
        for _ in 0..self.children.len() {
            let m = recv_round(&mut links, &[1]).await?;
            let incoming = decode_share1(&m.data, &self.par, &crp)?;
            share1 = RelinKeyShare::from_shares([share1, incoming])?;
        }

        match self.parent {
            Some(parent) => {
                self.send(&mut links, parent, share1.to_bytes(), 1).await?;
                println!("\t\tround 1 ok");

                // Round 2: the global aggregate replaces the local one.
                let m = recv_round(&mut links, &[2]).await?;
                self.send_to_children(&mut links, &m).await?;
                let aggregated = decode_share1(&m.data, &self.par, &crp)?;
                let mut share2: RelinKeyShare<R2> = generator.round_2(&aggregated, &mut rng)?;

                // Round 3: aggregate the children's round-2 shares and
                // pass them up.
                for _ in 0..self.children.len() {
                    let m = recv_round(&mut links, &[3]).await?;
                    let incoming = decode_share2(&m.data, &self.par, &crp)?;
                    share2 = RelinKeyShare::from_shares([share2, incoming])?;
                }
                self.send(&mut links, parent, share2.to_bytes(), 3).await?;
                println!("\t\tround 2 ok");
                Ok(None)
            }
            None => {
                // At the root the round-1 aggregate is already global.
                let m = TreeMessage {
                    sender: self.local_id,
                    data: share1.to_bytes(),
                    round: 2,
                };
                self.send_to_children(&mut links, &m).await?;
                let mut share2: RelinKeyShare<R2> = generator.round_2(&share1, &mut rng)?;
                println!("\t\tround 1 ok");

                for _ in 0..self.children.len() {
                    let m = recv_round(&mut links, &[3]).await?;
                    let incoming = decode_share2(&m.data, &self.par, &crp)?;
                    share2 = RelinKeyShare::from_shares([share2, incoming])?;
                }
                let rlk = RelinearizationKey::from_shares([share2])?;
                println!("\t\tround 2 ok");
                Ok(Some(rlk))
            }
        }
    }

    async fn send(
        &self,
        links: &mut TreeChannels,
        to: PartyId,
        data: Vec<u8>,
        round: u64,
    ) -> Result<(), ProtocolError> {
        let m = TreeMessage {
            sender: self.local_id,
            data,
            round,
        };
        links.outbound[&to]
            .send(m)
            .await
            .map_err(|_| ProtocolError::ChannelClosed)
    }

    /// Forwards a frame unchanged to every child.
    async fn send_to_children(
        &self,
        links: &mut TreeChannels,
        m: &TreeMessage,
    ) -> Result<(), ProtocolError> {
        for child in &self.children {
            links.outbound[child]
                .send(m.clone())
                .await
                .map_err(|_| ProtocolError::ChannelClosed)?;
        }
        Ok(())
    }
}

/// Waits for the next inbound message and checks its round tag.
pub(crate) async fn recv_round(
    links: &mut TreeChannels,
    rounds: &[u64],
) -> Result<TreeMessage, ProtocolError> {
    tokio::select! {
        m = links.inbound.recv() => {
            let m = m.ok_or(ProtocolError::ChannelClosed)?;
            if rounds.contains(&m.round) {
                Ok(m)
            } else {
                Err(ProtocolError::UnexpectedRound { from: m.sender, round: m.round })
            }
        }
        e = links.errors.recv() => {
            Err(e.map(Into::into).unwrap_or(ProtocolError::ChannelClosed))
        }
    }
}

/// Expands the CRP vector deterministically from the (zero-padded) seed.
fn expand_crp(
    par: &Arc<BfvParameters>,
    seed: &[u8],
) -> Result<Vec<CommonRandomPoly>, ProtocolError> {
    let mut key = <ChaCha8Rng as SeedableRng>::Seed::default();
    let len = seed.len().min(key.len());
    key[..len].copy_from_slice(&seed[..len]);
    let mut rng = ChaCha8Rng::from_seed(key);
    Ok(CommonRandomPoly::new_vec(par, &mut rng)?)
}

fn decode_share1(
    bytes: &[u8],
    par: &Arc<BfvParameters>,
    crp: &[CommonRandomPoly],
) -> Result<RelinKeyShare<R1>, ProtocolError> {
    RelinKeyShare::<R1>::deserialize(bytes, par, crp.to_vec())
        .map_err(|e| ProtocolError::Deserialize(e.to_string()))
}

fn decode_share2(
    bytes: &[u8],
    par: &Arc<BfvParameters>,
    crp: &[CommonRandomPoly],
) -> Result<RelinKeyShare<R2>, ProtocolError> {
    RelinKeyShare::<R2>::deserialize(bytes, par, crp.to_vec())
        .map_err(|e| ProtocolError::Deserialize(e.to_string()))
}
