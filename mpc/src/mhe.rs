//! Tree-based multi-party triple generation.
//!
//! Each party samples a, b, c uniformly and encrypts a and b under its own
//! secret key against seed-derived common reference polynomials, so that
//! all parties' ciphertexts share their second polynomial and summing
//! first polynomials aggregates the encryptions under the collective key.
//!
//! Round 0 aggregates the ciphertext pairs bottom-up. The root multiplies
//! and relinearizes the aggregates into encC, broadcasts encC's second
//! polynomial down the tree (round 1), and every party derives a
//! collaborative decryption share from it; non-root parties fold their own
//! c share (negatively) and smudging noise into theirs. Round 2 sums the
//! shares bottom-up, and the root recovers its c vector as the residual,
//! so that Σa · Σb ≡ Σc (mod q).

use std::sync::Arc;

use fhe::bfv::{BfvParameters, Ciphertext, Multiplicator, RelinearizationKey, SecretKey};
use fhe_math::rq::{Poly, Representation};
use fhe_math::zq::Modulus;
use fhe_traits::Serialize;
use itertools::izip;
use rand::{thread_rng, CryptoRng, RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tokio::sync::mpsc;
use tracing::debug;

use beavergen_network::framing::TreeMessage;
use beavergen_network::io::{spawn_tree_links, TreeChannels};
use beavergen_network::{LocalParty, PartyId, TcpNetwork};

use crate::rlk::recv_round;
use crate::tree::Tree;
use crate::{lattice, math, ProtocolError, Triple};

/// Seed from which the per-run common reference polynomials of the setup
/// encryptions are derived.
pub const DEFAULT_SETUP_SEED: [u8; 16] = [
    0x49, 0x0a, 0x42, 0x3d, 0x97, 0x9d, 0xc1, 0x07, 0xa1, 0xd7, 0xe9, 0x7b, 0x3b, 0xce, 0xa1,
    0xdb,
];

/// Driver for one tree-based triple generation run.
pub struct TripleGenProtocol {
    local_id: PartyId,
    parent: Option<PartyId>,
    children: Vec<PartyId>,
    par: Arc<BfvParameters>,
    sk: SecretKey,
    rlk: Option<RelinearizationKey>,
    q: Modulus,
    n: usize,
    seed: Vec<u8>,
    links: Option<TreeChannels>,
}

/// Per-run state, owned exclusively by the driver.
struct TripleGenRound {
    a: Vec<u64>,
    b: Vec<u64>,
    c: Vec<u64>,
    enc_a: Ciphertext,
    enc_b: Ciphertext,
    enc_c: Option<Ciphertext>,
    decryption_share: Poly,
}

impl TripleGenProtocol {
    /// Creates a protocol instance with the shipped setup seed. `rlk` is
    /// required at the root (the only party that multiplies) and ignored
    /// elsewhere.
    pub fn new(
        local: &LocalParty,
        par: Arc<BfvParameters>,
        sk: SecretKey,
        rlk: Option<RelinearizationKey>,
        tree: &Tree,
    ) -> Result<Self, ProtocolError> {
        Self::with_seed(local, par, sk, rlk, tree, &DEFAULT_SETUP_SEED)
    }

    /// Creates a protocol instance with a caller-chosen setup seed (up to
    /// 32 bytes are used).
    pub fn with_seed(
        local: &LocalParty,
        par: Arc<BfvParameters>,
        sk: SecretKey,
        rlk: Option<RelinearizationKey>,
        tree: &Tree,
        seed: &[u8],
    ) -> Result<Self, ProtocolError> {
        let node = tree.get(&local.id).ok_or_else(|| {
            ProtocolError::InvalidInput(format!("party-{} is not in the tree", local.id))
        })?;
        let parent = (node.parent != local.id).then_some(node.parent);
        let q = Modulus::new(par.plaintext())?;
        let n = par.degree();
        Ok(Self {
            local_id: local.id,
            parent,
            children: node.children.clone(),
            par,
            sk,
            rlk,
            q,
            n,
            seed: seed.to_vec(),
            links: None,
        })
    }

    /// Spawns the parent/child send/receive tasks on an established
    /// network.
    pub fn bind_network(&mut self, net: &mut TcpNetwork) -> Result<(), ProtocolError> {
        let mut neighbours = Vec::new();
        neighbours.extend(self.parent);
        neighbours.extend(self.children.iter().copied());
        self.links = Some(spawn_tree_links(net, &neighbours, None)?);
        Ok(())
    }

    /// Runs the protocol to completion and returns the closed channel
    /// holding the local party's min(n, `n_triples`) triple shares.
    pub async fn run(
        &mut self,
        n_triples: u64,
    ) -> Result<mpsc::Receiver<Triple>, ProtocolError> {
        let (tx, rx) = mpsc::channel(self.n);
        if self.parent.is_none() && self.children.is_empty() {
            // A single party has no one to share triples with.
            return Ok(rx);
        }

        let mut links = self
            .links
            .take()
            .ok_or_else(|| ProtocolError::InvalidInput("protocol not bound to a network".into()))?;
        let mut rng = thread_rng();
        let mut round = self.gen_input(&mut rng)?;

        // Round 0: ciphertext aggregation, bottom-up.
        for _ in 0..self.children.len() {
            let m = recv_round(&mut links, &[0]).await?;
            self.aggregate_ciphertexts(&m.data, &mut round)?;
            debug!(party = self.local_id, from = m.sender, "aggregated ciphertexts");
        }
        match self.parent {
            Some(parent) => {
                let data = lattice::wire_pair(&round.enc_a, &round.enc_b);
                self.send(&mut links, parent, data, 0).await?;

                // Round 1: encC's second polynomial arrives from above.
                let m = recv_round(&mut links, &[1]).await?;
                self.send_to_children(&mut links, &m).await?;
                self.gen_decryption_share(&m.data, &mut round, &mut rng)?;
            }
            None => {
                let rlk = self
                    .rlk
                    .as_ref()
                    .ok_or_else(|| {
                        ProtocolError::InvalidInput(
                            "the tree root needs the relinearization key".into(),
                        )
                    })?;
                let enc_c = Multiplicator::default(rlk)?
                    .multiply(&round.enc_a, &round.enc_b)?;
                let data = enc_c.c[1].to_bytes();
                let m = TreeMessage {
                    sender: self.local_id,
                    data: data.clone(),
                    round: 1,
                };
                self.send_to_children(&mut links, &m).await?;
                self.gen_decryption_share(&data, &mut round, &mut rng)?;
                round.enc_c = Some(enc_c);
            }
        }

        // Round 2: decryption share aggregation, bottom-up.
        for _ in 0..self.children.len() {
            let m = recv_round(&mut links, &[2]).await?;
            self.aggregate_decryption_share(&m.data, &mut round)?;
            debug!(party = self.local_id, from = m.sender, "aggregated decryption share");
        }
        match self.parent {
            Some(parent) => {
                let data = round.decryption_share.to_bytes();
                self.send(&mut links, parent, data, 2).await?;
            }
            None => self.root_finalize(&mut round)?,
        }

        let mut needed = n_triples;
        for (&a, &b, &c) in izip!(&round.a, &round.b, &round.c) {
            if needed == 0 {
                break;
            }
            tx.send(Triple { a, b, c })
                .await
                .map_err(|_| ProtocolError::ChannelClosed)?;
            needed -= 1;
        }
        Ok(rx)
    }

    /// Samples the share vectors and the seeded setup encryptions of a
    /// and b.
    fn gen_input<R: RngCore + CryptoRng>(
        &self,
        rng: &mut R,
    ) -> Result<TripleGenRound, ProtocolError> {
        let a = math::sample_uniform_vec(self.n, &self.q, rng);
        let b = math::sample_uniform_vec(self.n, &self.q, rng);
        let c = math::sample_uniform_vec(self.n, &self.q, rng);

        let (seed_a, seed_b) = derive_encryption_seeds(&self.seed);
        let plain_a = lattice::encode_simd(&a, &self.par)?;
        let plain_b = lattice::encode_simd(&b, &self.par)?;
        let enc_a = self.sk.try_encrypt_with_seed(&plain_a, seed_a, rng)?;
        let enc_b = self.sk.try_encrypt_with_seed(&plain_b, seed_b, rng)?;

        let decryption_share =
            Poly::zero(self.par.ctx_at_level(0)?, Representation::PowerBasis);

        Ok(TripleGenRound {
            a,
            b,
            c,
            enc_a,
            enc_b,
            enc_c: None,
            decryption_share,
        })
    }

    /// Adds a child's (encA, encB) pair into the local pair. Only the
    /// first polynomials move; the second polynomials are the common
    /// reference polynomials and stay untouched.
    fn aggregate_ciphertexts(
        &self,
        data: &[u8],
        round: &mut TripleGenRound,
    ) -> Result<(), ProtocolError> {
        if data.is_empty() || data.len() % 2 != 0 {
            return Err(ProtocolError::Deserialize(
                "ciphertext pair buffer has no midpoint".into(),
            ));
        }
        let mid = data.len() / 2;
        let enc_a = lattice::ciphertext_from_bytes(&data[..mid], &self.par)?;
        let enc_b = lattice::ciphertext_from_bytes(&data[mid..], &self.par)?;
        round.enc_a.c[0] += &enc_a.c[0];
        round.enc_b.c[0] += &enc_b.c[0];
        Ok(())
    }

    /// Derives the local decryption share from encC's second polynomial:
    /// share = c₁·s, plus smudging noise minus the encoded own c share for
    /// everyone but the root (whose c is the residual of the decryption).
    fn gen_decryption_share<R: RngCore + CryptoRng>(
        &self,
        data: &[u8],
        round: &mut TripleGenRound,
        rng: &mut R,
    ) -> Result<(), ProtocolError> {
        let c1 = lattice::poly_from_bytes(data, &self.par)?;
        let s = lattice::secret_key_poly(&self.sk, &self.par)?;
        let mut share = &c1 * &s;
        share.change_representation(Representation::PowerBasis);

        if self.parent.is_some() {
            share += &lattice::smudging_poly(&self.par, Representation::PowerBasis, rng)?;
            let mut own_c = lattice::masking_poly(&round.c, &self.par, rng)?;
            own_c.change_representation(Representation::PowerBasis);
            share -= &own_c;
        }
        round.decryption_share = share;
        Ok(())
    }

    /// Adds a child's decryption share into the local one.
    fn aggregate_decryption_share(
        &self,
        data: &[u8],
        round: &mut TripleGenRound,
    ) -> Result<(), ProtocolError> {
        let share = lattice::poly_from_bytes(data, &self.par)?;
        round.decryption_share += &share;
        Ok(())
    }

    /// Adds the aggregated share into encC's first polynomial and decodes
    /// the root's c vector out of it.
    fn root_finalize(&self, round: &mut TripleGenRound) -> Result<(), ProtocolError> {
        let enc_c = round
            .enc_c
            .take()
            .ok_or(ProtocolError::ChannelClosed)?;
        let mut share = round.decryption_share.clone();
        share.change_representation(Representation::Ntt);
        let c0 = &enc_c.c[0] + &share;
        round.c = lattice::decode_first_poly(c0, &self.sk, &self.par)?;
        Ok(())
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

/// Derives the two per-run encryption seeds from the setup seed
/// (zero-padded into a ChaCha key), so that every party encrypts a against
/// one common reference polynomial and b against another.
fn derive_encryption_seeds(seed: &[u8]) -> ([u8; 32], [u8; 32]) {
    let mut key = <ChaCha8Rng as SeedableRng>::Seed::default();
    let len = seed.len().min(key.len());
    key[..len].copy_from_slice(&seed[..len]);
    let mut rng = ChaCha8Rng::from_seed(key);
    let mut seed_a = [0u8; 32];
    let mut seed_b = [0u8; 32];
    rng.fill_bytes(&mut seed_a);
    rng.fill_bytes(&mut seed_b);
    (seed_a, seed_b)
}
