//! Pairwise triple generation over homomorphic encryption.
//!
//! Every party P_i samples share vectors a, b, computes c = a·b, and for
//! each peer subtracts a fresh uniform mask from c. P_i encrypts a under
//! its own secret key and sends the ciphertext to every peer as a
//! **query**. A peer answers with the **response** enc(a_i)·b_j + m_{j,i}
//! plus smudging noise, which P_i folds into a running aggregate.
//! Once P_i has served a query for every peer and received a response from
//! every peer, it decrypts the aggregate, adds the result into c and emits
//! its shares of n triples.
//!
//! Message ordering is arbitrary, but exactly one query and one response
//! must arrive from each peer; duplicates are fatal.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use fhe::bfv::{BfvParameters, Ciphertext, Plaintext, SecretKey};
use fhe_math::rq::Representation;
use fhe_math::zq::Modulus;
use fhe_traits::FheEncrypter;
use itertools::izip;
use rand::{thread_rng, CryptoRng, RngCore};
use tokio::sync::mpsc;
use tracing::debug;

use beavergen_network::framing::PairMessage;
use beavergen_network::io::{spawn_pair_links, PairChannels};
use beavergen_network::{LocalParty, PartyId, TcpNetwork};

use crate::{lattice, math, ProtocolError, Triple};

/// Driver for one pairwise triple generation run.
pub struct TripleGenProtocol {
    local_id: PartyId,
    peer_ids: Vec<PartyId>,
    par: Arc<BfvParameters>,
    sk: SecretKey,
    q: Modulus,
    n: usize,
    links: Option<PairChannels>,
}

/// Per-run state, owned exclusively by the driver.
struct TripleGenRound {
    a: Vec<u64>,
    b: Vec<u64>,
    c: Vec<u64>,
    plain_b: Plaintext,
    masks: BTreeMap<PartyId, Vec<u64>>,
    enc_a: Ciphertext,
    enc_aggr: Option<Ciphertext>,
    has_queried: BTreeSet<PartyId>,
    has_responded: BTreeSet<PartyId>,
}

impl TripleGenProtocol {
    pub fn new(
        local: &LocalParty,
        par: Arc<BfvParameters>,
        sk: SecretKey,
    ) -> Result<Self, ProtocolError> {
        let q = Modulus::new(par.plaintext())?;
        let n = par.degree();
        Ok(Self {
            local_id: local.id,
            peer_ids: local.remote_ids(),
            par,
            sk,
            q,
            n,
            links: None,
        })
    }

    /// Spawns the per-peer send/receive tasks on an established network.
    pub fn bind_network(&mut self, net: &mut TcpNetwork) -> Result<(), ProtocolError> {
        let wire_len = lattice::ciphertext_wire_len(&self.sk, &self.par, &mut thread_rng())?;
        self.links = Some(spawn_pair_links(net, &self.peer_ids, wire_len)?);
        Ok(())
    }

    /// Runs the protocol to completion and returns the closed channel
    /// holding the local party's min(n, `n_triples`) triple shares.
    pub async fn run(
        &mut self,
        n_triples: u64,
    ) -> Result<mpsc::Receiver<Triple>, ProtocolError> {
        let (tx, rx) = mpsc::channel(self.n);
        if self.peer_ids.is_empty() {
            // A single party has no one to interact with.
            return Ok(rx);
        }

        let mut links = self
            .links
            .take()
            .ok_or_else(|| ProtocolError::InvalidInput("protocol not bound to a network".into()))?;
        let mut rng = thread_rng();
        let mut round = self.gen_input(&mut rng)?;

        // Broadcast the own query.
        let query = lattice::wire_ciphertext(&round.enc_a, &self.par)?;
        for peer in &self.peer_ids {
            links.outbound[peer]
                .send(PairMessage {
                    sender: self.local_id,
                    ciphertext: query.clone(),
                    is_query: true,
                })
                .await
                .map_err(|_| ProtocolError::ChannelClosed)?;
        }

        loop {
            tokio::select! {
                m = links.inbound.recv() => {
                    let m = m.ok_or(ProtocolError::ChannelClosed)?;
                    if m.is_query {
                        let response = self.process_query(&m, &mut round, &mut rng)?;
                        let out = links
                            .outbound
                            .get(&m.sender)
                            .ok_or(ProtocolError::UnexpectedMessage {
                                from: m.sender,
                                kind: "query",
                            })?;
                        out.send(PairMessage {
                            sender: self.local_id,
                            ciphertext: response,
                            is_query: false,
                        })
                        .await
                        .map_err(|_| ProtocolError::ChannelClosed)?;
                    } else {
                        self.process_response(&m, &mut round)?;
                    }
                    if self.is_complete(&round) {
                        break;
                    }
                }
                e = links.errors.recv() => {
                    return Err(e.map(Into::into).unwrap_or(ProtocolError::ChannelClosed));
                }
            }
        }
        println!("\tround 1 ok");

        let mut needed = n_triples;
        for triple in self.decrypt_triples(&mut round)? {
            if needed == 0 {
                break;
            }
            tx.send(triple)
                .await
                .map_err(|_| ProtocolError::ChannelClosed)?;
            needed -= 1;
        }
        Ok(rx)
    }

    /// Samples the share vectors, the per-peer masks and the query
    /// ciphertext.
    fn gen_input<R: RngCore + CryptoRng>(
        &self,
        rng: &mut R,
    ) -> Result<TripleGenRound, ProtocolError> {
        let a = math::sample_uniform_vec(self.n, &self.q, rng);
        let b = math::sample_uniform_vec(self.n, &self.q, rng);
        let mut c = math::mul_vec(&a, &b, &self.q);

        let mut masks = BTreeMap::new();
        for &peer in &self.peer_ids {
            let mask = math::sample_uniform_vec(self.n, &self.q, rng);
            c = math::sub_vec(&c, &mask, &self.q);
            masks.insert(peer, mask);
        }

        let plain_a = lattice::encode_simd(&a, &self.par)?;
        let plain_b = lattice::encode_simd(&b, &self.par)?;
        let enc_a = self.sk.try_encrypt(&plain_a, rng)?;

        Ok(TripleGenRound {
            a,
            b,
            c,
            plain_b,
            masks,
            enc_a,
            enc_aggr: None,
            has_queried: BTreeSet::new(),
            has_responded: BTreeSet::new(),
        })
    }

    /// Answers a peer's query with enc(a_peer)·b + mask + smudging noise.
    fn process_query<R: RngCore + CryptoRng>(
        &self,
        m: &PairMessage,
        round: &mut TripleGenRound,
        rng: &mut R,
    ) -> Result<Vec<u8>, ProtocolError> {
        if !round.has_queried.insert(m.sender) {
            return Err(ProtocolError::UnexpectedMessage {
                from: m.sender,
                kind: "second query",
            });
        }
        debug!(from = m.sender, "processing query");

        let enc_a = lattice::ciphertext_from_bytes(&m.ciphertext, &self.par)?;
        let mask = round
            .masks
            .get(&m.sender)
            .ok_or(ProtocolError::UnexpectedMessage {
                from: m.sender,
                kind: "query",
            })?;

        let mut response = &enc_a * &round.plain_b;
        // The mask rides in on the first polynomial of a zero-key
        // encryption, which also rerandomizes the product.
        response.c[0] += &lattice::masking_poly(mask, &self.par, rng)?;
        response.c[0] += &lattice::smudging_poly(&self.par, Representation::Ntt, rng)?;
        response.c[1] += &lattice::smudging_poly(&self.par, Representation::Ntt, rng)?;

        lattice::wire_ciphertext(&response, &self.par)
    }

    /// Folds a peer's response into the aggregate ciphertext.
    fn process_response(
        &self,
        m: &PairMessage,
        round: &mut TripleGenRound,
    ) -> Result<(), ProtocolError> {
        if !round.has_responded.insert(m.sender) {
            return Err(ProtocolError::UnexpectedMessage {
                from: m.sender,
                kind: "second response",
            });
        }
        debug!(from = m.sender, "processing response");

        let response = lattice::ciphertext_from_bytes(&m.ciphertext, &self.par)?;
        round.enc_aggr = Some(match round.enc_aggr.take() {
            None => response,
            Some(aggr) => &aggr + &response,
        });
        Ok(())
    }

    /// The run is complete once every peer has both queried and responded.
    fn is_complete(&self, round: &TripleGenRound) -> bool {
        self.peer_ids
            .iter()
            .all(|p| round.has_queried.contains(p) && round.has_responded.contains(p))
    }

    /// Decrypts the aggregate, finalizes c and assembles the triples.
    fn decrypt_triples(
        &self,
        round: &mut TripleGenRound,
    ) -> Result<Vec<Triple>, ProtocolError> {
        let aggr = round
            .enc_aggr
            .take()
            .ok_or(ProtocolError::ChannelClosed)?;
        let opened = lattice::decrypt_simd(&aggr, &self.sk)?;
        round.c = math::add_vec(&round.c, &opened, &self.q);

        Ok(izip!(&round.a, &round.b, &round.c)
            .map(|(&a, &b, &c)| Triple { a, b, c })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use fhe::bfv::BfvParametersBuilder;

    use super::*;

    fn three_party_protocol() -> TripleGenProtocol {
        let par = BfvParametersBuilder::new()
            .set_degree(16)
            .set_plaintext_modulus(1153)
            .set_moduli_sizes(&[62, 62])
            .build_arc()
            .unwrap();
        let book: BTreeMap<PartyId, String> = (0..3)
            .map(|i| (i, format!("party-{i}:50000")))
            .collect();
        let local = LocalParty::new(1, &book).unwrap();
        let sk = SecretKey::random(&par, &mut thread_rng());
        TripleGenProtocol::new(&local, par, sk).unwrap()
    }

    #[test]
    fn completion_needs_both_sets_full() {
        let protocol = three_party_protocol();
        let mut round = protocol.gen_input(&mut thread_rng()).unwrap();
        assert!(!protocol.is_complete(&round));

        round.has_queried.insert(0);
        round.has_queried.insert(2);
        assert!(!protocol.is_complete(&round));

        round.has_responded.insert(0);
        assert!(!protocol.is_complete(&round));
        round.has_responded.insert(2);
        assert!(protocol.is_complete(&round));
    }

    #[test]
    fn duplicate_messages_are_fatal() {
        let protocol = three_party_protocol();
        let mut rng = thread_rng();
        let mut round = protocol.gen_input(&mut rng).unwrap();
        let query = PairMessage {
            sender: 0,
            ciphertext: lattice::wire_ciphertext(&round.enc_a, &protocol.par).unwrap(),
            is_query: true,
        };

        assert!(protocol.process_query(&query, &mut round, &mut rng).is_ok());
        assert!(matches!(
            protocol.process_query(&query, &mut round, &mut rng),
            Err(ProtocolError::UnexpectedMessage { from: 0, .. })
        ));

        let response = PairMessage {
            is_query: false,
            ..query
        };
        assert!(protocol.process_response(&response, &mut round).is_ok());
        assert!(matches!(
            protocol.process_response(&response, &mut round),
            Err(ProtocolError::UnexpectedMessage { from: 0, .. })
        ));
    }
}
