//! Shared helpers for the multi-party integration tests: every party runs
//! in-process and the mesh uses real loopback TCP, each party listening on
//! its own port.

use std::collections::BTreeMap;
use std::sync::Arc;

use fhe::bfv::{BfvParameters, BfvParametersBuilder};
use fhe_math::zq::Modulus;
use tokio::sync::mpsc;

use beavergen_mpc::Triple;
use beavergen_network::PartyId;

/// Small parameter set with an NTT-friendly plaintext modulus, so the
/// SIMD-encoded products stay coordinate-wise.
pub fn test_parameters(num_moduli: usize, degree: usize) -> Arc<BfvParameters> {
    BfvParametersBuilder::new()
        .set_degree(degree)
        .set_plaintext_modulus(1153)
        .set_moduli_sizes(&vec![62usize; num_moduli])
        .build_arc()
        .unwrap()
}

/// Loopback address book: every party listens on its own port.
pub fn loopback_addresses(n_parties: u64, base_port: u16) -> BTreeMap<PartyId, String> {
    (0..n_parties)
        .map(|i| (i, format!("127.0.0.1:{}", base_port + i as u16)))
        .collect()
}

pub async fn drain(mut rx: mpsc::Receiver<Triple>) -> Vec<Triple> {
    let mut triples = Vec::new();
    while let Some(t) = rx.recv().await {
        triples.push(t);
    }
    triples
}

/// Sums all parties' shares coordinate-wise and checks A·B ≡ C mod q on
/// every emitted position.
pub fn assert_triples_correct(shares: &[Vec<Triple>], q: u64) {
    let modulus = Modulus::new(q).unwrap();
    let n_triples = shares[0].len();
    assert!(n_triples > 0);
    for party in shares {
        assert_eq!(party.len(), n_triples);
    }

    for i in 0..n_triples {
        let (mut a, mut b, mut c) = (0u64, 0u64, 0u64);
        for party in shares {
            a = modulus.add(a, party[i].a);
            b = modulus.add(b, party[i].b);
            c = modulus.add(c, party[i].c);
        }
        assert_eq!(modulus.mul(a, b), c, "triple {i} is inconsistent");
    }
}

/// Checks that, over the whole mesh, as many bytes were written as read.
pub fn assert_bytes_conserved(sums: &[(u64, u64)]) {
    let sent: u64 = sums.iter().map(|(s, _)| s).sum();
    let received: u64 = sums.iter().map(|(_, r)| r).sum();
    assert_eq!(sent, received);
}
