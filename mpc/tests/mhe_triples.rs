mod utils;

use std::collections::BTreeMap;
use std::sync::Arc;

use fhe::bfv::{BfvParameters, SecretKey};
use rand::thread_rng;

use beavergen_mpc::tree::build_tree;
use beavergen_mpc::{mhe, rlk, Triple};
use beavergen_network::{LocalParty, PartyId, TcpNetwork};

use crate::utils::{assert_triples_correct, drain, loopback_addresses, test_parameters};

/// One party's full MHE flow: relinearization key generation over a first
/// network, then triple generation over a second network on the same
/// ports.
async fn run_party(
    id: PartyId,
    book: BTreeMap<PartyId, String>,
    par: Arc<BfvParameters>,
    n_triples: u64,
) -> (Vec<Triple>, bool) {
    let local = LocalParty::new(id, &book).unwrap();
    let tree = build_tree(&local.peers, 2).unwrap();
    let sk = SecretKey::random(&par, &mut thread_rng());

    let mut rlk_net = TcpNetwork::new(&local);
    rlk_net.connect(&local).await.unwrap();
    let mut rlk_protocol =
        rlk::RlkGenProtocol::new(&local, par.clone(), sk.clone(), &tree).unwrap();
    rlk_protocol.bind_network(&mut rlk_net).unwrap();
    let rlk_key = rlk_protocol.run().await.unwrap();
    let has_key = rlk_key.is_some();
    drop(rlk_protocol);
    drop(rlk_net);

    let mut net = TcpNetwork::new(&local);
    net.connect(&local).await.unwrap();
    let mut protocol = mhe::TripleGenProtocol::new(&local, par, sk, rlk_key, &tree).unwrap();
    protocol.bind_network(&mut net).unwrap();
    let rx = protocol.run(n_triples).await.unwrap();
    (drain(rx).await, has_key)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn seven_parties_over_the_tree() {
    let n_parties = 7;
    let par = test_parameters(3, 16);
    let book = loopback_addresses(n_parties, 52210);

    let handles: Vec<_> = (0..n_parties)
        .map(|id| tokio::spawn(run_party(id, book.clone(), par.clone(), par.degree() as u64)))
        .collect();

    let mut shares = Vec::new();
    for (id, handle) in handles.into_iter().enumerate() {
        let (triples, has_key) = handle.await.unwrap();
        // Only the root materializes the relinearization key.
        assert_eq!(has_key, id == 0);
        assert_eq!(triples.len(), par.degree());
        shares.push(triples);
    }
    assert_triples_correct(&shares, par.plaintext());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn lone_party_emits_nothing() {
    let par = test_parameters(3, 16);
    let book = loopback_addresses(1, 52230);
    let local = LocalParty::new(0, &book).unwrap();
    let tree = build_tree(&local.peers, 2).unwrap();
    let sk = SecretKey::random(&par, &mut thread_rng());

    // No network or relinearization key is needed: a lone root terminates
    // at once.
    let mut protocol = mhe::TripleGenProtocol::new(&local, par, sk, None, &tree).unwrap();
    let rx = protocol.run(10).await.unwrap();
    assert!(drain(rx).await.is_empty());
}
