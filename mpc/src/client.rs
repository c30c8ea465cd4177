//! Client flows for the two generation modes, driving network setup, the
//! protocols and the stdout progress protocol.

use std::collections::BTreeMap;
use std::io::Write;
use std::time::{Duration, Instant};

use fhe::bfv::SecretKey;
use rand::thread_rng;
use tokio::sync::mpsc;

use beavergen_network::{LocalParty, PartyId, TcpNetwork};

use crate::{he, mhe, params, rlk, tree, ProtocolError, Triple};

/// The fixed port every party listens on.
pub const BASE_PORT: u16 = 50000;

/// Tree branching factor of the MHE mode.
pub const TREE_BRANCHING: u64 = 2;

/// The shared address book: `party-<id>:50000` for every ID.
pub fn peer_addresses(n_parties: u64) -> BTreeMap<PartyId, String> {
    (0..n_parties)
        .map(|i| (i, format!("party-{i}:{BASE_PORT}")))
        .collect()
}

/// Runs one party of the pairwise HE triple generation.
pub async fn run_he_client(
    party_id: PartyId,
    n_parties: u64,
    n_triples: u64,
) -> Result<Vec<Triple>, ProtocolError> {
    println!("> Init");
    let peers = peer_addresses(n_parties);
    let local = LocalParty::new(party_id, &peers)?;

    let mut net = TcpNetwork::new(&local);
    print!("\testablishing connections...");
    flush_stdout()?;
    net.connect(&local).await?;
    println!(" done");

    let par = params::default_parameters()?;
    let sk = SecretKey::random(&par, &mut thread_rng());
    let mut protocol = he::TripleGenProtocol::new(&local, par, sk)?;
    protocol.bind_network(&mut net)?;

    println!("> Triple Generation Phase");
    let started = Instant::now();
    let rx = protocol.run(n_triples).await?;
    let elapsed = started.elapsed();

    let triples = drain(rx).await;

    let (sent, received) = net.sum();
    println!("\tdone");
    println!("Time: {}", elapsed.as_nanos());
    println!("Comm: {}", sent + received);
    Ok(triples)
}

/// Runs one party of the MHE triple generation: a relinearization key
/// round over one network, then the triple round over a second network on
/// the same port.
pub async fn run_mhe_client(
    party_id: PartyId,
    n_parties: u64,
    n_triples: u64,
) -> Result<Vec<Triple>, ProtocolError> {
    println!("> Init");
    let peers = peer_addresses(n_parties);
    let local = LocalParty::new(party_id, &peers)?;
    let tree = tree::build_tree(&local.peers, TREE_BRANCHING)?;

    let mut rlk_net = TcpNetwork::new(&local);
    print!("\testablishing connections...");
    flush_stdout()?;
    rlk_net.connect(&local).await?;
    println!(" done");

    println!("> MHE Setup");
    let par = params::default_parameters()?;
    let sk = SecretKey::random(&par, &mut thread_rng());

    println!("\tgenerating the relinearization key...");
    let mut rlk_protocol = rlk::RlkGenProtocol::new(&local, par.clone(), sk.clone(), &tree)?;
    rlk_protocol.bind_network(&mut rlk_net)?;
    let rlk_started = Instant::now();
    let rlk_key = rlk_protocol.run().await?;
    let rlk_elapsed = rlk_started.elapsed();
    println!("\tdone");

    let (setup_sent, setup_received) = rlk_net.sum();
    // The second network reuses the listening port, so the first one must
    // be gone before connecting again.
    drop(rlk_protocol);
    drop(rlk_net);

    println!("> Triple Generation Phase");
    let mut triple_net = TcpNetwork::new(&local);
    print!("\testablishing connections...");
    flush_stdout()?;
    triple_net.connect(&local).await?;
    println!(" done");

    println!("\tgenerating the triples...");
    let mut protocol = mhe::TripleGenProtocol::new(&local, par, sk, rlk_key, &tree)?;
    protocol.bind_network(&mut triple_net)?;
    let started = Instant::now();
    let rx = protocol.run(n_triples).await?;
    let elapsed = started.elapsed();
    let triples = drain(rx).await;
    println!("\tdone");

    println!("Setup Time: {}", rlk_elapsed.as_nanos());
    println!("Setup Comm: {}", setup_sent + setup_received);
    println!("Time: {}", elapsed.as_nanos());
    let (sent, received) = triple_net.sum();
    println!("Comm: {}", sent + received);

    // Let slower peers drain their sockets before the process exits.
    tokio::time::sleep(Duration::from_secs(1)).await;
    Ok(triples)
}

async fn drain(mut rx: mpsc::Receiver<Triple>) -> Vec<Triple> {
    let mut triples = Vec::new();
    while let Some(t) = rx.recv().await {
        triples.push(t);
    }
    triples
}

fn flush_stdout() -> Result<(), ProtocolError> {
    std::io::stdout()
        .flush()
        .map_err(|e| ProtocolError::Network(e.into()))
}
