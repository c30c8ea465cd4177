use clap::Parser;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

use beavergen_mpc::client;

/// Distributed Beaver triple generation over homomorphic encryption.
#[derive(Parser, Debug)]
#[command(name = "beavergen")]
struct Args {
    /// Protocol to run: "mhe" selects the tree-based multi-party protocol,
    /// anything else the pairwise HE protocol.
    proto: String,
    /// ID of the local party, in 0..n_parties.
    party_id: u64,
    /// Total number of parties.
    n_parties: u64,
    /// Number of Beaver triples to produce.
    n_triples: u64,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::from(1);
        }
    };
    if args.n_triples == 0 {
        eprintln!("n triples should be a positive integer");
        return ExitCode::from(1);
    }

    let result = if args.proto == "mhe" {
        client::run_mhe_client(args.party_id, args.n_parties, args.n_triples).await
    } else {
        client::run_he_client(args.party_id, args.n_parties, args.n_triples).await
    };

    match result {
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("fatal: {e}");
            ExitCode::FAILURE
        }
    }
}
