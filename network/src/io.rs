//! Per-edge send/receive tasks bridging sockets and bounded channels.
//!
//! Binding a protocol to a network spawns, for every neighbour edge, one
//! receive task (drains the socket, pushes decoded frames onto the single
//! multiplexed inbound channel) and one send task (drains a per-edge
//! outbound channel, writes frames to the socket). All channels are
//! bounded by [`CHANNEL_CAPACITY`]; a full queue blocks the writer, which
//! is the only flow control the protocols rely on.
//!
//! Fatal task errors are reported on a dedicated error channel that the
//! protocol driver selects on next to the inbound channel. A connection
//! closed cleanly between frames ends its receive task silently.

use std::collections::BTreeMap;
use std::time::Duration;

use tokio::io::{ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::debug;

use crate::framing::{
    read_pair_message, read_tree_message, write_pair_message, write_tree_message, PairMessage,
    TreeMessage,
};
use crate::tcp::MeteredStream;
use crate::{NetworkError, PartyId, TcpNetwork};

/// Capacity of the inbound channel and of each per-edge outbound channel.
pub const CHANNEL_CAPACITY: usize = 32;

/// Channel ends handed to a tree-protocol driver.
pub struct TreeChannels {
    pub inbound: mpsc::Receiver<TreeMessage>,
    pub outbound: BTreeMap<PartyId, mpsc::Sender<TreeMessage>>,
    pub errors: mpsc::Receiver<NetworkError>,
}

/// Channel ends handed to the pairwise HE protocol driver.
pub struct PairChannels {
    pub inbound: mpsc::Receiver<PairMessage>,
    pub outbound: BTreeMap<PartyId, mpsc::Sender<PairMessage>>,
    pub errors: mpsc::Receiver<NetworkError>,
}

/// Spawns tree-frame send/receive tasks for every edge in `neighbours`.
///
/// `read_deadline` bounds the time a receive task may wait for the next
/// frame; expiry is fatal. The relinearization key protocol passes 20 s,
/// the MHE triple protocol no deadline.
pub fn spawn_tree_links(
    net: &mut TcpNetwork,
    neighbours: &[PartyId],
    read_deadline: Option<Duration>,
) -> Result<TreeChannels, NetworkError> {
    let (inbound_tx, inbound_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let (err_tx, err_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let mut outbound = BTreeMap::new();

    for &peer in neighbours {
        let stream = net
            .take_stream(peer)
            .ok_or_else(|| NetworkError::Setup(format!("no connection to party-{peer}")))?;
        let (read_half, write_half) = tokio::io::split(stream);

        let inbound_tx = inbound_tx.clone();
        let recv_err_tx = err_tx.clone();
        tokio::spawn(async move {
            tree_recv_loop(read_half, peer, inbound_tx, recv_err_tx, read_deadline).await;
        });

        let (out_tx, out_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let send_err_tx = err_tx.clone();
        tokio::spawn(async move {
            tree_send_loop(write_half, out_rx, send_err_tx).await;
        });
        outbound.insert(peer, out_tx);
    }

    Ok(TreeChannels {
        inbound: inbound_rx,
        outbound,
        errors: err_rx,
    })
}

async fn tree_recv_loop(
    mut read_half: ReadHalf<MeteredStream>,
    peer: PartyId,
    inbound: mpsc::Sender<TreeMessage>,
    errors: mpsc::Sender<NetworkError>,
    read_deadline: Option<Duration>,
) {
    loop {
        let next = match read_deadline {
            Some(deadline) => match timeout(deadline, read_tree_message(&mut read_half)).await {
                Ok(res) => res,
                Err(_) => Err(NetworkError::ReadTimeout),
            },
            None => read_tree_message(&mut read_half).await,
        };
        match next {
            Ok(Some(m)) => {
                if inbound.send(m).await.is_err() {
                    // Driver finished; nothing left to deliver to.
                    return;
                }
            }
            Ok(None) => {
                debug!(peer, "connection closed");
                return;
            }
            Err(e) => {
                let _ = errors.send(e).await;
                return;
            }
        }
    }
}

async fn tree_send_loop(
    mut write_half: WriteHalf<MeteredStream>,
    mut outbound: mpsc::Receiver<TreeMessage>,
    errors: mpsc::Sender<NetworkError>,
) {
    while let Some(m) = outbound.recv().await {
        if let Err(e) = write_tree_message(&mut write_half, &m).await {
            let _ = errors.send(e).await;
            return;
        }
    }
}

/// Spawns pairwise-frame send/receive tasks for every peer edge. Every
/// frame carries exactly `ciphertext_len` ciphertext bytes.
// Shares the loop structure of the tree links, but with the fixed-size
// pairwise frame and no read deadline.
pub fn spawn_pair_links(
    net: &mut TcpNetwork,
    peers: &[PartyId],
    ciphertext_len: usize,
) -> Result<PairChannels, NetworkError> {
    let (inbound_tx, inbound_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let (err_tx, err_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let mut outbound = BTreeMap::new();

    for &peer in peers {
        let stream = net
            .take_stream(peer)
            .ok_or_else(|| NetworkError::Setup(format!("no connection to party-{peer}")))?;
        let (mut read_half, mut write_half) = tokio::io::split(stream);

        let inbound_tx = inbound_tx.clone();
        let recv_err_tx = err_tx.clone();
        tokio::spawn(async move {
            loop {
                match read_pair_message(&mut read_half, ciphertext_len).await {
                    Ok(Some(m)) => {
                        if inbound_tx.send(m).await.is_err() {
                            return;
                        }
                    }
                    Ok(None) => {
                        debug!(peer, "connection closed");
                        return;
                    }
                    Err(e) => {
                        let _ = recv_err_tx.send(e).await;
                        return;
                    }
                }
            }
        });

        let (out_tx, mut out_rx) = mpsc::channel::<PairMessage>(CHANNEL_CAPACITY);
        let send_err_tx = err_tx.clone();
        tokio::spawn(async move {
            while let Some(m) = out_rx.recv().await {
                if let Err(e) = write_pair_message(&mut write_half, &m).await {
                    let _ = send_err_tx.send(e).await;
                    return;
                }
            }
        });
        outbound.insert(peer, out_tx);
    }

    Ok(PairChannels {
        inbound: inbound_rx,
        outbound,
        errors: err_rx,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::LocalParty;

    async fn two_party_networks(base_port: u16) -> (TcpNetwork, TcpNetwork) {
        let book: BTreeMap<PartyId, String> = (0..2)
            .map(|i| (i, format!("127.0.0.1:{}", base_port + i as u16)))
            .collect();
        let lp0 = LocalParty::new(0, &book).unwrap();
        let lp1 = LocalParty::new(1, &book).unwrap();
        let h0 = tokio::spawn(async move {
            let mut net = TcpNetwork::new(&lp0);
            net.connect(&lp0).await.unwrap();
            net
        });
        let h1 = tokio::spawn(async move {
            let mut net = TcpNetwork::new(&lp1);
            net.connect(&lp1).await.unwrap();
            net
        });
        (h0.await.unwrap(), h1.await.unwrap())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn tree_links_carry_frames_both_ways() {
        let (mut net0, mut net1) = two_party_networks(51830);
        let mut links0 = spawn_tree_links(&mut net0, &[1], None).unwrap();
        let mut links1 = spawn_tree_links(&mut net1, &[0], None).unwrap();

        let m = TreeMessage {
            sender: 0,
            data: vec![1, 2, 3],
            round: 1,
        };
        links0.outbound[&1].send(m.clone()).await.unwrap();
        assert_eq!(links1.inbound.recv().await.unwrap(), m);

        let reply = TreeMessage {
            sender: 1,
            data: vec![4, 5],
            round: 2,
        };
        links1.outbound[&0].send(reply.clone()).await.unwrap();
        assert_eq!(links0.inbound.recv().await.unwrap(), reply);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn silent_peer_trips_the_read_deadline() {
        let (mut net0, mut net1) = two_party_networks(51840);
        let mut links0 =
            spawn_tree_links(&mut net0, &[1], Some(Duration::from_millis(50))).unwrap();
        // The peer binds its links but never sends anything.
        let _links1 = spawn_tree_links(&mut net1, &[0], None).unwrap();

        let err = links0.errors.recv().await.unwrap();
        assert!(matches!(err, NetworkError::ReadTimeout));
    }
}
