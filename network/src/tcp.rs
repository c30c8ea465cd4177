//! Symmetric TCP mesh between the protocol parties.
//!
//! Each party listens on the port of its own address, dials every peer
//! with a higher ID and accepts a connection from every peer with a lower
//! ID, so that exactly one full-duplex stream exists per pair. A dialer
//! identifies itself by writing its 8-byte big-endian party ID as the
//! first bytes on the wire.
//!
//! One network instance serves one protocol run. The listener is closed as
//! soon as all expected inbound connections have arrived, which frees the
//! port for a later instance on the same port (the MHE client runs two
//! networks serially).

use std::collections::BTreeMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::future::try_join_all;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info};

use crate::{LocalParty, NetworkError, PartyId};

/// Number of times a dial is attempted before giving up.
pub const CONNECT_ATTEMPTS: usize = 5;
/// Delay between two dial attempts.
pub const CONNECT_ATTEMPTS_DELAY: Duration = Duration::from_millis(1000);

/// A TCP stream that counts the bytes flowing through it. The counters are
/// relaxed atomics read by [`TcpNetwork::sum`]; the totals are statistical
/// (they are only logged) and never synchronise the protocol itself.
pub struct MeteredStream {
    inner: TcpStream,
    sent: Arc<AtomicU64>,
    received: Arc<AtomicU64>,
}

impl MeteredStream {
    fn new(inner: TcpStream, sent: Arc<AtomicU64>, received: Arc<AtomicU64>) -> Self {
        Self {
            inner,
            sent,
            received,
        }
    }
}

impl AsyncRead for MeteredStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let before = buf.filled().len();
        let res = Pin::new(&mut self.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = res {
            let n = (buf.filled().len() - before) as u64;
            self.received.fetch_add(n, Ordering::Relaxed);
        }
        res
    }
}

impl AsyncWrite for MeteredStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        let res = Pin::new(&mut self.inner).poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = res {
            self.sent.fetch_add(n as u64, Ordering::Relaxed);
        }
        res
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

struct Link {
    stream: Option<MeteredStream>,
    sent: Arc<AtomicU64>,
    received: Arc<AtomicU64>,
}

/// The mesh of connections from the local party to every peer.
pub struct TcpNetwork {
    links: BTreeMap<PartyId, Link>,
}

impl TcpNetwork {
    /// Allocates an empty connection table for one protocol run.
    pub fn new(_local: &LocalParty) -> Self {
        Self {
            links: BTreeMap::new(),
        }
    }

    /// Blocks until exactly one connection exists to every other party.
    ///
    /// Dials every peer with a higher ID (up to [`CONNECT_ATTEMPTS`] times
    /// each) and accepts one connection from every peer with a lower ID,
    /// keyed by the party ID the dialer sends first.
    pub async fn connect(&mut self, local: &LocalParty) -> Result<(), NetworkError> {
        let wait_for: Vec<PartyId> = local
            .peers
            .keys()
            .copied()
            .filter(|&p| p < local.id)
            .collect();
        let dial_for: Vec<_> = local.peers.values().filter(|rp| rp.id > local.id).collect();

        let port = listen_port(&local.addr)?;
        let listener = TcpListener::bind(("0.0.0.0", port))
            .await
            .map_err(|e| NetworkError::Setup(format!("cannot create listening socket: {e}")))?;

        let local_name = local.to_string();
        let accept_all = async move {
            let mut accepted = Vec::with_capacity(wait_for.len());
            let mut remaining = wait_for;
            while !remaining.is_empty() {
                let (mut stream, _) = listener.accept().await?;
                let peer_id = stream.read_u64().await?;
                match remaining.iter().position(|&p| p == peer_id) {
                    Some(idx) => {
                        remaining.swap_remove(idx);
                        info!(local = %local_name, peer = peer_id, "now connected");
                        accepted.push((peer_id, stream));
                    }
                    None => return Err(NetworkError::UnexpectedPeer(peer_id)),
                }
            }
            // Close the listener so the port is free for a later run.
            drop(listener);
            Ok::<_, NetworkError>(accepted)
        };

        let dial_all = try_join_all(dial_for.iter().map(|rp| {
            let local_id = local.id;
            async move {
                let mut last_err = None;
                for attempt in 0..CONNECT_ATTEMPTS {
                    if attempt > 0 {
                        tokio::time::sleep(CONNECT_ATTEMPTS_DELAY).await;
                    }
                    match TcpStream::connect(rp.addr.as_str()).await {
                        Ok(mut stream) => {
                            stream.write_u64(local_id).await?;
                            debug!(peer = rp.id, addr = %rp.addr, "dialed");
                            return Ok((rp.id, stream));
                        }
                        Err(e) => last_err = Some(e),
                    }
                }
                Err(NetworkError::Setup(format!(
                    "couldn't connect to {rp}: {:?}",
                    last_err
                )))
            }
        }));

        let (accepted, dialed) = tokio::try_join!(accept_all, dial_all)?;
        for (peer_id, stream) in accepted.into_iter().chain(dialed) {
            let sent = Arc::new(AtomicU64::new(0));
            let received = Arc::new(AtomicU64::new(0));
            let metered = MeteredStream::new(stream, sent.clone(), received.clone());
            self.links.insert(
                peer_id,
                Link {
                    stream: Some(metered),
                    sent,
                    received,
                },
            );
        }
        Ok(())
    }

    /// Hands the stream for `peer` to the caller (the framed I/O tasks).
    /// The byte counters stay behind so [`sum`](Self::sum) keeps working.
    pub fn take_stream(&mut self, peer: PartyId) -> Option<MeteredStream> {
        self.links.get_mut(&peer).and_then(|l| l.stream.take())
    }

    /// Total bytes written and read across all peer connections.
    pub fn sum(&self) -> (u64, u64) {
        let mut sent = 0;
        let mut received = 0;
        for link in self.links.values() {
            sent += link.sent.load(Ordering::Relaxed);
            received += link.received.load(Ordering::Relaxed);
        }
        (sent, received)
    }
}

fn listen_port(addr: &str) -> Result<u16, NetworkError> {
    addr.rsplit(':')
        .next()
        .and_then(|p| p.parse().ok())
        .ok_or_else(|| NetworkError::Setup(format!("address {addr} has no port")))
}
