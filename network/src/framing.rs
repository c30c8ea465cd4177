//! Wire framing for the protocol messages.
//!
//! All integers on the wire are big-endian. Two frame layouts exist:
//!
//! - tree protocols (relinearization key generation, MHE triple
//!   generation): `u64 sender | u64 data_len | data | u64 round`;
//! - the pairwise HE triple protocol: `u64 sender | ciphertext bytes
//!   (fixed length per run) | u8 is_query`.
//!
//! A connection closed cleanly between frames decodes to `None`; an EOF in
//! the middle of a frame is an I/O failure.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{NetworkError, PartyId};

/// A message of one of the tree-structured protocols. `data` is an opaque
/// payload (a serialized share, ciphertext pair or seed) and `round` tags
/// the protocol phase it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeMessage {
    pub sender: PartyId,
    pub data: Vec<u8>,
    pub round: u64,
}

/// A message of the pairwise HE protocol: a single ciphertext that is
/// either a query (an encryption of the sender's `a` share) or a response
/// (the masked homomorphic product).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairMessage {
    pub sender: PartyId,
    pub ciphertext: Vec<u8>,
    pub is_query: bool,
}

pub async fn write_tree_message<W>(w: &mut W, m: &TreeMessage) -> Result<(), NetworkError>
where
    W: AsyncWrite + Unpin,
{
    w.write_u64(m.sender).await?;
    w.write_u64(m.data.len() as u64).await?;
    w.write_all(&m.data).await?;
    w.write_u64(m.round).await?;
    w.flush().await?;
    Ok(())
}

/// Reads one tree frame. Returns `None` if the connection was closed
/// before the first header byte.
pub async fn read_tree_message<R>(r: &mut R) -> Result<Option<TreeMessage>, NetworkError>
where
    R: AsyncRead + Unpin,
{
    let sender = match r.read_u64().await {
        Ok(v) => v,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let data_len = r.read_u64().await?;
    let mut data = vec![0u8; data_len as usize];
    r.read_exact(&mut data).await?;
    let round = r.read_u64().await?;
    Ok(Some(TreeMessage {
        sender,
        data,
        round,
    }))
}

pub async fn write_pair_message<W>(w: &mut W, m: &PairMessage) -> Result<(), NetworkError>
where
    W: AsyncWrite + Unpin,
{
    w.write_u64(m.sender).await?;
    w.write_all(&m.ciphertext).await?;
    w.write_u8(m.is_query as u8).await?;
    w.flush().await?;
    Ok(())
}

/// Reads one pairwise frame carrying exactly `ciphertext_len` ciphertext
/// bytes. Returns `None` if the connection was closed before the first
/// header byte.
pub async fn read_pair_message<R>(
    r: &mut R,
    ciphertext_len: usize,
) -> Result<Option<PairMessage>, NetworkError>
where
    R: AsyncRead + Unpin,
{
    let sender = match r.read_u64().await {
        Ok(v) => v,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let mut ciphertext = vec![0u8; ciphertext_len];
    r.read_exact(&mut ciphertext).await?;
    let is_query = r.read_u8().await? != 0;
    Ok(Some(PairMessage {
        sender,
        ciphertext,
        is_query,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn tree_frame_byte_layout() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let m = TreeMessage {
            sender: 42,
            data: vec![0xDE, 0xAD],
            round: 3,
        };
        write_tree_message(&mut a, &m).await.unwrap();
        drop(a);

        let mut wire = Vec::new();
        b.read_to_end(&mut wire).await.unwrap();
        assert_eq!(
            wire,
            vec![
                0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x2A, // sender
                0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x02, // data_len
                0xDE, 0xAD, // data
                0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x03, // round
            ]
        );
    }

    #[tokio::test]
    async fn tree_frame_round_trips() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let m = TreeMessage {
            sender: 7,
            data: (0..200u8).collect(),
            round: 2,
        };
        write_tree_message(&mut a, &m).await.unwrap();
        let got = read_tree_message(&mut b).await.unwrap().unwrap();
        assert_eq!(got, m);
    }

    #[tokio::test]
    async fn pair_frame_round_trips() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let m = PairMessage {
            sender: 1,
            ciphertext: vec![9u8; 64],
            is_query: true,
        };
        write_pair_message(&mut a, &m).await.unwrap();
        let got = read_pair_message(&mut b, 64).await.unwrap().unwrap();
        assert_eq!(got, m);
    }

    #[tokio::test]
    async fn clean_close_reads_as_none() {
        let (a, mut b) = tokio::io::duplex(1024);
        drop(a);
        assert!(read_tree_message(&mut b).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn eof_mid_frame_is_an_error() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        // A header announcing 8 payload bytes, then only 2 of them.
        a.write_u64(4).await.unwrap();
        a.write_u64(8).await.unwrap();
        a.write_all(&[1, 2]).await.unwrap();
        drop(a);
        assert!(matches!(
            read_tree_message(&mut b).await,
            Err(NetworkError::Io(_))
        ));
    }
}
