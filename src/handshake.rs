//! Two-party handshake wire format (spec §4.2).
//!
//! Wire frame (23 bytes, all integers little-endian):
//! `[version: u8][service_port: u16][peer_id: 20 bytes]`
//!
//! Both sides run the same frame exchange — write our frame, then read theirs — followed by one
//! outcome byte written by whichever side decides admission last to reach it (in practice, both
//! sides decide independently against their own registry and each writes its own byte; see
//! `acceptor.rs` and `connector.rs` for how the two decisions are reconciled).

use crate::constants::{HANDSHAKE_FRAME_LEN, PEER_ID_LEN, PROTOCOL_VERSION};
use crate::error::HandshakeError;
use crate::peer_id::PeerId;
use std::future::Future;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const OUTCOME_ADMITTED: u8 = 0x00;
pub const OUTCOME_REJECTED: u8 = 0x01;

/// Parsed/encoded handshake frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandshakeFrame {
    pub version: u8,
    pub service_port: u16,
    pub peer_id: PeerId,
}

impl HandshakeFrame {
    pub fn encode(&self) -> [u8; HANDSHAKE_FRAME_LEN] {
        let mut buf = [0u8; HANDSHAKE_FRAME_LEN];
        buf[0] = self.version;
        buf[1..3].copy_from_slice(&self.service_port.to_le_bytes());
        buf[3..3 + PEER_ID_LEN].copy_from_slice(self.peer_id.as_bytes());
        buf
    }

    pub fn decode(buf: &[u8; HANDSHAKE_FRAME_LEN]) -> Self {
        let version = buf[0];
        let service_port = u16::from_le_bytes([buf[1], buf[2]]);
        let mut id = [0u8; PEER_ID_LEN];
        id.copy_from_slice(&buf[3..3 + PEER_ID_LEN]);
        Self {
            version,
            service_port,
            peer_id: PeerId::from_bytes(id),
        }
    }
}

async fn write_frame<S: AsyncWrite + Unpin>(
    stream: &mut S,
    frame: &HandshakeFrame,
) -> std::io::Result<()> {
    stream.write_all(&frame.encode()).await
}

async fn read_frame<S: AsyncRead + Unpin>(stream: &mut S) -> std::io::Result<HandshakeFrame> {
    let mut buf = [0u8; HANDSHAKE_FRAME_LEN];
    stream.read_exact(&mut buf).await?;
    Ok(HandshakeFrame::decode(&buf))
}

/// Writes our frame and reads the peer's, checking protocol versions match (spec §4.2 steps 1-2).
/// Symmetric: used by both the acceptor and the initiator.
pub async fn exchange_frames<S>(
    stream: &mut S,
    local_service_port: u16,
    local_peer_id: PeerId,
) -> Result<HandshakeFrame, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    write_frame(
        stream,
        &HandshakeFrame {
            version: PROTOCOL_VERSION,
            service_port: local_service_port,
            peer_id: local_peer_id,
        },
    )
    .await?;

    let remote_frame = read_frame(stream).await?;
    if remote_frame.version != PROTOCOL_VERSION {
        return Err(HandshakeError::ProtocolVersionMismatch(
            remote_frame.version,
            PROTOCOL_VERSION,
        ));
    }

    Ok(remote_frame)
}

/// Writes the final one-byte admission outcome. Must run on the raw stream *before* any disposal,
/// since disposing the connection may close the socket (spec §4.2 step 3).
pub async fn write_outcome<S: AsyncWrite + Unpin>(
    stream: &mut S,
    admitted: bool,
) -> std::io::Result<()> {
    let byte = if admitted {
        OUTCOME_ADMITTED
    } else {
        OUTCOME_REJECTED
    };
    stream.write_all(&[byte]).await
}

/// Reads the final one-byte admission outcome written by the peer.
pub async fn read_outcome<S: AsyncRead + Unpin>(stream: &mut S) -> Result<(), HandshakeError> {
    let mut buf = [0u8; 1];
    stream.read_exact(&mut buf).await?;
    if buf[0] != OUTCOME_ADMITTED {
        return Err(HandshakeError::Rejected);
    }
    Ok(())
}

/// Bounds any handshake I/O future with one of the mandatory socket timeouts (spec §4.3, §5: 30 s
/// send / 90 s receive), so a peer that connects and then goes silent can't pin a spawned accept
/// task open forever.
pub async fn with_timeout<T, E>(
    duration: Duration,
    fut: impl Future<Output = Result<T, E>>,
) -> Result<T, E>
where
    E: From<std::io::Error>,
{
    match tokio::time::timeout(duration, fut).await {
        Ok(result) => result,
        Err(_) => Err(E::from(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            "timed out waiting for peer",
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    fn pid() -> PeerId {
        PeerId::random()
    }

    #[test]
    fn frame_round_trips_through_bytes() {
        let frame = HandshakeFrame {
            version: PROTOCOL_VERSION,
            service_port: 54321,
            peer_id: pid(),
        };
        assert_eq!(HandshakeFrame::decode(&frame.encode()), frame);
    }

    #[tokio::test]
    async fn exchange_frames_succeeds_both_sides_matching_version() {
        let (mut a, mut b) = duplex(256);
        let a_id = pid();
        let b_id = pid();

        let (a_res, b_res) = tokio::join!(
            exchange_frames(&mut a, 1000, a_id),
            exchange_frames(&mut b, 2000, b_id)
        );

        let a_frame = a_res.unwrap();
        let b_frame = b_res.unwrap();
        assert_eq!(a_frame.peer_id, b_id);
        assert_eq!(a_frame.service_port, 2000);
        assert_eq!(b_frame.peer_id, a_id);
        assert_eq!(b_frame.service_port, 1000);
    }

    #[tokio::test]
    async fn outcome_round_trips() {
        let (mut a, mut b) = duplex(16);
        write_outcome(&mut a, true).await.unwrap();
        assert!(read_outcome(&mut b).await.is_ok());

        let (mut a, mut b) = duplex(16);
        write_outcome(&mut a, false).await.unwrap();
        assert!(matches!(
            read_outcome(&mut b).await,
            Err(HandshakeError::Rejected)
        ));
    }
}
