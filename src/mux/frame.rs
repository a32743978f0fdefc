//! Low-level framing for [`super::MuxConnection`]'s wire protocol.
//!
//! `[u8 msg_type][u32 channel_id][u32 len][payload; len bytes]`, all integers big-endian. This is
//! the crate's own minimal relay/control protocol — not the general chat-channel multiplexer,
//! which is out of scope (spec §1).

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const MSG_DATA: u8 = 0;
pub const MSG_CHANNEL_OPEN: u8 = 1;
pub const MSG_PEER_STATUS_QUERY: u8 = 2;
pub const MSG_PEER_STATUS_ANSWER: u8 = 3;
pub const MSG_TUNNEL_OPEN_QUERY: u8 = 4;
pub const MSG_TUNNEL_OPEN_ANSWER: u8 = 5;

/// Payloads are capped well below anything a control message or a single relay write needs; this
/// just guards against a corrupt length prefix turning into an unbounded allocation.
const MAX_PAYLOAD_LEN: u32 = 1 << 20;

pub struct MuxFrame {
    pub msg_type: u8,
    pub channel_id: u32,
    pub payload: Vec<u8>,
}

impl MuxFrame {
    pub async fn write<W: AsyncWrite + Unpin>(&self, w: &mut W) -> std::io::Result<()> {
        w.write_u8(self.msg_type).await?;
        w.write_u32(self.channel_id).await?;
        w.write_u32(self.payload.len() as u32).await?;
        w.write_all(&self.payload).await
    }

    pub async fn read<R: AsyncRead + Unpin>(r: &mut R) -> std::io::Result<Self> {
        let msg_type = r.read_u8().await?;
        let channel_id = r.read_u32().await?;
        let len = r.read_u32().await?;
        if len > MAX_PAYLOAD_LEN {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "mux frame payload too large",
            ));
        }
        let mut payload = vec![0u8; len as usize];
        r.read_exact(&mut payload).await?;
        Ok(Self {
            msg_type,
            channel_id,
            payload,
        })
    }
}

/// Appends a big-endian `u32` request id, the convention every control message payload starts
/// with so answers can be correlated to queries.
pub fn push_request_id(out: &mut Vec<u8>, request_id: u32) {
    out.extend_from_slice(&request_id.to_be_bytes());
}

pub fn read_request_id(buf: &[u8]) -> Option<(u32, &[u8])> {
    if buf.len() < 4 {
        return None;
    }
    let id = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
    Some((id, &buf[4..]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn frame_round_trips() {
        let (mut a, mut b) = duplex(256);
        let frame = MuxFrame {
            msg_type: MSG_DATA,
            channel_id: 7,
            payload: vec![1, 2, 3, 4],
        };
        frame.write(&mut a).await.unwrap();
        let read = MuxFrame::read(&mut b).await.unwrap();
        assert_eq!(read.msg_type, MSG_DATA);
        assert_eq!(read.channel_id, 7);
        assert_eq!(read.payload, vec![1, 2, 3, 4]);
    }

    #[test]
    fn request_id_round_trips() {
        let mut buf = Vec::new();
        push_request_id(&mut buf, 0xdead_beef);
        buf.extend_from_slice(b"rest");
        let (id, rest) = read_request_id(&buf).unwrap();
        assert_eq!(id, 0xdead_beef);
        assert_eq!(rest, b"rest");
    }
}
