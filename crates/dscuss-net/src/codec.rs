//! Packet framing.
//!
//! Packets travel back to back with no length prefix; a frame ends where
//! the JSON object ends. The decoder never buffers more than the maximum
//! packet size while waiting for a frame to complete.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use dscuss_shared::constants::MAX_PACKET_SIZE;
use dscuss_shared::Packet;

use crate::error::NetError;

#[derive(Debug, Clone, Copy)]
pub struct PacketCodec {
    max_size: usize,
}

impl PacketCodec {
    pub fn new() -> Self {
        Self::with_max_size(MAX_PACKET_SIZE)
    }

    pub fn with_max_size(max_size: usize) -> Self {
        Self { max_size }
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }
}

impl Default for PacketCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for PacketCodec {
    type Item = Packet;
    type Error = NetError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Packet>, NetError> {
        let skip = src
            .iter()
            .position(|b| !b.is_ascii_whitespace())
            .unwrap_or(src.len());
        src.advance(skip);
        if src.is_empty() {
            return Ok(None);
        }

        let mut stream = serde_json::Deserializer::from_slice(&src[..]).into_iter::<Packet>();
        match stream.next() {
            Some(Ok(packet)) => {
                let used = stream.byte_offset();
                if used > self.max_size {
                    return Err(NetError::PacketSizeExceeded {
                        size: used,
                        max: self.max_size,
                    });
                }
                src.advance(used);
                Ok(Some(packet))
            }
            Some(Err(e)) if e.is_eof() => {
                if src.len() > self.max_size {
                    return Err(NetError::PacketSizeExceeded {
                        size: src.len(),
                        max: self.max_size,
                    });
                }
                Ok(None)
            }
            Some(Err(e)) => Err(NetError::MalformedPayload(e.to_string())),
            None => Ok(None),
        }
    }
}

impl Encoder<Packet> for PacketCodec {
    type Error = NetError;

    fn encode(&mut self, packet: Packet, dst: &mut BytesMut) -> Result<(), NetError> {
        let bytes = packet.to_bytes()?;
        if bytes.len() > self.max_size {
            return Err(NetError::PacketSizeExceeded {
                size: bytes.len(),
                max: self.max_size,
            });
        }
        dst.reserve(bytes.len());
        dst.put_slice(&bytes);
        Ok(())
    }
}
