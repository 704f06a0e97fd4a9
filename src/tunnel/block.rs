//! Block encoding/decoding for the tunnel protocol
//!
//! Block format (all integers big-endian):
//! ```text
//! +--------------------------------------------------+
//! |                 Stream ID (16B)                  |
//! +--------+-----------------------------------------+
//! |  Type  |       Sequence Number (4B)              |
//! +--------+-----------------------------------------+
//! |       Body Checksum (4B, CRC32 of payload)       |
//! +--------------------------------------------------+
//! |             Payload Length (4B)                  |
//! +--------------------------------------------------+
//! |   Header Checksum (4B, CRC32 of bytes 0..29)     |
//! +--------------------------------------------------+
//! |                    Payload                       |
//! +--------------------------------------------------+
//! ```
//!
//! The payload checksum covers the bytes as they travel on the wire, i.e.
//! after encryption, so transport corruption is told apart from a failed
//! decryption.

use super::TunnelError;
use crate::protocol::{ProtocolError, MAX_PAYLOAD_SIZE};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// 128-bit logical stream identifier; `0` addresses the tunnel itself
pub type StreamId = u128;

/// Stream id reserved for tunnel-control blocks
pub const CONTROL_STREAM: StreamId = 0;

/// Header size in bytes
pub const HEADER_SIZE: usize = 33;

/// Offset of the body checksum field
pub const BODY_CHECKSUM_OFFSET: usize = 21;

/// Offset of the header checksum; the checksum covers every byte before it
pub const HEADER_CHECKSUM_OFFSET: usize = 29;

const TYPE_OFFSET: usize = 16;
const SEQUENCE_OFFSET: usize = 17;
const LENGTH_OFFSET: usize = 25;

/// Block types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum BlockType {
    /// Challenge exchange
    HandShake = 0x01,
    /// Password material, ends the standard handshake
    HandShakeResponse = 0x02,
    /// Open a logical stream
    Connect = 0x03,
    /// Stream opened on the relay
    Connected = 0x04,
    /// Stream payload
    Data = 0x05,
    /// Batched stream teardown (stream id 0)
    Disconnect = 0x06,
    /// Handshake and first CONNECT in one round trip
    FastConnect = 0x07,
    /// Relay could not open the stream
    ConnectFailed = 0x08,
    /// Locally marked: body failed its checksum or could not be decrypted
    Invalid = 0xFF,
}

impl TryFrom<u8> for BlockType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(BlockType::HandShake),
            0x02 => Ok(BlockType::HandShakeResponse),
            0x03 => Ok(BlockType::Connect),
            0x04 => Ok(BlockType::Connected),
            0x05 => Ok(BlockType::Data),
            0x06 => Ok(BlockType::Disconnect),
            0x07 => Ok(BlockType::FastConnect),
            0x08 => Ok(BlockType::ConnectFailed),
            0xFF => Ok(BlockType::Invalid),
            _ => Err(ProtocolError::InvalidBlockType(value)),
        }
    }
}

/// A protocol block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    /// Logical stream this block belongs to
    pub stream_id: StreamId,
    /// Block type
    pub block_type: BlockType,
    /// Per-stream, per-direction sequence number
    pub sequence: u32,
    /// CRC32 of the wire payload (filled by `encode`, checked by `verify_body`)
    pub body_checksum: u32,
    /// Declared payload length; must match `payload.len()` when encoding
    pub length: u32,
    /// Payload data
    pub payload: Bytes,
}

impl Block {
    /// Create a block whose declared length matches its payload
    pub fn new(stream_id: StreamId, block_type: BlockType, payload: Bytes) -> Self {
        Self {
            stream_id,
            block_type,
            sequence: 0,
            body_checksum: 0,
            length: payload.len() as u32,
            payload,
        }
    }

    /// Create a data block
    pub fn data(stream_id: StreamId, payload: Bytes) -> Self {
        Self::new(stream_id, BlockType::Data, payload)
    }

    /// Create a connect block
    pub fn connect(stream_id: StreamId, request: Bytes) -> Self {
        Self::new(stream_id, BlockType::Connect, request)
    }

    /// Create a connected acknowledgement
    pub fn connected(stream_id: StreamId) -> Self {
        Self::new(stream_id, BlockType::Connected, Bytes::new())
    }

    /// Create a connect failure notice
    pub fn connect_failed(stream_id: StreamId) -> Self {
        Self::new(stream_id, BlockType::ConnectFailed, Bytes::new())
    }

    /// Create a batched disconnect on the control stream
    pub fn disconnect(ids: &[StreamId]) -> Self {
        let mut payload = BytesMut::with_capacity(ids.len() * 16);
        for id in ids {
            payload.put_u128(*id);
        }
        Self::new(CONTROL_STREAM, BlockType::Disconnect, payload.freeze())
    }

    /// Set the sequence number
    pub fn with_sequence(mut self, sequence: u32) -> Self {
        self.sequence = sequence;
        self
    }

    /// Replace the payload and keep the declared length in sync
    pub fn set_payload(&mut self, payload: Bytes) {
        self.length = payload.len() as u32;
        self.payload = payload;
    }

    /// Whether the block was marked invalid on receipt
    pub fn is_invalid(&self) -> bool {
        self.block_type == BlockType::Invalid
    }

    /// Drop the payload and mark the block invalid
    pub fn mark_invalid(&mut self) {
        self.block_type = BlockType::Invalid;
        self.set_payload(Bytes::new());
    }

    /// Parse the stream ids out of a DISCONNECT payload
    pub fn disconnect_ids(&self) -> Result<Vec<StreamId>, ProtocolError> {
        if self.payload.len() % 16 != 0 {
            return Err(ProtocolError::MalformedPayload(format!(
                "disconnect payload of {} bytes",
                self.payload.len()
            )));
        }
        let mut buf = self.payload.clone();
        let mut ids = Vec::with_capacity(buf.len() / 16);
        while buf.has_remaining() {
            ids.push(buf.get_u128());
        }
        Ok(ids)
    }

    /// Serialize the 33-byte header, computing both checksums
    pub fn encode_header(&self) -> Result<[u8; HEADER_SIZE], TunnelError> {
        if self.length as usize != self.payload.len() {
            return Err(ProtocolError::LengthMismatch {
                declared: self.length,
                actual: self.payload.len(),
            }
            .into());
        }
        if self.payload.len() > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::PayloadTooLarge(self.payload.len()).into());
        }

        let mut header = [0u8; HEADER_SIZE];
        header[..TYPE_OFFSET].copy_from_slice(&self.stream_id.to_be_bytes());
        header[TYPE_OFFSET] = self.block_type as u8;
        header[SEQUENCE_OFFSET..BODY_CHECKSUM_OFFSET].copy_from_slice(&self.sequence.to_be_bytes());
        header[BODY_CHECKSUM_OFFSET..LENGTH_OFFSET]
            .copy_from_slice(&crc32fast::hash(&self.payload).to_be_bytes());
        header[LENGTH_OFFSET..HEADER_CHECKSUM_OFFSET].copy_from_slice(&self.length.to_be_bytes());

        let header_checksum = crc32fast::hash(&header[..HEADER_CHECKSUM_OFFSET]);
        header[HEADER_CHECKSUM_OFFSET..].copy_from_slice(&header_checksum.to_be_bytes());

        Ok(header)
    }

    /// Encode block to bytes; refuses blocks whose declared length disagrees with the payload
    pub fn encode(&self) -> Result<BytesMut, TunnelError> {
        let header = self.encode_header()?;

        let mut buf = BytesMut::with_capacity(HEADER_SIZE + self.payload.len());
        buf.put_slice(&header);
        buf.put_slice(&self.payload);
        Ok(buf)
    }

    /// Decode a header into a block without payload
    ///
    /// A checksum mismatch means the byte stream is desynchronized; callers
    /// must treat the whole connection as corrupted.
    pub fn decode_header(header: &[u8; HEADER_SIZE]) -> Result<Self, ProtocolError> {
        let expected = u32::from_be_bytes(read_4(header, HEADER_CHECKSUM_OFFSET));
        let actual = crc32fast::hash(&header[..HEADER_CHECKSUM_OFFSET]);
        if expected != actual {
            return Err(ProtocolError::HeaderChecksum { expected, actual });
        }

        let mut stream_id = [0u8; 16];
        stream_id.copy_from_slice(&header[..TYPE_OFFSET]);

        let length = u32::from_be_bytes(read_4(header, LENGTH_OFFSET));
        if length as usize > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::PayloadTooLarge(length as usize));
        }

        Ok(Self {
            stream_id: u128::from_be_bytes(stream_id),
            block_type: BlockType::try_from(header[TYPE_OFFSET])?,
            sequence: u32::from_be_bytes(read_4(header, SEQUENCE_OFFSET)),
            body_checksum: u32::from_be_bytes(read_4(header, BODY_CHECKSUM_OFFSET)),
            length,
            payload: Bytes::new(),
        })
    }

    /// Check the received payload against the header's body checksum
    pub fn verify_body(&self) -> bool {
        self.payload.len() == self.length as usize
            && crc32fast::hash(&self.payload) == self.body_checksum
    }

    /// Decode a full block from a buffer
    ///
    /// Returns `Ok(None)` until a whole block is buffered. A payload that
    /// fails its checksum yields an `Invalid` block rather than an error.
    pub fn decode(buf: &mut BytesMut) -> Result<Option<Self>, ProtocolError> {
        if buf.len() < HEADER_SIZE {
            return Ok(None);
        }

        let mut header = [0u8; HEADER_SIZE];
        header.copy_from_slice(&buf[..HEADER_SIZE]);
        let mut block = Self::decode_header(&header)?;

        if buf.len() < HEADER_SIZE + block.length as usize {
            return Ok(None);
        }

        buf.advance(HEADER_SIZE);
        block.payload = buf.split_to(block.length as usize).freeze();

        if !block.verify_body() {
            block.mark_invalid();
        }

        Ok(Some(block))
    }

    /// Get the total encoded size of this block
    pub fn encoded_size(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }
}

fn read_4(header: &[u8; HEADER_SIZE], offset: usize) -> [u8; 4] {
    let mut out = [0u8; 4];
    out.copy_from_slice(&header[offset..offset + 4]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Block {
        Block::data(0x0123_4567_89ab_cdef_0011_2233_4455_6677, Bytes::from_static(b"Hello, World!"))
            .with_sequence(7)
    }

    #[test]
    fn test_block_encode_decode() {
        let original = sample();
        let mut encoded = original.encode().unwrap();
        assert_eq!(encoded.len(), original.encoded_size());

        let decoded = Block::decode(&mut encoded).unwrap().unwrap();

        assert_eq!(decoded.stream_id, original.stream_id);
        assert_eq!(decoded.block_type, BlockType::Data);
        assert_eq!(decoded.sequence, 7);
        assert_eq!(decoded.length, original.length);
        assert_eq!(decoded.payload, original.payload);
        assert_eq!(decoded.body_checksum, crc32fast::hash(b"Hello, World!"));
        assert!(encoded.is_empty());
    }

    #[test]
    fn test_length_mismatch_rejected() {
        let mut block = sample();
        block.length += 1;
        assert!(matches!(
            block.encode(),
            Err(TunnelError::Protocol(ProtocolError::LengthMismatch { .. }))
        ));

        block.set_payload(Bytes::from_static(b"resynced"));
        assert!(block.encode().is_ok());
    }

    #[test]
    fn test_header_corruption_detected() {
        let encoded = sample().encode().unwrap();

        for i in 0..HEADER_SIZE {
            let mut header = [0u8; HEADER_SIZE];
            header.copy_from_slice(&encoded[..HEADER_SIZE]);
            header[i] ^= 0x5A;
            assert!(
                Block::decode_header(&header).is_err(),
                "flipping header byte {} went unnoticed",
                i
            );
        }
    }

    #[test]
    fn test_body_corruption_marks_invalid() {
        let encoded = sample().encode().unwrap();

        for i in HEADER_SIZE..encoded.len() {
            let mut corrupted = encoded.clone();
            corrupted[i] ^= 0x01;

            let mut header = [0u8; HEADER_SIZE];
            header.copy_from_slice(&corrupted[..HEADER_SIZE]);
            let mut block = Block::decode_header(&header).expect("header untouched");
            block.payload = Bytes::copy_from_slice(&corrupted[HEADER_SIZE..]);
            assert!(!block.verify_body());

            let decoded = Block::decode(&mut corrupted).unwrap().unwrap();
            assert!(decoded.is_invalid());
            assert!(decoded.payload.is_empty());
        }
    }

    #[test]
    fn test_partial_buffer_waits() {
        let encoded = sample().encode().unwrap();
        let mut partial = BytesMut::from(&encoded[..encoded.len() - 1]);
        assert!(Block::decode(&mut partial).unwrap().is_none());

        let mut header_only = BytesMut::from(&encoded[..HEADER_SIZE - 1]);
        assert!(Block::decode(&mut header_only).unwrap().is_none());
    }

    #[test]
    fn test_disconnect_ids() {
        let ids = [1u128, u128::MAX, 42];
        let block = Block::disconnect(&ids);
        assert_eq!(block.stream_id, CONTROL_STREAM);
        assert_eq!(block.length as usize, 48);
        assert_eq!(block.disconnect_ids().unwrap(), ids);

        let mut broken = block.clone();
        broken.set_payload(Bytes::from_static(b"short"));
        assert!(broken.disconnect_ids().is_err());
    }

    #[test]
    fn test_unknown_type_rejected() {
        let mut header = sample().encode_header().unwrap();
        header[TYPE_OFFSET] = 0x42;
        let checksum = crc32fast::hash(&header[..HEADER_CHECKSUM_OFFSET]);
        header[HEADER_CHECKSUM_OFFSET..].copy_from_slice(&checksum.to_be_bytes());

        assert!(matches!(
            Block::decode_header(&header),
            Err(ProtocolError::InvalidBlockType(0x42))
        ));
    }
}
