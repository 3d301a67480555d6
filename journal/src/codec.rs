use crate::error::{CResult, Error};

/// Chunks may not exceed this many bytes including the header, so the kv
/// store's lexical byte ordering stays cheap to keep in memory per changeset.
pub const CHUNK_MAX: usize = 60 * 1024;

/// `serial_to: u32, chunk_count: u32, this_chunk_size: u32`, all big-endian.
pub const HEADER_LEN: usize = 12;

pub const CHUNK_PAYLOAD_MAX: usize = CHUNK_MAX - HEADER_LEN;

/// Big-endian `(serial_from, chunk_index)` so the store's lexical ordering
/// coincides with numeric `(serial_from, chunk_index)` ordering.
pub fn chunk_key(serial_from: u32, chunk_index: u32) -> Vec<u8> {
    let mut key = Vec::with_capacity(8);
    key.extend_from_slice(&serial_from.to_be_bytes());
    key.extend_from_slice(&chunk_index.to_be_bytes());
    key
}

pub fn decode_chunk_key(key: &[u8]) -> CResult<(u32, u32)> {
    if key.len() != 8 {
        return Err(Error::Malformed(format!("chunk key has {} bytes, expected 8", key.len())));
    }
    let mut serial_from = [0u8; 4];
    let mut chunk_index = [0u8; 4];
    serial_from.copy_from_slice(&key[0..4]);
    chunk_index.copy_from_slice(&key[4..8]);
    Ok((u32::from_be_bytes(serial_from), u32::from_be_bytes(chunk_index)))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkHeader {
    pub serial_to: u32,
    pub chunk_count: u32,
    pub this_chunk_size: u32,
}

impl ChunkHeader {
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[0..4].copy_from_slice(&self.serial_to.to_be_bytes());
        buf[4..8].copy_from_slice(&self.chunk_count.to_be_bytes());
        buf[8..12].copy_from_slice(&self.this_chunk_size.to_be_bytes());
        buf
    }

    /// Decodes the header prefix of a stored chunk value, returning the header
    /// and the remaining payload slice.
    pub fn decode(bytes: &[u8]) -> CResult<(ChunkHeader, &[u8])> {
        if bytes.len() < HEADER_LEN {
            return Err(Error::Malformed(format!(
                "chunk value has {} bytes, shorter than the {}-byte header",
                bytes.len(),
                HEADER_LEN
            )));
        }
        let mut serial_to = [0u8; 4];
        let mut chunk_count = [0u8; 4];
        let mut this_chunk_size = [0u8; 4];
        serial_to.copy_from_slice(&bytes[0..4]);
        chunk_count.copy_from_slice(&bytes[4..8]);
        this_chunk_size.copy_from_slice(&bytes[8..12]);

        let header = ChunkHeader {
            serial_to: u32::from_be_bytes(serial_to),
            chunk_count: u32::from_be_bytes(chunk_count),
            this_chunk_size: u32::from_be_bytes(this_chunk_size),
        };
        let payload_end = HEADER_LEN + header.this_chunk_size as usize;
        if payload_end > bytes.len() {
            return Err(Error::Malformed(format!(
                "chunk value claims a {}-byte payload but only {} bytes follow the header",
                header.this_chunk_size,
                bytes.len() - HEADER_LEN
            )));
        }
        let payload = &bytes[HEADER_LEN..payload_end];
        Ok((header, payload))
    }
}

/// Prepends the header to a payload, producing the bytes stored under a chunk key.
pub fn encode_chunk_value(header: &ChunkHeader, payload: &[u8]) -> Vec<u8> {
    let mut value = Vec::with_capacity(HEADER_LEN + payload.len());
    value.extend_from_slice(&header.encode());
    value.extend_from_slice(payload);
    value
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn chunk_key_roundtrip() {
        let key = chunk_key(42, 7);
        assert_eq!(decode_chunk_key(&key).unwrap(), (42, 7));
    }

    #[test]
    fn header_roundtrip() {
        let header = ChunkHeader { serial_to: 9, chunk_count: 3, this_chunk_size: 4 };
        let value = encode_chunk_value(&header, b"data");
        let (decoded, payload) = ChunkHeader::decode(&value).unwrap();
        assert_eq!(decoded, header);
        assert_eq!(payload, b"data");
    }

    #[test]
    fn short_value_is_malformed() {
        assert!(ChunkHeader::decode(&[0u8; 4]).is_err());
    }

    #[test]
    fn oversized_length_claim_is_malformed_not_a_panic() {
        let header = ChunkHeader { serial_to: 9, chunk_count: 1, this_chunk_size: 100 };
        let value = encode_chunk_value(&header, b"data");
        assert!(matches!(ChunkHeader::decode(&value), Err(Error::Malformed(_))));
    }
}
