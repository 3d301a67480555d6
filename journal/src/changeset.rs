use crate::error::CResult;

/// External serialize/deserialize/merge contract the journal treats as opaque.
/// Implementations are stateless: every method is an associated function so a
/// `Journal<C>` never has to own a codec instance.
pub trait ChangesetCodec {
    type Changeset: Clone;

    fn serial_from(ch: &Self::Changeset) -> u32;
    fn serial_to(ch: &Self::Changeset) -> u32;
    fn serialized_size(ch: &Self::Changeset) -> usize;

    /// Splits `ch` into chunks of at most `chunk_capacity` payload bytes,
    /// producing no more than `max_chunks` of them.
    fn serialize_chunks(
        ch: &Self::Changeset,
        chunk_capacity: usize,
        max_chunks: usize,
    ) -> CResult<Vec<Vec<u8>>>;

    fn deserialize_chunks(chunks: &[Vec<u8>]) -> CResult<Self::Changeset>;

    /// Folds `other` into `acc`. Whether a removal that cancels a prior
    /// addition removes both, or some other reconciliation rule applies, is
    /// entirely up to the implementation — the journal only orders the calls.
    fn merge(acc: &mut Self::Changeset, other: &Self::Changeset) -> CResult<()>;
}

/// A minimal changeset used by tests: an ordered list of `(is_add, rr)` pairs
/// plus the SOA serial pair. Not meant to model real DNS wire format, only to
/// exercise chunking, merge, and round-trip behavior without a DNS library.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FakeChangeset {
    pub serial_from: u32,
    pub serial_to: u32,
    pub records: Vec<(bool, String)>,
}

impl FakeChangeset {
    pub fn new(serial_from: u32, serial_to: u32, records: Vec<(bool, String)>) -> Self {
        Self { serial_from, serial_to, records }
    }
}

fn encode(ch: &FakeChangeset) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&ch.serial_from.to_be_bytes());
    out.extend_from_slice(&ch.serial_to.to_be_bytes());
    out.extend_from_slice(&(ch.records.len() as u32).to_be_bytes());
    for (is_add, rr) in &ch.records {
        out.push(*is_add as u8);
        let bytes = rr.as_bytes();
        out.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
        out.extend_from_slice(bytes);
    }
    out
}

fn decode(bytes: &[u8]) -> CResult<FakeChangeset> {
    use crate::error::Error;

    let need = |n: usize, have: usize| -> CResult<()> {
        if have < n {
            Err(Error::Malformed("truncated fake changeset".into()))
        } else {
            Ok(())
        }
    };

    need(12, bytes.len())?;
    let serial_from = u32::from_be_bytes(bytes[0..4].try_into().unwrap());
    let serial_to = u32::from_be_bytes(bytes[4..8].try_into().unwrap());
    let count = u32::from_be_bytes(bytes[8..12].try_into().unwrap());

    let mut pos = 12;
    let mut records = Vec::with_capacity(count as usize);
    for _ in 0..count {
        need(pos + 5, bytes.len())?;
        let is_add = bytes[pos] != 0;
        let len = u32::from_be_bytes(bytes[pos + 1..pos + 5].try_into().unwrap()) as usize;
        pos += 5;
        need(pos + len, bytes.len())?;
        let rr = String::from_utf8(bytes[pos..pos + len].to_vec())
            .map_err(|_| Error::Malformed("non-utf8 rr in fake changeset".into()))?;
        pos += len;
        records.push((is_add, rr));
    }

    Ok(FakeChangeset { serial_from, serial_to, records })
}

pub struct FakeCodec;

impl ChangesetCodec for FakeCodec {
    type Changeset = FakeChangeset;

    fn serial_from(ch: &FakeChangeset) -> u32 {
        ch.serial_from
    }

    fn serial_to(ch: &FakeChangeset) -> u32 {
        ch.serial_to
    }

    fn serialized_size(ch: &FakeChangeset) -> usize {
        encode(ch).len()
    }

    fn serialize_chunks(
        ch: &FakeChangeset,
        chunk_capacity: usize,
        max_chunks: usize,
    ) -> CResult<Vec<Vec<u8>>> {
        let bytes = encode(ch);
        if bytes.is_empty() {
            return Ok(vec![Vec::new()]);
        }
        let chunks: Vec<Vec<u8>> = bytes.chunks(chunk_capacity.max(1)).map(|c| c.to_vec()).collect();
        if chunks.len() > max_chunks {
            return Err(crate::error::Error::NoSpace);
        }
        Ok(chunks)
    }

    fn deserialize_chunks(chunks: &[Vec<u8>]) -> CResult<FakeChangeset> {
        let mut bytes = Vec::new();
        for chunk in chunks {
            bytes.extend_from_slice(chunk);
        }
        decode(&bytes)
    }

    fn merge(acc: &mut FakeChangeset, other: &FakeChangeset) -> CResult<()> {
        acc.serial_to = other.serial_to;
        for rec in &other.records {
            if let Some(pos) = acc.records.iter().position(|r| r.1 == rec.1 && r.0 != rec.0) {
                acc.records.remove(pos);
            } else {
                acc.records.push(rec.clone());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn roundtrip_single_chunk() {
        let ch = FakeChangeset::new(1, 2, vec![(true, "a.example.".into()), (false, "b.example.".into())]);
        let chunks = FakeCodec::serialize_chunks(&ch, 4096, 16).unwrap();
        assert_eq!(chunks.len(), 1);
        let back = FakeCodec::deserialize_chunks(&chunks).unwrap();
        assert_eq!(back, ch);
    }

    #[test]
    fn roundtrip_many_chunks() {
        let records: Vec<_> = (0..500).map(|i| (i % 2 == 0, format!("host{i}.example."))).collect();
        let ch = FakeChangeset::new(10, 11, records);
        let size = FakeCodec::serialized_size(&ch);
        let chunks = FakeCodec::serialize_chunks(&ch, 64, size).unwrap();
        assert!(chunks.len() > 1);
        let back = FakeCodec::deserialize_chunks(&chunks).unwrap();
        assert_eq!(back, ch);
    }

    #[test]
    fn merge_cancels_opposite_record() {
        let mut acc = FakeChangeset::new(0, 1, vec![(true, "x.".into())]);
        let other = FakeChangeset::new(1, 2, vec![(false, "x.".into()), (true, "y.".into())]);
        FakeCodec::merge(&mut acc, &other).unwrap();
        assert_eq!(acc.serial_to, 2);
        assert_eq!(acc.records, vec![(true, "y.".to_string())]);
    }
}
