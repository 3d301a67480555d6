use kv::store::{Db, Iter as KvIter};

use crate::codec::{self, ChunkHeader};
use crate::error::{CResult, Error};
use crate::txn::JournalTxn;

/// One chunk visited by a [`ChunkWalk`].
#[derive(Debug, Clone)]
pub struct ChunkItem {
    pub serial: u32,
    pub serial_to: u32,
    pub chunk_index: u32,
    pub chunk_count: u32,
    pub payload: Vec<u8>,
}

/// Walks chunks across `[first_serial, last_serial]` inclusive, in strict
/// `(serial, chunk_index)` order, following the chain of expected next keys
/// rather than a blind key-range scan — matching how a changeset's chunks
/// link to the next changeset's first chunk via its header's `serial_to`.
///
/// Each call to [`ChunkWalk::next_chunk`] emits the chunk the cursor is
/// already sitting on, then advances: first optimistically (plain `next()`
/// on the kv iterator), falling back to an explicit `seek` if that lands on
/// the wrong key. A failed advance is reported on the *following* call, so
/// the chunk that was already read is never lost.
pub struct ChunkWalk {
    db: Db,
    kv_iter: KvIter,
    current: Option<(Vec<u8>, (u64, u32))>,
    last_serial: u32,
    pending_error: Option<Error>,
    done: bool,
}

impl ChunkWalk {
    /// Walks `Db::Data`, the common case (changeset load, reclamation, continuity checks).
    pub fn new(txn: &mut JournalTxn, first_serial: u32, last_serial: u32) -> CResult<Self> {
        Self::new_in(txn, Db::Data, first_serial, last_serial)
    }

    /// Walks an explicit sub-database; used to reclaim the single merged changeset,
    /// which lives in `Db::Merged` under the same chunk-key scheme.
    pub fn new_in(txn: &mut JournalTxn, db: Db, first_serial: u32, last_serial: u32) -> CResult<Self> {
        let start_key = codec::chunk_key(first_serial, 0);
        let mut kv_iter = txn.iter(db, &start_key)?;
        let current = match kv_iter.next() {
            Some((k, pos_len)) if k == start_key => Some((k, pos_len)),
            _ => return Err(Error::NotFound),
        };
        Ok(Self { db, kv_iter, current, last_serial, pending_error: None, done: false })
    }

    pub fn next_chunk(&mut self, txn: &mut JournalTxn) -> CResult<Option<ChunkItem>> {
        if let Some(err) = self.pending_error.take() {
            self.done = true;
            return Err(err);
        }
        if self.done {
            return Ok(None);
        }

        let (key, (pos, len)) = match self.current.take() {
            Some(c) => c,
            None => {
                self.done = true;
                return Ok(None);
            }
        };

        let (serial, chunk_index) = codec::decode_chunk_key(&key)?;
        let value = txn.read_at(pos, len)?;
        let (header, payload) = ChunkHeader::decode(&value)?;

        let item = ChunkItem {
            serial,
            serial_to: header.serial_to,
            chunk_index,
            chunk_count: header.chunk_count,
            payload: payload.to_vec(),
        };

        if chunk_index + 1 == header.chunk_count && serial == self.last_serial {
            self.done = true;
            return Ok(Some(item));
        }

        let expected = if chunk_index + 1 == header.chunk_count {
            codec::chunk_key(header.serial_to, 0)
        } else {
            codec::chunk_key(serial, chunk_index + 1)
        };

        match self.kv_iter.next() {
            Some((k, pos_len)) if k == expected => self.current = Some((k, pos_len)),
            _ => {
                self.kv_iter.seek(&expected);
                match self.kv_iter.next() {
                    Some((k, pos_len)) if k == expected => self.current = Some((k, pos_len)),
                    _ => self.pending_error = Some(Error::NotFound),
                }
            }
        }

        Ok(Some(item))
    }
}

/// Layers "collect chunks until the last one, then emit the changeset" on top
/// of [`ChunkWalk`].
pub struct ChangesetWalk {
    chunks: ChunkWalk,
}

impl ChangesetWalk {
    pub fn new(txn: &mut JournalTxn, first_serial: u32, last_serial: u32) -> CResult<Self> {
        Ok(Self { chunks: ChunkWalk::new(txn, first_serial, last_serial)? })
    }

    pub fn new_in(txn: &mut JournalTxn, db: Db, first_serial: u32, last_serial: u32) -> CResult<Self> {
        Ok(Self { chunks: ChunkWalk::new_in(txn, db, first_serial, last_serial)? })
    }

    /// Returns `(serial_from, serial_to, chunk_payloads)` for the next
    /// changeset, or `None` once the walk is exhausted.
    pub fn next_changeset(&mut self, txn: &mut JournalTxn) -> CResult<Option<(u32, u32, Vec<Vec<u8>>)>> {
        let mut payloads = Vec::new();
        let mut serial_from = 0;
        let mut serial_to = 0;

        loop {
            match self.chunks.next_chunk(txn)? {
                None => {
                    if payloads.is_empty() {
                        return Ok(None);
                    }
                    return Err(Error::Malformed("changeset truncated mid-chunk".into()));
                }
                Some(item) => {
                    if payloads.is_empty() {
                        serial_from = item.serial;
                        serial_to = item.serial_to;
                    }
                    let last = item.chunk_index + 1 == item.chunk_count;
                    payloads.push(item.payload);
                    if last {
                        return Ok(Some((serial_from, serial_to, payloads)));
                    }
                }
            }
        }
    }
}
