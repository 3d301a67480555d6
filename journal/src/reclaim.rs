use kv::store::Db;

use crate::codec::{self, HEADER_LEN};
use crate::error::CResult;
use crate::iter::ChunkWalk;
use crate::metadata::{LAST_FLUSHED_VALID, MERGED_SERIAL_VALID, SERIAL_TO_VALID};
use crate::txn::JournalTxn;

/// A chunk's approximate footprint on disk once page overhead is accounted
/// for. A tunable page-size estimate, not a contract.
const PAGE_OVERHEAD: u64 = 4096;

pub(crate) fn on_changeset_removed(txn: &mut JournalTxn, serial: u32, serial_to: u32) {
    txn.shadow.first_serial = serial_to;
    if txn.shadow.has(LAST_FLUSHED_VALID) && serial == txn.shadow.last_flushed {
        txn.shadow.clear(LAST_FLUSHED_VALID);
    }
    if txn.shadow.has(SERIAL_TO_VALID) && serial == txn.shadow.last_serial {
        txn.shadow.clear(SERIAL_TO_VALID);
    }
    if txn.shadow.has(MERGED_SERIAL_VALID) && serial == txn.shadow.merged_serial {
        txn.shadow.clear(MERGED_SERIAL_VALID);
    }
}

/// Deletes every chunk of the changesets keyed `[first, last]` inclusive from
/// the main database, advancing `first_serial` and clearing flags as each
/// changeset's last chunk disappears.
pub fn delete_upto(txn: &mut JournalTxn, first: u32, last: u32) -> CResult<()> {
    let mut walk = ChunkWalk::new(txn, first, last)?;
    while let Some(item) = walk.next_chunk(txn)? {
        txn.del(Db::Data, &codec::chunk_key(item.serial, item.chunk_index))?;
        if item.chunk_index + 1 == item.chunk_count {
            on_changeset_removed(txn, item.serial, item.serial_to);
        }
    }
    Ok(())
}

/// Deletes the oldest changesets until roughly `bytes_needed` bytes have been
/// freed, never deleting past the last flushed changeset — unflushed data is
/// always preserved. Returns the approximate number of bytes freed.
pub fn delete_to_free(txn: &mut JournalTxn, bytes_needed: u64) -> CResult<u64> {
    if !txn.shadow.has(SERIAL_TO_VALID) || !txn.shadow.has(LAST_FLUSHED_VALID) {
        // Nothing flushed yet: every changeset in the main DB is live, so
        // there is nothing safe to reclaim here.
        return Ok(0);
    }
    let first = txn.shadow.first_serial;
    let last = txn.shadow.last_serial;

    let mut walk = ChunkWalk::new(txn, first, last)?;
    let mut freed: u64 = 0;
    loop {
        let item = match walk.next_chunk(txn)? {
            Some(item) => item,
            None => break,
        };
        txn.del(Db::Data, &codec::chunk_key(item.serial, item.chunk_index))?;
        freed += item.payload.len() as u64 + HEADER_LEN as u64 + PAGE_OVERHEAD;

        if item.chunk_index + 1 == item.chunk_count {
            let was_last_flushed = txn.shadow.has(LAST_FLUSHED_VALID) && item.serial == txn.shadow.last_flushed;
            on_changeset_removed(txn, item.serial, item.serial_to);
            if freed >= bytes_needed || was_last_flushed {
                break;
            }
        }
    }
    Ok(freed)
}

/// Deletes the single merged changeset, if one exists.
pub(crate) fn wipe_merged(txn: &mut JournalTxn) -> CResult<()> {
    if !txn.shadow.has(MERGED_SERIAL_VALID) {
        return Ok(());
    }
    let merged_serial = txn.shadow.merged_serial;
    let mut walk = ChunkWalk::new_in(txn, Db::Merged, merged_serial, merged_serial)?;
    while let Some(item) = walk.next_chunk(txn)? {
        txn.del(Db::Merged, &codec::chunk_key(item.serial, item.chunk_index))?;
    }
    txn.shadow.clear(MERGED_SERIAL_VALID);
    Ok(())
}

/// Deletes every changeset in the main database, unconditionally (no
/// flushed/unflushed distinction — used by continuity/duplicate recovery and
/// by `drop_journal`, where the whole chain is being discarded anyway).
pub(crate) fn wipe_main_db(txn: &mut JournalTxn) -> CResult<()> {
    if !txn.shadow.has(SERIAL_TO_VALID) {
        return Ok(());
    }
    let first = txn.shadow.first_serial;
    let last = txn.shadow.last_serial;
    let mut walk = ChunkWalk::new(txn, first, last)?;
    while let Some(item) = walk.next_chunk(txn)? {
        txn.del(Db::Data, &codec::chunk_key(item.serial, item.chunk_index))?;
    }
    txn.shadow.clear(SERIAL_TO_VALID);
    txn.shadow.clear(LAST_FLUSHED_VALID);
    Ok(())
}

/// Deletes everything: the merged changeset (if any) and every main-DB changeset.
pub fn drop_journal(txn: &mut JournalTxn) -> CResult<()> {
    wipe_merged(txn)?;
    wipe_main_db(txn)?;
    Ok(())
}

/// Deletes whatever chunks were written for an interrupted multi-transaction
/// insertion. Walks `Db::Data` directly rather than through [`ChunkWalk`]:
/// a dirty serial's chain is, by definition, incomplete, so there is no
/// well-formed changeset to walk — just chunks sharing `dirty_serial` to wipe.
pub(crate) fn cleanup_dirty(txn: &mut JournalTxn, dirty_serial: u32) -> CResult<()> {
    let start = codec::chunk_key(dirty_serial, 0);
    let mut iter = txn.iter(Db::Data, &start)?;
    while let Some((key, _)) = iter.next() {
        match codec::decode_chunk_key(&key) {
            Ok((serial, _)) if serial == dirty_serial => txn.del(Db::Data, &key)?,
            _ => break,
        }
    }
    Ok(())
}
