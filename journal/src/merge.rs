use kv::store::Db;

use crate::changeset::ChangesetCodec;
use crate::codec::{self, ChunkHeader};
use crate::error::{CResult, Error};
use crate::iter::{ChangesetWalk, ChunkWalk};
use crate::metadata::{LAST_FLUSHED_VALID, MERGED_SERIAL_VALID, SERIAL_TO_VALID};
use crate::policy::MergePolicy;
use crate::reclaim;
use crate::txn::JournalTxn;

/// Runs inside whatever transaction the caller already holds — reclamation
/// and merge never own a `Store` the way [`crate::insert::store_one`] does.
///
/// If the journal is already fully flushed, drops a now-unwanted merged
/// changeset when merge has been turned off. Otherwise either merges (when
/// policy allows it) or reports `Busy` so the producer engages the external
/// flusher.
pub fn flush_or_merge<C: ChangesetCodec, P: MergePolicy>(txn: &mut JournalTxn, policy: &P) -> CResult<()> {
    let already_flushed = !txn.shadow.has(SERIAL_TO_VALID)
        || (txn.shadow.has(LAST_FLUSHED_VALID) && txn.shadow.last_flushed == txn.shadow.last_serial);

    if already_flushed {
        if txn.shadow.has(MERGED_SERIAL_VALID) && !policy.merge_allowed(&txn.shadow.zone_name) {
            reclaim::wipe_merged(txn)?;
        }
        return Ok(());
    }

    if policy.merge_allowed(&txn.shadow.zone_name) {
        merge_journal::<C, P>(txn, policy)
    } else {
        txn.fail(Error::Busy)
    }
}

/// Called by the external flusher once it has durably persisted the zone file.
pub fn flush_mark(txn: &mut JournalTxn) -> CResult<()> {
    txn.shadow.last_flushed = txn.shadow.last_serial;
    txn.shadow.set(LAST_FLUSHED_VALID);
    Ok(())
}

fn merge_journal<C: ChangesetCodec, P: MergePolicy>(txn: &mut JournalTxn, _policy: &P) -> CResult<()> {
    let first_unflushed = if !txn.shadow.has(LAST_FLUSHED_VALID) {
        txn.shadow.first_serial
    } else {
        let last_flushed = txn.shadow.last_flushed;
        let mut walk = ChangesetWalk::new(txn, last_flushed, last_flushed)?;
        match walk.next_changeset(txn)? {
            Some((_, serial_to, _)) => serial_to,
            None => return Err(Error::Malformed("last_flushed does not name a changeset".into())),
        }
    };

    if first_unflushed == txn.shadow.last_serial_to {
        return Ok(());
    }

    let had_merged = txn.shadow.has(MERGED_SERIAL_VALID);
    let (mut acc, mut from): (C::Changeset, u32) = if had_merged {
        let merged_serial = txn.shadow.merged_serial;
        let mut walk = ChangesetWalk::new_in(txn, Db::Merged, merged_serial, merged_serial)?;
        let (_, serial_to, payloads) = walk
            .next_changeset(txn)?
            .ok_or_else(|| Error::Malformed("MERGED_SERIAL_VALID set but no merged changeset present".into()))?;
        (C::deserialize_chunks(&payloads)?, serial_to)
    } else {
        let mut walk = ChangesetWalk::new(txn, first_unflushed, first_unflushed)?;
        let (_, serial_to, payloads) = walk.next_changeset(txn)?.ok_or(Error::NotFound)?;
        (C::deserialize_chunks(&payloads)?, serial_to)
    };

    if had_merged {
        reclaim::wipe_merged(txn)?;
    } else {
        delete_one_changeset(txn, Db::Data, first_unflushed)?;
        txn.shadow.merged_serial = first_unflushed;
    }

    // `from` names the serial_to boundary already folded into `acc`. Nothing
    // remains to merge only once that boundary reaches the end of the whole
    // chain (`last_serial_to`) — it can still equal `last_serial` itself,
    // which means exactly one changeset (the newest) is left to fold in.
    if from != txn.shadow.last_serial_to {
        let mut walk = ChangesetWalk::new(txn, from, txn.shadow.last_serial)?;
        while let Some((_, serial_to, payloads)) = walk.next_changeset(txn)? {
            let next = C::deserialize_chunks(&payloads)?;
            C::merge(&mut acc, &next)?;
            from = serial_to;
        }
    }

    write_merged_chunks::<C>(txn, &acc)?;

    txn.shadow.last_flushed = txn.shadow.last_serial;
    txn.shadow.set(LAST_FLUSHED_VALID);
    Ok(())
}

fn delete_one_changeset(txn: &mut JournalTxn, db: Db, serial: u32) -> CResult<()> {
    let mut walk = ChunkWalk::new_in(txn, db, serial, serial)?;
    while let Some(item) = walk.next_chunk(txn)? {
        txn.del(db, &codec::chunk_key(item.serial, item.chunk_index))?;
        if item.chunk_index + 1 == item.chunk_count {
            reclaim::on_changeset_removed(txn, item.serial, item.serial_to);
        }
    }
    Ok(())
}

/// Writes the merge accumulator's chunks into `Db::Merged` and sets
/// `MERGED_SERIAL_VALID`/`merged_serial`. Unlike [`crate::insert::store_one`],
/// this never forces a mid-transaction commit: the accumulator is produced
/// internally from changesets already bounded by `fslimit`, not arbitrary
/// producer input, so the dirty-serial recovery path does not apply here.
fn write_merged_chunks<C: ChangesetCodec>(txn: &mut JournalTxn, ch: &C::Changeset) -> CResult<()> {
    let s_from = C::serial_from(ch);
    let s_to = C::serial_to(ch);
    let size = C::serialized_size(ch);
    let max_chunks = ((2 * size.max(1)) as f64 / codec::CHUNK_MAX as f64).ceil() as usize;
    let chunks = C::serialize_chunks(ch, codec::CHUNK_PAYLOAD_MAX, max_chunks.max(1))?;
    let chunk_count = chunks.len() as u32;

    for (i, payload) in chunks.iter().enumerate() {
        let header = ChunkHeader { serial_to: s_to, chunk_count, this_chunk_size: payload.len() as u32 };
        let value = codec::encode_chunk_value(&header, payload);
        txn.insert(Db::Merged, &codec::chunk_key(s_from, i as u32), &value)?;
    }

    txn.shadow.set(MERGED_SERIAL_VALID);
    txn.shadow.merged_serial = s_from;
    Ok(())
}
