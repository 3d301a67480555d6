use kv::store::{Db, Store};

use crate::changeset::ChangesetCodec;
use crate::codec::{self, ChunkHeader};
use crate::error::{CResult, Error};
use crate::iter::ChunkWalk;
use crate::metadata::{Metadata, DIRTY_SERIAL_VALID, MERGED_SERIAL_VALID, SERIAL_TO_VALID};
use crate::merge;
use crate::policy::{self, MergePolicy};
use crate::reclaim;
use crate::txn::JournalTxn;

/// Which metadata bookkeeping an insertion performs on commit. `Normal` is the
/// producer path; `Merged` is used internally by the merge engine to land the
/// accumulated changeset in the merged sub-database.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertKind {
    Normal,
    Merged,
}

/// Inserts one changeset. A thin wrapper around [`store_many`] for the
/// single-item producer path.
pub fn store_one<C: ChangesetCodec, P: MergePolicy>(
    store: &mut Store,
    metadata: &mut Metadata,
    policy: &P,
    ch: &C::Changeset,
    kind: InsertKind,
) -> CResult<()> {
    store_many::<C, P>(store, metadata, policy, std::slice::from_ref(ch), kind)
}

/// Inserts every changeset in `list`, sharing one outer KV transaction across
/// the whole batch: nothing in the batch is durably committed until every
/// item has been staged successfully, so an error partway through rolls back
/// the entire batch, not just the failing item (spec §4.6's "batch insertion
/// shares one outer transaction ... and fails fast on the first error").
///
/// A continuity violation, a duplicate-serial collision, or a sufficiently
/// large single changeset can still force an intermediate commit partway
/// through one item's own processing — that commit flushes whatever the
/// batch has staged so far, same as it would for a lone item via
/// [`store_one`]. Those are existing, per-item crash-recovery commits, not a
/// batch boundary.
pub fn store_many<C: ChangesetCodec, P: MergePolicy>(
    store: &mut Store,
    metadata: &mut Metadata,
    policy: &P,
    list: &[C::Changeset],
    kind: InsertKind,
) -> CResult<()> {
    let normal = kind == InsertKind::Normal;
    let mut txn = JournalTxn::begin(store, metadata);

    for ch in list {
        let s_from = C::serial_from(ch);
        let s_to = C::serial_to(ch);
        let mut attempts: u32 = 1;

        if normal {
            if txn.shadow.has(SERIAL_TO_VALID) && txn.shadow.last_serial_to != s_from {
                log::warn!(
                    "journal {:?}: changeset {} does not continue last_serial_to {}, discarding journal",
                    String::from_utf8_lossy(&txn.shadow.zone_name),
                    s_from,
                    txn.shadow.last_serial_to
                );
                merge::flush_or_merge::<C, P>(&mut txn, policy)?;
                reclaim::wipe_main_db(&mut txn)?;
                txn.commit(metadata)?;
                txn = JournalTxn::begin(store, metadata);
                attempts += 1;
            }

            let dup_key = codec::chunk_key(s_to, 0);
            if txn.find(Db::Data, &dup_key)?.is_some() {
                log::warn!(
                    "journal {:?}: changeset {} collides with an existing serial, dropping the overlap",
                    String::from_utf8_lossy(&txn.shadow.zone_name),
                    s_to
                );
                merge::flush_or_merge::<C, P>(&mut txn, policy)?;
                delete_duplicate_prefix(&mut txn, s_to)?;
                txn.commit(metadata)?;
                txn = JournalTxn::begin(store, metadata);
                attempts += 1;
            }
        }

        if let Err(e) = make_free_space::<C, P>(&mut txn, policy, normal) {
            log::warn!(
                "journal {:?}: failed to insert changeset {} in {} transaction(s): {}",
                String::from_utf8_lossy(&txn.shadow.zone_name),
                s_from,
                attempts,
                e
            );
            return Err(e);
        }

        let size = C::serialized_size(ch);
        let max_chunks = ((2 * size.max(1)) as f64 / codec::CHUNK_MAX as f64).ceil() as usize;
        let chunks = C::serialize_chunks(ch, codec::CHUNK_PAYLOAD_MAX, max_chunks.max(1))?;
        let chunk_count = chunks.len() as u32;

        let max_insert_bytes = (txn.fslimit() as f64 * policy::MAX_INSERT_TXN as f64) as u64;
        let mut written_since_commit: u64 = 0;

        for (i, payload) in chunks.iter().enumerate() {
            let header = ChunkHeader { serial_to: s_to, chunk_count, this_chunk_size: payload.len() as u32 };
            let value = codec::encode_chunk_value(&header, payload);
            let key = codec::chunk_key(s_from, i as u32);
            txn.insert(Db::Data, &key, &value)?;
            written_since_commit += value.len() as u64;

            let is_last = i as u32 + 1 == chunk_count;
            if written_since_commit > max_insert_bytes && !is_last {
                txn.shadow.dirty_serial = s_from;
                txn.shadow.set(DIRTY_SERIAL_VALID);
                txn.commit(metadata)?;
                txn = JournalTxn::begin(store, metadata);
                txn.shadow.clear(DIRTY_SERIAL_VALID);
                written_since_commit = 0;
                attempts += 1;
            }
        }

        match kind {
            InsertKind::Normal => {
                if !txn.shadow.has(SERIAL_TO_VALID) {
                    txn.shadow.first_serial = s_from;
                }
                txn.shadow.set(SERIAL_TO_VALID);
                txn.shadow.last_serial = s_from;
                txn.shadow.last_serial_to = s_to;
            }
            InsertKind::Merged => {
                txn.shadow.set(MERGED_SERIAL_VALID);
                txn.shadow.merged_serial = s_from;
            }
        }
    }

    txn.commit(metadata)
}

/// Deletes changesets from `first_serial` up to and including the one whose
/// `serial_from` equals the newly-colliding `s_to` — the new changeset's
/// `S_to` already names an existing changeset, so the overlap runs from the
/// oldest changeset through to that one.
fn delete_duplicate_prefix(txn: &mut JournalTxn, s_to: u32) -> CResult<()> {
    if !txn.shadow.has(SERIAL_TO_VALID) {
        return Ok(());
    }
    let first = txn.shadow.first_serial;
    let last = txn.shadow.last_serial;
    let mut walk = ChunkWalk::new(txn, first, last)?;
    loop {
        let item = match walk.next_chunk(txn)? {
            Some(item) => item,
            None => break,
        };
        txn.del(Db::Data, &codec::chunk_key(item.serial, item.chunk_index))?;
        if item.chunk_index + 1 == item.chunk_count {
            let done = item.serial == s_to;
            reclaim::on_changeset_removed(txn, item.serial, item.serial_to);
            if done {
                break;
            }
        }
    }
    Ok(())
}

/// Reclaims (and, failing that, flushes/merges then reclaims again) enough
/// space to keep occupancy under the threshold appropriate to the journal's
/// current merge state. `Merged`-kind insertions proceed even if space could
/// not be made — the merge path takes priority over staying under budget.
fn make_free_space<C: ChangesetCodec, P: MergePolicy>(
    txn: &mut JournalTxn,
    policy: &P,
    normal: bool,
) -> CResult<()> {
    let keep_free = if txn.shadow.has(MERGED_SERIAL_VALID) {
        policy::KEEP_MERGED
    } else if policy.merge_allowed(&txn.shadow.zone_name) {
        policy::KEEP_FORMERGE
    } else {
        policy::KEEP_FREE
    };
    let allowed_occupied = 1.0 - keep_free;

    if txn.used_fraction() <= allowed_occupied {
        return Ok(());
    }

    let fslimit = txn.fslimit();
    let excess = ((txn.used_fraction() - allowed_occupied) as f64 * fslimit as f64).max(0.0);
    let req_min = excess as u64;
    let req = req_min.saturating_mul(policy::DISPOSE_RATIO);

    let mut freed = reclaim::delete_to_free(txn, req)?;
    if freed >= req_min {
        return Ok(());
    }

    if normal {
        merge::flush_or_merge::<C, P>(txn, policy)?;
        freed += reclaim::delete_to_free(txn, req_min.saturating_sub(freed))?;
        if freed < req_min {
            return txn.fail(Error::NoSpace);
        }
    }

    Ok(())
}
