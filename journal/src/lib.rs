//! Per-zone incremental-update journal: a persistent, chunked, bounded-size
//! log of zone changesets layered on the [`kv`] ordered store, with merge-and-
//! compact, crash-consistent metadata, and cooperation with an external
//! zone-file flusher.
//!
//! ```rust
//! use journal::changeset::{FakeChangeset, FakeCodec};
//! use journal::policy::StaticPolicy;
//! use journal::Journal;
//!
//! fn main() -> Result<(), journal::error::Error> {
//!     let dir = tempfile::tempdir().unwrap();
//!     let mut j: Journal<FakeCodec, StaticPolicy> = Journal::new(StaticPolicy(false));
//!     j.open(dir.path(), 1 << 20, b"example.com.")?;
//!
//!     let ch = FakeChangeset::new(0, 1, vec![(true, "a.example.com.".into())]);
//!     j.store_changeset(&ch)?;
//!     assert_eq!(j.count()?, 1);
//!
//!     let loaded = j.load_changesets(0)?;
//!     assert_eq!(loaded, vec![ch]);
//!     j.flush_mark()?;
//!     Ok(())
//! }
//! ```

pub mod changeset;
pub mod check;
pub mod codec;
pub mod error;
mod insert;
mod iter;
mod merge;
pub mod metadata;
pub mod policy;
mod reclaim;
pub mod serial;
mod txn;

use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use kv::store::{Db, Store};

use changeset::ChangesetCodec;
use check::CheckReport;
use error::{CResult, Error};
use insert::InsertKind;
use iter::ChangesetWalk;
use metadata::{Metadata, DIRTY_SERIAL_VALID, LAST_FLUSHED_VALID, MERGED_SERIAL_VALID, SERIAL_TO_VALID};
use policy::MergePolicy;
use txn::JournalTxn;

/// A handle to one zone's journal. Unopened until [`Journal::open`] succeeds;
/// every other method requires an open handle.
pub struct Journal<C: ChangesetCodec, P: MergePolicy> {
    store: Option<Store>,
    metadata: Option<Metadata>,
    policy: P,
    requested_zone_name: Vec<u8>,
    _codec: PhantomData<C>,
}

fn not_open() -> Error {
    Error::Inval("journal handle is not open".into())
}

impl<C: ChangesetCodec, P: MergePolicy> Journal<C, P> {
    /// Allocates an unopened handle using `policy` to decide merge-vs-flush.
    pub fn new(policy: P) -> Self {
        Self { store: None, metadata: None, policy, requested_zone_name: Vec::new(), _codec: PhantomData }
    }

    /// `true` if a journal directory already exists at `path`.
    pub fn exists(path: &Path) -> bool {
        path.join("journal.kvlog").exists()
    }

    /// Opens (creating if necessary) the journal at `path`. `fslimit` is
    /// clamped up to [`policy::FSLIMIT_MIN`]. If the directory was previously
    /// created with a larger capacity than requested here, and the journal is
    /// not fully flushed, returns [`Error::RetryAfterFlush`]; otherwise wipes
    /// and reinitializes fresh at the smaller size.
    pub fn open(&mut self, path: &Path, fslimit: u64, zone_name: &[u8]) -> CResult<()> {
        let fslimit = fslimit.max(policy::FSLIMIT_MIN);
        let mut store = Store::open(path, fslimit)?;

        if store.persisted_map_size() > fslimit {
            let fully_flushed = {
                let mut txn = store.begin_read();
                match metadata::load(&mut txn)? {
                    None => true,
                    Some(m) => {
                        !m.has(SERIAL_TO_VALID) || (m.has(LAST_FLUSHED_VALID) && m.last_flushed == m.last_serial)
                    }
                }
            };
            if !fully_flushed {
                return Err(Error::RetryAfterFlush);
            }
            drop(store);
            Store::remove_dir(path)?;
            store = Store::open(path, fslimit)?;
        }

        let metadata = {
            let mut txn = store.begin_write();
            let metadata = match metadata::load(&mut txn)? {
                Some(m) => {
                    if metadata::first_digit(m.version) != metadata::first_digit(metadata::JOURNAL_VERSION) {
                        return Err(Error::UnsupportedVersion(m.version));
                    }
                    m
                }
                None => {
                    let fresh = Metadata::fresh(zone_name);
                    metadata::store_all(&mut txn, &fresh)?;
                    fresh
                }
            };
            txn.commit()?;
            metadata
        };

        self.requested_zone_name = zone_name.to_vec();
        self.metadata = Some(metadata);
        self.store = Some(store);

        self.cleanup_dirty()?;
        Ok(())
    }

    /// Idempotent: calling this on an already-closed handle is a no-op. All
    /// shadow state is persisted per-commit, so there is nothing left to flush
    /// on close.
    pub fn close(&mut self) {
        self.store = None;
        self.metadata = None;
    }

    fn cleanup_dirty(&mut self) -> CResult<()> {
        let dirty_serial = match &self.metadata {
            Some(m) if m.has(DIRTY_SERIAL_VALID) => m.dirty_serial,
            _ => return Ok(()),
        };
        let store = self.store.as_mut().ok_or_else(not_open)?;
        let metadata = self.metadata.as_mut().ok_or_else(not_open)?;
        let mut txn = JournalTxn::begin(store, metadata);
        reclaim::cleanup_dirty(&mut txn, dirty_serial)?;
        txn.shadow.clear(DIRTY_SERIAL_VALID);
        txn.commit(metadata)
    }

    pub fn store_changeset(&mut self, ch: &C::Changeset) -> CResult<()> {
        let store = self.store.as_mut().ok_or_else(not_open)?;
        let metadata = self.metadata.as_mut().ok_or_else(not_open)?;
        insert::store_one::<C, P>(store, metadata, &self.policy, ch, InsertKind::Normal)
    }

    /// Shares one outer transaction across the whole batch (see
    /// [`insert::store_many`]): a mid-batch error rolls back every changeset
    /// in `list`, not just the one that failed.
    pub fn store_changesets(&mut self, list: &[C::Changeset]) -> CResult<()> {
        let store = self.store.as_mut().ok_or_else(not_open)?;
        let metadata = self.metadata.as_mut().ok_or_else(not_open)?;
        insert::store_many::<C, P>(store, metadata, &self.policy, list, InsertKind::Normal)
    }

    /// Appends every changeset from `from` onward, oldest first. If `from`
    /// names the merged changeset, it is loaded first and the walk continues
    /// from its `serial_to`.
    pub fn load_changesets(&mut self, from: u32) -> CResult<Vec<C::Changeset>> {
        let store = self.store.as_mut().ok_or_else(not_open)?;
        let metadata = self.metadata.as_ref().ok_or_else(not_open)?.clone();
        let mut txn = JournalTxn::begin(store, &metadata);
        let mut out = Vec::new();
        let mut cursor = from;

        if txn.shadow.has(MERGED_SERIAL_VALID) && cursor == txn.shadow.merged_serial {
            let mut walk = ChangesetWalk::new_in(&mut txn, Db::Merged, cursor, cursor)?;
            let (_, serial_to, payloads) = walk.next_changeset(&mut txn)?.ok_or(Error::NotFound)?;
            out.push(C::deserialize_chunks(&payloads)?);
            cursor = serial_to;
        }

        if txn.shadow.has(SERIAL_TO_VALID) {
            match ChangesetWalk::new(&mut txn, cursor, txn.shadow.last_serial) {
                Ok(mut walk) => {
                    while let Some((_, _, payloads)) = walk.next_changeset(&mut txn)? {
                        out.push(C::deserialize_chunks(&payloads)?);
                    }
                }
                Err(e) => {
                    if out.is_empty() {
                        txn.abort();
                        return Err(e);
                    }
                }
            }
        } else if out.is_empty() {
            txn.abort();
            return Err(Error::NotFound);
        }

        txn.abort();
        Ok(out)
    }

    /// Called by the external flusher once the zone file has been durably
    /// persisted through `last_serial`.
    pub fn flush_mark(&mut self) -> CResult<()> {
        let store = self.store.as_mut().ok_or_else(not_open)?;
        let metadata = self.metadata.as_mut().ok_or_else(not_open)?;
        let mut txn = JournalTxn::begin(store, metadata);
        merge::flush_mark(&mut txn)?;
        txn.commit(metadata)
    }

    pub fn count(&mut self) -> CResult<usize> {
        let store = self.store.as_mut().ok_or_else(not_open)?;
        let txn = store.begin_read();
        Ok(txn.count(Db::Data))
    }

    /// Read-only invariant check; see [`check::check`].
    pub fn check(&mut self) -> CResult<CheckReport> {
        let store = self.store.as_mut().ok_or_else(not_open)?;
        let metadata = self.metadata.as_ref().ok_or_else(not_open)?.clone();
        let mut txn = JournalTxn::begin(store, &metadata);
        let report = check::check::<C>(&mut txn)?;
        txn.abort();
        Ok(report)
    }

    /// Returns the zone name persisted in the journal, updating the handle's
    /// notion of the name to match. Returns [`Error::SemCheck`] (not a failed
    /// operation, but a signal) if it differs from the name passed to `open`.
    pub fn load_zone_name(&mut self) -> CResult<Vec<u8>> {
        let stored = self.metadata.as_ref().ok_or_else(not_open)?.zone_name.clone();
        let mismatch = stored != self.requested_zone_name;
        self.requested_zone_name = stored.clone();
        if mismatch {
            Err(Error::SemCheck)
        } else {
            Ok(stored)
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use changeset::{FakeChangeset, FakeCodec};
    use policy::StaticPolicy;

    fn open_journal(fslimit: u64, merge_allowed: bool) -> (tempfile::TempDir, Journal<FakeCodec, StaticPolicy>) {
        let dir = tempfile::tempdir().unwrap();
        let mut j = Journal::new(StaticPolicy(merge_allowed));
        j.open(dir.path(), fslimit, b"test.").unwrap();
        (dir, j)
    }

    #[test]
    fn simple_round_trip() {
        let (_dir, mut j) = open_journal(1 << 21, false);
        let records: Vec<_> = (0..128).map(|i| (true, format!("rr{i}.test."))).collect();
        let ch = FakeChangeset::new(0, 1, records);
        j.store_changeset(&ch).unwrap();
        assert_eq!(j.count().unwrap(), 1);
        assert_eq!(j.load_changesets(0).unwrap(), vec![ch]);
        j.flush_mark().unwrap();
        assert!(j.check().unwrap().is_clean());
    }

    #[test]
    fn load_from_unknown_serial_not_found() {
        let (_dir, mut j) = open_journal(1 << 20, false);
        let ch = FakeChangeset::new(0, 1, vec![(true, "a.test.".into())]);
        j.store_changeset(&ch).unwrap();
        assert!(matches!(j.load_changesets(5), Err(Error::NotFound)));
    }

    #[test]
    fn zone_name_mismatch_signals_sem_check() {
        let dir = tempfile::tempdir().unwrap();
        let mut j = Journal::<FakeCodec, StaticPolicy>::new(StaticPolicy(false));
        j.open(dir.path(), 1 << 20, b"a.").unwrap();
        drop(j);

        let mut j = Journal::<FakeCodec, StaticPolicy>::new(StaticPolicy(false));
        j.open(dir.path(), 1 << 20, b"b.").unwrap();
        assert!(matches!(j.load_zone_name(), Err(Error::SemCheck)));
        assert_eq!(j.load_zone_name().unwrap(), b"a.".to_vec());
    }
}
