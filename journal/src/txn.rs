use kv::store::{Db, Iter, Store};

use crate::error::{CResult, Error};
use crate::metadata::{self, Metadata};

/// Wraps one kv write transaction with a shadow copy of [`Metadata`]. Every
/// data operation goes through here so metadata mutations land in the same kv
/// commit as the data writes they describe; the in-memory, authoritative
/// `Metadata` is only replaced once that commit has actually succeeded.
///
/// Once any operation fails, the shim is poisoned: further data operations
/// are no-ops that hand back the first error, and `commit` degrades to an
/// `abort` that still returns that same error.
pub struct JournalTxn<'a> {
    inner: kv::store::Txn<'a>,
    pub shadow: Metadata,
    poisoned: Option<Error>,
}

impl<'a> JournalTxn<'a> {
    pub fn begin(store: &'a mut Store, metadata: &Metadata) -> Self {
        Self { inner: store.begin_write(), shadow: metadata.clone(), poisoned: None }
    }

    fn check(&self) -> CResult<()> {
        match &self.poisoned {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }

    fn poison<T>(&mut self, err: impl Into<Error>) -> CResult<T> {
        let err = err.into();
        if self.poisoned.is_none() {
            self.poisoned = Some(err.clone());
        }
        Err(err)
    }

    pub fn find(&mut self, db: Db, key: &[u8]) -> CResult<Option<Vec<u8>>> {
        self.check()?;
        match self.inner.find(db, key) {
            Ok(v) => Ok(v),
            Err(e) => self.poison(e),
        }
    }

    pub fn insert(&mut self, db: Db, key: &[u8], value: &[u8]) -> CResult<()> {
        self.check()?;
        match self.inner.insert(db, key, value) {
            Ok(()) => Ok(()),
            Err(e) => self.poison(e),
        }
    }

    pub fn del(&mut self, db: Db, key: &[u8]) -> CResult<()> {
        self.check()?;
        match self.inner.del(db, key) {
            Ok(()) => Ok(()),
            Err(e) => self.poison(e),
        }
    }

    pub fn clear(&mut self, db: Db) -> CResult<()> {
        self.check()?;
        match self.inner.clear(db) {
            Ok(()) => Ok(()),
            Err(e) => self.poison(e),
        }
    }

    pub fn count(&mut self, db: Db) -> CResult<usize> {
        self.check()?;
        Ok(self.inner.count(db))
    }

    pub fn iter(&mut self, db: Db, from: &[u8]) -> CResult<Iter> {
        self.check()?;
        Ok(self.inner.iter(db, from))
    }

    pub fn read_at(&mut self, pos: u64, len: u32) -> CResult<Vec<u8>> {
        self.check()?;
        match self.inner.read_at(pos, len) {
            Ok(v) => Ok(v),
            Err(e) => self.poison(e),
        }
    }

    /// Fraction of `fslimit` currently occupied by the underlying log. Not
    /// subject to poisoning: it's a read of already-committed state, used by
    /// the insertion engine to decide whether to make space at all.
    pub fn used_fraction(&self) -> f32 {
        self.inner.used_fraction()
    }

    pub fn used_bytes(&self) -> u64 {
        self.inner.used_bytes()
    }

    pub fn fslimit(&self) -> u64 {
        self.inner.map_size()
    }

    /// Explicitly fail the transaction with `err`, as if a data operation had
    /// raised it. Used by engines that detect a problem (e.g. "no space")
    /// without going through a kv call.
    pub fn fail<T>(&mut self, err: Error) -> CResult<T> {
        self.poison(err)
    }

    /// Commits the accumulated metadata diff and data writes together. On
    /// success, `*metadata` becomes the shadow. A poisoned transaction aborts
    /// and returns its stored error instead of attempting to commit anything.
    pub fn commit(mut self, metadata: &mut Metadata) -> CResult<()> {
        if let Some(err) = self.poisoned.take() {
            self.inner.abort();
            return Err(err);
        }

        let old = metadata.clone();
        if let Err(err) = metadata::store_diff(&mut self.inner, &old, &self.shadow) {
            self.inner.abort();
            return Err(err);
        }

        self.inner.commit()?;
        *metadata = self.shadow.clone();
        Ok(())
    }

    pub fn abort(self) {
        self.inner.abort();
    }
}
