use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use crate::error::{CResult, Error};
use crate::log::{Record, TxLog};

/// The three sub-databases a journal keeps inside one store directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Db {
    Data,
    Meta,
    Merged,
}

impl Db {
    const COUNT: usize = 3;

    fn tag(self) -> u8 {
        match self {
            Db::Data => 0,
            Db::Meta => 1,
            Db::Merged => 2,
        }
    }
}

/// An embedded, single-process, crash-consistent ordered store. All three
/// sub-databases share one write-ahead log, so a transaction that touches more
/// than one of them commits them atomically together.
pub struct Store {
    log: TxLog,
    dirs: [BTreeMap<Vec<u8>, (u64, u32)>; Db::COUNT],
    map_size: u64,
}

impl Store {
    /// Opens (or creates) a store directory with `requested_map_size` as its capacity.
    ///
    /// If the directory was previously created with a *larger* capacity, that larger
    /// value is what's reported by [`Store::persisted_map_size`] — the store never
    /// silently shrinks the space it accounts for under a caller's feet, mirroring how
    /// an LMDB environment remembers the map size it was first opened with.
    pub fn open(dir: &Path, requested_map_size: u64) -> CResult<Store> {
        std::fs::create_dir_all(dir)?;

        let capacity_path = dir.join("capacity");
        let map_size = match Self::read_capacity(&capacity_path)? {
            Some(persisted) => persisted,
            None => {
                Self::write_capacity(&capacity_path, requested_map_size)?;
                requested_map_size
            }
        };

        let mut log = TxLog::open(dir.join("journal.kvlog"))?;
        let mut dirs: [BTreeMap<Vec<u8>, (u64, u32)>; Db::COUNT] = Default::default();
        log.rebuild(|db, key, value| {
            let map = &mut dirs[db as usize];
            match value {
                Some(pos_len) => {
                    map.insert(key.to_vec(), pos_len);
                }
                None => {
                    map.remove(key);
                }
            }
        })?;

        Ok(Store { log, dirs, map_size })
    }

    /// Deletes an entire store directory. Used when a caller decides the only way to
    /// honor a smaller requested capacity is to start over.
    pub fn remove_dir(dir: &Path) -> CResult<()> {
        if dir.exists() {
            std::fs::remove_dir_all(dir)?;
        }
        Ok(())
    }

    fn read_capacity(path: &Path) -> CResult<Option<u64>> {
        if !path.exists() {
            return Ok(None);
        }
        let bytes = std::fs::read(path)?;
        if bytes.len() != 8 {
            return Err(Error::Corrupt("capacity file has the wrong size".into()));
        }
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&bytes);
        Ok(Some(u64::from_be_bytes(buf)))
    }

    fn write_capacity(path: &Path, value: u64) -> CResult<()> {
        std::fs::write(path, value.to_be_bytes())?;
        Ok(())
    }

    /// Capacity this store was first created with, which may exceed what the current
    /// caller asked for.
    pub fn persisted_map_size(&self) -> u64 {
        self.map_size
    }

    pub fn used_bytes(&self) -> u64 {
        self.log.len()
    }

    pub fn used_fraction(&self) -> f32 {
        self.log.len() as f32 / self.map_size as f32
    }

    pub fn begin_write(&mut self) -> Txn<'_> {
        Txn { store: self, staged: Vec::new(), overlay: HashMap::new() }
    }

    /// A read-only transaction is just a write transaction nobody stages writes into;
    /// the store has no concurrent writers to guard against since a `&mut self` borrow
    /// already rules that out at compile time.
    pub fn begin_read(&mut self) -> Txn<'_> {
        self.begin_write()
    }
}

/// A single read-write transaction. Drop without calling [`Txn::commit`] to abort —
/// nothing staged here touches the store's committed state until commit succeeds.
pub struct Txn<'a> {
    store: &'a mut Store,
    staged: Vec<(u8, Vec<u8>, Option<Vec<u8>>)>,
    overlay: HashMap<(u8, Vec<u8>), Option<Vec<u8>>>,
}

impl<'a> Txn<'a> {
    pub fn find(&mut self, db: Db, key: &[u8]) -> CResult<Option<Vec<u8>>> {
        let tag = db.tag();
        if let Some(staged) = self.overlay.get(&(tag, key.to_vec())) {
            return Ok(staged.clone());
        }
        match self.store.dirs[tag as usize].get(key) {
            Some(&(pos, len)) => Ok(Some(self.store.log.read_value(pos, len)?)),
            None => Ok(None),
        }
    }

    pub fn insert(&mut self, db: Db, key: &[u8], value: &[u8]) -> CResult<()> {
        let tag = db.tag();
        self.overlay.insert((tag, key.to_vec()), Some(value.to_vec()));
        self.staged.push((tag, key.to_vec(), Some(value.to_vec())));
        Ok(())
    }

    pub fn del(&mut self, db: Db, key: &[u8]) -> CResult<()> {
        let tag = db.tag();
        self.overlay.insert((tag, key.to_vec()), None);
        self.staged.push((tag, key.to_vec(), None));
        Ok(())
    }

    pub fn count(&self, db: Db) -> usize {
        self.merged_keys(db).len()
    }

    pub fn clear(&mut self, db: Db) -> CResult<()> {
        for key in self.merged_keys(db) {
            self.del(db, &key)?;
        }
        Ok(())
    }

    fn merged_keys(&self, db: Db) -> Vec<Vec<u8>> {
        let tag = db.tag();
        let mut keys: std::collections::BTreeSet<Vec<u8>> =
            self.store.dirs[tag as usize].keys().cloned().collect();
        for ((t, k), v) in &self.overlay {
            if *t != tag {
                continue;
            }
            if v.is_some() {
                keys.insert(k.clone());
            } else {
                keys.remove(k);
            }
        }
        keys.into_iter().collect()
    }

    /// Forward iterator over `db`'s already-committed entries starting at the smallest
    /// key greater than or equal to `from`. Entries staged in this same, not-yet-committed
    /// transaction are not visible here — every algorithm that iterates only ever walks
    /// chunks a prior commit put in place.
    pub fn iter(&self, db: Db, from: &[u8]) -> Iter {
        let tag = db.tag();
        let entries: Vec<(Vec<u8>, (u64, u32))> = self.store.dirs[tag as usize]
            .range(from.to_vec()..)
            .map(|(k, v)| (k.clone(), *v))
            .collect();
        Iter { entries: entries.into_iter().peekable() }
    }

    pub fn read_at(&mut self, pos: u64, len: u32) -> CResult<Vec<u8>> {
        self.store.log.read_value(pos, len)
    }

    /// Bytes already committed to the underlying log, not counting anything
    /// staged in this transaction.
    pub fn used_bytes(&self) -> u64 {
        self.store.used_bytes()
    }

    pub fn map_size(&self) -> u64 {
        self.store.persisted_map_size()
    }

    pub fn used_fraction(&self) -> f32 {
        self.store.used_fraction()
    }

    pub fn commit(self) -> CResult<()> {
        if self.staged.is_empty() {
            return Ok(());
        }
        let records: Vec<Record<'_>> = self
            .staged
            .iter()
            .map(|(tag, key, value)| Record { db: *tag, key, value: value.as_deref() })
            .collect();
        let positions = self.store.log.write_txn(&records)?;

        for ((tag, key, value), pos) in self.staged.into_iter().zip(positions) {
            let map = &mut self.store.dirs[tag as usize];
            match (value, pos) {
                (Some(_), Some((p, l))) => {
                    map.insert(key, (p, l));
                }
                (None, None) => {
                    map.remove(&key);
                }
                _ => unreachable!("write_txn returns one position per record, in order"),
            }
        }
        Ok(())
    }

    pub fn abort(self) {}
}

pub struct Iter {
    entries: std::iter::Peekable<std::vec::IntoIter<(Vec<u8>, (u64, u32))>>,
}

impl Iter {
    pub fn peek_key(&mut self) -> Option<&[u8]> {
        self.entries.peek().map(|(k, _)| k.as_slice())
    }

    pub fn next(&mut self) -> Option<(Vec<u8>, (u64, u32))> {
        self.entries.next()
    }

    /// Skips ahead to the first remaining entry whose key is `>= key`.
    pub fn seek(&mut self, key: &[u8]) {
        while let Some(k) = self.peek_key() {
            if k < key {
                self.entries.next();
            } else {
                break;
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn insert_find_commit() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = Store::open(dir.path(), 1 << 20).unwrap();

        let mut txn = store.begin_write();
        txn.insert(Db::Data, b"k1", b"v1").unwrap();
        txn.insert(Db::Meta, b"first_serial", &1u32.to_be_bytes()).unwrap();
        assert_eq!(txn.find(Db::Data, b"k1").unwrap(), Some(b"v1".to_vec()));
        txn.commit().unwrap();

        let mut txn = store.begin_read();
        assert_eq!(txn.find(Db::Data, b"k1").unwrap(), Some(b"v1".to_vec()));
        assert_eq!(txn.find(Db::Meta, b"first_serial").unwrap(), Some(1u32.to_be_bytes().to_vec()));
        assert_eq!(txn.find(Db::Merged, b"k1").unwrap(), None);
    }

    #[test]
    fn abort_does_not_persist() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = Store::open(dir.path(), 1 << 20).unwrap();

        let mut txn = store.begin_write();
        txn.insert(Db::Data, b"k1", b"v1").unwrap();
        txn.abort();

        let mut txn = store.begin_read();
        assert_eq!(txn.find(Db::Data, b"k1").unwrap(), None);
    }

    #[test]
    fn iter_seek_and_next() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = Store::open(dir.path(), 1 << 20).unwrap();

        let mut txn = store.begin_write();
        for k in [1u32, 3, 5, 7] {
            txn.insert(Db::Data, &k.to_be_bytes(), b"x").unwrap();
        }
        txn.commit().unwrap();

        let mut txn = store.begin_read();
        let mut it = txn.iter(Db::Data, &0u32.to_be_bytes());
        let (k, _) = it.next().unwrap();
        assert_eq!(k, 1u32.to_be_bytes().to_vec());

        it.seek(&5u32.to_be_bytes());
        let (k, _) = it.next().unwrap();
        assert_eq!(k, 5u32.to_be_bytes().to_vec());
        let (k, _) = it.next().unwrap();
        assert_eq!(k, 7u32.to_be_bytes().to_vec());
        assert!(it.next().is_none());
    }

    #[test]
    fn reopen_recovers_state_and_persisted_capacity() {
        let dir = tempfile::tempdir().unwrap();

        {
            let mut store = Store::open(dir.path(), 4096).unwrap();
            let mut txn = store.begin_write();
            txn.insert(Db::Data, b"k", b"v").unwrap();
            txn.commit().unwrap();
        }

        let mut store = Store::open(dir.path(), 1 << 30).unwrap();
        assert_eq!(store.persisted_map_size(), 4096);
        let mut txn = store.begin_read();
        assert_eq!(txn.find(Db::Data, b"k").unwrap(), Some(b"v".to_vec()));
    }
}
