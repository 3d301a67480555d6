use kv::store::{Db, Txn};

use crate::error::{CResult, Error};

/// "1.0" in BCD. On open, only the leading decimal digit is compared against
/// this value — a point release may bump the low digit without invalidating
/// journals written by an older minor version.
pub const JOURNAL_VERSION: u32 = 10;

pub const LAST_FLUSHED_VALID: u32 = 1 << 0;
pub const SERIAL_TO_VALID: u32 = 1 << 1;
pub const MERGED_SERIAL_VALID: u32 = 1 << 2;
pub const DIRTY_SERIAL_VALID: u32 = 1 << 3;

const KEY_FIRST_SERIAL: &[u8] = b"first_serial";
const KEY_LAST_SERIAL: &[u8] = b"last_serial";
const KEY_LAST_SERIAL_TO: &[u8] = b"last_serial_to";
const KEY_LAST_FLUSHED: &[u8] = b"last_flushed";
const KEY_MERGED_SERIAL: &[u8] = b"merged_serial";
const KEY_DIRTY_SERIAL: &[u8] = b"dirty_serial";
const KEY_FLAGS: &[u8] = b"flags";
const KEY_VERSION: &[u8] = b"version";
const KEY_ZONE_NAME: &[u8] = b"zone_name";

/// Journal-level scalars, mirrored in memory and persisted one-per-key in the
/// `meta` sub-database.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Metadata {
    pub first_serial: u32,
    pub last_serial: u32,
    pub last_serial_to: u32,
    pub last_flushed: u32,
    pub merged_serial: u32,
    pub dirty_serial: u32,
    pub flags: u32,
    pub version: u32,
    pub zone_name: Vec<u8>,
}

impl Metadata {
    pub fn fresh(zone_name: &[u8]) -> Self {
        Self { version: JOURNAL_VERSION, zone_name: zone_name.to_vec(), ..Default::default() }
    }

    pub fn has(&self, flag: u32) -> bool {
        self.flags & flag != 0
    }

    pub fn set(&mut self, flag: u32) {
        self.flags |= flag;
    }

    pub fn clear(&mut self, flag: u32) {
        self.flags &= !flag;
    }

    fn scalar_fields(&self) -> [(&'static [u8], u32); 7] {
        [
            (KEY_FIRST_SERIAL, self.first_serial),
            (KEY_LAST_SERIAL, self.last_serial),
            (KEY_LAST_SERIAL_TO, self.last_serial_to),
            (KEY_LAST_FLUSHED, self.last_flushed),
            (KEY_MERGED_SERIAL, self.merged_serial),
            (KEY_DIRTY_SERIAL, self.dirty_serial),
            (KEY_FLAGS, self.flags),
        ]
    }
}

fn read_u32(txn: &mut Txn<'_>, key: &[u8]) -> CResult<Option<u32>> {
    match txn.find(Db::Meta, key)? {
        None => Ok(None),
        Some(bytes) if bytes.len() == 4 => {
            let mut buf = [0u8; 4];
            buf.copy_from_slice(&bytes);
            Ok(Some(u32::from_be_bytes(buf)))
        }
        Some(bytes) => Err(Error::Malformed(format!(
            "metadata key {:?} has {} bytes, expected 4",
            String::from_utf8_lossy(key),
            bytes.len()
        ))),
    }
}

/// Loads metadata from the `meta` sub-database. Returns `Ok(None)` for a fresh
/// zone (no `version` key yet), so the caller can decide how to initialize it.
pub fn load(txn: &mut Txn<'_>) -> CResult<Option<Metadata>> {
    let version = match read_u32(txn, KEY_VERSION)? {
        Some(v) => v,
        None => return Ok(None),
    };

    let zone_name = match txn.find(Db::Meta, KEY_ZONE_NAME)? {
        Some(mut bytes) => {
            if bytes.last() == Some(&0) {
                bytes.pop();
            }
            bytes
        }
        None => Vec::new(),
    };

    Ok(Some(Metadata {
        first_serial: read_u32(txn, KEY_FIRST_SERIAL)?.unwrap_or(0),
        last_serial: read_u32(txn, KEY_LAST_SERIAL)?.unwrap_or(0),
        last_serial_to: read_u32(txn, KEY_LAST_SERIAL_TO)?.unwrap_or(0),
        last_flushed: read_u32(txn, KEY_LAST_FLUSHED)?.unwrap_or(0),
        merged_serial: read_u32(txn, KEY_MERGED_SERIAL)?.unwrap_or(0),
        dirty_serial: read_u32(txn, KEY_DIRTY_SERIAL)?.unwrap_or(0),
        flags: read_u32(txn, KEY_FLAGS)?.unwrap_or(0),
        version,
        zone_name,
    }))
}

/// Writes every scalar unconditionally. Used once, when initializing a fresh zone.
pub fn store_all(txn: &mut Txn<'_>, meta: &Metadata) -> CResult<()> {
    for (key, value) in meta.scalar_fields() {
        txn.insert(Db::Meta, key, &value.to_be_bytes())?;
    }
    txn.insert(Db::Meta, KEY_VERSION, &meta.version.to_be_bytes())?;
    let mut wire_name = meta.zone_name.clone();
    wire_name.push(0);
    txn.insert(Db::Meta, KEY_ZONE_NAME, &wire_name)?;
    Ok(())
}

/// Writes only the scalar fields that changed between `old` and `new`, as the
/// transaction shim commits: shadow metadata is diffed against the
/// still-authoritative in-memory copy, not rewritten wholesale every time.
pub fn store_diff(txn: &mut Txn<'_>, old: &Metadata, new: &Metadata) -> CResult<()> {
    for ((key, old_value), (_, new_value)) in old.scalar_fields().into_iter().zip(new.scalar_fields()) {
        if old_value != new_value {
            txn.insert(Db::Meta, key, &new_value.to_be_bytes())?;
        }
    }
    if old.zone_name != new.zone_name {
        let mut wire_name = new.zone_name.clone();
        wire_name.push(0);
        txn.insert(Db::Meta, KEY_ZONE_NAME, &wire_name)?;
    }
    if old.version != new.version {
        txn.insert(Db::Meta, KEY_VERSION, &new.version.to_be_bytes())?;
    }
    Ok(())
}

/// Compares only the leading decimal digit of a BCD version, the same check
/// `load_metadata()` in the original journal performs.
pub fn first_digit(version: u32) -> u32 {
    let mut v = version;
    while v >= 10 {
        v /= 10;
    }
    v
}

#[cfg(test)]
mod test {
    use super::*;
    use kv::store::Store;

    #[test]
    fn fresh_zone_has_no_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = Store::open(dir.path(), 1 << 20).unwrap();
        let mut txn = store.begin_read();
        assert!(load(&mut txn).unwrap().is_none());
    }

    #[test]
    fn store_all_then_load_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = Store::open(dir.path(), 1 << 20).unwrap();

        let mut meta = Metadata::fresh(b"example.com.");
        meta.first_serial = 5;
        meta.set(SERIAL_TO_VALID);

        let mut txn = store.begin_write();
        store_all(&mut txn, &meta).unwrap();
        txn.commit().unwrap();

        let mut txn = store.begin_read();
        let loaded = load(&mut txn).unwrap().unwrap();
        assert_eq!(loaded, meta);
    }

    #[test]
    fn first_digit_ignores_minor_version() {
        assert_eq!(first_digit(JOURNAL_VERSION), 1);
        assert_eq!(first_digit(11), 1);
        assert_eq!(first_digit(20), 2);
    }
}
