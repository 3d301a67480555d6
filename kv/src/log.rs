use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::PathBuf;

use fs4::FileExt;

use crate::error::{CResult, Error};

/// One record inside a transaction frame. `value == None` is a tombstone.
pub struct Record<'a> {
    pub db: u8,
    pub key: &'a [u8],
    pub value: Option<&'a [u8]>,
}

/// An append-only log file holding whole-transaction frames:
///
/// - frame_len as big-endian u32 (bytes from here up to, not including, the trailer)
/// - entry_count as big-endian u32
/// - `entry_count` entries, each encoded as:
///   - db tag as u8
///   - key length as big-endian u32
///   - value length as big-endian i32, or -1 for a tombstone
///   - key as raw bytes
///   - value as raw bytes (absent for tombstones)
/// - frame_len repeated as big-endian u32 (trailer)
///
/// A transaction is durable only once both the header and the trailer agree, which is
/// what lets `rebuild` tell an in-progress write (truncated frame) apart from backing
/// store corruption (a frame that looks complete but whose header and trailer disagree).
pub struct TxLog {
    file: std::fs::File,
    len: u64,
}

impl TxLog {
    /// Opens a log file, creating it if missing, and takes an exclusive lock on it for
    /// the lifetime of the returned handle.
    pub fn open(path: PathBuf) -> CResult<Self> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }

        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;

        file.try_lock_exclusive()
            .map_err(|_| Error::Locked(path.display().to_string()))?;

        let len = file.metadata()?.len();
        Ok(Self { file, len })
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    /// Replays every durable frame from the start of the file, calling `apply` once per
    /// record in commit order. Any trailing bytes that don't amount to a complete frame
    /// are treated as an interrupted write and truncated away, exactly as a single-entry
    /// log truncates a partial tail entry.
    pub fn rebuild<F: FnMut(u8, &[u8], Option<(u64, u32)>)>(&mut self, mut apply: F) -> CResult<()> {
        let file_len = self.file.metadata()?.len();
        let mut r = BufReader::new(&mut self.file);
        let mut pos = r.seek(SeekFrom::Start(0))?;

        while pos < file_len {
            match Self::read_frame(&mut r, pos, file_len) {
                Ok(Some((frame_bytes, entries))) => {
                    for (db, key, value) in entries {
                        apply(db, &key, value);
                    }
                    pos += frame_bytes;
                }
                Ok(None) => {
                    log::warn!("found incomplete transaction frame at offset {}, truncating", pos);
                    self.file.set_len(pos)?;
                    break;
                }
                Err(err) => return Err(err),
            }
        }

        self.len = pos;
        Ok(())
    }

    /// Reads one frame starting at `pos`. Returns `Ok(None)` when the remaining bytes
    /// don't add up to a complete frame (truncated by a crash mid-write).
    #[allow(clippy::type_complexity)]
    fn read_frame(
        r: &mut BufReader<&mut std::fs::File>,
        pos: u64,
        file_len: u64,
    ) -> CResult<Option<(u64, Vec<(u8, Vec<u8>, Option<(u64, u32)>)>)>> {
        if file_len - pos < 8 {
            return Ok(None);
        }

        let mut u32_buf = [0u8; 4];
        r.read_exact(&mut u32_buf)?;
        let frame_len = u32::from_be_bytes(u32_buf) as u64;
        let total = 8 + frame_len + 4;
        if file_len - pos < total {
            return Ok(None);
        }

        let payload_start = pos + 8;
        r.read_exact(&mut u32_buf)?;
        let entry_count = u32::from_be_bytes(u32_buf);

        let mut entries = Vec::with_capacity(entry_count as usize);
        let mut consumed: u64 = 4; // entry_count field, already part of frame_len payload
        for _ in 0..entry_count {
            let mut db_buf = [0u8; 1];
            r.read_exact(&mut db_buf)?;
            r.read_exact(&mut u32_buf)?;
            let key_len = u32::from_be_bytes(u32_buf);
            r.read_exact(&mut u32_buf)?;
            let value_len_or_tombstone = i32::from_be_bytes(u32_buf);

            let mut key = vec![0u8; key_len as usize];
            r.read_exact(&mut key)?;

            consumed += 1 + 4 + 4 + key_len as u64;

            let value = if value_len_or_tombstone >= 0 {
                let value_len = value_len_or_tombstone as u32;
                let value_pos = payload_start + consumed;
                r.seek_relative(value_len as i64)?;
                consumed += value_len as u64;
                Some((value_pos, value_len))
            } else {
                None
            };

            entries.push((db_buf[0], key, value));
        }

        if consumed != frame_len {
            return Err(Error::Corrupt(format!(
                "frame at offset {} claims {} bytes but entries consumed {}",
                pos, frame_len, consumed
            )));
        }

        r.read_exact(&mut u32_buf)?;
        let trailer = u32::from_be_bytes(u32_buf);
        if trailer != frame_len {
            return Err(Error::Corrupt(format!(
                "frame at offset {} header/trailer mismatch: {} vs {}",
                pos, frame_len, trailer
            )));
        }

        Ok(Some((total, entries)))
    }

    pub fn read_value(&mut self, pos: u64, len: u32) -> CResult<Vec<u8>> {
        let mut value = vec![0u8; len as usize];
        self.file.seek(SeekFrom::Start(pos))?;
        self.file.read_exact(&mut value)?;
        Ok(value)
    }

    /// Appends one transaction frame holding all of `records`, fsyncs it, and returns
    /// the on-disk `(pos, len)` of each non-tombstone record's value, in order. Readers
    /// never observe a partially-written frame: either every record lands, or (on a
    /// crash before the trailer is written) `rebuild` discards the whole frame.
    pub fn write_txn(&mut self, records: &[Record<'_>]) -> CResult<Vec<Option<(u64, u32)>>> {
        let mut payload = Vec::new();
        payload.extend_from_slice(&(records.len() as u32).to_be_bytes());

        let mut value_offsets = Vec::with_capacity(records.len());
        for rec in records {
            payload.push(rec.db);
            payload.extend_from_slice(&(rec.key.len() as u32).to_be_bytes());
            let value_len_or_tombstone = rec.value.map_or(-1, |v| v.len() as i32);
            payload.extend_from_slice(&value_len_or_tombstone.to_be_bytes());
            payload.extend_from_slice(rec.key);
            if let Some(value) = rec.value {
                let offset_in_payload = payload.len() as u64;
                payload.extend_from_slice(value);
                value_offsets.push(Some((offset_in_payload, value.len() as u32)));
            } else {
                value_offsets.push(None);
            }
        }

        let frame_len = payload.len() as u64;
        let pos0 = self.file.seek(SeekFrom::End(0))?;
        let payload_start = pos0 + 8;

        let mut w = BufWriter::with_capacity(payload.len() + 16, &mut self.file);
        w.write_all(&(frame_len as u32).to_be_bytes())?;
        w.write_all(&payload)?;
        w.write_all(&(frame_len as u32).to_be_bytes())?;
        w.flush()?;
        w.get_mut().sync_data()?;

        self.len = payload_start + frame_len + 4;

        let resolved = value_offsets
            .into_iter()
            .map(|entry| entry.map(|(off, len)| (payload_start + off, len)))
            .collect();
        Ok(resolved)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn roundtrip_and_rebuild() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kvlog");

        let mut log = TxLog::open(path.clone()).unwrap();
        let positions = log
            .write_txn(&[
                Record { db: 0, key: b"a", value: Some(b"1") },
                Record { db: 1, key: b"meta", value: Some(b"x") },
            ])
            .unwrap();
        assert_eq!(positions.len(), 2);

        log.write_txn(&[Record { db: 0, key: b"a", value: None }]).unwrap();

        drop(log);

        let mut reopened = TxLog::open(path).unwrap();
        let mut seen = Vec::new();
        reopened
            .rebuild(|db, key, value| seen.push((db, key.to_vec(), value)))
            .unwrap();

        assert_eq!(seen.len(), 3);
        assert_eq!(seen[0].1, b"a".to_vec());
        assert!(seen[0].2.is_some());
        assert_eq!(seen[2].2, None);
    }

    #[test]
    fn truncates_incomplete_trailing_frame() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kvlog");

        let mut log = TxLog::open(path.clone()).unwrap();
        log.write_txn(&[Record { db: 0, key: b"a", value: Some(b"1") }]).unwrap();
        let good_len = log.len();
        drop(log);

        // Simulate a crash mid-write of a second frame: append a header claiming more
        // bytes than actually follow.
        {
            use std::io::Write as _;
            let mut f = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&100u32.to_be_bytes()).unwrap();
            f.write_all(b"short").unwrap();
        }

        let mut reopened = TxLog::open(path.clone()).unwrap();
        let mut seen = Vec::new();
        reopened.rebuild(|db, key, value| seen.push((db, key.to_vec(), value))).unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(reopened.len(), good_len);

        let on_disk = std::fs::metadata(&path).unwrap().len();
        assert_eq!(on_disk, good_len);
    }
}
