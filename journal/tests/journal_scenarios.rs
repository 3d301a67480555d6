//! End-to-end scenarios exercising the journal through its public API only
//! (aside from the dirty-cleanup scenario, which pokes the on-disk state
//! directly to simulate a crash).

use journal::changeset::{FakeChangeset, FakeCodec};
use journal::error::Error;
use journal::policy::{self, StaticPolicy};
use journal::Journal;

fn open_journal(fslimit: u64, merge_allowed: bool, zone: &[u8]) -> (tempfile::TempDir, Journal<FakeCodec, StaticPolicy>) {
    let dir = tempfile::tempdir().unwrap();
    let mut j = Journal::new(StaticPolicy(merge_allowed));
    j.open(dir.path(), fslimit, zone).unwrap();
    (dir, j)
}

fn padded_record(tag: char, count: usize, len: usize) -> Vec<(bool, String)> {
    (0..count).map(|i| (tag == 'a', format!("{tag}pad{i:05}-{}", "x".repeat(len)))).collect()
}

#[test]
fn scenario_1_simple_round_trip() {
    let (_dir, mut j) = open_journal(2 << 20, false, b"test.");

    let mut rng_seed: u64 = 7;
    let mut next = || {
        rng_seed = rng_seed.wrapping_mul(6364136223846793005).wrapping_add(1);
        rng_seed
    };
    let records: Vec<_> = (0..128).map(|i| (true, format!("rr{i}-{}.test.", next()))).collect();

    let ch = FakeChangeset::new(0, 1, records);
    j.store_changeset(&ch).unwrap();
    assert_eq!(j.count().unwrap(), 1);
    assert_eq!(j.load_changesets(0).unwrap(), vec![ch]);

    j.flush_mark().unwrap();
    assert!(j.check().unwrap().is_clean());
}

#[test]
fn scenario_2_overfill_then_reclaim() {
    let fslimit = policy::FSLIMIT_MIN;
    let (_dir, mut j) = open_journal(fslimit, false, b"overfill.test.");

    // Each changeset is padded to ~80KB so that occupancy crosses the 50%
    // KEEP_FREE threshold (for a 1MiB fslimit) after roughly seven inserts.
    let record_len = 80_000;
    let mut inserted = Vec::new();
    let mut busy_at = None;

    for s in 0u32..50 {
        let ch = FakeChangeset::new(s, s + 1, vec![(true, "x".repeat(record_len))]);
        match j.store_changeset(&ch) {
            Ok(()) => inserted.push(ch),
            Err(Error::Busy) => {
                busy_at = Some(s);
                break;
            }
            Err(e) => panic!("unexpected error inserting changeset {s}: {e}"),
        }
    }

    let busy_at = busy_at.expect("expected store_changeset to eventually return Busy");
    assert!(busy_at > 0, "first insertion should not already be Busy");
    assert!(!inserted.is_empty());

    j.flush_mark().unwrap();
    assert_eq!(j.load_changesets(0).unwrap(), inserted);

    let retry = FakeChangeset::new(busy_at, busy_at + 1, vec![(true, "x".repeat(record_len))]);
    j.store_changeset(&retry).unwrap();
    assert!(j.check().unwrap().is_clean());
}

#[test]
fn scenario_3_serial_collision_drops_overlapping_prefix() {
    let (_dir, mut j) = open_journal(4 << 20, false, b"collision.test.");

    let ch = |from: u32, to: u32| FakeChangeset::new(from, to, vec![(true, format!("rr-{from}-{to}."))]);

    j.store_changeset(&ch(0, 1)).unwrap();
    j.store_changeset(&ch(1, 2)).unwrap();
    j.store_changeset(&ch(2, 2_147_483_647)).unwrap();
    j.store_changeset(&ch(2_147_483_647, 4_294_967_294)).unwrap();

    let colliding = ch(4_294_967_294, 1);
    assert!(matches!(j.store_changeset(&colliding), Err(Error::Busy)));

    j.flush_mark().unwrap();
    j.store_changeset(&colliding).unwrap();

    assert!(matches!(j.load_changesets(0), Err(Error::NotFound)));
    assert!(matches!(j.load_changesets(1), Err(Error::NotFound)));

    let remaining = j.load_changesets(2).unwrap();
    assert_eq!(
        remaining,
        vec![ch(2, 2_147_483_647), ch(2_147_483_647, 4_294_967_294), colliding]
    );
}

#[test]
fn scenario_4_merge_path_combines_unflushed_changesets() {
    let (_dir, mut j) = open_journal(policy::FSLIMIT_MIN, true, b"merge.test.");

    // `a` and `b` share a large run of padding records that cancel exactly
    // during merge (an add in `a`, a matching remove in `b`), so they inflate
    // occupancy past the merge threshold without affecting the final RR
    // counts. Neither changeset alone crosses the KEEP_FORMERGE threshold
    // (33% of a 1MiB fslimit); committed together they do.
    let mut a_records = vec![(true, "p.".to_string()), (true, "q.".to_string())];
    a_records.extend(padded_record('a', 390, 500));

    let mut b_records = vec![(false, "p.".to_string()), (true, "z.".to_string()), (false, "r.".to_string())];
    b_records.extend(padded_record('a', 390, 500).into_iter().map(|(_, s)| (false, s)));

    let a = FakeChangeset::new(0, 1, a_records);
    let b = FakeChangeset::new(1, 2, b_records);
    let c = FakeChangeset::new(2, 3, vec![(true, "s.".to_string())]);

    j.store_changeset(&a).unwrap();
    j.store_changeset(&b).unwrap();
    j.store_changeset(&c).unwrap();

    let loaded = j.load_changesets(0).unwrap();
    assert_eq!(loaded.len(), 2, "expected the merged changeset plus the latest non-merged one");

    let merged = &loaded[0];
    let additions: Vec<_> = merged.records.iter().filter(|(is_add, _)| *is_add).map(|(_, rr)| rr.as_str()).collect();
    let removals: Vec<_> = merged.records.iter().filter(|(is_add, _)| !*is_add).map(|(_, rr)| rr.as_str()).collect();
    assert_eq!(additions.len(), 2, "expected q. and z. to survive the merge");
    assert!(additions.contains(&"q."));
    assert!(additions.contains(&"z."));
    assert_eq!(removals, vec!["r."]);

    assert_eq!(loaded[1], c);
}

#[test]
fn scenario_5_dirty_cleanup_on_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let fslimit = policy::FSLIMIT_MIN;

    {
        let mut store = kv::store::Store::open(dir.path(), fslimit).unwrap();
        let mut txn = store.begin_write();

        let mut meta = journal::metadata::Metadata::fresh(b"dirty.test.");
        meta.dirty_serial = 7;
        meta.set(journal::metadata::DIRTY_SERIAL_VALID);
        journal::metadata::store_all(&mut txn, &meta).unwrap();

        let header = journal::codec::ChunkHeader { serial_to: 8, chunk_count: 3, this_chunk_size: 4 };
        let value = journal::codec::encode_chunk_value(&header, b"data");
        txn.insert(kv::store::Db::Data, &journal::codec::chunk_key(7, 0), &value).unwrap();
        txn.commit().unwrap();
    }

    let mut j: Journal<FakeCodec, StaticPolicy> = Journal::new(StaticPolicy(false));
    j.open(dir.path(), fslimit, b"dirty.test.").unwrap();

    assert_eq!(j.count().unwrap(), 0);
    assert!(j.check().unwrap().is_clean());
}

#[test]
fn scenario_6_resize_down_after_full_flush_reinitializes() {
    let dir = tempfile::tempdir().unwrap();

    let mut j: Journal<FakeCodec, StaticPolicy> = Journal::new(StaticPolicy(false));
    j.open(dir.path(), 10 << 20, b"resize.test.").unwrap();
    j.store_changeset(&FakeChangeset::new(0, 1, vec![(true, "a.resize.test.".into())])).unwrap();
    j.flush_mark().unwrap();
    j.close();

    let mut j2: Journal<FakeCodec, StaticPolicy> = Journal::new(StaticPolicy(false));
    j2.open(dir.path(), 2 << 20, b"resize.test.").unwrap();
    assert_eq!(j2.count().unwrap(), 0);
    assert!(j2.check().unwrap().is_clean());
}

#[test]
fn scenario_6_resize_down_without_flush_requires_retry() {
    let dir = tempfile::tempdir().unwrap();

    let mut j: Journal<FakeCodec, StaticPolicy> = Journal::new(StaticPolicy(false));
    j.open(dir.path(), 10 << 20, b"resize2.test.").unwrap();
    j.store_changeset(&FakeChangeset::new(0, 1, vec![(true, "a.resize2.test.".into())])).unwrap();
    j.close();

    let mut j2: Journal<FakeCodec, StaticPolicy> = Journal::new(StaticPolicy(false));
    let result = j2.open(dir.path(), 2 << 20, b"resize2.test.");
    assert!(matches!(result, Err(Error::RetryAfterFlush)));

    // On-disk state was left intact: reopening at the original capacity
    // still sees the unflushed changeset.
    let mut j3: Journal<FakeCodec, StaticPolicy> = Journal::new(StaticPolicy(false));
    j3.open(dir.path(), 10 << 20, b"resize2.test.").unwrap();
    assert_eq!(j3.count().unwrap(), 1);
}
