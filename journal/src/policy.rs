/// Minimum on-disk capacity a journal is allowed to open with.
pub const FSLIMIT_MIN: u64 = 1024 * 1024;

/// Fraction of `fslimit` kept free when no merged changeset exists.
pub const KEEP_FREE: f32 = 0.5;
/// Fraction kept free when a merged changeset is already present.
pub const KEEP_MERGED: f32 = 0.33;
/// Fraction kept free when merge is enabled but nothing is merged yet.
pub const KEEP_FORMERGE: f32 = 0.67;
/// Reclaim this many times the minimum required bytes, to amortize the cost
/// of repeated reclamation passes.
pub const DISPOSE_RATIO: u64 = 3;
/// A single insertion forces a mid-transaction commit once it has written more
/// than this fraction of `fslimit` in one go.
pub const MAX_INSERT_TXN: f32 = 0.05;

/// The external "should the journal merge instead of waiting for a zone-file
/// flush" predicate, consulted fresh on every probe so live reconfiguration
/// takes effect immediately.
pub trait MergePolicy {
    fn merge_allowed(&self, zone_name: &[u8]) -> bool;
}

/// A fixed answer, for tests and for callers without a live config source.
pub struct StaticPolicy(pub bool);

impl MergePolicy for StaticPolicy {
    fn merge_allowed(&self, _zone_name: &[u8]) -> bool {
        self.0
    }
}
