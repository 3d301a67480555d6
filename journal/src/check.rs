use kv::store::Db;

use crate::changeset::ChangesetCodec;
use crate::error::CResult;
use crate::iter::ChangesetWalk;
use crate::metadata::{DIRTY_SERIAL_VALID, LAST_FLUSHED_VALID, MERGED_SERIAL_VALID, SERIAL_TO_VALID};
use crate::txn::JournalTxn;

/// Outcome of a [`check`] pass: never mutates state, just reports what it saw.
#[derive(Debug, Default, Clone)]
pub struct CheckReport {
    pub info: Vec<String>,
    pub warnings: Vec<String>,
}

impl CheckReport {
    pub fn is_clean(&self) -> bool {
        self.warnings.is_empty()
    }
}

/// Read-only traversal validating invariants I1-I6. A broken chain surfaces as
/// a warning, not a hard error — the point of `check` is to report, not to
/// fail loudly, the one exception being a genuine KV error reading the store.
pub fn check<C: ChangesetCodec>(txn: &mut JournalTxn) -> CResult<CheckReport> {
    let mut report = CheckReport::default();
    let shadow = txn.shadow.clone();

    if !shadow.has(SERIAL_TO_VALID) {
        if txn.count(Db::Data)? > 0 {
            report.warnings.push("SERIAL_TO_VALID clear but main database is not empty".into());
        }
    } else {
        match ChangesetWalk::new(txn, shadow.first_serial, shadow.last_serial) {
            Err(e) => report.warnings.push(format!("cannot open chain at first_serial {}: {e}", shadow.first_serial)),
            Ok(mut walk) => {
                let mut count = 0usize;
                let mut prev_serial_to = None;
                loop {
                    match walk.next_changeset(txn) {
                        Ok(None) => break,
                        Ok(Some((serial_from, serial_to, _))) => {
                            if let Some(expected) = prev_serial_to {
                                if expected != serial_from {
                                    report.warnings.push(format!(
                                        "discontinuity: expected serial_from {expected}, found {serial_from}"
                                    ));
                                }
                            }
                            prev_serial_to = Some(serial_to);
                            count += 1;
                        }
                        Err(e) => {
                            report.warnings.push(format!("chain walk failed after {count} changesets: {e}"));
                            break;
                        }
                    }
                }
                report.info.push(format!("main database holds {count} changesets"));
                if prev_serial_to != Some(shadow.last_serial_to) {
                    report.warnings.push("last changeset's serial_to does not match last_serial_to".into());
                }
            }
        }
    }

    if shadow.has(LAST_FLUSHED_VALID) {
        let names_merged = shadow.has(MERGED_SERIAL_VALID) && shadow.last_flushed == shadow.merged_serial;
        if !names_merged {
            match ChangesetWalk::new(txn, shadow.last_flushed, shadow.last_flushed) {
                Ok(mut walk) => {
                    if matches!(walk.next_changeset(txn), Ok(None) | Err(_)) {
                        report.warnings.push("LAST_FLUSHED_VALID set but last_flushed names no changeset".into());
                    }
                }
                Err(_) => report.warnings.push("LAST_FLUSHED_VALID set but last_flushed names no changeset".into()),
            }
        }
    }

    if shadow.has(MERGED_SERIAL_VALID) {
        match ChangesetWalk::new_in(txn, Db::Merged, shadow.merged_serial, shadow.merged_serial) {
            Err(e) => report.warnings.push(format!("merged changeset {} unreadable: {e}", shadow.merged_serial)),
            Ok(mut walk) => match walk.next_changeset(txn) {
                Ok(Some((_, serial_to, _))) => {
                    if shadow.has(SERIAL_TO_VALID) && serial_to != shadow.first_serial {
                        report.warnings.push(
                            "merged changeset's serial_to does not lead into the oldest main-database changeset"
                                .into(),
                        );
                    }
                }
                _ => report.warnings.push("MERGED_SERIAL_VALID set but merged database is empty".into()),
            },
        }
        if txn.count(Db::Merged)? != 1 {
            report.warnings.push("merged database should contain exactly one changeset".into());
        }
    } else if txn.count(Db::Merged)? != 0 {
        report.warnings.push("MERGED_SERIAL_VALID clear but merged database is not empty".into());
    }

    if shadow.has(DIRTY_SERIAL_VALID) {
        report.warnings.push(format!("DIRTY_SERIAL_VALID set on dirty_serial {} (should clear on open)", shadow.dirty_serial));
    }

    Ok(report)
}
