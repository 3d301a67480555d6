//! `kv` is a small embedded ordered key-value store: crash-consistent,
//! single-process, with three named sub-databases sharing one write-ahead log
//! so a transaction spanning more than one of them commits atomically.
//!
//! ## Getting started
//!
//! ```rust
//! use kv::store::{Db, Store};
//!
//! fn main() -> Result<(), kv::error::Error> {
//!     let dir = tempfile::tempdir().unwrap();
//!     let mut store = Store::open(dir.path(), 1 << 20)?;
//!
//!     let mut txn = store.begin_write();
//!     txn.insert(Db::Data, b"a", b"1")?;
//!     txn.insert(Db::Meta, b"first_serial", &1u32.to_be_bytes())?;
//!     txn.commit()?;
//!
//!     let mut txn = store.begin_read();
//!     assert_eq!(txn.find(Db::Data, b"a")?, Some(b"1".to_vec()));
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod log;
pub mod store;
