// src/core/storage/mod.rs

//! The keyspace engine consulted by the command layer and the replication
//! core. Deliberately narrow: a sharded byte-string map per database with an
//! MVCC stamp on every value. Expiration, eviction and rich data types live
//! outside this core.

pub mod db;
pub mod mvcc;

pub use db::{Db, StoredValue};
pub use mvcc::MvccClock;
