//! Durable on-disk state: atomic file primitives, typed parquet tables,
//! and the append-only execution ledger.

pub mod atomic;
pub mod ledger;
pub mod tables;
