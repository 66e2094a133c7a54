//! # loam: an ordered key-value store for blockchain state.
//!
//! loam keeps one mutable index on disk and serves many concurrent readers
//! from consistent snapshots of it. It is optimized for the access pattern
//! of a chain's state store: reads dominate, a single writer advances the
//! head, and past revisions stay readable for as long as someone holds
//! them.
//!
//! The index is a radix trie with branching factor 64: keys are transcoded
//! from bytes into 6-bit nibbles on the way in and back on the way out,
//! which keeps node layouts compact and preserves lexicographic order.
//! Nodes come in two shapes — a leaf holding `(key suffix, value)` and an
//! inner node holding `(prefix, optional value, branch bitmap, children)`
//! — and live as plain byte records in a copy-compacting arena managed by
//! the `marl` crate. Nodes refer to each other by 40-bit object ids, never
//! by pointers, so the arena's background worker can relocate bytes
//! underneath live readers.
//!
//! Writes are copy-on-write with structural sharing. Every inner node
//! records the session version that created it; a write session may mutate
//! its own nodes in place but must clone anything older before touching
//! it, so a node that has been exposed to readers is never modified.
//! Publishing is a single atomic swap of the database's root object id
//! (retain new, release old); a reader that resolved the previous root
//! keeps an intact tree until it lets go of it.
//!
//! Reference counts in the object table track sharing between revisions.
//! When a count saturates, `retain` reports "must copy" and the writer
//! clones the subtree instead — correctness never depends on counts being
//! exact upward, only on never hitting zero early. After a crash the
//! counts are rebuilt by a mark/sweep pass over the published root
//! (`start_collect_garbage` / `recursive_retain` / `end_collect_garbage`).

pub mod db;
pub mod iter;

mod key;
mod node;

pub use db::{Database, DbConfig, DbStats, ReadSession, WriteSession};
pub use iter::TrieIter;
pub use marl::{AccessMode, ObjectId};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DbError {
    #[error(transparent)]
    Store(#[from] marl::StoreError),
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
    #[error("key too long")]
    KeyTooLong,
    #[error("value too large")]
    ValueTooLarge,
    #[error("reference count exhausted for object {0}")]
    RefsExhausted(u64),
    #[error("database is read-only")]
    ReadOnly,
}

pub type Result<T> = std::result::Result<T, DbError>;
