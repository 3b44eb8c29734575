//! Persistent conversion cache.
//!
//! One append-only file holds a record per converted stream. An in-memory
//! index maps stream ids to record locations and is rebuilt by scanning the
//! file whenever it is opened; the file is the source of truth.
//!
//! # File Structure
//!
//! ```text
//! +------------------+
//! |     RECORD 0     |  stream id + size sequence + client bytes + server bytes
//! +------------------+
//! |     RECORD 1     |
//! +------------------+
//! |       ...        |
//! +------------------+
//! ```
//!
//! A stream written twice has two records; only the last one is indexed.

mod file;
pub mod format;

#[cfg(test)]
mod tests;

pub use file::{CacheFile, CacheStats, StreamData, StreamInfo};
pub use format::{SizeSequence, STREAM_ID_SIZE, TOMBSTONE_ID};
