//! Convcache - conversion cache and filter process layer for stream analysis.
//!
//! Captured bidirectional streams are passed through external filter
//! executables ("converters"). Filtering is expensive, so the converted
//! output of every stream is stored in an append-only cache file and
//! served from there on later requests.
//!
//! # Features
//!
//! - **Append-only cache file**: one record per stream, varint chunk sizes
//! - **Index recovery**: the in-memory index is rebuilt by scanning the file
//! - **Concurrent access**: many readers, one writer, positional reads
//! - **Filter processes**: line-oriented coprocess with bounded queues
//! - **Stale cache detection**: executable fingerprints trigger a reset
//!
//! # Quick Start
//!
//! ```ignore
//! use convcache::{CacheFile, Chunk, ConverterProcess};
//! use std::path::Path;
//!
//! let cache = CacheFile::open(Path::new("base64.cache"))?;
//!
//! let data = cache.data(42)?;
//! if data.is_empty() {
//!     let mut process = ConverterProcess::new("base64", "/opt/converters/base64");
//!     process.send(b"aGVsbG8=\n".to_vec());
//!     let line = process.recv().unwrap_or_default();
//!     process.close_input();
//!
//!     cache.set_data(42, &[Chunk::client(line)])?;
//! }
//! ```
//!
//! # Record Layout
//!
//! ```text
//! stream_id (u64 LE) | varint sizes ... 0x00 0x00 | client bytes | server bytes
//! ```
//!
//! Sizes alternate client/server starting with the client. A lone zero
//! flips the direction; two zeros end the list. Stream id `u64::MAX` marks
//! a dead record that is skipped when the index is rebuilt.

mod direction;
mod error;
mod fingerprint;

pub mod cache;
pub mod config;
pub mod process;

// Re-export core types
pub use direction::{Chunk, Direction};
pub use error::{Error, Result};

// Re-export cache types
pub use cache::{CacheFile, CacheStats, StreamData, StreamInfo, TOMBSTONE_ID};

// Re-export converter types
pub use config::ConverterConfig;
pub use fingerprint::ExecutableFingerprint;
pub use process::{ConverterProcess, ProcessState};
