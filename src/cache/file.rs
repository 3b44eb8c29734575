//! Append-only cache file with an in-memory stream index.

use ahash::AHashMap;
use parking_lot::RwLock;
use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use super::format::*;
use crate::fingerprint::ExecutableFingerprint;
use crate::{Chunk, Direction, Error, Result};

/// Buffer size used for the recovery scan and for appends.
const IO_BUFFER_SIZE: usize = 64 * 1024;

/// Location of one record, measured from the end of its stream id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamInfo {
    pub offset: u64,
    pub size: u64,
}

/// Converted content of one stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamData {
    pub chunks: Vec<Chunk>,
    pub client_bytes: u64,
    pub server_bytes: u64,
}

impl StreamData {
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }
}

/// Snapshot of cache occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    /// Number of indexed streams
    pub streams: usize,
    /// Bytes in the file, dead records included
    pub file_size: u64,
}

struct Inner {
    file: File,
    index: AHashMap<u64, StreamInfo>,
    file_size: u64,
}

/// Persistent cache of converted streams.
///
/// Records are appended and never modified in place. Writing a stream again
/// appends a new record and repoints the index; the old bytes stay in the
/// file. The index is rebuilt from the file on every open.
///
/// # Example
///
/// ```ignore
/// use convcache::{CacheFile, Chunk};
/// use std::path::Path;
///
/// let cache = CacheFile::open(Path::new("converter.cache"))?;
/// cache.set_data(42, &[Chunk::client(&b"GET /"[..]), Chunk::server(&b"200"[..])])?;
///
/// let data = cache.data(42)?;
/// assert_eq!(data.client_bytes, 5);
/// ```
pub struct CacheFile {
    path: PathBuf,
    inner: RwLock<Inner>,
}

impl CacheFile {
    /// Open a cache file, creating it if absent, and rebuild its index.
    ///
    /// Any malformed or truncated record fails the open with
    /// [`Error::Corrupt`].
    pub fn open(path: &Path) -> Result<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let (index, file_size) = scan(&file)?;

        // Appends go to the end of the scanned content.
        file.seek(SeekFrom::Start(file_size))?;

        log::debug!(
            "Opened cache {:?}: {} streams, {} bytes",
            path,
            index.len(),
            file_size
        );

        Ok(Self {
            path: path.to_path_buf(),
            inner: RwLock::new(Inner {
                file,
                index,
                file_size,
            }),
        })
    }

    /// Open the cache belonging to a converter executable.
    ///
    /// The executable's fingerprint is kept in a sidecar file next to the
    /// cache. When the executable has changed since the cache was written,
    /// the cache is reset before being returned.
    pub fn open_for_executable(path: &Path, executable: &Path) -> Result<Self> {
        let cache = Self::open(path)?;
        let sidecar = ExecutableFingerprint::sidecar_path(path);
        let current = ExecutableFingerprint::compute(executable)?;

        let stale = match ExecutableFingerprint::load(&sidecar)? {
            Some(stored) => stored != current,
            None => !cache.is_empty(),
        };
        if stale {
            log::info!(
                "Converter {:?} changed, resetting cache {:?}",
                executable,
                path
            );
            cache.reset()?;
        }
        current.save(&sidecar)?;
        Ok(cache)
    }

    /// Path of the underlying file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the converted chunks of a stream.
    ///
    /// An unknown stream yields empty data, not an error.
    pub fn data(&self, stream_id: u64) -> Result<StreamData> {
        let inner = self.inner.read();

        let info = match inner.index.get(&stream_id) {
            Some(info) => *info,
            None => return Ok(StreamData::default()),
        };
        let size = usize::try_from(info.size).map_err(|_| Error::RecordTooLarge(info.size))?;

        let mut record = vec![0u8; size];
        read_exact_at(&inner.file, &mut record, info.offset)?;

        let mut cursor = record.as_slice();
        let seq = SizeSequence::read(&mut cursor)?;
        let chunks = seq.split_payload(cursor)?;

        Ok(StreamData {
            chunks,
            client_bytes: seq.client_bytes,
            server_bytes: seq.server_bytes,
        })
    }

    /// Append a record for a stream and point the index at it.
    ///
    /// A stream that is already cached keeps its old record as dead bytes.
    /// On error the index is left untouched, but a partially written record
    /// may remain at the end of the file.
    pub fn set_data(&self, stream_id: u64, chunks: &[Chunk]) -> Result<()> {
        let mut inner = self.inner.write();
        let header = encode_header(stream_id, chunks);

        let written = append_record(&mut inner.file, &header, chunks);
        let record_len = match written {
            Ok(len) => len,
            Err(e) => {
                if let Ok(pos) = inner.file.stream_position() {
                    inner.file_size = pos;
                }
                log::warn!("Failed to append stream {} to cache: {}", stream_id, e);
                return Err(e.into());
            }
        };

        let id_end = inner.file_size + STREAM_ID_SIZE as u64;
        let size = record_len - STREAM_ID_SIZE as u64;
        inner.index.insert(
            stream_id,
            StreamInfo {
                offset: id_end,
                size,
            },
        );
        inner.file_size = id_end + size;
        Ok(())
    }

    /// Empty the cache: truncate the file and clear the index.
    pub fn reset(&self) -> Result<()> {
        let mut inner = self.inner.write();
        inner.file.set_len(0)?;
        inner.file.seek(SeekFrom::Start(0))?;
        inner.index.clear();
        inner.file_size = 0;
        log::info!("Reset cache {:?}", self.path);
        Ok(())
    }

    /// Check whether a stream is cached.
    pub fn contains(&self, stream_id: u64) -> bool {
        self.inner.read().index.contains_key(&stream_id)
    }

    /// Location of a stream's record, if cached.
    pub fn stream_info(&self, stream_id: u64) -> Option<StreamInfo> {
        self.inner.read().index.get(&stream_id).copied()
    }

    /// Number of cached streams.
    pub fn len(&self) -> usize {
        self.inner.read().index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes in the file, dead records included.
    pub fn file_size(&self) -> u64 {
        self.inner.read().file_size
    }

    /// Cached stream ids in ascending order.
    pub fn stream_ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.inner.read().index.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.read();
        CacheStats {
            streams: inner.index.len(),
            file_size: inner.file_size,
        }
    }
}

/// Walk every record from the start of the file.
///
/// Returns the index and the offset of the end of the last record.
fn scan(file: &File) -> Result<(AHashMap<u64, StreamInfo>, u64)> {
    let mut reader = BufReader::with_capacity(IO_BUFFER_SIZE, file);
    let mut index = AHashMap::new();
    let mut offset = 0u64;
    let mut tombstones = 0usize;

    loop {
        let record_start = offset;
        let stream_id = match read_stream_id(&mut reader) {
            Ok(Some(id)) => id,
            Ok(None) => break,
            Err(e) => return Err(Error::corrupt(record_start, e.to_string())),
        };
        offset += STREAM_ID_SIZE as u64;

        let seq = SizeSequence::read(&mut reader).map_err(|e| match e {
            Error::Io(err) => Error::corrupt(record_start, format!("size sequence: {}", err)),
            other => Error::corrupt(record_start, other.to_string()),
        })?;

        let record_len = seq
            .record_len()
            .map_err(|e| Error::corrupt(record_start, e.to_string()))?;
        let payload = record_len - seq.encoded_len;
        let skipped = io::copy(&mut (&mut reader).take(payload), &mut io::sink())?;
        if skipped != payload {
            return Err(Error::corrupt(
                record_start,
                format!("payload truncated: {} of {} bytes", skipped, payload),
            ));
        }

        if stream_id == TOMBSTONE_ID {
            tombstones += 1;
        } else {
            index.insert(
                stream_id,
                StreamInfo {
                    offset,
                    size: record_len,
                },
            );
        }
        offset += record_len;
    }

    log::debug!(
        "Indexed {} streams ({} tombstones skipped), {} bytes",
        index.len(),
        tombstones,
        offset
    );
    Ok((index, offset))
}

/// Write one record at the current cursor. Returns the bytes written.
fn append_record(file: &mut File, header: &[u8], chunks: &[Chunk]) -> io::Result<u64> {
    let mut writer = BufWriter::with_capacity(IO_BUFFER_SIZE, file);
    let mut written = header.len() as u64;
    writer.write_all(header)?;

    for direction in [Direction::ClientToServer, Direction::ServerToClient] {
        for chunk in chunks.iter().filter(|c| c.direction == direction) {
            writer.write_all(&chunk.content)?;
            written += chunk.len() as u64;
        }
    }

    writer.flush()?;
    Ok(written)
}

/// Positional read that leaves the shared cursor alone.
fn read_exact_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.read_exact_at(buf, offset)
}
