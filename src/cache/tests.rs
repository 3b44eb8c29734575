//! Tests for the cache file: write-read behavior, index recovery and
//! corruption handling.

use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;

use proptest::prelude::*;
use tempfile::{tempdir, TempDir};

use super::format::*;
use super::*;
use crate::{Chunk, Direction, Error};

/// Helper to create a cache in a fresh temp directory
fn temp_cache() -> (TempDir, PathBuf, CacheFile) {
    let dir = tempdir().expect("Failed to create temp dir");
    let path = dir.path().join("converter.cache");
    let cache = CacheFile::open(&path).expect("Failed to open cache");
    (dir, path, cache)
}

fn sample_chunks() -> Vec<Chunk> {
    vec![
        Chunk::client(&b"GET / HTTP/1.1\r\n\r\n"[..]),
        Chunk::server(&b"HTTP/1.1 200 OK\r\n"[..]),
        Chunk::server(&b"content-length: 0\r\n\r\n"[..]),
        Chunk::client(&b"GET /favicon.ico HTTP/1.1\r\n\r\n"[..]),
    ]
}

// ============================================================================
// Write-Read Tests
// ============================================================================

#[test]
fn test_roundtrip_alternating() {
    let (_dir, _path, cache) = temp_cache();
    let chunks = vec![
        Chunk::client(&b"hello"[..]),
        Chunk::server(&b"world!"[..]),
        Chunk::client(&b"bye"[..]),
    ];
    cache.set_data(1, &chunks).unwrap();

    let data = cache.data(1).unwrap();
    assert_eq!(data.chunks, chunks);
    assert_eq!(data.client_bytes, 8);
    assert_eq!(data.server_bytes, 6);
}

#[test]
fn test_roundtrip_same_direction_adjacent() {
    let (_dir, _path, cache) = temp_cache();
    let chunks = sample_chunks();
    cache.set_data(7, &chunks).unwrap();

    let data = cache.data(7).unwrap();
    assert_eq!(data.chunks, chunks);
    let client: usize = chunks
        .iter()
        .filter(|c| c.direction == Direction::ClientToServer)
        .map(Chunk::len)
        .sum();
    assert_eq!(data.client_bytes, client as u64);
}

#[test]
fn test_roundtrip_server_first() {
    let (_dir, _path, cache) = temp_cache();
    let chunks = vec![Chunk::server(&b"220 ready"[..]), Chunk::client(&b"HELO"[..])];
    cache.set_data(3, &chunks).unwrap();
    assert_eq!(cache.data(3).unwrap().chunks, chunks);
}

#[test]
fn test_empty_chunks_are_dropped() {
    let (_dir, _path, cache) = temp_cache();
    let chunks = vec![
        Chunk::client(&b"a"[..]),
        Chunk::client(Vec::new()),
        Chunk::server(Vec::new()),
        Chunk::client(&b"b"[..]),
        Chunk::server(&b"c"[..]),
    ];
    cache.set_data(9, &chunks).unwrap();

    let data = cache.data(9).unwrap();
    assert_eq!(
        data.chunks,
        vec![
            Chunk::client(&b"a"[..]),
            Chunk::client(&b"b"[..]),
            Chunk::server(&b"c"[..]),
        ]
    );
    assert_eq!(data.client_bytes, 2);
    assert_eq!(data.server_bytes, 1);
}

#[test]
fn test_stream_without_chunks() {
    let (_dir, _path, cache) = temp_cache();
    cache.set_data(5, &[]).unwrap();

    assert!(cache.contains(5));
    let data = cache.data(5).unwrap();
    assert!(data.is_empty());
    assert_eq!(data.client_bytes, 0);
    assert_eq!(data.server_bytes, 0);
    // id + terminator
    assert_eq!(cache.file_size(), 10);
}

#[test]
fn test_large_chunk() {
    let (_dir, path, cache) = temp_cache();
    let big: Vec<u8> = (0..3 * 1024 * 1024).map(|i| (i % 251) as u8).collect();
    let chunks = vec![
        Chunk::client(&b"x"[..]),
        Chunk::server(big.clone()),
        Chunk::client(vec![0u8; 128]),
        Chunk::server(vec![1u8; 16384]),
    ];
    cache.set_data(11, &chunks).unwrap();
    assert_eq!(cache.data(11).unwrap().chunks, chunks);

    drop(cache);
    let reopened = CacheFile::open(&path).unwrap();
    let data = reopened.data(11).unwrap();
    assert_eq!(data.chunks, chunks);
    assert_eq!(data.server_bytes, big.len() as u64 + 16384);
}

#[test]
fn test_unknown_stream_is_empty() {
    let (_dir, _path, cache) = temp_cache();
    cache.set_data(1, &sample_chunks()).unwrap();

    let data = cache.data(2).unwrap();
    assert_eq!(data, StreamData::default());
}

#[test]
fn test_overwrite_appends_new_record() {
    let (_dir, path, cache) = temp_cache();
    cache.set_data(1, &[Chunk::client(&b"old"[..])]).unwrap();
    let size_after_first = cache.file_size();
    cache.set_data(1, &[Chunk::client(&b"new!"[..])]).unwrap();

    assert!(cache.file_size() > size_after_first);
    assert_eq!(cache.len(), 1);
    assert_eq!(cache.data(1).unwrap().chunks, vec![Chunk::client(&b"new!"[..])]);

    drop(cache);
    let reopened = CacheFile::open(&path).unwrap();
    assert_eq!(reopened.len(), 1);
    assert_eq!(
        reopened.data(1).unwrap().chunks,
        vec![Chunk::client(&b"new!"[..])]
    );
}

#[test]
fn test_on_disk_layout() {
    let (_dir, path, cache) = temp_cache();
    let chunks = vec![
        Chunk::server(&b"S1"[..]),
        Chunk::client(&b"C1"[..]),
        Chunk::client(&b"C2"[..]),
    ];
    cache.set_data(0x0102, &chunks).unwrap();

    let bytes = fs::read(&path).unwrap();
    let mut expected = 0x0102u64.to_le_bytes().to_vec();
    expected.extend_from_slice(&[0, 2, 2, 0, 2, 0, 0]);
    expected.extend_from_slice(b"C1C2S1");
    assert_eq!(bytes, expected);

    let info = cache.stream_info(0x0102).unwrap();
    assert_eq!(info.offset, STREAM_ID_SIZE as u64);
    assert_eq!(info.size, (bytes.len() - STREAM_ID_SIZE) as u64);
}

// ============================================================================
// Recovery Tests
// ============================================================================

#[test]
fn test_reopen_rebuilds_index() {
    let (_dir, path, cache) = temp_cache();
    for id in 0..20u64 {
        let chunks = vec![
            Chunk::client(format!("request {}", id).into_bytes()),
            Chunk::server(vec![id as u8; id as usize * 10]),
        ];
        cache.set_data(id * 3, &chunks).unwrap();
    }
    let infos: Vec<_> = cache
        .stream_ids()
        .into_iter()
        .map(|id| (id, cache.stream_info(id)))
        .collect();
    let size = cache.file_size();
    drop(cache);

    let reopened = CacheFile::open(&path).unwrap();
    assert_eq!(reopened.file_size(), size);
    let reopened_infos: Vec<_> = reopened
        .stream_ids()
        .into_iter()
        .map(|id| (id, reopened.stream_info(id)))
        .collect();
    assert_eq!(reopened_infos, infos);
}

#[test]
fn test_append_after_reopen() {
    let (_dir, path, cache) = temp_cache();
    cache.set_data(1, &sample_chunks()).unwrap();
    drop(cache);

    let reopened = CacheFile::open(&path).unwrap();
    reopened.set_data(2, &[Chunk::server(&b"later"[..])]).unwrap();
    assert_eq!(reopened.data(1).unwrap().chunks, sample_chunks());
    assert_eq!(
        reopened.data(2).unwrap().chunks,
        vec![Chunk::server(&b"later"[..])]
    );
    drop(reopened);

    let again = CacheFile::open(&path).unwrap();
    assert_eq!(again.stream_ids(), vec![1, 2]);
}

#[test]
fn test_tombstoned_record_is_skipped() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("converter.cache");

    let dead = vec![Chunk::client(&b"dead"[..])];
    let live = vec![Chunk::server(&b"live"[..])];
    let mut bytes = encode_header(TOMBSTONE_ID, &dead);
    bytes.extend_from_slice(b"dead");
    bytes.extend_from_slice(&encode_header(4, &live));
    bytes.extend_from_slice(b"live");
    fs::write(&path, &bytes).unwrap();

    let cache = CacheFile::open(&path).unwrap();
    assert_eq!(cache.stream_ids(), vec![4]);
    assert!(!cache.contains(TOMBSTONE_ID));
    assert_eq!(cache.file_size(), bytes.len() as u64);
    assert_eq!(cache.data(4).unwrap().chunks, live);
}

#[test]
fn test_truncated_stream_id_is_corrupt() {
    let (_dir, path, cache) = temp_cache();
    cache.set_data(1, &sample_chunks()).unwrap();
    drop(cache);

    let mut file = fs::OpenOptions::new().append(true).open(&path).unwrap();
    file.write_all(&[1, 2, 3]).unwrap();
    drop(file);

    let result = CacheFile::open(&path);
    assert!(matches!(result, Err(Error::Corrupt { .. })));
}

#[test]
fn test_truncated_size_sequence_is_corrupt() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("converter.cache");
    let mut bytes = 1u64.to_le_bytes().to_vec();
    bytes.extend_from_slice(&[5, 0]);
    fs::write(&path, &bytes).unwrap();

    match CacheFile::open(&path) {
        Err(Error::Corrupt { offset, .. }) => assert_eq!(offset, 0),
        other => panic!("expected corruption, got {:?}", other.map(|c| c.len())),
    }
}

#[test]
fn test_truncated_payload_is_corrupt() {
    let (_dir, path, cache) = temp_cache();
    cache.set_data(1, &[Chunk::client(&b"complete"[..])]).unwrap();
    let first_len = cache.file_size();
    cache.set_data(2, &[Chunk::client(&b"truncated"[..])]).unwrap();
    let full_len = cache.file_size();
    drop(cache);

    let file = fs::OpenOptions::new().write(true).open(&path).unwrap();
    file.set_len(full_len - 3).unwrap();
    drop(file);

    match CacheFile::open(&path) {
        Err(Error::Corrupt { offset, .. }) => assert_eq!(offset, first_len),
        other => panic!("expected corruption, got {:?}", other.map(|c| c.len())),
    }
}

#[test]
fn test_size_sum_overflow_is_corrupt() {
    let (_dir, path, cache) = temp_cache();
    cache.set_data(1, &[Chunk::client(&b"intact"[..])]).unwrap();
    let first_len = cache.file_size();
    drop(cache);

    let mut record = 2u64.to_le_bytes().to_vec();
    for size in [u64::MAX, 1, u64::MAX, 0, 0] {
        encode_varint(size, &mut record);
    }
    let mut file = fs::OpenOptions::new().append(true).open(&path).unwrap();
    file.write_all(&record).unwrap();
    drop(file);

    match CacheFile::open(&path) {
        Err(Error::Corrupt { offset, .. }) => assert_eq!(offset, first_len),
        other => panic!("expected corruption, got {:?}", other.map(|c| c.len())),
    }
}

#[test]
fn test_open_empty_file() {
    let (_dir, path, cache) = temp_cache();
    assert!(cache.is_empty());
    assert_eq!(cache.file_size(), 0);
    assert!(path.exists());
}

// ============================================================================
// Reset Tests
// ============================================================================

#[test]
fn test_reset_clears_everything() {
    let (_dir, path, cache) = temp_cache();
    cache.set_data(1, &sample_chunks()).unwrap();
    cache.set_data(2, &sample_chunks()).unwrap();

    cache.reset().unwrap();
    assert!(cache.is_empty());
    assert!(!cache.contains(1));
    assert!(cache.data(2).unwrap().is_empty());
    assert_eq!(cache.file_size(), 0);
    assert_eq!(fs::metadata(&path).unwrap().len(), 0);
}

#[test]
fn test_write_after_reset_starts_at_zero() {
    let (_dir, path, cache) = temp_cache();
    cache.set_data(1, &sample_chunks()).unwrap();
    cache.reset().unwrap();
    cache.set_data(2, &[Chunk::client(&b"fresh"[..])]).unwrap();

    let info = cache.stream_info(2).unwrap();
    assert_eq!(info.offset, STREAM_ID_SIZE as u64);
    assert_eq!(fs::metadata(&path).unwrap().len(), cache.file_size());
    drop(cache);

    let reopened = CacheFile::open(&path).unwrap();
    assert_eq!(reopened.stream_ids(), vec![2]);
}

// ============================================================================
// Concurrency Tests
// ============================================================================

#[test]
fn test_concurrent_readers_and_writer() {
    let (_dir, _path, cache) = temp_cache();
    let cache = Arc::new(cache);
    let stable = sample_chunks();
    cache.set_data(0, &stable).unwrap();

    let writer = {
        let cache = Arc::clone(&cache);
        thread::spawn(move || {
            for id in 1..200u64 {
                let chunks = vec![
                    Chunk::client(vec![id as u8; 1000]),
                    Chunk::server(vec![!(id as u8); 3000]),
                ];
                cache.set_data(id, &chunks).unwrap();
            }
        })
    };

    let readers: Vec<_> = (0..4)
        .map(|_| {
            let cache = Arc::clone(&cache);
            let stable = stable.clone();
            thread::spawn(move || {
                for _ in 0..200 {
                    assert_eq!(cache.data(0).unwrap().chunks, stable);
                    for id in cache.stream_ids() {
                        let data = cache.data(id).unwrap();
                        if id != 0 {
                            assert_eq!(data.client_bytes, 1000);
                            assert_eq!(data.server_bytes, 3000);
                        }
                    }
                }
            })
        })
        .collect();

    writer.join().unwrap();
    for reader in readers {
        reader.join().unwrap();
    }
    assert_eq!(cache.len(), 200);
}

#[test]
fn test_stats() {
    let (_dir, _path, cache) = temp_cache();
    cache.set_data(1, &[Chunk::client(&b"abc"[..])]).unwrap();
    let stats = cache.stats();
    assert_eq!(stats.streams, 1);
    // id + [3, 0, 0] + "abc"
    assert_eq!(stats.file_size, 8 + 3 + 3);
}

// ============================================================================
// Property Tests
// ============================================================================

fn chunk_strategy() -> impl Strategy<Value = Vec<Chunk>> {
    prop::collection::vec(
        (any::<bool>(), prop::collection::vec(any::<u8>(), 0..64)),
        0..24,
    )
    .prop_map(|raw| {
        raw.into_iter()
            .map(|(server, content)| {
                let direction = if server {
                    Direction::ServerToClient
                } else {
                    Direction::ClientToServer
                };
                Chunk::new(direction, content)
            })
            .collect()
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn test_roundtrip_random_chunks(chunks in chunk_strategy(), stream_id in 0u64..u64::MAX) {
        let (_dir, path, cache) = temp_cache();
        cache.set_data(stream_id, &chunks).unwrap();

        let expected: Vec<Chunk> = chunks.iter().filter(|c| !c.is_empty()).cloned().collect();
        let client_bytes: u64 = chunks
            .iter()
            .filter(|c| c.direction == Direction::ClientToServer)
            .map(|c| c.len() as u64)
            .sum();
        let server_bytes: u64 = chunks
            .iter()
            .filter(|c| c.direction == Direction::ServerToClient)
            .map(|c| c.len() as u64)
            .sum();

        let data = cache.data(stream_id).unwrap();
        prop_assert_eq!(&data.chunks, &expected);
        prop_assert_eq!(data.client_bytes, client_bytes);
        prop_assert_eq!(data.server_bytes, server_bytes);

        // The recovery scan must agree with the writer.
        drop(cache);
        let reopened = CacheFile::open(&path).unwrap();
        prop_assert_eq!(reopened.data(stream_id).unwrap().chunks, expected);
    }
}
