//! On-disk record format of the conversion cache.
//!
//! File structure:
//! ```text
//! +------------------------+
//! |  STREAM ID (8 bytes)   |  u64 little-endian, u64::MAX = tombstone
//! +------------------------+
//! |  SIZE SEQUENCE         |  varint chunk sizes, ends with 0x00 0x00
//! +------------------------+
//! |  CLIENT BYTES          |  all client-to-server chunks, in order
//! +------------------------+
//! |  SERVER BYTES          |  all server-to-client chunks, in order
//! +------------------------+
//! |  next record ...       |
//! +------------------------+
//! ```
//!
//! Chunk sizes alternate direction starting with client-to-server. A single
//! zero size flips the expected direction without producing a chunk; two
//! consecutive zeros end the sequence.

use std::io::{self, Read};

use crate::{Chunk, Direction, Error, Result};

/// Size of the stream id field preceding each record.
pub const STREAM_ID_SIZE: usize = 8;

/// Stream id marking an invalidated record. Skipped when rebuilding the index.
pub const TOMBSTONE_ID: u64 = u64::MAX;

/// Two zero-valued sizes ending a size sequence.
pub const TERMINATOR: [u8; 2] = [0, 0];

/// Longest varint needed for a u64 (ceil(64 / 7)).
pub const MAX_VARINT_LEN: usize = 10;

/// Encode `value` as a big-endian 7-bit group varint, appending to `out`.
///
/// Every byte except the last has its high bit set. Returns the number of
/// bytes written.
pub fn encode_varint(mut value: u64, out: &mut Vec<u8>) -> usize {
    let mut buf = [0u8; MAX_VARINT_LEN];
    let mut pos = buf.len();
    let mut flag = 0u8;
    loop {
        pos -= 1;
        buf[pos] = (value & 0x7f) as u8 | flag;
        flag = 0x80;
        value >>= 7;
        if value == 0 {
            break;
        }
    }
    out.extend_from_slice(&buf[pos..]);
    buf.len() - pos
}

/// Decode one varint from `reader`.
///
/// Returns the value and the number of bytes consumed. A reader that ends
/// before a byte with a clear high bit yields `UnexpectedEof`.
pub fn read_varint<R: Read>(reader: &mut R) -> Result<(u64, usize)> {
    let mut value = 0u64;
    let mut consumed = 0usize;
    let mut byte = [0u8; 1];
    loop {
        reader.read_exact(&mut byte)?;
        consumed += 1;
        if value > (u64::MAX >> 7) {
            return Err(Error::VarintOverflow);
        }
        value = (value << 7) | u64::from(byte[0] & 0x7f);
        if byte[0] < 0x80 {
            return Ok((value, consumed));
        }
    }
}

/// Decoded size sequence of one record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SizeSequence {
    /// Chunk sizes with their positional direction, placeholders included
    pub sizes: Vec<(Direction, u64)>,
    /// Bytes occupied by the encoded sequence, terminator included
    pub encoded_len: u64,
    /// Sum of client-to-server sizes
    pub client_bytes: u64,
    /// Sum of server-to-client sizes
    pub server_bytes: u64,
}

impl SizeSequence {
    /// Read a size sequence up to and including its double-zero terminator.
    pub fn read<R: Read>(reader: &mut R) -> Result<Self> {
        let mut seq = SizeSequence::default();
        let mut direction = Direction::ClientToServer;
        let mut prev_was_zero = false;
        loop {
            let (size, consumed) = read_varint(reader)?;
            seq.encoded_len = checked_sum(seq.encoded_len, consumed as u64)?;
            if size == 0 && prev_was_zero {
                // The first zero of the terminator was recorded as a placeholder.
                seq.sizes.pop();
                return Ok(seq);
            }
            seq.sizes.push((direction, size));
            match direction {
                Direction::ClientToServer => {
                    seq.client_bytes = checked_sum(seq.client_bytes, size)?
                }
                Direction::ServerToClient => {
                    seq.server_bytes = checked_sum(seq.server_bytes, size)?
                }
            }
            // The whole record must stay addressable as a u64 length.
            seq.record_len()?;
            prev_was_zero = size == 0;
            direction = direction.reverse();
        }
    }

    /// Total payload bytes following the sequence.
    pub fn payload_len(&self) -> Result<u64> {
        checked_sum(self.client_bytes, self.server_bytes)
    }

    /// Full record length measured from the end of the stream id.
    pub fn record_len(&self) -> Result<u64> {
        checked_sum(self.encoded_len, self.payload_len()?)
    }

    /// Split a payload (client block then server block) back into chunks.
    ///
    /// Zero-length entries are direction flips and produce no chunk.
    pub fn split_payload(&self, payload: &[u8]) -> Result<Vec<Chunk>> {
        let client_len = usize::try_from(self.client_bytes)
            .map_err(|_| Error::RecordTooLarge(self.client_bytes))?;
        let total = self.payload_len()?;
        let payload_len = usize::try_from(total).map_err(|_| Error::RecordTooLarge(total))?;
        if payload.len() < payload_len {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "record payload shorter than its size sequence",
            )
            .into());
        }

        let (mut client, mut server) = payload[..payload_len].split_at(client_len);
        let mut chunks = Vec::with_capacity(self.sizes.len());
        for &(direction, size) in &self.sizes {
            if size == 0 {
                continue;
            }
            let block = match direction {
                Direction::ClientToServer => &mut client,
                Direction::ServerToClient => &mut server,
            };
            let size = match usize::try_from(size) {
                Ok(size) if size <= block.len() => size,
                _ => return Err(Error::RecordTooLarge(size)),
            };
            let (content, rest) = block.split_at(size);
            *block = rest;
            chunks.push(Chunk::new(direction, content));
        }
        Ok(chunks)
    }
}

fn checked_sum(a: u64, b: u64) -> Result<u64> {
    a.checked_add(b).ok_or(Error::VarintOverflow)
}

/// Encode the stream id and size sequence of a record for `chunks`.
///
/// Empty chunks are skipped entirely: they carry no bytes and two zero sizes
/// in a row would end the sequence early. When a chunk does not have the
/// expected alternating direction a single zero placeholder is emitted first.
pub fn encode_header(stream_id: u64, chunks: &[Chunk]) -> Vec<u8> {
    let mut out = Vec::with_capacity(STREAM_ID_SIZE + chunks.len() * 2 + TERMINATOR.len());
    out.extend_from_slice(&stream_id.to_le_bytes());

    let mut want = Direction::ClientToServer;
    for chunk in chunks.iter().filter(|c| !c.is_empty()) {
        if chunk.direction != want {
            out.push(0);
            want = want.reverse();
        }
        encode_varint(chunk.len() as u64, &mut out);
        want = want.reverse();
    }
    out.extend_from_slice(&TERMINATOR);
    out
}

/// Read a stream id, distinguishing a clean end of input from a truncated id.
///
/// Returns `Ok(None)` when the reader is exhausted before the first byte.
pub fn read_stream_id<R: Read>(reader: &mut R) -> io::Result<Option<u64>> {
    let mut buf = [0u8; STREAM_ID_SIZE];
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    match filled {
        0 => Ok(None),
        STREAM_ID_SIZE => Ok(Some(u64::from_le_bytes(buf))),
        _ => Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "truncated stream id",
        )),
    }
}
