//! Framing and typed record codecs for writer journal files and reader
//! checkpoint files.
//!
//! Every record is wrapped in the same length-prefixed, checksummed frame:
//! `[len: u32 LE][crc32c(body): u32 LE][body: len bytes]`. A frame whose
//! length or checksum cannot be read in full is a torn write; a frame whose
//! checksum does not match its body is corruption. The codec reports both as
//! [`FrameOutcome::Invalid`] and leaves the tail-vs-interior classification
//! to the journal, which knows whether this is the last (still-open) file.

use std::io::{self, Read, Write};

use bytes::Bytes;

use crate::item::{ItemId, QueueItem};

const WRITER_KIND_PUT: u8 = 1;
const READER_KIND_HEAD: u8 = 1;
const READER_KIND_DONE: u8 = 2;

#[derive(Debug)]
pub enum FrameOutcome {
    /// A complete, checksum-valid frame body and the number of bytes the
    /// frame occupied on disk (header + body).
    Frame(Vec<u8>, u64),
    /// Clean end of file: no bytes at all were read for the next frame.
    Eof,
    /// A frame could not be read or did not checksum; `offset` is where the
    /// frame started.
    Invalid { offset: u64, reason: String },
}

/// Reads one length-prefixed, checksummed frame from `reader`, which must be
/// positioned at the start of a frame (or at EOF). `offset` is the reader's
/// current absolute position, used only to annotate errors.
pub fn read_frame<R: Read>(mut reader: R, offset: u64) -> io::Result<FrameOutcome> {
    let mut len_buf = [0u8; 4];
    match read_exact_or_eof(&mut reader, &mut len_buf)? {
        ReadExact::Eof => return Ok(FrameOutcome::Eof),
        ReadExact::Partial => {
            return Ok(FrameOutcome::Invalid {
                offset,
                reason: "truncated length prefix".to_string(),
            })
        }
        ReadExact::Full => {}
    }
    let len = u32::from_le_bytes(len_buf) as usize;

    let mut crc_buf = [0u8; 4];
    match read_exact_or_eof(&mut reader, &mut crc_buf)? {
        ReadExact::Full => {}
        _ => {
            return Ok(FrameOutcome::Invalid {
                offset,
                reason: "truncated checksum".to_string(),
            })
        }
    }
    let expected_crc = u32::from_le_bytes(crc_buf);

    let mut body = vec![0u8; len];
    match read_exact_or_eof(&mut reader, &mut body)? {
        ReadExact::Full => {}
        _ => {
            return Ok(FrameOutcome::Invalid {
                offset,
                reason: "truncated body".to_string(),
            })
        }
    }

    let actual_crc = crc32c::crc32c(&body);
    if actual_crc != expected_crc {
        return Ok(FrameOutcome::Invalid {
            offset,
            reason: format!("checksum mismatch: expected {expected_crc:#x}, got {actual_crc:#x}"),
        });
    }

    let frame_len = 4 + 4 + len as u64;
    Ok(FrameOutcome::Frame(body, frame_len))
}

enum ReadExact {
    Full,
    Partial,
    Eof,
}

fn read_exact_or_eof<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<ReadExact> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    if filled == 0 {
        Ok(ReadExact::Eof)
    } else if filled == buf.len() {
        Ok(ReadExact::Full)
    } else {
        Ok(ReadExact::Partial)
    }
}

pub fn write_frame<W: Write>(mut writer: W, body: &[u8]) -> io::Result<()> {
    let len = body.len() as u32;
    let crc = crc32c::crc32c(body);
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&crc.to_le_bytes())?;
    writer.write_all(body)?;
    Ok(())
}

/// A single record in a writer journal file. Unknown kinds are rejected as
/// corruption rather than silently skipped, per the data model's "future
/// record kinds ... unknown kinds must be rejected" rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriterRecord {
    Put(QueueItem),
}

impl WriterRecord {
    pub fn encode(&self) -> Vec<u8> {
        match self {
            WriterRecord::Put(item) => {
                let mut body = Vec::with_capacity(1 + 8 + 8 + 8 + 4 + item.payload.len());
                body.push(WRITER_KIND_PUT);
                body.extend_from_slice(&item.id.to_le_bytes());
                body.extend_from_slice(&item.add_time_ms.to_le_bytes());
                body.extend_from_slice(&item.expire_time_ms.unwrap_or(0).to_le_bytes());
                body.extend_from_slice(&(item.payload.len() as u32).to_le_bytes());
                body.extend_from_slice(&item.payload);
                body
            }
        }
    }

    pub fn decode(body: &[u8]) -> Result<Self, String> {
        if body.is_empty() {
            return Err("empty record body".to_string());
        }
        match body[0] {
            WRITER_KIND_PUT => {
                if body.len() < 1 + 8 + 8 + 8 + 4 {
                    return Err("writer record too short".to_string());
                }
                let id = u64::from_le_bytes(body[1..9].try_into().unwrap());
                let add_time_ms = u64::from_le_bytes(body[9..17].try_into().unwrap());
                let expire_raw = u64::from_le_bytes(body[17..25].try_into().unwrap());
                let payload_len = u32::from_le_bytes(body[25..29].try_into().unwrap()) as usize;
                let payload = body.get(29..29 + payload_len).ok_or_else(|| {
                    format!("payload length {payload_len} exceeds record body")
                })?;
                let expire_time_ms = if expire_raw == 0 { None } else { Some(expire_raw) };
                Ok(WriterRecord::Put(QueueItem::new(
                    id,
                    add_time_ms,
                    expire_time_ms,
                    Bytes::copy_from_slice(payload),
                )))
            }
            other => Err(format!("unknown writer record kind {other}")),
        }
    }
}

/// A single record in a reader checkpoint file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReaderRecord {
    ReadHead(ItemId),
    ReadDone(Vec<ItemId>),
}

impl ReaderRecord {
    pub fn encode(&self) -> Vec<u8> {
        match self {
            ReaderRecord::ReadHead(id) => {
                let mut body = Vec::with_capacity(9);
                body.push(READER_KIND_HEAD);
                body.extend_from_slice(&id.to_le_bytes());
                body
            }
            ReaderRecord::ReadDone(ids) => {
                let mut body = Vec::with_capacity(5 + ids.len() * 8);
                body.push(READER_KIND_DONE);
                body.extend_from_slice(&(ids.len() as u32).to_le_bytes());
                for id in ids {
                    body.extend_from_slice(&id.to_le_bytes());
                }
                body
            }
        }
    }

    pub fn decode(body: &[u8]) -> Result<Self, String> {
        if body.is_empty() {
            return Err("empty record body".to_string());
        }
        match body[0] {
            READER_KIND_HEAD => {
                if body.len() < 9 {
                    return Err("ReadHead record too short".to_string());
                }
                Ok(ReaderRecord::ReadHead(u64::from_le_bytes(
                    body[1..9].try_into().unwrap(),
                )))
            }
            READER_KIND_DONE => {
                if body.len() < 5 {
                    return Err("ReadDone record too short".to_string());
                }
                let count = u32::from_le_bytes(body[1..5].try_into().unwrap()) as usize;
                let expected_len = 5 + count * 8;
                if body.len() < expected_len {
                    return Err("ReadDone record truncated".to_string());
                }
                let mut ids = Vec::with_capacity(count);
                for i in 0..count {
                    let start = 5 + i * 8;
                    ids.push(u64::from_le_bytes(body[start..start + 8].try_into().unwrap()));
                }
                Ok(ReaderRecord::ReadDone(ids))
            }
            other => Err(format!("unknown reader record kind {other}")),
        }
    }
}
