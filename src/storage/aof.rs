//! # Append-Only Log
//!
//! The durable log that confirms write-back of evicted values. The tier only
//! needs one thing from it, [`DurableLog::force_flush`]: a blocking call that
//! returns once every previously appended record is on stable storage. The
//! reconstruction manager and the store's victim confirmation call it before
//! discarding victim nodes.
//!
//! ## Record Format
//!
//! ```text
//! +--------------------+-----------+-------------+
//! | Record Header      | key bytes | value bytes |
//! | (24 bytes)         | (key_len) | (val_len)   |
//! +--------------------+-----------+-------------+
//! ```
//!
//! The header carries:
//! - `op`: `SET` or `DEL`
//! - `key_len`, `val_len`: payload sizes
//! - `checksum`: CRC64 over op, lengths, key and value
//!
//! ## Write Protocol
//!
//! Appends go through a buffered writer and are cheap. `force_flush` drains
//! the buffer and calls `sync_data`, which is the only point at which records
//! become durable.
//!
//! ## Replay
//!
//! [`AppendLog::replay`] reads records from the start of the file and stops
//! at the first one that is torn (short read) or fails its checksum. Such a
//! tail is the normal result of a crash during an append and is discarded.
//!
//! ## Thread Safety
//!
//! `AppendLog` is `Send + Sync`. Internal synchronization uses
//! `parking_lot::Mutex`.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crc::{Crc, CRC_64_ECMA_182};
use eyre::{ensure, Result, WrapErr};
use parking_lot::Mutex;
use tracing::debug;
use zerocopy::little_endian::{U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

pub const LOG_RECORD_HEADER_SIZE: usize = 24;

const CRC64: Crc<u64> = Crc::<u64>::new(&CRC_64_ECMA_182);

const OP_SET: u32 = 1;
const OP_DEL: u32 = 2;

/// The durability barrier the tier depends on.
pub trait DurableLog {
    fn force_flush(&self) -> Result<()>;
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct LogRecordHeader {
    op: U32,
    key_len: U32,
    val_len: U64,
    checksum: U64,
}

const _: () = assert!(std::mem::size_of::<LogRecordHeader>() == LOG_RECORD_HEADER_SIZE);

impl LogRecordHeader {
    fn new(op: u32, key: &[u8], value: &[u8]) -> Self {
        let mut header = Self {
            op: U32::new(op),
            key_len: U32::new(key.len() as u32),
            val_len: U64::new(value.len() as u64),
            checksum: U64::new(0),
        };
        header.checksum = U64::new(compute_checksum(&header, key, value));
        header
    }
}

pub fn compute_checksum(header: &LogRecordHeader, key: &[u8], value: &[u8]) -> u64 {
    let mut digest = CRC64.digest();

    digest.update(&header.op.get().to_le_bytes());
    digest.update(&header.key_len.get().to_le_bytes());
    digest.update(&header.val_len.get().to_le_bytes());

    digest.update(key);
    digest.update(value);

    digest.finalize()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogRecord {
    Set { key: Vec<u8>, value: Vec<u8> },
    Del { key: Vec<u8> },
}

pub struct AppendLog {
    path: PathBuf,
    segment: Mutex<LogSegment>,
}

struct LogSegment {
    writer: BufWriter<File>,
    offset: u64,
    flushes: u64,
}

impl AppendLog {
    /// Opens the log at `path` for appending, creating it if missing.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .wrap_err_with(|| format!("failed to open append log at {:?}", path))?;

        let offset = file
            .metadata()
            .wrap_err_with(|| format!("failed to get metadata for {:?}", path))?
            .len();

        Ok(Self {
            path: path.to_path_buf(),
            segment: Mutex::new(LogSegment {
                writer: BufWriter::new(file),
                offset,
                flushes: 0,
            }),
        })
    }

    pub fn append_set(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.append(OP_SET, key, value)
    }

    pub fn append_del(&self, key: &[u8]) -> Result<()> {
        self.append(OP_DEL, key, &[])
    }

    fn append(&self, op: u32, key: &[u8], value: &[u8]) -> Result<()> {
        ensure!(
            key.len() <= u32::MAX as usize,
            "key of {} bytes is too large for the append log",
            key.len()
        );

        let header = LogRecordHeader::new(op, key, value);
        let mut segment = self.segment.lock();

        segment
            .writer
            .write_all(header.as_bytes())
            .wrap_err("failed to write log record header")?;
        segment
            .writer
            .write_all(key)
            .wrap_err("failed to write log record key")?;
        segment
            .writer
            .write_all(value)
            .wrap_err("failed to write log record value")?;

        segment.offset += (LOG_RECORD_HEADER_SIZE + key.len() + value.len()) as u64;
        Ok(())
    }

    /// Bytes appended so far, durable or not.
    pub fn len(&self) -> u64 {
        self.segment.lock().offset
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of completed `force_flush` calls on this handle.
    pub fn flush_count(&self) -> u64 {
        self.segment.lock().flushes
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn truncate(&self) -> Result<()> {
        let mut segment = self.segment.lock();

        segment
            .writer
            .flush()
            .wrap_err("failed to flush append log before truncate")?;
        segment
            .writer
            .get_ref()
            .set_len(0)
            .wrap_err("failed to truncate append log")?;

        segment.offset = 0;
        Ok(())
    }

    /// Reads every intact record of the log at `path`.
    pub fn replay<P: AsRef<Path>>(path: P) -> Result<Vec<LogRecord>> {
        let path = path.as_ref();
        let mut file = File::open(path)
            .wrap_err_with(|| format!("failed to open append log at {:?}", path))?;

        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)
            .wrap_err_with(|| format!("failed to read append log at {:?}", path))?;

        let mut records = Vec::new();
        let mut cursor = 0usize;

        while cursor + LOG_RECORD_HEADER_SIZE <= bytes.len() {
            let header = LogRecordHeader::read_from_bytes(
                &bytes[cursor..cursor + LOG_RECORD_HEADER_SIZE],
            )
            .map_err(|e| eyre::eyre!("invalid log record header: {:?}", e))?;

            let key_len = header.key_len.get() as usize;
            let val_len = header.val_len.get() as usize;
            let body = cursor + LOG_RECORD_HEADER_SIZE;
            let Some(end) = body
                .checked_add(key_len)
                .and_then(|n| n.checked_add(val_len))
            else {
                break;
            };
            if end > bytes.len() {
                break;
            }

            let key = &bytes[body..body + key_len];
            let value = &bytes[body + key_len..end];
            if compute_checksum(&header, key, value) != header.checksum.get() {
                break;
            }

            match header.op.get() {
                OP_SET => records.push(LogRecord::Set {
                    key: key.to_vec(),
                    value: value.to_vec(),
                }),
                OP_DEL => records.push(LogRecord::Del { key: key.to_vec() }),
                _ => break,
            }
            cursor = end;
        }

        if cursor < bytes.len() {
            debug!(
                path = ?path,
                discarded = bytes.len() - cursor,
                "discarded torn append log tail"
            );
        }

        Ok(records)
    }
}

impl DurableLog for AppendLog {
    fn force_flush(&self) -> Result<()> {
        let mut segment = self.segment.lock();

        segment
            .writer
            .flush()
            .wrap_err("failed to flush append log buffer")?;
        segment
            .writer
            .get_ref()
            .sync_data()
            .wrap_err("failed to sync append log to disk")?;

        segment.flushes += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;
    use tempfile::tempdir;

    #[test]
    fn record_header_size_is_24_bytes() {
        assert_eq!(std::mem::size_of::<LogRecordHeader>(), 24);
    }

    #[test]
    fn checksum_covers_key_and_value() {
        let header = LogRecordHeader::new(OP_SET, b"k", b"v");
        assert_eq!(compute_checksum(&header, b"k", b"v"), header.checksum.get());
        assert_ne!(compute_checksum(&header, b"k", b"w"), header.checksum.get());
    }

    #[test]
    fn flushed_records_replay_in_order() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("appendonly.aof");

        let log = AppendLog::open(&path).unwrap();
        log.append_set(b"a", b"1").unwrap();
        log.append_del(b"b").unwrap();
        log.append_set(b"c", b"").unwrap();
        log.force_flush().unwrap();

        assert_eq!(log.flush_count(), 1);
        assert_eq!(
            AppendLog::replay(&path).unwrap(),
            vec![
                LogRecord::Set { key: b"a".to_vec(), value: b"1".to_vec() },
                LogRecord::Del { key: b"b".to_vec() },
                LogRecord::Set { key: b"c".to_vec(), value: Vec::new() },
            ]
        );
    }

    #[test]
    fn reopen_appends_after_existing_records() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("appendonly.aof");

        {
            let log = AppendLog::open(&path).unwrap();
            log.append_set(b"a", b"1").unwrap();
            log.force_flush().unwrap();
        }

        let log = AppendLog::open(&path).unwrap();
        assert_eq!(log.len(), (LOG_RECORD_HEADER_SIZE + 2) as u64);
        log.append_set(b"b", b"2").unwrap();
        log.force_flush().unwrap();

        assert_eq!(AppendLog::replay(&path).unwrap().len(), 2);
    }

    #[test]
    fn torn_tail_is_discarded() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("appendonly.aof");

        {
            let log = AppendLog::open(&path).unwrap();
            log.append_set(b"a", b"1").unwrap();
            log.force_flush().unwrap();
        }

        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        let partial = LogRecordHeader::new(OP_SET, b"bbbb", b"2222");
        file.write_all(partial.as_bytes()).unwrap();
        file.write_all(b"bb").unwrap();

        let records = AppendLog::replay(&path).unwrap();
        assert_eq!(records.len(), 1);
    }

    #[test]
    fn corrupt_record_ends_replay() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("appendonly.aof");

        {
            let log = AppendLog::open(&path).unwrap();
            log.append_set(b"a", b"1").unwrap();
            log.append_set(b"b", b"2").unwrap();
            log.force_flush().unwrap();
        }

        let mut bytes = std::fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        std::fs::write(&path, &bytes).unwrap();

        assert_eq!(AppendLog::replay(&path).unwrap().len(), 1);
    }

    #[test]
    fn truncate_empties_the_log() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("appendonly.aof");

        let log = AppendLog::open(&path).unwrap();
        log.append_set(b"a", b"1").unwrap();
        log.truncate().unwrap();

        assert!(log.is_empty());
        assert!(AppendLog::replay(&path).unwrap().is_empty());
    }
}
