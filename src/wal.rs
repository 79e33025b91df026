//! Write-Ahead Logging (WAL) subsystem.
//!
//! The log is a stream of fixed 32 KiB blocks; each physical record inside
//! a block carries a 7-byte header (`checksum:u32, size:u16, type:u8`). A
//! logical record whose encoded size exceeds the remaining space in a
//! block is fragmented across `First … Middle* … Last` physical records,
//! the same recordio framing LevelDB/RocksDB use for their logs. A block's
//! unused tail is zero-padded; an all-zero header decodes as `type=Zero`
//! and is skipped rather than checksum-validated, since it never carried a
//! real payload.
//!
//! Durability is caller-driven: [`WalWriter::append`] only stages bytes;
//! [`WalWriter::sync`] is what the transaction manager calls during commit
//! to actually fsync the log before touching the meta pages.
//!
//! # See Also
//! - [`crate::recovery`]: replays records from the last `Persisted(txid)`.
//! - [`crate::tx`]: emits `Begin`/operation/`Commit`/`Rollback` records.

use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::Path;

use bincode::{Decode, Encode};

use crate::error::WalError;

pub const WAL_BLOCK_SIZE: usize = 32 * 1024;
const RECORD_HEADER_SIZE: usize = 4 + 2 + 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum RecordType {
    Zero = 0,
    Full = 1,
    First = 2,
    Middle = 3,
    Last = 4,
}

impl TryFrom<u8> for RecordType {
    type Error = WalError;
    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => RecordType::Zero,
            1 => RecordType::Full,
            2 => RecordType::First,
            3 => RecordType::Middle,
            4 => RecordType::Last,
            _ => return Err(WalError::Truncated),
        })
    }
}

/// Ephemeral per-transaction bucket identifier, as tagged on operation
/// records; `0xFFFFFFFF` names the well-known user root bucket.
pub type BucketId = u32;

#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub enum LogicalRecord {
    Persisted { txid: u64 },
    Begin { txid: u64 },
    Rollback,
    Commit,
    SubBucket { bucket_id: BucketId, key: Vec<u8> },
    PutIsBucket { bucket_id: BucketId, key: Vec<u8>, value: Vec<u8> },
    PutNotBucket { bucket_id: BucketId, key: Vec<u8>, value: Vec<u8> },
    Delete { bucket_id: BucketId, key: Vec<u8> },
}

pub struct WalWriter {
    path: std::path::PathBuf,
    writer: BufWriter<File>,
    block_pos: usize,
}

impl WalWriter {
    pub fn open(path: &Path) -> Result<Self, WalError> {
        let file = OpenOptions::new().create(true).read(true).append(true).open(path)?;
        let len = file.metadata()?.len() as usize;
        Ok(Self {
            path: path.to_path_buf(),
            writer: BufWriter::new(file),
            block_pos: len % WAL_BLOCK_SIZE,
        })
    }

    pub fn append(&mut self, record: &LogicalRecord) -> Result<(), WalError> {
        let payload = bincode::encode_to_vec(record, bincode::config::standard())?;
        self.append_fragmented(&payload)
    }

    fn append_fragmented(&mut self, payload: &[u8]) -> Result<(), WalError> {
        let mut offset = 0;
        let mut first = true;
        loop {
            let avail = WAL_BLOCK_SIZE - self.block_pos;
            if avail < RECORD_HEADER_SIZE + 1 {
                self.pad_block()?;
                continue;
            }
            let space = avail - RECORD_HEADER_SIZE;
            let remaining = payload.len() - offset;
            let take = remaining.min(space);
            let is_last = remaining == take;

            let rec_type = match (first, is_last) {
                (true, true) => RecordType::Full,
                (true, false) => RecordType::First,
                (false, true) => RecordType::Last,
                (false, false) => RecordType::Middle,
            };
            self.write_physical(rec_type, &payload[offset..offset + take])?;
            offset += take;
            first = false;
            if is_last {
                break;
            }
        }
        Ok(())
    }

    fn write_physical(&mut self, rec_type: RecordType, data: &[u8]) -> Result<(), WalError> {
        let mut rest = Vec::with_capacity(3 + data.len());
        rest.extend_from_slice(&(data.len() as u16).to_le_bytes());
        rest.push(rec_type as u8);
        rest.extend_from_slice(data);
        let crc = crc32fast::hash(&rest);

        self.writer.write_all(&crc.to_le_bytes())?;
        self.writer.write_all(&rest)?;
        self.block_pos += RECORD_HEADER_SIZE + data.len();
        Ok(())
    }

    fn pad_block(&mut self) -> Result<(), WalError> {
        let remaining = WAL_BLOCK_SIZE - self.block_pos;
        self.writer.write_all(&vec![0u8; remaining])?;
        self.block_pos = 0;
        Ok(())
    }

    /// Flushes buffered writes and fsyncs the log file.
    pub fn sync(&mut self) -> Result<(), WalError> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        Ok(())
    }

    /// Truncates the log to empty; called after a checkpoint has made
    /// every record in it durable via the meta pages.
    pub fn rotate(&mut self) -> Result<(), WalError> {
        self.writer.flush()?;
        let file = self.writer.get_mut();
        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        self.block_pos = 0;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Sequentially replays logical records, stopping cleanly at EOF or at the
/// first checksum mismatch (a crash-truncated tail, treated as EOF by
/// callers rather than a hard error).
pub struct WalReader {
    reader: BufReader<File>,
    block: Vec<u8>,
    block_pos: usize,
    pending: Vec<u8>,
    done: bool,
}

impl WalReader {
    pub fn open(path: &Path) -> Result<Self, WalError> {
        let file = File::open(path)?;
        Ok(Self {
            reader: BufReader::new(file),
            block: Vec::new(),
            block_pos: 0,
            pending: Vec::new(),
            done: false,
        })
    }

    fn fill_block(&mut self) -> Result<bool, WalError> {
        let mut buf = vec![0u8; WAL_BLOCK_SIZE];
        let mut total = 0;
        loop {
            let n = self.reader.read(&mut buf[total..])?;
            if n == 0 {
                break;
            }
            total += n;
            if total == WAL_BLOCK_SIZE {
                break;
            }
        }
        if total == 0 {
            return Ok(false);
        }
        buf.truncate(total);
        self.block = buf;
        self.block_pos = 0;
        Ok(true)
    }

    /// Returns the next logical record, `Ok(None)` at clean EOF, or
    /// `Err(WalError::Truncated)` if a crash-truncated tail was hit.
    pub fn next_record(&mut self) -> Result<Option<LogicalRecord>, WalError> {
        loop {
            if self.done {
                return Ok(None);
            }
            if self.block_pos + RECORD_HEADER_SIZE > self.block.len() {
                if !self.fill_block()? {
                    self.done = true;
                    return Ok(None);
                }
                continue;
            }

            let checksum = u32::from_le_bytes(
                self.block[self.block_pos..self.block_pos + 4].try_into().unwrap(),
            );
            let size = u16::from_le_bytes(
                self.block[self.block_pos + 4..self.block_pos + 6].try_into().unwrap(),
            ) as usize;
            let rec_type_byte = self.block[self.block_pos + 6];

            if rec_type_byte == RecordType::Zero as u8 {
                self.block_pos = self.block.len();
                continue;
            }
            let rec_type = RecordType::try_from(rec_type_byte)?;

            let data_start = self.block_pos + RECORD_HEADER_SIZE;
            if data_start + size > self.block.len() {
                self.done = true;
                return Err(WalError::Truncated);
            }
            let data = &self.block[data_start..data_start + size];

            let mut rest = Vec::with_capacity(3 + size);
            rest.extend_from_slice(&(size as u16).to_le_bytes());
            rest.push(rec_type_byte);
            rest.extend_from_slice(data);
            if crc32fast::hash(&rest) != checksum {
                self.done = true;
                return Err(WalError::Truncated);
            }

            let data = data.to_vec();
            self.block_pos = data_start + size;

            match rec_type {
                RecordType::Full => return self.decode_logical(data).map(Some),
                RecordType::First => {
                    self.pending.clear();
                    self.pending.extend_from_slice(&data);
                }
                RecordType::Middle => self.pending.extend_from_slice(&data),
                RecordType::Last => {
                    self.pending.extend_from_slice(&data);
                    let payload = std::mem::take(&mut self.pending);
                    return self.decode_logical(payload).map(Some);
                }
                RecordType::Zero => unreachable!("handled above"),
            }
        }
    }

    fn decode_logical(&self, payload: Vec<u8>) -> Result<LogicalRecord, WalError> {
        let (record, _) = bincode::decode_from_slice(&payload, bincode::config::standard())?;
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use tempdir::TempDir;

    use super::*;

    fn roundtrip(records: &[LogicalRecord]) -> Vec<LogicalRecord> {
        let temp = TempDir::new("wal").unwrap();
        let path = temp.path().join("wal.log");
        let mut writer = WalWriter::open(&path).unwrap();
        for r in records {
            writer.append(r).unwrap();
        }
        writer.sync().unwrap();
        drop(writer);

        let mut reader = WalReader::open(&path).unwrap();
        let mut out = Vec::new();
        while let Some(r) = reader.next_record().unwrap() {
            out.push(r);
        }
        out
    }

    #[test]
    fn small_records_roundtrip() {
        let records = vec![
            LogicalRecord::Begin { txid: 1 },
            LogicalRecord::PutNotBucket { bucket_id: 0xFFFF_FFFF, key: b"a".to_vec(), value: b"1".to_vec() },
            LogicalRecord::Commit,
        ];
        assert_eq!(roundtrip(&records), records);
    }

    #[test]
    fn large_payload_fragments_across_blocks() {
        let value = vec![42u8; 100_000];
        let records = vec![
            LogicalRecord::Begin { txid: 1 },
            LogicalRecord::PutNotBucket { bucket_id: 0xFFFF_FFFF, key: b"big".to_vec(), value },
            LogicalRecord::Commit,
        ];
        assert_eq!(roundtrip(&records), records);
    }

    #[test]
    fn varying_lengths_roundtrip() {
        let lens = [0usize, 3, 10, 11, 12, 100_000];
        let records: Vec<LogicalRecord> = lens
            .iter()
            .map(|&len| LogicalRecord::PutNotBucket {
                bucket_id: 1,
                key: b"k".to_vec(),
                value: vec![9u8; len],
            })
            .collect();
        assert_eq!(roundtrip(&records), records);
    }

    #[test]
    fn truncated_tail_is_reported_not_panicked() {
        let temp = TempDir::new("wal").unwrap();
        let path = temp.path().join("wal.log");
        let mut writer = WalWriter::open(&path).unwrap();
        writer.append(&LogicalRecord::Commit).unwrap();
        writer.sync().unwrap();
        drop(writer);

        // Flip a byte in the checksum to simulate a torn write.
        let mut bytes = std::fs::read(&path).unwrap();
        bytes[0] ^= 0xFF;
        std::fs::write(&path, bytes).unwrap();

        let mut reader = WalReader::open(&path).unwrap();
        assert!(matches!(reader.next_record(), Err(WalError::Truncated)));
    }
}
