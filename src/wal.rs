//! The optional page-image log hook consumed by the buffer pool.
//!
//! When a buffer pool is constructed with a [`WalManager`], every dirty page
//! image is appended to the log before it is written back to the database
//! file, and a checkpoint marker is appended after a full flush. Records are
//! CRC-checked on [`WalManager::scan`]. Replaying the log is left to higher
//! layers.

use crc32fast::Hasher;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;

use crate::PageId;

/// A Log Sequence Number: the byte offset of a record in the log file.
pub type Lsn = u64;

/// Header for every log record.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct WalRecordHeader {
    /// The total length of the record, including the header.
    pub total_len: u32,
    /// The CRC checksum of the record body.
    pub crc: u32,
}

/// A single record in the log.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum WalRecord {
    /// A page image, logged before the image is written back to disk.
    PageImage { page_id: PageId, data: Vec<u8> },
    /// All resident pages were flushed.
    Checkpoint,
}

pub struct WalManager {
    file: File,
    next_lsn: Lsn,
}

impl WalManager {
    pub fn open<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .create(true)
            .write(true)
            .open(path.as_ref())?;
        let next_lsn = file.metadata()?.len();
        Ok(Self { file, next_lsn })
    }

    /// Appends a record and syncs it to disk, returning its LSN.
    pub fn log(&mut self, record: &WalRecord) -> io::Result<Lsn> {
        let record_bytes = bincode::serialize(record).map_err(io::Error::other)?;

        let header_len = std::mem::size_of::<WalRecordHeader>();
        let mut hasher = Hasher::new();
        hasher.update(&record_bytes);
        let header = WalRecordHeader {
            total_len: (header_len + record_bytes.len()) as u32,
            crc: hasher.finalize(),
        };

        let lsn = self.next_lsn;
        self.file.seek(SeekFrom::Start(lsn))?;
        self.file.write_all(unsafe {
            std::slice::from_raw_parts(&header as *const _ as *const u8, header_len)
        })?;
        self.file.write_all(&record_bytes)?;
        self.file.sync_all()?;

        self.next_lsn += header.total_len as u64;
        Ok(lsn)
    }

    /// Reads every record back, verifying checksums.
    pub fn scan(&mut self) -> io::Result<Vec<(Lsn, WalRecord)>> {
        let header_len = std::mem::size_of::<WalRecordHeader>();
        self.file.seek(SeekFrom::Start(0))?;
        let mut buf = Vec::new();
        self.file.read_to_end(&mut buf)?;

        let mut records = Vec::new();
        let mut pos = 0usize;
        while pos + header_len <= buf.len() {
            let header: WalRecordHeader =
                unsafe { std::ptr::read_unaligned(buf[pos..].as_ptr() as *const WalRecordHeader) };
            let body_start = pos + header_len;
            let body_end = pos + header.total_len as usize;
            if header.total_len as usize <= header_len || body_end > buf.len() {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "truncated WAL record",
                ));
            }
            let body = &buf[body_start..body_end];

            let mut hasher = Hasher::new();
            hasher.update(body);
            if hasher.finalize() != header.crc {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "WAL record CRC mismatch",
                ));
            }

            let record = bincode::deserialize(body).map_err(io::Error::other)?;
            records.push((pos as Lsn, record));
            pos = body_end;
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn log_and_scan_roundtrip() {
        let temp_dir = tempdir().unwrap();
        let mut wal = WalManager::open(temp_dir.path().join("test.wal")).unwrap();

        let first = WalRecord::PageImage {
            page_id: 3,
            data: vec![1, 2, 3],
        };
        let lsn0 = wal.log(&first).unwrap();
        let lsn1 = wal.log(&WalRecord::Checkpoint).unwrap();
        assert_eq!(lsn0, 0);
        assert!(lsn1 > lsn0);

        let records = wal.scan().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].1, first);
        assert_eq!(records[1].1, WalRecord::Checkpoint);
    }

    #[test]
    fn scan_survives_reopen() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("test.wal");
        {
            let mut wal = WalManager::open(&path).unwrap();
            wal.log(&WalRecord::Checkpoint).unwrap();
        }
        let mut wal = WalManager::open(&path).unwrap();
        assert_eq!(wal.scan().unwrap().len(), 1);
        wal.log(&WalRecord::Checkpoint).unwrap();
        assert_eq!(wal.scan().unwrap().len(), 2);
    }
}
