//! Append-only hybrid log backing a secondary store.
//!
//! Logical addresses are byte offsets into `log.dat`. The first
//! [`LOG_BEGIN_ADDRESS`] bytes hold the file header, so address 0 is never a
//! valid record address and can terminate chains. The suffix
//! `[head_address, tail_address)` is resident in memory; everything below
//! `head_address` has been flushed and evicted and must be read from disk.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use super::record::LogRecord;
use crate::error::Result;
use crate::Error;

pub const LOG_BEGIN_ADDRESS: u64 = 64;
pub const LOG_FILE: &str = "log.dat";

const MAGIC: u32 = 0x50_53_46_4C; // ASCII "PSFL"
const VERSION: u16 = 1;

#[derive(Debug)]
pub struct HybridLog {
    path: PathBuf,
    file: File,
    begin_address: u64,
    head_address: u64,
    flushed_until: u64,
    tail_address: u64,
    /// Bytes of `[head_address, tail_address)`
    buffer: Vec<u8>,
}

impl HybridLog {
    /// Opens (or creates) the log file in `dir`. The log starts empty; a
    /// previous log's contents only become visible through recovery.
    pub fn open(dir: &Path) -> Result<Self> {
        let path = dir.join(LOG_FILE);
        let mut file = File::options()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)?;

        if file.metadata()?.len() < LOG_BEGIN_ADDRESS {
            let mut header = Vec::with_capacity(LOG_BEGIN_ADDRESS as usize);
            header.write_u32::<BigEndian>(MAGIC)?;
            header.write_u16::<BigEndian>(VERSION)?;
            header.resize(LOG_BEGIN_ADDRESS as usize, 0);
            file.seek(SeekFrom::Start(0))?;
            file.write_all(&header)?;
            file.flush()?;
        } else {
            file.seek(SeekFrom::Start(0))?;
            if file.read_u32::<BigEndian>()? != MAGIC || file.read_u16::<BigEndian>()? != VERSION
            {
                return Err(Error::InvalidHeader);
            }
        }

        Ok(Self {
            path,
            file,
            begin_address: LOG_BEGIN_ADDRESS,
            head_address: LOG_BEGIN_ADDRESS,
            flushed_until: LOG_BEGIN_ADDRESS,
            tail_address: LOG_BEGIN_ADDRESS,
            buffer: Vec::new(),
        })
    }

    pub fn begin_address(&self) -> u64 {
        self.begin_address
    }

    pub fn head_address(&self) -> u64 {
        self.head_address
    }

    pub fn tail_address(&self) -> u64 {
        self.tail_address
    }

    pub fn flushed_until(&self) -> u64 {
        self.flushed_until
    }

    pub fn resident_bytes(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tail_address == self.begin_address
    }

    /// Length of `log.dat`, which may hold records of a previous run.
    pub fn file_len(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    /// Appends an encoded record at the tail and returns its address.
    pub fn append(&mut self, bytes: &[u8]) -> u64 {
        let address = self.tail_address;
        self.buffer.extend_from_slice(bytes);
        self.tail_address += bytes.len() as u64;
        address
    }

    /// Bytes starting at `address` if it is resident, `None` if it was evicted.
    pub fn resident(&self, address: u64) -> Result<Option<&[u8]>> {
        if address < self.begin_address || address >= self.tail_address {
            return Err(Error::InvalidAddress(address));
        }
        if address < self.head_address {
            return Ok(None);
        }
        let offset = (address - self.head_address) as usize;
        Ok(Some(&self.buffer[offset..]))
    }

    pub fn pending_read(&self, address: u64) -> PendingRead {
        PendingRead {
            path: self.path.clone(),
            address,
        }
    }

    /// Writes resident bytes not yet on disk. Returns the new flushed address.
    pub fn flush(&mut self, sync: bool) -> Result<u64> {
        if self.flushed_until < self.tail_address {
            let offset = (self.flushed_until - self.head_address) as usize;
            self.file.seek(SeekFrom::Start(self.flushed_until))?;
            self.file.write_all(&self.buffer[offset..])?;
            self.file.flush()?;
            self.flushed_until = self.tail_address;
        }
        if sync {
            self.file.sync_data()?;
        }
        Ok(self.flushed_until)
    }

    /// Flushes, then drops the resident region so every read goes to disk.
    pub fn evict(&mut self) -> Result<()> {
        self.flush(false)?;
        self.buffer = Vec::new();
        self.head_address = self.tail_address;
        Ok(())
    }

    /// Resets the log to a checkpointed `[begin, tail)`, all of it on disk.
    pub fn restore(&mut self, begin_address: u64, tail_address: u64) -> Result<()> {
        let file_len = self.file.metadata()?.len();
        if file_len < tail_address {
            return Err(Error::InvalidState(format!(
                "log file holds {} bytes, checkpoint tail is {}",
                file_len, tail_address
            )));
        }
        // Anything past the checkpoint tail was never committed
        self.file.set_len(tail_address)?;

        self.begin_address = begin_address;
        self.head_address = tail_address;
        self.flushed_until = tail_address;
        self.tail_address = tail_address;
        self.buffer = Vec::new();
        Ok(())
    }

    /// Decodes the on-disk records of `[from, to)` in address order.
    pub fn scan_disk(&self, from: u64, to: u64) -> Result<Vec<(u64, LogRecord)>> {
        if from >= to {
            return Ok(Vec::new());
        }
        if from < self.begin_address || to > self.flushed_until {
            return Err(Error::InvalidAddress(from));
        }

        let mut file = File::open(&self.path)?;
        file.seek(SeekFrom::Start(from))?;
        let mut bytes = vec![0u8; (to - from) as usize];
        file.read_exact(&mut bytes)?;

        let mut records = Vec::new();
        let mut offset = 0usize;
        while offset < bytes.len() {
            let record = LogRecord::decode(&bytes[offset..])?;
            let len = LogRecord::peek_len(&bytes[offset..])?;
            records.push((from + offset as u64, record));
            offset += len;
        }
        Ok(records)
    }
}

/// A read of an evicted record that has to go to disk.
#[derive(Debug, Clone)]
pub struct PendingRead {
    path: PathBuf,
    address: u64,
}

impl PendingRead {
    pub fn address(&self) -> u64 {
        self.address
    }

    /// Completes the read, blocking on file I/O.
    pub fn complete(&self) -> Result<LogRecord> {
        let mut file = File::open(&self.path)?;
        file.seek(SeekFrom::Start(self.address))?;

        let mut prefix = [0u8; 4];
        read_record_bytes(&mut file, &mut prefix, self.address)?;
        let len = LogRecord::peek_len(&prefix)?;
        let file_len = file.metadata()?.len();
        if self.address + len as u64 > file_len {
            return Err(Error::CorruptedRecord(format!(
                "record at {} claims {} bytes, log ends at {}",
                self.address, len, file_len
            )));
        }

        let mut bytes = vec![0u8; len];
        bytes[..4].copy_from_slice(&prefix);
        read_record_bytes(&mut file, &mut bytes[4..], self.address)?;
        LogRecord::decode(&bytes)
    }

    /// Completes the read on the blocking pool.
    pub async fn complete_async(self) -> Result<LogRecord> {
        tokio::task::spawn_blocking(move || self.complete())
            .await
            .map_err(|e| Error::InvalidState(format!("Pending read join error: {}", e)))?
    }
}

fn read_record_bytes(file: &mut File, buf: &mut [u8], address: u64) -> Result<()> {
    file.read_exact(buf).map_err(|e| match e.kind() {
        std::io::ErrorKind::UnexpectedEof => Error::CorruptedRecord(format!(
            "unexpected end of log reading record at {}",
            address
        )),
        _ => Error::IoError(e),
    })
}
