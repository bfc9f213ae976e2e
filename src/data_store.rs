//! Variable-length per-message data store (§2.2).
//!
//! Append-oriented, addressed directly by the `(data_offset, data_size)`
//! pair already carried on each `IndexRecord` -- the store itself doesn't
//! need its own index, only to hold bytes and let the core verify them.
//! Framing (`crc32 || len || data`) is grounded on `data_blob.rs`'s tagged
//! blob format; `crc32fast` is already a teacher dependency
//! (`pbs-datastore/Cargo.toml`).

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::io::AsRawFd;
use std::path::Path;

use anyhow::{bail, Error};

const FRAME_HEADER_LEN: usize = 8; // crc32(4) + len(4)

/// Contract the core consumes; interiors are this crate's own business
/// (§1: "specifies their contracts but not their interiors").
pub trait DataStore {
    /// Read back `size` bytes written at `offset` by a prior `append`.
    fn lookup(&mut self, offset: u64, size: u32) -> Result<Vec<u8>, Error>;

    /// Append `data`, returning the offset it was written at.
    fn append(&mut self, data: &[u8]) -> Result<u64, Error>;

    /// Re-read and checksum-verify the frame at `(offset, size)`.
    fn verify(&mut self, offset: u64, size: u32) -> Result<bool, Error>;

    /// Bytes made unreachable by expunges since the last `compress_data`.
    fn deleted_bytes(&self) -> u64;

    fn add_deleted_space(&mut self, bytes: u32);

    /// Truncate to empty (called when the index itself becomes empty).
    fn reset(&mut self) -> Result<(), Error>;

    fn sync(&mut self) -> Result<(), Error>;
}

pub struct FileDataStore {
    file: File,
    deleted_bytes: u64,
}

impl FileDataStore {
    pub fn open_or_create(path: &Path) -> Result<Self, Error> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(path)
            .map_err(|err| anyhow::anyhow!("unable to open data store {path:?} - {err}"))?;
        Ok(Self { file, deleted_bytes: 0 })
    }

    fn read_frame(&mut self, offset: u64, size: u32) -> Result<Vec<u8>, Error> {
        let mut buf = vec![0u8; FRAME_HEADER_LEN + size as usize];
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(&mut buf)?;

        let crc = u32::from_le_bytes(buf[0..4].try_into().unwrap());
        let len = u32::from_le_bytes(buf[4..8].try_into().unwrap());
        if len != size {
            bail!("data store frame at {offset} has length {len}, expected {size}");
        }
        let data = buf[FRAME_HEADER_LEN..].to_vec();
        if crc32fast::hash(&data) != crc {
            bail!("data store frame at {offset} failed checksum");
        }
        Ok(data)
    }
}

impl DataStore for FileDataStore {
    fn lookup(&mut self, offset: u64, size: u32) -> Result<Vec<u8>, Error> {
        self.read_frame(offset, size)
    }

    fn append(&mut self, data: &[u8]) -> Result<u64, Error> {
        let offset = self.file.seek(SeekFrom::End(0))?;

        let crc = crc32fast::hash(data);
        let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + data.len());
        frame.extend_from_slice(&crc.to_le_bytes());
        frame.extend_from_slice(&(data.len() as u32).to_le_bytes());
        frame.extend_from_slice(data);

        self.file.write_all(&frame)?;
        Ok(offset)
    }

    fn verify(&mut self, offset: u64, size: u32) -> Result<bool, Error> {
        Ok(self.read_frame(offset, size).is_ok())
    }

    fn deleted_bytes(&self) -> u64 {
        self.deleted_bytes
    }

    fn add_deleted_space(&mut self, bytes: u32) {
        self.deleted_bytes += bytes as u64;
    }

    fn reset(&mut self) -> Result<(), Error> {
        self.file.set_len(0)?;
        self.file.seek(SeekFrom::Start(0))?;
        self.deleted_bytes = 0;
        Ok(())
    }

    fn sync(&mut self) -> Result<(), Error> {
        self.file.flush()?;
        nix::unistd::fsync(self.file.as_raw_fd())
            .map_err(|err| anyhow::anyhow!("fsync failed: {err}"))?;
        Ok(())
    }
}
