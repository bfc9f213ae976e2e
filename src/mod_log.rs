//! Append-only modification log (§2.4): flag-change and expunge events
//! tagged with `(sequence, uid, external?)`, replayed by clients that
//! joined after the change. Framing follows the same append-and-checksum
//! shape `dynamic_index.rs` uses for its entry array.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::io::AsRawFd;
use std::path::Path;

use anyhow::{bail, Error};

const ENTRY_LEN: usize = 10; // tag(1) + seq(4) + uid(4) + external(1)
const TAG_EXPUNGE: u8 = 0;
const TAG_FLAGS: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModLogEvent {
    Expunge { seq: u32, uid: u32, external: bool },
    Flags { seq: u32, uid: u32, external: bool },
}

impl ModLogEvent {
    fn encode(self) -> [u8; ENTRY_LEN] {
        let (tag, seq, uid, external) = match self {
            ModLogEvent::Expunge { seq, uid, external } => (TAG_EXPUNGE, seq, uid, external),
            ModLogEvent::Flags { seq, uid, external } => (TAG_FLAGS, seq, uid, external),
        };
        let mut buf = [0u8; ENTRY_LEN];
        buf[0] = tag;
        buf[1..5].copy_from_slice(&seq.to_le_bytes());
        buf[5..9].copy_from_slice(&uid.to_le_bytes());
        buf[9] = external as u8;
        buf
    }

    fn decode(buf: &[u8; ENTRY_LEN]) -> Result<Self, Error> {
        let seq = u32::from_le_bytes(buf[1..5].try_into().unwrap());
        let uid = u32::from_le_bytes(buf[5..9].try_into().unwrap());
        let external = buf[9] != 0;
        match buf[0] {
            TAG_EXPUNGE => Ok(ModLogEvent::Expunge { seq, uid, external }),
            TAG_FLAGS => Ok(ModLogEvent::Flags { seq, uid, external }),
            other => bail!("corrupt modification log entry tag {other}"),
        }
    }
}

pub trait ModLog {
    fn add_expunge(&mut self, seq: u32, uid: u32, external: bool) -> Result<(), Error>;
    fn add_flags(&mut self, seq: u32, uid: u32, external: bool) -> Result<(), Error>;
    fn sync(&mut self) -> Result<(), Error>;
    /// Retry any appends that failed earlier (the write, not just the
    /// syscall, counts as failed if it was short).
    fn flush_failures(&mut self) -> Result<(), Error>;
    fn read_all(&mut self) -> Result<Vec<ModLogEvent>, Error>;
}

pub struct FileModLog {
    file: File,
    pending: Vec<ModLogEvent>,
}

impl FileModLog {
    pub fn open_or_create(path: &Path) -> Result<Self, Error> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(path)
            .map_err(|err| anyhow::anyhow!("unable to open modification log {path:?} - {err}"))?;
        Ok(Self { file, pending: Vec::new() })
    }

    fn append_entry(&mut self, event: ModLogEvent) -> Result<(), Error> {
        let buf = event.encode();
        self.file.seek(SeekFrom::End(0))?;
        match self.file.write_all(&buf) {
            Ok(()) => Ok(()),
            Err(err) => {
                self.pending.push(event);
                Err(anyhow::anyhow!("append to modification log failed, queued for retry: {err}"))
            }
        }
    }
}

impl ModLog for FileModLog {
    fn add_expunge(&mut self, seq: u32, uid: u32, external: bool) -> Result<(), Error> {
        self.append_entry(ModLogEvent::Expunge { seq, uid, external })
    }

    fn add_flags(&mut self, seq: u32, uid: u32, external: bool) -> Result<(), Error> {
        self.append_entry(ModLogEvent::Flags { seq, uid, external })
    }

    fn sync(&mut self) -> Result<(), Error> {
        self.file.flush()?;
        nix::unistd::fsync(self.file.as_raw_fd())
            .map_err(|err| anyhow::anyhow!("fsync failed: {err}"))?;
        Ok(())
    }

    fn flush_failures(&mut self) -> Result<(), Error> {
        let pending = std::mem::take(&mut self.pending);
        for event in pending {
            self.append_entry(event)?;
        }
        Ok(())
    }

    fn read_all(&mut self) -> Result<Vec<ModLogEvent>, Error> {
        self.file.seek(SeekFrom::Start(0))?;
        let mut buf = Vec::new();
        self.file.read_to_end(&mut buf)?;

        let mut events = Vec::with_capacity(buf.len() / ENTRY_LEN);
        for chunk in buf.chunks_exact(ENTRY_LEN) {
            let entry: [u8; ENTRY_LEN] = chunk.try_into().unwrap();
            events.push(ModLogEvent::decode(&entry)?);
        }
        Ok(events)
    }
}
