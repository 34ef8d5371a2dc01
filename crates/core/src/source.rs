//! Random-access byte sources for outgoing files.
//!
//! The send loop reads one chunk at a time by `[offset, end)` so a
//! back-pressure stall never holds more than a single chunk in memory.

use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::Mutex;

pub trait FileSource: Send + Sync {
    /// Display name announced to the peer in `file-meta`.
    fn name(&self) -> &str;

    fn size(&self) -> u64;

    /// Read the bytes in `[offset, end)`. `end` past the source length is
    /// clamped.
    fn slice(&self, offset: u64, end: u64) -> io::Result<Vec<u8>>;
}

/// In-memory source, used for tests and small payloads.
pub struct MemorySource {
    name: String,
    bytes: Vec<u8>,
}

impl MemorySource {
    pub fn new(name: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            bytes,
        }
    }
}

impl FileSource for MemorySource {
    fn name(&self) -> &str {
        &self.name
    }

    fn size(&self) -> u64 {
        self.bytes.len() as u64
    }

    fn slice(&self, offset: u64, end: u64) -> io::Result<Vec<u8>> {
        let len = self.bytes.len() as u64;
        let start = offset.min(len) as usize;
        let end = end.min(len) as usize;
        Ok(self.bytes[start..end].to_vec())
    }
}

/// File-backed source reading chunks straight from disk. The handle is
/// shared behind a mutex because reads seek.
pub struct DiskSource {
    name: String,
    size: u64,
    file: Mutex<std::fs::File>,
}

impl DiskSource {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = std::fs::File::open(path)?;
        let size = file.metadata()?.len();
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("file")
            .to_string();
        Ok(Self {
            name,
            size,
            file: Mutex::new(file),
        })
    }
}

impl FileSource for DiskSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn slice(&self, offset: u64, end: u64) -> io::Result<Vec<u8>> {
        let end = end.min(self.size);
        let len = end.saturating_sub(offset) as usize;
        let mut buf = vec![0u8; len];
        let mut file = self.file.lock().unwrap_or_else(|e| e.into_inner());
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(&mut buf)?;
        Ok(buf)
    }
}
