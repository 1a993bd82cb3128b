use std::fs::File;
use std::path::Path;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EvidenceError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("range {start}..{end} exceeds source length {len}")]
    OutOfRange { start: u64, end: u64, len: u64 },
}

/// Positional, read-only access to a disk image or a scratch file.
pub trait EvidenceSource: Send + Sync {
    fn len(&self) -> u64;
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize, EvidenceError>;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct RawFileSource {
    file: File,
    len: u64,
    #[cfg(not(unix))]
    lock: std::sync::Mutex<()>,
}

impl RawFileSource {
    pub fn open(path: &Path) -> Result<Self, EvidenceError> {
        let file = File::open(path)?;
        let len = file.metadata()?.len();
        Ok(Self {
            file,
            len,
            #[cfg(not(unix))]
            lock: std::sync::Mutex::new(()),
        })
    }
}

impl EvidenceSource for RawFileSource {
    fn len(&self) -> u64 {
        self.len
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize, EvidenceError> {
        #[cfg(unix)]
        {
            use std::os::unix::fs::FileExt;
            Ok(self.file.read_at(buf, offset)?)
        }
        #[cfg(not(unix))]
        {
            use std::io::{Read, Seek, SeekFrom};
            let _guard = self.lock.lock().unwrap();
            let mut f = &self.file;
            f.seek(SeekFrom::Start(offset))?;
            Ok(f.read(buf)?)
        }
    }
}

/// Fill `buf` from `offset`, returning fewer bytes only at end of source.
pub fn read_full_at(
    source: &dyn EvidenceSource,
    offset: u64,
    buf: &mut [u8],
) -> Result<usize, EvidenceError> {
    let mut read = 0usize;
    while read < buf.len() {
        let n = source.read_at(offset + read as u64, &mut buf[read..])?;
        if n == 0 {
            break;
        }
        read += n;
    }
    Ok(read)
}

/// Read `[start, end)` into memory. Only meant for small ranges.
pub fn read_range(
    source: &dyn EvidenceSource,
    start: u64,
    end: u64,
) -> Result<Vec<u8>, EvidenceError> {
    if start > end || end > source.len() {
        return Err(EvidenceError::OutOfRange {
            start,
            end,
            len: source.len(),
        });
    }
    let mut buf = vec![0u8; (end - start) as usize];
    let n = read_full_at(source, start, &mut buf)?;
    buf.truncate(n);
    Ok(buf)
}

pub fn open_image(path: &Path) -> Result<Box<dyn EvidenceSource>, EvidenceError> {
    let src = RawFileSource::open(path)?;
    Ok(Box::new(src))
}
