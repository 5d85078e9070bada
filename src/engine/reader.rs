//! STRATUM - Entry Reader
//! Sequential scanner over files holding a stream of encoded entries
//! (segments and WAL files share the same layout).

use std::fs::File;
use std::io::{self, BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use crate::error::{Result, StratumError};
use crate::types::{Entry, EntryMetadata, HEADER_SIZE};

/// Fill `buf` from `reader`, stopping early only at end-of-file.
/// Returns the number of bytes read.
fn read_fully<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

fn truncated(what: &str, offset: u64) -> StratumError {
    StratumError::Corruption(format!("truncated {} at offset {}", what, offset))
}

/// Read the next header. `Ok(None)` means a clean end-of-file on an entry boundary.
pub(crate) fn read_header<R: Read>(reader: &mut R, offset: u64) -> Result<Option<EntryMetadata>> {
    let mut header = [0u8; HEADER_SIZE];
    match read_fully(reader, &mut header)? {
        0 => Ok(None),
        HEADER_SIZE => EntryMetadata::decode(&header)
            .map(Some)
            .map_err(|e| StratumError::Corruption(format!("bad header at offset {}: {}", offset, e))),
        _ => Err(truncated("header", offset)),
    }
}

fn read_exact_or_corrupt<R: Read>(reader: &mut R, len: usize, what: &str, offset: u64) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; len];
    if read_fully(reader, &mut buf)? != len {
        return Err(truncated(what, offset));
    }
    Ok(buf)
}

/// Read one full entry. `Ok(None)` at a clean end-of-file.
pub(crate) fn read_entry<R: Read>(reader: &mut R, offset: u64) -> Result<Option<Entry>> {
    let metadata = match read_header(reader, offset)? {
        Some(m) => m,
        None => return Ok(None),
    };
    let key = read_exact_or_corrupt(reader, metadata.key_length(), "key", offset)?;
    let value = read_exact_or_corrupt(reader, metadata.value_length(), "value", offset)?;
    Entry::from_parts(&metadata, key, value)
        .map(Some)
        .map_err(|e| StratumError::Corruption(format!("bad entry at offset {}: {}", offset, e)))
}

/// Scans a segment file entry by entry.
#[derive(Debug, Clone)]
pub struct EntryReader {
    path: PathBuf,
}

impl EntryReader {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Search for `key` starting `start_offset` bytes into the file.
    ///
    /// Entries whose key does not match are skipped without decoding their
    /// value. Reaching end-of-file returns `Ok(None)`; a header whose key or
    /// value cannot be read in full is reported as corruption.
    pub fn find_entry_from_offset(&self, key: &str, start_offset: u64) -> Result<Option<Entry>> {
        let file = File::open(&self.path)?;
        let file_len = file.metadata()?.len();
        if start_offset >= file_len {
            return Ok(None);
        }

        let mut reader = BufReader::new(file);
        reader.seek(SeekFrom::Start(start_offset))?;
        let mut offset = start_offset;

        while let Some(metadata) = read_header(&mut reader, offset)? {
            let candidate = read_exact_or_corrupt(&mut reader, metadata.key_length(), "key", offset)?;

            if candidate == key.as_bytes() {
                let value = read_exact_or_corrupt(&mut reader, metadata.value_length(), "value", offset)?;
                let entry = Entry::from_parts(&metadata, candidate, value)
                    .map_err(|e| StratumError::Corruption(format!("bad entry at offset {}: {}", offset, e)))?;
                return Ok(Some(entry));
            }

            let skip = metadata.value_length() as u64;
            let skipped = io::copy(&mut (&mut reader).take(skip), &mut io::sink())?;
            if skipped != skip {
                return Err(truncated("value", offset));
            }
            offset += (HEADER_SIZE + metadata.payload_len()) as u64;
        }

        Ok(None)
    }

    /// Iterate over every entry in the file with its byte offset.
    pub fn iter(&self) -> Result<EntryIter> {
        let file = File::open(&self.path)?;
        Ok(EntryIter {
            reader: BufReader::new(file),
            offset: 0,
            done: false,
        })
    }
}

/// Iterator over `(offset, Entry)` pairs. Stops after the first error.
pub struct EntryIter {
    reader: BufReader<File>,
    offset: u64,
    done: bool,
}

impl Iterator for EntryIter {
    type Item = Result<(u64, Entry)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match read_entry(&mut self.reader, self.offset) {
            Ok(Some(entry)) => {
                let offset = self.offset;
                self.offset += entry.encoded_len() as u64;
                Some(Ok((offset, entry)))
            }
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}
