//! Byte-stream temporary files: sequential write, then rewind and read.
//!
//! Backed by anonymous temp files, so the OS reclaims them when the handle
//! drops, including on error unwind.

use std::fmt;
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};

use quern_error::{QuernError, Result};
use tempfile::tempfile;

enum SpoolState {
    Writing(BufWriter<std::fs::File>),
    Reading(BufReader<std::fs::File>),
}

/// A write-then-read temporary file with record counters.
///
/// The counters are bumped by the caller per logical record and compared
/// after a full read pass to detect truncated or corrupted files.
pub struct SpoolFile {
    state: SpoolState,
    records_written: u64,
    records_read: u64,
}

impl SpoolFile {
    pub fn create() -> Result<Self> {
        let file = tempfile().map_err(|e| QuernError::spill_io("create temporary file", e))?;
        Ok(SpoolFile {
            state: SpoolState::Writing(BufWriter::new(file)),
            records_written: 0,
            records_read: 0,
        })
    }

    pub fn records_written(&self) -> u64 {
        self.records_written
    }

    pub fn records_read(&self) -> u64 {
        self.records_read
    }

    pub fn note_record_written(&mut self) {
        self.records_written += 1;
    }

    pub fn note_record_read(&mut self) {
        self.records_read += 1;
    }

    pub fn write_all(&mut self, bytes: &[u8]) -> Result<()> {
        match &mut self.state {
            SpoolState::Writing(w) => w
                .write_all(bytes)
                .map_err(|e| QuernError::spill_io("write temporary file", e)),
            SpoolState::Reading(_) => Err(QuernError::internal(
                "write to a temporary file already rewound for reading",
            )),
        }
    }

    /// Flush buffered writes and switch the file to reading from the start.
    pub fn rewind(&mut self) -> Result<()> {
        let file = match &mut self.state {
            SpoolState::Writing(w) => {
                w.flush()
                    .map_err(|e| QuernError::spill_io("flush temporary file", e))?;
                let mut file = w
                    .get_ref()
                    .try_clone()
                    .map_err(|e| QuernError::spill_io("clone temporary file handle", e))?;
                file.seek(SeekFrom::Start(0))
                    .map_err(|e| QuernError::spill_io("rewind temporary file", e))?;
                file
            }
            SpoolState::Reading(r) => {
                let mut file = r
                    .get_ref()
                    .try_clone()
                    .map_err(|e| QuernError::spill_io("clone temporary file handle", e))?;
                file.seek(SeekFrom::Start(0))
                    .map_err(|e| QuernError::spill_io("rewind temporary file", e))?;
                file
            }
        };
        self.state = SpoolState::Reading(BufReader::new(file));
        self.records_read = 0;
        Ok(())
    }

    /// Fill `buf` exactly, or return Ok(false) on a clean end-of-file at the
    /// first byte. A partial read is an error.
    pub fn read_exact_or_eof(&mut self, buf: &mut [u8]) -> Result<bool> {
        let reader = match &mut self.state {
            SpoolState::Reading(r) => r,
            SpoolState::Writing(_) => {
                return Err(QuernError::internal(
                    "read from a temporary file still open for writing",
                ))
            }
        };

        let mut filled = 0;
        while filled < buf.len() {
            let n = reader
                .read(&mut buf[filled..])
                .map_err(|e| QuernError::spill_io("read temporary file", e))?;
            if n == 0 {
                if filled == 0 {
                    return Ok(false);
                }
                return Err(QuernError::SpillCorruption(format!(
                    "short read: wanted {} bytes, got {filled}",
                    buf.len()
                )));
            }
            filled += n;
        }
        Ok(true)
    }

    pub fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        if self.read_exact_or_eof(buf)? {
            Ok(())
        } else {
            Err(QuernError::SpillCorruption(
                "unexpected end of temporary file".to_string(),
            ))
        }
    }
}

impl fmt::Debug for SpoolFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.state {
            SpoolState::Writing(_) => "writing",
            SpoolState::Reading(_) => "reading",
        };
        f.debug_struct("SpoolFile")
            .field("state", &state)
            .field("records_written", &self.records_written)
            .field("records_read", &self.records_read)
            .finish()
    }
}
