//! Block-aligned positioned reads over a partition data file.

use std::fs::{File, OpenOptions};
use std::io::{self, ErrorKind};
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::plan::Range;
use crate::record::{code_of, hamming, key_of, Code};
use crate::{FbiError, Key, MAX_SCAN_RESULT, RECORD_SIZE};

/// How a scan of one range ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ScanStatus {
    /// Every record of the range (or of the file) was compared.
    #[default]
    Exhausted,
    /// The per-range result cap was reached.
    Capped,
    /// A read failed; the range was abandoned at that point.
    ReadFailed,
    /// The file ended before the last record the range needs.
    Truncated,
}

/// Outcome of scanning one range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ScanReport {
    pub status: ScanStatus,
    /// Records compared against the query.
    pub scanned: usize,
    /// Records within the threshold.
    pub matched: usize,
}

/// A partition data file opened for positioned reads.
#[derive(Debug)]
pub struct DataFile {
    file: File,
    records: usize,
}

impl DataFile {
    /// Open a data file, bypassing the page cache on Linux when `direct` is
    /// set. Fails unless the file holds a whole number of records.
    pub fn open<P: AsRef<Path>>(path: P, direct: bool) -> Result<Self, FbiError> {
        let path = path.as_ref();
        let open_error = |source: io::Error| FbiError::Open {
            path: path.to_path_buf(),
            source,
        };
        let mut options = OpenOptions::new();
        options.read(true);
        #[cfg(target_os = "linux")]
        if direct {
            use std::os::unix::fs::OpenOptionsExt;
            options.custom_flags(libc::O_DIRECT);
        }
        #[cfg(not(target_os = "linux"))]
        let _ = direct;
        let file = options.open(path).map_err(open_error)?;
        let bytes = file.metadata().map_err(open_error)?.len();
        if bytes % RECORD_SIZE as u64 != 0 {
            return Err(FbiError::MalformedData {
                path: path.to_path_buf(),
                detail: format!("{bytes} bytes is not a whole number of {RECORD_SIZE}-byte records"),
            });
        }
        Ok(Self {
            file,
            records: (bytes / RECORD_SIZE as u64) as usize,
        })
    }

    /// Records in the file when it was opened.
    pub fn records(&self) -> usize {
        self.records
    }

    pub fn file(&self) -> &File {
        &self.file
    }
}

#[cfg(unix)]
fn read_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    use std::os::unix::fs::FileExt;
    file.read_at(buf, offset)
}

#[cfg(windows)]
fn read_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    use std::os::windows::fs::FileExt;
    file.seek_read(buf, offset)
}

/// One positioned read; a short count means end of file.
fn read_block_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    loop {
        match read_at(file, buf, offset) {
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            other => return other,
        }
    }
}

/// Streams ranges of a data file through a block-aligned buffer.
///
/// The buffer holds one block of carry-over for a record split across two
/// reads, followed by the read itself, and a spare block. A scanner owns its
/// buffer and is not shared between threads; the file is.
#[derive(Debug)]
pub struct Scanner {
    storage: Vec<u8>,
    start: usize,
    buffer_size: usize,
    block_size: usize,
}

/// Check a buffer and block size pair before any buffer is allocated.
pub(crate) fn check_geometry(buffer_size: usize, block_size: usize) -> Result<(), FbiError> {
    if !block_size.is_power_of_two() || block_size < RECORD_SIZE {
        return Err(FbiError::InvalidConfig(
            "block size must be a power of two no smaller than a record",
        ));
    }
    if buffer_size < 3 * block_size {
        return Err(FbiError::InvalidConfig(
            "scan buffer must hold at least three blocks",
        ));
    }
    Ok(())
}

impl Scanner {
    pub fn new(buffer_size: usize, block_size: usize) -> Result<Self, FbiError> {
        check_geometry(buffer_size, block_size)?;
        let storage = vec![0u8; buffer_size + block_size];
        let start = match storage.as_ptr().align_offset(block_size) {
            offset if offset < block_size => offset,
            _ => 0,
        };
        Ok(Self {
            storage,
            start,
            buffer_size,
            block_size,
        })
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Bytes requested per read.
    fn batch_size(&self) -> usize {
        (self.buffer_size / self.block_size - 2) * self.block_size
    }

    /// Compare every record of `range` against `query` and hand the key of
    /// each record with distance strictly below `threshold` to `on_match`.
    ///
    /// `range` is in sample positions; each covers `sample_rate` records. The
    /// last sample of a partition may cover fewer, so the range is clipped to
    /// the records of `data`. Stops after `MAX_SCAN_RESULT` matches.
    pub fn scan<F>(
        &mut self,
        data: &DataFile,
        query: &Code,
        range: Range,
        sample_rate: usize,
        threshold: u32,
        mut on_match: F,
    ) -> ScanReport
    where
        F: FnMut(Key),
    {
        let mut report = ScanReport::default();
        let first_record = range.offset * sample_rate;
        let mut remaining = (range.length * sample_rate).min(data.records.saturating_sub(first_record));
        if remaining == 0 {
            return report;
        }

        let block = self.block_size;
        let batch = self.batch_size();
        let first = (first_record * RECORD_SIZE) as u64;
        let mut pos = first / block as u64 * block as u64;
        let end = first + (remaining * RECORD_SIZE) as u64;
        let mut total = ((end + block as u64 - 1) / block as u64 * block as u64 - pos) as usize;
        let mut skip = (first - pos) as usize;
        let mut read_offset = 0usize;

        let region = &mut self.storage[self.start..self.start + self.buffer_size];
        while total > 0 && remaining > 0 {
            let want = batch.min(total);
            let got = match read_block_at(&data.file, &mut region[read_offset..read_offset + want], pos)
            {
                Ok(got) => got,
                Err(err) => {
                    warn!(offset = pos, length = want, error = %err, "positioned read failed");
                    report.status = ScanStatus::ReadFailed;
                    return report;
                }
            };
            let filled = read_offset + got;
            if filled <= skip {
                warn!(offset = pos, missing = remaining, "data file ends inside a planned range");
                report.status = ScanStatus::Truncated;
                return report;
            }
            pos += got as u64;
            total -= got;

            let left_over = (filled - skip) % RECORD_SIZE;
            let stop = filled - left_over;
            for bytes in region[skip..stop].chunks_exact(RECORD_SIZE) {
                if remaining == 0 {
                    break;
                }
                remaining -= 1;
                report.scanned += 1;
                if hamming(query, code_of(bytes)) < threshold {
                    on_match(key_of(bytes));
                    report.matched += 1;
                    if report.matched >= MAX_SCAN_RESULT {
                        debug!(
                            offset = range.offset,
                            length = range.length,
                            "scan stopped at result cap"
                        );
                        report.status = ScanStatus::Capped;
                        return report;
                    }
                }
            }

            if remaining == 0 {
                break;
            }
            // a short read before the last wanted record
            if got < want {
                warn!(offset = pos, missing = remaining, "data file ends inside a planned range");
                report.status = ScanStatus::Truncated;
                return report;
            }
            read_offset = block;
            skip = block - left_over;
            region.copy_within(stop..filled, skip);
        }
        report
    }
}
