//! Write-ahead journal with CRC32-framed records.
//!
//! Layout:
//!
//! ```text
//! [magic: u32][version: u32] ([len: u32][crc: u32][payload: len bytes])*
//! ```
//!
//! A record is either fully present with a matching checksum or it is a torn
//! tail left by a crash mid-append. Recovery keeps every record up to the
//! first bad one and truncates the file there.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use crc32fast::Hasher;
use std::fs::{File, OpenOptions};
use std::io::{self, Cursor, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, error, trace, warn};

use crate::error::Result;

/// Size of the journal header in bytes
pub const JOURNAL_HEADER_SIZE: u64 = 8;

/// Size of a record frame (length + checksum) in bytes
const FRAME_SIZE: u64 = 8;

/// Magic number for journal files
const JOURNAL_MAGIC: u32 = 0x4C44_4A4C; // "LDJL"

/// Version of the journal format
const JOURNAL_VERSION: u32 = 1;

/// Bytes discarded from the end of the journal during recovery
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TornTail {
    /// Offset of the first byte that was dropped
    pub offset: u64,
    /// Number of bytes dropped
    pub discarded: u64,
}

/// Result of opening a journal
pub struct Recovered {
    pub journal: Journal,
    /// Payloads of every intact record, in append order
    pub records: Vec<Vec<u8>>,
    /// Set when an incomplete record was cut off
    pub torn: Option<TornTail>,
}

/// Backing file of a journal.
///
/// Implemented for [`File`]; the seam exists so append failures can be
/// exercised without a failing disk.
pub trait JournalFile: Write + Seek {
    fn set_len(&mut self, size: u64) -> io::Result<()>;
    fn sync_data(&mut self) -> io::Result<()>;
    fn is_writable(&self) -> bool;
}

impl JournalFile for File {
    fn set_len(&mut self, size: u64) -> io::Result<()> {
        File::set_len(self, size)
    }

    fn sync_data(&mut self) -> io::Result<()> {
        File::sync_data(self)
    }

    fn is_writable(&self) -> bool {
        self.metadata()
            .map(|meta| !meta.permissions().readonly())
            .unwrap_or(false)
    }
}

/// An append-only journal file.
///
/// `size` and `records` only ever describe fully synced records. A failed
/// append is cut back off the file; if that cut fails too, the journal is
/// poisoned and refuses further appends.
pub struct Journal<F: JournalFile = File> {
    path: PathBuf,
    file: F,
    size: u64,
    records: u64,
    poisoned: bool,
}

impl Journal<File> {
    /// Open (or create) the journal at `path`, returning its intact records.
    ///
    /// # Errors
    ///
    /// Fails on I/O errors or when the file carries a foreign header.
    pub fn recover(path: &Path) -> Result<Recovered> {
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path)?;

        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)?;

        if (bytes.len() as u64) < JOURNAL_HEADER_SIZE {
            // Fresh file, or a crash before the header hit the disk
            file.set_len(0)?;
            file.seek(SeekFrom::Start(0))?;
            file.write_u32::<LittleEndian>(JOURNAL_MAGIC)?;
            file.write_u32::<LittleEndian>(JOURNAL_VERSION)?;
            file.sync_all()?;
            debug!(path = %path.display(), "created journal");
            return Ok(Recovered {
                journal: Self::from_parts(path, file, JOURNAL_HEADER_SIZE, 0),
                records: Vec::new(),
                torn: None,
            });
        }

        let mut cursor = Cursor::new(bytes.as_slice());
        let magic = cursor.read_u32::<LittleEndian>()?;
        if magic != JOURNAL_MAGIC {
            return Err(invalid_data(format!("invalid journal magic: {magic:#x}")));
        }
        let version = cursor.read_u32::<LittleEndian>()?;
        if version != JOURNAL_VERSION {
            return Err(invalid_data(format!("unsupported journal version: {version}")));
        }

        let (records, good_len) = scan_records(&bytes);
        let total = bytes.len() as u64;
        let torn = (good_len < total).then(|| TornTail {
            offset: good_len,
            discarded: total - good_len,
        });

        if torn.is_some() {
            file.set_len(good_len)?;
            file.sync_all()?;
        }
        file.seek(SeekFrom::End(0))?;

        let count = records.len() as u64;
        Ok(Recovered {
            journal: Self::from_parts(path, file, good_len, count),
            records,
            torn,
        })
    }
}

impl<F: JournalFile> Journal<F> {
    fn from_parts(path: &Path, file: F, size: u64, records: u64) -> Self {
        Self {
            path: path.to_path_buf(),
            file,
            size,
            records,
            poisoned: false,
        }
    }

    /// Append one record and make it durable before returning.
    ///
    /// On failure the partial frame is truncated away, so neither a replay
    /// nor a later append ever sees it.
    ///
    /// # Errors
    ///
    /// Returns an error if the write or the sync fails, or if an earlier
    /// failure could not be rolled back.
    pub fn append(&mut self, payload: &[u8]) -> Result<()> {
        if self.poisoned {
            return Err(self.poisoned_error().into());
        }
        let len = u32::try_from(payload.len())
            .map_err(|_| invalid_data("journal record too large".to_string()))?;

        let mut hasher = Hasher::new();
        hasher.update(payload);
        let crc = hasher.finalize();

        let mut frame = Vec::with_capacity(FRAME_SIZE as usize + payload.len());
        frame.write_u32::<LittleEndian>(len)?;
        frame.write_u32::<LittleEndian>(crc)?;
        frame.extend_from_slice(payload);

        if let Err(err) = self.write_frame(&frame) {
            match self.rollback() {
                Ok(()) => warn!(
                    path = %self.path.display(),
                    offset = self.size,
                    error = %err,
                    "journal append failed, partial record rolled back"
                ),
                Err(rollback) => {
                    self.poisoned = true;
                    error!(
                        path = %self.path.display(),
                        offset = self.size,
                        error = %err,
                        rollback_error = %rollback,
                        "journal append failed and could not be rolled back"
                    );
                }
            }
            return Err(err.into());
        }

        self.size += frame.len() as u64;
        self.records += 1;
        trace!(records = self.records, bytes = payload.len(), "appended journal record");
        Ok(())
    }

    fn write_frame(&mut self, frame: &[u8]) -> io::Result<()> {
        self.file.write_all(frame)?;
        self.file.flush()?;
        self.file.sync_data()
    }

    /// Cut the file back to the last synced record
    fn rollback(&mut self) -> io::Result<()> {
        self.file.set_len(self.size)?;
        self.file.seek(SeekFrom::Start(self.size))?;
        self.file.sync_data()
    }

    fn poisoned_error(&self) -> io::Error {
        io::Error::other(format!(
            "journal {} is unusable after a failed rollback",
            self.path.display()
        ))
    }

    /// Drop every record, keeping only the header.
    ///
    /// # Errors
    ///
    /// Returns an error if truncation or the sync fails.
    pub fn reset(&mut self) -> Result<()> {
        if self.poisoned {
            return Err(self.poisoned_error().into());
        }
        self.file.set_len(JOURNAL_HEADER_SIZE)?;
        self.file.seek(SeekFrom::Start(JOURNAL_HEADER_SIZE))?;
        self.file.sync_data()?;

        debug!(path = %self.path.display(), dropped = self.records, "reset journal");
        self.size = JOURNAL_HEADER_SIZE;
        self.records = 0;
        Ok(())
    }

    /// Flush and fsync the file
    pub fn sync(&mut self) -> Result<()> {
        self.file.flush()?;
        self.file.sync_data()?;
        Ok(())
    }

    /// Whether the journal can still take appends
    pub fn is_writable(&self) -> bool {
        !self.poisoned && self.file.is_writable()
    }

    /// Number of records currently in the journal
    #[must_use]
    pub const fn record_count(&self) -> u64 {
        self.records
    }

    /// Current file size in bytes
    #[must_use]
    pub const fn size(&self) -> u64 {
        self.size
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Walk the frames after the header. Returns intact payloads and the byte
/// length covered by them (header included).
fn scan_records(bytes: &[u8]) -> (Vec<Vec<u8>>, u64) {
    let total = bytes.len() as u64;
    let mut records = Vec::new();
    let mut offset = JOURNAL_HEADER_SIZE;

    while offset + FRAME_SIZE <= total {
        let mut cursor = Cursor::new(&bytes[offset as usize..]);
        let (Ok(len), Ok(expected_crc)) = (
            cursor.read_u32::<LittleEndian>(),
            cursor.read_u32::<LittleEndian>(),
        ) else {
            break;
        };

        let start = offset + FRAME_SIZE;
        let end = start + u64::from(len);
        if end > total {
            break;
        }

        let payload = &bytes[start as usize..end as usize];
        let mut hasher = Hasher::new();
        hasher.update(payload);
        if hasher.finalize() != expected_crc {
            break;
        }

        records.push(payload.to_vec());
        offset = end;
    }

    (records, offset)
}

fn invalid_data(msg: String) -> crate::error::BookError {
    io::Error::new(io::ErrorKind::InvalidData, msg).into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::OpenOptions;
    use tempfile::TempDir;

    #[test]
    fn test_append_and_recover() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("book.journal");

        {
            let mut journal = Journal::recover(&path)?.journal;
            journal.append(b"unit-1")?;
            journal.append(b"unit-2")?;
            assert_eq!(journal.record_count(), 2);
        }

        let recovered = Journal::recover(&path)?;
        assert_eq!(recovered.records, vec![b"unit-1".to_vec(), b"unit-2".to_vec()]);
        assert!(recovered.torn.is_none());
        assert_eq!(recovered.journal.record_count(), 2);
        Ok(())
    }

    #[test]
    fn test_torn_tail_is_truncated() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("book.journal");

        let good_len = {
            let mut journal = Journal::recover(&path)?.journal;
            journal.append(b"complete")?;
            journal.size()
        };

        // Simulate a crash halfway through the next record
        {
            let mut file = OpenOptions::new().append(true).open(&path)?;
            file.write_u32::<LittleEndian>(64)?;
            file.write_u32::<LittleEndian>(0xDEAD_BEEF)?;
            file.write_all(b"partial")?;
        }

        let recovered = Journal::recover(&path)?;
        assert_eq!(recovered.records, vec![b"complete".to_vec()]);
        let torn = recovered.torn.expect("torn tail should be reported");
        assert_eq!(torn.offset, good_len);
        assert_eq!(torn.discarded, FRAME_SIZE + 7);
        assert_eq!(std::fs::metadata(&path)?.len(), good_len);
        Ok(())
    }

    #[test]
    fn test_crc_mismatch_stops_recovery() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("book.journal");

        {
            let mut journal = Journal::recover(&path)?.journal;
            journal.append(b"first")?;
            journal.append(b"second")?;
        }

        // Corrupt the payload of the second record
        {
            let mut file = OpenOptions::new().write(true).open(&path)?;
            let second_payload = JOURNAL_HEADER_SIZE + FRAME_SIZE + 5 + FRAME_SIZE;
            file.seek(SeekFrom::Start(second_payload))?;
            file.write_all(b"XX")?;
        }

        let recovered = Journal::recover(&path)?;
        assert_eq!(recovered.records, vec![b"first".to_vec()]);
        assert!(recovered.torn.is_some());
        Ok(())
    }

    #[test]
    fn test_foreign_file_is_rejected() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("book.journal");
        std::fs::write(&path, b"definitely not a journal")?;

        assert!(Journal::recover(&path).is_err());
        Ok(())
    }

    /// In-memory journal file with injectable failures
    struct FlakyFile {
        data: Cursor<Vec<u8>>,
        /// Bytes accepted before writes start failing
        write_budget: usize,
        /// Number of upcoming syncs that fail
        failing_syncs: u32,
        refuse_truncate: bool,
    }

    impl Write for FlakyFile {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.write_budget == 0 {
                return Err(io::Error::other("disk full"));
            }
            let n = buf.len().min(self.write_budget);
            self.write_budget -= n;
            self.data.write(&buf[..n])
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Seek for FlakyFile {
        fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
            self.data.seek(pos)
        }
    }

    impl JournalFile for FlakyFile {
        fn set_len(&mut self, size: u64) -> io::Result<()> {
            if self.refuse_truncate {
                return Err(io::Error::other("truncate refused"));
            }
            self.data.get_mut().truncate(size as usize);
            Ok(())
        }

        fn sync_data(&mut self) -> io::Result<()> {
            if self.failing_syncs > 0 {
                self.failing_syncs -= 1;
                return Err(io::Error::other("fsync failed"));
            }
            Ok(())
        }

        fn is_writable(&self) -> bool {
            true
        }
    }

    fn flaky_journal(write_budget: usize) -> Journal<FlakyFile> {
        let mut header = Vec::new();
        header.write_u32::<LittleEndian>(JOURNAL_MAGIC).unwrap();
        header.write_u32::<LittleEndian>(JOURNAL_VERSION).unwrap();
        let mut data = Cursor::new(header);
        data.seek(SeekFrom::End(0)).unwrap();

        let file = FlakyFile {
            data,
            write_budget,
            failing_syncs: 0,
            refuse_truncate: false,
        };
        Journal::from_parts(Path::new("flaky.journal"), file, JOURNAL_HEADER_SIZE, 0)
    }

    #[test]
    fn test_torn_append_does_not_hide_later_records() {
        // Room for the first record and half of the second frame header
        let mut journal = flaky_journal(FRAME_SIZE as usize + 6 + 4);

        journal.append(b"unit-a").unwrap();
        assert!(journal.append(b"unit-b").is_err());
        assert_eq!(journal.record_count(), 1);

        journal.file.write_budget = usize::MAX;
        journal.append(b"unit-c").unwrap();

        let bytes = journal.file.data.get_ref();
        let (records, good_len) = scan_records(bytes);
        assert_eq!(records, vec![b"unit-a".to_vec(), b"unit-c".to_vec()]);
        assert_eq!(good_len, bytes.len() as u64);
        assert_eq!(journal.size(), good_len);
    }

    #[test]
    fn test_failed_sync_leaves_no_record_behind() {
        let mut journal = flaky_journal(usize::MAX);
        journal.file.failing_syncs = 1;

        assert!(journal.append(b"unsynced").is_err());

        // The bytes reached the file but must not replay
        assert_eq!(journal.file.data.get_ref().len() as u64, JOURNAL_HEADER_SIZE);
        assert_eq!(journal.record_count(), 0);
        assert!(journal.is_writable());

        journal.append(b"next").unwrap();
        let (records, _) = scan_records(journal.file.data.get_ref());
        assert_eq!(records, vec![b"next".to_vec()]);
    }

    #[test]
    fn test_failed_rollback_poisons_journal() {
        let mut journal = flaky_journal(3);
        journal.file.refuse_truncate = true;

        assert!(journal.append(b"torn").is_err());
        assert!(!journal.is_writable());

        journal.file.write_budget = usize::MAX;
        journal.file.refuse_truncate = false;
        assert!(journal.append(b"after").is_err());
        assert!(journal.reset().is_err());
    }

    #[test]
    fn test_reset_keeps_header() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("book.journal");

        let mut journal = Journal::recover(&path)?.journal;
        journal.append(b"a")?;
        journal.reset()?;
        journal.append(b"b")?;
        drop(journal);

        let recovered = Journal::recover(&path)?;
        assert_eq!(recovered.records, vec![b"b".to_vec()]);
        Ok(())
    }
}
