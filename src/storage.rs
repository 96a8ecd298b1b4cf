//! Storage - Ordered tables with atomic multi-key commits.
//!
//! The book only ever talks to an [`OrderedStore`]. Two implementations:
//!
//! - [`MemoryStore`]: `BTreeMap` per table, non-durable
//! - [`JournaledStore`]: a `MemoryStore` image fronted by a write-ahead
//!   journal and a periodically swapped snapshot file
//!
//! Every [`WriteBatch`] is one durable unit. A crash can lose the last unit
//! but can never leave half of it applied.

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::command::{Instruction, PriceLevel};
use crate::error::{BookError, Result};
use crate::journal::Journal;

/// Journal file name inside the data directory
pub const JOURNAL_FILE: &str = "book.journal";

/// Snapshot file name inside the data directory
pub const SNAPSHOT_FILE: &str = "book.snapshot";

const SNAPSHOT_TMP_FILE: &str = "book.snapshot.tmp";

/// Initial backoff between readiness probes
const READY_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// A value stored in an ordered table
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Row {
    /// A ladder level
    Level(PriceLevel),
    /// An event log entry
    Entry(Instruction),
}

impl Row {
    #[inline]
    pub fn as_level(&self) -> Option<PriceLevel> {
        match self {
            Row::Level(level) => Some(*level),
            Row::Entry(_) => None,
        }
    }

    #[inline]
    pub fn as_entry(&self) -> Option<Instruction> {
        match self {
            Row::Entry(instruction) => Some(*instruction),
            Row::Level(_) => None,
        }
    }
}

/// One change inside a [`WriteBatch`]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mutation {
    CreateTable { table: String },
    Put { table: String, key: u64, row: Row },
    Remove { table: String, key: u64 },
}

impl Mutation {
    fn table(&self) -> &str {
        match self {
            Mutation::CreateTable { table }
            | Mutation::Put { table, .. }
            | Mutation::Remove { table, .. } => table,
        }
    }
}

/// A group of mutations applied as a single unit, in order
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WriteBatch {
    ops: Vec<Mutation>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            ops: Vec::with_capacity(capacity),
        }
    }

    pub fn create_table(&mut self, table: &str) -> &mut Self {
        self.ops.push(Mutation::CreateTable {
            table: table.to_string(),
        });
        self
    }

    pub fn put(&mut self, table: &str, key: u64, row: Row) -> &mut Self {
        self.ops.push(Mutation::Put {
            table: table.to_string(),
            key,
            row,
        });
        self
    }

    pub fn remove(&mut self, table: &str, key: u64) -> &mut Self {
        self.ops.push(Mutation::Remove {
            table: table.to_string(),
            key,
        });
        self
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn mutations(&self) -> &[Mutation] {
        &self.ops
    }

    pub fn into_mutations(self) -> Vec<Mutation> {
        self.ops
    }
}

/// The persistence surface the book is written against.
///
/// All reads observe every previously committed write. There is a single
/// writer, so no isolation between transactions is provided or needed.
pub trait OrderedStore {
    /// Create `name` if it does not exist yet
    fn create_ordered_table(&mut self, name: &str) -> Result<()>;

    /// Read one key
    fn point_read(&self, table: &str, key: u64) -> Result<Option<Row>>;

    /// Read every key in `keys`, ascending
    fn range_read(&self, table: &str, keys: RangeInclusive<u64>) -> Result<Vec<(u64, Row)>>;

    /// Apply every mutation in `batch` as one unit
    fn commit(&mut self, batch: WriteBatch) -> Result<()>;

    /// Block until every table in `tables` is usable or `timeout` elapses
    fn wait_ready(&self, tables: &[&str], timeout: Duration) -> Result<()>;

    /// Write one key
    fn write(&mut self, table: &str, key: u64, row: Row) -> Result<()> {
        let mut batch = WriteBatch::with_capacity(1);
        batch.put(table, key, row);
        self.commit(batch)
    }

    /// Delete one key. Deleting an absent key is not an error.
    fn delete(&mut self, table: &str, key: u64) -> Result<()> {
        let mut batch = WriteBatch::with_capacity(1);
        batch.remove(table, key);
        self.commit(batch)
    }

    /// Number of keys in `table`
    fn table_len(&self, table: &str) -> Result<usize> {
        Ok(self.range_read(table, 0..=u64::MAX)?.len())
    }

    /// Highest key in `table`
    fn last_key(&self, table: &str) -> Result<Option<u64>> {
        Ok(self
            .range_read(table, 0..=u64::MAX)?
            .last()
            .map(|(key, _)| *key))
    }
}

/// Poll `probe` with exponential backoff until it succeeds or `timeout` passes.
/// Returns the last probe error on timeout.
fn poll_until_ready(timeout: Duration, mut probe: impl FnMut() -> Result<()>) -> Result<()> {
    let deadline = Instant::now() + timeout;
    let mut interval = READY_POLL_INTERVAL;
    loop {
        match probe() {
            Ok(()) => return Ok(()),
            Err(err) if Instant::now() >= deadline => return Err(err),
            Err(_) => {
                std::thread::sleep(interval);
                interval = (interval * 2).min(Duration::from_millis(250));
            }
        }
    }
}

// ============================================================================
// In-memory store
// ============================================================================

/// Ordered tables held in memory
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryStore {
    tables: FxHashMap<String, BTreeMap<u64, Row>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self, name: &str) -> Result<&BTreeMap<u64, Row>> {
        self.tables
            .get(name)
            .ok_or_else(|| BookError::UnknownTable(name.to_string()))
    }

    pub fn has_table(&self, name: &str) -> bool {
        self.tables.contains_key(name)
    }

    /// Reject a batch that touches a table neither existing nor created earlier in it
    fn validate(&self, ops: &[Mutation]) -> Result<()> {
        let mut created: Vec<&str> = Vec::new();
        for op in ops {
            let table = op.table();
            match op {
                Mutation::CreateTable { .. } => created.push(table),
                _ if self.has_table(table) || created.contains(&table) => {}
                _ => return Err(BookError::UnknownTable(table.to_string())),
            }
        }
        Ok(())
    }

    /// Apply already-validated mutations
    fn apply(&mut self, ops: Vec<Mutation>) {
        for op in ops {
            match op {
                Mutation::CreateTable { table } => {
                    self.tables.entry(table).or_default();
                }
                Mutation::Put { table, key, row } => {
                    self.tables.entry(table).or_default().insert(key, row);
                }
                Mutation::Remove { table, key } => {
                    if let Some(rows) = self.tables.get_mut(&table) {
                        rows.remove(&key);
                    }
                }
            }
        }
    }
}

impl OrderedStore for MemoryStore {
    fn create_ordered_table(&mut self, name: &str) -> Result<()> {
        self.tables.entry(name.to_string()).or_default();
        Ok(())
    }

    fn point_read(&self, table: &str, key: u64) -> Result<Option<Row>> {
        Ok(self.table(table)?.get(&key).cloned())
    }

    fn range_read(&self, table: &str, keys: RangeInclusive<u64>) -> Result<Vec<(u64, Row)>> {
        Ok(self
            .table(table)?
            .range(keys)
            .map(|(key, row)| (*key, row.clone()))
            .collect())
    }

    fn commit(&mut self, batch: WriteBatch) -> Result<()> {
        let ops = batch.into_mutations();
        self.validate(&ops)?;
        self.apply(ops);
        Ok(())
    }

    fn wait_ready(&self, tables: &[&str], timeout: Duration) -> Result<()> {
        poll_until_ready(timeout, || {
            tables.iter().try_for_each(|name| self.table(name).map(|_| ()))
        })
    }

    fn table_len(&self, table: &str) -> Result<usize> {
        Ok(self.table(table)?.len())
    }

    fn last_key(&self, table: &str) -> Result<Option<u64>> {
        Ok(self.table(table)?.keys().next_back().copied())
    }
}

// ============================================================================
// Journaled store
// ============================================================================

/// One committed unit as written to the journal
#[derive(Debug, Serialize, Deserialize)]
struct JournalUnit {
    seq: u64,
    ops: Vec<Mutation>,
}

/// On-disk snapshot of every table
#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreImage {
    /// Highest journal unit folded into this image
    seq: u64,
    store: MemoryStore,
}

/// Durable ordered store: write-ahead journal plus snapshot swap.
///
/// `commit` journals the batch as one checksummed record and fsyncs it
/// before touching the in-memory image, so recovery replays whole units
/// only.
pub struct JournaledStore {
    dir: PathBuf,
    image: MemoryStore,
    journal: Journal,
    /// Sequence of the last committed unit
    seq: u64,
    /// Units between snapshots (0 = never)
    compact_after: u64,
    /// Journal length at which the next compaction is attempted
    compact_due: u64,
}

impl JournaledStore {
    /// Open the store in `dir`, recovering from any earlier run.
    ///
    /// A torn final journal unit (crash mid-commit) is rolled back.
    pub fn open(dir: impl AsRef<Path>, compact_after: u64) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let snapshot_path = dir.join(SNAPSHOT_FILE);
        let image = if snapshot_path.exists() {
            let raw = fs::read(&snapshot_path)?;
            serde_json::from_slice::<StoreImage>(&raw)?
        } else {
            StoreImage::default()
        };
        let snapshot_seq = image.seq;
        let mut store = image.store;
        let mut seq = snapshot_seq;

        let recovered = Journal::recover(&dir.join(JOURNAL_FILE))?;
        let mut replayed = 0u64;
        for record in recovered.records {
            let unit: JournalUnit = serde_json::from_slice(&record)?;
            if unit.seq <= snapshot_seq {
                // Already folded into the snapshot before the journal was reset
                continue;
            }
            store.validate(&unit.ops)?;
            store.apply(unit.ops);
            seq = unit.seq;
            replayed += 1;
        }

        if let Some(torn) = recovered.torn {
            warn!(
                dir = %dir.display(),
                offset = torn.offset,
                discarded = torn.discarded,
                "partial shift detected: rolled back incomplete journal unit"
            );
        }

        info!(
            dir = %dir.display(),
            snapshot_seq,
            replayed,
            seq,
            tables = store.tables.len(),
            "journaled store recovered"
        );

        Ok(Self {
            dir,
            image: store,
            journal: recovered.journal,
            seq,
            compact_after,
            compact_due: compact_after,
        })
    }

    /// Fold the journal into a fresh snapshot and reset the journal.
    ///
    /// The snapshot is written beside the live one and renamed over it, so a
    /// crash at any point leaves either the old or the new snapshot intact.
    pub fn compact(&mut self) -> Result<()> {
        let tmp_path = self.dir.join(SNAPSHOT_TMP_FILE);
        {
            let file = File::create(&tmp_path)?;
            let mut writer = BufWriter::new(file);
            serde_json::to_writer(
                &mut writer,
                &StoreImageRef {
                    seq: self.seq,
                    store: &self.image,
                },
            )?;
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        fs::rename(&tmp_path, self.dir.join(SNAPSHOT_FILE))?;
        if let Ok(dir) = File::open(&self.dir) {
            // Persist the rename itself; not supported on every platform
            let _ = dir.sync_all();
        }

        self.journal.reset()?;
        self.compact_due = self.compact_after;
        debug!(seq = self.seq, dir = %self.dir.display(), "compacted journal into snapshot");
        Ok(())
    }

    /// Sequence number of the last committed unit
    #[inline]
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Units currently held in the journal (not yet in a snapshot)
    #[inline]
    pub fn journal_len(&self) -> u64 {
        self.journal.record_count()
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

/// Borrowing twin of [`StoreImage`] so compaction does not clone the tables
#[derive(Serialize)]
struct StoreImageRef<'a> {
    seq: u64,
    store: &'a MemoryStore,
}

impl OrderedStore for JournaledStore {
    fn create_ordered_table(&mut self, name: &str) -> Result<()> {
        if self.image.has_table(name) {
            return Ok(());
        }
        let mut batch = WriteBatch::with_capacity(1);
        batch.create_table(name);
        self.commit(batch)
    }

    fn point_read(&self, table: &str, key: u64) -> Result<Option<Row>> {
        self.image.point_read(table, key)
    }

    fn range_read(&self, table: &str, keys: RangeInclusive<u64>) -> Result<Vec<(u64, Row)>> {
        self.image.range_read(table, keys)
    }

    fn commit(&mut self, batch: WriteBatch) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let ops = batch.into_mutations();
        self.image.validate(&ops)?;

        let unit = JournalUnit {
            seq: self.seq + 1,
            ops,
        };
        let payload = serde_json::to_vec(&unit)?;
        self.journal.append(&payload)?;

        self.seq = unit.seq;
        self.image.apply(unit.ops);

        // Unit is durable and applied; a failed compaction must not fail the commit
        if self.compact_after > 0 && self.journal.record_count() >= self.compact_due {
            if let Err(err) = self.compact() {
                self.compact_due = self.journal.record_count() + self.compact_after;
                warn!(
                    dir = %self.dir.display(),
                    seq = self.seq,
                    journal_len = self.journal.record_count(),
                    retry_at = self.compact_due,
                    error = %err,
                    "compaction failed, journal keeps growing"
                );
            }
        }
        Ok(())
    }

    fn wait_ready(&self, tables: &[&str], timeout: Duration) -> Result<()> {
        poll_until_ready(timeout, || {
            if !self.dir.is_dir() {
                return Err(io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("data directory {} is missing", self.dir.display()),
                )
                .into());
            }
            if !self.journal.is_writable() {
                return Err(io::Error::new(
                    io::ErrorKind::PermissionDenied,
                    format!("journal {} is not writable", self.journal.path().display()),
                )
                .into());
            }
            tables
                .iter()
                .try_for_each(|name| self.image.table(name).map(|_| ()))
        })
    }

    fn table_len(&self, table: &str) -> Result<usize> {
        self.image.table_len(table)
    }

    fn last_key(&self, table: &str) -> Result<Option<u64>> {
        self.image.last_key(table)
    }
}

// ============================================================================
// Config-selected store
// ============================================================================

/// The store a [`BookConfig`](crate::config::BookConfig) asks for
pub enum BookStore {
    Memory(MemoryStore),
    Journaled(JournaledStore),
}

impl BookStore {
    /// Journaled when `data_dir` is set, in-memory otherwise
    pub fn from_config(config: &crate::config::BookConfig) -> Result<Self> {
        match &config.data_dir {
            Some(dir) => Ok(BookStore::Journaled(JournaledStore::open(
                dir,
                config.compact_after,
            )?)),
            None => Ok(BookStore::Memory(MemoryStore::new())),
        }
    }

    pub fn is_durable(&self) -> bool {
        matches!(self, BookStore::Journaled(_))
    }
}

macro_rules! delegate {
    ($self:ident, $store:ident => $call:expr) => {
        match $self {
            BookStore::Memory($store) => $call,
            BookStore::Journaled($store) => $call,
        }
    };
}

impl OrderedStore for BookStore {
    fn create_ordered_table(&mut self, name: &str) -> Result<()> {
        delegate!(self, store => store.create_ordered_table(name))
    }

    fn point_read(&self, table: &str, key: u64) -> Result<Option<Row>> {
        delegate!(self, store => store.point_read(table, key))
    }

    fn range_read(&self, table: &str, keys: RangeInclusive<u64>) -> Result<Vec<(u64, Row)>> {
        delegate!(self, store => store.range_read(table, keys))
    }

    fn commit(&mut self, batch: WriteBatch) -> Result<()> {
        delegate!(self, store => store.commit(batch))
    }

    fn wait_ready(&self, tables: &[&str], timeout: Duration) -> Result<()> {
        delegate!(self, store => store.wait_ready(tables, timeout))
    }

    fn table_len(&self, table: &str) -> Result<usize> {
        delegate!(self, store => store.table_len(table))
    }

    fn last_key(&self, table: &str) -> Result<Option<u64>> {
        delegate!(self, store => store.last_key(table))
    }
}
