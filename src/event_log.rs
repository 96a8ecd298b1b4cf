//! Event Log - Append-only record of every accepted instruction.
//!
//! Entries are keyed by a sequence timestamp (UTC nanoseconds) that is
//! strictly increasing: when the clock has not moved past the previous
//! entry, the next sequence is `previous + 1`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::command::Instruction;
use crate::error::Result;
use crate::storage::{OrderedStore, Row, WriteBatch};

/// Table holding the log
pub const EVENTS_TABLE: &str = "events";

const NANOS_PER_SEC: u64 = 1_000_000_000;

/// One accepted instruction
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Sequence timestamp, UTC nanoseconds since the epoch
    pub sequence: u64,
    pub instruction: Instruction,
}

impl LogEntry {
    /// Wall-clock time the sequence was derived from
    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        let secs = i64::try_from(self.sequence / NANOS_PER_SEC).ok()?;
        let nanos = (self.sequence % NANOS_PER_SEC) as u32;
        DateTime::from_timestamp(secs, nanos)
    }
}

/// Sequencer and reader for the event log table
#[derive(Debug, Default)]
pub struct EventLog {
    last: u64,
}

impl EventLog {
    /// Resume after the highest sequence already stored
    pub fn open<S: OrderedStore>(store: &S) -> Result<Self> {
        Ok(Self {
            last: store.last_key(EVENTS_TABLE)?.unwrap_or(0),
        })
    }

    /// Sequence of the most recent entry (0 when empty)
    #[inline]
    pub fn last_sequence(&self) -> u64 {
        self.last
    }

    /// Next strictly increasing sequence
    pub fn next_sequence(&mut self) -> u64 {
        let now = Utc::now()
            .timestamp_nanos_opt()
            .and_then(|nanos| u64::try_from(nanos).ok())
            .unwrap_or(0);
        self.next_sequence_at(now)
    }

    fn next_sequence_at(&mut self, now: u64) -> u64 {
        let sequence = now.max(self.last + 1);
        self.last = sequence;
        sequence
    }

    /// Stage an entry for `instruction` into `batch`
    pub fn stage_append(&mut self, batch: &mut WriteBatch, instruction: Instruction) -> LogEntry {
        let entry = LogEntry {
            sequence: self.next_sequence(),
            instruction,
        };
        batch.put(EVENTS_TABLE, entry.sequence, Row::Entry(instruction));
        entry
    }

    /// Append an entry on its own
    pub fn append<S: OrderedStore>(&mut self, store: &mut S, instruction: Instruction) -> Result<LogEntry> {
        let mut batch = WriteBatch::with_capacity(1);
        let entry = self.stage_append(&mut batch, instruction);
        store.commit(batch)?;
        Ok(entry)
    }

    /// The most recent `limit` entries, oldest first
    pub fn list_entries<S: OrderedStore>(store: &S, limit: usize) -> Result<Vec<LogEntry>> {
        let rows = store.range_read(EVENTS_TABLE, 0..=u64::MAX)?;
        let skip = rows.len().saturating_sub(limit);
        Ok(rows
            .into_iter()
            .skip(skip)
            .filter_map(|(sequence, row)| {
                row.as_entry().map(|instruction| LogEntry {
                    sequence,
                    instruction,
                })
            })
            .collect())
    }
}
