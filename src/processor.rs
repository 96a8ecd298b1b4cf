//! Book Processor - Validates instructions and applies them to the ladders.
//!
//! | kind   | index occupied | effect                       | result           |
//! |--------|----------------|------------------------------|------------------|
//! | New    | no             | write at `len + 1`           | ok               |
//! | New    | yes            | insert with shift up         | ok               |
//! | Update | no             | none                         | `NotFound`       |
//! | Update | yes            | overwrite in place           | ok               |
//! | Delete | no             | none                         | ok (idempotent)  |
//! | Delete | yes            | delete with shift down       | ok               |
//!
//! Every `ok` row also appends a log entry. The ladder mutation and its log
//! entry are committed together as a single store unit.

use tracing::{debug, error, info};

use crate::book_view::{build_snapshot, BookSnapshot};
use crate::command::{Instruction, InstructionKind, LevelIndex, PriceLevel, Side};
use crate::config::BookConfig;
use crate::error::{BookError, Result};
use crate::event_log::{EventLog, LogEntry, EVENTS_TABLE};
use crate::ladder::Ladder;
use crate::storage::{BookStore, OrderedStore, WriteBatch};

/// Tables the processor needs before it accepts instructions
pub const BOOK_TABLES: [&str; 3] = [Side::Bid.table(), Side::Ask.table(), EVENTS_TABLE];

/// Sole writer of both ladders and the event log
pub struct BookProcessor<S: OrderedStore> {
    store: S,
    log: EventLog,
    node_id: String,
}

impl BookProcessor<BookStore> {
    /// Build the store `config` describes and start a processor on it
    pub fn open(config: &BookConfig) -> Result<Self> {
        let store = BookStore::from_config(config).map_err(|err| unavailable(config, err))?;
        Self::start(store, config)
    }
}

impl<S: OrderedStore> BookProcessor<S> {
    /// Bootstrap the book tables and wait for the store to become ready.
    ///
    /// # Errors
    ///
    /// `PersistenceUnavailable` if the tables cannot be created or the store
    /// is not ready within `config.ready_timeout()`.
    pub fn start(mut store: S, config: &BookConfig) -> Result<Self> {
        BOOK_TABLES
            .iter()
            .try_for_each(|table| store.create_ordered_table(table))
            .and_then(|()| store.wait_ready(&BOOK_TABLES, config.ready_timeout()))
            .map_err(|err| unavailable(config, err))?;

        let log = EventLog::open(&store)?;
        let processor = Self {
            store,
            log,
            node_id: config.node_id.clone(),
        };

        info!(
            node = %processor.node_id,
            bid_levels = processor.level_count(Side::Bid)?,
            ask_levels = processor.level_count(Side::Ask)?,
            last_sequence = processor.log.last_sequence(),
            "book processor ready"
        );
        Ok(processor)
    }

    /// Validate and apply one instruction, returning its log entry.
    ///
    /// # Errors
    ///
    /// - `NotFound` for an Update on an unoccupied index
    /// - `IndexOutOfRange` for a New that would leave a hole
    /// - store errors if the commit fails
    ///
    /// A rejected instruction leaves the book and the log untouched.
    pub fn submit(&mut self, instruction: Instruction) -> Result<LogEntry> {
        let ladder = Ladder::new(instruction.side);
        let index = instruction.index;
        let mut batch = WriteBatch::new();

        let occupied = ladder.read(&self.store, index)?.is_some();
        match (instruction.kind, occupied) {
            (InstructionKind::New, false) => {
                ladder.stage_append(&self.store, &mut batch, index, instruction.level())?
            }
            (InstructionKind::New, true) => {
                ladder.stage_insert_shift_up(&self.store, &mut batch, index, instruction.level())?
            }
            (InstructionKind::Update, _) => {
                ladder.stage_update_in_place(&self.store, &mut batch, index, instruction.level())?
            }
            (InstructionKind::Delete, _) => {
                ladder.stage_delete_shift_down(&self.store, &mut batch, index)?;
            }
        }

        let writes = batch.len();
        let entry = self.log.stage_append(&mut batch, instruction);
        self.store.commit(batch)?;

        debug!(
            kind = ?instruction.kind,
            side = %instruction.side,
            index,
            writes,
            sequence = entry.sequence,
            "instruction applied"
        );
        Ok(entry)
    }

    /// Merged view of both ladders down to `depth`.
    ///
    /// Rows are padded out to `depth`, so the snapshot holds at least
    /// `depth` rows whatever the ladders contain. Memory grows linearly with
    /// `depth`; callers facing untrusted input should bound it first.
    ///
    /// # Errors
    ///
    /// `EmptyLadder` if either side has no levels at or above `depth`.
    pub fn order_book(&self, depth: LevelIndex) -> Result<BookSnapshot> {
        let bids = Ladder::new(Side::Bid).read_bounded(&self.store, depth)?;
        let asks = Ladder::new(Side::Ask).read_bounded(&self.store, depth)?;
        build_snapshot(&bids, &asks, depth)
    }

    /// The most recent `limit` log entries, oldest first
    pub fn entries(&self, limit: usize) -> Result<Vec<LogEntry>> {
        EventLog::list_entries(&self.store, limit)
    }

    pub fn level(&self, side: Side, index: LevelIndex) -> Result<Option<PriceLevel>> {
        Ladder::new(side).read(&self.store, index)
    }

    pub fn levels(&self, side: Side) -> Result<Vec<(LevelIndex, PriceLevel)>> {
        Ladder::new(side).levels(&self.store)
    }

    pub fn level_count(&self, side: Side) -> Result<usize> {
        Ladder::new(side).len(&self.store)
    }

    #[inline]
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    #[inline]
    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn into_store(self) -> S {
        self.store
    }
}

fn unavailable(config: &BookConfig, err: BookError) -> BookError {
    let tables: Vec<String> = BOOK_TABLES.iter().map(|t| t.to_string()).collect();
    error!(
        node = %config.node_id,
        tables = ?tables,
        data_dir = ?config.data_dir,
        error = %err,
        "persistence unavailable, refusing to start"
    );
    BookError::PersistenceUnavailable {
        node: config.node_id.clone(),
        tables,
        reason: err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use rust_decimal::Decimal;
    use std::time::Duration;

    fn processor() -> BookProcessor<MemoryStore> {
        BookProcessor::start(MemoryStore::new(), &BookConfig::default()).unwrap()
    }

    fn lvl(price: i64, quantity: u64) -> PriceLevel {
        PriceLevel::new(Decimal::from(price), quantity)
    }

    fn new_level(side: Side, index: LevelIndex, price: i64, qty: u64) -> Instruction {
        Instruction::new_level(side, index, Decimal::from(price), qty)
    }

    #[test]
    fn test_start_creates_tables() {
        let processor = processor();
        for table in BOOK_TABLES {
            assert!(processor.store().has_table(table));
        }
        assert_eq!(processor.node_id(), "ladder-node");
    }

    #[test]
    fn test_new_appends_then_shifts() {
        let mut processor = processor();
        processor.submit(new_level(Side::Bid, 1, 50, 30)).unwrap();
        processor.submit(new_level(Side::Bid, 2, 40, 40)).unwrap();
        processor.submit(new_level(Side::Bid, 1, 55, 5)).unwrap();

        let levels = processor.levels(Side::Bid).unwrap();
        assert_eq!(
            levels,
            vec![(1, lvl(55, 5)), (2, lvl(50, 30)), (3, lvl(40, 40))]
        );
        assert_eq!(processor.level_count(Side::Ask).unwrap(), 0);
    }

    #[test]
    fn test_new_with_gap_is_rejected_and_not_logged() {
        let mut processor = processor();
        let err = processor.submit(new_level(Side::Ask, 3, 60, 10)).unwrap_err();

        assert!(matches!(err, BookError::IndexOutOfRange { side: Side::Ask, index: 3, len: 0 }));
        assert!(processor.entries(10).unwrap().is_empty());
    }

    #[test]
    fn test_update_missing_returns_not_found() {
        let mut processor = processor();
        processor.submit(new_level(Side::Bid, 1, 50, 30)).unwrap();

        let err = processor
            .submit(Instruction::update(Side::Bid, 2, Decimal::from(1), 1))
            .unwrap_err();

        assert!(matches!(err, BookError::NotFound { side: Side::Bid, index: 2 }));
        assert_eq!(processor.levels(Side::Bid).unwrap(), vec![(1, lvl(50, 30))]);
        assert_eq!(processor.entries(10).unwrap().len(), 1);
    }

    #[test]
    fn test_delete_absent_is_logged_noop() {
        let mut processor = processor();
        processor.submit(new_level(Side::Bid, 1, 50, 30)).unwrap();

        processor.submit(Instruction::delete(Side::Bid, 7)).unwrap();

        assert_eq!(processor.levels(Side::Bid).unwrap(), vec![(1, lvl(50, 30))]);
        let entries = processor.entries(10).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].instruction, Instruction::delete(Side::Bid, 7));
    }

    #[test]
    fn test_every_accepted_instruction_is_logged_in_order() {
        let mut processor = processor();
        let submitted = [
            new_level(Side::Bid, 1, 50, 30),
            new_level(Side::Ask, 1, 60, 10),
            Instruction::update(Side::Ask, 1, Decimal::from(61), 11),
            Instruction::delete(Side::Bid, 1),
        ];
        for instruction in submitted {
            processor.submit(instruction).unwrap();
        }

        let logged: Vec<Instruction> = processor
            .entries(usize::MAX)
            .unwrap()
            .into_iter()
            .map(|e| e.instruction)
            .collect();
        assert_eq!(logged, submitted.to_vec());
    }

    #[test]
    fn test_order_book_requires_both_sides() {
        let mut processor = processor();
        processor.submit(new_level(Side::Bid, 1, 50, 30)).unwrap();

        let err = processor.order_book(5).unwrap_err();
        assert!(matches!(err, BookError::EmptyLadder { side: Side::Ask }));

        processor.submit(new_level(Side::Ask, 1, 60, 10)).unwrap();
        assert_eq!(processor.order_book(5).unwrap().len(), 5);
    }

    /// Store whose tables never show up
    struct NeverReady(MemoryStore);

    impl OrderedStore for NeverReady {
        fn create_ordered_table(&mut self, _name: &str) -> Result<()> {
            Ok(())
        }
        fn point_read(&self, table: &str, key: u64) -> Result<Option<crate::storage::Row>> {
            self.0.point_read(table, key)
        }
        fn range_read(
            &self,
            table: &str,
            keys: std::ops::RangeInclusive<u64>,
        ) -> Result<Vec<(u64, crate::storage::Row)>> {
            self.0.range_read(table, keys)
        }
        fn commit(&mut self, batch: WriteBatch) -> Result<()> {
            self.0.commit(batch)
        }
        fn wait_ready(&self, tables: &[&str], timeout: Duration) -> Result<()> {
            self.0.wait_ready(tables, timeout)
        }
    }

    #[test]
    fn test_unready_store_is_persistence_unavailable() {
        let config = BookConfig {
            node_id: "node-a".to_string(),
            ready_timeout_ms: 20,
            ..BookConfig::default()
        };

        let err = BookProcessor::start(NeverReady(MemoryStore::new()), &config)
            .err()
            .expect("start should fail");

        match err {
            BookError::PersistenceUnavailable { node, tables, .. } => {
                assert_eq!(node, "node-a");
                assert_eq!(tables, vec!["bid", "ask", "events"]);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
