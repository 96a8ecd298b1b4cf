//! Ladder - One side of the book as a dense, 1-based run of price levels.
//!
//! Index 1 is the best price. For a side holding N levels the occupied
//! indices are exactly `1..=N`: inserts shift worse levels up by one,
//! deletes shift them down by one.
//!
//! Every mutating operation comes in two shapes: `stage_*` appends the
//! mutations to a caller-owned [`WriteBatch`] (so the caller can commit them
//! together with other writes), and the plain form stages then commits.

use crate::command::{LevelIndex, PriceLevel, Side};
use crate::error::{BookError, Result};
use crate::storage::{OrderedStore, Row, WriteBatch};

/// Handle on one side's ordered table
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Ladder {
    side: Side,
}

impl Ladder {
    #[inline]
    pub const fn new(side: Side) -> Self {
        Self { side }
    }

    #[inline]
    pub const fn side(&self) -> Side {
        self.side
    }

    #[inline]
    fn table(&self) -> &'static str {
        self.side.table()
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// Point lookup
    pub fn read<S: OrderedStore>(&self, store: &S, index: LevelIndex) -> Result<Option<PriceLevel>> {
        Ok(store
            .point_read(self.table(), u64::from(index))?
            .and_then(|row| row.as_level()))
    }

    /// Every occupied level with index `<= max_index`, ascending
    pub fn read_bounded<S: OrderedStore>(
        &self,
        store: &S,
        max_index: LevelIndex,
    ) -> Result<Vec<(LevelIndex, PriceLevel)>> {
        self.read_range(store, 1, u64::from(max_index))
    }

    /// Every occupied level, ascending
    pub fn levels<S: OrderedStore>(&self, store: &S) -> Result<Vec<(LevelIndex, PriceLevel)>> {
        self.read_range(store, 1, u64::MAX)
    }

    /// Number of occupied levels
    pub fn len<S: OrderedStore>(&self, store: &S) -> Result<usize> {
        store.table_len(self.table())
    }

    pub fn is_empty<S: OrderedStore>(&self, store: &S) -> Result<bool> {
        Ok(self.len(store)? == 0)
    }

    fn read_range<S: OrderedStore>(
        &self,
        store: &S,
        from: u64,
        to: u64,
    ) -> Result<Vec<(LevelIndex, PriceLevel)>> {
        if from > to {
            return Ok(Vec::new());
        }
        Ok(store
            .range_read(self.table(), from..=to)?
            .into_iter()
            .filter_map(|(key, row)| {
                let index = LevelIndex::try_from(key).ok()?;
                Some((index, row.as_level()?))
            })
            .collect())
    }

    // ========================================================================
    // Staged mutations
    // ========================================================================

    /// Stage an insert at `index`, moving every level at `>= index` up one.
    ///
    /// `index` may be any occupied index or `len + 1` (append). Anything else
    /// would leave a hole and is rejected.
    pub fn stage_insert_shift_up<S: OrderedStore>(
        &self,
        store: &S,
        batch: &mut WriteBatch,
        index: LevelIndex,
        level: PriceLevel,
    ) -> Result<()> {
        let len = self.len(store)?;
        if index == 0 || index as usize > len + 1 {
            return Err(BookError::IndexOutOfRange {
                side: self.side,
                index,
                len,
            });
        }

        // Highest first so no level is overwritten before it has moved
        let displaced = self.read_range(store, u64::from(index), u64::MAX)?;
        for (at, moved) in displaced.into_iter().rev() {
            batch.put(self.table(), u64::from(at) + 1, Row::Level(moved));
        }
        batch.put(self.table(), u64::from(index), Row::Level(level));
        Ok(())
    }

    /// Stage a plain write at `len + 1`, the only unoccupied index that keeps
    /// the ladder dense. Nothing moves.
    pub fn stage_append<S: OrderedStore>(
        &self,
        store: &S,
        batch: &mut WriteBatch,
        index: LevelIndex,
        level: PriceLevel,
    ) -> Result<()> {
        let len = self.len(store)?;
        if index as usize != len + 1 {
            return Err(BookError::IndexOutOfRange {
                side: self.side,
                index,
                len,
            });
        }
        batch.put(self.table(), u64::from(index), Row::Level(level));
        Ok(())
    }

    /// Stage an overwrite of the level at `index`; the index does not move.
    pub fn stage_update_in_place<S: OrderedStore>(
        &self,
        store: &S,
        batch: &mut WriteBatch,
        index: LevelIndex,
        level: PriceLevel,
    ) -> Result<()> {
        if self.read(store, index)?.is_none() {
            return Err(BookError::NotFound {
                side: self.side,
                index,
            });
        }
        batch.put(self.table(), u64::from(index), Row::Level(level));
        Ok(())
    }

    /// Stage removal of the level at `index`, moving every level above it down one.
    ///
    /// Returns `false` (and stages nothing) when `index` is not occupied.
    pub fn stage_delete_shift_down<S: OrderedStore>(
        &self,
        store: &S,
        batch: &mut WriteBatch,
        index: LevelIndex,
    ) -> Result<bool> {
        if index == 0 || self.read(store, index)?.is_none() {
            return Ok(false);
        }

        // Lowest first: each write lands on the slot just vacated
        let above = self.read_range(store, u64::from(index) + 1, u64::MAX)?;
        let top = above.last().map_or(index, |(at, _)| *at);
        for (at, moved) in above {
            batch.put(self.table(), u64::from(at) - 1, Row::Level(moved));
        }
        batch.remove(self.table(), u64::from(top));
        Ok(true)
    }

    // ========================================================================
    // Committed mutations
    // ========================================================================

    /// Insert at `index` with shift, committed as one unit
    pub fn insert_shift_up<S: OrderedStore>(
        &self,
        store: &mut S,
        index: LevelIndex,
        level: PriceLevel,
    ) -> Result<()> {
        let mut batch = WriteBatch::new();
        self.stage_insert_shift_up(store, &mut batch, index, level)?;
        store.commit(batch)
    }

    /// Overwrite in place, committed as one unit
    pub fn update_in_place<S: OrderedStore>(
        &self,
        store: &mut S,
        index: LevelIndex,
        level: PriceLevel,
    ) -> Result<()> {
        let mut batch = WriteBatch::with_capacity(1);
        self.stage_update_in_place(store, &mut batch, index, level)?;
        store.commit(batch)
    }

    /// Delete with shift, committed as one unit. Returns whether a level was removed.
    pub fn delete_shift_down<S: OrderedStore>(&self, store: &mut S, index: LevelIndex) -> Result<bool> {
        let mut batch = WriteBatch::new();
        if !self.stage_delete_shift_down(store, &mut batch, index)? {
            return Ok(false);
        }
        store.commit(batch)?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use rust_decimal::Decimal;

    fn lvl(price: i64, quantity: u64) -> PriceLevel {
        PriceLevel::new(Decimal::from(price), quantity)
    }

    fn setup(levels: &[(i64, u64)]) -> (MemoryStore, Ladder) {
        let mut store = MemoryStore::new();
        store.create_ordered_table(Side::Bid.table()).unwrap();
        let ladder = Ladder::new(Side::Bid);
        for (i, &(price, qty)) in levels.iter().enumerate() {
            ladder
                .insert_shift_up(&mut store, i as LevelIndex + 1, lvl(price, qty))
                .unwrap();
        }
        (store, ladder)
    }

    fn prices(store: &MemoryStore, ladder: &Ladder) -> Vec<(LevelIndex, i64)> {
        ladder
            .levels(store)
            .unwrap()
            .into_iter()
            .map(|(i, l)| (i, l.price.try_into().unwrap()))
            .collect()
    }

    #[test]
    fn test_empty_ladder() {
        let (store, ladder) = setup(&[]);
        assert!(ladder.is_empty(&store).unwrap());
        assert_eq!(ladder.read(&store, 1).unwrap(), None);
        assert!(ladder.read_bounded(&store, 10).unwrap().is_empty());
    }

    #[test]
    fn test_append_round_trip() {
        let (store, ladder) = setup(&[(50, 30)]);
        assert_eq!(ladder.read(&store, 1).unwrap(), Some(lvl(50, 30)));
        assert_eq!(ladder.len(&store).unwrap(), 1);
    }

    #[test]
    fn test_insert_at_top_shifts_everything_up() {
        let (mut store, ladder) = setup(&[(50, 1), (40, 2), (30, 3)]);

        ladder.insert_shift_up(&mut store, 1, lvl(55, 9)).unwrap();

        assert_eq!(prices(&store, &ladder), vec![(1, 55), (2, 50), (3, 40), (4, 30)]);
    }

    #[test]
    fn test_insert_in_middle_keeps_better_levels() {
        let (mut store, ladder) = setup(&[(50, 1), (40, 2), (30, 3)]);

        ladder.insert_shift_up(&mut store, 2, lvl(45, 9)).unwrap();

        assert_eq!(prices(&store, &ladder), vec![(1, 50), (2, 45), (3, 40), (4, 30)]);
        assert_eq!(ladder.read(&store, 1).unwrap(), Some(lvl(50, 1)));
    }

    #[test]
    fn test_insert_past_end_is_rejected() {
        let (mut store, ladder) = setup(&[(50, 1)]);

        let err = ladder.insert_shift_up(&mut store, 3, lvl(30, 1)).unwrap_err();
        assert!(matches!(err, BookError::IndexOutOfRange { index: 3, len: 1, .. }));

        let err = ladder.insert_shift_up(&mut store, 0, lvl(30, 1)).unwrap_err();
        assert!(matches!(err, BookError::IndexOutOfRange { index: 0, .. }));
        assert_eq!(ladder.len(&store).unwrap(), 1);
    }

    #[test]
    fn test_stage_append_only_at_len_plus_one() {
        let (store, ladder) = setup(&[(50, 1), (40, 2)]);
        let mut batch = WriteBatch::new();

        ladder.stage_append(&store, &mut batch, 3, lvl(30, 3)).unwrap();
        assert_eq!(batch.len(), 1);

        let err = ladder.stage_append(&store, &mut batch, 5, lvl(10, 1)).unwrap_err();
        assert!(matches!(err, BookError::IndexOutOfRange { index: 5, len: 2, .. }));
    }

    #[test]
    fn test_update_in_place() {
        let (mut store, ladder) = setup(&[(50, 30), (40, 40)]);

        ladder.update_in_place(&mut store, 1, lvl(50, 40)).unwrap();

        assert_eq!(ladder.read(&store, 1).unwrap(), Some(lvl(50, 40)));
        assert_eq!(ladder.read(&store, 2).unwrap(), Some(lvl(40, 40)));
    }

    #[test]
    fn test_update_missing_is_not_found() {
        let (mut store, ladder) = setup(&[(50, 30)]);

        let err = ladder.update_in_place(&mut store, 2, lvl(1, 1)).unwrap_err();
        assert!(matches!(err, BookError::NotFound { side: Side::Bid, index: 2 }));
        assert_eq!(prices(&store, &ladder), vec![(1, 50)]);
    }

    #[test]
    fn test_delete_from_middle_shifts_down() {
        let (mut store, ladder) = setup(&[(50, 1), (40, 2), (30, 3), (20, 4)]);

        assert!(ladder.delete_shift_down(&mut store, 2).unwrap());

        assert_eq!(prices(&store, &ladder), vec![(1, 50), (2, 30), (3, 20)]);
    }

    #[test]
    fn test_delete_last_and_only() {
        let (mut store, ladder) = setup(&[(50, 1), (40, 2)]);

        assert!(ladder.delete_shift_down(&mut store, 2).unwrap());
        assert_eq!(prices(&store, &ladder), vec![(1, 50)]);

        assert!(ladder.delete_shift_down(&mut store, 1).unwrap());
        assert!(ladder.is_empty(&store).unwrap());
    }

    #[test]
    fn test_delete_missing_is_noop() {
        let (mut store, ladder) = setup(&[(50, 1)]);

        assert!(!ladder.delete_shift_down(&mut store, 5).unwrap());
        assert!(!ladder.delete_shift_down(&mut store, 0).unwrap());
        assert_eq!(prices(&store, &ladder), vec![(1, 50)]);
    }

    #[test]
    fn test_read_bounded() {
        let (store, ladder) = setup(&[(50, 1), (40, 2), (30, 3)]);

        let top: Vec<LevelIndex> = ladder
            .read_bounded(&store, 2)
            .unwrap()
            .into_iter()
            .map(|(i, _)| i)
            .collect();
        assert_eq!(top, vec![1, 2]);
        assert!(ladder.read_bounded(&store, 0).unwrap().is_empty());
    }

    #[test]
    fn test_staged_shift_is_one_batch() {
        let (store, ladder) = setup(&[(50, 1), (40, 2), (30, 3)]);
        let mut batch = WriteBatch::new();

        ladder.stage_insert_shift_up(&store, &mut batch, 1, lvl(60, 1)).unwrap();

        // Three moves plus the new level, nothing applied yet
        assert_eq!(batch.len(), 4);
        assert_eq!(ladder.len(&store).unwrap(), 3);
    }
}
