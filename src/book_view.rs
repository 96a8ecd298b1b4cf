//! Book View - Depth-bounded merged view of both ladders.

use rust_decimal::Decimal;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::command::{LevelIndex, PriceLevel, Side};
use crate::error::{BookError, Result};

/// One position of the merged book
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookRow {
    pub position: LevelIndex,
    pub bid_price: Decimal,
    pub bid_quantity: u64,
    pub ask_price: Decimal,
    pub ask_quantity: u64,
}

impl BookRow {
    fn merge(position: LevelIndex, bid: PriceLevel, ask: PriceLevel) -> Self {
        Self {
            position,
            bid_price: bid.price,
            bid_quantity: bid.quantity,
            ask_price: ask.price,
            ask_quantity: ask.quantity,
        }
    }

    #[inline]
    pub fn bid(&self) -> PriceLevel {
        PriceLevel::new(self.bid_price, self.bid_quantity)
    }

    #[inline]
    pub fn ask(&self) -> PriceLevel {
        PriceLevel::new(self.ask_price, self.ask_quantity)
    }
}

/// Rows ordered by ascending position, gap-filled with `(0, 0)`
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookSnapshot {
    /// Depth the caller asked for
    pub depth: LevelIndex,
    pub rows: Vec<BookRow>,
}

impl BookSnapshot {
    #[inline]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Row at `position`, if the snapshot covers it
    pub fn row(&self, position: LevelIndex) -> Option<&BookRow> {
        self.rows.iter().find(|row| row.position == position)
    }
}

impl fmt::Display for BookSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{:>5} {:>12} {:>10} | {:>12} {:>10}",
            "pos", "bid_px", "bid_qty", "ask_px", "ask_qty"
        )?;
        for row in &self.rows {
            writeln!(
                f,
                "{:>5} {:>12} {:>10} | {:>12} {:>10}",
                row.position, row.bid_price, row.bid_quantity, row.ask_price, row.ask_quantity
            )?;
        }
        Ok(())
    }
}

/// Merge bid and ask levels into one snapshot.
///
/// Positions run from the lowest occupied index on either side up to the
/// larger of the highest occupied index and `depth`. A side with no level
/// at a position contributes `(0, 0)`. Inputs need not be sorted.
///
/// One row is allocated per position, so a large `depth` costs memory even
/// when both sides are shallow.
///
/// # Errors
///
/// `EmptyLadder` if either side has no levels.
pub fn build_snapshot(
    bids: &[(LevelIndex, PriceLevel)],
    asks: &[(LevelIndex, PriceLevel)],
    depth: LevelIndex,
) -> Result<BookSnapshot> {
    let (bid_min, bid_max) = bounds(bids).ok_or(BookError::EmptyLadder { side: Side::Bid })?;
    let (ask_min, ask_max) = bounds(asks).ok_or(BookError::EmptyLadder { side: Side::Ask })?;

    let first = bid_min.min(ask_min);
    let last = bid_max.max(ask_max).max(depth);

    let bid_at: FxHashMap<LevelIndex, PriceLevel> = bids.iter().copied().collect();
    let ask_at: FxHashMap<LevelIndex, PriceLevel> = asks.iter().copied().collect();

    let rows = (first..=last)
        .map(|position| {
            BookRow::merge(
                position,
                bid_at.get(&position).copied().unwrap_or(PriceLevel::EMPTY),
                ask_at.get(&position).copied().unwrap_or(PriceLevel::EMPTY),
            )
        })
        .collect();

    Ok(BookSnapshot { depth, rows })
}

fn bounds(levels: &[(LevelIndex, PriceLevel)]) -> Option<(LevelIndex, LevelIndex)> {
    let min = levels.iter().map(|(index, _)| *index).min()?;
    let max = levels.iter().map(|(index, _)| *index).max()?;
    Some((min, max))
}
