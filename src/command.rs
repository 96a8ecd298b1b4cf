//! Instruction and level types for the ladder book.
//!
//! Instructions are inputs from callers (or a replayed feed).
//! Price levels are what the ladders store at each index.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// 1-based position of a price level within one side (1 = best price)
pub type LevelIndex = u32;

/// Book side (bid = buy ladder, ask = sell ladder)
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum Side {
    /// Buy side (bids)
    Bid = 0,
    /// Sell side (asks)
    Ask = 1,
}

impl Side {
    /// Both sides, bid first
    pub const ALL: [Side; 2] = [Side::Bid, Side::Ask];

    /// Name of the ordered table backing this side
    #[inline]
    pub const fn table(self) -> &'static str {
        match self {
            Side::Bid => "bid",
            Side::Ask => "ask",
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.table())
    }
}

/// A `(price, quantity)` pair occupying one index of a ladder
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceLevel {
    /// Level price
    pub price: Decimal,
    /// Resting quantity at this level
    pub quantity: u64,
}

impl PriceLevel {
    #[inline]
    pub const fn new(price: Decimal, quantity: u64) -> Self {
        Self { price, quantity }
    }

    /// The `(0, 0)` filler used where a side has no level
    pub const EMPTY: PriceLevel = PriceLevel {
        price: Decimal::ZERO,
        quantity: 0,
    };
}

// ============================================================================
// Input Instructions
// ============================================================================

/// What an instruction does to the ladder
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum InstructionKind {
    /// Insert a level, shifting worse levels up by one index
    New = 0,
    /// Overwrite price/quantity of an occupied level
    Update = 1,
    /// Remove a level, shifting worse levels down by one index
    Delete = 2,
}

/// A single book instruction.
///
/// Transient: never stored as a ladder entity, only recorded in the event log.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instruction {
    pub kind: InstructionKind,
    pub side: Side,
    pub index: LevelIndex,
    pub price: Decimal,
    pub quantity: u64,
}

impl Instruction {
    /// Insert a level at `index`
    pub const fn new_level(side: Side, index: LevelIndex, price: Decimal, quantity: u64) -> Self {
        Self {
            kind: InstructionKind::New,
            side,
            index,
            price,
            quantity,
        }
    }

    /// Overwrite the level at `index`
    pub const fn update(side: Side, index: LevelIndex, price: Decimal, quantity: u64) -> Self {
        Self {
            kind: InstructionKind::Update,
            side,
            index,
            price,
            quantity,
        }
    }

    /// Remove the level at `index`
    pub const fn delete(side: Side, index: LevelIndex) -> Self {
        Self {
            kind: InstructionKind::Delete,
            side,
            index,
            price: Decimal::ZERO,
            quantity: 0,
        }
    }

    /// The level this instruction would write
    #[inline]
    pub const fn level(&self) -> PriceLevel {
        PriceLevel::new(self.price, self.quantity)
    }
}
