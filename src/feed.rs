//! Feed - CSV instruction rows for replaying a recorded session.
//!
//! Expected header: `kind,side,index,price,quantity`. `kind` is one of
//! new/update/delete and `side` one of bid/ask (buy/sell also accepted).
//! Price and quantity may be left empty on delete rows.

use rust_decimal::Decimal;
use serde::Deserialize;
use std::io::Read;

use crate::command::{Instruction, InstructionKind, LevelIndex, Side};
use crate::error::{BookError, Result};

/// One raw CSV row
#[derive(Debug, Deserialize)]
pub struct InstructionRow {
    pub kind: String,
    pub side: String,
    pub index: LevelIndex,
    pub price: Option<Decimal>,
    pub quantity: Option<u64>,
}

impl InstructionRow {
    /// Convert a raw row to a typed instruction
    pub fn to_instruction(&self) -> Result<Instruction> {
        let side = match self.side.to_ascii_lowercase().as_str() {
            "bid" | "buy" => Side::Bid,
            "ask" | "sell" => Side::Ask,
            other => return Err(BookError::InvalidInstruction(format!("unknown side `{other}`"))),
        };

        let kind = match self.kind.to_ascii_lowercase().as_str() {
            "new" | "insert" => InstructionKind::New,
            "update" | "change" => InstructionKind::Update,
            "delete" | "remove" => InstructionKind::Delete,
            other => return Err(BookError::InvalidInstruction(format!("unknown kind `{other}`"))),
        };

        if kind == InstructionKind::Delete {
            return Ok(Instruction::delete(side, self.index));
        }

        let price = self.price.ok_or_else(|| {
            BookError::InvalidInstruction(format!("{kind:?} at {side} {} has no price", self.index))
        })?;
        let quantity = self.quantity.ok_or_else(|| {
            BookError::InvalidInstruction(format!("{kind:?} at {side} {} has no quantity", self.index))
        })?;

        Ok(Instruction {
            kind,
            side,
            index: self.index,
            price,
            quantity,
        })
    }
}

/// Parse every row of a CSV feed. Stops at the first bad row.
pub fn read_instructions<R: Read>(reader: R) -> Result<Vec<Instruction>> {
    let mut rdr = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_reader(reader);

    rdr.deserialize::<InstructionRow>()
        .enumerate()
        .map(|(line, row)| {
            let row = row.map_err(|err| {
                BookError::InvalidInstruction(format!("row {}: {err}", line + 1))
            })?;
            row.to_instruction()
        })
        .collect()
}

/// The reference walkthrough: two levels per side, then two updates
pub fn walkthrough() -> Vec<Instruction> {
    vec![
        Instruction::new_level(Side::Bid, 1, Decimal::from(50), 30),
        Instruction::new_level(Side::Bid, 2, Decimal::from(40), 40),
        Instruction::new_level(Side::Ask, 1, Decimal::from(60), 10),
        Instruction::new_level(Side::Ask, 2, Decimal::from(70), 20),
        Instruction::update(Side::Ask, 2, Decimal::from(70), 20),
        Instruction::update(Side::Bid, 1, Decimal::from(50), 40),
    ]
}
