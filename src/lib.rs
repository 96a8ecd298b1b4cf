//! # Ladder Book
//!
//! A durable, depth-indexed bid/ask book maintained by explicit level
//! instructions (new, update, delete) rather than by matching orders.
//!
//! ## Design Principles
//!
//! - **Dense Ladders**: each side's occupied indices are always exactly `1..=N`
//! - **Single-Writer**: one thread owns the store; reads queue behind writes
//! - **Atomic Shifts**: a shift and its log entry commit as one journal unit
//! - **No Globals**: the store is handed to the processor at construction
//!
//! ## Architecture
//!
//! ```text
//! [BookHandle] --> [mpsc channel] --> [Writer Thread] --> [BookProcessor]
//!                                                              |
//!                                          [Ladder x2 + EventLog] --> [OrderedStore]
//!                                                                        |
//!                                                             [Journal + Snapshot]
//! ```

pub mod command;
pub mod error;
pub mod config;
pub mod journal;
pub mod storage;
pub mod ladder;
pub mod event_log;
pub mod book_view;
pub mod processor;
pub mod engine;
pub mod feed;

// Re-exports for convenience
pub use command::{Instruction, InstructionKind, LevelIndex, PriceLevel, Side};
pub use error::{BookError, Result};
pub use config::BookConfig;
pub use storage::{BookStore, JournaledStore, MemoryStore, OrderedStore, Row, WriteBatch};
pub use ladder::Ladder;
pub use event_log::{EventLog, LogEntry};
pub use book_view::{build_snapshot, BookRow, BookSnapshot};
pub use processor::BookProcessor;
pub use engine::{spawn, BookHandle, Engine};
