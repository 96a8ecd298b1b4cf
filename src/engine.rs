//! Engine - The single serialization point in front of the processor.
//!
//! The processor runs on a dedicated writer thread (optionally pinned to a
//! core) that drains one tokio channel. Instructions and reads share that
//! channel, so every read observes the state left by every instruction that
//! arrived before it, and no two requests ever overlap.
//!
//! ```text
//! [BookHandle] --+
//! [BookHandle] --+--> [mpsc channel] --> [Writer Thread] --> [BookProcessor]
//! [BookHandle] --+                              |
//!                                        [oneshot replies]
//! ```

use std::thread::JoinHandle;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::book_view::BookSnapshot;
use crate::command::{Instruction, LevelIndex};
use crate::config::BookConfig;
use crate::error::{BookError, Result};
use crate::event_log::LogEntry;
use crate::processor::BookProcessor;
use crate::storage::OrderedStore;

/// Requests accepted by the writer thread
enum Request {
    /// Apply an instruction; `reply` is `None` for fire-and-forget
    Submit {
        instruction: Instruction,
        reply: Option<oneshot::Sender<Result<LogEntry>>>,
    },
    OrderBook {
        depth: LevelIndex,
        reply: oneshot::Sender<Result<BookSnapshot>>,
    },
    Entries {
        limit: usize,
        reply: oneshot::Sender<Result<Vec<LogEntry>>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Owns the processor on the writer thread.
pub struct Engine<S: OrderedStore> {
    processor: BookProcessor<S>,
}

impl<S: OrderedStore> Engine<S> {
    pub fn new(processor: BookProcessor<S>) -> Self {
        Self { processor }
    }

    /// Drain `input` until every handle is dropped or a shutdown arrives.
    fn run(&mut self, mut input: mpsc::Receiver<Request>, pin_to_core: bool) {
        if pin_to_core {
            self.pin_to_core();
        }
        info!(node = %self.processor.node_id(), "writer thread started");

        while let Some(request) = input.blocking_recv() {
            if let Some(reply) = self.handle(request) {
                let _ = reply.send(());
                break;
            }
        }

        info!(node = %self.processor.node_id(), "writer thread stopped");
    }

    /// Process one request. Returns the shutdown acknowledgment channel when
    /// the loop should stop.
    fn handle(&mut self, request: Request) -> Option<oneshot::Sender<()>> {
        match request {
            Request::Submit { instruction, reply } => {
                let result = self.processor.submit(instruction);
                match reply {
                    // Caller may have stopped waiting; the instruction still applied
                    Some(reply) => {
                        let _ = reply.send(result);
                    }
                    None => {
                        if let Err(err) = result {
                            warn!(?instruction, error = %err, "posted instruction rejected");
                        }
                    }
                }
            }
            Request::OrderBook { depth, reply } => {
                let _ = reply.send(self.processor.order_book(depth));
            }
            Request::Entries { limit, reply } => {
                let _ = reply.send(self.processor.entries(limit));
            }
            Request::Shutdown { reply } => return Some(reply),
        }
        None
    }

    /// Pin the current thread to the last available CPU core.
    ///
    /// The last core is typically isolated from OS interrupts.
    pub fn pin_to_core(&self) {
        if let Some(core_ids) = core_affinity::get_core_ids() {
            if let Some(last_core) = core_ids.last() {
                let pinned = core_affinity::set_for_current(*last_core);
                debug!(core = last_core.id, pinned, "writer thread pinning");
            }
        }
    }

    pub fn into_processor(self) -> BookProcessor<S> {
        self.processor
    }
}

/// Start the writer thread for `processor`.
///
/// The returned join handle yields once every [`BookHandle`] is dropped or
/// [`BookHandle::shutdown`] is called.
pub fn spawn<S>(processor: BookProcessor<S>, config: &BookConfig) -> Result<(BookHandle, JoinHandle<()>)>
where
    S: OrderedStore + Send + 'static,
{
    let (tx, rx) = mpsc::channel(config.channel_capacity.max(1));
    let pin = config.pin_to_core;
    let mut engine = Engine::new(processor);

    let thread = std::thread::Builder::new()
        .name("ladder-writer".to_string())
        .spawn(move || engine.run(rx, pin))?;

    Ok((BookHandle { tx }, thread))
}

/// Caller-side handle to the book. Cheap to clone; all clones feed the
/// same writer thread.
#[derive(Clone, Debug)]
pub struct BookHandle {
    tx: mpsc::Sender<Request>,
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Request::Submit { instruction, reply } => f
                .debug_struct("Submit")
                .field("instruction", instruction)
                .field("acknowledged", &reply.is_some())
                .finish(),
            Request::OrderBook { depth, .. } => f.debug_struct("OrderBook").field("depth", depth).finish(),
            Request::Entries { limit, .. } => f.debug_struct("Entries").field("limit", limit).finish(),
            Request::Shutdown { .. } => f.write_str("Shutdown"),
        }
    }
}

impl BookHandle {
    /// Apply an instruction and wait for its outcome.
    ///
    /// # Errors
    ///
    /// The processor's rejection (`NotFound`, `IndexOutOfRange`, ...) or
    /// `ProcessorStopped` if the writer thread is gone.
    pub async fn submit(&self, instruction: Instruction) -> Result<LogEntry> {
        let (reply, rx) = oneshot::channel();
        self.send(Request::Submit {
            instruction,
            reply: Some(reply),
        })
        .await?;
        rx.await.map_err(|_| BookError::ProcessorStopped)?
    }

    /// Queue an instruction without waiting for its outcome.
    ///
    /// Ordering relative to every other request is still preserved. A
    /// rejection is only logged; callers must not treat a successful return
    /// as an acknowledgment that the instruction was applied or made durable.
    pub async fn post(&self, instruction: Instruction) -> Result<()> {
        self.send(Request::Submit {
            instruction,
            reply: None,
        })
        .await
    }

    /// Merged book down to `depth`.
    ///
    /// The snapshot is padded to `depth` rows, so its size grows with
    /// `depth` even on a shallow book.
    pub async fn order_book(&self, depth: LevelIndex) -> Result<BookSnapshot> {
        let (reply, rx) = oneshot::channel();
        self.send(Request::OrderBook { depth, reply }).await?;
        rx.await.map_err(|_| BookError::ProcessorStopped)?
    }

    /// The most recent `limit` log entries, oldest first
    pub async fn entries(&self, limit: usize) -> Result<Vec<LogEntry>> {
        let (reply, rx) = oneshot::channel();
        self.send(Request::Entries { limit, reply }).await?;
        rx.await.map_err(|_| BookError::ProcessorStopped)?
    }

    /// Stop the writer thread once every request queued before this one is done.
    pub async fn shutdown(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Request::Shutdown { reply }).await?;
        rx.await.map_err(|_| BookError::ProcessorStopped)
    }

    async fn send(&self, request: Request) -> Result<()> {
        self.tx
            .send(request)
            .await
            .map_err(|_| BookError::ProcessorStopped)
    }
}
