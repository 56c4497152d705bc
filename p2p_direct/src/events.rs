//! Transfer events and the listener registry they are published through.
//!
//! Listeners are kept per event kind in registration order. Emitting takes a
//! snapshot of the handler list and releases the lock before calling anything,
//! so a handler may register, unregister or cancel the transfer it observes.

use crate::error::FailureKind;
use crate::transfer::session::SessionSummary;
use crate::{Direction, StoredArtifact};
use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Progress,
    FileStarted,
    FileFinished,
    Error,
    Complete,
}

impl EventKind {
    pub const ALL: [EventKind; 5] = [
        EventKind::Progress,
        EventKind::FileStarted,
        EventKind::FileFinished,
        EventKind::Error,
        EventKind::Complete,
    ];
}

/// Progress snapshot for one file, emitted after every chunk.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressUpdate {
    pub direction: Direction,
    pub file_id: u32,
    pub bytes_moved: u64,
    pub total_bytes: u64,
    /// Fraction in `0.0..=1.0`
    pub progress: f64,
    pub speed_bps: f64,
    pub eta_secs: f64,
    /// Aggregate bytes moved across the whole session
    pub session_bytes_moved: u64,
}

/// Failure report. `fatal` is set when the session stops because of it.
#[derive(Debug, Clone, PartialEq)]
pub struct TransferFailure {
    pub direction: Direction,
    pub file_id: Option<u32>,
    pub kind: FailureKind,
    pub message: String,
    pub fatal: bool,
}

#[derive(Debug, Clone)]
pub enum TransferEvent {
    Progress(ProgressUpdate),
    FileStarted {
        direction: Direction,
        file_id: u32,
        name: String,
        size: u64,
    },
    FileFinished {
        direction: Direction,
        file_id: u32,
        digest: String,
        verified: bool,
        artifact: Option<StoredArtifact>,
    },
    Error(TransferFailure),
    Complete(SessionSummary),
}

impl TransferEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            TransferEvent::Progress(_) => EventKind::Progress,
            TransferEvent::FileStarted { .. } => EventKind::FileStarted,
            TransferEvent::FileFinished { .. } => EventKind::FileFinished,
            TransferEvent::Error(_) => EventKind::Error,
            TransferEvent::Complete(_) => EventKind::Complete,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Handler = Arc<dyn Fn(&TransferEvent) + Send + Sync>;

#[derive(Default)]
struct ListenerTable {
    next_id: u64,
    handlers: HashMap<EventKind, Vec<(ListenerId, Handler)>>,
}

/// Pub/sub registry shared by an engine and its observers. Cloning shares the table.
#[derive(Clone, Default)]
pub struct EventBus {
    table: Arc<RwLock<ListenerTable>>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let table = self.read();
        let count: usize = table.handlers.values().map(Vec::len).sum();
        f.debug_struct("EventBus").field("listeners", &count).finish()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, ListenerTable> {
        self.table.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, ListenerTable> {
        self.table.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Register `handler` for one event kind.
    pub fn on<F>(&self, kind: EventKind, handler: F) -> ListenerId
    where
        F: Fn(&TransferEvent) + Send + Sync + 'static,
    {
        let mut table = self.write();
        let id = ListenerId(table.next_id);
        table.next_id += 1;
        table
            .handlers
            .entry(kind)
            .or_default()
            .push((id, Arc::new(handler)));
        id
    }

    /// Remove a listener. Returns false if it was not registered.
    pub fn off(&self, id: ListenerId) -> bool {
        let mut table = self.write();
        let mut removed = false;
        for list in table.handlers.values_mut() {
            let before = list.len();
            list.retain(|(lid, _)| *lid != id);
            removed |= list.len() != before;
        }
        removed
    }

    /// Forward every event into an unbounded channel.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<TransferEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        for kind in EventKind::ALL {
            let tx = tx.clone();
            self.on(kind, move |event| {
                let _ = tx.send(event.clone());
            });
        }
        rx
    }

    pub fn listener_count(&self, kind: EventKind) -> usize {
        self.read().handlers.get(&kind).map_or(0, Vec::len)
    }

    pub fn emit(&self, event: &TransferEvent) {
        let snapshot: Vec<Handler> = {
            let table = self.read();
            match table.handlers.get(&event.kind()) {
                Some(list) => list.iter().map(|(_, h)| h.clone()).collect(),
                None => return,
            }
        };
        for handler in snapshot {
            handler(event);
        }
    }
}
