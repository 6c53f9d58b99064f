//! Shelfsync Core Library
//!
//! This crate keeps a reader's position, bookshelf, bookmarks and reading
//! history consistent between an unreliable client and the server of
//! record.
//!
//! # Architecture
//!
//! - **Entity stores**: optimistic local state, `{confirmed, pending}` per key
//! - **Mutation queue**: durable per-key FIFO of unconfirmed changes
//! - **Connectivity monitor**: debounced liveness probing
//! - **Orchestrator**: drains the queue, resolves conflicts, retries
//! - **Status machine**: `idle | syncing | offline | error` for the UI
//!
//! Local changes never wait on the network. They are visible immediately,
//! written through to storage, and delivered at least once under their
//! mutation id.
//!
//! # Quick Start
//!
//! ```text
//! let session = Arc::new(SyncSession::open_with_config(&config)?);
//! session.update_position("book-1", "ch-3", 120, 0.42);
//!
//! let orchestrator = Arc::new(Orchestrator::new(session.clone(), transport.clone()));
//! tokio::spawn(session.monitor().clone().run(transport, cancel.clone()));
//! tokio::spawn(orchestrator.run(cancel));
//! ```
//!
//! # Modules
//!
//! - `session`: the session context and typed UI operations (main entry point)
//! - `models`: entity families, patches and mutation records
//! - `queue`: the durable mutation queue
//! - `store`: two-phase entity stores and conflict policy
//! - `sync`: connectivity, orchestration, status and diagnostics
//! - `storage`: SQLite and in-memory record storage
//! - `config`: application configuration

pub mod clock;
pub mod config;
pub mod device;
pub mod error;
pub mod models;
pub mod queue;
pub mod retry;
pub mod session;
pub mod storage;
pub mod store;
pub mod sync;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{Config, SyncTuning};
pub use device::DeviceId;
pub use error::SyncError;
pub use models::{
    Bookmark, BookmarkPatch, BookshelfEntry, EntityKind, HistoryEntry, MutationId, MutationOp,
    MutationRecord, ReadingPosition, ShelfStatus,
};
pub use queue::MutationQueue;
pub use session::{FamilyState, SessionSnapshot, SyncSession};
pub use storage::{MemoryStorage, SqliteStorage, Storage, StorageError};
pub use sync::{
    Connectivity, ConnectivityMonitor, DrainReport, Orchestrator, OrchestratorState, SyncEvent,
    SyncStatus,
};
pub use transport::{Method, Response, Transport, TransportError};
