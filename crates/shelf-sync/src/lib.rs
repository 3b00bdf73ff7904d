// File: shelf-sync/src/lib.rs
// Purpose: Main entry point for the shelf-sync library

//! # shelf-sync
//!
//! Offline-first synchronization for the shelf book catalog client.
//!
//! Mutations made while the server is unreachable are applied to a local
//! cache and queued. When the server comes back the queue is replayed in
//! order, locally minted ids are swapped for server ids, and push
//! notifications arriving meanwhile are merged by id.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use shelf_sync::{BookDraft, EngineConfig, OfflineEngine};
//! use std::sync::Arc;
//!
//! let engine = Arc::new(OfflineEngine::from_config(EngineConfig::default()).await?);
//! let tasks = engine.start();
//!
//! engine.add_book(BookDraft::new("Dune", "Frank Herbert", 15.99)).await?;
//! println!("{}", engine.status().await);
//! ```

pub mod book;
pub mod cache;
pub mod catalog;
pub mod client;
pub mod compression;
pub mod config;
pub mod connectivity;
pub mod engine;
pub mod error;
pub mod identifier;
pub mod push;
pub mod queue;
pub mod realtime;
pub mod storage;
pub mod store;
pub mod sync;

// Re-export main types
pub use book::{Book, BookDraft};
pub use catalog::CatalogChange;
pub use client::{BookFilter, BookPage, HttpResourceClient, ListQuery, ResourceClient, SortOrder};
pub use config::{EngineConfig, EngineTomlConfig, ReconnectPolicy, RetryPolicy, StorageBackend};
pub use connectivity::{ConnectivityMonitor, ConnectivityState};
pub use engine::{BackgroundTasks, CatalogView, OfflineEngine, SyncStatus};
pub use error::{ClientError, EngineError, EngineResult, QueueError};
pub use identifier::RecordId;
pub use push::{PushConnector, PushFrame, PushStream, WebSocketConnector};
pub use queue::{ActionKind, ActionPayload, QueuedAction};
pub use realtime::PushEvent;
pub use storage::{DetachedStorage, FilesystemStorage, MemoryStorage, Storage};
pub use sync::{PassOutcome, SyncPhase, SyncReport};
