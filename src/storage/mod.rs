//! Persistence adapter.
//!
//! A thin read/write surface over the monitoring schema (no business
//! logic): the [`MonitorStore`] trait, its SQLite and in-memory backends,
//! and the row structs.

pub mod backend;
pub mod error;
pub mod memory;
pub mod schema;
pub mod sqlite;

pub use backend::MonitorStore;
pub use error::{StorageError, StorageResult};

use std::sync::Arc;

/// Shared handle to whichever backend is active.
pub type StoreHandle = Arc<dyn MonitorStore>;
