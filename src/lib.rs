//! Client-side sync engine for journal entries spread across several paths.

pub mod config;
pub mod error;
pub mod gateway;
pub mod model;
pub mod store;
pub mod sync;

pub use config::{ReconcileOptions, SyncConfig};
pub use error::{FetchError, FetchKind};
pub use gateway::{EntryGateway, HttpGateway, Session};
pub use model::{EntryKey, EntrySummary, EntryWithContent, PathEntries, PathId};
pub use store::ContentStore;
pub use sync::SyncEngine;
