//! Background synchronisation with the authority
//!
//! - [`content`]: manifest and media files
//! - [`database`]: similarity index databases
//! - [`download`]: shared temp-file + verify + rename helper

pub mod content;
pub mod database;
pub mod download;

pub use content::{ContentSyncPipeline, ContentSyncStats, SyncReport};
pub use database::{DatabaseArtifacts, DatabaseSyncOutcome, DatabaseSyncPipeline, DatabaseSyncStatus};
