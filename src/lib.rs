//! Incremental backup and restore for groupware mailbox stores.
//!
//! A store's folder hierarchy, items and folder-level metadata (rules,
//! permissions, delegation) are mirrored into a directory-tree archive and
//! synced incrementally through the server's change-sync primitive. Restore
//! walks the archive, recreates folders on the destination store, skips
//! duplicates by stable id and replays metadata in a portable form.

pub mod archive;
pub mod backup;
pub mod config;
pub mod meta;
pub mod report;
pub mod restore;
pub mod server;
pub mod stats;
pub mod utils;

// Re-export commonly used types
pub use config::Config;
pub use stats::Stats;
pub use utils::errors::BackupError;
pub type Result<T> = std::result::Result<T, BackupError>;
