//! Durability helpers for ledger writes.
//!
//! Directory fsync matters as much as file fsync: creating a receipt adds a
//! directory entry, and without syncing the directory that entry may not
//! survive power loss even when the file contents did.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::Path;

/// Syncs a file's contents and metadata to disk.
pub fn fsync_file(file: &File) -> io::Result<()> {
    file.sync_all()
}

/// Syncs a directory, making its entries durable.
pub fn fsync_dir(dir_path: &Path) -> io::Result<()> {
    let dir = OpenOptions::new().read(true).open(dir_path)?;
    dir.sync_all()
}
