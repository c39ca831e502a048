//! Atomic file operations
//!
//! The durable log rewrites its file when historical events are replaced.
//! Rewrites go through a temp file so a crash leaves either the old log or
//! the new one, never a partial file.
//!
//! # Pattern
//!
//! 1. Write to a temporary file (.tmp)
//! 2. Call sync_all() to flush to disk
//! 3. Rename temp file to final path (atomic on most filesystems)

use std::fs::{self, File};
use std::io;
use std::path::Path;

/// Atomically write content using a writer function
///
/// # Example
///
/// ```ignore
/// atomic_write_with("data/events.jsonl", |file| {
///     writeln!(file, "line1")?;
///     Ok(())
/// })?;
/// ```
pub fn atomic_write_with<P, F>(path: P, write_fn: F) -> io::Result<()>
where
    P: AsRef<Path>,
    F: FnOnce(&mut File) -> io::Result<()>,
{
    let path = path.as_ref();
    let temp_path = path.with_extension("tmp");

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let mut file = File::create(&temp_path)?;
    if let Err(e) = write_fn(&mut file) {
        drop(file);
        let _ = fs::remove_file(&temp_path);
        return Err(e);
    }

    file.sync_all()?;
    fs::rename(&temp_path, path)?;

    Ok(())
}

/// Clean up any leftover temp files from interrupted rewrites
///
/// Called when a durable log is opened.
pub fn cleanup_temp_files<P: AsRef<Path>>(dir: P) -> io::Result<usize> {
    let dir = dir.as_ref();
    let mut cleaned = 0;

    if !dir.exists() {
        return Ok(0);
    }

    for entry in fs::read_dir(dir)? {
        let path = entry?.path();

        if path.extension().is_some_and(|e| e == "tmp") {
            fs::remove_file(&path)?;
            cleaned += 1;
        }
    }

    Ok(cleaned)
}
