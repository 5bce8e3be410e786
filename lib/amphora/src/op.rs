// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Operation handles for long-running volume work.
//!
//! An [`Operation`] is created by whatever subsystem triggered the work
//! (API request, scheduled backup) and threaded through driver calls. It
//! carries user-visible progress metadata and a cancellation flag that
//! transfer loops check between phases.

use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use crate::error::{Error, Result};
use crate::units::byte_size_string;

#[derive(Default)]
pub struct Operation {
    metadata: Mutex<BTreeMap<String, String>>,
    cancelled: AtomicBool,
}

impl Operation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merges `entries` into the operation metadata.
    pub fn update_metadata<I>(&self, entries: I)
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut meta = self.metadata.lock().unwrap();
        for (key, value) in entries {
            meta.insert(key, value);
        }
    }

    pub fn set_metadata(&self, key: &str, value: String) {
        self.metadata.lock().unwrap().insert(key.to_string(), value);
    }

    /// Returns a snapshot of the current metadata.
    pub fn metadata(&self) -> BTreeMap<String, String> {
        self.metadata.lock().unwrap().clone()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Errors with [`Error::Cancelled`] once [`Operation::cancel`] has
    /// been called. Transfer loops call this between phases.
    pub fn check_cancelled(&self) -> Result<()> {
        if self.cancelled() {
            return Err(Error::Cancelled);
        }
        Ok(())
    }
}

/// Accumulates transferred bytes and renders them into operation
/// metadata as `"<bytes> (<rate>/s)"`. Metadata is only rewritten when
/// the rendered string changes, which keeps update frequency low.
pub struct ProgressTracker<'a> {
    op: &'a Operation,
    key: String,
    description: String,
    transferred: i64,
    started: Instant,
    last_rendered: String,
}

impl<'a> ProgressTracker<'a> {
    pub fn new(op: &'a Operation, key: &str, description: &str) -> Self {
        Self {
            op,
            key: key.to_string(),
            description: description.to_string(),
            transferred: 0,
            started: Instant::now(),
            last_rendered: String::new(),
        }
    }

    pub fn add(&mut self, bytes: usize) {
        self.transferred += bytes as i64;
        self.render();
    }

    pub fn transferred(&self) -> i64 {
        self.transferred
    }

    fn render(&mut self) {
        let elapsed = self.started.elapsed().as_secs().max(1) as i64;
        let speed = self.transferred / elapsed;
        let mut progress = format!(
            "{} ({}/s)",
            byte_size_string(self.transferred, 2),
            byte_size_string(speed, 2)
        );
        if !self.description.is_empty() {
            progress = format!("{}: {progress}", self.description);
        }
        if progress != self.last_rendered {
            self.op.set_metadata(&self.key, progress.clone());
            self.last_rendered = progress;
        }
    }
}

/// A reader that feeds a [`ProgressTracker`] as data flows through it.
pub struct ProgressReader<'a, R> {
    inner: R,
    tracker: ProgressTracker<'a>,
}

impl<'a, R: Read> ProgressReader<'a, R> {
    pub fn new(inner: R, tracker: ProgressTracker<'a>) -> Self {
        Self { inner, tracker }
    }
}

impl<R: Read> Read for ProgressReader<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.tracker.add(n);
        Ok(n)
    }
}

/// A writer that feeds a [`ProgressTracker`] as data flows through it.
pub struct ProgressWriter<'a, W> {
    inner: W,
    tracker: ProgressTracker<'a>,
}

impl<'a, W: Write> ProgressWriter<'a, W> {
    pub fn new(inner: W, tracker: ProgressTracker<'a>) -> Self {
        Self { inner, tracker }
    }
}

impl<W: Write> Write for ProgressWriter<'_, W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.tracker.add(n);
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancellation_is_sticky() {
        let op = Operation::new();
        op.check_cancelled().unwrap();
        op.cancel();
        assert!(op.cancelled());
        assert!(matches!(op.check_cancelled(), Err(Error::Cancelled)));
    }

    #[test]
    fn metadata_merges() {
        let op = Operation::new();
        op.set_metadata("stage", "copying".to_string());
        op.update_metadata([("volume".to_string(), "v1".to_string())]);
        let meta = op.metadata();
        assert_eq!(meta.get("stage").map(String::as_str), Some("copying"));
        assert_eq!(meta.get("volume").map(String::as_str), Some("v1"));
    }

    #[test]
    fn tracker_records_progress_metadata() {
        let op = Operation::new();
        let mut tracker = ProgressTracker::new(&op, "fs_progress", "");
        tracker.add(2_000_000);
        let meta = op.metadata();
        let progress = meta.get("fs_progress").unwrap();
        assert!(progress.starts_with("2.00MB"), "got {progress}");
        assert!(progress.contains("/s)"));
    }

    #[test]
    fn reader_counts_bytes() {
        let op = Operation::new();
        let data = vec![7u8; 4096];
        let mut reader = ProgressReader::new(
            data.as_slice(),
            ProgressTracker::new(&op, "fs_progress", "volume v1"),
        );
        let mut sink = Vec::new();
        std::io::copy(&mut reader, &mut sink).unwrap();
        assert_eq!(sink.len(), 4096);
        assert_eq!(reader.tracker.transferred(), 4096);
        assert!(op.metadata().get("fs_progress").unwrap().contains("volume v1"));
    }
}
