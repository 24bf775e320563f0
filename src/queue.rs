//! Replay queue materialization
//!
//! Converts ordered replay-file lists into the persisted JSON queue document
//! consumed by the playback engine.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// File extensions the playback engine can replay
pub const REPLAY_EXTENSIONS: &[&str] = &["slp"];

/// Queue-level playback options, flattened into the descriptor document
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueOptions {
    /// Restart the queue from the top once the last entry finishes
    #[serde(default)]
    pub looping: bool,

    /// Play entries in random order
    #[serde(default)]
    pub shuffle: bool,
}

/// A single entry in the queue document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub path: PathBuf,
}

/// The persisted queue document handed to the playback engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueDescriptor {
    #[serde(flatten)]
    pub options: QueueOptions,

    pub queue: Vec<QueueEntry>,
}

impl QueueDescriptor {
    /// Serialize to the two-space-indented JSON document format
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Parse a previously persisted queue document
    pub fn from_json(data: &str) -> Result<Self> {
        Ok(serde_json::from_str(data)?)
    }
}

/// A queue document written to disk, ready for hand-off to the playback
/// engine. The engine owns the artifact once loaded; nothing here deletes it.
#[derive(Debug, Clone)]
pub struct MaterializedQueue {
    pub path: PathBuf,
    pub descriptor: QueueDescriptor,
}

fn is_replay_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| REPLAY_EXTENSIONS.iter().any(|known| ext.eq_ignore_ascii_case(known)))
        .unwrap_or(false)
}

fn build_descriptor(files: &[PathBuf], options: QueueOptions) -> Option<QueueDescriptor> {
    let queue: Vec<QueueEntry> = files
        .iter()
        .filter(|path| is_replay_file(path))
        .map(|path| QueueEntry { path: path.clone() })
        .collect();

    if queue.is_empty() {
        return None;
    }

    Some(QueueDescriptor { options, queue })
}

fn unique_queue_filename() -> String {
    // Millisecond timestamps keep concurrent materializations from colliding
    // on the same artifact name.
    format!("replaycast-queue-{}.json", chrono::Utc::now().timestamp_millis())
}

/// Materialize an ad hoc file list into a temp queue artifact.
///
/// Files without a recognized replay extension are dropped. Returns `None`
/// without writing anything when nothing playable remains.
pub fn materialize(files: &[PathBuf], options: QueueOptions) -> Result<Option<MaterializedQueue>> {
    materialize_in(&std::env::temp_dir(), files, options)
}

fn materialize_in(
    dir: &Path,
    files: &[PathBuf],
    options: QueueOptions,
) -> Result<Option<MaterializedQueue>> {
    let Some(descriptor) = build_descriptor(files, options) else {
        debug!("no replay files after filtering, nothing to materialize");
        return Ok(None);
    };

    let path = dir.join(unique_queue_filename());
    std::fs::write(&path, descriptor.to_json()?)
        .with_context(|| format!("Failed to write queue file: {:?}", path))?;

    debug!("materialized {} entries to {:?}", descriptor.queue.len(), path);
    Ok(Some(MaterializedQueue { path, descriptor }))
}

/// The process-wide pending queue.
///
/// Constructed once at startup and passed by reference to whatever needs it.
#[derive(Debug, Default)]
pub struct PendingQueue {
    files: Vec<PathBuf>,
    options: QueueOptions,
}

impl PendingQueue {
    pub fn new(options: QueueOptions) -> Self {
        Self {
            files: Vec::new(),
            options,
        }
    }

    /// Append files to the pending queue, preserving order
    pub fn extend(&mut self, files: impl IntoIterator<Item = PathBuf>) {
        self.files.extend(files);
    }

    /// Materialize the pending queue for a playback load
    pub fn materialize(&self) -> Result<Option<MaterializedQueue>> {
        materialize(&self.files, self.options.clone())
    }

    /// Persist the pending queue to a caller-chosen permanent location.
    ///
    /// Export has no playback side effects. A queue that is empty after
    /// filtering writes nothing and returns `false`.
    pub fn export(&self, dest: &Path) -> Result<bool> {
        let Some(descriptor) = build_descriptor(&self.files, self.options.clone()) else {
            info!("pending queue holds no replay files, skipping export");
            return Ok(false);
        };

        std::fs::write(dest, descriptor.to_json()?)
            .with_context(|| format!("Failed to write queue export: {:?}", dest))?;

        info!("exported {} queue entries to {:?}", descriptor.queue.len(), dest);
        Ok(true)
    }
}
