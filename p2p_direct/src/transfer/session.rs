//! Per-session bookkeeping shared by the sender and receiver engines.

use crate::error::FailureKind;
use crate::events::ProgressUpdate;
use crate::{Direction, FileStatus, FileTransferState, TransferManifest};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

/// Final report of a session, carried by the terminal `Complete` event.
#[derive(Debug, Clone)]
pub struct SessionSummary {
    pub session_id: String,
    pub direction: Direction,
    pub manifest: TransferManifest,
    pub files: Vec<FileTransferState>,
    /// Files removed from tracking by cancellation
    pub cancelled: Vec<u32>,
    pub bytes_moved: u64,
    pub elapsed: Duration,
}

impl SessionSummary {
    pub fn file(&self, id: u32) -> Option<&FileTransferState> {
        self.files.iter().find(|f| f.file_id == id)
    }
}

/// Compute progress, speed and ETA from raw counters.
///
/// Returns `(progress, speed_bps, eta_secs)`.
pub fn compute_progress(bytes_moved: u64, total_bytes: u64, elapsed_secs: f64) -> (f64, f64, f64) {
    let progress = if total_bytes == 0 {
        1.0
    } else {
        bytes_moved as f64 / total_bytes as f64
    };
    let speed = if elapsed_secs > 0.0 {
        bytes_moved as f64 / elapsed_secs
    } else {
        0.0
    };
    let eta = if speed > 0.0 {
        total_bytes.saturating_sub(bytes_moved) as f64 / speed
    } else {
        0.0
    };
    (progress, speed, eta)
}

/// Manifest plus one state per file, owned by a single engine.
#[derive(Debug)]
pub struct TransferSession {
    direction: Direction,
    manifest: TransferManifest,
    files: BTreeMap<u32, FileTransferState>,
    cancelled: Vec<u32>,
    started_at: Instant,
    bytes_moved: u64,
}

impl TransferSession {
    pub fn new(manifest: TransferManifest, direction: Direction) -> Self {
        let files = manifest
            .files
            .iter()
            .map(|f| (f.id, FileTransferState::new(f.id, f.size)))
            .collect();
        Self {
            direction,
            manifest,
            files,
            cancelled: Vec::new(),
            started_at: Instant::now(),
            bytes_moved: 0,
        }
    }

    pub fn id(&self) -> &str {
        &self.manifest.session_id
    }

    pub fn manifest(&self) -> &TransferManifest {
        &self.manifest
    }

    pub fn state(&self, file_id: u32) -> Option<&FileTransferState> {
        self.files.get(&file_id)
    }

    pub fn state_mut(&mut self, file_id: u32) -> Option<&mut FileTransferState> {
        self.files.get_mut(&file_id)
    }

    /// Drop a cancelled file from active tracking
    pub fn remove(&mut self, file_id: u32) -> Option<FileTransferState> {
        let state = self.files.remove(&file_id)?;
        self.cancelled.push(file_id);
        Some(state)
    }

    pub fn is_cancelled(&self, file_id: u32) -> bool {
        self.cancelled.contains(&file_id)
    }

    pub fn bytes_moved(&self) -> u64 {
        self.bytes_moved
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Aggregate throughput across the session in bytes per second
    pub fn speed_bps(&self) -> f64 {
        compute_progress(self.bytes_moved, self.manifest.total_size, self.elapsed().as_secs_f64()).1
    }

    pub fn eta_secs(&self) -> f64 {
        compute_progress(self.bytes_moved, self.manifest.total_size, self.elapsed().as_secs_f64()).2
    }

    /// Account `len` more bytes for a file and build the matching progress update.
    pub fn record_progress(&mut self, file_id: u32, len: u64) -> Option<ProgressUpdate> {
        let state = self.files.get_mut(&file_id)?;
        state.bytes_moved += len;
        self.bytes_moved += len;

        let elapsed = state
            .started_at
            .map_or(0.0, |started| started.elapsed().as_secs_f64());
        let (progress, speed_bps, eta_secs) =
            compute_progress(state.bytes_moved, state.total_bytes, elapsed);

        Some(ProgressUpdate {
            direction: self.direction,
            file_id,
            bytes_moved: state.bytes_moved,
            total_bytes: state.total_bytes,
            progress,
            speed_bps,
            eta_secs,
            session_bytes_moved: self.bytes_moved,
        })
    }

    /// True once no file is pending or active
    pub fn all_settled(&self) -> bool {
        self.files.values().all(FileTransferState::is_settled)
    }

    /// Files that have neither completed nor failed
    pub fn unsettled(&self) -> Vec<u32> {
        self.files
            .values()
            .filter(|f| !f.is_settled())
            .map(|f| f.file_id)
            .collect()
    }

    /// Mark every pending or active file failed, e.g. when the transport drops
    pub fn fail_in_flight(&mut self, kind: FailureKind) {
        for state in self.files.values_mut() {
            if matches!(state.status, FileStatus::Pending | FileStatus::Active) {
                state.fail(kind);
            }
        }
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            session_id: self.manifest.session_id.clone(),
            direction: self.direction,
            manifest: self.manifest.clone(),
            files: self.files.values().cloned().collect(),
            cancelled: self.cancelled.clone(),
            bytes_moved: self.bytes_moved,
            elapsed: self.elapsed(),
        }
    }
}
