//! Core data model (spec §3): Segment, EncryptionSpec, Plan, Progress,
//! TaskStatus, ScheduledTrigger.

use crate::error::ErrorKind;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Instant;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SegmentState {
    Pending,
    InFlight,
    Done,
    Failed(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Segment {
    pub index: usize,
    pub uri: String,
    pub byte_range: Option<(u64, u64)>,
    pub state: SegmentState,
    pub attempt: u32,
    pub size: Option<u64>,
    #[serde(skip)]
    pub staging_path: Option<PathBuf>,
}

impl Segment {
    pub fn new(index: usize, uri: String) -> Self {
        Segment {
            index,
            uri,
            byte_range: None,
            state: SegmentState::Pending,
            attempt: 0,
            size: None,
            staging_path: None,
        }
    }

    pub fn is_done(&self) -> bool {
        matches!(self.state, SegmentState::Done)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EncryptionMethod {
    None,
    Aes128Cbc,
}

/// §3 invariant: key fetched exactly once per distinct key URI per task —
/// enforced by `Task`'s per-task key cache (`task::KeyCache`), not by this
/// type itself.
#[derive(Debug, Clone)]
pub struct EncryptionSpec {
    pub method: EncryptionMethod,
    pub key_uri: Option<String>,
    pub explicit_iv: Option<[u8; 16]>,
}

impl EncryptionSpec {
    pub fn none() -> Self {
        EncryptionSpec {
            method: EncryptionMethod::None,
            key_uri: None,
            explicit_iv: None,
        }
    }

    pub fn iv_for(&self, segment_index: usize, sequence_base: u64) -> [u8; 16] {
        self.explicit_iv
            .unwrap_or_else(|| crate::cipher::derive_iv(sequence_base + segment_index as u64))
    }
}

#[derive(Debug, Clone)]
pub struct Plan {
    pub display_name: String,
    pub segments: Vec<Segment>,
    pub encryption: EncryptionSpec,
    pub total_duration_secs: Option<f64>,
    pub is_live: bool,
    pub output_path: PathBuf,
    pub sequence_base: u64,
}

/// Derived, not stored: computed from segment states plus a speed EWMA
/// carried by the owning `Task`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Progress {
    pub completed_segments: usize,
    pub total_segments: usize,
    pub downloaded_bytes: u64,
    pub total_bytes_estimate: Option<u64>,
    pub speed_bps_ewma: f64,
    pub eta_seconds: Option<f64>,
}

impl Progress {
    pub fn percent(&self) -> f64 {
        if self.total_segments == 0 {
            100.0
        } else {
            100.0 * self.completed_segments as f64 / self.total_segments as f64
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskStatus {
    Created,
    Queued,
    Running,
    Paused,
    Completed,
    Failed,
    Canceled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Canceled
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PriorityClass {
    High,
    Normal,
    Low,
}

impl Default for PriorityClass {
    fn default() -> Self {
        PriorityClass::Normal
    }
}

#[derive(Debug, Clone)]
pub struct TaskSnapshot {
    pub task_id: String,
    pub display_name: String,
    pub status: TaskStatus,
    pub progress: Progress,
    pub failure_reason: Option<(usize, ErrorKind, String)>,
}

/// Wall-clock marker used only for EWMA sampling; never serialized (spec §9:
/// all `now()` reads for the *scheduler* go through an injectable clock —
/// task-local speed sampling is allowed to use a monotonic `Instant`
/// directly since it never needs to be mocked for determinism).
#[derive(Debug, Clone, Copy)]
pub struct Sample {
    pub at: Instant,
    pub bytes: u64,
}
