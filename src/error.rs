//! Crate-wide error taxonomy (spec §7: Input / Transient network / Permanent
//! network / Crypto / Disk / Merge / Schedule).

use thiserror::Error;

/// Coarse error kind used by retry policy and event payloads. Distinct from
/// the concrete `thiserror` types below: this is what gets serialized into
/// `task.failed(reason)` events and task snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum ErrorKind {
    Input,
    TransientNetwork,
    PermanentNetwork,
    Crypto,
    Disk,
    Merge,
    Schedule,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::Input => "input",
            ErrorKind::TransientNetwork => "transient-network-exhausted",
            ErrorKind::PermanentNetwork => "permanent-network",
            ErrorKind::Crypto => "crypto",
            ErrorKind::Disk => "disk",
            ErrorKind::Merge => "merge",
            ErrorKind::Schedule => "schedule",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error)]
pub enum PlaylistError {
    #[error("missing #EXTM3U header")]
    NotAPlaylist,
    #[error("invalid URI in playlist: {0}")]
    InvalidUri(String),
    #[error("invalid IV attribute: {0}")]
    InvalidIv(String),
    #[error("unsupported encryption method: {0}")]
    UnsupportedMethod(String),
}

#[derive(Debug, Error)]
pub enum AnalyzerError {
    #[error("invalid URL: {0}")]
    InvalidUrl(String),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error(transparent)]
    Playlist(#[from] PlaylistError),
    #[error("no playable media found, tried: {tried:?}")]
    NoMediaFound { tried: Vec<String> },
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("retryable: {0}")]
    Retryable(String),
    #[error("terminal ({kind}): {reason}")]
    Terminal { kind: ErrorKind, reason: String },
}

#[derive(Debug, Error)]
pub enum TaskError {
    #[error("task is already in a terminal state")]
    AlreadyTerminal,
    #[error("no task with id {0}")]
    NotFound(String),
}

#[derive(Debug, Error)]
pub enum MergeError {
    #[error("segment count mismatch: plan={plan} on_disk={on_disk}")]
    SegmentCountMismatch { plan: usize, on_disk: usize },
    #[error("binary concatenation failed: {0}")]
    ConcatFailed(String),
    #[error("transcoder invocation failed: {0}")]
    TranscoderFailed(String),
}

#[derive(Debug, Error)]
pub enum VidtaniumError {
    #[error(transparent)]
    Playlist(#[from] PlaylistError),
    #[error(transparent)]
    Analyzer(#[from] AnalyzerError),
    #[error(transparent)]
    Task(#[from] TaskError),
    #[error(transparent)]
    Merge(#[from] MergeError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T, E = VidtaniumError> = std::result::Result<T, E>;
