use std::{io, path::PathBuf, time::Duration};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to read {}: {source}", .path.display())]
    Read { path: PathBuf, source: io::Error },
    #[error("failed to write {}: {source}", .path.display())]
    Write { path: PathBuf, source: io::Error },
    #[error("malformed {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("failed to encode {}: {source}", .path.display())]
    Encode {
        path: PathBuf,
        source: serde_json::Error,
    },
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("label map assigns index {index} to both `{first}` and `{second}`")]
pub struct DuplicateIndex {
    pub index: usize,
    pub first: String,
    pub second: String,
}

/// Transport-level failures talking to the remote trainer.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("request to {url} failed: {source}")]
    Transport { url: String, source: reqwest::Error },
    #[error("{url} answered with HTTP {status}")]
    Status { url: String, status: u16 },
    #[error("could not decode response from {url}: {source}")]
    Decode {
        url: String,
        source: serde_json::Error,
    },
    /// Used by non-HTTP trainer implementations.
    #[error("{0}")]
    Other(String),
}

/// Why a training job ended without installing a model. Rendered to the
/// user verbatim, so the messages stay short.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum TrainingError {
    #[error("upload failed: {0}")]
    Upload(String),
    #[error("training failed on server: {0}")]
    Server(String),
    #[error("no server response")]
    NoServerResponse,
    #[error("training timed out after {}s", .0.as_secs())]
    Timeout(Duration),
    #[error("model download failed: {0}")]
    Download(String),
    #[error("model could not be saved: {0}")]
    Storage(String),
    #[error("downloaded model was rejected: {0}")]
    ModelRejected(String),
    #[error("polling stopped")]
    Cancelled,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum StartError {
    #[error("a training job is already in progress")]
    Busy,
    #[error("sample batch for `{gesture}` has {actual} samples, expected {expected}")]
    IncompleteBatch {
        gesture: String,
        actual: usize,
        expected: usize,
    },
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum CollectError {
    #[error("cannot collect samples while a training job is in progress")]
    TrainingInProgress,
    #[error("gesture name must not be empty")]
    EmptyGestureName,
}
