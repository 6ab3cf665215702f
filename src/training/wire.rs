//! JSON bodies exchanged with the training server.

use serde::{Deserialize, Serialize};

use crate::collector::SampleBatch;

/// Step text shown for a `PROGRESS` status that carries none.
pub const DEFAULT_PROGRESS_STEP: &str = "training in progress";
/// Step text surfaced while the server has not picked the job up yet.
pub const PENDING_STEP: &str = "waiting for trainer";

#[derive(Debug, Serialize)]
pub struct TrainRequest<'a> {
    pub model_code: &'a str,
    pub gesture: &'a str,
    pub landmarks: Vec<Vec<f32>>,
}

impl<'a> TrainRequest<'a> {
    pub fn new(model_code: &'a str, batch: &'a SampleBatch) -> Self {
        Self {
            model_code,
            gesture: &batch.gesture,
            landmarks: batch.samples.iter().map(|sample| sample.to_vec()).collect(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct TrainResponse {
    pub task_id: String,
}

#[derive(Debug, Default, Deserialize)]
struct ResultPayload {
    tflite_url: Option<String>,
    model_code: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ProgressPayload {
    current_step: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StatusResponse {
    #[serde(default)]
    status: String,
    #[serde(default)]
    result: Option<ResultPayload>,
    #[serde(default)]
    error_info: Option<String>,
    #[serde(default)]
    progress: Option<ProgressPayload>,
}

/// A decoded `GET /status/{task_id}` answer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TaskStatus {
    Pending,
    Progress { step: String },
    Success { model_url: String, model_code: String },
    Failure { reason: String },
}

impl StatusResponse {
    fn into_status(self) -> TaskStatus {
        match self.status.as_str() {
            "PENDING" => TaskStatus::Pending,
            "PROGRESS" => TaskStatus::Progress {
                step: self
                    .progress
                    .and_then(|progress| progress.current_step)
                    .filter(|step| !step.trim().is_empty())
                    .unwrap_or_else(|| DEFAULT_PROGRESS_STEP.to_string()),
            },
            "SUCCESS" => {
                let result = self.result.unwrap_or_default();
                match (non_empty(result.tflite_url), non_empty(result.model_code)) {
                    (Some(model_url), Some(model_code)) => TaskStatus::Success {
                        model_url,
                        model_code,
                    },
                    _ => TaskStatus::Failure {
                        reason: "server reported success without a model".to_string(),
                    },
                }
            }
            other => TaskStatus::Failure {
                reason: non_empty(self.error_info).unwrap_or_else(|| {
                    if other.is_empty() {
                        "unknown error".to_string()
                    } else {
                        format!("unknown error (status {other})")
                    }
                }),
            },
        }
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|value| !value.trim().is_empty())
}

/// Decodes a status body. An empty body means the server had nothing to
/// say and yields `Ok(None)`.
pub fn decode_status(body: &[u8]) -> Result<Option<TaskStatus>, serde_json::Error> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(None);
    }
    let response: StatusResponse = serde_json::from_slice(body)?;
    Ok(Some(response.into_status()))
}
