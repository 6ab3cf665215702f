use std::time::Duration;

use reqwest::blocking::{Client, Response};

use super::wire::{TaskStatus, TrainRequest, TrainResponse, decode_status};
use crate::{collector::SampleBatch, error::ApiError};

/// The remote trainer. Every call blocks the calling (training) thread.
pub trait TrainerApi: Send + Sync {
    /// Uploads a batch and returns the server-issued task id.
    fn submit(&self, model_code: &str, batch: &SampleBatch) -> Result<String, ApiError>;

    /// `Ok(None)` when the server answered with an empty body.
    fn poll_status(&self, task_id: &str) -> Result<Option<TaskStatus>, ApiError>;

    fn download(&self, model_url: &str) -> Result<Vec<u8>, ApiError>;
}

/// [`TrainerApi`] over HTTP/JSON.
pub struct HttpTrainerApi {
    base_url: String,
    client: Client,
}

impl HttpTrainerApi {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, ApiError> {
        let base_url = base_url.trim_end_matches('/').to_string();
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()
            .map_err(|source| ApiError::Transport {
                url: base_url.clone(),
                source,
            })?;
        Ok(Self { base_url, client })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Absolute model URLs are used as-is; relative ones hang off the base.
    fn resolve(&self, url: &str) -> String {
        if url.starts_with("http://") || url.starts_with("https://") {
            url.to_string()
        } else {
            format!("{}/{}", self.base_url, url.trim_start_matches('/'))
        }
    }
}

fn check_status(url: &str, response: Response) -> Result<Response, ApiError> {
    let status = response.status();
    if !status.is_success() {
        return Err(ApiError::Status {
            url: url.to_string(),
            status: status.as_u16(),
        });
    }
    Ok(response)
}

fn read_body(url: &str, response: Response) -> Result<Vec<u8>, ApiError> {
    check_status(url, response)?
        .bytes()
        .map(|bytes| bytes.to_vec())
        .map_err(|source| ApiError::Transport {
            url: url.to_string(),
            source,
        })
}

impl TrainerApi for HttpTrainerApi {
    fn submit(&self, model_code: &str, batch: &SampleBatch) -> Result<String, ApiError> {
        let url = format!("{}/train", self.base_url);
        let request = TrainRequest::new(model_code, batch);
        log::info!(
            "uploading {} samples of `{}` to {url}",
            batch.len(),
            batch.gesture
        );

        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .map_err(|source| ApiError::Transport {
                url: url.clone(),
                source,
            })?;
        let body = read_body(&url, response)?;
        let decoded: TrainResponse = serde_json::from_slice(&body)
            .map_err(|source| ApiError::Decode {
                url: url.clone(),
                source,
            })?;
        Ok(decoded.task_id)
    }

    fn poll_status(&self, task_id: &str) -> Result<Option<TaskStatus>, ApiError> {
        let url = format!("{}/status/{task_id}", self.base_url);
        let response = self
            .client
            .get(&url)
            .send()
            .map_err(|source| ApiError::Transport {
                url: url.clone(),
                source,
            })?;
        let body = read_body(&url, response)?;
        decode_status(&body).map_err(|source| ApiError::Decode { url, source })
    }

    fn download(&self, model_url: &str) -> Result<Vec<u8>, ApiError> {
        let url = self.resolve(model_url);
        log::info!("downloading model from {url}");
        let response = self
            .client
            .get(&url)
            .send()
            .map_err(|source| ApiError::Transport {
                url: url.clone(),
                source,
            })?;
        read_body(&url, response)
    }
}
