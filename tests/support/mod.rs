#![allow(dead_code)]

use std::{
    collections::VecDeque,
    fs,
    path::{Path, PathBuf},
    sync::atomic::{AtomicUsize, Ordering},
    time::Duration,
};

use anyhow::{Context, Result, bail};
use crossbeam_channel::Receiver;
use gesture_lifecycle::{
    BackendLoader, EngineConfig, HandFrame, Handedness, InferenceBackend, LandmarkSet,
    PollConfig, SampleBatch, TrainerApi, TrainingEvent,
    classifier::{QuantizationParameters, QuantizedTensor, QuantizedType},
    error::ApiError,
    training::TaskStatus,
    types::{FEATURE_LEN, LANDMARK_COUNT},
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

pub const BUNDLED_LABELS: &str =
    r#"{"none":0,"fist":1,"open_palm":2,"point":3,"victory":4,"thumbs_up":5}"#;

/// Contents of a model file understood by [`FakeLoader`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FakeModel {
    pub scores: Vec<u8>,
    pub output_len: Option<usize>,
}

impl FakeModel {
    /// A model that always answers `class` with high confidence.
    pub fn predicting(class: usize, classes: usize) -> Self {
        let mut scores = vec![5u8; classes];
        scores[class] = 240;
        Self {
            scores,
            output_len: Some(classes),
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap()
    }
}

struct FakeBackend {
    model: FakeModel,
}

impl InferenceBackend for FakeBackend {
    fn input_quantization(&self) -> QuantizationParameters {
        QuantizationParameters::new(1.0 / 128.0, 128)
    }

    fn output_quantization(&self) -> QuantizationParameters {
        QuantizationParameters::new(1.0 / 255.0, 0)
    }

    fn input_type(&self) -> QuantizedType {
        QuantizedType::Unsigned
    }

    fn input_len(&self) -> Option<usize> {
        Some(FEATURE_LEN)
    }

    fn output_len(&self) -> Option<usize> {
        self.model.output_len
    }

    fn run(&mut self, input: &QuantizedTensor) -> Result<QuantizedTensor> {
        if input.len() != FEATURE_LEN {
            bail!("bad input width {}", input.len());
        }
        Ok(QuantizedTensor::from_u8(self.model.scores.clone()))
    }
}

/// Reads [`FakeModel`] JSON from the model path.
#[derive(Default)]
pub struct FakeLoader {
    pub loads: AtomicUsize,
}

impl BackendLoader for FakeLoader {
    fn load(&self, model_path: &Path) -> Result<Box<dyn InferenceBackend>> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        let bytes = fs::read(model_path)
            .with_context(|| format!("missing model {}", model_path.display()))?;
        let model: FakeModel = serde_json::from_slice(&bytes).context("not a model")?;
        Ok(Box::new(FakeBackend { model }))
    }
}

pub type Scripted<T> = Result<T, String>;

/// A trainer that replays canned answers. Once the status script runs out
/// every poll answers `PENDING`.
pub struct ScriptedTrainer {
    task_id: Scripted<String>,
    statuses: Mutex<VecDeque<Scripted<Option<TaskStatus>>>>,
    model: Scripted<Vec<u8>>,
    pub submissions: Mutex<Vec<(String, String, usize)>>,
    pub polls: AtomicUsize,
    pub downloads: Mutex<Vec<String>>,
    pub poll_delay: Duration,
}

impl ScriptedTrainer {
    pub fn new(task_id: &str) -> Self {
        Self {
            task_id: Ok(task_id.to_string()),
            statuses: Mutex::new(VecDeque::new()),
            model: Err("no model scripted".to_string()),
            submissions: Mutex::new(Vec::new()),
            polls: AtomicUsize::new(0),
            downloads: Mutex::new(Vec::new()),
            poll_delay: Duration::ZERO,
        }
    }

    pub fn failing_upload(reason: &str) -> Self {
        Self {
            task_id: Err(reason.to_string()),
            ..Self::new("unused")
        }
    }

    pub fn then(self, status: Scripted<Option<TaskStatus>>) -> Self {
        self.statuses.lock().push_back(status);
        self
    }

    pub fn progress(self, step: &str) -> Self {
        self.then(Ok(Some(TaskStatus::Progress {
            step: step.to_string(),
        })))
    }

    pub fn success(self, model_code: &str) -> Self {
        self.then(Ok(Some(TaskStatus::Success {
            model_url: format!("http://trainer/models/{model_code}.onnx"),
            model_code: model_code.to_string(),
        })))
    }

    pub fn serving(mut self, model: Scripted<Vec<u8>>) -> Self {
        self.model = model;
        self
    }

    pub fn with_poll_delay(mut self, delay: Duration) -> Self {
        self.poll_delay = delay;
        self
    }
}

impl TrainerApi for ScriptedTrainer {
    fn submit(&self, model_code: &str, batch: &SampleBatch) -> Result<String, ApiError> {
        self.submissions.lock().push((
            model_code.to_string(),
            batch.gesture.clone(),
            batch.len(),
        ));
        self.task_id.clone().map_err(ApiError::Other)
    }

    fn poll_status(&self, _task_id: &str) -> Result<Option<TaskStatus>, ApiError> {
        self.polls.fetch_add(1, Ordering::SeqCst);
        if !self.poll_delay.is_zero() {
            std::thread::sleep(self.poll_delay);
        }
        match self.statuses.lock().pop_front() {
            Some(status) => status.map_err(ApiError::Other),
            None => Ok(Some(TaskStatus::Pending)),
        }
    }

    fn download(&self, model_url: &str) -> Result<Vec<u8>, ApiError> {
        self.downloads.lock().push(model_url.to_string());
        self.model.clone().map_err(ApiError::Other)
    }
}

/// Scratch data and asset directories with a bundled model predicting
/// `fist`.
pub struct Workspace {
    pub dir: tempfile::TempDir,
}

impl Workspace {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let assets = dir.path().join("assets");
        fs::create_dir_all(&assets).unwrap();
        fs::write(
            assets.join("basic_gesture_model.onnx"),
            FakeModel::predicting(1, 6).to_bytes(),
        )
        .unwrap();
        fs::write(assets.join("basic_label_map.json"), BUNDLED_LABELS).unwrap();
        Self { dir }
    }

    pub fn assets(&self) -> PathBuf {
        self.dir.path().join("assets")
    }

    pub fn data(&self) -> PathBuf {
        self.dir.path().join("data")
    }

    pub fn models(&self) -> Vec<PathBuf> {
        match fs::read_dir(self.data().join("models")) {
            Ok(entries) => entries.flatten().map(|entry| entry.path()).collect(),
            Err(_) => Vec::new(),
        }
    }

    pub fn config(&self) -> EngineConfig {
        let mut config = EngineConfig {
            data_dir: self.data(),
            bundled_model: self.assets().join("basic_gesture_model.onnx"),
            bundled_label_map: self.assets().join("basic_label_map.json"),
            poll: fast_poll(Duration::from_secs(5)),
            ..EngineConfig::default()
        };
        config.collector.target_count = 100;
        config
    }
}

pub fn fast_poll(timeout: Duration) -> PollConfig {
    PollConfig {
        interval: Duration::from_millis(10),
        timeout,
        max_misses: 3,
    }
}

/// A plausible open hand: wrist at the bottom, fingers fanning upward.
pub fn hand(confidence: f32) -> HandFrame {
    let points = (0..LANDMARK_COUNT)
        .map(|i| {
            let finger = i.saturating_sub(1) / 4;
            let joint = (i.saturating_sub(1) % 4) as f32;
            if i == 0 {
                [0.5, 0.9, 0.0]
            } else {
                [
                    0.3 + finger as f32 * 0.1,
                    0.75 - joint * 0.08,
                    -0.01 * joint,
                ]
            }
        })
        .collect();
    HandFrame::new(Some(LandmarkSet::new(
        points,
        Handedness::Right,
        confidence,
    )))
}

/// Collects events until a terminal one arrives.
pub fn events_until_terminal(rx: &Receiver<TrainingEvent>) -> Vec<TrainingEvent> {
    let mut events = Vec::new();
    loop {
        let event = rx
            .recv_timeout(Duration::from_secs(10))
            .expect("training job never finished");
        let terminal = event.is_terminal();
        events.push(event);
        if terminal {
            return events;
        }
    }
}
