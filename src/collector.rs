//! Accumulates training samples for one new gesture.

use serde::{Deserialize, Serialize};

use crate::{error::CollectError, training::JobGate, types::FeatureVector};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectorConfig {
    /// Samples per uploaded batch.
    pub target_count: usize,
    /// Frames whose hand confidence is below this are dropped.
    pub admission_threshold: f32,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            target_count: 100,
            admission_threshold: 0.5,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CollectionProgress {
    pub gesture: String,
    pub count: usize,
    pub target: usize,
}

impl CollectionProgress {
    pub fn percent(&self) -> u8 {
        if self.target == 0 {
            return 100;
        }
        ((self.count.min(self.target) * 100) / self.target) as u8
    }

    pub fn is_complete(&self) -> bool {
        self.count >= self.target
    }
}

/// A full set of samples for one gesture, ready to upload.
#[derive(Clone, Debug, PartialEq)]
pub struct SampleBatch {
    pub gesture: String,
    pub samples: Vec<FeatureVector>,
}

impl SampleBatch {
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

struct Collection {
    gesture: String,
    samples: Vec<FeatureVector>,
}

pub struct SampleCollector {
    config: CollectorConfig,
    gate: JobGate,
    current: Option<Collection>,
}

impl SampleCollector {
    pub fn new(config: CollectorConfig, gate: JobGate) -> Self {
        Self {
            config,
            gate,
            current: None,
        }
    }

    pub fn config(&self) -> &CollectorConfig {
        &self.config
    }

    /// Begins collecting samples for `gesture`. Any partial collection is
    /// discarded. Refused while a training job is in flight.
    pub fn start(&mut self, gesture: &str) -> Result<(), CollectError> {
        let gesture = gesture.trim();
        if gesture.is_empty() {
            return Err(CollectError::EmptyGestureName);
        }
        if self.gate.is_busy() {
            log::warn!("refusing to collect `{gesture}` while a training job is running");
            return Err(CollectError::TrainingInProgress);
        }
        if let Some(previous) = self.current.take() {
            log::info!(
                "restarting collection: dropped {} samples of `{}`",
                previous.samples.len(),
                previous.gesture
            );
        }

        log::info!(
            "collecting {} samples for `{gesture}`",
            self.config.target_count
        );
        self.current = Some(Collection {
            gesture: gesture.to_string(),
            samples: Vec::with_capacity(self.config.target_count),
        });
        Ok(())
    }

    /// Offers one frame's features. Returns whether the sample was kept.
    pub fn offer(&mut self, features: &FeatureVector, confidence: f32) -> bool {
        let target = self.config.target_count;
        let Some(collection) = self.current.as_mut() else {
            return false;
        };
        if collection.samples.len() >= target {
            return false;
        }
        if confidence.is_nan() || confidence < self.config.admission_threshold {
            log::debug!("dropped sample with confidence {confidence:.2}");
            return false;
        }

        collection.samples.push(*features);
        if collection.samples.len() == target {
            log::info!("collected {target} samples for `{}`", collection.gesture);
        }
        true
    }

    pub fn is_collecting(&self) -> bool {
        self.current.is_some()
    }

    pub fn is_complete(&self) -> bool {
        self.current
            .as_ref()
            .is_some_and(|collection| collection.samples.len() >= self.config.target_count)
    }

    pub fn progress(&self) -> Option<CollectionProgress> {
        self.current.as_ref().map(|collection| CollectionProgress {
            gesture: collection.gesture.clone(),
            count: collection.samples.len(),
            target: self.config.target_count,
        })
    }

    /// Takes the finished batch. Returns `None` until the target is reached.
    pub fn drain(&mut self) -> Option<SampleBatch> {
        if !self.is_complete() {
            return None;
        }
        self.current.take().map(|collection| SampleBatch {
            gesture: collection.gesture,
            samples: collection.samples,
        })
    }

    /// Drops the partial batch, if any.
    pub fn cancel(&mut self) {
        if let Some(collection) = self.current.take() {
            log::info!(
                "cancelled collection of `{}` at {} samples",
                collection.gesture,
                collection.samples.len()
            );
        }
    }
}
