//! On-device gesture classification with a remote-training model lifecycle.
//!
//! Hand landmarks go through [`features::FeatureNormalizer`] into the
//! [`classifier::QuantizedClassifier`]. While a new gesture is being
//! recorded the same features feed a [`collector::SampleCollector`]; a full
//! batch is handed to the [`training::TrainingOrchestrator`], which trains
//! remotely and hot-swaps the result into the classifier. The
//! [`pipeline::GestureService`] ties these together behind one worker thread.

pub mod classifier;
pub mod collector;
pub mod config;
pub mod error;
pub mod features;
pub mod labels;
pub mod pipeline;
pub mod store;
pub mod training;
pub mod types;

pub use classifier::{BackendLoader, InferenceBackend, LoadedModel, QuantizedClassifier};
pub use collector::{CollectorConfig, SampleBatch, SampleCollector};
pub use config::EngineConfig;
pub use features::{FeatureNormalizer, HandednessFeature, NormalizerConfig};
pub use labels::LabelMap;
pub use pipeline::{CollectionEvent, GestureService, ServiceChannels};
pub use store::ModelStore;
pub use training::{PollConfig, TrainerApi, TrainingEvent, TrainingOrchestrator, TrainingState};
pub use types::{Classification, HandFrame, Handedness, LandmarkSet, RecognitionResult};
