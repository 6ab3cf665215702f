//! The running recognition service.
//!
//! `GestureService::start` wires the store, classifier, collector and
//! orchestrator together and spawns the frame worker. Landmark producers
//! call [`GestureService::submit_frame`]; consumers read recognitions and
//! lifecycle events from [`ServiceChannels`].

mod worker;

use std::{sync::Arc, thread};

use anyhow::{Context, Result, bail};
use crossbeam_channel::{Receiver, Sender, TrySendError, bounded, unbounded};
use parking_lot::Mutex;

use self::worker::{FrameProcessor, start_frame_worker};
use crate::{
    classifier::{BackendLoader, QuantizedClassifier},
    collector::{CollectionProgress, SampleCollector},
    config::EngineConfig,
    error::{CollectError, StartError},
    features::FeatureNormalizer,
    labels::LabelMap,
    store::{DEFAULT_MODEL_CODE, ModelStore},
    training::{TrainerApi, TrainingEvent, TrainingOrchestrator, TrainingState},
    types::{HandFrame, RecognitionResult},
};

const RESULT_BUFFER: usize = 4;

#[derive(Clone, Debug, PartialEq)]
pub enum CollectionEvent {
    /// Sent after every admitted sample.
    Progress(CollectionProgress),
    Complete {
        gesture: String,
    },
    /// The full batch could not be handed to the trainer.
    Rejected {
        gesture: String,
        reason: StartError,
    },
}

pub struct ServiceChannels {
    pub results: Receiver<RecognitionResult>,
    pub collection: Receiver<CollectionEvent>,
    pub training: Receiver<TrainingEvent>,
}

pub struct GestureService {
    processor: Arc<FrameProcessor>,
    store: Arc<ModelStore>,
    frame_tx: Option<Sender<HandFrame>>,
    worker: Option<thread::JoinHandle<()>>,
}

impl GestureService {
    /// Opens the model store, activates the persisted model and starts the
    /// frame worker.
    pub fn start(
        config: &EngineConfig,
        api: Arc<dyn TrainerApi>,
        loader: Arc<dyn BackendLoader>,
    ) -> Result<(Self, ServiceChannels)> {
        config.validate().context("invalid engine config")?;
        let store = Arc::new(
            ModelStore::open(
                &config.data_dir,
                &config.bundled_model,
                &config.bundled_label_map,
            )
            .with_context(|| format!("failed to open model store in {}", config.data_dir.display()))?,
        );

        let classifier = Arc::new(QuantizedClassifier::new(
            loader,
            config.confidence_threshold,
        ));
        activate_persisted_model(&store, &classifier)?;

        let (training_tx, training_rx) = unbounded();
        let orchestrator = TrainingOrchestrator::new(
            api,
            store.clone(),
            classifier.clone(),
            config.poll.clone(),
            config.collector.target_count,
            training_tx,
        );
        let collector = SampleCollector::new(config.collector.clone(), orchestrator.gate());

        let (collection_tx, collection_rx) = unbounded();
        let processor = Arc::new(FrameProcessor {
            normalizer: FeatureNormalizer::new(config.normalizer),
            classifier,
            collector: Mutex::new(collector),
            orchestrator,
            collection_tx,
            training_jobs: Mutex::new(Vec::new()),
        });

        let (frame_tx, frame_rx) = bounded(1);
        let (result_tx, result_rx) = bounded(RESULT_BUFFER);
        let worker = start_frame_worker(processor.clone(), frame_rx, result_tx);

        let service = Self {
            processor,
            store,
            frame_tx: Some(frame_tx),
            worker: Some(worker),
        };
        let channels = ServiceChannels {
            results: result_rx,
            collection: collection_rx,
            training: training_rx,
        };
        Ok((service, channels))
    }

    /// Starts the service with the HTTP trainer and the ONNX Runtime backend.
    #[cfg(feature = "backend-ort")]
    pub fn start_default(config: &EngineConfig) -> Result<(Self, ServiceChannels)> {
        let api = crate::training::HttpTrainerApi::new(&config.server_url, config.http_timeout)
            .context("failed to build trainer client")?;
        let loader = crate::classifier::ort::OrtLoader::new(config.inference_threads);
        Self::start(config, Arc::new(api), Arc::new(loader))
    }

    /// Hands a frame to the worker. Dropped (returns `false`) while the
    /// worker still has a frame queued.
    pub fn submit_frame(&self, frame: HandFrame) -> bool {
        let Some(frame_tx) = self.frame_tx.as_ref() else {
            return false;
        };
        match frame_tx.try_send(frame) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => false,
            Err(TrySendError::Disconnected(_)) => {
                log::warn!("frame worker is gone");
                false
            }
        }
    }

    /// Runs one frame on the calling thread, bypassing the worker queue.
    pub fn process_frame(&self, frame: &HandFrame) -> RecognitionResult {
        self.processor.process(frame)
    }

    pub fn start_collecting(&self, gesture: &str) -> Result<(), CollectError> {
        self.processor.collector.lock().start(gesture)
    }

    pub fn cancel_collecting(&self) {
        self.processor.collector.lock().cancel();
    }

    /// The app left the foreground: partial samples are worthless.
    pub fn on_background(&self) {
        self.cancel_collecting();
    }

    pub fn collection_progress(&self) -> Option<CollectionProgress> {
        self.processor.collector.lock().progress()
    }

    pub fn training_state(&self) -> TrainingState {
        self.processor.orchestrator.state()
    }

    pub fn stop_training(&self) -> bool {
        self.processor.orchestrator.stop_polling()
    }

    pub fn model_code(&self) -> Option<String> {
        self.processor.classifier.model_code()
    }

    pub fn labels(&self) -> Option<LabelMap> {
        self.processor.classifier.labels()
    }

    pub fn last_task_id(&self) -> Option<String> {
        self.store.last_task_id()
    }

    /// Forgets every trained gesture and goes back to the bundled model.
    pub fn reset_gestures(&self) -> Result<()> {
        if self.processor.orchestrator.is_busy() {
            bail!("cannot reset gestures while a training job is running");
        }
        self.cancel_collecting();

        let labels = self.store.bundled_label_map()?;
        let model = self
            .processor
            .classifier
            .prepare(self.store.bundled_model_path(), labels, DEFAULT_MODEL_CODE)
            .context("bundled model failed to load")?;
        self.store.reset()?;
        self.processor.classifier.reload(model);
        Ok(())
    }

    /// Stops the worker, abandons any training job and releases the model.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.processor.collector.lock().cancel();
        self.processor.orchestrator.stop_polling();

        self.frame_tx.take();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
        let jobs = std::mem::take(&mut *self.processor.training_jobs.lock());
        for job in jobs {
            let _ = job.join();
        }
        self.processor.classifier.close();
    }
}

impl Drop for GestureService {
    fn drop(&mut self) {
        if self.worker.is_some() {
            self.stop();
        }
    }
}

/// Loads the model the store says is active. A custom model that fails to
/// load is replaced by the bundled one; if that fails too the service runs
/// without recognition.
fn activate_persisted_model(store: &ModelStore, classifier: &QuantizedClassifier) -> Result<()> {
    let active = store.active_model();
    let labels = store.load_label_map().context("failed to load label map")?;

    match classifier.reload_from(&active.model_path, labels.clone(), &active.model_code) {
        Ok(()) => return Ok(()),
        Err(err) => log::error!("failed to activate model {}: {err:?}", active.model_code),
    }
    if !active.is_custom {
        log::error!("no usable gesture model; recognition is disabled");
        return Ok(());
    }

    if let Err(err) = classifier.reload_from(store.bundled_model_path(), labels, DEFAULT_MODEL_CODE)
    {
        log::error!("bundled gesture model failed to load: {err:?}; recognition is disabled");
    }
    Ok(())
}
