use std::{sync::Arc, thread, time::Instant};

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;

use super::CollectionEvent;
use crate::{
    classifier::QuantizedClassifier,
    collector::SampleCollector,
    features::FeatureNormalizer,
    training::TrainingOrchestrator,
    types::{FeatureVector, HandFrame, RecognitionResult},
};

/// Everything one frame touches: recognition always, collection when a
/// gesture is being recorded.
pub(crate) struct FrameProcessor {
    pub(crate) normalizer: FeatureNormalizer,
    pub(crate) classifier: Arc<QuantizedClassifier>,
    pub(crate) collector: Mutex<SampleCollector>,
    pub(crate) orchestrator: TrainingOrchestrator,
    pub(crate) collection_tx: Sender<CollectionEvent>,
    pub(crate) training_jobs: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl FrameProcessor {
    pub(crate) fn process(&self, frame: &HandFrame) -> RecognitionResult {
        let Some(hand) = frame.hand.as_ref() else {
            return RecognitionResult {
                classification: None,
                hand_detected: false,
                timestamp: frame.timestamp,
            };
        };
        if !hand.is_complete() {
            log::debug!("skipping hand with {} landmarks", hand.points.len());
            return RecognitionResult {
                classification: None,
                hand_detected: true,
                timestamp: frame.timestamp,
            };
        }

        let features = self.normalizer.normalize(hand);
        let classification = self.classifier.classify(&features);
        self.collect(&features, hand.confidence);

        RecognitionResult {
            classification,
            hand_detected: true,
            timestamp: frame.timestamp,
        }
    }

    fn collect(&self, features: &FeatureVector, confidence: f32) {
        let mut collector = self.collector.lock();
        if !collector.offer(features, confidence) {
            return;
        }
        if let Some(progress) = collector.progress() {
            let _ = self
                .collection_tx
                .send(CollectionEvent::Progress(progress));
        }
        let Some(batch) = collector.drain() else {
            return;
        };

        // The job gate is taken before the collector lock is released, so
        // `start_collecting` never sees an idle gate between the two.
        let gesture = batch.gesture.clone();
        let _ = self.collection_tx.send(CollectionEvent::Complete {
            gesture: gesture.clone(),
        });
        let started = self.orchestrator.start(batch);
        drop(collector);

        match started {
            Ok(handle) => {
                let mut jobs = self.training_jobs.lock();
                jobs.retain(|job| !job.is_finished());
                jobs.push(handle);
            }
            Err(err) => {
                log::error!("could not start training for `{gesture}`: {err}");
                let _ = self.collection_tx.send(CollectionEvent::Rejected {
                    gesture,
                    reason: err,
                });
            }
        }
    }
}

pub(crate) fn start_frame_worker(
    processor: Arc<FrameProcessor>,
    frame_rx: Receiver<HandFrame>,
    result_tx: Sender<RecognitionResult>,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        log::info!("gesture frame worker started");
        run_worker_loop(&processor, frame_rx, result_tx);
        log::info!("gesture frame worker stopped");
    })
}

fn run_worker_loop(
    processor: &FrameProcessor,
    frame_rx: Receiver<HandFrame>,
    result_tx: Sender<RecognitionResult>,
) {
    while let Some(frame) = recv_latest_frame(&frame_rx) {
        let started = Instant::now();
        let result = processor.process(&frame);
        log::trace!(
            "frame processed in {:?}: {}",
            started.elapsed(),
            result.display_text()
        );
        let _ = result_tx.try_send(result);
    }
}

/// Blocks for the next frame, then skips ahead to the newest queued one.
/// `None` once every sender is gone.
fn recv_latest_frame(frame_rx: &Receiver<HandFrame>) -> Option<HandFrame> {
    let mut frame = frame_rx.recv().ok()?;
    while let Ok(newer) = frame_rx.try_recv() {
        frame = newer;
    }
    Some(frame)
}
