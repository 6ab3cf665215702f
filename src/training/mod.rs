//! Upload → poll → download → install, one job at a time.
//!
//! Each job runs on its own thread and reports through a channel of
//! [`TrainingEvent`]s. Exactly one terminal event (`ModelReady` or `Failed`)
//! is sent per job, after the orchestrator is back in `Idle`.

pub mod api;
pub mod wire;

use std::{
    path::Path,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

pub use self::api::{HttpTrainerApi, TrainerApi};
pub use self::wire::TaskStatus;
use crate::{
    classifier::QuantizedClassifier,
    collector::SampleBatch,
    error::{StartError, TrainingError},
    store::ModelStore,
};

/// Shared "a training job is in flight" flag. The collector reads it, the
/// orchestrator holds it for the lifetime of a job.
#[derive(Clone, Debug, Default)]
pub struct JobGate(Arc<AtomicBool>);

impl JobGate {
    pub fn is_busy(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    pub fn try_acquire(&self) -> Result<JobPermit, StartError> {
        self.0
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| JobPermit(self.0.clone()))
            .map_err(|_| StartError::Busy)
    }
}

/// Releases the gate on drop.
#[derive(Debug)]
pub struct JobPermit(Arc<AtomicBool>);

impl Drop for JobPermit {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollConfig {
    pub interval: Duration,
    /// Wall-clock budget measured from the first poll.
    pub timeout: Duration,
    /// Consecutive empty or failed polls tolerated before giving up.
    pub max_misses: u32,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            timeout: Duration::from_secs(120),
            max_misses: 3,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrainingState {
    Idle,
    Uploading,
    Polling,
    Downloading,
    Installing,
    Failed,
}

#[derive(Clone, Debug, PartialEq)]
pub enum TrainingEvent {
    TaskStarted {
        task_id: String,
        gesture: String,
    },
    Progress {
        task_id: String,
        step: String,
    },
    ModelReady {
        gesture: String,
        model_code: String,
        label_index: usize,
    },
    Failed {
        gesture: String,
        reason: TrainingError,
    },
}

impl TrainingEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TrainingEvent::ModelReady { .. } | TrainingEvent::Failed { .. }
        )
    }
}

struct Installed {
    model_code: String,
    label_index: usize,
}

struct Inner {
    api: Arc<dyn TrainerApi>,
    store: Arc<ModelStore>,
    classifier: Arc<QuantizedClassifier>,
    poll: PollConfig,
    batch_size: usize,
    gate: JobGate,
    state: Mutex<TrainingState>,
    /// Dropping the sender interrupts the running job's waits.
    cancel: Mutex<Option<Sender<()>>>,
    events: Sender<TrainingEvent>,
}

#[derive(Clone)]
pub struct TrainingOrchestrator {
    inner: Arc<Inner>,
}

impl TrainingOrchestrator {
    pub fn new(
        api: Arc<dyn TrainerApi>,
        store: Arc<ModelStore>,
        classifier: Arc<QuantizedClassifier>,
        poll: PollConfig,
        batch_size: usize,
        events: Sender<TrainingEvent>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                api,
                store,
                classifier,
                poll,
                batch_size,
                gate: JobGate::default(),
                state: Mutex::new(TrainingState::Idle),
                cancel: Mutex::new(None),
                events,
            }),
        }
    }

    pub fn state(&self) -> TrainingState {
        *self.inner.state.lock()
    }

    /// The flag the sample collector checks before starting.
    pub fn gate(&self) -> JobGate {
        self.inner.gate.clone()
    }

    pub fn is_busy(&self) -> bool {
        self.inner.gate.is_busy()
    }

    /// Starts a job for `batch` on a new thread. Rejected while another job
    /// is in flight; the running job is not affected.
    pub fn start(&self, batch: SampleBatch) -> Result<thread::JoinHandle<()>, StartError> {
        if batch.len() != self.inner.batch_size {
            return Err(StartError::IncompleteBatch {
                gesture: batch.gesture,
                actual: batch.samples.len(),
                expected: self.inner.batch_size,
            });
        }
        let permit = self.inner.gate.try_acquire().inspect_err(|_| {
            log::warn!(
                "training for `{}` rejected: a job is already running",
                batch.gesture
            );
        })?;

        let (cancel_tx, cancel_rx) = crossbeam_channel::bounded(1);
        *self.inner.cancel.lock() = Some(cancel_tx);
        self.inner.set_state(TrainingState::Uploading);

        let inner = self.inner.clone();
        Ok(thread::spawn(move || inner.run(batch, cancel_rx, permit)))
    }

    /// Stops following the current job. The server keeps training; this side
    /// reports the job as failed and returns to idle.
    pub fn stop_polling(&self) -> bool {
        match self.inner.cancel.lock().take() {
            Some(cancel_tx) => {
                drop(cancel_tx);
                log::info!("stopping training job on request");
                true
            }
            None => false,
        }
    }
}

impl Inner {
    fn set_state(&self, next: TrainingState) {
        let mut state = self.state.lock();
        if *state != next {
            log::debug!("training state {:?} -> {:?}", *state, next);
            *state = next;
        }
    }

    fn emit(&self, event: TrainingEvent) {
        let _ = self.events.send(event);
    }

    fn run(&self, batch: SampleBatch, cancel_rx: Receiver<()>, permit: JobPermit) {
        let gesture = batch.gesture.clone();
        let outcome = self.run_job(&batch, &cancel_rx);

        let event = match outcome {
            Ok(installed) => {
                log::info!(
                    "gesture `{gesture}` installed as class {} of model {}",
                    installed.label_index,
                    installed.model_code
                );
                TrainingEvent::ModelReady {
                    gesture,
                    model_code: installed.model_code,
                    label_index: installed.label_index,
                }
            }
            Err(reason) => {
                self.set_state(TrainingState::Failed);
                match &reason {
                    TrainingError::Cancelled => log::info!("training for `{gesture}` stopped"),
                    _ => log::error!("training for `{gesture}` failed: {reason}"),
                }
                TrainingEvent::Failed { gesture, reason }
            }
        };

        self.cancel.lock().take();
        self.set_state(TrainingState::Idle);
        drop(permit);
        self.emit(event);
    }

    fn run_job(
        &self,
        batch: &SampleBatch,
        cancel_rx: &Receiver<()>,
    ) -> Result<Installed, TrainingError> {
        let model_code = self.store.current_model_code();
        let task_id = self
            .api
            .submit(&model_code, batch)
            .map_err(|err| TrainingError::Upload(err.to_string()))?;
        log::info!("training task {task_id} started for `{}`", batch.gesture);

        if let Err(err) = self.store.record_task_id(&task_id) {
            log::warn!("failed to record task id {task_id}: {err}");
        }
        self.set_state(TrainingState::Polling);
        self.emit(TrainingEvent::TaskStarted {
            task_id: task_id.clone(),
            gesture: batch.gesture.clone(),
        });

        let (model_url, new_code) = self.poll_until_done(&task_id, cancel_rx)?;

        if is_cancelled(cancel_rx) {
            return Err(TrainingError::Cancelled);
        }
        self.set_state(TrainingState::Downloading);
        let bytes = self
            .api
            .download(&model_url)
            .map_err(|err| TrainingError::Download(err.to_string()))?;
        if bytes.is_empty() {
            return Err(TrainingError::Download("empty model body".to_string()));
        }
        if is_cancelled(cancel_rx) {
            return Err(TrainingError::Cancelled);
        }

        self.set_state(TrainingState::Installing);
        if new_code == self.store.current_model_code() {
            return Err(TrainingError::ModelRejected(format!(
                "model code {new_code} is already active"
            )));
        }
        let staged = self
            .store
            .write_model(&new_code, &bytes)
            .map_err(|err| TrainingError::Storage(err.to_string()))?;
        match self.install(&batch.gesture, &new_code, &staged, &model_url) {
            Ok(label_index) => Ok(Installed {
                model_code: new_code,
                label_index,
            }),
            Err(err) => {
                self.store.discard_model(&staged);
                Err(err)
            }
        }
    }

    fn poll_until_done(
        &self,
        task_id: &str,
        cancel_rx: &Receiver<()>,
    ) -> Result<(String, String), TrainingError> {
        let started = Instant::now();
        let mut misses = 0u32;
        let mut last_step: Option<String> = None;

        loop {
            if is_cancelled(cancel_rx) {
                return Err(TrainingError::Cancelled);
            }
            if started.elapsed() >= self.poll.timeout {
                return Err(TrainingError::Timeout(self.poll.timeout));
            }

            match self.api.poll_status(task_id) {
                Ok(Some(status)) => {
                    misses = 0;
                    let step = match status {
                        TaskStatus::Pending => wire::PENDING_STEP.to_string(),
                        TaskStatus::Progress { step } => step,
                        TaskStatus::Success {
                            model_url,
                            model_code,
                        } => {
                            log::info!("task {task_id} finished: model {model_code}");
                            return Ok((model_url, model_code));
                        }
                        TaskStatus::Failure { reason } => {
                            return Err(TrainingError::Server(reason));
                        }
                    };
                    if last_step.as_deref() != Some(step.as_str()) {
                        log::info!("task {task_id}: {step}");
                        self.emit(TrainingEvent::Progress {
                            task_id: task_id.to_string(),
                            step: step.clone(),
                        });
                        last_step = Some(step);
                    }
                }
                Ok(None) => {
                    misses += 1;
                    log::warn!(
                        "empty status for task {task_id} ({misses}/{})",
                        self.poll.max_misses
                    );
                }
                Err(err) => {
                    misses += 1;
                    log::warn!(
                        "status poll for task {task_id} failed ({misses}/{}): {err}",
                        self.poll.max_misses
                    );
                }
            }
            if misses >= self.poll.max_misses {
                return Err(TrainingError::NoServerResponse);
            }

            let remaining = self.poll.timeout.saturating_sub(started.elapsed());
            match cancel_rx.recv_timeout(self.poll.interval.min(remaining)) {
                Err(RecvTimeoutError::Timeout) => {}
                Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                    return Err(TrainingError::Cancelled);
                }
            }
        }
    }

    /// Grows the label map and activates the staged model. The caller
    /// removes the staged file if this fails.
    fn install(
        &self,
        gesture: &str,
        model_code: &str,
        model_path: &Path,
        model_url: &str,
    ) -> Result<usize, TrainingError> {
        let mut labels = self
            .store
            .load_label_map()
            .map_err(|err| TrainingError::Storage(err.to_string()))?;
        let label_index = labels.append(gesture);

        let model = self
            .classifier
            .prepare(model_path, labels.clone(), model_code)
            .map_err(|err| TrainingError::ModelRejected(format!("{err:#}")))?;
        if !model.covers_labels() {
            return Err(TrainingError::ModelRejected(format!(
                "model has {} classes but `{gesture}` is class {label_index}",
                model.output_len().unwrap_or_default()
            )));
        }

        let installed = self
            .store
            .commit(model_code, model_path, &labels, Some(model_url))
            .map_err(|err| TrainingError::Storage(err.to_string()))?;
        log::debug!("activating {}", installed.display());
        self.classifier.reload(model);
        Ok(label_index)
    }
}

fn is_cancelled(cancel_rx: &Receiver<()>) -> bool {
    !matches!(cancel_rx.try_recv(), Err(TryRecvError::Empty))
}
