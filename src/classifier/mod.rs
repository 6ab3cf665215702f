mod quant;
#[cfg(feature = "backend-ort")]
pub mod ort;

use std::{path::Path, sync::Arc};

use anyhow::{Context, Result, bail};
use parking_lot::{Mutex, RwLock};

use crate::{
    labels::LabelMap,
    types::{Classification, FEATURE_LEN},
};

use self::quant::Dequantize;
pub use self::quant::{QuantizationParameters, QuantizedTensor, QuantizedType, quantize};

/// Scores below this are reported as the "none" sentinel.
pub const DEFAULT_CONFIDENCE_THRESHOLD: f32 = 0.5;

/// A quantized inference engine. Input and output are one byte per value;
/// the engine reports the parameters needed to convert to and from floats.
pub trait InferenceBackend: Send + 'static {
    fn input_quantization(&self) -> QuantizationParameters;
    fn output_quantization(&self) -> QuantizationParameters;
    fn input_type(&self) -> QuantizedType;

    /// Declared input width, if the model fixes it.
    fn input_len(&self) -> Option<usize> {
        None
    }

    /// Declared number of output classes, if the model fixes it.
    fn output_len(&self) -> Option<usize> {
        None
    }

    fn run(&mut self, input: &QuantizedTensor) -> Result<QuantizedTensor>;
}

pub trait BackendLoader: Send + Sync {
    fn load(&self, model_path: &Path) -> Result<Box<dyn InferenceBackend>>;
}

/// An inference engine bound to the label map it was trained with. The two
/// are only ever swapped together.
pub struct LoadedModel {
    backend: Mutex<Box<dyn InferenceBackend>>,
    labels: LabelMap,
    model_code: String,
    input_quantization: QuantizationParameters,
    output_quantization: QuantizationParameters,
    input_type: QuantizedType,
    output_len: Option<usize>,
}

impl LoadedModel {
    pub fn new(
        backend: Box<dyn InferenceBackend>,
        labels: LabelMap,
        model_code: impl Into<String>,
    ) -> Result<Self> {
        let input_quantization = backend.input_quantization();
        let output_quantization = backend.output_quantization();
        if !input_quantization.is_valid() {
            bail!("invalid input scale {}", input_quantization.scale);
        }
        if !output_quantization.is_valid() {
            bail!("invalid output scale {}", output_quantization.scale);
        }
        if let Some(width) = backend.input_len() {
            if width != FEATURE_LEN {
                bail!("model expects {width} input values, features have {FEATURE_LEN}");
            }
        }

        Ok(Self {
            input_type: backend.input_type(),
            output_len: backend.output_len(),
            backend: Mutex::new(backend),
            labels,
            model_code: model_code.into(),
            input_quantization,
            output_quantization,
        })
    }

    pub fn labels(&self) -> &LabelMap {
        &self.labels
    }

    pub fn model_code(&self) -> &str {
        &self.model_code
    }

    pub fn output_len(&self) -> Option<usize> {
        self.output_len
    }

    /// Whether every label-map index has an output class to land on.
    pub fn covers_labels(&self) -> bool {
        match (self.output_len, self.labels.max_index()) {
            (Some(classes), Some(max)) => max < classes,
            _ => true,
        }
    }

    fn scores(&self, features: &[f32]) -> Result<Vec<f32>> {
        let input = quantize(features, self.input_quantization, self.input_type);
        let output = self.backend.lock().run(&input)?;
        if output.is_empty() {
            bail!("model produced no scores");
        }
        Ok(output.dequantize(self.output_quantization))
    }
}

/// Holds the active model and classifies feature vectors against it.
///
/// Every failure on the classification path degrades to `None`; the caller
/// runs this once per camera frame and has nothing useful to do with an
/// error.
pub struct QuantizedClassifier {
    active: RwLock<Option<Arc<LoadedModel>>>,
    loader: Arc<dyn BackendLoader>,
    confidence_threshold: f32,
}

impl QuantizedClassifier {
    pub fn new(loader: Arc<dyn BackendLoader>, confidence_threshold: f32) -> Self {
        Self {
            active: RwLock::new(None),
            loader,
            confidence_threshold,
        }
    }

    /// Loads a model without activating it.
    pub fn prepare(
        &self,
        model_path: &Path,
        labels: LabelMap,
        model_code: &str,
    ) -> Result<LoadedModel> {
        let backend = self
            .loader
            .load(model_path)
            .with_context(|| format!("failed to load model from {}", model_path.display()))?;
        LoadedModel::new(backend, labels, model_code)
            .with_context(|| format!("model {} rejected", model_path.display()))
    }

    /// Atomically replaces the active model and label map. Calls already
    /// holding the old model finish against it.
    pub fn reload(&self, model: LoadedModel) {
        log::info!(
            "activating gesture model {} ({} labels)",
            model.model_code,
            model.labels.len()
        );
        let previous = self.active.write().replace(Arc::new(model));
        if let Some(previous) = previous {
            log::debug!("released gesture model {}", previous.model_code);
        }
    }

    /// Prepare + reload. On error the active model is left untouched.
    pub fn reload_from(&self, model_path: &Path, labels: LabelMap, model_code: &str) -> Result<()> {
        let model = self.prepare(model_path, labels, model_code)?;
        self.reload(model);
        Ok(())
    }

    pub fn close(&self) {
        if let Some(model) = self.active.write().take() {
            log::info!("closed gesture model {}", model.model_code);
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.active.read().is_some()
    }

    pub fn model_code(&self) -> Option<String> {
        self.current().map(|model| model.model_code.clone())
    }

    pub fn labels(&self) -> Option<LabelMap> {
        self.current().map(|model| model.labels.clone())
    }

    fn current(&self) -> Option<Arc<LoadedModel>> {
        self.active.read().clone()
    }

    pub fn classify(&self, features: &[f32]) -> Option<Classification> {
        let Some(model) = self.current() else {
            log::debug!("no gesture model loaded");
            return None;
        };
        if features.len() != FEATURE_LEN {
            log::warn!(
                "feature vector has {} values, expected {FEATURE_LEN}",
                features.len()
            );
            return None;
        }

        match model.scores(features) {
            Ok(scores) => pick_class(&scores, &model.labels, self.confidence_threshold),
            Err(err) => {
                log::warn!("gesture inference failed: {err:?}");
                None
            }
        }
    }
}

/// Argmax over `scores` (first index wins ties), gated by `threshold`.
fn pick_class(scores: &[f32], labels: &LabelMap, threshold: f32) -> Option<Classification> {
    let (class_index, confidence) = scores.iter().copied().enumerate().fold(
        None,
        |best: Option<(usize, f32)>, (index, score)| match best {
            Some((_, top)) if score <= top || score.is_nan() => best,
            _ if score.is_nan() => best,
            _ => Some((index, score)),
        },
    )?;

    let label = if confidence < threshold {
        None
    } else {
        let name = labels.name_of(class_index);
        if name.is_none() {
            log::debug!("class {class_index} has no label");
        }
        name.map(str::to_string)
    };

    Some(Classification {
        label,
        confidence,
        class_index,
    })
}
