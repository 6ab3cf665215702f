use std::path::Path;

use anyhow::{Context, Result, anyhow, bail};
use ndarray::Array2;
use ort::{
    session::{Session, builder::GraphOptimizationLevel},
    tensor::TensorElementType,
    value::{Tensor, ValueType},
};

use super::{BackendLoader, InferenceBackend, QuantizationParameters, QuantizedTensor, QuantizedType};

/// Output dequantization used when the model carries no parameters.
const DEFAULT_OUTPUT_QUANTIZATION: QuantizationParameters = QuantizationParameters {
    scale: 1.0 / 255.0,
    zero_point: 0,
};

const INPUT_SCALE_KEY: &str = "input_scale";
const INPUT_ZERO_POINT_KEY: &str = "input_zero_point";
const OUTPUT_SCALE_KEY: &str = "output_scale";
const OUTPUT_ZERO_POINT_KEY: &str = "output_zero_point";

/// Loads quantized gesture models through ONNX Runtime.
#[derive(Clone, Debug)]
pub struct OrtLoader {
    intra_threads: usize,
}

impl OrtLoader {
    pub fn new(intra_threads: usize) -> Self {
        Self {
            intra_threads: intra_threads.max(1),
        }
    }
}

impl Default for OrtLoader {
    fn default() -> Self {
        Self::new(2)
    }
}

impl BackendLoader for OrtLoader {
    fn load(&self, model_path: &Path) -> Result<Box<dyn InferenceBackend>> {
        let backend = OrtBackend::new(model_path, self.intra_threads)?;
        log::info!(
            "gesture model {} loaded: {:?} input, scale {} zero point {}",
            model_path.display(),
            backend.input_type,
            backend.input_quantization.scale,
            backend.input_quantization.zero_point
        );
        Ok(Box::new(backend))
    }
}

struct OrtBackend {
    session: Session,
    input_type: QuantizedType,
    input_len: Option<usize>,
    output_len: Option<usize>,
    input_quantization: QuantizationParameters,
    output_quantization: QuantizationParameters,
}

impl OrtBackend {
    fn new(model_path: &Path, intra_threads: usize) -> Result<Self> {
        let session = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_intra_threads(intra_threads)?
            .commit_from_file(model_path)
            .with_context(|| format!("failed to load ORT session from {}", model_path.display()))?;

        let input = session
            .inputs
            .first()
            .ok_or_else(|| anyhow!("model has no inputs"))?;
        let (input_type, input_len) = match &input.input_type {
            ValueType::Tensor { ty, shape, .. } => (element_type(*ty)?, last_dim(shape)),
            other => bail!("unsupported model input {other:?}"),
        };

        let output = session
            .outputs
            .first()
            .ok_or_else(|| anyhow!("model has no outputs"))?;
        let output_len = match &output.output_type {
            ValueType::Tensor { ty, shape, .. } => {
                element_type(*ty).context("unsupported model output")?;
                last_dim(shape)
            }
            other => bail!("unsupported model output {other:?}"),
        };

        let (input_quantization, output_quantization) = {
            let metadata = session.metadata()?;
            let custom = |key: &str| -> Option<String> { metadata.custom(key).ok().flatten() };
            let input = read_quantization(&custom, INPUT_SCALE_KEY, INPUT_ZERO_POINT_KEY)
                .ok_or_else(|| anyhow!("model carries no input quantization parameters"))?;
            let output = read_quantization(&custom, OUTPUT_SCALE_KEY, OUTPUT_ZERO_POINT_KEY)
                .unwrap_or(DEFAULT_OUTPUT_QUANTIZATION);
            (input, output)
        };

        Ok(Self {
            session,
            input_type,
            input_len,
            output_len,
            input_quantization,
            output_quantization,
        })
    }
}

impl InferenceBackend for OrtBackend {
    fn input_quantization(&self) -> QuantizationParameters {
        self.input_quantization
    }

    fn output_quantization(&self) -> QuantizationParameters {
        self.output_quantization
    }

    fn input_type(&self) -> QuantizedType {
        self.input_type
    }

    fn input_len(&self) -> Option<usize> {
        self.input_len
    }

    fn output_len(&self) -> Option<usize> {
        self.output_len
    }

    fn run(&mut self, input: &QuantizedTensor) -> Result<QuantizedTensor> {
        let len = input.len();
        let outputs = match input.kind() {
            QuantizedType::Unsigned => {
                let array = Array2::from_shape_vec((1, len), input.as_bytes().to_vec())?;
                self.session.run(ort::inputs![Tensor::from_array(array)?])
            }
            QuantizedType::Signed => {
                let array = Array2::from_shape_vec((1, len), input.to_i8())?;
                self.session.run(ort::inputs![Tensor::from_array(array)?])
            }
        }
        .context("failed to run ORT session")?;

        if outputs.len() < 1 {
            bail!("model returned no outputs");
        }

        if let Ok(scores) = outputs[0].try_extract_array::<u8>() {
            return Ok(QuantizedTensor::from_u8(scores.iter().copied().collect()));
        }
        let scores = outputs[0].try_extract_array::<i8>()?;
        Ok(QuantizedTensor::from_i8(scores.iter().copied().collect()))
    }
}

fn element_type(ty: TensorElementType) -> Result<QuantizedType> {
    match ty {
        TensorElementType::Uint8 => Ok(QuantizedType::Unsigned),
        TensorElementType::Int8 => Ok(QuantizedType::Signed),
        other => bail!("expected a quantized uint8/int8 tensor, got {other:?}"),
    }
}

fn last_dim(shape: &[i64]) -> Option<usize> {
    shape
        .last()
        .copied()
        .filter(|dim| *dim > 0)
        .map(|dim| dim as usize)
}

fn read_quantization(
    custom: &dyn Fn(&str) -> Option<String>,
    scale_key: &str,
    zero_point_key: &str,
) -> Option<QuantizationParameters> {
    let scale = custom(scale_key)?.trim().parse::<f32>().ok()?;
    let zero_point = custom(zero_point_key)
        .and_then(|value| value.trim().parse::<i32>().ok())
        .unwrap_or(0);
    Some(QuantizationParameters::new(scale, zero_point))
}
