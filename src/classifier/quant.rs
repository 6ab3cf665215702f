/// Quantization parameters corresponding to the zero_point and scale value.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct QuantizationParameters {
    pub scale: f32,
    pub zero_point: i32,
}

impl QuantizationParameters {
    pub fn new(scale: f32, zero_point: i32) -> Self {
        Self { scale, zero_point }
    }

    pub fn is_valid(&self) -> bool {
        self.scale.is_finite() && self.scale > 0.0
    }
}

/// Element type of a quantized tensor.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum QuantizedType {
    Unsigned,
    Signed,
}

impl QuantizedType {
    fn range(self) -> (i32, i32) {
        match self {
            QuantizedType::Unsigned => (u8::MIN as i32, u8::MAX as i32),
            QuantizedType::Signed => (i8::MIN as i32, i8::MAX as i32),
        }
    }
}

/// One byte per value; `kind` says how to read the bytes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QuantizedTensor {
    kind: QuantizedType,
    bytes: Vec<u8>,
}

impl QuantizedTensor {
    pub fn from_u8(bytes: Vec<u8>) -> Self {
        Self {
            kind: QuantizedType::Unsigned,
            bytes,
        }
    }

    pub fn from_i8(values: Vec<i8>) -> Self {
        Self {
            kind: QuantizedType::Signed,
            bytes: values.into_iter().map(|v| v as u8).collect(),
        }
    }

    pub fn kind(&self) -> QuantizedType {
        self.kind
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn to_i8(&self) -> Vec<i8> {
        self.bytes.iter().map(|b| *b as i8).collect()
    }

    /// Integer value of each element.
    pub fn values(&self) -> impl Iterator<Item = i32> + '_ {
        let kind = self.kind;
        self.bytes.iter().map(move |b| match kind {
            QuantizedType::Unsigned => *b as i32,
            QuantizedType::Signed => *b as i8 as i32,
        })
    }
}

/// `q = round(v / scale) + zero_point`, clamped to the element range.
///
/// Clamping happens in float so out-of-range and infinite inputs saturate.
/// NaN maps to the zero point.
pub fn quantize(
    values: &[f32],
    params: QuantizationParameters,
    kind: QuantizedType,
) -> QuantizedTensor {
    let (min, max) = kind.range();
    let bytes = values
        .iter()
        .map(|v| {
            let steps = (v / params.scale).round();
            let steps = if steps.is_nan() { 0.0 } else { steps };
            let q = (steps + params.zero_point as f32).clamp(min as f32, max as f32);
            q as i32 as u8
        })
        .collect();
    QuantizedTensor { kind, bytes }
}

pub(crate) trait Dequantize {
    fn dequantize(&self, quantization_parameters: QuantizationParameters) -> Vec<f32>;
}

impl Dequantize for QuantizedTensor {
    #[inline(always)]
    fn dequantize(&self, quantization_parameters: QuantizationParameters) -> Vec<f32> {
        self.values()
            .map(|q| quantization_parameters.scale * (q - quantization_parameters.zero_point) as f32)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unsigned_quantization_rounds_and_clamps() {
        let params = QuantizationParameters::new(1.0 / 128.0, 128);
        let q = quantize(&[0.0, 0.5, -1.0, 1.0, 3.0, -3.0], params, QuantizedType::Unsigned);
        assert_eq!(q.as_bytes(), &[128, 192, 0, 255, 255, 0]);
    }

    #[test]
    fn signed_quantization_uses_signed_range() {
        let params = QuantizationParameters::new(1.0 / 127.0, 0);
        let q = quantize(&[0.0, 1.0, -1.0, -2.0], params, QuantizedType::Signed);
        assert_eq!(q.to_i8(), vec![0, 127, -127, -128]);
        assert_eq!(q.values().collect::<Vec<_>>(), vec![0, 127, -127, -128]);
    }

    #[test]
    fn extreme_inputs_saturate() {
        let params = QuantizationParameters::new(1.0 / 128.0, 128);
        let q = quantize(
            &[f32::MAX, f32::INFINITY, -f32::MAX, f32::NEG_INFINITY, f32::NAN, 1e30],
            params,
            QuantizedType::Unsigned,
        );
        assert_eq!(q.as_bytes(), &[255, 255, 0, 0, 128, 255]);

        let params = QuantizationParameters::new(1.0 / 127.0, 5);
        let q = quantize(&[f32::MAX, f32::NEG_INFINITY, f32::NAN], params, QuantizedType::Signed);
        assert_eq!(q.to_i8(), vec![127, -128, 5]);
    }

    #[test]
    fn dequantize_applies_zero_point_then_scale() {
        let tensor = QuantizedTensor::from_u8(vec![0, 128, 255]);
        let scores = tensor.dequantize(QuantizationParameters::new(0.5, 128));
        assert_eq!(scores, vec![-64.0, 0.0, 63.5]);
    }
}
