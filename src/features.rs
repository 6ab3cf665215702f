//! Landmark-to-feature normalization.
//!
//! Every sample is brought into one canonical frame before it reaches the
//! model: wrist at the origin, wrist→middle-finger axis pointing up, left
//! hand geometry, unit span.

use serde::{Deserialize, Serialize};

use crate::types::{
    COORDINATE_LEN, FEATURE_LEN, FeatureVector, Handedness, LANDMARK_COUNT, LandmarkSet,
    MIDDLE_FINGER_MCP, WRIST,
};

/// Value appended after the 63 coordinates. Which encoding applies is fixed
/// by the deployed model.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandednessFeature {
    Constant(f32),
    Detected { left: f32, right: f32, unknown: f32 },
}

impl Default for HandednessFeature {
    fn default() -> Self {
        HandednessFeature::Constant(0.0)
    }
}

impl HandednessFeature {
    fn encode(&self, hand: Handedness) -> f32 {
        match *self {
            HandednessFeature::Constant(value) => value,
            HandednessFeature::Detected {
                left,
                right,
                unknown,
            } => match hand {
                Handedness::Left => left,
                Handedness::Right => right,
                Handedness::Unknown => unknown,
            },
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NormalizerConfig {
    /// Front cameras deliver a mirrored image, so the reported hand is the
    /// opposite of the anatomical one.
    pub mirrored_camera: bool,
    pub handedness_feature: HandednessFeature,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct FeatureNormalizer {
    config: NormalizerConfig,
}

impl FeatureNormalizer {
    pub fn new(config: NormalizerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &NormalizerConfig {
        &self.config
    }

    pub fn normalize(&self, landmarks: &LandmarkSet) -> FeatureVector {
        self.normalize_points(&landmarks.points, landmarks.handedness)
    }

    pub fn normalize_points(&self, points: &[[f32; 3]], reported: Handedness) -> FeatureVector {
        let points = &points[..points.len().min(LANDMARK_COUNT)];

        let mut normalized = translate_to_wrist(points);
        align_middle_finger_up(&mut normalized);

        let hand = if self.config.mirrored_camera {
            reported.mirrored()
        } else {
            reported
        };
        if hand == Handedness::Right {
            for point in normalized.iter_mut() {
                point[0] = -point[0];
            }
        }

        let span = largest_axis_span(&normalized);
        let divisor = if span > 0.0 && span.is_finite() {
            span
        } else {
            1.0
        };

        let mut features = [0.0f32; FEATURE_LEN];
        for (slot, value) in features[..COORDINATE_LEN]
            .iter_mut()
            .zip(normalized.iter().flatten())
        {
            *slot = value / divisor;
        }
        features[COORDINATE_LEN] = self.config.handedness_feature.encode(hand);
        features
    }
}

fn translate_to_wrist(points: &[[f32; 3]]) -> Vec<[f32; 3]> {
    let Some(&[wx, wy, wz]) = points.get(WRIST) else {
        return Vec::new();
    };
    points
        .iter()
        .map(|[x, y, z]| [x - wx, y - wy, z - wz])
        .collect()
}

/// Rotates the xy-plane so the wrist→middle-finger-base vector points
/// straight up (negative y in image coordinates).
///
/// The tilt angle is `atan2(dx, -dy)`; its sine and cosine are taken
/// directly from the normalized vector, which keeps the rotation exactly
/// antisymmetric under x-mirroring.
fn align_middle_finger_up(points: &mut [[f32; 3]]) {
    let Some(&[dx, dy, _]) = points.get(MIDDLE_FINGER_MCP) else {
        return;
    };
    let len = (dx * dx + dy * dy).sqrt();
    if len < f32::EPSILON || !len.is_finite() {
        return;
    }
    let sin = dx / len;
    let cos = -dy / len;

    // rotation by -angle
    for point in points.iter_mut() {
        let [x, y, _] = *point;
        point[0] = x * cos + y * sin;
        point[1] = y * cos - x * sin;
    }
}

fn largest_axis_span(points: &[[f32; 3]]) -> f32 {
    let mut min = [f32::MAX; 3];
    let mut max = [f32::MIN; 3];
    for point in points {
        for axis in 0..3 {
            min[axis] = min[axis].min(point[axis]);
            max[axis] = max[axis].max(point[axis]);
        }
    }
    (0..3)
        .map(|axis| max[axis] - min[axis])
        .fold(0.0f32, f32::max)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_hand() -> Vec<[f32; 3]> {
        (0..LANDMARK_COUNT)
            .map(|i| {
                let t = i as f32;
                [
                    0.42 + 0.013 * t + 0.002 * (t * 1.7).sin(),
                    0.71 - 0.021 * t + 0.004 * (t * 0.9).cos(),
                    -0.01 * (t * 0.5).sin(),
                ]
            })
            .collect()
    }

    fn normalizer() -> FeatureNormalizer {
        FeatureNormalizer::new(NormalizerConfig::default())
    }

    #[test]
    fn output_has_fixed_length_and_bounded_values() {
        let features = normalizer().normalize_points(&sample_hand(), Handedness::Left);
        assert_eq!(features.len(), FEATURE_LEN);
        for value in &features[..COORDINATE_LEN] {
            assert!((-1.0..=1.0).contains(value), "{value} out of range");
        }
    }

    #[test]
    fn normalization_is_idempotent() {
        let hand = sample_hand();
        let first = normalizer().normalize_points(&hand, Handedness::Right);
        let second = normalizer().normalize_points(&hand, Handedness::Right);
        assert_eq!(
            first.map(f32::to_bits).to_vec(),
            second.map(f32::to_bits).to_vec()
        );
    }

    #[test]
    fn wrist_lands_on_origin_and_middle_finger_points_up() {
        let features = normalizer().normalize_points(&sample_hand(), Handedness::Left);
        assert_eq!(&features[0..3], &[0.0, 0.0, 0.0]);

        let base = MIDDLE_FINGER_MCP * 3;
        assert!(features[base].abs() < 1e-6);
        assert!(features[base + 1] < 0.0);
    }

    #[test]
    fn right_hand_matches_mirrored_left_hand() {
        let right = sample_hand();
        let left: Vec<[f32; 3]> = right.iter().map(|&[x, y, z]| [-x, y, z]).collect();

        let from_right = normalizer().normalize_points(&right, Handedness::Right);
        let from_left = normalizer().normalize_points(&left, Handedness::Left);
        for (a, b) in from_right.iter().zip(from_left.iter()) {
            assert!((a - b).abs() < 1e-6, "{a} != {b}");
        }
    }

    #[test]
    fn mirrored_camera_inverts_reported_hand() {
        let hand = sample_hand();
        let mirrored = FeatureNormalizer::new(NormalizerConfig {
            mirrored_camera: true,
            ..NormalizerConfig::default()
        });

        let through_mirror = mirrored.normalize_points(&hand, Handedness::Left);
        let direct = normalizer().normalize_points(&hand, Handedness::Right);
        assert_eq!(through_mirror, direct);
    }

    #[test]
    fn rotation_removes_in_plane_tilt() {
        let upright = sample_hand();
        let angle = 0.6f32;
        let (sin, cos) = angle.sin_cos();
        let tilted: Vec<[f32; 3]> = upright
            .iter()
            .map(|&[x, y, z]| [x * cos - y * sin, x * sin + y * cos, z])
            .collect();

        let a = normalizer().normalize_points(&upright, Handedness::Left);
        let b = normalizer().normalize_points(&tilted, Handedness::Left);
        for (x, y) in a.iter().zip(b.iter()) {
            assert!((x - y).abs() < 1e-4, "{x} != {y}");
        }
    }

    #[test]
    fn degenerate_hand_does_not_divide_by_zero() {
        let collapsed = vec![[0.5, 0.5, 0.0]; LANDMARK_COUNT];
        let features = normalizer().normalize_points(&collapsed, Handedness::Unknown);
        assert!(features.iter().all(|v| v.is_finite()));
        assert!(features[..COORDINATE_LEN].iter().all(|v| *v == 0.0));
    }

    #[test]
    fn short_input_is_zero_padded() {
        let partial = &sample_hand()[..12];
        let features = normalizer().normalize_points(partial, Handedness::Left);
        assert!(features[12 * 3..COORDINATE_LEN].iter().all(|v| *v == 0.0));
    }

    #[test]
    fn detected_handedness_feature_uses_true_hand() {
        let detected = FeatureNormalizer::new(NormalizerConfig {
            mirrored_camera: true,
            handedness_feature: HandednessFeature::Detected {
                left: 0.0,
                right: 1.0,
                unknown: 0.5,
            },
        });
        let features = detected.normalize_points(&sample_hand(), Handedness::Left);
        assert_eq!(features[COORDINATE_LEN], 1.0);
    }
}
