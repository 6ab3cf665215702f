use std::time::Instant;

/// Number of points in one hand skeleton.
pub const LANDMARK_COUNT: usize = 21;
/// Normalized coordinates per frame (21 points × xyz).
pub const COORDINATE_LEN: usize = LANDMARK_COUNT * 3;
/// Model input width: the coordinates plus one trailing handedness value.
pub const FEATURE_LEN: usize = COORDINATE_LEN + 1;

pub const WRIST: usize = 0;
pub const MIDDLE_FINGER_MCP: usize = 9;

/// Label shown when the classifier is not confident enough.
pub const NONE_LABEL: &str = "none";

pub type FeatureVector = [f32; FEATURE_LEN];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Handedness {
    Left,
    Right,
    Unknown,
}

impl Handedness {
    pub fn label(&self) -> &'static str {
        match self {
            Handedness::Left => "left",
            Handedness::Right => "right",
            Handedness::Unknown => "unknown",
        }
    }

    pub fn from_label(label: &str) -> Self {
        if label.eq_ignore_ascii_case("left") {
            Handedness::Left
        } else if label.eq_ignore_ascii_case("right") {
            Handedness::Right
        } else {
            Handedness::Unknown
        }
    }

    /// Maps a raw handedness score from a landmark model onto a hand.
    pub fn from_score(score: f32) -> Self {
        if score >= 0.5 {
            Handedness::Right
        } else if score > 0.0 {
            Handedness::Left
        } else {
            Handedness::Unknown
        }
    }

    /// The other hand, as seen through a mirror.
    pub fn mirrored(self) -> Self {
        match self {
            Handedness::Left => Handedness::Right,
            Handedness::Right => Handedness::Left,
            Handedness::Unknown => Handedness::Unknown,
        }
    }
}

/// One detected hand as reported by the external landmark detector.
#[derive(Clone, Debug)]
pub struct LandmarkSet {
    pub points: Vec<[f32; 3]>,
    pub handedness: Handedness,
    /// Detector confidence for this hand, used to gate sample collection.
    pub confidence: f32,
}

impl LandmarkSet {
    pub fn new(points: Vec<[f32; 3]>, handedness: Handedness, confidence: f32) -> Self {
        Self {
            points,
            handedness,
            confidence,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.points.len() == LANDMARK_COUNT
    }
}

/// Per-frame input to the recognition worker. `hand` is `None` when the
/// detector saw no hand in the frame.
#[derive(Clone, Debug)]
pub struct HandFrame {
    pub hand: Option<LandmarkSet>,
    pub timestamp: Instant,
}

impl HandFrame {
    pub fn new(hand: Option<LandmarkSet>) -> Self {
        Self {
            hand,
            timestamp: Instant::now(),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Classification {
    /// Gesture name, or `None` for the "none" sentinel.
    pub label: Option<String>,
    pub confidence: f32,
    pub class_index: usize,
}

impl Classification {
    pub fn is_none(&self) -> bool {
        self.label.is_none()
    }

    pub fn display_text(&self) -> String {
        match &self.label {
            Some(label) => format!("{} ({:.0}%)", label, self.confidence * 100.0),
            None => NONE_LABEL.to_string(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct RecognitionResult {
    /// `None` when nothing could be classified this frame.
    pub classification: Option<Classification>,
    pub hand_detected: bool,
    pub timestamp: Instant,
}

impl RecognitionResult {
    pub fn display_text(&self) -> String {
        match &self.classification {
            Some(classification) => classification.display_text(),
            None if self.hand_detected => "hand detected".to_string(),
            None => "no hand".to_string(),
        }
    }
}
