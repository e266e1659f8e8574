use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Smallest descriptor length accepted into the matcher index.
pub const MIN_DESCRIPTOR_DIM: usize = 128;
/// Largest descriptor length accepted into the matcher index.
pub const MAX_DESCRIPTOR_DIM: usize = 512;

/// Bounding box for a detected face, in frame pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl BoundingBox {
    /// Ratio of the box to the frame along its larger relative dimension.
    ///
    /// Used as a proximity proxy: a face close to the terminal fills more
    /// of the frame. Returns 0.0 for a degenerate frame.
    pub fn size_ratio(&self, frame_width: u32, frame_height: u32) -> f32 {
        if frame_width == 0 || frame_height == 0 {
            return 0.0;
        }
        let w = self.width / frame_width as f32;
        let h = self.height / frame_height as f32;
        w.max(h)
    }
}

/// Face descriptor vector produced by the extraction model (128 to 512 values).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Descriptor {
    pub values: Vec<f32>,
}

impl Descriptor {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Whether the length falls inside the accepted descriptor range.
    pub fn has_supported_dim(&self) -> bool {
        (MIN_DESCRIPTOR_DIM..=MAX_DESCRIPTOR_DIM).contains(&self.values.len())
    }

    /// Euclidean distance between two descriptors.
    ///
    /// Always processes every dimension of the shorter vector; callers are
    /// expected to have checked lengths beforehand.
    pub fn euclidean_distance(&self, other: &Descriptor) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }
}

/// A single face found in a frame by the detection collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Detection {
    pub bounding_box: BoundingBox,
    /// Missing when the extraction model could not produce a descriptor for this face.
    pub descriptor: Option<Descriptor>,
    /// Detector confidence in [0, 1].
    pub score: f32,
}

/// An identity enrolled for the active event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrolledIdentity {
    /// Participant-scoped id.
    pub id: String,
    /// Account-scoped id, when the participant is linked to a user account.
    #[serde(default)]
    pub account_id: Option<String>,
    pub display_name: String,
    pub descriptor: Descriptor,
    pub enrolled_at: DateTime<Utc>,
}

/// Result of a successful descriptor lookup.
#[derive(Debug, Clone, PartialEq)]
pub struct IdentityMatch {
    pub identity_id: String,
    pub display_name: String,
    /// Calibrated confidence percentage in [0, 100].
    pub confidence: f32,
}
