use serde::{Deserialize, Serialize};

/// Bounding box for a detected face, with optional facial landmarks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl BoundingBox {
    /// Center point (cx, cy).
    pub fn center(&self) -> (f32, f32) {
        (self.x + self.width / 2.0, self.y + self.height / 2.0)
    }

    /// Intersection-over-Union with another box, in [0, 1].
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let x1 = self.x.max(other.x);
        let y1 = self.y.max(other.y);
        let x2 = (self.x + self.width).min(other.x + other.width);
        let y2 = (self.y + self.height).min(other.y + other.height);

        let inter_w = (x2 - x1).max(0.0);
        let inter_h = (y2 - y1).max(0.0);
        let inter_area = inter_w * inter_h;

        let area_a = self.width * self.height;
        let area_b = other.width * other.height;
        let union_area = area_a + area_b - inter_area;

        if union_area > 0.0 {
            inter_area / union_area
        } else {
            0.0
        }
    }
}

/// A single detected face in one frame.
///
/// `track_id` is an opaque correlation key from the upstream tracker:
/// the only guarantee is best-effort "same id ⇒ same physical face
/// across consecutive frames".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Detection {
    pub bbox: BoundingBox,
    pub confidence: f32,
    /// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
    pub landmarks: Option<[(f32, f32); 5]>,
    pub track_id: Option<u64>,
    /// Filled in after gallery matching.
    pub identity: Option<String>,
    pub similarity: Option<f32>,
}

impl Detection {
    pub fn new(bbox: BoundingBox, confidence: f32, landmarks: Option<[(f32, f32); 5]>) -> Self {
        Self {
            bbox,
            confidence,
            landmarks,
            track_id: None,
            identity: None,
            similarity: None,
        }
    }
}

/// Face embedding vector (512-dimensional for ArcFace).
///
/// Invariant: always L2-normalized before storage or comparison, so
/// similarity between two embeddings is a plain dot product.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
}

impl Embedding {
    /// Build an embedding from raw model output, L2-normalizing.
    ///
    /// A zero vector passes through unchanged rather than dividing by zero.
    pub fn from_raw(raw: Vec<f32>) -> Self {
        let norm: f32 = raw.iter().map(|x| x * x).sum::<f32>().sqrt();
        let values = if norm > 0.0 {
            raw.iter().map(|x| x / norm).collect()
        } else {
            raw
        };
        Self { values }
    }

    /// Dot-product similarity. Both sides are unit length, so this is
    /// cosine similarity in [-1, 1].
    pub fn dot(&self, other: &Embedding) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| a * b)
            .sum()
    }
}
