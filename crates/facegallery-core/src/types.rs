use serde::{Deserialize, Serialize};

/// Dimensionality of the face embeddings produced upstream.
pub const EMBEDDING_DIM: usize = 512;

/// Label the upstream detector gives to face detections.
pub const FACE_LABEL: &str = "face";

/// Classification type written back onto recognized detections.
pub const FACE_RECON_KIND: &str = "face_recon";

/// Name given to persons nobody has labeled yet.
pub const UNKNOWN_NAME: &str = "Unknown";

/// Normalized bounding box: `(xmin, ymin, width, height)` in [0, 1] frame units.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub xmin: f32,
    pub ymin: f32,
    pub width: f32,
    pub height: f32,
}

impl BoundingBox {
    pub fn xmax(&self) -> f32 {
        self.xmin + self.width
    }

    pub fn ymax(&self) -> f32 {
        self.ymin + self.height
    }
}

/// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
///
/// Each point is normalized to the bounding box of its detection.
pub type Landmarks = [(f32, f32); 5];

/// Face embedding vector (512-dimensional for the ArcFace family).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    /// Compute cosine similarity between two embeddings.
    ///
    /// Returns a value in [-1, 1]. Higher = more similar. Zero vectors
    /// compare as 0.
    pub fn similarity(&self, other: &Embedding) -> f32 {
        let mut dot = 0.0f32;
        let mut norm_a = 0.0f32;
        let mut norm_b = 0.0f32;

        for (a, b) in self.values.iter().zip(other.values.iter()) {
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        let denom = norm_a.sqrt() * norm_b.sqrt();
        if denom > 0.0 { dot / denom } else { 0.0 }
    }

    /// Cosine distance `1 − similarity`, in [0, 2].
    pub fn cosine_distance(&self, other: &Embedding) -> f32 {
        1.0 - self.similarity(other)
    }

    /// Compute Euclidean distance between two embeddings.
    pub fn euclidean_distance(&self, other: &Embedding) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }

    /// Component-wise arithmetic mean. `None` for an empty iterator or
    /// mismatched dimensions.
    pub fn mean<'a, I>(embeddings: I) -> Option<Embedding>
    where
        I: IntoIterator<Item = &'a Embedding>,
    {
        let mut iter = embeddings.into_iter();
        let first = iter.next()?;
        let mut sum: Vec<f64> = first.values.iter().map(|&v| v as f64).collect();
        let mut count = 1usize;

        for e in iter {
            if e.values.len() != sum.len() {
                return None;
            }
            for (acc, &v) in sum.iter_mut().zip(e.values.iter()) {
                *acc += v as f64;
            }
            count += 1;
        }

        Some(Embedding {
            values: sum.into_iter().map(|v| (v / count as f64) as f32).collect(),
        })
    }

    /// Little-endian f32 encoding used for BLOB columns.
    pub fn to_le_bytes(&self) -> Vec<u8> {
        self.values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    /// Decode a little-endian f32 BLOB. `None` if the length is not a multiple of 4.
    pub fn from_le_bytes(bytes: &[u8]) -> Option<Embedding> {
        if bytes.len() % 4 != 0 {
            return None;
        }
        let values = bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        Some(Embedding { values })
    }
}

/// Classification attached to a detection for downstream overlays.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub kind: String,
    pub label: String,
    pub confidence: f32,
}

impl Classification {
    pub fn face_recon(label: impl Into<String>, confidence: f32) -> Self {
        Self {
            kind: FACE_RECON_KIND.to_string(),
            label: label.into(),
            confidence,
        }
    }
}

/// One detected object as delivered by the upstream pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub label: String,
    pub bbox: BoundingBox,
    #[serde(default)]
    pub confidence: f32,
    #[serde(default)]
    pub track_id: Option<u64>,
    #[serde(default)]
    pub landmarks: Option<Landmarks>,
    #[serde(default)]
    pub embeddings: Vec<Embedding>,
    #[serde(default)]
    pub classifications: Vec<Classification>,
}

impl Detection {
    pub fn is_face(&self) -> bool {
        self.label == FACE_LABEL
    }

    pub fn has_embedding(&self) -> bool {
        !self.embeddings.is_empty()
    }

    /// The first embedding, if any.
    pub fn embedding(&self) -> Option<&Embedding> {
        self.embeddings.first()
    }

    /// Attach a classification, replacing an existing one of the same kind
    /// only if the new confidence is strictly higher.
    ///
    /// Returns `true` if the detection was modified.
    pub fn apply_classification(&mut self, classification: Classification) -> bool {
        match self
            .classifications
            .iter_mut()
            .find(|c| c.kind == classification.kind)
        {
            Some(existing) if existing.confidence >= classification.confidence => false,
            Some(existing) => {
                *existing = classification;
                true
            }
            None => {
                self.classifications.push(classification);
                true
            }
        }
    }

    /// The `face_recon` classification, if one was attached.
    pub fn face_recon(&self) -> Option<&Classification> {
        self.classifications.iter().find(|c| c.kind == FACE_RECON_KIND)
    }
}
