//! Admission policy: decides whether a candidate face enrolls a new person,
//! augments an existing one, or only gets annotated.
//!
//! [`decide`] is a pure function of the candidate, the nearest gallery match,
//! the track map and the configuration. It never touches the store or the
//! filesystem; callers carry out the decision.

use crate::quality::{self, Sharpness};
use crate::track::TrackMap;
use crate::types::{BoundingBox, Classification, Embedding, Landmarks, UNKNOWN_NAME};
use serde::{Deserialize, Serialize};

/// Distance margin subtracted from 1 to get the default per-person threshold.
pub const DISTANCE_THRESHOLD: f32 = 0.7;

/// Classification threshold every new person starts with.
pub const DEFAULT_CLASSIFICATION_THRESHOLD: f32 = 1.0 - DISTANCE_THRESHOLD;

/// Whether the gallery may be mutated while recognizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionMode {
    /// Recognize and annotate only.
    Inference,
    /// Recognize, enroll strangers and augment known persons.
    Enroll,
}

/// Tunables for admission. All values are inclusive of the documented direction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdmissionConfig {
    /// Required margin of confidence above the person's threshold.
    pub embedding_distance_tolerance: f32,
    /// Minimum face bounding box area, in frame pixels.
    pub min_face_pixels_tolerance: u64,
    /// Minimum Laplacian variance (higher = sharper).
    pub blurriness_tolerance: f64,
    /// Sample cap per person.
    pub max_faces_per_person: usize,
    /// Minimum seconds since the person's last admitted sample.
    pub last_image_sent_threshold_time: i64,
    /// Maximum landmark Procrustes distance to the canonical pose (lower = closer).
    pub procrustes_distance_threshold: f64,
    /// Whether the sharpness predicate is enforced.
    pub enforce_blurriness: bool,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            embedding_distance_tolerance: 0.1,
            min_face_pixels_tolerance: 60_000,
            blurriness_tolerance: 300.0,
            max_faces_per_person: 3,
            last_image_sent_threshold_time: 0,
            procrustes_distance_threshold: 0.3,
            enforce_blurriness: true,
        }
    }
}

/// Snapshot of the best gallery match for a candidate.
#[derive(Debug, Clone, PartialEq)]
pub struct GalleryMatch {
    pub global_id: String,
    pub name: String,
    pub sample_count: usize,
    pub classification_threshold: f32,
    pub last_image_time: i64,
    /// Cosine distance between the candidate and the person's average embedding.
    pub distance: f32,
}

impl GalleryMatch {
    pub fn confidence(&self) -> f32 {
        1.0 - self.distance
    }

    /// Whether the match is close enough to name the candidate as this person.
    ///
    /// Gated on the global default, not the person's calibrated threshold;
    /// the latter only gates augmentation and reaches 1.0 for the tightest
    /// cluster.
    pub fn is_recognized(&self) -> bool {
        self.confidence() > DEFAULT_CLASSIFICATION_THRESHOLD
    }
}

/// A face detection that reached the policy.
pub struct Candidate<'a> {
    pub embedding: Option<&'a Embedding>,
    pub bbox: BoundingBox,
    pub landmarks: Option<Landmarks>,
    pub frame_width: u32,
    pub frame_height: u32,
    pub track_id: Option<u64>,
    /// Epoch seconds at decision time.
    pub now: i64,
    pub sharpness: &'a dyn Sharpness,
}

/// What the caller should do with the gallery.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// Write the image, then create a new person from the candidate.
    Create,
    /// Write the image, then append the candidate as a sample of `person_id`.
    Augment { person_id: String },
    Ignore,
}

/// Identity the candidate's track should be bound to.
#[derive(Debug, Clone, PartialEq)]
pub enum TrackBinding {
    Person(String),
    /// The person about to be created by a [`Decision::Create`].
    Created,
    Stranger,
}

/// Augmentation predicate that failed, in evaluation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    SampleCap,
    Confidence,
    Cadence,
    PixelArea,
    Pose,
    Blur,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Verdict {
    pub decision: Decision,
    pub annotation: Option<Classification>,
    pub binding: Option<TrackBinding>,
    pub rejection: Option<Rejection>,
}

impl Verdict {
    fn skip() -> Self {
        Self {
            decision: Decision::Ignore,
            annotation: None,
            binding: None,
            rejection: None,
        }
    }
}

/// Annotation for a candidate given its nearest gallery person.
///
/// An unrecognized nearest person still contributes its confidence to the
/// `Unknown` label; only an empty gallery yields confidence 1.
pub fn annotation_for(nearest: Option<&GalleryMatch>) -> Classification {
    match nearest {
        Some(m) if m.is_recognized() => Classification::face_recon(m.name.clone(), m.confidence()),
        Some(m) => Classification::face_recon(UNKNOWN_NAME, m.confidence()),
        None => Classification::face_recon(UNKNOWN_NAME, 1.0),
    }
}

/// Evaluate the augmentation predicates (a)–(f) in order, short-circuiting.
///
/// Later predicates are more expensive; sharpness in particular may convert
/// the face crop to grayscale.
pub fn check_augment(
    candidate: &Candidate<'_>,
    best: &GalleryMatch,
    config: &AdmissionConfig,
) -> Result<(), Rejection> {
    if best.sample_count >= config.max_faces_per_person {
        return Err(Rejection::SampleCap);
    }
    if best.confidence() <= best.classification_threshold + config.embedding_distance_tolerance {
        return Err(Rejection::Confidence);
    }
    if candidate.now - best.last_image_time <= config.last_image_sent_threshold_time {
        return Err(Rejection::Cadence);
    }
    let area = quality::pixel_area(&candidate.bbox, candidate.frame_width, candidate.frame_height);
    if area <= config.min_face_pixels_tolerance {
        return Err(Rejection::PixelArea);
    }
    let procrustes = candidate
        .landmarks
        .as_ref()
        .map(|lm| {
            quality::procrustes_distance(lm, &candidate.bbox, candidate.frame_width, candidate.frame_height)
        })
        .unwrap_or(f64::INFINITY);
    if procrustes >= config.procrustes_distance_threshold {
        return Err(Rejection::Pose);
    }
    if config.enforce_blurriness && candidate.sharpness.sharpness() <= config.blurriness_tolerance {
        return Err(Rejection::Blur);
    }
    Ok(())
}

/// Decide what to do with one candidate.
///
/// `nearest` is the closest gallery person whether or not it is recognized.
pub fn decide(
    candidate: &Candidate<'_>,
    nearest: Option<&GalleryMatch>,
    tracks: &TrackMap,
    mode: AdmissionMode,
    config: &AdmissionConfig,
) -> Verdict {
    if candidate.embedding.is_none() {
        return Verdict::skip();
    }
    if candidate.track_id.is_some_and(|id| tracks.is_bound(id)) {
        return Verdict::skip();
    }

    let annotation = Some(annotation_for(nearest));
    let best = nearest.filter(|m| m.is_recognized());

    // Without a track id there is nothing to key at-most-once admission on.
    if candidate.track_id.is_none() {
        return Verdict {
            decision: Decision::Ignore,
            annotation,
            binding: None,
            rejection: None,
        };
    }

    if mode == AdmissionMode::Inference {
        let binding = match best {
            Some(m) => TrackBinding::Person(m.global_id.clone()),
            None => TrackBinding::Stranger,
        };
        return Verdict {
            decision: Decision::Ignore,
            annotation,
            binding: Some(binding),
            rejection: None,
        };
    }

    let Some(best) = best else {
        return Verdict {
            decision: Decision::Create,
            annotation,
            binding: Some(TrackBinding::Created),
            rejection: None,
        };
    };

    let binding = Some(TrackBinding::Person(best.global_id.clone()));
    match check_augment(candidate, best, config) {
        Ok(()) => Verdict {
            decision: Decision::Augment { person_id: best.global_id.clone() },
            annotation,
            binding,
            rejection: None,
        },
        Err(rejection) => Verdict {
            decision: Decision::Ignore,
            annotation,
            binding,
            rejection: Some(rejection),
        },
    }
}
