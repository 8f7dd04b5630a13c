//! facegallery-core — Face gallery domain types and decision logic.
//!
//! Detection records as delivered by the upstream pipeline, landmark and
//! sharpness quality metrics, two-component PCA, the track-to-identity map
//! and the pure admission policy.

pub mod pca;
pub mod policy;
pub mod quality;
pub mod track;
pub mod types;

pub use policy::{
    AdmissionConfig, AdmissionMode, Candidate, Decision, GalleryMatch, Rejection, TrackBinding,
    Verdict, DEFAULT_CLASSIFICATION_THRESHOLD, DISTANCE_THRESHOLD,
};
pub use quality::Sharpness;
pub use track::{TrackIdentity, TrackMap};
pub use types::{
    BoundingBox, Classification, Detection, Embedding, Landmarks, EMBEDDING_DIM, FACE_RECON_KIND,
    UNKNOWN_NAME,
};
