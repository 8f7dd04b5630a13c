//! facegallery-store — Persistent person gallery.
//!
//! SQLite-backed persons and samples, nearest-person search (linear scan or
//! an in-memory cosine index for large galleries), threshold calibration
//! and the review surface used by the daemon's D-Bus service and the CLI.

pub mod error;
pub mod index;
pub mod review;
pub mod store;

pub use error::StoreError;
pub use index::CosineIndex;
pub use review::{
    ConflictResolver, DeclineConflicts, PersonSummary, ProjectedPerson, Projection, ReviewAction,
    ReviewReport, SampleEdit, SampleSummary, Stats,
};
pub use store::{Face, GalleryStore, Metric, Person, SearchHit, DB_FILE_NAME, INDEX_MIN_PERSONS};
