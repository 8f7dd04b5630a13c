//! Per-frame recognition and admission.
//!
//! Runs on the engine thread. For every face detection: search the gallery,
//! run the admission policy, queue the face crop for writing when a sample
//! is admitted, and attach the `face_recon` annotation. The store mutation
//! is committed by the writer's completion callback once the image is on
//! disk.

use facegallery_core::policy::{self, Candidate, Decision, GalleryMatch, TrackBinding};
use facegallery_core::{
    AdmissionConfig, AdmissionMode, BoundingBox, Classification, Detection, Sharpness, TrackIdentity,
    TrackMap,
};
use facegallery_media::{crop_face, CropSharpness, Frame, ImageJob, ImageWriterPool, SubmitError};
use facegallery_store::{GalleryStore, Person, StoreError};
use image::RgbImage;
use std::cell::OnceCell;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use uuid::Uuid;

/// Extension of admitted sample images.
const SAMPLE_EXTENSION: &str = "jpeg";

#[derive(Debug, Clone)]
pub struct CallbackSettings {
    pub mode: AdmissionMode,
    pub admission: AdmissionConfig,
    pub warmup_frames: u64,
    pub track_idle_frames: u64,
}

impl CallbackSettings {
    pub fn new(mode: AdmissionMode) -> Self {
        Self {
            mode,
            admission: AdmissionConfig::default(),
            warmup_frames: 0,
            track_idle_frames: 300,
        }
    }
}

/// What happened on one frame.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FrameSummary {
    pub faces: usize,
    pub annotated: usize,
    pub created: usize,
    pub augmented: usize,
    /// Admissions dropped because the image could not be queued.
    pub dropped: usize,
    pub rejected: usize,
}

pub type Clock = Box<dyn Fn() -> i64 + Send>;

pub struct FrameCallback {
    store: Arc<GalleryStore>,
    writer: Arc<ImageWriterPool>,
    tracks: TrackMap,
    /// Last annotation of each bound track, re-attached on later frames.
    labels: HashMap<u64, Classification>,
    settings: CallbackSettings,
    clock: Clock,
}

impl FrameCallback {
    pub fn new(store: Arc<GalleryStore>, writer: Arc<ImageWriterPool>, settings: CallbackSettings) -> Self {
        Self {
            store,
            writer,
            tracks: TrackMap::new(),
            labels: HashMap::new(),
            settings,
            clock: Box::new(|| chrono::Utc::now().timestamp()),
        }
    }

    /// Replace the epoch-seconds clock.
    pub fn with_clock<F>(mut self, clock: F) -> Self
    where
        F: Fn() -> i64 + Send + 'static,
    {
        self.clock = Box::new(clock);
        self
    }

    pub fn tracks(&self) -> &TrackMap {
        &self.tracks
    }

    /// Process the detections of frame `seq` in place.
    ///
    /// Never fails: store, conversion and queue errors are logged and the
    /// affected detection is left unadmitted.
    pub fn on_frame(&mut self, seq: u64, frame: &Frame, detections: &mut [Detection]) -> FrameSummary {
        let now = (self.clock)();
        let rgb: OnceCell<Option<RgbImage>> = OnceCell::new();
        let mut summary = FrameSummary::default();

        for detection in detections.iter_mut().filter(|d| d.is_face()) {
            summary.faces += 1;
            if detection.embeddings.len() > 1 {
                tracing::warn!(
                    seq,
                    track_id = ?detection.track_id,
                    count = detection.embeddings.len(),
                    "detection carries several embeddings; using the first"
                );
            }
            self.process(seq, now, frame, &rgb, detection, &mut summary);
            detection.embeddings.clear();
        }

        let expired = self.tracks.expire(seq, self.settings.track_idle_frames);
        if expired > 0 {
            self.labels.retain(|id, _| self.tracks.is_bound(*id));
            tracing::debug!(seq, expired, "idle tracks forgotten");
        }
        summary
    }

    fn process(
        &mut self,
        seq: u64,
        now: i64,
        frame: &Frame,
        rgb: &OnceCell<Option<RgbImage>>,
        detection: &mut Detection,
        summary: &mut FrameSummary,
    ) {
        let Some(embedding) = detection.embedding().cloned() else {
            return;
        };

        if let Some(track_id) = detection.track_id {
            let observed = self.tracks.observe(track_id, seq);
            if self.tracks.is_bound(track_id) {
                if let Some(label) = self.labels.get(&track_id) {
                    if detection.apply_classification(label.clone()) {
                        summary.annotated += 1;
                    }
                }
                return;
            }
            if observed <= self.settings.warmup_frames {
                tracing::trace!(seq, track_id, observed, "track warming up");
                return;
            }
        }

        let nearest = match self.store.search(&embedding) {
            Ok(hit) => hit
                .map(|hit| GalleryMatch {
                    sample_count: hit.person.num_samples(),
                    global_id: hit.person.global_id,
                    name: hit.person.name,
                    classification_threshold: hit.person.classification_threshold,
                    last_image_time: hit.person.last_image_time,
                    distance: hit.distance,
                }),
            Err(e) => {
                tracing::warn!(seq, error = %e, "gallery search failed");
                return;
            }
        };

        let face = FaceCrop::new(frame, rgb, detection.bbox);
        let candidate = Candidate {
            embedding: Some(&embedding),
            bbox: detection.bbox,
            landmarks: detection.landmarks,
            frame_width: frame.width(),
            frame_height: frame.height(),
            track_id: detection.track_id,
            now,
            sharpness: &face,
        };
        let verdict = policy::decide(
            &candidate,
            nearest.as_ref(),
            &self.tracks,
            self.settings.mode,
            &self.settings.admission,
        );
        if let Some(rejection) = verdict.rejection {
            tracing::debug!(seq, track_id = ?detection.track_id, ?rejection, "augmentation rejected");
            summary.rejected += 1;
        }

        let admitted = match &verdict.decision {
            Decision::Create => {
                let id = Uuid::new_v4().to_string();
                let global_id = id.clone();
                let embedding = embedding.clone();
                let queued = self.submit(&face, move |store, path| {
                    store.create_person_with_id(&global_id, &embedding, path, now, None)
                });
                if queued {
                    summary.created += 1;
                    Some(Some(id))
                } else {
                    None
                }
            }
            Decision::Augment { person_id } => {
                let person_id = person_id.clone();
                let embedding = embedding.clone();
                let queued = self.submit(&face, move |store, path| {
                    store.insert_sample(&person_id, &embedding, path, now)
                });
                if queued {
                    summary.augmented += 1;
                    Some(None)
                } else {
                    None
                }
            }
            Decision::Ignore => Some(None),
        };

        let Some(created_id) = admitted else {
            // Not bound, so a later frame of this track may retry.
            summary.dropped += 1;
            if let Some(annotation) = verdict.annotation {
                if detection.apply_classification(annotation) {
                    summary.annotated += 1;
                }
            }
            return;
        };

        if let (Some(track_id), Some(binding)) = (detection.track_id, verdict.binding) {
            match binding {
                TrackBinding::Person(id) => self.tracks.bind(track_id, TrackIdentity::Person(id), seq),
                TrackBinding::Created => {
                    if let Some(id) = created_id {
                        self.tracks.bind(track_id, TrackIdentity::Person(id), seq);
                    }
                }
                TrackBinding::Stranger => {
                    self.tracks.bind_stranger(track_id, seq);
                }
            }
            if let Some(annotation) = &verdict.annotation {
                self.labels.insert(track_id, annotation.clone());
            }
        }

        if let Some(annotation) = verdict.annotation {
            if detection.apply_classification(annotation) {
                summary.annotated += 1;
            }
        }
    }

    /// Queue the face crop. `commit` runs on a writer thread once the image
    /// is durable; if it fails the image is removed again.
    fn submit<F>(&self, face: &FaceCrop<'_>, commit: F) -> bool
    where
        F: FnOnce(&GalleryStore, &Path) -> Result<Person, StoreError> + Send + 'static,
    {
        let Some(crop) = face.image() else {
            tracing::warn!("face crop unavailable; admission dropped");
            return false;
        };
        let path = self.store.new_sample_path(SAMPLE_EXTENSION);
        let store = Arc::clone(&self.store);
        let job = ImageJob::new(crop.clone(), path).on_complete(move |result| match result {
            Ok(path) => match commit(&store, &path) {
                Ok(person) => tracing::info!(
                    global_id = %person.global_id,
                    name = %person.name,
                    samples = person.num_samples(),
                    "sample admitted"
                ),
                Err(e) => {
                    tracing::error!(path = %path.display(), error = %e, "failed to commit sample");
                    if let Err(e) = std::fs::remove_file(&path) {
                        tracing::warn!(path = %path.display(), error = %e, "failed to remove orphaned sample image");
                    }
                }
            },
            Err(e) => tracing::warn!(error = %e, "sample image write failed"),
        });

        match self.writer.try_submit(job) {
            Ok(()) => true,
            Err(SubmitError::Full) => {
                tracing::warn!("image queue full; admission dropped");
                false
            }
            Err(SubmitError::Closed) => {
                tracing::warn!("image writer stopped; admission dropped");
                false
            }
        }
    }
}

impl Drop for FrameCallback {
    fn drop(&mut self) {
        self.tracks.clear();
        self.labels.clear();
    }
}

/// Face crop of one detection, computed on first use.
///
/// The frame is converted to RGB at most once per frame, shared through
/// `rgb` by every detection of that frame.
struct FaceCrop<'a> {
    frame: &'a Frame,
    rgb: &'a OnceCell<Option<RgbImage>>,
    bbox: BoundingBox,
    crop: OnceCell<Option<RgbImage>>,
    sharpness: OnceCell<f64>,
}

impl<'a> FaceCrop<'a> {
    fn new(frame: &'a Frame, rgb: &'a OnceCell<Option<RgbImage>>, bbox: BoundingBox) -> Self {
        Self {
            frame,
            rgb,
            bbox,
            crop: OnceCell::new(),
            sharpness: OnceCell::new(),
        }
    }

    fn image(&self) -> Option<&RgbImage> {
        self.crop
            .get_or_init(|| {
                let rgb = self.rgb.get_or_init(|| match self.frame.to_rgb() {
                    Ok(image) => Some(image),
                    Err(e) => {
                        tracing::warn!(error = %e, "frame conversion failed");
                        None
                    }
                });
                rgb.as_ref().map(|image| crop_face(image, &self.bbox))
            })
            .as_ref()
    }
}

impl Sharpness for FaceCrop<'_> {
    fn sharpness(&self) -> f64 {
        *self.sharpness.get_or_init(|| {
            self.image()
                .map(|crop| CropSharpness::new(crop).sharpness())
                .unwrap_or(0.0)
        })
    }
}
