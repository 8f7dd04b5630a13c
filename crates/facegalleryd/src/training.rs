//! Offline enrollment from a labeled directory tree.
//!
//! `train_dir/<name>/<image>`: every subdirectory is one person, named after
//! the directory. Each image is run through a [`FaceAnalyzer`]; the first
//! face with an embedding is cropped, written through the image pool and
//! committed without admission checks.

use crate::wire::{self, WireError};
use facegallery_core::Detection;
use facegallery_media::{crop_face, Frame, FrameError, ImageJob, ImageWriterPool};
use facegallery_store::{GalleryStore, StoreError};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncRead;
use tokio::process::Command;
use tokio::sync::oneshot;
use uuid::Uuid;

/// Image extensions considered for training, lowercase.
const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "bmp"];

#[derive(Error, Debug)]
pub enum TrainingError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("analyzer stream: {0}")]
    Wire(#[from] WireError),
    #[error("analyzer frame: {0}")]
    Frame(#[from] FrameError),
    #[error("invalid analyzer command: {0:?}")]
    InvalidCommand(String),
    #[error("analyzer failed: {0}")]
    Analyzer(String),
}

/// One analyzed frame with a face carrying an embedding.
pub struct AnalyzedFrame {
    pub frame: Frame,
    pub detections: Vec<Detection>,
}

impl AnalyzedFrame {
    fn first_face(&self) -> Option<&Detection> {
        self.detections.iter().find(|d| d.is_face() && d.has_embedding())
    }
}

/// Runs the upstream detection and embedding pipeline on a still image.
#[allow(async_fn_in_trait)]
pub trait FaceAnalyzer {
    /// First analyzed frame of `image` that contains a face with an
    /// embedding, or `None` if none arrived within `timeout`.
    async fn analyze(&mut self, image: &Path, timeout: Duration) -> Result<Option<AnalyzedFrame>, TrainingError>;
}

/// Spawns the configured analyzer command per image and reads framed
/// detection messages from its stdout.
#[derive(Debug, Clone)]
pub struct CommandAnalyzer {
    program: String,
    args: Vec<String>,
    repeat: u32,
}

impl CommandAnalyzer {
    /// Parse a whitespace-separated command template. `{image}` and
    /// `{repeat}` are substituted per run.
    pub fn from_template(template: &str, repeat: u32) -> Result<Self, TrainingError> {
        let mut parts = template.split_whitespace().map(str::to_string);
        let program = parts
            .next()
            .ok_or_else(|| TrainingError::InvalidCommand(template.to_string()))?;
        Ok(Self {
            program,
            args: parts.collect(),
            repeat,
        })
    }

    fn command_for(&self, image: &Path) -> Command {
        let image = image.to_string_lossy();
        let repeat = self.repeat.to_string();
        let substitute = |s: &str| s.replace("{image}", &image).replace("{repeat}", &repeat);

        let mut cmd = Command::new(substitute(&self.program));
        cmd.args(self.args.iter().map(|a| substitute(a)))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

impl FaceAnalyzer for CommandAnalyzer {
    async fn analyze(&mut self, image: &Path, timeout: Duration) -> Result<Option<AnalyzedFrame>, TrainingError> {
        let mut child = self.command_for(image).spawn()?;
        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| TrainingError::Analyzer("stdout not captured".into()))?;

        let found = tokio::time::timeout(timeout, first_face_frame(&mut stdout)).await;
        if let Err(e) = child.kill().await {
            tracing::debug!(error = %e, "analyzer already exited");
        }
        match found {
            Ok(result) => result,
            Err(_) => {
                tracing::debug!(image = %image.display(), "analyzer timed out");
                Ok(None)
            }
        }
    }
}

async fn first_face_frame<R>(reader: &mut R) -> Result<Option<AnalyzedFrame>, TrainingError>
where
    R: AsyncRead + Unpin,
{
    while let Some((header, data)) = wire::read_frame(reader).await? {
        if header.detections.iter().any(|d| d.is_face() && d.has_embedding()) {
            let frame = Frame::new(header.caps, data)?;
            return Ok(Some(AnalyzedFrame {
                frame,
                detections: header.detections,
            }));
        }
    }
    Ok(None)
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TrainingReport {
    pub persons_created: usize,
    pub samples_added: usize,
    /// Names skipped because a person with that name already existed.
    pub skipped_names: Vec<String>,
    pub images_without_face: usize,
    pub failed_images: usize,
}

pub struct TrainingDriver<A> {
    store: Arc<GalleryStore>,
    writer: Arc<ImageWriterPool>,
    analyzer: A,
    train_dir: PathBuf,
    bundled_dir: Option<PathBuf>,
    frame_timeout: Duration,
    write_timeout: Duration,
    processed_files: HashSet<PathBuf>,
    /// name → global id of the person created for it.
    processed_names: HashMap<String, String>,
}

impl<A: FaceAnalyzer> TrainingDriver<A> {
    pub fn new(store: Arc<GalleryStore>, writer: Arc<ImageWriterPool>, analyzer: A, train_dir: PathBuf) -> Self {
        Self {
            store,
            writer,
            analyzer,
            train_dir,
            bundled_dir: None,
            frame_timeout: Duration::from_secs(2),
            write_timeout: Duration::from_secs(10),
            processed_files: HashSet::new(),
            processed_names: HashMap::new(),
        }
    }

    /// Tree copied into `train_dir` when it is missing or empty.
    pub fn bundled_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.bundled_dir = dir;
        self
    }

    pub fn frame_timeout(mut self, timeout: Duration) -> Self {
        self.frame_timeout = timeout;
        self
    }

    pub fn processed_files(&self) -> &HashSet<PathBuf> {
        &self.processed_files
    }

    pub fn processed_names(&self) -> &HashMap<String, String> {
        &self.processed_names
    }

    pub async fn run(&mut self) -> Result<TrainingReport, TrainingError> {
        let mut report = TrainingReport::default();
        self.prepare_train_dir()?;
        if !self.train_dir.is_dir() {
            tracing::warn!(dir = %self.train_dir.display(), "no training directory");
            println!("Training completed");
            return Ok(report);
        }
        println!("Training on images from {}", self.train_dir.display());

        for person_dir in sorted_entries(&self.train_dir)?.into_iter().filter(|p| p.is_dir()) {
            let Some(name) = person_dir.file_name().map(|n| n.to_string_lossy().into_owned()) else {
                continue;
            };
            if !self.processed_names.contains_key(&name) && self.store.get_by_name(&name)?.is_some() {
                println!("Skipping person: {name} (already in gallery)");
                report.skipped_names.push(name);
                continue;
            }
            println!("Processing person: {name}");

            for image in sorted_entries(&person_dir)?.into_iter().filter(|p| is_image(p)) {
                if self.processed_files.contains(&image) {
                    continue;
                }
                println!("Processing image: {}", image.display());
                self.train_image(&name, &image, &mut report).await;
            }
        }

        println!("Training completed");
        tracing::info!(
            created = report.persons_created,
            samples = report.samples_added,
            skipped = report.skipped_names.len(),
            without_face = report.images_without_face,
            failed = report.failed_images,
            "training completed"
        );
        Ok(report)
    }

    async fn train_image(&mut self, name: &str, image: &Path, report: &mut TrainingReport) {
        let analyzed = match self.analyzer.analyze(image, self.frame_timeout).await {
            Ok(Some(analyzed)) => analyzed,
            Ok(None) => {
                tracing::warn!(image = %image.display(), "no face found");
                report.images_without_face += 1;
                return;
            }
            Err(e) => {
                tracing::warn!(image = %image.display(), error = %e, "analysis failed");
                report.failed_images += 1;
                return;
            }
        };
        let Some(face) = analyzed.first_face() else {
            report.images_without_face += 1;
            return;
        };
        let Some(embedding) = face.embedding().cloned() else {
            report.images_without_face += 1;
            return;
        };
        let crop = match analyzed.frame.to_rgb() {
            Ok(rgb) => crop_face(&rgb, &face.bbox),
            Err(e) => {
                tracing::warn!(image = %image.display(), error = %e, "frame conversion failed");
                report.failed_images += 1;
                return;
            }
        };

        let timestamp = chrono::Utc::now().timestamp();
        let existing = self.processed_names.get(name).cloned();
        let (global_id, is_new) = match existing {
            Some(id) => (id, false),
            None => (Uuid::new_v4().to_string(), true),
        };

        let store = Arc::clone(&self.store);
        let id = global_id.clone();
        let person_name = name.to_string();
        let (done_tx, done_rx) = oneshot::channel();
        let job = ImageJob::new(crop, self.store.new_sample_path("jpeg")).on_complete(move |result| {
            let committed = result.map_err(|e| e.to_string()).and_then(|path| {
                let outcome = if is_new {
                    store.create_person_with_id(&id, &embedding, &path, timestamp, Some(&person_name))
                } else {
                    store.insert_sample(&id, &embedding, &path, timestamp)
                };
                outcome.map(drop).map_err(|e| {
                    if let Err(e) = std::fs::remove_file(&path) {
                        tracing::warn!(path = %path.display(), error = %e, "failed to remove orphaned sample image");
                    }
                    e.to_string()
                })
            });
            if let Err(e) = &committed {
                tracing::error!(global_id = %id, error = %e, "training sample not stored");
            }
            let _ = done_tx.send(committed.is_ok());
        });

        if let Err(e) = self.writer.try_submit(job) {
            tracing::error!(image = %image.display(), error = %e, "could not queue training sample");
            report.failed_images += 1;
            return;
        }

        // Wait for the commit so the next image of this person sees it.
        let committed = match tokio::time::timeout(self.write_timeout, done_rx).await {
            Ok(Ok(committed)) => committed,
            Ok(Err(_)) => {
                tracing::warn!(image = %image.display(), "training sample dropped by the writer");
                false
            }
            Err(_) => {
                tracing::warn!(image = %image.display(), "training sample not committed in time");
                false
            }
        };
        if !committed {
            report.failed_images += 1;
            return;
        }
        if is_new {
            println!("New person added: {name} ({global_id})");
            self.processed_names.insert(name.to_string(), global_id);
            report.persons_created += 1;
        } else {
            println!("Adding face to: {name}");
            report.samples_added += 1;
        }
        self.processed_files.insert(image.to_path_buf());
    }

    fn prepare_train_dir(&self) -> Result<(), TrainingError> {
        let empty = match std::fs::read_dir(&self.train_dir) {
            Ok(mut entries) => entries.next().is_none(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => true,
            Err(e) => return Err(e.into()),
        };
        if !empty {
            return Ok(());
        }
        match &self.bundled_dir {
            Some(bundled) if bundled.is_dir() => {
                let copied = copy_tree(bundled, &self.train_dir)?;
                tracing::info!(
                    from = %bundled.display(),
                    to = %self.train_dir.display(),
                    files = copied,
                    "seeded training directory"
                );
            }
            Some(bundled) => {
                tracing::warn!(dir = %bundled.display(), "bundled training directory not found")
            }
            None => {}
        }
        Ok(())
    }
}

fn sorted_entries(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut entries = std::fs::read_dir(dir)?
        .map(|e| e.map(|e| e.path()))
        .collect::<Result<Vec<_>, _>>()?;
    entries.sort();
    Ok(entries)
}

fn is_image(path: &Path) -> bool {
    path.is_file()
        && path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
}

/// Recursively copy `from` into `to`. Returns the number of files copied.
fn copy_tree(from: &Path, to: &Path) -> std::io::Result<usize> {
    std::fs::create_dir_all(to)?;
    let mut copied = 0;
    for entry in std::fs::read_dir(from)? {
        let entry = entry?;
        let target = to.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copied += copy_tree(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
            copied += 1;
        }
    }
    Ok(copied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::FrameHeader;
    use facegallery_core::{BoundingBox, Embedding};
    use facegallery_media::{Caps, PixelFormat, WriterConfig};
    use std::fs;
    use tempfile::TempDir;

    /// Returns a face whose embedding is derived from the image file name;
    /// files named `noface*` yield nothing and `short*` a two-dimensional
    /// embedding.
    struct FakeAnalyzer {
        calls: Vec<PathBuf>,
    }

    fn analyzed(embedding: Vec<f32>) -> AnalyzedFrame {
        let frame = Frame::new(
            Caps {
                format: PixelFormat::Rgb,
                width: 8,
                height: 8,
            },
            vec![128; 8 * 8 * 3],
        )
        .unwrap();
        AnalyzedFrame {
            frame,
            detections: vec![Detection {
                label: "face".into(),
                bbox: BoundingBox { xmin: 0.25, ymin: 0.25, width: 0.5, height: 0.5 },
                confidence: 0.9,
                track_id: None,
                landmarks: None,
                embeddings: vec![Embedding::new(embedding)],
                classifications: vec![],
            }],
        }
    }

    impl FaceAnalyzer for FakeAnalyzer {
        async fn analyze(&mut self, image: &Path, _timeout: Duration) -> Result<Option<AnalyzedFrame>, TrainingError> {
            self.calls.push(image.to_path_buf());
            let stem = image.file_stem().unwrap().to_string_lossy().into_owned();
            if stem.starts_with("noface") {
                return Ok(None);
            }
            if stem.starts_with("short") {
                return Ok(Some(analyzed(vec![1.0, 0.0])));
            }
            let seed = stem.bytes().map(|b| b as f32).sum::<f32>();
            Ok(Some(analyzed(vec![seed.sin(), seed.cos(), 1.0])))
        }
    }

    struct Fixture {
        dir: TempDir,
        store: Arc<GalleryStore>,
        writer: Arc<ImageWriterPool>,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(GalleryStore::open(dir.path().join("database"), dir.path().join("faces")).unwrap());
        let writer = Arc::new(ImageWriterPool::start(WriterConfig::default()).unwrap());
        Fixture { dir, store, writer }
    }

    fn touch(path: &Path) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, b"img").unwrap();
    }

    impl Fixture {
        fn driver(&self, train_dir: PathBuf) -> TrainingDriver<FakeAnalyzer> {
            TrainingDriver::new(
                Arc::clone(&self.store),
                Arc::clone(&self.writer),
                FakeAnalyzer { calls: vec![] },
                train_dir,
            )
        }
    }

    #[tokio::test]
    async fn test_training_on_directory() {
        let f = fixture();
        let train = f.dir.path().join("train");
        touch(&train.join("Alice/a1.jpg"));
        touch(&train.join("Alice/a2.jpg"));
        touch(&train.join("Bob/b1.jpg"));
        touch(&train.join("Bob/notes.txt"));

        let mut driver = f.driver(train.clone());
        let report = driver.run().await.unwrap();
        assert_eq!(report.persons_created, 2);
        assert_eq!(report.samples_added, 1);

        let alice = f.store.get_by_name("Alice").unwrap().unwrap();
        let bob = f.store.get_by_name("Bob").unwrap().unwrap();
        assert_eq!(alice.faces.len(), 2);
        assert_eq!(bob.faces.len(), 1);
        assert!(alice.faces.iter().all(|s| s.image_path.exists()));

        let expected: HashSet<PathBuf> = [
            train.join("Alice/a1.jpg"),
            train.join("Alice/a2.jpg"),
            train.join("Bob/b1.jpg"),
        ]
        .into_iter()
        .collect();
        assert_eq!(driver.processed_files(), &expected);
        assert_eq!(driver.processed_names()["Alice"], alice.global_id);
        assert_eq!(driver.analyzer.calls.len(), 3);

        // A second run touches nothing.
        let report = driver.run().await.unwrap();
        assert_eq!(report.persons_created + report.samples_added, 0);
        assert_eq!(driver.analyzer.calls.len(), 3);
        assert_eq!(f.store.count().unwrap(), 2);
    }

    #[tokio::test]
    async fn test_existing_name_is_skipped() {
        let f = fixture();
        let img = f.store.new_sample_path("jpeg");
        fs::write(&img, b"x").unwrap();
        f.store
            .create_person(&Embedding::new(vec![1.0, 0.0, 0.0]), &img, 0, Some("Alice"))
            .unwrap();

        let train = f.dir.path().join("train");
        touch(&train.join("Alice/a1.jpg"));
        let mut driver = f.driver(train);
        let report = driver.run().await.unwrap();
        assert_eq!(report.skipped_names, vec!["Alice".to_string()]);
        assert_eq!(f.store.get_by_name("Alice").unwrap().unwrap().faces.len(), 1);
    }

    #[tokio::test]
    async fn test_image_without_face_moves_on() {
        let f = fixture();
        let train = f.dir.path().join("train");
        touch(&train.join("Carol/noface.png"));
        touch(&train.join("Carol/c2.png"));

        let mut driver = f.driver(train.clone());
        let report = driver.run().await.unwrap();
        assert_eq!(report.images_without_face, 1);
        assert_eq!(report.persons_created, 1);
        assert!(!driver.processed_files().contains(&train.join("Carol/noface.png")));
        assert_eq!(f.store.get_by_name("Carol").unwrap().unwrap().faces.len(), 1);
    }

    #[tokio::test]
    async fn test_failed_append_is_not_recorded() {
        let f = fixture();
        let train = f.dir.path().join("train");
        touch(&train.join("Erin/e1.jpg"));
        touch(&train.join("Erin/short2.jpg"));

        let mut driver = f.driver(train.clone());
        let report = driver.run().await.unwrap();
        assert_eq!(report.persons_created, 1);
        assert_eq!(report.samples_added, 0);
        assert_eq!(report.failed_images, 1);
        assert!(driver.processed_files().contains(&train.join("Erin/e1.jpg")));
        assert!(!driver.processed_files().contains(&train.join("Erin/short2.jpg")));

        let erin = f.store.get_by_name("Erin").unwrap().unwrap();
        assert_eq!(erin.faces.len(), 1);
        // The image written for the rejected sample is cleaned up.
        assert_eq!(fs::read_dir(f.store.samples_dir()).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn test_empty_train_dir_is_seeded_from_bundle() {
        let f = fixture();
        let bundled = f.dir.path().join("bundled");
        touch(&bundled.join("Dave/d1.JPG"));
        let train = f.dir.path().join("train");

        let mut driver = f.driver(train.clone()).bundled_dir(Some(bundled));
        let report = driver.run().await.unwrap();
        assert!(train.join("Dave/d1.JPG").exists());
        assert_eq!(report.persons_created, 1);
        assert!(f.store.get_by_name("Dave").unwrap().is_some());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_analyzer_reads_framed_stdout() {
        let dir = TempDir::new().unwrap();
        let caps = Caps { format: PixelFormat::Rgb, width: 2, height: 2 };
        let no_face = FrameHeader { seq: 0, caps, frame_len: 12, detections: vec![] };
        let with_face = FrameHeader {
            seq: 1,
            caps,
            frame_len: 12,
            detections: analyzed(vec![1.0, 2.0]).detections,
        };
        let mut stream = Vec::new();
        wire::write_frame(&mut stream, &no_face, &[0u8; 12]).await.unwrap();
        wire::write_frame(&mut stream, &with_face, &[7u8; 12]).await.unwrap();
        let capture = dir.path().join("capture.bin");
        fs::write(&capture, &stream).unwrap();

        let mut analyzer = CommandAnalyzer::from_template("cat {image}", 30).unwrap();
        let found = analyzer
            .analyze(&capture, Duration::from_secs(5))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.frame.data(), &[7u8; 12][..]);
        assert_eq!(found.first_face().unwrap().embeddings[0].values, vec![1.0, 2.0]);

        let empty = dir.path().join("empty.bin");
        fs::write(&empty, b"").unwrap();
        assert!(analyzer.analyze(&empty, Duration::from_secs(5)).await.unwrap().is_none());
    }

    #[test]
    fn test_command_template() {
        assert!(matches!(
            CommandAnalyzer::from_template("   ", 30),
            Err(TrainingError::InvalidCommand(_))
        ));
        let analyzer = CommandAnalyzer::from_template("detect --input {image} --repeat {repeat}", 30).unwrap();
        let cmd = analyzer.command_for(Path::new("/tmp/a.jpg"));
        let args: Vec<_> = cmd.as_std().get_args().map(|a| a.to_string_lossy().into_owned()).collect();
        assert_eq!(args, vec!["--input", "/tmp/a.jpg", "--repeat", "30"]);
    }
}
