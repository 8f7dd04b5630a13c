//! Image writer pool: a bounded FIFO of encode-and-save jobs served by
//! dedicated worker threads.
//!
//! The frame callback must never block on disk I/O, so it hands crops to
//! this pool with [`ImageWriterPool::try_submit`] and gets a `Full` error
//! instead of waiting when the queue is saturated. Each job carries a
//! completion callback that runs on the worker after the file is durable.

use crossbeam_channel::{Receiver, Sender, TrySendError};
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::PngEncoder;
use image::RgbImage;
use std::fs::{self, File};
use std::io::BufWriter;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use thiserror::Error;

/// JPEG quality used for sample images.
pub const JPEG_QUALITY: u8 = 85;

#[derive(Error, Debug)]
pub enum WriterError {
    #[error("failed to encode {path}: {source}")]
    Encode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("unsupported image extension: {0}")]
    UnsupportedExtension(PathBuf),
    #[error("failed to spawn writer thread: {0}")]
    Spawn(#[source] std::io::Error),
}

/// Why a job was not accepted.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitError {
    #[error("image writer queue is full")]
    Full,
    #[error("image writer pool is shut down")]
    Closed,
}

/// Runs on the worker thread once the job finished, successfully or not.
pub type Completion = Box<dyn FnOnce(Result<PathBuf, WriterError>) + Send + 'static>;

/// One image to encode and save.
pub struct ImageJob {
    pub image: RgbImage,
    pub path: PathBuf,
    pub on_complete: Option<Completion>,
}

impl ImageJob {
    pub fn new(image: RgbImage, path: impl Into<PathBuf>) -> Self {
        Self {
            image,
            path: path.into(),
            on_complete: None,
        }
    }

    pub fn on_complete<F>(mut self, f: F) -> Self
    where
        F: FnOnce(Result<PathBuf, WriterError>) + Send + 'static,
    {
        self.on_complete = Some(Box::new(f));
        self
    }
}

#[derive(Debug, Clone)]
pub struct WriterConfig {
    pub max_workers: usize,
    pub queue_capacity: usize,
    pub jpeg_quality: u8,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            max_workers: 1,
            queue_capacity: 64,
            jpeg_quality: JPEG_QUALITY,
        }
    }
}

/// Count of accepted jobs that have not completed yet.
#[derive(Default)]
struct Pending {
    count: Mutex<usize>,
    idle: Condvar,
}

impl Pending {
    fn add(&self) {
        *self.count.lock().unwrap_or_else(|e| e.into_inner()) += 1;
    }

    fn done(&self) {
        let mut count = self.count.lock().unwrap_or_else(|e| e.into_inner());
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.idle.notify_all();
        }
    }

    fn get(&self) -> usize {
        *self.count.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn wait_idle(&self, timeout: Duration) -> bool {
        let count = self.count.lock().unwrap_or_else(|e| e.into_inner());
        let (count, _) = self
            .idle
            .wait_timeout_while(count, timeout, |c| *c > 0)
            .unwrap_or_else(|e| e.into_inner());
        *count == 0
    }
}

/// Fixed-size pool of image writer threads.
pub struct ImageWriterPool {
    tx: Mutex<Option<Sender<Option<ImageJob>>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    pending: Arc<Pending>,
}

impl ImageWriterPool {
    /// Start `config.max_workers` threads (at least one).
    pub fn start(config: WriterConfig) -> Result<Self, WriterError> {
        let (tx, rx) = crossbeam_channel::bounded::<Option<ImageJob>>(config.queue_capacity.max(1));
        let pending = Arc::new(Pending::default());

        let mut workers = Vec::new();
        for index in 0..config.max_workers.max(1) {
            let rx = rx.clone();
            let pending = Arc::clone(&pending);
            let quality = config.jpeg_quality;
            let handle = std::thread::Builder::new()
                .name(format!("facegallery-writer-{index}"))
                .spawn(move || worker_loop(index, rx, pending, quality))
                .map_err(WriterError::Spawn)?;
            workers.push(handle);
        }

        tracing::info!(
            workers = workers.len(),
            capacity = config.queue_capacity,
            "image writer pool started"
        );

        Ok(Self {
            tx: Mutex::new(Some(tx)),
            workers: Mutex::new(workers),
            pending,
        })
    }

    /// Enqueue a job without blocking.
    pub fn try_submit(&self, job: ImageJob) -> Result<(), SubmitError> {
        let guard = self.tx.lock().unwrap_or_else(|e| e.into_inner());
        let tx = guard.as_ref().ok_or(SubmitError::Closed)?;

        self.pending.add();
        match tx.try_send(Some(job)) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                self.pending.done();
                Err(SubmitError::Full)
            }
            Err(TrySendError::Disconnected(_)) => {
                self.pending.done();
                Err(SubmitError::Closed)
            }
        }
    }

    /// Number of accepted jobs not yet completed.
    pub fn pending(&self) -> usize {
        self.pending.get()
    }

    /// Wait until every accepted job has completed.
    ///
    /// Returns `false` if jobs were still outstanding when `timeout` elapsed.
    pub fn drain(&self, timeout: Duration) -> bool {
        self.pending.wait_idle(timeout)
    }

    /// Stop accepting jobs, let workers finish the queue, and join them.
    ///
    /// Workers still running after `timeout` are detached and keep running
    /// until their current job completes. Returns the number of detached
    /// workers. Calling this twice is harmless.
    pub fn shutdown(&self, timeout: Duration) -> usize {
        let deadline = Instant::now() + timeout;
        let Some(tx) = self.tx.lock().unwrap_or_else(|e| e.into_inner()).take() else {
            return 0;
        };
        let workers: Vec<JoinHandle<()>> =
            std::mem::take(&mut *self.workers.lock().unwrap_or_else(|e| e.into_inner()));

        for _ in 0..workers.len() {
            if tx.send_deadline(None, deadline).is_err() {
                break;
            }
        }
        drop(tx);

        let mut detached = 0;
        for handle in workers {
            while !handle.is_finished() && Instant::now() < deadline {
                std::thread::sleep(Duration::from_millis(10));
            }
            if handle.is_finished() {
                if handle.join().is_err() {
                    tracing::error!("image writer thread panicked");
                }
            } else {
                detached += 1;
            }
        }

        if detached > 0 {
            tracing::error!(
                detached,
                pending = self.pending.get(),
                "image writer workers did not exit in time; detaching"
            );
        } else {
            tracing::info!("image writer pool stopped");
        }
        detached
    }
}

impl Drop for ImageWriterPool {
    fn drop(&mut self) {
        // Dropping the sender disconnects the channel; workers exit after the
        // queue is empty. Nothing is joined here.
        self.tx.lock().unwrap_or_else(|e| e.into_inner()).take();
    }
}

fn worker_loop(index: usize, rx: Receiver<Option<ImageJob>>, pending: Arc<Pending>, quality: u8) {
    tracing::debug!(worker = index, "image writer thread started");
    while let Ok(Some(job)) = rx.recv() {
        let ImageJob { image, path, on_complete } = job;

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            let result = save_image(&image, &path, quality).map(|()| path.clone());
            match &result {
                Ok(p) => tracing::debug!(path = %p.display(), "image written"),
                Err(e) => tracing::warn!(error = %e, "image write failed"),
            }
            if let Some(callback) = on_complete {
                callback(result);
            }
        }));
        if outcome.is_err() {
            tracing::error!(worker = index, path = %path.display(), "image job panicked");
        }
        pending.done();
    }
    tracing::debug!(worker = index, "image writer thread exiting");
}

/// Encode `image` to `path` durably: write a sibling temp file, fsync it,
/// then rename it into place. The format follows the extension (JPEG or PNG).
pub fn save_image(image: &RgbImage, path: &Path, jpeg_quality: u8) -> Result<(), WriterError> {
    let unsupported = || WriterError::UnsupportedExtension(path.to_path_buf());
    let io_err = |source: std::io::Error| WriterError::Io {
        path: path.to_path_buf(),
        source,
    };

    let png = match path.extension().and_then(|e| e.to_str()) {
        Some(e) if e.eq_ignore_ascii_case("png") => true,
        Some(e) if e.eq_ignore_ascii_case("jpg") || e.eq_ignore_ascii_case("jpeg") => false,
        _ => return Err(unsupported()),
    };
    let file_name = path.file_name().and_then(|n| n.to_str()).ok_or_else(unsupported)?;
    let tmp = path.with_file_name(format!(".{file_name}.tmp"));

    let mut out = BufWriter::new(File::create(&tmp).map_err(io_err)?);
    let encoded = if png {
        image.write_with_encoder(PngEncoder::new(&mut out))
    } else {
        image.write_with_encoder(JpegEncoder::new_with_quality(&mut out, jpeg_quality))
    };
    if let Err(source) = encoded {
        drop(out);
        let _ = fs::remove_file(&tmp);
        return Err(WriterError::Encode {
            path: path.to_path_buf(),
            source,
        });
    }

    let file = out.into_inner().map_err(|e| io_err(e.into_error()))?;
    file.sync_all().map_err(io_err)?;
    drop(file);
    fs::rename(&tmp, path).map_err(io_err)?;
    Ok(())
}
