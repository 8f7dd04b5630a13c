use crate::callback::{FrameCallback, FrameSummary};
use crate::wire::{Annotation, FrameReply};
use facegallery_core::Detection;
use facegallery_media::Frame;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

/// Requests the feed may have in flight before senders wait.
const REQUEST_QUEUE: usize = 8;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Messages sent from feed connections to the engine thread.
enum EngineRequest {
    Frame {
        seq: u64,
        frame: Frame,
        detections: Vec<Detection>,
        reply: oneshot::Sender<FrameReply>,
    },
}

/// Clone-safe handle to the engine thread.
///
/// The thread exits once every handle has been dropped.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

impl EngineHandle {
    /// Run the frame callback on one frame and return its annotations.
    pub async fn process(
        &self,
        seq: u64,
        frame: Frame,
        detections: Vec<Detection>,
    ) -> Result<FrameReply, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Frame {
                seq,
                frame,
                detections,
                reply: reply_tx,
            })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)
    }
}

/// Spawn the engine on a dedicated OS thread that owns the frame callback.
///
/// Gallery searches and policy decisions happen on this thread, so feed
/// connections never touch the store lock.
pub fn spawn_engine(mut callback: FrameCallback) -> (EngineHandle, std::thread::JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(REQUEST_QUEUE);

    let thread = std::thread::Builder::new()
        .name("facegallery-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            let mut totals = FrameSummary::default();
            while let Some(req) = rx.blocking_recv() {
                match req {
                    EngineRequest::Frame {
                        seq,
                        frame,
                        mut detections,
                        reply,
                    } => {
                        let summary = callback.on_frame(seq, &frame, &mut detections);
                        totals.faces += summary.faces;
                        totals.created += summary.created;
                        totals.augmented += summary.augmented;
                        totals.dropped += summary.dropped;
                        if summary.created + summary.augmented + summary.dropped > 0 {
                            tracing::debug!(seq, ?summary, "frame processed");
                        }
                        let _ = reply.send(reply_for(seq, &detections));
                    }
                }
            }
            tracing::info!(
                faces = totals.faces,
                created = totals.created,
                augmented = totals.augmented,
                dropped = totals.dropped,
                tracks = callback.tracks().len(),
                "engine thread exiting"
            );
        })
        .expect("failed to spawn engine thread");

    (EngineHandle { tx }, thread)
}

/// Annotations for every detection that carries a `face_recon` classification.
fn reply_for(seq: u64, detections: &[Detection]) -> FrameReply {
    let annotations = detections
        .iter()
        .enumerate()
        .filter_map(|(index, d)| d.face_recon().map(|c| Annotation::new(index, c)))
        .collect();
    FrameReply { seq, annotations }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callback::CallbackSettings;
    use facegallery_core::{AdmissionMode, BoundingBox, Embedding, UNKNOWN_NAME};
    use facegallery_media::{Caps, ImageWriterPool, PixelFormat, WriterConfig};
    use facegallery_store::GalleryStore;
    use std::sync::Arc;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_engine_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(GalleryStore::open(dir.path().join("db"), dir.path().join("faces")).unwrap());
        let writer = Arc::new(ImageWriterPool::start(WriterConfig::default()).unwrap());
        let callback = FrameCallback::new(store, writer, CallbackSettings::new(AdmissionMode::Inference));
        let (handle, thread) = spawn_engine(callback);

        let frame = Frame::new(
            Caps {
                format: PixelFormat::Rgb,
                width: 4,
                height: 4,
            },
            vec![0; 48],
        )
        .unwrap();
        let detections = vec![
            Detection {
                label: "person".into(),
                bbox: BoundingBox { xmin: 0.0, ymin: 0.0, width: 1.0, height: 1.0 },
                confidence: 0.8,
                track_id: Some(1),
                landmarks: None,
                embeddings: vec![],
                classifications: vec![],
            },
            Detection {
                label: "face".into(),
                bbox: BoundingBox { xmin: 0.25, ymin: 0.25, width: 0.5, height: 0.5 },
                confidence: 0.9,
                track_id: Some(2),
                landmarks: None,
                embeddings: vec![Embedding::new(vec![1.0, 0.0])],
                classifications: vec![],
            },
        ];

        let reply = handle.process(11, frame, detections).await.unwrap();
        assert_eq!(reply.seq, 11);
        assert_eq!(reply.annotations.len(), 1);
        assert_eq!(reply.annotations[0].index, 1);
        assert_eq!(reply.annotations[0].label, UNKNOWN_NAME);

        drop(handle);
        thread.join().unwrap();
    }
}
