//! Detection feed: a Unix socket the upstream pipeline writes frames and
//! detections to, one connection per stream.

use crate::engine::EngineHandle;
use crate::wire::{self, FrameReply, WireError};
use facegallery_media::Frame;
use std::path::{Path, PathBuf};
use tokio::net::{UnixListener, UnixStream};
use tokio::task::JoinSet;

pub struct FeedServer {
    listener: UnixListener,
    path: PathBuf,
}

impl FeedServer {
    /// Bind the feed socket, replacing a stale socket file.
    pub fn bind(path: &Path) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        match std::fs::remove_file(path) {
            Ok(()) => tracing::debug!(path = %path.display(), "removed stale feed socket"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        let listener = UnixListener::bind(path)?;
        tracing::info!(path = %path.display(), "detection feed listening");
        Ok(Self {
            listener,
            path: path.to_path_buf(),
        })
    }

    /// Accept connections until the future is dropped. Dropping it also
    /// aborts every connection task.
    pub async fn serve(self, engine: EngineHandle) {
        let mut connections = JoinSet::new();
        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        let engine = engine.clone();
                        connections.spawn(async move {
                            match handle_connection(stream, engine).await {
                                Ok(frames) => tracing::info!(frames, "feed connection closed"),
                                Err(e) => tracing::warn!(error = %e, "feed connection failed"),
                            }
                        });
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "feed accept failed");
                        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                    }
                },
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
            }
        }
    }
}

impl Drop for FeedServer {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Serve one upstream stream. Returns the number of frames processed.
async fn handle_connection(mut stream: UnixStream, engine: EngineHandle) -> Result<u64, WireError> {
    tracing::info!("feed connection opened");
    let mut frames = 0u64;
    while let Some((header, data)) = wire::read_frame(&mut stream).await? {
        let seq = header.seq;
        let reply = match Frame::new(header.caps, data) {
            Ok(frame) => match engine.process(seq, frame, header.detections).await {
                Ok(reply) => reply,
                Err(e) => {
                    tracing::warn!(seq, error = %e, "engine unavailable; closing feed connection");
                    break;
                }
            },
            Err(e) => {
                tracing::warn!(seq, error = %e, "invalid frame; skipped");
                FrameReply {
                    seq,
                    annotations: Vec::new(),
                }
            }
        };
        wire::write_json(&mut stream, &reply).await?;
        frames += 1;
    }
    Ok(frames)
}
