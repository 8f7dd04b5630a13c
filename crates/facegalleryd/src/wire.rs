//! Length-prefixed message framing for the detection feed.
//!
//! Request: `u32` little-endian header length, JSON [`FrameHeader`], then
//! `frame_len` raw frame bytes. Reply: `u32` little-endian length, JSON
//! [`FrameReply`]. The training analyzer emits requests on its stdout.

use facegallery_core::{Classification, Detection};
use facegallery_media::Caps;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound on a JSON header or reply.
pub const MAX_HEADER_LEN: u32 = 16 * 1024 * 1024;

/// Upper bound on raw frame bytes (8K RGB).
pub const MAX_FRAME_LEN: usize = 7680 * 4320 * 3;

#[derive(Error, Debug)]
pub enum WireError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed message: {0}")]
    Json(#[from] serde_json::Error),
    #[error("message of {0} bytes exceeds the limit")]
    TooLarge(usize),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameHeader {
    pub seq: u64,
    pub caps: Caps,
    pub frame_len: usize,
    #[serde(default)]
    pub detections: Vec<Detection>,
}

/// One `face_recon` classification attached to request detection `index`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Annotation {
    pub index: usize,
    pub kind: String,
    pub label: String,
    pub confidence: f32,
}

impl Annotation {
    pub fn new(index: usize, c: &Classification) -> Self {
        Self {
            index,
            kind: c.kind.clone(),
            label: c.label.clone(),
            confidence: c.confidence,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FrameReply {
    pub seq: u64,
    pub annotations: Vec<Annotation>,
}

/// Read a length-prefixed JSON value. `None` on a clean end of stream.
pub async fn read_json<R, T>(reader: &mut R) -> Result<Option<T>, WireError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_le_bytes(len_buf);
    if len > MAX_HEADER_LEN {
        return Err(WireError::TooLarge(len as usize));
    }
    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf).await?;
    Ok(Some(serde_json::from_slice(&buf)?))
}

pub async fn write_json<W, T>(writer: &mut W, value: &T) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let body = serde_json::to_vec(value)?;
    let len = u32::try_from(body.len())
        .ok()
        .filter(|&n| n <= MAX_HEADER_LEN)
        .ok_or(WireError::TooLarge(body.len()))?;
    writer.write_all(&len.to_le_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame message: header plus raw bytes.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<(FrameHeader, Vec<u8>)>, WireError>
where
    R: AsyncRead + Unpin,
{
    let Some(header) = read_json::<_, FrameHeader>(reader).await? else {
        return Ok(None);
    };
    if header.frame_len > MAX_FRAME_LEN {
        return Err(WireError::TooLarge(header.frame_len));
    }
    let mut data = vec![0u8; header.frame_len];
    reader.read_exact(&mut data).await?;
    Ok(Some((header, data)))
}

/// Producer side of [`read_frame`]; the daemon only consumes frames.
#[cfg(test)]
pub async fn write_frame<W>(writer: &mut W, header: &FrameHeader, data: &[u8]) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin,
{
    write_json(writer, header).await?;
    writer.write_all(data).await?;
    writer.flush().await?;
    Ok(())
}
