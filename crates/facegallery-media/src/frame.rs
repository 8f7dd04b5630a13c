//! Frame type and pixel conversion from RGB, NV12 and YUYV to RGB/grayscale.

use facegallery_core::quality::{self, Sharpness};
use facegallery_core::BoundingBox;
use image::RgbImage;
use serde::{Deserialize, Serialize};
use std::cell::OnceCell;
use std::str::FromStr;

/// Padding added to each side of a face bounding box when cropping,
/// in normalized frame units.
pub const CROP_PADDING: f32 = 0.15;

/// Pixel layouts the upstream pipeline negotiates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelFormat {
    /// Packed 8-bit RGB (3 bytes/pixel).
    #[serde(rename = "RGB")]
    Rgb,
    /// Y plane followed by interleaved UV at quarter resolution.
    #[serde(rename = "NV12")]
    Nv12,
    /// YUYV 4:2:2 packed (2 bytes/pixel).
    #[serde(rename = "YUYV", alias = "YUY2")]
    Yuyv,
}

impl PixelFormat {
    /// Number of bytes a `width`×`height` frame occupies.
    pub fn frame_len(&self, width: u32, height: u32) -> usize {
        let (w, h) = (width as usize, height as usize);
        match self {
            PixelFormat::Rgb => w * h * 3,
            PixelFormat::Nv12 => w * h + 2 * w.div_ceil(2) * h.div_ceil(2),
            PixelFormat::Yuyv => w * h * 2,
        }
    }
}

impl FromStr for PixelFormat {
    type Err = FrameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "RGB" => Ok(PixelFormat::Rgb),
            "NV12" => Ok(PixelFormat::Nv12),
            "YUYV" | "YUY2" => Ok(PixelFormat::Yuyv),
            _ => Err(FrameError::UnsupportedFormat(s.to_string())),
        }
    }
}

/// Negotiated capabilities of the frame source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Caps {
    pub format: PixelFormat,
    pub width: u32,
    pub height: u32,
}

/// One raw video frame with its negotiated caps.
///
/// The buffer is always at least `caps.format.frame_len(width, height)` bytes.
#[derive(Clone)]
pub struct Frame {
    caps: Caps,
    data: Vec<u8>,
}

impl Frame {
    /// Wrap raw bytes, checking the buffer is large enough for the caps.
    pub fn new(caps: Caps, data: Vec<u8>) -> Result<Self, FrameError> {
        let expected = caps.format.frame_len(caps.width, caps.height);
        if data.len() < expected {
            return Err(FrameError::InvalidLength {
                expected,
                actual: data.len(),
            });
        }
        Ok(Self { caps, data })
    }

    pub fn caps(&self) -> Caps {
        self.caps
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn width(&self) -> u32 {
        self.caps.width
    }

    pub fn height(&self) -> u32 {
        self.caps.height
    }

    /// Convert to packed RGB.
    pub fn to_rgb(&self) -> Result<RgbImage, FrameError> {
        let Caps { format, width, height } = self.caps;
        let rgb = match format {
            PixelFormat::Rgb => {
                let len = format.frame_len(width, height);
                self.data[..len].to_vec()
            }
            PixelFormat::Nv12 => nv12_to_rgb(&self.data, width, height)?,
            PixelFormat::Yuyv => yuyv_to_rgb(&self.data, width, height)?,
        };
        RgbImage::from_raw(width, height, rgb).ok_or(FrameError::InvalidLength {
            expected: format.frame_len(width, height),
            actual: self.data.len(),
        })
    }

    /// Convert to 8-bit grayscale (luma).
    pub fn to_grayscale(&self) -> Result<Vec<u8>, FrameError> {
        let Caps { format, width, height } = self.caps;
        match format {
            PixelFormat::Rgb => Ok(rgb_to_grayscale(&self.data, width, height)),
            PixelFormat::Nv12 => Ok(self.data[..(width * height) as usize].to_vec()),
            PixelFormat::Yuyv => yuyv_to_grayscale(&self.data, width, height),
        }
    }
}

/// Convert packed YUYV (4:2:2) to grayscale by extracting the Y channel.
///
/// YUYV packs two pixels per 4 bytes: [Y0, U, Y1, V].
/// Grayscale = every even-indexed byte.
pub fn yuyv_to_grayscale(yuyv: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameError> {
    let expected = (width * height * 2) as usize;
    if yuyv.len() < expected {
        return Err(FrameError::InvalidLength {
            expected,
            actual: yuyv.len(),
        });
    }
    Ok(yuyv[..expected].iter().step_by(2).copied().collect())
}

/// Convert packed YUYV (4:2:2) to RGB. Each U/V pair is shared by two pixels.
pub fn yuyv_to_rgb(yuyv: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameError> {
    let pixels = (width * height) as usize;
    let expected = pixels * 2;
    if yuyv.len() < expected {
        return Err(FrameError::InvalidLength {
            expected,
            actual: yuyv.len(),
        });
    }

    let mut rgb = Vec::with_capacity(pixels * 3);
    for chunk in yuyv[..expected].chunks(4) {
        match *chunk {
            [y0, u, y1, v] => {
                rgb.extend_from_slice(&yuv_to_rgb(y0, u, v));
                rgb.extend_from_slice(&yuv_to_rgb(y1, u, v));
            }
            // Odd pixel count: the trailing pixel has no V sample.
            [y0, u] => rgb.extend_from_slice(&yuv_to_rgb(y0, u, 128)),
            _ => {}
        }
    }
    Ok(rgb)
}

/// Convert NV12 (full-resolution Y plane, then interleaved UV at half
/// resolution in both axes) to RGB.
pub fn nv12_to_rgb(nv12: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameError> {
    let (w, h) = (width as usize, height as usize);
    let expected = PixelFormat::Nv12.frame_len(width, height);
    if nv12.len() < expected {
        return Err(FrameError::InvalidLength {
            expected,
            actual: nv12.len(),
        });
    }

    let (luma, chroma) = nv12.split_at(w * h);
    let chroma_stride = 2 * w.div_ceil(2);
    let mut rgb = Vec::with_capacity(w * h * 3);
    for y in 0..h {
        let row = (y / 2) * chroma_stride;
        for x in 0..w {
            let uv = row + (x / 2) * 2;
            rgb.extend_from_slice(&yuv_to_rgb(luma[y * w + x], chroma[uv], chroma[uv + 1]));
        }
    }
    Ok(rgb)
}

/// Luma of packed RGB (BT.601 weights). Short buffers yield fewer pixels.
pub fn rgb_to_grayscale(rgb: &[u8], width: u32, height: u32) -> Vec<u8> {
    let pixels = (width * height) as usize;
    rgb.chunks_exact(3)
        .take(pixels)
        .map(|p| luma(p[0], p[1], p[2]))
        .collect()
}

fn luma(r: u8, g: u8, b: u8) -> u8 {
    (0.299 * r as f32 + 0.587 * g as f32 + 0.114 * b as f32)
        .round()
        .clamp(0.0, 255.0) as u8
}

/// BT.601 limited-range YUV to RGB.
fn yuv_to_rgb(y: u8, u: u8, v: u8) -> [u8; 3] {
    let c = 1.164 * (y as f32 - 16.0);
    let d = u as f32 - 128.0;
    let e = v as f32 - 128.0;
    let clamp = |x: f32| x.round().clamp(0.0, 255.0) as u8;
    [
        clamp(c + 1.596 * e),
        clamp(c - 0.391 * d - 0.813 * e),
        clamp(c + 2.018 * d),
    ]
}

/// Pixel rectangle `(x, y, w, h)` covering `bbox` grown by `padding` on
/// each side, clamped to the frame.
pub fn padded_rect(bbox: &BoundingBox, padding: f32, width: u32, height: u32) -> (u32, u32, u32, u32) {
    let x0 = (bbox.xmin - padding).clamp(0.0, 1.0);
    let y0 = (bbox.ymin - padding).clamp(0.0, 1.0);
    let x1 = (bbox.xmax() + padding).clamp(0.0, 1.0);
    let y1 = (bbox.ymax() + padding).clamp(0.0, 1.0);

    let x0 = (x0 * width as f32) as u32;
    let y0 = (y0 * height as f32) as u32;
    let x1 = (x1 * width as f32) as u32;
    let y1 = (y1 * height as f32) as u32;
    (x0, y0, x1.saturating_sub(x0), y1.saturating_sub(y0))
}

/// Crop the face region of an RGB frame with [`CROP_PADDING`] on each side.
pub fn crop_face(rgb: &RgbImage, bbox: &BoundingBox) -> RgbImage {
    let (x, y, w, h) = padded_rect(bbox, CROP_PADDING, rgb.width(), rgb.height());
    image::imageops::crop_imm(rgb, x, y, w, h).to_image()
}

/// Sharpness of a face crop, computed on first use.
///
/// The admission policy asks for sharpness only after every cheaper check
/// passed, so most crops never get converted to grayscale.
pub struct CropSharpness<'a> {
    crop: &'a RgbImage,
    cached: OnceCell<f64>,
}

impl<'a> CropSharpness<'a> {
    pub fn new(crop: &'a RgbImage) -> Self {
        Self {
            crop,
            cached: OnceCell::new(),
        }
    }
}

impl Sharpness for CropSharpness<'_> {
    fn sharpness(&self) -> f64 {
        *self.cached.get_or_init(|| {
            let (w, h) = self.crop.dimensions();
            let gray = rgb_to_grayscale(self.crop.as_raw(), w, h);
            quality::laplacian_variance(&gray, w, h)
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("invalid frame length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
    #[error("unsupported pixel format: {0} (need RGB, NV12 or YUYV)")]
    UnsupportedFormat(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps(format: PixelFormat, width: u32, height: u32) -> Caps {
        Caps { format, width, height }
    }

    #[test]
    fn test_yuyv_to_grayscale() {
        // 2x1 image: [Y0=100, U=128, Y1=200, V=128]
        let yuyv = vec![100, 128, 200, 128];
        let gray = yuyv_to_grayscale(&yuyv, 2, 1).unwrap();
        assert_eq!(gray, vec![100, 200]);
    }

    #[test]
    fn test_yuyv_invalid_length() {
        let yuyv = vec![100, 128]; // too short for 2x1
        let result = yuyv_to_grayscale(&yuyv, 2, 1);
        assert!(result.is_err());
    }

    #[test]
    fn test_yuyv_to_rgb_neutral_chroma() {
        // Y=16 is black, Y=235 is white in limited range.
        let yuyv = vec![16, 128, 235, 128];
        let rgb = yuyv_to_rgb(&yuyv, 2, 1).unwrap();
        assert_eq!(rgb, vec![0, 0, 0, 255, 255, 255]);
    }

    #[test]
    fn test_nv12_to_rgb_gray() {
        // 2x2 frame, one shared UV pair, neutral chroma.
        let nv12 = vec![126, 126, 126, 126, 128, 128];
        let rgb = nv12_to_rgb(&nv12, 2, 2).unwrap();
        assert_eq!(rgb.len(), 12);
        assert!(rgb.iter().all(|&c| c == rgb[0]));
        assert!((rgb[0] as i32 - 128).abs() <= 1);
    }

    #[test]
    fn test_nv12_red_chroma() {
        let nv12 = vec![81, 81, 81, 81, 90, 240];
        let rgb = nv12_to_rgb(&nv12, 2, 2).unwrap();
        assert!(rgb[0] > 200 && rgb[1] < 40 && rgb[2] < 40, "{:?}", &rgb[..3]);
    }

    #[test]
    fn test_pixel_format_parse() {
        assert_eq!("RGB".parse::<PixelFormat>().unwrap(), PixelFormat::Rgb);
        assert_eq!("nv12".parse::<PixelFormat>().unwrap(), PixelFormat::Nv12);
        assert_eq!("YUY2".parse::<PixelFormat>().unwrap(), PixelFormat::Yuyv);
        assert!("I420".parse::<PixelFormat>().is_err());
    }

    #[test]
    fn test_frame_len() {
        assert_eq!(PixelFormat::Rgb.frame_len(4, 2), 24);
        assert_eq!(PixelFormat::Yuyv.frame_len(4, 2), 16);
        assert_eq!(PixelFormat::Nv12.frame_len(4, 2), 12);
    }

    #[test]
    fn test_frame_rejects_short_buffer() {
        assert!(Frame::new(caps(PixelFormat::Rgb, 4, 4), vec![0; 47]).is_err());
        assert!(Frame::new(caps(PixelFormat::Rgb, 4, 4), vec![0; 48]).is_ok());
    }

    #[test]
    fn test_frame_to_rgb_and_gray() {
        let frame = Frame::new(caps(PixelFormat::Rgb, 2, 1), vec![255, 0, 0, 0, 0, 255]).unwrap();
        let rgb = frame.to_rgb().unwrap();
        assert_eq!(rgb.get_pixel(0, 0).0, [255, 0, 0]);
        let gray = frame.to_grayscale().unwrap();
        assert_eq!(gray, vec![76, 29]);
    }

    #[test]
    fn test_padded_rect_clamps() {
        let bbox = BoundingBox { xmin: 0.125, ymin: 0.5, width: 0.25, height: 0.375 };
        let (x, y, w, h) = padded_rect(&bbox, 0.25, 100, 100);
        assert_eq!((x, y), (0, 25));
        // xmax 0.375 + 0.25 = 0.625; ymax 0.875 + 0.25 clamps to 1.0.
        assert_eq!((w, h), (62, 75));
    }

    #[test]
    fn test_crop_face_size() {
        let rgb = RgbImage::new(200, 100);
        let bbox = BoundingBox { xmin: 0.4, ymin: 0.4, width: 0.2, height: 0.2 };
        let crop = crop_face(&rgb, &bbox);
        assert_eq!(crop.dimensions(), (100, 50));
    }

    #[test]
    fn test_crop_sharpness() {
        let flat = RgbImage::from_pixel(16, 16, image::Rgb([90, 90, 90]));
        assert_eq!(CropSharpness::new(&flat).sharpness(), 0.0);

        let checker = RgbImage::from_fn(16, 16, |x, y| {
            if (x + y) % 2 == 0 {
                image::Rgb([0, 0, 0])
            } else {
                image::Rgb([255, 255, 255])
            }
        });
        let probe = CropSharpness::new(&checker);
        assert!(probe.sharpness() > 300.0);
        assert_eq!(probe.sharpness(), probe.sharpness());
    }
}
