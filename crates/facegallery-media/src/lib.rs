//! facegallery-media — Frame conversion and sample image output.
//!
//! Converts raw RGB/NV12/YUYV frames into RGB and grayscale, crops padded
//! face regions, measures crop sharpness lazily, and writes sample images
//! from a bounded pool of worker threads.

pub mod frame;
pub mod writer;

pub use frame::{crop_face, Caps, CropSharpness, Frame, FrameError, PixelFormat, CROP_PADDING};
pub use writer::{ImageJob, ImageWriterPool, SubmitError, WriterConfig, WriterError, JPEG_QUALITY};
