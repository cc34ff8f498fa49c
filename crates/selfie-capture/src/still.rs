//! Still image production: mirror, encode, or re-encode an uploaded file.

use image::codecs::jpeg::JpegEncoder;
use image::ImageError;
use selfie_core::PreviewOrientation;
use selfie_hw::Frame;

/// An encoded JPEG still ready for commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StillImage {
    pub jpeg: Vec<u8>,
    pub width: u32,
    pub height: u32,
    /// Captured from the camera (and mirrored to match the preview) rather
    /// than supplied as a file.
    pub from_camera: bool,
}

impl StillImage {
    /// Encode a camera frame. A mirrored preview mirrors the still too, so
    /// the user gets the image they saw.
    pub fn from_frame(
        frame: &Frame,
        preview: PreviewOrientation,
        quality: u8,
    ) -> Result<Self, ImageError> {
        let jpeg = match preview {
            PreviewOrientation::Mirrored => encode_jpeg(&image::imageops::flip_horizontal(frame), quality)?,
            PreviewOrientation::Raw => encode_jpeg(frame, quality)?,
        };
        Ok(Self {
            jpeg,
            width: frame.width(),
            height: frame.height(),
            from_camera: true,
        })
    }

    /// Decode a user-supplied image in any supported format and re-encode it
    /// as JPEG. Not mirrored.
    pub fn from_file_bytes(bytes: &[u8], quality: u8) -> Result<Self, ImageError> {
        let frame = image::load_from_memory(bytes)?.to_rgb8();
        Ok(Self {
            jpeg: encode_jpeg(&frame, quality)?,
            width: frame.width(),
            height: frame.height(),
            from_camera: false,
        })
    }
}

pub fn encode_jpeg(frame: &Frame, quality: u8) -> Result<Vec<u8>, ImageError> {
    let mut buf = Vec::new();
    JpegEncoder::new_with_quality(&mut buf, quality.clamp(1, 100)).encode_image(frame)?;
    Ok(buf)
}
