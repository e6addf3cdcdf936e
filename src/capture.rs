use crate::{
    error::CaptureError,
    source::{FrameSlot, SourceStatus, VideoFrame},
};
use chrono::{DateTime, Local};
use image::{codecs::jpeg::JpegEncoder, DynamicImage, GrayImage, RgbImage, RgbaImage};
use std::future::Future;
use tokio::sync::watch;
use zune_core::{colorspace::ColorSpace, options::DecoderOptions};
use zune_jpeg::JpegDecoder;

/// Bounds the upload size, not user configurable.
pub const JPEG_QUALITY: u8 = 80;

/// A still ready to be sent for analysis.
#[derive(Debug, Clone)]
pub struct EncodedFrame {
    pub jpeg: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub captured_at: DateTime<Local>,
}

pub trait Capture: Send + Sync + 'static {
    /// Returns `None` when there is nothing to capture.
    fn capture(&self) -> impl Future<Output = Result<Option<EncodedFrame>, CaptureError>> + Send;
}

/// Captures the frame currently shown by the active source.
#[derive(Clone)]
pub struct FrameCapture {
    frames: FrameSlot,
    status: watch::Receiver<SourceStatus>,
}

impl FrameCapture {
    pub fn new(frames: FrameSlot, status: watch::Receiver<SourceStatus>) -> Self {
        Self { frames, status }
    }
}

impl Capture for FrameCapture {
    async fn capture(&self) -> Result<Option<EncodedFrame>, CaptureError> {
        if !self.status.borrow().is_active() {
            return Ok(None);
        }
        let Some(frame) = self.frames.borrow().clone() else {
            return Ok(None);
        };
        if !frame.readable {
            return Err(CaptureError::SecurityRestriction);
        }

        let captured_at = Local::now();
        // Decoding plus encoding a 720p frame takes tens of milliseconds.
        let encoded = tokio::task::spawn_blocking(move || encode_frame(&frame, captured_at))
            .await
            .map_err(|e| CaptureError::Encode(e.to_string()))??;
        Ok(Some(encoded))
    }
}

/// Re-encodes a displayed frame at its native size.
pub fn encode_frame(
    frame: &VideoFrame,
    captured_at: DateTime<Local>,
) -> Result<EncodedFrame, CaptureError> {
    let image = decode_jpeg(&frame.jpeg)?;
    let (width, height) = (image.width(), image.height());

    let mut jpeg = Vec::new();
    let mut encoder = JpegEncoder::new_with_quality(&mut jpeg, JPEG_QUALITY);
    encoder
        .encode_image(&image)
        .map_err(|e| CaptureError::Encode(e.to_string()))?;

    Ok(EncodedFrame {
        jpeg,
        width,
        height,
        captured_at,
    })
}

/// Decodes a JPEG into an RGB image, sized from the stream's own header.
pub fn decode_jpeg(data: &[u8]) -> Result<DynamicImage, CaptureError> {
    let options = DecoderOptions::default().jpeg_set_out_colorspace(ColorSpace::RGB);
    let mut decoder = JpegDecoder::new_with_options(data, options);
    let pixels = decoder
        .decode()
        .map_err(|e| CaptureError::Encode(format!("{e:?}")))?;
    let (w, h) = decoder
        .dimensions()
        .ok_or_else(|| CaptureError::Encode("missing frame dimensions".into()))?;
    if w == 0 || h == 0 {
        return Err(CaptureError::Encode("empty frame".into()));
    }
    let (w, h) = (w as u32, h as u32);

    let area = w as usize * h as usize;
    let image = match pixels.len() / area {
        1 => GrayImage::from_raw(w, h, pixels).map(DynamicImage::ImageLuma8),
        3 => RgbImage::from_raw(w, h, pixels).map(DynamicImage::ImageRgb8),
        4 => RgbaImage::from_raw(w, h, pixels)
            .map(|img| DynamicImage::ImageRgb8(DynamicImage::ImageRgba8(img).to_rgb8())),
        _ => None,
    };
    image.ok_or_else(|| CaptureError::Encode("unexpected pixel layout".into()))
}
