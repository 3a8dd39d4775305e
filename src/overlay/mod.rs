//! Overlay - Annotation Drawing
//!
//! ## Responsibilities
//!
//! - Draw detection boxes, face boxes and pose keypoints onto a JPEG frame
//! - Optional class/confidence labels when a font is configured
//! - Colors and thickness come from the camera's `OverlayStyle`
//!
//! Only the detection pipeline calls this; stream publishers relay bytes.

use crate::config_store::{OverlayStyle, Rgb as RgbColor};
use crate::detector_client::{Detection, FaceMatch, PoseEstimate, ThreatLevel};
use crate::error::{Error, Result};
use crate::models::BoundingBox;
use ab_glyph::{FontVec, PxScale};
use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder;
use image::{ImageFormat, Rgb, RgbImage};
use imageproc::drawing::{
    draw_filled_circle_mut, draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut, text_size,
};
use imageproc::rect::Rect;
use std::path::Path;

const JPEG_QUALITY: u8 = 85;
const LABEL_SCALE: f32 = 16.0;
const KEYPOINT_RADIUS: i32 = 3;

/// Everything drawn onto one frame
#[derive(Debug, Default, Clone, Copy)]
pub struct OverlayContent<'a> {
    pub detections: &'a [Detection],
    pub faces: &'a [FaceMatch],
    pub poses: &'a [PoseEstimate],
}

impl OverlayContent<'_> {
    pub fn is_empty(&self) -> bool {
        self.detections.is_empty() && self.faces.is_empty() && self.poses.is_empty()
    }
}

/// Shared overlay renderer
pub struct OverlayRenderer {
    font: Option<FontVec>,
}

impl OverlayRenderer {
    /// Renderer without labels
    pub fn new() -> Self {
        Self { font: None }
    }

    /// Load a TTF/OTF font for labels
    pub fn with_font_file(path: &Path) -> Result<Self> {
        let data = std::fs::read(path)?;
        let font = FontVec::try_from_vec(data).map_err(|e| {
            Error::InvalidConfig(format!("invalid overlay font {}: {}", path.display(), e))
        })?;
        tracing::info!(path = %path.display(), "Overlay font loaded");
        Ok(Self { font: Some(font) })
    }

    pub fn has_font(&self) -> bool {
        self.font.is_some()
    }

    /// Decode, draw and re-encode. CPU bound; callers run it on a blocking thread.
    pub fn render(&self, jpeg: &[u8], content: OverlayContent<'_>, style: &OverlayStyle) -> Result<Bytes> {
        let mut image = image::load_from_memory_with_format(jpeg, ImageFormat::Jpeg)?.to_rgb8();

        for detection in content.detections {
            let color = match detection.threat {
                ThreatLevel::High => style.person_color,
                ThreatLevel::Medium => style.vehicle_color,
                ThreatLevel::Low => style.other_color,
            };
            draw_box(&mut image, &detection.bbox, color, style.box_thickness);
            if style.show_labels {
                let label = format!("{} {:.2}", detection.class_name, detection.confidence);
                self.draw_label(&mut image, &detection.bbox, &label, color);
            }
        }

        for pose in content.poses {
            for keypoint in pose.keypoints.iter().filter(|k| k.confidence > 0.3) {
                draw_filled_circle_mut(
                    &mut image,
                    (keypoint.x as i32, keypoint.y as i32),
                    KEYPOINT_RADIUS,
                    Rgb(style.person_color),
                );
            }
        }

        for face in content.faces {
            draw_box(&mut image, &face.bbox, style.face_color, style.box_thickness);
            if style.show_labels {
                let label = match &face.identity {
                    Some(name) => format!("{} {:.2}", name, face.similarity),
                    None => "unknown".to_string(),
                };
                self.draw_label(&mut image, &face.bbox, &label, style.face_color);
            }
        }

        encode_jpeg(&image)
    }

    fn draw_label(&self, image: &mut RgbImage, bbox: &BoundingBox, label: &str, color: RgbColor) {
        let Some(font) = &self.font else {
            return;
        };
        let scale = PxScale::from(LABEL_SCALE);
        let (w, h) = text_size(scale, font, label);
        let x = bbox.x1.max(0.0) as i32;
        let y = (bbox.y1 as i32 - h as i32 - 2).max(0);

        draw_filled_rect_mut(image, Rect::at(x, y).of_size(w + 4, h + 2), Rgb(color));
        draw_text_mut(image, Rgb([0, 0, 0]), x + 2, y + 1, scale, font, label);
    }
}

impl Default for OverlayRenderer {
    fn default() -> Self {
        Self::new()
    }
}

/// Hollow box, `thickness` pixels wide, clipped to the image
fn draw_box(image: &mut RgbImage, bbox: &BoundingBox, color: RgbColor, thickness: u32) {
    let (width, height) = image.dimensions();
    let x1 = bbox.x1.max(0.0) as i32;
    let y1 = bbox.y1.max(0.0) as i32;
    let x2 = (bbox.x2.min(width as f32 - 1.0)) as i32;
    let y2 = (bbox.y2.min(height as f32 - 1.0)) as i32;

    for i in 0..thickness as i32 {
        let w = x2 - x1 - 2 * i;
        let h = y2 - y1 - 2 * i;
        if w <= 0 || h <= 0 {
            break;
        }
        let rect = Rect::at(x1 + i, y1 + i).of_size(w as u32, h as u32);
        draw_hollow_rect_mut(image, rect, Rgb(color));
    }
}

fn encode_jpeg(image: &RgbImage) -> Result<Bytes> {
    let mut buf = Vec::with_capacity(image.as_raw().len() / 8);
    JpegEncoder::new_with_quality(&mut buf, JPEG_QUALITY).encode_image(image)?;
    Ok(Bytes::from(buf))
}
