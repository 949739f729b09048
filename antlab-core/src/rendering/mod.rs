//! rendering — burn tracker boxes and `ID:<n>` labels into a frame
//!
//! Drawing goes through `imageproc` on an `image::RgbImage` view of the
//! frame's buffer (no copy). Text needs a TrueType font; without one only the
//! rectangles are drawn.

use std::path::Path;

use ab_glyph::{FontVec, PxScale};
use anyhow::{bail, Context, Result};
use image::{ImageBuffer, Rgb, RgbImage};
use imageproc::rect::Rect;
use tracing::warn;

use crate::detection::{BBox, Detection};
use crate::video::RgbFrame;

/// Box and label colour (green).
pub const BOX_COLOR: [u8; 3] = [0, 255, 0];
/// Outline thickness in pixels.
const BOX_THICKNESS: u32 = 2;
/// Label glyph height in pixels.
const LABEL_SCALE: f32 = 16.0;
/// Gap between the label baseline area and the box's top edge.
const LABEL_GAP: i32 = 10;

/// Clip a box to the frame and return its pixel rectangle
/// `(x, y, width, height)`, or `None` when nothing of it is visible.
pub fn pixel_rect(bbox: &BBox, frame_w: u32, frame_h: u32, normalized: bool) -> Option<(i32, i32, u32, u32)> {
    let (x1, y1, x2, y2) = bbox.to_pixel_corners(frame_w, frame_h, normalized);
    if ![x1, y1, x2, y2].iter().all(|v| v.is_finite()) {
        return None;
    }
    let x1 = (x1 as i64).clamp(0, frame_w as i64);
    let y1 = (y1 as i64).clamp(0, frame_h as i64);
    let x2 = (x2 as i64).clamp(0, frame_w as i64);
    let y2 = (y2 as i64).clamp(0, frame_h as i64);
    if x2 <= x1 || y2 <= y1 {
        return None;
    }
    Some((x1 as i32, y1 as i32, (x2 - x1) as u32, (y2 - y1) as u32))
}

/// Paints detections onto frames.
pub struct BoxPainter {
    font: Option<FontVec>,
    normalized: bool,
    warned_no_font: bool,
}

impl BoxPainter {
    /// `normalized`: detection coordinates are fractions of the frame size.
    pub fn new(normalized: bool) -> Self {
        Self {
            font: None,
            normalized,
            warned_no_font: false,
        }
    }

    /// Load a TrueType/OpenType font for the ID labels.
    pub fn with_font<P: AsRef<Path>>(mut self, font_path: P) -> Result<Self> {
        let font_path = font_path.as_ref();
        let bytes = std::fs::read(font_path)
            .with_context(|| format!("failed to read font: {}", font_path.display()))?;
        let font = FontVec::try_from_vec(bytes)
            .with_context(|| format!("not a usable font file: {}", font_path.display()))?;
        self.font = Some(font);
        Ok(self)
    }

    /// Draw every detection onto `frame` in place.
    pub fn paint(&mut self, frame: &mut RgbFrame, detections: &[Detection]) -> Result<()> {
        if detections.is_empty() {
            return Ok(());
        }
        if self.font.is_none() && !self.warned_no_font {
            warn!("no font loaded; drawing boxes without ID labels");
            self.warned_no_font = true;
        }

        if frame.data.len() != (frame.width * frame.height * 3) as usize {
            bail!(
                "frame buffer holds {} bytes, expected {}x{} RGB",
                frame.data.len(),
                frame.width,
                frame.height
            );
        }

        // Borrow the frame buffer as an image without copying; written back below.
        let mut img: RgbImage =
            ImageBuffer::from_raw(frame.width, frame.height, std::mem::take(&mut frame.data))
                .context("frame buffer does not match its dimensions")?;

        let color = Rgb(BOX_COLOR);
        for det in detections {
            let Some((x, y, w, h)) = pixel_rect(&det.bbox, frame.width, frame.height, self.normalized)
            else {
                continue;
            };

            for inset in 0..BOX_THICKNESS {
                let (iw, ih) = (w.saturating_sub(2 * inset), h.saturating_sub(2 * inset));
                if iw == 0 || ih == 0 {
                    break;
                }
                let rect = Rect::at(x + inset as i32, y + inset as i32).of_size(iw, ih);
                imageproc::drawing::draw_hollow_rect_mut(&mut img, rect, color);
            }

            if let Some(font) = &self.font {
                let label = format!("ID:{}", det.track_id);
                let text_y = (y - LABEL_GAP - LABEL_SCALE as i32).max(0);
                imageproc::drawing::draw_text_mut(
                    &mut img,
                    color,
                    x,
                    text_y,
                    PxScale::from(LABEL_SCALE),
                    font,
                    &label,
                );
            }
        }

        frame.data = img.into_raw();
        Ok(())
    }
}
