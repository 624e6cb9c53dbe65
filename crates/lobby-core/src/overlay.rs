//! Detection overlay rendering.
//!
//! Stateless: every call works only on the frame it is given, so independent
//! frames can be annotated concurrently from any thread.

use crate::types::DetectionResult;
use ab_glyph::{FontArc, PxScale};
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut, text_size};
use imageproc::rect::Rect;
use std::path::Path;

const LABEL_BAR_HEIGHT: u32 = 20;
const LABEL_BAR_MIN_WIDTH: u32 = 150;
const LABEL_PADDING: i32 = 4;

/// Colours, stroke and (optional) font used to annotate frames.
#[derive(Clone)]
pub struct OverlayStyle {
    pub recognized: Rgb<u8>,
    pub unrecognized: Rgb<u8>,
    pub label_background: Rgb<u8>,
    pub thickness: u32,
    /// Without a font, label bars are drawn but carry no text.
    pub font: Option<FontArc>,
    pub font_scale: f32,
}

impl Default for OverlayStyle {
    fn default() -> Self {
        Self {
            recognized: Rgb([0, 255, 0]),
            unrecognized: Rgb([255, 0, 0]),
            label_background: Rgb([0, 0, 0]),
            thickness: 2,
            font: None,
            font_scale: 16.0,
        }
    }
}

impl OverlayStyle {
    /// Load a TrueType/OpenType font for label text.
    pub fn with_font_file(mut self, path: &Path) -> std::io::Result<Self> {
        let bytes = std::fs::read(path)?;
        let font = FontArc::try_from_vec(bytes)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))?;
        self.font = Some(font);
        Ok(self)
    }

    fn color_for(&self, detection: &DetectionResult) -> Rgb<u8> {
        if detection.recognized {
            self.recognized
        } else {
            self.unrecognized
        }
    }
}

/// Draw one rectangle per detection and a label bar above it.
pub fn render(frame: &mut RgbImage, detections: &[DetectionResult], style: &OverlayStyle) {
    for detection in detections {
        let color = style.color_for(detection);
        let [x1, y1, x2, y2] = detection.bbox.corners();
        let width = (x2 - x1).max(1) as u32;
        let height = (y2 - y1).max(1) as u32;

        // Stroke is drawn inward, one pixel ring per unit of thickness.
        for inset in 0..style.thickness.min(width / 2).min(height / 2).max(1) {
            let rect = Rect::at(x1 + inset as i32, y1 + inset as i32)
                .of_size((width - 2 * inset).max(1), (height - 2 * inset).max(1));
            draw_hollow_rect_mut(frame, rect, color);
        }

        draw_label(frame, x1, y1, detection.label(), color, style);
    }
}

fn draw_label(frame: &mut RgbImage, x: i32, y: i32, text: &str, color: Rgb<u8>, style: &OverlayStyle) {
    let scale = PxScale::from(style.font_scale);
    let text_width = style
        .font
        .as_ref()
        .map(|font| text_size(scale, font, text).0)
        .unwrap_or(0);
    let bar_width = (text_width + 2 * LABEL_PADDING as u32).max(LABEL_BAR_MIN_WIDTH);
    let bar_top = y - LABEL_BAR_HEIGHT as i32;

    draw_filled_rect_mut(
        frame,
        Rect::at(x, bar_top).of_size(bar_width, LABEL_BAR_HEIGHT),
        style.label_background,
    );

    if let Some(font) = &style.font {
        draw_text_mut(frame, color, x + LABEL_PADDING, bar_top + 2, scale, font, text);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BoundingBox, Identity};

    fn bbox(x: f32, y: f32, w: f32, h: f32) -> BoundingBox {
        BoundingBox { x, y, width: w, height: h, confidence: 0.9 }
    }

    #[test]
    fn test_recognized_box_uses_recognized_color() {
        let mut frame = RgbImage::from_pixel(200, 200, Rgb([9, 9, 9]));
        let identity = Identity { person_id: "p".into(), name: "Alice".into(), score: 0.9 };
        let detections = vec![DetectionResult::recognized(bbox(50.0, 60.0, 40.0, 40.0), identity)];
        let style = OverlayStyle::default();

        render(&mut frame, &detections, &style);

        // Left edge of the box, below the label bar.
        assert_eq!(*frame.get_pixel(50, 80), style.recognized);
        // Label bar sits directly above the box.
        assert_eq!(*frame.get_pixel(55, 50), style.label_background);
    }

    #[test]
    fn test_unrecognized_box_uses_unrecognized_color() {
        let mut frame = RgbImage::from_pixel(200, 200, Rgb([9, 9, 9]));
        let detections = vec![DetectionResult::unrecognized(bbox(50.0, 60.0, 40.0, 40.0))];
        let style = OverlayStyle::default();

        render(&mut frame, &detections, &style);

        assert_eq!(*frame.get_pixel(89, 80), style.unrecognized);
        // Interior is untouched.
        assert_eq!(*frame.get_pixel(70, 80), Rgb([9, 9, 9]));
    }

    #[test]
    fn test_boxes_outside_frame_are_clipped() {
        let mut frame = RgbImage::new(32, 32);
        let detections = vec![DetectionResult::unrecognized(bbox(-10.0, -10.0, 100.0, 100.0))];
        render(&mut frame, &detections, &OverlayStyle::default());
        assert_eq!(frame.dimensions(), (32, 32));
    }

    #[test]
    fn test_no_detections_leaves_frame_unchanged() {
        let mut frame = RgbImage::from_pixel(8, 8, Rgb([1, 2, 3]));
        let before = frame.clone();
        render(&mut frame, &[], &OverlayStyle::default());
        assert_eq!(frame, before);
    }
}
