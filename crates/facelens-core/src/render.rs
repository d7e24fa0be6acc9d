//! Paints annotated faces onto a surface.

use crate::raster::{text_width, TEXT_LINE_HEIGHT};
use crate::surface::Surface;
use crate::types::{AnnotatedFace, FaceLabel};
use image::Rgba;

const KNOWN_COLOR: Rgba<u8> = Rgba([46, 204, 113, 255]);
const UNKNOWN_COLOR: Rgba<u8> = Rgba([231, 76, 60, 255]);
const TEXT_COLOR: Rgba<u8> = Rgba([255, 255, 255, 255]);
const BOX_THICKNESS: u32 = 2;
const LABEL_PADDING: u32 = 2;

fn label_color(label: FaceLabel) -> Rgba<u8> {
    if label.is_known() {
        KNOWN_COLOR
    } else {
        UNKNOWN_COLOR
    }
}

/// Clear the whole surface, then draw each face's box and caption.
pub fn render(surface: &mut dyn Surface, faces: &[AnnotatedFace]) {
    surface.clear();

    for face in faces {
        let color = label_color(face.label);
        let x = face.bbox.x.round() as i32;
        let y = face.bbox.y.round() as i32;
        let width = face.bbox.width.max(0.0).round() as u32;
        let height = face.bbox.height.max(0.0).round() as u32;
        surface.stroke_rect(x, y, width, height, color, BOX_THICKNESS);

        // Caption tab sits on the box's bottom edge, like a drawn text field.
        let caption = face.label.as_str();
        let tab_w = text_width(caption) + LABEL_PADDING * 2;
        let tab_h = TEXT_LINE_HEIGHT + LABEL_PADDING * 2;
        let tab_y = y.saturating_add(i32::try_from(height).unwrap_or(i32::MAX));
        surface.fill_rect(x, tab_y, tab_w, tab_h, color);
        surface.draw_text(
            x.saturating_add(LABEL_PADDING as i32),
            tab_y.saturating_add(LABEL_PADDING as i32),
            caption,
            TEXT_COLOR,
        );
    }
}
