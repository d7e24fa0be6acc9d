//! In-memory RGBA surface with a built-in 5x7 bitmap font.

use crate::surface::Surface;
use crate::types::Geometry;
use image::{Rgba, RgbaImage};
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_SURFACE_ID: AtomicU64 = AtomicU64::new(1);

const TRANSPARENT: Rgba<u8> = Rgba([0, 0, 0, 0]);
const GLYPH_WIDTH: i32 = 5;
const GLYPH_HEIGHT: i32 = 7;
const GLYPH_ADVANCE: i32 = 6;

/// Pixel height of one rendered text line.
pub const TEXT_LINE_HEIGHT: u32 = GLYPH_HEIGHT as u32;

/// Width in pixels of `text` when drawn with the built-in font.
pub fn text_width(text: &str) -> u32 {
    (text.chars().count() as i32 * GLYPH_ADVANCE - 1).max(0) as u32
}

/// Overlay surface backed by an `RgbaImage`.
pub struct RasterSurface {
    id: u64,
    image: RgbaImage,
}

impl RasterSurface {
    /// Create an unattached (0x0) surface.
    pub fn new() -> Self {
        Self {
            id: NEXT_SURFACE_ID.fetch_add(1, Ordering::Relaxed),
            image: RgbaImage::new(0, 0),
        }
    }

    pub fn image(&self) -> &RgbaImage {
        &self.image
    }

    /// Clamp a rectangle to the image, returning inclusive pixel bounds.
    fn clip(&self, x: i32, y: i32, width: u32, height: u32) -> Option<(u32, u32, u32, u32)> {
        let (w, h) = (self.image.width() as i64, self.image.height() as i64);
        if width == 0 || height == 0 || w == 0 || h == 0 {
            return None;
        }
        let left = (x as i64).max(0);
        let top = (y as i64).max(0);
        let right = (x as i64 + width as i64 - 1).min(w - 1);
        let bottom = (y as i64 + height as i64 - 1).min(h - 1);
        if left > right || top > bottom {
            return None;
        }
        Some((left as u32, top as u32, right as u32, bottom as u32))
    }

    fn put(&mut self, x: i64, y: i64, color: Rgba<u8>) {
        if x >= 0 && y >= 0 && x < i64::from(self.image.width()) && y < i64::from(self.image.height()) {
            self.image.put_pixel(x as u32, y as u32, color);
        }
    }
}

impl Default for RasterSurface {
    fn default() -> Self {
        Self::new()
    }
}

impl Surface for RasterSurface {
    fn id(&self) -> u64 {
        self.id
    }

    fn attach(&mut self, geometry: Geometry) {
        if self.dimensions() != geometry {
            tracing::debug!(surface = self.id, %geometry, "sizing surface");
            self.image = RgbaImage::new(geometry.width, geometry.height);
        }
    }

    fn dimensions(&self) -> Geometry {
        Geometry::new(self.image.width(), self.image.height())
    }

    fn clear_rect(&mut self, x: i32, y: i32, width: u32, height: u32) {
        if let Some((left, top, right, bottom)) = self.clip(x, y, width, height) {
            for py in top..=bottom {
                for px in left..=right {
                    self.image.put_pixel(px, py, TRANSPARENT);
                }
            }
        }
    }

    fn stroke_rect(&mut self, x: i32, y: i32, width: u32, height: u32, color: Rgba<u8>, thickness: u32) {
        if width == 0 || height == 0 {
            return;
        }
        let (w, h) = (i64::from(self.image.width()), i64::from(self.image.height()));
        let (x, y) = (i64::from(x), i64::from(y));
        let right = x + i64::from(width) - 1;
        let bottom = y + i64::from(height) - 1;
        for t in 0..i64::from(thickness) {
            let (l, r, top, b) = (x + t, right - t, y + t, bottom - t);
            if l > r || top > b {
                break;
            }
            // Walk only the visible span of each edge.
            for px in l.max(0)..=r.min(w - 1) {
                self.put(px, top, color);
                self.put(px, b, color);
            }
            for py in top.max(0)..=b.min(h - 1) {
                self.put(l, py, color);
                self.put(r, py, color);
            }
        }
    }

    fn fill_rect(&mut self, x: i32, y: i32, width: u32, height: u32, color: Rgba<u8>) {
        if let Some((left, top, right, bottom)) = self.clip(x, y, width, height) {
            for py in top..=bottom {
                for px in left..=right {
                    self.image.put_pixel(px, py, color);
                }
            }
        }
    }

    /// Characters without a glyph advance the cursor but draw nothing.
    fn draw_text(&mut self, x: i32, y: i32, text: &str, color: Rgba<u8>) {
        let mut cursor = i64::from(x);
        for ch in text.chars() {
            if cursor >= i64::from(self.image.width()) {
                break;
            }
            if let Some(rows) = glyph_bits(ch) {
                for (row, pattern) in rows.iter().enumerate() {
                    for col in 0..GLYPH_WIDTH {
                        if (pattern >> (GLYPH_WIDTH - 1 - col)) & 1 == 1 {
                            self.put(cursor + i64::from(col), i64::from(y) + row as i64, color);
                        }
                    }
                }
            }
            cursor += i64::from(GLYPH_ADVANCE);
        }
    }

    fn snapshot(&self) -> Option<RgbaImage> {
        Some(self.image.clone())
    }

    fn destroy(self: Box<Self>) {
        tracing::trace!(surface = self.id, "surface destroyed");
    }
}

fn glyph_bits(ch: char) -> Option<[u8; 7]> {
    let rows = match ch {
        'A' => [0b01110, 0b10001, 0b10001, 0b11111, 0b10001, 0b10001, 0b10001],
        'B' => [0b11110, 0b10001, 0b10001, 0b11110, 0b10001, 0b10001, 0b11110],
        'C' => [0b01110, 0b10001, 0b10000, 0b10000, 0b10000, 0b10001, 0b01110],
        'D' => [0b11100, 0b10010, 0b10001, 0b10001, 0b10001, 0b10010, 0b11100],
        'E' => [0b11111, 0b10000, 0b11110, 0b10000, 0b10000, 0b10000, 0b11111],
        'F' => [0b11111, 0b10000, 0b11110, 0b10000, 0b10000, 0b10000, 0b10000],
        'G' => [0b01110, 0b10001, 0b10000, 0b10111, 0b10001, 0b10001, 0b01111],
        'H' => [0b10001, 0b10001, 0b10001, 0b11111, 0b10001, 0b10001, 0b10001],
        'I' => [0b01110, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100, 0b01110],
        'J' => [0b00111, 0b00010, 0b00010, 0b00010, 0b00010, 0b10010, 0b01100],
        'K' => [0b10001, 0b10010, 0b10100, 0b11000, 0b10100, 0b10010, 0b10001],
        'L' => [0b10000, 0b10000, 0b10000, 0b10000, 0b10000, 0b10000, 0b11111],
        'M' => [0b10001, 0b11011, 0b10101, 0b10101, 0b10001, 0b10001, 0b10001],
        'N' => [0b10001, 0b11001, 0b10101, 0b10101, 0b10011, 0b10001, 0b10001],
        'O' => [0b01110, 0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01110],
        'P' => [0b11110, 0b10001, 0b10001, 0b11110, 0b10000, 0b10000, 0b10000],
        'Q' => [0b01110, 0b10001, 0b10001, 0b10001, 0b10101, 0b10010, 0b01101],
        'R' => [0b11110, 0b10001, 0b10001, 0b11110, 0b10100, 0b10010, 0b10001],
        'S' => [0b01111, 0b10000, 0b01110, 0b00001, 0b00001, 0b10001, 0b01110],
        'T' => [0b11111, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100],
        'U' => [0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01110],
        'V' => [0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01010, 0b00100],
        'W' => [0b10001, 0b10001, 0b10001, 0b10101, 0b10101, 0b11011, 0b10001],
        'X' => [0b10001, 0b10001, 0b01010, 0b00100, 0b01010, 0b10001, 0b10001],
        'Y' => [0b10001, 0b10001, 0b01010, 0b00100, 0b00100, 0b00100, 0b00100],
        'Z' => [0b11111, 0b00001, 0b00010, 0b00100, 0b01000, 0b10000, 0b11111],
        'a' => [0, 0, 0b01110, 0b00001, 0b01111, 0b10001, 0b01111],
        'b' => [0b10000, 0b10000, 0b10110, 0b11001, 0b10001, 0b10001, 0b11110],
        'c' => [0, 0, 0b01110, 0b10000, 0b10000, 0b10001, 0b01110],
        'd' => [0b00001, 0b00001, 0b01101, 0b10011, 0b10001, 0b10001, 0b01111],
        'e' => [0, 0, 0b01110, 0b10001, 0b11111, 0b10000, 0b01110],
        'f' => [0b00110, 0b01001, 0b01000, 0b11100, 0b01000, 0b01000, 0b01000],
        'g' => [0, 0b01111, 0b10001, 0b10001, 0b01111, 0b00001, 0b01110],
        'h' => [0b10000, 0b10000, 0b10110, 0b11001, 0b10001, 0b10001, 0b10001],
        'i' => [0b00100, 0, 0b01100, 0b00100, 0b00100, 0b00100, 0b01110],
        'j' => [0b00010, 0, 0b00110, 0b00010, 0b00010, 0b10010, 0b01100],
        'k' => [0b10000, 0b10000, 0b10010, 0b10100, 0b11000, 0b10100, 0b10010],
        'l' => [0b01100, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100, 0b01110],
        'm' => [0, 0, 0b11010, 0b10101, 0b10101, 0b10001, 0b10001],
        'n' => [0, 0, 0b10110, 0b11001, 0b10001, 0b10001, 0b10001],
        'o' => [0, 0, 0b01110, 0b10001, 0b10001, 0b10001, 0b01110],
        'p' => [0, 0, 0b11110, 0b10001, 0b11110, 0b10000, 0b10000],
        'q' => [0, 0, 0b01101, 0b10011, 0b01111, 0b00001, 0b00001],
        'r' => [0, 0, 0b10110, 0b11001, 0b10000, 0b10000, 0b10000],
        's' => [0, 0, 0b01110, 0b10000, 0b01110, 0b00001, 0b11110],
        't' => [0b01000, 0b01000, 0b11100, 0b01000, 0b01000, 0b01001, 0b00110],
        'u' => [0, 0, 0b10001, 0b10001, 0b10001, 0b10011, 0b01101],
        'v' => [0, 0, 0b10001, 0b10001, 0b10001, 0b01010, 0b00100],
        'w' => [0, 0, 0b10001, 0b10001, 0b10101, 0b10101, 0b01010],
        'x' => [0, 0, 0b10001, 0b01010, 0b00100, 0b01010, 0b10001],
        'y' => [0, 0, 0b10001, 0b10001, 0b01111, 0b00001, 0b01110],
        'z' => [0, 0, 0b11111, 0b00010, 0b00100, 0b01000, 0b11111],
        '0' => [0b01110, 0b10001, 0b10011, 0b10101, 0b11001, 0b10001, 0b01110],
        '1' => [0b00100, 0b01100, 0b00100, 0b00100, 0b00100, 0b00100, 0b01110],
        '2' => [0b01110, 0b10001, 0b00001, 0b00010, 0b00100, 0b01000, 0b11111],
        '3' => [0b11110, 0b00001, 0b00001, 0b01110, 0b00001, 0b00001, 0b11110],
        '4' => [0b00010, 0b00110, 0b01010, 0b10010, 0b11111, 0b00010, 0b00010],
        '5' => [0b11111, 0b10000, 0b11110, 0b00001, 0b00001, 0b10001, 0b01110],
        '6' => [0b00110, 0b01000, 0b10000, 0b11110, 0b10001, 0b10001, 0b01110],
        '7' => [0b11111, 0b00001, 0b00010, 0b00100, 0b01000, 0b01000, 0b01000],
        '8' => [0b01110, 0b10001, 0b10001, 0b01110, 0b10001, 0b10001, 0b01110],
        '9' => [0b01110, 0b10001, 0b10001, 0b01111, 0b00001, 0b00010, 0b01100],
        '.' => [0, 0, 0, 0, 0, 0b00110, 0b00110],
        ':' => [0, 0b00110, 0b00110, 0, 0b00110, 0b00110, 0],
        '-' => [0, 0, 0, 0b11111, 0, 0, 0],
        '(' => [0b00010, 0b00100, 0b01000, 0b01000, 0b01000, 0b00100, 0b00010],
        ')' => [0b01000, 0b00100, 0b00010, 0b00010, 0b00010, 0b00100, 0b01000],
        ' ' => [0; 7],
        _ => return None,
    };
    Some(rows)
}

#[cfg(test)]
mod tests {
    use super::*;

    const RED: Rgba<u8> = Rgba([255, 0, 0, 255]);

    fn attached(w: u32, h: u32) -> RasterSurface {
        let mut s = RasterSurface::new();
        s.attach(Geometry::new(w, h));
        s
    }

    fn painted(s: &RasterSurface) -> usize {
        s.image().pixels().filter(|p| p.0[3] != 0).count()
    }

    #[test]
    fn test_attach_sizes_once() {
        let mut s = RasterSurface::new();
        assert_eq!(s.dimensions(), Geometry::new(0, 0));
        s.attach(Geometry::new(32, 16));
        s.fill_rect(0, 0, 4, 4, RED);
        // Same geometry keeps existing pixels.
        s.attach(Geometry::new(32, 16));
        assert_eq!(painted(&s), 16);
    }

    #[test]
    fn test_stroke_rect_border_only() {
        let mut s = attached(20, 20);
        s.stroke_rect(2, 2, 10, 10, RED, 1);
        assert_eq!(painted(&s), 36);
        assert_eq!(*s.image().get_pixel(2, 2), RED);
        assert_eq!(*s.image().get_pixel(6, 6), TRANSPARENT);
    }

    #[test]
    fn test_stroke_rect_clipped_to_surface() {
        let mut s = attached(10, 10);
        s.stroke_rect(-5, -5, 30, 30, RED, 2);
        assert_eq!(painted(&s), 0);
        s.stroke_rect(5, 5, 30, 30, RED, 1);
        assert!(painted(&s) > 0);
    }

    #[test]
    fn test_clear_resets_everything() {
        let mut s = attached(16, 16);
        s.fill_rect(0, 0, 16, 16, RED);
        s.clear();
        assert_eq!(painted(&s), 0);
    }

    #[test]
    fn test_draw_text_paints_known_glyphs() {
        let mut s = attached(80, 10);
        s.draw_text(0, 0, "Known", RED);
        assert!(painted(&s) > 0);
        let mut blank = attached(80, 10);
        blank.draw_text(0, 0, "   ", RED);
        assert_eq!(painted(&blank), 0);
    }

    #[test]
    fn test_text_width() {
        assert_eq!(text_width(""), 0);
        assert_eq!(text_width("A"), 5);
        assert_eq!(text_width("Known Smiling"), 13 * 6 - 1);
    }

    #[test]
    fn test_surface_ids_are_unique() {
        assert_ne!(RasterSurface::new().id(), RasterSurface::new().id());
    }

    #[test]
    fn test_label_characters_have_glyphs() {
        use crate::types::FaceLabel;
        let labels = [
            FaceLabel::KnownSmiling,
            FaceLabel::KnownNotSmiling,
            FaceLabel::UnknownSmiling,
            FaceLabel::UnknownNotSmiling,
        ];
        for label in labels {
            for ch in label.as_str().chars() {
                assert!(glyph_bits(ch).is_some(), "missing glyph {ch:?} in {}", label.as_str());
            }
        }
    }

    #[test]
    fn test_text_is_drawn_with_its_own_case() {
        let mut lower = attached(8, 8);
        lower.draw_text(0, 0, "k", RED);
        let mut upper = attached(8, 8);
        upper.draw_text(0, 0, "K", RED);
        assert_ne!(lower.image(), upper.image());
        assert_eq!(*lower.image().get_pixel(0, 0), RED);
        assert_eq!(*lower.image().get_pixel(4, 0), TRANSPARENT);
        assert_eq!(*upper.image().get_pixel(4, 0), RED);
    }

    #[test]
    fn test_extreme_coordinates_do_not_overflow() {
        let mut s = attached(10, 10);
        s.stroke_rect(i32::MAX - 1, i32::MAX - 1, u32::MAX, u32::MAX, RED, 3);
        s.draw_text(i32::MAX - 2, i32::MAX, "Known", RED);
        assert_eq!(painted(&s), 0);

        s.stroke_rect(i32::MIN, i32::MIN, u32::MAX, u32::MAX, RED, 1);
        assert_eq!(painted(&s), 0);
        s.stroke_rect(-4, -4, u32::MAX, 10, RED, 1);
        assert!(painted(&s) > 0);
    }
}
