//! Raw buffer → grayscale conversion and dark-frame detection.

use v4l::FourCC;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("{format:?} buffer too short: expected {expected}, got {actual}")]
    InvalidLength {
        format: PixelFormat,
        expected: usize,
        actual: usize,
    },
}

/// Pixel formats the capture thread knows how to reduce to luma.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// YUYV 4:2:2 packed (2 bytes/pixel, Y channel extracted).
    Yuyv,
    /// 8-bit grayscale.
    Grey,
    /// 16-bit little-endian grayscale, downscaled to 8 bits.
    Y16,
}

impl PixelFormat {
    pub fn from_fourcc(fourcc: FourCC) -> Option<Self> {
        match &fourcc.repr {
            b"YUYV" => Some(PixelFormat::Yuyv),
            b"GREY" => Some(PixelFormat::Grey),
            b"Y16 " | b"Y16\0" => Some(PixelFormat::Y16),
            _ => None,
        }
    }

    pub fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Grey => 1,
            PixelFormat::Yuyv | PixelFormat::Y16 => 2,
        }
    }

    /// Reduce a raw buffer of `width * height` pixels to one luma byte per pixel.
    pub fn to_luma(self, buf: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameError> {
        let pixels = (width * height) as usize;
        let expected = pixels * self.bytes_per_pixel();
        if buf.len() < expected {
            return Err(FrameError::InvalidLength {
                format: self,
                expected,
                actual: buf.len(),
            });
        }

        let luma = match self {
            PixelFormat::Grey => buf[..pixels].to_vec(),
            // [Y0, U, Y1, V]: luma is every even byte.
            PixelFormat::Yuyv => buf[..expected].iter().step_by(2).copied().collect(),
            // Little-endian; the high byte is the 8-bit value.
            PixelFormat::Y16 => buf[..expected].chunks_exact(2).map(|px| px[1]).collect(),
        };
        Ok(luma)
    }
}

/// True if more than `threshold_pct` of pixels fall in the darkest bucket (0–31).
pub fn is_dark_frame(gray: &[u8], threshold_pct: f32) -> bool {
    if gray.is_empty() {
        return true;
    }
    let dark_count = gray.iter().filter(|&&p| p < 32).count();
    (dark_count as f32 / gray.len() as f32) > threshold_pct
}
