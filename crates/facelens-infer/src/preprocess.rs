//! Image → tensor helpers shared by the three models.

use crate::InferError;
use facelens_core::types::{BoundingBox, Frame};
use image::imageops::{self, FilterType};
use image::GrayImage;
use ndarray::Array4;

/// Wrap a frame's luma buffer as an image without copying more than once.
pub fn gray_image(frame: &Frame) -> Result<GrayImage, InferError> {
    GrayImage::from_raw(frame.width, frame.height, frame.data.clone()).ok_or_else(|| {
        InferError::InvalidFrame(format!(
            "{} bytes for a {}x{} frame",
            frame.data.len(),
            frame.width,
            frame.height
        ))
    })
}

/// Square crop centred on the box (side = longest edge), clamped to the
/// image, resized to `size`×`size`.
pub fn square_crop(img: &GrayImage, bbox: &BoundingBox, size: u32) -> GrayImage {
    let (img_w, img_h) = img.dimensions();
    let side = bbox.width.max(bbox.height).max(1.0);
    let cx = bbox.x + bbox.width / 2.0;
    let cy = bbox.y + bbox.height / 2.0;

    let x0 = (cx - side / 2.0).max(0.0) as u32;
    let y0 = (cy - side / 2.0).max(0.0) as u32;
    let x0 = x0.min(img_w.saturating_sub(1));
    let y0 = y0.min(img_h.saturating_sub(1));
    let w = (side as u32).clamp(1, img_w - x0);
    let h = (side as u32).clamp(1, img_h - y0);

    let crop = imageops::crop_imm(img, x0, y0, w, h).to_image();
    imageops::resize(&crop, size, size, FilterType::Triangle)
}

/// NCHW tensor of `(pixel - mean) / std`, with the luma replicated across `channels`.
pub fn to_tensor(img: &GrayImage, mean: f32, std: f32, channels: usize) -> Array4<f32> {
    let (w, h) = img.dimensions();
    let mut tensor = Array4::<f32>::zeros((1, channels, h as usize, w as usize));
    for (x, y, pixel) in img.enumerate_pixels() {
        let value = (pixel.0[0] as f32 - mean) / std;
        for c in 0..channels {
            tensor[[0, c, y as usize, x as usize]] = value;
        }
    }
    tensor
}

pub fn l2_normalize(values: &mut [f32]) {
    let norm = values.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        values.iter_mut().for_each(|v| *v /= norm);
    }
}

pub fn softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits.iter().map(|l| (l - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    exps.into_iter().map(|e| e / sum).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;
    use std::time::Instant;

    fn bbox(x: f32, y: f32, w: f32, h: f32) -> BoundingBox {
        BoundingBox {
            x,
            y,
            width: w,
            height: h,
            confidence: 0.9,
            landmarks: None,
        }
    }

    #[test]
    fn test_gray_image_rejects_short_buffer() {
        let frame = Frame {
            data: vec![0; 5],
            width: 3,
            height: 2,
            sequence: 0,
            timestamp: Instant::now(),
        };
        assert!(matches!(gray_image(&frame), Err(InferError::InvalidFrame(_))));
    }

    #[test]
    fn test_square_crop_clamps_to_image() {
        let img = GrayImage::from_pixel(50, 40, Luma([90]));
        let crop = square_crop(&img, &bbox(-20.0, 30.0, 40.0, 30.0), 16);
        assert_eq!(crop.dimensions(), (16, 16));
        assert!(crop.pixels().all(|p| p.0[0] == 90));
    }

    #[test]
    fn test_to_tensor_replicates_channels() {
        let img = GrayImage::from_pixel(4, 2, Luma([255]));
        let t = to_tensor(&img, 127.5, 127.5, 3);
        assert_eq!(t.shape(), &[1, 3, 2, 4]);
        assert!(t.iter().all(|&v| (v - 1.0).abs() < 1e-6));
    }

    #[test]
    fn test_l2_normalize() {
        let mut v = vec![3.0, 4.0];
        l2_normalize(&mut v);
        assert!((v[0] - 0.6).abs() < 1e-6 && (v[1] - 0.8).abs() < 1e-6);

        let mut zero = vec![0.0; 3];
        l2_normalize(&mut zero);
        assert_eq!(zero, vec![0.0; 3]);
    }

    #[test]
    fn test_softmax_sums_to_one() {
        let p = softmax(&[1.0, 2.0, 3.0]);
        assert!((p.iter().sum::<f32>() - 1.0).abs() < 1e-5);
        assert!(p[2] > p[1] && p[1] > p[0]);
    }
}
