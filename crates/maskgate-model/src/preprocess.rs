//! Image decoding and normalization for backbone input.
//!
//! Pipeline:
//! 1. Decode PNG/JPEG bytes
//! 2. Resize to the backbone resolution (bilinear)
//! 3. Convert to RGB
//! 4. Normalize with CLIP mean/std, channel-first `[3, S, S]`
//!
//! The forward boundary never resizes; inputs that skip this step and arrive
//! at the wrong size are rejected with `ModelError::InputShape`.

use candle_core::{Device, Tensor};
use image::DynamicImage;

use crate::backbone::BackboneDescriptor;
use crate::error::{ModelError, ModelResult};

/// RGB mean of the CLIP pretraining set.
pub const CLIP_MEAN: [f32; 3] = [0.481_454_66, 0.457_827_5, 0.408_210_73];

/// RGB standard deviation of the CLIP pretraining set.
pub const CLIP_STD: [f32; 3] = [0.268_629_54, 0.261_302_58, 0.275_777_11];

#[derive(Debug, Clone)]
pub struct ImageProcessor {
    target_size: u32,
    mean: [f32; 3],
    std: [f32; 3],
}

impl ImageProcessor {
    #[must_use]
    pub fn new(target_size: u32) -> Self {
        Self {
            target_size,
            mean: CLIP_MEAN,
            std: CLIP_STD,
        }
    }

    /// Sized for `descriptor`'s input resolution.
    ///
    /// # Errors
    /// - `ModelError::Unsupported` for backbones that do not take RGB input
    pub fn for_backbone(descriptor: &BackboneDescriptor) -> ModelResult<Self> {
        if descriptor.image_channels != 3 {
            return Err(ModelError::Unsupported {
                message: format!(
                    "backbone '{}' expects {} channels; only RGB preprocessing is available",
                    descriptor.name, descriptor.image_channels
                ),
            });
        }
        Ok(Self::new(descriptor.image_size as u32))
    }

    #[must_use]
    pub fn with_normalization(mut self, mean: [f32; 3], std: [f32; 3]) -> Self {
        self.mean = mean;
        self.std = std;
        self
    }

    pub const fn target_size(&self) -> u32 {
        self.target_size
    }

    /// Decode and normalize encoded image bytes.
    ///
    /// # Errors
    /// - `ModelError::InvalidImage` if the bytes are empty or cannot be decoded
    pub fn preprocess(&self, bytes: &[u8], device: &Device) -> ModelResult<Tensor> {
        if bytes.is_empty() {
            return Err(ModelError::InvalidImage {
                reason: "empty image buffer".to_string(),
            });
        }
        let img = image::load_from_memory(bytes).map_err(|e| {
            tracing::error!("Failed to decode image: {}", e);
            ModelError::InvalidImage {
                reason: format!("decode failed: {}", e),
            }
        })?;
        self.preprocess_image(&img, device)
    }

    /// Normalize an already-decoded image into `[3, S, S]`.
    pub fn preprocess_image(&self, img: &DynamicImage, device: &Device) -> ModelResult<Tensor> {
        if img.width() == 0 || img.height() == 0 {
            return Err(ModelError::InvalidImage {
                reason: "image has zero dimensions".to_string(),
            });
        }
        let size = self.target_size;
        let rgb = img
            .resize_exact(size, size, image::imageops::FilterType::Triangle)
            .to_rgb8();

        let plane = (size * size) as usize;
        let mut data = vec![0f32; 3 * plane];
        for (i, pixel) in rgb.pixels().enumerate() {
            for c in 0..3 {
                data[c * plane + i] = (pixel[c] as f32 / 255.0 - self.mean[c]) / self.std[c];
            }
        }
        Ok(Tensor::from_vec(data, (3, size as usize, size as usize), device)?)
    }
}

/// Stack `[3, S, S]` images into a `[B, 3, S, S]` batch.
pub fn stack(images: &[Tensor]) -> ModelResult<Tensor> {
    if images.is_empty() {
        return Err(ModelError::InputShape {
            input: "image batch".to_string(),
            expected: vec![1],
            actual: vec![0],
        });
    }
    Ok(Tensor::stack(images, 0)?)
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use image::{ImageFormat, Rgb, RgbImage};

    use super::*;

    fn png(width: u32, height: u32, color: [u8; 3]) -> Vec<u8> {
        let img = RgbImage::from_pixel(width, height, Rgb(color));
        let mut bytes = Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(img).write_to(&mut bytes, ImageFormat::Png).unwrap();
        bytes.into_inner()
    }

    #[test]
    fn test_output_layout() {
        let processor = ImageProcessor::new(16);
        let t = processor.preprocess(&png(40, 30, [255, 0, 128]), &Device::Cpu).unwrap();
        assert_eq!(t.dims(), &[3, 16, 16]);
    }

    #[test]
    fn test_channel_normalization() {
        let processor = ImageProcessor::new(4);
        let t = processor.preprocess(&png(4, 4, [255, 0, 0]), &Device::Cpu).unwrap();
        let red: Vec<f32> = t.get(0).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        let green: Vec<f32> = t.get(1).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        let expected_red = (1.0 - CLIP_MEAN[0]) / CLIP_STD[0];
        let expected_green = (0.0 - CLIP_MEAN[1]) / CLIP_STD[1];
        assert!(red.iter().all(|v| (v - expected_red).abs() < 1e-4));
        assert!(green.iter().all(|v| (v - expected_green).abs() < 1e-4));
    }

    #[test]
    fn test_garbage_bytes_rejected() {
        let processor = ImageProcessor::new(4);
        assert!(matches!(
            processor.preprocess(b"not an image", &Device::Cpu),
            Err(ModelError::InvalidImage { .. })
        ));
        assert!(matches!(
            processor.preprocess(&[], &Device::Cpu),
            Err(ModelError::InvalidImage { .. })
        ));
    }

    #[test]
    fn test_stack_batches() {
        let processor = ImageProcessor::new(8);
        let a = processor.preprocess(&png(8, 8, [0, 0, 0]), &Device::Cpu).unwrap();
        let b = processor.preprocess(&png(12, 12, [255, 255, 255]), &Device::Cpu).unwrap();
        assert_eq!(stack(&[a, b]).unwrap().dims(), &[2, 3, 8, 8]);
        assert!(stack(&[]).is_err());
    }
}
