use std::path::Path;

use image::{imageops, imageops::FilterType, RgbImage};
use serde::Deserialize;

use crate::error::{Result, ServiceError};

pub const PREPROCESSOR_CONFIG_FILE: &str = "preprocessor_config.json";

const DEFAULT_SIZE: u32 = 224;
const DEFAULT_MEAN: [f32; 3] = [0.5, 0.5, 0.5];
const DEFAULT_STD: [f32; 3] = [0.5, 0.5, 0.5];

/// Target size as written by image-processor configs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum SizeSpec {
    Exact { height: u32, width: u32 },
    ShortestEdge { shortest_edge: u32 },
    Square(u32),
}

impl Default for SizeSpec {
    fn default() -> Self {
        Self::Exact {
            height: DEFAULT_SIZE,
            width: DEFAULT_SIZE,
        }
    }
}

/// Contents of `preprocessor_config.json`. Unknown keys are ignored.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PreprocessorConfig {
    pub do_resize: bool,
    pub size: SizeSpec,
    pub resample: u8,
    pub do_center_crop: bool,
    pub crop_size: Option<SizeSpec>,
    pub do_rescale: bool,
    pub rescale_factor: f32,
    pub do_normalize: bool,
    pub image_mean: [f32; 3],
    pub image_std: [f32; 3],
}

impl Default for PreprocessorConfig {
    fn default() -> Self {
        Self {
            do_resize: true,
            size: SizeSpec::default(),
            resample: 2,
            do_center_crop: false,
            crop_size: None,
            do_rescale: true,
            rescale_factor: 1.0 / 255.0,
            do_normalize: true,
            image_mean: DEFAULT_MEAN,
            image_std: DEFAULT_STD,
        }
    }
}

/// Channel-first `[1, 3, height, width]` model input.
#[derive(Debug, Clone, PartialEq)]
pub struct PixelValues {
    pub height: u32,
    pub width: u32,
    pub data: Vec<f32>,
}

impl PixelValues {
    pub fn dims(&self) -> [u64; 4] {
        [1, 3, self.height as u64, self.width as u64]
    }
}

/// Turns decoded images into normalized model input.
#[derive(Debug, Clone)]
pub struct Preprocessor {
    config: PreprocessorConfig,
}

impl Preprocessor {
    pub fn new(config: PreprocessorConfig) -> Self {
        Self { config }
    }

    pub fn from_model_dir(model_dir: &Path) -> Result<Self> {
        let path = model_dir.join(PREPROCESSOR_CONFIG_FILE);
        let raw = std::fs::read_to_string(&path).map_err(|e| {
            ServiceError::ModelLoad(format!("cannot read {}: {}", path.display(), e))
        })?;
        let config: PreprocessorConfig = serde_json::from_str(&raw).map_err(|e| {
            ServiceError::ModelLoad(format!("cannot parse {}: {}", path.display(), e))
        })?;
        Ok(Self::new(config))
    }

    pub fn preprocess(&self, image: &RgbImage) -> PixelValues {
        let cfg = &self.config;
        let mut img = if cfg.do_resize {
            let (w, h) = target_dims(cfg.size, image.width(), image.height());
            imageops::resize(image, w, h, filter_for(cfg.resample))
        } else {
            image.clone()
        };

        if cfg.do_center_crop {
            let crop = cfg.crop_size.unwrap_or(cfg.size);
            let (w, h) = target_dims(crop, img.width(), img.height());
            img = center_crop(&img, w, h);
        }

        let (width, height) = img.dimensions();
        let plane = (width * height) as usize;
        let mut data = vec![0f32; plane * 3];
        for (x, y, pixel) in img.enumerate_pixels() {
            let offset = (y * width + x) as usize;
            for c in 0..3 {
                let mut value = pixel[c] as f32;
                if cfg.do_rescale {
                    value *= cfg.rescale_factor;
                }
                if cfg.do_normalize {
                    value = (value - cfg.image_mean[c]) / cfg.image_std[c];
                }
                data[c * plane + offset] = value;
            }
        }

        PixelValues {
            height,
            width,
            data,
        }
    }
}

/// Decodes uploaded bytes into a 3-channel image.
pub fn decode(bytes: &[u8]) -> Result<RgbImage> {
    let img = image::load_from_memory(bytes).map_err(ServiceError::InvalidImage)?;
    Ok(img.to_rgb8())
}

fn target_dims(size: SizeSpec, width: u32, height: u32) -> (u32, u32) {
    match size {
        SizeSpec::Exact { height, width } => (width, height),
        SizeSpec::Square(side) => (side, side),
        SizeSpec::ShortestEdge { shortest_edge } => {
            let (w, h) = (width.max(1) as f32, height.max(1) as f32);
            let scale = shortest_edge as f32 / w.min(h);
            let scaled = |v: f32| ((v * scale).round() as u32).max(1);
            (scaled(w), scaled(h))
        }
    }
}

// PIL resample codes.
fn filter_for(resample: u8) -> FilterType {
    match resample {
        0 => FilterType::Nearest,
        1 => FilterType::Lanczos3,
        3 => FilterType::CatmullRom,
        _ => FilterType::Triangle,
    }
}

fn center_crop(image: &RgbImage, width: u32, height: u32) -> RgbImage {
    let width = width.min(image.width());
    let height = height.min(image.height());
    let x = (image.width() - width) / 2;
    let y = (image.height() - height) / 2;
    imageops::crop_imm(image, x, y, width, height).to_image()
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{DynamicImage, ImageOutputFormat, Rgb};
    use std::io::Cursor;

    fn solid(width: u32, height: u32, rgb: [u8; 3]) -> RgbImage {
        RgbImage::from_pixel(width, height, Rgb(rgb))
    }

    #[test]
    fn default_config_matches_vit() {
        let cfg: PreprocessorConfig = serde_json::from_str("{}").unwrap();
        assert!(cfg.do_resize && cfg.do_rescale && cfg.do_normalize);
        assert_eq!(cfg.size, SizeSpec::Exact { height: 224, width: 224 });
        assert_eq!(cfg.image_mean, [0.5; 3]);
    }

    #[test]
    fn parses_size_variants() {
        let exact: PreprocessorConfig =
            serde_json::from_str(r#"{"size": {"height": 32, "width": 48}}"#).unwrap();
        assert_eq!(exact.size, SizeSpec::Exact { height: 32, width: 48 });

        let edge: PreprocessorConfig =
            serde_json::from_str(r#"{"size": {"shortest_edge": 256}, "image_processor_type": "X"}"#)
                .unwrap();
        assert_eq!(edge.size, SizeSpec::ShortestEdge { shortest_edge: 256 });

        let square: PreprocessorConfig = serde_json::from_str(r#"{"size": 64}"#).unwrap();
        assert_eq!(square.size, SizeSpec::Square(64));
    }

    #[test]
    fn produces_channel_first_normalized_tensor() {
        let pre = Preprocessor::new(PreprocessorConfig {
            size: SizeSpec::Exact { height: 4, width: 6 },
            ..Default::default()
        });
        let out = pre.preprocess(&solid(10, 10, [255, 0, 51]));

        assert_eq!(out.dims(), [1, 3, 4, 6]);
        assert_eq!(out.data.len(), 3 * 4 * 6);
        let plane = 24;
        assert!((out.data[0] - 1.0).abs() < 1e-5);
        assert!((out.data[plane] + 1.0).abs() < 1e-5);
        assert!((out.data[2 * plane] + 0.6).abs() < 1e-5);
    }

    #[test]
    fn shortest_edge_then_center_crop() {
        let pre = Preprocessor::new(PreprocessorConfig {
            size: SizeSpec::ShortestEdge { shortest_edge: 8 },
            do_center_crop: true,
            crop_size: Some(SizeSpec::Exact { height: 6, width: 6 }),
            ..Default::default()
        });
        let out = pre.preprocess(&solid(20, 10, [0, 0, 0]));
        assert_eq!((out.width, out.height), (6, 6));
    }

    #[test]
    fn shortest_edge_keeps_aspect_ratio() {
        assert_eq!(
            target_dims(SizeSpec::ShortestEdge { shortest_edge: 8 }, 20, 10),
            (16, 8)
        );
    }

    #[test]
    fn decode_converts_grayscale_to_rgb() {
        let gray = DynamicImage::ImageLuma8(image::GrayImage::from_pixel(3, 2, image::Luma([9])));
        let mut bytes = Vec::new();
        gray.write_to(&mut Cursor::new(&mut bytes), ImageOutputFormat::Png)
            .unwrap();

        let rgb = decode(&bytes).unwrap();
        assert_eq!(rgb.dimensions(), (3, 2));
        assert_eq!(rgb.get_pixel(0, 0), &Rgb([9, 9, 9]));
    }

    #[test]
    fn loads_config_from_model_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(PREPROCESSOR_CONFIG_FILE),
            r#"{"size": {"height": 5, "width": 7}, "image_mean": [0.0, 0.0, 0.0], "image_std": [1.0, 1.0, 1.0]}"#,
        )
        .unwrap();

        let pre = Preprocessor::from_model_dir(dir.path()).unwrap();
        let out = pre.preprocess(&solid(3, 3, [255, 255, 255]));
        assert_eq!(out.dims(), [1, 3, 5, 7]);
        assert!((out.data[0] - 1.0).abs() < 1e-5);
    }

    #[test]
    fn missing_preprocessor_config_is_a_load_failure() {
        let dir = tempfile::tempdir().unwrap();
        let err = Preprocessor::from_model_dir(dir.path()).unwrap_err();
        assert!(matches!(err, ServiceError::ModelLoad(_)));
    }

    #[test]
    fn malformed_preprocessor_config_is_a_load_failure() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(PREPROCESSOR_CONFIG_FILE), "{\"size\": ").unwrap();
        let err = Preprocessor::from_model_dir(dir.path()).unwrap_err();
        assert!(matches!(err, ServiceError::ModelLoad(_)));
    }

    #[test]
    fn decode_rejects_garbage() {
        let err = decode(b"definitely not a png").unwrap_err();
        assert!(matches!(err, ServiceError::InvalidImage(_)));
        assert_eq!(err.to_string(), "Invalid image file");
    }
}
