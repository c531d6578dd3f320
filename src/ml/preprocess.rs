//! 画像の前処理
//!
//! 学習（ディスク上の画像）と推論（アップロードされたバイト列）の両方で共通に使用します。
//! 任意形式の画像をデコードし、正方形にリサイズして [0,1] に正規化します。

use image::{imageops::FilterType, RgbImage};

use crate::error::Result;

/// モデル入力の画像サイズ（正方形）
pub const IMAGE_SIZE: usize = 128;

/// 前処理済み画像
///
/// `data` は (C, H, W) の順で平坦化されたRGB値（各値は [0,1]）。
#[derive(Debug, Clone, PartialEq)]
pub struct PreprocessedImage {
    pub size: usize,
    pub data: Vec<f32>,
}

impl PreprocessedImage {
    /// 正規化を戻して8bit RGB画像に変換
    pub fn to_rgb_image(&self) -> RgbImage {
        let size = self.size;
        let plane = size * size;
        RgbImage::from_fn(size as u32, size as u32, |x, y| {
            let offset = y as usize * size + x as usize;
            let channel = |c: usize| (self.data[c * plane + offset] * 255.0).round().clamp(0.0, 255.0) as u8;
            image::Rgb([channel(0), channel(1), channel(2)])
        })
    }
}

/// 前処理器
#[derive(Debug, Clone, Copy)]
pub struct Preprocessor {
    size: usize,
}

impl Default for Preprocessor {
    fn default() -> Self {
        Self::new(IMAGE_SIZE)
    }
}

impl Preprocessor {
    pub fn new(size: usize) -> Self {
        Self { size }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// デコードしてリサイズ（縦横比は保持しない）
    ///
    /// アルファチャンネルは捨て、グレースケールは3チャンネルに複製されます。
    pub fn decode_resized(&self, bytes: &[u8]) -> Result<RgbImage> {
        let img = image::load_from_memory(bytes)?;
        let side = self.size as u32;
        let rgb = if img.width() == side && img.height() == side {
            img.to_rgb8()
        } else {
            img.resize_exact(side, side, FilterType::Nearest).to_rgb8()
        };
        Ok(rgb)
    }

    /// バイト列から前処理済み画像を生成
    pub fn preprocess(&self, bytes: &[u8]) -> Result<PreprocessedImage> {
        let rgb = self.decode_resized(bytes)?;
        Ok(self.normalize(&rgb))
    }

    /// RGB画像を (C, H, W) 順の [0,1] 値に変換
    pub fn normalize(&self, img: &RgbImage) -> PreprocessedImage {
        let (width, height) = img.dimensions();
        let mut data = Vec::with_capacity(3 * width as usize * height as usize);

        for channel in 0..3 {
            for y in 0..height {
                for x in 0..width {
                    let pixel = img.get_pixel(x, y);
                    data.push(pixel[channel] as f32 / 255.0);
                }
            }
        }

        PreprocessedImage {
            size: self.size,
            data,
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use image::{DynamicImage, GrayImage, ImageFormat, Rgba, RgbaImage};
    use std::io::Cursor;

    pub(crate) fn encode(img: DynamicImage, format: ImageFormat) -> Vec<u8> {
        let mut bytes = Cursor::new(Vec::new());
        img.write_to(&mut bytes, format).unwrap();
        bytes.into_inner()
    }

    /// 単色のPNG画像
    pub(crate) fn solid_png(width: u32, height: u32, rgb: [u8; 3]) -> Vec<u8> {
        let img = RgbImage::from_pixel(width, height, image::Rgb(rgb));
        encode(DynamicImage::ImageRgb8(img), ImageFormat::Png)
    }

    #[test]
    fn output_shape_is_square_rgb() {
        let pre = Preprocessor::new(16);
        let out = pre.preprocess(&solid_png(40, 10, [255, 0, 128])).unwrap();
        assert_eq!(out.size, 16);
        assert_eq!(out.data.len(), 3 * 16 * 16);
        assert!(out.data.iter().all(|v| (0.0..=1.0).contains(v)));
        // チャンネル順 (C, H, W)
        assert_eq!(out.data[0], 1.0);
        assert_eq!(out.data[16 * 16], 0.0);
        assert!((out.data[2 * 16 * 16] - 128.0 / 255.0).abs() < 1e-6);
    }

    #[test]
    fn grayscale_is_replicated() {
        let gray = GrayImage::from_pixel(8, 8, image::Luma([51]));
        let bytes = encode(DynamicImage::ImageLuma8(gray), ImageFormat::Png);
        let out = Preprocessor::new(8).preprocess(&bytes).unwrap();
        assert_eq!(out.data.len(), 3 * 64);
        assert!(out.data.iter().all(|v| (v - 0.2).abs() < 1e-6));
    }

    #[test]
    fn alpha_is_dropped() {
        let rgba = RgbaImage::from_pixel(8, 8, Rgba([10, 20, 30, 0]));
        let bytes = encode(DynamicImage::ImageRgba8(rgba), ImageFormat::Png);
        let out = Preprocessor::new(8).preprocess(&bytes).unwrap();
        assert_eq!(out.data.len(), 3 * 64);
        assert!((out.data[0] - 10.0 / 255.0).abs() < 1e-6);
    }

    #[test]
    fn garbage_bytes_fail_to_decode() {
        let err = Preprocessor::default().preprocess(b"not an image").unwrap_err();
        assert!(matches!(err, crate::error::LoafError::Decode(_)));
    }

    #[test]
    fn preprocessing_is_idempotent() {
        let pre = Preprocessor::new(32);
        let img = RgbImage::from_fn(32, 32, |x, y| image::Rgb([(x * 8) as u8, (y * 8) as u8, 200]));
        let bytes = encode(DynamicImage::ImageRgb8(img), ImageFormat::Png);

        let once = pre.preprocess(&bytes).unwrap();
        let again_bytes = encode(DynamicImage::ImageRgb8(once.to_rgb_image()), ImageFormat::Png);
        let twice = pre.preprocess(&again_bytes).unwrap();

        assert_eq!(once.data.len(), twice.data.len());
        for (a, b) in once.data.iter().zip(twice.data.iter()) {
            assert!((a - b).abs() < 1e-6);
        }
    }
}
