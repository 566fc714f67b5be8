use image::imageops::{resize, FilterType};
use image::GrayImage;

use super::DetectError;

/// Row-major grayscale raster used by every analysis stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PixelMatrix {
    width: u32,
    height: u32,
    pixels: Vec<u8>,
    source_width: u32,
    source_height: u32,
}

impl PixelMatrix {
    /// Wraps an existing buffer. The source dimensions equal the buffer's own.
    pub fn from_raw(width: u32, height: u32, pixels: Vec<u8>) -> Result<Self, DetectError> {
        if width == 0 || height == 0 {
            return Err(DetectError::EmptyImage { width, height });
        }
        let expected = width as usize * height as usize;
        if pixels.len() != expected {
            return Err(DetectError::Decode(format!(
                "pixel buffer holds {} values, expected {}",
                pixels.len(),
                expected
            )));
        }
        Ok(Self {
            width,
            height,
            pixels,
            source_width: width,
            source_height: height,
        })
    }

    pub fn from_fn(width: u32, height: u32, f: impl Fn(u32, u32) -> u8) -> Result<Self, DetectError> {
        let mut pixels = Vec::with_capacity(width as usize * height as usize);
        for y in 0..height {
            for x in 0..width {
                pixels.push(f(x, y));
            }
        }
        Self::from_raw(width, height, pixels)
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn source_dimensions(&self) -> (u32, u32) {
        (self.source_width, self.source_height)
    }

    /// Width over height of the decoded image before any downsampling.
    pub fn aspect_ratio(&self) -> f64 {
        self.source_width as f64 / self.source_height as f64
    }

    pub fn get(&self, x: u32, y: u32) -> u8 {
        self.pixels[y as usize * self.width as usize + x as usize]
    }

    /// Iterates one column top to bottom.
    pub fn column(&self, x: u32) -> impl Iterator<Item = u8> + '_ {
        let stride = self.width as usize;
        self.pixels
            .iter()
            .skip(x as usize)
            .step_by(stride)
            .copied()
    }
}

/// Decodes `bytes`, converts to grayscale and shrinks to at most `target_width` columns.
pub fn decode(bytes: &[u8], target_width: u32) -> Result<PixelMatrix, DetectError> {
    if bytes.is_empty() {
        return Err(DetectError::NoBytes);
    }

    let image = image::load_from_memory(bytes)?;
    let gray = image.to_luma8();
    let (source_width, source_height) = gray.dimensions();
    if source_width == 0 || source_height == 0 {
        return Err(DetectError::EmptyImage {
            width: source_width,
            height: source_height,
        });
    }

    let scaled = downsample(gray, target_width);
    let (width, height) = scaled.dimensions();

    Ok(PixelMatrix {
        width,
        height,
        pixels: scaled.into_raw(),
        source_width,
        source_height,
    })
}

fn downsample(gray: GrayImage, target_width: u32) -> GrayImage {
    let (width, height) = gray.dimensions();
    if target_width == 0 || width <= target_width {
        return gray;
    }

    let scaled_height = ((height as f64 * target_width as f64 / width as f64).round() as u32).max(1);
    resize(&gray, target_width, scaled_height, FilterType::Triangle)
}
