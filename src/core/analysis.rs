use image::{imageops::FilterType, DynamicImage, GrayImage};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Side of the square grid every image is downsampled to before analysis.
pub const ANALYSIS_GRID: u32 = 128;

#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("Image decoding error: {0}")]
    Decode(#[from] image::ImageError),

    #[error("Image too small for analysis: {width}x{height}")]
    TooSmall { width: u32, height: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QualityMetrics {
    /// Mean greyscale intensity, 0-255.
    pub brightness: f64,
    /// Variance of the Laplacian response over interior pixels.
    pub sharpness: f64,
}

/// Decode `bytes` and measure brightness and sharpness on a fixed grid.
pub fn analyze_bytes(bytes: &[u8]) -> Result<QualityMetrics, AnalysisError> {
    let image = image::load_from_memory(bytes)?;
    analyze_image(&image)
}

pub fn analyze_image(image: &DynamicImage) -> Result<QualityMetrics, AnalysisError> {
    if image.width() == 0 || image.height() == 0 {
        return Err(AnalysisError::TooSmall {
            width: image.width(),
            height: image.height(),
        });
    }

    let gray = image
        .resize_exact(ANALYSIS_GRID, ANALYSIS_GRID, FilterType::Triangle)
        .to_luma8();

    Ok(QualityMetrics {
        brightness: mean_brightness(&gray),
        sharpness: laplacian_variance(&gray),
    })
}

fn mean_brightness(gray: &GrayImage) -> f64 {
    let count = gray.pixels().len();
    if count == 0 {
        return 0.0;
    }
    let sum: f64 = gray.pixels().map(|p| p[0] as f64).sum();
    sum / count as f64
}

/// Variance of the 4-neighbour Laplacian. Edge pixels lack a full 3x3
/// neighbourhood and are left out of the sample.
pub fn laplacian_variance(gray: &GrayImage) -> f64 {
    let (width, height) = gray.dimensions();
    if width < 3 || height < 3 {
        return 0.0;
    }

    let kernel: [[f64; 3]; 3] = [[0.0, 1.0, 0.0], [1.0, -4.0, 1.0], [0.0, 1.0, 0.0]];

    let mut responses = Vec::with_capacity(((width - 2) * (height - 2)) as usize);
    for y in 1..(height - 1) {
        for x in 1..(width - 1) {
            let mut laplacian = 0.0;
            for (ky, row) in kernel.iter().enumerate() {
                for (kx, weight) in row.iter().enumerate() {
                    let pixel = gray.get_pixel(x + kx as u32 - 1, y + ky as u32 - 1)[0] as f64;
                    laplacian += pixel * weight;
                }
            }
            responses.push(laplacian);
        }
    }

    let n = responses.len() as f64;
    let mean = responses.iter().sum::<f64>() / n;
    responses.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / n
}
