//! Detector frames and illumination masks.
//!
//! A [`Frame`] is an immutable row-major grid of samples together with the
//! orientation of the slit on the detector. All reduction stages address
//! pixels as `(spatial, dispersion)` through [`Frame::get`], so either detector
//! axis may carry the slit without transposing the data.
//!
//! # Example
//!
//! ```
//! use longslit::{Frame, SpatialAxis};
//!
//! // 3 rows × 4 columns, slit along Y (rows), dispersion along X (columns)
//! let pixels: Vec<f64> = (0..12).map(|v| v as f64).collect();
//! let frame = Frame::from_raw(pixels, 4, 3, SpatialAxis::Y).unwrap();
//! assert_eq!(frame.n_spatial(), 3);
//! assert_eq!(frame.n_dispersion(), 4);
//! assert_eq!(frame.get(1, 2), 6.0);
//! ```

use crate::error::{ReductionError, Result};
use crate::stats;

/// Which detector axis runs along the slit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SpatialAxis {
    /// Slit along image rows (Y); wavelength varies along X. The usual layout.
    #[default]
    Y,
    /// Slit along image columns (X); wavelength varies along Y.
    X,
}

/// Immutable 2-D detector image.
#[derive(Debug, Clone)]
pub struct Frame {
    pixels: Vec<f64>,
    width: usize,
    height: usize,
    spatial_axis: SpatialAxis,
}

impl Frame {
    /// Build a frame from row-major pixel data.
    ///
    /// `pixels.len()` must equal `width * height`.
    pub fn from_raw(
        pixels: Vec<f64>,
        width: usize,
        height: usize,
        spatial_axis: SpatialAxis,
    ) -> Result<Self> {
        if pixels.len() != width * height {
            return Err(ReductionError::DimensionMismatch(format!(
                "pixel data length ({}) does not match width*height ({}x{}={})",
                pixels.len(),
                width,
                height,
                width * height
            )));
        }
        if pixels.is_empty() {
            return Err(ReductionError::EmptyInput("frame pixels"));
        }
        Ok(Self {
            pixels,
            width,
            height,
            spatial_axis,
        })
    }

    /// Build a frame by evaluating `f(spatial, dispersion)` at every pixel.
    ///
    /// Handy for synthetic frames; the result uses [`SpatialAxis::Y`].
    pub fn from_fn(
        n_spatial: usize,
        n_dispersion: usize,
        mut f: impl FnMut(usize, usize) -> f64,
    ) -> Self {
        let mut pixels = Vec::with_capacity(n_spatial * n_dispersion);
        for s in 0..n_spatial {
            for d in 0..n_dispersion {
                pixels.push(f(s, d));
            }
        }
        Self {
            pixels,
            width: n_dispersion,
            height: n_spatial,
            spatial_axis: SpatialAxis::Y,
        }
    }

    /// Image width (columns).
    pub fn width(&self) -> usize {
        self.width
    }

    /// Image height (rows).
    pub fn height(&self) -> usize {
        self.height
    }

    pub fn spatial_axis(&self) -> SpatialAxis {
        self.spatial_axis
    }

    /// Row-major pixel data.
    pub fn pixels(&self) -> &[f64] {
        &self.pixels
    }

    /// Extent along the slit.
    pub fn n_spatial(&self) -> usize {
        match self.spatial_axis {
            SpatialAxis::Y => self.height,
            SpatialAxis::X => self.width,
        }
    }

    /// Extent along the dispersion direction.
    pub fn n_dispersion(&self) -> usize {
        match self.spatial_axis {
            SpatialAxis::Y => self.width,
            SpatialAxis::X => self.height,
        }
    }

    /// Sample at `(spatial, dispersion)`.
    ///
    /// # Panics
    /// Panics if either index is out of bounds.
    #[inline]
    pub fn get(&self, spatial: usize, dispersion: usize) -> f64 {
        match self.spatial_axis {
            SpatialAxis::Y => self.pixels[spatial * self.width + dispersion],
            SpatialAxis::X => self.pixels[dispersion * self.width + spatial],
        }
    }

    /// Median of all finite samples (0 for an all-NaN frame).
    pub fn median(&self) -> f64 {
        stats::median(&self.pixels).unwrap_or(0.0)
    }

    /// Copy of this frame passed through a square median filter.
    ///
    /// Crudely removes impulsive outliers such as cosmic-ray hits.
    pub fn median_filtered(&self, kernel: usize) -> Frame {
        Frame {
            pixels: stats::median_filter_2d(&self.pixels, self.width, self.height, kernel),
            width: self.width,
            height: self.height,
            spatial_axis: self.spatial_axis,
        }
    }

    /// Sum over the dispersion range `[d0, d1)` at each listed spatial index.
    pub fn spatial_profile(&self, spatial: &[usize], d0: usize, d1: usize) -> Vec<f64> {
        let d1 = d1.min(self.n_dispersion());
        spatial
            .iter()
            .map(|&s| (d0..d1).map(|d| self.get(s, d)).sum())
            .collect()
    }

    /// Sum over the spatial range `[s0, s1)` at each dispersion index in `[d0, d1)`.
    ///
    /// Ranges are clipped to the frame.
    pub fn dispersion_profile(&self, s0: usize, s1: usize, d0: usize, d1: usize) -> Vec<f64> {
        let s1 = s1.min(self.n_spatial());
        let d1 = d1.min(self.n_dispersion());
        (d0..d1)
            .map(|d| (s0..s1).map(|s| self.get(s, d)).sum())
            .collect()
    }
}

#[cfg(feature = "image")]
impl Frame {
    /// Load an image file (PNG, TIFF, ...) as a frame.
    pub fn open(
        path: impl AsRef<std::path::Path>,
        spatial_axis: SpatialAxis,
    ) -> anyhow::Result<Self> {
        use anyhow::Context;
        let img = image::open(path.as_ref())
            .with_context(|| format!("Failed to open image: {}", path.as_ref().display()))?;
        Ok(Self::from_image(&img, spatial_axis)?)
    }

    /// Convert an in-memory [`image::DynamicImage`] to a grayscale frame.
    pub fn from_image(img: &image::DynamicImage, spatial_axis: SpatialAxis) -> Result<Self> {
        use image::{DynamicImage, GenericImageView};
        let (width, height) = img.dimensions();
        let (width, height) = (width as usize, height as usize);
        let luma = |r: f64, g: f64, b: f64| 0.2126 * r + 0.7152 * g + 0.0722 * b;
        let pixels: Vec<f64> = match img {
            DynamicImage::ImageLuma16(g) => g.as_raw().iter().map(|&v| v as f64).collect(),
            DynamicImage::ImageLumaA16(g) => g.pixels().map(|p| p.0[0] as f64).collect(),
            DynamicImage::ImageRgb16(rgb) => rgb
                .pixels()
                .map(|p| luma(p.0[0] as f64, p.0[1] as f64, p.0[2] as f64))
                .collect(),
            DynamicImage::ImageRgba16(rgba) => rgba
                .pixels()
                .map(|p| luma(p.0[0] as f64, p.0[1] as f64, p.0[2] as f64))
                .collect(),
            DynamicImage::ImageRgb32F(rgb) => rgb
                .pixels()
                .map(|p| luma(p.0[0] as f64, p.0[1] as f64, p.0[2] as f64))
                .collect(),
            DynamicImage::ImageRgba32F(rgba) => rgba
                .pixels()
                .map(|p| luma(p.0[0] as f64, p.0[1] as f64, p.0[2] as f64))
                .collect(),
            _ => img.to_luma8().as_raw().iter().map(|&v| v as f64).collect(),
        };
        Self::from_raw(pixels, width, height, spatial_axis)
    }
}

/// The spatial indices (rows or columns along the slit) that are illuminated.
///
/// Vignetted ends of the slit are excluded from tracing. The default mask
/// treats every spatial index as valid.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IlluminationMask {
    indices: Option<Vec<usize>>,
}

impl IlluminationMask {
    /// Every spatial index valid.
    pub fn all() -> Self {
        Self { indices: None }
    }

    /// Only the listed spatial indices are valid (sorted and deduplicated).
    pub fn from_indices(mut indices: Vec<usize>) -> Self {
        indices.sort_unstable();
        indices.dedup();
        Self {
            indices: Some(indices),
        }
    }

    /// Contiguous illuminated band `[start, end)`.
    pub fn from_range(start: usize, end: usize) -> Self {
        Self::from_indices((start..end).collect())
    }

    /// Valid indices for a slit `n_spatial` samples long, ascending.
    pub fn valid_indices(&self, n_spatial: usize) -> Vec<usize> {
        match &self.indices {
            None => (0..n_spatial).collect(),
            Some(idx) => idx.iter().copied().filter(|&i| i < n_spatial).collect(),
        }
    }
}
