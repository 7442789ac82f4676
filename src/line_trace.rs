//! Follow identified arc lines along the slit.
//!
//! Each line is re-centroided row by row, walking from the middle of the slit
//! to the top and then, separately, to the bottom, so lines that bend or tilt
//! across the detector leave a continuous trail of samples.

use tracing::{debug, info};

use crate::calibrate::LinePair;
use crate::frame::{Frame, IlluminationMask};
use crate::gaussian::{fit_with_fallback, Fallback, GaussianFitConfig, GaussianParams};
use crate::stats;

/// One traced line at one spatial row.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LineSample {
    /// Fitted line center along the dispersion axis.
    pub dispersion: f64,
    /// Spatial row the band was centered on.
    pub spatial: f64,
    /// Reference wavelength of the line.
    pub wavelength: f64,
}

/// All samples from all traced lines; the input to surface fitting.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LineSampleSet {
    samples: Vec<LineSample>,
}

impl LineSampleSet {
    pub fn new(samples: Vec<LineSample>) -> Self {
        Self { samples }
    }

    pub fn push(&mut self, sample: LineSample) {
        self.samples.push(sample);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &LineSample> {
        self.samples.iter()
    }

    pub fn as_slice(&self) -> &[LineSample] {
        &self.samples
    }
}

impl FromIterator<LineSample> for LineSampleSet {
    fn from_iter<I: IntoIterator<Item = LineSample>>(iter: I) -> Self {
        Self {
            samples: iter.into_iter().collect(),
        }
    }
}

/// Configuration for [`trace_lines`].
#[derive(Debug, Clone)]
pub struct LineTraceConfig {
    /// Half-width, in dispersion pixels, of the window searched around the
    /// previous center.
    /// Default: 10
    pub maxbend: usize,

    /// Half-height of the band of rows summed at each step; also the border
    /// left untraced at both ends of the slit.
    /// Default: 10
    pub ybuf: usize,

    /// Initial Gaussian width guess in pixels.
    /// Default: 2.0
    pub width_guess: f64,

    pub fit: GaussianFitConfig,
}

impl Default for LineTraceConfig {
    fn default() -> Self {
        Self {
            maxbend: 10,
            ybuf: 10,
            width_guess: 2.0,
            fit: GaussianFitConfig::default(),
        }
    }
}

/// Trace every identified line across the illuminated rows of `frame`.
///
/// Rows whose fit fails, or lands outside the frame, are skipped without
/// ending the walk.
pub fn trace_lines(
    frame: &Frame,
    lines: &[LinePair],
    mask: &IlluminationMask,
    config: &LineTraceConfig,
) -> LineSampleSet {
    let ns = frame.n_spatial();
    let mid = ns / 2;
    let ybuf = config.ybuf;
    let valid = mask.valid_indices(ns);

    let upward: Vec<usize> = valid
        .iter()
        .copied()
        .filter(|&r| r >= mid && r + ybuf < ns)
        .collect();
    let downward: Vec<usize> = valid
        .iter()
        .rev()
        .copied()
        .filter(|&r| r < mid && r > ybuf)
        .collect();

    let mut set = LineSampleSet::default();
    for line in lines {
        let before = set.len();
        for rows in [&upward, &downward] {
            // Each direction restarts from the identified center
            let mut center = line.pixel;
            for &row in rows {
                if let Some(c) = centroid_row(frame, row, center, config) {
                    set.push(LineSample {
                        dispersion: c,
                        spatial: row as f64,
                        wavelength: line.wavelength,
                    });
                    center = c;
                }
            }
        }
        debug!(
            "line {:.2} at pixel {:.2}: {} samples",
            line.wavelength,
            line.pixel,
            set.len() - before
        );
    }
    info!(
        "traced {} lines over {} rows: {} samples",
        lines.len(),
        upward.len() + downward.len(),
        set.len()
    );
    set
}

/// Centroid of the line near `center` in the band of rows around `row`.
fn centroid_row(frame: &Frame, row: usize, center: f64, config: &LineTraceConfig) -> Option<f64> {
    let nd = frame.n_dispersion();
    let c = center.round();
    if !(0.0..nd as f64).contains(&c) {
        return None;
    }
    let c = c as usize;
    let d0 = c.saturating_sub(config.maxbend);
    let d1 = c.saturating_add(config.maxbend).min(nd);
    if d1 <= d0.saturating_add(3) {
        return None;
    }
    let s0 = row.saturating_sub(config.ybuf);
    let profile = frame.dispersion_profile(s0, row + config.ybuf, d0, d1);
    let x: Vec<f64> = (d0..d1).map(|d| d as f64).collect();

    let offset = stats::median(&profile).unwrap_or(0.0);
    let peak = stats::max(&profile).unwrap_or(offset);
    let seed = GaussianParams::new(peak - offset, offset, center, config.width_guess);
    fit_with_fallback(
        &x,
        &profile,
        seed,
        &config.fit,
        |p| p.center.is_finite() && p.center > 0.0 && p.center < nd as f64,
        Fallback::Skip,
    )
    .params()
    .map(|p| p.center)
}
