//! Emission-line peak detection in a 1-D arc-lamp slice.
//!
//! Samples at or above a flux percentile are grouped into clusters, each
//! cluster's brightest sample seeds a Gaussian fit over a `2·pwidth` window,
//! and the fitted sub-pixel center is paired with the raw wavelength of the
//! brightest sample in the window.

use std::cmp::Ordering;

use tracing::debug;

use crate::error::{ReductionError, Result};
use crate::gaussian::{fit_with_fallback, Fallback, GaussianFitConfig, GaussianParams};
use crate::stats;

/// Configuration for [`find_peaks`].
#[derive(Debug, Clone)]
pub struct PeakConfig {
    /// Half-width of the fit window in pixels. Peaks closer than this to
    /// either end of the slice are discarded.
    /// Default: 10
    pub pwidth: usize,

    /// Flux percentile (0–100) a sample must reach to be flagged.
    /// Default: 97.0
    pub pthreshold: f64,

    /// Flagged samples more than this many pixels apart start a new peak.
    /// Default: 1
    pub minsep: usize,

    /// Initial Gaussian width guess in pixels.
    /// Default: 2.0
    pub width_guess: f64,

    pub fit: GaussianFitConfig,
}

impl Default for PeakConfig {
    fn default() -> Self {
        Self {
            pwidth: 10,
            pthreshold: 97.0,
            minsep: 1,
            width_guess: 2.0,
            fit: GaussianFitConfig::default(),
        }
    }
}

/// One detected line.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Peak {
    /// Fitted sub-pixel center.
    pub pixel: f64,
    /// Approximate wavelength of the brightest sample in the fit window.
    pub wavelength: f64,
}

/// Peaks from one slice, unique and ordered by approximate wavelength.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PeakSet {
    peaks: Vec<Peak>,
}

impl PeakSet {
    /// Sort by wavelength and drop invalid entries and repeated wavelengths
    /// (first occurrence wins).
    pub fn from_peaks(mut peaks: Vec<Peak>) -> Self {
        peaks.retain(|p| p.pixel.is_finite() && p.wavelength.is_finite());
        peaks.sort_by(|a, b| {
            a.wavelength
                .partial_cmp(&b.wavelength)
                .unwrap_or(Ordering::Equal)
        });
        peaks.dedup_by(|later, earlier| later.wavelength == earlier.wavelength);
        Self { peaks }
    }

    pub fn len(&self) -> usize {
        self.peaks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peaks.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Peak> {
        self.peaks.iter()
    }

    pub fn as_slice(&self) -> &[Peak] {
        &self.peaks
    }

    pub fn pixels(&self) -> Vec<f64> {
        self.peaks.iter().map(|p| p.pixel).collect()
    }

    pub fn wavelengths(&self) -> Vec<f64> {
        self.peaks.iter().map(|p| p.wavelength).collect()
    }
}

/// Locate emission-line peaks in `flux`, with `wave` the approximate
/// wavelength of every sample.
///
/// A flat slice, or one whose peaks all sit near the ends, yields an empty set.
pub fn find_peaks(wave: &[f64], flux: &[f64], config: &PeakConfig) -> Result<PeakSet> {
    if wave.len() != flux.len() {
        return Err(ReductionError::DimensionMismatch(format!(
            "peak search: {} wavelengths vs {} flux samples",
            wave.len(),
            flux.len()
        )));
    }
    let n = flux.len();
    let Some(threshold) = stats::percentile(flux, config.pthreshold) else {
        return Ok(PeakSet::default());
    };
    let offset_guess = stats::median(flux).unwrap_or(0.0);

    let clusters = cluster_flagged(flux, threshold, config.minsep);
    let pw = config.pwidth;

    let mut peaks: Vec<Peak> = Vec::new();
    for cluster in &clusters {
        let Some(rel) = stats::argmax(&flux[cluster.0..=cluster.1]) else {
            continue;
        };
        let pk = cluster.0 + rel;
        if pk < pw || pk + pw > n {
            continue;
        }
        let (lo, hi) = (pk - pw, pk + pw);
        let window = &flux[lo..hi];
        let x: Vec<f64> = (lo..hi).map(|i| i as f64).collect();
        let Some(imax) = stats::argmax(window) else {
            continue;
        };
        let seed = GaussianParams::new(
            window[imax],
            offset_guess,
            (lo + imax) as f64,
            config.width_guess,
        );
        let outcome = fit_with_fallback(
            &x,
            window,
            seed,
            &config.fit,
            |p| p.center.is_finite() && p.center >= pw as f64 && p.center < (n - pw) as f64,
            Fallback::Skip,
        );
        if let Some(p) = outcome.params() {
            peaks.push(Peak {
                pixel: p.center,
                wavelength: wave[lo + imax],
            });
        }
    }

    let peaks = PeakSet::from_peaks(peaks);
    debug!(
        "find_peaks: {} clusters above {:.3} ({}th percentile), {} peaks kept",
        clusters.len(),
        threshold,
        config.pthreshold,
        peaks.len()
    );
    Ok(peaks)
}

/// Inclusive index ranges of flagged samples, split wherever consecutive
/// flagged indices differ by more than `minsep`.
fn cluster_flagged(flux: &[f64], threshold: f64, minsep: usize) -> Vec<(usize, usize)> {
    let mut clusters: Vec<(usize, usize)> = Vec::new();
    for (i, _) in flux
        .iter()
        .enumerate()
        .filter(|(_, v)| v.is_finite() && **v >= threshold)
    {
        match clusters.last_mut() {
            Some(last) if i - last.1 <= minsep => last.1 = i,
            _ => clusters.push((i, i)),
        }
    }
    clusters
}
