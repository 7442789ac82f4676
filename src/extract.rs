//! Aperture photometry along a trace.
//!
//! At every dispersion column the frame is summed over `2·apwidth + 1` spatial
//! pixels centered on the trace. The sky comes from two flanking windows,
//! `skysep` pixels beyond the aperture and `skywidth` pixels wide, either as
//! their mean or as a low-order polynomial integrated across the aperture.
//! The returned flux is **not** sky subtracted.

use tracing::{debug, warn};

use crate::aperture::Trace;
use crate::error::{ReductionError, Result};
use crate::frame::Frame;
use crate::polynomial::Polynomial;
use crate::stats;

/// Configuration for [`extract_aperture`].
#[derive(Debug, Clone)]
pub struct ExtractionConfig {
    /// Aperture half-width in pixels.
    /// Default: 8
    pub apwidth: usize,

    /// Gap between the aperture and each sky window, in pixels.
    /// Default: 3
    pub skysep: usize,

    /// Width of each sky window, in pixels.
    /// Default: 7
    pub skywidth: usize,

    /// Polynomial degree of the sky model; 0 uses the mean.
    /// Default: 0
    pub skydeg: usize,

    /// Number of co-added exposures in the frame.
    /// Default: 1
    pub coadd: usize,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            apwidth: 8,
            skysep: 3,
            skywidth: 7,
            skydeg: 0,
            coadd: 1,
        }
    }
}

/// Per-column flux, sky and flux uncertainty, indexed like the trace.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExtractionResult {
    pub flux: Vec<f64>,
    pub sky: Vec<f64>,
    pub flux_err: Vec<f64>,
}

impl ExtractionResult {
    pub fn len(&self) -> usize {
        self.flux.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flux.is_empty()
    }
}

/// Extract the spectrum along `trace`.
///
/// Windows that would leave the frame are clipped rather than rejected.
pub fn extract_aperture(
    frame: &Frame,
    trace: &Trace,
    config: &ExtractionConfig,
) -> Result<ExtractionResult> {
    let nd = frame.n_dispersion();
    if trace.len() != nd {
        return Err(ReductionError::DimensionMismatch(format!(
            "trace has {} positions, frame has {} dispersion pixels",
            trace.len(),
            nd
        )));
    }
    let ns = frame.n_spatial() as f64;
    let apw = config.apwidth as f64;
    let sep = config.skysep as f64;
    let skw = config.skywidth as f64;
    let n_aperture = 2.0 * apw + 1.0;
    let coadd = config.coadd.max(1) as f64;

    let mut result = ExtractionResult {
        flux: Vec::with_capacity(nd),
        sky: Vec::with_capacity(nd),
        flux_err: Vec::with_capacity(nd),
    };
    let mut starved = 0usize;
    for (col, t) in trace.iter().enumerate() {
        if !t.is_finite() {
            result.flux.push(f64::NAN);
            result.sky.push(f64::NAN);
            result.flux_err.push(f64::NAN);
            continue;
        }

        // Aperture, clipped to the frame
        let lo = (t - apw).floor().max(0.0);
        let hi = (t + apw + 1.0).floor().min(ns);
        let flux: f64 = index_range(lo, hi)
            .map(|s| frame.get(s, col))
            .filter(|v| v.is_finite())
            .sum();

        // Flanking sky windows, clipped to the frame
        let below = index_range(
            (t - apw - sep - skw).floor().max(0.0),
            (t - apw - sep).floor().clamp(0.0, ns),
        );
        let above = index_range(
            (t + apw + sep + 1.0).floor().max(0.0),
            (t + apw + sep + skw + 1.0).floor().min(ns),
        );
        let (sky_y, sky_z): (Vec<f64>, Vec<f64>) = below
            .chain(above)
            .map(|s| (s as f64, frame.get(s, col)))
            .filter(|(_, z)| z.is_finite())
            .unzip();

        if sky_z.is_empty() {
            starved += 1;
            result.flux.push(flux);
            result.sky.push(0.0);
            result.flux_err.push((flux / coadd).max(0.0).sqrt());
            continue;
        }

        let sky = if config.skydeg == 0 {
            stats::mean(&sky_z).unwrap_or(0.0) * n_aperture
        } else {
            match Polynomial::fit_auto(&sky_y, &sky_z, config.skydeg) {
                Ok(poly) => (0..=2 * config.apwidth)
                    .map(|k| poly.eval(t - apw + k as f64))
                    .sum(),
                Err(_) => stats::mean(&sky_z).unwrap_or(0.0) * n_aperture,
            }
        };

        let sig_b = match (
            stats::percentile(&sky_z, 84.0),
            stats::percentile(&sky_z, 16.0),
        ) {
            (Some(q84), Some(q16)) => (q84 - q16) / 2.0,
            _ => 0.0,
        };
        let n_sky = sky_z.len() as f64;
        let signal = ((flux - sky) / coadd).max(0.0);
        let err = (signal + (n_aperture + n_aperture * n_aperture / n_sky) * sig_b * sig_b).sqrt();

        result.flux.push(flux);
        result.sky.push(sky);
        result.flux_err.push(err);
    }
    if starved > 0 {
        warn!(
            "{} columns had no sky pixels inside the frame; sky set to 0",
            starved
        );
    }
    debug!("extracted {} columns", result.len());
    Ok(result)
}

fn index_range(lo: f64, hi: f64) -> std::ops::Range<usize> {
    let lo = lo.max(0.0) as usize;
    let hi = hi.max(0.0) as usize;
    lo..hi.max(lo)
}

/// A wavelength-calibrated 1-D spectrum.
#[derive(Debug, Clone, PartialEq)]
pub struct Spectrum {
    pub wavelength: Vec<f64>,
    pub flux: Vec<f64>,
    pub sky: Vec<f64>,
    pub flux_err: Vec<f64>,
}

impl Spectrum {
    /// Pair per-column wavelengths with an extraction.
    pub fn new(wavelength: Vec<f64>, extraction: ExtractionResult) -> Result<Self> {
        if wavelength.len() != extraction.len() {
            return Err(ReductionError::DimensionMismatch(format!(
                "{} wavelengths for {} extracted columns",
                wavelength.len(),
                extraction.len()
            )));
        }
        Ok(Self {
            wavelength,
            flux: extraction.flux,
            sky: extraction.sky,
            flux_err: extraction.flux_err,
        })
    }

    pub fn len(&self) -> usize {
        self.wavelength.len()
    }

    pub fn is_empty(&self) -> bool {
        self.wavelength.is_empty()
    }

    /// Flux minus sky.
    pub fn sky_subtracted(&self) -> Vec<f64> {
        self.flux.iter().zip(&self.sky).map(|(f, s)| f - s).collect()
    }
}
