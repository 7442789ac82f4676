//! Aperture tracing: follow the target's spectrum across the dispersion axis.
//!
//! The frame is median filtered, collapsed along the dispersion axis and
//! Gaussian-fit once to get a global center. The dispersion axis is then cut
//! into `nsteps` bins; each bin's spatial profile is fit separately, seeded by
//! its own brightest (filtered) sample and the global width. Bin fits that land
//! within `edge_margin` of the illuminated edge fall back to the global center.
//! An interpolating cubic spline through the bin centers gives one position
//! per dispersion index.

use tracing::{debug, info, warn};

use crate::error::{ReductionError, Result};
use crate::frame::{Frame, IlluminationMask};
use crate::gaussian::{fit_with_fallback, Fallback, FitOutcome, GaussianFitConfig, GaussianParams};
use crate::spline::UnivariateSpline;
use crate::stats;

/// Minimum number of dispersion bins a trace is built from.
pub const MIN_BINS: usize = 4;

/// Spatial position of the target at every dispersion index.
#[derive(Debug, Clone, PartialEq)]
pub struct Trace {
    positions: Vec<f64>,
}

impl Trace {
    pub fn new(positions: Vec<f64>) -> Self {
        Self { positions }
    }

    pub fn positions(&self) -> &[f64] {
        &self.positions
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    /// Median spatial position.
    pub fn median(&self) -> Option<f64> {
        stats::median(&self.positions)
    }

    pub fn iter(&self) -> impl Iterator<Item = f64> + '_ {
        self.positions.iter().copied()
    }
}

/// Where the global spatial fit starts.
#[derive(Debug, Clone, Copy, Default)]
pub enum TraceSeed<'a> {
    /// The brightest row of the collapsed profile.
    #[default]
    Brightest,
    /// An explicit spatial position.
    Row(f64),
    /// The median of a previous trace, e.g. the standard star's trace reused
    /// on a faint target. Ignored when the prior trace has 10 samples or fewer.
    Recenter(&'a Trace),
}

/// Configuration for [`trace_aperture`].
#[derive(Debug, Clone)]
pub struct TraceConfig {
    /// Number of dispersion bins (at least 4 are always used).
    /// Default: 20
    pub nsteps: usize,

    /// Bin fits whose center is closer than this to either illuminated edge
    /// are replaced by the global center.
    /// Default: 25
    pub edge_margin: usize,

    /// Square median-filter kernel applied to the frame before tracing.
    /// Default: 5
    pub median_kernel: usize,

    /// Median-filter kernel applied to each bin's profile when seeding its fit.
    /// Default: 3
    pub bin_filter: usize,

    /// Width guess for the global profile fit, in pixels.
    /// Default: 2.0
    pub width_guess: f64,

    pub fit: GaussianFitConfig,
}

impl Default for TraceConfig {
    fn default() -> Self {
        Self {
            nsteps: 20,
            edge_margin: 25,
            median_kernel: 5,
            bin_filter: 3,
            width_guess: 2.0,
            fit: GaussianFitConfig::default(),
        }
    }
}

/// Trace the dominant spectrum in `frame`.
///
/// Returns a [`Trace`] with exactly `frame.n_dispersion()` positions, or
/// [`ReductionError::InsufficientBins`] when fewer than [`MIN_BINS`] bins hold
/// any pixels.
pub fn trace_aperture(
    frame: &Frame,
    mask: &IlluminationMask,
    seed: TraceSeed<'_>,
    config: &TraceConfig,
) -> Result<Trace> {
    let nd = frame.n_dispersion();
    let valid = mask.valid_indices(frame.n_spatial());
    if valid.is_empty() {
        return Err(ReductionError::EmptyInput("illuminated spatial rows"));
    }
    let ys: Vec<f64> = valid.iter().map(|&s| s as f64).collect();
    let (edge_lo, edge_hi) = (ys[0], ys[ys.len() - 1]);

    let filtered = frame.median_filtered(config.median_kernel);

    // Global fit of the collapsed profile
    let ztot = filtered.spatial_profile(&valid, 0, nd);
    let global = global_fit(&ys, &ztot, seed, config);
    info!(
        "trace: global center {:.2}, width {:.2}",
        global.center, global.width
    );

    let nsteps = config.nsteps.max(MIN_BINS);
    let edges: Vec<usize> = (0..=nsteps).map(|i| i * nd / nsteps).collect();
    let margin = config.edge_margin as f64;

    let mut mids = Vec::with_capacity(nsteps);
    let mut centers = Vec::with_capacity(nsteps);
    let mut fallbacks = 0usize;
    for w in edges.windows(2) {
        let (d0, d1) = (w[0], w[1]);
        if d1 <= d0 {
            continue;
        }
        let zi = filtered.spatial_profile(&valid, d0, d1);
        let zi_filt = stats::median_filter_1d(&zi, config.bin_filter);
        let peak = stats::argmax(&zi_filt).unwrap_or(0);
        let bin_seed = GaussianParams::new(
            stats::max(&zi_filt).unwrap_or(0.0),
            stats::median(&zi).unwrap_or(0.0),
            ys[peak],
            global.width.max(1.0),
        );
        let outcome = fit_with_fallback(
            &ys,
            &zi,
            bin_seed,
            &config.fit,
            |p| {
                p.center.is_finite()
                    && p.center >= edge_lo + margin
                    && p.center <= edge_hi - margin
            },
            Fallback::Estimate(global),
        );
        if let FitOutcome::Fallback(_) = outcome {
            fallbacks += 1;
            debug!("trace: bin [{}, {}) fell back to global center", d0, d1);
        }
        if let Some(p) = outcome.params() {
            mids.push((d0 + d1 - 1) as f64 / 2.0);
            centers.push(p.center);
        }
    }

    if mids.len() < MIN_BINS {
        return Err(ReductionError::InsufficientBins {
            usable: mids.len(),
            required: MIN_BINS,
        });
    }
    if fallbacks > 0 {
        warn!(
            "trace: {} of {} bins used the global center",
            fallbacks,
            mids.len()
        );
    }

    let spline = UnivariateSpline::fit(&mids, &centers, 3, 0.0)?;
    let positions = spline.eval_range(nd);
    info!(
        "trace: {} bins, positions {:.2}..{:.2}",
        mids.len(),
        positions.iter().copied().fold(f64::INFINITY, f64::min),
        positions.iter().copied().fold(f64::NEG_INFINITY, f64::max)
    );
    Ok(Trace::new(positions))
}

/// Fit the frame-integrated spatial profile. Falls back to the seed itself.
fn global_fit(ys: &[f64], ztot: &[f64], seed: TraceSeed<'_>, config: &TraceConfig) -> GaussianParams {
    let brightest = stats::argmax(ztot).unwrap_or(0);
    let center = match seed {
        TraceSeed::Brightest => ys[brightest],
        TraceSeed::Row(row) => row,
        TraceSeed::Recenter(prior) if prior.len() > 10 => match prior.median() {
            Some(m) => m,
            None => ys[brightest],
        },
        TraceSeed::Recenter(prior) => {
            warn!(
                "trace: prior trace has only {} samples, recentering ignored",
                prior.len()
            );
            ys[brightest]
        }
    };

    // Amplitude from the profile at the nearest illuminated row
    let nearest = ys
        .iter()
        .enumerate()
        .min_by(|a, b| {
            (a.1 - center)
                .abs()
                .partial_cmp(&(b.1 - center).abs())
                .unwrap_or(std::cmp::Ordering::Equal)
        })
        .map(|(i, _)| i)
        .unwrap_or(brightest);
    let offset = stats::median(ztot).unwrap_or(0.0);
    let guess = GaussianParams::new(ztot[nearest] - offset, offset, center, config.width_guess);

    let (lo, hi) = (ys[0], ys[ys.len() - 1]);
    let outcome = fit_with_fallback(
        ys,
        ztot,
        guess,
        &config.fit,
        |p| p.center.is_finite() && p.center >= lo && p.center <= hi,
        Fallback::Estimate(guess),
    );
    if !outcome.is_fitted() {
        warn!("trace: global profile fit failed, using seed center {:.2}", center);
    }
    outcome.params().unwrap_or(guess)
}
