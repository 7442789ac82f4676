//! Continuum normalization of an extracted spectrum.

use std::fmt;
use std::str::FromStr;

use tracing::warn;

use crate::error::{ReductionError, Result};
use crate::polynomial::Polynomial;
use crate::spline::UnivariateSpline;

/// Continuum model used by [`normalize_continuum`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ContinuumMode {
    #[default]
    Poly,
    Spline,
}

impl ContinuumMode {
    /// Parse `s`, falling back to [`ContinuumMode::Poly`] with a warning.
    pub fn parse_or_default(s: &str) -> Self {
        s.parse().unwrap_or_else(|e: ReductionError| {
            warn!("{}; using '{}'", e, ContinuumMode::default());
            ContinuumMode::default()
        })
    }
}

impl FromStr for ContinuumMode {
    type Err = ReductionError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "poly" => Ok(ContinuumMode::Poly),
            "spline" => Ok(ContinuumMode::Spline),
            _ => Err(ReductionError::InvalidMode(s.to_string())),
        }
    }
}

impl fmt::Display for ContinuumMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ContinuumMode::Poly => "poly",
            ContinuumMode::Spline => "spline",
        })
    }
}

/// Configuration for [`normalize_continuum`].
#[derive(Debug, Clone)]
pub struct NormalizeConfig {
    /// Default: [`ContinuumMode::Poly`]
    pub mode: ContinuumMode,
    /// Default: 5
    pub poly_order: usize,
    /// Default: 2
    pub spline_degree: usize,
    /// Default: 0.0025
    pub spline_smoothing: f64,
}

impl Default for NormalizeConfig {
    fn default() -> Self {
        Self {
            mode: ContinuumMode::Poly,
            poly_order: 5,
            spline_degree: 2,
            spline_smoothing: 0.0025,
        }
    }
}

/// Flatten a spectrum: `(flux − model) / model` with `model` a smooth fit
/// to the continuum.
pub fn normalize_continuum(wave: &[f64], flux: &[f64], config: &NormalizeConfig) -> Result<Vec<f64>> {
    let model: Vec<f64> = match config.mode {
        ContinuumMode::Poly => {
            let poly = Polynomial::fit_auto(wave, flux, config.poly_order)?;
            wave.iter().map(|&w| poly.eval(w)).collect()
        }
        ContinuumMode::Spline => {
            let spline = UnivariateSpline::fit(
                wave,
                flux,
                config.spline_degree,
                config.spline_smoothing,
            )?;
            wave.iter().map(|&w| spline.eval(w)).collect()
        }
    };
    Ok(flux
        .iter()
        .zip(&model)
        .map(|(f, m)| (f - m) / m)
        .collect())
}
