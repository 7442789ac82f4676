//! 2-D wavelength solutions fitted to traced arc-line samples.
//!
//! Three interchangeable representations are supported (see [`SurfaceMode`]):
//! a global bivariate spline, or an independent fit along the dispersion axis
//! for every spatial row, tabulated at every column. Row tables are
//! interpolated linearly between neighbouring rows when evaluated.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use anyhow::Context;
use rkyv::{Archive, Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{ReductionError, Result};
use crate::line_trace::LineSampleSet;
use crate::polynomial::Polynomial;
use crate::spline::{BivariateSpline, UnivariateSpline};

/// How the wavelength surface is represented.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SurfaceMode {
    /// Independent polynomial along each spatial row.
    #[default]
    Poly,
    /// Independent cubic smoothing spline along each spatial row.
    Spline,
    /// One bivariate spline over all samples.
    Spline2d,
}

impl SurfaceMode {
    /// Parse `s`, substituting [`SurfaceMode::Poly`] (with a warning) when it
    /// names no known mode.
    pub fn parse_or_default(s: &str) -> Self {
        s.parse().unwrap_or_else(|e: ReductionError| {
            warn!("{}; using '{}'", e, SurfaceMode::default());
            SurfaceMode::default()
        })
    }
}

impl FromStr for SurfaceMode {
    type Err = ReductionError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "poly" => Ok(SurfaceMode::Poly),
            "spline" => Ok(SurfaceMode::Spline),
            "spline2d" => Ok(SurfaceMode::Spline2d),
            _ => Err(ReductionError::InvalidMode(s.to_string())),
        }
    }
}

impl fmt::Display for SurfaceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SurfaceMode::Poly => "poly",
            SurfaceMode::Spline => "spline",
            SurfaceMode::Spline2d => "spline2d",
        };
        f.write_str(name)
    }
}

/// Configuration for [`fit_surface`].
#[derive(Debug, Clone)]
pub struct SurfaceConfig {
    /// Default: [`SurfaceMode::Poly`]
    pub mode: SurfaceMode,

    /// Polynomial order of each row fit in `Poly` mode. A calibration run
    /// replaces it with its accepted fit order.
    /// Default: 2
    pub poly_order: usize,

    /// Smoothing factor of each row spline in `Spline` mode.
    /// Default: 5e7
    pub row_smoothing: f64,

    /// Degree of each row spline in `Spline` mode.
    /// Default: 3
    pub row_degree: usize,

    /// Degree of the `Spline2d` surface along dispersion.
    /// Default: 5
    pub kx: usize,

    /// Degree of the `Spline2d` surface along the slit.
    /// Default: 3
    pub ky: usize,

    /// Upper bound on interior knots per axis of the `Spline2d` surface.
    /// Default: 4
    pub max_interior_knots: usize,
}

impl Default for SurfaceConfig {
    fn default() -> Self {
        Self {
            mode: SurfaceMode::Poly,
            poly_order: 2,
            row_smoothing: 5e7,
            row_degree: 3,
            kx: 5,
            ky: 3,
            max_interior_knots: 4,
        }
    }
}

/// Wavelength tabulated at every `(row, column)`.
///
/// Rows that had no samples hold 0 and are flagged as unpopulated.
#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
pub struct RowTable {
    n_spatial: usize,
    n_dispersion: usize,
    values: Vec<f64>,
    populated: Vec<bool>,
}

impl RowTable {
    /// Tabulated row `s` (all zeros when unpopulated).
    pub fn row(&self, s: usize) -> &[f64] {
        &self.values[s * self.n_dispersion..(s + 1) * self.n_dispersion]
    }

    pub fn is_populated(&self, s: usize) -> bool {
        self.populated.get(s).copied().unwrap_or(false)
    }

    pub fn n_populated(&self) -> usize {
        self.populated.iter().filter(|&&p| p).count()
    }

    /// Row value at fractional column `d` (clamped to the table).
    fn row_at(&self, s: usize, d: f64) -> f64 {
        let row = self.row(s);
        let max = (self.n_dispersion - 1) as f64;
        let d = if d.is_nan() { 0.0 } else { d.clamp(0.0, max) };
        let i = (d.floor() as usize).min(self.n_dispersion - 1);
        let j = (i + 1).min(self.n_dispersion - 1);
        let frac = d - i as f64;
        row[i] + (row[j] - row[i]) * frac
    }

    fn evaluate(&self, d: f64, s: f64) -> f64 {
        if self.n_dispersion == 0 {
            return 0.0;
        }
        // Nearest populated rows at or below / at or above `s`
        let s_clamped = if s.is_nan() {
            0.0
        } else {
            s.clamp(0.0, self.n_spatial.saturating_sub(1) as f64)
        };
        let below = (0..=s_clamped.floor() as usize)
            .rev()
            .find(|&r| self.is_populated(r));
        let above = (s_clamped.ceil() as usize..self.n_spatial).find(|&r| self.is_populated(r));
        match (below, above) {
            (Some(lo), Some(hi)) if hi > lo => {
                let t = (s_clamped - lo as f64) / (hi - lo) as f64;
                let (a, b) = (self.row_at(lo, d), self.row_at(hi, d));
                a + (b - a) * t
            }
            (Some(r), _) | (None, Some(r)) => self.row_at(r, d),
            (None, None) => 0.0,
        }
    }
}

/// Fitted map from `(dispersion, spatial)` pixel to wavelength.
#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
pub enum WavelengthSolution {
    Spline2d(BivariateSpline),
    RowSpline(RowTable),
    RowPoly(RowTable),
}

impl WavelengthSolution {
    pub fn mode(&self) -> SurfaceMode {
        match self {
            WavelengthSolution::Spline2d(_) => SurfaceMode::Spline2d,
            WavelengthSolution::RowSpline(_) => SurfaceMode::Spline,
            WavelengthSolution::RowPoly(_) => SurfaceMode::Poly,
        }
    }

    /// Wavelength at `(dispersion, spatial)`.
    ///
    /// Never fails; outside the frame the surface is extrapolated (spline) or
    /// held at the nearest tabulated value (row tables).
    pub fn evaluate(&self, dispersion: f64, spatial: f64) -> f64 {
        match self {
            WavelengthSolution::Spline2d(s) => s.eval(dispersion, spatial),
            WavelengthSolution::RowSpline(t) | WavelengthSolution::RowPoly(t) => {
                t.evaluate(dispersion, spatial)
            }
        }
    }

    /// Serialize the solution to bytes using rkyv.
    pub fn to_rkyv_bytes(&self) -> anyhow::Result<Vec<u8>> {
        let bytes = rkyv::to_bytes::<rkyv::rancor::Error>(self)
            .map_err(|e| anyhow::anyhow!("rkyv serialization failed: {}", e))?;
        Ok(bytes.to_vec())
    }

    /// Save the solution to a file using rkyv.
    pub fn save_to_file(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let path = path.as_ref();
        let bytes = self.to_rkyv_bytes()?;
        std::fs::write(path, &bytes)
            .with_context(|| format!("Failed to write solution: {}", path.display()))?;
        info!(
            "Saved {} wavelength solution to {} ({} bytes)",
            self.mode(),
            path.display(),
            bytes.len()
        );
        Ok(())
    }

    /// Load a solution from an rkyv file.
    pub fn load_from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let bytes = std::fs::read(path)
            .with_context(|| format!("Failed to read solution: {}", path.display()))?;
        let solution = rkyv::from_bytes::<Self, rkyv::rancor::Error>(&bytes)
            .map_err(|e| anyhow::anyhow!("rkyv deserialization failed: {}", e))?;
        info!(
            "Loaded {} wavelength solution from {}",
            solution.mode(),
            path.display()
        );
        Ok(solution)
    }
}

/// Fit a wavelength solution to traced line samples on an
/// `n_spatial × n_dispersion` frame.
pub fn fit_surface(
    samples: &LineSampleSet,
    n_spatial: usize,
    n_dispersion: usize,
    config: &SurfaceConfig,
) -> Result<WavelengthSolution> {
    if samples.is_empty() {
        return Err(ReductionError::EmptyInput("line samples"));
    }
    if n_spatial == 0 || n_dispersion == 0 {
        return Err(ReductionError::EmptyInput("frame extent"));
    }
    info!(
        "fitting {} surface to {} samples",
        config.mode,
        samples.len()
    );
    match config.mode {
        SurfaceMode::Spline2d => {
            let d: Vec<f64> = samples.iter().map(|s| s.dispersion).collect();
            let s: Vec<f64> = samples.iter().map(|s| s.spatial).collect();
            let w: Vec<f64> = samples.iter().map(|s| s.wavelength).collect();
            let bbox = [
                0.0,
                (n_dispersion - 1) as f64,
                0.0,
                (n_spatial - 1) as f64,
            ];
            let surface = BivariateSpline::fit(
                &d,
                &s,
                &w,
                config.kx,
                config.ky,
                bbox,
                config.max_interior_knots,
            )?;
            Ok(WavelengthSolution::Spline2d(surface))
        }
        SurfaceMode::Spline => Ok(WavelengthSolution::RowSpline(fit_rows(
            samples,
            n_spatial,
            n_dispersion,
            |x, y| {
                let spline = UnivariateSpline::fit(x, y, config.row_degree, config.row_smoothing)?;
                Ok(spline.eval_range(n_dispersion))
            },
        )?)),
        SurfaceMode::Poly => {
            let half = n_dispersion as f64 / 2.0;
            Ok(WavelengthSolution::RowPoly(fit_rows(
                samples,
                n_spatial,
                n_dispersion,
                |x, y| {
                    let order = config.poly_order.min(x.len().saturating_sub(1));
                    let poly = Polynomial::fit(x, y, order, half, half)?;
                    Ok(poly.eval_range(n_dispersion))
                },
            )?))
        }
    }
}

/// Fit every spatial row independently and tabulate it.
fn fit_rows(
    samples: &LineSampleSet,
    n_spatial: usize,
    n_dispersion: usize,
    fit_row: impl Fn(&[f64], &[f64]) -> Result<Vec<f64>>,
) -> Result<RowTable> {
    let mut per_row: Vec<Vec<(f64, f64)>> = vec![Vec::new(); n_spatial];
    for s in samples.iter() {
        let row = s.spatial.round();
        if row >= 0.0 && (row as usize) < n_spatial && s.dispersion.is_finite() {
            per_row[row as usize].push((s.dispersion, s.wavelength));
        }
    }

    let mut values = vec![0.0; n_spatial * n_dispersion];
    let mut populated = vec![false; n_spatial];
    let mut empty = 0usize;
    for (row, pairs) in per_row.iter_mut().enumerate() {
        if pairs.is_empty() {
            empty += 1;
            continue;
        }
        // Unique by dispersion pixel
        pairs.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));
        pairs.dedup_by(|later, earlier| later.0 == earlier.0);
        let (x, y): (Vec<f64>, Vec<f64>) = pairs.iter().copied().unzip();
        let tab = fit_row(&x, &y)?;
        values[row * n_dispersion..(row + 1) * n_dispersion].copy_from_slice(&tab);
        populated[row] = true;
    }
    if empty > 0 {
        warn!(
            "{} of {} spatial rows have no line samples; filled with 0",
            empty, n_spatial
        );
    }
    debug!("row solution: {} populated rows", n_spatial - empty);
    Ok(RowTable {
        n_spatial,
        n_dispersion,
        values,
        populated,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::line_trace::LineSample;

    fn truth(d: f64, s: f64) -> f64 {
        4000.0 + 2.0 * d + 1e-4 * d * d + 0.01 * s
    }

    fn synthetic_samples(rows: std::ops::Range<usize>) -> LineSampleSet {
        let mut set = LineSampleSet::default();
        for line in 0..12 {
            let d0 = 20.0 + 30.0 * line as f64;
            for s in rows.clone() {
                let d = d0 + 0.02 * s as f64;
                set.push(LineSample {
                    dispersion: d,
                    spatial: s as f64,
                    wavelength: truth(d, s as f64),
                });
            }
        }
        set
    }

    #[test]
    fn test_all_modes_reproduce_samples() {
        let samples = synthetic_samples(10..90);
        for mode in [SurfaceMode::Poly, SurfaceMode::Spline, SurfaceMode::Spline2d] {
            let config = SurfaceConfig {
                mode,
                ..Default::default()
            };
            let solution = fit_surface(&samples, 100, 400, &config).unwrap();
            assert_eq!(solution.mode(), mode);
            for s in samples.iter().step_by(7) {
                let w = solution.evaluate(s.dispersion, s.spatial);
                assert!(
                    (w - s.wavelength).abs() < 1e-3,
                    "{mode}: ({}, {}) gave {w}, expected {}",
                    s.dispersion,
                    s.spatial,
                    s.wavelength
                );
            }
        }
    }

    #[test]
    fn test_empty_rows_hold_sentinel_and_interpolate() {
        let mut samples = synthetic_samples(10..20);
        for s in synthetic_samples(30..40).iter() {
            samples.push(*s);
        }
        let solution = fit_surface(&samples, 50, 400, &SurfaceConfig::default()).unwrap();
        let WavelengthSolution::RowPoly(table) = &solution else {
            panic!("expected a row table");
        };
        assert!(!table.is_populated(25));
        assert!(table.row(25).iter().all(|&v| v == 0.0));
        assert_eq!(table.n_populated(), 20);

        // Between rows 19 and 30 the value is interpolated, not the sentinel
        let w = solution.evaluate(200.0, 25.0);
        assert!((w - truth(200.0, 25.0)).abs() < 1e-6, "got {w}");
        // Beyond the last populated row the nearest row is used
        assert!((solution.evaluate(200.0, 48.0) - truth(200.0, 39.0)).abs() < 1e-6);
    }

    #[test]
    fn test_mode_parsing() {
        assert_eq!("Spline2D".parse::<SurfaceMode>().unwrap(), SurfaceMode::Spline2d);
        assert_eq!(
            "cubic".parse::<SurfaceMode>().unwrap_err(),
            ReductionError::InvalidMode("cubic".to_string())
        );
        assert_eq!(SurfaceMode::parse_or_default("cubic"), SurfaceMode::Poly);
        assert_eq!(SurfaceMode::Spline.to_string(), "spline");
    }

    #[test]
    fn test_save_and_load() {
        let samples = synthetic_samples(10..30);
        let solution = fit_surface(&samples, 40, 400, &SurfaceConfig::default()).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("arc.rkyv");
        solution.save_to_file(&path).unwrap();
        let loaded = WavelengthSolution::load_from_file(&path).unwrap();
        assert_eq!(loaded, solution);
    }

    #[test]
    fn test_no_samples_is_an_error() {
        let err = fit_surface(&LineSampleSet::default(), 10, 10, &Default::default()).unwrap_err();
        assert_eq!(err, ReductionError::EmptyInput("line samples"));
    }
}
