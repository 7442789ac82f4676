//! 1-D Gaussian-plus-offset fitting.
//!
//! Every tracing stage (aperture bins, arc-line peaks, per-row line tracing)
//! centroids a windowed profile by fitting
//!
//! ```text
//! f(x) = A · exp(−(x − x₀)² / 2σ²) + B
//! ```
//!
//! with Levenberg–Marquardt. A fit can fail ([`FitError`]); callers never
//! treat that as fatal, they route it through [`fit_with_fallback`], which is
//! the single place where the accept / fallback / skip policy is applied.

use nalgebra::{Matrix4, Vector4};
use thiserror::Error;

/// Parameters of a Gaussian-plus-offset profile.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GaussianParams {
    /// Peak height above the offset.
    pub amplitude: f64,
    /// Constant background level.
    pub offset: f64,
    /// Center x₀, in the units of the abscissa.
    pub center: f64,
    /// Standard deviation σ (always reported as non-negative).
    pub width: f64,
}

impl GaussianParams {
    pub fn new(amplitude: f64, offset: f64, center: f64, width: f64) -> Self {
        Self {
            amplitude,
            offset,
            center,
            width,
        }
    }

    /// Model value at `x`.
    #[inline]
    pub fn evaluate(&self, x: f64) -> f64 {
        let dx = x - self.center;
        self.amplitude * (-dx * dx / (2.0 * self.width * self.width)).exp() + self.offset
    }

    fn to_vector(self) -> Vector4<f64> {
        Vector4::new(self.amplitude, self.offset, self.center, self.width)
    }

    fn from_vector(v: &Vector4<f64>) -> Self {
        Self::new(v[0], v[1], v[2], v[3])
    }
}

/// Levenberg–Marquardt settings.
#[derive(Debug, Clone)]
pub struct GaussianFitConfig {
    /// Iteration budget (accepted and rejected steps both count).
    /// Default: 200
    pub max_iterations: usize,
    /// Relative χ² decrease (or relative parameter step) below which the fit
    /// is considered converged.
    /// Default: 1e-10
    pub tolerance: f64,
    /// Initial damping factor.
    /// Default: 1e-3
    pub initial_lambda: f64,
    /// Damping multiplier after a rejected step.
    /// Default: 10
    pub lambda_up: f64,
    /// Damping multiplier after an accepted step.
    /// Default: 0.1
    pub lambda_down: f64,
}

impl Default for GaussianFitConfig {
    fn default() -> Self {
        Self {
            max_iterations: 200,
            tolerance: 1e-10,
            initial_lambda: 1e-3,
            lambda_up: 10.0,
            lambda_down: 0.1,
        }
    }
}

/// Why a Gaussian fit failed. Always recoverable by the caller.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FitError {
    #[error("fit did not converge within {iterations} iterations")]
    DidNotConverge { iterations: usize },
    #[error("singular Jacobian")]
    SingularJacobian,
    #[error("only {n} finite samples, need at least 4")]
    TooFewSamples { n: usize },
}

/// Fit a Gaussian-plus-offset model to `(x, y)` starting from `guess`.
///
/// Non-finite samples are ignored.
pub fn fit_gaussian(
    x: &[f64],
    y: &[f64],
    guess: GaussianParams,
    config: &GaussianFitConfig,
) -> Result<GaussianParams, FitError> {
    let (xs, ys): (Vec<f64>, Vec<f64>) = x
        .iter()
        .zip(y)
        .filter(|(a, b)| a.is_finite() && b.is_finite())
        .map(|(&a, &b)| (a, b))
        .unzip();
    if xs.len() < 4 {
        return Err(FitError::TooFewSamples { n: xs.len() });
    }

    let mut params = guess.to_vector();
    if params[3] == 0.0 {
        params[3] = 1.0;
    }
    let mut chi2 = chi_square(&xs, &ys, &params);
    if !chi2.is_finite() {
        return Err(FitError::SingularJacobian);
    }
    let mut lambda = config.initial_lambda;

    for _ in 0..config.max_iterations {
        if chi2 == 0.0 {
            return Ok(finish(&params));
        }
        let (hessian, gradient) = normal_equations(&xs, &ys, &params);

        let mut damped = hessian;
        for i in 0..4 {
            damped[(i, i)] *= 1.0 + lambda;
        }
        let Some(delta) = damped.lu().solve(&gradient) else {
            return Err(FitError::SingularJacobian);
        };

        let trial = params + delta;
        let trial_chi2 = chi_square(&xs, &ys, &trial);

        if trial_chi2.is_finite() && trial_chi2 < chi2 {
            let decrease = (chi2 - trial_chi2) / chi2;
            let step_small = delta
                .iter()
                .zip(trial.iter())
                .all(|(d, p)| d.abs() <= config.tolerance * (p.abs() + config.tolerance));
            params = trial;
            chi2 = trial_chi2;
            lambda *= config.lambda_down;
            if decrease <= config.tolerance || step_small {
                return Ok(finish(&params));
            }
        } else {
            lambda *= config.lambda_up;
            // No damped step improves χ²: we are sitting in the minimum.
            if lambda > 1e16 {
                return Ok(finish(&params));
            }
        }
    }

    Err(FitError::DidNotConverge {
        iterations: config.max_iterations,
    })
}

fn finish(params: &Vector4<f64>) -> GaussianParams {
    let mut p = GaussianParams::from_vector(params);
    p.width = p.width.abs();
    p
}

fn chi_square(xs: &[f64], ys: &[f64], params: &Vector4<f64>) -> f64 {
    let p = GaussianParams::from_vector(params);
    xs.iter()
        .zip(ys)
        .map(|(&x, &y)| {
            let r = y - p.evaluate(x);
            r * r
        })
        .sum()
}

/// Build JᵀJ and Jᵀr for the current parameters.
fn normal_equations(
    xs: &[f64],
    ys: &[f64],
    params: &Vector4<f64>,
) -> (Matrix4<f64>, Vector4<f64>) {
    let (a, b, x0, s) = (params[0], params[1], params[2], params[3]);
    let s2 = s * s;
    let mut hessian = Matrix4::<f64>::zeros();
    let mut gradient = Vector4::<f64>::zeros();
    for (&x, &y) in xs.iter().zip(ys) {
        let dx = x - x0;
        let e = (-dx * dx / (2.0 * s2)).exp();
        let r = y - (a * e + b);
        let row = Vector4::new(e, 1.0, a * e * dx / s2, a * e * dx * dx / (s2 * s));
        hessian += row * row.transpose();
        gradient += row * r;
    }
    (hessian, gradient)
}

/// What to do when a fit fails or is rejected by the caller's acceptance test.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Fallback {
    /// Substitute this estimate (e.g. a global, frame-integrated fit).
    Estimate(GaussianParams),
    /// Emit nothing for this window.
    Skip,
}

/// Result of [`fit_with_fallback`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FitOutcome {
    /// The fit converged and passed the acceptance test.
    Fitted(GaussianParams),
    /// The fit failed or was rejected; the fallback estimate was substituted.
    Fallback(GaussianParams),
    /// The fit failed or was rejected and the window produces no result.
    Skipped,
}

impl FitOutcome {
    /// Parameters to use downstream, if any.
    pub fn params(&self) -> Option<GaussianParams> {
        match self {
            FitOutcome::Fitted(p) | FitOutcome::Fallback(p) => Some(*p),
            FitOutcome::Skipped => None,
        }
    }

    pub fn is_fitted(&self) -> bool {
        matches!(self, FitOutcome::Fitted(_))
    }
}

/// Fit a window and apply the caller's acceptance policy.
///
/// `accept` decides whether a converged fit is trustworthy (for instance a
/// center that lands inside the image). Converged-and-accepted fits come back
/// as [`FitOutcome::Fitted`]; everything else resolves through `fallback`.
pub fn fit_with_fallback(
    x: &[f64],
    y: &[f64],
    seed: GaussianParams,
    config: &GaussianFitConfig,
    accept: impl Fn(&GaussianParams) -> bool,
    fallback: Fallback,
) -> FitOutcome {
    match fit_gaussian(x, y, seed, config) {
        Ok(p) if accept(&p) => FitOutcome::Fitted(p),
        _ => match fallback {
            Fallback::Estimate(p) => FitOutcome::Fallback(p),
            Fallback::Skip => FitOutcome::Skipped,
        },
    }
}
