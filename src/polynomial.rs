//! Least-squares polynomials in a normalized abscissa.
//!
//! The abscissa is shifted and scaled before evaluation,
//! `u = (x − center) / scale`, so the normal equations stay well conditioned
//! for detector coordinates in the thousands. Coefficients are stored in
//! ascending powers of `u`.

use nalgebra::{DMatrix, DVector};

use crate::error::{ReductionError, Result};

/// A polynomial `p(x) = Σ cᵢ · uⁱ` with `u = (x − center) / scale`.
#[derive(Debug, Clone, PartialEq)]
pub struct Polynomial {
    coeffs: Vec<f64>,
    center: f64,
    scale: f64,
}

impl Polynomial {
    /// Polynomial from explicit normalized coefficients (ascending powers).
    pub fn new(coeffs: Vec<f64>, center: f64, scale: f64) -> Self {
        let scale = if scale == 0.0 { 1.0 } else { scale };
        Self {
            coeffs,
            center,
            scale,
        }
    }

    /// Straight line through `intercept` at `x = center` with `slope` per unit x,
    /// padded with zero terms up to `order`.
    pub fn linear(center: f64, scale: f64, intercept: f64, slope: f64, order: usize) -> Self {
        let mut p = Self::new(vec![0.0; order.max(1) + 1], center, scale);
        p.coeffs[0] = intercept;
        p.coeffs[1] = slope * p.scale;
        p
    }

    /// Least-squares fit of the given order about `center`, normalized by `scale`.
    ///
    /// With fewer samples than `order + 1` the minimum-norm solution is returned.
    pub fn fit(x: &[f64], y: &[f64], order: usize, center: f64, scale: f64) -> Result<Self> {
        if x.len() != y.len() {
            return Err(ReductionError::DimensionMismatch(format!(
                "polynomial fit: {} abscissae vs {} ordinates",
                x.len(),
                y.len()
            )));
        }
        // Non-finite samples never reach the SVD
        let (x, y): (Vec<f64>, Vec<f64>) = x
            .iter()
            .zip(y)
            .filter(|(xi, yi)| xi.is_finite() && yi.is_finite())
            .map(|(&xi, &yi)| (xi, yi))
            .unzip();
        if x.is_empty() {
            return Err(ReductionError::EmptyInput("polynomial fit samples"));
        }
        let scale = if scale == 0.0 || !scale.is_finite() { 1.0 } else { scale };
        let ncoef = order + 1;

        let mut a_mat = DMatrix::<f64>::zeros(x.len(), ncoef);
        let b_vec = DVector::<f64>::from_column_slice(&y);
        for (row, &xi) in x.iter().enumerate() {
            let u = (xi - center) / scale;
            let mut term = 1.0;
            for col in 0..ncoef {
                a_mat[(row, col)] = term;
                term *= u;
            }
        }

        let svd = a_mat.svd(true, true);
        let eps = svd.singular_values.max() * 1e-12;
        let coeffs = svd
            .solve(&b_vec, eps)
            .unwrap_or_else(|_| DVector::zeros(ncoef));

        Ok(Self {
            coeffs: coeffs.iter().copied().collect(),
            center,
            scale,
        })
    }

    /// Fit normalized to the span of the data.
    pub fn fit_auto(x: &[f64], y: &[f64], order: usize) -> Result<Self> {
        let (lo, hi) = x
            .iter()
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| {
                (lo.min(v), hi.max(v))
            });
        let (center, scale) = if lo.is_finite() && hi > lo {
            ((lo + hi) / 2.0, (hi - lo) / 2.0)
        } else {
            (if lo.is_finite() { lo } else { 0.0 }, 1.0)
        };
        Self::fit(x, y, order, center, scale)
    }

    /// Evaluate at `x` (Horner's rule).
    #[inline]
    pub fn eval(&self, x: f64) -> f64 {
        let u = (x - self.center) / self.scale;
        self.coeffs.iter().rev().fold(0.0, |acc, &c| acc * u + c)
    }

    /// Evaluate at `0, 1, …, n − 1`.
    pub fn eval_range(&self, n: usize) -> Vec<f64> {
        (0..n).map(|i| self.eval(i as f64)).collect()
    }

    /// Normalized coefficients in ascending powers.
    pub fn coefficients(&self) -> &[f64] {
        &self.coeffs
    }

    pub fn order(&self) -> usize {
        self.coeffs.len().saturating_sub(1)
    }

    pub fn center(&self) -> f64 {
        self.center
    }

    pub fn scale(&self) -> f64 {
        self.scale
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fit_recovers_cubic() {
        let x: Vec<f64> = (0..50).map(|i| i as f64 * 40.0).collect();
        let f = |x: f64| 4000.0 + 1.5 * x - 2e-4 * x * x + 3e-8 * x * x * x;
        let y: Vec<f64> = x.iter().map(|&v| f(v)).collect();
        let p = Polynomial::fit(&x, &y, 3, 1000.0, 1000.0).unwrap();
        for &v in &[0.0, 517.0, 1960.0] {
            assert!((p.eval(v) - f(v)).abs() < 1e-6, "at {v}: {} vs {}", p.eval(v), f(v));
        }
        assert_eq!(p.order(), 3);
    }

    #[test]
    fn test_linear_constructor() {
        let p = Polynomial::linear(512.0, 512.0, 5000.0, 2.5, 2);
        assert_eq!(p.coefficients().len(), 3);
        assert!((p.eval(512.0) - 5000.0).abs() < 1e-12);
        assert!((p.eval(612.0) - 5250.0).abs() < 1e-9);
    }

    #[test]
    fn test_underdetermined_fit_is_finite() {
        let p = Polynomial::fit_auto(&[1.0, 2.0], &[3.0, 5.0], 3).unwrap();
        assert!((p.eval(1.0) - 3.0).abs() < 1e-9);
        assert!((p.eval(2.0) - 5.0).abs() < 1e-9);
        assert!(p.coefficients().iter().all(|c| c.is_finite()));
    }

    #[test]
    fn test_empty_fit_errors() {
        assert!(Polynomial::fit_auto(&[], &[], 2).is_err());
    }

    #[test]
    fn test_non_finite_samples_are_skipped() {
        let x = [100.0, 300.0, f64::NAN, 500.0, 700.0];
        let y = [1.0, 2.0, 3.0, f64::INFINITY, 4.0];
        let p = Polynomial::fit(&x, &y, 2, 300.0, 300.0).unwrap();
        assert!(p.coefficients().iter().all(|c| c.is_finite()));
        assert!((p.eval(100.0) - 1.0).abs() < 1e-9);
        assert!((p.eval(700.0) - 4.0).abs() < 1e-9);

        let all_bad = [f64::NAN, f64::NAN];
        assert!(Polynomial::fit(&all_bad, &[1.0, 2.0], 1, 0.0, 1.0).is_err());
    }
}
