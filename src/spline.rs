//! B-spline curves and tensor-product surfaces.
//!
//! [`UnivariateSpline`] interpolates (`s = 0`) or smooths (`s > 0`) 1-D data;
//! it is used for the full-resolution aperture trace, the per-row wavelength
//! solution and continuum normalization. [`BivariateSpline`] is the global
//! `(dispersion, spatial) → wavelength` surface.
//!
//! Both evaluate the boundary polynomial pieces outside the knot range, so
//! evaluation never fails; far from the data the result simply degrades.

use std::cmp::Ordering;

use nalgebra::{DMatrix, DVector};
use rkyv::{Archive, Deserialize, Serialize};
use tracing::debug;

use crate::error::{ReductionError, Result};

/// A B-spline of degree `k` on a clamped knot vector.
#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
pub struct BSpline {
    knots: Vec<f64>,
    coeffs: Vec<f64>,
    degree: usize,
}

impl BSpline {
    /// Knot vector (boundary knots repeated `degree + 1` times).
    pub fn knots(&self) -> &[f64] {
        &self.knots
    }

    pub fn coefficients(&self) -> &[f64] {
        &self.coeffs
    }

    pub fn degree(&self) -> usize {
        self.degree
    }

    /// Evaluate at `x`, extrapolating with the end pieces outside the knot span.
    pub fn eval(&self, x: f64) -> f64 {
        let span = find_span(&self.knots, self.degree, self.coeffs.len(), x);
        let basis = basis_funs(&self.knots, self.degree, span, x);
        let first = span - self.degree;
        basis
            .iter()
            .enumerate()
            .map(|(r, b)| b * self.coeffs[first + r])
            .sum()
    }

    /// Least-squares coefficients for a fixed knot vector.
    fn fit_lsq(x: &[f64], y: &[f64], knots: Vec<f64>, degree: usize) -> Self {
        let ncoef = knots.len() - degree - 1;
        let mut a_mat = DMatrix::<f64>::zeros(x.len(), ncoef);
        for (row, &xi) in x.iter().enumerate() {
            let span = find_span(&knots, degree, ncoef, xi);
            let basis = basis_funs(&knots, degree, span, xi);
            for (r, b) in basis.into_iter().enumerate() {
                a_mat[(row, span - degree + r)] = b;
            }
        }
        let coeffs = solve_lsq(a_mat, DVector::from_column_slice(y));
        Self {
            knots,
            coeffs,
            degree,
        }
    }
}

/// Minimum-norm least-squares solution of `A c = b`.
fn solve_lsq(a_mat: DMatrix<f64>, b_vec: DVector<f64>) -> Vec<f64> {
    let ncols = a_mat.ncols();
    let svd = a_mat.svd(true, true);
    let eps = svd.singular_values.max() * 1e-12;
    match svd.solve(&b_vec, eps) {
        Ok(c) => c.iter().copied().collect(),
        Err(_) => vec![0.0; ncols],
    }
}

/// Index `i` of the knot span `[t_i, t_{i+1})` holding `x`, clamped to the
/// valid range `degree ..= ncoef - 1`.
fn find_span(knots: &[f64], degree: usize, ncoef: usize, x: f64) -> usize {
    let (lo, hi) = (degree, ncoef - 1);
    if hi <= lo || x <= knots[lo] || x.is_nan() {
        return lo;
    }
    if x >= knots[hi + 1] {
        return hi;
    }
    // Last index in lo..=hi with knots[i] <= x
    let offset = knots[lo..=hi].partition_point(|&t| t <= x);
    lo + offset.saturating_sub(1)
}

/// The `degree + 1` non-vanishing basis functions on `span` at `x`
/// (Cox–de Boor triangle).
fn basis_funs(knots: &[f64], degree: usize, span: usize, x: f64) -> Vec<f64> {
    let mut n = vec![0.0; degree + 1];
    let mut left = vec![0.0; degree + 1];
    let mut right = vec![0.0; degree + 1];
    n[0] = 1.0;
    for j in 1..=degree {
        left[j] = x - knots[span + 1 - j];
        right[j] = knots[span + j] - x;
        let mut saved = 0.0;
        for r in 0..j {
            let denom = right[r + 1] + left[j - r];
            let temp = if denom == 0.0 { 0.0 } else { n[r] / denom };
            n[r] = saved + right[r + 1] * temp;
            saved = left[j - r] * temp;
        }
        n[j] = saved;
    }
    n
}

/// Clamped knot vector over `[a, b]` with the given interior knots.
fn clamped_knots(a: f64, b: f64, interior: &[f64], degree: usize) -> Vec<f64> {
    let mut knots = Vec::with_capacity(interior.len() + 2 * (degree + 1));
    knots.extend(std::iter::repeat(a).take(degree + 1));
    knots.extend_from_slice(interior);
    knots.extend(std::iter::repeat(b).take(degree + 1));
    knots
}

/// Sort by abscissa and drop non-finite samples and repeated abscissae
/// (first occurrence wins).
fn sorted_unique(x: &[f64], y: &[f64]) -> (Vec<f64>, Vec<f64>) {
    let mut pairs: Vec<(f64, f64)> = x
        .iter()
        .zip(y)
        .filter(|(a, b)| a.is_finite() && b.is_finite())
        .map(|(&a, &b)| (a, b))
        .collect();
    pairs.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(Ordering::Equal));
    pairs.dedup_by(|later, earlier| later.0 == earlier.0);
    pairs.into_iter().unzip()
}

/// 1-D spline through (`s = 0`) or near (`s > 0`) a set of samples.
#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
pub struct UnivariateSpline {
    spline: BSpline,
    residual: f64,
}

impl UnivariateSpline {
    /// Fit a spline of degree `k` with smoothing factor `s`.
    ///
    /// * `s == 0`: interpolation through every (deduplicated) sample, with
    ///   not-a-knot end conditions.
    /// * `s > 0`: knots are added one at a time, in the interval with the
    ///   largest squared residual, until the residual sum of squares is at or
    ///   below `s`.
    ///
    /// The degree is lowered when there are too few samples for `k`; a single
    /// sample gives a constant.
    pub fn fit(x: &[f64], y: &[f64], k: usize, s: f64) -> Result<Self> {
        if x.len() != y.len() {
            return Err(ReductionError::DimensionMismatch(format!(
                "spline fit: {} abscissae vs {} ordinates",
                x.len(),
                y.len()
            )));
        }
        let (xs, ys) = sorted_unique(x, y);
        if xs.is_empty() {
            return Err(ReductionError::EmptyInput("spline fit samples"));
        }
        let n = xs.len();
        let degree = k.min(n - 1);
        let (a, b) = (xs[0], xs[n - 1]);
        if degree == 0 {
            let spline = BSpline {
                knots: vec![a, b],
                coeffs: vec![ys.iter().sum::<f64>() / n as f64],
                degree: 0,
            };
            return Ok(Self::with_residual(spline, &xs, &ys));
        }

        let spline = if s <= 0.0 {
            let interior: Vec<f64> = if degree % 2 == 1 {
                let h = (degree + 1) / 2;
                xs[h..n - h].to_vec()
            } else {
                let h = degree / 2;
                (h..n - h - 1).map(|j| 0.5 * (xs[j] + xs[j + 1])).collect()
            };
            BSpline::fit_lsq(&xs, &ys, clamped_knots(a, b, &interior, degree), degree)
        } else {
            Self::fit_smoothing(&xs, &ys, degree, s)
        };
        Ok(Self::with_residual(spline, &xs, &ys))
    }

    fn fit_smoothing(xs: &[f64], ys: &[f64], degree: usize, s: f64) -> BSpline {
        let n = xs.len();
        let max_interior = n.saturating_sub(degree + 1);
        let (a, b) = (xs[0], xs[n - 1]);
        let mut interior: Vec<f64> = Vec::new();
        loop {
            let spline = BSpline::fit_lsq(xs, ys, clamped_knots(a, b, &interior, degree), degree);
            let residuals: Vec<f64> = xs
                .iter()
                .zip(ys)
                .map(|(&x, &y)| (y - spline.eval(x)).powi(2))
                .collect();
            let ssr: f64 = residuals.iter().sum();
            if ssr <= s || interior.len() >= max_interior {
                debug!(
                    "smoothing spline: {} interior knots, ssr={:.4e} (s={:.4e})",
                    interior.len(),
                    ssr,
                    s
                );
                return spline;
            }

            // Interval boundaries are the current knots; split the worst one at
            // its median interior sample.
            let mut bounds = Vec::with_capacity(interior.len() + 2);
            bounds.push(a);
            bounds.extend_from_slice(&interior);
            bounds.push(b);
            let worst = bounds
                .windows(2)
                .filter_map(|w| {
                    let inside: Vec<usize> =
                        (0..n).filter(|&i| xs[i] > w[0] && xs[i] < w[1]).collect();
                    if inside.is_empty() {
                        return None;
                    }
                    let err: f64 = inside.iter().map(|&i| residuals[i]).sum();
                    Some((err, xs[inside[inside.len() / 2]]))
                })
                .max_by(|p, q| p.0.partial_cmp(&q.0).unwrap_or(Ordering::Equal));
            let Some((_, knot)) = worst else {
                return spline;
            };
            let pos = interior.partition_point(|&t| t < knot);
            interior.insert(pos, knot);
        }
    }

    fn with_residual(spline: BSpline, xs: &[f64], ys: &[f64]) -> Self {
        let residual = xs
            .iter()
            .zip(ys)
            .map(|(&x, &y)| (y - spline.eval(x)).powi(2))
            .sum();
        Self { spline, residual }
    }

    #[inline]
    pub fn eval(&self, x: f64) -> f64 {
        self.spline.eval(x)
    }

    /// Evaluate at `0, 1, …, n − 1`.
    pub fn eval_range(&self, n: usize) -> Vec<f64> {
        (0..n).map(|i| self.eval(i as f64)).collect()
    }

    /// Sum of squared residuals at the fitted samples.
    pub fn residual(&self) -> f64 {
        self.residual
    }

    pub fn bspline(&self) -> &BSpline {
        &self.spline
    }
}

/// Tensor-product B-spline surface `z(x, y)`.
#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
pub struct BivariateSpline {
    tx: Vec<f64>,
    ty: Vec<f64>,
    kx: usize,
    ky: usize,
    /// Row-major `(nx, ny)` coefficient grid.
    coeffs: Vec<f64>,
}

impl BivariateSpline {
    /// Least-squares surface through scattered samples.
    ///
    /// `bbox = [x0, x1, y0, y1]` sets the boundary knots. Interior knots are
    /// placed at quantiles of the distinct sample coordinates, at most
    /// `max_interior` per axis. Degrees are lowered when an axis has too few
    /// distinct coordinates.
    #[allow(clippy::too_many_arguments)]
    pub fn fit(
        x: &[f64],
        y: &[f64],
        z: &[f64],
        kx: usize,
        ky: usize,
        bbox: [f64; 4],
        max_interior: usize,
    ) -> Result<Self> {
        if x.len() != y.len() || x.len() != z.len() {
            return Err(ReductionError::DimensionMismatch(format!(
                "surface fit: {} x, {} y, {} z samples",
                x.len(),
                y.len(),
                z.len()
            )));
        }
        if x.is_empty() {
            return Err(ReductionError::EmptyInput("surface fit samples"));
        }
        let (tx, kx) = axis_knots(x, kx, bbox[0], bbox[1], max_interior);
        let (ty, ky) = axis_knots(y, ky, bbox[2], bbox[3], max_interior);
        let nx = tx.len() - kx - 1;
        let ny = ty.len() - ky - 1;

        let mut a_mat = DMatrix::<f64>::zeros(x.len(), nx * ny);
        for row in 0..x.len() {
            let sx = find_span(&tx, kx, nx, x[row]);
            let sy = find_span(&ty, ky, ny, y[row]);
            let bx = basis_funs(&tx, kx, sx, x[row]);
            let by = basis_funs(&ty, ky, sy, y[row]);
            for (i, vx) in bx.iter().enumerate() {
                for (j, vy) in by.iter().enumerate() {
                    a_mat[(row, (sx - kx + i) * ny + (sy - ky + j))] = vx * vy;
                }
            }
        }
        debug!(
            "bivariate spline: {} samples, {}x{} coefficients (kx={}, ky={})",
            x.len(),
            nx,
            ny,
            kx,
            ky
        );
        let coeffs = solve_lsq(a_mat, DVector::from_column_slice(z));
        Ok(Self {
            tx,
            ty,
            kx,
            ky,
            coeffs,
        })
    }

    /// Evaluate at `(x, y)`; extrapolates outside the bounding box.
    pub fn eval(&self, x: f64, y: f64) -> f64 {
        let nx = self.tx.len() - self.kx - 1;
        let ny = self.ty.len() - self.ky - 1;
        let sx = find_span(&self.tx, self.kx, nx, x);
        let sy = find_span(&self.ty, self.ky, ny, y);
        let bx = basis_funs(&self.tx, self.kx, sx, x);
        let by = basis_funs(&self.ty, self.ky, sy, y);
        let mut sum = 0.0;
        for (i, vx) in bx.iter().enumerate() {
            let base = (sx - self.kx + i) * ny + (sy - self.ky);
            for (j, vy) in by.iter().enumerate() {
                sum += vx * vy * self.coeffs[base + j];
            }
        }
        sum
    }

    pub fn degrees(&self) -> (usize, usize) {
        (self.kx, self.ky)
    }
}

/// Knot vector and effective degree for one axis of a surface fit.
fn axis_knots(v: &[f64], k: usize, lo: f64, hi: f64, max_interior: usize) -> (Vec<f64>, usize) {
    let mut distinct: Vec<f64> = v.iter().copied().filter(|c| c.is_finite()).collect();
    distinct.sort_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal));
    distinct.dedup();
    let degree = k.min(distinct.len().saturating_sub(1));
    let (lo, hi) = if hi > lo { (lo, hi) } else { (lo - 0.5, lo + 0.5) };
    let n_interior = distinct
        .len()
        .saturating_sub(degree + 1)
        .min(max_interior);
    let interior: Vec<f64> = (1..=n_interior)
        .map(|q| {
            let pos = q as f64 / (n_interior + 1) as f64 * (distinct.len() - 1) as f64;
            let i = pos.floor() as usize;
            let frac = pos - i as f64;
            let j = (i + 1).min(distinct.len() - 1);
            distinct[i] + (distinct[j] - distinct[i]) * frac
        })
        .filter(|&t| t > lo && t < hi)
        .collect();
    (clamped_knots(lo, hi, &interior, degree), degree)
}
