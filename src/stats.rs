//! Robust statistics and median filters shared by the tracing stages.
//!
//! All functions ignore non-finite samples unless noted otherwise.

use std::cmp::Ordering;

/// Percentile of the finite samples, `p` in `[0, 100]`.
///
/// Uses linear interpolation between closest ranks (the usual "linear"
/// definition: rank = p/100 · (n − 1)). Returns `None` when no finite
/// sample exists.
pub fn percentile(values: &[f64], p: f64) -> Option<f64> {
    let mut sorted: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
    if sorted.is_empty() {
        return None;
    }
    sorted.sort_unstable_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal));
    Some(percentile_sorted(&sorted, p))
}

/// Percentile of an already sorted, all-finite slice.
fn percentile_sorted(sorted: &[f64], p: f64) -> f64 {
    let n = sorted.len();
    if n == 1 {
        return sorted[0];
    }
    let rank = (p.clamp(0.0, 100.0) / 100.0) * (n - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = (lo + 1).min(n - 1);
    let frac = rank - lo as f64;
    sorted[lo] + (sorted[hi] - sorted[lo]) * frac
}

/// Median of the finite samples.
pub fn median(values: &[f64]) -> Option<f64> {
    percentile(values, 50.0)
}

/// Arithmetic mean of the finite samples.
pub fn mean(values: &[f64]) -> Option<f64> {
    let (sum, count) = values
        .iter()
        .filter(|v| v.is_finite())
        .fold((0.0, 0usize), |(s, c), &v| (s + v, c + 1));
    (count > 0).then(|| sum / count as f64)
}

/// Index of the largest finite sample (first occurrence on ties).
pub fn argmax(values: &[f64]) -> Option<usize> {
    let mut best: Option<(usize, f64)> = None;
    for (i, &v) in values.iter().enumerate() {
        if !v.is_finite() {
            continue;
        }
        match best {
            Some((_, b)) if v <= b => {}
            _ => best = Some((i, v)),
        }
    }
    best.map(|(i, _)| i)
}

/// Largest finite sample.
pub fn max(values: &[f64]) -> Option<f64> {
    argmax(values).map(|i| values[i])
}

/// 1-D median filter with an odd kernel; samples beyond the ends count as zero.
pub fn median_filter_1d(values: &[f64], kernel: usize) -> Vec<f64> {
    let kernel = kernel.max(1) | 1;
    let half = kernel / 2;
    let n = values.len();
    let mut window = Vec::with_capacity(kernel);
    (0..n)
        .map(|i| {
            window.clear();
            for k in 0..kernel {
                let j = i as isize + k as isize - half as isize;
                let v = if j < 0 || j >= n as isize {
                    0.0
                } else {
                    values[j as usize]
                };
                window.push(v);
            }
            window.sort_unstable_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal));
            window[half]
        })
        .collect()
}

/// 2-D median filter over a row-major `width × height` grid with a square odd
/// kernel; samples beyond the borders count as zero.
pub fn median_filter_2d(values: &[f64], width: usize, height: usize, kernel: usize) -> Vec<f64> {
    let kernel = kernel.max(1) | 1;
    let half = (kernel / 2) as isize;
    let mid = kernel * kernel / 2;
    let mut window = Vec::with_capacity(kernel * kernel);
    let mut out = vec![0.0; width * height];
    for row in 0..height {
        for col in 0..width {
            window.clear();
            for dr in -half..=half {
                let r = row as isize + dr;
                for dc in -half..=half {
                    let c = col as isize + dc;
                    let v = if r < 0 || c < 0 || r >= height as isize || c >= width as isize {
                        0.0
                    } else {
                        values[r as usize * width + c as usize]
                    };
                    window.push(v);
                }
            }
            window.sort_unstable_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal));
            out[row * width + col] = window[mid];
        }
    }
    out
}
