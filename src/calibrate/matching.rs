//! Matching detected arc peaks to reference wavelengths.
//!
//! Automatic identification is a fold over the detected peaks: each step
//! predicts the wavelength of one peak with the current polynomial, accepts it
//! if a reference line lies within tolerance, and refits the predictor from
//! every accepted pair once there are enough of them. Later peaks are thereby
//! predicted with a progressively better solution.

use std::cmp::Ordering;

use tracing::debug;

use super::{LineList, LinePair};
use crate::peaks::{Peak, PeakSet};
use crate::polynomial::Polynomial;

/// Accumulator of the progressive match.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchState {
    accepted: Vec<LinePair>,
    predictor: Polynomial,
}

impl MatchState {
    /// Start from an initial predictor (usually the header dispersion).
    pub fn new(predictor: Polynomial) -> Self {
        Self {
            accepted: Vec::new(),
            predictor,
        }
    }

    pub fn accepted(&self) -> &[LinePair] {
        &self.accepted
    }

    pub fn predictor(&self) -> &Polynomial {
        &self.predictor
    }

    pub fn into_accepted(self) -> Vec<LinePair> {
        self.accepted
    }

    /// Try to identify `peak`; returns the next state.
    ///
    /// The predictor is refit with `fit_order` after every acceptance that
    /// leaves at least `fit_order + 1` pairs.
    pub fn step(self, peak: &Peak, lines: &LineList, tol: f64, fit_order: usize) -> Self {
        let predicted = self.predictor.eval(peak.pixel);
        let Some(reference) = lines.nearest(predicted) else {
            return self;
        };
        if (reference - predicted).abs() >= tol {
            return self;
        }

        let MatchState {
            mut accepted,
            predictor,
        } = self;
        accepted.push(LinePair {
            pixel: peak.pixel,
            wavelength: reference,
        });
        debug!(
            "matched pixel {:.2} -> {:.2} (predicted {:.2})",
            peak.pixel, reference, predicted
        );

        let predictor = if accepted.len() > fit_order {
            let (px, wl): (Vec<f64>, Vec<f64>) =
                accepted.iter().map(|p| (p.pixel, p.wavelength)).unzip();
            Polynomial::fit(&px, &wl, fit_order, predictor.center(), predictor.scale())
                .unwrap_or(predictor)
        } else {
            predictor
        };
        MatchState {
            accepted,
            predictor,
        }
    }
}

/// Progressive matching, visiting peaks closest to `center_wavelength` first.
pub fn match_progressive(
    peaks: &PeakSet,
    lines: &LineList,
    initial: Polynomial,
    center_wavelength: f64,
    tol: f64,
    fit_order: usize,
) -> MatchState {
    let mut order: Vec<&Peak> = peaks.iter().collect();
    order.sort_by(|a, b| {
        let da = (initial.eval(a.pixel) - center_wavelength).abs();
        let db = (initial.eval(b.pixel) - center_wavelength).abs();
        da.partial_cmp(&db).unwrap_or(Ordering::Equal)
    });
    order
        .into_iter()
        .fold(MatchState::new(initial), |state, peak| {
            state.step(peak, lines, tol, fit_order)
        })
}

/// Match every peak against a fixed predictor, in pixel order.
pub fn match_fixed(peaks: &PeakSet, lines: &LineList, predictor: &Polynomial, tol: f64) -> Vec<LinePair> {
    let mut peaks: Vec<&Peak> = peaks.iter().collect();
    peaks.sort_by(|a, b| a.pixel.partial_cmp(&b.pixel).unwrap_or(Ordering::Equal));
    peaks
        .into_iter()
        .filter_map(|peak| {
            let predicted = predictor.eval(peak.pixel);
            let reference = lines.nearest(predicted)?;
            ((reference - predicted).abs() < tol).then_some(LinePair {
                pixel: peak.pixel,
                wavelength: reference,
            })
        })
        .collect()
}
