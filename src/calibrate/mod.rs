//! Wavelength calibration from an arc-lamp frame.
//!
//! [`Calibration`] is a state machine over [`CalibrationStage`]:
//!
//! ```text
//! SliceExtraction → FirstPassIdentify → FirstPassFit
//!     → [SecondPassIdentify → SecondPassFit] → LineTrace → SurfaceFit → Done
//! ```
//!
//! The way lines are identified in the first pass is chosen once, up front,
//! through [`Identification`]: automatic matching against a reference list,
//! an operator behind an [`InteractiveChannel`], or pairs saved by an earlier
//! run. The optional second pass always re-detects peaks with a looser
//! threshold and matches them against a denser list, using the first-pass
//! polynomial as a fixed predictor.
//!
//! # Example
//!
//! ```no_run
//! use longslit::calibrate::{
//!     Calibration, CalibrationConfig, DispersionHint, Identification, LineList, ReferenceLines,
//! };
//! use longslit::{Frame, IlluminationMask, SpatialAxis};
//!
//! let arc = Frame::open("arc.tiff", SpatialAxis::Y).unwrap();
//! let lines = ReferenceLines {
//!     coarse: LineList::from_file("apohenear.dat").unwrap(),
//!     dense: Some(LineList::from_file("henear.dat").unwrap()),
//! };
//! let hint = DispersionHint::new(2.44, 6500.0, false);
//! let config = CalibrationConfig::default();
//! let result = Calibration::new(
//!     &arc,
//!     &IlluminationMask::all(),
//!     &lines,
//!     hint,
//!     Identification::Automatic,
//!     &config,
//! )
//! .run()
//! .unwrap();
//! println!("{} lines, final order {}", result.accepted_pairs().len(), result.fit_order());
//! ```

pub mod interactive;
pub mod matching;

use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::error::{ReductionError, Result};
use crate::frame::{Frame, IlluminationMask};
use crate::line_trace::{trace_lines, LineSampleSet, LineTraceConfig};
use crate::peaks::{find_peaks, PeakConfig};
use crate::polynomial::Polynomial;
use crate::surface::{fit_surface, SurfaceConfig, WavelengthSolution};

pub use interactive::{
    FitDecision, FitReview, InteractiveChannel, PickConfig, PickRequest, ScriptedChannel,
    SliceView, TextChannel,
};

/// A dispersion pixel identified with a reference wavelength.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinePair {
    pub pixel: f64,
    pub wavelength: f64,
}

/// Sorted reference wavelengths of a lamp's emission lines.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LineList {
    wavelengths: Vec<f64>,
}

impl LineList {
    /// Non-finite entries are dropped and the rest sorted.
    pub fn new(mut wavelengths: Vec<f64>) -> Self {
        wavelengths.retain(|w| w.is_finite());
        wavelengths.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        Self { wavelengths }
    }

    /// Read a list file (see [`crate::io::read_line_list`]).
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        crate::io::read_line_list(path)
    }

    /// Reference wavelength closest to `wavelength`.
    pub fn nearest(&self, wavelength: f64) -> Option<f64> {
        let i = self.wavelengths.partition_point(|&w| w < wavelength);
        let below = i.checked_sub(1).map(|j| self.wavelengths[j]);
        let above = self.wavelengths.get(i).copied();
        match (below, above) {
            (Some(b), Some(a)) => Some(if wavelength - b <= a - wavelength { b } else { a }),
            (b, a) => b.or(a),
        }
    }

    pub fn len(&self) -> usize {
        self.wavelengths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.wavelengths.is_empty()
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.wavelengths
    }
}

/// Coarse list for the first pass, optional dense list for the second.
#[derive(Debug, Clone, Default)]
pub struct ReferenceLines {
    pub coarse: LineList,
    pub dense: Option<LineList>,
}

/// Approximate linear dispersion from the frame header.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DispersionHint {
    /// Wavelength step per pixel (positive).
    pub dispersion: f64,
    /// Wavelength at the central dispersion pixel.
    pub center_wavelength: f64,
    /// Wavelength decreases with pixel index.
    pub reversed: bool,
}

impl DispersionHint {
    pub fn new(dispersion: f64, center_wavelength: f64, reversed: bool) -> Self {
        Self {
            dispersion,
            center_wavelength,
            reversed,
        }
    }

    fn signed_dispersion(&self) -> f64 {
        if self.reversed {
            -self.dispersion.abs()
        } else {
            self.dispersion.abs()
        }
    }

    /// Approximate wavelength of every pixel of an `n`-pixel slice.
    pub fn approximate_wavelengths(&self, n: usize) -> Vec<f64> {
        let half = n as f64 / 2.0;
        (0..n)
            .map(|i| (i as f64 - half) * self.signed_dispersion() + self.center_wavelength)
            .collect()
    }

    /// The hint as a polynomial in the normalization used by every pass.
    pub fn polynomial(&self, n: usize, order: usize) -> Polynomial {
        let half = n as f64 / 2.0;
        Polynomial::linear(
            half,
            half.max(1.0),
            self.center_wavelength,
            self.signed_dispersion(),
            order,
        )
    }
}

/// Pairs saved by a previous run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SavedLines {
    pub first_pass: Vec<LinePair>,
    /// When present the second pass is not re-identified either.
    pub second_pass: Option<Vec<LinePair>>,
}

/// How first-pass lines are identified.
pub enum Identification<'c> {
    Automatic,
    Interactive(&'c mut dyn InteractiveChannel),
    FromFile(SavedLines),
}

impl std::fmt::Debug for Identification<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Identification::Automatic => f.write_str("Automatic"),
            Identification::Interactive(_) => f.write_str("Interactive"),
            Identification::FromFile(saved) => f.debug_tuple("FromFile").field(saved).finish(),
        }
    }
}

/// Configuration for a [`Calibration`] run.
#[derive(Debug, Clone)]
pub struct CalibrationConfig {
    /// Maximum distance, in wavelength units, between a predicted peak
    /// wavelength and the reference line it is matched to.
    /// Default: 10.0
    pub tol: f64,

    /// Polynomial order of the pixel → wavelength fit. The order finally
    /// accepted also sets the row order of a `Poly` surface, in place of
    /// `surface.poly_order`.
    /// Default: 2
    pub fit_order: usize,

    /// Half-height of the band of rows, around the middle of the slit, summed
    /// into the 1-D arc slice.
    /// Default: 10
    pub slice_halfwidth: usize,

    /// Peak detection for the first pass.
    /// Default: 97th percentile
    pub first_pass: PeakConfig,

    /// Peak detection for the second pass; `None` disables it.
    /// Default: 80th percentile
    pub second_pass: Option<PeakConfig>,

    /// Centroiding of operator picks (its `tol` is overwritten by `tol`).
    pub picks: PickConfig,

    pub line_trace: LineTraceConfig,

    pub surface: SurfaceConfig,

    /// When set, accepted pairs are written to `<base>.lines` and
    /// `<base>.lines2` after each pass.
    /// Default: None
    pub save_lines: Option<PathBuf>,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            tol: 10.0,
            fit_order: 2,
            slice_halfwidth: 10,
            first_pass: PeakConfig::default(),
            second_pass: Some(PeakConfig {
                pthreshold: 80.0,
                ..Default::default()
            }),
            picks: PickConfig::default(),
            line_trace: LineTraceConfig::default(),
            surface: SurfaceConfig::default(),
            save_lines: None,
        }
    }
}

/// Whether a wavelength array runs one way only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Monotonicity {
    Increasing,
    Decreasing,
    NonMonotonic,
}

impl Monotonicity {
    pub fn is_monotonic(self) -> bool {
        self != Monotonicity::NonMonotonic
    }
}

/// Classify `wavelengths`; warns (without touching the data) when it is
/// neither strictly increasing nor strictly decreasing.
pub fn check_monotonic(wavelengths: &[f64]) -> Monotonicity {
    let diffs = || wavelengths.windows(2).map(|w| w[1] - w[0]);
    if diffs().all(|d| d > 0.0) {
        Monotonicity::Increasing
    } else if diffs().all(|d| d < 0.0) {
        Monotonicity::Decreasing
    } else {
        warn!("wavelength solution is not monotonic; part of the fit is likely bad");
        Monotonicity::NonMonotonic
    }
}

/// Accepted pairs and polynomial of one identification pass.
#[derive(Debug, Clone, PartialEq)]
pub struct PassResult {
    pub pairs: Vec<LinePair>,
    pub polynomial: Polynomial,
    pub monotonicity: Monotonicity,
}

impl PassResult {
    /// Reference minus fitted wavelength at each pair.
    pub fn residuals(&self) -> Vec<f64> {
        residuals(&self.pairs, &self.polynomial)
    }
}

fn residuals(pairs: &[LinePair], poly: &Polynomial) -> Vec<f64> {
    pairs.iter().map(|p| p.wavelength - poly.eval(p.pixel)).collect()
}

/// States of a calibration run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalibrationStage {
    SliceExtraction,
    FirstPassIdentify,
    FirstPassFit,
    SecondPassIdentify,
    SecondPassFit,
    LineTrace,
    SurfaceFit,
    Done,
}

/// Everything a finished calibration produced.
#[derive(Debug, Clone)]
pub struct CalibrationResult {
    pub solution: WavelengthSolution,
    pub first_pass: PassResult,
    pub second_pass: Option<PassResult>,
    pub samples: LineSampleSet,
    /// The summed 1-D arc slice.
    pub slice: Vec<f64>,
}

impl CalibrationResult {
    /// The pass whose pairs were traced: the second when it succeeded.
    pub fn final_pass(&self) -> &PassResult {
        self.second_pass.as_ref().unwrap_or(&self.first_pass)
    }

    pub fn accepted_pairs(&self) -> &[LinePair] {
        &self.final_pass().pairs
    }

    pub fn fit_order(&self) -> usize {
        self.final_pass().polynomial.order()
    }

    /// Wavelength of every slice pixel from the final polynomial.
    pub fn slice_wavelengths(&self) -> Vec<f64> {
        self.final_pass().polynomial.eval_range(self.slice.len())
    }

    /// The pairs of both passes, ready to be persisted and replayed with
    /// [`Identification::FromFile`].
    pub fn saved_lines(&self) -> SavedLines {
        SavedLines {
            first_pass: self.first_pass.pairs.clone(),
            second_pass: self.second_pass.as_ref().map(|p| p.pairs.clone()),
        }
    }
}

/// A calibration run over one arc frame.
pub struct Calibration<'a, 'c> {
    frame: &'a Frame,
    mask: &'a IlluminationMask,
    lines: &'a ReferenceLines,
    hint: DispersionHint,
    identification: Identification<'c>,
    config: &'a CalibrationConfig,

    stage: CalibrationStage,
    slice: Vec<f64>,
    approx: Vec<f64>,
    pending: Vec<LinePair>,
    fit_order: usize,
    first: Option<PassResult>,
    second: Option<PassResult>,
    samples: Option<LineSampleSet>,
    solution: Option<WavelengthSolution>,
}

impl<'a, 'c> Calibration<'a, 'c> {
    pub fn new(
        frame: &'a Frame,
        mask: &'a IlluminationMask,
        lines: &'a ReferenceLines,
        hint: DispersionHint,
        identification: Identification<'c>,
        config: &'a CalibrationConfig,
    ) -> Self {
        Self {
            frame,
            mask,
            lines,
            hint,
            identification,
            config,
            stage: CalibrationStage::SliceExtraction,
            slice: Vec::new(),
            approx: Vec::new(),
            pending: Vec::new(),
            fit_order: config.fit_order,
            first: None,
            second: None,
            samples: None,
            solution: None,
        }
    }

    pub fn stage(&self) -> CalibrationStage {
        self.stage
    }

    /// Pairs accepted by the first pass, once it has been fit.
    pub fn first_pass(&self) -> Option<&PassResult> {
        self.first.as_ref()
    }

    pub fn second_pass(&self) -> Option<&PassResult> {
        self.second.as_ref()
    }

    /// Execute the current stage and advance; returns the new stage.
    pub fn step(&mut self) -> Result<CalibrationStage> {
        let next = match self.stage {
            CalibrationStage::SliceExtraction => self.extract_slice(),
            CalibrationStage::FirstPassIdentify => self.identify_first()?,
            CalibrationStage::FirstPassFit => self.fit_first()?,
            CalibrationStage::SecondPassIdentify => self.identify_second()?,
            CalibrationStage::SecondPassFit => self.fit_second()?,
            CalibrationStage::LineTrace => self.trace(),
            CalibrationStage::SurfaceFit => self.fit_solution()?,
            CalibrationStage::Done => CalibrationStage::Done,
        };
        self.stage = next;
        Ok(next)
    }

    /// Step until [`CalibrationStage::Done`].
    pub fn run(mut self) -> Result<CalibrationResult> {
        while self.step()? != CalibrationStage::Done {}
        self.into_result()
    }

    fn into_result(self) -> Result<CalibrationResult> {
        match (self.solution, self.first, self.samples) {
            (Some(solution), Some(first_pass), Some(samples)) => Ok(CalibrationResult {
                solution,
                first_pass,
                second_pass: self.second,
                samples,
                slice: self.slice,
            }),
            _ => Err(ReductionError::EmptyInput("unfinished calibration")),
        }
    }

    fn extract_slice(&mut self) -> CalibrationStage {
        let ns = self.frame.n_spatial();
        let nd = self.frame.n_dispersion();
        let mid = ns / 2;
        let hw = self.config.slice_halfwidth;
        self.slice = self
            .frame
            .dispersion_profile(mid.saturating_sub(hw), mid + hw, 0, nd);
        self.approx = self.hint.approximate_wavelengths(nd);
        info!(
            "arc slice: rows {}..{}, {} pixels, approx {:.1}..{:.1}",
            mid.saturating_sub(hw),
            (mid + hw).min(ns),
            nd,
            self.approx.first().copied().unwrap_or(0.0),
            self.approx.last().copied().unwrap_or(0.0)
        );
        CalibrationStage::FirstPassIdentify
    }

    fn identify_first(&mut self) -> Result<CalibrationStage> {
        let n = self.slice.len();
        self.pending = match &mut self.identification {
            Identification::Automatic => {
                let peaks = find_peaks(&self.approx, &self.slice, &self.config.first_pass)?;
                let state = matching::match_progressive(
                    &peaks,
                    &self.lines.coarse,
                    self.hint.polynomial(n, self.fit_order),
                    self.hint.center_wavelength,
                    self.config.tol,
                    self.fit_order,
                );
                info!(
                    "first pass: {} of {} peaks matched automatically",
                    state.accepted().len(),
                    peaks.len()
                );
                state.into_accepted()
            }
            Identification::Interactive(channel) => {
                let picks = PickConfig {
                    tol: self.config.tol,
                    ..self.config.picks.clone()
                };
                interactive::identify(&mut **channel, &self.slice, &self.approx, &picks)
            }
            Identification::FromFile(saved) => {
                info!("first pass: {} saved lines", saved.first_pass.len());
                saved.first_pass.clone()
            }
        };
        Ok(CalibrationStage::FirstPassFit)
    }

    fn fit_first(&mut self) -> Result<CalibrationStage> {
        let pairs = std::mem::take(&mut self.pending);
        let pass = self.fit_pass("first pass", pairs)?;
        if !matches!(self.identification, Identification::FromFile(_)) {
            self.save_pass(&pass.pairs, "lines", "first pass");
        }
        self.first = Some(pass);

        let saved_second = matches!(
            &self.identification,
            Identification::FromFile(SavedLines {
                second_pass: Some(_),
                ..
            })
        );
        let dense_pass = self.config.second_pass.is_some() && self.lines.dense.is_some();
        Ok(if saved_second || dense_pass {
            CalibrationStage::SecondPassIdentify
        } else {
            CalibrationStage::LineTrace
        })
    }

    fn identify_second(&mut self) -> Result<CalibrationStage> {
        if let Identification::FromFile(SavedLines {
            second_pass: Some(saved),
            ..
        }) = &self.identification
        {
            info!("second pass: {} saved lines", saved.len());
            self.pending = saved.clone();
            return Ok(CalibrationStage::SecondPassFit);
        }
        let (Some(peak_config), Some(dense), Some(first)) = (
            self.config.second_pass.as_ref(),
            self.lines.dense.as_ref(),
            self.first.as_ref(),
        ) else {
            return Ok(CalibrationStage::LineTrace);
        };
        let wavelengths = first.polynomial.eval_range(self.slice.len());
        let peaks = find_peaks(&wavelengths, &self.slice, peak_config)?;
        self.pending = matching::match_fixed(&peaks, dense, &first.polynomial, self.config.tol);
        info!(
            "second pass: {} of {} peaks matched",
            self.pending.len(),
            peaks.len()
        );
        Ok(CalibrationStage::SecondPassFit)
    }

    fn fit_second(&mut self) -> Result<CalibrationStage> {
        let pairs = std::mem::take(&mut self.pending);
        match self.fit_pass("second pass", pairs) {
            Ok(pass) => {
                if !matches!(self.identification, Identification::FromFile(_)) {
                    self.save_pass(&pass.pairs, "lines2", "second pass");
                }
                self.second = Some(pass);
            }
            Err(e @ ReductionError::InsufficientCalibrationLines { .. }) => {
                warn!("{}; keeping the first-pass solution", e);
            }
            Err(e) => return Err(e),
        }
        Ok(CalibrationStage::LineTrace)
    }

    fn trace(&mut self) -> CalibrationStage {
        let pass = self.second.as_ref().or(self.first.as_ref());
        let pairs = pass.map(|p| p.pairs.as_slice()).unwrap_or(&[]);
        self.samples = Some(trace_lines(
            self.frame,
            pairs,
            self.mask,
            &self.config.line_trace,
        ));
        CalibrationStage::SurfaceFit
    }

    fn fit_solution(&mut self) -> Result<CalibrationStage> {
        let samples = self.samples.as_ref().ok_or(ReductionError::EmptyInput("line samples"))?;
        // Row polynomials follow the order accepted for the final pass
        let surface = SurfaceConfig {
            poly_order: self.fit_order,
            ..self.config.surface.clone()
        };
        self.solution = Some(fit_surface(
            samples,
            self.frame.n_spatial(),
            self.frame.n_dispersion(),
            &surface,
        )?);
        info!("calibration done");
        Ok(CalibrationStage::Done)
    }

    /// Fit one pass, letting an operator revise the order when interactive.
    fn fit_pass(&mut self, stage: &'static str, pairs: Vec<LinePair>) -> Result<PassResult> {
        let n = self.slice.len();
        let pairs = usable_pairs(stage, pairs, n);
        let mut order = self.fit_order;
        let mut polynomial = fit_pairs(stage, &pairs, order, n)?;
        let mut monotonicity = check_monotonic(&polynomial.eval_range(n));

        if let Identification::Interactive(channel) = &mut self.identification {
            loop {
                let res = residuals(&pairs, &polynomial);
                let review = FitReview {
                    pass: stage,
                    order,
                    pairs: &pairs,
                    residuals: &res,
                };
                match channel.review_fit(&review) {
                    FitDecision::Accept => break,
                    FitDecision::ChangeOrder(new_order) => {
                        match fit_pairs(stage, &pairs, new_order, n) {
                            Ok(p) => {
                                polynomial = p;
                                order = new_order;
                                monotonicity = check_monotonic(&polynomial.eval_range(n));
                            }
                            Err(e) => warn!("{}; keeping order {}", e, order),
                        }
                    }
                }
            }
        }
        self.fit_order = order;

        let rms = {
            let r = residuals(&pairs, &polynomial);
            (r.iter().map(|v| v * v).sum::<f64>() / r.len().max(1) as f64).sqrt()
        };
        info!(
            "{}: order {} through {} lines, rms {:.4}",
            stage,
            order,
            pairs.len(),
            rms
        );
        Ok(PassResult {
            pairs,
            polynomial,
            monotonicity,
        })
    }

    fn save_pass(&self, pairs: &[LinePair], extension: &str, label: &str) {
        let Some(base) = &self.config.save_lines else {
            return;
        };
        let mut name = base.clone().into_os_string();
        name.push(".");
        name.push(extension);
        let path = PathBuf::from(name);
        if let Err(e) = crate::io::write_line_pairs(&path, pairs, label) {
            warn!("could not save {} lines: {:#}", label, e);
        }
    }
}

/// Pairs with a finite wavelength and a pixel on the slice; the rest are
/// dropped with a warning.
fn usable_pairs(stage: &'static str, pairs: Vec<LinePair>, n: usize) -> Vec<LinePair> {
    let total = pairs.len();
    let kept: Vec<LinePair> = pairs
        .into_iter()
        .filter(|p| p.wavelength.is_finite() && p.pixel >= 0.0 && p.pixel < n as f64)
        .collect();
    if kept.len() < total {
        warn!(
            "{}: dropped {} of {} line pairs outside the slice or not finite",
            stage,
            total - kept.len(),
            total
        );
    }
    kept
}

/// Least-squares polynomial through `pairs`, normalized about the slice center.
fn fit_pairs(
    stage: &'static str,
    pairs: &[LinePair],
    order: usize,
    n: usize,
) -> Result<Polynomial> {
    if pairs.len() < order + 1 {
        return Err(ReductionError::InsufficientCalibrationLines {
            stage,
            found: pairs.len(),
            required: order + 1,
        });
    }
    let (px, wl): (Vec<f64>, Vec<f64>) = pairs.iter().map(|p| (p.pixel, p.wavelength)).unzip();
    let half = n as f64 / 2.0;
    Polynomial::fit(&px, &wl, order, half, half.max(1.0))
}
