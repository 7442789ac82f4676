//! Operator-driven line identification.
//!
//! The calibration engine talks to a human through [`InteractiveChannel`]: it
//! shows the current slice and asks for a pick, or shows a fit and asks
//! whether to accept it. Requests block for as long as the channel needs; how
//! the slice is displayed is up to the implementation. [`TextChannel`] speaks a
//! line-oriented protocol over any reader/writer pair, [`ScriptedChannel`]
//! replays a fixed sequence of answers.

use std::collections::VecDeque;
use std::io::{BufRead, Write};

use tracing::{debug, info, warn};

use super::LinePair;
use crate::gaussian::{fit_with_fallback, Fallback, GaussianFitConfig, GaussianParams};
use crate::stats;

/// What the operator sees when asked for a pick.
#[derive(Debug, Clone, Copy)]
pub struct SliceView<'a> {
    /// Summed arc flux at every dispersion pixel.
    pub flux: &'a [f64],
    /// Approximate wavelength of every dispersion pixel.
    pub wavelengths: &'a [f64],
    /// Lines identified so far.
    pub picks: &'a [LinePair],
}

/// Operator response to a [`SliceView`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PickRequest {
    /// A line near `pixel` has the given reference wavelength.
    Line { pixel: f64, wavelength: f64 },
    /// Remove the pick nearest `pixel`.
    Delete { pixel: f64 },
    /// Identification is complete.
    Finished,
}

/// A polynomial fit presented for approval.
#[derive(Debug, Clone, Copy)]
pub struct FitReview<'a> {
    /// Which pass produced the fit ("first pass" / "second pass").
    pub pass: &'static str,
    pub order: usize,
    pub pairs: &'a [LinePair],
    /// Reference minus fitted wavelength at each pair.
    pub residuals: &'a [f64],
}

impl FitReview<'_> {
    pub fn rms(&self) -> f64 {
        if self.residuals.is_empty() {
            return 0.0;
        }
        (self.residuals.iter().map(|r| r * r).sum::<f64>() / self.residuals.len() as f64).sqrt()
    }
}

/// Operator response to a [`FitReview`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FitDecision {
    Accept,
    ChangeOrder(usize),
}

/// Request/response contract between the calibration engine and an operator.
pub trait InteractiveChannel {
    fn request_pick(&mut self, view: &SliceView<'_>) -> PickRequest;
    fn review_fit(&mut self, review: &FitReview<'_>) -> FitDecision;
}

/// Settings for turning operator picks into line pairs.
#[derive(Debug, Clone)]
pub struct PickConfig {
    /// Picks whose approximate wavelengths differ by less than this are the
    /// same line; a new pick replaces the old one.
    /// Default: 10.0
    pub tol: f64,
    /// Half-width, in pixels, of the window a pick is centroided over.
    /// Default: 10
    pub window: usize,
    /// Default: 3.0
    pub width_guess: f64,
    pub fit: GaussianFitConfig,
}

impl Default for PickConfig {
    fn default() -> Self {
        Self {
            tol: 10.0,
            window: 10,
            width_guess: 3.0,
            fit: GaussianFitConfig::default(),
        }
    }
}

/// Collect line pairs from the operator until they signal completion.
///
/// Invalid picks are discarded with a warning; whatever was accepted before
/// [`PickRequest::Finished`] is returned.
pub fn identify(
    channel: &mut dyn InteractiveChannel,
    flux: &[f64],
    wavelengths: &[f64],
    config: &PickConfig,
) -> Vec<LinePair> {
    let mut picks: Vec<LinePair> = Vec::new();
    // Approximate wavelength of each pick location, for proximity tests
    let mut marks: Vec<f64> = Vec::new();
    loop {
        let view = SliceView {
            flux,
            wavelengths,
            picks: &picks,
        };
        match channel.request_pick(&view) {
            PickRequest::Finished => break,
            PickRequest::Delete { pixel } => {
                let Some(mark) = approx_at(wavelengths, pixel) else {
                    warn!("delete at pixel {} is outside the slice; ignored", pixel);
                    continue;
                };
                match nearest_within(&marks, mark, config.tol) {
                    Some(k) => {
                        let removed = picks.remove(k);
                        marks.remove(k);
                        info!("removed pick {:.2} at pixel {:.2}", removed.wavelength, removed.pixel);
                    }
                    None => warn!("no pick within {} of pixel {}; nothing deleted", config.tol, pixel),
                }
            }
            PickRequest::Line { pixel, wavelength } => {
                if !wavelength.is_finite() {
                    warn!("not a valid wavelength: {}", wavelength);
                    continue;
                }
                let Some(mark) = approx_at(wavelengths, pixel) else {
                    warn!("pick at pixel {} is outside the slice; ignored", pixel);
                    continue;
                };
                let Some(center) = centroid_pick(flux, pixel, config) else {
                    warn!("no valid data near pixel {}; pick ignored", pixel);
                    continue;
                };
                if let Some(k) = nearest_within(&marks, mark, config.tol) {
                    let retracted = picks.remove(k);
                    marks.remove(k);
                    warn!(
                        "earlier pick {:.2} at pixel {:.2} retracted: within {} of the new pick at pixel {:.2}",
                        retracted.wavelength, retracted.pixel, config.tol, pixel
                    );
                }
                debug!("pick {:.2} at pixel {:.2}", wavelength, center);
                picks.push(LinePair {
                    pixel: center,
                    wavelength,
                });
                marks.push(mark);
            }
        }
    }
    info!("operator identified {} lines", picks.len());
    picks
}

fn approx_at(wavelengths: &[f64], pixel: f64) -> Option<f64> {
    if !pixel.is_finite() || pixel < 0.0 || pixel > (wavelengths.len() as f64 - 1.0) {
        return None;
    }
    wavelengths.get(pixel.round() as usize).copied()
}

fn nearest_within(marks: &[f64], mark: f64, tol: f64) -> Option<usize> {
    marks
        .iter()
        .enumerate()
        .map(|(k, m)| (k, (m - mark).abs()))
        .filter(|(_, d)| *d < tol)
        .min_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
        .map(|(k, _)| k)
}

/// Gaussian centroid of the slice around a pick; the brightest pixel when the
/// fit fails. `None` when fewer than 5 samples are available.
fn centroid_pick(flux: &[f64], pixel: f64, config: &PickConfig) -> Option<f64> {
    let w = config.window as f64;
    let lo = (pixel - w).ceil().max(0.0) as usize;
    let hi = ((pixel + w).floor().max(0.0) as usize + 1).min(flux.len());
    if hi <= lo || hi - lo <= 4 {
        return None;
    }
    let window = &flux[lo..hi];
    let imax = stats::argmax(window)?;
    let x: Vec<f64> = (lo..hi).map(|i| i as f64).collect();
    let guess = GaussianParams::new(
        window[imax],
        stats::median(flux).unwrap_or(0.0),
        (lo + imax) as f64,
        config.width_guess,
    );
    let outcome = fit_with_fallback(
        &x,
        window,
        guess,
        &config.fit,
        |p| p.center.is_finite() && p.center >= lo as f64 && p.center < hi as f64,
        Fallback::Estimate(guess),
    );
    if !outcome.is_fitted() {
        warn!(
            "could not centroid the line near pixel {:.1}; using the brightest pixel",
            pixel
        );
    }
    outcome.params().map(|p| p.center)
}

/// Line-oriented operator protocol.
///
/// Pick prompts accept `<pixel> <wavelength>`, `d <pixel>` and `done`;
/// fit prompts accept `d`/`accept` or a new polynomial order. Anything else is
/// reported and asked again. End of input finishes the current prompt.
pub struct TextChannel<R: BufRead, W: Write> {
    input: R,
    output: W,
}

impl<R: BufRead, W: Write> TextChannel<R, W> {
    pub fn new(input: R, output: W) -> Self {
        Self { input, output }
    }

    /// Prompt and read one trimmed line; `None` at end of input.
    fn prompt(&mut self, text: &str) -> Option<String> {
        if let Err(e) = write!(self.output, "{}", text).and_then(|_| self.output.flush()) {
            warn!("failed to write prompt: {}", e);
        }
        let mut line = String::new();
        match self.input.read_line(&mut line) {
            Ok(0) => None,
            Ok(_) => Some(line.trim().to_string()),
            Err(e) => {
                warn!("failed to read operator input: {}", e);
                None
            }
        }
    }
}

fn parse_pick(line: &str) -> Option<PickRequest> {
    let fields: Vec<&str> = line
        .split(|c: char| c.is_whitespace() || c == ',')
        .filter(|f| !f.is_empty())
        .collect();
    match fields.as_slice() {
        [cmd] if matches!(cmd.to_ascii_lowercase().as_str(), "done" | "q" | "quit") => {
            Some(PickRequest::Finished)
        }
        ["d", pixel] => pixel.parse().ok().map(|pixel| PickRequest::Delete { pixel }),
        [pixel, wavelength] => Some(PickRequest::Line {
            pixel: pixel.parse().ok()?,
            wavelength: wavelength.parse().ok()?,
        }),
        _ => None,
    }
}

fn parse_decision(line: &str) -> Option<FitDecision> {
    match line.to_ascii_lowercase().as_str() {
        "d" | "done" | "accept" => Some(FitDecision::Accept),
        other => other.parse().ok().map(FitDecision::ChangeOrder),
    }
}

impl<R: BufRead, W: Write> InteractiveChannel for TextChannel<R, W> {
    fn request_pick(&mut self, view: &SliceView<'_>) -> PickRequest {
        let text = format!(
            "{} lines identified. Enter '<pixel> <wavelength>', 'd <pixel>' or 'done': ",
            view.picks.len()
        );
        loop {
            let Some(line) = self.prompt(&text) else {
                return PickRequest::Finished;
            };
            match parse_pick(&line) {
                Some(request) => return request,
                None => warn!("unrecognized input '{}'", line),
            }
        }
    }

    fn review_fit(&mut self, review: &FitReview<'_>) -> FitDecision {
        let text = format!(
            "{}: order {} through {} lines, rms {:.4}. Enter 'd' to accept or a new order: ",
            review.pass,
            review.order,
            review.pairs.len(),
            review.rms()
        );
        loop {
            let Some(line) = self.prompt(&text) else {
                return FitDecision::Accept;
            };
            match parse_decision(&line) {
                Some(decision) => return decision,
                None => warn!("unrecognized input '{}'", line),
            }
        }
    }
}

/// Replays pre-recorded answers; once exhausted it finishes and accepts.
#[derive(Debug, Clone, Default)]
pub struct ScriptedChannel {
    picks: VecDeque<PickRequest>,
    decisions: VecDeque<FitDecision>,
}

impl ScriptedChannel {
    pub fn new(
        picks: impl IntoIterator<Item = PickRequest>,
        decisions: impl IntoIterator<Item = FitDecision>,
    ) -> Self {
        Self {
            picks: picks.into_iter().collect(),
            decisions: decisions.into_iter().collect(),
        }
    }
}

impl InteractiveChannel for ScriptedChannel {
    fn request_pick(&mut self, _view: &SliceView<'_>) -> PickRequest {
        self.picks.pop_front().unwrap_or(PickRequest::Finished)
    }

    fn review_fit(&mut self, _review: &FitReview<'_>) -> FitDecision {
        self.decisions.pop_front().unwrap_or(FitDecision::Accept)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arc_slice() -> (Vec<f64>, Vec<f64>) {
        let flux: Vec<f64> = (0..300)
            .map(|i| {
                let x = i as f64;
                20.0 + [75.4, 160.2, 240.7]
                    .iter()
                    .map(|c| 800.0 * (-(x - c).powi(2) / (2.0 * 2.0f64.powi(2))).exp())
                    .sum::<f64>()
            })
            .collect();
        let wave = (0..300).map(|i| 5000.0 + 2.0 * i as f64).collect();
        (flux, wave)
    }

    #[test]
    fn test_picks_are_centroided_and_retracted() {
        let (flux, wave) = arc_slice();
        let mut channel = ScriptedChannel::new(
            [
                PickRequest::Line {
                    pixel: 74.0,
                    wavelength: 5150.9,
                },
                PickRequest::Line {
                    pixel: 160.0,
                    wavelength: 5320.0,
                },
                // Lands on the previous pick: replaces it
                PickRequest::Line {
                    pixel: 161.0,
                    wavelength: 5320.4,
                },
                PickRequest::Line {
                    pixel: 241.0,
                    wavelength: 5481.4,
                },
                PickRequest::Delete { pixel: 75.0 },
                PickRequest::Line {
                    pixel: 1e6,
                    wavelength: 6000.0,
                },
            ],
            [],
        );
        let pairs = identify(&mut channel, &flux, &wave, &PickConfig::default());
        assert_eq!(pairs.len(), 2, "{pairs:?}");
        assert!((pairs[0].pixel - 160.2).abs() < 1e-3);
        assert_eq!(pairs[0].wavelength, 5320.4);
        assert!((pairs[1].pixel - 240.7).abs() < 1e-3);
    }

    #[test]
    fn test_text_channel_protocol() {
        let input = b"74 5150.9\nnonsense\nd 74\n  done \n3\nd\n".as_slice();
        let mut out = Vec::new();
        let mut channel = TextChannel::new(input, &mut out);
        let view = SliceView {
            flux: &[],
            wavelengths: &[],
            picks: &[],
        };
        assert_eq!(
            channel.request_pick(&view),
            PickRequest::Line {
                pixel: 74.0,
                wavelength: 5150.9
            }
        );
        // The malformed line is skipped
        assert_eq!(channel.request_pick(&view), PickRequest::Delete { pixel: 74.0 });
        assert_eq!(channel.request_pick(&view), PickRequest::Finished);

        let review = FitReview {
            pass: "first pass",
            order: 2,
            pairs: &[],
            residuals: &[],
        };
        assert_eq!(channel.review_fit(&review), FitDecision::ChangeOrder(3));
        assert_eq!(channel.review_fit(&review), FitDecision::Accept);
        // End of input accepts
        assert_eq!(channel.review_fit(&review), FitDecision::Accept);
        drop(channel);
        assert!(String::from_utf8(out).unwrap().contains("order 2"));
    }
}
