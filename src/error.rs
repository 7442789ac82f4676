//! Errors raised by the reduction pipeline.
//!
//! Only whole-pipeline data insufficiency is fatal. Local fit failures are
//! reported through [`FitError`](crate::gaussian::FitError) and are always
//! absorbed by the calling stage (fallback to a global estimate, or the sample
//! is skipped).

use thiserror::Error;

/// Fatal conditions of a tracing / calibration / extraction run.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ReductionError {
    /// Too few non-empty dispersion bins to spline a trace through.
    #[error("only {usable} usable trace bins, need at least {required}")]
    InsufficientBins { usable: usize, required: usize },

    /// Too few identified arc lines to fit a polynomial of the requested order.
    #[error("{stage}: {found} calibration lines identified, need at least {required}")]
    InsufficientCalibrationLines {
        stage: &'static str,
        found: usize,
        required: usize,
    },

    /// A mode string did not name a known interpolation / fit mode.
    #[error("unrecognized mode '{0}'")]
    InvalidMode(String),

    /// Input arrays or images have inconsistent sizes.
    #[error("dimension mismatch: {0}")]
    DimensionMismatch(String),

    /// An input that must contain data was empty.
    #[error("empty input: {0}")]
    EmptyInput(&'static str),
}

pub type Result<T> = std::result::Result<T, ReductionError>;
