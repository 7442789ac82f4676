//! Wavelength along a trace.

use crate::aperture::Trace;
use crate::surface::WavelengthSolution;

/// Evaluate `solution` at `(column, trace[column])` for every column.
///
/// Pure evaluation; for row-tabulated solutions the two nearest populated
/// rows are interpolated linearly.
pub fn map_wavelength(trace: &Trace, solution: &WavelengthSolution) -> Vec<f64> {
    trace
        .iter()
        .enumerate()
        .map(|(column, spatial)| solution.evaluate(column as f64, spatial))
        .collect()
}
