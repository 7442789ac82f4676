//! # longslit
//!
//! Reduction of **long-slit spectroscopy** frames, written in Rust.
//!
//! Given a 2-D science frame and an arc-lamp frame from the same setup,
//! `longslit` traces the target's spectrum along the detector, builds a
//! wavelength solution from the lamp lines, and extracts a 1-D spectrum with
//! sky and flux uncertainty at every dispersion pixel.
//!
//! ## Features
//!
//! - **Aperture tracing** — robust per-bin Gaussian centroiding with a global
//!   fallback, smoothed into one spatial position per dispersion pixel
//! - **Two-pass wavelength calibration** — automatic progressive line matching,
//!   an interactive identification protocol, or pairs replayed from disk
//! - **Spatially varying solutions** — arc lines are followed along the slit
//!   and fit per row (polynomial or spline) or as a 2-D smoothing surface
//! - **Aperture extraction** — flanking sky windows with a constant or
//!   polynomial sky model and a CCD-style error estimate
//! - **Zero-copy persistence** — wavelength solutions serialize with
//!   [rkyv](https://docs.rs/rkyv) so a solved arc can be reused
//!
//! ## Example
//!
//! ```no_run
//! use longslit::calibrate::{
//!     Calibration, CalibrationConfig, DispersionHint, Identification, LineList, ReferenceLines,
//! };
//! use longslit::{
//!     extract_aperture, map_wavelength, trace_aperture, ExtractionConfig, Frame,
//!     IlluminationMask, SpatialAxis, Spectrum, TraceConfig, TraceSeed,
//! };
//!
//! let science = Frame::open("object.tiff", SpatialAxis::Y).unwrap();
//! let arc = Frame::open("arc.tiff", SpatialAxis::Y).unwrap();
//! let mask = IlluminationMask::all();
//!
//! // Where is the target on the slit?
//! let trace = trace_aperture(&science, &mask, TraceSeed::Brightest, &TraceConfig::default())
//!     .unwrap();
//!
//! // Wavelength solution from the lamp
//! let lines = ReferenceLines {
//!     coarse: LineList::from_file("apohenear.dat").unwrap(),
//!     dense: None,
//! };
//! let calibration = Calibration::new(
//!     &arc,
//!     &mask,
//!     &lines,
//!     DispersionHint::new(2.44, 6500.0, false),
//!     Identification::Automatic,
//!     &CalibrationConfig::default(),
//! )
//! .run()
//! .unwrap();
//!
//! // Extract and attach wavelengths
//! let extraction = extract_aperture(&science, &trace, &ExtractionConfig::default()).unwrap();
//! let wavelength = map_wavelength(&trace, &calibration.solution);
//! let spectrum = Spectrum::new(wavelength, extraction).unwrap();
//! longslit::io::write_spectrum("object.spec", &spectrum).unwrap();
//! ```
//!
//! ## Pipeline overview
//!
//! 1. **Trace**: median filter, fit the collapsed spatial profile, then fit
//!    each of `nsteps` dispersion bins and interpolate the bin centers
//! 2. **Slice**: sum `slice_halfwidth` rows either side of the middle of
//!    the slit in the arc frame
//! 3. **Identify**: detect peaks and pair them with reference wavelengths,
//!    refitting a dispersion polynomial as matches accumulate
//! 4. **Second pass** (optional): re-detect fainter peaks and match them
//!    against a denser list using the first-pass polynomial
//! 5. **Line trace**: follow every identified line up and down the slit
//! 6. **Surface**: fit wavelength as a function of `(dispersion, spatial)`
//! 7. **Extract**: sum the aperture, estimate sky from flanking windows and
//!    evaluate the solution along the trace
//!

pub mod aperture;
pub mod calibrate;
pub mod error;
pub mod extract;
pub mod frame;
pub mod gaussian;
pub mod io;
pub mod line_trace;
pub mod mapping;
pub mod normalize;
pub mod peaks;
pub mod polynomial;
pub mod spline;
pub mod stats;
pub mod surface;

pub use aperture::{trace_aperture, Trace, TraceConfig, TraceSeed};
pub use calibrate::{
    Calibration, CalibrationConfig, CalibrationResult, CalibrationStage, DispersionHint,
    Identification, LineList, LinePair, ReferenceLines,
};
pub use error::{ReductionError, Result};
pub use extract::{extract_aperture, ExtractionConfig, ExtractionResult, Spectrum};
pub use frame::{Frame, IlluminationMask, SpatialAxis};
pub use gaussian::{FitError, GaussianFitConfig, GaussianParams};
pub use line_trace::{trace_lines, LineSample, LineSampleSet, LineTraceConfig};
pub use mapping::map_wavelength;
pub use normalize::{normalize_continuum, ContinuumMode, NormalizeConfig};
pub use peaks::{find_peaks, Peak, PeakConfig, PeakSet};
pub use surface::{fit_surface, SurfaceConfig, SurfaceMode, WavelengthSolution};
