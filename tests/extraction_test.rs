//! Aperture extraction, wavelength mapping and spectrum files end to end.


use longslit::calibrate::{Calibration, CalibrationConfig, Identification, ReferenceLines};
use longslit::{
    extract_aperture, map_wavelength, normalize_continuum, trace_aperture, ExtractionConfig,
    IlluminationMask, NormalizeConfig, Spectrum, Trace, TraceSeed,
};
use test_data::{arc_frame, arc_wavelength, init_tracing, point_source_frame, trace_frame};

#[test]
fn test_point_source_on_flat_background() {
    init_tracing();
    let frame = point_source_frame(60, 50, 30, 5000.0, 100.0);
    let trace = Trace::new(vec![30.0; 50]);
    let config = ExtractionConfig {
        apwidth: 8,
        skysep: 3,
        skywidth: 7,
        skydeg: 0,
        coadd: 1,
    };

    let result = extract_aperture(&frame, &trace, &config).unwrap();
    assert_eq!(result.len(), 50);
    for i in 0..result.len() {
        assert!((result.flux[i] - 6700.0).abs() < 1e-6, "flux {}", result.flux[i]);
        assert!((result.sky[i] - 1700.0).abs() < 1e-6, "sky {}", result.sky[i]);
        assert!(result.flux_err[i].is_finite() && result.flux_err[i] > 0.0);
    }
}

#[test]
fn test_sky_scatter_raises_uncertainty() {
    init_tracing();
    let quiet = point_source_frame(60, 20, 30, 5000.0, 100.0);
    // Alternating +-5 background pattern
    let noisy = longslit::Frame::from_fn(60, 20, |s, d| {
        quiet.get(s, d) + if (s + d) % 2 == 0 { 5.0 } else { -5.0 }
    });
    let trace = Trace::new(vec![30.0; 20]);
    let config = ExtractionConfig::default();
    let a = extract_aperture(&quiet, &trace, &config).unwrap();
    let b = extract_aperture(&noisy, &trace, &config).unwrap();
    for i in 0..20 {
        assert!(b.flux_err[i] > a.flux_err[i]);
    }
}

#[test]
fn test_reduce_science_frame() {
    init_tracing();
    let arc = arc_frame(0.0, 11);
    let lines = ReferenceLines {
        coarse: arc.coarse.clone(),
        dense: Some(arc.dense.clone()),
    };
    let calibration = Calibration::new(
        &arc.frame,
        &IlluminationMask::all(),
        &lines,
        arc.hint,
        Identification::Automatic,
        &CalibrationConfig::default(),
    )
    .run()
    .unwrap();

    // Science frame on the same detector: 100 × 600
    let science = trace_frame(100, 600, |d| 48.0 + 0.004 * d, 800.0, 2.0, 30.0, 0.0, 5);
    let trace = trace_aperture(
        &science.frame,
        &IlluminationMask::all(),
        TraceSeed::Brightest,
        &Default::default(),
    )
    .unwrap();
    let extraction = extract_aperture(&science.frame, &trace, &ExtractionConfig::default()).unwrap();
    let wavelength = map_wavelength(&trace, &calibration.solution);
    for d in (40..560).step_by(37) {
        let expected = arc_wavelength(d as f64, trace.positions()[d]);
        assert!(
            (wavelength[d] - expected).abs() < 0.2,
            "column {}: {} vs {}",
            d,
            wavelength[d],
            expected
        );
    }

    let spectrum = Spectrum::new(wavelength, extraction).unwrap();
    let net = spectrum.sky_subtracted();
    let source = 800.0 * 2.0 * (2.0 * std::f64::consts::PI).sqrt();
    assert!(net.iter().all(|f| (f - source).abs() < 0.02 * source));

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("object.spec");
    longslit::io::write_spectrum(&path, &spectrum).unwrap();
    let back = longslit::io::read_spectrum(&path).unwrap();
    assert_eq!(back.len(), 600);
    assert_eq!(back.wavelength, spectrum.wavelength);

    // Flat source: nothing left after continuum normalization
    let norm = normalize_continuum(&back.wavelength, &back.flux, &NormalizeConfig::default())
        .unwrap();
    assert!(norm.iter().all(|v| v.abs() < 0.02));
}
