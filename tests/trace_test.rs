//! Aperture tracing on synthetic science frames.


use longslit::{
    extract_aperture, trace_aperture, ExtractionConfig, Frame, IlluminationMask, SpatialAxis, Trace,
    TraceConfig, TraceSeed,
};
use test_data::{init_tracing, trace_frame};

fn rms_error(trace: &Trace, truth: &[f64]) -> f64 {
    let sum: f64 = trace
        .iter()
        .zip(truth)
        .map(|(t, c)| (t - c).powi(2))
        .sum();
    (sum / truth.len() as f64).sqrt()
}

fn drifting_center(d: f64) -> f64 {
    100.0 + 2.0 * (2.0 * std::f64::consts::PI * d / 400.0).sin()
}

#[test]
fn test_trace_follows_sinusoidal_drift() {
    init_tracing();
    let scene = trace_frame(200, 400, drifting_center, 500.0, 3.0, 20.0, 0.0, 1);

    let config = TraceConfig {
        nsteps: 20,
        ..Default::default()
    };
    let trace = trace_aperture(
        &scene.frame,
        &IlluminationMask::all(),
        TraceSeed::Brightest,
        &config,
    )
    .unwrap();

    assert_eq!(trace.len(), 400);
    let rms = rms_error(&trace, &scene.centers);
    println!("noiseless trace rms error: {:.4} px", rms);
    assert!(rms < 0.5, "rms {}", rms);
}

#[test]
fn test_trace_with_noise() {
    init_tracing();
    // Peak signal-to-noise of 10 per pixel
    let scene = trace_frame(200, 400, drifting_center, 200.0, 3.0, 50.0, 20.0, 42);

    let trace = trace_aperture(
        &scene.frame,
        &IlluminationMask::all(),
        TraceSeed::Brightest,
        &TraceConfig::default(),
    )
    .unwrap();

    assert_eq!(trace.len(), 400);
    let rms = rms_error(&trace, &scene.centers);
    println!("noisy trace rms error: {:.4} px", rms);
    assert!(rms < 0.5, "rms {}", rms);
}

#[test]
fn test_retrace_from_saved_trace() {
    init_tracing();
    let scene = trace_frame(120, 300, |d| 60.0 + 0.01 * d, 400.0, 2.5, 10.0, 0.0, 7);
    let mask = IlluminationMask::all();
    let first = trace_aperture(&scene.frame, &mask, TraceSeed::Brightest, &Default::default())
        .unwrap();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("object.trace");
    longslit::io::write_trace(&path, &first).unwrap();
    let prior = longslit::io::read_trace(&path).unwrap();
    assert_eq!(prior, first);

    let second = trace_aperture(
        &scene.frame,
        &mask,
        TraceSeed::Recenter(&prior),
        &Default::default(),
    )
    .unwrap();
    for (a, b) in first.iter().zip(second.iter()) {
        assert!((a - b).abs() < 1e-3);
    }
}

#[test]
fn test_trace_restricted_to_illuminated_rows() {
    init_tracing();
    // A brighter contaminating source outside the illuminated region
    let target = trace_frame(200, 200, |_| 120.0, 300.0, 2.5, 10.0, 0.0, 3);
    let frame = longslit::Frame::from_fn(200, 200, |s, d| {
        let x = s as f64 - 30.0;
        target.frame.get(s, d) + 900.0 * (-x * x / 12.5).exp()
    });

    let trace = trace_aperture(
        &frame,
        &IlluminationMask::from_range(60, 200),
        TraceSeed::Brightest,
        &Default::default(),
    )
    .unwrap();
    let median = trace.median().unwrap();
    assert!((median - 120.0).abs() < 0.5, "median {}", median);
}

#[test]
fn test_slit_along_image_columns() {
    init_tracing();
    let scene = trace_frame(200, 400, drifting_center, 500.0, 3.0, 20.0, 0.0, 9);
    // Same scene with dispersion along image rows: 400 rows × 200 columns
    let mut pixels = Vec::with_capacity(200 * 400);
    for d in 0..400 {
        for s in 0..200 {
            pixels.push(scene.frame.get(s, d));
        }
    }
    let transposed = Frame::from_raw(pixels, 200, 400, SpatialAxis::X).unwrap();
    assert_eq!(transposed.n_spatial(), 200);
    assert_eq!(transposed.n_dispersion(), 400);

    let mask = IlluminationMask::all();
    let config = TraceConfig::default();
    let along_rows = trace_aperture(&scene.frame, &mask, TraceSeed::Brightest, &config).unwrap();
    let along_columns = trace_aperture(&transposed, &mask, TraceSeed::Brightest, &config).unwrap();
    assert_eq!(along_columns.len(), 400);
    assert!(rms_error(&along_columns, &scene.centers) < 0.5);
    for (a, b) in along_rows.iter().zip(along_columns.iter()) {
        assert!((a - b).abs() < 1e-9, "{} vs {}", a, b);
    }

    let extraction = ExtractionConfig::default();
    let a = extract_aperture(&scene.frame, &along_rows, &extraction).unwrap();
    let b = extract_aperture(&transposed, &along_columns, &extraction).unwrap();
    for i in 0..400 {
        assert!((a.flux[i] - b.flux[i]).abs() < 1e-6);
        assert!((a.sky[i] - b.sky[i]).abs() < 1e-6);
    }
}
