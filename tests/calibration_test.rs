//! Arc-lamp calibration on a synthetic HeNeAr-like frame with a known
//! dispersion relation.


use longslit::calibrate::{
    Calibration, CalibrationConfig, CalibrationResult, CalibrationStage, FitDecision,
    Identification, LineList, LinePair, PickRequest, ReferenceLines, SavedLines, ScriptedChannel,
};
use longslit::{IlluminationMask, ReductionError, SurfaceConfig, SurfaceMode, WavelengthSolution};
use test_data::{
    arc_frame, arc_pixel, arc_wavelength, init_tracing, ArcScene, ARC_DISPERSION, BRIGHT_LINES,
    FAINT_LINES,
};

fn coarse_only(arc: &ArcScene) -> ReferenceLines {
    ReferenceLines {
        coarse: arc.coarse.clone(),
        dense: None,
    }
}

fn with_dense(arc: &ArcScene) -> ReferenceLines {
    ReferenceLines {
        coarse: arc.coarse.clone(),
        dense: Some(arc.dense.clone()),
    }
}

fn calibrate(
    arc: &ArcScene,
    lines: &ReferenceLines,
    identification: Identification<'_>,
    config: &CalibrationConfig,
) -> longslit::Result<CalibrationResult> {
    Calibration::new(
        &arc.frame,
        &IlluminationMask::all(),
        lines,
        arc.hint,
        identification,
        config,
    )
    .run()
}

fn assert_solution_matches_truth(solution: &WavelengthSolution, tol: f64) {
    for s in [20.0, 50.0, 80.0] {
        for d in (30..ARC_DISPERSION - 40).step_by(23) {
            let d = d as f64;
            let got = solution.evaluate(d, s);
            let expected = arc_wavelength(d, s);
            assert!(
                (got - expected).abs() < tol,
                "({}, {}): {} vs {}",
                d,
                s,
                got,
                expected
            );
        }
    }
}

#[test]
fn test_automatic_first_pass() {
    init_tracing();
    let arc = arc_frame(0.0, 1);
    let result = calibrate(
        &arc,
        &coarse_only(&arc),
        Identification::Automatic,
        &CalibrationConfig::default(),
    )
    .unwrap();

    assert!(result.second_pass.is_none());
    let pairs = result.accepted_pairs();
    assert_eq!(pairs.len(), BRIGHT_LINES.len());
    for pair in pairs {
        assert!(BRIGHT_LINES.contains(&pair.wavelength));
        let truth = arc_pixel(pair.wavelength, 49.5);
        assert!((pair.pixel - truth).abs() < 0.1, "{:?} vs {}", pair, truth);
    }
    assert!(result.first_pass.monotonicity.is_monotonic());
    assert!(result.first_pass.residuals().iter().all(|r| r.abs() < 0.1));
    assert!(!result.samples.is_empty());
    assert_solution_matches_truth(&result.solution, 0.1);
}

#[test]
fn test_second_pass_adds_faint_lines() {
    init_tracing();
    let arc = arc_frame(0.0, 2);
    let result = calibrate(
        &arc,
        &with_dense(&arc),
        Identification::Automatic,
        &CalibrationConfig::default(),
    )
    .unwrap();

    let second = result.second_pass.as_ref().unwrap();
    let found_faint = second
        .pairs
        .iter()
        .filter(|p| FAINT_LINES.contains(&p.wavelength))
        .count();
    assert!(found_faint >= 3, "only {} faint lines", found_faint);
    assert!(second.pairs.len() > result.first_pass.pairs.len());
    assert_eq!(result.final_pass(), second);
    assert_solution_matches_truth(&result.solution, 0.1);
}

#[test]
fn test_automatic_is_deterministic() {
    init_tracing();
    let arc = arc_frame(0.0, 3);
    let lines = with_dense(&arc);
    let config = CalibrationConfig::default();
    let a = calibrate(&arc, &lines, Identification::Automatic, &config).unwrap();
    let b = calibrate(&arc, &lines, Identification::Automatic, &config).unwrap();

    assert_eq!(a.accepted_pairs(), b.accepted_pairs());
    assert_eq!(
        a.final_pass().polynomial.coefficients(),
        b.final_pass().polynomial.coefficients()
    );
    assert_eq!(a.samples, b.samples);
}

#[test]
fn test_stage_sequence() {
    init_tracing();
    let arc = arc_frame(0.0, 4);
    let lines = with_dense(&arc);
    let config = CalibrationConfig::default();
    let mask = IlluminationMask::all();
    let mut calibration = Calibration::new(
        &arc.frame,
        &mask,
        &lines,
        arc.hint,
        Identification::Automatic,
        &config,
    );

    let mut stages = vec![calibration.stage()];
    while *stages.last().unwrap() != CalibrationStage::Done {
        stages.push(calibration.step().unwrap());
        if stages.last() == Some(&CalibrationStage::SecondPassIdentify) {
            assert!(calibration.first_pass().is_some());
        }
    }
    assert_eq!(
        stages,
        vec![
            CalibrationStage::SliceExtraction,
            CalibrationStage::FirstPassIdentify,
            CalibrationStage::FirstPassFit,
            CalibrationStage::SecondPassIdentify,
            CalibrationStage::SecondPassFit,
            CalibrationStage::LineTrace,
            CalibrationStage::SurfaceFit,
            CalibrationStage::Done,
        ]
    );
    assert!(calibration.second_pass().is_some());
    let result = calibration.run().unwrap();
    assert_solution_matches_truth(&result.solution, 0.1);
}

#[test]
fn test_scripted_interactive_identification() {
    init_tracing();
    let arc = arc_frame(0.0, 5);
    let pick = |w: f64| PickRequest::Line {
        pixel: arc_pixel(w, 50.0).round(),
        wavelength: w,
    };
    let mut channel = ScriptedChannel::new(
        vec![
            pick(BRIGHT_LINES[0]),
            pick(BRIGHT_LINES[2]),
            // Mislabelled, then deleted
            PickRequest::Line {
                pixel: arc_pixel(BRIGHT_LINES[4], 50.0).round(),
                wavelength: 6100.0,
            },
            PickRequest::Delete {
                pixel: arc_pixel(BRIGHT_LINES[4], 50.0).round(),
            },
            pick(BRIGHT_LINES[4]),
            pick(BRIGHT_LINES[6]),
            pick(BRIGHT_LINES[7]),
            PickRequest::Finished,
        ],
        vec![FitDecision::ChangeOrder(1), FitDecision::ChangeOrder(2), FitDecision::Accept],
    );

    let result = calibrate(
        &arc,
        &coarse_only(&arc),
        Identification::Interactive(&mut channel),
        &CalibrationConfig::default(),
    )
    .unwrap();

    let wavelengths: Vec<f64> = result.first_pass.pairs.iter().map(|p| p.wavelength).collect();
    assert_eq!(wavelengths.len(), 5);
    assert!(!wavelengths.contains(&6100.0));
    assert_eq!(result.fit_order(), 2);
    for pair in &result.first_pass.pairs {
        assert!((pair.pixel - arc_pixel(pair.wavelength, 49.5)).abs() < 0.2);
    }
    assert_solution_matches_truth(&result.solution, 0.15);
}

#[test]
fn test_saved_lines_replay() {
    init_tracing();
    let arc = arc_frame(0.0, 6);
    let lines = with_dense(&arc);
    let dir = tempfile::tempdir().unwrap();
    let base = dir.path().join("arc");
    let config = CalibrationConfig {
        save_lines: Some(base.clone()),
        ..Default::default()
    };
    let automatic = calibrate(&arc, &lines, Identification::Automatic, &config).unwrap();

    let first = longslit::io::read_line_pairs(dir.path().join("arc.lines")).unwrap();
    let second = longslit::io::read_line_pairs(dir.path().join("arc.lines2")).unwrap();
    assert_eq!(first, automatic.first_pass.pairs);
    assert_eq!(Some(&second), automatic.second_pass.as_ref().map(|p| &p.pairs));

    // Replaying does not touch the saved files
    let before = std::fs::read_to_string(dir.path().join("arc.lines")).unwrap();
    let replay = calibrate(
        &arc,
        &lines,
        Identification::FromFile(SavedLines {
            first_pass: first,
            second_pass: Some(second),
        }),
        &config,
    )
    .unwrap();
    let after = std::fs::read_to_string(dir.path().join("arc.lines")).unwrap();
    assert_eq!(before, after);

    assert_eq!(replay.accepted_pairs(), automatic.accepted_pairs());
    for (a, b) in replay
        .final_pass()
        .polynomial
        .coefficients()
        .iter()
        .zip(automatic.final_pass().polynomial.coefficients())
    {
        assert!((a - b).abs() < 1e-9);
    }
}

#[test]
fn test_saved_lines_with_bad_records() {
    init_tracing();
    let arc = arc_frame(0.0, 9);
    let good: Vec<LinePair> = BRIGHT_LINES
        .iter()
        .map(|&w| LinePair {
            pixel: arc_pixel(w, 49.5),
            wavelength: w,
        })
        .collect();
    let mut saved = good.clone();
    saved.insert(
        2,
        LinePair {
            pixel: f64::NAN,
            wavelength: 5650.0,
        },
    );
    saved.push(LinePair {
        pixel: 1e20,
        wavelength: 6600.0,
    });

    let result = calibrate(
        &arc,
        &coarse_only(&arc),
        Identification::FromFile(SavedLines {
            first_pass: saved,
            second_pass: None,
        }),
        &CalibrationConfig::default(),
    )
    .unwrap();

    assert_eq!(result.first_pass.pairs, good);
    assert_solution_matches_truth(&result.solution, 0.1);
}

#[test]
fn test_accepted_order_drives_row_polynomials() {
    init_tracing();
    let arc = arc_frame(0.0, 10);
    let picks: Vec<PickRequest> = BRIGHT_LINES
        .iter()
        .map(|&w| PickRequest::Line {
            pixel: arc_pixel(w, 50.0).round(),
            wavelength: w,
        })
        .chain(std::iter::once(PickRequest::Finished))
        .collect();
    let mut channel = ScriptedChannel::new(
        picks,
        vec![FitDecision::ChangeOrder(1), FitDecision::Accept],
    );
    let config = CalibrationConfig {
        second_pass: None,
        surface: SurfaceConfig {
            mode: SurfaceMode::Poly,
            poly_order: 3,
            ..Default::default()
        },
        ..Default::default()
    };

    let result = calibrate(
        &arc,
        &coarse_only(&arc),
        Identification::Interactive(&mut channel),
        &config,
    )
    .unwrap();
    assert_eq!(result.fit_order(), 1);

    // A linear row has no curvature, unlike the quadratic truth
    let WavelengthSolution::RowPoly(table) = &result.solution else {
        panic!("expected a row-polynomial solution");
    };
    let row = table.row(50);
    assert!(table.is_populated(50));
    for d in 1..ARC_DISPERSION - 1 {
        let curvature = row[d + 1] - 2.0 * row[d] + row[d - 1];
        assert!(curvature.abs() < 1e-8, "column {}: {}", d, curvature);
    }
}

#[test]
fn test_no_matching_lines() {
    init_tracing();
    let arc = arc_frame(0.0, 7);
    let lines = ReferenceLines {
        coarse: LineList::new(vec![4000.0, 4100.0, 7500.0]),
        dense: None,
    };
    let err = calibrate(
        &arc,
        &lines,
        Identification::Automatic,
        &CalibrationConfig::default(),
    )
    .unwrap_err();
    assert!(matches!(
        err,
        ReductionError::InsufficientCalibrationLines { found: 0, .. }
    ));
}

#[test]
fn test_surface_modes_agree() {
    init_tracing();
    let arc = arc_frame(0.0, 8);
    let lines = with_dense(&arc);
    for mode in [SurfaceMode::Poly, SurfaceMode::Spline, SurfaceMode::Spline2d] {
        let config = CalibrationConfig {
            surface: SurfaceConfig {
                mode,
                ..Default::default()
            },
            ..Default::default()
        };
        let result = calibrate(&arc, &lines, Identification::Automatic, &config).unwrap();
        assert_eq!(result.solution.mode(), mode);
        assert_solution_matches_truth(&result.solution, 0.5);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("solution.rkyv");
        result.solution.save_to_file(&path).unwrap();
        let loaded = WavelengthSolution::load_from_file(&path).unwrap();
        assert_eq!(loaded.evaluate(250.0, 40.0), result.solution.evaluate(250.0, 40.0));
    }
}
