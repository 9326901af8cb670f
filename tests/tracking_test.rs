//! End-to-end tests: track a synthetic LEED pattern through an energy ramp and
//! check the measured intensities, positions and the recalibration policy.


use mkiv::calibration::{BasisEstimator, FitPoint, LatticeEstimate, TripleFitResult};
use mkiv::{
    BeamCurrentMode, CalibrationController, DomainTransform, EnergyRamp, Frame, GeometryModel,
    Image, LatticeIndex, ManualSpot, MkivError, RecalibrationOutcome, RunConfig, SpotState,
    Vector2, INTENSITY_SENTINEL,
};
use synthetic::*;

fn run_config() -> RunConfig {
    let mut config = RunConfig::default();
    config.screen.center = Vector2::new(ORIGIN.0, ORIGIN.1);
    config.screen.outer_radius = 45.0;
    config.screen.inner_radius = 0.0;
    config.lattice.ratio = 0.0;
    config.lattice.kpl_10 = 1.0;
    config.recalibration.cos_min = 0.0;
    config.recalibration.cos_max = 1.0;
    config.recalibration.fit.min_separation = 8.0;
    config.indices.desired = vec![LatticeIndex::new(1.0, 0.0), LatticeIndex::new(0.5, 0.5)];
    config
}

fn controller(config: RunConfig) -> CalibrationController {
    CalibrationController::bootstrap(
        config,
        None,
        &manual_spots(),
        REFERENCE_ENERGY,
        (WIDTH, HEIGHT),
    )
    .expect("bootstrap should succeed on exact spots")
}

#[test]
fn test_track_energy_ramp() {
    let _ = tracing_subscriber::fmt().with_env_filter("info").try_init();

    // ── Step 1: Bootstrap from hand-picked spots ──
    let mut ctl = controller(run_config());
    let m = ctl.model();
    assert!((m.origin - Vector2::new(50.0, 50.0)).norm() < 1e-9);
    assert!((m.basis1 - Vector2::new(10.0, 0.0)).norm() < 1e-9);
    assert!((m.basis2 - Vector2::new(0.0, 10.0)).norm() < 1e-9);

    // ── Step 2: Process 100, 101, 102 eV ──
    for (seed, energy) in EnergyRamp::new(100.0, 102.0, 1.0).unwrap().energies().enumerate() {
        let frame = frame(energy, seed as u64);
        let report = ctl.process_frame(&frame).unwrap();
        println!(
            "E = {:.1}: {} spots, outcome {:?}",
            energy,
            report.spots.len(),
            report.outcome
        );
        assert!(report.emitted, "frame at {energy} eV should be emitted");
        assert!(
            matches!(report.outcome, RecalibrationOutcome::Accepted { .. }),
            "unexpected outcome {:?}",
            report.outcome
        );

        let spot = report
            .spots
            .iter()
            .find(|s| s.index.matches(&LatticeIndex::new(1.0, 0.0)))
            .expect("(1,0) should be on screen");
        assert_eq!(spot.state, SpotState::Gated);
        assert!(spot.membership.desired);
        let truth = spot_position(1.0, 0.0, energy);
        let err = (spot.position - truth).norm();
        assert!(err < 0.5, "(1,0) at {energy} eV off by {err:.3} px");

        // Spots come out ordered by parallel momentum
        assert!(report
            .spots
            .windows(2)
            .all(|w| w[0].parallel_momentum <= w[1].parallel_momentum));
    }

    // ── Step 3: Check the model followed the contraction ──
    let m = ctl.model();
    assert!((m.origin - Vector2::new(50.0, 50.0)).norm() < 0.5, "origin drifted to {:?}", m.origin);
    assert!((m.basis1.norm() - spacing_at(102.0)).abs() < 0.2);
    assert_eq!(m.reference_energy, 102.0);

    // ── Step 4: Check the table ──
    let table = ctl.into_table();
    assert_eq!(table.len(), 3);
    let expected = spot_volume();
    for row in table.rows() {
        let i = row.intensities[0];
        assert!(
            (i - expected).abs() / expected < 0.15,
            "I(1,0) at {} eV = {:.0}, expected ~{:.0}",
            row.energy,
            i,
            expected
        );
        // No (1/2, 1/2) reflex without a superstructure domain
        assert_eq!(row.intensities[1], INTENSITY_SENTINEL);
        assert_eq!(row.beam_used, 1.0);
    }
    let energies: Vec<f64> = table.rows().iter().map(|r| r.energy).collect();
    assert_eq!(energies, vec![100.0, 101.0, 102.0]);

    let mut buf = Vec::new();
    table.write_ivdat(&mut buf).unwrap();
    let text = String::from_utf8(buf).unwrap();
    assert_eq!(text.lines().count(), 6);
    assert!(text.lines().nth(3).unwrap().starts_with(" 100.0"));
}

#[test]
fn test_run_over_frame_iterator() {
    let _ = tracing_subscriber::fmt().with_env_filter("info").try_init();

    let ctl = controller(run_config());
    let frames: Vec<_> = [100.0, 99.0, 98.0]
        .iter()
        .enumerate()
        .map(|(i, &e)| frame(e, 100 + i as u64))
        .collect();
    let table = ctl.run(frames).unwrap();
    assert_eq!(table.len(), 3);
    assert_eq!(table.curve(0).len(), 3);
    assert!(table.curve(1).is_empty());
}

/// Proposes the current lattice moved 4 px along x, alternately right of the
/// true origin and back onto it.
struct SwingingEstimator;

impl BasisEstimator for SwingingEstimator {
    fn estimate(&self, _points: &[FitPoint], model: &GeometryModel) -> TripleFitResult {
        let dx = if model.origin.x < ORIGIN.0 + 1.0 { 4.0 } else { -4.0 };
        TripleFitResult {
            estimate: Some(LatticeEstimate {
                origin: model.origin + Vector2::new(dx, 0.0),
                basis1: model.basis1,
                basis2: model.basis2,
            }),
            triples_used: 1,
            triples_tried: 1,
        }
    }
}

#[test]
fn test_large_shift_repeats_then_forces() {
    let _ = tracing_subscriber::fmt().with_env_filter("info").try_init();

    let mut ctl = controller(run_config()).with_estimator(SwingingEstimator);
    let frame = frame(100.0, 7);

    // ── Step 1: Ten rejections, each blended in, emit nothing ──
    for repeat in 1..=10u32 {
        let report = ctl.process_frame(&frame).unwrap();
        assert!(!report.emitted);
        match report.outcome {
            RecalibrationOutcome::Rejected {
                repeat: r,
                deviations,
                ..
            } => {
                assert_eq!(r, repeat);
                assert!((deviations[0] - 4.0).abs() < 1e-9);
            }
            other => panic!("expected rejection, got {other:?}"),
        }
        let expected_x = if repeat % 2 == 1 { 52.8 } else { 50.0 };
        assert!(
            (ctl.model().origin.x - expected_x).abs() < 1e-9,
            "origin {:?} after repeat {repeat}",
            ctl.model().origin
        );
        assert_eq!(ctl.state().repeats, repeat);
        assert!(ctl.table().is_empty());
    }

    // ── Step 2: The eleventh pass is force-accepted and blended ──
    let report = ctl.process_frame(&frame).unwrap();
    assert!(report.emitted);
    assert!(matches!(report.outcome, RecalibrationOutcome::ForcedAccept { .. }));
    assert!((ctl.model().origin - Vector2::new(52.8, 50.0)).norm() < 1e-9);
    assert_eq!(ctl.state().repeats, 0);
    assert_eq!(ctl.table().len(), 1);
    assert_eq!(ctl.state().previous_energy, Some(100.0));
}

#[test]
fn test_repeated_frame_converges_from_offset_bootstrap() {
    let _ = tracing_subscriber::fmt().with_env_filter("info").try_init();

    // Hand-picked spots all 3 px right of the truth
    let manual: Vec<ManualSpot> = manual_spots()
        .into_iter()
        .map(|s| ManualSpot::new(s.index.h, s.index.k, s.position.x + 3.0, s.position.y))
        .collect();
    let mut config = run_config();
    config.recalibration.acceptance.max_deviation = 1.0;
    let max_repeats = config.recalibration.acceptance.max_repeats;
    let mut ctl =
        CalibrationController::bootstrap(config, None, &manual, REFERENCE_ENERGY, (WIDTH, HEIGHT))
            .unwrap();
    assert!((ctl.model().origin - Vector2::new(53.0, 50.0)).norm() < 1e-9);

    // ── Step 1: First pass is rejected but moves the model towards the data ──
    let frame = frame(100.0, 11);
    let report = ctl.process_frame(&frame).unwrap();
    assert!(
        matches!(report.outcome, RecalibrationOutcome::Rejected { repeat: 1, .. }),
        "unexpected outcome {:?}",
        report.outcome
    );
    assert!(ctl.model().origin.x < 52.0, "origin stayed at {:?}", ctl.model().origin);

    // ── Step 2: Repeats settle before the budget is spent ──
    let mut passes = 1;
    let report = loop {
        let report = ctl.process_frame(&frame).unwrap();
        passes += 1;
        if report.emitted {
            break report;
        }
    };
    println!("Accepted after {passes} passes: {:?}", report.outcome);
    assert!(
        matches!(report.outcome, RecalibrationOutcome::Accepted { .. }),
        "unexpected outcome {:?}",
        report.outcome
    );
    assert!(passes <= max_repeats);
    assert!((ctl.model().origin - Vector2::new(50.0, 50.0)).norm() < 1.0);
    assert_eq!(ctl.table().len(), 1);
}

#[test]
fn test_failed_recalibration_keeps_model_and_emits() {
    let _ = tracing_subscriber::fmt().with_env_filter("info").try_init();

    // Only (1, 0) visible, or only the collinear (h, 0) row
    let cases = [
        (window_mask(53..68, 43..58), "insufficient"),
        (window_mask(0..WIDTH, 45..56), "collinear"),
    ];
    for (mask, name) in cases {
        let mut ctl = CalibrationController::bootstrap(
            run_config(),
            Some(mask),
            &manual_spots(),
            REFERENCE_ENERGY,
            (WIDTH, HEIGHT),
        )
        .unwrap();
        let mut expected = ctl.model().clone();

        for (seed, energy) in [100.0, 101.0].into_iter().enumerate() {
            let report = ctl.process_frame(&frame(energy, 20 + seed as u64)).unwrap();
            println!("{name} at {energy} eV: {:?}", report.outcome);
            match (name, report.outcome) {
                ("insufficient", RecalibrationOutcome::InsufficientSpots { candidates }) => {
                    assert_eq!(candidates, 1)
                }
                ("collinear", RecalibrationOutcome::NoTriples { candidates }) => {
                    assert!(candidates >= 3)
                }
                (_, other) => panic!("{name}: unexpected outcome {other:?}"),
            }
            assert!(report.emitted);

            // Only the energy rescaling touched the model
            expected.rescale(energy).unwrap();
            assert_eq!(ctl.model(), &expected);

            let i = report.intensities[0];
            assert!((i - spot_volume()).abs() / spot_volume() < 0.15, "{name}: I(1,0) = {i:.0}");
        }
        assert_eq!(ctl.table().len(), 2);
    }
}

#[test]
fn test_weak_first_pass_spots_are_retried_from_prediction() {
    let _ = tracing_subscriber::fmt().with_env_filter("info").try_init();

    // No spot can pass the first gate, so every spot goes through the retry
    let mut config = run_config();
    config.search.s2n_good = 1000.0;
    let mut ctl = controller(config.clone());
    let report = ctl.process_frame(&frame(100.0, 31)).unwrap();
    assert_eq!(report.first_pass.gated, 0);
    assert!(report.first_pass.measured > 0);
    assert!(report.retry_pass.gated > 0);

    let spot = report
        .spots
        .iter()
        .find(|s| s.index.matches(&LatticeIndex::new(1.0, 0.0)))
        .unwrap();
    assert_eq!(spot.state, SpotState::Gated);
    assert!(spot.signal_to_noise > 100.0);
    // Restarted from the exact prediction with a unit-step search
    assert!((spot.position - spot.predicted).norm() < 0.05, "{:?}", spot.position);
    assert!(report.emitted);

    // Keeping spots near their prediction skips the retry entirely
    config.search.keep_near_predicted = true;
    let mut ctl = controller(config);
    let report = ctl.process_frame(&frame(100.0, 31)).unwrap();
    assert_eq!(report.first_pass.gated, 0);
    assert_eq!(report.retry_pass.gated, 0);
    let spot = report
        .spots
        .iter()
        .find(|s| s.index.matches(&LatticeIndex::new(1.0, 0.0)))
        .unwrap();
    assert_eq!(spot.state, SpotState::Gated);
    assert!(spot.offset_from_predicted() < 1.0);
}

#[test]
fn test_superstructure_run_with_smoothed_beam() {
    let _ = tracing_subscriber::fmt().with_env_filter("info").try_init();

    let pattern = Pattern {
        spacing: 20.0,
        half_order_amplitude: 1000.0,
    };
    let mut config = run_config();
    config.domains = vec![DomainTransform::scaled(2.0).unwrap()];
    config.beam = BeamCurrentMode::Smoothed { window: 2 };
    let mut ctl = CalibrationController::bootstrap(
        config,
        None,
        &pattern.manual_spots(),
        REFERENCE_ENERGY,
        (WIDTH, HEIGHT),
    )
    .unwrap();

    // ── Step 1: Three frames with a rising beam current ──
    for (i, energy) in [100.0, 101.0, 102.0].into_iter().enumerate() {
        let frame = Frame::new(energy, pattern.render(energy, 40 + i as u64), (i + 1) as f64);
        let report = ctl.process_frame(&frame).unwrap();
        assert!(report.emitted);
        assert!(
            matches!(report.outcome, RecalibrationOutcome::Accepted { .. }),
            "unexpected outcome {:?}",
            report.outcome
        );

        let half = report
            .spots
            .iter()
            .find(|s| s.index.matches(&LatticeIndex::new(0.5, 0.5)))
            .expect("(1/2, 1/2) should be enumerated from the domain");
        assert_eq!(half.state, SpotState::Gated);
        let err = (half.position - pattern.position(0.5, 0.5, energy)).norm();
        assert!(err < 0.5, "(1/2, 1/2) at {energy} eV off by {err:.3} px");
    }

    // ── Step 2: Check smoothing and normalisation in the table ──
    let table = ctl.into_table();
    let used: Vec<f64> = table.rows().iter().map(|r| r.beam_used).collect();
    assert_eq!(used, vec![1.0, 1.5, 2.5]);
    for row in table.rows() {
        for (slot, amplitude) in [(0, AMPLITUDE), (1, 1000.0)] {
            let expected = volume_of(amplitude) / row.beam_used;
            let i = row.intensities[slot];
            assert!(
                (i - expected).abs() / expected < 0.15,
                "slot {slot} at {} eV = {i:.0}, expected ~{expected:.0}",
                row.energy
            );
        }
    }
}

#[test]
fn test_capacity_grows_above_capacity_energy() {
    let _ = tracing_subscriber::fmt().with_env_filter("info").try_init();

    let mut config = run_config();
    config.lattice.capacity_energy = REFERENCE_ENERGY;
    let mut ctl = controller(config);
    let before = ctl.capacity();

    // Four times the energy halves the spacing
    let report = ctl.process_frame(&frame(400.0, 50)).unwrap();
    assert!(report.spots.len() > before, "{} spots", report.spots.len());
    assert!(ctl.capacity() >= report.spots.len());
}

#[test]
fn test_mask_must_match_frame() {
    let mask = Image::from_u8(10, 10, vec![1; 100]).unwrap();
    let err = CalibrationController::bootstrap(
        run_config(),
        Some(mask),
        &manual_spots(),
        REFERENCE_ENERGY,
        (WIDTH, HEIGHT),
    )
    .err()
    .unwrap();
    assert!(matches!(err, MkivError::MaskSizeMismatch { .. }));
}

#[test]
fn test_masked_screen_hides_spots() {
    let _ = tracing_subscriber::fmt().with_env_filter("info").try_init();

    // Only the right half of the screen is visible
    let mask = window_mask(55..WIDTH, 0..HEIGHT);
    let mut ctl = CalibrationController::bootstrap(
        run_config(),
        Some(mask),
        &manual_spots(),
        REFERENCE_ENERGY,
        (WIDTH, HEIGHT),
    )
    .unwrap();

    let report = ctl.process_frame(&frame(100.0, 3)).unwrap();
    assert!(!report.spots.is_empty());
    assert!(report.spots.iter().all(|s| s.predicted.x >= 55.0));
    assert!(report.spots.iter().all(|s| s.index.h >= 1.0));
    assert!(report.intensities[0] > 0.0);
}

#[test]
fn test_invalid_config_rejected_at_bootstrap() {
    let mut config = run_config();
    config.recalibration.cos_min = 0.95;
    config.recalibration.cos_max = 0.9;
    let err = CalibrationController::bootstrap(
        config,
        None,
        &manual_spots(),
        REFERENCE_ENERGY,
        (WIDTH, HEIGHT),
    )
    .err()
    .unwrap();
    assert!(matches!(err, MkivError::InvalidConfig(_)));
}
