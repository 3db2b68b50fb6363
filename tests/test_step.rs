mod common;

use common::*;
use sensorcal::experiment::step::{AMPLITUDE_TITLE, STEP_TITLE};
use sensorcal::experiment::NullObserver;
use sensorcal::response::{ResponseModel, TransferFunction, Unit};
use sensorcal::settings::Settings;
use sensorcal::{run_experiment, CalError, DataStore, ExperimentKind, FitParameters};
use std::f64::consts::PI;

const FS: f64 = 20.0;
const LEN: usize = 6000;
const EDGE: usize = 200;

fn pendulum(corner: f64, damping: f64) -> ResponseModel {
    let omega = 2.0 * PI * corner;
    let im = omega * (1.0 - damping * damping).sqrt();
    ResponseModel::new(
        "pendulum",
        vec![c(0.0, 0.0), c(0.0, 0.0)],
        vec![c(-omega * damping, im), c(-omega * damping, -im)],
        Unit::Velocity,
    )
}

fn step_input() -> Vec<f64> {
    (0..LEN).map(|i| if i < EDGE { 0.0 } else { 1.0 }).collect()
}

fn step_store(nominal: ResponseModel) -> DataStore {
    let input = step_input();
    let mut output = sensor_output(&input, FS, &pendulum(0.1, 0.707), true);
    let peak = output.iter().fold(0.0_f64, |m, v| m.max(v.abs()));
    for (o, n) in output.iter_mut().zip(gaussian(11, LEN, 0.01 * peak)) {
        *o += n;
    }

    let mut store = DataStore::default();
    store.set_channel(0, channel("XX.STEP.00.BC0", FS, input)).unwrap();
    store.set_channel(1, channel("XX.STEP.00.BHZ", FS, output)).unwrap();
    store.set_response(1, nominal).unwrap();
    store
}

// ============================================================
// Corner and damping recovery from a noisy step
// ============================================================
#[test]
fn test_step_recovers_corner_and_damping() {
    let mut store = step_store(pendulum(0.12, 0.6));
    let result = run_experiment(ExperimentKind::Step, &Settings::default(), &mut store, &NullObserver).unwrap();

    match result.parameters {
        FitParameters::Step {
            corner_hz,
            damping,
            initial_corner_hz,
            initial_damping,
            initial_rms,
            fit_rms,
        } => {
            assert!((corner_hz - 0.1).abs() / 0.1 < 0.03, "corner {}", corner_hz);
            assert!((damping - 0.707).abs() / 0.707 < 0.03, "damping {}", damping);
            assert!((initial_corner_hz - 0.12).abs() < 1e-9);
            assert!((initial_damping - 0.6).abs() < 1e-9);
            assert!(fit_rms < initial_rms);
        }
        other => panic!("unexpected parameters {:?}", other),
    }
    assert!(result.warnings.is_empty());

    // Lead of one second before the edge through the end of the record
    let step = result.plot(STEP_TITLE).unwrap();
    assert_eq!(step.series.len(), 3);
    assert_eq!(step.series[0].len(), LEN - EDGE + FS as usize);
    assert_eq!(step.series[0].name, "XX.STEP.00.BHZ");

    let amplitude = result.plot(AMPLITUDE_TITLE).unwrap();
    let fit = amplitude.get("Fit").unwrap();
    let last = fit.points.last().unwrap();
    assert!((last.0 - FS / 2.0).abs() < 1e-9);
    // Fitted response stays normalized at its normalization frequency
    let fitted = result.fit_response.unwrap();
    let at_norm = fitted.evaluate(&[fitted.normalization_freq])[0];
    assert!((at_norm.norm() - 1.0).abs() < 1e-9);
}

#[test]
fn test_falling_step_fits_equally() {
    // Input starts high long enough for the switch-on transient to die out
    let input: Vec<f64> = (0..LEN).map(|i| if i < 1000 { 1.0 } else { 0.0 }).collect();
    let output = sensor_output(&input, FS, &pendulum(0.1, 0.707), true);
    let mut store = DataStore::default();
    store.set_channel(0, channel("cal", FS, input)).unwrap();
    store.set_channel(1, channel("out", FS, output)).unwrap();
    store.set_response(1, pendulum(0.09, 0.75)).unwrap();

    let result = run_experiment(ExperimentKind::Step, &Settings::default(), &mut store, &NullObserver).unwrap();
    match result.parameters {
        FitParameters::Step { corner_hz, damping, .. } => {
            assert!((corner_hz - 0.1).abs() / 0.1 < 0.02, "corner {}", corner_hz);
            assert!((damping - 0.707).abs() / 0.707 < 0.02, "damping {}", damping);
        }
        other => panic!("unexpected parameters {:?}", other),
    }
}

#[test]
fn test_no_step_in_input() {
    let mut store = DataStore::default();
    store.set_channel(0, channel("cal", FS, gaussian(3, 2000, 1.0))).unwrap();
    store.set_channel(1, channel("out", FS, gaussian(4, 2000, 1.0))).unwrap();
    store.set_response(1, pendulum(0.1, 0.7)).unwrap();
    let result = run_experiment(ExperimentKind::Step, &Settings::default(), &mut store, &NullObserver);
    assert!(matches!(result, Err(CalError::StepDetection(_))));
}

#[test]
fn test_digital_response_rejected() {
    let mut digital = pendulum(0.1, 0.7);
    digital.transfer = TransferFunction::Digital { sample_rate: FS };
    let mut store = step_store(digital);
    let result = run_experiment(ExperimentKind::Step, &Settings::default(), &mut store, &NullObserver);
    assert!(matches!(result, Err(CalError::Configuration(_))));
}

#[test]
fn test_response_without_pair_rejected() {
    let real_only = ResponseModel::new("real", vec![c(0.0, 0.0)], vec![c(-1.0, 0.0)], Unit::Velocity);
    let mut store = step_store(real_only);
    let result = run_experiment(ExperimentKind::Step, &Settings::default(), &mut store, &NullObserver);
    assert!(matches!(result, Err(CalError::Configuration(_))));
}
