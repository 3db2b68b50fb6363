#![allow(dead_code)]

use chrono::{DateTime, TimeZone, Utc};
use num_complex::Complex64;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand_distr::{Distribution, StandardNormal};

use sensorcal::response::{ResponseModel, Unit};
use sensorcal::spectral::apply_transfer;
use sensorcal::TimeSeriesChannel;

pub fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
}

pub fn c(re: f64, im: f64) -> Complex64 {
    Complex64::new(re, im)
}

pub fn gaussian(seed: u64, len: usize, sigma: f64) -> Vec<f64> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..len)
        .map(|_| {
            let v: f64 = StandardNormal.sample(&mut rng);
            sigma * v
        })
        .collect()
}

pub fn channel(name: &str, sample_rate: f64, samples: Vec<f64>) -> TimeSeriesChannel {
    TimeSeriesChannel::with_sample_rate(name, start_time(), sample_rate, samples).unwrap()
}

/// Sensor output for an acceleration-proportional calibration input.
pub fn sensor_output(input: &[f64], sample_rate: f64, response: &ResponseModel, padded: bool) -> Vec<f64> {
    apply_transfer(input, sample_rate, padded, |freqs| {
        response.evaluate_in(freqs, Unit::Acceleration)
    })
}

/// Broadband velocity sensor with a 120 s corner and a 10 Hz high-frequency pair.
pub fn broadband_response() -> ResponseModel {
    ResponseModel::new(
        "STS-2.5 like",
        vec![c(0.0, 0.0), c(0.0, 0.0)],
        vec![c(-0.037, 0.037), c(-0.037, -0.037), c(-39.18, 49.12), c(-39.18, -49.12)],
        Unit::Velocity,
    )
    .with_gains(vec![1500.0 * 419430.0, 1500.0, 419430.0])
    .normalized_at(1.0)
}

/// Short-period style sensor: 1/20 Hz pair for the low band, 4.5 Hz pair and a real pole
/// for the high band.
pub fn short_period_response() -> ResponseModel {
    ResponseModel::new(
        "short period",
        vec![c(0.0, 0.0), c(0.0, 0.0)],
        vec![
            c(-0.222, 0.222),
            c(-0.222, -0.222),
            c(-20.0, 20.0),
            c(-20.0, -20.0),
            c(-150.0, 0.0),
        ],
        Unit::Velocity,
    )
    .with_gains(vec![2000.0, 2000.0])
    .normalized_at(1.0)
}

pub fn relative_error(a: Complex64, b: Complex64) -> f64 {
    (a - b).norm() / b.norm()
}
