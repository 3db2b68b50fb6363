//! Corner frequency and damping from a step calibration.

use num_complex::Complex64;
use std::f64::consts::PI;
use tracing::{debug, info, warn};

use super::{
    amplitude_db, check_aligned, to_degrees, Experiment, ExperimentKind, FitParameters, FitResult,
    ProgressObserver, SeriesCollection, XySeries,
};
use crate::error::{CalError, CalResult, CalWarning};
use crate::response::{ResponseModel, TransferFunction, Unit};
use crate::settings::StepSettings;
use crate::solver::{levenberg_marquardt, LmConfig};
use crate::spectral;
use crate::store::DataStore;

pub const STEP_TITLE: &str = "Step calibration";
pub const AMPLITUDE_TITLE: &str = "Response amplitude";
pub const PHASE_TITLE: &str = "Response phase";

/// Location of a step in the calibration input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepEdge {
    /// First sample at the new level.
    pub index: usize,
    /// One past the last sample before the next opposite-sign edge, or the record length.
    pub end: usize,
    pub rising: bool,
}

fn median(values: &mut [f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        0.5 * (values[mid - 1] + values[mid])
    } else {
        values[mid]
    }
}

/// Find the first clean step edge from the first differences of `samples`.
pub fn detect_step(samples: &[f64], settings: &StepSettings) -> CalResult<StepEdge> {
    if samples.len() < 3 {
        return Err(CalError::StepDetection(format!(
            "{} samples are too few to contain a step",
            samples.len()
        )));
    }
    let diffs: Vec<f64> = samples.windows(2).map(|w| w[1] - w[0]).collect();
    let peak = diffs.iter().fold(0.0_f64, |m, d| m.max(d.abs()));
    if peak == 0.0 {
        return Err(CalError::StepDetection("calibration input is flat".to_string()));
    }
    let background = median(&mut diffs.iter().map(|d| d.abs()).collect::<Vec<_>>());
    if peak < settings.min_edge_snr * background {
        return Err(CalError::StepDetection(format!(
            "largest jump {:.4e} is within {}x of the background {:.4e}",
            peak, settings.min_edge_snr, background
        )));
    }

    let threshold = settings.edge_threshold * peak;
    let edge = diffs
        .iter()
        .position(|d| d.abs() >= threshold)
        .ok_or_else(|| CalError::StepDetection("no edge above threshold".to_string()))?;
    let rising = diffs[edge] > 0.0;
    let opposite = |d: f64| (d > 0.0) != rising && d.abs() >= threshold;

    if diffs.get(edge + 1).is_some_and(|&d| opposite(d)) {
        return Err(CalError::StepDetection(format!(
            "jump at sample {} returns immediately (spike, not a step)",
            edge + 1
        )));
    }

    let end = diffs
        .iter()
        .enumerate()
        .skip(edge + 1)
        .find(|&(_, &d)| opposite(d))
        .map(|(i, _)| i + 1)
        .unwrap_or(samples.len());

    Ok(StepEdge {
        index: edge + 1,
        end,
        rising,
    })
}

/// Scale a curve so its largest-magnitude sample equals 1.
fn normalize_by_peak(values: &mut [f64]) {
    let peak = values
        .iter()
        .copied()
        .fold(0.0_f64, |m, v| if v.abs() > m.abs() { v } else { m });
    if peak != 0.0 {
        for v in values.iter_mut() {
            *v /= peak;
        }
    }
}

fn rms(a: &[f64], b: &[f64]) -> f64 {
    let n = a.len().min(b.len()).max(1) as f64;
    (a.iter().zip(b.iter()).map(|(x, y)| (x - y).powi(2)).sum::<f64>() / n).sqrt()
}

pub struct StepExperiment {
    settings: StepSettings,
}

/// The nominal response with one conjugate pole pair rebuilt from corner/damping.
struct PairModel {
    nominal: ResponseModel,
    /// Indices of the fitted pole and its conjugate.
    pair: (usize, usize),
    /// Angular frequency per Hz of corner in the response's s-plane units.
    omega_per_hz: f64,
}

impl PairModel {
    fn new(nominal: ResponseModel) -> CalResult<Self> {
        let omega_per_hz = match nominal.transfer {
            TransferFunction::Laplace => 2.0 * PI,
            TransferFunction::LaplaceHertz => 1.0,
            TransferFunction::Digital { .. } => {
                return Err(CalError::Configuration(format!(
                    "{}: step fit needs an analog (Laplace) response",
                    nominal.name
                )));
            }
        };
        let pair = nominal.lowest_pole_pair().ok_or_else(|| {
            CalError::Configuration(format!("{}: no conjugate pole pair to fit", nominal.name))
        })?;
        Ok(Self {
            nominal,
            pair,
            omega_per_hz,
        })
    }

    /// (corner Hz, damping) of the pair in the nominal response.
    fn initial(&self) -> (f64, f64) {
        let pole = self.nominal.poles[self.pair.0];
        let magnitude = pole.norm();
        (magnitude / self.omega_per_hz, -pole.re / magnitude)
    }

    fn response(&self, corner: f64, damping: f64) -> ResponseModel {
        let omega = corner * self.omega_per_hz;
        let root = Complex64::new(1.0 - damping * damping, 0.0).sqrt();
        let mut response = self.nominal.clone();
        response.poles[self.pair.0] = omega * (Complex64::new(-damping, 0.0) + Complex64::i() * root);
        response.poles[self.pair.1] = omega * (Complex64::new(-damping, 0.0) - Complex64::i() * root);
        response
    }

    /// Normalized response of the sensor to `input`.
    fn predict(&self, input: &[f64], sample_rate: f64, corner: f64, damping: f64) -> Vec<f64> {
        let response = self.response(corner, damping);
        let mut out = spectral::apply_transfer(input, sample_rate, true, |freqs| {
            response.evaluate_in(freqs, Unit::Acceleration)
        });
        normalize_by_peak(&mut out);
        out
    }
}

impl StepExperiment {
    pub fn new(settings: StepSettings) -> Self {
        Self { settings }
    }

    fn response_series(
        name: &str,
        response: &ResponseModel,
        freqs: &[f64],
    ) -> (XySeries, XySeries) {
        let values = response.evaluate(freqs);
        let amplitude: Vec<f64> = values.iter().map(|&v| amplitude_db(v)).collect();
        let phase: Vec<f64> = values.iter().map(|v| to_degrees(v.arg())).collect();
        (
            XySeries::from_xy(name, freqs, &amplitude),
            XySeries::from_xy(name, freqs, &phase),
        )
    }
}

impl Experiment for StepExperiment {
    fn kind(&self) -> ExperimentKind {
        ExperimentKind::Step
    }

    fn blocks_needed(&self) -> usize {
        2
    }

    fn has_enough_data(&self, store: &DataStore) -> bool {
        store.channel_is_set(0) && store.both_components_set(1)
    }

    fn run(&self, store: &mut DataStore, progress: &dyn ProgressObserver) -> CalResult<FitResult> {
        let calibration = store.require_channel(0)?;
        let output = store.require_channel(1)?;
        check_aligned(&[calibration, output])?;
        let model = PairModel::new(store.require_response(1)?.clone())?;
        let sample_rate = calibration.sample_rate();

        progress.notify("Locating step edge...");
        let edge = detect_step(&calibration.samples, &self.settings)?;
        let lead = (self.settings.lead_seconds * sample_rate).round() as usize;
        let start = edge.index.saturating_sub(lead);
        let end = edge.end;
        if end - start < 16 {
            return Err(CalError::InsufficientData(format!(
                "step segment of {} samples is too short",
                end - start
            )));
        }
        info!(
            "Step edge at sample {} ({}), fitting samples {}..{}",
            edge.index,
            if edge.rising { "rising" } else { "falling" },
            start,
            end
        );

        // Remove the pre-step level so the segment starts from rest
        let baseline = |samples: &[f64]| -> Vec<f64> {
            let pre = &samples[start..edge.index.max(start + 1)];
            let level = pre.iter().sum::<f64>() / pre.len() as f64;
            samples[start..end].iter().map(|s| s - level).collect()
        };
        let input = baseline(&calibration.samples);
        let mut observed = baseline(&output.samples);
        normalize_by_peak(&mut observed);

        let (initial_corner, initial_damping) = model.initial();
        let initial_curve = model.predict(&input, sample_rate, initial_corner, initial_damping);
        let initial_rms = rms(&initial_curve, &observed);

        progress.notify("Fitting corner frequency and damping...");
        let outcome = levenberg_marquardt(
            |params: &[f64]| {
                let (corner, damping) = (params[0], params[1]);
                if !(corner > 0.0 && damping > 0.0) {
                    return Ok(vec![f64::NAN; observed.len()]);
                }
                let predicted = model.predict(&input, sample_rate, corner, damping);
                Ok(predicted.iter().zip(observed.iter()).map(|(p, o)| p - o).collect())
            },
            &[initial_corner, initial_damping],
            &LmConfig::with_max_iterations(self.settings.max_iterations),
        )?;
        let (corner, damping) = (outcome.params[0], outcome.params[1]);
        debug!(
            "Step fit: corner {:.5} Hz, damping {:.5} after {} iterations",
            corner, damping, outcome.iterations
        );

        let fit_curve = model.predict(&input, sample_rate, corner, damping);
        let fit_rms = rms(&fit_curve, &observed);

        let mut warnings = Vec::new();
        if !outcome.converged {
            warn!("Step fit did not converge in {} iterations", outcome.iterations);
            warnings.push(CalWarning::ConvergenceWarning {
                iterations: outcome.iterations,
                initial_cost: outcome.initial_cost,
                final_cost: outcome.cost,
            });
        }

        progress.notify("Building step and response plots...");
        let times: Vec<f64> = calibration.epoch_seconds()[start..end].to_vec();
        let mut step_plot = SeriesCollection::new(STEP_TITLE);
        step_plot.push(XySeries::from_xy(output.name.as_str(), &times, &observed));
        step_plot.push(XySeries::from_xy("Initial", &times, &initial_curve));
        step_plot.push(XySeries::from_xy("Fit", &times, &fit_curve));

        let mut fitted = model.response(corner, damping);
        fitted.renormalize();
        let freqs = spectral::log_space(
            self.settings.report_min_hz,
            sample_rate / 2.0,
            self.settings.report_points_per_decade,
        );
        let mut amplitude = SeriesCollection::new(AMPLITUDE_TITLE);
        let mut phase = SeriesCollection::new(PHASE_TITLE);
        for (name, response) in [("Initial", &model.nominal), ("Fit", &fitted)] {
            let (amp, ph) = Self::response_series(name, response, &freqs);
            amplitude.push(amp);
            phase.push(ph);
        }

        let summary = vec![
            format!("Initial corner: {:.6} Hz", initial_corner),
            format!("Initial damping: {:.6}", initial_damping),
            format!("Fit corner: {:.6} Hz", corner),
            format!("Fit damping: {:.6}", damping),
            format!("Residual RMS: {:.4e} -> {:.4e}", initial_rms, fit_rms),
        ];

        Ok(FitResult {
            kind: self.kind(),
            parameters: FitParameters::Step {
                corner_hz: corner,
                damping,
                initial_corner_hz: initial_corner,
                initial_damping,
                initial_rms,
                fit_rms,
            },
            data_names: vec![
                calibration.name.clone(),
                output.name.clone(),
                model.nominal.name.clone(),
            ],
            fit_response: Some(fitted),
            initial_response: Some(model.nominal),
            plots: vec![step_plot, amplitude, phase],
            warnings,
            summary,
        })
    }
}
