//! Broadband pole/zero fitting from a randomized calibration record.
//!
//! The observed transfer curve `P_yx / P_xx` is compared with the candidate
//! response in acceleration units. Both curves are normalized at a reference
//! frequency, which removes the unknown calibration-coil constant, and the
//! residual is the weighted difference of their complex logarithms.

use num_complex::Complex64;
use std::f64::consts::PI;
use tracing::{debug, info, warn};

use super::{
    amplitude_db, check_aligned, to_degrees, Experiment, ExperimentKind, FitParameters, FitResult,
    ProgressObserver, SeriesCollection, XySeries,
};
use crate::error::{CalError, CalResult, CalWarning};
use crate::response::{flatten, FitSelection, ResponseModel, Unit};
use crate::settings::RandomizedSettings;
use crate::solver::{levenberg_marquardt, LmConfig};
use crate::spectral;
use crate::store::DataStore;

pub const AMPLITUDE_TITLE: &str = "Response amplitude";
pub const PHASE_TITLE: &str = "Response phase";
pub const ERROR_TITLE: &str = "Response error";

/// Observed curve over the fit band, ready for comparison with a model.
#[derive(Debug, Clone)]
struct BandCurve {
    freqs: Vec<f64>,
    /// Observed values divided by the value at `reference`.
    observed: Vec<Complex64>,
    weights: Vec<f64>,
    reference: usize,
}

impl BandCurve {
    fn new(freqs: Vec<f64>, values: Vec<Complex64>, normalization_freq: f64) -> CalResult<Self> {
        let (Some(&first), Some(&last)) = (freqs.first(), freqs.last()) else {
            return Err(CalError::InsufficientData("no spectral points in the fit band".to_string()));
        };
        let target = normalization_freq.clamp(first, last);
        let reference = nearest_log_index(&freqs, target);

        let observed_ref = values[reference];
        if !(observed_ref.norm() > 0.0 && observed_ref.is_finite()) {
            return Err(CalError::InsufficientData(format!(
                "observed response is degenerate at {:.4} Hz",
                freqs[reference]
            )));
        }
        let observed = values.iter().map(|v| v / observed_ref).collect();

        let span = (last / first).ln();
        let weights = freqs
            .iter()
            .map(|f| {
                let x = if span > 0.0 { (f / first).ln() / span } else { 0.5 };
                0.25 + 0.75 * (PI * x).sin()
            })
            .collect();

        Ok(Self {
            freqs,
            observed,
            weights,
            reference,
        })
    }

    /// Model curve normalized the same way as the observation.
    fn model(&self, response: &ResponseModel) -> Vec<Complex64> {
        let values = response.evaluate_in(&self.freqs, Unit::Acceleration);
        let reference = values[self.reference];
        values.iter().map(|v| v / reference).collect()
    }

    fn residuals(&self, response: &ResponseModel) -> Vec<f64> {
        let model = self.model(response);
        let mut out = Vec::with_capacity(2 * model.len());
        for ((m, o), w) in model.iter().zip(self.observed.iter()).zip(self.weights.iter()) {
            // ln(m/o) = (ln|m| - ln|o|) + i·wrap(arg m - arg o)
            let log_ratio = (m / o).ln();
            out.push(w * log_ratio.re);
            out.push(w * log_ratio.im);
        }
        out
    }
}

fn nearest_log_index(freqs: &[f64], target: f64) -> usize {
    let log_target = target.ln();
    freqs
        .iter()
        .enumerate()
        .min_by(|(_, a), (_, b)| {
            (a.ln() - log_target)
                .abs()
                .partial_cmp(&(b.ln() - log_target).abs())
                .unwrap_or(std::cmp::Ordering::Equal)
        })
        .map(|(i, _)| i)
        .unwrap_or(0)
}

pub struct RandomizedExperiment {
    low_frequency: bool,
    settings: RandomizedSettings,
}

impl RandomizedExperiment {
    pub fn new(low_frequency: bool, settings: RandomizedSettings) -> Self {
        Self {
            low_frequency,
            settings,
        }
    }

    /// Frequency band `[min, max]` fitted for a record sampled at `sample_rate`.
    pub fn band(&self, sample_rate: f64) -> (f64, f64) {
        if self.low_frequency {
            (self.settings.low_band_min_hz, self.settings.low_frequency_cutoff_hz)
        } else {
            (
                self.settings.high_band_min_hz,
                self.settings.max_fit_nyquist_fraction * sample_rate / 2.0,
            )
        }
    }

    pub fn selection(&self, sample_rate: f64) -> FitSelection {
        let cutoff = self.settings.low_frequency_cutoff_hz;
        if self.low_frequency {
            FitSelection::low(cutoff)
        } else {
            FitSelection::high(cutoff, self.band(sample_rate).1)
        }
    }

    fn curve_series(name: &str, freqs: &[f64], curve: &[Complex64]) -> (XySeries, XySeries) {
        let amplitude = curve.iter().map(|&v| amplitude_db(v)).collect::<Vec<_>>();
        let phase = curve.iter().map(|v| to_degrees(v.arg())).collect::<Vec<_>>();
        (
            XySeries::from_xy(name, freqs, &amplitude),
            XySeries::from_xy(name, freqs, &phase),
        )
    }

    fn error_series(name: &str, freqs: &[f64], model: &[Complex64], observed: &[Complex64]) -> (XySeries, XySeries) {
        let mut amplitude = Vec::with_capacity(freqs.len());
        let mut phase = Vec::with_capacity(freqs.len());
        for ((&f, m), o) in freqs.iter().zip(model.iter()).zip(observed.iter()) {
            amplitude.push((f, 100.0 * (m.norm() / o.norm() - 1.0)));
            phase.push((f, to_degrees((m / o).arg())));
        }
        (
            XySeries::new(format!("{} amplitude error (%)", name), amplitude),
            XySeries::new(format!("{} phase error (deg)", name), phase),
        )
    }
}

impl Experiment for RandomizedExperiment {
    fn kind(&self) -> ExperimentKind {
        ExperimentKind::Randomized {
            low_frequency: self.low_frequency,
        }
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
        let nominal = store.require_response(1)?.clone();
        check_aligned(&[calibration, output])?;
        let spectral_settings = *store.spectral_settings();
        let sample_rate = calibration.sample_rate();

        progress.notify("Computing calibration input power spectrum...");
        let input_power = spectral::raw_cross_power(calibration, calibration, &spectral_settings)?;
        progress.notify("Computing output/input cross-power...");
        let cross = spectral::raw_cross_power(output, calibration, &spectral_settings)?;

        let peak_power = input_power.fft.iter().skip(1).map(|c| c.re).fold(0.0, f64::max);
        if !(peak_power > 0.0) {
            return Err(CalError::InsufficientData(format!(
                "{} has a flat spectrum",
                calibration.name
            )));
        }

        let (band_min, band_max) = self.band(sample_rate);
        if band_min >= band_max {
            return Err(CalError::Configuration(format!(
                "empty fit band [{} Hz, {} Hz] at {} Hz sampling",
                band_min, band_max, sample_rate
            )));
        }

        let (raw_freqs, raw_values): (Vec<f64>, Vec<Complex64>) = input_power
            .freqs
            .iter()
            .zip(input_power.fft.iter().zip(cross.fft.iter()))
            .skip(1)
            .filter(|(_, (pxx, _))| pxx.re > peak_power * 1e-15)
            .map(|(&f, (pxx, pyx))| (f, pyx / pxx))
            .unzip();
        let (freqs, values) = spectral::log_bin_average(
            &raw_freqs,
            &raw_values,
            self.settings.points_per_decade,
            band_min,
            band_max,
        );

        let selection = self.selection(sample_rate);
        let initial = nominal.to_parameter_vector(&selection);
        if initial.is_empty() {
            return Err(CalError::Configuration(format!(
                "{} has no poles or zeros to fit in the {:?} band (cutoff {} Hz)",
                nominal.name, selection.band, selection.cutoff_hz
            )));
        }
        if freqs.len() < 3 || 2 * freqs.len() < initial.len() {
            return Err(CalError::InsufficientData(format!(
                "{} spectral points in band for {} parameters",
                freqs.len(),
                initial.len()
            )));
        }

        let curve = BandCurve::new(freqs, values, nominal.normalization_freq)?;
        info!(
            "Fitting {} parameters over {} points ({:.4}-{:.4} Hz)",
            initial.len(),
            curve.freqs.len(),
            band_min,
            band_max
        );

        progress.notify("Fitting poles and zeros...");
        let outcome = levenberg_marquardt(
            |params: &[f64]| {
                let candidate = nominal.from_parameter_vector(params, &selection)?;
                Ok(curve.residuals(&candidate))
            },
            &initial,
            &LmConfig::with_max_iterations(self.settings.max_iterations),
        )?;
        debug!(
            "Randomized fit finished after {} iterations (converged: {})",
            outcome.iterations, outcome.converged
        );

        let mut fitted = nominal.from_parameter_vector(&outcome.params, &selection)?;
        fitted.renormalize();

        let mut warnings = Vec::new();
        if !outcome.converged {
            warn!("Randomized fit did not converge in {} iterations", outcome.iterations);
            warnings.push(CalWarning::ConvergenceWarning {
                iterations: outcome.iterations,
                initial_cost: outcome.initial_cost,
                final_cost: outcome.cost,
            });
        }

        progress.notify("Building response plots...");
        let initial_curve = curve.model(&nominal);
        let fit_curve = curve.model(&fitted);

        let mut amplitude = SeriesCollection::new(AMPLITUDE_TITLE);
        let mut phase = SeriesCollection::new(PHASE_TITLE);
        for (name, values) in [
            (calibration.name.as_str(), &curve.observed),
            ("Initial", &initial_curve),
            ("Fit", &fit_curve),
        ] {
            let (amp, ph) = Self::curve_series(name, &curve.freqs, values);
            amplitude.push(amp);
            phase.push(ph);
        }
        let mut errors = SeriesCollection::new(ERROR_TITLE);
        for (name, values) in [("Initial", &initial_curve), ("Fit", &fit_curve)] {
            let (amp, ph) = Self::error_series(name, &curve.freqs, values, &curve.observed);
            errors.push(amp);
            errors.push(ph);
        }
        if !self.low_frequency {
            amplitude = amplitude.with_marker(band_max);
            phase = phase.with_marker(band_max);
        }

        let mut summary = vec![
            format!("Initial residual: {:.4e}", outcome.initial_cost),
            format!("Fit residual: {:.4e}", outcome.cost),
            format!("Iterations: {}", outcome.iterations),
        ];
        for (initial_pole, fit_pole) in nominal.poles.iter().zip(fitted.poles.iter()) {
            if initial_pole != fit_pole {
                summary.push(format!(
                    "Pole {:.4}{:+.4}i -> {:.4}{:+.4}i",
                    initial_pole.re, initial_pole.im, fit_pole.re, fit_pole.im
                ));
            }
        }
        for (initial_zero, fit_zero) in nominal.zeros.iter().zip(fitted.zeros.iter()) {
            if initial_zero != fit_zero {
                summary.push(format!(
                    "Zero {:.4}{:+.4}i -> {:.4}{:+.4}i",
                    initial_zero.re, initial_zero.im, fit_zero.re, fit_zero.im
                ));
            }
        }

        Ok(FitResult {
            kind: self.kind(),
            parameters: FitParameters::PoleZero {
                fit_poles: flatten(&fitted.poles),
                initial_poles: flatten(&nominal.poles),
                fit_zeros: flatten(&fitted.zeros),
                initial_zeros: flatten(&nominal.zeros),
                max_fit_frequency: (!self.low_frequency).then_some(band_max),
                initial_residual: outcome.initial_cost,
                fit_residual: outcome.cost,
            },
            data_names: vec![calibration.name.clone(), output.name.clone(), nominal.name.clone()],
            fit_response: Some(fitted),
            initial_response: Some(nominal),
            plots: vec![amplitude, phase, errors],
            warnings,
            summary,
        })
    }
}
