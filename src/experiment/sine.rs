use nalgebra::{Matrix3, Vector3};
use std::f64::consts::PI;
use tracing::{debug, info};

use super::{
    check_aligned, Experiment, ExperimentKind, FitParameters, FitResult, ProgressObserver, SeriesCollection,
    XySeries,
};
use crate::error::{CalError, CalResult};
use crate::settings::SineSettings;
use crate::spectral;
use crate::store::DataStore;

pub const OVERLAY_TITLE: &str = "Sine calibration";
pub const LINEARITY_TITLE: &str = "Sine calibration linearity";

const GOLDEN: f64 = 0.618_033_988_749_894_9;

/// Least-squares sinusoid `a·sin(ωt) + b·cos(ωt) + c` at a fixed frequency.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SineFit {
    pub amplitude: f64,
    /// Phase of `amplitude·sin(ωt + phase)`, radians.
    pub phase: f64,
    pub offset: f64,
}

pub fn fit_sinusoid(samples: &[f64], freq: f64, sample_rate: f64) -> Option<SineFit> {
    let omega = 2.0 * PI * freq / sample_rate;
    let mut normal = Matrix3::<f64>::zeros();
    let mut rhs = Vector3::<f64>::zeros();
    for (i, &y) in samples.iter().enumerate() {
        let t = omega * i as f64;
        let basis = Vector3::new(t.sin(), t.cos(), 1.0);
        normal += basis * basis.transpose();
        rhs += basis * y;
    }
    let coeffs = normal.lu().solve(&rhs)?;
    let (a, b, c) = (coeffs[0], coeffs[1], coeffs[2]);
    Some(SineFit {
        amplitude: a.hypot(b),
        phase: b.atan2(a),
        offset: c,
    })
}

fn amplitude_at(samples: &[f64], freq: f64, sample_rate: f64) -> f64 {
    fit_sinusoid(samples, freq, sample_rate).map_or(0.0, |fit| fit.amplitude)
}

/// Dominant tone frequency: windowed FFT peak, parabolic interpolation, then a
/// golden-section search within half a bin for the largest fitted amplitude.
pub fn estimate_frequency(samples: &[f64], sample_rate: f64, refine_iterations: usize) -> CalResult<f64> {
    let n = samples.len();
    if n < 4 {
        return Err(CalError::InsufficientData(format!(
            "{} samples are too few for a sine fit",
            n
        )));
    }
    let mut values = samples.to_vec();
    spectral::demean(&mut values);
    for (v, w) in values.iter_mut().zip(spectral::hann_window(n)) {
        *v *= w;
    }
    let spectrum = spectral::real_spectrum(&values);
    let magnitudes: Vec<f64> = spectrum.iter().take(n / 2 + 1).map(|c| c.norm()).collect();

    let (peak, peak_mag) = magnitudes
        .iter()
        .enumerate()
        .skip(1)
        .fold((0, 0.0), |best, (k, &m)| if m > best.1 { (k, m) } else { best });
    if peak == 0 || peak_mag <= 0.0 {
        return Err(CalError::InsufficientData(
            "calibration input has no energy away from DC".to_string(),
        ));
    }

    let mut offset = 0.0;
    if peak > 1 && peak + 1 < magnitudes.len() {
        let (alpha, beta, gamma) = (magnitudes[peak - 1], magnitudes[peak], magnitudes[peak + 1]);
        let denom = alpha - 2.0 * beta + gamma;
        if denom != 0.0 {
            offset = (0.5 * (alpha - gamma) / denom).clamp(-0.5, 0.5);
        }
    }
    let bin = sample_rate / n as f64;
    let coarse = (peak as f64 + offset) * bin;
    debug!("Sine peak at bin {} ({:.6} Hz after interpolation)", peak, coarse);

    let mut lo = (coarse - 0.5 * bin).max(0.5 * bin);
    let mut hi = coarse + 0.5 * bin;
    let mut x1 = hi - GOLDEN * (hi - lo);
    let mut x2 = lo + GOLDEN * (hi - lo);
    let mut f1 = amplitude_at(samples, x1, sample_rate);
    let mut f2 = amplitude_at(samples, x2, sample_rate);
    for _ in 0..refine_iterations {
        if f1 < f2 {
            lo = x1;
            x1 = x2;
            f1 = f2;
            x2 = lo + GOLDEN * (hi - lo);
            f2 = amplitude_at(samples, x2, sample_rate);
        } else {
            hi = x2;
            x2 = x1;
            f2 = f1;
            x1 = hi - GOLDEN * (hi - lo);
            f1 = amplitude_at(samples, x1, sample_rate);
        }
    }
    Ok(if f1 >= f2 { x1 } else { x2 })
}

pub struct SineExperiment {
    settings: SineSettings,
}

impl SineExperiment {
    pub fn new(settings: SineSettings) -> Self {
        Self { settings }
    }
}

impl Experiment for SineExperiment {
    fn kind(&self) -> ExperimentKind {
        ExperimentKind::Sine
    }

    fn blocks_needed(&self) -> usize {
        2
    }

    fn has_enough_data(&self, store: &DataStore) -> bool {
        store.channel_is_set(0) && store.channel_is_set(1)
    }

    fn run(&self, store: &mut DataStore, progress: &dyn ProgressObserver) -> CalResult<FitResult> {
        let calibration = store.require_channel(0)?;
        let output = store.require_channel(1)?;
        check_aligned(&[calibration, output])?;
        let sample_rate = calibration.sample_rate();

        progress.notify("Estimating calibration frequency...");
        let frequency = estimate_frequency(&calibration.samples, sample_rate, self.settings.refine_iterations)?;

        progress.notify("Fitting sine amplitudes...");
        let degenerate = || CalError::InsufficientData("sine fit is singular".to_string());
        let cal_fit = fit_sinusoid(&calibration.samples, frequency, sample_rate).ok_or_else(degenerate)?;
        let out_fit = fit_sinusoid(&output.samples, frequency, sample_rate).ok_or_else(degenerate)?;
        if !(out_fit.amplitude > 0.0) {
            return Err(CalError::InsufficientData(format!(
                "{} shows no signal at {:.4} Hz",
                output.name, frequency
            )));
        }
        let ratio = cal_fit.amplitude / out_fit.amplitude;
        info!(
            "Sine at {:.6} Hz: calibration amplitude {:.6e}, output amplitude {:.6e}, ratio {:.6e}",
            frequency, cal_fit.amplitude, out_fit.amplitude, ratio
        );

        let times = calibration.epoch_seconds();
        let normalized = |samples: &[f64], fit: &SineFit| -> Vec<(f64, f64)> {
            times
                .iter()
                .zip(samples.iter())
                .map(|(&t, &s)| (t, (s - fit.offset) / fit.amplitude))
                .collect()
        };
        let mut overlay = SeriesCollection::new(OVERLAY_TITLE);
        overlay.push(XySeries::new(calibration.name.as_str(), normalized(&calibration.samples, &cal_fit)));
        overlay.push(XySeries::new(output.name.as_str(), normalized(&output.samples, &out_fit)));

        let mut linearity = SeriesCollection::new(LINEARITY_TITLE);
        linearity.push(XySeries::from_xy(
            format!("{} vs {}", output.name, calibration.name),
            &calibration.samples,
            &output.samples,
        ));

        Ok(FitResult {
            kind: self.kind(),
            parameters: FitParameters::Sine {
                frequency_hz: frequency,
                calibration_amplitude: cal_fit.amplitude,
                output_amplitude: out_fit.amplitude,
                ratio,
            },
            fit_response: None,
            initial_response: None,
            plots: vec![overlay, linearity],
            warnings: Vec::new(),
            data_names: vec![calibration.name.clone(), output.name.clone()],
            summary: vec![
                format!("Calibration amplitude: {:.6e}", cal_fit.amplitude),
                format!("Output amplitude: {:.6e}", out_fit.amplitude),
                format!("Estimated frequency: {:.6} Hz", frequency),
                format!("Amplitude ratio: {:.6e}", ratio),
            ],
        })
    }
}
