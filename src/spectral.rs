//! Frequency-domain primitives: Welch averaging, response-corrected cross-power,
//! log-frequency smoothing and transfer-function filtering.
//!
//! All functions are pure and operate on copies of their inputs.

use num_complex::Complex64;
use rustfft::FftPlanner;
use serde::{Deserialize, Serialize};

use crate::channel::TimeSeriesChannel;
use crate::error::{CalError, CalResult};
use crate::response::{ResponseModel, Unit};
use crate::settings::SpectralSettings;

/// Averaged spectrum and the frequencies of its bins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PsdResult {
    pub fft: Vec<Complex64>,
    pub freqs: Vec<f64>,
    pub window_len: usize,
    pub step: usize,
}

impl PsdResult {
    /// Frequency spacing between bins.
    pub fn resolution(&self) -> f64 {
        self.freqs.get(1).copied().unwrap_or(0.0)
    }

    /// Index of the non-DC bin with the largest magnitude.
    pub fn peak_bin(&self) -> Option<usize> {
        (1..self.fft.len()).max_by(|&a, &b| {
            self.fft[a]
                .norm()
                .partial_cmp(&self.fft[b].norm())
                .unwrap_or(std::cmp::Ordering::Equal)
        })
    }
}

pub fn hann_window(len: usize) -> Vec<f64> {
    if len < 2 {
        return vec![1.0; len];
    }
    (0..len)
        .map(|i| 0.5 * (1.0 - (2.0 * std::f64::consts::PI * i as f64 / (len - 1) as f64).cos()))
        .collect()
}

pub fn demean(samples: &mut [f64]) {
    if samples.is_empty() {
        return;
    }
    let mean = samples.iter().sum::<f64>() / samples.len() as f64;
    for s in samples.iter_mut() {
        *s -= mean;
    }
}

/// Remove the least-squares straight line (and therefore the mean).
pub fn detrend(samples: &mut [f64]) {
    let n = samples.len();
    if n < 2 {
        demean(samples);
        return;
    }
    let nf = n as f64;
    let x_mean = (nf - 1.0) / 2.0;
    let y_mean = samples.iter().sum::<f64>() / nf;
    let mut sxy = 0.0;
    let mut sxx = 0.0;
    for (i, &y) in samples.iter().enumerate() {
        let dx = i as f64 - x_mean;
        sxy += dx * (y - y_mean);
        sxx += dx * dx;
    }
    let slope = sxy / sxx;
    for (i, s) in samples.iter_mut().enumerate() {
        *s -= y_mean + slope * (i as f64 - x_mean);
    }
}

pub fn to_decibels(power: f64) -> f64 {
    10.0 * power.log10()
}

fn check_finite(samples: &[f64], what: &str) -> CalResult<()> {
    match samples.iter().position(|s| !s.is_finite()) {
        Some(idx) => Err(CalError::InvalidSignal(format!(
            "{}: non-finite sample at index {}",
            what, idx
        ))),
        None => Ok(()),
    }
}

/// Full complex FFT of a real signal.
pub fn real_spectrum(samples: &[f64]) -> Vec<Complex64> {
    let mut buffer: Vec<Complex64> = samples.iter().map(|&s| Complex64::new(s, 0.0)).collect();
    if buffer.is_empty() {
        return buffer;
    }
    let mut planner = FftPlanner::new();
    planner.plan_fft_forward(buffer.len()).process(&mut buffer);
    buffer
}

/// Frequencies of the one-sided bins of an `n`-point FFT.
pub fn onesided_freqs(n: usize, sample_rate: f64) -> Vec<f64> {
    (0..=n / 2).map(|k| k as f64 * sample_rate / n as f64).collect()
}

/// Welch-averaged cross spectrum `A · conj(B)` with one-sided density scaling.
///
/// Each segment of `window_len` samples is detrended and Hann tapered; consecutive
/// segments overlap by `overlap` (fraction of a window). Inputs of unequal length
/// use their common prefix.
pub fn welch_cross(
    a: &[f64],
    b: &[f64],
    sample_rate: f64,
    window_len: usize,
    overlap: f64,
) -> CalResult<PsdResult> {
    check_finite(a, "first input")?;
    check_finite(b, "second input")?;
    let len = a.len().min(b.len());
    if window_len < 4 || window_len > len {
        return Err(CalError::InsufficientData(format!(
            "window of {} samples does not fit {} available samples",
            window_len, len
        )));
    }
    if !(0.0..1.0).contains(&overlap) {
        return Err(CalError::Configuration(format!(
            "overlap fraction must lie in [0, 1), got {}",
            overlap
        )));
    }

    let step = ((window_len as f64 * (1.0 - overlap)).round() as usize).max(1);
    let window = hann_window(window_len);
    let win_norm: f64 = window.iter().map(|w| w * w).sum();
    let n_freq = window_len / 2 + 1;

    let mut planner = FftPlanner::new();
    let fft = planner.plan_fft_forward(window_len);

    let taper = |segment: &[f64]| -> Vec<Complex64> {
        let mut values = segment.to_vec();
        detrend(&mut values);
        let mut buffer: Vec<Complex64> = values
            .iter()
            .zip(window.iter())
            .map(|(&s, &w)| Complex64::new(s * w, 0.0))
            .collect();
        fft.process(&mut buffer);
        buffer
    };

    let mut accum = vec![Complex64::new(0.0, 0.0); n_freq];
    let mut segments = 0usize;
    let mut start = 0usize;
    while start + window_len <= len {
        let fa = taper(&a[start..start + window_len]);
        // Auto-spectra skip the second transform
        let fb = if std::ptr::eq(a.as_ptr(), b.as_ptr()) {
            fa.clone()
        } else {
            taper(&b[start..start + window_len])
        };
        for (k, acc) in accum.iter_mut().enumerate() {
            *acc += fa[k] * fb[k].conj();
        }
        segments += 1;
        start += step;
    }

    let scale = 1.0 / (sample_rate * win_norm * segments as f64);
    for (k, acc) in accum.iter_mut().enumerate() {
        let onesided = if k == 0 || (window_len % 2 == 0 && k == window_len / 2) { 1.0 } else { 2.0 };
        *acc *= scale * onesided;
    }

    Ok(PsdResult {
        fft: accum,
        freqs: onesided_freqs(window_len, sample_rate),
        window_len,
        step,
    })
}

/// Welch power spectrum of a single signal.
pub fn windowed_fft(samples: &[f64], sample_rate: f64, window_len: usize, overlap: f64) -> CalResult<PsdResult> {
    welch_cross(samples, samples, sample_rate, window_len, overlap)
}

/// Segment length the settings imply for a record of `len` samples.
pub fn window_length(len: usize, settings: &SpectralSettings) -> usize {
    (len as f64 * settings.window_fraction).floor() as usize
}

fn check_rates(a: &TimeSeriesChannel, b: &TimeSeriesChannel) -> CalResult<()> {
    let (ra, rb) = (a.sample_rate(), b.sample_rate());
    if (ra - rb).abs() > ra.max(rb) * 1e-9 {
        return Err(CalError::InvalidSignal(format!(
            "sample rates differ: {} ({} Hz) vs {} ({} Hz)",
            a.name, ra, b.name, rb
        )));
    }
    Ok(())
}

/// Welch cross spectrum of two channels without response correction.
pub fn raw_cross_power(
    a: &TimeSeriesChannel,
    b: &TimeSeriesChannel,
    settings: &SpectralSettings,
) -> CalResult<PsdResult> {
    check_rates(a, b)?;
    let len = a.len().min(b.len());
    welch_cross(
        &a.samples,
        &b.samples,
        a.sample_rate(),
        window_length(len, settings),
        settings.overlap,
    )
}

/// Cross spectrum of two channels in physical units: the raw Welch estimate divided by
/// `H_a(f) · conj(H_b(f))` with both responses referred to acceleration.
pub fn cross_power(
    a: &TimeSeriesChannel,
    b: &TimeSeriesChannel,
    response_a: &ResponseModel,
    response_b: &ResponseModel,
    settings: &SpectralSettings,
) -> CalResult<PsdResult> {
    let mut result = raw_cross_power(a, b, settings)?;
    let resp_a = response_a.evaluate_in(&result.freqs, Unit::Acceleration);
    let resp_b = response_b.evaluate_in(&result.freqs, Unit::Acceleration);
    for ((value, ha), hb) in result.fft.iter_mut().zip(resp_a.iter()).zip(resp_b.iter()) {
        let scale = ha * hb.conj();
        *value = if scale.norm() > 0.0 && scale.is_finite() {
            *value / scale
        } else {
            Complex64::new(0.0, 0.0)
        };
    }
    Ok(result)
}

/// Average a complex curve into logarithmically spaced bins over `[fmin, fmax]`.
///
/// Returns the geometric-mean frequency and mean value of every non-empty bin.
/// Geometric mean of a bin's frequencies, kept inside the requested band.
fn bin_center(log_sum: f64, count: usize, fmin: f64, fmax: f64) -> f64 {
    10f64.powf(log_sum / count as f64).clamp(fmin, fmax)
}

pub fn log_bin_average(
    freqs: &[f64],
    values: &[Complex64],
    points_per_decade: usize,
    fmin: f64,
    fmax: f64,
) -> (Vec<f64>, Vec<Complex64>) {
    let ppd = points_per_decade.max(1) as f64;
    let mut out_freqs = Vec::new();
    let mut out_values = Vec::new();

    let mut current_bin: Option<i64> = None;
    let mut log_sum = 0.0;
    let mut value_sum = Complex64::new(0.0, 0.0);
    let mut count = 0usize;

    for (&f, &v) in freqs.iter().zip(values.iter()) {
        if !(f > 0.0 && f >= fmin && f <= fmax) {
            continue;
        }
        let bin = (f.log10() * ppd).floor() as i64;
        if current_bin != Some(bin) && count > 0 {
            out_freqs.push(bin_center(log_sum, count, fmin, fmax));
            out_values.push(value_sum / count as f64);
            log_sum = 0.0;
            value_sum = Complex64::new(0.0, 0.0);
            count = 0;
        }
        current_bin = Some(bin);
        log_sum += f.log10();
        value_sum += v;
        count += 1;
    }
    if count > 0 {
        out_freqs.push(bin_center(log_sum, count, fmin, fmax));
        out_values.push(value_sum / count as f64);
    }
    (out_freqs, out_values)
}

/// Logarithmically spaced frequencies from `fmin` to `fmax` inclusive.
pub fn log_space(fmin: f64, fmax: f64, points_per_decade: usize) -> Vec<f64> {
    if !(fmin > 0.0 && fmax > fmin) {
        return Vec::new();
    }
    let decades = (fmax / fmin).log10();
    let count = ((decades * points_per_decade.max(1) as f64).ceil() as usize).max(1);
    (0..=count)
        .map(|i| fmin * 10f64.powf(decades * i as f64 / count as f64))
        .collect()
}

/// Filter a real signal through a transfer function in the frequency domain.
///
/// `transfer` is sampled at the non-negative FFT bin frequencies; negative
/// frequencies use the conjugate so the output stays real. With `padded` the
/// signal is zero-padded to at least twice its length (linear rather than
/// circular convolution).
pub fn apply_transfer<F>(samples: &[f64], sample_rate: f64, padded: bool, transfer: F) -> Vec<f64>
where
    F: Fn(&[f64]) -> Vec<Complex64>,
{
    let n = samples.len();
    if n == 0 {
        return Vec::new();
    }
    let len = if padded { (2 * n).next_power_of_two() } else { n };

    let mut buffer: Vec<Complex64> = samples
        .iter()
        .map(|&s| Complex64::new(s, 0.0))
        .chain(std::iter::repeat(Complex64::new(0.0, 0.0)))
        .take(len)
        .collect();

    let mut planner = FftPlanner::new();
    planner.plan_fft_forward(len).process(&mut buffer);

    let freqs = onesided_freqs(len, sample_rate);
    let response = transfer(&freqs);
    for k in 0..len {
        let h = if k <= len / 2 {
            response[k]
        } else {
            response[len - k].conj()
        };
        buffer[k] *= if h.is_finite() { h } else { Complex64::new(0.0, 0.0) };
    }

    planner.plan_fft_inverse(len).process(&mut buffer);
    buffer.iter().take(n).map(|c| c.re / len as f64).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f64::consts::PI;

    fn sine(freq: f64, amplitude: f64, fs: f64, n: usize) -> Vec<f64> {
        (0..n)
            .map(|i| amplitude * (2.0 * PI * freq * i as f64 / fs).sin())
            .collect()
    }

    #[test]
    fn test_detrend_removes_line() {
        let mut values: Vec<f64> = (0..100).map(|i| 3.0 + 0.5 * i as f64).collect();
        detrend(&mut values);
        assert!(values.iter().all(|v| v.abs() < 1e-9));
    }

    #[test]
    fn test_welch_peak_location_and_scaling() {
        let fs = 100.0;
        let n = 8192;
        let window = 1024;
        let f0 = 12.5;

        let small = windowed_fft(&sine(f0, 1.0, fs, n), fs, window, 0.75).unwrap();
        let large = windowed_fft(&sine(f0, 3.0, fs, n), fs, window, 0.75).unwrap();

        let resolution = small.resolution();
        let peak = small.peak_bin().unwrap();
        assert!((small.freqs[peak] - f0).abs() <= resolution, "peak at {} Hz", small.freqs[peak]);
        assert_eq!(large.peak_bin(), Some(peak));

        // Amplitude spectrum scales linearly with the sinusoid amplitude
        let ratio = (large.fft[peak].norm() / small.fft[peak].norm()).sqrt();
        assert!((ratio - 3.0).abs() < 1e-6, "ratio {}", ratio);
        assert_eq!(small.step, 256);
        assert_eq!(small.fft.len(), window / 2 + 1);
    }

    #[test]
    fn test_welch_parseval_white_noise_level() {
        // Variance of the signal equals the integral of the one-sided PSD
        let fs = 50.0;
        let n = 20000;
        let mut state = 12345u64;
        let samples: Vec<f64> = (0..n)
            .map(|_| {
                state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
                ((state >> 11) as f64 / (1u64 << 53) as f64) - 0.5
            })
            .collect();
        let psd = windowed_fft(&samples, fs, 1000, 0.5).unwrap();
        let integral: f64 = psd.fft.iter().map(|c| c.re).sum::<f64>() * psd.resolution();
        let variance = samples.iter().map(|s| s * s).sum::<f64>() / n as f64;
        assert!((integral / variance - 1.0).abs() < 0.05, "{} vs {}", integral, variance);
    }

    #[test]
    fn test_welch_errors() {
        let short = vec![1.0; 10];
        assert!(matches!(
            windowed_fft(&short, 1.0, 20, 0.5),
            Err(CalError::InsufficientData(_))
        ));
        let mut bad = vec![0.0; 100];
        bad[5] = f64::INFINITY;
        assert!(matches!(
            windowed_fft(&bad, 1.0, 20, 0.5),
            Err(CalError::InvalidSignal(_))
        ));
    }

    #[test]
    fn test_log_bin_average_thins_linear_bins() {
        let freqs: Vec<f64> = (0..=1000).map(|k| k as f64 * 0.01).collect();
        let values = vec![Complex64::new(2.0, -1.0); freqs.len()];
        let (f, v) = log_bin_average(&freqs, &values, 10, 0.05, 5.0);
        assert!(f.len() < 25, "{} points", f.len());
        assert!(f.windows(2).all(|w| w[1] > w[0]));
        assert!(f.first().copied().unwrap() >= 0.05);
        assert!(v.iter().all(|c| (c - Complex64::new(2.0, -1.0)).norm() < 1e-12));
    }

    #[test]
    fn test_log_bin_average_stays_in_band() {
        // Band edges land exactly on single-sample bins
        let freqs = [0.05, 0.3, 0.31, 2.0, 5.0];
        let values = vec![Complex64::new(1.0, 0.0); freqs.len()];
        let (f, _) = log_bin_average(&freqs, &values, 40, 0.05, 5.0);
        assert_eq!(f.first().copied(), Some(0.05));
        assert!((f[f.len() - 1] - 5.0).abs() < 1e-12);
        assert!(f.iter().all(|&x| (0.05..=5.0).contains(&x)));
    }

    #[test]
    fn test_apply_transfer_identity_and_gain() {
        let x = sine(1.0, 1.0, 20.0, 400);
        let same = apply_transfer(&x, 20.0, false, |f| vec![Complex64::new(1.0, 0.0); f.len()]);
        for (a, b) in x.iter().zip(same.iter()) {
            assert!((a - b).abs() < 1e-9);
        }
        let doubled = apply_transfer(&x, 20.0, false, |f| vec![Complex64::new(2.0, 0.0); f.len()]);
        assert!((doubled[37] - 2.0 * x[37]).abs() < 1e-9);
    }

    #[test]
    fn test_log_space_endpoints() {
        let f = log_space(0.01, 10.0, 5);
        assert_eq!(f.len(), 16);
        assert!((f[0] - 0.01).abs() < 1e-12);
        assert!((f[15] - 10.0).abs() < 1e-9);
    }
}
