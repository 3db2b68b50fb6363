use num_complex::Complex64;
use std::f64::consts::PI;

/// Second-order section in transposed direct form II.
#[derive(Debug, Clone)]
pub struct Biquad {
    pub b0: f64,
    pub b1: f64,
    pub b2: f64,
    pub a1: f64,
    pub a2: f64,
    s1: f64,
    s2: f64,
}

impl Biquad {
    pub fn new(b0: f64, b1: f64, b2: f64, a1: f64, a2: f64) -> Self {
        Self {
            b0,
            b1,
            b2,
            a1,
            a2,
            s1: 0.0,
            s2: 0.0,
        }
    }

    pub fn process(&mut self, x: f64) -> f64 {
        let y = self.b0 * x + self.s1;
        self.s1 = self.b1 * x - self.a1 * y + self.s2;
        self.s2 = self.b2 * x - self.a2 * y;
        y
    }

    fn reset(&mut self) {
        self.s1 = 0.0;
        self.s2 = 0.0;
    }
}

/// Compute a Butterworth lowpass filter as cascaded second-order sections
/// using the bilinear transform.
///
/// - `order`: number of analog prototype poles
/// - `cutoff`: -3 dB frequency (Hz), must be below Nyquist
/// - `fs`: sampling frequency (Hz)
///
/// Each section is normalized to unity gain at DC.
pub fn butter_lowpass_sos(order: usize, cutoff: f64, fs: f64) -> Vec<Biquad> {
    assert!(order > 0, "Filter order must be > 0");
    assert!(cutoff > 0.0 && cutoff < fs / 2.0, "Cutoff must lie in (0, Nyquist)");

    // Pre-warp the digital cutoff to the analog domain
    let omega_c = 2.0 * fs * (PI * cutoff / fs).tan();
    let bilinear = |s: Complex64| (1.0 + s / (2.0 * fs)) / (1.0 - s / (2.0 * fs));

    let mut sections = Vec::with_capacity(order.div_ceil(2));

    // Prototype poles s_k = exp(j * pi * (2k + N + 1) / (2N)); k and N-1-k are conjugates
    for k in 0..order / 2 {
        let theta = PI * (2 * k + order + 1) as f64 / (2 * order) as f64;
        let z = bilinear(Complex64::from_polar(omega_c, theta));

        // Denominator (z - p)(z - p*) = z^2 - 2 Re(p) z + |p|^2, zeros both at z = -1
        let a1 = -2.0 * z.re;
        let a2 = z.norm_sqr();
        let gain = (1.0 + a1 + a2) / 4.0;
        sections.push(Biquad::new(gain, 2.0 * gain, gain, a1, a2));
    }

    if order % 2 == 1 {
        // The remaining prototype pole is real (theta = pi)
        let z = bilinear(Complex64::new(-omega_c, 0.0)).re;
        let gain = (1.0 - z) / 2.0;
        sections.push(Biquad::new(gain, gain, 0.0, -z, 0.0));
    }

    sections
}

/// A chain of Biquad sections with persistent state.
#[derive(Debug, Clone)]
pub struct BiquadChain {
    sections: Vec<Biquad>,
}

impl BiquadChain {
    pub fn new(sections: Vec<Biquad>) -> Self {
        Self { sections }
    }

    /// Create a lowpass filter chain.
    pub fn lowpass(order: usize, cutoff: f64, fs: f64) -> Self {
        Self::new(butter_lowpass_sos(order, cutoff, fs))
    }

    /// Process a single sample through the cascade.
    pub fn process(&mut self, x: f64) -> f64 {
        let mut val = x;
        for section in &mut self.sections {
            val = section.process(val);
        }
        val
    }

    /// Zero-phase (forward-backward) filtering, equivalent to scipy's sosfiltfilt.
    /// Uses odd-symmetric signal extension to minimize edge transients.
    /// Note: this resets filter state and is meant for batch/offline processing.
    pub fn filtfilt(&mut self, samples: &[f64]) -> Vec<f64> {
        let n = samples.len();
        if n < 2 {
            return samples.to_vec();
        }

        // Pad length: 3 × number of biquad sections (matching scipy's default)
        let pad_len = (3 * self.sections.len()).min(n - 1);

        let mut extended = Vec::with_capacity(n + 2 * pad_len);
        for i in (1..=pad_len).rev() {
            extended.push(2.0 * samples[0] - samples[i]);
        }
        extended.extend_from_slice(samples);
        for i in 1..=pad_len {
            extended.push(2.0 * samples[n - 1] - samples[n - 1 - i]);
        }

        // Start from the edge value so the step into the padded signal does not ring
        self.reset();
        let head = extended[0];
        let mut forward: Vec<f64> = extended.iter().map(|&s| self.process(s - head) + head).collect();
        forward.reverse();

        self.reset();
        let tail = forward[0];
        let mut backward: Vec<f64> = forward.iter().map(|&s| self.process(s - tail) + tail).collect();
        backward.reverse();

        backward[pad_len..pad_len + n].to_vec()
    }

    /// Reset filter state (zero all delay elements).
    pub fn reset(&mut self) {
        for section in &mut self.sections {
            section.reset();
        }
    }
}
