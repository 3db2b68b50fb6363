//! Instrument response as a rational transfer function of poles, zeros and gain.

use num_complex::Complex64;
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

use crate::error::{CalError, CalResult};

/// Relative tolerance used to recognise a root's conjugate.
const CONJUGATE_TOLERANCE: f64 = 1e-12;

/// Physical quantity at the sensor input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Unit {
    Displacement,
    Velocity,
    Acceleration,
}

impl Unit {
    /// Number of time derivatives relative to displacement.
    pub fn order(self) -> i32 {
        match self {
            Unit::Displacement => 0,
            Unit::Velocity => 1,
            Unit::Acceleration => 2,
        }
    }

    /// Factor turning a response with input in `self` into one with input in `target`:
    /// `(i·2πf)^(order(self) − order(target))`.
    pub fn conversion_factor(self, target: Unit, freq: f64) -> Complex64 {
        let exponent = self.order() - target.order();
        if exponent == 0 {
            return Complex64::new(1.0, 0.0);
        }
        if freq == 0.0 {
            return Complex64::new(0.0, 0.0);
        }
        Complex64::new(0.0, 2.0 * PI * freq).powi(exponent)
    }
}

/// Domain the poles and zeros are expressed in.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransferFunction {
    /// Laplace transform in rad/s, `s = i·2πf`.
    Laplace,
    /// Laplace transform in Hz, `s = i·f`.
    LaplaceHertz,
    /// z-transform on the unit circle, `z = exp(i·2πf/fs)`.
    Digital { sample_rate: f64 },
}

impl TransferFunction {
    fn variable(self, freq: f64) -> Complex64 {
        match self {
            TransferFunction::Laplace => Complex64::new(0.0, 2.0 * PI * freq),
            TransferFunction::LaplaceHertz => Complex64::new(0.0, freq),
            TransferFunction::Digital { sample_rate } => {
                Complex64::new(0.0, 2.0 * PI * freq / sample_rate).exp()
            }
        }
    }

    /// Natural frequency of a root in Hz.
    pub fn natural_frequency(self, root: Complex64) -> f64 {
        match self {
            TransferFunction::Laplace => root.norm() / (2.0 * PI),
            TransferFunction::LaplaceHertz => root.norm(),
            TransferFunction::Digital { sample_rate } => (root.ln() * sample_rate).norm() / (2.0 * PI),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FitBand {
    Low,
    High,
}

/// Which roots of a response take part in a fit.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FitSelection {
    pub band: FitBand,
    pub cutoff_hz: f64,
    /// Upper bound of the high band; ignored for the low band.
    pub max_fit_hz: f64,
    pub fit_zeros: bool,
}

impl FitSelection {
    /// Poles below `cutoff_hz`.
    pub fn low(cutoff_hz: f64) -> Self {
        Self {
            band: FitBand::Low,
            cutoff_hz,
            max_fit_hz: f64::INFINITY,
            fit_zeros: false,
        }
    }

    /// Poles and zeros in `[cutoff_hz, max_fit_hz)`.
    pub fn high(cutoff_hz: f64, max_fit_hz: f64) -> Self {
        Self {
            band: FitBand::High,
            cutoff_hz,
            max_fit_hz,
            fit_zeros: true,
        }
    }

    pub fn contains(&self, freq: f64) -> bool {
        match self.band {
            FitBand::Low => freq < self.cutoff_hz,
            FitBand::High => freq >= self.cutoff_hz && freq < self.max_fit_hz,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RootList {
    Zeros,
    Poles,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotShape {
    Real,
    Complex,
    /// Root at the slot index; its conjugate sits at `partner` in the same list.
    Pair { partner: usize },
}

#[derive(Debug, Clone, Copy)]
struct Slot {
    list: RootList,
    index: usize,
    shape: SlotShape,
}

/// Poles, zeros and gains describing one sensor's response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseModel {
    pub name: String,
    /// A0 normalization constant.
    pub normalization: f64,
    pub normalization_freq: f64,
    pub zeros: Vec<Complex64>,
    pub poles: Vec<Complex64>,
    /// Stage gains; with several stages, entry 0 is the overall sensitivity.
    #[serde(default)]
    pub gains: Vec<f64>,
    pub transfer: TransferFunction,
    pub unit: Unit,
}

fn is_conjugate_pair(a: Complex64, b: Complex64) -> bool {
    a.im != 0.0 && (b - a.conj()).norm() <= CONJUGATE_TOLERANCE * a.norm().max(1.0)
}

/// First unclaimed conjugate of `roots[i]` after position `i`.
fn conjugate_partner(roots: &[Complex64], paired: &[bool], i: usize) -> Option<usize> {
    (i + 1..roots.len()).find(|&j| !paired[j] && is_conjugate_pair(roots[i], roots[j]))
}

/// Interleave real and imaginary parts: `[re0, im0, re1, im1, ...]`.
pub fn flatten(roots: &[Complex64]) -> Vec<f64> {
    roots.iter().flat_map(|r| [r.re, r.im]).collect()
}

impl ResponseModel {
    /// Laplace (rad/s) response with unit normalization at 1 Hz and no stage gains.
    pub fn new(name: impl Into<String>, zeros: Vec<Complex64>, poles: Vec<Complex64>, unit: Unit) -> Self {
        Self {
            name: name.into(),
            normalization: 1.0,
            normalization_freq: 1.0,
            zeros,
            poles,
            gains: Vec::new(),
            transfer: TransferFunction::Laplace,
            unit,
        }
    }

    pub fn with_gains(mut self, gains: Vec<f64>) -> Self {
        self.gains = gains;
        self
    }

    /// Set the normalization frequency and recompute A0 for it.
    pub fn normalized_at(mut self, freq: f64) -> Self {
        self.normalization_freq = freq;
        self.renormalize();
        self
    }

    pub fn validate(&self) -> CalResult<()> {
        if !self.normalization.is_finite() {
            return Err(CalError::Configuration(format!(
                "{}: normalization constant is not finite",
                self.name
            )));
        }
        if let TransferFunction::Digital { sample_rate } = self.transfer
            && !(sample_rate.is_finite() && sample_rate > 0.0)
        {
            return Err(CalError::Configuration(format!(
                "{}: digital response needs a positive sample rate",
                self.name
            )));
        }
        let finite = |r: &Complex64| r.is_finite();
        if !self.poles.iter().all(finite) || !self.zeros.iter().all(finite) {
            return Err(CalError::Configuration(format!(
                "{}: non-finite pole or zero",
                self.name
            )));
        }
        Ok(())
    }

    pub fn total_gain(&self) -> f64 {
        match self.gains.len() {
            0 => 1.0,
            1 => self.gains[0],
            _ => self.gains[1..].iter().product(),
        }
    }

    fn rational(&self, freq: f64) -> Complex64 {
        let s = self.transfer.variable(freq);
        let numerator: Complex64 = self.zeros.iter().map(|z| s - z).product();
        let denominator: Complex64 = self.poles.iter().map(|p| s - p).product();
        numerator / denominator
    }

    /// Complex response at each frequency in the model's native input unit.
    pub fn evaluate(&self, freqs: &[f64]) -> Vec<Complex64> {
        let scale = self.normalization * self.total_gain();
        freqs.iter().map(|&f| self.rational(f) * scale).collect()
    }

    /// Complex response with input expressed in `unit`.
    pub fn evaluate_in(&self, freqs: &[f64], unit: Unit) -> Vec<Complex64> {
        let scale = self.normalization * self.total_gain();
        freqs
            .iter()
            .map(|&f| self.rational(f) * scale * self.unit.conversion_factor(unit, f))
            .collect()
    }

    /// Recompute A0 so the pole-zero part has unit magnitude at the normalization frequency.
    pub fn renormalize(&mut self) {
        let magnitude = self.rational(self.normalization_freq).norm();
        if magnitude.is_finite() && magnitude > 0.0 {
            self.normalization = 1.0 / magnitude;
        }
    }

    pub fn natural_frequency(&self, root: Complex64) -> f64 {
        self.transfer.natural_frequency(root)
    }

    fn roots(&self, list: RootList) -> &[Complex64] {
        match list {
            RootList::Zeros => &self.zeros,
            RootList::Poles => &self.poles,
        }
    }

    fn roots_mut(&mut self, list: RootList) -> &mut Vec<Complex64> {
        match list {
            RootList::Zeros => &mut self.zeros,
            RootList::Poles => &mut self.poles,
        }
    }

    fn slots(&self, selection: &FitSelection) -> Vec<Slot> {
        let mut lists = Vec::with_capacity(2);
        if selection.fit_zeros {
            lists.push(RootList::Zeros);
        }
        lists.push(RootList::Poles);

        let mut slots = Vec::new();
        for list in lists {
            let roots = self.roots(list);
            let mut paired = vec![false; roots.len()];
            for (i, &root) in roots.iter().enumerate() {
                if paired[i] || !selection.contains(self.natural_frequency(root)) {
                    continue;
                }
                let shape = if root.im == 0.0 {
                    SlotShape::Real
                } else if let Some(partner) = conjugate_partner(roots, &paired, i) {
                    paired[partner] = true;
                    SlotShape::Pair { partner }
                } else {
                    SlotShape::Complex
                };
                slots.push(Slot { list, index: i, shape });
            }
        }
        slots
    }

    /// Flatten the selected roots into `(re, im)` pairs: zeros first when fitted,
    /// then poles, each in declaration order. A conjugate pair contributes only its
    /// first member; duplicates contribute one entry each.
    pub fn to_parameter_vector(&self, selection: &FitSelection) -> Vec<f64> {
        self.slots(selection)
            .iter()
            .flat_map(|slot| {
                let root = self.roots(slot.list)[slot.index];
                [root.re, root.im]
            })
            .collect()
    }

    /// Inverse of [`to_parameter_vector`](Self::to_parameter_vector): a copy of this
    /// response with the selected roots overwritten. Conjugate partners are mirrored and
    /// real roots stay real; everything else is left untouched.
    pub fn from_parameter_vector(&self, params: &[f64], selection: &FitSelection) -> CalResult<Self> {
        let slots = self.slots(selection);
        if params.len() != 2 * slots.len() {
            return Err(CalError::Configuration(format!(
                "{}: parameter vector has {} values, selection needs {}",
                self.name,
                params.len(),
                2 * slots.len()
            )));
        }

        let mut out = self.clone();
        for (slot, values) in slots.iter().zip(params.chunks_exact(2)) {
            let roots = out.roots_mut(slot.list);
            match slot.shape {
                SlotShape::Real => roots[slot.index] = Complex64::new(values[0], 0.0),
                SlotShape::Complex => roots[slot.index] = Complex64::new(values[0], values[1]),
                SlotShape::Pair { partner } => {
                    let root = Complex64::new(values[0], values[1]);
                    roots[slot.index] = root;
                    roots[partner] = root.conj();
                }
            }
        }
        Ok(out)
    }

    /// Indices of the lowest-frequency conjugate pole pair, first member first.
    pub fn lowest_pole_pair(&self) -> Option<(usize, usize)> {
        let mut paired = vec![false; self.poles.len()];
        let mut best: Option<((usize, usize), f64)> = None;
        for i in 0..self.poles.len() {
            if paired[i] {
                continue;
            }
            let Some(j) = conjugate_partner(&self.poles, &paired, i) else {
                continue;
            };
            paired[j] = true;
            let freq = self.natural_frequency(self.poles[i]);
            if best.is_none_or(|(_, f)| freq < f) {
                best = Some(((i, j), freq));
            }
        }
        best.map(|(pair, _)| pair)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn c(re: f64, im: f64) -> Complex64 {
        Complex64::new(re, im)
    }

    /// Broadband velocity sensor with a duplicated high-frequency pair and real poles.
    fn sts_like() -> ResponseModel {
        ResponseModel::new(
            "STS-like",
            vec![c(0.0, 0.0), c(0.0, 0.0), c(-15.15, 0.0)],
            vec![
                c(-0.037, 0.037),
                c(-0.037, -0.037),
                c(-39.18, 49.12),
                c(-39.18, -49.12),
                c(-39.18, 49.12),
                c(-39.18, -49.12),
                c(-100.0, 0.0),
                c(-100.0, 0.0),
                c(-5.0, 400.0),
            ],
            Unit::Velocity,
        )
        .with_gains(vec![1500.0, 1500.0, 1.0e6])
    }

    #[test]
    fn test_no_roots_is_constant() {
        let mut resp = ResponseModel::new("flat", vec![], vec![], Unit::Velocity).with_gains(vec![9.0, 3.0, 2.0]);
        resp.normalization = 2.5;
        for h in resp.evaluate(&[0.0, 0.01, 1.0, 40.0]) {
            assert!((h - c(2.5 * 6.0, 0.0)).norm() < 1e-12);
        }
    }

    #[test]
    fn test_total_gain_rules() {
        let resp = ResponseModel::new("r", vec![], vec![], Unit::Velocity);
        assert_eq!(resp.total_gain(), 1.0);
        assert_eq!(resp.clone().with_gains(vec![4.0]).total_gain(), 4.0);
        assert_eq!(resp.with_gains(vec![100.0, 4.0, 5.0]).total_gain(), 20.0);
    }

    #[test]
    fn test_unit_conversion() {
        let f = 2.0;
        let factor = Unit::Velocity.conversion_factor(Unit::Acceleration, f);
        let expected = c(1.0, 0.0) / c(0.0, 2.0 * PI * f);
        assert!((factor - expected).norm() < 1e-12);
        let factor = Unit::Displacement.conversion_factor(Unit::Velocity, f);
        assert!((factor - expected).norm() < 1e-12);
        assert_eq!(Unit::Acceleration.conversion_factor(Unit::Acceleration, 0.0), c(1.0, 0.0));
        assert_eq!(Unit::Velocity.conversion_factor(Unit::Acceleration, 0.0), c(0.0, 0.0));
    }

    #[test]
    fn test_renormalize_unit_magnitude() {
        let resp = sts_like().normalized_at(1.0);
        let h = resp.evaluate(&[1.0])[0] / resp.total_gain();
        assert!((h.norm() - 1.0).abs() < 1e-9, "|H(1 Hz)| = {}", h.norm());
    }

    #[test]
    fn test_digital_evaluation_on_unit_circle() {
        let mut resp = ResponseModel::new("fir", vec![], vec![c(0.0, 0.0)], Unit::Velocity);
        resp.transfer = TransferFunction::Digital { sample_rate: 100.0 };
        for h in resp.evaluate(&[1.0, 10.0, 49.0]) {
            assert!((h.norm() - 1.0).abs() < 1e-12);
        }
        let root = Complex64::from_polar(0.9, 2.0 * PI * 5.0 / 100.0);
        let freq = resp.natural_frequency(root);
        let expected = c(0.9f64.ln() * 100.0, 2.0 * PI * 5.0).norm() / (2.0 * PI);
        assert!((freq - expected).abs() < 1e-9);
    }

    #[test]
    fn test_round_trip_preserves_duplicates() {
        let resp = sts_like();
        for selection in [FitSelection::low(1.0), FitSelection::high(1.0, 80.0)] {
            let params = resp.to_parameter_vector(&selection);
            let rebuilt = resp.from_parameter_vector(&params, &selection).unwrap();
            assert_eq!(rebuilt, resp);
        }
    }

    #[test]
    fn test_parameter_vector_layout() {
        let resp = sts_like();
        let low = resp.to_parameter_vector(&FitSelection::low(1.0));
        assert_eq!(low, vec![-0.037, 0.037]);

        // zeros: -15.15 (2.4 Hz); poles: two pairs, two duplicate reals. 400 rad/s is beyond max fit.
        let high = resp.to_parameter_vector(&FitSelection::high(1.0, 50.0));
        assert_eq!(
            high,
            vec![-15.15, 0.0, -39.18, 49.12, -39.18, 49.12, -100.0, 0.0, -100.0, 0.0]
        );
    }

    #[test]
    fn test_from_parameter_vector_mirrors_and_clamps() {
        let resp = sts_like();
        let selection = FitSelection::high(1.0, 50.0);
        let params = vec![-14.0, 0.0, -40.0, 50.0, -38.0, 48.0, -90.0, 0.0, -110.0, 0.0];
        let fitted = resp.from_parameter_vector(&params, &selection).unwrap();
        assert_eq!(fitted.zeros[2], c(-14.0, 0.0));
        assert_eq!(fitted.poles[2], c(-40.0, 50.0));
        assert_eq!(fitted.poles[3], c(-40.0, -50.0));
        assert_eq!(fitted.poles[5], c(-38.0, -48.0));
        assert_eq!(fitted.poles[6], c(-90.0, 0.0));
        assert_eq!(fitted.poles[7], c(-110.0, 0.0));
        // Untouched outside the band
        assert_eq!(fitted.poles[0], resp.poles[0]);
        assert_eq!(fitted.poles[8], resp.poles[8]);
        assert_eq!(fitted.gains, resp.gains);

        let mut real_moved = params.clone();
        real_moved[7] = 3.0;
        let fitted = resp.from_parameter_vector(&real_moved, &selection).unwrap();
        assert_eq!(fitted.poles[6].im, 0.0);
    }

    #[test]
    fn test_length_mismatch_is_configuration_error() {
        let resp = sts_like();
        let result = resp.from_parameter_vector(&[1.0, 2.0, 3.0], &FitSelection::low(1.0));
        assert!(matches!(result, Err(CalError::Configuration(_))));
    }

    #[test]
    fn test_lowest_pole_pair() {
        let resp = sts_like();
        assert_eq!(resp.lowest_pole_pair(), Some((0, 1)));
        let only_real = ResponseModel::new("r", vec![], vec![c(-1.0, 0.0)], Unit::Velocity);
        assert_eq!(only_real.lowest_pole_pair(), None);
    }

    /// Two conjugate pairs declared as `[p, q, p̄, q̄, r]`.
    fn interleaved() -> ResponseModel {
        ResponseModel::new(
            "interleaved",
            vec![c(0.0, 0.0), c(0.0, 0.0)],
            vec![c(-0.222, 0.222), c(-20.0, 20.0), c(-0.222, -0.222), c(-20.0, -20.0), c(-150.0, 0.0)],
            Unit::Velocity,
        )
    }

    #[test]
    fn test_interleaved_pairs_share_one_slot() {
        let resp = interleaved();
        let selection = FitSelection::high(1.0, 50.0);
        let params = resp.to_parameter_vector(&selection);
        assert_eq!(params, vec![-20.0, 20.0, -150.0, 0.0]);
        assert_eq!(resp.from_parameter_vector(&params, &selection).unwrap(), resp);

        let fitted = resp.from_parameter_vector(&[-25.0, 18.0, -140.0, 0.0], &selection).unwrap();
        assert_eq!(fitted.poles[1], c(-25.0, 18.0));
        assert_eq!(fitted.poles[3], c(-25.0, -18.0));
        assert_eq!(fitted.poles[0], resp.poles[0]);
        assert_eq!(fitted.poles[2], resp.poles[2]);

        let low = resp.to_parameter_vector(&FitSelection::low(1.0));
        assert_eq!(low, vec![-0.222, 0.222]);
        let fitted = resp.from_parameter_vector(&[-0.3, 0.25], &FitSelection::low(1.0)).unwrap();
        assert_eq!(fitted.poles[2], c(-0.3, -0.25));
    }

    #[test]
    fn test_lowest_pole_pair_not_adjacent() {
        let resp = interleaved();
        assert_eq!(resp.lowest_pole_pair(), Some((0, 2)));
        let reversed = ResponseModel::new(
            "r",
            vec![],
            vec![c(-20.0, -20.0), c(-1.0, 0.0), c(-20.0, 20.0)],
            Unit::Velocity,
        );
        assert_eq!(reversed.lowest_pole_pair(), Some((0, 2)));
    }

    #[test]
    fn test_flatten() {
        assert_eq!(flatten(&[c(1.0, -2.0), c(3.0, 0.0)]), vec![1.0, -2.0, 3.0, 0.0]);
    }
}
