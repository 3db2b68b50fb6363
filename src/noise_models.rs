//! Peterson (1993) new low and high noise models.
//!
//! Each model is a piecewise-linear curve in log-period: between consecutive
//! breakpoints the acceleration power is `A + B·log10(T)` dB relative to
//! 1 (m/s²)²/Hz.

/// (period lower bound, A, B); the last row only closes the final segment.
const NLNM: [(f64, f64, f64); 22] = [
    (0.10, -162.36, 5.64),
    (0.17, -166.70, 0.00),
    (0.40, -170.00, -8.30),
    (0.80, -166.40, 28.90),
    (1.24, -168.60, 52.48),
    (2.40, -159.98, 29.81),
    (4.30, -141.10, 0.00),
    (5.00, -71.36, -99.77),
    (6.00, -97.26, -66.49),
    (10.00, -132.18, -31.57),
    (12.00, -205.27, 36.16),
    (15.60, -37.65, -104.33),
    (21.90, -114.37, -47.10),
    (31.60, -160.58, -16.28),
    (45.00, -187.50, 0.00),
    (70.00, -216.47, 15.70),
    (101.00, -185.00, 0.00),
    (154.00, -168.34, -7.61),
    (328.00, -217.43, 11.90),
    (600.00, -258.28, 26.60),
    (10000.00, -346.88, 48.75),
    (100000.00, -346.88, 48.75),
];

const NHNM: [(f64, f64, f64); 12] = [
    (0.10, -108.73, -17.23),
    (0.22, -150.34, -80.50),
    (0.32, -122.31, -23.87),
    (0.80, -116.85, 32.51),
    (3.80, -108.48, 18.08),
    (4.60, -74.66, -32.95),
    (6.30, 0.66, -127.18),
    (7.90, -93.37, -22.42),
    (15.40, 73.54, -162.98),
    (20.00, -151.52, 10.01),
    (354.80, -206.66, 31.63),
    (100000.00, -206.66, 31.63),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoiseModel {
    Low,
    High,
}

impl NoiseModel {
    fn table(self) -> &'static [(f64, f64, f64)] {
        match self {
            NoiseModel::Low => &NLNM,
            NoiseModel::High => &NHNM,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            NoiseModel::Low => "NLNM",
            NoiseModel::High => "NHNM",
        }
    }

    pub fn min_period(self) -> f64 {
        self.table()[0].0
    }

    pub fn max_period(self) -> f64 {
        self.table()[self.table().len() - 1].0
    }

    /// Model level in dB at `period` seconds, `None` outside the tabulated range.
    pub fn db_at_period(self, period: f64) -> Option<f64> {
        let table = self.table();
        if !(period >= self.min_period() && period <= self.max_period()) {
            return None;
        }
        let segment = table
            .windows(2)
            .find(|w| period >= w[0].0 && period < w[1].0)
            .map(|w| w[0])
            .unwrap_or(table[table.len() - 2]);
        Some(segment.1 + segment.2 * period.log10())
    }

    /// Curve sampled at every breakpoint and segment midpoint (log scale), as
    /// `(x, dB)` with x in seconds or, for `freq_space`, in Hz ascending.
    pub fn series(self, freq_space: bool) -> Vec<(f64, f64)> {
        let table = self.table();
        let mut periods = Vec::with_capacity(table.len() * 2);
        for w in table.windows(2) {
            periods.push(w[0].0);
            periods.push((w[0].0 * w[1].0).sqrt());
        }
        periods.push(self.max_period());

        let mut points: Vec<(f64, f64)> = periods
            .into_iter()
            .filter_map(|t| self.db_at_period(t).map(|db| (t, db)))
            .collect();
        if freq_space {
            points = points.into_iter().rev().map(|(t, db)| (1.0 / t, db)).collect();
        }
        points
    }
}
