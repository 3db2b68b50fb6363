use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{CalError, CalResult};
use crate::filter::BiquadChain;

/// Order of the anti-alias lowpass applied before decimation.
const ANTI_ALIAS_ORDER: usize = 8;

/// A uniformly sampled record from one sensor channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeSeriesChannel {
    pub name: String,
    pub start: DateTime<Utc>,
    /// Seconds between samples.
    pub interval: f64,
    pub samples: Vec<f64>,
}

/// Signed number of seconds from `from` to `to`.
pub fn seconds_between(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    let delta = to - from;
    delta
        .num_nanoseconds()
        .map(|ns| ns as f64 * 1e-9)
        .unwrap_or_else(|| delta.num_milliseconds() as f64 * 1e-3)
}

impl TimeSeriesChannel {
    pub fn new(
        name: impl Into<String>,
        start: DateTime<Utc>,
        interval: f64,
        samples: Vec<f64>,
    ) -> CalResult<Self> {
        let channel = Self {
            name: name.into(),
            start,
            interval,
            samples,
        };
        channel.validate()?;
        Ok(channel)
    }

    /// Build a channel from a sample rate instead of an interval.
    pub fn with_sample_rate(
        name: impl Into<String>,
        start: DateTime<Utc>,
        sample_rate: f64,
        samples: Vec<f64>,
    ) -> CalResult<Self> {
        if !(sample_rate.is_finite() && sample_rate > 0.0) {
            return Err(CalError::InvalidSignal(format!(
                "sample rate must be positive, got {}",
                sample_rate
            )));
        }
        Self::new(name, start, 1.0 / sample_rate, samples)
    }

    /// Check the invariants a deserialized channel may not satisfy.
    pub fn validate(&self) -> CalResult<()> {
        if !(self.interval.is_finite() && self.interval > 0.0) {
            return Err(CalError::InvalidSignal(format!(
                "{}: sample interval must be positive, got {}",
                self.name, self.interval
            )));
        }
        if self.samples.is_empty() {
            return Err(CalError::InsufficientData(format!("{}: no samples", self.name)));
        }
        if let Some(idx) = self.samples.iter().position(|s| !s.is_finite()) {
            return Err(CalError::InvalidSignal(format!(
                "{}: non-finite sample at index {}",
                self.name, idx
            )));
        }
        Ok(())
    }

    pub fn sample_rate(&self) -> f64 {
        1.0 / self.interval
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn time_at(&self, index: usize) -> DateTime<Utc> {
        self.start + Duration::nanoseconds((index as f64 * self.interval * 1e9).round() as i64)
    }

    pub fn end(&self) -> DateTime<Utc> {
        self.time_at(self.samples.len().saturating_sub(1))
    }

    /// Sample times as seconds since the Unix epoch, for plotting.
    pub fn epoch_seconds(&self) -> Vec<f64> {
        let origin = self.start.timestamp_micros() as f64 * 1e-6;
        (0..self.samples.len())
            .map(|i| origin + i as f64 * self.interval)
            .collect()
    }

    /// Keep only the samples whose timestamps fall inside `[start, end]`.
    pub fn trim(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> CalResult<Self> {
        if end < start {
            return Err(CalError::Configuration(format!(
                "trim window ends ({}) before it starts ({})",
                end, start
            )));
        }
        let from = (seconds_between(self.start, start) / self.interval - 1e-6).ceil().max(0.0);
        let to = (seconds_between(self.start, end) / self.interval + 1e-6).floor();
        let last = self.samples.len() as f64 - 1.0;
        if to < 0.0 || from > last || from > to {
            return Err(CalError::InsufficientData(format!(
                "{}: no samples between {} and {}",
                self.name, start, end
            )));
        }
        let (from, to) = (from as usize, to.min(last) as usize);
        debug!("Trimming {} to samples {}..={}", self.name, from, to);
        Ok(Self {
            name: self.name.clone(),
            start: self.time_at(from),
            interval: self.interval,
            samples: self.samples[from..=to].to_vec(),
        })
    }

    /// Keep at most the first `len` samples.
    pub fn truncate(&self, len: usize) -> Self {
        let mut out = self.clone();
        out.samples.truncate(len.max(1));
        out
    }

    /// Lowpass and decimate to `new_rate`. Upsampling is rejected.
    pub fn resample(&self, new_rate: f64) -> CalResult<Self> {
        let rate = self.sample_rate();
        if !(new_rate.is_finite() && new_rate > 0.0) {
            return Err(CalError::Configuration(format!(
                "invalid target sample rate {}",
                new_rate
            )));
        }
        if (new_rate - rate).abs() <= rate * 1e-9 {
            return Ok(self.clone());
        }
        if new_rate > rate {
            return Err(CalError::Configuration(format!(
                "{}: cannot upsample from {} Hz to {} Hz",
                self.name, rate, new_rate
            )));
        }

        let mut lowpass = BiquadChain::lowpass(ANTI_ALIAS_ORDER, 0.4 * new_rate, rate);
        let filtered = lowpass.filtfilt(&self.samples);

        let ratio = rate / new_rate;
        let samples: Vec<f64> = if (ratio - ratio.round()).abs() < 1e-9 {
            filtered.iter().step_by(ratio.round() as usize).copied().collect()
        } else {
            let count = ((filtered.len() - 1) as f64 / ratio).floor() as usize + 1;
            (0..count)
                .map(|i| {
                    let pos = i as f64 * ratio;
                    let idx = pos.floor() as usize;
                    let frac = pos - idx as f64;
                    match filtered.get(idx + 1) {
                        Some(&next) => filtered[idx] * (1.0 - frac) + next * frac,
                        None => filtered[idx],
                    }
                })
                .collect()
        };

        debug!(
            "Resampled {} from {} Hz to {} Hz ({} -> {} samples)",
            self.name,
            rate,
            new_rate,
            self.samples.len(),
            samples.len()
        );
        Ok(Self {
            name: self.name.clone(),
            start: self.start,
            interval: 1.0 / new_rate,
            samples,
        })
    }
}
