use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tracing::{debug, info};

use crate::channel::TimeSeriesChannel;
use crate::error::{CalError, CalResult};
use crate::response::ResponseModel;
use crate::settings::SpectralSettings;
use crate::spectral::{self, PsdResult};

/// Number of slots in a store.
pub const FILE_COUNT: usize = 9;

#[derive(Debug, Clone, Default)]
struct Slot {
    channel: Option<TimeSeriesChannel>,
    response: Option<ResponseModel>,
}

/// Channels and responses for one calibration run, with a per-slot PSD cache.
///
/// A store is owned by a single run; concurrent runs each get their own.
#[derive(Debug, Clone)]
pub struct DataStore {
    slots: Vec<Slot>,
    spectral: SpectralSettings,
    psd_cache: HashMap<usize, PsdResult>,
}

impl Default for DataStore {
    fn default() -> Self {
        Self::new(SpectralSettings::default())
    }
}

impl DataStore {
    pub fn new(spectral: SpectralSettings) -> Self {
        Self {
            slots: vec![Slot::default(); FILE_COUNT],
            spectral,
            psd_cache: HashMap::new(),
        }
    }

    pub fn spectral_settings(&self) -> &SpectralSettings {
        &self.spectral
    }

    fn check_index(idx: usize) -> CalResult<()> {
        if idx >= FILE_COUNT {
            return Err(CalError::Configuration(format!(
                "slot {} out of range (store has {} slots)",
                idx, FILE_COUNT
            )));
        }
        Ok(())
    }

    pub fn set_channel(&mut self, idx: usize, channel: TimeSeriesChannel) -> CalResult<()> {
        Self::check_index(idx)?;
        channel.validate()?;
        debug!("Slot {}: channel {} ({} samples)", idx, channel.name, channel.len());
        self.slots[idx].channel = Some(channel);
        self.psd_cache.remove(&idx);
        Ok(())
    }

    pub fn set_response(&mut self, idx: usize, response: ResponseModel) -> CalResult<()> {
        Self::check_index(idx)?;
        response.validate()?;
        debug!("Slot {}: response {}", idx, response.name);
        self.slots[idx].response = Some(response);
        self.psd_cache.remove(&idx);
        Ok(())
    }

    pub fn channel(&self, idx: usize) -> Option<&TimeSeriesChannel> {
        self.slots.get(idx).and_then(|s| s.channel.as_ref())
    }

    pub fn response(&self, idx: usize) -> Option<&ResponseModel> {
        self.slots.get(idx).and_then(|s| s.response.as_ref())
    }

    /// Channel in `idx` or an `InsufficientData` error naming the slot.
    pub fn require_channel(&self, idx: usize) -> CalResult<&TimeSeriesChannel> {
        self.channel(idx)
            .ok_or_else(|| CalError::InsufficientData(format!("slot {} has no channel", idx)))
    }

    pub fn require_response(&self, idx: usize) -> CalResult<&ResponseModel> {
        self.response(idx)
            .ok_or_else(|| CalError::InsufficientData(format!("slot {} has no response", idx)))
    }

    pub fn channel_is_set(&self, idx: usize) -> bool {
        self.channel(idx).is_some()
    }

    pub fn response_is_set(&self, idx: usize) -> bool {
        self.response(idx).is_some()
    }

    /// True when the slot holds both a channel and a response.
    pub fn both_components_set(&self, idx: usize) -> bool {
        self.channel_is_set(idx) && self.response_is_set(idx)
    }

    pub fn number_fully_loaded(&self) -> usize {
        (0..FILE_COUNT).filter(|&i| self.both_components_set(i)).count()
    }

    /// Slot index of the `x`-th fully loaded slot, counting from 1.
    pub fn xth_fully_loaded_index(&self, x: usize) -> Option<usize> {
        if x == 0 {
            return None;
        }
        (0..FILE_COUNT)
            .filter(|&i| self.both_components_set(i))
            .nth(x - 1)
    }

    fn loaded_channels_mut(&mut self) -> impl Iterator<Item = (usize, &mut TimeSeriesChannel)> {
        self.slots
            .iter_mut()
            .enumerate()
            .filter_map(|(i, s)| s.channel.as_mut().map(|c| (i, c)))
    }

    /// Trim every loaded channel to `[start, end]`.
    pub fn trim(&mut self, start: DateTime<Utc>, end: DateTime<Utc>) -> CalResult<()> {
        let mut trimmed = Vec::new();
        for (idx, channel) in self.loaded_channels_mut() {
            trimmed.push((idx, channel.trim(start, end)?));
        }
        for (idx, channel) in trimmed {
            self.slots[idx].channel = Some(channel);
        }
        self.psd_cache.clear();
        Ok(())
    }

    /// Trim every loaded channel to the window all of them cover, then cut them to a
    /// common length.
    pub fn trim_to_common(&mut self) -> CalResult<()> {
        let channels: Vec<&TimeSeriesChannel> = self.slots.iter().filter_map(|s| s.channel.as_ref()).collect();
        let start = channels.iter().map(|c| c.start).max();
        let end = channels.iter().map(|c| c.end()).min();
        let (Some(start), Some(end)) = (start, end) else {
            return Ok(());
        };
        if start > end {
            return Err(CalError::InsufficientData(format!(
                "loaded channels do not overlap (latest start {}, earliest end {})",
                start, end
            )));
        }
        self.trim(start, end)?;

        // Lengths are only comparable once every channel shares a rate
        let rates: Vec<f64> = self
            .slots
            .iter()
            .filter_map(|s| s.channel.as_ref().map(|c| c.sample_rate()))
            .collect();
        let shared_rate = rates.windows(2).all(|w| (w[0] - w[1]).abs() <= w[0] * 1e-9);
        if !shared_rate {
            info!("Trimmed channels to {} .. {}", start, end);
            return Ok(());
        }
        let min_len = self
            .slots
            .iter()
            .filter_map(|s| s.channel.as_ref().map(|c| c.len()))
            .min()
            .unwrap_or(0);
        for (_, channel) in self.loaded_channels_mut() {
            if channel.len() > min_len {
                *channel = channel.truncate(min_len);
            }
        }
        info!("Trimmed channels to {} .. {} ({} samples)", start, end, min_len);
        Ok(())
    }

    /// Resample every loaded channel to `rate`.
    pub fn resample(&mut self, rate: f64) -> CalResult<()> {
        let mut resampled = Vec::new();
        for (idx, channel) in self.loaded_channels_mut() {
            resampled.push((idx, channel.resample(rate)?));
        }
        for (idx, channel) in resampled {
            self.slots[idx].channel = Some(channel);
        }
        self.psd_cache.clear();
        Ok(())
    }

    /// Resample every loaded channel down to the lowest rate among them.
    pub fn match_sample_rates(&mut self) -> CalResult<()> {
        let lowest = self
            .slots
            .iter()
            .filter_map(|s| s.channel.as_ref().map(|c| c.sample_rate()))
            .fold(f64::INFINITY, f64::min);
        if lowest.is_finite() {
            self.resample(lowest)?;
        }
        Ok(())
    }

    pub fn is_psd_cached(&self, idx: usize) -> bool {
        self.psd_cache.contains_key(&idx)
    }

    /// Response-corrected power spectrum of a fully loaded slot, computed once per
    /// channel/response combination.
    pub fn psd(&mut self, idx: usize) -> CalResult<&PsdResult> {
        Self::check_index(idx)?;
        if !self.psd_cache.contains_key(&idx) {
            let channel = self.require_channel(idx)?;
            let response = self.require_response(idx)?;
            debug!("Computing PSD for slot {} ({})", idx, channel.name);
            let psd = spectral::cross_power(channel, channel, response, response, &self.spectral)?;
            self.psd_cache.insert(idx, psd);
        }
        self.psd_cache
            .get(&idx)
            .ok_or_else(|| CalError::InsufficientData(format!("slot {} has no PSD", idx)))
    }
}
