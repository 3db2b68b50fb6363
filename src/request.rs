//! Serialized calibration request: decoded channels and responses plus the
//! experiment to run on them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::channel::TimeSeriesChannel;
use crate::error::CalResult;
use crate::experiment::{run_experiment, ExperimentKind, FitResult, ProgressObserver};
use crate::response::ResponseModel;
use crate::settings::Settings;
use crate::store::DataStore;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlotInput {
    pub index: usize,
    #[serde(default)]
    pub channel: Option<TimeSeriesChannel>,
    #[serde(default)]
    pub response: Option<ResponseModel>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationRequest {
    pub experiment: ExperimentKind,
    pub slots: Vec<SlotInput>,
    /// Explicit analysis window; the common overlap of all channels otherwise.
    #[serde(default)]
    pub window: Option<TimeWindow>,
    /// Target sample rate for every channel.
    #[serde(default)]
    pub resample_hz: Option<f64>,
}

impl CalibrationRequest {
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Populate, align and resample a store for this request.
    ///
    /// Channels are trimmed to `window` (or to their common overlap) and then
    /// brought to one sample rate: `resample_hz` if given, the configured low
    /// frequency rate for low-frequency randomized runs on faster data, and
    /// the lowest channel rate otherwise.
    pub fn into_store(self, settings: &Settings) -> CalResult<(ExperimentKind, DataStore)> {
        let mut store = DataStore::new(settings.spectral);
        for slot in self.slots {
            if let Some(channel) = slot.channel {
                store.set_channel(slot.index, channel)?;
            }
            if let Some(response) = slot.response {
                store.set_response(slot.index, response)?;
            }
        }

        match self.window {
            Some(window) => store.trim(window.start, window.end)?,
            None => store.trim_to_common()?,
        }

        let low_frequency_rate = settings.randomized.low_frequency_resample_hz;
        let slowest = (0..crate::store::FILE_COUNT)
            .filter_map(|i| store.channel(i).map(|c| c.sample_rate()))
            .fold(f64::INFINITY, f64::min);
        match (self.resample_hz, self.experiment) {
            (Some(rate), _) => store.resample(rate)?,
            (None, ExperimentKind::Randomized { low_frequency: true }) if slowest > low_frequency_rate => {
                info!("Resampling to {} Hz for low-frequency calibration", low_frequency_rate);
                store.resample(low_frequency_rate)?
            }
            _ => store.match_sample_rates()?,
        }
        // Decimation can leave channels one sample apart
        store.trim_to_common()?;

        Ok((self.experiment, store))
    }

    pub fn run(self, settings: &Settings, progress: &dyn ProgressObserver) -> CalResult<FitResult> {
        let (kind, mut store) = self.into_store(settings)?;
        run_experiment(kind, settings, &mut store, progress)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::experiment::NullObserver;
    use crate::experiment::FitParameters;

    fn request_json() -> String {
        let samples: Vec<String> = (0..2000)
            .map(|i| format!("{}", 3.0 * (2.0 * std::f64::consts::PI * 0.5 * i as f64 / 20.0).sin()))
            .collect();
        let output: Vec<String> = (0..2000)
            .map(|i| format!("{}", 1.5 * (2.0 * std::f64::consts::PI * 0.5 * i as f64 / 20.0).sin()))
            .collect();
        format!(
            r#"{{
                "experiment": {{ "type": "sine" }},
                "slots": [
                    {{ "index": 0, "channel": {{ "name": "IU.ANMO.00.BC0", "start": "2024-03-01T00:00:00Z", "interval": 0.05, "samples": [{}] }} }},
                    {{ "index": 1, "channel": {{ "name": "IU.ANMO.00.BHZ", "start": "2024-03-01T00:00:00Z", "interval": 0.05, "samples": [{}] }} }}
                ]
            }}"#,
            samples.join(","),
            output.join(",")
        )
    }

    #[test]
    fn test_parse_and_run_sine_request() {
        let request = CalibrationRequest::from_json(&request_json()).unwrap();
        assert_eq!(request.experiment, ExperimentKind::Sine);
        assert_eq!(request.slots.len(), 2);
        assert!(request.window.is_none());

        let result = request.run(&Settings::default(), &NullObserver).unwrap();
        match result.parameters {
            FitParameters::Sine { frequency_hz, ratio, .. } => {
                assert!((frequency_hz - 0.5).abs() < 1e-3);
                assert!((ratio - 2.0).abs() < 1e-3);
            }
            other => panic!("unexpected parameters {:?}", other),
        }
    }

    #[test]
    fn test_bad_slot_index() {
        let mut request = CalibrationRequest::from_json(&request_json()).unwrap();
        request.slots[1].index = 42;
        assert!(request.into_store(&Settings::default()).is_err());
    }
}
