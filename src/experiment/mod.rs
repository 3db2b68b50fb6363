//! Calibration experiments and the contract they share.

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::channel::TimeSeriesChannel;
use crate::error::{CalError, CalResult, CalWarning};
use crate::response::ResponseModel;
use crate::settings::Settings;
use crate::store::DataStore;

pub mod noise;
pub mod noise_nine;
pub mod randomized;
pub mod sine;
pub mod step;

pub use noise::{self_noise, NoiseExperiment};
pub use noise_nine::NoiseNineExperiment;
pub use randomized::RandomizedExperiment;
pub use sine::{fit_sinusoid, SineExperiment};
pub use step::{detect_step, StepEdge, StepExperiment};

/// Which calibration to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExperimentKind {
    Randomized {
        #[serde(default)]
        low_frequency: bool,
    },
    Step,
    Sine,
    Noise {
        #[serde(default)]
        freq_space: bool,
    },
    /// Three three-component sensors in slots 0..=8.
    NoiseNine {
        #[serde(default)]
        freq_space: bool,
    },
}

impl ExperimentKind {
    pub fn name(&self) -> &'static str {
        match self {
            ExperimentKind::Randomized { low_frequency: true } => "randomized (low frequency)",
            ExperimentKind::Randomized { low_frequency: false } => "randomized (high frequency)",
            ExperimentKind::Step => "step",
            ExperimentKind::Sine => "sine",
            ExperimentKind::Noise { .. } => "self-noise",
            ExperimentKind::NoiseNine { .. } => "nine-input self-noise",
        }
    }

    pub fn build(&self, settings: &Settings) -> Box<dyn Experiment> {
        match *self {
            ExperimentKind::Randomized { low_frequency } => {
                Box::new(RandomizedExperiment::new(low_frequency, settings.randomized.clone()))
            }
            ExperimentKind::Step => Box::new(StepExperiment::new(settings.step.clone())),
            ExperimentKind::Sine => Box::new(SineExperiment::new(settings.sine.clone())),
            ExperimentKind::Noise { freq_space } => {
                Box::new(NoiseExperiment::new(freq_space, settings.noise.clone()))
            }
            ExperimentKind::NoiseNine { freq_space } => {
                Box::new(NoiseNineExperiment::new(freq_space, settings.noise.clone()))
            }
        }
    }
}

/// Receiver of human-readable status updates while an experiment runs.
pub trait ProgressObserver {
    fn notify(&self, status: &str);
}

impl ProgressObserver for tokio::sync::mpsc::UnboundedSender<String> {
    fn notify(&self, status: &str) {
        // Receiver may be gone; progress is informational only
        let _ = self.send(status.to_string());
    }
}

impl ProgressObserver for std::sync::mpsc::Sender<String> {
    fn notify(&self, status: &str) {
        let _ = self.send(status.to_string());
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NullObserver;

impl ProgressObserver for NullObserver {
    fn notify(&self, _status: &str) {}
}

/// Named XY points.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct XySeries {
    pub name: String,
    pub points: Vec<(f64, f64)>,
}

impl XySeries {
    pub fn new(name: impl Into<String>, points: Vec<(f64, f64)>) -> Self {
        Self {
            name: name.into(),
            points,
        }
    }

    pub fn from_xy(name: impl Into<String>, xs: &[f64], ys: &[f64]) -> Self {
        Self::new(name, xs.iter().copied().zip(ys.iter().copied()).collect())
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

/// Series drawn on one chart, with optional vertical markers on the x axis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeriesCollection {
    pub title: String,
    pub series: Vec<XySeries>,
    #[serde(default)]
    pub markers: Vec<f64>,
}

impl SeriesCollection {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            series: Vec::new(),
            markers: Vec::new(),
        }
    }

    pub fn push(&mut self, series: XySeries) {
        self.series.push(series);
    }

    pub fn with_marker(mut self, x: f64) -> Self {
        self.markers.push(x);
        self
    }

    pub fn get(&self, name: &str) -> Option<&XySeries> {
        self.series.iter().find(|s| s.name == name)
    }
}

/// Numeric outcome of an experiment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FitParameters {
    /// Interleaved re/im pole and zero coordinates.
    PoleZero {
        fit_poles: Vec<f64>,
        initial_poles: Vec<f64>,
        fit_zeros: Vec<f64>,
        initial_zeros: Vec<f64>,
        /// Upper edge of the fitted band, reported for high-frequency fits.
        max_fit_frequency: Option<f64>,
        initial_residual: f64,
        fit_residual: f64,
    },
    Step {
        corner_hz: f64,
        damping: f64,
        initial_corner_hz: f64,
        initial_damping: f64,
        initial_rms: f64,
        fit_rms: f64,
    },
    Sine {
        frequency_hz: f64,
        calibration_amplitude: f64,
        output_amplitude: f64,
        ratio: f64,
    },
    Noise,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FitResult {
    pub kind: ExperimentKind,
    pub parameters: FitParameters,
    pub fit_response: Option<ResponseModel>,
    pub initial_response: Option<ResponseModel>,
    pub plots: Vec<SeriesCollection>,
    pub warnings: Vec<CalWarning>,
    /// Names of the channels and responses the run used.
    pub data_names: Vec<String>,
    /// Short text lines for a report inset.
    pub summary: Vec<String>,
}

impl FitResult {
    pub fn plot(&self, title: &str) -> Option<&SeriesCollection> {
        self.plots.iter().find(|p| p.title == title)
    }
}

/// Shared contract for the calibration solvers.
pub trait Experiment: Send {
    fn kind(&self) -> ExperimentKind;

    /// Number of slots the experiment reads.
    fn blocks_needed(&self) -> usize;

    /// True when every slot the experiment reads holds what it needs.
    fn has_enough_data(&self, store: &DataStore) -> bool;

    fn validate(&self, store: &DataStore) -> CalResult<()> {
        if self.has_enough_data(store) {
            Ok(())
        } else {
            Err(CalError::InsufficientData(format!(
                "{} experiment needs {} loaded slots",
                self.kind().name(),
                self.blocks_needed()
            )))
        }
    }

    fn run(&self, store: &mut DataStore, progress: &dyn ProgressObserver) -> CalResult<FitResult>;
}

/// Build, validate and run one experiment over `store`.
pub fn run_experiment(
    kind: ExperimentKind,
    settings: &Settings,
    store: &mut DataStore,
    progress: &dyn ProgressObserver,
) -> CalResult<FitResult> {
    let experiment = kind.build(settings);
    experiment.validate(store)?;
    info!("Running {} experiment", kind.name());
    let result = experiment.run(store, progress)?;
    for warning in &result.warnings {
        warn!("{}: {}", kind.name(), warning);
    }
    info!("Finished {} experiment", kind.name());
    Ok(result)
}

/// Channels fed to one solver must share sample rate and length.
pub(crate) fn check_aligned(channels: &[&TimeSeriesChannel]) -> CalResult<()> {
    let Some(first) = channels.first() else {
        return Ok(());
    };
    for other in &channels[1..] {
        let rate_mismatch = (first.sample_rate() - other.sample_rate()).abs() > first.sample_rate() * 1e-9;
        if rate_mismatch || first.len() != other.len() {
            return Err(CalError::Configuration(format!(
                "channels {} ({} Hz, {} samples) and {} ({} Hz, {} samples) are not aligned; trim and resample first",
                first.name,
                first.sample_rate(),
                first.len(),
                other.name,
                other.sample_rate(),
                other.len()
            )));
        }
    }
    Ok(())
}

pub(crate) fn to_degrees(radians: f64) -> f64 {
    radians * 180.0 / std::f64::consts::PI
}

/// Amplitude in dB of a complex ratio.
pub(crate) fn amplitude_db(value: num_complex::Complex64) -> f64 {
    20.0 * value.norm().log10()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use num_complex::Complex64;
    use crate::response::Unit;

    fn channel(name: &str, rate: f64, len: usize) -> TimeSeriesChannel {
        TimeSeriesChannel::with_sample_rate(name, Utc::now(), rate, vec![0.5; len]).unwrap()
    }

    fn response() -> ResponseModel {
        ResponseModel::new("r", vec![], vec![Complex64::new(-1.0, 0.0)], Unit::Velocity)
    }

    #[test]
    fn test_has_enough_data_per_kind() {
        let settings = Settings::default();
        let mut store = DataStore::default();
        let kinds = [
            ExperimentKind::Randomized { low_frequency: false },
            ExperimentKind::Step,
            ExperimentKind::Sine,
            ExperimentKind::Noise { freq_space: false },
        ];
        for kind in kinds {
            assert!(!kind.build(&settings).has_enough_data(&store));
        }

        store.set_channel(0, channel("cal", 10.0, 100)).unwrap();
        store.set_channel(1, channel("out", 10.0, 100)).unwrap();
        assert!(ExperimentKind::Sine.build(&settings).has_enough_data(&store));
        assert!(!ExperimentKind::Step.build(&settings).has_enough_data(&store));

        store.set_response(1, response()).unwrap();
        assert!(ExperimentKind::Step.build(&settings).has_enough_data(&store));
        assert!(kinds[0].build(&settings).has_enough_data(&store));
        assert!(!kinds[3].build(&settings).has_enough_data(&store));

        store.set_response(0, response()).unwrap();
        store.set_channel(4, channel("c", 10.0, 100)).unwrap();
        store.set_response(4, response()).unwrap();
        assert!(kinds[3].build(&settings).has_enough_data(&store));
    }

    #[test]
    fn test_validate_reports_insufficient_data() {
        let store = DataStore::default();
        let experiment = ExperimentKind::Noise { freq_space: true }.build(&Settings::default());
        assert_eq!(experiment.blocks_needed(), 3);
        assert!(matches!(experiment.validate(&store), Err(CalError::InsufficientData(_))));
    }

    #[test]
    fn test_progress_channels() {
        let (tx, rx) = std::sync::mpsc::channel::<String>();
        tx.notify("working");
        assert_eq!(rx.recv().unwrap(), "working");

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<String>();
        tx.notify("still working");
        assert_eq!(rx.try_recv().unwrap(), "still working");
        drop(rx);
        tx.notify("nobody listening");
    }

    #[test]
    fn test_check_aligned() {
        let a = channel("a", 10.0, 100);
        let b = channel("b", 10.0, 100);
        let c = channel("c", 20.0, 100);
        let d = channel("d", 10.0, 99);
        assert!(check_aligned(&[&a, &b]).is_ok());
        assert!(matches!(check_aligned(&[&a, &c]), Err(CalError::Configuration(_))));
        assert!(matches!(check_aligned(&[&a, &d]), Err(CalError::Configuration(_))));
    }

    #[test]
    fn test_kind_serde() {
        let kind: ExperimentKind = serde_json::from_str(r#"{"type":"randomized","low_frequency":true}"#).unwrap();
        assert_eq!(kind, ExperimentKind::Randomized { low_frequency: true });
        let kind: ExperimentKind = serde_json::from_str(r#"{"type":"noise"}"#).unwrap();
        assert_eq!(kind, ExperimentKind::Noise { freq_space: false });
        let kind: ExperimentKind = serde_json::from_str(r#"{"type":"noise_nine","freq_space":true}"#).unwrap();
        assert_eq!(kind, ExperimentKind::NoiseNine { freq_space: true });
        assert_eq!(kind.build(&Settings::default()).blocks_needed(), 9);
        let kind: ExperimentKind = serde_json::from_str(r#"{"type":"step"}"#).unwrap();
        assert_eq!(kind, ExperimentKind::Step);
    }
}
