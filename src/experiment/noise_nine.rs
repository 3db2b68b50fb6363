//! Self-noise of three three-component sensors.
//!
//! Slots 0..=2 hold the north, east and vertical channels of sensor 1, slots 3..=5
//! those of sensor 2 and slots 6..=8 those of sensor 3. Each axis is estimated on its
//! own with the three-sensor decomposition. Horizontals are taken as recorded, so the
//! sensors are expected to be co-aligned.

use tracing::info;

use super::noise::{NoiseExperiment, NOISE_TITLE};
use super::{check_aligned, Experiment, ExperimentKind, FitParameters, FitResult, ProgressObserver};
use crate::error::CalResult;
use crate::settings::NoiseSettings;
use crate::store::DataStore;

pub const AXES: [&str; 3] = ["north", "east", "vertical"];

/// Sensors per axis.
const SENSORS: usize = 3;

/// Chart title for an axis, e.g. `Self-noise (east)`.
pub fn axis_title(axis: usize) -> String {
    format!("{} ({})", NOISE_TITLE, AXES[axis])
}

/// Store slots read for one axis, sensor 1 first.
pub fn axis_slots(axis: usize) -> [usize; 3] {
    [axis, axis + SENSORS, axis + 2 * SENSORS]
}

pub struct NoiseNineExperiment {
    triple: NoiseExperiment,
    freq_space: bool,
}

impl NoiseNineExperiment {
    pub fn new(freq_space: bool, settings: NoiseSettings) -> Self {
        Self {
            triple: NoiseExperiment::new(freq_space, settings),
            freq_space,
        }
    }
}

impl Experiment for NoiseNineExperiment {
    fn kind(&self) -> ExperimentKind {
        ExperimentKind::NoiseNine {
            freq_space: self.freq_space,
        }
    }

    fn blocks_needed(&self) -> usize {
        AXES.len() * SENSORS
    }

    fn has_enough_data(&self, store: &DataStore) -> bool {
        (0..self.blocks_needed()).all(|idx| store.both_components_set(idx))
    }

    fn run(&self, store: &mut DataStore, progress: &dyn ProgressObserver) -> CalResult<FitResult> {
        {
            let channels: Vec<_> = (0..self.blocks_needed())
                .map(|idx| store.require_channel(idx))
                .collect::<CalResult<_>>()?;
            check_aligned(&channels)?;
        }

        let mut plots = Vec::with_capacity(AXES.len());
        let mut data_names = Vec::with_capacity(2 * self.blocks_needed());
        for (axis, name) in AXES.iter().enumerate() {
            progress.notify(&format!("Computing {} self-noise...", name));
            let title = axis_title(axis);
            let (collection, names) = self.triple.noise_collection(store, axis_slots(axis), &title, progress)?;
            plots.push(collection);
            data_names.extend(names);
        }
        info!("Nine-input self-noise computed for {} axes", plots.len());

        Ok(FitResult {
            kind: self.kind(),
            parameters: FitParameters::Noise,
            fit_response: None,
            initial_response: None,
            plots,
            warnings: Vec::new(),
            data_names,
            summary: Vec::new(),
        })
    }
}
