//! Three-sensor self-noise estimate.
//!
//! With three co-located sensors recording the same ground motion, the part of
//! each PSD that is not coherent with the other two is that sensor's own noise.

use num_complex::Complex64;
use tracing::info;

use super::{
    check_aligned, Experiment, ExperimentKind, FitParameters, FitResult, ProgressObserver, SeriesCollection,
    XySeries,
};
use crate::error::{CalError, CalResult};
use crate::noise_models::NoiseModel;
use crate::settings::NoiseSettings;
use crate::spectral::{self, PsdResult};
use crate::store::DataStore;

pub const NOISE_TITLE: &str = "Self-noise";

/// Per-bin noise of three sensors from their power and cross-power spectra.
///
/// `p13`, `p21` and `p23` are the cross spectra `Pᵢ·conj(Pⱼ)` of the named pairs.
pub fn self_noise(
    p11: Complex64,
    p22: Complex64,
    p33: Complex64,
    p13: Complex64,
    p21: Complex64,
    p23: Complex64,
) -> [Complex64; 3] {
    let n11 = p11 - p21 * p13 / p23;
    let n22 = p22 - p23.conj() * p21 / p13.conj();
    let n33 = p33 - p23 * p13.conj() / p21;
    [n11, n22, n33]
}

pub struct NoiseExperiment {
    freq_space: bool,
    settings: NoiseSettings,
}

impl NoiseExperiment {
    pub fn new(freq_space: bool, settings: NoiseSettings) -> Self {
        Self { freq_space, settings }
    }

    /// Plot abscissa for a bin, `None` for bins left off the plot.
    fn x_value(&self, freq: f64) -> Option<f64> {
        if freq <= 0.0 || 1.0 / freq > self.settings.max_plot_period {
            return None;
        }
        Some(if self.freq_space { freq } else { 1.0 / freq })
    }

    fn power_series(&self, name: String, psd: &PsdResult) -> XySeries {
        let points = psd
            .freqs
            .iter()
            .zip(psd.fft.iter())
            .skip(1)
            .filter_map(|(&f, p)| {
                let db = spectral::to_decibels(p.norm());
                self.x_value(f).filter(|_| db.is_finite()).map(|x| (x, db))
            })
            .collect();
        XySeries::new(name, points)
    }

    /// PSDs, self-noise curves and the NLNM/NHNM references for the three sensors in
    /// `indices`, plus the channel and response names used.
    pub(super) fn noise_collection(
        &self,
        store: &mut DataStore,
        indices: [usize; 3],
        title: &str,
        progress: &dyn ProgressObserver,
    ) -> CalResult<(SeriesCollection, Vec<String>)> {
        {
            let channels: Vec<_> = indices
                .iter()
                .map(|&idx| store.require_channel(idx))
                .collect::<CalResult<_>>()?;
            check_aligned(&channels)?;
        }

        let mut psds = Vec::with_capacity(3);
        let mut data_names = Vec::with_capacity(6);
        for &idx in &indices {
            progress.notify(&format!("Getting PSD of data {}...", idx + 1));
            psds.push(store.psd(idx)?.clone());
            data_names.push(store.require_channel(idx)?.name.clone());
            data_names.push(store.require_response(idx)?.name.clone());
        }

        let spectral_settings = *store.spectral_settings();
        let cross = |a: usize, b: usize| -> CalResult<PsdResult> {
            spectral::cross_power(
                store.require_channel(indices[a])?,
                store.require_channel(indices[b])?,
                store.require_response(indices[a])?,
                store.require_response(indices[b])?,
                &spectral_settings,
            )
        };
        progress.notify("Getting crosspower of series 1 & 3...");
        let c13 = cross(0, 2)?;
        progress.notify("Getting crosspower of series 2 & 1...");
        let c21 = cross(1, 0)?;
        progress.notify("Getting crosspower of series 2 & 3...");
        let c23 = cross(1, 2)?;

        let mut collection = SeriesCollection::new(title);
        let names: Vec<String> = indices
            .iter()
            .map(|&idx| store.require_channel(idx).map(|c| c.name.clone()))
            .collect::<CalResult<_>>()?;
        for (i, psd) in psds.iter().enumerate() {
            collection.push(self.power_series(format!("PSD {} [{}]", names[i], indices[i]), psd));
        }

        progress.notify("Doing noise estimation calculations...");
        let mut noise_points: [Vec<(f64, f64)>; 3] = Default::default();
        let freqs = &psds[0].freqs;
        for k in 1..freqs.len() {
            let Some(x) = self.x_value(freqs[k]) else {
                continue;
            };
            let noise = self_noise(
                psds[0].fft[k],
                psds[1].fft[k],
                psds[2].fft[k],
                c13.fft[k],
                c21.fft[k],
                c23.fft[k],
            );
            for (points, n) in noise_points.iter_mut().zip(noise.iter()) {
                let db = spectral::to_decibels(n.norm());
                if db.is_finite() {
                    points.push((x, db));
                }
            }
        }
        for (i, points) in noise_points.into_iter().enumerate() {
            collection.push(XySeries::new(format!("Noise {} [{}]", names[i], i), points));
        }

        for model in [NoiseModel::Low, NoiseModel::High] {
            collection.push(XySeries::new(model.label(), model.series(self.freq_space)));
        }
        info!(
            "{}: noise computed over {} frequency bins",
            title,
            freqs.len().saturating_sub(1)
        );
        Ok((collection, data_names))
    }
}

impl Experiment for NoiseExperiment {
    fn kind(&self) -> ExperimentKind {
        ExperimentKind::Noise {
            freq_space: self.freq_space,
        }
    }

    fn blocks_needed(&self) -> usize {
        3
    }

    fn has_enough_data(&self, store: &DataStore) -> bool {
        store.number_fully_loaded() >= 3
    }

    fn run(&self, store: &mut DataStore, progress: &dyn ProgressObserver) -> CalResult<FitResult> {
        let mut indices = [0usize; 3];
        for (i, slot) in indices.iter_mut().enumerate() {
            *slot = store.xth_fully_loaded_index(i + 1).ok_or_else(|| {
                CalError::InsufficientData(format!("self-noise needs 3 fully loaded slots, found {}", i))
            })?;
        }
        let (collection, data_names) = self.noise_collection(store, indices, NOISE_TITLE, progress)?;

        Ok(FitResult {
            kind: self.kind(),
            parameters: FitParameters::Noise,
            fit_response: None,
            initial_response: None,
            plots: vec![collection],
            warnings: Vec::new(),
            data_names,
            summary: Vec::new(),
        })
    }
}
