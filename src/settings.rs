use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::warn;

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
#[serde(rename_all = "lowercase")]
pub struct Settings {
    #[serde(alias = "LOGGING")]
    pub logging: LoggingSettings,
    #[serde(alias = "SPECTRAL")]
    pub spectral: SpectralSettings,
    #[serde(alias = "RANDOMIZED")]
    pub randomized: RandomizedSettings,
    #[serde(alias = "STEP")]
    pub step: StepSettings,
    #[serde(alias = "SINE")]
    pub sine: SineSettings,
    #[serde(alias = "NOISE")]
    pub noise: NoiseSettings,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "lowercase")]
pub struct LoggingSettings {
    #[serde(alias = "LEVEL")]
    pub level: String,
}

/// Welch averaging parameters shared by every experiment.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq)]
#[serde(rename_all = "lowercase")]
pub struct SpectralSettings {
    /// Segment length as a fraction of the record length.
    #[serde(alias = "WINDOW_FRACTION")]
    pub window_fraction: f64,
    /// Fraction of each segment shared with the next one (0.75 = quarter-window step).
    #[serde(alias = "OVERLAP")]
    pub overlap: f64,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "lowercase")]
pub struct RandomizedSettings {
    #[serde(alias = "LOW_FREQUENCY_CUTOFF_HZ")]
    pub low_frequency_cutoff_hz: f64,
    #[serde(alias = "LOW_BAND_MIN_HZ")]
    pub low_band_min_hz: f64,
    #[serde(alias = "HIGH_BAND_MIN_HZ")]
    pub high_band_min_hz: f64,
    #[serde(alias = "MAX_FIT_NYQUIST_FRACTION")]
    pub max_fit_nyquist_fraction: f64,
    #[serde(alias = "POINTS_PER_DECADE")]
    pub points_per_decade: usize,
    #[serde(alias = "MAX_ITERATIONS")]
    pub max_iterations: usize,
    #[serde(alias = "LOW_FREQUENCY_RESAMPLE_HZ")]
    pub low_frequency_resample_hz: f64,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "lowercase")]
pub struct StepSettings {
    #[serde(alias = "EDGE_THRESHOLD")]
    pub edge_threshold: f64,
    #[serde(alias = "MIN_EDGE_SNR")]
    pub min_edge_snr: f64,
    #[serde(alias = "LEAD_SECONDS")]
    pub lead_seconds: f64,
    #[serde(alias = "MAX_ITERATIONS")]
    pub max_iterations: usize,
    #[serde(alias = "REPORT_POINTS_PER_DECADE")]
    pub report_points_per_decade: usize,
    #[serde(alias = "REPORT_MIN_HZ")]
    pub report_min_hz: f64,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "lowercase")]
pub struct SineSettings {
    #[serde(alias = "REFINE_ITERATIONS")]
    pub refine_iterations: usize,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "lowercase")]
pub struct NoiseSettings {
    #[serde(alias = "MAX_PLOT_PERIOD")]
    pub max_plot_period: f64,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Default for SpectralSettings {
    fn default() -> Self {
        Self {
            window_fraction: 0.25,
            overlap: 0.75,
        }
    }
}

impl Default for RandomizedSettings {
    fn default() -> Self {
        Self {
            low_frequency_cutoff_hz: 1.0,
            low_band_min_hz: 0.001,
            high_band_min_hz: 0.2,
            max_fit_nyquist_fraction: 0.8,
            points_per_decade: 40,
            max_iterations: 200,
            low_frequency_resample_hz: 10.0,
        }
    }
}

impl Default for StepSettings {
    fn default() -> Self {
        Self {
            edge_threshold: 0.5,
            min_edge_snr: 10.0,
            lead_seconds: 1.0,
            max_iterations: 200,
            report_points_per_decade: 20,
            report_min_hz: 0.001,
        }
    }
}

impl Default for SineSettings {
    fn default() -> Self {
        Self {
            refine_iterations: 40,
        }
    }
}

impl Default for NoiseSettings {
    fn default() -> Self {
        Self {
            max_plot_period: 5.0e5,
        }
    }
}

impl Settings {
    pub fn new(config_path: Option<PathBuf>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder();

        // 1. Load defaults
        let default_settings = Settings::default();
        builder = builder.add_source(config::Config::try_from(&default_settings)?);

        // 2. Load from file if specified
        if let Some(path) = config_path {
            if path.exists() {
                builder = builder.add_source(File::from(path));
            } else {
                warn!("Configuration file not found: {:?}", path);
            }
        } else if let Some(home) = dirs::home_dir() {
            let toml_path = home.join(".sensorcal").join("settings.toml");
            let yaml_path = home.join(".sensorcal").join("settings.yaml");

            if toml_path.exists() {
                builder = builder.add_source(File::from(toml_path));
            } else if yaml_path.exists() {
                builder = builder.add_source(File::from(yaml_path));
            }
        }

        // 3. Environment variables
        builder = builder.add_source(
            Environment::with_prefix("SENSORCAL")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;

        if let Ok(table) = config.clone().try_deserialize::<serde_json::Value>()
            && let Some(map) = table.as_object()
        {
            let known_sections = ["logging", "spectral", "randomized", "step", "sine", "noise"];
            for key in map.keys() {
                let lower_key = key.to_lowercase();
                if !known_sections.contains(&lower_key.as_str()) {
                    warn!("Unknown configuration section: {}", key);
                }
            }
        }

        config.try_deserialize()
    }

    pub fn dump(&self, format: &str) -> Result<String, Box<dyn std::error::Error>> {
        match format.to_lowercase().as_str() {
            "toml" => Ok(toml::to_string_pretty(self)?),
            "yaml" | "yml" => Ok(serde_yaml::to_string(self)?),
            _ => Err("Unsupported format".into()),
        }
    }
}
