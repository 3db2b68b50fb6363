mod lm;

pub use lm::{levenberg_marquardt, LmConfig, LmOutcome};
