pub mod channel;
pub mod error;
pub mod experiment;
pub mod filter;
pub mod noise_models;
pub mod request;
pub mod response;
pub mod settings;
pub mod solver;
pub mod spectral;
pub mod store;

pub use channel::TimeSeriesChannel;
pub use error::{CalError, CalResult, CalWarning};
pub use experiment::{run_experiment, Experiment, ExperimentKind, FitParameters, FitResult, ProgressObserver};
pub use request::CalibrationRequest;
pub use response::{FitSelection, ResponseModel, TransferFunction, Unit};
pub use store::DataStore;
