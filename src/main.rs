use clap::Parser;
use sensorcal::CalibrationRequest;
use sensorcal::settings::Settings;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, reload, EnvFilter, Registry};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to a TOML or YAML settings file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Print the effective settings in the given format (toml or yaml) and exit
    #[arg(long)]
    dump_config: Option<String>,

    /// Directory for result files (defaults to each request's directory)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Calibration request JSON files
    requests: Vec<PathBuf>,
}

fn result_path(request: &Path, output: Option<&Path>) -> PathBuf {
    let stem = request
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "request".to_string());
    let dir = output
        .map(Path::to_path_buf)
        .or_else(|| request.parent().map(Path::to_path_buf))
        .unwrap_or_default();
    dir.join(format!("{}.result.json", stem))
}

/// Filter from `RUST_LOG`, or `level` when it is unset or invalid.
fn log_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
}

type FilterHandle = reload::Handle<EnvFilter, Registry>;

/// Reloadable filter, so the configured level can apply once settings are loaded.
fn filter_layer(filter: EnvFilter) -> (reload::Layer<EnvFilter, Registry>, FilterHandle) {
    reload::Layer::new(filter)
}

/// Log each progress line under `label` until every sender is gone.
fn relay(label: String, mut progress_rx: mpsc::UnboundedReceiver<String>) -> JoinHandle<usize> {
    tokio::spawn(async move {
        let mut relayed = 0;
        while let Some(status) = progress_rx.recv().await {
            tracing::info!("[{}] {}", label, status);
            relayed += 1;
        }
        relayed
    })
}

fn process(
    path: &Path,
    output: Option<&Path>,
    settings: &Settings,
    progress: &mpsc::UnboundedSender<String>,
) -> Result<PathBuf, Box<dyn std::error::Error + Send + Sync>> {
    let text = std::fs::read_to_string(path)?;
    let request = CalibrationRequest::from_json(&text)?;
    let result = request.run(settings, progress)?;
    let destination = result_path(path, output);
    std::fs::write(&destination, serde_json::to_string_pretty(&result)?)?;
    Ok(destination)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let (filter, filter_handle) = filter_layer(log_filter("info"));
    tracing_subscriber::registry().with(filter).with(fmt::layer()).init();

    let settings = Settings::new(args.config.clone())?;
    if std::env::var_os("RUST_LOG").is_none() {
        filter_handle.reload(EnvFilter::new(&settings.logging.level))?;
    }

    if let Some(format) = args.dump_config {
        println!("{}", settings.dump(&format)?);
        return Ok(());
    }

    if args.requests.is_empty() {
        tracing::warn!("No calibration requests given");
        return Ok(());
    }

    let settings = Arc::new(settings);
    let output = args.output.map(Arc::new);
    let mut handles = Vec::with_capacity(args.requests.len());
    let mut relays = Vec::with_capacity(args.requests.len());

    for path in args.requests {
        let (progress_tx, progress_rx) = mpsc::unbounded_channel::<String>();
        let name = path.display().to_string();
        relays.push(relay(name.clone(), progress_rx));

        let settings = settings.clone();
        let output = output.clone();
        let handle = tokio::task::spawn_blocking(move || {
            process(&path, output.as_deref().map(PathBuf::as_path), &settings, &progress_tx)
        });
        handles.push((name, handle));
    }

    let total = handles.len();
    let mut failed = 0;
    for (name, handle) in handles {
        match handle.await {
            Ok(Ok(destination)) => tracing::info!("{}: result written to {}", name, destination.display()),
            Ok(Err(e)) => {
                failed += 1;
                tracing::error!("{}: {}", name, e);
            }
            Err(e) => {
                failed += 1;
                tracing::error!("{}: calibration task failed: {}", name, e);
            }
        }
    }
    // Senders dropped with their solvers; drain what is left
    for task in relays {
        if let Err(e) = task.await {
            tracing::warn!("Progress relay failed: {}", e);
        }
    }
    tracing::info!("Processed {} requests ({} failed)", total, failed);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_result_path() {
        let path = result_path(Path::new("/data/cal/anmo_step.json"), None);
        assert_eq!(path, PathBuf::from("/data/cal/anmo_step.result.json"));
        let path = result_path(Path::new("anmo_step.json"), Some(Path::new("/tmp/out")));
        assert_eq!(path, PathBuf::from("/tmp/out/anmo_step.result.json"));
    }

    #[derive(Clone, Default)]
    struct Captured(std::sync::Arc<std::sync::Mutex<Vec<u8>>>);

    impl std::io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl Captured {
        fn text(&self) -> String {
            String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
        }
    }

    #[test]
    fn test_settings_warnings_reach_the_log() {
        let captured = Captured::default();
        let writer = captured.clone();
        let (filter, handle) = filter_layer(EnvFilter::new("info"));
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_ansi(false).with_writer(move || writer.clone()));

        tracing::subscriber::with_default(subscriber, || {
            let missing = PathBuf::from("/nonexistent/sensorcal/settings.toml");
            Settings::new(Some(missing)).unwrap();
            assert!(captured.text().contains("Configuration file not found"));

            handle.reload(EnvFilter::new("error")).unwrap();
            tracing::warn!("suppressed after reload");
            assert!(!captured.text().contains("suppressed after reload"));
        });
    }

    #[tokio::test]
    async fn test_relay_drains_after_sender_drops() {
        let (tx, rx) = mpsc::unbounded_channel::<String>();
        let handle = relay("anmo".to_string(), rx);
        let solver = tokio::task::spawn_blocking(move || {
            for i in 0..5 {
                tx.send(format!("step {}", i)).unwrap();
            }
        });
        solver.await.unwrap();
        assert_eq!(handle.await.unwrap(), 5);
    }
}
