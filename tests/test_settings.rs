use sensorcal::settings::Settings;
use std::fs;
use tempfile::tempdir;

#[test]
fn test_dump_and_reload_toml() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("dumped.toml");

    let mut settings = Settings::default();
    settings.randomized.points_per_decade = 33;
    settings.randomized.low_frequency_resample_hz = 5.0;
    fs::write(&path, settings.dump("toml").unwrap()).unwrap();

    let reloaded = Settings::new(Some(path)).unwrap();
    assert_eq!(reloaded.randomized, settings.randomized);
    assert_eq!(reloaded.spectral, settings.spectral);
}

#[test]
fn test_dump_and_reload_yaml() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("dumped.yaml");

    let mut settings = Settings::default();
    settings.sine.refine_iterations = 12;
    fs::write(&path, settings.dump("yaml").unwrap()).unwrap();

    let reloaded = Settings::new(Some(path)).unwrap();
    assert_eq!(reloaded.sine.refine_iterations, 12);
    assert_eq!(reloaded.noise, settings.noise);
}

#[test]
fn test_environment_overrides_file() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("settings.toml");
    fs::write(&path, "[step]\nmin_edge_snr = 4.0\nlead_seconds = 2.5\n").unwrap();

    // Only this test touches the environment in this binary
    unsafe { std::env::set_var("SENSORCAL__STEP__MIN_EDGE_SNR", "12.5") };
    let settings = Settings::new(Some(path)).unwrap();
    unsafe { std::env::remove_var("SENSORCAL__STEP__MIN_EDGE_SNR") };

    assert_eq!(settings.step.min_edge_snr, 12.5);
    assert_eq!(settings.step.lead_seconds, 2.5);
    assert_eq!(settings.step.edge_threshold, 0.5);
}

#[test]
fn test_missing_file_falls_back_to_defaults() {
    let dir = tempdir().unwrap();
    let settings = Settings::new(Some(dir.path().join("absent.toml"))).unwrap();
    assert_eq!(settings.spectral, Settings::default().spectral);
    assert_eq!(settings.randomized, Settings::default().randomized);
}
