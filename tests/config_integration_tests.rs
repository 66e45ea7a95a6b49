//! Integration tests for ConfigManager and configuration file handling
//!
//! These tests verify:
//! - Configuration loading and saving
//! - Default configuration generation
//! - Legacy run file fallback
//! - Configuration validation
//! - Integration with TestController

use camino::Utf8PathBuf;
use epdtrial::models::{ConfigError, RefreshMode, RunConfig, Settings, TransformParams};
use epdtrial::services::{
    DisplayAdapter, MemoryImageSource, VirtualDisplay, create_transform_pipeline,
};
use epdtrial::{ConfigManager, RunState, TestController};
use image::GrayImage;
use std::fs;
use std::time::Duration;
use tempfile::TempDir;

fn create_test_config_dir() -> (TempDir, Utf8PathBuf) {
    let temp_dir = TempDir::new().unwrap();
    let config_path = Utf8PathBuf::try_from(temp_dir.path().to_path_buf()).unwrap();
    (temp_dir, config_path)
}

#[test]
fn test_create_config_manager() {
    let (_temp_dir, config_path) = create_test_config_dir();
    let manager = ConfigManager::new(&config_path).unwrap();

    assert_eq!(manager.config_dir(), config_path.as_path());
}

#[test]
fn test_load_default_settings() {
    let (_temp_dir, config_path) = create_test_config_dir();
    let manager = ConfigManager::new(&config_path).unwrap();

    // Settings file doesn't exist, should return defaults
    let settings = manager.load_settings().unwrap();

    assert!(!settings.display.virtual_display);
    assert_eq!((settings.display.width, settings.display.height), (800, 600));
    assert_eq!(settings.controller.stop_grace, Duration::from_millis(100));
    assert_eq!(settings.logging.log_prefix, "epdtrial");
}

#[test]
fn test_partial_settings_fill_defaults() {
    let (_temp_dir, config_path) = create_test_config_dir();
    fs::write(
        config_path.join("Trial Settings.yaml"),
        "display:\n  virtual: true\n  refresh_mode: A2\ncontroller:\n  render_timeout: 2.5\n",
    )
    .unwrap();

    let settings = ConfigManager::new(&config_path)
        .unwrap()
        .load_settings()
        .unwrap();

    assert!(settings.display.virtual_display);
    assert_eq!(settings.display.refresh_mode, RefreshMode::A2);
    assert_eq!(settings.display.width, 800);
    assert_eq!(
        settings.controller.render_timeout,
        Some(Duration::from_millis(2500))
    );
    assert_eq!(settings.controller.max_delay_chunks, 10);
}

#[test]
fn test_save_and_reload_run_config() {
    let (_temp_dir, config_path) = create_test_config_dir();
    let manager = ConfigManager::new(&config_path).unwrap();

    let config = RunConfig::new(["one.png", "two.png"])
        .with_delay(Duration::from_millis(750))
        .with_repetitions(2)
        .with_transform("rotate", TransformParams::new().with("angle", 15.0))
        .with_transform("mirror", TransformParams::new().with("horizontal", true));
    manager.save_run_config(&config).unwrap();

    let loaded = manager.load_run_config().unwrap();
    assert_eq!(loaded, config);
    let names: Vec<&str> = loaded.transformations.keys().map(String::as_str).collect();
    assert_eq!(names, ["rotate", "mirror"]);
}

#[test]
fn test_yaml_preferred_over_legacy_json() {
    let (_temp_dir, config_path) = create_test_config_dir();
    fs::write(
        config_path.join("Trial Run.json"),
        r#"{"image_paths": ["old.png"]}"#,
    )
    .unwrap();
    fs::write(config_path.join("Trial Run.yaml"), "image_paths: [new.png]\n").unwrap();

    let loaded = ConfigManager::new(&config_path)
        .unwrap()
        .load_run_config()
        .unwrap();

    assert_eq!(loaded.image_paths, [Utf8PathBuf::from("new.png")]);
}

#[test]
fn test_invalid_run_config_errors() {
    let (_temp_dir, config_path) = create_test_config_dir();
    fs::write(
        config_path.join("Trial Run.yaml"),
        "image_paths: [a.png]\nrepetitions: many\n",
    )
    .unwrap();

    let result = ConfigManager::new(&config_path).unwrap().load_run_config();
    assert!(result.is_err());
}

#[test]
fn test_loaded_empty_config_fails_validation() {
    let (_temp_dir, config_path) = create_test_config_dir();
    fs::write(config_path.join("Trial Run.yaml"), "image_paths: []\n").unwrap();

    let loaded = ConfigManager::new(&config_path)
        .unwrap()
        .load_run_config()
        .unwrap();

    assert_eq!(loaded.validate(), Err(ConfigError::NoImages));
}

#[test]
fn test_settings_round_trip_through_file() {
    let (_temp_dir, config_path) = create_test_config_dir();
    let manager = ConfigManager::new(&config_path).unwrap();

    let mut settings = Settings::default();
    settings.display.rotation = 270;
    settings.display.mirror = true;
    settings.logging.debug = true;
    manager.save_settings(&settings).unwrap();

    let contents = fs::read_to_string(config_path.join("Trial Settings.yaml")).unwrap();
    assert!(contents.contains("virtual: false"));
    assert_eq!(manager.load_settings().unwrap(), settings);
}

#[tokio::test]
async fn test_loaded_config_drives_controller() {
    let (_temp_dir, config_path) = create_test_config_dir();
    fs::write(
        config_path.join("Trial Run.yaml"),
        "image_paths: [a.png, b.png]\ndelay_between_images: 0\nrepetitions: 2\n",
    )
    .unwrap();

    let manager = ConfigManager::new(&config_path).unwrap();
    let settings = manager.load_settings().unwrap();
    let run_config = manager.load_run_config().unwrap();

    let images = MemoryImageSource::new()
        .with_image("a.png", GrayImage::new(16, 16))
        .with_image("b.png", GrayImage::new(16, 16));
    let controller = TestController::new(images, settings.controller);
    let (width, height) = (settings.display.width, settings.display.height);
    assert!(
        controller
            .initialize(
                move || Box::new(VirtualDisplay::new(width, height)) as Box<dyn DisplayAdapter>,
                create_transform_pipeline,
            )
            .await
    );

    let result = controller.run_test(&run_config).await;

    assert!(result.success);
    assert_eq!(result.total_images, 4);
    assert_eq!(controller.state(), RunState::Completed);
}
