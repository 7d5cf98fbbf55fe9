/// Common test utilities and helpers for integration tests
use std::path::PathBuf;

use anyhow::Result;
use common::config::{CONFIG_FILE, Configuration};
use tempfile::TempDir;

pub mod fixtures;
pub mod generators;

/// Write `contents` as the configuration file of a fresh temporary directory
/// and load it.
pub fn load_test_config(contents: &str) -> Result<(Configuration, TempDir)> {
    let temp_dir = TempDir::new()?;
    let path: PathBuf = temp_dir.path().join(CONFIG_FILE);
    std::fs::write(&path, contents)?;
    let config = Configuration::load_from_path(&path).map_err(|e| anyhow::anyhow!("{e}"))?;
    Ok((config, temp_dir))
}

/// Initialize test logging
pub fn init_test_logging() {
    common::logging::init_test_logging();
}
