// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Configuration management for the wear tracker

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// SQLite connection string
    pub database_url: String,
    /// Directory holding imported telemetry files
    pub activities_dir: String,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = dirs::data_dir()
            .map(|p| p.join("velo-wear"))
            .unwrap_or_else(|| ".".into());
        Self {
            database_url: format!("sqlite:{}", data_dir.join("velo-wear.db").display()),
            activities_dir: data_dir.join("activities").to_string_lossy().to_string(),
        }
    }
}

impl Config {
    pub fn load(path: Option<String>) -> Result<Self> {
        let config_path = path.unwrap_or_else(|| {
            dirs::config_dir()
                .map(|p| p.join("velo-wear/config.toml"))
                .unwrap_or_else(|| "config.toml".into())
                .to_string_lossy()
                .to_string()
        });

        if Path::new(&config_path).exists() {
            let content = fs::read_to_string(&config_path)
                .context("Failed to read config file")?;
            toml::from_str(&content)
                .context("Failed to parse config file")
        } else {
            dotenv::dotenv().ok();

            let mut config = Config::default();
            if let Ok(url) = std::env::var("VELO_WEAR_DATABASE_URL") {
                config.database_url = url;
            }
            if let Ok(dir) = std::env::var("VELO_WEAR_ACTIVITIES_DIR") {
                config.activities_dir = dir;
            }
            Ok(config)
        }
    }

    #[allow(dead_code)]
    pub fn save(&self, path: Option<String>) -> Result<()> {
        let config_path = path.unwrap_or_else(|| {
            dirs::config_dir()
                .map(|p| p.join("velo-wear/config.toml"))
                .unwrap_or_else(|| "config.toml".into())
                .to_string_lossy()
                .to_string()
        });

        let parent = Path::new(&config_path).parent()
            .context("Invalid config path")?;
        fs::create_dir_all(parent)?;

        let content = toml::to_string_pretty(self)?;
        fs::write(&config_path, content)?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_temp_config_file(content: &str) -> (TempDir, String) {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let config_path = temp_dir.path().join("config.toml");
        fs::write(&config_path, content).expect("Failed to write temp config");
        (temp_dir, config_path.to_string_lossy().to_string())
    }

    #[test]
    fn test_config_load_from_file() {
        let config_content = r#"
database_url = "sqlite:/tmp/wear.db"
activities_dir = "/tmp/activities"
"#;
        let (_temp_dir, config_path) = create_temp_config_file(config_content);

        let config = Config::load(Some(config_path)).expect("Failed to load config");
        assert_eq!(config.database_url, "sqlite:/tmp/wear.db");
        assert_eq!(config.activities_dir, "/tmp/activities");
    }

    #[test]
    fn test_config_load_missing_file_falls_back_to_defaults() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let nonexistent = temp_dir.path().join("nonexistent_config.toml");

        let config = Config::load(Some(nonexistent.to_string_lossy().to_string()))
            .expect("Failed to load default config");
        assert!(config.database_url.starts_with("sqlite:"));
        assert!(!config.activities_dir.is_empty());
    }

    #[test]
    fn test_config_load_invalid_toml() {
        let invalid_toml = "this is not valid toml [[[";
        let (_temp_dir, config_path) = create_temp_config_file(invalid_toml);

        let result = Config::load(Some(config_path));
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("Failed to parse config file"));
    }

    #[test]
    fn test_config_save_creates_directory() {
        let config = Config {
            database_url: "sqlite::memory:".to_string(),
            activities_dir: "/tmp/store".to_string(),
        };
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let nested_path = temp_dir.path().join("nested").join("config.toml");
        let nested_path_str = nested_path.to_string_lossy().to_string();

        config.save(Some(nested_path_str.clone())).expect("Failed to save config");
        assert!(nested_path.exists());

        let loaded = Config::load(Some(nested_path_str)).expect("Failed to load saved config");
        assert_eq!(loaded.database_url, config.database_url);
        assert_eq!(loaded.activities_dir, config.activities_dir);
    }
}
