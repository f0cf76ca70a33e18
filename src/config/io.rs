use std::env::current_exe;
use std::path::PathBuf;
use directories_next::ProjectDirs;
use log::info;
use tokio::fs;

use crate::config::types::LinkConfig;
use crate::error::ConfigError;

// a gripfit-link.json next to the executable takes precedence, which is
// useful for usb sticks and field-diagnostic laptops
fn get_portable_config_path() -> Option<PathBuf> {
    match current_exe() {
        Ok(mut path) => {
            if !path.set_extension("json") {
                eprintln!("current exe has no filename: {}", path.to_string_lossy());
                return None;
            }

            Some(path)
        },
        Err(err) => {
            eprintln!("failed to get current exe path: {:?}", err);
            None
        },
    }
}

// creates a path to gripfit-link.json in an os dependent standard directory,
// such as %AppData% on windows.
fn get_local_config_path() -> Option<PathBuf> {
    ProjectDirs::from("io", "gripfit", "gripfit-link").map(|dirs| {
        dirs.config_dir().join("gripfit-link.json")
    })
}

pub fn get_config_path() -> Result<PathBuf, ConfigError> {
    if let Some(path) = get_portable_config_path() {
        if let Ok(attr) = std::fs::metadata(&path) {
            if attr.is_file() {
                return Ok(path);
            }
        }
    }

    match get_local_config_path() {
        None => Err(ConfigError::NoConfigPath),
        Some(path) => Ok(path),
    }
}

/// Reads the config file, falling back to defaults when it does not exist yet.
pub async fn read_config() -> Result<LinkConfig, ConfigError> {
    let path = get_config_path()?;

    let content = match fs::read_to_string(&path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            info!("Config file not found at {}, using defaults", path.to_string_lossy());
            return Ok(LinkConfig::default());
        },
        Err(err) => return Err(err.into()),
    };

    if content.trim().is_empty() {
        return Ok(LinkConfig::default());
    }

    let config: LinkConfig = serde_json::from_str(&content)?;
    Ok(config)
}

pub async fn save_config(config: &LinkConfig) -> Result<(), ConfigError> {
    let path = get_config_path()?;

    if let Some(directory) = path.parent() {
        fs::create_dir_all(directory).await?;
    }

    let content = serde_json::to_string_pretty(config)?;
    fs::write(&path, content).await?;
    info!("Saved config to {}", path.to_string_lossy());
    Ok(())
}
