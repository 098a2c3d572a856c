//! Application directory paths for the bridge.
//!
//! Uses the [`dirs`] crate for platform-appropriate resolution.
//!
//! # Environment Overrides
//!
//! - `ALEX_DATA_DIR` overrides [`data_dir`]
//! - `ALEX_CONFIG_DIR` overrides [`config_dir`]

use std::path::PathBuf;

/// File name the control-plane host advertises its port in.
pub const HOST_PORT_FILE: &str = "host_port.txt";

/// Application data root directory.
///
/// Holds logs and the host port advertisement file. Resolves to
/// `dirs::data_dir()/alex/` unless `ALEX_DATA_DIR` is set.
#[must_use]
pub fn data_dir() -> PathBuf {
    if let Some(override_dir) = std::env::var_os("ALEX_DATA_DIR") {
        return PathBuf::from(override_dir);
    }
    dirs::data_dir()
        .map(|d| d.join("alex"))
        .unwrap_or_else(|| std::env::temp_dir().join("alex-data"))
}

/// Application config directory (`config.toml` lives here).
#[must_use]
pub fn config_dir() -> PathBuf {
    if let Some(override_dir) = std::env::var_os("ALEX_CONFIG_DIR") {
        return PathBuf::from(override_dir);
    }
    dirs::config_dir()
        .map(|d| d.join("alex"))
        .unwrap_or_else(|| std::env::temp_dir().join("alex-config"))
}

/// Log file directory (`data_dir()/logs/`).
#[must_use]
pub fn logs_dir() -> PathBuf {
    data_dir().join("logs")
}

/// Default location of the host port advertisement file.
#[must_use]
pub fn host_port_file() -> PathBuf {
    data_dir().join(HOST_PORT_FILE)
}

/// Creates the data and logs directories if they do not exist.
pub fn ensure_dirs() -> std::io::Result<()> {
    std::fs::create_dir_all(data_dir())?;
    std::fs::create_dir_all(logs_dir())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;

    #[test]
    fn logs_dir_is_under_data_dir() {
        assert!(logs_dir().starts_with(data_dir()));
        assert_eq!(logs_dir().file_name().unwrap(), "logs");
    }

    #[test]
    fn host_port_file_is_under_data_dir() {
        let path = host_port_file();
        assert!(path.starts_with(data_dir()));
        assert_eq!(path.file_name().unwrap(), HOST_PORT_FILE);
    }

    #[test]
    fn default_dirs_are_named_for_the_app() {
        if std::env::var_os("ALEX_DATA_DIR").is_none() {
            assert!(data_dir().to_string_lossy().contains("alex"));
        }
        if std::env::var_os("ALEX_CONFIG_DIR").is_none() {
            assert!(config_dir().to_string_lossy().contains("alex"));
        }
    }
}
