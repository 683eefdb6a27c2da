//! Runtime configuration: search paths and the optional configuration file.
//!
//! The runtime consumes these values; it never resolves scripts or libraries
//! against them itself. Loaders receive the configuration through
//! [`crate::loader::LoadContext`] and decide what to do with it.

#![forbid(unsafe_code)]

use serde_json::{Map, Value};
use std::ffi::OsString;
use std::path::{Path, PathBuf};

pub const LOADER_LIBRARY_PATH: &str = "LOADER_LIBRARY_PATH";
pub const SERIAL_LIBRARY_PATH: &str = "SERIAL_LIBRARY_PATH";
pub const DETOUR_LIBRARY_PATH: &str = "DETOUR_LIBRARY_PATH";
pub const LOADER_SCRIPT_PATH: &str = "LOADER_SCRIPT_PATH";
pub const CONFIGURATION_PATH: &str = "CONFIGURATION_PATH";

/// Errors reading the configuration file.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read configuration {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("malformed configuration {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("configuration {} must be a JSON object", .path.display())]
    NotAnObject { path: PathBuf },
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RuntimeConfig {
    pub loader_library_paths: Vec<PathBuf>,
    pub serial_library_paths: Vec<PathBuf>,
    pub detour_library_paths: Vec<PathBuf>,
    pub script_paths: Vec<PathBuf>,
    pub configuration_path: Option<PathBuf>,
    /// Contents of the configuration file once loaded.
    pub settings: Map<String, Value>,
}

impl RuntimeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var_os(name))
    }

    /// Reads variables through `lookup`, so callers can supply their own source.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<OsString>,
    {
        let paths = |name: &str| -> Vec<PathBuf> {
            lookup(name)
                .map(|v| {
                    std::env::split_paths(&v)
                        .filter(|p| !p.as_os_str().is_empty())
                        .collect()
                })
                .unwrap_or_default()
        };
        Self {
            loader_library_paths: paths(LOADER_LIBRARY_PATH),
            serial_library_paths: paths(SERIAL_LIBRARY_PATH),
            detour_library_paths: paths(DETOUR_LIBRARY_PATH),
            script_paths: paths(LOADER_SCRIPT_PATH),
            configuration_path: lookup(CONFIGURATION_PATH)
                .filter(|v| !v.is_empty())
                .map(PathBuf::from),
            settings: Map::new(),
        }
    }

    pub fn with_script_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.script_paths.push(path.into());
        self
    }

    pub fn with_configuration_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.configuration_path = Some(path.into());
        self
    }

    /// Loads `configuration_path` into `settings`. No path, no-op.
    pub fn load_settings(&mut self) -> Result<(), ConfigError> {
        let Some(path) = self.configuration_path.as_deref() else {
            return Ok(());
        };
        self.settings = read_settings(path)?;
        Ok(())
    }

    /// Looks up a top-level setting.
    pub fn setting(&self, key: &str) -> Option<&Value> {
        self.settings.get(key)
    }
}

fn read_settings(path: &Path) -> Result<Map<String, Value>, ConfigError> {
    let raw = std::fs::read(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let value: Value = serde_json::from_slice(&raw).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    match value {
        Value::Object(map) => Ok(map),
        _ => Err(ConfigError::NotAnObject {
            path: path.to_path_buf(),
        }),
    }
}
