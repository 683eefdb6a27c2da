//! Backend loader seam.
//!
//! Loaders are opaque producers of symbols. The runtime hands them the
//! requested scripts and its configuration, and stores whatever they return as
//! one script handle. How a backend parses or executes its scripts is its own
//! business.

#![forbid(unsafe_code)]

use crate::config::RuntimeConfig;
use crate::registry::{BackendTag, Symbol};
use std::path::{Path, PathBuf};

/// Input for one `load_from_file` call.
#[derive(Debug, Clone, Copy)]
pub struct LoadContext<'a> {
    pub tag: &'a BackendTag,
    pub scripts: &'a [PathBuf],
    pub config: &'a RuntimeConfig,
}

impl LoadContext<'_> {
    /// Name of the handle the load produces: its first script, as given.
    pub fn handle_name(&self) -> String {
        self.scripts
            .first()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// Errors reported by a loader.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LoaderError {
    #[error("script not found: {}", .0.display())]
    ScriptNotFound(PathBuf),
    /// The backend itself is not usable (e.g. not built into this process).
    #[error("backend unavailable: {0}")]
    Unavailable(String),
    #[error("{0}")]
    Failed(String),
}

/// Object-safe loader for one backend tag.
pub trait ScriptLoader: Send + Sync {
    fn tag(&self) -> &str;

    /// Load `ctx.scripts` and return their exported symbols in declaration order.
    fn load(&self, ctx: &LoadContext<'_>) -> Result<Vec<Symbol>, LoaderError>;
}

/// In-memory loader serving pre-declared scripts.
///
/// Scripts are matched by their full path first, then by file name, so a
/// declared `test.py` answers a request for `scripts/test.py`.
#[derive(Debug, Clone)]
pub struct StaticLoader {
    tag: String,
    scripts: Vec<(String, Vec<Symbol>)>,
    unavailable: Option<String>,
}

impl StaticLoader {
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            scripts: Vec::new(),
            unavailable: None,
        }
    }

    /// A loader whose every load fails, standing in for a backend that is
    /// missing from this build.
    pub fn unavailable(tag: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            scripts: Vec::new(),
            unavailable: Some(reason.into()),
        }
    }

    pub fn with_script(mut self, name: impl Into<String>, symbols: Vec<Symbol>) -> Self {
        self.scripts.push((name.into(), symbols));
        self
    }

    fn lookup(&self, path: &Path) -> Option<&[Symbol]> {
        let full = path.to_string_lossy();
        let file_name = path.file_name().map(|n| n.to_string_lossy());
        self.scripts
            .iter()
            .find(|(name, _)| name.as_str() == &*full)
            .or_else(|| {
                let file_name = file_name.as_deref()?;
                self.scripts.iter().find(|(name, _)| name.as_str() == file_name)
            })
            .map(|(_, symbols)| symbols.as_slice())
    }
}

impl ScriptLoader for StaticLoader {
    fn tag(&self) -> &str {
        &self.tag
    }

    fn load(&self, ctx: &LoadContext<'_>) -> Result<Vec<Symbol>, LoaderError> {
        if let Some(reason) = &self.unavailable {
            return Err(LoaderError::Unavailable(reason.clone()));
        }
        let mut symbols = Vec::new();
        for script in ctx.scripts {
            let declared = self
                .lookup(script)
                .ok_or_else(|| LoaderError::ScriptNotFound(script.clone()))?;
            symbols.extend_from_slice(declared);
        }
        Ok(symbols)
    }
}
