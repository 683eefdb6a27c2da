//! Runtime lifecycle: the owned context every core operation goes through.
//!
//! Loaded state sits behind a reader-writer lock. Inspect and view reads take
//! the read side; loads, unloads and teardown take the write side, so a reader
//! never observes a half-applied load.

#![forbid(unsafe_code)]

use crate::config::{ConfigError, RuntimeConfig};
use crate::invariant_ppt::{
    assert_invariant, LOAD_FAILURE_ISOLATED, RUNTIME_INITIALIZED, VIEW_POINT_IN_TIME,
};
use crate::loader::{LoadContext, LoaderError, ScriptLoader};
use crate::registry::{BackendTag, Registry, RegistryError, RegistryView, ScriptHandle};
use parking_lot::RwLock;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Where a runtime is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Uninitialized,
    Initialized,
    Destroyed,
}

/// Lifecycle errors.
#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error("runtime is already initialized")]
    AlreadyInitialized,
    #[error("runtime is not initialized")]
    NotInitialized,
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Errors from `load_from_file` and `clear`. None of them affect other backends.
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("runtime is not initialized")]
    NotInitialized,
    #[error("no loader registered for backend `{0}`")]
    NoLoader(BackendTag),
    #[error("no scripts given for backend `{0}`")]
    EmptyScriptList(BackendTag),
    #[error("backend `{tag}` failed to load: {source}")]
    Loader {
        tag: BackendTag,
        source: LoaderError,
    },
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

struct RuntimeState {
    phase: Phase,
    config: RuntimeConfig,
    registry: Registry,
}

/// A polyglot runtime context.
///
/// Independent instances share nothing, so tests can build as many as they need.
pub struct Runtime {
    state: RwLock<RuntimeState>,
    loaders: RwLock<Vec<Arc<dyn ScriptLoader>>>,
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.read();
        f.debug_struct("Runtime")
            .field("phase", &state.phase)
            .field("backends", &state.registry.view().len())
            .field("loaders", &self.loaders.read().len())
            .finish()
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

impl Runtime {
    /// A runtime configured from the process environment.
    pub fn new() -> Self {
        Self::with_config(RuntimeConfig::from_env())
    }

    pub fn with_config(config: RuntimeConfig) -> Self {
        Self {
            state: RwLock::new(RuntimeState {
                phase: Phase::Uninitialized,
                config,
                registry: Registry::default(),
            }),
            loaders: RwLock::new(Vec::new()),
        }
    }

    /// Brings the runtime up, reading the configuration file if one is set.
    /// A destroyed runtime may be initialized again.
    pub fn initialize(&self) -> Result<(), LifecycleError> {
        let mut state = self.state.write();
        if state.phase == Phase::Initialized {
            return Err(LifecycleError::AlreadyInitialized);
        }
        state.config.load_settings()?;
        state.phase = Phase::Initialized;
        assert_invariant(
            RUNTIME_INITIALIZED,
            state.registry.view().is_empty(),
            "a freshly initialized runtime has nothing loaded",
            Some("Runtime::initialize"),
        );
        info!(
            scripts = ?state.config.script_paths,
            configuration = ?state.config.configuration_path,
            "runtime initialized"
        );
        Ok(())
    }

    /// Tears the runtime down and forgets everything loaded. Idempotent.
    pub fn destroy(&self) {
        let mut state = self.state.write();
        if state.phase != Phase::Initialized {
            return;
        }
        state.registry.clear();
        state.phase = Phase::Destroyed;
        info!("runtime destroyed");
    }

    pub fn phase(&self) -> Phase {
        self.state.read().phase
    }

    pub fn is_initialized(&self) -> bool {
        self.phase() == Phase::Initialized
    }

    pub fn config(&self) -> RuntimeConfig {
        self.state.read().config.clone()
    }

    /// Installs the loader for its tag, replacing any previous one.
    pub fn register_loader<L: ScriptLoader + 'static>(&self, loader: L) {
        let mut loaders = self.loaders.write();
        loaders.retain(|l| l.tag() != loader.tag());
        debug!(tag = loader.tag(), "loader registered");
        loaders.push(Arc::new(loader));
    }

    fn loader_for(&self, tag: &str) -> Option<Arc<dyn ScriptLoader>> {
        self.loaders.read().iter().find(|l| l.tag() == tag).cloned()
    }

    /// Loads scripts into a backend as one handle.
    ///
    /// Failure is local to `tag`: nothing is recorded for it and every other
    /// backend is untouched.
    pub fn load_from_file<P: AsRef<Path>>(&self, tag: &str, scripts: &[P]) -> Result<(), LoadError> {
        let result = self.try_load(tag, scripts);
        match &result {
            Ok(()) => info!(tag, scripts = scripts.len(), "scripts loaded"),
            Err(err) => warn!(tag, error = %err, "failed to load scripts"),
        }
        result
    }

    fn try_load<P: AsRef<Path>>(&self, tag: &str, scripts: &[P]) -> Result<(), LoadError> {
        let tag = BackendTag::new(tag);
        if scripts.is_empty() {
            return Err(LoadError::EmptyScriptList(tag));
        }
        let config = {
            let state = self.state.read();
            if state.phase != Phase::Initialized {
                return Err(LoadError::NotInitialized);
            }
            state.config.clone()
        };
        let loader = self
            .loader_for(tag.as_str())
            .ok_or_else(|| LoadError::NoLoader(tag.clone()))?;
        let scripts: Vec<PathBuf> = scripts.iter().map(|p| p.as_ref().to_path_buf()).collect();
        let ctx = LoadContext {
            tag: &tag,
            scripts: &scripts,
            config: &config,
        };
        let handle_name = ctx.handle_name();
        // Loaders run outside the lock; only the registry update is exclusive.
        let symbols = loader.load(&ctx).map_err(|source| LoadError::Loader {
            tag: tag.clone(),
            source,
        })?;

        let mut state = self.state.write();
        if state.phase != Phase::Initialized {
            return Err(LoadError::NotInitialized);
        }
        let before = state.registry.view();
        let inserted = state
            .registry
            .insert(tag, ScriptHandle::new(handle_name, symbols));
        if inserted.is_err() {
            assert_invariant(
                LOAD_FAILURE_ISOLATED,
                state.registry.view() == before,
                "rejected load leaves the registry unchanged",
                Some("Runtime::load_from_file"),
            );
        }
        inserted.map_err(LoadError::from)
    }

    /// Unloads one handle. Returns whether it was loaded.
    pub fn clear(&self, tag: &str, handle_name: &str) -> Result<bool, LoadError> {
        let mut state = self.state.write();
        if state.phase != Phase::Initialized {
            return Err(LoadError::NotInitialized);
        }
        let removed = state.registry.remove(tag, handle_name);
        if removed {
            info!(tag, handle = handle_name, "script handle cleared");
        }
        Ok(removed)
    }

    /// A point-in-time view of everything loaded.
    pub fn registry_view(&self) -> Result<RegistryView, LifecycleError> {
        let state = self.state.read();
        if state.phase != Phase::Initialized {
            return Err(LifecycleError::NotInitialized);
        }
        let view = state.registry.view();
        assert_invariant(
            VIEW_POINT_IN_TIME,
            view.backends().iter().all(|b| !b.handles().is_empty()),
            "every backend in a view has at least one handle",
            Some("Runtime::registry_view"),
        );
        Ok(view)
    }
}
