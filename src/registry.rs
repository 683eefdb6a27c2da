//! Registry module: loaded backends, their script handles and exported symbols.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use crate::invariant_ppt::{assert_invariant, SYMBOL_NAME_UNIQUE};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

/// Identifies a language backend, e.g. `py` or `node`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BackendTag(String);

impl BackendTag {
    /// Create a tag from any string.
    pub fn new(tag: impl Into<String>) -> Self {
        Self(tag.into())
    }

    /// The tag as it appears in snapshots.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BackendTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for BackendTag {
    fn from(tag: &str) -> Self {
        Self::new(tag)
    }
}

impl From<String> for BackendTag {
    fn from(tag: String) -> Self {
        Self(tag)
    }
}

/// Whether a symbol is a function or a class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SymbolKind {
    /// A free function.
    Function,
    /// A class with constructors, attributes and methods.
    Class,
}

impl fmt::Display for SymbolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SymbolKind::Function => f.write_str("function"),
            SymbolKind::Class => f.write_str("class"),
        }
    }
}

/// A named parameter with an optional type name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Param {
    /// Parameter name.
    pub name: String,
    /// Type name, if the backend knows it.
    pub ty: Option<String>,
}

/// Signature metadata of an exported function or method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionDecl {
    /// Function name.
    pub name: String,
    /// Parameters in declaration order.
    pub params: Vec<Param>,
    /// Return type name, if known.
    pub ret: Option<String>,
    /// Whether the function is asynchronous in its backend.
    pub is_async: bool,
}

/// A class attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    /// Attribute name.
    pub name: String,
    /// Type name, if known.
    pub ty: Option<String>,
    /// Whether the attribute belongs to the class rather than instances.
    pub is_static: bool,
}

/// Member metadata of an exported class.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassDecl {
    /// Class name.
    pub name: String,
    /// Constructor parameter lists.
    pub constructors: Vec<Vec<Param>>,
    /// Attributes in declaration order.
    pub attributes: Vec<Attribute>,
    /// Instance methods in declaration order.
    pub methods: Vec<FunctionDecl>,
    /// Static methods in declaration order.
    pub static_methods: Vec<FunctionDecl>,
}

/// One exported unit of a backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Symbol {
    /// An exported function.
    Function(FunctionDecl),
    /// An exported class.
    Class(ClassDecl),
}

impl Symbol {
    /// The symbol name.
    pub fn name(&self) -> &str {
        match self {
            Symbol::Function(f) => &f.name,
            Symbol::Class(c) => &c.name,
        }
    }

    /// The symbol kind.
    pub fn kind(&self) -> SymbolKind {
        match self {
            Symbol::Function(_) => SymbolKind::Function,
            Symbol::Class(_) => SymbolKind::Class,
        }
    }
}

/// The symbols produced by one successful load, in declaration order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptHandle {
    name: String,
    symbols: Vec<Symbol>,
}

impl ScriptHandle {
    /// Create a handle named after the script it was loaded from.
    pub fn new(name: impl Into<String>, symbols: Vec<Symbol>) -> Self {
        Self {
            name: name.into(),
            symbols,
        }
    }

    /// Handle name (the first script path of the load).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// All symbols in declaration order.
    pub fn symbols(&self) -> &[Symbol] {
        &self.symbols
    }

    /// Exported functions in declaration order.
    pub fn functions(&self) -> impl Iterator<Item = &FunctionDecl> {
        self.symbols.iter().filter_map(|s| match s {
            Symbol::Function(f) => Some(f),
            Symbol::Class(_) => None,
        })
    }

    /// Exported classes in declaration order.
    pub fn classes(&self) -> impl Iterator<Item = &ClassDecl> {
        self.symbols.iter().filter_map(|s| match s {
            Symbol::Class(c) => Some(c),
            Symbol::Function(_) => None,
        })
    }
}

/// Errors raised when a handle cannot join the registry.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    /// A handle with this name is already loaded for the backend.
    #[error("script `{name}` is already loaded in backend `{tag}`")]
    AlreadyLoaded {
        /// Backend tag.
        tag: BackendTag,
        /// Handle name.
        name: String,
    },
    /// A symbol of the same kind and name already exists in the backend.
    #[error("{kind} `{name}` is already declared in backend `{tag}`")]
    DuplicateSymbol {
        /// Backend tag.
        tag: BackendTag,
        /// Symbol kind.
        kind: SymbolKind,
        /// Symbol name.
        name: String,
    },
}

#[derive(Debug)]
struct LoadedBackend {
    tag: BackendTag,
    handles: Vec<Arc<ScriptHandle>>,
}

/// Mutable bookkeeping of everything loaded. Owned by the runtime.
#[derive(Debug, Default)]
pub(crate) struct Registry {
    backends: Vec<LoadedBackend>,
}

impl Registry {
    /// Append a handle to a backend, creating the backend entry on first load.
    /// Rejects the whole handle if any symbol name collides.
    pub(crate) fn insert(&mut self, tag: BackendTag, handle: ScriptHandle) -> Result<(), RegistryError> {
        let existing = self.backends.iter().find(|b| b.tag == tag);
        let mut seen: HashSet<(SymbolKind, &str)> = HashSet::new();
        if let Some(backend) = existing {
            if backend.handles.iter().any(|h| h.name == handle.name) {
                return Err(RegistryError::AlreadyLoaded {
                    tag,
                    name: handle.name,
                });
            }
            for symbol in backend.handles.iter().flat_map(|h| h.symbols.iter()) {
                seen.insert((symbol.kind(), symbol.name()));
            }
        }
        for symbol in &handle.symbols {
            if !seen.insert((symbol.kind(), symbol.name())) {
                return Err(RegistryError::DuplicateSymbol {
                    tag,
                    kind: symbol.kind(),
                    name: symbol.name().to_string(),
                });
            }
        }
        assert_invariant(
            SYMBOL_NAME_UNIQUE,
            seen.len() >= handle.symbols.len(),
            "symbol names unique per backend and kind",
            Some("Registry::insert"),
        );
        drop(seen);

        let handle = Arc::new(handle);
        match self.backends.iter_mut().find(|b| b.tag == tag) {
            Some(backend) => backend.handles.push(handle),
            None => self.backends.push(LoadedBackend {
                tag,
                handles: vec![handle],
            }),
        }
        Ok(())
    }

    /// Remove a handle. A backend left without handles is dropped entirely.
    pub(crate) fn remove(&mut self, tag: &str, handle_name: &str) -> bool {
        let Some(index) = self.backends.iter().position(|b| b.tag.as_str() == tag) else {
            return false;
        };
        let backend = &mut self.backends[index];
        let before = backend.handles.len();
        backend.handles.retain(|h| h.name != handle_name);
        let removed = backend.handles.len() != before;
        if backend.handles.is_empty() {
            self.backends.remove(index);
        }
        removed
    }

    pub(crate) fn clear(&mut self) {
        self.backends.clear();
    }

    /// Point-in-time view sharing the loaded handles.
    pub(crate) fn view(&self) -> RegistryView {
        RegistryView {
            backends: self
                .backends
                .iter()
                .map(|b| BackendView {
                    tag: b.tag.clone(),
                    handles: b.handles.clone(),
                })
                .collect(),
        }
    }
}

/// One backend as seen by a [`RegistryView`].
#[derive(Debug, Clone, PartialEq)]
pub struct BackendView {
    tag: BackendTag,
    handles: Vec<Arc<ScriptHandle>>,
}

impl BackendView {
    /// Backend tag.
    pub fn tag(&self) -> &BackendTag {
        &self.tag
    }

    /// Handles in load order.
    pub fn handles(&self) -> &[Arc<ScriptHandle>] {
        &self.handles
    }

    /// Symbols across all handles: load order, then declaration order.
    pub fn symbols(&self) -> impl Iterator<Item = &Symbol> {
        self.handles.iter().flat_map(|h| h.symbols().iter())
    }
}

/// Read-only aggregation of every loaded backend's symbols.
///
/// Backends appear in first-load order. The view shares the loaded handles and
/// never mutates them, so it stays valid after later loads or unloads.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RegistryView {
    backends: Vec<BackendView>,
}

impl RegistryView {
    /// True when no backend has anything loaded.
    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    /// Number of backends present.
    pub fn len(&self) -> usize {
        self.backends.len()
    }

    /// Backends in first-load order.
    pub fn backends(&self) -> &[BackendView] {
        &self.backends
    }

    /// Tags of the backends present.
    pub fn tags(&self) -> impl Iterator<Item = &BackendTag> {
        self.backends.iter().map(|b| &b.tag)
    }

    /// Look up one backend.
    pub fn backend(&self, tag: &str) -> Option<&BackendView> {
        self.backends.iter().find(|b| b.tag.as_str() == tag)
    }

    /// Symbols of one backend; empty if the backend is absent.
    pub fn symbols<'a>(&'a self, tag: &str) -> impl Iterator<Item = &'a Symbol> + 'a {
        self.backend(tag).into_iter().flat_map(|b| b.symbols())
    }

    /// Find a symbol by backend and name.
    pub fn find(&self, tag: &str, name: &str) -> Option<&Symbol> {
        self.symbols(tag).find(|s| s.name() == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn function(name: &str) -> Symbol {
        Symbol::Function(FunctionDecl {
            name: name.to_string(),
            params: Vec::new(),
            ret: None,
            is_async: false,
        })
    }

    fn class(name: &str) -> Symbol {
        Symbol::Class(ClassDecl {
            name: name.to_string(),
            constructors: Vec::new(),
            attributes: Vec::new(),
            methods: Vec::new(),
            static_methods: Vec::new(),
        })
    }

    #[test]
    fn view_keeps_load_and_declaration_order() {
        let mut registry = Registry::default();
        registry
            .insert("node".into(), ScriptHandle::new("a.js", vec![function("z"), class("A")]))
            .unwrap();
        registry
            .insert("py".into(), ScriptHandle::new("b.py", vec![function("f")]))
            .unwrap();
        registry
            .insert("node".into(), ScriptHandle::new("c.js", vec![function("a")]))
            .unwrap();

        let view = registry.view();
        let tags: Vec<&str> = view.tags().map(|t| t.as_str()).collect();
        assert_eq!(tags, vec!["node", "py"]);
        let names: Vec<&str> = view.symbols("node").map(|s| s.name()).collect();
        assert_eq!(names, vec!["z", "A", "a"]);
    }

    #[test]
    fn duplicate_handle_is_rejected() {
        let mut registry = Registry::default();
        registry
            .insert("py".into(), ScriptHandle::new("test.py", vec![function("f")]))
            .unwrap();
        let err = registry
            .insert("py".into(), ScriptHandle::new("test.py", vec![function("g")]))
            .unwrap_err();
        assert!(matches!(err, RegistryError::AlreadyLoaded { .. }));
    }

    #[test]
    fn duplicate_symbol_rejects_whole_handle() {
        let mut registry = Registry::default();
        registry
            .insert("py".into(), ScriptHandle::new("a.py", vec![function("f")]))
            .unwrap();
        let err = registry
            .insert("py".into(), ScriptHandle::new("b.py", vec![function("g"), function("f")]))
            .unwrap_err();
        assert_eq!(
            err,
            RegistryError::DuplicateSymbol {
                tag: "py".into(),
                kind: SymbolKind::Function,
                name: "f".to_string(),
            }
        );
        assert!(registry.view().find("py", "g").is_none());
    }

    #[test]
    fn same_name_different_kind_is_allowed() {
        let mut registry = Registry::default();
        registry
            .insert("py".into(), ScriptHandle::new("a.py", vec![function("Thing"), class("Thing")]))
            .unwrap();
        assert_eq!(registry.view().symbols("py").count(), 2);
    }

    #[test]
    fn removing_last_handle_drops_backend() {
        let mut registry = Registry::default();
        registry
            .insert("py".into(), ScriptHandle::new("a.py", vec![function("f")]))
            .unwrap();
        assert!(registry.remove("py", "a.py"));
        assert!(!registry.remove("py", "a.py"));
        assert!(registry.view().is_empty());
    }

    #[test]
    fn view_outlives_later_mutation() {
        let mut registry = Registry::default();
        registry
            .insert("py".into(), ScriptHandle::new("a.py", vec![function("f")]))
            .unwrap();
        let view = registry.view();
        registry.clear();
        assert!(view.find("py", "f").is_some());
        assert!(registry.view().is_empty());
    }
}
