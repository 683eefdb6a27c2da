pub mod alloc;
pub mod config;
pub mod dsl;
pub mod ffi;
#[doc(hidden)]
pub mod harness;
pub mod inspect;
#[doc(hidden)]
pub mod invariant_ppt;
pub mod loader;
pub mod registry;
pub mod runtime;
pub mod serial;

pub use alloc::{
    AllocError, AllocatedBuffer, Allocator, AllocatorDescriptor, AllocatorStrategy,
    ArenaStrategy, DestroyError, StdAllocatorFns, StdStrategy,
};
pub use config::{ConfigError, RuntimeConfig};
pub use inspect::{inspect, HeapBuffer, InspectError, Snapshot};
pub use loader::{LoadContext, LoaderError, ScriptLoader, StaticLoader};
pub use registry::{BackendTag, RegistryView, ScriptHandle, Symbol, SymbolKind};
pub use runtime::{LifecycleError, LoadError, Phase, Runtime};
