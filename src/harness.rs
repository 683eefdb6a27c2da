//! Inspect proof harness: fixture backends and instrumented allocators.

use crate::alloc::{AllocError, Allocator, AllocatorDescriptor, AllocatorStrategy, StdStrategy};
use crate::config::RuntimeConfig;
use crate::dsl::{ClassBuilder, FunctionBuilder, ScriptBuilder};
use crate::inspect::InspectError;
use crate::loader::StaticLoader;
use crate::registry::Symbol;
use crate::runtime::{LifecycleError, Runtime};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Symbols exported by the `test.py` fixture.
pub fn python_symbols() -> Vec<Symbol> {
    let mut script = ScriptBuilder::new();
    script
        .function(
            FunctionBuilder::new("python_test_function")
                .param("a", "int")
                .param("b", "int")
                .returns("int"),
        )
        .class(
            ClassBuilder::new("PythonTestClass")
                .constructor(FunctionBuilder::new("__init__").param("value", "int"))
                .attribute("value", Some("int"))
                .static_attribute("instances", None)
                .method(FunctionBuilder::new("get_value").returns("int"))
                .static_method(FunctionBuilder::new("create").param("value", "int")),
        );
    script.build().unwrap_or_default()
}

/// Symbols exported by the `test.js` fixture.
pub fn node_symbols() -> Vec<Symbol> {
    let mut script = ScriptBuilder::new();
    script
        .function(
            FunctionBuilder::new("node_test_function")
                .untyped_param("a")
                .untyped_param("b"),
        )
        .class(
            ClassBuilder::new("NodeTestClass")
                .constructor(FunctionBuilder::new("constructor").untyped_param("name"))
                .attribute("name", None)
                .method(FunctionBuilder::new("greet"))
                .method(FunctionBuilder::new("fetch").asynchronous()),
        );
    script.build().unwrap_or_default()
}

pub fn python_loader() -> StaticLoader {
    StaticLoader::new("py").with_script("test.py", python_symbols())
}

pub fn node_loader() -> StaticLoader {
    StaticLoader::new("node").with_script("test.js", node_symbols())
}

/// Initialized runtime with `py` and `node` loaded from the fixtures.
///
/// Loads are non-fatal: a backend that fails to load is simply absent.
pub fn fixture_runtime() -> Result<Runtime, LifecycleError> {
    let runtime = Runtime::with_config(RuntimeConfig::new());
    runtime.register_loader(python_loader());
    runtime.register_loader(node_loader());
    runtime.initialize()?;
    let _ = runtime.load_from_file("py", &["test.py"]);
    let _ = runtime.load_from_file("node", &["test.js"]);
    Ok(runtime)
}

/// Allocation counters shared between a [`CountingStrategy`] and the test.
#[derive(Debug, Default)]
pub struct AllocStats {
    pub allocs: AtomicUsize,
    pub frees: AtomicUsize,
    pub failures: AtomicUsize,
}

impl AllocStats {
    pub fn allocs(&self) -> usize {
        self.allocs.load(Ordering::SeqCst)
    }

    pub fn frees(&self) -> usize {
        self.frees.load(Ordering::SeqCst)
    }

    pub fn failures(&self) -> usize {
        self.failures.load(Ordering::SeqCst)
    }
}

/// libc-backed strategy that counts traffic and can be told to fail.
pub struct CountingStrategy {
    inner: StdStrategy,
    stats: Arc<AllocStats>,
    fail_after: Option<usize>,
}

impl CountingStrategy {
    pub fn new(stats: Arc<AllocStats>) -> Self {
        Self {
            inner: StdStrategy::libc(),
            stats,
            fail_after: None,
        }
    }

    /// Refuse every allocation once `n` have succeeded.
    pub fn fail_after(mut self, n: usize) -> Self {
        self.fail_after = Some(n);
        self
    }

    /// Wrap in an allocator handle.
    pub fn into_allocator(self) -> Result<Allocator, AllocError> {
        Allocator::create(AllocatorDescriptor::Custom(Box::new(self)))
    }

    fn refuse(&self) -> bool {
        self.fail_after
            .is_some_and(|n| self.stats.allocs.load(Ordering::SeqCst) >= n)
    }
}

impl AllocatorStrategy for CountingStrategy {
    fn name(&self) -> &'static str {
        "counting"
    }

    fn allocate(&self, size: usize) -> Option<NonNull<u8>> {
        if self.refuse() {
            self.stats.failures.fetch_add(1, Ordering::SeqCst);
            return None;
        }
        let ptr = self.inner.allocate(size)?;
        self.stats.allocs.fetch_add(1, Ordering::SeqCst);
        Some(ptr)
    }

    unsafe fn reallocate(
        &self,
        ptr: NonNull<u8>,
        old_size: usize,
        new_size: usize,
    ) -> Option<NonNull<u8>> {
        unsafe { self.inner.reallocate(ptr, old_size, new_size) }
    }

    unsafe fn release(&self, ptr: NonNull<u8>, size: usize) {
        self.stats.frees.fetch_add(1, Ordering::SeqCst);
        unsafe { self.inner.release(ptr, size) }
    }
}

/// Harness for inspect proofs: snapshots a runtime and returns owned bytes.
pub struct InspectHarness {
    runtime: Runtime,
}

impl InspectHarness {
    /// Harness over the fixture runtime.
    pub fn new() -> Result<Self, LifecycleError> {
        Ok(Self {
            runtime: fixture_runtime()?,
        })
    }

    pub fn with_runtime(runtime: Runtime) -> Self {
        Self { runtime }
    }

    pub fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    /// One inspect, copied out and released through its own path.
    pub fn snapshot(&self, allocator: Option<&Allocator>) -> Result<Vec<u8>, InspectError> {
        let snapshot = self.runtime.inspect(allocator)?;
        let bytes = snapshot.as_bytes().to_vec();
        snapshot.release()?;
        Ok(bytes)
    }

    /// Runs `times` inspects and returns the distinct outputs in order seen.
    pub fn run_repeated(
        &self,
        times: usize,
        allocator: Option<&Allocator>,
    ) -> Result<Vec<Vec<u8>>, InspectError> {
        let mut distinct: Vec<Vec<u8>> = Vec::new();
        for _ in 0..times {
            let bytes = self.snapshot(allocator)?;
            if !distinct.contains(&bytes) {
                distinct.push(bytes);
            }
        }
        Ok(distinct)
    }
}
