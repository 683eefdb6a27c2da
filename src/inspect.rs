//! Inspect operation: serialize everything loaded into a caller-owned buffer.
//!
//! The result is either a block from a caller-supplied [`Allocator`] or, with
//! no allocator, a buffer on the default heap. The two are released through
//! different paths and the type keeps them apart.

#![forbid(unsafe_code)]

use crate::alloc::{AllocError, AllocatedBuffer, Allocator};
use crate::invariant_ppt::{
    assert_invariant, DEFAULT_HEAP_PATH, SNAPSHOT_EXACT_LEN, SNAPSHOT_IS_OBJECT, SNAPSHOT_NONEMPTY,
};
use crate::runtime::Runtime;
use crate::serial;
use std::fmt;
use std::ops::Deref;
use tracing::debug;

/// Errors from [`inspect`].
#[derive(Debug, thiserror::Error)]
pub enum InspectError {
    #[error("runtime is not initialized")]
    NotInitialized,
    #[error("failed to serialize loaded symbols: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("failed to allocate snapshot: {0}")]
    Alloc(#[from] AllocError),
    /// The encoded document is not a JSON object.
    #[error("serialized snapshot is not a JSON object")]
    Malformed,
}

/// Snapshot bytes on the default heap.
///
/// Only [`HeapBuffer::release`] (or dropping it) frees these bytes; they never
/// go through a caller allocator.
#[derive(Clone, PartialEq, Eq)]
pub struct HeapBuffer(Box<[u8]>);

impl HeapBuffer {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn release(self) {
        drop(self);
    }

    pub fn into_boxed_slice(self) -> Box<[u8]> {
        self.0
    }
}

impl fmt::Debug for HeapBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeapBuffer").field("len", &self.0.len()).finish()
    }
}

/// A serialized snapshot owned by the caller.
#[derive(Debug)]
pub enum Snapshot<'a> {
    /// Produced by a caller allocator; release it through that allocator.
    Allocated(AllocatedBuffer<'a>),
    /// Produced on the default heap.
    Heap(HeapBuffer),
}

impl Snapshot<'_> {
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Snapshot::Allocated(buffer) => buffer.as_bytes(),
            Snapshot::Heap(buffer) => buffer.as_bytes(),
        }
    }

    /// Exact byte length of the document, with no terminator.
    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_str(&self) -> Result<&str, std::str::Utf8Error> {
        std::str::from_utf8(self.as_bytes())
    }

    pub fn is_default_heap(&self) -> bool {
        matches!(self, Snapshot::Heap(_))
    }

    /// Releases the snapshot through whichever path produced it.
    pub fn release(self) -> Result<(), AllocError> {
        match self {
            Snapshot::Allocated(buffer) => buffer.allocator().release(buffer),
            Snapshot::Heap(buffer) => {
                buffer.release();
                Ok(())
            }
        }
    }
}

impl Deref for Snapshot<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.as_bytes()
    }
}

/// Serializes every backend currently loaded in `runtime`.
///
/// With `Some(allocator)` the buffer is obtained from that allocator, sized to
/// exactly the document length. With `None` it lives on the default heap.
/// Loaded state is read, never changed.
pub fn inspect<'a>(
    runtime: &Runtime,
    allocator: Option<&'a Allocator>,
) -> Result<Snapshot<'a>, InspectError> {
    let view = runtime
        .registry_view()
        .map_err(|_| InspectError::NotInitialized)?;
    let bytes = serial::serialize(&view)?;

    let opens_object = bytes
        .iter()
        .find(|b| !b.is_ascii_whitespace())
        .is_some_and(|b| *b == b'{');
    if !opens_object {
        return Err(InspectError::Malformed);
    }
    assert_invariant(
        SNAPSHOT_IS_OBJECT,
        opens_object,
        "snapshot is a JSON object",
        Some("inspect"),
    );
    assert_invariant(
        SNAPSHOT_NONEMPTY,
        !bytes.is_empty(),
        "snapshot has at least one byte",
        Some("inspect"),
    );

    let len = bytes.len();
    let snapshot = match allocator {
        Some(allocator) => Snapshot::Allocated(allocator.alloc_buffer(&bytes)?),
        None => {
            let snapshot = Snapshot::Heap(HeapBuffer(bytes.into_boxed_slice()));
            assert_invariant(
                DEFAULT_HEAP_PATH,
                snapshot.is_default_heap(),
                "no allocator means a default-heap snapshot",
                Some("inspect"),
            );
            snapshot
        }
    };
    assert_invariant(
        SNAPSHOT_EXACT_LEN,
        snapshot.len() == len,
        "snapshot holds exactly the serialized bytes",
        Some("inspect"),
    );
    debug!(
        backends = view.len(),
        bytes = snapshot.len(),
        allocator = allocator.map(|a| a.strategy_name()).unwrap_or("default"),
        "inspect complete"
    );
    Ok(snapshot)
}

impl Runtime {
    /// See [`inspect`].
    pub fn inspect<'a>(&self, allocator: Option<&'a Allocator>) -> Result<Snapshot<'a>, InspectError> {
        inspect(self, allocator)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::dsl::{ClassBuilder, FunctionBuilder, ScriptBuilder};
    use crate::loader::StaticLoader;

    fn loaded_runtime() -> Runtime {
        let mut script = ScriptBuilder::new();
        script
            .function(FunctionBuilder::new("f").param("a", "int").returns("int"))
            .class(ClassBuilder::new("C"));
        let runtime = Runtime::with_config(RuntimeConfig::new());
        runtime.register_loader(
            StaticLoader::new("py").with_script("test.py", script.build().unwrap()),
        );
        runtime.initialize().unwrap();
        runtime.load_from_file("py", &["test.py"]).unwrap();
        runtime
    }

    #[test]
    fn default_path_is_heap() {
        let runtime = loaded_runtime();
        let snapshot = runtime.inspect(None).unwrap();
        assert!(snapshot.is_default_heap());
        assert!(snapshot.as_str().unwrap().starts_with("{\"py\":"));
        snapshot.release().unwrap();
    }

    #[test]
    fn allocator_path_uses_allocator() {
        let runtime = loaded_runtime();
        let allocator = Allocator::std();
        let snapshot = runtime.inspect(Some(&allocator)).unwrap();
        assert!(!snapshot.is_default_heap());
        assert_eq!(allocator.outstanding(), 1);
        snapshot.release().unwrap();
        assert_eq!(allocator.outstanding(), 0);
        allocator.destroy().unwrap();
    }

    #[test]
    fn both_paths_yield_same_bytes() {
        let runtime = loaded_runtime();
        let allocator = Allocator::std();
        let heap = runtime.inspect(None).unwrap();
        let allocated = runtime.inspect(Some(&allocator)).unwrap();
        assert_eq!(heap.as_bytes(), allocated.as_bytes());
    }

    #[test]
    fn empty_runtime_is_empty_object() {
        let runtime = Runtime::with_config(RuntimeConfig::new());
        runtime.initialize().unwrap();
        assert_eq!(runtime.inspect(None).unwrap().as_bytes(), b"{}");
    }

    #[test]
    fn uninitialized_runtime_fails() {
        let runtime = Runtime::with_config(RuntimeConfig::new());
        assert!(matches!(
            runtime.inspect(None),
            Err(InspectError::NotInitialized)
        ));
    }

    #[test]
    fn exhausted_allocator_fails_cleanly() {
        let runtime = loaded_runtime();
        let allocator =
            Allocator::create(crate::alloc::AllocatorDescriptor::Arena { capacity: 8 }).unwrap();
        assert!(matches!(
            runtime.inspect(Some(&allocator)),
            Err(InspectError::Alloc(AllocError::OutOfMemory { .. }))
        ));
        assert_eq!(allocator.outstanding(), 0);
        allocator.destroy().unwrap();
    }
}
