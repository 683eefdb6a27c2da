//! Allocator abstraction: caller-pluggable strategies for snapshot memory.
//!
//! An [`Allocator`] is an opaque handle over an [`AllocatorStrategy`]. It tracks
//! every block it hands out, so a block can be freed by pointer alone and a
//! pointer from somewhere else is rejected instead of reaching the strategy.
//!
//! Rules the handle cannot fully enforce for raw pointers:
//! - a block must be freed through the allocator that produced it;
//! - an allocator must not be destroyed while its blocks are still in use.
//!
//! [`AllocatedBuffer`] is the borrow-checked form of a block and makes both
//! rules compile-time facts.

use crate::invariant_ppt::{assert_invariant, ALLOC_SAME_INSTANCE};
use parking_lot::Mutex;
use std::alloc::Layout;
use std::collections::HashMap;
use std::ffi::c_void;
use std::fmt;
use std::ops::Deref;
use std::ptr::NonNull;
use tracing::{debug, warn};

/// C `malloc`-shaped allocation function.
pub type MallocFn = unsafe extern "C" fn(usize) -> *mut c_void;
/// C `realloc`-shaped reallocation function.
pub type ReallocFn = unsafe extern "C" fn(*mut c_void, usize) -> *mut c_void;
/// C `free`-shaped release function.
pub type FreeFn = unsafe extern "C" fn(*mut c_void);

/// Three function pointers describing a C-style heap.
///
/// Every pointer must be present; a missing one makes the descriptor malformed.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct StdAllocatorFns {
    pub malloc: Option<MallocFn>,
    pub realloc: Option<ReallocFn>,
    pub free: Option<FreeFn>,
}

impl StdAllocatorFns {
    /// The C library heap.
    pub fn libc() -> Self {
        Self {
            malloc: Some(libc::malloc as MallocFn),
            realloc: Some(libc::realloc as ReallocFn),
            free: Some(libc::free as FreeFn),
        }
    }
}

/// Describes which strategy an [`Allocator`] is built from.
pub enum AllocatorDescriptor {
    /// A C-style heap given as function pointers.
    Std(StdAllocatorFns),
    /// A fixed-capacity bump arena owned by the allocator.
    Arena {
        /// Total bytes available to the arena.
        capacity: usize,
    },
    /// Any caller-provided strategy.
    Custom(Box<dyn AllocatorStrategy>),
}

impl fmt::Debug for AllocatorDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllocatorDescriptor::Std(fns) => f.debug_tuple("Std").field(fns).finish(),
            AllocatorDescriptor::Arena { capacity } => {
                f.debug_struct("Arena").field("capacity", capacity).finish()
            }
            AllocatorDescriptor::Custom(strategy) => {
                f.debug_tuple("Custom").field(&strategy.name()).finish()
            }
        }
    }
}

/// Errors raised by allocator handles and strategies.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AllocError {
    /// `alloc` was asked for zero bytes.
    #[error("allocation size must be greater than zero")]
    ZeroSize,
    /// The strategy could not satisfy the request.
    #[error("allocator strategy `{strategy}` could not provide {size} bytes")]
    OutOfMemory {
        /// Strategy that refused.
        strategy: &'static str,
        /// Requested size in bytes.
        size: usize,
    },
    /// The descriptor cannot produce a strategy.
    #[error("malformed allocator descriptor: {0}")]
    InvalidDescriptor(&'static str),
    /// The pointer is not an outstanding block of this allocator.
    #[error("pointer was not produced by this allocator or was already freed")]
    ForeignPointer,
    /// The buffer was produced by a different allocator instance.
    #[error("buffer belongs to a different allocator instance")]
    ForeignBuffer,
}

/// Returned by [`Allocator::destroy`] while blocks are still outstanding.
///
/// Carries the allocator back so the caller can release the remaining blocks
/// and try again.
#[derive(Debug, thiserror::Error)]
#[error("allocator still has {outstanding} outstanding allocation(s)")]
pub struct DestroyError {
    /// The allocator that was not destroyed.
    pub allocator: Allocator,
    /// Number of blocks not yet released.
    pub outstanding: usize,
}

/// A strategy for obtaining and releasing raw memory.
///
/// Strategies are shared across threads through the owning [`Allocator`], so
/// they must be safe for concurrent use.
pub trait AllocatorStrategy: Send + Sync {
    /// Short name used in diagnostics.
    fn name(&self) -> &'static str;

    /// Returns a block of at least `size` bytes, or `None` if unavailable.
    /// `size` is never zero.
    fn allocate(&self, size: usize) -> Option<NonNull<u8>>;

    /// Resizes a block, preserving `min(old_size, new_size)` bytes.
    ///
    /// # Safety
    /// `ptr` must be a live block from this strategy of exactly `old_size` bytes.
    /// On success the old pointer must no longer be used.
    unsafe fn reallocate(
        &self,
        ptr: NonNull<u8>,
        old_size: usize,
        new_size: usize,
    ) -> Option<NonNull<u8>>;

    /// Returns a block to the strategy.
    ///
    /// # Safety
    /// `ptr` must be a live block from this strategy of exactly `size` bytes.
    unsafe fn release(&self, ptr: NonNull<u8>, size: usize);
}

/// Strategy over three C heap function pointers.
#[derive(Debug, Clone, Copy)]
pub struct StdStrategy {
    malloc: MallocFn,
    realloc: ReallocFn,
    free: FreeFn,
}

impl StdStrategy {
    /// Validates the descriptor; every function pointer is required.
    pub fn new(fns: StdAllocatorFns) -> Result<Self, AllocError> {
        Ok(Self {
            malloc: fns.malloc.ok_or(AllocError::InvalidDescriptor("missing malloc"))?,
            realloc: fns
                .realloc
                .ok_or(AllocError::InvalidDescriptor("missing realloc"))?,
            free: fns.free.ok_or(AllocError::InvalidDescriptor("missing free"))?,
        })
    }

    /// The C library heap.
    pub fn libc() -> Self {
        Self {
            malloc: libc::malloc as MallocFn,
            realloc: libc::realloc as ReallocFn,
            free: libc::free as FreeFn,
        }
    }
}

impl AllocatorStrategy for StdStrategy {
    fn name(&self) -> &'static str {
        "std"
    }

    fn allocate(&self, size: usize) -> Option<NonNull<u8>> {
        NonNull::new(unsafe { (self.malloc)(size) }.cast::<u8>())
    }

    unsafe fn reallocate(
        &self,
        ptr: NonNull<u8>,
        _old_size: usize,
        new_size: usize,
    ) -> Option<NonNull<u8>> {
        NonNull::new(unsafe { (self.realloc)(ptr.as_ptr().cast(), new_size) }.cast::<u8>())
    }

    unsafe fn release(&self, ptr: NonNull<u8>, _size: usize) {
        unsafe { (self.free)(ptr.as_ptr().cast()) }
    }
}

/// Alignment of every block handed out by [`ArenaStrategy`].
pub const ARENA_ALIGN: usize = 16;

struct ArenaCursor {
    offset: usize,
    live: usize,
    /// Start of the most recent block, which can grow or shrink in place.
    last: Option<usize>,
}

/// Fixed-capacity bump arena.
///
/// Releasing the most recent block rewinds the cursor; releasing any other
/// block only updates bookkeeping. The whole region is reset once no block is
/// live and returned to the system heap when the strategy is dropped.
pub struct ArenaStrategy {
    base: NonNull<u8>,
    layout: Layout,
    cursor: Mutex<ArenaCursor>,
}

// The region is owned exclusively and all cursor access goes through the mutex.
unsafe impl Send for ArenaStrategy {}
unsafe impl Sync for ArenaStrategy {}

impl ArenaStrategy {
    /// Reserves `capacity` bytes up front.
    pub fn new(capacity: usize) -> Result<Self, AllocError> {
        if capacity == 0 {
            return Err(AllocError::InvalidDescriptor("arena capacity must be non-zero"));
        }
        let layout = Layout::from_size_align(capacity, ARENA_ALIGN)
            .map_err(|_| AllocError::InvalidDescriptor("arena capacity overflows"))?;
        let base = NonNull::new(unsafe { std::alloc::alloc(layout) }).ok_or(
            AllocError::OutOfMemory {
                strategy: "arena",
                size: capacity,
            },
        )?;
        Ok(Self {
            base,
            layout,
            cursor: Mutex::new(ArenaCursor {
                offset: 0,
                live: 0,
                last: None,
            }),
        })
    }

    /// Total bytes reserved.
    pub fn capacity(&self) -> usize {
        self.layout.size()
    }

    /// Bytes between the region start and the cursor.
    pub fn used(&self) -> usize {
        self.cursor.lock().offset
    }

    fn offset_of(&self, ptr: NonNull<u8>) -> usize {
        ptr.as_ptr() as usize - self.base.as_ptr() as usize
    }

    fn bump(&self, cursor: &mut ArenaCursor, size: usize) -> Option<NonNull<u8>> {
        let start = align_up(cursor.offset)?;
        let end = start.checked_add(size)?;
        if end > self.capacity() {
            return None;
        }
        cursor.offset = end;
        cursor.live += 1;
        cursor.last = Some(start);
        NonNull::new(unsafe { self.base.as_ptr().add(start) })
    }
}

fn align_up(offset: usize) -> Option<usize> {
    Some(offset.checked_add(ARENA_ALIGN - 1)? & !(ARENA_ALIGN - 1))
}

impl AllocatorStrategy for ArenaStrategy {
    fn name(&self) -> &'static str {
        "arena"
    }

    fn allocate(&self, size: usize) -> Option<NonNull<u8>> {
        let mut cursor = self.cursor.lock();
        self.bump(&mut cursor, size)
    }

    unsafe fn reallocate(
        &self,
        ptr: NonNull<u8>,
        old_size: usize,
        new_size: usize,
    ) -> Option<NonNull<u8>> {
        let mut cursor = self.cursor.lock();
        let start = self.offset_of(ptr);
        if cursor.last == Some(start) {
            let end = start.checked_add(new_size)?;
            if end <= self.capacity() {
                cursor.offset = end;
                return Some(ptr);
            }
            return None;
        }
        let moved = self.bump(&mut cursor, new_size)?;
        // The moved block takes over the old block's live count.
        cursor.live -= 1;
        unsafe {
            std::ptr::copy_nonoverlapping(ptr.as_ptr(), moved.as_ptr(), old_size.min(new_size));
        }
        Some(moved)
    }

    unsafe fn release(&self, ptr: NonNull<u8>, _size: usize) {
        let mut cursor = self.cursor.lock();
        let start = self.offset_of(ptr);
        cursor.live = cursor.live.saturating_sub(1);
        if cursor.live == 0 {
            cursor.offset = 0;
            cursor.last = None;
        } else if cursor.last == Some(start) {
            cursor.offset = start;
            cursor.last = None;
        }
    }
}

impl Drop for ArenaStrategy {
    fn drop(&mut self) {
        unsafe { std::alloc::dealloc(self.base.as_ptr(), self.layout) }
    }
}

/// Opaque allocator handle owned by the caller.
pub struct Allocator {
    strategy: Box<dyn AllocatorStrategy>,
    /// Outstanding blocks: address -> size.
    live: Mutex<HashMap<usize, usize>>,
}

impl fmt::Debug for Allocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Allocator")
            .field("strategy", &self.strategy.name())
            .field("outstanding", &self.outstanding())
            .finish()
    }
}

impl Allocator {
    /// Builds a handle from a descriptor.
    pub fn create(descriptor: AllocatorDescriptor) -> Result<Self, AllocError> {
        let strategy: Box<dyn AllocatorStrategy> = match descriptor {
            AllocatorDescriptor::Std(fns) => Box::new(StdStrategy::new(fns)?),
            AllocatorDescriptor::Arena { capacity } => Box::new(ArenaStrategy::new(capacity)?),
            AllocatorDescriptor::Custom(strategy) => strategy,
        };
        debug!(strategy = strategy.name(), "allocator created");
        Ok(Self {
            strategy,
            live: Mutex::new(HashMap::new()),
        })
    }

    /// Shorthand for a handle over the C library heap.
    pub fn std() -> Self {
        Self {
            strategy: Box::new(StdStrategy::libc()),
            live: Mutex::new(HashMap::new()),
        }
    }

    /// Name of the underlying strategy.
    pub fn strategy_name(&self) -> &'static str {
        self.strategy.name()
    }

    /// Number of blocks handed out and not yet freed.
    pub fn outstanding(&self) -> usize {
        self.live.lock().len()
    }

    /// Allocates `size` bytes.
    pub fn alloc(&self, size: usize) -> Result<NonNull<u8>, AllocError> {
        if size == 0 {
            return Err(AllocError::ZeroSize);
        }
        let ptr = self.strategy.allocate(size).ok_or(AllocError::OutOfMemory {
            strategy: self.strategy.name(),
            size,
        })?;
        self.live.lock().insert(ptr.as_ptr() as usize, size);
        Ok(ptr)
    }

    /// Resizes an outstanding block. On failure the original block is untouched.
    ///
    /// # Safety
    /// `ptr` must not be used after a successful call; nothing may still hold a
    /// reference into the block.
    pub unsafe fn realloc(&self, ptr: NonNull<u8>, size: usize) -> Result<NonNull<u8>, AllocError> {
        if size == 0 {
            return Err(AllocError::ZeroSize);
        }
        let mut live = self.live.lock();
        let old_size = *live
            .get(&(ptr.as_ptr() as usize))
            .ok_or(AllocError::ForeignPointer)?;
        let moved = unsafe { self.strategy.reallocate(ptr, old_size, size) }.ok_or(
            AllocError::OutOfMemory {
                strategy: self.strategy.name(),
                size,
            },
        )?;
        live.remove(&(ptr.as_ptr() as usize));
        live.insert(moved.as_ptr() as usize, size);
        Ok(moved)
    }

    /// Frees an outstanding block by pointer.
    ///
    /// # Safety
    /// Nothing may read or write the block after this call.
    pub unsafe fn free(&self, ptr: NonNull<u8>) -> Result<(), AllocError> {
        let size = self
            .live
            .lock()
            .remove(&(ptr.as_ptr() as usize))
            .ok_or(AllocError::ForeignPointer)?;
        unsafe { self.strategy.release(ptr, size) };
        Ok(())
    }

    /// Allocates exactly `bytes.len()` bytes and copies `bytes` in.
    pub fn alloc_buffer(&self, bytes: &[u8]) -> Result<AllocatedBuffer<'_>, AllocError> {
        let ptr = self.alloc(bytes.len())?;
        unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr.as_ptr(), bytes.len()) };
        Ok(AllocatedBuffer {
            ptr,
            len: bytes.len(),
            allocator: self,
        })
    }

    /// Releases a buffer produced by this allocator.
    ///
    /// A buffer from another allocator is refused with [`AllocError::ForeignBuffer`]
    /// and goes back to the allocator that produced it.
    pub fn release(&self, buffer: AllocatedBuffer<'_>) -> Result<(), AllocError> {
        if !std::ptr::eq(buffer.allocator, self) {
            warn!(
                strategy = self.strategy.name(),
                "refusing to release a buffer owned by another allocator"
            );
            return Err(AllocError::ForeignBuffer);
        }
        let (ptr, _) = buffer.into_raw_parts();
        let released = unsafe { self.free(ptr) };
        assert_invariant(
            ALLOC_SAME_INSTANCE,
            released.is_ok(),
            "buffer released through the allocator that produced it",
            Some("Allocator::release"),
        );
        released
    }

    /// Destroys the handle. Fails, handing the allocator back, while any block
    /// is outstanding.
    pub fn destroy(self) -> Result<(), DestroyError> {
        let outstanding = self.outstanding();
        if outstanding > 0 {
            return Err(DestroyError {
                allocator: self,
                outstanding,
            });
        }
        debug!(strategy = self.strategy.name(), "allocator destroyed");
        Ok(())
    }
}

impl Drop for Allocator {
    fn drop(&mut self) {
        let outstanding = self.live.get_mut().len();
        if outstanding > 0 {
            warn!(
                strategy = self.strategy.name(),
                outstanding, "allocator dropped with outstanding allocations"
            );
        }
    }
}

/// A block owned by the caller and tied to the allocator that produced it.
///
/// Dropping the buffer releases it through its allocator; use
/// [`Allocator::release`] to release it explicitly and observe the result.
pub struct AllocatedBuffer<'a> {
    ptr: NonNull<u8>,
    len: usize,
    allocator: &'a Allocator,
}

// The block is owned exclusively and the allocator handle is Sync.
unsafe impl Send for AllocatedBuffer<'_> {}
unsafe impl Sync for AllocatedBuffer<'_> {}

impl<'a> AllocatedBuffer<'a> {
    pub fn as_bytes(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The allocator this buffer must be released through.
    pub fn allocator(&self) -> &'a Allocator {
        self.allocator
    }

    /// Gives up ownership without releasing. The block stays outstanding on
    /// its allocator and must be freed through [`Allocator::free`].
    pub fn into_raw_parts(self) -> (NonNull<u8>, usize) {
        let parts = (self.ptr, self.len);
        std::mem::forget(self);
        parts
    }
}

impl Deref for AllocatedBuffer<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.as_bytes()
    }
}

impl fmt::Debug for AllocatedBuffer<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AllocatedBuffer")
            .field("len", &self.len)
            .field("strategy", &self.allocator.strategy_name())
            .finish()
    }
}

impl Drop for AllocatedBuffer<'_> {
    fn drop(&mut self) {
        let _ = unsafe { self.allocator.free(self.ptr) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn std_roundtrip_through_libc() {
        let allocator = Allocator::create(AllocatorDescriptor::Std(StdAllocatorFns::libc())).unwrap();
        let buffer = allocator.alloc_buffer(b"{\"py\":[]}").unwrap();
        assert_eq!(buffer.as_bytes(), b"{\"py\":[]}");
        assert_eq!(allocator.outstanding(), 1);
        allocator.release(buffer).unwrap();
        assert_eq!(allocator.outstanding(), 0);
        allocator.destroy().unwrap();
    }

    #[test]
    fn std_descriptor_requires_every_function() {
        let fns = StdAllocatorFns {
            free: None,
            ..StdAllocatorFns::libc()
        };
        let err = Allocator::create(AllocatorDescriptor::Std(fns)).unwrap_err();
        assert_eq!(err, AllocError::InvalidDescriptor("missing free"));
    }

    #[test]
    fn zero_size_is_rejected() {
        let allocator = Allocator::std();
        assert_eq!(allocator.alloc(0), Err(AllocError::ZeroSize));
        assert!(matches!(allocator.alloc_buffer(b""), Err(AllocError::ZeroSize)));
    }

    #[test]
    fn arena_exhaustion_is_out_of_memory() {
        let allocator = Allocator::create(AllocatorDescriptor::Arena { capacity: 32 }).unwrap();
        let first = allocator.alloc(20).unwrap();
        let err = allocator.alloc(20).unwrap_err();
        assert_eq!(
            err,
            AllocError::OutOfMemory {
                strategy: "arena",
                size: 20
            }
        );
        unsafe { allocator.free(first).unwrap() };
        allocator.destroy().unwrap();
    }

    #[test]
    fn arena_rewinds_after_release() {
        let arena = ArenaStrategy::new(64).unwrap();
        let a = arena.allocate(10).unwrap();
        let b = arena.allocate(10).unwrap();
        assert_eq!(arena.used(), 26);
        unsafe { arena.release(b, 10) };
        assert_eq!(arena.used(), 16);
        unsafe { arena.release(a, 10) };
        assert_eq!(arena.used(), 0);
    }

    #[test]
    fn arena_rejects_zero_capacity() {
        assert!(matches!(
            ArenaStrategy::new(0),
            Err(AllocError::InvalidDescriptor(_))
        ));
    }

    #[test]
    fn realloc_preserves_contents() {
        for allocator in [
            Allocator::std(),
            Allocator::create(AllocatorDescriptor::Arena { capacity: 256 }).unwrap(),
        ] {
            let ptr = allocator.alloc(4).unwrap();
            unsafe { std::ptr::copy_nonoverlapping(b"abcd".as_ptr(), ptr.as_ptr(), 4) };
            let grown = unsafe { allocator.realloc(ptr, 64).unwrap() };
            let head = unsafe { std::slice::from_raw_parts(grown.as_ptr(), 4) };
            assert_eq!(head, b"abcd");
            assert_eq!(allocator.outstanding(), 1);
            unsafe { allocator.free(grown).unwrap() };
            allocator.destroy().unwrap();
        }
    }

    #[test]
    fn free_of_unknown_pointer_is_rejected() {
        let a = Allocator::std();
        let b = Allocator::std();
        let ptr = a.alloc(8).unwrap();
        assert_eq!(unsafe { b.free(ptr) }, Err(AllocError::ForeignPointer));
        unsafe { a.free(ptr).unwrap() };
        assert_eq!(unsafe { a.free(ptr) }, Err(AllocError::ForeignPointer));
    }

    #[test]
    fn release_through_other_allocator_is_refused() {
        let a = Allocator::std();
        let b = Allocator::std();
        let buffer = a.alloc_buffer(b"{}").unwrap();
        assert_eq!(b.release(buffer), Err(AllocError::ForeignBuffer));
        // Refused buffers still go back to their own allocator.
        assert_eq!(a.outstanding(), 0);
        assert_eq!(b.outstanding(), 0);
    }

    #[test]
    fn destroy_with_outstanding_hands_allocator_back() {
        let allocator = Allocator::std();
        let ptr = allocator.alloc(16).unwrap();
        let err = allocator.destroy().unwrap_err();
        assert_eq!(err.outstanding, 1);
        let allocator = err.allocator;
        unsafe { allocator.free(ptr).unwrap() };
        allocator.destroy().unwrap();
    }
}
