//! C ABI over the runtime, allocator and inspect operations.
//!
//! Every entry point catches panics and reports them as ordinary failure.
//! Failing calls that return a buffer return null and write a size of zero.
//! Handles are opaque pointers owned by the caller and must be freed through
//! the matching `*_free` function.

#![allow(clippy::missing_safety_doc)]

use crate::alloc::{AllocError, Allocator, AllocatorDescriptor, StdAllocatorFns};
use crate::inspect::Snapshot;
use crate::runtime::Runtime;
use std::ffi::{c_char, c_int, c_void, CStr};
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::ptr::{self, NonNull};
use tracing::warn;

/// `ctx` is a `*const StdAllocatorFns`, or null for the C library heap.
pub const POLYINSPECT_ALLOCATOR_STD: c_int = 0;
/// `ctx` is a `*const ArenaAllocatorCtx`.
pub const POLYINSPECT_ALLOCATOR_ARENA: c_int = 1;

pub const POLYINSPECT_OK: c_int = 0;
pub const POLYINSPECT_ERROR: c_int = 1;
/// The allocator still has outstanding blocks and was not destroyed.
pub const POLYINSPECT_BUSY: c_int = 2;

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct ArenaAllocatorCtx {
    pub capacity: usize,
}

fn guarded<T>(fallback: T, f: impl FnOnce() -> T) -> T {
    panic::catch_unwind(AssertUnwindSafe(f)).unwrap_or_else(|_| {
        warn!("panic caught at the C boundary");
        fallback
    })
}

fn status(ok: bool) -> c_int {
    if ok {
        POLYINSPECT_OK
    } else {
        POLYINSPECT_ERROR
    }
}

/// Creates a runtime configured from the environment.
#[no_mangle]
pub extern "C" fn polyinspect_runtime_new() -> *mut Runtime {
    guarded(ptr::null_mut(), || Box::into_raw(Box::new(Runtime::new())))
}

#[no_mangle]
pub unsafe extern "C" fn polyinspect_runtime_free(runtime: *mut Runtime) {
    if runtime.is_null() {
        return;
    }
    guarded((), || drop(unsafe { Box::from_raw(runtime) }))
}

#[no_mangle]
pub unsafe extern "C" fn polyinspect_initialize(runtime: *const Runtime) -> c_int {
    let Some(runtime) = (unsafe { runtime.as_ref() }) else {
        return POLYINSPECT_ERROR;
    };
    guarded(POLYINSPECT_ERROR, || status(runtime.initialize().is_ok()))
}

#[no_mangle]
pub unsafe extern "C" fn polyinspect_destroy(runtime: *const Runtime) {
    if let Some(runtime) = unsafe { runtime.as_ref() } {
        guarded((), || runtime.destroy())
    }
}

/// Loads `count` scripts into backend `tag` through the loader registered for it.
#[no_mangle]
pub unsafe extern "C" fn polyinspect_load_from_file(
    runtime: *const Runtime,
    tag: *const c_char,
    scripts: *const *const c_char,
    count: usize,
) -> c_int {
    let Some(runtime) = (unsafe { runtime.as_ref() }) else {
        return POLYINSPECT_ERROR;
    };
    if tag.is_null() || (scripts.is_null() && count > 0) {
        return POLYINSPECT_ERROR;
    }
    guarded(POLYINSPECT_ERROR, || {
        let Ok(tag) = unsafe { CStr::from_ptr(tag) }.to_str() else {
            return POLYINSPECT_ERROR;
        };
        let raw = if count == 0 {
            &[][..]
        } else {
            unsafe { std::slice::from_raw_parts(scripts, count) }
        };
        let mut paths = Vec::with_capacity(raw.len());
        for &script in raw {
            if script.is_null() {
                return POLYINSPECT_ERROR;
            }
            let path = unsafe { CStr::from_ptr(script) }.to_string_lossy();
            paths.push(PathBuf::from(path.as_ref()));
        }
        status(runtime.load_from_file(tag, &paths).is_ok())
    })
}

/// Builds an allocator of `kind`. Returns null for an unknown kind or a
/// malformed context.
#[no_mangle]
pub unsafe extern "C" fn polyinspect_allocator_create(
    kind: c_int,
    ctx: *const c_void,
) -> *mut Allocator {
    guarded(ptr::null_mut(), || {
        let descriptor = match kind {
            POLYINSPECT_ALLOCATOR_STD => {
                let fns = unsafe { ctx.cast::<StdAllocatorFns>().as_ref() }
                    .copied()
                    .unwrap_or_else(StdAllocatorFns::libc);
                AllocatorDescriptor::Std(fns)
            }
            POLYINSPECT_ALLOCATOR_ARENA => {
                let Some(arena) = (unsafe { ctx.cast::<ArenaAllocatorCtx>().as_ref() }) else {
                    return ptr::null_mut();
                };
                AllocatorDescriptor::Arena {
                    capacity: arena.capacity,
                }
            }
            _ => {
                warn!(kind, "unknown allocator kind");
                return ptr::null_mut();
            }
        };
        match Allocator::create(descriptor) {
            Ok(allocator) => Box::into_raw(Box::new(allocator)),
            Err(err) => {
                warn!(error = %err, "allocator creation failed");
                ptr::null_mut()
            }
        }
    })
}

/// Frees a block produced by `allocator`. Pointers it did not produce are
/// rejected without being touched.
#[no_mangle]
pub unsafe extern "C" fn polyinspect_allocator_free(
    allocator: *const Allocator,
    data: *mut c_void,
) -> c_int {
    let (Some(allocator), Some(data)) = (unsafe { allocator.as_ref() }, NonNull::new(data)) else {
        return POLYINSPECT_ERROR;
    };
    guarded(POLYINSPECT_ERROR, || {
        status(unsafe { allocator.free(data.cast()) }.is_ok())
    })
}

/// Destroys an allocator. With blocks still outstanding the allocator is left
/// intact and [`POLYINSPECT_BUSY`] is returned.
#[no_mangle]
pub unsafe extern "C" fn polyinspect_allocator_destroy(allocator: *mut Allocator) -> c_int {
    if allocator.is_null() {
        return POLYINSPECT_ERROR;
    }
    guarded(POLYINSPECT_ERROR, || {
        // A busy handle must stay valid for the caller, so check before taking it.
        let outstanding = unsafe { (*allocator).outstanding() };
        if outstanding > 0 {
            warn!(outstanding, "allocator destroy refused");
            return POLYINSPECT_BUSY;
        }
        let allocator = *unsafe { Box::from_raw(allocator) };
        match allocator.destroy() {
            Ok(()) => POLYINSPECT_OK,
            Err(_) => POLYINSPECT_BUSY,
        }
    })
}

/// Serializes everything loaded. The returned buffer holds exactly `*size`
/// bytes with no terminator.
///
/// With a null `allocator` the buffer comes from the C library heap and must be
/// released with [`polyinspect_free`]; otherwise release it with
/// [`polyinspect_allocator_free`] on the same allocator.
#[no_mangle]
pub unsafe extern "C" fn polyinspect_inspect(
    runtime: *const Runtime,
    size: *mut usize,
    allocator: *const Allocator,
) -> *mut c_char {
    if size.is_null() {
        return ptr::null_mut();
    }
    unsafe { size.write(0) };
    let Some(runtime) = (unsafe { runtime.as_ref() }) else {
        return ptr::null_mut();
    };
    let allocator = unsafe { allocator.as_ref() };
    guarded(ptr::null_mut(), || {
        let snapshot = match runtime.inspect(allocator) {
            Ok(snapshot) => snapshot,
            Err(err) => {
                warn!(error = %err, "inspect failed");
                return ptr::null_mut();
            }
        };
        let (data, len) = match snapshot {
            Snapshot::Allocated(buffer) => buffer.into_raw_parts(),
            Snapshot::Heap(buffer) => match heap_copy(buffer.as_bytes()) {
                Ok(data) => (data, buffer.as_bytes().len()),
                Err(err) => {
                    warn!(error = %err, "inspect failed");
                    return ptr::null_mut();
                }
            },
        };
        unsafe { size.write(len) };
        data.as_ptr().cast()
    })
}

/// Releases a buffer returned by [`polyinspect_inspect`] without an allocator.
#[no_mangle]
pub unsafe extern "C" fn polyinspect_free(data: *mut c_char) {
    if !data.is_null() {
        unsafe { libc::free(data.cast()) }
    }
}

fn heap_copy(bytes: &[u8]) -> Result<NonNull<u8>, AllocError> {
    let data = NonNull::new(unsafe { libc::malloc(bytes.len()) }.cast::<u8>()).ok_or(
        AllocError::OutOfMemory {
            strategy: "libc",
            size: bytes.len(),
        },
    )?;
    unsafe { ptr::copy_nonoverlapping(bytes.as_ptr(), data.as_ptr(), bytes.len()) };
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_handles_fail_quietly() {
        let mut size = 7usize;
        unsafe {
            assert_eq!(polyinspect_initialize(ptr::null()), POLYINSPECT_ERROR);
            assert!(polyinspect_inspect(ptr::null(), &mut size, ptr::null()).is_null());
            assert_eq!(size, 0);
            assert_eq!(polyinspect_allocator_destroy(ptr::null_mut()), POLYINSPECT_ERROR);
            polyinspect_destroy(ptr::null());
            polyinspect_runtime_free(ptr::null_mut());
            polyinspect_free(ptr::null_mut());
        }
    }

    #[test]
    fn unknown_allocator_kind_is_null() {
        assert!(unsafe { polyinspect_allocator_create(42, ptr::null()) }.is_null());
    }

    #[test]
    fn arena_requires_context() {
        let none = unsafe { polyinspect_allocator_create(POLYINSPECT_ALLOCATOR_ARENA, ptr::null()) };
        assert!(none.is_null());
        let ctx = ArenaAllocatorCtx { capacity: 0 };
        let zero = unsafe {
            polyinspect_allocator_create(POLYINSPECT_ALLOCATOR_ARENA, (&ctx as *const ArenaAllocatorCtx).cast())
        };
        assert!(zero.is_null());
    }

    #[test]
    fn malformed_std_descriptor_is_null() {
        let fns = StdAllocatorFns {
            realloc: None,
            ..StdAllocatorFns::libc()
        };
        let allocator = unsafe {
            polyinspect_allocator_create(POLYINSPECT_ALLOCATOR_STD, (&fns as *const StdAllocatorFns).cast())
        };
        assert!(allocator.is_null());
    }
}
