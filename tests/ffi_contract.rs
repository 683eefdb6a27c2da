use polyinspect::ffi::*;
use polyinspect::harness::{node_loader, python_loader};
use polyinspect::{Runtime, StdAllocatorFns};
use std::ffi::{c_char, c_void, CString};
use std::ptr;

struct Session {
    runtime: *mut Runtime,
}

impl Session {
    fn start() -> Self {
        let runtime = polyinspect_runtime_new();
        assert!(!runtime.is_null());
        unsafe {
            (*runtime).register_loader(python_loader());
            (*runtime).register_loader(node_loader());
            assert_eq!(polyinspect_initialize(runtime), POLYINSPECT_OK);
        }
        let session = Self { runtime };
        session.load("py", "test.py");
        session.load("node", "test.js");
        session
    }

    fn load(&self, tag: &str, script: &str) -> i32 {
        let tag = CString::new(tag).unwrap();
        let script = CString::new(script).unwrap();
        let scripts = [script.as_ptr()];
        unsafe { polyinspect_load_from_file(self.runtime, tag.as_ptr(), scripts.as_ptr(), 1) }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        unsafe {
            polyinspect_destroy(self.runtime);
            polyinspect_runtime_free(self.runtime);
        }
    }
}

fn std_allocator() -> *mut polyinspect::Allocator {
    let fns = StdAllocatorFns::libc();
    let allocator = unsafe {
        polyinspect_allocator_create(
            POLYINSPECT_ALLOCATOR_STD,
            (&fns as *const StdAllocatorFns).cast::<c_void>(),
        )
    };
    assert!(!allocator.is_null());
    allocator
}

unsafe fn copy_out(buffer: *const c_char, size: usize) -> String {
    let bytes = unsafe { std::slice::from_raw_parts(buffer.cast::<u8>(), size) };
    String::from_utf8(bytes.to_vec()).unwrap()
}

#[test]
fn inspect_through_std_allocator() {
    let session = Session::start();
    let allocator = std_allocator();

    let mut size = 0usize;
    let buffer = unsafe { polyinspect_inspect(session.runtime, &mut size, allocator) };
    assert!(!buffer.is_null());
    assert!(size > 0);
    let data = unsafe { copy_out(buffer, size) };
    assert!(data.starts_with('{'));
    assert!(data.contains("python_test_function"));
    assert!(data.contains("NodeTestClass"));

    unsafe {
        assert_eq!(polyinspect_allocator_free(allocator, buffer.cast()), POLYINSPECT_OK);
        assert_eq!(polyinspect_allocator_destroy(allocator), POLYINSPECT_OK);
    }
}

#[test]
fn inspect_is_idempotent_over_ffi() {
    let session = Session::start();
    let allocator = std_allocator();
    let mut first: Option<String> = None;
    for _ in 0..3 {
        let mut size = 0usize;
        let buffer = unsafe { polyinspect_inspect(session.runtime, &mut size, allocator) };
        assert!(!buffer.is_null());
        let result = unsafe { copy_out(buffer, size) };
        unsafe { polyinspect_allocator_free(allocator, buffer.cast()) };
        match &first {
            None => first = Some(result),
            Some(first) => assert_eq!(&result, first),
        }
    }
    assert_eq!(unsafe { polyinspect_allocator_destroy(allocator) }, POLYINSPECT_OK);
}

#[test]
fn null_allocator_uses_default_heap() {
    let session = Session::start();
    let mut size = 0usize;
    let buffer = unsafe { polyinspect_inspect(session.runtime, &mut size, ptr::null()) };
    assert!(!buffer.is_null());
    assert!(size > 0);
    unsafe { polyinspect_free(buffer) };
}

#[test]
fn destroy_with_outstanding_buffer_is_busy() {
    let session = Session::start();
    let allocator = std_allocator();
    let mut size = 0usize;
    let buffer = unsafe { polyinspect_inspect(session.runtime, &mut size, allocator) };
    assert!(!buffer.is_null());
    unsafe {
        assert_eq!(polyinspect_allocator_destroy(allocator), POLYINSPECT_BUSY);
        assert_eq!(polyinspect_allocator_free(allocator, buffer.cast()), POLYINSPECT_OK);
        assert_eq!(polyinspect_allocator_destroy(allocator), POLYINSPECT_OK);
    }
}

#[test]
fn foreign_pointer_is_rejected() {
    let session = Session::start();
    let owner = std_allocator();
    let other = std_allocator();
    let mut size = 0usize;
    let buffer = unsafe { polyinspect_inspect(session.runtime, &mut size, owner) };
    unsafe {
        assert_eq!(polyinspect_allocator_free(other, buffer.cast()), POLYINSPECT_ERROR);
        assert_eq!(polyinspect_allocator_free(owner, buffer.cast()), POLYINSPECT_OK);
        assert_eq!(polyinspect_allocator_destroy(other), POLYINSPECT_OK);
        assert_eq!(polyinspect_allocator_destroy(owner), POLYINSPECT_OK);
    }
}

#[test]
fn arena_allocator_over_ffi() {
    let session = Session::start();
    let ctx = ArenaAllocatorCtx { capacity: 32 * 1024 };
    let allocator = unsafe {
        polyinspect_allocator_create(
            POLYINSPECT_ALLOCATOR_ARENA,
            (&ctx as *const ArenaAllocatorCtx).cast::<c_void>(),
        )
    };
    assert!(!allocator.is_null());
    let mut size = 0usize;
    let buffer = unsafe { polyinspect_inspect(session.runtime, &mut size, allocator) };
    assert!(!buffer.is_null());
    unsafe {
        assert_eq!(polyinspect_allocator_free(allocator, buffer.cast()), POLYINSPECT_OK);
        assert_eq!(polyinspect_allocator_destroy(allocator), POLYINSPECT_OK);
    }
}

#[test]
fn failed_load_is_nonfatal() {
    let session = Session::start();
    assert_eq!(session.load("rb", "test.rb"), POLYINSPECT_ERROR);
    let mut size = 0usize;
    let buffer = unsafe { polyinspect_inspect(session.runtime, &mut size, ptr::null()) };
    assert!(!buffer.is_null());
    let data = unsafe { copy_out(buffer, size) };
    unsafe { polyinspect_free(buffer) };
    assert!(!data.contains("\"rb\""));
    assert!(data.contains("\"py\""));
}

#[test]
fn inspect_after_destroy_fails() {
    let session = Session::start();
    unsafe { polyinspect_destroy(session.runtime) };
    let mut size = 1usize;
    let buffer = unsafe { polyinspect_inspect(session.runtime, &mut size, ptr::null()) };
    assert!(buffer.is_null());
    assert_eq!(size, 0);
}
