//! The `__ares_*` C ABI consumed by lowered code.
//!
//! The lowering passes rewrite parallel constructs into calls to these
//! symbols. All handles are opaque pointer-sized values; latch handles are
//! counted references so the releasing and awaiting sides can drop theirs in
//! either order.
//!
//! # Contract
//!
//! None of these functions report recoverable errors. The pass must emit
//! code that upholds the protocol:
//! - every unit queued with `__ares_queue_func` calls `__ares_finish_func`
//!   exactly once on its envelope;
//! - every latch from `__ares_create_synch` is awaited exactly once;
//! - every task structure is released exactly once by its wrapper and
//!   awaited at most once per force site.
//!
//! Violations (double-await, double-release, mismatched layouts) are
//! undefined behavior by design.

use std::ffi::c_void;
use std::sync::Arc;

use crate::latch::Latch;
use crate::pool::global_pool;
use crate::task::{FuncArg, QueuedFn, TaskArg};

/// Function pointer plus its raw argument, packaged so the pair can cross
/// into a worker thread.
struct QueuedCall {
    func: QueuedFn,
    arg: *mut c_void,
}

// SAFETY: the ABI contract guarantees the function may run on any thread and
// the argument structure is owned by the queued unit until it is handed back
// through finish/release.
unsafe impl Send for QueuedCall {}

impl QueuedCall {
    unsafe fn run(self) {
        (self.func)(self.arg);
    }
}

/// Allocate a countdown latch requiring `count` releases.
///
/// Returns an opaque handle owning one counted reference; the handle is
/// consumed by `__ares_await_synch`.
#[no_mangle]
pub extern "C" fn __ares_create_synch(count: u32) -> *mut c_void {
    Arc::into_raw(Arc::new(Latch::new(count))) as *mut c_void
}

/// Queue one parallel-for iteration.
///
/// Builds an envelope binding `synch` and `index`, with `args` pointing at
/// the shared captured-variables structure, and submits `fp` to the pool at
/// `priority`.
///
/// # Safety
/// - `synch` must be a live handle from `__ares_create_synch`.
/// - `fp` must be a valid function of the [`QueuedFn`] signature that calls
///   `__ares_finish_func` on its envelope exactly once.
#[no_mangle]
pub unsafe extern "C" fn __ares_queue_func(
    synch: *mut c_void,
    fp: *mut c_void,
    args: *mut c_void,
    index: u32,
    priority: u32,
) {
    let latch = synch as *const Latch;
    // One counted reference per envelope, reclaimed by finish_func.
    Arc::increment_strong_count(latch);

    let envelope = Box::into_raw(Box::new(FuncArg {
        synch: latch,
        index,
        args,
    }));

    let call = QueuedCall {
        func: std::mem::transmute::<*mut c_void, QueuedFn>(fp),
        arg: envelope as *mut c_void,
    };

    global_pool().execute_with_priority(priority, move || call.run());
}

/// Complete one queued unit of work: release the bound latch and free the
/// envelope.
///
/// # Safety
/// `arg` must be the envelope passed to the queued function, and this must
/// be called exactly once per envelope.
#[no_mangle]
pub unsafe extern "C" fn __ares_finish_func(arg: *mut c_void) {
    let envelope = Box::from_raw(arg as *mut FuncArg);
    let latch = Arc::from_raw(envelope.synch);
    latch.count_down();
}

/// Block until the latch is satisfied, then free it.
///
/// # Safety
/// `synch` must be a live handle from `__ares_create_synch`; the handle is
/// dead after this returns. Double-await is undefined behavior.
#[no_mangle]
pub unsafe extern "C" fn __ares_await_synch(synch: *mut c_void) {
    let latch = Arc::from_raw(synch as *const Latch);
    latch.wait();
}

/// Raw allocation for argument/return structures built by the lowering
/// pass. Ownership passes to the generated code.
///
/// Fails fast on out-of-memory rather than returning null.
#[no_mangle]
pub extern "C" fn __ares_alloc(bytes: u64) -> *mut c_void {
    let size = (bytes as usize).max(1);
    let layout = std::alloc::Layout::from_size_align(size, 16)
        .expect("allocation size overflows layout");
    // SAFETY: layout has nonzero size.
    let ptr = unsafe { std::alloc::alloc(layout) };
    if ptr.is_null() {
        std::alloc::handle_alloc_error(layout);
    }
    ptr as *mut c_void
}

/// Queue a discrete task launch.
///
/// `args` is a `TaskArg`-prefixed structure; a fresh one-shot latch is
/// installed into its header and the wrapper is submitted at default
/// priority.
///
/// # Safety
/// - `args` must point at a structure whose first fields match
///   [`TaskArg`]'s layout.
/// - `fp` must be a wrapper of the [`QueuedFn`] signature that stores its
///   return value into the structure and calls
///   `__ares_task_release_future` exactly once.
#[no_mangle]
pub unsafe extern "C" fn __ares_task_queue(fp: *mut c_void, args: *mut c_void) {
    let task = args as *mut TaskArg;
    (*task).synch = Arc::into_raw(Arc::new(Latch::new(1)));

    let call = QueuedCall {
        func: std::mem::transmute::<*mut c_void, QueuedFn>(fp),
        arg: args,
    };

    global_pool().execute(move || call.run());
}

/// Block until the task has released its future, then free the latch.
///
/// # Safety
/// `args` must have been queued via `__ares_task_queue`; at most one await
/// per task structure.
#[no_mangle]
pub unsafe extern "C" fn __ares_task_await_future(args: *mut c_void) {
    let task = args as *mut TaskArg;
    let latch = Arc::from_raw((*task).synch);
    latch.wait();
}

/// Release the task's one-shot latch; called by the wrapper after storing
/// the return value.
///
/// # Safety
/// `args` must have been queued via `__ares_task_queue`; exactly one
/// release per task structure.
#[no_mangle]
pub unsafe extern "C" fn __ares_task_release_future(args: *mut c_void) {
    let task = args as *mut TaskArg;
    let latch = (*task).synch;
    // Counted borrow: keep the latch alive while counting down, without
    // consuming the reference stored in the header (the awaiting side owns
    // that one).
    Arc::increment_strong_count(latch);
    let latch = Arc::from_raw(latch);
    latch.count_down();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    unsafe extern "C" fn counting_body(arg: *mut c_void) {
        let envelope = &*(arg as *const FuncArg);
        let counter = &*(envelope.args as *const AtomicU32);
        counter.fetch_add(1, Ordering::SeqCst);
        __ares_finish_func(arg);
    }

    #[test]
    fn test_parallel_for_protocol() {
        // Simulates the lowered form of a parallel-for over [0, 4).
        let counter = AtomicU32::new(0);
        unsafe {
            let synch = __ares_create_synch(4);
            for index in 0..4 {
                __ares_queue_func(
                    synch,
                    counting_body as *mut c_void,
                    &counter as *const AtomicU32 as *mut c_void,
                    index,
                    1,
                );
            }
            __ares_await_synch(synch);
        }
        assert_eq!(counter.load(Ordering::SeqCst), 4);
    }

    /// Task argument structure as the lowering pass lays it out for
    /// `f(x) = x * 2`: TaskArg header, return slot, parameter.
    #[repr(C)]
    struct DoubleArgs {
        synch: *const crate::latch::Latch,
        depth: u32,
        ret: i64,
        x: i64,
    }

    unsafe extern "C" fn double_wrapper(args: *mut c_void) {
        let a = &mut *(args as *mut DoubleArgs);
        a.ret = a.x * 2;
        __ares_task_release_future(args);
    }

    #[test]
    fn test_task_launch_protocol() {
        unsafe {
            let args = __ares_alloc(std::mem::size_of::<DoubleArgs>() as u64) as *mut DoubleArgs;
            (*args).depth = 0;
            (*args).x = 21;

            __ares_task_queue(double_wrapper as *mut c_void, args as *mut c_void);
            __ares_task_await_future(args as *mut c_void);

            assert_eq!((*args).ret, 42);
        }
    }

    unsafe extern "C" fn noop_body(arg: *mut c_void) {
        __ares_finish_func(arg);
    }

    #[test]
    fn test_many_queued_units() {
        unsafe {
            let synch = __ares_create_synch(256);
            for index in 0..256 {
                __ares_queue_func(
                    synch,
                    noop_body as *mut c_void,
                    std::ptr::null_mut(),
                    index,
                    0,
                );
            }
            __ares_await_synch(synch);
        }
    }
}
