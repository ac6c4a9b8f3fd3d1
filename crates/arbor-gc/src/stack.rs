//! Stack bounds and register capture for conservative root scanning.
//!
//! A thread that parks at a safepoint records the lowest address of its
//! live stack and spills its callee-saved registers into a buffer owned by
//! its thread state. The collector then scans that buffer together with the
//! stack words between the recorded end and the stack start.

/// Number of register words captured at a safepoint.
pub const REGISTER_COUNT: usize = 12;

/// Bounds of a thread's stack.
#[derive(Debug, Clone, Copy)]
pub struct StackBounds {
    /// The bottom of the stack (highest address).
    pub bottom: usize,
    /// The top of the stack (lowest address).
    pub top: usize,
}

/// Retrieve the stack bounds for the current thread.
#[cfg(miri)]
pub fn get_stack_bounds() -> StackBounds {
    // Miri does not support direct access to the stack bounds.
    StackBounds { bottom: 0, top: 0 }
}

/// Retrieve the stack bounds for the current thread.
#[cfg(all(target_os = "linux", not(miri)))]
pub fn get_stack_bounds() -> StackBounds {
    use libc::{
        pthread_attr_destroy, pthread_attr_getstack, pthread_attr_t, pthread_getattr_np,
        pthread_self,
    };

    unsafe {
        let mut attr: pthread_attr_t = std::mem::zeroed();
        let ret = pthread_getattr_np(pthread_self(), &raw mut attr);
        assert!(ret == 0, "pthread_getattr_np failed");

        let mut stackaddr: *mut libc::c_void = std::ptr::null_mut();
        let mut stacksize: libc::size_t = 0;
        let ret = pthread_attr_getstack(&raw const attr, &raw mut stackaddr, &raw mut stacksize);
        pthread_attr_destroy(&raw mut attr);
        assert!(ret == 0, "pthread_attr_getstack failed");

        StackBounds {
            bottom: (stackaddr as usize) + stacksize,
            top: stackaddr as usize,
        }
    }
}

/// Retrieve the stack bounds for the current thread.
#[cfg(all(target_os = "macos", not(miri)))]
pub fn get_stack_bounds() -> StackBounds {
    unsafe {
        let thread = libc::pthread_self();
        let bottom = libc::pthread_get_stackaddr_np(thread) as usize;
        let size = libc::pthread_get_stacksize_np(thread);
        StackBounds {
            bottom,
            top: bottom - size,
        }
    }
}

/// Retrieve the stack bounds for the current thread.
#[cfg(all(windows, not(miri)))]
pub fn get_stack_bounds() -> StackBounds {
    use windows_sys::Win32::System::Threading::GetCurrentThreadStackLimits;

    let mut low = 0usize;
    let mut high = 0usize;
    // SAFETY: both out-pointers are valid for writes.
    unsafe { GetCurrentThreadStackLimits(&raw mut low, &raw mut high) };
    StackBounds {
        bottom: high,
        top: low,
    }
}

/// Retrieve the stack bounds for the current thread.
#[cfg(all(not(any(target_os = "linux", target_os = "macos", windows)), not(miri)))]
pub fn get_stack_bounds() -> StackBounds {
    // Without platform support only the frames above the attach point are scanned.
    let here = current_stack_position();
    StackBounds {
        bottom: here + (1 << 20),
        top: here,
    }
}

/// Approximate current stack pointer: the address of a local in this frame.
#[inline(never)]
pub fn current_stack_position() -> usize {
    let marker = 0usize;
    std::hint::black_box(std::ptr::addr_of!(marker)) as usize
}

/// Copies the callee-saved registers into `regs`.
///
/// Values living only in registers become visible to the conservative
/// scan through the buffer.
#[inline(never)]
pub fn spill_registers(regs: &mut [usize; REGISTER_COUNT]) {
    *regs = [0; REGISTER_COUNT];
    #[cfg(all(target_arch = "x86_64", not(miri)))]
    // SAFETY: writes six words into `regs`, which holds `REGISTER_COUNT` words.
    unsafe {
        std::arch::asm!(
            "mov [{0}], rbx",
            "mov [{0} + 8], rbp",
            "mov [{0} + 16], r12",
            "mov [{0} + 24], r13",
            "mov [{0} + 32], r14",
            "mov [{0} + 40], r15",
            in(reg) regs.as_mut_ptr(),
            options(nostack, preserves_flags),
        );
    }
    #[cfg(all(target_arch = "aarch64", not(miri)))]
    // SAFETY: writes eleven words into `regs`, which holds `REGISTER_COUNT` words.
    unsafe {
        std::arch::asm!(
            "stp x19, x20, [{0}]",
            "stp x21, x22, [{0}, #16]",
            "stp x23, x24, [{0}, #32]",
            "stp x25, x26, [{0}, #48]",
            "stp x27, x28, [{0}, #64]",
            "str x29, [{0}, #80]",
            in(reg) regs.as_mut_ptr(),
            options(nostack, preserves_flags),
        );
    }
    std::hint::black_box(&*regs);
}

/// Copies the words of `[from, to)` into `out`.
///
/// # Safety
///
/// The range must be readable stack memory of the calling thread.
pub unsafe fn copy_stack_range(from: usize, to: usize, out: &mut Vec<usize>) {
    out.clear();
    let word = std::mem::size_of::<usize>();
    let mut current = from & !(word - 1);
    while current < to {
        // SAFETY: caller guarantees the range is readable.
        out.push(unsafe { std::ptr::read_volatile(current as *const usize) });
        current += word;
    }
}

/// Zeroes the callee-saved registers that are free to clobber, so stale
/// pointers left there by returned frames do not act as roots.
///
/// # Safety
///
/// The caller must not keep live values in `r12`-`r15` across the call.
#[cfg(any(test, feature = "test-util"))]
#[inline(never)]
pub unsafe fn clear_registers() {
    #[cfg(all(target_arch = "x86_64", not(miri)))]
    unsafe {
        std::arch::asm!(
            "xor r12, r12",
            "xor r13, r13",
            "xor r14, r14",
            "xor r15, r15",
            out("r12") _,
            out("r13") _,
            out("r14") _,
            out("r15") _,
        );
    }
    #[cfg(any(not(target_arch = "x86_64"), miri))]
    std::hint::black_box(());
}
