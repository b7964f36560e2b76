/// Cross-process, robust mutex using POSIX `pthread_mutex_t` with the
/// `PTHREAD_PROCESS_SHARED` and `PTHREAD_MUTEX_ROBUST` attributes.
///
/// The mutex lives in shared memory (the segment's service zone) so it's
/// accessible from every attaching process. It guards only the allocator
/// bitmap (`shm::bitmap::find_block`) — header mutation is intentionally
/// unsynchronized beyond that, per the spec's concurrency model.
use std::io;

/// `pthread_mutex_t` is 40 bytes on x86_64 Linux glibc, up to ~64 bytes on
/// musl/other platforms. `size_of` captures whatever the target actually
/// needs, so the service zone is never over- or under-allocated.
pub const MUTEX_SIZE: usize = std::mem::size_of::<libc::pthread_mutex_t>();

/// A handle to a cross-process robust mutex stored in shared memory.
pub struct ShmMutex {
    mutex_ptr: *mut libc::pthread_mutex_t,
}

unsafe impl Send for ShmMutex {}
unsafe impl Sync for ShmMutex {}

impl ShmMutex {
    /// Initialize a new robust, process-shared mutex at the given memory
    /// location.
    ///
    /// # Safety
    /// `ptr` must point to at least `MUTEX_SIZE` bytes of shared memory
    /// that are zeroed or uninitialized.
    pub unsafe fn init(ptr: *mut u8) -> io::Result<Self> {
        let mutex_ptr = ptr as *mut libc::pthread_mutex_t;

        let mut attr: libc::pthread_mutexattr_t = std::mem::zeroed();
        let ret = libc::pthread_mutexattr_init(&mut attr);
        if ret != 0 {
            return Err(io::Error::from_raw_os_error(ret));
        }

        let ret = libc::pthread_mutexattr_setpshared(&mut attr, libc::PTHREAD_PROCESS_SHARED);
        if ret != 0 {
            libc::pthread_mutexattr_destroy(&mut attr);
            return Err(io::Error::from_raw_os_error(ret));
        }

        let ret = libc::pthread_mutexattr_setrobust(&mut attr, libc::PTHREAD_MUTEX_ROBUST);
        if ret != 0 {
            libc::pthread_mutexattr_destroy(&mut attr);
            return Err(io::Error::from_raw_os_error(ret));
        }

        let ret = libc::pthread_mutex_init(mutex_ptr, &attr);
        libc::pthread_mutexattr_destroy(&mut attr);
        if ret != 0 {
            return Err(io::Error::from_raw_os_error(ret));
        }

        Ok(ShmMutex { mutex_ptr })
    }

    /// Attach to an already-initialized mutex at the given memory location.
    ///
    /// # Safety
    /// `ptr` must point to a previously initialized, process-shared, robust
    /// `pthread_mutex_t` in shared memory.
    pub unsafe fn from_existing(ptr: *mut u8) -> Self {
        ShmMutex {
            mutex_ptr: ptr as *mut libc::pthread_mutex_t,
        }
    }

    /// Acquire the mutex. Blocks until available.
    ///
    /// If the previous owner died while holding it, `pthread_mutex_lock`
    /// returns `EOWNERDEAD`; this is handled internally by marking the
    /// mutex consistent and proceeding, invisibly to the caller. If marking
    /// consistent itself fails, the condition is logged and the lock is
    /// still considered held (matching the reference implementation's
    /// `perror`-and-continue behavior).
    pub fn lock(&self) {
        unsafe {
            let ret = libc::pthread_mutex_lock(self.mutex_ptr);
            if ret == libc::EOWNERDEAD {
                let consistent = libc::pthread_mutex_consistent(self.mutex_ptr);
                if consistent != 0 {
                    log::error!(
                        "pthread_mutex_consistent failed after EOWNERDEAD: errno {consistent}"
                    );
                }
            } else {
                debug_assert_eq!(ret, 0, "pthread_mutex_lock failed: {ret}");
            }
        }
    }

    /// Release the mutex.
    pub fn unlock(&self) {
        unsafe {
            let ret = libc::pthread_mutex_unlock(self.mutex_ptr);
            debug_assert_eq!(ret, 0, "pthread_mutex_unlock failed: {ret}");
        }
    }

    /// Destroy the mutex. Only call when no other process holds or will
    /// acquire it.
    #[allow(dead_code)]
    pub unsafe fn destroy(&self) {
        libc::pthread_mutex_destroy(self.mutex_ptr);
    }
}
