use forestcache_service::memory::{MemoryProbe, ProcessMemory};

/// Measures the resident size of the process and purges the allocator on request.
///
/// jemalloc keeps freed pages in its arenas and only returns them to the system after a decay
/// period. Without a purge, evicting a profile would not lower the resident size the cache checks
/// right after.
#[derive(Clone, Copy, Debug, Default)]
pub struct AllocatorMemory {
    process: ProcessMemory,
}

impl MemoryProbe for AllocatorMemory {
    fn current_usage(&self) -> u64 {
        self.process.current_usage()
    }

    #[cfg(not(target_env = "msvc"))]
    fn reclaim(&self) {
        // `4096` is `MALLCTL_ARENAS_ALL`, which addresses every arena at once.
        const PURGE_ALL_ARENAS: &[u8] = b"arena.4096.purge\0";

        // SAFETY: The name is a nul-terminated control name, and `purge` neither reads nor writes
        // a value, so all value pointers may be null.
        let result = unsafe {
            jemalloc_sys::mallctl(
                PURGE_ALL_ARENAS.as_ptr().cast(),
                std::ptr::null_mut(),
                std::ptr::null_mut(),
                std::ptr::null_mut(),
                0,
            )
        };

        if result != 0 {
            tracing::debug!(code = result, "Failed to purge allocator arenas");
        }
    }
}
