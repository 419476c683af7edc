//! CPU data cache maintenance for buffers shared with the MMC controller.
//!
//! The controller moves bytes over the bus, not through the CPU cache, so
//! every buffer handed to or received from it must be bracketed with the
//! operations here: `clean` before a device read, `invalidate` before the
//! CPU reads device-written memory.

pub const LINE_SIZE: usize = 32;

/// A CPU data cache maintained over byte ranges and, occasionally, in full.
pub trait CacheController {
    /// Write dirty lines covering `buf` back to memory; lines remain valid.
    /// Call before the device reads `buf`.
    fn clean(&self, buf: &[u8]);

    /// Drop lines covering `buf` from the cache without write-back. Call
    /// before the CPU reads memory the device has just written; any
    /// unflushed CPU writes in range are lost.
    fn invalidate(&self, buf: &mut [u8]);

    /// Write back then drop lines covering `buf`.
    fn clean_invalidate(&self, buf: &mut [u8]);

    fn clean_all(&self);
    fn invalidate_all(&self);
    fn clean_invalidate_all(&self);
}

#[inline]
fn align_down(addr: usize) -> usize {
    addr & !(LINE_SIZE - 1)
}

#[inline]
fn align_up(addr: usize) -> usize {
    (addr + LINE_SIZE - 1) & !(LINE_SIZE - 1)
}

/// ARMv7-A (Cortex-A7-class) cache controller driving CP15 directly.
#[derive(Debug, Default, Clone, Copy)]
pub struct Armv7aCache;

#[cfg(target_arch = "arm")]
mod armv7a {
    use super::*;

    #[inline]
    fn dsb() {
        unsafe { core::arch::asm!("dsb sy", options(nostack, preserves_flags)) }
    }

    // SAFETY: each of these issues a single CP15 cache-maintenance MCR for
    // one cache line address, per the ARMv7-A architecture reference.
    // `p` does not need to be a valid pointer for invalidate/clean: the
    // operation addresses the cache by virtual address, not by dereference.
    #[inline]
    unsafe fn clean_line(p: usize) {
        core::arch::asm!("mcr p15, 0, {0}, c7, c10, 1", in(reg) p, options(nostack, preserves_flags));
    }

    #[inline]
    unsafe fn invalidate_line(p: usize) {
        core::arch::asm!("mcr p15, 0, {0}, c7, c6, 1", in(reg) p, options(nostack, preserves_flags));
    }

    #[inline]
    unsafe fn clean_invalidate_line(p: usize) {
        core::arch::asm!("mcr p15, 0, {0}, c7, c14, 1", in(reg) p, options(nostack, preserves_flags));
    }

    fn for_each_line(start: usize, end: usize, op: unsafe fn(usize)) {
        let mut p = start;
        while p < end {
            // SAFETY: `op` is one of the line-granularity MCR wrappers above.
            unsafe { op(p) };
            p += LINE_SIZE;
        }
        dsb();
    }

    impl CacheController for super::Armv7aCache {
        fn clean(&self, buf: &[u8]) {
            let start = align_down(buf.as_ptr() as usize);
            let end = align_up(buf.as_ptr() as usize + buf.len());
            for_each_line(start, end, clean_line);
        }

        fn invalidate(&self, buf: &mut [u8]) {
            let start = align_down(buf.as_ptr() as usize);
            let end = align_up(buf.as_ptr() as usize + buf.len());
            for_each_line(start, end, invalidate_line);
        }

        fn clean_invalidate(&self, buf: &mut [u8]) {
            let start = align_down(buf.as_ptr() as usize);
            let end = align_up(buf.as_ptr() as usize + buf.len());
            for_each_line(start, end, clean_invalidate_line);
        }

        fn clean_all(&self) {
            // SAFETY: whole-cache clean, operand is ignored by the architecture.
            unsafe {
                core::arch::asm!("mcr p15, 0, {0}, c7, c10, 0", in(reg) 0u32, options(nostack, preserves_flags));
            }
            dsb();
        }

        fn invalidate_all(&self) {
            // SAFETY: whole-cache invalidate, operand is ignored.
            unsafe {
                core::arch::asm!("mcr p15, 0, {0}, c7, c6, 0", in(reg) 0u32, options(nostack, preserves_flags));
            }
            dsb();
        }

        fn clean_invalidate_all(&self) {
            // SAFETY: whole-cache clean+invalidate, operand is ignored.
            unsafe {
                core::arch::asm!("mcr p15, 0, {0}, c7, c14, 0", in(reg) 0u32, options(nostack, preserves_flags));
            }
            dsb();
        }
    }
}

#[cfg(not(target_arch = "arm"))]
impl CacheController for Armv7aCache {
    fn clean(&self, _buf: &[u8]) {
        unreachable!("Armv7aCache is only usable on target_arch = \"arm\"")
    }
    fn invalidate(&self, _buf: &mut [u8]) {
        unreachable!("Armv7aCache is only usable on target_arch = \"arm\"")
    }
    fn clean_invalidate(&self, _buf: &mut [u8]) {
        unreachable!("Armv7aCache is only usable on target_arch = \"arm\"")
    }
    fn clean_all(&self) {
        unreachable!("Armv7aCache is only usable on target_arch = \"arm\"")
    }
    fn invalidate_all(&self) {
        unreachable!("Armv7aCache is only usable on target_arch = \"arm\"")
    }
    fn clean_invalidate_all(&self) {
        unreachable!("Armv7aCache is only usable on target_arch = \"arm\"")
    }
}

/// No-op cache controller for hosted builds and tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullCache;

impl CacheController for NullCache {
    fn clean(&self, buf: &[u8]) {
        log::trace!("NullCache::clean {} bytes", buf.len());
    }
    fn invalidate(&self, buf: &mut [u8]) {
        log::trace!("NullCache::invalidate {} bytes", buf.len());
    }
    fn clean_invalidate(&self, buf: &mut [u8]) {
        log::trace!("NullCache::clean_invalidate {} bytes", buf.len());
    }
    fn clean_all(&self) {
        log::trace!("NullCache::clean_all");
    }
    fn invalidate_all(&self) {
        log::trace!("NullCache::invalidate_all");
    }
    fn clean_invalidate_all(&self) {
        log::trace!("NullCache::clean_invalidate_all");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_down_rounds_to_line_boundary() {
        assert_eq!(align_down(33), 32);
        assert_eq!(align_down(32), 32);
        assert_eq!(align_down(1), 0);
    }

    #[test]
    fn align_up_rounds_to_line_boundary() {
        assert_eq!(align_up(1), 32);
        assert_eq!(align_up(32), 32);
        assert_eq!(align_up(33), 64);
    }

    #[test]
    fn null_cache_is_usable_as_trait_object() {
        let cache = NullCache;
        let mut buf = [0u8; 512];
        cache.clean(&buf);
        cache.invalidate(&mut buf);
        cache.clean_invalidate(&mut buf);
        cache.clean_all();
        cache.invalidate_all();
        cache.clean_invalidate_all();
    }
}
