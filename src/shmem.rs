//! Shared-memory region acquisition.
//!
//! A [`SharedRegion`] is the raw byte range a pool is built in. The default
//! provider maps an anonymous `MAP_SHARED` region, which child processes
//! inherit across `fork`. A region obtained elsewhere (a named mapping, a
//! SysV segment) can be wrapped with [`SharedRegion::from_raw`]; the pool
//! never frees the backing region, only objects within it.

use core::ptr::NonNull;

use crate::error::{Error, Result};

lazy_static! {
    static ref HOST_PAGE_SIZE: usize =
        unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize };
}

/// The kernel page size, read once per process.
pub fn host_page_size() -> usize {
    *HOST_PAGE_SIZE
}

/// A mapped byte range suitable for cross-process sharing.
pub struct SharedRegion {
    addr: NonNull<u8>,
    len: usize,
    owned: bool,
}

unsafe impl Send for SharedRegion {}
unsafe impl Sync for SharedRegion {}

impl SharedRegion {
    /// Map an anonymous shared region of at least `len` bytes, rounded up to
    /// the kernel page size. The mapping is inherited by forked children.
    pub fn create_anon(len: usize) -> Result<SharedRegion> {
        let page = host_page_size();
        let len = len
            .checked_add(page - 1)
            .ok_or(Error::RegionTooSmall(len))?
            & !(page - 1);
        if len == 0 {
            return Err(Error::RegionTooSmall(0));
        }

        let addr = unsafe {
            libc::mmap(
                core::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
            return Err(Error::Sys("mmap", errno));
        }

        log::debug!("mapped shared region of {len} bytes at {addr:p}");
        Ok(SharedRegion {
            addr: unsafe { NonNull::new_unchecked(addr.cast()) },
            len,
            owned: true,
        })
    }

    /// Wrap an externally owned mapping. The region is not unmapped on drop.
    ///
    /// # Safety
    ///
    /// `addr..addr + len` must stay mapped, readable and writable for the
    /// lifetime of the returned value and of every pool built in it.
    pub unsafe fn from_raw(addr: NonNull<u8>, len: usize) -> SharedRegion {
        SharedRegion {
            addr,
            len,
            owned: false,
        }
    }

    pub fn as_ptr(&self) -> NonNull<u8> {
        self.addr
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Drop for SharedRegion {
    fn drop(&mut self) {
        if !self.owned {
            return;
        }
        let rc = unsafe { libc::munmap(self.addr.as_ptr().cast(), self.len) };
        if rc != 0 {
            log::error!("munmap of {} bytes at {:p} failed", self.len, self.addr);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anon_region_is_page_aligned_and_writable() {
        let region = SharedRegion::create_anon(10_000).unwrap();
        let addr = region.as_ptr().as_ptr() as usize;
        assert_eq!(addr % host_page_size(), 0);
        assert!(region.len() >= 10_000);
        assert_eq!(region.len() % host_page_size(), 0);

        unsafe {
            region.as_ptr().as_ptr().write_bytes(0xa5, region.len());
            assert_eq!(*region.as_ptr().as_ptr().add(region.len() - 1), 0xa5);
        }
    }

    #[test]
    fn zero_length_region_is_rejected() {
        assert!(matches!(
            SharedRegion::create_anon(0),
            Err(Error::RegionTooSmall(0))
        ));
    }
}
