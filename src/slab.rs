//                      Shared-Memory Slab Pool
// ---------------------------------------------------------------------------
//
// A `SlabPool` partitions one preallocated region into variable-size objects
// with power-of-two size classes, and is safe to use from every process that
// maps the region.
//
// Region layout, in order:
//   1. pool header (mutex state, geometry, bookkeeping offsets)
//   2. slot table: one sentinel descriptor per size class
//   3. stats table: one counter record per size class
//   4. page descriptor table: one record per data page
//   5. data pages, aligned to the pool page size
//
// Requests above half a page take whole runs of pages, found by a first-fit
// scan of the free-run list. Smaller requests are rounded up to a power of
// two and served from a page of that class:
//   - small classes keep an occupancy bitmap in the page's own leading
//     object slots (a descriptor word cannot hold enough bits),
//   - the exact class is the one size whose bitmap is precisely the
//     descriptor's `slab` word,
//   - bigger sub-page classes keep the bitmap in the high half of `slab`
//     and the object shift in the low bits.
//
// Each slot list threads only pages with at least one free object; a page
// that fills up is unlinked and relinked at the head on its first free.
// Freed runs coalesce with both neighbours immediately, so no two free runs
// are ever adjacent.
//
// Every stored reference is a byte offset from the region base. The region
// may therefore be mapped at different addresses in different processes;
// the only requirement is that the base is aligned to the pool page size.

use core::ptr::{addr_of_mut, NonNull};

use static_assertions::const_assert_eq;

use crate::error::{Error, Result};
use crate::page::{
    first_free_bit, PageDesc, PageKind, PrevLink, DESC_SIZE, SLAB_BUSY, SLAB_FREE,
    SLAB_MAP_MASK, SLAB_MAP_SHIFT, SLAB_PAGE_START, SLAB_SHIFT_MASK, WORD_BITS,
};
use crate::shmem::{host_page_size, SharedRegion};
use crate::shmtx::{MutexShared, Shmtx};

const POOL_MAGIC: u64 = u64::from_le_bytes(*b"slabpool");

/// Immutable pool geometry, fixed at initialization and stored in the
/// header so that attaching processes agree on it.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SlabSizes {
    pub page_size: u64,
    pub page_shift: u64,
    pub min_size: u64,
    pub min_shift: u64,
    pub exact_size: u64,
    pub exact_shift: u64,
    pub max_size: u64,
}

impl SlabSizes {
    /// Geometry for an explicit page size. `min_shift` is the log2 of the
    /// smallest object size, conventionally 3.
    pub fn for_page(page_size: usize, min_shift: u32) -> Result<SlabSizes> {
        if !page_size.is_power_of_two() || page_size < 1024 {
            return Err(Error::InvalidConfig(
                "page size must be a power of two of at least 1024",
            ));
        }
        if page_size > 1 << 16 {
            // The object shift must fit the low bits of the slab word.
            return Err(Error::InvalidConfig("page size above 64 KiB"));
        }

        let page_size = page_size as u64;
        let exact_size = page_size / WORD_BITS;
        let exact_shift = exact_size.trailing_zeros();
        if min_shift < 3 || min_shift >= exact_shift {
            return Err(Error::InvalidConfig(
                "min shift must lie between 3 and the exact-class shift",
            ));
        }

        Ok(SlabSizes {
            page_size,
            page_shift: page_size.trailing_zeros() as u64,
            min_size: 1 << min_shift,
            min_shift: min_shift as u64,
            exact_size,
            exact_shift: exact_shift as u64,
            max_size: page_size / 2,
        })
    }

    /// Geometry for the kernel page size of this host.
    pub fn host(min_shift: u32) -> Result<SlabSizes> {
        Self::for_page(host_page_size(), min_shift)
    }

    /// Number of sub-page size classes.
    fn n_slots(&self) -> usize {
        (self.page_shift - self.min_shift) as usize
    }
}

/// Per-class counters, readable through [`LockedPool::stats`].
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SlabStat {
    /// Objects currently available in pages of this class.
    pub total: u64,
    /// Objects currently handed out.
    pub used: u64,
    /// Allocation requests routed to this class.
    pub reqs: u64,
    /// Requests that failed for lack of pages.
    pub fails: u64,
}

const STAT_SIZE: u64 = core::mem::size_of::<SlabStat>() as u64;
const_assert_eq!(core::mem::size_of::<SlabStat>(), 32);

#[repr(C)]
struct PoolHeader {
    lock: MutexShared,
    sizes: SlabSizes,
    /// Offset of the first page descriptor.
    pages: u64,
    /// Offset one past the last page descriptor.
    last: u64,
    /// Sentinel of the circular free-run list.
    free: PageDesc,
    /// Offset of the stats table.
    stats: u64,
    /// Count of currently free pages.
    pfree: u64,
    /// Offset of the first data page.
    start: u64,
    /// Region length; data pages end here.
    end: u64,
    /// Nonzero to report exhaustion in the log.
    log_nomem: u64,
    magic: u64,
}

const HDR_SIZE: u64 = core::mem::size_of::<PoolHeader>() as u64;
const_assert_eq!(HDR_SIZE % 8, 0);

/// A slab pool living in a shared region. Cloneable across processes by
/// re-attaching; all operations serialize on the embedded mutex.
pub struct SlabPool {
    base: NonNull<u8>,
    len: usize,
    mutex: Shmtx,
}

unsafe impl Send for SlabPool {}
unsafe impl Sync for SlabPool {}

impl SlabPool {
    /// Lay a fresh pool out over `region` using the host page size.
    ///
    /// # Safety
    ///
    /// The region must outlive the pool and every handle attached to it,
    /// and must not be in use by another pool.
    pub unsafe fn init_in(region: &SharedRegion, min_shift: u32) -> Result<SlabPool> {
        Self::init_with(region, SlabSizes::host(min_shift)?)
    }

    /// Lay a fresh pool out over `region` with explicit geometry. The same
    /// region and geometry always produce the same layout.
    ///
    /// # Safety
    ///
    /// As for [`SlabPool::init_in`].
    pub unsafe fn init_with(region: &SharedRegion, sizes: SlabSizes) -> Result<SlabPool> {
        let base = region.as_ptr();
        let len = region.len();
        let addr = base.as_ptr() as usize;
        if addr as u64 & (sizes.page_size - 1) != 0 {
            return Err(Error::UnalignedRegion(addr));
        }

        let h = base.as_ptr() as *mut PoolHeader;
        (*h).sizes = sizes;
        (*h).end = len as u64;
        (*h).log_nomem = 1;

        // Slot sentinels: an empty class list links to itself.
        let n = sizes.n_slots();
        for slot in 0..n {
            let off = HDR_SIZE + slot as u64 * DESC_SIZE;
            (base.as_ptr().add(off as usize) as *mut PageDesc).write(PageDesc::sentinel(off));
        }

        let stats_off = HDR_SIZE + n as u64 * DESC_SIZE;
        core::ptr::write_bytes(
            base.as_ptr().add(stats_off as usize),
            0,
            n * STAT_SIZE as usize,
        );
        (*h).stats = stats_off;

        // Every data page costs one descriptor on top of the page itself.
        let pages_off = stats_off + n as u64 * STAT_SIZE;
        let avail = (len as u64).saturating_sub(pages_off);
        let mut pages = avail / (sizes.page_size + DESC_SIZE);
        if pages == 0 {
            return Err(Error::RegionTooSmall(len));
        }
        core::ptr::write_bytes(
            base.as_ptr().add(pages_off as usize),
            0,
            (pages * DESC_SIZE) as usize,
        );

        let free_off = addr_of_mut!((*h).free) as usize as u64 - addr as u64;
        (*h).free = PageDesc {
            slab: 0,
            next: pages_off,
            prev: PrevLink::new(),
        };
        let first = base.as_ptr().add(pages_off as usize) as *mut PageDesc;
        first.write(PageDesc {
            slab: pages,
            next: free_off,
            prev: PrevLink::tagged(free_off, PageKind::Page),
        });

        // Data pages start at the next page boundary; give back the
        // descriptors whose pages fell off the end.
        let start =
            (pages_off + pages * DESC_SIZE + sizes.page_size - 1) & !(sizes.page_size - 1);
        if start >= len as u64 {
            return Err(Error::RegionTooSmall(len));
        }
        let fitting = (len as u64 - start) >> sizes.page_shift;
        if fitting == 0 {
            return Err(Error::RegionTooSmall(len));
        }
        if fitting < pages {
            pages = fitting;
            (*first).slab = pages;
        }

        (*h).pages = pages_off;
        (*h).last = pages_off + pages * DESC_SIZE;
        (*h).pfree = pages;
        (*h).start = start;
        (*h).magic = POOL_MAGIC;

        let mutex = Shmtx::create(NonNull::new_unchecked(addr_of_mut!((*h).lock)));
        Ok(SlabPool {
            base,
            len,
            mutex,
        })
    }

    /// Open a pool another process already initialized in `region`.
    ///
    /// # Safety
    ///
    /// The region must outlive the returned handle and must map the same
    /// shared memory the initializing process used.
    pub unsafe fn attach(region: &SharedRegion) -> Result<SlabPool> {
        let base = region.as_ptr();
        let len = region.len();
        if (len as u64) < HDR_SIZE {
            return Err(Error::NotAPool);
        }

        let h = base.as_ptr() as *mut PoolHeader;
        if (*h).magic != POOL_MAGIC || (*h).end != len as u64 {
            return Err(Error::NotAPool);
        }
        let addr = base.as_ptr() as usize;
        if addr as u64 & ((*h).sizes.page_size - 1) != 0 {
            return Err(Error::UnalignedRegion(addr));
        }

        let mutex = Shmtx::attach(NonNull::new_unchecked(addr_of_mut!((*h).lock)));
        Ok(SlabPool { base, len, mutex })
    }

    /// Acquire the pool mutex and return the handle carrying the locked
    /// operation family. The mutex is released when the handle drops.
    pub fn lock(&self) -> LockedPool<'_> {
        self.mutex.lock();
        LockedPool { pool: self }
    }

    /// Like [`SlabPool::lock`] but never blocks.
    pub fn try_lock(&self) -> Option<LockedPool<'_>> {
        if self.mutex.try_lock() {
            Some(LockedPool { pool: self })
        } else {
            None
        }
    }

    /// Allocate `size` bytes. Takes the mutex.
    pub fn alloc(&self, size: usize) -> Option<NonNull<u8>> {
        self.lock().alloc(size)
    }

    /// Allocate `size` zeroed bytes. Takes the mutex.
    pub fn calloc(&self, size: usize) -> Option<NonNull<u8>> {
        self.lock().calloc(size)
    }

    /// Return an object to the pool. Takes the mutex. Misuse (foreign,
    /// misaligned or already-free pointers) is logged and ignored.
    pub fn free(&self, p: NonNull<u8>) {
        self.lock().free(p)
    }

    pub fn sizes(&self) -> SlabSizes {
        unsafe { (*self.header()).sizes }
    }

    /// The mutex handle, e.g. to force-unlock after a holder died.
    pub fn mutex(&self) -> &Shmtx {
        &self.mutex
    }

    #[inline]
    fn base_addr(&self) -> usize {
        self.base.as_ptr() as usize
    }

    #[inline]
    fn header(&self) -> *mut PoolHeader {
        self.base.as_ptr() as *mut PoolHeader
    }

    #[inline]
    unsafe fn desc(&self, off: u64) -> *mut PageDesc {
        debug_assert!(off + DESC_SIZE <= self.len as u64);
        self.base.as_ptr().add(off as usize) as *mut PageDesc
    }

    #[inline]
    unsafe fn stat(&self, slot: usize) -> *mut SlabStat {
        let off = (*self.header()).stats + slot as u64 * STAT_SIZE;
        self.base.as_ptr().add(off as usize) as *mut SlabStat
    }

    #[inline]
    fn slot_off(&self, slot: usize) -> u64 {
        HDR_SIZE + slot as u64 * DESC_SIZE
    }

    #[inline]
    unsafe fn free_off(&self) -> u64 {
        addr_of_mut!((*self.header()).free) as usize as u64 - self.base_addr() as u64
    }

    /// Offset of the data page described by the descriptor at `desc_off`.
    #[inline]
    unsafe fn page_data_off(&self, desc_off: u64) -> u64 {
        let h = self.header();
        (*h).start + (((desc_off - (*h).pages) / DESC_SIZE) << (*h).sizes.page_shift)
    }

    /// Splice the descriptor at `off` out of whichever list holds it.
    unsafe fn unlink(&self, off: u64) {
        let d = self.desc(off);
        let prev = (*d).prev.link();
        (*self.desc(prev)).next = (*d).next;
        // The raw word keeps the neighbour's own kind tag intact.
        (*self.desc((*d).next)).prev = (*d).prev;
    }

    /// Put a page that had filled up back at the head of its slot list.
    unsafe fn relink(&self, page_off: u64, kind: PageKind, slot: usize) {
        let slot_off = self.slot_off(slot);
        let page = self.desc(page_off);
        (*page).next = (*self.desc(slot_off)).next;
        (*self.desc(slot_off)).next = page_off;
        (*page).prev = PrevLink::tagged(slot_off, kind);
        (*self.desc((*page).next)).prev = PrevLink::tagged(page_off, kind);
    }

    /// Serve one allocation. Caller holds the mutex. Returns the byte
    /// offset of the object.
    unsafe fn alloc_locked(&self, size: usize) -> Result<u64> {
        let h = self.header();
        let sizes = (*h).sizes;
        let page_size = sizes.page_size;

        if size as u64 > sizes.max_size {
            log::debug!("slab alloc: {size}");
            let count = (size as u64 >> sizes.page_shift)
                + u64::from(size as u64 & (page_size - 1) != 0);
            let page_off = self.alloc_pages(count)?;
            return Ok(self.page_data_off(page_off));
        }

        let (shift, slot) = if size as u64 > sizes.min_size {
            let shift = (usize::BITS - (size - 1).leading_zeros()) as u64;
            (shift, (shift - sizes.min_shift) as usize)
        } else {
            (sizes.min_shift, 0)
        };

        (*self.stat(slot)).reqs += 1;
        log::debug!("slab alloc: {size} slot: {slot}");

        let slot_off = self.slot_off(slot);
        let first = (*self.desc(slot_off)).next;

        if first != slot_off {
            // The slot list threads only pages with at least one free slot.
            let page = self.desc(first);
            let data = self.page_data_off(first);

            if shift < sizes.exact_shift {
                let bitmap = self.base.as_ptr().add(data as usize) as *mut u64;
                let map = ((page_size >> shift) / WORD_BITS) as usize;

                for n in 0..map {
                    if let Some(bit) = first_free_bit(*bitmap.add(n)) {
                        *bitmap.add(n) |= 1 << bit;
                        let index = n as u64 * WORD_BITS + bit as u64;
                        (*self.stat(slot)).used += 1;

                        if *bitmap.add(n) == SLAB_BUSY {
                            let mut full = true;
                            for i in n + 1..map {
                                if *bitmap.add(i) != SLAB_BUSY {
                                    full = false;
                                    break;
                                }
                            }
                            if full {
                                self.unlink(first);
                                (*page).next = 0;
                                (*page).prev = PrevLink::untagged(PageKind::Small);
                            }
                        }

                        return Ok(data + (index << shift));
                    }
                }
            } else if shift == sizes.exact_shift {
                if let Some(bit) = first_free_bit((*page).slab) {
                    (*page).slab |= 1 << bit;
                    if (*page).slab == SLAB_BUSY {
                        self.unlink(first);
                        (*page).next = 0;
                        (*page).prev = PrevLink::untagged(PageKind::Exact);
                    }
                    (*self.stat(slot)).used += 1;
                    return Ok(data + ((bit as u64) << shift));
                }
            } else {
                let mask = ((1u64 << (page_size >> shift)) - 1) << SLAB_MAP_SHIFT;
                let open = !(*page).slab & mask;
                if open != 0 {
                    let bit = open.trailing_zeros();
                    (*page).slab |= 1 << bit;
                    if (*page).slab & SLAB_MAP_MASK == mask {
                        self.unlink(first);
                        (*page).next = 0;
                        (*page).prev = PrevLink::untagged(PageKind::Big);
                    }
                    (*self.stat(slot)).used += 1;
                    return Ok(data + (((bit - SLAB_MAP_SHIFT) as u64) << shift));
                }
            }

            bug!("slab alloc: page in slot {slot} list has no free object");
        }

        let page_off = match self.alloc_pages(1) {
            Ok(off) => off,
            Err(e) => {
                (*self.stat(slot)).fails += 1;
                return Err(e);
            }
        };

        let page = self.desc(page_off);
        let data = self.page_data_off(page_off);

        let object = if shift < sizes.exact_shift {
            let bitmap = self.base.as_ptr().add(data as usize) as *mut u64;
            let objects = page_size >> shift;

            // The leading objects hold the bitmap itself; mark them, plus
            // the one being handed out.
            let mut reserved = objects / ((1 << shift) * 8);
            if reserved == 0 {
                reserved = 1;
            }

            let full = ((reserved + 1) / WORD_BITS) as usize;
            for i in 0..full {
                *bitmap.add(i) = SLAB_BUSY;
            }
            *bitmap.add(full) = (1u64 << ((reserved + 1) % WORD_BITS)) - 1;

            let map = (objects / WORD_BITS) as usize;
            for i in full + 1..map {
                *bitmap.add(i) = 0;
            }

            (*page).slab = shift;
            (*page).next = slot_off;
            (*page).prev = PrevLink::tagged(slot_off, PageKind::Small);
            (*self.desc(slot_off)).next = page_off;

            (*self.stat(slot)).total += objects - reserved;
            data + (reserved << shift)
        } else if shift == sizes.exact_shift {
            (*page).slab = 1;
            (*page).next = slot_off;
            (*page).prev = PrevLink::tagged(slot_off, PageKind::Exact);
            (*self.desc(slot_off)).next = page_off;

            (*self.stat(slot)).total += WORD_BITS;
            data
        } else {
            (*page).slab = (1 << SLAB_MAP_SHIFT) | shift;
            (*page).next = slot_off;
            (*page).prev = PrevLink::tagged(slot_off, PageKind::Big);
            (*self.desc(slot_off)).next = page_off;

            (*self.stat(slot)).total += page_size >> shift;
            data
        };

        (*self.stat(slot)).used += 1;
        Ok(object)
    }

    /// Return the object at byte offset `off`. Caller holds the mutex.
    unsafe fn free_locked(&self, off: u64) -> Result<()> {
        let h = self.header();
        let sizes = (*h).sizes;
        let page_size = sizes.page_size;
        let page_mask = page_size - 1;

        log::debug!("slab free: {off:#x}");

        if off < (*h).start || off >= (*h).end {
            return Err(Error::OutsidePool(off as usize));
        }

        let index = (off - (*h).start) >> sizes.page_shift;
        let page_off = (*h).pages + index * DESC_SIZE;
        if page_off >= (*h).last {
            // A trailing fragment of the region has no descriptor.
            return Err(Error::OutsidePool(off as usize));
        }

        let page = self.desc(page_off);
        let slab = (*page).slab;

        match (*page).prev.kind() {
            PageKind::Small => {
                let shift = slab & SLAB_SHIFT_MASK;
                if off & ((1 << shift) - 1) != 0 {
                    return Err(Error::WrongChunk(off as usize));
                }

                let object = (off & page_mask) >> shift;
                let m = 1u64 << (object % WORD_BITS);
                let word = (object / WORD_BITS) as usize;
                let bitmap = self.base.as_ptr().add((off & !page_mask) as usize) as *mut u64;

                if *bitmap.add(word) & m == 0 {
                    return Err(Error::AlreadyFree(off as usize));
                }

                let slot = (shift - sizes.min_shift) as usize;
                if (*page).next == 0 {
                    self.relink(page_off, PageKind::Small, slot);
                }

                *bitmap.add(word) &= !m;

                let mut reserved = (page_size >> shift) / ((1 << shift) * 8);
                if reserved == 0 {
                    reserved = 1;
                }

                // Outside the bitmap's own slots, is anything still in use?
                let i = (reserved / WORD_BITS) as usize;
                let low = (1u64 << (reserved % WORD_BITS)) - 1;
                let mut occupied = *bitmap.add(i) & !low != 0;
                if !occupied {
                    let map = ((page_size >> shift) / WORD_BITS) as usize;
                    for j in i + 1..map {
                        if *bitmap.add(j) != 0 {
                            occupied = true;
                            break;
                        }
                    }
                }

                if !occupied {
                    self.free_pages(page_off, 1);
                    (*self.stat(slot)).total -= (page_size >> shift) - reserved;
                }

                (*self.stat(slot)).used -= 1;
                Ok(())
            }
            PageKind::Exact => {
                if off & (sizes.exact_size - 1) != 0 {
                    return Err(Error::WrongChunk(off as usize));
                }
                let m = 1u64 << ((off & page_mask) >> sizes.exact_shift);
                if slab & m == 0 {
                    return Err(Error::AlreadyFree(off as usize));
                }

                let slot = (sizes.exact_shift - sizes.min_shift) as usize;
                if slab == SLAB_BUSY {
                    self.relink(page_off, PageKind::Exact, slot);
                }

                (*page).slab &= !m;
                if (*page).slab == 0 {
                    self.free_pages(page_off, 1);
                    (*self.stat(slot)).total -= WORD_BITS;
                }

                (*self.stat(slot)).used -= 1;
                Ok(())
            }
            PageKind::Big => {
                let shift = slab & SLAB_SHIFT_MASK;
                if off & ((1 << shift) - 1) != 0 {
                    return Err(Error::WrongChunk(off as usize));
                }

                let m = 1u64 << (((off & page_mask) >> shift) + SLAB_MAP_SHIFT as u64);
                if slab & m == 0 {
                    return Err(Error::AlreadyFree(off as usize));
                }

                let slot = (shift - sizes.min_shift) as usize;
                if (*page).next == 0 {
                    self.relink(page_off, PageKind::Big, slot);
                }

                (*page).slab &= !m;
                if (*page).slab & SLAB_MAP_MASK == 0 {
                    self.free_pages(page_off, 1);
                    (*self.stat(slot)).total -= page_size >> shift;
                }

                (*self.stat(slot)).used -= 1;
                Ok(())
            }
            PageKind::Page => {
                if off & page_mask != 0 {
                    return Err(Error::WrongChunk(off as usize));
                }
                if slab & SLAB_PAGE_START == 0 {
                    return Err(Error::AlreadyFree(off as usize));
                }
                if slab == SLAB_BUSY {
                    // Interior page of a run; only the head may be freed.
                    return Err(Error::WrongPage(off as usize));
                }

                let count = slab & !SLAB_PAGE_START;
                self.free_pages(page_off, count);
                Ok(())
            }
        }
    }

    /// First-fit scan of the free-run list for `count` contiguous pages,
    /// splitting the run when it is longer than needed.
    unsafe fn alloc_pages(&self, count: u64) -> Result<u64> {
        let h = self.header();
        let free_off = self.free_off();

        let mut page_off = (*self.desc(free_off)).next;
        while page_off != free_off {
            let page = self.desc(page_off);

            if (*page).slab >= count {
                if (*page).slab > count {
                    // Split: the surplus becomes a new run head inheriting
                    // this run's list neighbours.
                    let new_off = page_off + count * DESC_SIZE;
                    let tail_off = page_off + ((*page).slab - 1) * DESC_SIZE;
                    (*self.desc(tail_off)).prev = PrevLink::tagged(new_off, PageKind::Page);

                    let new = self.desc(new_off);
                    (*new).slab = (*page).slab - count;
                    (*new).next = (*page).next;
                    (*new).prev = (*page).prev;

                    (*self.desc((*page).prev.link())).next = new_off;
                    (*self.desc((*page).next)).prev = PrevLink::tagged(new_off, PageKind::Page);
                } else {
                    self.unlink(page_off);
                }

                (*page).slab = count | SLAB_PAGE_START;
                (*page).next = 0;
                (*page).prev = PrevLink::untagged(PageKind::Page);

                (*h).pfree -= count;

                for k in 1..count {
                    let interior = self.desc(page_off + k * DESC_SIZE);
                    (*interior).slab = SLAB_BUSY;
                    (*interior).next = 0;
                    (*interior).prev = PrevLink::untagged(PageKind::Page);
                }

                return Ok(page_off);
            }

            page_off = (*page).next;
        }

        if (*h).log_nomem != 0 {
            log::error!("slab alloc failed: no memory");
        }
        Err(Error::NoMemory((count << (*h).sizes.page_shift) as usize))
    }

    /// Give `count` pages starting at `page_off` back to the free-run list,
    /// merging with the right and left neighbour runs when they are free.
    unsafe fn free_pages(&self, page_off: u64, count: u64) {
        let h = self.header();
        (*h).pfree += count;

        let mut head_off = page_off;
        (*self.desc(head_off)).slab = count;

        // Tail index of the run relative to its (possibly moved) head.
        let mut tail = count - 1;
        if tail > 0 {
            core::ptr::write_bytes(
                self.desc(head_off + DESC_SIZE) as *mut u8,
                0,
                (tail * DESC_SIZE) as usize,
            );
        }

        if (*self.desc(head_off)).next != 0 {
            // A sub-page class page being demoted; take it off its slot list.
            self.unlink(head_off);
        }

        let join_off = head_off + (*self.desc(head_off)).slab * DESC_SIZE;
        if join_off < (*h).last {
            let join = self.desc(join_off);
            if (*join).prev.kind() == PageKind::Page && (*join).next != 0 {
                // Right neighbour starts a free run; absorb it.
                tail += (*join).slab;
                (*self.desc(head_off)).slab += (*join).slab;

                self.unlink(join_off);
                (*join).slab = SLAB_FREE;
                (*join).next = 0;
                (*join).prev = PrevLink::untagged(PageKind::Page);
            }
        }

        if head_off > (*h).pages {
            let mut left_off = head_off - DESC_SIZE;
            let mut left = self.desc(left_off);

            if (*left).prev.kind() == PageKind::Page {
                if (*left).slab == SLAB_FREE {
                    // Interior free page; its back-link names the run head.
                    left_off = (*left).prev.link();
                    left = self.desc(left_off);
                }

                if (*left).next != 0 {
                    tail += (*left).slab;
                    (*left).slab += (*self.desc(head_off)).slab;

                    self.unlink(left_off);
                    let old = self.desc(head_off);
                    (*old).slab = SLAB_FREE;
                    (*old).next = 0;
                    (*old).prev = PrevLink::untagged(PageKind::Page);

                    head_off = left_off;
                }
            }
        }

        if tail > 0 {
            // Let a later left-neighbour merge find this head in one hop.
            (*self.desc(head_off + tail * DESC_SIZE)).prev =
                PrevLink::tagged(head_off, PageKind::Page);
        }

        let free_off = self.free_off();
        let head = self.desc(head_off);
        (*head).prev = PrevLink::tagged(free_off, PageKind::Page);
        (*head).next = (*self.desc(free_off)).next;
        (*self.desc((*head).next)).prev = PrevLink::tagged(head_off, PageKind::Page);
        (*self.desc(free_off)).next = head_off;
    }

    #[cfg(test)]
    unsafe fn check_invariants(&self) {
        let h = self.header();
        let free_off = self.free_off();

        let mut total = 0;
        let mut runs: Vec<(u64, u64)> = Vec::new();
        let mut off = (*self.desc(free_off)).next;
        while off != free_off {
            let d = self.desc(off);
            let len = (*d).slab;
            assert!(len > 0, "free run head with zero length");
            assert_eq!(len & SLAB_PAGE_START, 0, "allocated run on the free list");

            if len > 1 {
                let last = self.desc(off + (len - 1) * DESC_SIZE);
                assert_eq!(
                    (*last).prev.link(),
                    off,
                    "run tail back-link must name its head"
                );
            }

            total += len;
            runs.push((off, len));
            off = (*d).next;
        }
        assert_eq!(total, (*h).pfree, "pfree must equal the free-run lengths");

        for &(off, len) in &runs {
            let right = off + len * DESC_SIZE;
            assert!(
                runs.iter().all(|&(other, _)| other != right),
                "two adjacent free runs survived a free"
            );
        }

        for slot in 0..(*h).sizes.n_slots() {
            let s = *self.stat(slot);
            assert!(s.used <= s.total, "class {slot} has used > total");
        }

        // Slot lists may only thread pages that still have a free object.
        let sizes = (*h).sizes;
        for slot in 0..sizes.n_slots() {
            let slot_off = self.slot_off(slot);
            let mut off = (*self.desc(slot_off)).next;
            while off != slot_off {
                let d = self.desc(off);
                match (*d).prev.kind() {
                    PageKind::Exact => assert_ne!((*d).slab, SLAB_BUSY),
                    PageKind::Big => {
                        let shift = (*d).slab & SLAB_SHIFT_MASK;
                        let mask =
                            ((1u64 << (sizes.page_size >> shift)) - 1) << SLAB_MAP_SHIFT;
                        assert_ne!((*d).slab & SLAB_MAP_MASK, mask);
                    }
                    PageKind::Small => {
                        let shift = (*d).slab & SLAB_SHIFT_MASK;
                        let data = self.page_data_off(off);
                        let bitmap = self.base.as_ptr().add(data as usize) as *const u64;
                        let map = ((sizes.page_size >> shift) / WORD_BITS) as usize;
                        let open = (0..map).any(|i| *bitmap.add(i) != SLAB_BUSY);
                        assert!(open, "full page left on slot list {slot}");
                    }
                    PageKind::Page => panic!("run page on slot list {slot}"),
                }
                off = (*d).next;
            }
        }
    }
}

/// The locked operation family. Obtainable only through [`SlabPool::lock`]
/// or [`SlabPool::try_lock`], so a holder cannot re-acquire the mutex.
pub struct LockedPool<'a> {
    pool: &'a SlabPool,
}

impl LockedPool<'_> {
    pub fn alloc(&mut self, size: usize) -> Option<NonNull<u8>> {
        match unsafe { self.pool.alloc_locked(size) } {
            Ok(off) => {
                Some(unsafe { NonNull::new_unchecked(self.pool.base.as_ptr().add(off as usize)) })
            }
            Err(_) => None,
        }
    }

    pub fn calloc(&mut self, size: usize) -> Option<NonNull<u8>> {
        let p = self.alloc(size)?;
        unsafe { p.as_ptr().write_bytes(0, size) };
        Some(p)
    }

    pub fn free(&mut self, p: NonNull<u8>) {
        let off = (p.as_ptr() as usize).wrapping_sub(self.pool.base_addr()) as u64;
        if let Err(e) = unsafe { self.pool.free_locked(off) } {
            log::error!("slab free: {e}");
        }
    }

    /// Copy of the per-class counter table, indexed by slot.
    pub fn stats(&self) -> Vec<SlabStat> {
        unsafe {
            let n = (*self.pool.header()).sizes.n_slots();
            (0..n).map(|slot| *self.pool.stat(slot)).collect()
        }
    }

    /// Count of currently free pages.
    pub fn pfree(&self) -> u64 {
        unsafe { (*self.pool.header()).pfree }
    }

    /// Toggle logging of exhausted-pool allocations.
    pub fn log_nomem(&mut self, enabled: bool) {
        unsafe { (*self.pool.header()).log_nomem = u64::from(enabled) };
    }

    #[cfg(test)]
    pub(crate) fn assert_invariants(&self) {
        unsafe { self.pool.check_invariants() }
    }
}

impl Drop for LockedPool<'_> {
    fn drop(&mut self) {
        self.pool.mutex.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rand::seq::SliceRandom;
    use rand::Rng;
    use std::collections::HashMap;

    const PAGE: u64 = 4096;

    fn new_pool(data_pages: usize) -> (SharedRegion, SlabPool) {
        // Header, tables and alignment eat a little over one page.
        let region = SharedRegion::create_anon((data_pages + 2) * PAGE as usize).unwrap();
        let sizes = SlabSizes::for_page(PAGE as usize, 3).unwrap();
        let pool = unsafe { SlabPool::init_with(&region, sizes).unwrap() };
        (region, pool)
    }

    fn offset_of(pool: &SlabPool, p: NonNull<u8>) -> u64 {
        (p.as_ptr() as usize - pool.base.as_ptr() as usize) as u64
    }

    #[test]
    fn geometry_for_4k_pages() {
        let sizes = SlabSizes::for_page(4096, 3).unwrap();
        assert_eq!(sizes.exact_size, 64);
        assert_eq!(sizes.exact_shift, 6);
        assert_eq!(sizes.max_size, 2048);
        assert_eq!(sizes.min_size, 8);
        assert_eq!(sizes.n_slots(), 9);

        assert!(SlabSizes::for_page(1000, 3).is_err());
        assert!(SlabSizes::for_page(4096, 6).is_err());
        assert!(SlabSizes::for_page(1 << 20, 3).is_err());
    }

    #[test]
    fn smallest_class_serves_one_byte() {
        let (_region, pool) = new_pool(8);
        let mut locked = pool.lock();
        let before = locked.pfree();

        let p = locked.alloc(1).unwrap();
        let off = offset_of(&pool, p);
        assert_eq!(off % 8, 0, "class 0 objects are 8-byte aligned");

        let stats = locked.stats();
        assert_eq!(stats[0].used, 1);
        assert_eq!(stats[0].reqs, 1);
        assert_eq!(locked.pfree(), before - 1);

        locked.free(p);
        let stats = locked.stats();
        assert_eq!(stats[0].used, 0);
        assert_eq!(locked.pfree(), before, "empty page went back to the pool");
        locked.assert_invariants();
    }

    #[test]
    fn exact_class_bitmap_lives_in_the_descriptor() {
        let (_region, pool) = new_pool(8);
        let mut locked = pool.lock();

        let a = locked.alloc(64).unwrap();
        let desc_off = unsafe {
            let h = pool.header();
            (*h).pages + (((offset_of(&pool, a) - (*h).start) >> 12) * DESC_SIZE)
        };
        unsafe {
            assert_eq!((*pool.desc(desc_off)).slab, 1);
            assert_eq!((*pool.desc(desc_off)).prev.kind(), PageKind::Exact);
        }

        let b = locked.alloc(64).unwrap();
        assert_eq!(offset_of(&pool, b), offset_of(&pool, a) + 64);
        unsafe { assert_eq!((*pool.desc(desc_off)).slab, 3) };

        locked.free(a);
        unsafe { assert_eq!((*pool.desc(desc_off)).slab, 2) };
        locked.free(b);
        locked.assert_invariants();
    }

    #[test]
    fn full_exact_page_unlinks_then_relinks_on_free() {
        let (_region, pool) = new_pool(8);
        let mut locked = pool.lock();
        let before = locked.pfree();

        let first_page: Vec<_> = (0..64).map(|_| locked.alloc(64).unwrap()).collect();
        assert_eq!(locked.pfree(), before - 1);

        // The full page left its slot list; a new allocation opens a page.
        let overflow = locked.alloc(64).unwrap();
        assert_eq!(locked.pfree(), before - 2);

        // Freeing one object relinks the first page at the slot head, so
        // the next allocation reuses it.
        locked.free(first_page[17]);
        let replacement = locked.alloc(64).unwrap();
        assert_eq!(replacement, first_page[17]);

        for (i, &p) in first_page.iter().enumerate() {
            if i != 17 {
                locked.free(p);
            }
        }
        locked.free(replacement);
        locked.free(overflow);
        assert_eq!(locked.pfree(), before);
        locked.assert_invariants();
    }

    #[test]
    fn big_class_keeps_shift_and_map_in_one_word() {
        let (_region, pool) = new_pool(8);
        let mut locked = pool.lock();

        // 2048 == max_size routes to the largest sub-page class.
        let a = locked.alloc(2048).unwrap();
        let b = locked.alloc(2048).unwrap();
        assert_eq!(offset_of(&pool, b), offset_of(&pool, a) + 2048);

        let stats = locked.stats();
        let slot = (11 - 3) as usize;
        assert_eq!(stats[slot].used, 2);
        assert_eq!(stats[slot].total, 2);

        locked.free(a);
        locked.free(b);
        assert_eq!(locked.stats()[slot].used, 0);
        locked.assert_invariants();
    }

    #[test]
    fn requests_above_half_a_page_take_whole_runs() {
        let (_region, pool) = new_pool(12);
        let mut locked = pool.lock();
        let before = locked.pfree();

        let one = locked.alloc(3000).unwrap();
        assert_eq!(locked.pfree(), before - 1);
        assert_eq!(offset_of(&pool, one) % PAGE, 0);

        let two = locked.alloc(5000).unwrap();
        assert_eq!(locked.pfree(), before - 3);
        assert_eq!(offset_of(&pool, two) % PAGE, 0);

        locked.free(one);
        locked.free(two);
        assert_eq!(locked.pfree(), before);
        locked.assert_invariants();
    }

    #[test]
    fn page_churn_coalesces_back_to_one_run() {
        let (_region, pool) = new_pool(16);
        let mut locked = pool.lock();
        let before = locked.pfree();

        let mut live: Vec<_> = (0..6).map(|_| locked.alloc(3000).unwrap()).collect();
        // Free every other page to fragment the free list.
        let b = live.remove(1);
        let d = live.remove(2);
        locked.free(b);
        locked.free(d);
        locked.assert_invariants();

        let wide = locked.alloc(2 * PAGE as usize + 100).unwrap();
        locked.assert_invariants();

        for p in live.drain(..) {
            locked.free(p);
        }
        locked.free(wide);

        assert_eq!(locked.pfree(), before);
        locked.assert_invariants();

        // One run must cover all data pages again.
        unsafe {
            let free_off = pool.free_off();
            let head = (*pool.desc(free_off)).next;
            assert_eq!((*pool.desc(head)).slab, before);
            assert_eq!((*pool.desc(head)).next, free_off);
        }
    }

    #[test]
    fn interior_run_page_cannot_be_freed() {
        let (_region, pool) = new_pool(8);
        let mut locked = pool.lock();
        let before = locked.pfree();

        let run = locked.alloc(3 * PAGE as usize).unwrap();
        let interior =
            unsafe { NonNull::new_unchecked(run.as_ptr().add(PAGE as usize)) };
        locked.free(interior);
        assert_eq!(locked.pfree(), before - 3, "interior free must be ignored");

        locked.free(run);
        assert_eq!(locked.pfree(), before);
        locked.assert_invariants();
    }

    #[test]
    fn misuse_is_rejected_without_state_changes() {
        let (_region, pool) = new_pool(8);
        let mut locked = pool.lock();

        let p = locked.alloc(100).unwrap();
        let before_stats = locked.stats();
        let before_pfree = locked.pfree();

        // Mid-object pointer: wrong alignment for its class.
        let inside = unsafe { NonNull::new_unchecked(p.as_ptr().add(3)) };
        locked.free(inside);

        // Pointer before the data zone.
        let outside = unsafe { NonNull::new_unchecked(pool.base.as_ptr().add(8)) };
        locked.free(outside);

        // Double free.
        locked.free(p);
        locked.free(p);

        let after = locked.stats();
        assert_eq!(locked.pfree(), before_pfree + 1);
        assert_eq!(after[4].used + 1, before_stats[4].used);
        locked.assert_invariants();
    }

    #[test]
    fn exhaustion_returns_none_and_counts_fails() {
        let (_region, pool) = new_pool(4);
        let mut locked = pool.lock();
        locked.log_nomem(false);

        let mut live = Vec::new();
        while let Some(p) = locked.alloc(2048) {
            live.push(p);
        }
        assert!(locked.alloc(2048).is_none());
        assert!(locked.alloc(64).is_none());
        assert!(locked.stats()[8].fails > 0);
        assert!(locked.stats()[3].fails > 0);

        for p in live {
            locked.free(p);
        }
        locked.assert_invariants();
    }

    #[test]
    fn calloc_zeroes_previously_dirtied_memory() {
        let (_region, pool) = new_pool(8);
        let mut locked = pool.lock();

        let p = locked.alloc(256).unwrap();
        unsafe { p.as_ptr().write_bytes(0xdb, 256) };
        locked.free(p);

        let q = locked.calloc(256).unwrap();
        let bytes = unsafe { core::slice::from_raw_parts(q.as_ptr(), 256) };
        assert!(bytes.iter().all(|&b| b == 0));
        locked.free(q);
    }

    #[test]
    fn random_workload_round_trips_every_class() {
        let (_region, pool) = new_pool(64);
        let mut locked = pool.lock();
        let before = locked.pfree();
        let mut rng = rand::thread_rng();

        let mut live: HashMap<usize, (NonNull<u8>, usize)> = HashMap::new();
        let mut key = 0usize;

        for _ in 0..4000 {
            if live.is_empty() || rng.gen_bool(0.6) {
                let size = rng.gen_range(1..=3 * PAGE as usize);
                if let Some(p) = locked.alloc(size) {
                    // Object memory is private to this allocation.
                    unsafe { p.as_ptr().write_bytes((key & 0xff) as u8, size) };
                    live.insert(key, (p, size));
                    key += 1;
                }
            } else {
                let victims: Vec<_> = live.keys().copied().collect();
                let k = *victims.choose(&mut rng).unwrap();
                let (p, _) = live.remove(&k).unwrap();
                locked.free(p);
            }
        }

        // No two live objects may overlap.
        let mut spans: Vec<_> = live
            .values()
            .map(|&(p, size)| {
                let off = offset_of(&pool, p);
                (off, off + size.max(1) as u64)
            })
            .collect();
        spans.sort_unstable();
        for pair in spans.windows(2) {
            assert!(pair[0].1 <= pair[1].0, "live allocations overlap");
        }

        for (p, _) in live.into_values() {
            locked.free(p);
        }
        assert_eq!(locked.pfree(), before);
        locked.assert_invariants();
    }

    #[test]
    fn init_is_deterministic_for_identical_inputs() {
        let sizes = SlabSizes::for_page(PAGE as usize, 3).unwrap();
        let region = SharedRegion::create_anon(32 * PAGE as usize).unwrap();

        let snapshot = |pool: &SlabPool| unsafe {
            let h = pool.header();
            ((*h).pages, (*h).last, (*h).start, (*h).pfree, (*h).stats)
        };

        let pool = unsafe { SlabPool::init_with(&region, sizes).unwrap() };
        let first = snapshot(&pool);
        drop(pool);

        let pool = unsafe { SlabPool::init_with(&region, sizes).unwrap() };
        assert_eq!(snapshot(&pool), first);
    }

    #[test]
    fn attach_rejects_garbage_and_opens_real_pools() {
        let region = SharedRegion::create_anon(32 * PAGE as usize).unwrap();
        assert!(matches!(
            unsafe { SlabPool::attach(&region) },
            Err(Error::NotAPool)
        ));

        let pool = unsafe { SlabPool::init_in(&region, 3).unwrap() };
        let p = pool.alloc(40).unwrap();

        let other = unsafe { SlabPool::attach(&region).unwrap() };
        assert_eq!(other.sizes(), pool.sizes());
        // The attached handle frees what the first handle allocated.
        other.free(p);
        assert_eq!(other.lock().stats()[3].used, 0);
    }

    proptest! {
        // Random run alloc/free interleavings must keep the free list
        // coalesced at every step, including merges on both sides.
        #[test]
        fn page_runs_always_coalesce(steps in proptest::collection::vec((1u64..5, any::<u8>()), 1..80)) {
            let (_region, pool) = new_pool(24);
            let mut locked = pool.lock();
            locked.log_nomem(false);
            let before = locked.pfree();
            let mut live: Vec<NonNull<u8>> = Vec::new();

            for (pages, choice) in steps {
                if choice % 3 != 0 || live.is_empty() {
                    let size = (pages << 12) as usize;
                    if let Some(p) = locked.alloc(size) {
                        live.push(p);
                    }
                } else {
                    let p = live.swap_remove(choice as usize % live.len());
                    locked.free(p);
                }
                locked.assert_invariants();
            }

            for p in live {
                locked.free(p);
                locked.assert_invariants();
            }

            prop_assert_eq!(locked.pfree(), before);
        }
    }
}
