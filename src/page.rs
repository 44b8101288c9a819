//! Page descriptors: the side-band records that describe every data page of
//! a pool.
//!
//! A descriptor is three 64-bit words. The `slab` word is polymorphic over
//! the page kind; `next` and `prev` thread the descriptor into a circular
//! list (a size-class slot list, or the free-run list). Links are byte
//! offsets from the region base, never raw addresses, so the region may be
//! mapped at a different address in every process. The two low bits of the
//! `prev` word carry the page kind; descriptors are 8-byte aligned, so the
//! real back-link always fits in the remaining bits.

use modular_bitfield::prelude::*;
use static_assertions::const_assert_eq;

/// Bits per bitmap word. Bitmap words are `u64` on every host so that the
/// in-region layout does not depend on the pointer width.
pub(crate) const WORD_BITS: u64 = 64;

/// `slab` of a free interior page of a run.
pub(crate) const SLAB_FREE: u64 = 0;
/// `slab` of an allocated interior page of a run; also a fully set bitmap.
pub(crate) const SLAB_BUSY: u64 = u64::MAX;
/// Set on the `slab` of an allocated run head, alongside the run length.
pub(crate) const SLAB_PAGE_START: u64 = 1 << 63;

/// Low bits of `slab` holding the object shift for small and big pages.
pub(crate) const SLAB_SHIFT_MASK: u64 = 0x0f;
/// The big-page bitmap occupies the high half of `slab`.
pub(crate) const SLAB_MAP_SHIFT: u32 = 32;
pub(crate) const SLAB_MAP_MASK: u64 = 0xffff_ffff_0000_0000;

/// How a page is carved, recovered from the low bits of `prev` on free.
#[derive(BitfieldSpecifier, Debug, Clone, Copy, PartialEq, Eq)]
#[bits = 2]
pub(crate) enum PageKind {
    /// Whole-page run (head or interior), or a free page.
    Page = 0b00,
    /// Objects bigger than the exact size, bitmap in the descriptor.
    Big = 0b01,
    /// Objects of exactly one bit per `slab` word bit.
    Exact = 0b10,
    /// Objects tracked by a bitmap stored in the page itself.
    Small = 0b11,
}

/// The packed back-link word: kind tag in the two low bits, byte offset of
/// the previous descriptor in the rest.
#[bitfield(bits = 64)]
#[derive(Clone, Copy)]
pub(crate) struct PrevLink {
    pub kind: PageKind,
    pub link: B62,
}

impl PrevLink {
    /// Back-link to `off`, tagged with `kind`.
    pub(crate) fn tagged(off: u64, kind: PageKind) -> Self {
        Self::new().with_kind(kind).with_link(off)
    }

    /// Kind tag alone; the page is not linked anywhere.
    pub(crate) fn untagged(kind: PageKind) -> Self {
        Self::new().with_kind(kind)
    }
}

/// One descriptor per data page, plus the list sentinels in the pool header
/// and slot table. `next == 0` means the page is unlinked: fully occupied
/// for a sub-page class, or handed out whole as part of a run.
#[repr(C)]
#[derive(Clone, Copy)]
pub(crate) struct PageDesc {
    pub slab: u64,
    pub next: u64,
    pub prev: PrevLink,
}

pub(crate) const DESC_SIZE: u64 = core::mem::size_of::<PageDesc>() as u64;

const_assert_eq!(core::mem::size_of::<PageDesc>(), 24);
const_assert_eq!(core::mem::size_of::<PrevLink>(), 8);

impl PageDesc {
    /// A list sentinel: empty list is represented by linking to itself.
    pub(crate) fn sentinel(own_off: u64) -> Self {
        PageDesc {
            slab: 0,
            next: own_off,
            prev: PrevLink::new(),
        }
    }
}

/// Index of the lowest clear bit of `word`, unless every bit is set.
#[inline]
pub(crate) fn first_free_bit(word: u64) -> Option<u32> {
    if word == SLAB_BUSY {
        None
    } else {
        Some((!word).trailing_zeros())
    }
}
