//! Shared-memory slab allocation.
//!
//! A [`SlabPool`] sub-allocates a fixed, preallocated region into
//! variable-size objects with power-of-two size classes, guarded by a
//! mutex that works across processes mapping the same region. Companion
//! pieces are the mutex itself ([`Shmtx`]), a minimal region provider
//! ([`SharedRegion`]), and the per-process [`Arena`] with its array and
//! list containers.
//!
//! ```
//! use slabpool::{SharedRegion, SlabPool};
//!
//! let region = SharedRegion::create_anon(1 << 20).unwrap();
//! let pool = unsafe { SlabPool::init_in(&region, 3).unwrap() };
//!
//! let p = pool.alloc(100).unwrap();
//! pool.free(p);
//!
//! // Callers holding the mutex over several operations use the guard.
//! let mut locked = pool.lock();
//! let q = locked.alloc(64).unwrap();
//! locked.free(q);
//! drop(locked);
//! ```

#[macro_use]
extern crate lazy_static;

/// Like the `panic!` macro, but used to indicate bug
#[macro_export]
macro_rules! bug {
    ($($arg:tt)*) => (panic!("{}", format_args!($($arg)*)));
}

pub mod arena;
pub mod error;
mod page;
pub mod shmem;
pub mod shmtx;
pub mod slab;

pub use arena::{Arena, Array, List};
pub use error::{Error, Result};
pub use shmem::{host_page_size, SharedRegion};
pub use shmtx::Shmtx;
pub use slab::{LockedPool, SlabPool, SlabSizes, SlabStat};
