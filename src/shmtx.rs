//! The mutex that serializes every pool operation across processes.
//!
//! The shared state is a word holding `0` or the owner's pid, living inside
//! the region next to the pool it protects. Acquisition is a compare-exchange
//! with acquire ordering and release on unlock, so a new owner observes every
//! pool mutation of the previous one. Contended lockers spin in doubling
//! batches of pause hints, then sleep on a process-shared POSIX semaphore
//! when one could be set up, and fall back to yielding otherwise. A second
//! backend takes `fcntl` write locks on a file for hosts where shared-memory
//! atomics cannot be trusted.

use core::ptr::{addr_of, addr_of_mut, NonNull};
use core::sync::atomic::{AtomicU64, Ordering};
use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use static_assertions::const_assert;

use crate::error::{Error, Result};

/// Spin iterations before a contended locker blocks.
const DEFAULT_SPIN: u32 = 2048;

lazy_static! {
    static ref NCPU: usize =
        unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN).max(1) as usize };
}

/// Storage for the process-shared semaphore, reserved even when the host
/// cannot initialize one.
#[repr(C, align(8))]
pub struct SemCell([u8; 64]);

const_assert!(core::mem::size_of::<libc::sem_t>() <= 64);

/// The in-region half of the mutex. Embedded in the pool header; every
/// process addresses the same words.
#[repr(C)]
pub struct MutexShared {
    /// `0` when free, otherwise the holder's pid.
    lock: u64,
    /// Number of lockers gone to sleep on the semaphore.
    wait: u64,
    /// Nonzero when `sem` was successfully initialized by the creator.
    sem_enabled: u64,
    sem: SemCell,
}

enum Backend {
    Atomic { shared: NonNull<MutexShared> },
    File { fd: libc::c_int },
}

/// The per-process handle to a shared mutex.
pub struct Shmtx {
    spin: u32,
    inner: Backend,
}

unsafe impl Send for Shmtx {}
unsafe impl Sync for Shmtx {}

#[inline]
unsafe fn atomic_at<'a>(word: *const u64) -> &'a AtomicU64 {
    &*(word as *const AtomicU64)
}

#[inline]
fn self_pid() -> u64 {
    unsafe { libc::getpid() as u64 }
}

impl Shmtx {
    /// Initialize the shared state and return the creator's handle.
    ///
    /// Tries to set up a process-shared semaphore for sleeping under
    /// contention; when the host refuses, lockers yield instead.
    ///
    /// # Safety
    ///
    /// `shared` must point into memory mapped by every cooperating process,
    /// and no other process may be using it yet.
    pub unsafe fn create(shared: NonNull<MutexShared>) -> Shmtx {
        let state = shared.as_ptr();
        (*state).lock = 0;
        (*state).wait = 0;
        (*state).sem_enabled = 0;

        let sem = addr_of_mut!((*state).sem) as *mut libc::sem_t;
        if libc::sem_init(sem, 1, 0) == 0 {
            (*state).sem_enabled = 1;
        } else {
            log::error!("sem_init failed, mutex waiters will yield instead");
        }

        Shmtx {
            spin: DEFAULT_SPIN,
            inner: Backend::Atomic { shared },
        }
    }

    /// Obtain a handle to shared state another process already initialized.
    ///
    /// # Safety
    ///
    /// `shared` must have been passed to [`Shmtx::create`] in some process,
    /// and the mapping must stay valid for the handle's lifetime.
    pub unsafe fn attach(shared: NonNull<MutexShared>) -> Shmtx {
        Shmtx {
            spin: DEFAULT_SPIN,
            inner: Backend::Atomic { shared },
        }
    }

    /// Build a file-lock backed mutex. `path` is created if missing; every
    /// process must name the same file.
    pub fn create_with_file(path: &Path) -> Result<Shmtx> {
        let name = CString::new(path.as_os_str().as_bytes())
            .map_err(|_| Error::InvalidConfig("lock file path contains NUL"))?;
        let fd = unsafe {
            libc::open(
                name.as_ptr(),
                libc::O_RDWR | libc::O_CREAT,
                0o600 as libc::c_uint,
            )
        };
        if fd < 0 {
            return Err(Error::Sys("open", errno()));
        }
        Ok(Shmtx {
            spin: DEFAULT_SPIN,
            inner: Backend::File { fd },
        })
    }

    /// Single acquisition attempt, never blocks.
    pub fn try_lock(&self) -> bool {
        match &self.inner {
            Backend::Atomic { shared } => unsafe {
                let lock = atomic_at(addr_of!((*shared.as_ptr()).lock));
                lock.load(Ordering::Relaxed) == 0
                    && lock
                        .compare_exchange(0, self_pid(), Ordering::Acquire, Ordering::Relaxed)
                        .is_ok()
            },
            Backend::File { fd } => fcntl_lock(*fd, libc::F_WRLCK, false).is_ok(),
        }
    }

    /// Block until the mutex is held by the calling process.
    pub fn lock(&self) {
        match &self.inner {
            Backend::Atomic { shared } => unsafe { self.lock_atomic(*shared) },
            Backend::File { fd } => {
                if let Err(e) = fcntl_lock(*fd, libc::F_WRLCK, true) {
                    log::error!("blocking file lock failed: {e}");
                }
            }
        }
    }

    unsafe fn lock_atomic(&self, shared: NonNull<MutexShared>) {
        let state = shared.as_ptr();
        let lock = atomic_at(addr_of!((*state).lock));
        let pid = self_pid();

        loop {
            if lock.load(Ordering::Relaxed) == 0
                && lock
                    .compare_exchange(0, pid, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
            {
                return;
            }

            if *NCPU > 1 {
                let mut batch = 1;
                while batch < self.spin {
                    for _ in 0..batch {
                        core::hint::spin_loop();
                    }
                    if lock.load(Ordering::Relaxed) == 0
                        && lock
                            .compare_exchange(0, pid, Ordering::Acquire, Ordering::Relaxed)
                            .is_ok()
                    {
                        return;
                    }
                    batch <<= 1;
                }
            }

            if (*state).sem_enabled != 0 {
                let wait = atomic_at(addr_of!((*state).wait));
                wait.fetch_add(1, Ordering::AcqRel);

                // The holder may have left between the last probe and the
                // counter bump; recheck before sleeping.
                if lock.load(Ordering::Relaxed) == 0
                    && lock
                        .compare_exchange(0, pid, Ordering::Acquire, Ordering::Relaxed)
                        .is_ok()
                {
                    wait.fetch_sub(1, Ordering::AcqRel);
                    return;
                }

                let sem = addr_of_mut!((*state).sem) as *mut libc::sem_t;
                while libc::sem_wait(sem) == -1 {
                    if errno() != libc::EINTR {
                        log::error!("sem_wait failed with errno {}", errno());
                        break;
                    }
                }
                continue;
            }

            libc::sched_yield();
        }
    }

    /// Release the mutex. A no-op unless the calling process holds it.
    pub fn unlock(&self) {
        match &self.inner {
            Backend::Atomic { shared } => unsafe {
                let lock = atomic_at(addr_of!((*shared.as_ptr()).lock));
                if lock
                    .compare_exchange(self_pid(), 0, Ordering::Release, Ordering::Relaxed)
                    .is_ok()
                {
                    wake_one(*shared);
                }
            },
            Backend::File { fd } => {
                if let Err(e) = fcntl_lock(*fd, libc::F_UNLCK, false) {
                    log::error!("file unlock failed: {e}");
                }
            }
        }
    }

    /// Release a lock held by another, typically dead, process. Returns
    /// whether `pid` was indeed the holder.
    pub fn force_unlock(&self, pid: u32) -> bool {
        match &self.inner {
            Backend::Atomic { shared } => unsafe {
                let lock = atomic_at(addr_of!((*shared.as_ptr()).lock));
                if lock
                    .compare_exchange(pid as u64, 0, Ordering::Release, Ordering::Relaxed)
                    .is_ok()
                {
                    wake_one(*shared);
                    true
                } else {
                    false
                }
            },
            Backend::File { .. } => false,
        }
    }

    /// Tear down the shared state. Only the creating process may call this,
    /// and only once no other process can touch the mutex again.
    ///
    /// # Safety
    ///
    /// Undefined if any process still uses the mutex afterwards.
    pub unsafe fn destroy(&self) {
        if let Backend::Atomic { shared } = &self.inner {
            let state = shared.as_ptr();
            if (*state).sem_enabled != 0 {
                let sem = addr_of_mut!((*state).sem) as *mut libc::sem_t;
                if libc::sem_destroy(sem) != 0 {
                    log::error!("sem_destroy failed with errno {}", errno());
                }
                (*state).sem_enabled = 0;
            }
        }
    }
}

impl Drop for Shmtx {
    fn drop(&mut self) {
        if let Backend::File { fd } = self.inner {
            unsafe { libc::close(fd) };
        }
    }
}

/// Post the semaphore if anybody is sleeping on it.
unsafe fn wake_one(shared: NonNull<MutexShared>) {
    let state = shared.as_ptr();
    if (*state).sem_enabled == 0 {
        return;
    }

    let wait = atomic_at(addr_of!((*state).wait));
    loop {
        let observed = wait.load(Ordering::Relaxed);
        if observed as i64 <= 0 {
            return;
        }
        if wait
            .compare_exchange_weak(
                observed,
                observed - 1,
                Ordering::AcqRel,
                Ordering::Relaxed,
            )
            .is_ok()
        {
            break;
        }
    }

    let sem = addr_of_mut!((*state).sem) as *mut libc::sem_t;
    if libc::sem_post(sem) != 0 {
        log::error!("sem_post failed with errno {}", errno());
    }
}

fn fcntl_lock(fd: libc::c_int, kind: libc::c_int, blocking: bool) -> Result<()> {
    let mut fl: libc::flock = unsafe { core::mem::zeroed() };
    fl.l_type = kind as libc::c_short;
    fl.l_whence = libc::SEEK_SET as libc::c_short;

    let cmd = if blocking { libc::F_SETLKW } else { libc::F_SETLK };
    let rc = unsafe { libc::fcntl(fd, cmd, &fl as *const libc::flock) };
    if rc == -1 {
        Err(Error::Sys("fcntl", errno()))
    } else {
        Ok(())
    }
}

fn errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}
