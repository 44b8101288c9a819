use std::ptr::NonNull;

use rand::Rng;
use rayon::prelude::*;

use slabpool::{SharedRegion, SlabPool};

fn new_pool(bytes: usize) -> (SharedRegion, SlabPool) {
    let _ = env_logger::builder().is_test(true).try_init();
    let region = SharedRegion::create_anon(bytes).unwrap();
    let pool = unsafe { SlabPool::init_in(&region, 3).unwrap() };
    (region, pool)
}

#[test]
fn alloc_free_through_the_public_surface() {
    let (_region, pool) = new_pool(1 << 20);
    let sizes = pool.sizes();

    let small = pool.alloc(1).unwrap();
    let exact = pool.alloc(sizes.exact_size as usize).unwrap();
    let big = pool.alloc(sizes.max_size as usize).unwrap();
    let run = pool.alloc(sizes.page_size as usize * 2).unwrap();

    for p in [small, exact, big, run] {
        pool.free(p);
    }

    let mut locked = pool.lock();
    for s in locked.stats() {
        assert_eq!(s.used, 0);
    }
    let _ = locked.alloc(8).unwrap();
}

#[test]
fn calloc_returns_zeroed_objects() {
    let (_region, pool) = new_pool(1 << 20);

    let p = pool.alloc(512).unwrap();
    unsafe { p.as_ptr().write_bytes(0xee, 512) };
    pool.free(p);

    let q = pool.calloc(512).unwrap();
    let bytes = unsafe { std::slice::from_raw_parts(q.as_ptr(), 512) };
    assert!(bytes.iter().all(|&b| b == 0));
    pool.free(q);
}

#[test]
fn guard_holds_the_mutex_until_dropped() {
    let (_region, pool) = new_pool(1 << 20);

    let guard = pool.lock();
    assert!(pool.try_lock().is_none(), "mutex must be held by the guard");
    drop(guard);

    let mut reacquired = pool.try_lock().expect("mutex must be free again");
    let p = reacquired.alloc(64).unwrap();
    reacquired.free(p);
}

#[test]
fn oom_surfaces_as_none_not_panic() {
    let (_region, pool) = new_pool(64 * 1024);
    pool.lock().log_nomem(false);

    let mut live = Vec::new();
    while let Some(p) = pool.alloc(4096) {
        live.push(p);
    }
    assert!(pool.alloc(4096).is_none());
    assert!(!live.is_empty());

    for p in live {
        pool.free(p);
    }
}

#[test]
fn parallel_churn_keeps_counters_consistent() {
    let (_region, pool) = new_pool(8 << 20);
    let initial = pool.lock().pfree();

    (0..8u32).into_par_iter().for_each(|seed| {
        let mut rng = rand::thread_rng();
        let mut live: Vec<(NonNull<u8>, usize)> = Vec::new();

        for round in 0..400 {
            if live.len() < 24 && rng.gen_bool(0.7) {
                let size = rng.gen_range(1..=6000);
                if let Some(p) = pool.alloc(size) {
                    // Each worker stamps its objects and rechecks them, so
                    // overlapping handouts would be caught.
                    let tag = (seed as u8).wrapping_add(round as u8);
                    unsafe { p.as_ptr().write_bytes(tag, size) };
                    live.push((p, size));
                }
            } else if let Some((p, size)) = live.pop() {
                let bytes = unsafe { std::slice::from_raw_parts(p.as_ptr(), size) };
                let first = bytes[0];
                assert!(bytes.iter().all(|&b| b == first));
                pool.free(p);
            }
        }

        for (p, _) in live {
            pool.free(p);
        }
    });

    let mut locked = pool.lock();
    assert_eq!(locked.pfree(), initial);
    for s in locked.stats() {
        assert_eq!(s.used, 0, "no objects may remain after the churn");
    }
    let _ = locked.alloc(1).unwrap();
}

#[test]
fn pool_state_crosses_the_fork_boundary() {
    let (region, pool) = new_pool(1 << 20);
    let shared = pool.calloc(64).unwrap();

    match unsafe { libc::fork() } {
        0 => {
            // Child: the anonymous shared mapping is inherited; attach a
            // fresh handle and work through the same mutex.
            let code = match unsafe { SlabPool::attach(&region) } {
                Ok(child_pool) => match child_pool.alloc(256) {
                    Some(p) => {
                        unsafe { shared.as_ptr().write_bytes(0x5a, 64) };
                        child_pool.free(p);
                        0
                    }
                    None => 1,
                },
                Err(_) => 2,
            };
            unsafe { libc::_exit(code) };
        }
        pid if pid > 0 => {
            let mut status = 0;
            let waited = unsafe { libc::waitpid(pid, &mut status, 0) };
            assert_eq!(waited, pid);
            assert!(libc::WIFEXITED(status));
            assert_eq!(libc::WEXITSTATUS(status), 0);

            // The child's writes are visible after its unlock.
            let bytes = unsafe { std::slice::from_raw_parts(shared.as_ptr(), 64) };
            assert!(bytes.iter().all(|&b| b == 0x5a));

            pool.free(shared);
            let locked = pool.lock();
            assert_eq!(locked.stats().iter().map(|s| s.used).sum::<u64>(), 0);
        }
        _ => panic!("fork failed"),
    }
}

#[test]
fn dead_holder_can_be_forced_off_the_mutex() {
    let (region, pool) = new_pool(1 << 20);

    match unsafe { libc::fork() } {
        0 => {
            // Child: take the mutex and die holding it.
            if let Ok(child_pool) = unsafe { SlabPool::attach(&region) } {
                let guard = child_pool.lock();
                std::mem::forget(guard);
            }
            unsafe { libc::_exit(0) };
        }
        pid if pid > 0 => {
            let mut status = 0;
            unsafe { libc::waitpid(pid, &mut status, 0) };

            assert!(pool.try_lock().is_none(), "dead child still holds the lock");
            assert!(pool.mutex().force_unlock(pid as u32));

            let mut locked = pool.try_lock().expect("mutex must be recoverable");
            let p = locked.alloc(32).unwrap();
            locked.free(p);
        }
        _ => panic!("fork failed"),
    }
}
