//! Cross-process lock word.
//!
//! A compare-and-swap spin lock living at a fixed offset inside the shared
//! region, so every peer contends on the same physical word. It guards only
//! the header-publication step of the enqueue path; payload writes are
//! ordered by barriers, not by this lock.

use std::hint::spin_loop;
use std::sync::atomic::{AtomicU32, Ordering};

const UNLOCKED: u32 = 0;
const LOCKED: u32 = 1;

/// A view of the in-region lock word.
pub struct RegionLock {
    word: *const AtomicU32,
}

// SAFETY: the lock word is an atomic in shared memory.
unsafe impl Send for RegionLock {}
unsafe impl Sync for RegionLock {}

impl RegionLock {
    /// Create a lock view from the raw word address.
    ///
    /// # Safety
    ///
    /// `word` must point to a 4-byte-aligned u32 inside the shared region,
    /// valid for the lifetime of this view.
    pub unsafe fn from_raw(word: *mut u32) -> Self {
        Self {
            word: word as *const AtomicU32,
        }
    }

    #[inline]
    fn word(&self) -> &AtomicU32 {
        // SAFETY: caller guaranteed a valid, aligned pointer in from_raw.
        unsafe { &*self.word }
    }

    /// Force the word to the unlocked state (region initialization only).
    pub fn reset(&self) {
        self.word().store(UNLOCKED, Ordering::Release);
    }

    /// Spin until the lock is acquired.
    ///
    /// Holders publish one 16-byte record and release, so the critical
    /// section is a handful of instructions; plain spinning with a CPU
    /// relax hint is the contention strategy.
    pub fn lock(&self) -> RegionGuard<'_> {
        while self
            .word()
            .compare_exchange_weak(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            spin_loop();
        }
        RegionGuard { lock: self }
    }

    fn unlock(&self) {
        self.word().store(UNLOCKED, Ordering::Release);
    }
}

/// Holds the region lock; releases on drop.
pub struct RegionGuard<'a> {
    lock: &'a RegionLock,
}

impl Drop for RegionGuard<'_> {
    fn drop(&mut self) {
        self.lock.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn lock_unlock_cycle() {
        let mut word = 0u32;
        let lock = unsafe { RegionLock::from_raw(&mut word) };

        {
            let _guard = lock.lock();
            assert_eq!(lock.word().load(Ordering::Relaxed), LOCKED);
        }
        assert_eq!(lock.word().load(Ordering::Relaxed), UNLOCKED);
    }

    #[test]
    fn reset_clears_stale_holder() {
        let mut word = LOCKED;
        let lock = unsafe { RegionLock::from_raw(&mut word) };
        lock.reset();
        let _guard = lock.lock();
    }

    #[test]
    fn contended_counter_stays_consistent() {
        // The word must live in shared storage that outlives the threads.
        let storage = Arc::new((AtomicU32::new(0), AtomicU32::new(0)));
        let mut handles = Vec::new();

        for _ in 0..4 {
            let storage = storage.clone();
            handles.push(std::thread::spawn(move || {
                let lock = unsafe {
                    RegionLock::from_raw(&storage.0 as *const AtomicU32 as *mut u32)
                };
                for _ in 0..1000 {
                    let _guard = lock.lock();
                    let v = storage.1.load(Ordering::Relaxed);
                    storage.1.store(v + 1, Ordering::Relaxed);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(storage.1.load(Ordering::Relaxed), 4000);
    }
}
