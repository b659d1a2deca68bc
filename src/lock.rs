//! per-entry read/write locks keyed by DN
//!
//! acquisition is retried a bounded number of times, each attempt waiting on
//! a condition variable for at most a fixed duration. A `None` result is a
//! recoverable failure; callers abort the operation instead of retrying
//! themselves. Locks are released when the returned guard goes out of scope.

use crate::dn::Dn;
use std::collections::HashMap;
use std::sync::{Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tracing::instrument;

/// the default number of acquisition attempts
pub const DEFAULT_LOCK_ATTEMPTS: u32 = 3;

/// the default time a single acquisition attempt waits
pub const DEFAULT_LOCK_ATTEMPT_TIMEOUT: Duration = Duration::from_millis(3000);

/// how an entry is locked
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LockMode {
    /// shared, any number of readers
    Read,
    /// exclusive, excludes readers and other writers
    Write,
}

/// the holders of a single DN
#[derive(Debug, Default)]
struct LockState {
    /// number of read holders
    readers: usize,
    /// whether a writer holds the lock
    writer: bool,
}

impl LockState {
    /// try to add a holder in the given mode
    fn try_grant(&mut self, mode: LockMode) -> bool {
        match mode {
            LockMode::Read if !self.writer => {
                self.readers += 1;
                true
            }
            LockMode::Write if !self.writer && self.readers == 0 => {
                self.writer = true;
                true
            }
            _ => false,
        }
    }

    /// whether nobody holds the lock anymore
    fn is_free(&self) -> bool {
        self.readers == 0 && !self.writer
    }
}

/// lock table for all entries of the server
#[derive(Debug)]
pub struct EntryLockManager {
    /// the holders per DN, DNs without holders are removed
    state: Mutex<HashMap<Dn, LockState>>,
    /// signalled whenever a lock is released
    released: Condvar,
    /// how often acquisition is attempted
    attempts: u32,
    /// how long a single attempt waits
    attempt_timeout: Duration,
}

impl Default for EntryLockManager {
    fn default() -> Self {
        Self::new(DEFAULT_LOCK_ATTEMPTS, DEFAULT_LOCK_ATTEMPT_TIMEOUT)
    }
}

impl EntryLockManager {
    /// create a lock manager with the given retry bound and per-attempt wait
    pub fn new(attempts: u32, attempt_timeout: Duration) -> Self {
        Self {
            state: Mutex::new(HashMap::new()),
            released: Condvar::new(),
            attempts: attempts.max(1),
            attempt_timeout,
        }
    }

    /// acquire a lock on a single entry
    ///
    /// returns `None` once all attempts are exhausted
    #[instrument(skip(self), fields(dn = %dn))]
    pub fn acquire(&self, dn: &Dn, mode: LockMode) -> Option<EntryLock<'_>> {
        for attempt in 1..=self.attempts {
            let deadline = Instant::now() + self.attempt_timeout;
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            loop {
                if state.entry(dn.clone()).or_default().try_grant(mode) {
                    return Some(EntryLock {
                        manager: self,
                        dn: dn.clone(),
                        mode,
                        released: false,
                    });
                }
                let now = Instant::now();
                if now >= deadline {
                    break;
                }
                let (new_state, _) = self
                    .released
                    .wait_timeout(state, deadline - now)
                    .unwrap_or_else(PoisonError::into_inner);
                state = new_state;
            }
            if state.get(dn).is_some_and(LockState::is_free) {
                state.remove(dn);
            }
            drop(state);
            tracing::debug!("Attempt {} to lock {} failed", attempt, dn);
        }
        tracing::warn!(
            "Unable to acquire a {:?} lock on {} after {} attempts",
            mode,
            dn,
            self.attempts
        );
        None
    }

    /// acquire locks on several entries in DN order
    ///
    /// requests for the same DN are merged with the stronger mode winning.
    /// If any lock cannot be acquired all locks taken so far are released
    /// before `None` is returned.
    pub fn acquire_all(&self, requests: &[(Dn, LockMode)]) -> Option<Vec<EntryLock<'_>>> {
        let mut sorted: Vec<(Dn, LockMode)> = requests.to_vec();
        sorted.sort();
        let mut merged: Vec<(Dn, LockMode)> = Vec::with_capacity(sorted.len());
        for (dn, mode) in sorted {
            match merged.last_mut() {
                Some((last_dn, last_mode)) if *last_dn == dn => {
                    *last_mode = (*last_mode).max(mode);
                }
                _ => merged.push((dn, mode)),
            }
        }
        let mut locks = Vec::with_capacity(merged.len());
        for (dn, mode) in &merged {
            match self.acquire(dn, mode.to_owned()) {
                Some(lock) => locks.push(lock),
                None => {
                    for mut lock in locks {
                        lock.release();
                    }
                    return None;
                }
            }
        }
        Some(locks)
    }

    /// whether any lock is currently held on the DN
    pub fn is_locked(&self, dn: &Dn) -> bool {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.get(dn).is_some_and(|s| !s.is_free())
    }

    /// the number of DNs with at least one holder
    pub fn locked_entry_count(&self) -> usize {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.values().filter(|s| !s.is_free()).count()
    }

    /// give up one holder of the DN in the given mode
    fn release(&self, dn: &Dn, mode: LockMode) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(lock_state) = state.get_mut(dn) {
            match mode {
                LockMode::Read => lock_state.readers = lock_state.readers.saturating_sub(1),
                LockMode::Write => lock_state.writer = false,
            }
            if lock_state.is_free() {
                state.remove(dn);
            }
        }
        drop(state);
        self.released.notify_all();
    }
}

/// a held entry lock, released on drop
#[derive(Debug)]
pub struct EntryLock<'a> {
    /// the manager the lock belongs to
    manager: &'a EntryLockManager,
    /// the locked DN
    dn: Dn,
    /// the mode the lock is held in
    mode: LockMode,
    /// whether the lock was already released
    released: bool,
}

impl EntryLock<'_> {
    /// the locked DN
    pub fn dn(&self) -> &Dn {
        &self.dn
    }

    /// the mode the lock is held in
    pub fn mode(&self) -> LockMode {
        self.mode
    }

    /// release the lock, calling this more than once has no effect
    pub fn release(&mut self) {
        if !self.released {
            self.released = true;
            self.manager.release(&self.dn, self.mode);
        }
    }
}

impl Drop for EntryLock<'_> {
    fn drop(&mut self) {
        self.release();
    }
}
