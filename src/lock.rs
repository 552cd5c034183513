/*!
Lock units.

A [`LockingDevice`] is not a plain mutex: it holds a boolean payload and
waiters can block until the payload has a given value. A [`LockUnit`] groups
[`LOCK_NUMBER`](LockUnit::LOCK_NUMBER) of them, like the lock unit of an AI
Engine memory module.

Handing a value over between two threads:
```
# use syclrt::lock::LockUnit;
# fn main() -> syclrt::result::Result<()> {
let unit = LockUnit::new();
std::thread::scope(|s| -> syclrt::result::Result<()> {
    let lock = unit.lock(3)?;
    s.spawn(move || lock.acquire_with_value(true));
    lock.release_with_value(true);
    Ok(())
})?;
# Ok(())
# }
```

Barriers across a grid of units are implemented in [`TileGrid`], host and
device rendezvous in [`SoftBarrier`].
*/

use parking_lot::{Condvar, Mutex, MutexGuard};
use std::{
    fmt::{self, Debug},
    ops::{Deref, DerefMut},
};
use tracing::trace;

mod barrier;
mod soft_barrier;

pub use barrier::{Tile, TileGrid};
pub use soft_barrier::SoftBarrier;

/// Errors.
pub mod error {
    /// The lock index is greater than or equal to [`LockUnit::LOCK_NUMBER`](super::LockUnit::LOCK_NUMBER).
    #[derive(Clone, Copy, Debug, thiserror::Error)]
    #[error("Lock index {index} is out of range 0..{locks}!")]
    pub struct LockIndexOutOfRange {
        pub(super) index: usize,
        pub(super) locks: usize,
    }
}
use error::*;

/// A boolean payload guarded by a mutex and a condition variable.
#[derive(Default)]
pub struct LockingDevice {
    value: Mutex<bool>,
    cv: Condvar,
}

impl LockingDevice {
    pub fn new() -> Self {
        Self::default()
    }
    /** Locks the device, like a mutex.

    The guard gives access to the payload, waiters are not notified when it
    changes. */
    pub fn acquire(&self) -> LockGuard<'_> {
        LockGuard {
            value: self.value.lock(),
        }
    }
    /// Blocks until the payload is `expectation`.
    pub fn acquire_with_value(&self, expectation: bool) {
        let mut value = self.value.lock();
        while *value != expectation {
            self.cv.wait(&mut value);
        }
        trace!(expectation, "lock acquired");
    }
    /// Sets the payload and wakes up one waiter.
    pub fn release_with_value(&self, new_value: bool) {
        *self.value.lock() = new_value;
        trace!(new_value, "lock released");
        self.cv.notify_one();
    }
    /// The current payload.
    pub fn value(&self) -> bool {
        *self.value.lock()
    }
}

impl Debug for LockingDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("LockingDevice").field(&self.value()).finish()
    }
}

/// Guard returned by [`LockingDevice::acquire()`], unlocks on drop.
pub struct LockGuard<'a> {
    value: MutexGuard<'a, bool>,
}

impl Deref for LockGuard<'_> {
    type Target = bool;
    fn deref(&self) -> &bool {
        &self.value
    }
}

impl DerefMut for LockGuard<'_> {
    fn deref_mut(&mut self) -> &mut bool {
        &mut self.value
    }
}

impl Debug for LockGuard<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("LockGuard").field(&*self.value).finish()
    }
}

const LOCK_NUMBER: usize = 16;

/// A set of [`LockingDevice`]s, all starting with a false payload.
pub struct LockUnit {
    locks: [LockingDevice; LOCK_NUMBER],
}

impl LockUnit {
    pub const LOCK_NUMBER: usize = LOCK_NUMBER;
    pub fn new() -> Self {
        Self {
            locks: std::array::from_fn(|_| LockingDevice::new()),
        }
    }
    /// The lock `index`.
    ///
    /// **errors**
    ///
    /// - [`LockIndexOutOfRange`](error::LockIndexOutOfRange)
    pub fn lock(&self, index: usize) -> Result<&LockingDevice, LockIndexOutOfRange> {
        self.locks.get(index).ok_or(LockIndexOutOfRange {
            index,
            locks: Self::LOCK_NUMBER,
        })
    }
}

impl Default for LockUnit {
    fn default() -> Self {
        Self::new()
    }
}

impl Debug for LockUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.locks.iter().map(LockingDevice::value))
            .finish()
    }
}
