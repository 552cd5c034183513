use std::{
    fmt::{self, Debug},
    hint,
    sync::atomic::{AtomicU32, Ordering},
    thread,
};
use tracing::trace;

const DEVICE: usize = 0;
const HOST: usize = 1;

/** A barrier between the host and one device, without locks.

Each side owns a counter which only increases. The device increments its
counter when it arrives and waits for the host counter to catch up, the host
waits for the device counter to move ahead and then catches up. Phases
repeat without any reset.
```
# use syclrt::lock::SoftBarrier;
let barrier = SoftBarrier::new();
std::thread::scope(|s| {
    s.spawn(|| {
        for _ in 0..3 {
            barrier.device_wait();
        }
    });
    for _ in 0..3 {
        barrier.host_wait();
    }
});
```
*/
#[derive(Default)]
pub struct SoftBarrier {
    counters: [AtomicU32; 2],
}

impl SoftBarrier {
    pub fn new() -> Self {
        Self::default()
    }
    /// Arrives on the device side and spins until the host arrived too.
    pub fn device_wait(&self) {
        let counter = self.counters[DEVICE]
            .fetch_add(1, Ordering::SeqCst)
            .wrapping_add(1);
        trace!(counter, "device arrived");
        while self.counters[HOST].load(Ordering::SeqCst) != counter {
            spin();
        }
    }
    /// Spins until the device arrived, then releases it.
    pub fn host_wait(&self) {
        let counter = self.counters[HOST].load(Ordering::SeqCst);
        while self.counters[DEVICE].load(Ordering::SeqCst) == counter {
            spin();
        }
        self.arrive(counter);
    }
    /// Releases the device if it is waiting, returns whether it was.
    pub fn host_try_arrive(&self) -> bool {
        let counter = self.counters[HOST].load(Ordering::SeqCst);
        if self.counters[DEVICE].load(Ordering::SeqCst) == counter {
            return false;
        }
        self.arrive(counter);
        true
    }
    fn arrive(&self, counter: u32) {
        let counter = counter.wrapping_add(1);
        self.counters[HOST].store(counter, Ordering::SeqCst);
        trace!(counter, "host arrived");
    }
}

fn spin() {
    hint::spin_loop();
    thread::yield_now();
}

impl Debug for SoftBarrier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SoftBarrier")
            .field("device", &self.counters[DEVICE].load(Ordering::SeqCst))
            .field("host", &self.counters[HOST].load(Ordering::SeqCst))
            .finish()
    }
}
