/*!
Host-side runtime scheduling accelerator tasks over shared buffers.

Tasks never name each other. Ordering is inferred from the buffers a task
requires: every write-capable access opens a new [generation](buffer::Generation)
of the buffer, readers share the latest read generation, and a generation only
becomes ready once the previous one has been released by all of its users.

```
# use syclrt::{buffer::Buffer, access::AccessMode, device::Device, queue::Queue};
# fn main() -> syclrt::result::Result<()> {
let queue = Queue::new(Device::host());
let buffer = Buffer::<u32>::new([4]);
queue.submit(|h| {
    let out = h.require(&buffer, AccessMode::DiscardWrite)?;
    h.single_task(move || {
        for (i, x) in out.write()?.iter_mut().enumerate() {
            *x = i as u32;
        }
        Ok(())
    })
})?;
queue.wait()?;
assert_eq!(buffer.host_read().as_slice(), &[0, 1, 2, 3]);
# Ok(())
# }
```

[Pipes](pipe) and [lock units](lock) are explicit synchronization primitives
usable inside the same task bodies.
*/

#![forbid(unsafe_code)]

pub use anyhow;

pub mod result {
    pub type Result<T, E = anyhow::Error> = std::result::Result<T, E>;
}

pub mod access;
pub mod buffer;
pub mod cache;
pub mod device;
pub mod future;
pub mod lock;
pub mod pipe;
pub mod queue;
pub mod task;
