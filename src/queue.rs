/*!
Queues and command groups.

[`Queue::submit()`] runs a command group function, which declares the
buffers a task requires with [`Handler::require()`] and sets its kernel. The
task is ordered after every previous task writing a buffer it reads, and
after every previous task using a buffer it writes.

```
# use syclrt::{access::AccessMode, buffer::Buffer, device::Device, queue::Queue};
# fn main() -> syclrt::result::Result<()> {
let queue = Queue::new(Device::host());
let x = Buffer::from(vec![1u32, 2, 3]);
let y = Buffer::<u32>::new([3]);
queue.submit(|h| {
    let x = h.require(&x, AccessMode::Read)?;
    let y = h.require(&y, AccessMode::DiscardWrite)?;
    h.parallel_for(3, move |i| {
        y.write()?[i] = 2 * x.read()[i];
        Ok(())
    })
})?;
assert_eq!(y.to_vec(), [2, 4, 6]);
# Ok(())
# }
```

# Errors
In synchronous mode the error of a kernel is returned by `submit`. In
asynchronous mode it is returned by [`Event::wait()`] and the first one is
also kept by the queue, returned by [`Queue::wait()`].
*/

use crate::{
    access::Access,
    buffer::{Buffer, BufferAccessor, BufferBase},
    device::Device,
    result::Result,
    task::{shared_error, Event, Task},
};
use anyhow::bail;
use parking_lot::{Condvar, Mutex};
use std::{
    fmt::{self, Debug},
    sync::Arc,
};
use tracing::debug;

pub(crate) struct QueueState {
    device: Device,
    running: Mutex<usize>,
    idle: Condvar,
    error: Mutex<Option<Arc<anyhow::Error>>>,
}

impl QueueState {
    pub(crate) fn kernel_start(&self) {
        *self.running.lock() += 1;
    }
    pub(crate) fn kernel_end(&self) {
        let mut running = self.running.lock();
        *running = running.saturating_sub(1);
        if *running == 0 {
            self.idle.notify_all();
        }
    }
    /// Keeps the first error.
    pub(crate) fn report(&self, error: Arc<anyhow::Error>) {
        let mut slot = self.error.lock();
        if slot.is_none() {
            slot.replace(error);
        }
    }
    fn wait_idle(&self) {
        let mut running = self.running.lock();
        while *running > 0 {
            self.idle.wait(&mut running);
        }
    }
}

/// Submits tasks to a device.
pub struct Queue {
    state: Arc<QueueState>,
}

impl Queue {
    pub fn new(device: Device) -> Self {
        debug!(?device, "queue created");
        Self {
            state: Arc::new(QueueState {
                device,
                running: Mutex::new(0),
                idle: Condvar::new(),
                error: Mutex::default(),
            }),
        }
    }
    pub fn device(&self) -> &Device {
        &self.state.device
    }
    /** Submits a command group.

    **errors**

    - The error of `cgf`, in which case nothing is submitted.
    - The error of the kernel, in synchronous mode.
    - See [`Task::schedule()`]. */
    pub fn submit<F>(&self, cgf: F) -> Result<Event>
    where
        F: FnOnce(&mut Handler) -> Result<()>,
    {
        let task = Task::with_queue(self.state.clone());
        let mut handler = Handler {
            task: task.clone(),
            requirements: Vec::new(),
            kernel: None,
        };
        cgf(&mut handler)?;
        handler.finish(self.state.device.execution_mode())?;
        Ok(Event::new(task))
    }
    /** Blocks until every submitted task completed.

    **errors**

    The first error of an asynchronous task since the last call, see
    [`Task::wait()`]. */
    pub fn wait(&self) -> Result<()> {
        self.state.wait_idle();
        match self.state.error.lock().take() {
            Some(e) => Err(shared_error(&e)),
            None => Ok(()),
        }
    }
    /// Number of tasks not completed yet.
    pub fn running(&self) -> usize {
        *self.state.running.lock()
    }
}

/// Waits for the tasks, errors are dropped.
impl Drop for Queue {
    fn drop(&mut self) {
        self.state.wait_idle();
    }
}

impl Debug for Queue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Queue")
            .field("device", &self.state.device)
            .field("running", &self.running())
            .finish()
    }
}

type Kernel = Box<dyn FnOnce() -> Result<()> + Send>;

struct Requirement {
    buffer: Arc<BufferBase>,
    is_write_access: bool,
}

/// Collects the requirements and the kernel of a task.
pub struct Handler {
    task: Arc<Task>,
    requirements: Vec<Requirement>,
    kernel: Option<Kernel>,
}

impl Handler {
    /// The task being built.
    pub fn task(&self) -> &Arc<Task> {
        &self.task
    }
    /** Requires `buffer` with `access`, returning the accessor to move into
    the kernel.

    Requiring a buffer more than once merges the write intent.

    **errors**

    - `access` targets a pipe.
    - [`ReadOnlyBuffer`](crate::buffer::error::ReadOnlyBuffer) for a write access to a read only buffer.
    */
    pub fn require<T, const D: usize>(
        &mut self,
        buffer: &Buffer<T, D>,
        access: impl Into<Access>,
    ) -> Result<BufferAccessor<T, D>>
    where
        T: Send + Sync + 'static,
    {
        let access = access.into();
        if access.target().is_pipe() {
            bail!("{access} can not be used on a buffer!");
        }
        let base = buffer.base();
        base.check_access(access)?;
        let is_write_access = access.is_write_access();
        match self
            .requirements
            .iter_mut()
            .find(|requirement| requirement.buffer.id() == base.id())
        {
            Some(requirement) => requirement.is_write_access |= is_write_access,
            None => self.requirements.push(Requirement {
                buffer: base.clone(),
                is_write_access,
            }),
        }
        Ok(buffer.accessor(access))
    }
    /// Sets the kernel.
    pub fn single_task<F>(&mut self, kernel: F) -> Result<()>
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        if self.kernel.is_some() {
            bail!("{} already has a kernel!", self.task.id());
        }
        self.kernel.replace(Box::new(kernel));
        Ok(())
    }
    /// Sets a kernel calling `kernel` for each index in `0..n`, stopping at the first error.
    pub fn parallel_for<F>(&mut self, n: usize, kernel: F) -> Result<()>
    where
        F: Fn(usize) -> Result<()> + Send + 'static,
    {
        self.single_task(move || (0..n).try_for_each(kernel))
    }
    /// See [`Task::add_prelude()`].
    pub fn prelude(&mut self, f: impl FnOnce() + Send + 'static) -> Result<()> {
        Ok(self.task.add_prelude(f)?)
    }
    /// See [`Task::add_postlude()`].
    pub fn postlude(&mut self, f: impl FnOnce() + Send + 'static) -> Result<()> {
        Ok(self.task.add_postlude(f)?)
    }
    /** Registers the task on its buffers and schedules it.

    The chains are locked in buffer id order for the whole registration, so
    tasks submitted concurrently see the same order on every buffer. */
    fn finish(self, mode: crate::device::ExecutionMode) -> Result<()> {
        let Self {
            task,
            mut requirements,
            kernel,
        } = self;
        requirements.sort_by_key(|requirement| requirement.buffer.id());
        {
            let mut chains: Vec<_> = requirements
                .iter()
                .map(|requirement| requirement.buffer.lock_chain())
                .collect();
            for (requirement, chain) in requirements.iter().zip(chains.iter_mut()) {
                requirement
                    .buffer
                    .register(chain, &task, requirement.is_write_access)?;
            }
        }
        let kernel = kernel.unwrap_or_else(|| Box::new(|| Ok(())));
        task.schedule(mode, kernel)
    }
}

impl Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handler")
            .field("task", &self.task.id())
            .field("buffers", &self.requirements.len())
            .finish()
    }
}
