/*!
Tasks.

A task is the envelope around one kernel execution: it registers on the
generations of the buffers it requires, waits for all of them to be ready,
runs its preludes, its kernel and its postludes, then releases every
generation so the following tasks can run.

Tasks are usually created by [`Queue::submit()`](crate::queue::Queue::submit),
but can be driven by hand:
```
# use syclrt::{buffer::Buffer, device::ExecutionMode, task::{Task, TaskState}};
# fn main() -> syclrt::result::Result<()> {
let buffer = Buffer::from(vec![1u32, 2]);
let task = Task::new();
buffer.get_or_append_generation(&task, true)?;
task.schedule(ExecutionMode::Synchronous, || Ok(()))?;
assert_eq!(task.state(), TaskState::Completed);
assert!(buffer.tail_generation().unwrap().is_released());
# Ok(())
# }
```
*/

use crate::{buffer::Generation, device::ExecutionMode, queue::QueueState, result::Result};
use anyhow::format_err;
use derive_more::Display;
use parking_lot::{Condvar, Mutex};
use std::{
    any::Any,
    fmt::{self, Debug},
    mem::take,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    thread,
};
use tracing::{debug, trace};

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(0);

/// Errors.
pub mod error {
    use super::*;

    /// Dependencies and hooks can only be added before scheduling.
    #[derive(Clone, Copy, Debug, thiserror::Error)]
    #[error("{task} is already scheduled!")]
    pub struct TaskAlreadyScheduled {
        pub(super) task: TaskId,
    }

    /// The kernel, a prelude or a postlude panicked.
    #[derive(Clone, Debug, thiserror::Error)]
    #[error("{task} panicked: {message}")]
    pub struct KernelPanicked {
        pub(super) task: TaskId,
        pub(super) message: String,
    }

    /** The kernel of an asynchronous task failed.

    Waiters of the task share the error, which is available with
    [`.error()`](Self::error) for downcasting. */
    #[derive(Clone, Debug, thiserror::Error)]
    #[error("{error:#}")]
    pub struct KernelFailed {
        pub(super) error: Arc<anyhow::Error>,
    }

    impl KernelFailed {
        pub fn error(&self) -> &anyhow::Error {
            &self.error
        }
    }
}
use error::*;

/// Rebuilds a stored task error, keeping [`KernelPanicked`] downcastable.
pub(crate) fn shared_error(error: &Arc<anyhow::Error>) -> anyhow::Error {
    match error.downcast_ref::<KernelPanicked>() {
        Some(panicked) => panicked.clone().into(),
        None => KernelFailed {
            error: error.clone(),
        }
        .into(),
    }
}

/// Unique task id.
#[derive(Clone, Copy, Debug, Display, Eq, PartialEq, Hash, Ord, PartialOrd)]
#[display(fmt = "Task({})", _0)]
pub struct TaskId(u64);

impl TaskId {
    pub(crate) fn next() -> Self {
        Self(NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Lifecycle of a [`Task`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TaskState {
    Created,
    BuffersRegistered,
    Scheduled,
    Acquiring,
    Running,
    Releasing,
    Completed,
}

impl TaskState {
    fn is_scheduled(self) -> bool {
        !matches!(self, Self::Created | Self::BuffersRegistered)
    }
}

type Hook = Box<dyn FnOnce() + Send>;

struct Dependency {
    generation: Arc<Generation>,
    is_write_access: bool,
}

struct TaskStatus {
    state: TaskState,
    error: Option<Arc<anyhow::Error>>,
}

/// A kernel execution and the buffer generations it uses.
pub struct Task {
    id: TaskId,
    status: Mutex<TaskStatus>,
    completed: Condvar,
    dependencies: Mutex<Vec<Dependency>>,
    preludes: Mutex<Vec<Hook>>,
    postludes: Mutex<Vec<Hook>>,
    queue: Option<Arc<QueueState>>,
}

impl Task {
    /// A task which does not report to a queue.
    pub fn new() -> Arc<Self> {
        Self::create(None)
    }
    pub(crate) fn with_queue(queue: Arc<QueueState>) -> Arc<Self> {
        Self::create(Some(queue))
    }
    fn create(queue: Option<Arc<QueueState>>) -> Arc<Self> {
        let task = Arc::new(Self {
            id: TaskId::next(),
            status: Mutex::new(TaskStatus {
                state: TaskState::Created,
                error: None,
            }),
            completed: Condvar::new(),
            dependencies: Mutex::default(),
            preludes: Mutex::default(),
            postludes: Mutex::default(),
            queue,
        });
        trace!(task = %task.id, "task created");
        task
    }
    pub fn id(&self) -> TaskId {
        self.id
    }
    pub fn state(&self) -> TaskState {
        self.status.lock().state
    }
    fn set_state(&self, state: TaskState) {
        self.status.lock().state = state;
        trace!(task = %self.id, ?state);
    }
    fn check_not_scheduled(&self, state: TaskState) -> Result<(), TaskAlreadyScheduled> {
        if state.is_scheduled() {
            Err(TaskAlreadyScheduled { task: self.id })
        } else {
            Ok(())
        }
    }
    /** Registers the task as a user of `generation`.

    Dependencies are acquired and released in the order they were added.

    **errors**

    - [`TaskAlreadyScheduled`](error::TaskAlreadyScheduled) */
    pub fn add_dependency(
        &self,
        generation: Arc<Generation>,
        is_write_access: bool,
    ) -> Result<(), TaskAlreadyScheduled> {
        let mut status = self.status.lock();
        self.check_not_scheduled(status.state)?;
        generation.register_consumer(self.id, is_write_access);
        self.dependencies.lock().push(Dependency {
            generation,
            is_write_access,
        });
        status.state = TaskState::BuffersRegistered;
        Ok(())
    }
    /// The generations the task uses, in registration order.
    pub fn dependencies(&self) -> Vec<Arc<Generation>> {
        self.dependencies
            .lock()
            .iter()
            .map(|dependency| dependency.generation.clone())
            .collect()
    }
    /// Adds a hook run after the buffers are acquired, before the kernel.
    pub fn add_prelude(
        &self,
        f: impl FnOnce() + Send + 'static,
    ) -> Result<(), TaskAlreadyScheduled> {
        let status = self.status.lock();
        self.check_not_scheduled(status.state)?;
        self.preludes.lock().push(Box::new(f));
        Ok(())
    }
    /// Adds a hook run after a successful kernel, before the buffers are released.
    pub fn add_postlude(
        &self,
        f: impl FnOnce() + Send + 'static,
    ) -> Result<(), TaskAlreadyScheduled> {
        let status = self.status.lock();
        self.check_not_scheduled(status.state)?;
        self.postludes.lock().push(Box::new(f));
        Ok(())
    }
    /// Blocks until every dependency is ready.
    pub fn acquire_buffers(&self) {
        let dependencies = self.dependencies();
        for generation in dependencies.iter() {
            trace!(task = %self.id, generation = generation.id(), "waiting for generation");
            generation.wait_ready();
        }
    }
    /// Releases every dependency, only the first call has an effect.
    pub fn release_buffers(&self) {
        let dependencies = take(&mut *self.dependencies.lock());
        for dependency in dependencies {
            trace!(
                task = %self.id,
                generation = dependency.generation.id(),
                is_write_access = dependency.is_write_access,
                "releasing generation"
            );
            dependency.generation.release();
        }
    }
    /** Runs `kernel` within the task envelope.

    In [`Synchronous`](ExecutionMode::Synchronous) mode the task runs on the
    calling thread and the error of the kernel is returned. In
    [`Asynchronous`](ExecutionMode::Asynchronous) mode the task runs on a
    detached thread, errors are stored on the task and reported to its queue.

    The buffers are released on every path, including a panicking kernel.

    **errors**

    - [`TaskAlreadyScheduled`](error::TaskAlreadyScheduled)
    - The error of the kernel, in synchronous mode.
    - Spawning the thread failed. */
    pub fn schedule<F>(self: &Arc<Self>, mode: ExecutionMode, kernel: F) -> Result<()>
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        {
            let mut status = self.status.lock();
            self.check_not_scheduled(status.state)?;
            status.state = TaskState::Scheduled;
        }
        debug!(task = %self.id, ?mode, "task scheduled");
        if let Some(queue) = self.queue.as_ref() {
            queue.kernel_start();
        }
        match mode {
            ExecutionMode::Synchronous => {
                let result = self.execute(kernel);
                let error = result.as_ref().err().map(|e| {
                    Arc::new(match e.downcast_ref::<KernelPanicked>() {
                        Some(panicked) => panicked.clone().into(),
                        None => format_err!("{e:#}"),
                    })
                });
                self.complete(error, false);
                result
            }
            ExecutionMode::Asynchronous => {
                let task = self.clone();
                let spawned = thread::Builder::new()
                    .name(format!("syclrt-task{}", self.id.0))
                    .spawn(move || {
                        let error = task.execute(kernel).err().map(Arc::new);
                        task.complete(error, true);
                    });
                if let Err(e) = spawned {
                    self.release_buffers();
                    let e = anyhow::Error::from(e);
                    self.complete(Some(Arc::new(format_err!("{e:#}"))), false);
                    return Err(e);
                }
                Ok(())
            }
        }
    }
    fn execute<F>(&self, kernel: F) -> Result<()>
    where
        F: FnOnce() -> Result<()>,
    {
        let result = {
            let _release = ReleaseGuard(self);
            self.set_state(TaskState::Acquiring);
            self.acquire_buffers();
            self.set_state(TaskState::Running);
            let preludes = take(&mut *self.preludes.lock());
            let postludes = take(&mut *self.postludes.lock());
            let result = catch_unwind(AssertUnwindSafe(move || -> Result<()> {
                preludes.into_iter().for_each(|prelude| prelude());
                kernel()?;
                postludes.into_iter().for_each(|postlude| postlude());
                Ok(())
            }));
            self.set_state(TaskState::Releasing);
            result
        };
        match result {
            Ok(result) => result,
            Err(payload) => Err(KernelPanicked {
                task: self.id,
                message: panic_message(payload.as_ref()),
            }
            .into()),
        }
    }
    fn complete(&self, error: Option<Arc<anyhow::Error>>, report: bool) {
        if let Some(e) = error.as_ref() {
            debug!(task = %self.id, error = %e, "task failed");
            if let (Some(queue), true) = (self.queue.as_ref(), report) {
                queue.report(e.clone());
            }
        }
        {
            let mut status = self.status.lock();
            status.state = TaskState::Completed;
            status.error = error;
        }
        self.completed.notify_all();
        debug!(task = %self.id, "task completed");
        if let Some(queue) = self.queue.as_ref() {
            queue.kernel_end();
        }
    }
    /** Blocks until the task completed.

    A task which is never scheduled never completes.

    **errors**

    The error of the kernel as [`KernelFailed`](error::KernelFailed), or
    [`KernelPanicked`](error::KernelPanicked). */
    pub fn wait(&self) -> Result<()> {
        let mut status = self.status.lock();
        while status.state != TaskState::Completed {
            self.completed.wait(&mut status);
        }
        match status.error.as_ref() {
            Some(e) => Err(shared_error(e)),
            None => Ok(()),
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".into()
    }
}

struct ReleaseGuard<'a>(&'a Task);

impl Drop for ReleaseGuard<'_> {
    fn drop(&mut self) {
        self.0.release_buffers();
    }
}

impl Drop for Task {
    fn drop(&mut self) {
        // Registrations of a task that never ran would stall the chains.
        if !self.dependencies.get_mut().is_empty() {
            debug!(task = %self.id, "releasing the buffers of an unscheduled task");
            self.release_buffers();
        }
    }
}

impl Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}

/** Handle to a submitted task.

Derefs to the [`Task`]. */
#[derive(Clone, Debug, derive_more::Deref)]
pub struct Event {
    #[deref]
    task: Arc<Task>,
}

impl Event {
    pub(crate) fn new(task: Arc<Task>) -> Self {
        Self { task }
    }
    /// Waits for the task, see [`Task::wait()`].
    pub fn wait(&self) -> Result<()> {
        self.task.wait()
    }
}
