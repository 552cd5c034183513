/*!
Buffers shared by tasks.

A [`Buffer`] owns a chain of [generations](Generation). Requiring a buffer
from a task either joins the latest read generation or appends a new
generation, which only becomes ready once the previous one is released.

Clones of a buffer share the same data and the same chain:
```
# use syclrt::buffer::Buffer;
let a = Buffer::from(vec![1, 2, 3]);
let b = a.clone();
a.host_write().unwrap()[0] = 10;
assert_eq!(b.to_vec(), [10, 2, 3]);
```

# Final data
With [`.set_final_data()`](Buffer::set_final_data), the content of a
modified buffer is copied back when the buffer is destroyed. Dropping the
last buffer handle then blocks until tasks still using the buffer are done
and the copy happened.
*/

use crate::{
    access::{Access, AccessMode},
    future::{notifier, BlockableFuture, Notifier, NotifyFuture},
    result::Result,
    task::Task,
};
use parking_lot::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::{
    fmt::{self, Debug},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Weak,
    },
};
use tracing::debug;

mod generation;
pub use generation::Generation;

static NEXT_BUFFER_ID: AtomicU64 = AtomicU64::new(0);

/// Errors.
pub mod error {
    use super::*;

    /// The buffer was created read only.
    #[derive(Clone, Copy, Debug, thiserror::Error)]
    #[error("Buffer {buffer} is read only!")]
    pub struct ReadOnlyBuffer {
        pub(super) buffer: u64,
    }

    /// The accessor was created without write access.
    #[derive(Clone, Copy, Debug, thiserror::Error)]
    #[error("{access} does not allow writing!")]
    pub struct ReadOnlyAccessor {
        pub(super) access: Access,
    }

    /// The data does not fill the range.
    #[derive(Clone, Copy, Debug, thiserror::Error)]
    #[error("Buffer range holds {expected} elements, found {found}!")]
    pub struct BufferLengthMismatch {
        pub(super) expected: usize,
        pub(super) found: usize,
    }
}
use error::*;

pub(crate) type Chain<'a> = MutexGuard<'a, Option<Arc<Generation>>>;

/// The type independent part of a buffer.
pub(crate) struct BufferBase {
    id: u64,
    read_only: bool,
    modified: AtomicBool,
    tail: Mutex<Option<Arc<Generation>>>,
}

impl BufferBase {
    fn new(read_only: bool) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_BUFFER_ID.fetch_add(1, Ordering::Relaxed),
            read_only,
            modified: AtomicBool::new(false),
            tail: Mutex::default(),
        })
    }
    pub(crate) fn id(&self) -> u64 {
        self.id
    }
    fn is_modified(&self) -> bool {
        self.modified.load(Ordering::SeqCst)
    }
    /// Checks the access and tracks modifications.
    pub(crate) fn check_access(&self, access: Access) -> Result<(), ReadOnlyBuffer> {
        if access.is_write_access() {
            if self.read_only {
                return Err(ReadOnlyBuffer { buffer: self.id });
            }
            self.modified.store(true, Ordering::SeqCst);
        }
        Ok(())
    }
    pub(crate) fn lock_chain(&self) -> Chain<'_> {
        self.tail.lock()
    }
    /** Selects the generation for a new user and registers `task` on it.

    Readers join the tail unless a writer uses it, anything else appends a
    new generation. The first generation is ready immediately. */
    pub(crate) fn register(
        &self,
        chain: &mut Chain,
        task: &Task,
        wants_write: bool,
    ) -> Result<Arc<Generation>> {
        let reusable = match &**chain {
            Some(tail) if !wants_write && !tail.is_write_access() => Some(tail.clone()),
            _ => None,
        };
        let generation = if let Some(tail) = reusable {
            tail
        } else {
            let generation = Generation::new(self.id, wants_write);
            match chain.replace(generation.clone()) {
                Some(previous) => previous.set_next_generation(generation.clone()),
                None => generation.mark_ready(),
            }
            generation
        };
        task.add_dependency(generation.clone(), wants_write)?;
        Ok(generation)
    }
    fn tail(&self) -> Option<Arc<Generation>> {
        self.tail.lock().clone()
    }
    fn wait_for_host_access(&self) {
        if let Some(tail) = self.tail() {
            debug!(buffer = self.id, generation = tail.id(), "host waits for release");
            tail.wait_released();
        }
    }
}

type FinalWriteBack<T> = Box<dyn FnOnce(&[T]) + Send>;

struct BufferStorage<T, const D: usize> {
    base: Arc<BufferBase>,
    range: [usize; D],
    data: RwLock<Vec<T>>,
    final_write_back: Mutex<Option<FinalWriteBack<T>>>,
    notify_on_drop: Mutex<Option<Notifier>>,
}

impl<T, const D: usize> BufferStorage<T, D> {
    /// A future to wait for the write back, if other owners remain.
    fn destructor_future(self: &Arc<Self>) -> Option<NotifyFuture> {
        if Arc::strong_count(self) > 1
            && self.base.is_modified()
            && self.final_write_back.lock().is_some()
        {
            let (notifier, future) = notifier();
            self.notify_on_drop.lock().replace(notifier);
            Some(future)
        } else {
            None
        }
    }
}

impl<T, const D: usize> Drop for BufferStorage<T, D> {
    fn drop(&mut self) {
        if self.base.is_modified() {
            if let Some(write_back) = self.final_write_back.get_mut().take() {
                debug!(buffer = self.base.id, "final data write back");
                write_back(self.data.get_mut());
            }
        }
        self.notify_on_drop.get_mut().take();
    }
}

struct BufferWaiter<T, const D: usize> {
    storage: Weak<BufferStorage<T, D>>,
}

impl<T, const D: usize> Drop for BufferWaiter<T, D> {
    fn drop(&mut self) {
        let future = self
            .storage
            .upgrade()
            .and_then(|storage| storage.destructor_future());
        if let Some(future) = future {
            debug!("buffer destructor waits for the final write back");
            future.block();
        }
    }
}

/** A buffer of `T` with `D` dimensions.

The range is row major, the data is stored contiguously. */
pub struct Buffer<T, const D: usize = 1> {
    storage: Arc<BufferStorage<T, D>>,
    // Dropped after `storage` by the last handle.
    _waiter: Arc<BufferWaiter<T, D>>,
}

impl<T: Send + Sync + 'static, const D: usize> Buffer<T, D> {
    fn from_parts(range: [usize; D], data: Vec<T>, read_only: bool) -> Self {
        let storage = Arc::new(BufferStorage {
            base: BufferBase::new(read_only),
            range,
            data: RwLock::new(data),
            final_write_back: Mutex::default(),
            notify_on_drop: Mutex::default(),
        });
        debug!(buffer = storage.base.id, ?range, read_only, "buffer created");
        let waiter = Arc::new(BufferWaiter {
            storage: Arc::downgrade(&storage),
        });
        Self {
            storage,
            _waiter: waiter,
        }
    }
    /// A buffer of `range` filled with `T::default()`.
    pub fn new(range: [usize; D]) -> Self
    where
        T: Default + Clone,
    {
        let len = range.iter().product();
        Self::from_parts(range, vec![T::default(); len], false)
    }
    /// A buffer holding `data`.
    ///
    /// **errors**
    ///
    /// - [`BufferLengthMismatch`](error::BufferLengthMismatch) if `data` does not fill `range`.
    pub fn from_vec(range: [usize; D], data: Vec<T>) -> Result<Self, BufferLengthMismatch> {
        Self::check_len(&range, &data)?;
        Ok(Self::from_parts(range, data, false))
    }
    /// A buffer holding `data` which refuses write access.
    pub fn read_only(range: [usize; D], data: Vec<T>) -> Result<Self, BufferLengthMismatch> {
        Self::check_len(&range, &data)?;
        Ok(Self::from_parts(range, data, true))
    }
    fn check_len(range: &[usize; D], data: &[T]) -> Result<(), BufferLengthMismatch> {
        let expected = range.iter().product();
        if data.len() == expected {
            Ok(())
        } else {
            Err(BufferLengthMismatch {
                expected,
                found: data.len(),
            })
        }
    }
    pub fn id(&self) -> u64 {
        self.storage.base.id
    }
    pub fn range(&self) -> [usize; D] {
        self.storage.range
    }
    /// Number of elements.
    pub fn len(&self) -> usize {
        self.storage.range.iter().product()
    }
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
    pub fn is_read_only(&self) -> bool {
        self.storage.base.read_only
    }
    /** Copies the data into `final_data` on destruction if modified.

    Only a weak reference is kept: nothing is copied if `final_data` is gone
    by then. `None` disables the write back. */
    pub fn set_final_data(&self, final_data: Option<&Arc<Mutex<Vec<T>>>>)
    where
        T: Clone,
    {
        let write_back = final_data.map(|final_data| {
            let final_data = Arc::downgrade(final_data);
            Box::new(move |data: &[T]| {
                if let Some(final_data) = final_data.upgrade() {
                    let mut final_data = final_data.lock();
                    final_data.clear();
                    final_data.extend_from_slice(data);
                }
            }) as FinalWriteBack<T>
        });
        *self.storage.final_write_back.lock() = write_back;
    }
    /// Considers the buffer modified, as a write access would.
    pub fn mark_as_written(&self) {
        self.storage.base.modified.store(true, Ordering::SeqCst);
    }
    /** The generation `task` has to use, appended if needed, with `task`
    registered on it.

    **errors**

    - [`ReadOnlyBuffer`](error::ReadOnlyBuffer) if `wants_write` on a read only buffer.
    - [`TaskAlreadyScheduled`](crate::task::error::TaskAlreadyScheduled)
    */
    pub fn get_or_append_generation(
        &self,
        task: &Task,
        wants_write: bool,
    ) -> Result<Arc<Generation>> {
        let base = &self.storage.base;
        if wants_write {
            base.check_access(Access::global(AccessMode::Write))?;
        }
        let mut chain = base.lock_chain();
        base.register(&mut chain, task, wants_write)
    }
    /// The latest generation, if the buffer was ever used by a task.
    pub fn tail_generation(&self) -> Option<Arc<Generation>> {
        self.storage.base.tail()
    }
    /// Blocks until no task uses the latest generation.
    pub fn wait_for_host_access(&self) {
        self.storage.base.wait_for_host_access();
    }
    /// Waits for the tasks using the buffer and reads the data.
    pub fn host_read(&self) -> RwLockReadGuard<'_, Vec<T>> {
        self.wait_for_host_access();
        self.storage.data.read()
    }
    /// Waits for the tasks using the buffer and writes the data.
    pub fn host_write(&self) -> Result<RwLockWriteGuard<'_, Vec<T>>, ReadOnlyBuffer> {
        self.storage.base.check_access(Access::host(AccessMode::Write))?;
        self.wait_for_host_access();
        Ok(self.storage.data.write())
    }
    /// Copies the data after waiting for the tasks using it.
    pub fn to_vec(&self) -> Vec<T>
    where
        T: Clone,
    {
        self.host_read().clone()
    }
    pub(crate) fn base(&self) -> &Arc<BufferBase> {
        &self.storage.base
    }
    pub(crate) fn accessor(&self, access: Access) -> BufferAccessor<T, D> {
        BufferAccessor {
            storage: self.storage.clone(),
            access,
        }
    }
}

impl<T: Send + Sync + 'static> From<Vec<T>> for Buffer<T> {
    fn from(data: Vec<T>) -> Self {
        let range = [data.len()];
        Self::from_parts(range, data, false)
    }
}

impl<T, const D: usize> Clone for Buffer<T, D> {
    fn clone(&self) -> Self {
        Self {
            storage: self.storage.clone(),
            _waiter: self._waiter.clone(),
        }
    }
}

impl<T, const D: usize> Debug for Buffer<T, D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("id", &self.storage.base.id)
            .field("range", &self.storage.range)
            .field("read_only", &self.storage.base.read_only)
            .finish()
    }
}

/** Access to a buffer from a task.

Created with [`Handler::require()`](crate::queue::Handler::require), moved
into the kernel. */
pub struct BufferAccessor<T, const D: usize = 1> {
    storage: Arc<BufferStorage<T, D>>,
    access: Access,
}

impl<T, const D: usize> BufferAccessor<T, D> {
    pub fn access(&self) -> Access {
        self.access
    }
    pub fn range(&self) -> [usize; D] {
        self.storage.range
    }
    pub fn len(&self) -> usize {
        self.storage.range.iter().product()
    }
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
    pub fn buffer_id(&self) -> u64 {
        self.storage.base.id
    }
    pub fn read(&self) -> RwLockReadGuard<'_, Vec<T>> {
        self.storage.data.read()
    }
    /// **errors**
    ///
    /// - [`ReadOnlyAccessor`](error::ReadOnlyAccessor) if the access mode is [`Read`](crate::access::AccessMode::Read).
    pub fn write(&self) -> Result<RwLockWriteGuard<'_, Vec<T>>, ReadOnlyAccessor> {
        if self.access.is_write_access() {
            Ok(self.storage.data.write())
        } else {
            Err(ReadOnlyAccessor {
                access: self.access,
            })
        }
    }
}

impl<T, const D: usize> Clone for BufferAccessor<T, D> {
    fn clone(&self) -> Self {
        Self {
            storage: self.storage.clone(),
            access: self.access,
        }
    }
}

impl<T, const D: usize> Debug for BufferAccessor<T, D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferAccessor")
            .field("buffer", &self.storage.base.id)
            .field("access", &self.access)
            .finish()
    }
}
