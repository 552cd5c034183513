/*!
Pipes.

A [`Pipe`] is a bounded FIFO between one writer and one reader, usually two
tasks running concurrently. Operations are blocking or not depending on the
[target](AccessTarget) the accessor was created with.

```
# use syclrt::{access::AccessTarget, pipe::Pipe};
# fn main() -> syclrt::result::Result<()> {
let pipe = Pipe::new(2);
let writer = pipe.writer(AccessTarget::Pipe)?;
assert!(writer.write(1));
assert!(writer.write(2));
assert!(!writer.write(3));
let reader = pipe.reader(AccessTarget::BlockingPipe)?;
assert_eq!(reader.read(), Some(1));
assert_eq!(reader.read(), Some(2));
assert!(pipe.writer(AccessTarget::Pipe).is_err());
# Ok(())
# }
```

# Reservations
A reservation claims a contiguous run of elements, to be read or written in
any order and committed at once. Elements of a write reservation are not
visible to the reader until it is committed, elements of a read reservation
stay in the pipe until it is committed. Reservations are committed on drop,
and released in the order they were made.
*/

use crate::{
    access::{Access, AccessMode, AccessTarget},
    result::Result,
};
use anyhow::bail;
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::{
    collections::VecDeque,
    fmt::{self, Debug},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use tracing::trace;

mod reservation;
pub use reservation::{ReadReservation, WriteReservation};

/// Errors.
pub mod error {
    use super::*;

    /// Only one reader and one writer can use a pipe at a time.
    #[derive(Clone, Copy, Debug, thiserror::Error)]
    #[error("The pipe is already used for {}!", usage(.mode))]
    pub struct PipeAlreadyUsed {
        pub(super) mode: AccessMode,
    }

    fn usage(mode: &AccessMode) -> &'static str {
        match mode {
            AccessMode::Read => "reading",
            _ => "writing",
        }
    }
}
use error::*;

#[derive(Debug)]
struct Reservation {
    id: u64,
    /// Position of the first element, counted from the first element ever written.
    start: u64,
    ready: bool,
}

struct PipeState<T> {
    cb: VecDeque<T>,
    /// Position of `cb[0]`.
    head: u64,
    /// Elements at the front kept for read reservations, or read past them.
    read_reserved_frozen: usize,
    read_reservations: VecDeque<Reservation>,
    write_reservations: VecDeque<Reservation>,
    next_reservation: u64,
}

impl<T> PipeState<T> {
    fn reserved_for_writing(&self) -> usize {
        match self.write_reservations.front() {
            Some(reservation) => (self.head + self.cb.len() as u64 - reservation.start) as usize,
            None => 0,
        }
    }
    /// Elements available to the reader.
    fn size(&self) -> usize {
        self.cb
            .len()
            .saturating_sub(self.read_reserved_frozen + self.reserved_for_writing())
    }
    fn is_empty(&self) -> bool {
        self.size() == 0
    }
    fn index(&self, position: u64) -> usize {
        (position - self.head) as usize
    }
    fn pop_front(&mut self, n: usize) {
        self.cb.drain(..n);
        self.head += n as u64;
    }
}

pub(crate) struct PipeInner<T> {
    capacity: usize,
    state: Mutex<PipeState<T>>,
    read_done: Condvar,
    write_done: Condvar,
    used_for_reading: AtomicBool,
    used_for_writing: AtomicBool,
}

impl<T> PipeInner<T> {
    fn lock(&self) -> MutexGuard<'_, PipeState<T>> {
        self.state.lock()
    }
    fn is_full(state: &PipeState<T>, capacity: usize) -> bool {
        state.cb.len() >= capacity
    }
    fn write(&self, value: T, blocking: bool) -> bool {
        let mut state = self.lock();
        if blocking {
            while Self::is_full(&state, self.capacity) {
                self.read_done.wait(&mut state);
            }
        } else if Self::is_full(&state, self.capacity) {
            trace!(capacity = self.capacity, "pipe full");
            return false;
        }
        state.cb.push_back(value);
        trace!(len = state.cb.len(), "pipe write");
        drop(state);
        self.write_done.notify_all();
        true
    }
    fn read(&self, blocking: bool) -> Option<T>
    where
        T: Clone,
    {
        let mut state = self.lock();
        if blocking {
            while state.is_empty() {
                self.write_done.wait(&mut state);
            }
        } else if state.is_empty() {
            return None;
        }
        let value = if state.read_reserved_frozen > 0 {
            // Read past the pending read reservations.
            let index = state.read_reserved_frozen;
            state.read_reserved_frozen += 1;
            state.cb[index].clone()
        } else {
            let value = state.cb.pop_front()?;
            state.head += 1;
            value
        };
        trace!(len = state.cb.len(), frozen = state.read_reserved_frozen, "pipe read");
        drop(state);
        self.read_done.notify_all();
        Some(value)
    }
    fn reserve_read(&self, len: usize, blocking: bool) -> Option<(u64, u64)> {
        // Never satisfiable, even by a blocking reservation.
        if len == 0 || len > self.capacity {
            return None;
        }
        let mut state = self.lock();
        if blocking {
            while len > state.size() {
                self.write_done.wait(&mut state);
            }
        } else if len > state.size() {
            return None;
        }
        let start = state.head + state.read_reserved_frozen as u64;
        state.read_reserved_frozen += len;
        let id = state.next_reservation;
        state.next_reservation += 1;
        state.read_reservations.push_back(Reservation {
            id,
            start,
            ready: false,
        });
        trace!(id, start, len, "read reservation");
        Some((id, start))
    }
    fn reserve_write(&self, len: usize, blocking: bool) -> Option<(u64, u64)>
    where
        T: Default,
    {
        // Never satisfiable, even by a blocking reservation.
        if len == 0 || len > self.capacity {
            return None;
        }
        let mut state = self.lock();
        if blocking {
            while state.cb.len() + len > self.capacity {
                self.read_done.wait(&mut state);
            }
        } else if state.cb.len() + len > self.capacity {
            return None;
        }
        state.cb.extend(std::iter::repeat_with(T::default).take(len));
        let start = state.head + (state.cb.len() - len) as u64;
        let id = state.next_reservation;
        state.next_reservation += 1;
        state.write_reservations.push_back(Reservation {
            id,
            start,
            ready: false,
        });
        trace!(id, start, len, "write reservation");
        Some((id, start))
    }
    fn with_element<R>(&self, position: u64, f: impl FnOnce(&mut T) -> R) -> R {
        let mut state = self.lock();
        let index = state.index(position);
        f(&mut state.cb[index])
    }
    fn commit_read(&self, id: u64) {
        let mut state = self.lock();
        if let Some(reservation) = state.read_reservations.iter_mut().find(|r| r.id == id) {
            reservation.ready = true;
        }
        let mut released = false;
        while state.read_reservations.front().map_or(false, |r| r.ready) {
            state.read_reservations.pop_front();
            let n = match state.read_reservations.front() {
                Some(next) => state.index(next.start),
                None => state.read_reserved_frozen,
            };
            state.read_reserved_frozen -= n;
            state.pop_front(n);
            released = true;
        }
        trace!(id, released, "read reservation committed");
        drop(state);
        if released {
            self.read_done.notify_all();
        }
    }
    fn commit_write(&self, id: u64) {
        let mut state = self.lock();
        if let Some(reservation) = state.write_reservations.iter_mut().find(|r| r.id == id) {
            reservation.ready = true;
        }
        let mut released = false;
        while state.write_reservations.front().map_or(false, |r| r.ready) {
            state.write_reservations.pop_front();
            released = true;
        }
        trace!(id, released, "write reservation committed");
        drop(state);
        if released {
            self.write_done.notify_all();
        }
    }
}

/** A bounded FIFO.

Pipes can be cloned, which is equivalent to [`Arc::clone()`]. */
pub struct Pipe<T> {
    inner: Arc<PipeInner<T>>,
}

impl<T: Send> Pipe<T> {
    /// A pipe holding at most `capacity` elements.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(PipeInner {
                capacity,
                state: Mutex::new(PipeState {
                    cb: VecDeque::with_capacity(capacity),
                    head: 0,
                    read_reserved_frozen: 0,
                    read_reservations: VecDeque::new(),
                    write_reservations: VecDeque::new(),
                    next_reservation: 0,
                }),
                read_done: Condvar::new(),
                write_done: Condvar::new(),
                used_for_reading: AtomicBool::new(false),
                used_for_writing: AtomicBool::new(false),
            }),
        }
    }
    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }
    /** Number of elements which can be read.

    Elements reserved and not committed do not count. The value may be stale
    as soon as it is returned. */
    pub fn size(&self) -> usize {
        self.inner.lock().size()
    }
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
    /// No room left for a write, including reserved slots.
    pub fn is_full(&self) -> bool {
        PipeInner::is_full(&self.inner.lock(), self.inner.capacity)
    }
    /// Writes `value`, returns false if the pipe is full and not `blocking`.
    pub fn write(&self, value: T, blocking: bool) -> bool {
        self.inner.write(value, blocking)
    }
    /// Reads a value, returns None if the pipe is empty and not `blocking`.
    pub fn read(&self, blocking: bool) -> Option<T>
    where
        T: Clone,
    {
        self.inner.read(blocking)
    }
    fn claim(&self, mode: AccessMode, target: AccessTarget) -> Result<bool> {
        let access = Access::new(mode, target)?;
        if !target.is_pipe() {
            bail!("{access} can not be used on a pipe!");
        }
        let used = match mode {
            AccessMode::Read => &self.inner.used_for_reading,
            _ => &self.inner.used_for_writing,
        };
        if used
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(PipeAlreadyUsed { mode }.into());
        }
        Ok(target.is_blocking())
    }
    /** The reading side.

    **errors**

    - `target` is not a pipe target.
    - [`PipeAlreadyUsed`](error::PipeAlreadyUsed) while another reader is alive.
    */
    pub fn reader(&self, target: AccessTarget) -> Result<PipeReader<T>> {
        let blocking = self.claim(AccessMode::Read, target)?;
        Ok(PipeReader {
            pipe: self.clone(),
            blocking,
        })
    }
    /// The writing side, see [`.reader()`](Self::reader).
    pub fn writer(&self, target: AccessTarget) -> Result<PipeWriter<T>> {
        let blocking = self.claim(AccessMode::Write, target)?;
        Ok(PipeWriter {
            pipe: self.clone(),
            blocking,
        })
    }
}

impl<T> Clone for Pipe<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Debug for Pipe<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.lock();
        f.debug_struct("Pipe")
            .field("capacity", &self.inner.capacity)
            .field("len", &state.cb.len())
            .field("size", &state.size())
            .finish()
    }
}

/// The reading side of a [`Pipe`].
#[derive(Debug, derive_more::Deref)]
pub struct PipeReader<T> {
    #[deref]
    pipe: Pipe<T>,
    blocking: bool,
}

impl<T: Send> PipeReader<T> {
    pub fn is_blocking(&self) -> bool {
        self.blocking
    }
    /// Reads a value, None if empty and not blocking.
    pub fn read(&self) -> Option<T>
    where
        T: Clone,
    {
        self.pipe.inner.read(self.blocking)
    }
    /** Reserves `len` elements to read.

    None if `len` is 0 or greater than the capacity, or if not enough
    elements are available and the reader is not blocking. */
    pub fn reserve(&self, len: usize) -> Option<ReadReservation<T>> {
        let (id, start) = self.pipe.inner.reserve_read(len, self.blocking)?;
        Some(ReadReservation::new(self.pipe.inner.clone(), id, start, len))
    }
}

impl<T> Drop for PipeReader<T> {
    fn drop(&mut self) {
        self.pipe.inner.used_for_reading.store(false, Ordering::SeqCst);
    }
}

/// The writing side of a [`Pipe`].
#[derive(Debug, derive_more::Deref)]
pub struct PipeWriter<T> {
    #[deref]
    pipe: Pipe<T>,
    blocking: bool,
}

impl<T: Send> PipeWriter<T> {
    pub fn is_blocking(&self) -> bool {
        self.blocking
    }
    /// Writes `value`, false if full and not blocking.
    pub fn write(&self, value: T) -> bool {
        self.pipe.inner.write(value, self.blocking)
    }
    /** Reserves `len` slots to write.

    None if `len` is 0 or greater than the capacity, or if there is not
    enough room and the writer is not blocking. */
    pub fn reserve(&self, len: usize) -> Option<WriteReservation<T>>
    where
        T: Default,
    {
        let (id, start) = self.pipe.inner.reserve_write(len, self.blocking)?;
        Some(WriteReservation::new(self.pipe.inner.clone(), id, start, len))
    }
}

impl<T> Drop for PipeWriter<T> {
    fn drop(&mut self) {
        self.pipe.inner.used_for_writing.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::thread;

    #[test]
    fn non_blocking_write_on_full_pipe() {
        let pipe = Pipe::new(2);
        assert_eq!(
            [1, 2, 3].map(|x| pipe.write(x, false)),
            [true, true, false]
        );
        assert!(pipe.is_full());
        assert_eq!(pipe.read(true), Some(1));
        assert_eq!(pipe.read(true), Some(2));
        assert_eq!(pipe.read(false), None);
    }

    #[test]
    fn blocking_reader_waits_for_writer() -> Result<()> {
        let pipe = Pipe::new(1);
        let reader = pipe.reader(AccessTarget::BlockingPipe)?;
        let writer = pipe.writer(AccessTarget::BlockingPipe)?;
        let producer = thread::spawn(move || {
            for x in 0..100 {
                writer.write(x);
            }
        });
        let values: Vec<_> = (0..100).filter_map(|_| reader.read()).collect();
        producer.join().unwrap();
        assert_eq!(values, (0..100).collect::<Vec<_>>());
        Ok(())
    }

    #[test]
    fn second_reader_is_refused_until_drop() -> Result<()> {
        let pipe = Pipe::<u8>::new(1);
        let reader = pipe.reader(AccessTarget::Pipe)?;
        let e = pipe.reader(AccessTarget::Pipe).unwrap_err();
        assert_eq!(e.to_string(), "The pipe is already used for reading!");
        assert!(e.downcast_ref::<PipeAlreadyUsed>().is_some());
        let _writer = pipe.writer(AccessTarget::Pipe)?;
        drop(reader);
        pipe.reader(AccessTarget::BlockingPipe)?;
        Ok(())
    }

    #[test]
    fn non_pipe_target_is_refused() {
        let pipe = Pipe::<u8>::new(1);
        assert!(pipe.reader(AccessTarget::GlobalBuffer).is_err());
        assert!(pipe.writer(AccessTarget::HostBuffer).is_err());
    }

    #[test]
    fn write_reservation_is_hidden_until_commit() -> Result<()> {
        let pipe = Pipe::new(4);
        let writer = pipe.writer(AccessTarget::Pipe)?;
        let reader = pipe.reader(AccessTarget::Pipe)?;
        let mut reservation = writer.reserve(2).unwrap();
        assert!(writer.write(3));
        assert!(pipe.is_empty());
        assert_eq!(reader.read(), None);
        reservation.set(1, 2);
        reservation.set(0, 1);
        reservation.commit();
        assert_eq!(pipe.size(), 3);
        assert_eq!((0..3).filter_map(|_| reader.read()).collect::<Vec<_>>(), [1, 2, 3]);
        Ok(())
    }

    #[test]
    fn read_reservation_keeps_elements_until_commit() -> Result<()> {
        let pipe = Pipe::new(3);
        for x in [1, 2, 3] {
            assert!(pipe.write(x, false));
        }
        let reader = pipe.reader(AccessTarget::Pipe)?;
        let reservation = reader.reserve(2).unwrap();
        assert_eq!(reservation.to_vec(), [1, 2]);
        assert_eq!(reader.read(), Some(3));
        assert!(pipe.is_full());
        assert!(pipe.is_empty());
        drop(reservation);
        assert_eq!(pipe.size(), 0);
        assert!(!pipe.is_full());
        assert!(pipe.write(4, false));
        assert_eq!(reader.read(), Some(4));
        Ok(())
    }

    #[test]
    fn read_reservations_release_in_order() -> Result<()> {
        let pipe = Pipe::new(4);
        for x in 0..4 {
            pipe.write(x, false);
        }
        let reader = pipe.reader(AccessTarget::Pipe)?;
        let first = reader.reserve(1).unwrap();
        let second = reader.reserve(2).unwrap();
        assert_eq!(second.get(1), 2);
        second.commit();
        assert!(pipe.is_full());
        first.commit();
        assert_eq!(pipe.size(), 1);
        assert_eq!(reader.read(), Some(3));
        Ok(())
    }

    #[test]
    fn empty_reservation_is_refused() -> Result<()> {
        let pipe = Pipe::<u8>::new(2);
        assert!(pipe.writer(AccessTarget::Pipe)?.reserve(0).is_none());
        assert!(pipe.writer(AccessTarget::Pipe)?.reserve(3).is_none());
        Ok(())
    }

    #[test]
    fn blocking_reservation_over_capacity_is_refused() -> Result<()> {
        let pipe = Pipe::<u8>::new(2);
        assert!(pipe.writer(AccessTarget::BlockingPipe)?.reserve(3).is_none());
        assert!(pipe.reader(AccessTarget::BlockingPipe)?.reserve(3).is_none());
        let writer = pipe.writer(AccessTarget::BlockingPipe)?;
        assert_eq!(writer.reserve(2).map(|r| r.len()), Some(2));
        Ok(())
    }

    #[derive(Clone, Copy, Debug)]
    enum Op {
        Write,
        Read,
        ReserveWrite(usize),
        ReserveRead(usize),
        CommitWrite,
        CommitRead,
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            Just(Op::Write),
            Just(Op::Read),
            (0usize..4).prop_map(Op::ReserveWrite),
            (0usize..4).prop_map(Op::ReserveRead),
            Just(Op::CommitWrite),
            Just(Op::CommitRead),
        ]
    }

    proptest! {
        #[test]
        fn occupancy_stays_within_capacity(capacity in 1usize..6, ops in prop::collection::vec(op(), 0..64)) {
            let pipe = Pipe::new(capacity);
            let writer = pipe.writer(AccessTarget::Pipe).unwrap();
            let reader = pipe.reader(AccessTarget::Pipe).unwrap();
            let mut writes = VecDeque::new();
            let mut reads = VecDeque::new();
            for op in ops {
                match op {
                    Op::Write => {
                        writer.write(1u32);
                    }
                    Op::Read => {
                        reader.read();
                    }
                    Op::ReserveWrite(n) => writes.extend(writer.reserve(n)),
                    Op::ReserveRead(n) => reads.extend(reader.reserve(n)),
                    Op::CommitWrite => {
                        writes.pop_front();
                    }
                    Op::CommitRead => {
                        reads.pop_front();
                    }
                }
                let occupied = pipe.inner.lock().cb.len();
                prop_assert!(occupied <= capacity);
                prop_assert!(pipe.size() <= occupied);
                prop_assert_eq!(pipe.is_full(), occupied == capacity);
                prop_assert_eq!(pipe.is_empty(), pipe.size() == 0);
            }
        }
    }
}
