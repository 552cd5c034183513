use super::PipeInner;
use std::{
    fmt::{self, Debug},
    sync::Arc,
};

/** Elements reserved for reading.

Committed by [`.commit()`](Self::commit) or on drop. */
pub struct ReadReservation<T> {
    pipe: Arc<PipeInner<T>>,
    id: u64,
    start: u64,
    len: usize,
}

impl<T> ReadReservation<T> {
    pub(super) fn new(pipe: Arc<PipeInner<T>>, id: u64, start: u64, len: usize) -> Self {
        Self {
            pipe,
            id,
            start,
            len,
        }
    }
    pub fn len(&self) -> usize {
        self.len
    }
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
    /// The element at `index`.
    ///
    /// **panics**
    ///
    /// If `index` is out of bounds.
    pub fn get(&self, index: usize) -> T
    where
        T: Clone,
    {
        assert!(index < self.len, "index {index} out of bounds 0..{}", self.len);
        self.pipe
            .with_element(self.start + index as u64, |value| value.clone())
    }
    pub fn to_vec(&self) -> Vec<T>
    where
        T: Clone,
    {
        (0..self.len).map(|index| self.get(index)).collect()
    }
    /// Releases the elements, once the previous read reservations are committed too.
    pub fn commit(self) {}
}

impl<T> Drop for ReadReservation<T> {
    fn drop(&mut self) {
        self.pipe.commit_read(self.id);
    }
}

impl<T> Debug for ReadReservation<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadReservation")
            .field("id", &self.id)
            .field("len", &self.len)
            .finish()
    }
}

/** Slots reserved for writing.

Committed by [`.commit()`](Self::commit) or on drop. Slots which are not set
hold `T::default()`. */
pub struct WriteReservation<T> {
    pipe: Arc<PipeInner<T>>,
    id: u64,
    start: u64,
    len: usize,
}

impl<T> WriteReservation<T> {
    pub(super) fn new(pipe: Arc<PipeInner<T>>, id: u64, start: u64, len: usize) -> Self {
        Self {
            pipe,
            id,
            start,
            len,
        }
    }
    pub fn len(&self) -> usize {
        self.len
    }
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
    /// Sets the element at `index`.
    ///
    /// **panics**
    ///
    /// If `index` is out of bounds.
    pub fn set(&mut self, index: usize, value: T) {
        assert!(index < self.len, "index {index} out of bounds 0..{}", self.len);
        self.pipe
            .with_element(self.start + index as u64, |slot| *slot = value);
    }
    /// Makes the elements visible, once the previous write reservations are committed too.
    pub fn commit(self) {}
}

impl<T> Drop for WriteReservation<T> {
    fn drop(&mut self) {
        self.pipe.commit_write(self.id);
    }
}

impl<T> Debug for WriteReservation<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriteReservation")
            .field("id", &self.id)
            .field("len", &self.len)
            .finish()
    }
}
