use crate::task::TaskId;
use parking_lot::{Condvar, Mutex};
use std::{
    fmt::{self, Debug},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};
use tracing::{debug, trace};

static NEXT_GENERATION_ID: AtomicU64 = AtomicU64::new(0);

#[derive(Default)]
struct State {
    ready: bool,
    users: usize,
    next: Option<Arc<Generation>>,
}

impl State {
    fn is_released(&self) -> bool {
        self.ready && self.users == 0
    }
}

/** One version of a buffer.

Every write-capable access produces a new generation, think SSA. A
generation is ready once the previous one has been released by all of its
users, and released once all of its own users are done with it.

Readiness and release are two separate wait domains: tasks wait for
readiness before running, the host waits for release before reading back.

The users, the ready flag and the link to the next generation share one
lock. The next generation is picked while that lock is held, so a user
registering on a released generation is always seen by a later link.

Waits have no deadline unless one of the `_timeout` variants is used. A
producer that never releases blocks every consumer of the following
generations forever.
*/
pub struct Generation {
    id: u64,
    buffer_id: u64,
    write_access: AtomicBool,
    state: Mutex<State>,
    ready_cv: Condvar,
    released_cv: Condvar,
}

impl Generation {
    /// Creates a generation of buffer `buffer_id` which is not ready yet.
    pub fn new(buffer_id: u64, is_write_access: bool) -> Arc<Self> {
        let generation = Arc::new(Self {
            id: NEXT_GENERATION_ID.fetch_add(1, Ordering::Relaxed),
            buffer_id,
            write_access: AtomicBool::new(is_write_access),
            state: Mutex::default(),
            ready_cv: Condvar::new(),
            released_cv: Condvar::new(),
        });
        debug!(
            generation = generation.id,
            buffer = buffer_id,
            is_write_access,
            "generation created"
        );
        generation
    }
    pub fn id(&self) -> u64 {
        self.id
    }
    /// The buffer this is a version of.
    pub fn buffer_id(&self) -> u64 {
        self.buffer_id
    }
    /// Whether any registered user may write.
    pub fn is_write_access(&self) -> bool {
        self.write_access.load(Ordering::SeqCst)
    }
    /// Number of users which have not released yet.
    pub fn users(&self) -> usize {
        self.state.lock().users
    }
    pub fn is_ready(&self) -> bool {
        self.state.lock().ready
    }
    /// Ready and not used anymore.
    pub fn is_released(&self) -> bool {
        self.state.lock().is_released()
    }
    /// The following generation, if any.
    pub fn next_generation(&self) -> Option<Arc<Generation>> {
        self.state.lock().next.clone()
    }
    /** Adds a user.

    The write intent is accumulated over all users, so a generation shared by
    a reader and a later writer is a write generation. */
    pub fn register_consumer(&self, task: TaskId, is_write_access: bool) {
        self.write_access.fetch_or(is_write_access, Ordering::SeqCst);
        let mut state = self.state.lock();
        state.users += 1;
        trace!(
            generation = self.id,
            buffer = self.buffer_id,
            %task,
            is_write_access,
            users = state.users,
            "consumer registered"
        );
    }
    /// Blocks until the generation is ready.
    pub fn wait_ready(&self) {
        let mut state = self.state.lock();
        while !state.ready {
            self.ready_cv.wait(&mut state);
        }
    }
    /// Like [`.wait_ready()`](Self::wait_ready) with a `timeout`, returns whether ready.
    pub fn wait_ready_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while !state.ready {
            if self.ready_cv.wait_until(&mut state, deadline).timed_out() {
                return state.ready;
            }
        }
        true
    }
    /** Marks the generation as ready, waking up the waiting users.

    Only the first call has an effect. */
    pub fn mark_ready(&self) {
        cascade(self.make_ready());
    }
    /// Sets the ready flag, returns the next generation if this one is released by it.
    fn make_ready(&self) -> Option<Arc<Generation>> {
        let mut state = self.state.lock();
        if state.ready {
            return None;
        }
        state.ready = true;
        debug!(generation = self.id, buffer = self.buffer_id, "generation ready");
        self.ready_cv.notify_all();
        // Nobody used it, so it is released as soon as it is ready.
        if state.users == 0 {
            self.on_released(&state)
        } else {
            None
        }
    }
    /** Releases one user.

    The last user of a ready generation notifies the host waiters and then
    makes the next generation ready.

    **panics**

    If there are more releases than registrations. */
    pub fn release(&self) {
        let next = {
            let mut state = self.state.lock();
            state.users = match state.users.checked_sub(1) {
                Some(users) => users,
                None => panic!(
                    "Generation {} of buffer {} released more often than used!",
                    self.id, self.buffer_id
                ),
            };
            trace!(
                generation = self.id,
                buffer = self.buffer_id,
                users = state.users,
                "consumer released"
            );
            if !state.is_released() {
                return;
            }
            self.on_released(&state)
        };
        debug!(generation = self.id, buffer = self.buffer_id, "generation released");
        cascade(next);
    }
    /// Wakes up the host waiters, with the state locked.
    fn on_released(&self, state: &State) -> Option<Arc<Generation>> {
        self.released_cv.notify_all();
        state.next.clone()
    }
    /// Blocks until all users have released a ready generation.
    pub fn wait_released(&self) {
        let mut state = self.state.lock();
        while !state.is_released() {
            self.released_cv.wait(&mut state);
        }
    }
    /// Like [`.wait_released()`](Self::wait_released) with a `timeout`, returns whether released.
    pub fn wait_released_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while !state.is_released() {
            if self
                .released_cv
                .wait_until(&mut state, deadline)
                .timed_out()
            {
                return state.is_released();
            }
        }
        true
    }
    /** Links the following generation.

    If this generation is already released, the next one is ready
    immediately. */
    pub fn set_next_generation(&self, next: Arc<Generation>) {
        let released = {
            let mut state = self.state.lock();
            state.next = Some(next.clone());
            state.is_released()
        };
        if released {
            next.mark_ready();
        }
    }
}

/// Makes generations ready along the chain while they are released by it.
fn cascade(mut next: Option<Arc<Generation>>) {
    while let Some(generation) = next {
        next = generation.make_ready();
    }
}

impl Debug for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Generation")
            .field("id", &self.id)
            .field("buffer_id", &self.buffer_id)
            .field("write_access", &self.is_write_access())
            .field("ready", &state.ready)
            .field("users", &state.users)
            .finish()
    }
}
