use core::{
    future::Future,
    pin::Pin,
    task::{Context, Poll, Waker},
};
use parking_lot::Mutex;
use std::sync::Arc;

pub trait BlockableFuture: Future {
    fn block(self) -> Self::Output;
}

impl<T> BlockableFuture for T
where
    T: Future,
{
    fn block(self) -> Self::Output {
        blocker::block(self)
    }
}

#[derive(Default, Debug)]
struct NotifyState {
    done: bool,
    waker: Option<Waker>,
}

/// Creates a one shot notification.
pub fn notifier() -> (Notifier, NotifyFuture) {
    let state = Arc::new(Mutex::new(NotifyState::default()));
    (
        Notifier {
            state: state.clone(),
        },
        NotifyFuture { state },
    )
}

/** Sending side of [`notifier()`].

Dropping the notifier also completes the future, so a waiter never outlives
a notifier that went away. */
#[derive(Debug)]
pub struct Notifier {
    state: Arc<Mutex<NotifyState>>,
}

impl Notifier {
    pub fn notify(self) {
        drop(self);
    }
}

impl Drop for Notifier {
    fn drop(&mut self) {
        let waker = {
            let mut state = self.state.lock();
            state.done = true;
            state.waker.take()
        };
        if let Some(waker) = waker {
            waker.wake();
        }
    }
}

/// Completes once the matching [`Notifier`] notified or was dropped.
#[derive(Debug)]
pub struct NotifyFuture {
    state: Arc<Mutex<NotifyState>>,
}

impl NotifyFuture {
    pub fn is_done(&self) -> bool {
        self.state.lock().done
    }
}

impl Future for NotifyFuture {
    type Output = ();
    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let mut state = self.state.lock();
        if state.done {
            Poll::Ready(())
        } else {
            state.waker.replace(cx.waker().clone());
            Poll::Pending
        }
    }
}
