//! Cooperative cancellation for a thread-per-core worker: one
//! [`Canceller`] owned by whoever decides to shut down, any number of
//! cheap [`Waiter`] handles held by the controller loop and in-flight
//! request tasks. Waiters can be polled as futures (resolve on cancel)
//! or checked synchronously between suspension points.

use std::cell::RefCell;
use std::future::Future;
use std::pin::Pin;
use std::rc::{Rc, Weak};
use std::task::{Context, Poll, Waker};

#[derive(Default)]
struct Shared {
    cancelled: bool,
    // Slab of parked wakers; `free` recycles vacated slots so long-lived
    // connection churn doesn't grow the vec unboundedly.
    wakers: Vec<Option<Waker>>,
    free: Vec<usize>,
}

impl Shared {
    fn park(&mut self, waker: Waker) -> usize {
        match self.free.pop() {
            Some(slot) => {
                self.wakers[slot] = Some(waker);
                slot
            }
            None => {
                self.wakers.push(Some(waker));
                self.wakers.len() - 1
            }
        }
    }

    fn vacate(&mut self, slot: usize) {
        if let Some(waker) = self.wakers.get_mut(slot) {
            if waker.take().is_some() {
                self.free.push(slot);
            }
        }
    }
}

/// The owning side: call [`Canceller::cancel`] once to wake every
/// waiter, now and in the future.
#[derive(Clone, Default)]
pub struct Canceller {
    shared: Rc<RefCell<Shared>>,
}

impl Canceller {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn waiter(&self) -> Waiter {
        Waiter { slot: None, shared: Rc::downgrade(&self.shared) }
    }

    pub fn cancel(&self) {
        let mut shared = self.shared.borrow_mut();
        if shared.cancelled {
            return;
        }
        shared.cancelled = true;
        let parked = std::mem::take(&mut shared.wakers);
        drop(shared);
        for waker in parked.into_iter().flatten() {
            waker.wake();
        }
    }
}

/// A handle observing one [`Canceller`]. Completes as a future once
/// cancelled; also reports cancellation synchronously via
/// [`Waiter::cancelled`]. A waiter whose canceller has been dropped
/// reads as cancelled.
pub struct Waiter {
    slot: Option<usize>,
    shared: Weak<RefCell<Shared>>,
}

impl Clone for Waiter {
    fn clone(&self) -> Self {
        // Each clone parks its own waker slot.
        Self { slot: None, shared: self.shared.clone() }
    }
}

impl Waiter {
    pub fn cancelled(&self) -> bool {
        match self.shared.upgrade() {
            Some(shared) => shared.borrow().cancelled,
            None => true,
        }
    }
}

impl Future for Waiter {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let this = self.get_mut();
        let Some(shared) = this.shared.upgrade() else {
            return Poll::Ready(());
        };
        let mut shared = shared.borrow_mut();
        if shared.cancelled {
            return Poll::Ready(());
        }
        match this.slot {
            Some(slot) => shared.wakers[slot] = Some(cx.waker().clone()),
            None => this.slot = Some(shared.park(cx.waker().clone())),
        }
        Poll::Pending
    }
}

impl Drop for Waiter {
    fn drop(&mut self) {
        if let (Some(slot), Some(shared)) = (self.slot, self.shared.upgrade()) {
            shared.borrow_mut().vacate(slot);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn waiter_reads_cancelled_after_cancel() {
        let canceller = Canceller::new();
        let waiter = canceller.waiter();
        assert!(!waiter.cancelled());
        canceller.cancel();
        assert!(waiter.cancelled());
    }

    #[test]
    fn waiter_of_dropped_canceller_reads_cancelled() {
        let canceller = Canceller::new();
        let waiter = canceller.waiter();
        drop(canceller);
        assert!(waiter.cancelled());
    }

    #[monoio::test]
    async fn pending_waiter_wakes_on_cancel() {
        let canceller = Canceller::new();
        let waiter = canceller.waiter();
        let joined = monoio::spawn(waiter);
        canceller.cancel();
        joined.await;
    }
}
