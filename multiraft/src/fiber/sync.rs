//! Wait sources for fibers: single-fire futures, conditions and channels.
//!
//! `FiberCondition` and `FiberChannel` are group-local (`!Send`): all of
//! their users run on the owning dispatcher thread, so they need no
//! locking. `FiberFuture` bridges threads: its `Completer` is `Send`, so
//! the result of blocking I/O or a cross-thread submission can complete a
//! fiber waiting inside a group.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::sync::Arc;
use std::sync::Mutex;
use std::task::Context;
use std::task::Poll;
use std::task::Waker;

use tokio::time::Instant;

use crate::error::RaftError;
use crate::error::RaftResult;

/// Await `fut` with an absolute deadline. On expiry the waiter completes
/// with [`RaftError::Timeout`]; the underlying operation is not cancelled
/// and its eventual result is discarded.
pub async fn with_deadline<F: Future>(deadline: Instant, fut: F) -> RaftResult<F::Output> {
    match tokio::time::timeout_at(deadline, fut).await {
        Ok(v) => Ok(v),
        Err(_) => Err(RaftError::Timeout),
    }
}

struct FutureState<T> {
    value: Option<RaftResult<T>>,
    waker: Option<Waker>,
}

/// A single-fire future.
///
/// Resolves with the value handed to its [`Completer`], or with
/// [`RaftError::Stopped`] if the completer is dropped unfired.
pub struct FiberFuture<T> {
    state: Arc<Mutex<FutureState<T>>>,
}

impl<T> FiberFuture<T> {
    pub fn new() -> (FiberFuture<T>, Completer<T>) {
        let state = Arc::new(Mutex::new(FutureState {
            value: None,
            waker: None,
        }));
        (
            FiberFuture {
                state: state.clone(),
            },
            Completer {
                state,
                fired: false,
            },
        )
    }
}

impl<T> Future for FiberFuture<T> {
    type Output = RaftResult<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        match state.value.take() {
            Some(v) => Poll::Ready(v),
            None => {
                state.waker = Some(cx.waker().clone());
                Poll::Pending
            }
        }
    }
}

/// The producing half of a [`FiberFuture`]. May fire from any thread.
pub struct Completer<T> {
    state: Arc<Mutex<FutureState<T>>>,
    fired: bool,
}

impl<T> Completer<T> {
    pub fn complete(mut self, value: T) {
        self.fire(Ok(value));
    }

    pub fn fail(mut self, err: RaftError) {
        self.fire(Err(err));
    }

    fn fire(&mut self, value: RaftResult<T>) {
        self.fired = true;
        let waker = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            state.value = Some(value);
            state.waker.take()
        };
        if let Some(waker) = waker {
            waker.wake();
        }
    }
}

impl<T> Drop for Completer<T> {
    fn drop(&mut self) {
        if !self.fired {
            self.fire(Err(RaftError::Stopped));
        }
    }
}

#[derive(Default)]
struct CondState {
    generation: u64,
    wakers: Vec<Waker>,
}

/// A multi-waiter signal. Group-local.
#[derive(Clone, Default)]
pub struct FiberCondition {
    state: Rc<RefCell<CondState>>,
}

impl FiberCondition {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wake every fiber currently waiting on this condition.
    pub fn notify_all(&self) {
        let wakers = {
            let mut state = self.state.borrow_mut();
            state.generation = state.generation.wrapping_add(1);
            std::mem::take(&mut state.wakers)
        };
        for waker in wakers {
            waker.wake();
        }
    }

    /// Wait for the next notification after this call.
    pub fn wait(&self) -> CondWait {
        CondWait {
            state: self.state.clone(),
            seen: None,
        }
    }
}

pub struct CondWait {
    state: Rc<RefCell<CondState>>,
    seen: Option<u64>,
}

impl Future for CondWait {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let this = &mut *self;
        let mut state = this.state.borrow_mut();
        match this.seen {
            Some(seen) if state.generation != seen => return Poll::Ready(()),
            None => this.seen = Some(state.generation),
            Some(_) => {}
        }
        if !state.wakers.iter().any(|w| w.will_wake(cx.waker())) {
            state.wakers.push(cx.waker().clone());
        }
        Poll::Pending
    }
}

struct ChannelState<T> {
    queue: VecDeque<T>,
    wakers: Vec<Waker>,
    closed: bool,
}

/// An unbounded in-group message queue. Group-local.
pub struct FiberChannel<T> {
    state: Rc<RefCell<ChannelState<T>>>,
}

impl<T> Clone for FiberChannel<T> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
        }
    }
}

impl<T> Default for FiberChannel<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> FiberChannel<T> {
    pub fn new() -> Self {
        Self {
            state: Rc::new(RefCell::new(ChannelState {
                queue: VecDeque::new(),
                wakers: Vec::new(),
                closed: false,
            })),
        }
    }

    /// Enqueue a message. Messages sent after `close` are dropped.
    pub fn send(&self, value: T) {
        let wakers = {
            let mut state = self.state.borrow_mut();
            if state.closed {
                return;
            }
            state.queue.push_back(value);
            std::mem::take(&mut state.wakers)
        };
        for waker in wakers {
            waker.wake();
        }
    }

    pub fn try_recv(&self) -> Option<T> {
        self.state.borrow_mut().queue.pop_front()
    }

    /// Receive the next message, or `Err(Stopped)` once the channel is
    /// closed and drained.
    pub fn recv(&self) -> ChannelRecv<T> {
        ChannelRecv {
            state: self.state.clone(),
        }
    }

    pub fn close(&self) {
        let wakers = {
            let mut state = self.state.borrow_mut();
            state.closed = true;
            std::mem::take(&mut state.wakers)
        };
        for waker in wakers {
            waker.wake();
        }
    }

    pub fn is_empty(&self) -> bool {
        self.state.borrow().queue.is_empty()
    }
}

pub struct ChannelRecv<T> {
    state: Rc<RefCell<ChannelState<T>>>,
}

impl<T> Future for ChannelRecv<T> {
    type Output = RaftResult<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut state = self.state.borrow_mut();
        if let Some(v) = state.queue.pop_front() {
            return Poll::Ready(Ok(v));
        }
        if state.closed {
            return Poll::Ready(Err(RaftError::Stopped));
        }
        if !state.wakers.iter().any(|w| w.will_wake(cx.waker())) {
            state.wakers.push(cx.waker().clone());
        }
        Poll::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn future_completes_with_value() {
        let (fut, completer) = FiberFuture::new();
        completer.complete(7u32);
        assert_eq!(fut.await.unwrap(), 7);
    }

    #[tokio::test]
    async fn dropped_completer_resolves_stopped() {
        let (fut, completer) = FiberFuture::<u32>::new();
        drop(completer);
        assert!(matches!(fut.await, Err(RaftError::Stopped)));
    }

    #[tokio::test]
    async fn future_completes_across_threads() {
        let (fut, completer) = FiberFuture::new();
        std::thread::spawn(move || completer.complete(41u64));
        assert_eq!(fut.await.unwrap(), 41);
    }

    #[tokio::test]
    async fn deadline_elapses_with_timeout() {
        let (fut, _completer) = FiberFuture::<u32>::new();
        let res = with_deadline(Instant::now() + Duration::from_millis(10), fut).await;
        assert!(matches!(res, Err(RaftError::Timeout)));
    }

    #[tokio::test]
    async fn condition_wakes_all_waiters() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let cond = FiberCondition::new();
                let c1 = cond.clone();
                let c2 = cond.clone();
                let h1 = tokio::task::spawn_local(async move { c1.wait().await });
                let h2 = tokio::task::spawn_local(async move { c2.wait().await });
                tokio::task::yield_now().await;
                cond.notify_all();
                h1.await.unwrap();
                h2.await.unwrap();
            })
            .await;
    }

    #[tokio::test]
    async fn channel_delivers_in_order() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let ch = FiberChannel::new();
                ch.send(1);
                ch.send(2);
                assert_eq!(ch.recv().await.unwrap(), 1);
                assert_eq!(ch.recv().await.unwrap(), 2);
                ch.close();
                assert!(matches!(ch.recv().await, Err(RaftError::Stopped)));
            })
            .await;
    }
}
