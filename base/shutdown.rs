// This file is part of lightnvr, a lightweight network video recorder.
// Copyright (C) 2026 The lightnvr Authors.
// SPDX-License-Identifier: GPL-3.0-or-later

//! Tools for propagating a graceful shutdown signal through the program.
//!
//! Two layers:
//!
//! 1. A shutdown channel: the [`Receiver`] can be cloned, checked, and used as
//!    a future in async code, or blocked on in synchronous code without going
//!    through the runtime.
//! 2. A process-wide [`Coordinator`] which additionally tracks registered
//!    components through `Running → Stopping → Stopped` and can wait (with a
//!    deadline) for all of them to finish.
//!
//! Signal handlers must not allocate, lock, or log; their only entry points
//! here are [`signal_request_shutdown`] and [`signal_alarm_expired`], which
//! touch nothing but atomics and `alarm(2)`/`_exit(2)`.

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use std::time::Duration;

use crate::Condvar;
use crate::Mutex;
use futures::Future;
use slab::Slab;

#[derive(Debug)]
pub struct ShutdownError;

impl std::fmt::Display for ShutdownError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("shutdown requested")
    }
}

impl std::error::Error for ShutdownError {}

impl From<ShutdownError> for crate::Error {
    fn from(e: ShutdownError) -> Self {
        crate::Error::wrap(crate::ErrorKind::Cancelled, e)
    }
}

struct Inner {
    /// `None` iff shutdown has already happened.
    wakers: Mutex<Option<Slab<Waker>>>,

    condvar: Condvar,
}

pub struct Sender(Arc<Inner>);

impl Drop for Sender {
    fn drop(&mut self) {
        // Note sequencing: modify the lock state, then notify async/sync
        // waiters. The opposite order would create a race in which something
        // might never wake.
        let mut wakers = self
            .0
            .wakers
            .lock()
            .take()
            .expect("only the single Sender takes the slab");
        for w in wakers.drain() {
            w.wake();
        }
        self.0.condvar.notify_all();
    }
}

#[derive(Clone)]
pub struct Receiver(Arc<Inner>);

/// `waker_i` value to indicate no slot has been assigned.
const NO_WAKER: usize = usize::MAX;

impl Receiver {
    pub fn check(&self) -> Result<(), ShutdownError> {
        if self.0.wakers.lock().is_none() {
            Err(ShutdownError)
        } else {
            Ok(())
        }
    }

    pub fn is_requested(&self) -> bool {
        self.0.wakers.lock().is_none()
    }

    pub fn future(&self) -> ReceiverFuture {
        ReceiverFuture {
            receiver: self.0.clone(),
            waker_i: NO_WAKER,
        }
    }

    /// Blocks until shutdown (`Err`) or the timeout elapses (`Ok`).
    pub fn wait_for(&self, timeout: Duration) -> Result<(), ShutdownError> {
        let l = self.0.wakers.lock();
        let result = self
            .0
            .condvar
            .wait_timeout_while(l, timeout, |wakers| wakers.is_some());
        if result.1.timed_out() {
            Ok(())
        } else {
            Err(ShutdownError)
        }
    }
}

pub struct ReceiverFuture {
    receiver: Arc<Inner>,
    waker_i: usize,
}

impl Future for ReceiverFuture {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = Pin::into_inner(self);
        let mut l = this.receiver.wakers.lock();
        let wakers = match &mut *l {
            None => return Poll::Ready(()),
            Some(w) => w,
        };
        let new_waker = cx.waker();
        if this.waker_i == NO_WAKER {
            this.waker_i = wakers.insert(new_waker.clone());
        } else {
            let existing_waker = &mut wakers[this.waker_i];
            if !new_waker.will_wake(existing_waker) {
                existing_waker.clone_from(new_waker);
            }
        }
        Poll::Pending
    }
}

impl Drop for ReceiverFuture {
    fn drop(&mut self) {
        if self.waker_i == NO_WAKER {
            return;
        }
        let mut l = self.receiver.wakers.lock();
        if let Some(wakers) = &mut *l {
            wakers.remove(self.waker_i);
        }
    }
}

/// Returns a sender and receiver for graceful shutdown.
///
/// Dropping the sender will request shutdown.
///
/// The receiver can be used as a future or just polled when convenient.
pub fn channel() -> (Sender, Receiver) {
    let inner = Arc::new(Inner {
        wakers: Mutex::new(Some(Slab::new())),
        condvar: Condvar::new(),
    });
    (Sender(inner.clone()), Receiver(inner))
}

/// Progress of a registered component through shutdown.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum ComponentState {
    Running = 0,
    Stopping = 1,
    Stopped = 2,
}

impl ComponentState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => ComponentState::Running,
            1 => ComponentState::Stopping,
            _ => ComponentState::Stopped,
        }
    }
}

struct Component {
    name: String,
    state: AtomicU8,

    /// Invoked once by [`Coordinator::initiate`], newest registration first.
    stop_cb: Option<Box<dyn FnOnce() + Send>>,
}

struct CoordinatorInner {
    components: Mutex<Slab<Component>>,

    /// Notified whenever a component's state changes or is deregistered.
    changed: Condvar,

    sender: Mutex<Option<Sender>>,
    receiver: Receiver,
}

/// Process-wide shutdown coordinator; obtain via [`coordinator`].
///
/// Cheaply cloneable. Components [`Coordinator::register`] themselves at
/// startup and report their own progress through the returned handle;
/// [`Coordinator::initiate`] fans the request out through the shutdown
/// channel, and [`Coordinator::wait_all_stopped`] bounds the wait for
/// everyone to finish.
#[derive(Clone)]
pub struct Coordinator(Arc<CoordinatorInner>);

impl Coordinator {
    pub fn new() -> Self {
        let (sender, receiver) = channel();
        Coordinator(Arc::new(CoordinatorInner {
            components: Mutex::new(Slab::new()),
            changed: Condvar::new(),
            sender: Mutex::new(Some(sender)),
            receiver,
        }))
    }

    /// Returns a receiver observing this coordinator's shutdown request.
    pub fn receiver(&self) -> Receiver {
        self.0.receiver.clone()
    }

    /// Registers a component in state `Running`.
    pub fn register(&self, name: &str) -> ComponentHandle {
        self.register_inner(name, None)
    }

    /// Like [`Coordinator::register`], with a callback [`Coordinator::initiate`]
    /// runs to ask the component to stop. The callback must only signal
    /// (drop a sender, set a flag); it must not block on the stop itself.
    pub fn register_with_stop(
        &self,
        name: &str,
        stop_cb: Box<dyn FnOnce() + Send>,
    ) -> ComponentHandle {
        self.register_inner(name, Some(stop_cb))
    }

    fn register_inner(
        &self,
        name: &str,
        stop_cb: Option<Box<dyn FnOnce() + Send>>,
    ) -> ComponentHandle {
        let mut l = self.0.components.lock();
        let key = l.insert(Component {
            name: name.to_owned(),
            state: AtomicU8::new(ComponentState::Running as u8),
            stop_cb,
        });
        ComponentHandle {
            inner: self.0.clone(),
            key,
        }
    }

    /// Requests shutdown. Idempotent; safe to call from any ordinary code
    /// (but not from signal handlers; see [`signal_request_shutdown`]).
    ///
    /// Stop callbacks run here, outside the registry lock, newest
    /// registration first (the reverse of startup order).
    pub fn initiate(&self) {
        self.0.sender.lock().take();
        let mut callbacks = Vec::new();
        {
            let mut l = self.0.components.lock();
            for (_, c) in l.iter_mut() {
                if let Some(cb) = c.stop_cb.take() {
                    callbacks.push(cb);
                }
            }
        }
        for cb in callbacks.into_iter().rev() {
            cb();
        }
    }

    pub fn is_initiated(&self) -> bool {
        self.0.receiver.is_requested()
    }

    /// Waits until every registered component reaches `Stopped`, bounded by
    /// `timeout`. Returns true on success.
    pub fn wait_all_stopped(&self, timeout: Duration) -> bool {
        let l = self.0.components.lock();
        let result = self.0.changed.wait_timeout_while(l, timeout, |components| {
            components
                .iter()
                .any(|(_, c)| c.state.load(Ordering::Acquire) != ComponentState::Stopped as u8)
        });
        !result.1.timed_out()
    }

    /// Marks every component `Stopped` regardless of its actual progress.
    /// Only for the watchdog/emergency path; ordinary shutdown lets each
    /// component report for itself.
    pub fn force_stop_all(&self) {
        let l = self.0.components.lock();
        for (_, c) in l.iter() {
            c.state.store(ComponentState::Stopped as u8, Ordering::Release);
        }
        self.0.changed.notify_all();
    }

    /// Returns `(name, state)` for every registered component, for logging.
    pub fn snapshot(&self) -> Vec<(String, ComponentState)> {
        let l = self.0.components.lock();
        l.iter()
            .map(|(_, c)| {
                (
                    c.name.clone(),
                    ComponentState::from_u8(c.state.load(Ordering::Acquire)),
                )
            })
            .collect()
    }
}

impl Default for Coordinator {
    fn default() -> Self {
        Self::new()
    }
}

/// A registered component's handle; dropping it deregisters the component.
pub struct ComponentHandle {
    inner: Arc<CoordinatorInner>,
    key: usize,
}

impl ComponentHandle {
    pub fn update_state(&self, state: ComponentState) {
        let l = self.inner.components.lock();
        l[self.key].state.store(state as u8, Ordering::Release);
        self.inner.changed.notify_all();
    }
}

impl Drop for ComponentHandle {
    fn drop(&mut self) {
        let mut l = self.inner.components.lock();
        l.remove(self.key);
        self.inner.changed.notify_all();
    }
}

static COORDINATOR: std::sync::OnceLock<Coordinator> = std::sync::OnceLock::new();

/// Returns the process-wide coordinator, creating it on first use.
pub fn coordinator() -> &'static Coordinator {
    COORDINATOR.get_or_init(Coordinator::new)
}

/// Set (only) from signal handlers; polled by the run loop's supervisor task,
/// which then calls [`Coordinator::initiate`].
static SIGNAL_SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

/// Number of `SIGALRM` expirations seen so far.
static ALARM_PHASE: AtomicUsize = AtomicUsize::new(0);

/// Successive forced-progress deadlines: armed on signal entry, then re-armed
/// on each expiration. The expiration after the last entry calls `_exit`.
const ALARM_PHASES: [u32; 3] = [20, 15, 10];

/// Async-signal-safe shutdown request: stores a flag and arms the first
/// forced-progress timer. Nothing else is legal here.
pub fn signal_request_shutdown() {
    SIGNAL_SHUTDOWN_REQUESTED.store(true, Ordering::Release);
    unsafe {
        libc::alarm(ALARM_PHASES[0]);
    }
}

pub fn signal_shutdown_requested() -> bool {
    SIGNAL_SHUTDOWN_REQUESTED.load(Ordering::Acquire)
}

/// Async-signal-safe `SIGALRM` body: re-arms the next phase, or gives up on
/// cooperative cleanup entirely.
pub fn signal_alarm_expired() {
    let expirations = ALARM_PHASE.fetch_add(1, Ordering::AcqRel) + 1;
    if expirations < ALARM_PHASES.len() {
        unsafe {
            libc::alarm(ALARM_PHASES[expirations]);
        }
    } else {
        unsafe {
            libc::_exit(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::Future;
    use std::task::{Context, Poll};

    #[test]
    fn simple_check() {
        let (tx, rx) = super::channel();
        rx.check().unwrap();
        drop(tx);
        rx.check().unwrap_err();
    }

    #[test]
    fn blocking() {
        let (tx, rx) = super::channel();
        rx.wait_for(Duration::from_secs(0)).unwrap();
        let h = std::thread::spawn(move || rx.wait_for(Duration::from_secs(1000)).unwrap_err());

        // Make it likely that rx has done its initial check and is waiting on
        // the Condvar.
        std::thread::sleep(Duration::from_millis(10));

        drop(tx);
        h.join().unwrap();
    }

    #[test]
    fn future() {
        let (tx, rx) = super::channel();
        let waker = futures::task::noop_waker_ref();
        let mut cx = Context::from_waker(waker);
        let mut f = rx.future();
        assert_eq!(Pin::new(&mut f).poll(&mut cx), Poll::Pending);
        drop(tx);
        assert_eq!(Pin::new(&mut f).poll(&mut cx), Poll::Ready(()));
    }

    #[test]
    fn coordinator_waits_for_components() {
        let c = Coordinator::new();
        let a = c.register("a");
        let b = c.register("b");
        assert!(!c.wait_all_stopped(Duration::from_millis(1)));
        a.update_state(ComponentState::Stopping);
        a.update_state(ComponentState::Stopped);
        assert!(!c.wait_all_stopped(Duration::from_millis(1)));
        b.update_state(ComponentState::Stopped);
        assert!(c.wait_all_stopped(Duration::from_millis(1)));
    }

    #[test]
    fn coordinator_initiate_idempotent() {
        let c = Coordinator::new();
        let rx = c.receiver();
        assert!(!c.is_initiated());
        c.initiate();
        c.initiate();
        assert!(c.is_initiated());
        rx.check().unwrap_err();
    }

    #[test]
    fn stop_callbacks_run_once_in_reverse_order() {
        let c = Coordinator::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        let o1 = order.clone();
        let _a = c.register_with_stop("a", Box::new(move || o1.lock().push("a")));
        let o2 = order.clone();
        let _b = c.register_with_stop("b", Box::new(move || o2.lock().push("b")));
        c.initiate();
        c.initiate(); // callbacks are spent; must not run again
        assert_eq!(*order.lock(), vec!["b", "a"]);
    }

    #[test]
    fn coordinator_force_stop() {
        let c = Coordinator::new();
        let _a = c.register("a");
        assert!(!c.wait_all_stopped(Duration::from_millis(1)));
        c.force_stop_all();
        assert!(c.wait_all_stopped(Duration::from_millis(1)));
    }

    #[test]
    fn deregister_on_drop() {
        let c = Coordinator::new();
        let a = c.register("a");
        assert!(!c.wait_all_stopped(Duration::from_millis(1)));
        drop(a);
        assert!(c.wait_all_stopped(Duration::from_millis(1)));
    }
}
