// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Single-consumer action queues.
//!
//! Every manager owns one [`ActionQueue`]. Producers (other managers, driver
//! reader threads, API callers) push actions and return immediately; one
//! consumer executes them strictly in submission order, either on a
//! dedicated thread ([`spawn`]) or by pumping the queue explicitly
//! ([`ActionHandler::pump`]).

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use slog::{debug, Logger};

struct QueueInner<A> {
    actions: VecDeque<A>,
    finalized: bool,
}

pub struct ActionQueue<A> {
    inner: Mutex<QueueInner<A>>,
    cv: Condvar,
}

impl<A> Default for ActionQueue<A> {
    fn default() -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                actions: VecDeque::new(),
                finalized: false,
            }),
            cv: Condvar::new(),
        }
    }
}

impl<A> ActionQueue<A> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues an action. Actions pushed after [`ActionQueue::finalize`] are
    /// dropped.
    pub fn push(&self, action: A) {
        let mut inner = self.inner.lock().unwrap();
        if inner.finalized {
            return;
        }
        inner.actions.push_back(action);
        self.cv.notify_one();
    }

    pub fn try_pop(&self) -> Option<A> {
        self.inner.lock().unwrap().actions.pop_front()
    }

    /// Blocks until an action is available. Returns `None` once the queue is
    /// finalized and drained.
    pub fn wait_pop(&self) -> Option<A> {
        let guard = self.inner.lock().unwrap();
        let mut guard = self
            .cv
            .wait_while(guard, |i| i.actions.is_empty() && !i.finalized)
            .unwrap();
        guard.actions.pop_front()
    }

    /// Stops the consumer once the remaining actions are processed.
    pub fn finalize(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.finalized = true;
        self.cv.notify_all();
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().actions.is_empty()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().actions.len()
    }
}

/// A manager that consumes an action queue.
pub trait ActionHandler: Send + Sync + 'static {
    type Action: Send + 'static;

    fn queue(&self) -> &ActionQueue<Self::Action>;

    fn handle(&self, action: Self::Action);

    /// Executes one queued action, if any. Returns false on an empty queue.
    fn pump(&self) -> bool {
        match self.queue().try_pop() {
            Some(action) => {
                self.handle(action);
                true
            }
            None => false,
        }
    }
}

/// Starts the consumer thread of `handler`.
pub fn spawn<H: ActionHandler>(
    name: &str,
    handler: Arc<H>,
    log: Logger,
) -> std::io::Result<JoinHandle<()>> {
    std::thread::Builder::new().name(name.to_string()).spawn(move || {
        debug!(log, "listener started");
        while let Some(action) = handler.queue().wait_pop() {
            handler.handle(action);
        }
        debug!(log, "listener finalized");
    })
}
