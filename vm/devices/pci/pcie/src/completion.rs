// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Routing of inbound completions to the requests waiting on them.

use crate::MAX_TAGS;
use crate::tlp::Tlp;
use event_listener::Event;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

/// Source of timeouts, typically driven by a simulation clock.
pub trait Timer: Send + Sync {
    /// Returns a future that completes after `duration` has elapsed.
    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()>;
}

struct CompletionSlot {
    queue: Mutex<VecDeque<Tlp>>,
    arrived: Event,
}

/// Per-tag completion queues.
pub struct CompletionRouter {
    slots: Vec<CompletionSlot>,
    timer: Arc<dyn Timer>,
}

impl CompletionRouter {
    /// Creates a router with a queue for every possible tag.
    pub fn new(timer: Arc<dyn Timer>) -> Self {
        Self {
            slots: (0..MAX_TAGS)
                .map(|_| CompletionSlot {
                    queue: Mutex::new(VecDeque::new()),
                    arrived: Event::new(),
                })
                .collect(),
            timer,
        }
    }

    /// Queues a completion under its tag and wakes the waiter.
    ///
    /// Panics if `tlp` is not a completion.
    pub fn route(&self, tlp: Tlp) {
        assert!(
            tlp.fmt_type.is_completion(),
            "routed non-completion {:?}",
            tlp.fmt_type
        );
        let slot = &self.slots[tlp.tag as usize];
        slot.queue.lock().push_back(tlp);
        slot.arrived.notify(usize::MAX);
    }

    fn pop(&self, tag: u8) -> Option<Tlp> {
        self.slots[tag as usize].queue.lock().pop_front()
    }

    /// Drops any completions still queued for `tag`, returning how many
    /// were discarded.
    pub fn flush(&self, tag: u8) -> usize {
        let mut queue = self.slots[tag as usize].queue.lock();
        let n = queue.len();
        queue.clear();
        n
    }

    /// Returns the oldest completion for `tag`, waiting up to `timeout` for
    /// one to arrive. A zero timeout waits forever.
    pub async fn wait(&self, tag: u8, timeout: Duration) -> Option<Tlp> {
        if let Some(tlp) = self.pop(tag) {
            return Some(tlp);
        }
        let listener = self.slots[tag as usize].arrived.listen();
        if let Some(tlp) = self.pop(tag) {
            return Some(tlp);
        }
        if timeout.is_zero() {
            listener.await;
        } else {
            futures::future::select(listener, self.timer.sleep(timeout)).await;
        }
        self.pop(tag)
    }
}
