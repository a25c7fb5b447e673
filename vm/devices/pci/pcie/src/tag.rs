// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Outstanding-request tag allocation.

use crate::MAX_TAGS;
use event_listener::Event;
use parking_lot::Mutex;

/// Hands out transaction tags for non-posted requests.
///
/// Tags are handed out by scanning forward from the most recently
/// allocated tag. When every tag is held, [`TagAllocator::allocate`]
/// waits for a release and rescans.
pub struct TagAllocator {
    state: Mutex<TagState>,
    tag_count: usize,
    released: Event,
}

struct TagState {
    current: usize,
    active: [bool; MAX_TAGS],
}

impl TagAllocator {
    /// Creates an allocator for `tag_count` tags, clamped to `1..=256`.
    pub fn new(tag_count: usize) -> Self {
        Self {
            state: Mutex::new(TagState {
                current: 0,
                active: [false; MAX_TAGS],
            }),
            tag_count: tag_count.clamp(1, MAX_TAGS),
            released: Event::new(),
        }
    }

    /// Number of tags in the pool.
    pub fn tag_count(&self) -> usize {
        self.tag_count
    }

    /// Number of tags currently held.
    pub fn in_flight(&self) -> usize {
        self.state.lock().active[..self.tag_count]
            .iter()
            .filter(|&&a| a)
            .count()
    }

    fn try_allocate(&self) -> Option<u8> {
        let mut state = self.state.lock();
        let mut tag = state.current;
        for _ in 0..self.tag_count {
            tag = (tag + 1) % self.tag_count;
            if !state.active[tag] {
                state.active[tag] = true;
                state.current = tag;
                return Some(tag as u8);
            }
        }
        None
    }

    /// Allocates a tag, waiting for one to be released if the pool is
    /// exhausted. The tag is returned to the pool when the guard drops.
    pub async fn allocate(&self) -> TagGuard<'_> {
        loop {
            if let Some(tag) = self.try_allocate() {
                return TagGuard { tags: self, tag };
            }
            let listener = self.released.listen();
            // A release may have landed between the scan and the listen.
            if let Some(tag) = self.try_allocate() {
                return TagGuard { tags: self, tag };
            }
            listener.await;
        }
    }

    /// Returns `tag` to the pool and wakes every waiter.
    ///
    /// Panics if `tag` is not currently held.
    pub fn release(&self, tag: u8) {
        let mut state = self.state.lock();
        assert!(
            state.active[tag as usize],
            "released tag {tag} which is not in flight"
        );
        state.active[tag as usize] = false;
        drop(state);
        self.released.notify(usize::MAX);
    }
}

/// A held tag, released on drop.
#[must_use]
pub struct TagGuard<'a> {
    tags: &'a TagAllocator,
    tag: u8,
}

impl TagGuard<'_> {
    /// The tag value.
    pub fn tag(&self) -> u8 {
        self.tag
    }
}

impl Drop for TagGuard<'_> {
    fn drop(&mut self) {
        self.tags.release(self.tag);
    }
}
