//! Single-level hashed wheel: O(1) schedule and cancel, each slot visited at
//! most once per tick call. Fired timers are streamed to a callback.

use std::time::Duration;

use generativity::Id;
use minstant::Instant;
use thiserror::Error;

use super::slab::{Node, Slab};

/// Length of one wheel tick.
pub const TICK: Duration = Duration::from_millis(1);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WheelError {
    #[error("timer wheel is full")]
    Capacity,
    #[error("delay of {delay} ticks exceeds the wheel span of {max} ticks")]
    DelayTooLong { delay: u64, max: u64 },
}

/// Names one scheduled timer of the wheel branded `'id`.
///
/// A handle goes stale once its timer fires or is cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerHandle<'id> {
    index: u32,
    generation: u32,
    _brand: Id<'id>,
}

pub struct Wheel<'id, T, const SLOTS: usize> {
    brand: Id<'id>,
    heads: Box<[Option<u32>]>,
    slab: Slab<T>,
    cursor: u64,
    origin: Instant,
}

impl<'id, T, const SLOTS: usize> Wheel<'id, T, SLOTS> {
    const SPAN: () = assert!(SLOTS > 1, "a wheel needs at least two slots");

    pub(super) fn new(brand: Id<'id>, capacity: u32) -> Self {
        let () = Self::SPAN;
        Self {
            brand,
            heads: vec![None; SLOTS].into_boxed_slice(),
            slab: Slab::with_capacity(capacity),
            cursor: 0,
            origin: Instant::now(),
        }
    }

    /// Ticks elapsed since the wheel was created.
    #[must_use]
    pub fn now_tick(&self) -> u64 {
        let elapsed = self.origin.elapsed().as_nanos() / TICK.as_nanos();
        u64::try_from(elapsed).unwrap_or(u64::MAX)
    }

    /// Timers currently pending.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slab.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Schedules `payload` to fire `delay` ticks from the current time.
    ///
    /// # Errors
    ///
    /// See [`schedule_at`](Self::schedule_at).
    pub fn schedule_after(&mut self, delay: u64, payload: T) -> Result<TimerHandle<'id>, WheelError> {
        let now = self.now_tick();
        self.schedule_at(now, delay, payload)
    }

    /// Schedules `payload` to fire `delay` ticks after tick `now`. A delay of
    /// zero fires on the next tick.
    ///
    /// # Errors
    ///
    /// [`WheelError::DelayTooLong`] when the delay does not fit in one
    /// revolution, [`WheelError::Capacity`] when every node is in use.
    pub fn schedule_at(
        &mut self,
        now: u64,
        delay: u64,
        payload: T,
    ) -> Result<TimerHandle<'id>, WheelError> {
        let max = SLOTS as u64 - 1;
        if delay > max {
            return Err(WheelError::DelayTooLong { delay, max });
        }
        let deadline = now.max(self.cursor) + delay.max(1);
        let slot = Self::slot(deadline);
        let head = self.heads[slot];
        let (index, generation) = self
            .slab
            .insert(Node {
                payload,
                deadline,
                prev: None,
                next: head,
            })
            .map_err(|_| WheelError::Capacity)?;
        if let Some(old) = head.and_then(|h| self.slab.get_mut(h)) {
            old.prev = Some(index);
        }
        self.heads[slot] = Some(index);
        Ok(TimerHandle {
            index,
            generation,
            _brand: self.brand,
        })
    }

    /// Removes a pending timer. Returns `false` for stale handles.
    pub fn cancel(&mut self, handle: &TimerHandle<'id>) -> bool {
        if self.slab.generation(handle.index) != Some(handle.generation) {
            return false;
        }
        self.unlink(handle.index);
        self.slab.remove(handle.index).is_some()
    }

    /// Advances to `now` and hands every timer whose deadline has passed to `on_fire`.
    pub fn tick_at(&mut self, now: u64, mut on_fire: impl FnMut(TimerHandle<'id>, T)) {
        if now <= self.cursor {
            return;
        }
        // Past one revolution every slot has been visited once.
        let steps = (now - self.cursor).min(SLOTS as u64);
        for step in 1..=steps {
            let slot = Self::slot(self.cursor + step);
            let mut next = self.heads[slot];
            while let Some(index) = next {
                let Some(node) = self.slab.get(index) else { break };
                next = node.next;
                if node.deadline > now {
                    continue;
                }
                let Some(generation) = self.slab.generation(index) else { break };
                self.unlink(index);
                if let Some(node) = self.slab.remove(index) {
                    on_fire(
                        TimerHandle {
                            index,
                            generation,
                            _brand: self.brand,
                        },
                        node.payload,
                    );
                }
            }
        }
        self.cursor = now;
    }

    /// [`tick_at`](Self::tick_at) with the current time.
    pub fn tick_now(&mut self, on_fire: impl FnMut(TimerHandle<'id>, T)) {
        let now = self.now_tick();
        self.tick_at(now, on_fire);
    }

    fn slot(tick: u64) -> usize {
        (tick % SLOTS as u64) as usize
    }

    fn unlink(&mut self, index: u32) {
        let Some(node) = self.slab.get(index) else { return };
        let (prev, next, slot) = (node.prev, node.next, Self::slot(node.deadline));
        match prev.and_then(|p| self.slab.get_mut(p)) {
            Some(p) => p.next = next,
            None => self.heads[slot] = next,
        }
        if let Some(n) = next.and_then(|n| self.slab.get_mut(n)) {
            n.prev = prev;
        }
    }
}
