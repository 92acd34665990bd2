//! Backoff queue of pairs whose last attempt failed

use priority_queue::PriorityQueue;
use std::cmp::Reverse;
use std::collections::HashMap;
use std::time::{Duration, Instant};

use ndrive_index::QueueItem;

#[derive(Debug, Clone)]
pub struct BlacklistEntry {
    pub item: QueueItem,
    pub count: u32,
    pub next_try: Instant,
}

/// Pairs waiting for their retry time, earliest first.
#[derive(Debug)]
pub struct BlacklistQueue {
    queue: PriorityQueue<i64, Reverse<Instant>>,
    entries: HashMap<i64, BlacklistEntry>,
    base_delay: Duration,
    max_delay: Duration,
}

impl BlacklistQueue {
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            queue: PriorityQueue::new(),
            entries: HashMap::new(),
            base_delay,
            max_delay,
        }
    }

    /// Delay before retry number `count`: the base delay doubled for each
    /// earlier failure, capped.
    pub fn delay_for(&self, count: u32) -> Duration {
        let exponent = count.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }

    /// Hold `item` back; an explicit `interval` replaces the computed delay.
    pub fn push(&mut self, item: QueueItem, count: u32, interval: Option<Duration>, now: Instant) -> Instant {
        let delay = interval.unwrap_or_else(|| self.delay_for(count));
        let next_try = now + delay;
        self.queue.push(item.id, Reverse(next_try));
        self.entries.insert(
            item.id,
            BlacklistEntry {
                item,
                count,
                next_try,
            },
        );
        next_try
    }

    pub fn contains(&self, id: i64) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn remove(&mut self, id: i64) -> Option<BlacklistEntry> {
        self.queue.remove(&id);
        self.entries.remove(&id)
    }

    /// Entries whose retry time has come, removed from the queue.
    pub fn pop_ready(&mut self, now: Instant) -> Vec<BlacklistEntry> {
        let mut ready = Vec::new();
        while let Some((_, Reverse(next_try))) = self.queue.peek() {
            if *next_try > now {
                break;
            }
            if let Some((id, _)) = self.queue.pop() {
                if let Some(entry) = self.entries.remove(&id) {
                    ready.push(entry);
                }
            }
        }
        ready
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.queue.peek().map(|(_, Reverse(t))| *t)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> impl Iterator<Item = &BlacklistEntry> {
        self.entries.values()
    }
}
