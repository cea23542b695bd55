use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

/// Bounded time-windowed set of recently seen keys.
///
/// A key is "fresh" the first time it is seen and again once its window has
/// elapsed. Entries are evicted oldest-first when the window passes or the
/// capacity is exceeded.
#[derive(Debug)]
pub struct DedupCache {
    window: Duration,
    capacity: usize,
    state: Mutex<DedupState>,
}

#[derive(Debug, Default)]
struct DedupState {
    seen: HashMap<String, Instant>,
    order: VecDeque<(Instant, String)>,
}

impl DedupState {
    fn forget_front(&mut self) {
        if let Some((at, key)) = self.order.pop_front() {
            // A later sighting refreshed the key; leave that one alone.
            if self.seen.get(&key) == Some(&at) {
                self.seen.remove(&key);
            }
        }
    }
}

impl DedupCache {
    pub fn new(window: Duration, capacity: usize) -> Self {
        Self {
            window,
            capacity: capacity.max(1),
            state: Mutex::new(DedupState::default()),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Record `key`; returns `false` when it was already seen inside the window.
    pub fn first_sighting(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut state = self.state.lock().unwrap();

        while let Some((at, _)) = state.order.front() {
            if now.duration_since(*at) < self.window {
                break;
            }
            state.forget_front();
        }

        if let Some(at) = state.seen.get(key) {
            if now.duration_since(*at) < self.window {
                return false;
            }
        }

        state.seen.insert(key.to_string(), now);
        state.order.push_back((now, key.to_string()));
        while state.seen.len() > self.capacity {
            state.forget_front();
        }
        true
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap().seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
