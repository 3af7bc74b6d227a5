//! Bounded, thread-safe keyed work queue.
//!
//! Producers enqueue opaque keys, workers pull them FIFO and deposit a
//! result or a failure under the same key, and consumers block on the
//! key they need. A bound on the number of undelivered results applies
//! backpressure to workers; `stop` unblocks everyone.

use std::collections::{HashMap, VecDeque};
use std::hash::Hash;

use parking_lot::{Condvar, Mutex};

const DEFAULT_MAX_RESULTS: usize = 512;

#[derive(Clone, Copy, PartialEq, Eq)]
enum Status {
    Pending,
    Ready,
    Failed,
}

struct State<K, V> {
    queue: VecDeque<K>,
    status: HashMap<K, Status>,
    results: HashMap<K, V>,
    stopped: bool,
}

/// Keyed work queue shared between producers, workers, and consumers.
pub struct JobQueue<K, V> {
    state: Mutex<State<K, V>>,
    arg_wait: Condvar,
    result_wait: Condvar,
    max_results: usize,
}

impl<K, V> Default for JobQueue<K, V>
where
    K: Eq + Hash + Clone,
{
    fn default() -> Self {
        Self::new(DEFAULT_MAX_RESULTS)
    }
}

impl<K, V> JobQueue<K, V>
where
    K: Eq + Hash + Clone,
{
    /// Creates a queue that blocks workers once `max_results` results
    /// wait undelivered.
    pub fn new(max_results: usize) -> Self {
        Self {
            state: Mutex::new(State {
                queue: VecDeque::new(),
                status: HashMap::new(),
                results: HashMap::new(),
                stopped: false,
            }),
            arg_wait: Condvar::new(),
            result_wait: Condvar::new(),
            max_results,
        }
    }

    /// Enqueues keys as pending. Keys that already have a state are left
    /// unchanged. Never blocks.
    pub fn put(&self, keys: impl IntoIterator<Item = K>) {
        let mut state = self.state.lock();
        for key in keys {
            if state.status.contains_key(&key) {
                continue;
            }
            state.status.insert(key.clone(), Status::Pending);
            state.queue.push_back(key);
        }
        drop(state);
        self.arg_wait.notify_all();
    }

    /// Pulls the next key to work on, blocking while the queue is empty
    /// or backpressure applies. `None` once the queue is stopped.
    pub fn get_arg(&self) -> Option<K> {
        let mut state = self.state.lock();
        while !state.stopped && (state.queue.is_empty() || state.results.len() > self.max_results) {
            self.arg_wait.wait(&mut state);
        }
        if state.stopped {
            return None;
        }
        state.queue.pop_front()
    }

    /// Pulls up to `max` keys at once for batching workers. Blocks and
    /// stops like [`Self::get_arg`].
    pub fn get_args(&self, max: usize) -> Option<Vec<K>> {
        let mut state = self.state.lock();
        while !state.stopped && (state.queue.is_empty() || state.results.len() > self.max_results) {
            self.arg_wait.wait(&mut state);
        }
        if state.stopped {
            return None;
        }
        let take = max.min(state.queue.len());
        Some(state.queue.drain(..take).collect())
    }

    /// True if the key has been enqueued and not yet delivered.
    pub fn has_arg(&self, key: &K) -> bool {
        self.state.lock().status.contains_key(key)
    }

    /// Deposits a successful result and wakes result waiters.
    pub fn done(&self, key: K, value: V) {
        let mut state = self.state.lock();
        state.results.insert(key.clone(), value);
        state.status.insert(key, Status::Ready);
        drop(state);
        self.result_wait.notify_all();
    }

    /// Marks the job failed and wakes result waiters.
    pub fn failed(&self, key: K) {
        let mut state = self.state.lock();
        state.results.remove(&key);
        state.status.insert(key, Status::Failed);
        drop(state);
        self.result_wait.notify_all();
    }

    /// Blocks until the key reaches a terminal state and delivers the
    /// value. `None` for a failed job, an unknown key, or a stopped
    /// queue. Delivery removes the key entirely.
    pub fn get_result(&self, key: &K) -> Option<V> {
        let mut state = self.state.lock();
        if !state.status.contains_key(key) {
            return None;
        }
        while !state.stopped && state.status.get(key) == Some(&Status::Pending) {
            self.result_wait.wait(&mut state);
        }
        if state.stopped || state.status.get(key) != Some(&Status::Ready) {
            return None;
        }
        let value = state.results.remove(key);
        state.status.remove(key);
        drop(state);
        // A delivered result frees one backpressure slot.
        self.arg_wait.notify_one();
        value
    }

    /// Wakes every waiter with a cancel indication; subsequent calls
    /// return negatively.
    pub fn stop(&self) {
        self.state.lock().stopped = true;
        self.arg_wait.notify_all();
        self.result_wait.notify_all();
    }

    /// True once [`Self::stop`] has been called.
    pub fn stopped(&self) -> bool {
        self.state.lock().stopped
    }
}
