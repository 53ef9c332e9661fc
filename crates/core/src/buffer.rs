//! Shared buffers connecting adjacent streaming stages
//!
//! Each buffer hands owned items from exactly one producer stage to one
//! consumer stage. `get_item` blocks while the buffer is empty until an item
//! arrives or the producer declares the input stopped, which drains to the
//! `None` sentinel.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, PoisonError};

/// The hand-off capability between adjacent pipeline stages.
pub trait SharedBuffer<T: Send>: Send + Sync {
    fn add_item(&self, item: T);

    /// Take the next item, blocking while the buffer is empty and input has
    /// not stopped. Returns `None` once the buffer is drained after
    /// `stopped_input`.
    fn get_item(&self) -> Option<T>;

    /// Declare that input is (again) expected; called on every buffer
    /// before a run starts.
    fn start_input(&self);

    /// Declare that no further items will be added.
    fn stopped_input(&self);
}

struct SingleState<T> {
    queue: VecDeque<T>,
    stopped: bool,
}

/// One mutex-guarded queue with a condition variable. Fully serializes
/// access but is correct for any producer/consumer count.
pub struct SingleBuffer<T> {
    state: Mutex<SingleState<T>>,
    available: Condvar,
}

impl<T> SingleBuffer<T> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SingleState {
                queue: VecDeque::new(),
                stopped: false,
            }),
            available: Condvar::new(),
        }
    }
}

impl<T> Default for SingleBuffer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send> SharedBuffer<T> for SingleBuffer<T> {
    fn add_item(&self, item: T) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.queue.push_back(item);
        self.available.notify_one();
    }

    fn get_item(&self) -> Option<T> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if let Some(item) = state.queue.pop_front() {
                return Some(item);
            }
            if state.stopped {
                return None;
            }
            state = self
                .available
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn start_input(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.stopped = false;
    }

    fn stopped_input(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.stopped = true;
        self.available.notify_all();
    }
}

struct InputSide<T> {
    queue: VecDeque<T>,
    stopped: bool,
}

/// Two internal queues: the producer appends to the input queue under its
/// own lock while the consumer pops the output queue under the other, so
/// steady-state adds and gets touch disjoint state. When the output queue
/// runs dry the consumer takes both locks and swaps the queues, serializing
/// against the producer only for the swap instant.
///
/// Exactly one producer thread and one consumer thread per instance; this is
/// not a general multi-producer/multi-consumer queue.
pub struct DoubleBuffer<T> {
    input: Mutex<InputSide<T>>,
    output: Mutex<VecDeque<T>>,
    available: Condvar,
}

impl<T> DoubleBuffer<T> {
    pub fn new() -> Self {
        Self {
            input: Mutex::new(InputSide {
                queue: VecDeque::new(),
                stopped: false,
            }),
            output: Mutex::new(VecDeque::new()),
            available: Condvar::new(),
        }
    }
}

impl<T> Default for DoubleBuffer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send> SharedBuffer<T> for DoubleBuffer<T> {
    // Producer side: only touches the input queue.
    fn add_item(&self, item: T) {
        let mut input = self.input.lock().unwrap_or_else(PoisonError::into_inner);
        input.queue.push_back(item);
        self.available.notify_one();
    }

    // Consumer side: pops the output queue, swapping the queues only when
    // it runs dry. Lock order is always output then input; the producer
    // never holds both.
    fn get_item(&self) -> Option<T> {
        let mut output = self.output.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(item) = output.pop_front() {
            return Some(item);
        }

        let mut input = self.input.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if !input.queue.is_empty() {
                break;
            }
            if input.stopped {
                return None;
            }
            input = self
                .available
                .wait(input)
                .unwrap_or_else(PoisonError::into_inner);
        }
        std::mem::swap(&mut *output, &mut input.queue);
        drop(input);
        output.pop_front()
    }

    fn start_input(&self) {
        let mut input = self.input.lock().unwrap_or_else(PoisonError::into_inner);
        input.stopped = false;
    }

    fn stopped_input(&self) {
        let mut input = self.input.lock().unwrap_or_else(PoisonError::into_inner);
        input.stopped = true;
        self.available.notify_all();
    }
}
