//! Per-session outbound message queue
//!
//! Serializes writes to a transport that must never see two concurrent
//! writers. Any number of producers may `enqueue`; exactly one of them (the
//! one that found the queue idle) is told to start a transmission, and every
//! later message is handed out by `complete` as the previous one finishes.
//!
//! The message being transmitted is moved out of the queue while it is on the
//! wire; `len()` still counts it as the front element.

use std::collections::VecDeque;

use parking_lot::Mutex;

use crate::message::Message;

/// Result of `MessageQueue::enqueue`
#[derive(Debug, PartialEq, Eq)]
pub enum Enqueued {
    /// Queue was idle; the caller must start transmitting this message
    Transmit(Message),
    /// A transmission is in flight; the message waits its turn
    Queued,
    /// Queue is closed; the message was dropped
    Rejected,
}

#[derive(Debug, Default)]
struct QueueState {
    pending: VecDeque<Message>,
    in_flight: bool,
    closed: bool,
}

/// FIFO of outbound messages with at most one transmission in flight
#[derive(Debug, Default)]
pub struct MessageQueue {
    state: Mutex<QueueState>,
}

impl MessageQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take ownership of a message
    ///
    /// Never blocks beyond the queue lock.
    pub fn enqueue(&self, message: Message) -> Enqueued {
        let mut state = self.state.lock();
        if state.closed {
            return Enqueued::Rejected;
        }
        if state.in_flight {
            state.pending.push_back(message);
            Enqueued::Queued
        } else {
            state.in_flight = true;
            Enqueued::Transmit(message)
        }
    }

    /// Report the outcome of the in-flight transmission
    ///
    /// On success the in-flight message is retired and the next one (if any)
    /// is returned for transmission. On failure the queue closes and nothing
    /// more is handed out.
    pub fn complete<E>(&self, result: &Result<(), E>) -> Option<Message> {
        let mut state = self.state.lock();
        if result.is_err() || state.closed {
            state.closed = true;
            state.in_flight = false;
            state.pending.clear();
            return None;
        }
        let next = state.pending.pop_front();
        state.in_flight = next.is_some();
        next
    }

    /// Close the queue, returning how many undelivered messages were dropped
    pub fn close(&self) -> usize {
        let mut state = self.state.lock();
        state.closed = true;
        let dropped = state.pending.len() + usize::from(state.in_flight);
        state.in_flight = false;
        state.pending.clear();
        dropped
    }

    /// Messages not yet confirmed, including the one in flight
    pub fn len(&self) -> usize {
        let state = self.state.lock();
        state.pending.len() + usize::from(state.in_flight)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_in_flight(&self) -> bool {
        self.state.lock().in_flight
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}
