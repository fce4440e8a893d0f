// src/repository/queue.rs

//! The per-repository event queue.
//!
//! An ordered backlog guarded by a lock, with a single-slot wake channel.
//! Multiple enqueues while the processor is busy collapse into one pending
//! wake; the processor swaps out the whole backlog at once, so FIFO order is
//! preserved and no wake is ever lost.

use crate::repository::event::Event;
use parking_lot::Mutex;
use tokio::sync::mpsc;

pub struct EventQueue {
    events: Mutex<Vec<Event>>,
    wake_tx: mpsc::Sender<()>,
}

impl EventQueue {
    /// Returns the queue and the wake receiver the processor blocks on.
    pub fn new() -> (Self, mpsc::Receiver<()>) {
        let (wake_tx, wake_rx) = mpsc::channel(1);
        (
            Self {
                events: Mutex::new(Vec::new()),
                wake_tx,
            },
            wake_rx,
        )
    }

    /// Non-blocking enqueue. A full wake slot means a wake is already
    /// pending, which is exactly the coalescing we want.
    pub fn push(&self, event: Event) {
        self.events.lock().push(event);
        let _ = self.wake_tx.try_send(());
    }

    /// Takes the entire backlog in one swap.
    pub fn drain(&self) -> Vec<Event> {
        std::mem::take(&mut *self.events.lock())
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }
}
