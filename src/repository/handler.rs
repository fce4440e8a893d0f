// src/repository/handler.rs

//! The capability set a repository handler exposes to the manager and the
//! event plane. The manager is generic in this trait; each plugin supplies
//! its concrete worker type.

use crate::core::BeskarError;
use crate::repository::event::Event;
use async_trait::async_trait;
use std::sync::Arc;

/// Observable lifecycle of a handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerState {
    Starting,
    Running,
    Stopped,
}

#[async_trait]
pub trait Handler: Send + Sync + 'static {
    /// The repository this handler owns.
    fn repository(&self) -> &str;

    /// Spawns the handler's processing task. Called exactly once, by the
    /// manager. Re-entry after stop is not permitted; a stopped handler is
    /// replaced by a freshly spawned one.
    fn start(self: Arc<Self>);

    /// Non-blocking, idempotent stop.
    async fn stop(&self);

    fn state(&self) -> HandlerState;

    fn stopped(&self) -> bool {
        self.state() == HandlerState::Stopped
    }

    /// Blocks until the handler is observably started. Returns false if it
    /// stopped (or failed to start) instead.
    async fn wait_started(&self) -> bool;

    /// Blocks until the handler's cleanup has fully finished. This is the
    /// barrier graceful shutdown fans out over.
    async fn wait_stopped(&self);

    /// Enqueues an event. With `durable` set, the event is written to the
    /// status database before this returns, so acknowledging the registry
    /// afterwards is safe.
    async fn queue_event(&self, event: Event, durable: bool) -> Result<(), BeskarError>;
}
