// src/repository/mod.rs

//! The repository manager, the per-repository worker, and their event plane.

pub mod event;
pub mod handler;
pub mod manager;
pub mod queue;
pub mod worker;

pub use event::{Action, Event, EventEnvelope};
pub use handler::{Handler, HandlerState};
pub use manager::{RepositoryManager, WorkerParams};
pub use worker::{Processor, Worker, WorkerContext};
