//! The event-sourced task execution engine that drives Docker to bring up a
//! task's container dependency graph, stream its output, and tear everything
//! down deterministically regardless of success, failure, or interruption.
//!
//! See `SPEC_FULL.md` in the repository root for the full design.

mod cleanup;
mod command_line;
mod context;
pub mod docker;
mod event;
mod executor;
mod queue;
mod reactor;
mod run_loop;
mod step;
mod stream;
mod terminal;

pub mod model;

pub use cleanup::CleanupPlanner;
pub use command_line::{split_command_line, InvalidCommandLineError};
pub use context::TaskContext;
pub use event::{EventNotFound, EventNotUnique, EventStore, TaskEvent};
pub use queue::StepQueue;
pub use reactor::EventReactor;
pub use run_loop::{EngineConfig, Engine, TaskOutcome};
pub use step::TaskStep;

pub use stacked_errors::{Error, Result, StackableErr};
