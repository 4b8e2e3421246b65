//! In-process engine for the task-delegation supervisor.
//!
//! Owns everything that runs between the store and the outside world: the
//! dependency graph, the priority queue, the worker pool that actually
//! spawns agent processes, the cron/one-shot scheduler, resource pressure
//! tracking, and the event bus that ties them together for logging and the
//! TUI. [`supervisor::Supervisor`] is the entry point: it wires every
//! subsystem together, runs crash recovery on start, and tears everything
//! down in a fixed order on stop. [`handlers::Handlers`] implements the
//! actual request handling -- delegation, completion, resumption,
//! cancellation -- that the supervisor and the CLI both call into.

pub mod agent;
pub mod di;
pub mod error;
pub mod events;
pub mod graph;
pub mod handlers;
pub mod isolation;
pub mod pool;
pub mod queue;
pub mod resource;
pub mod scheduler;
pub mod supervisor;
pub mod validation;
pub mod worktree;

pub use error::SupervisorError;
pub use handlers::Handlers;
pub use supervisor::{Supervisor, SupervisorConfig};
