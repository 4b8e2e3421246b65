//! The supervisor's event bus.
//!
//! A single owner task holds the list of subscribers and the event log;
//! every other component talks to it through an `mpsc` command channel
//! rather than sharing a string-keyed pub/sub map. `BusEvent` is a closed
//! enum so every event kind is known at compile time and maps to exactly
//! one tracing level.

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;

/// Every event the supervisor can emit.
#[derive(Debug, Clone, PartialEq)]
pub enum BusEvent {
    TaskQueued { task_id: Uuid },
    TaskStarted { task_id: Uuid, worker_id: String },
    TaskCompleted { task_id: Uuid, exit_code: i32 },
    TaskFailed { task_id: Uuid, error_kind: String, message: String },
    TaskCancelled { task_id: Uuid },
    TaskRetried { task_id: Uuid, retry_of: Uuid },
    DependencyResolved { task_id: Uuid, depends_on: Uuid },
    DependencyBlocked { task_id: Uuid, depends_on: Uuid },
    ScheduleFired { schedule_id: Uuid, task_id: Uuid },
    ScheduleMissed { schedule_id: Uuid },
    ScheduleExhausted { schedule_id: Uuid },
    ResourcePressure { cpu_percent: f32, memory_fraction: f64 },
    SystemResourcesUpdated { snapshot: crate::resource::ResourceSnapshot, worker_count: usize },
    WorkerPoolSaturated { active: usize, capacity: usize },
    ShutdownInitiated,
    WorkersTerminating,
    DatabaseClosing,
    ShutdownComplete,
}

impl BusEvent {
    /// The tracing level this event kind logs at.
    pub fn level(&self) -> tracing::Level {
        use tracing::Level;
        match self {
            BusEvent::TaskFailed { .. }
            | BusEvent::DependencyBlocked { .. }
            | BusEvent::ScheduleExhausted { .. } => Level::ERROR,
            BusEvent::ResourcePressure { .. }
            | BusEvent::WorkerPoolSaturated { .. }
            | BusEvent::ScheduleMissed { .. }
            | BusEvent::TaskCancelled { .. }
            | BusEvent::WorkersTerminating => Level::WARN,
            _ => Level::INFO,
        }
    }

    /// Human-readable summary used by `dispatchd logs` and the TUI event
    /// feed.
    pub fn message(&self) -> String {
        match self {
            BusEvent::TaskQueued { task_id } => format!("task {task_id} queued"),
            BusEvent::TaskStarted { task_id, worker_id } => {
                format!("task {task_id} started on {worker_id}")
            }
            BusEvent::TaskCompleted { task_id, exit_code } => {
                format!("task {task_id} completed (exit {exit_code})")
            }
            BusEvent::TaskFailed { task_id, error_kind, message } => {
                format!("task {task_id} failed [{error_kind}]: {message}")
            }
            BusEvent::TaskCancelled { task_id } => format!("task {task_id} cancelled"),
            BusEvent::TaskRetried { task_id, retry_of } => {
                format!("task {task_id} queued as retry of {retry_of}")
            }
            BusEvent::DependencyResolved { task_id, depends_on } => {
                format!("task {task_id}: dependency {depends_on} satisfied")
            }
            BusEvent::DependencyBlocked { task_id, depends_on } => {
                format!("task {task_id}: dependency {depends_on} failed or cancelled")
            }
            BusEvent::ScheduleFired { schedule_id, task_id } => {
                format!("schedule {schedule_id} fired task {task_id}")
            }
            BusEvent::ScheduleMissed { schedule_id } => {
                format!("schedule {schedule_id} missed a run")
            }
            BusEvent::ScheduleExhausted { schedule_id } => {
                format!("schedule {schedule_id} reached its run limit or expiry")
            }
            BusEvent::ResourcePressure { cpu_percent, memory_fraction } => format!(
                "resource pressure: cpu {cpu_percent:.1}% memory {:.1}%",
                memory_fraction * 100.0
            ),
            BusEvent::SystemResourcesUpdated { snapshot, worker_count } => format!(
                "resources: cpu {:.1}% memory {:.1}% load {:.2}/{:.2}/{:.2} workers {worker_count}",
                snapshot.cpu_percent,
                snapshot.memory_fraction * 100.0,
                snapshot.load_average.one,
                snapshot.load_average.five,
                snapshot.load_average.fifteen,
            ),
            BusEvent::WorkerPoolSaturated { active, capacity } => {
                format!("worker pool saturated ({active}/{capacity})")
            }
            BusEvent::ShutdownInitiated => "shutdown initiated".to_string(),
            BusEvent::WorkersTerminating => "terminating active workers".to_string(),
            BusEvent::DatabaseClosing => "closing database".to_string(),
            BusEvent::ShutdownComplete => "shutdown complete".to_string(),
        }
    }

    /// Emit this event at its mapped tracing level. Declared as a free
    /// function (rather than using the `tracing` macros' dynamic level
    /// support directly) because `tracing::event!` requires a level known
    /// at compile time.
    fn log(&self) {
        let message = self.message();
        match self.level() {
            tracing::Level::ERROR => tracing::error!(event = ?self, "{message}"),
            tracing::Level::WARN => tracing::warn!(event = ?self, "{message}"),
            tracing::Level::INFO => tracing::info!(event = ?self, "{message}"),
            tracing::Level::DEBUG => tracing::debug!(event = ?self, "{message}"),
            tracing::Level::TRACE => tracing::trace!(event = ?self, "{message}"),
        }
    }
}

/// A logged event with its arrival time, as kept in the bus's ring buffer
/// for `dispatchd logs` and the TUI.
#[derive(Debug, Clone)]
pub struct LoggedEvent {
    pub event: BusEvent,
    pub at: DateTime<Utc>,
}

enum Command {
    Publish(BusEvent),
}

/// Handle used by producers to publish events onto the bus.
#[derive(Clone)]
pub struct EventBus {
    tx: mpsc::UnboundedSender<Command>,
    subscribe_tx: broadcast::Sender<LoggedEvent>,
}

impl EventBus {
    /// Spawn the bus's owner task and return a handle to it. `history_cap`
    /// bounds the in-memory ring buffer used by `recent`.
    pub fn spawn(history_cap: usize) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Command>();
        let (subscribe_tx, _) = broadcast::channel(1024);

        let bus_subscribe_tx = subscribe_tx.clone();
        tokio::spawn(async move {
            let mut history: std::collections::VecDeque<LoggedEvent> =
                std::collections::VecDeque::with_capacity(history_cap);

            while let Some(Command::Publish(event)) = rx.recv().await {
                event.log();
                let logged = LoggedEvent {
                    event: event.clone(),
                    at: Utc::now(),
                };
                if history.len() >= history_cap {
                    history.pop_front();
                }
                history.push_back(logged.clone());
                let _ = bus_subscribe_tx.send(logged);
            }
        });

        Self { tx, subscribe_tx }
    }

    /// Publish an event. Never blocks; the owner task processes the
    /// channel independently.
    pub fn publish(&self, event: BusEvent) {
        let _ = self.tx.send(Command::Publish(event));
    }

    /// Subscribe to the live event stream, e.g. for the TUI's event feed or
    /// `dispatchd logs --follow`.
    pub fn subscribe(&self) -> broadcast::Receiver<LoggedEvent> {
        self.subscribe_tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_reaches_subscriber() {
        let bus = EventBus::spawn(16);
        let mut rx = bus.subscribe();

        let task_id = Uuid::new_v4();
        bus.publish(BusEvent::TaskQueued { task_id });

        let logged = rx.recv().await.unwrap();
        assert_eq!(logged.event, BusEvent::TaskQueued { task_id });
    }

    #[test]
    fn error_kinds_log_at_error_level() {
        let event = BusEvent::TaskFailed {
            task_id: Uuid::new_v4(),
            error_kind: "timeout".to_string(),
            message: "agent timed out".to_string(),
        };
        assert_eq!(event.level(), tracing::Level::ERROR);
    }

    #[test]
    fn routine_kinds_log_at_info_level() {
        let event = BusEvent::TaskQueued { task_id: Uuid::new_v4() };
        assert_eq!(event.level(), tracing::Level::INFO);
    }
}
