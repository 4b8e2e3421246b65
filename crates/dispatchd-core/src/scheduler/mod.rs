//! Materializes cron and one-shot schedules into queued tasks.
//!
//! Holds active schedules in memory and wakes on a periodic tick to find
//! everything whose `next_run_at` has passed, enqueueing a task per slot
//! (subject to the configured missed-run policy) and computing the next
//! slot. The store is the durable record; this module is a cache plus a
//! clock.

pub mod cron;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use dispatchd_db::models::{MissedRunPolicy, ScheduleKind, ScheduleStatus};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::events::{BusEvent, EventBus};

pub use cron::{CronError, CronSchedule};

/// Upper bound on how many missed slots a `catchup` schedule will emit in
/// a single tick, to prevent an enqueue storm after a long downtime.
pub const DEFAULT_MAX_CATCHUP_RUNS: usize = 100;

#[derive(Debug, Clone, Copy)]
pub struct SchedulerConfig {
    pub tick_interval: Duration,
    pub max_catchup_runs: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(30),
            max_catchup_runs: DEFAULT_MAX_CATCHUP_RUNS,
        }
    }
}

/// An active schedule as the scheduler tracks it between ticks. A thin
/// projection of the `schedules` row: just enough to decide whether and
/// what to fire.
#[derive(Debug, Clone)]
pub struct ScheduleState {
    pub id: Uuid,
    pub kind: ScheduleKind,
    pub cron_expr: Option<String>,
    pub run_at: Option<DateTime<Utc>>,
    pub timezone: Tz,
    pub missed_run_policy: MissedRunPolicy,
    pub status: ScheduleStatus,
    pub run_count: i64,
    pub max_runs: Option<i64>,
    pub expires_at: Option<DateTime<Utc>>,
    pub after_schedule_id: Option<Uuid>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub next_run_at: Option<DateTime<Utc>>,
}

/// One slot this tick decided to fire, or skip with a reason.
#[derive(Debug, Clone)]
pub enum FireDecision {
    Enqueue { schedule_id: Uuid, slot: DateTime<Utc> },
    Deferred { schedule_id: Uuid },
    Failed { schedule_id: Uuid },
    Completed { schedule_id: Uuid },
}

/// Whether `schedule.after_schedule_id`'s most recent task has settled.
/// Injected so the scheduler doesn't depend on the store directly;
/// callers supply it from their own task-status lookup.
pub type DependencyCheck = Arc<dyn Fn(Uuid) -> bool + Send + Sync>;

/// Evaluate every active schedule against `now` and decide what to fire.
/// Pure with respect to the schedule list passed in; mutates each
/// schedule's `run_count`/`last_run_at`/`next_run_at`/`status` in place
/// and returns the decisions the caller should persist and act on.
pub fn tick(
    schedules: &mut [ScheduleState],
    now: DateTime<Utc>,
    max_catchup_runs: usize,
    dependency_ready: &DependencyCheck,
) -> Vec<FireDecision> {
    let mut decisions = Vec::new();

    for schedule in schedules.iter_mut() {
        if schedule.status != ScheduleStatus::Active {
            continue;
        }
        let Some(next_run_at) = schedule.next_run_at else {
            continue;
        };
        if next_run_at > now {
            continue;
        }

        if let Some(after_id) = schedule.after_schedule_id {
            if !dependency_ready(after_id) {
                decisions.push(FireDecision::Deferred { schedule_id: schedule.id });
                continue;
            }
        }

        match schedule.kind {
            ScheduleKind::OneTime => {
                decisions.push(FireDecision::Enqueue { schedule_id: schedule.id, slot: next_run_at });
                schedule.run_count += 1;
                schedule.last_run_at = Some(next_run_at);
                schedule.next_run_at = None;
                schedule.status = ScheduleStatus::Completed;
                decisions.push(FireDecision::Completed { schedule_id: schedule.id });
            }
            ScheduleKind::Cron => {
                fire_cron_schedule(schedule, now, max_catchup_runs, &mut decisions);
            }
        }

        if let Some(max_runs) = schedule.max_runs {
            if schedule.run_count >= max_runs && schedule.status == ScheduleStatus::Active {
                schedule.status = ScheduleStatus::Expired;
            }
        }
        if let Some(expires_at) = schedule.expires_at {
            if now >= expires_at && schedule.status == ScheduleStatus::Active {
                schedule.status = ScheduleStatus::Expired;
            }
        }
    }

    decisions
}

fn fire_cron_schedule(
    schedule: &mut ScheduleState,
    now: DateTime<Utc>,
    max_catchup_runs: usize,
    decisions: &mut Vec<FireDecision>,
) {
    let Some(expr) = schedule.cron_expr.as_deref() else {
        warn!(schedule_id = %schedule.id, "cron schedule missing expression, disabling");
        schedule.status = ScheduleStatus::Expired;
        return;
    };
    let cron = match CronSchedule::parse(expr) {
        Ok(c) => c,
        Err(e) => {
            warn!(schedule_id = %schedule.id, error = %e, "invalid cron expression, disabling");
            schedule.status = ScheduleStatus::Expired;
            return;
        }
    };

    let missed_slots = cron.slots_between(schedule.next_run_at.unwrap(), now, schedule.timezone);

    match schedule.missed_run_policy {
        MissedRunPolicy::Skip => {
            if let Some(&last_due) = missed_slots.last() {
                decisions.push(FireDecision::Enqueue { schedule_id: schedule.id, slot: last_due });
                schedule.run_count += 1;
                schedule.last_run_at = Some(last_due);
            }
            schedule.next_run_at = cron.next_after(now, schedule.timezone);
        }
        MissedRunPolicy::Catchup => {
            let truncated = missed_slots.len() > max_catchup_runs;
            let to_fire = if truncated {
                warn!(
                    schedule_id = %schedule.id,
                    missed = missed_slots.len(),
                    cap = max_catchup_runs,
                    "catchup cap reached, dropping remainder of missed slots"
                );
                &missed_slots[missed_slots.len() - max_catchup_runs..]
            } else {
                &missed_slots[..]
            };
            for &slot in to_fire {
                decisions.push(FireDecision::Enqueue { schedule_id: schedule.id, slot });
                schedule.run_count += 1;
                schedule.last_run_at = Some(slot);
            }
            schedule.next_run_at = cron.next_after(now, schedule.timezone);
        }
        MissedRunPolicy::Fail => {
            if !missed_slots.is_empty() {
                schedule.status = ScheduleStatus::Failed;
                decisions.push(FireDecision::Failed { schedule_id: schedule.id });
            } else {
                schedule.next_run_at = cron.next_after(now, schedule.timezone);
            }
        }
    }
}

/// Owns the periodic tick loop. Schedule state lives behind a mutex so
/// operator commands (`schedule pause`, `schedule cancel`) can mutate it
/// between ticks without a channel round trip.
pub struct Scheduler {
    state: Arc<Mutex<HashMap<Uuid, ScheduleState>>>,
    handle: Option<JoinHandle<()>>,
    stop_tx: watch::Sender<bool>,
}

impl Scheduler {
    pub fn spawn(
        config: SchedulerConfig,
        events: EventBus,
        dependency_ready: DependencyCheck,
        on_fire: Arc<dyn Fn(FireDecision) + Send + Sync>,
    ) -> Self {
        let state: Arc<Mutex<HashMap<Uuid, ScheduleState>>> = Arc::new(Mutex::new(HashMap::new()));
        let (stop_tx, mut stop_rx) = watch::channel(false);

        let loop_state = Arc::clone(&state);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(config.tick_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = stop_rx.changed() => {
                        if *stop_rx.borrow() {
                            info!("scheduler tick loop stopping");
                            break;
                        }
                    }
                }

                let mut guard = loop_state.lock().await;
                let mut schedules: Vec<ScheduleState> = guard.values().cloned().collect();
                let now = Utc::now();
                let decisions = tick(&mut schedules, now, config.max_catchup_runs, &dependency_ready);

                for schedule in schedules {
                    guard.insert(schedule.id, schedule);
                }
                drop(guard);

                for decision in decisions {
                    match &decision {
                        FireDecision::Enqueue { schedule_id, .. } => {
                            debug!(schedule_id = %schedule_id, "schedule fired");
                        }
                        FireDecision::Failed { schedule_id } => {
                            events.publish(BusEvent::ScheduleExhausted { schedule_id: *schedule_id });
                        }
                        FireDecision::Deferred { .. } | FireDecision::Completed { .. } => {}
                    }
                    on_fire(decision);
                }
            }
        });

        Self { state, handle: Some(handle), stop_tx }
    }

    pub async fn register(&self, schedule: ScheduleState) {
        self.state.lock().await.insert(schedule.id, schedule);
    }

    pub async fn remove(&self, schedule_id: Uuid) {
        self.state.lock().await.remove(&schedule_id);
    }

    pub async fn set_status(&self, schedule_id: Uuid, status: ScheduleStatus) -> bool {
        let mut guard = self.state.lock().await;
        if let Some(schedule) = guard.get_mut(&schedule_id) {
            schedule.status = status;
            true
        } else {
            false
        }
    }

    /// Stop the tick loop. Called before the worker pool shuts down so
    /// no new task gets enqueued against a supervisor that's tearing
    /// down.
    pub async fn stop(&mut self) {
        let _ = self.stop_tx.send(true);
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn base_schedule(kind: ScheduleKind) -> ScheduleState {
        ScheduleState {
            id: Uuid::new_v4(),
            kind,
            cron_expr: None,
            run_at: None,
            timezone: chrono_tz::UTC,
            missed_run_policy: MissedRunPolicy::Skip,
            status: ScheduleStatus::Active,
            run_count: 0,
            max_runs: None,
            expires_at: None,
            after_schedule_id: None,
            last_run_at: None,
            next_run_at: Some(Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()),
        }
    }

    fn no_deps() -> DependencyCheck {
        Arc::new(|_| true)
    }

    #[test]
    fn one_shot_fires_once_and_completes() {
        let mut schedule = base_schedule(ScheduleKind::OneTime);
        let id = schedule.id;
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 0, 5, 0).unwrap();

        let decisions = tick(std::slice::from_mut(&mut schedule), now, 100, &no_deps());

        assert!(matches!(&decisions[0], FireDecision::Enqueue { schedule_id, .. } if *schedule_id == id));
        assert_eq!(schedule.status, ScheduleStatus::Completed);
        assert_eq!(schedule.run_count, 1);
        assert!(schedule.next_run_at.is_none());
    }

    #[test]
    fn deferred_schedule_waits_on_dependency() {
        let mut schedule = base_schedule(ScheduleKind::OneTime);
        schedule.after_schedule_id = Some(Uuid::new_v4());
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 0, 5, 0).unwrap();

        let never_ready: DependencyCheck = Arc::new(|_| false);
        let decisions = tick(std::slice::from_mut(&mut schedule), now, 100, &never_ready);

        assert!(matches!(decisions[0], FireDecision::Deferred { .. }));
        assert_eq!(schedule.status, ScheduleStatus::Active);
        assert_eq!(schedule.run_count, 0);
    }

    #[test]
    fn cron_skip_policy_advances_without_backfilling() {
        let mut schedule = base_schedule(ScheduleKind::Cron);
        schedule.cron_expr = Some("*/5 * * * *".to_string());
        schedule.missed_run_policy = MissedRunPolicy::Skip;
        schedule.next_run_at = Some(Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap());
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 1, 0, 0).unwrap();

        let decisions = tick(std::slice::from_mut(&mut schedule), now, 100, &no_deps());

        let enqueued: Vec<_> = decisions
            .iter()
            .filter(|d| matches!(d, FireDecision::Enqueue { .. }))
            .collect();
        assert_eq!(enqueued.len(), 1);
        assert!(schedule.next_run_at.unwrap() > now);
    }

    #[test]
    fn cron_fail_policy_cancels_on_missed_slot() {
        let mut schedule = base_schedule(ScheduleKind::Cron);
        schedule.cron_expr = Some("*/5 * * * *".to_string());
        schedule.missed_run_policy = MissedRunPolicy::Fail;
        schedule.next_run_at = Some(Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap());
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 0, 10, 0).unwrap();

        let decisions = tick(std::slice::from_mut(&mut schedule), now, 100, &no_deps());

        assert!(matches!(decisions[0], FireDecision::Failed { .. }));
        assert_eq!(schedule.status, ScheduleStatus::Failed);
    }

    #[test]
    fn max_runs_expires_schedule() {
        let mut schedule = base_schedule(ScheduleKind::OneTime);
        schedule.max_runs = Some(1);
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 0, 5, 0).unwrap();

        tick(std::slice::from_mut(&mut schedule), now, 100, &no_deps());

        assert_eq!(schedule.status, ScheduleStatus::Expired);
    }
}
