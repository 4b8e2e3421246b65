//! Host resource monitoring used to throttle worker pool admission.
//!
//! Polls system-wide CPU, memory, and load-average via `sysinfo` on a
//! background interval and exposes the latest snapshot through a `watch`
//! channel, so the worker pool can cheaply check "do we have headroom to
//! start another agent" without a fresh sample on every admission
//! decision. Each poll also publishes `SystemResourcesUpdated` on the
//! event bus for the TUI and `dispatchd logs` to observe.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use sysinfo::System;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::events::{BusEvent, EventBus};

/// One-, five-, and fifteen-minute load averages as reported by the OS.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoadAverage {
    pub one: f64,
    pub five: f64,
    pub fifteen: f64,
}

/// A point-in-time resource snapshot.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResourceSnapshot {
    /// CPU utilization derived from the one-minute load average:
    /// `load_average.one / logical_cpus * 100`.
    pub cpu_percent: f32,
    /// Fraction of physical memory in use, 0.0-1.0.
    pub memory_fraction: f64,
    /// Number of logical CPUs detected at startup.
    pub logical_cpus: usize,
    /// Host load-average triple.
    pub load_average: LoadAverage,
}

impl ResourceSnapshot {
    fn sample(sys: &System) -> Self {
        let total = sys.total_memory().max(1);
        let used = sys.used_memory();
        let logical_cpus = num_cpus::get();
        let load = System::load_average();
        let cpu_percent = if logical_cpus > 0 {
            (load.one / logical_cpus as f64 * 100.0) as f32
        } else {
            sys.global_cpu_usage()
        };
        ResourceSnapshot {
            cpu_percent,
            memory_fraction: used as f64 / total as f64,
            logical_cpus,
            load_average: LoadAverage { one: load.one, five: load.five, fifteen: load.fifteen },
        }
    }
}

/// Thresholds above which the worker pool should stop admitting new tasks.
#[derive(Debug, Clone, Copy)]
pub struct ResourceLimits {
    pub max_cpu_percent: f32,
    pub max_memory_fraction: f64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_cpu_percent: 90.0,
            max_memory_fraction: 0.90,
        }
    }
}

impl ResourceSnapshot {
    pub fn within(&self, limits: &ResourceLimits) -> bool {
        self.cpu_percent <= limits.max_cpu_percent
            && self.memory_fraction <= limits.max_memory_fraction
            && self.load_average.one < 3.0 * self.logical_cpus as f64
    }
}

/// Background poller that keeps a [`ResourceSnapshot`] fresh.
pub struct ResourceMonitor {
    rx: watch::Receiver<ResourceSnapshot>,
    worker_count: Arc<AtomicUsize>,
    handle: JoinHandle<()>,
}

impl ResourceMonitor {
    /// Spawn the polling task. `interval` controls how often `sysinfo`
    /// refreshes its counters; a faster interval gives more responsive
    /// admission decisions at the cost of more syscalls. Each tick
    /// publishes `SystemResourcesUpdated` on `events`.
    pub fn spawn(interval: Duration, events: EventBus) -> Self {
        let mut sys = System::new_all();
        sys.refresh_cpu_usage();
        sys.refresh_memory();
        let initial = ResourceSnapshot::sample(&sys);

        let (tx, rx) = watch::channel(initial);
        let worker_count = Arc::new(AtomicUsize::new(0));
        let poller_worker_count = Arc::clone(&worker_count);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                sys.refresh_cpu_usage();
                sys.refresh_memory();
                let snapshot = ResourceSnapshot::sample(&sys);
                events.publish(BusEvent::SystemResourcesUpdated {
                    snapshot,
                    worker_count: poller_worker_count.load(Ordering::Relaxed),
                });
                if tx.send(snapshot).is_err() {
                    break;
                }
            }
        });

        Self { rx, worker_count, handle }
    }

    pub fn latest(&self) -> ResourceSnapshot {
        *self.rx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ResourceSnapshot> {
        self.rx.clone()
    }

    /// Record that a worker started, so the next poll's
    /// `SystemResourcesUpdated` reports an accurate count.
    pub fn record_worker_started(&self) {
        self.worker_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Record that a worker finished.
    pub fn record_worker_stopped(&self) {
        self.worker_count.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count.load(Ordering::Relaxed)
    }
}

impl Drop for ResourceMonitor {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
