//! Named worker runtimes
//!
//! Every network owns its thread group: a multi-threaded tokio runtime whose
//! threads are named `{group}-{n}`. Servers additionally own a scheduled
//! group for timer work.

use parking_lot::Mutex;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::{Builder, Handle, Runtime};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::error::{NetworkError, Result};

/// A named pool of runtime threads
pub struct ThreadGroup {
    name: String,
    handle: Handle,
    runtime: Mutex<Option<Runtime>>,
}

impl ThreadGroup {
    /// Fixed group of `size` worker threads
    pub fn fixed(name: impl Into<String>, size: usize) -> Result<Self> {
        Self::elastic(name, size, size)
    }

    /// `min` async worker threads.
    ///
    /// Tokio does not grow its worker pool, so `max` only caps the blocking
    /// pool at `max - min` threads (at least one). Nothing in this crate
    /// spawns blocking work; the headroom is for handlers that call
    /// `tokio::task::spawn_blocking`.
    pub fn elastic(name: impl Into<String>, min: usize, max: usize) -> Result<Self> {
        let name = name.into();
        if min == 0 || max < min {
            return Err(NetworkError::config(format!(
                "thread group {} needs 0 < min <= max, got {}..={}",
                name, min, max
            )));
        }

        let counter = Arc::new(AtomicUsize::new(1));
        let prefix = name.clone();
        let runtime = Builder::new_multi_thread()
            .worker_threads(min)
            .max_blocking_threads((max - min).max(1))
            .thread_name_fn(move || {
                format!("{}-{}", prefix, counter.fetch_add(1, Ordering::Relaxed))
            })
            .enable_all()
            .build()
            .map_err(|e| NetworkError::config(format!("failed to start thread group {}: {}", name, e)))?;

        tracing::debug!("thread group {} started with {} workers", name, min);
        Ok(Self {
            name,
            handle: runtime.handle().clone(),
            runtime: Mutex::new(Some(runtime)),
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Handle for spawning onto the group
    #[must_use]
    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Check if the group still runs
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.runtime.lock().is_some()
    }

    /// Run a future on the group
    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.handle.spawn(future)
    }

    /// Block the calling thread on `future`.
    ///
    /// # Panics
    ///
    /// Panics when called from within an async context.
    pub fn block_on<F: Future>(&self, future: F) -> F::Output {
        self.handle.block_on(future)
    }

    /// Stop the group without waiting for its tasks. Idempotent.
    pub fn shutdown(&self) {
        if let Some(runtime) = self.runtime.lock().take() {
            runtime.shutdown_background();
            tracing::debug!("thread group {} stopped", self.name);
        }
    }
}

impl Drop for ThreadGroup {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for ThreadGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadGroup")
            .field("name", &self.name)
            .field("running", &self.is_running())
            .finish()
    }
}

/// Timer work on a dedicated thread group
#[derive(Debug)]
pub struct Scheduler {
    group: ThreadGroup,
}

impl Scheduler {
    pub fn new(name: impl Into<String>, size: usize) -> Result<Self> {
        Ok(Self {
            group: ThreadGroup::fixed(name, size)?,
        })
    }

    /// Run `task` once after `delay`
    pub fn schedule<F>(&self, delay: Duration, task: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.group.spawn(async move {
            tokio::time::sleep(delay).await;
            task.await;
        })
    }

    /// Run `task` every `period`, first after `initial_delay`.
    ///
    /// Runs that fall behind are caught up so the average rate holds. Abort
    /// the returned handle to stop.
    pub fn schedule_at_fixed_rate<F, Fut>(
        &self,
        initial_delay: Duration,
        period: Duration,
        mut task: F,
    ) -> JoinHandle<()>
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.group.spawn(async move {
            let mut ticks = tokio::time::interval_at(Instant::now() + initial_delay, period);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Burst);
            loop {
                ticks.tick().await;
                task().await;
            }
        })
    }

    pub fn shutdown(&self) {
        self.group.shutdown();
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.group.is_running()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_threads_carry_group_name() {
        let group = ThreadGroup::fixed("unit-group", 2).unwrap();
        let name = group.block_on(async {
            tokio::spawn(async { std::thread::current().name().map(str::to_owned) })
                .await
                .unwrap()
        });
        assert!(name.unwrap().starts_with("unit-group-"));
    }

    #[test]
    fn test_invalid_sizes_are_rejected() {
        assert!(ThreadGroup::fixed("empty", 0).is_err());
        assert!(ThreadGroup::elastic("inverted", 4, 2).is_err());
    }

    #[test]
    fn test_elastic_headroom_caps_blocking_pool() {
        let group = ThreadGroup::elastic("unit-elastic", 1, 3).unwrap();
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        group.block_on(async {
            let tasks: Vec<_> = (0..3)
                .map(|_| {
                    let active = Arc::clone(&active);
                    let peak = Arc::clone(&peak);
                    tokio::task::spawn_blocking(move || {
                        let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        std::thread::sleep(Duration::from_millis(100));
                        active.fetch_sub(1, Ordering::SeqCst);
                    })
                })
                .collect();
            for task in tasks {
                task.await.unwrap();
            }
        });

        // three blocking jobs, two blocking threads
        assert_eq!(peak.load(Ordering::SeqCst), 2);
        group.shutdown();
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let group = ThreadGroup::fixed("stopping", 1).unwrap();
        assert!(group.is_running());
        group.shutdown();
        group.shutdown();
        assert!(!group.is_running());
    }

    #[test]
    fn test_fixed_rate_task_repeats_until_aborted() {
        let scheduler = Scheduler::new("unit-scheduled", 1).unwrap();
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        let task = scheduler.schedule_at_fixed_rate(
            Duration::from_millis(1),
            Duration::from_millis(5),
            move || {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            },
        );

        std::thread::sleep(Duration::from_millis(200));
        task.abort();
        assert!(runs.load(Ordering::SeqCst) >= 3);
        scheduler.shutdown();
    }

    #[test]
    fn test_delayed_task_runs_once() {
        let scheduler = Scheduler::new("unit-delayed", 1).unwrap();
        let (tx, rx) = std::sync::mpsc::channel();
        scheduler.schedule(Duration::from_millis(10), async move {
            let _ = tx.send(());
        });
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
    }
}
