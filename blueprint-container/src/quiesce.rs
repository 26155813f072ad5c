//! Quiescing: draining exported services before shutdown.
//!
//! For every unit (typically a container) the coordinator unregisters each
//! registered service and waits until every consumer that acquired one has
//! released it. The unit's callback then fires exactly once.
//!
//! # Worker pool
//! ```text
//! quiesce(units) ──spawn_blocking──> blocking thread 1 ┐
//!                               └──> blocking thread n ┴─> unit callback
//! ```
//! Units are drained on the blocking pool of a dedicated tokio runtime.
//! The runtime is built on first use, so an idle coordinator owns no
//! threads; threads are capped at `max_threads` and exit after
//! `keep_alive_ms` without work.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use once_cell::sync::OnceCell;
use parking_lot::{Condvar, Mutex};
use tokio::runtime::{Builder, Runtime};
use tracing::{debug, info, warn};

use crate::recipe::ServiceRecipe;
use crate::settings::{QuiesceSettings, RejectionPolicy};

/// Notified once per unit when all of its services are drained.
pub trait QuiesceCallback: Send + Sync {
    fn quiesced(&self, unit: &str);
}

impl<F> QuiesceCallback for F
where
    F: Fn(&str) + Send + Sync,
{
    fn quiesced(&self, unit: &str) {
        self(unit)
    }
}

/// Something that exports services and can be quiesced.
pub trait QuiesceUnit: Send + Sync {
    fn name(&self) -> &str;

    fn service_recipes(&self) -> Vec<Arc<ServiceRecipe>>;
}

// ═══════════════════════════════════════════
// QuiesceHandle
// ═══════════════════════════════════════════

struct Completion {
    remaining: Mutex<usize>,
    done: Condvar,
    notify: tokio::sync::watch::Sender<bool>,
}

/// Completion of one [`QuiesceCoordinator::quiesce`] call.
#[derive(Clone)]
pub struct QuiesceHandle {
    inner: Arc<Completion>,
}

impl QuiesceHandle {
    fn new(units: usize) -> Self {
        Self {
            inner: Arc::new(Completion {
                remaining: Mutex::new(units),
                done: Condvar::new(),
                notify: tokio::sync::watch::Sender::new(units == 0),
            }),
        }
    }

    fn unit_done(&self) {
        let mut remaining = self.inner.remaining.lock();
        *remaining = remaining.saturating_sub(1);
        if *remaining == 0 {
            self.inner.done.notify_all();
            self.inner.notify.send_replace(true);
        }
    }

    /// Returns `true` once every unit has reported.
    pub fn is_done(&self) -> bool {
        *self.inner.remaining.lock() == 0
    }

    /// Block until done or `timeout` elapses. Returns [`is_done`](Self::is_done).
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut remaining = self.inner.remaining.lock();
        while *remaining > 0 {
            if self.inner.done.wait_until(&mut remaining, deadline).timed_out() {
                break;
            }
        }
        *remaining == 0
    }

    /// Wait asynchronously for every unit to report.
    pub async fn completed(&self) {
        let mut receiver = self.inner.notify.subscribe();
        // The sender lives in `self`, so the channel cannot close here.
        let _ = receiver.wait_for(|done| *done).await;
    }
}

impl std::fmt::Debug for QuiesceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuiesceHandle")
            .field("remaining", &*self.inner.remaining.lock())
            .finish()
    }
}

// ═══════════════════════════════════════════
// QuiesceCoordinator
// ═══════════════════════════════════════════

/// Tokens of one unit; fires the callback when the last one is released.
struct UnitProgress {
    unit: String,
    tokens: Mutex<HashSet<u64>>,
    fired: AtomicBool,
    callback: Arc<dyn QuiesceCallback>,
    handle: QuiesceHandle,
}

impl UnitProgress {
    fn release(&self, token: u64) {
        let empty = {
            let mut tokens = self.tokens.lock();
            tokens.remove(&token);
            tokens.is_empty()
        };
        if empty {
            self.finish();
        }
    }

    fn finish(&self) {
        if self.fired.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(unit = %self.unit, "Unit quiesced");
        self.callback.quiesced(&self.unit);
        self.handle.unit_done();
    }
}

fn quiesce_unit(unit: Arc<dyn QuiesceUnit>, callback: Arc<dyn QuiesceCallback>, handle: QuiesceHandle) {
    let services: Vec<(u64, Arc<ServiceRecipe>)> = unit
        .service_recipes()
        .into_iter()
        .filter_map(|service| service.registration().map(|r| (r.id(), service)))
        .collect();

    let progress = Arc::new(UnitProgress {
        unit: unit.name().to_string(),
        tokens: Mutex::new(services.iter().map(|(id, _)| *id).collect()),
        fired: AtomicBool::new(false),
        callback,
        handle,
    });

    if services.is_empty() {
        debug!(unit = %progress.unit, "Nothing to quiesce");
        progress.finish();
        return;
    }

    debug!(unit = %progress.unit, services = services.len(), "Quiescing services");
    for (token, service) in services {
        let progress = Arc::clone(&progress);
        service.quiesce(move || progress.release(token));
    }
}

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Drains the services of units on a blocking thread pool.
pub struct QuiesceCoordinator {
    settings: QuiesceSettings,
    runtime: OnceCell<Runtime>,
    shutdown: AtomicBool,
}

impl QuiesceCoordinator {
    pub fn new(settings: QuiesceSettings) -> Self {
        Self {
            settings,
            runtime: OnceCell::new(),
            shutdown: AtomicBool::new(false),
        }
    }

    pub fn settings(&self) -> &QuiesceSettings {
        &self.settings
    }

    /// Quiesce every unit; `callback` fires once per unit.
    pub fn quiesce(
        &self,
        callback: Arc<dyn QuiesceCallback>,
        units: Vec<Arc<dyn QuiesceUnit>>,
    ) -> QuiesceHandle {
        let handle = QuiesceHandle::new(units.len());

        for unit in units {
            let name = unit.name().to_string();
            let job: Job = {
                let callback = Arc::clone(&callback);
                let handle = handle.clone();
                Box::new(move || quiesce_unit(unit, callback, handle))
            };

            if let Err(job) = self.submit(job) {
                match self.settings.rejection {
                    RejectionPolicy::Discard => {
                        warn!(unit = %name, "Quiesce request rejected, discarding");
                    }
                    RejectionPolicy::CallerRuns => {
                        debug!(unit = %name, "Quiesce request rejected, running on caller");
                        job();
                    }
                }
            }
        }
        handle
    }

    /// Hand `job` to the blocking pool, or back to the caller if refused.
    fn submit(&self, job: Job) -> std::result::Result<(), Job> {
        if self.is_shutdown() {
            return Err(job);
        }
        match self.runtime.get_or_try_init(|| self.build_runtime()) {
            Ok(runtime) => {
                // Panics stay inside the detached task.
                drop(runtime.spawn_blocking(job));
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "Could not start the quiesce thread pool");
                Err(job)
            }
        }
    }

    fn build_runtime(&self) -> std::io::Result<Runtime> {
        Builder::new_current_thread()
            .thread_name("blueprint-quiesce")
            .max_blocking_threads(self.settings.thread_cap())
            .thread_keep_alive(self.settings.keep_alive())
            .build()
    }

    /// Stop accepting new quiesce work. Work already handed over still runs.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }
}

impl Default for QuiesceCoordinator {
    fn default() -> Self {
        Self::new(QuiesceSettings::default())
    }
}

impl Drop for QuiesceCoordinator {
    fn drop(&mut self) {
        self.shutdown();
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

impl std::fmt::Debug for QuiesceCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuiesceCoordinator")
            .field("settings", &self.settings)
            .field("started", &self.runtime.get().is_some())
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}
