//! Debounced sync trigger scheduler.
//!
//! Every place that wants a sync (visibility, focus, coming back online,
//! the periodic timer) funnels through one debounced entry point, so no
//! mutation site has to wire sync calls itself. Triggers inside the
//! debounce window collapse into a single pending deferred pass; a manual
//! request bypasses the debounce but still hits the engine's
//! single-flight lock.
//!
//! Every background pass runs under a central timeout. The pass itself
//! runs on a detached task, so a timeout abandons the wait, never the
//! work: the engine still finishes the pass (restoring its queue on
//! failure) and releases its lock, while the caller gets a "taking too
//! long" result.

use async_trait::async_trait;
use logbook_core::storage::CacheStorage;
use logbook_core::sync::SyncOutcome;
use logbook_core::sync_engine::SyncEngine;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub const DEFAULT_DEBOUNCE: Duration = Duration::from_secs(5);
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(12);
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(300);

/// What asked for the sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncTrigger {
    VisibilityActive,
    Focus,
    Online,
    Interval,
    Manual,
}

impl SyncTrigger {
    fn bypasses_debounce(&self) -> bool {
        matches!(self, SyncTrigger::Manual)
    }
}

/// Result of requesting a sync through the scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncRequest {
    /// The pass ran (or was suppressed by the engine lock) within the
    /// timeout.
    Ran(SyncOutcome),
    /// Collapsed into the single pending deferred pass.
    Deferred,
    /// The pass exceeded the central timeout; it was abandoned and the
    /// next trigger can retry.
    TimedOut,
}

/// The thing the scheduler invokes. Separated from `SyncEngine` so the
/// debounce behavior can be tested against a counting double.
#[async_trait]
pub trait SyncRunner: Send + Sync {
    async fn run_sync(&self) -> SyncOutcome;
}

#[async_trait]
impl<S: CacheStorage + 'static> SyncRunner for SyncEngine<S> {
    async fn run_sync(&self) -> SyncOutcome {
        self.sync().await
    }
}

struct SchedulerState {
    last_sync: Option<Instant>,
    /// The single pending deferred pass, if one is armed.
    deferred: Option<JoinHandle<()>>,
}

pub struct SyncScheduler<R: SyncRunner + 'static> {
    runner: Arc<R>,
    debounce: Duration,
    timeout: Duration,
    state: Arc<Mutex<SchedulerState>>,
}

impl<R: SyncRunner + 'static> SyncScheduler<R> {
    pub fn new(runner: Arc<R>, debounce: Duration, timeout: Duration) -> Self {
        Self {
            runner,
            debounce,
            timeout,
            state: Arc::new(Mutex::new(SchedulerState {
                last_sync: None,
                deferred: None,
            })),
        }
    }

    /// Request a sync pass for `trigger`.
    ///
    /// Outside the debounce window the pass runs inline. Inside it, the
    /// request arms (or collapses into) the one pending deferred pass.
    pub async fn request(&self, trigger: SyncTrigger) -> SyncRequest {
        if trigger.bypasses_debounce() {
            debug!("Manual sync requested");
            self.mark_synced().await;
            return self.run_with_timeout().await;
        }

        let remaining = {
            let mut state = self.state.lock().await;
            let now = Instant::now();
            match state.last_sync {
                Some(at) if now.duration_since(at) < self.debounce => {
                    let remaining = self.debounce - now.duration_since(at);
                    if state.deferred.as_ref().is_some_and(|h| !h.is_finished()) {
                        debug!("{:?} trigger collapsed into pending pass", trigger);
                        return SyncRequest::Deferred;
                    }
                    Some(remaining)
                }
                _ => {
                    state.last_sync = Some(now);
                    None
                }
            }
        };

        match remaining {
            None => {
                debug!("{:?} trigger runs immediately", trigger);
                self.run_with_timeout().await
            }
            Some(delay) => {
                debug!("{:?} trigger deferred for {:?}", trigger, delay);
                self.arm_deferred(delay).await;
                SyncRequest::Deferred
            }
        }
    }

    async fn arm_deferred(&self, delay: Duration) {
        let runner = Arc::clone(&self.runner);
        let state = Arc::clone(&self.state);
        let timeout = self.timeout;

        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            {
                let mut state = state.lock().await;
                state.last_sync = Some(Instant::now());
                state.deferred = None;
            }
            let pass = tokio::spawn(async move { runner.run_sync().await });
            match tokio::time::timeout(timeout, pass).await {
                Ok(Ok(outcome)) => debug!("Deferred sync pass finished: {:?}", outcome),
                Ok(Err(e)) => warn!("Deferred sync pass task failed: {}", e),
                Err(_) => warn!(
                    "Deferred sync pass exceeded {:?}; leaving it to finish in the background",
                    timeout
                ),
            }
        });

        self.state.lock().await.deferred = Some(handle);
    }

    async fn mark_synced(&self) {
        self.state.lock().await.last_sync = Some(Instant::now());
    }

    async fn run_with_timeout(&self) -> SyncRequest {
        // The pass must not be cancelled mid-flight: it has drained the
        // change queue and owes it a restore on failure. Detach it and
        // time out only the wait.
        let runner = Arc::clone(&self.runner);
        let pass = tokio::spawn(async move { runner.run_sync().await });
        match tokio::time::timeout(self.timeout, pass).await {
            Ok(Ok(outcome)) => SyncRequest::Ran(outcome),
            Ok(Err(e)) => {
                warn!("Sync pass task failed: {}", e);
                SyncRequest::TimedOut
            }
            Err(_) => {
                warn!(
                    "Sync pass is taking longer than {:?}; leaving it to finish in the background",
                    self.timeout
                );
                SyncRequest::TimedOut
            }
        }
    }

    /// Periodic trigger loop, gated so a hidden or offline app stays
    /// quiet. Runs until the handle is aborted.
    pub fn start_periodic(
        self: Arc<Self>,
        interval: Duration,
        visible: Arc<AtomicBool>,
        online: Arc<AtomicBool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await; // the first tick is immediate
            loop {
                ticker.tick().await;
                if !visible.load(Ordering::SeqCst) || !online.load(Ordering::SeqCst) {
                    debug!("Skipping periodic sync (hidden or offline)");
                    continue;
                }
                info!("Periodic sync trigger");
                self.request(SyncTrigger::Interval).await;
            }
        })
    }
}
