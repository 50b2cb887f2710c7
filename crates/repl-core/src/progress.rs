//! Progress ticks for evaluations that are still running.
//!
//! One background task cycles through the configured phase labels and
//! republishes the current label to every pending eval. When nothing is
//! pending it parks until [`ProgressTicker::wake`] is called.

use crate::eval::EvalRegistry;
use crate::events::{EvalEventKind, EventBus};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::debug;

struct Phases {
    labels: Vec<String>,
    interval: Duration,
    index: usize,
}

impl Phases {
    fn current(&self) -> String {
        self.labels.get(self.index).cloned().unwrap_or_default()
    }

    fn advance(&mut self) -> String {
        if !self.labels.is_empty() {
            self.index = (self.index + 1) % self.labels.len();
        }
        self.current()
    }
}

struct Shared {
    phases: Mutex<Phases>,
    wake: Notify,
}

/// Handle to the ticker task. Dropping it stops the task.
pub struct ProgressTicker {
    shared: Arc<Shared>,
    registry: Arc<EvalRegistry>,
    events: EventBus,
    stop_tx: Option<watch::Sender<bool>>,
    task: Option<JoinHandle<()>>,
}

impl ProgressTicker {
    /// Start ticking. With one phase label or none the task is not started.
    pub fn start(
        registry: Arc<EvalRegistry>,
        events: EventBus,
        labels: Vec<String>,
        interval: Duration,
    ) -> Self {
        let mut ticker = Self {
            shared: Arc::new(Shared {
                phases: Mutex::new(Phases {
                    labels,
                    interval,
                    index: 0,
                }),
                wake: Notify::new(),
            }),
            registry,
            events,
            stop_tx: None,
            task: None,
        };
        ticker.spawn();
        ticker
    }

    fn spawn(&mut self) {
        let (interval, count) = {
            let phases = self.shared.phases.lock().expect("progress lock poisoned");
            (phases.interval, phases.labels.len())
        };
        if count <= 1 || interval.is_zero() {
            debug!("Progress ticker idle: {} phase(s)", count);
            return;
        }

        let (stop_tx, stop_rx) = watch::channel(false);
        self.stop_tx = Some(stop_tx);
        self.task = Some(tokio::spawn(Self::run(
            self.shared.clone(),
            self.registry.clone(),
            self.events.clone(),
            stop_rx,
        )));
    }

    async fn run(
        shared: Arc<Shared>,
        registry: Arc<EvalRegistry>,
        events: EventBus,
        mut stop_rx: watch::Receiver<bool>,
    ) {
        loop {
            if registry.has_pending() {
                let interval = shared.phases.lock().expect("progress lock poisoned").interval;
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = shared.wake.notified() => {}
                    _ = stop_rx.changed() => break,
                }
            } else {
                tokio::select! {
                    _ = shared.wake.notified() => {}
                    _ = stop_rx.changed() => break,
                }
            }

            let pending = registry.pending_ids();
            if pending.is_empty() {
                continue;
            }
            let phase = shared
                .phases
                .lock()
                .expect("progress lock poisoned")
                .advance();
            for id in pending {
                events.eval(
                    id,
                    EvalEventKind::Progress {
                        phase: phase.clone(),
                    },
                );
            }
        }
        debug!("Progress ticker stopped");
    }

    /// The label currently shown.
    pub fn phase(&self) -> String {
        self.shared
            .phases
            .lock()
            .expect("progress lock poisoned")
            .current()
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Show the next phase now instead of after the interval.
    pub fn wake(&self) {
        self.shared.wake.notify_one();
    }

    /// Stop the task for good.
    pub fn stop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(true);
        }
        self.task = None;
    }

    /// Swap in new labels and interval, restarting the task as needed.
    pub fn reconfigure(&mut self, labels: Vec<String>, interval: Duration) {
        self.stop();
        {
            let mut phases = self.shared.phases.lock().expect("progress lock poisoned");
            phases.labels = labels;
            phases.interval = interval;
            phases.index = 0;
        }
        self.spawn();
    }
}

impl Drop for ProgressTicker {
    fn drop(&mut self) {
        self.stop();
    }
}
