//! Reconciliation housekeeper — periodic replay of events past a watermark
//!
//! Transport delivery alone is not enough when a subscriber was down or the
//! broker lost a connection mid-flight. Each publishing service appends its
//! events to an [`EventStore`](crate::store::EventStore); the housekeeper
//! periodically replays, per registered subscriber, every stored event past
//! that subscriber's marker straight into its listener, bypassing the
//! transport, and advances the marker only once the whole batch is
//! confirmed. Listeners are idempotent, so overlap with live delivery is
//! safe.

use crate::config::HousekeeperConfig;
use crate::context::EventScope;
use crate::error::Result;
use crate::listener::EventListener;
use crate::store::EventStore;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

/// One subscriber's interest in one publishing service's event stream
#[derive(Clone)]
pub struct Registration {
    /// Publishing service whose events are replayed (e.g. "account")
    pub service: String,

    /// Subscriber name the marker is tracked for
    pub subscriber: String,

    /// The subscriber's handling path, invoked directly during replay
    pub listener: Arc<dyn EventListener>,
}

impl Registration {
    pub fn new(
        service: impl Into<String>,
        subscriber: impl Into<String>,
        listener: Arc<dyn EventListener>,
    ) -> Self {
        Self {
            service: service.into(),
            subscriber: subscriber.into(),
            listener,
        }
    }

    /// Marker key, unique per (subscriber, service) pair
    fn marker_key(&self) -> String {
        format!("{}:{}", self.subscriber, self.service)
    }
}

/// Periodic reconciliation task over an event store
pub struct Housekeeper {
    store: Arc<dyn EventStore>,
    config: HousekeeperConfig,
    registrations: Mutex<Vec<Registration>>,
    run_in_progress: Arc<AtomicBool>,
    shutdown_tx: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Housekeeper {
    pub fn new(store: Arc<dyn EventStore>, config: HousekeeperConfig) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            store,
            config,
            registrations: Mutex::new(Vec::new()),
            run_in_progress: Arc::new(AtomicBool::new(false)),
            shutdown_tx,
            task: Mutex::new(None),
        }
    }

    /// Register a (service, subscriber, listener) triple for reconciliation
    pub async fn register(&self, registration: Registration) {
        tracing::info!(
            service = %registration.service,
            subscriber = %registration.subscriber,
            "Housekeeper registration added"
        );
        self.registrations.lock().await.push(registration);
    }

    /// Spawn the periodic reconciliation task
    ///
    /// The first run is delayed by the tick interval plus a small jitter so
    /// that a fleet of instances restarting together does not replay in
    /// lockstep.
    pub async fn start(self: &Arc<Self>) {
        let mut task = self.task.lock().await;
        if task.is_some() {
            tracing::warn!("Housekeeper is already running");
            return;
        }

        self.shutdown_tx.send_replace(false);
        let housekeeper = self.clone();
        let mut shutdown = self.shutdown_tx.subscribe();

        *task = Some(tokio::spawn(async move {
            let first_delay =
                housekeeper.config.interval + jitter(housekeeper.config.first_run_jitter);
            tokio::select! {
                _ = crate::bridge::wait_shutdown(&mut shutdown) => return,
                _ = tokio::time::sleep(first_delay) => {}
            }

            loop {
                housekeeper.run_in_progress.store(true, Ordering::SeqCst);
                if let Err(e) = housekeeper.run_once().await {
                    tracing::error!(error = %e, "Housekeeper run failed");
                }
                housekeeper.run_in_progress.store(false, Ordering::SeqCst);

                tokio::select! {
                    _ = crate::bridge::wait_shutdown(&mut shutdown) => return,
                    _ = tokio::time::sleep(housekeeper.config.interval) => {}
                }
            }
        }));

        tracing::info!(interval = ?self.config.interval, "Housekeeper started");
    }

    /// One reconciliation pass over every registration
    pub async fn run_once(&self) -> Result<()> {
        let registrations = self.registrations.lock().await.clone();
        for registration in &registrations {
            if *self.shutdown_tx.subscribe().borrow() {
                break;
            }
            self.reconcile(registration).await;
        }
        Ok(())
    }

    /// Replay stored events past the subscriber's marker, in id order
    ///
    /// Replay invokes the listener directly under a restored scope; the
    /// transport is not involved, so the catch-up path works even while the
    /// bus is down. The marker only advances once the whole batch is
    /// confirmed. A mid-batch listener failure leaves it untouched; the next
    /// tick replays the batch from the same watermark, which idempotent
    /// listeners absorb.
    async fn reconcile(&self, registration: &Registration) {
        let key = registration.marker_key();

        let marker = match self.store.find_marker(&key).await {
            Ok(marker) => marker,
            Err(e) => {
                tracing::error!(marker = %key, error = %e, "Cannot read reconciliation marker");
                return;
            }
        };

        let pending = match self.store.query_after(&registration.service, marker).await {
            Ok(pending) => pending,
            Err(e) => {
                tracing::error!(
                    service = %registration.service,
                    marker,
                    error = %e,
                    "Cannot query events for reconciliation"
                );
                return;
            }
        };

        if pending.is_empty() {
            return;
        }

        tracing::info!(
            service = %registration.service,
            subscriber = %registration.subscriber,
            marker,
            count = pending.len(),
            "Replaying unconfirmed events"
        );

        let mut highest = marker;
        for event in &pending {
            let mut scope = EventScope::new();
            scope.set(event.clone());
            let result = registration.listener.on_event(&mut scope, event).await;
            scope.end();

            if let Err(e) = result {
                tracing::warn!(
                    event_id = event.id,
                    subscriber = %registration.subscriber,
                    error = %e,
                    "Replay rejected by listener, marker not advanced"
                );
                return;
            }
            highest = highest.max(event.id);
        }

        if let Err(e) = self.store.advance_marker(&key, highest).await {
            tracing::error!(marker = %key, to = highest, error = %e, "Cannot advance marker");
        } else {
            tracing::debug!(marker = %key, to = highest, "Marker advanced");
        }
    }

    /// Stop the housekeeper, waiting boundedly for an in-flight run
    ///
    /// Waits up to `max_wait_loops * wait_step` for the current pass to
    /// finish, then aborts the task regardless.
    pub async fn stop(&self) {
        self.shutdown_tx.send_replace(true);

        let mut waited = 0;
        while self.run_in_progress.load(Ordering::SeqCst) && waited < self.config.max_wait_loops {
            tokio::time::sleep(self.config.wait_step).await;
            waited += 1;
        }
        if self.run_in_progress.load(Ordering::SeqCst) {
            tracing::warn!("Housekeeper run still in progress, forcing shutdown");
        }

        if let Some(task) = self.task.lock().await.take() {
            task.abort();
        }
        tracing::info!("Housekeeper stopped");
    }
}

/// Sub-second-resolution jitter in `[0, max)` without a PRNG dependency
fn jitter(max: Duration) -> Duration {
    let max_ms = max.as_millis() as u64;
    if max_ms == 0 {
        return Duration::ZERO;
    }
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos() as u64)
        .unwrap_or(0);
    Duration::from_millis(nanos % max_ms)
}
