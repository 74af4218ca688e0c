//! EventHub — publication, target fan-out, and delivery.
//!
//! `publish` is gated by an in-memory index of `"{install_id}||{event_key}"`
//! pairs with at least one enabled subscription, so events nobody listens
//! to are never persisted. Persisted events flow through two bounded
//! queues: the event worker turns an event into one target per matching
//! subscription, and the target worker delivers each target.
//!
//! Retry policy: a failed delivery is retried while the target's attempt
//! count (including the one that just failed) does not exceed the
//! subscription's `max_retries`. A retried target is parked as `delayed`
//! for `retry_delay` seconds and picked up again by the sweeper.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use spacegrid_core::config::EventsConfig;
use spacegrid_core::{EventId, InstallId, TargetId};
use spacegrid_state::{EventStatus, MqEventTarget, NewEventTarget, StateStore};

use crate::error::{EventHubError, EventHubResult};
use crate::rules;
use crate::targets::{Delivery, TargetExecutors};

/// Longest `delay_start` or `retry_delay` a subscription may ask for.
pub const MAX_HOLD_SECS: u64 = 30 * 24 * 60 * 60;

/// Most retries a subscription may ask for.
pub const MAX_RETRIES: u32 = 100;

/// An event to publish.
#[derive(Debug, Clone)]
pub struct EventOptions {
    pub install_id: InstallId,
    pub name: String,
    pub payload: Bytes,
}

/// What happened to a target handed to the target worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetOutcome {
    /// Not claimable (already taken, finished, or still delayed).
    Skipped,
    Delivered,
    /// Rules did not match; completed without delivery.
    Filtered,
    Delayed,
    Failed,
}

struct Queues {
    events: mpsc::Receiver<EventId>,
    targets: mpsc::Receiver<(EventId, TargetId)>,
    refresh: mpsc::Receiver<()>,
}

pub struct EventHub {
    store: StateStore,
    config: EventsConfig,
    executors: TargetExecutors,
    active: RwLock<Arc<HashSet<String>>>,
    event_tx: mpsc::Sender<EventId>,
    target_tx: mpsc::Sender<(EventId, TargetId)>,
    refresh_tx: mpsc::Sender<()>,
    queues: Mutex<Option<Queues>>,
}

impl EventHub {
    pub fn new(store: StateStore, config: EventsConfig, executors: TargetExecutors) -> Self {
        let (event_tx, events) = mpsc::channel(config.event_queue.max(1));
        let (target_tx, targets) = mpsc::channel(config.target_queue.max(1));
        let (refresh_tx, refresh) = mpsc::channel(1);
        Self {
            store,
            config,
            executors,
            active: RwLock::new(Arc::new(HashSet::new())),
            event_tx,
            target_tx,
            refresh_tx,
            queues: Mutex::new(Some(Queues {
                events,
                targets,
                refresh,
            })),
        }
    }

    /// Build the active index and spawn the worker loops.
    ///
    /// Spawns the event worker, the target worker, the index watcher, and
    /// the delay sweeper (which first recovers work left over from a
    /// previous run). Can only be called once.
    pub fn start(self: &Arc<Self>, shutdown: watch::Receiver<bool>) -> EventHubResult<Vec<JoinHandle<()>>> {
        let queues = self
            .queues
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(EventHubError::AlreadyStarted)?;

        self.build_active_events_index()?;

        let handles = vec![
            tokio::spawn(self.clone().run_event_worker(queues.events, shutdown.clone())),
            tokio::spawn(self.clone().run_target_worker(queues.targets, shutdown.clone())),
            tokio::spawn(self.clone().run_index_watcher(queues.refresh, shutdown.clone())),
            tokio::spawn(self.clone().run_sweeper(shutdown)),
        ];
        info!("event hub started");
        Ok(handles)
    }

    // ── Active index ───────────────────────────────────────────────

    /// Rebuild the active index from every enabled subscription.
    pub fn build_active_events_index(&self) -> EventHubResult<usize> {
        let keys: HashSet<String> = self
            .store
            .query_all_event_subscriptions()?
            .into_iter()
            .filter(|s| !s.disabled)
            .map(|s| index_key(s.install_id, &s.event_key))
            .collect();
        let count = keys.len();
        *self.active.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(keys);
        debug!(keys = count, "active events index rebuilt");
        Ok(count)
    }

    /// Ask the index watcher to rebuild. Never blocks.
    pub fn refresh_full_index(&self) {
        // A pending signal already covers this request.
        let _ = self.refresh_tx.try_send(());
    }

    pub fn executors(&self) -> &TargetExecutors {
        &self.executors
    }

    pub fn is_active(&self, install_id: InstallId, name: &str) -> bool {
        self.active
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&index_key(install_id, name))
    }

    // ── Publication ────────────────────────────────────────────────

    /// Persist and enqueue an event. Returns `None` when no enabled
    /// subscription listens for it.
    pub async fn publish(&self, opts: EventOptions) -> EventHubResult<Option<EventId>> {
        if !self.is_active(opts.install_id, &opts.name) {
            debug!(install_id = opts.install_id, event = %opts.name, "no active subscription, event dropped");
            return Ok(None);
        }
        let event = self.store.add_event(opts.install_id, &opts.name, &opts.payload)?;
        self.event_tx
            .send(event.id)
            .await
            .map_err(|_| EventHubError::QueueClosed)?;
        debug!(event_id = event.id, install_id = opts.install_id, event = %opts.name, "event published");
        Ok(Some(event.id))
    }

    // ── Transitions ────────────────────────────────────────────────

    /// Create one target per matching enabled subscription.
    ///
    /// Events that already left `new` yield no targets.
    pub fn create_event_targets(&self, event_id: EventId) -> EventHubResult<Vec<MqEventTarget>> {
        let event = self
            .store
            .get_event(event_id)?
            .ok_or(EventHubError::EventNotFound(event_id))?;
        if event.status != EventStatus::New {
            debug!(event_id, status = ?event.status, "event already scheduled");
            return Ok(Vec::new());
        }

        let now = now_ms();
        let specs: Vec<NewEventTarget> = self
            .store
            .query_subscriptions_for_event(event.install_id, &event.name)?
            .into_iter()
            .map(|sub| NewEventTarget {
                subscription_id: sub.id,
                delayed_until_ms: if sub.delay_start > 0 {
                    hold_until(now, sub.delay_start)
                } else {
                    0
                },
            })
            .collect();

        Ok(self.store.create_event_targets(event_id, &specs)?)
    }

    pub fn transition_target_start(
        &self,
        event_id: EventId,
        target_id: TargetId,
    ) -> EventHubResult<Option<MqEventTarget>> {
        Ok(self.store.start_event_target(event_id, target_id, now_ms())?)
    }

    /// Mark a target processed. Returns true once the parent event is
    /// processed too.
    pub fn transition_target_complete(&self, event_id: EventId, target_id: TargetId) -> EventHubResult<bool> {
        let processed = self.store.complete_event_target(event_id, target_id)?;
        if processed {
            debug!(event_id, "event processed");
        }
        Ok(processed)
    }

    pub fn transition_target_fail(&self, event_id: EventId, target_id: TargetId, error: &str) -> EventHubResult<()> {
        self.store.fail_event_target(event_id, target_id, error)?;
        warn!(event_id, target_id, %error, "event target failed");
        Ok(())
    }

    // ── Workers ────────────────────────────────────────────────────

    /// Fan an event out into targets and queue the immediate ones.
    pub async fn process_event(&self, event_id: EventId) -> EventHubResult<usize> {
        let targets = self.create_event_targets(event_id)?;
        let count = targets.len();
        for target in targets.into_iter().filter(|t| t.delayed_until_ms == 0) {
            self.target_tx
                .send((event_id, target.id))
                .await
                .map_err(|_| EventHubError::QueueClosed)?;
        }
        debug!(event_id, targets = count, "event targets created");
        Ok(count)
    }

    /// Run one delivery attempt for a target.
    pub async fn process_target(&self, event_id: EventId, target_id: TargetId) -> EventHubResult<TargetOutcome> {
        let Some(target) = self.transition_target_start(event_id, target_id)? else {
            debug!(event_id, target_id, "target not claimable");
            return Ok(TargetOutcome::Skipped);
        };
        let event = self
            .store
            .get_event(event_id)?
            .ok_or(EventHubError::EventNotFound(event_id))?;

        let Some(subscription) = self
            .store
            .get_event_subscription(event.install_id, target.subscription_id)?
        else {
            let msg = format!("subscription {} no longer exists", target.subscription_id);
            self.transition_target_fail(event_id, target_id, &msg)?;
            return Ok(TargetOutcome::Failed);
        };

        match rules::evaluate(&subscription.rules, &event.payload) {
            Ok(true) => {}
            Ok(false) => {
                debug!(event_id, target_id, "rules did not match, skipping delivery");
                self.transition_target_complete(event_id, target_id)?;
                return Ok(TargetOutcome::Filtered);
            }
            Err(e) => {
                self.transition_target_fail(event_id, target_id, &e.to_string())?;
                return Ok(TargetOutcome::Failed);
            }
        }

        let Some(executor) = self.executors.get(&subscription.target_type).cloned() else {
            let msg = format!("unknown target type {}", subscription.target_type);
            self.transition_target_fail(event_id, target_id, &msg)?;
            return Ok(TargetOutcome::Failed);
        };

        let delivery = Delivery {
            event,
            target,
            subscription,
        };
        match executor.deliver(&delivery).await {
            Ok(()) => {
                self.transition_target_complete(event_id, target_id)?;
                Ok(TargetOutcome::Delivered)
            }
            Err(e) => self.retry_or_fail(&delivery, &format!("{e:#}")),
        }
    }

    fn retry_or_fail(&self, delivery: &Delivery, error: &str) -> EventHubResult<TargetOutcome> {
        let target = &delivery.target;
        let sub = &delivery.subscription;
        if target.attempts <= sub.max_retries {
            let until = hold_until(now_ms(), sub.retry_delay);
            self.store
                .delay_event_target(target.event_id, target.id, until, error)?;
            warn!(
                event_id = target.event_id,
                target_id = target.id,
                attempts = target.attempts,
                max_retries = sub.max_retries,
                %error,
                "delivery failed, retry scheduled"
            );
            Ok(TargetOutcome::Delayed)
        } else {
            self.transition_target_fail(target.event_id, target.id, error)?;
            Ok(TargetOutcome::Failed)
        }
    }

    /// Queue delayed targets whose hold has expired.
    pub async fn sweep_delayed(&self) -> EventHubResult<usize> {
        let expired = self.store.query_delay_expired_targets(now_ms())?;
        let count = expired.len();
        for target in expired {
            self.target_tx
                .send((target.event_id, target.id))
                .await
                .map_err(|_| EventHubError::QueueClosed)?;
        }
        if count > 0 {
            debug!(targets = count, "delayed targets requeued");
        }
        Ok(count)
    }

    /// Requeue events without targets and targets never attempted.
    pub async fn recover(&self) -> EventHubResult<(usize, usize)> {
        let events = self.store.query_new_events()?;
        let targets = self.store.query_new_event_targets()?;
        let counts = (events.len(), targets.len());

        for event in events {
            self.event_tx
                .send(event.id)
                .await
                .map_err(|_| EventHubError::QueueClosed)?;
        }
        for target in targets {
            self.target_tx
                .send((target.event_id, target.id))
                .await
                .map_err(|_| EventHubError::QueueClosed)?;
        }
        if counts != (0, 0) {
            info!(events = counts.0, targets = counts.1, "recovered pending event work");
        }
        Ok(counts)
    }

    async fn run_event_worker(self: Arc<Self>, mut rx: mpsc::Receiver<EventId>, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                next = rx.recv() => match next {
                    Some(event_id) => {
                        if let Err(e) = self.process_event(event_id).await {
                            error!(event_id, error = %e, "failed to create event targets");
                        }
                    }
                    None => break,
                },
                _ = shutdown.changed() => {
                    debug!("event worker shutting down");
                    break;
                }
            }
        }
    }

    async fn run_target_worker(
        self: Arc<Self>,
        mut rx: mpsc::Receiver<(EventId, TargetId)>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                next = rx.recv() => match next {
                    Some((event_id, target_id)) => {
                        if let Err(e) = self.process_target(event_id, target_id).await {
                            error!(event_id, target_id, error = %e, "failed to process event target");
                        }
                    }
                    None => break,
                },
                _ = shutdown.changed() => {
                    debug!("target worker shutting down");
                    break;
                }
            }
        }
    }

    async fn run_index_watcher(self: Arc<Self>, mut rx: mpsc::Receiver<()>, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                next = rx.recv() => match next {
                    Some(()) => {
                        if let Err(e) = self.build_active_events_index() {
                            error!(error = %e, "failed to rebuild active events index");
                        }
                    }
                    None => break,
                },
                _ = shutdown.changed() => {
                    debug!("index watcher shutting down");
                    break;
                }
            }
        }
    }

    async fn run_sweeper(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        if let Err(e) = self.recover().await {
            error!(error = %e, "event recovery failed");
        }

        let mut interval = tokio::time::interval(self.config.sweep_interval());
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.sweep_delayed().await {
                        error!(error = %e, "delay sweep failed");
                    }
                }
                _ = shutdown.changed() => {
                    debug!("delay sweeper shutting down");
                    break;
                }
            }
        }
    }
}

fn index_key(install_id: InstallId, event_key: &str) -> String {
    format!("{install_id}||{event_key}")
}

/// Epoch millis `secs` seconds after `now_ms`, clamped at `u64::MAX`.
fn hold_until(now_ms: u64, secs: u64) -> u64 {
    now_ms.saturating_add(secs.saturating_mul(1000))
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
