//! C7 — Flow Scheduler.
//!
//! Per-device priority queue + worker loop, periodic re-enqueue, and the
//! `server`/`android`/`auto` Execution Router (spec.md §4.7). Grounded on
//! the teacher's `Arc<Mutex<...>>`-per-resource idiom (same pattern as
//! `identity::IdentityResolver`), generalized from a single in-process
//! mutex into one queue-plus-mutex pair per physical device.

mod queue;

pub use queue::{periodic_priority, retry_priority, PriorityQueue, QueuedFlow, ON_DEMAND_PRIORITY};

use crate::config::{FlowConfig, SchedulerConfig};
use crate::device::DeviceManager;
use crate::flow::{ExecutionResult, FlowExecutor};
use crate::identity::IdentityResolver;
use crate::mqtt::{InboundCommand, InboundKind, MqttBridge};
use crate::navigation::NavigationGraphs;
use crate::store::{ExecutionMethod, Flow, Store};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, Mutex as TokioMutex, Notify};
use tracing::{debug, info, warn};

const ANDROID_EXECUTION_TIMEOUT_SECS: u64 = 30;

pub struct FlowScheduler {
    device_manager: Arc<DeviceManager>,
    identity: Arc<IdentityResolver>,
    store: Arc<Store>,
    mqtt: Option<Arc<MqttBridge>>,
    navigation: Arc<NavigationGraphs>,
    flow_config: FlowConfig,
    scheduler_config: SchedulerConfig,
    queues: DashMap<String, Arc<TokioMutex<PriorityQueue>>>,
    notify: DashMap<String, Arc<Notify>>,
    device_locks: DashMap<String, Arc<TokioMutex<()>>>,
    wizard_active: DashMap<String, bool>,
    live_view_active: DashMap<String, bool>,
    auto_unlock_pins: DashMap<String, String>,
    next_due: DashMap<String, Instant>,
    pending_android: DashMap<(String, String), oneshot::Sender<String>>,
}

impl FlowScheduler {
    pub fn new(
        device_manager: Arc<DeviceManager>,
        identity: Arc<IdentityResolver>,
        store: Arc<Store>,
        mqtt: Option<Arc<MqttBridge>>,
        navigation: Arc<NavigationGraphs>,
        flow_config: FlowConfig,
        scheduler_config: SchedulerConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            device_manager,
            identity,
            store,
            mqtt,
            navigation,
            flow_config,
            scheduler_config,
            queues: DashMap::new(),
            notify: DashMap::new(),
            device_locks: DashMap::new(),
            wizard_active: DashMap::new(),
            live_view_active: DashMap::new(),
            auto_unlock_pins: DashMap::new(),
            next_due: DashMap::new(),
            pending_android: DashMap::new(),
        })
    }

    pub fn set_auto_unlock_pin(&self, sdid: &str, pin: Option<String>) {
        match pin {
            Some(p) => {
                self.auto_unlock_pins.insert(sdid.to_string(), p);
            }
            None => {
                self.auto_unlock_pins.remove(sdid);
            }
        }
    }

    pub fn set_wizard_active(&self, sdid: &str, active: bool) {
        self.wizard_active.insert(sdid.to_string(), active);
    }

    pub fn set_live_view_active(&self, sdid: &str, active: bool) {
        self.live_view_active.insert(sdid.to_string(), active);
    }

    fn queue_for(&self, sdid: &str) -> Arc<TokioMutex<PriorityQueue>> {
        self.queues.entry(sdid.to_string()).or_insert_with(|| Arc::new(TokioMutex::new(PriorityQueue::new()))).clone()
    }

    fn notify_for(&self, sdid: &str) -> Arc<Notify> {
        self.notify.entry(sdid.to_string()).or_insert_with(|| Arc::new(Notify::new())).clone()
    }

    fn lock_for(&self, sdid: &str) -> Arc<TokioMutex<()>> {
        self.device_locks.entry(sdid.to_string()).or_insert_with(|| Arc::new(TokioMutex::new(()))).clone()
    }

    /// Enqueues a flow outside the dedup set (spec.md §4.7.1) — user-driven
    /// "run now" requests, companion-app triggers, and webhook-style calls.
    pub async fn enqueue_on_demand(&self, sdid: &str, flow: Flow, reason: impl Into<String>) {
        let queue = self.queue_for(sdid);
        queue.lock().await.enqueue(ON_DEMAND_PRIORITY, flow, reason, true);
        self.notify_for(sdid).notify_one();
    }

    async fn enqueue_periodic(&self, sdid: &str, flow: Flow, priority: u32) -> bool {
        let queue = self.queue_for(sdid);
        let queued = queue.lock().await.enqueue(priority, flow, "periodic", false);
        if queued {
            self.notify_for(sdid).notify_one();
        }
        queued
    }

    /// Re-reads the flow from the store every cycle so edits/disables/
    /// deletes made mid-run take effect on the next fire (spec.md §4.7.2).
    pub fn spawn_periodic_loop(self: &Arc<Self>, sdid: String, flow_id: String) -> tokio::task::JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            loop {
                let Some(flow) = this.store.flow(&sdid, &flow_id) else {
                    debug!(sdid, flow_id, "periodic flow deleted, stopping loop");
                    return;
                };
                if !flow.enabled {
                    debug!(sdid, flow_id, "periodic flow disabled, stopping loop");
                    return;
                }
                let Some(interval) = flow.interval_secs else {
                    debug!(sdid, flow_id, "periodic flow has no interval, stopping loop");
                    return;
                };

                let priority = periodic_priority(interval);
                let started = Instant::now();
                this.enqueue_periodic(&sdid, flow, priority).await;
                this.next_due.insert(sdid.clone(), Instant::now() + Duration::from_secs(interval));

                // Sleep the configured interval minus however long the last
                // dispatch took to queue, floored at 5s so a slow tick never
                // busy-loops (spec.md §4.7.2).
                let elapsed = started.elapsed().as_secs();
                let sleep_for = interval.saturating_sub(elapsed).max(5);
                tokio::time::sleep(Duration::from_secs(sleep_for)).await;
            }
        })
    }

    /// One worker per physical device: blocks on its queue, dispatches the
    /// highest-priority flow, never lets lock contention or unlock failure
    /// stall the whole queue (spec.md §4.7.3).
    pub fn spawn_worker(self: &Arc<Self>, sdid: String) -> tokio::task::JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            loop {
                let queue = this.queue_for(&sdid);
                let next = { queue.lock().await.dequeue() };
                let Some(queued) = next else {
                    this.notify_for(&sdid).notified().await;
                    continue;
                };

                if this.wizard_active.get(&sdid).map(|v| *v).unwrap_or(false) {
                    debug!(sdid, flow_id = %queued.flow.id, "wizard active, deferring flow");
                    tokio::time::sleep(Duration::from_secs(2)).await;
                    let queue = this.queue_for(&sdid);
                    queue.lock().await.enqueue(queued.priority, queued.flow, queued.reason, true);
                    continue;
                }

                if !this.store.flow(&sdid, &queued.flow.id).map(|f| f.enabled).unwrap_or(false) {
                    debug!(sdid, flow_id = %queued.flow.id, "flow disabled or removed before dispatch, skipping");
                    continue;
                }

                let Some(serial) = this.identity.resolve_to_connection(&sdid) else {
                    warn!(sdid, "no connection bound for this device, dropping queued flow");
                    continue;
                };

                let lock = this.lock_for(&sdid);
                let _guard = lock.lock().await;

                let connection = this.device_manager.connection_for(&sdid, &serial);
                let pin = this.auto_unlock_pins.get(&sdid).map(|v| v.clone());
                let executor = FlowExecutor::new(
                    connection,
                    this.store.clone(),
                    this.mqtt.clone(),
                    this.navigation.clone(),
                    this.flow_config.clone(),
                    sdid.clone(),
                    pin,
                );

                if let Err(e) = executor.ensure_unlocked().await {
                    drop(_guard);
                    let msg = e.to_string();
                    if msg.contains("cooling down") || msg.contains("unlock_failed") {
                        warn!(sdid, flow_id = %queued.flow.id, error = %msg, "device unlock blocked, re-queuing without stalling the queue");
                        let this2 = this.clone();
                        let sdid2 = sdid.clone();
                        let retried_priority = retry_priority(queued.priority);
                        let flow = queued.flow;
                        tokio::spawn(async move {
                            tokio::time::sleep(Duration::from_secs(10)).await;
                            let queue = this2.queue_for(&sdid2);
                            queue.lock().await.enqueue(retried_priority, flow, "retry_after_lock_contention", true);
                            this2.notify_for(&sdid2).notify_one();
                        });
                        continue;
                    }
                    warn!(sdid, flow_id = %queued.flow.id, error = %msg, "unlock failed for a non-retryable reason, dropping flow");
                    continue;
                }

                let result = this.dispatch(&sdid, &queued.flow, &executor).await;
                match &result {
                    Ok(r) => info!(sdid, flow_id = %queued.flow.id, success = r.success, "flow execution complete"),
                    Err(e) => warn!(sdid, flow_id = %queued.flow.id, error = %e, "flow execution errored"),
                }

                if queued.flow.auto_sleep_after && this.should_lock_device(&sdid).await {
                    let _ = connection_sleep(&this, &sdid).await;
                }
            }
        })
    }

    /// Execution Router (spec.md §4.7.4): `server` runs in-process; `android`
    /// dispatches to the companion app over MQTT and awaits its result;
    /// `auto` prefers `android` when the companion advertises the right
    /// capabilities, else falls back to `server`.
    async fn dispatch(&self, sdid: &str, flow: &Flow, executor: &FlowExecutor) -> anyhow::Result<ExecutionResult> {
        let method = flow.execution_method.unwrap_or(ExecutionMethod::Auto);
        let resolved = match method {
            ExecutionMethod::Server => ExecutionMethod::Server,
            ExecutionMethod::Android => ExecutionMethod::Android,
            ExecutionMethod::Auto => {
                let companion_ready = self
                    .mqtt
                    .as_ref()
                    .map(|m| m.has_capability(sdid, "flow_execution") && m.has_capability(sdid, "accessibility_v2"))
                    .unwrap_or(false);
                if companion_ready {
                    ExecutionMethod::Android
                } else {
                    ExecutionMethod::Server
                }
            }
        };

        match resolved {
            ExecutionMethod::Server => Ok(executor.execute(flow, true).await?),
            ExecutionMethod::Android => match self.dispatch_android(sdid, flow).await {
                Ok(result) => Ok(result),
                Err(e) => {
                    warn!(sdid, flow_id = %flow.id, error = %e, "android dispatch failed, falling back to server execution");
                    let mut result = executor.execute(flow, true).await?;
                    result.used_fallback = true;
                    Ok(result)
                }
            },
            ExecutionMethod::Auto => unreachable!("resolved above"),
        }
    }

    async fn dispatch_android(&self, sdid: &str, flow: &Flow) -> anyhow::Result<ExecutionResult> {
        let mqtt = self.mqtt.as_ref().ok_or_else(|| anyhow::anyhow!("no mqtt bridge configured"))?;
        let (tx, rx) = oneshot::channel();
        self.pending_android.insert((sdid.to_string(), flow.id.clone()), tx);
        mqtt.dispatch_flow(sdid, &flow.id).await?;

        let raw = tokio::time::timeout(Duration::from_secs(ANDROID_EXECUTION_TIMEOUT_SECS), rx)
            .await
            .map_err(|_| {
                self.pending_android.remove(&(sdid.to_string(), flow.id.clone()));
                anyhow::anyhow!("android execution timed out after {ANDROID_EXECUTION_TIMEOUT_SECS}s")
            })??;

        let mut result: ExecutionResult = serde_json::from_str(&raw)?;
        result.flow_id = flow.id.clone();
        Ok(result)
    }

    /// Called with every inbound MQTT command; resolves any pending
    /// `android`-routed execution awaiting this flow's result.
    pub fn handle_inbound(&self, cmd: InboundCommand) {
        if let InboundKind::FlowResult { flow_id } = cmd.kind {
            if let Some((_, tx)) = self.pending_android.remove(&(cmd.sdid, flow_id)) {
                let _ = tx.send(cmd.payload);
            }
        }
    }

    /// `true` iff it's safe and worthwhile to re-lock the device after this
    /// execution: auto-unlock is configured, no wizard/live-view is active,
    /// and nothing else is due again soon (spec.md §4.7.5).
    async fn should_lock_device(&self, sdid: &str) -> bool {
        if !self.auto_unlock_pins.contains_key(sdid) {
            return false;
        }
        if self.wizard_active.get(sdid).map(|v| *v).unwrap_or(false) {
            return false;
        }
        if self.live_view_active.get(sdid).map(|v| *v).unwrap_or(false) {
            return false;
        }
        let grace = Duration::from_secs(self.scheduler_config.sleep_grace_period_secs);
        match self.next_due.get(sdid) {
            Some(due) => due.saturating_duration_since(Instant::now()) > grace,
            None => true,
        }
    }
}

async fn connection_sleep(scheduler: &Arc<FlowScheduler>, sdid: &str) -> crate::error::Result<()> {
    let Some(serial) = scheduler.identity.resolve_to_connection(sdid) else { return Ok(()) };
    let connection = scheduler.device_manager.connection_for(sdid, &serial);
    connection.shell(&["input", "keyevent", "KEYCODE_SLEEP"]).await.map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FlowConfig, SchedulerConfig};

    fn scheduler_with_grace(grace_secs: u64) -> Arc<FlowScheduler> {
        FlowScheduler::new(
            Arc::new(DeviceManager::new(50, 250, 1000, 3, 300)),
            IdentityResolver::new(),
            Arc::new(Store::new(std::env::temp_dir().join("sensorbridge-scheduler-test"))),
            None,
            NavigationGraphs::new(),
            FlowConfig::default(),
            SchedulerConfig { sleep_grace_period_secs: grace_secs, ..SchedulerConfig::default() },
        )
    }

    #[tokio::test]
    async fn never_locks_a_device_with_no_auto_unlock_pin_configured() {
        let scheduler = scheduler_with_grace(60);
        assert!(!scheduler.should_lock_device("dev-1").await);
    }

    #[tokio::test]
    async fn does_not_lock_while_the_setup_wizard_is_active() {
        let scheduler = scheduler_with_grace(60);
        scheduler.set_auto_unlock_pin("dev-1", Some("1234".into()));
        scheduler.set_wizard_active("dev-1", true);
        assert!(!scheduler.should_lock_device("dev-1").await);
    }

    #[tokio::test]
    async fn does_not_lock_while_live_view_is_active() {
        let scheduler = scheduler_with_grace(60);
        scheduler.set_auto_unlock_pin("dev-1", Some("1234".into()));
        scheduler.set_live_view_active("dev-1", true);
        assert!(!scheduler.should_lock_device("dev-1").await);
    }

    #[tokio::test]
    async fn locks_when_pin_configured_and_nothing_due_soon() {
        let scheduler = scheduler_with_grace(60);
        scheduler.set_auto_unlock_pin("dev-1", Some("1234".into()));
        // no next_due recorded at all -> treated as nothing due soon.
        assert!(scheduler.should_lock_device("dev-1").await);
    }

    #[tokio::test]
    async fn skips_locking_when_the_next_flow_is_due_within_the_grace_period() {
        let scheduler = scheduler_with_grace(300);
        scheduler.set_auto_unlock_pin("dev-1", Some("1234".into()));
        scheduler.next_due.insert("dev-1".to_string(), Instant::now() + Duration::from_secs(5));
        assert!(!scheduler.should_lock_device("dev-1").await);
    }

    #[tokio::test]
    async fn removing_the_pin_stops_future_lock_requests() {
        let scheduler = scheduler_with_grace(60);
        scheduler.set_auto_unlock_pin("dev-1", Some("1234".into()));
        assert!(scheduler.should_lock_device("dev-1").await);
        scheduler.set_auto_unlock_pin("dev-1", None);
        assert!(!scheduler.should_lock_device("dev-1").await);
    }
}
