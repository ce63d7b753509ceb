//! The OneBot adapter: owns the transport, the dispatch loop and the
//! heartbeat monitor, and exposes outbound and administrative operations.
//!
//! Lifecycle: `Idle → Starting → Running → Stopping → Stopped`. A failed
//! start goes straight to `Stopped`. A stopped adapter cannot be restarted;
//! build a new one.

use crate::dispatch::Dispatcher;
use crate::executor::{AdminOperation, OperationExecutor};
use crate::filter::{AcceptAll, EventFilter, RuleFilter};
use crate::heartbeat::{HeartbeatMonitor, LiveConnection, LivenessEvent};
use crate::shutdown::{ShutdownCoordinator, ShutdownPhase, ShutdownReport};
use crate::translator;
use futures::{FutureExt, StreamExt};
use onebridge_types::config::{BridgeConfig, ConnectionMode};
use onebridge_types::error::{BridgeError, BridgeResult};
use onebridge_types::message::{ChatAddress, MessageElement, UnifiedMessage};
use onebridge_types::operation::{SendOptions, SendResult};
use onebridge_wire::client::ForwardWsClient;
use onebridge_wire::event::{LifecycleKind, NoticeEvent, WireEvent};
use onebridge_wire::server::ReverseWsServer;
use onebridge_wire::tasks::TaskSet;
use onebridge_wire::{EventStream, Transport, WireError};
use serde::Serialize;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Adapter lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum AdapterState {
    Idle = 0,
    Starting = 1,
    Running = 2,
    Stopping = 3,
    Stopped = 4,
}

impl AdapterState {
    fn from_u8(val: u8) -> Self {
        match val {
            0 => Self::Idle,
            1 => Self::Starting,
            2 => Self::Running,
            3 => Self::Stopping,
            _ => Self::Stopped,
        }
    }
}

impl std::fmt::Display for AdapterState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Starting => write!(f, "starting"),
            Self::Running => write!(f, "running"),
            Self::Stopping => write!(f, "stopping"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

struct Inner {
    config: BridgeConfig,
    transport: Arc<dyn Transport>,
    dispatcher: Arc<dyn Dispatcher>,
    filter: Arc<dyn EventFilter>,
    heartbeat: HeartbeatMonitor,
    executor: OperationExecutor,
    tasks: TaskSet,
    state: AtomicU8,
    detach_tx: watch::Sender<bool>,
    dispatch_loop: Mutex<Option<JoinHandle<()>>>,
    /// Flips to `true` once `start()` has left `Starting`, either way.
    start_settled: watch::Sender<bool>,
}

/// Handle to one adapter instance. Cloning is cheap and shares the instance.
#[derive(Clone)]
pub struct OneBotAdapter {
    inner: Arc<Inner>,
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Run a transport teardown call under a time limit.
async fn bounded<F>(step: ShutdownPhase, limit: Duration, fut: F) -> Result<Option<String>, String>
where
    F: Future<Output = Result<(), WireError>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(Ok(())) => Ok(None),
        Ok(Err(e)) => Err(BridgeError::ShutdownStep {
            step: step.to_string(),
            reason: e.to_string(),
        }
        .to_string()),
        Err(_) => Err(format!("timed out after {}ms", limit.as_millis())),
    }
}

impl OneBotAdapter {
    /// Build an adapter over `transport`. The event filter comes from
    /// `config.filter_file`, or accepts everything when none is set.
    pub fn new(
        config: BridgeConfig,
        transport: Arc<dyn Transport>,
        dispatcher: Arc<dyn Dispatcher>,
    ) -> BridgeResult<Self> {
        let filter: Arc<dyn EventFilter> = match &config.filter_file {
            Some(path) => Arc::new(RuleFilter::from_file(path)?),
            None => Arc::new(AcceptAll),
        };
        Self::with_filter(config, transport, dispatcher, filter)
    }

    /// Build an adapter with the WebSocket transport selected by `config.mode`.
    pub fn from_config(config: BridgeConfig, dispatcher: Arc<dyn Dispatcher>) -> BridgeResult<Self> {
        config.validate()?;
        let transport: Arc<dyn Transport> = match config.mode {
            ConnectionMode::Reverse => Arc::new(ReverseWsServer::from_config(&config)),
            ConnectionMode::Forward => Arc::new(ForwardWsClient::from_config(&config)),
        };
        Self::new(config, transport, dispatcher)
    }

    pub fn with_filter(
        config: BridgeConfig,
        transport: Arc<dyn Transport>,
        dispatcher: Arc<dyn Dispatcher>,
        filter: Arc<dyn EventFilter>,
    ) -> BridgeResult<Self> {
        config.validate()?;
        let tasks = TaskSet::new();
        let (detach_tx, _) = watch::channel(false);
        let (start_settled, _) = watch::channel(false);
        Ok(Self {
            inner: Arc::new(Inner {
                heartbeat: HeartbeatMonitor::new(config.heartbeat_interval()),
                executor: OperationExecutor::new(Arc::clone(&transport), tasks.clone()),
                config,
                transport,
                dispatcher,
                filter,
                tasks,
                state: AtomicU8::new(AdapterState::Idle as u8),
                detach_tx,
                dispatch_loop: Mutex::new(None),
                start_settled,
            }),
        })
    }

    pub fn state(&self) -> AdapterState {
        AdapterState::from_u8(self.inner.state.load(Ordering::SeqCst))
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.inner.config
    }

    pub fn transport_name(&self) -> &str {
        self.inner.transport.name()
    }

    fn set_state(&self, state: AdapterState) {
        self.inner.state.store(state as u8, Ordering::SeqCst);
    }

    fn transition(&self, from: AdapterState, to: AdapterState) -> Result<(), AdapterState> {
        self.inner
            .state
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .map(|_| ())
            .map_err(AdapterState::from_u8)
    }

    fn ensure_running(&self, operation: &str) -> BridgeResult<()> {
        match self.state() {
            AdapterState::Running => Ok(()),
            current => Err(BridgeError::InvalidState {
                current: current.to_string(),
                operation: operation.to_string(),
            }),
        }
    }

    /// Start the transport, the heartbeat sweep and the dispatch loop.
    ///
    /// On failure the adapter ends in `Stopped` with nothing left running.
    /// A `stop()` that arrives while the transport is still starting makes
    /// this return an error and tears down whatever was started.
    pub async fn start(&self) -> BridgeResult<()> {
        if let Err(current) = self.transition(AdapterState::Idle, AdapterState::Starting) {
            return Err(BridgeError::InvalidState {
                current: current.to_string(),
                operation: "start".to_string(),
            });
        }
        info!(transport = self.transport_name(), "Starting OneBot adapter");

        let events = match self.inner.transport.start(&self.inner.tasks).await {
            Ok(events) => events,
            Err(e) => {
                error!(error = %e, "Failed to start OneBot adapter");
                self.inner
                    .tasks
                    .cancel_all(self.inner.config.shutdown.task_cancel_timeout())
                    .await;
                self.set_state(AdapterState::Stopped);
                self.inner.start_settled.send_replace(true);
                return Err(BridgeError::Start(e.to_string()));
            }
        };

        self.inner.heartbeat.start_sweep();
        let detach_rx = self.inner.detach_tx.subscribe();
        let handle = tokio::spawn(self.clone().dispatch_loop(events, detach_rx));
        *self
            .inner
            .dispatch_loop
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(handle);

        // A concurrent stop() moved us to Stopping and is waiting on
        // `start_settled` to tear down everything started above.
        let outcome = self.transition(AdapterState::Starting, AdapterState::Running);
        self.inner.start_settled.send_replace(true);
        match outcome {
            Ok(()) => {
                info!(transport = self.transport_name(), "OneBot adapter started");
                Ok(())
            }
            Err(current) => {
                warn!(state = %current, "OneBot adapter stopped while starting");
                Err(BridgeError::Start(
                    "stop requested while the adapter was starting".to_string(),
                ))
            }
        }
    }

    /// Consume inbound events one at a time until detached or the stream ends.
    async fn dispatch_loop(self, mut events: EventStream, mut detach: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                biased;
                changed = detach.changed() => {
                    if changed.is_err() || *detach.borrow() {
                        debug!("Dispatch loop detached");
                        break;
                    }
                }
                event = events.next() => match event {
                    Some(event) => self.handle_event(event).await,
                    None => {
                        info!("Transport event stream ended");
                        break;
                    }
                }
            }
        }
    }

    async fn handle_event(&self, event: WireEvent) {
        match &event {
            WireEvent::Lifecycle {
                self_id,
                sub_type: LifecycleKind::Connect,
            } => self.inner.heartbeat.on_connect(*self_id),
            WireEvent::Lifecycle {
                self_id,
                sub_type: LifecycleKind::Disconnect,
            } => self.inner.heartbeat.on_disconnect(*self_id),
            WireEvent::Heartbeat { self_id, .. } => self.inner.heartbeat.on_heartbeat(*self_id),
            WireEvent::Message(_) | WireEvent::Notice(_)
                if !self.inner.filter.should_handle(&event) =>
            {
                debug!(
                    post_type = event.post_type(),
                    self_id = event.self_id(),
                    "Event filtered out"
                );
            }
            WireEvent::Message(m) => {
                let message = translator::to_unified(m);
                self.dispatch(message).await;
            }
            WireEvent::Notice(n) => self.handle_notice(n),
            WireEvent::Request { self_id, .. } => {
                debug!(self_id = *self_id, "Ignoring request event");
            }
        }
    }

    /// Notices are accepted but not acted on yet.
    fn handle_notice(&self, notice: &NoticeEvent) {
        debug!(
            self_id = notice.self_id,
            notice_type = %notice.notice_type,
            group_id = ?notice.group_id,
            "Notice received"
        );
    }

    async fn dispatch(&self, message: UnifiedMessage) {
        let sender = message.sender();
        let outcome = AssertUnwindSafe(self.inner.dispatcher.dispatch(self.clone(), message))
            .catch_unwind()
            .await;
        match outcome {
            Ok(Ok(())) => debug!(sender = %sender, "Message dispatched"),
            Ok(Err(reason)) => {
                let err = BridgeError::Dispatch(reason);
                warn!(sender = %sender, error = %err, "Dispatch failed");
            }
            Err(payload) => {
                let err = BridgeError::Dispatch(panic_message(payload.as_ref()));
                warn!(sender = %sender, error = %err, "Dispatcher panicked");
            }
        }
    }

    /// Tear the adapter down. Calling it again, or on an adapter that never
    /// started, is a no-op and returns an empty report.
    ///
    /// Safe to call from inside [`Dispatcher::dispatch`]; the dispatch loop
    /// exits once that call returns. Called during `start()`, it waits for the
    /// transport to come up and then tears it down.
    pub async fn stop(&self) -> ShutdownReport {
        loop {
            match self.state() {
                AdapterState::Running => {
                    if self
                        .transition(AdapterState::Running, AdapterState::Stopping)
                        .is_ok()
                    {
                        break;
                    }
                }
                AdapterState::Starting => {
                    if self
                        .transition(AdapterState::Starting, AdapterState::Stopping)
                        .is_ok()
                    {
                        info!("stop() called while the adapter is starting, waiting for start");
                        let mut settled = self.inner.start_settled.subscribe();
                        let _ = settled.wait_for(|done| *done).await;
                        break;
                    }
                }
                AdapterState::Idle => {
                    if self
                        .transition(AdapterState::Idle, AdapterState::Stopped)
                        .is_ok()
                    {
                        info!("OneBot adapter stopped before it was started");
                        return ShutdownReport::default();
                    }
                }
                current @ (AdapterState::Stopping | AdapterState::Stopped) => {
                    debug!(state = %current, "OneBot adapter already stopping or stopped");
                    return ShutdownReport::default();
                }
            }
        }

        let coord = ShutdownCoordinator::initiate();
        let shutdown = &self.inner.config.shutdown;

        coord
            .run_phase(
                ShutdownPhase::DetachingHandlers,
                self.detach_handlers(shutdown.drain_grace()),
            )
            .await;

        let heartbeat_timeout = shutdown.heartbeat_cancel_timeout();
        coord
            .run_phase(ShutdownPhase::StoppingHeartbeat, async {
                if self.inner.heartbeat.stop_sweep(heartbeat_timeout).await {
                    Ok(None)
                } else {
                    Ok(Some(format!(
                        "sweep did not acknowledge cancellation within {}ms, aborted",
                        heartbeat_timeout.as_millis()
                    )))
                }
            })
            .await;

        let task_timeout = shutdown.task_cancel_timeout();
        coord
            .run_phase(
                ShutdownPhase::ClosingConnection,
                bounded(
                    ShutdownPhase::ClosingConnection,
                    task_timeout,
                    self.inner.transport.close_connection(),
                ),
            )
            .await;
        coord
            .run_phase(
                ShutdownPhase::ClosingServer,
                bounded(
                    ShutdownPhase::ClosingServer,
                    task_timeout,
                    self.inner.transport.shutdown_server(),
                ),
            )
            .await;

        coord
            .run_phase(ShutdownPhase::CancellingTasks, async {
                let report = self.inner.tasks.cancel_all(task_timeout).await;
                if report.timed_out.is_empty() {
                    Ok(Some(format!("{} task(s) cancelled", report.cancelled)))
                } else {
                    Ok(Some(format!(
                        "{} task(s) cancelled, still running after {}ms: {}",
                        report.cancelled,
                        task_timeout.as_millis(),
                        report.timed_out.join(", ")
                    )))
                }
            })
            .await;

        coord
            .run_phase(ShutdownPhase::ClearingState, async {
                self.inner.heartbeat.clear();
                self.set_state(AdapterState::Stopped);
                Ok(None)
            })
            .await;

        info!("OneBot adapter stopped");
        coord.finish()
    }

    async fn detach_handlers(&self, grace: Duration) -> Result<Option<String>, String> {
        self.inner.detach_tx.send_replace(true);
        let handle = self
            .inner
            .dispatch_loop
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let Some(mut handle) = handle else {
            return Ok(None);
        };
        if tokio::task::try_id() == Some(handle.id()) {
            // stop() was called by a dispatcher. Waiting on our own task would
            // only time out and abort this very shutdown.
            return Ok(Some(
                "stop requested from dispatch, loop exits after the current message".to_string(),
            ));
        }
        match tokio::time::timeout(grace, &mut handle).await {
            Ok(_) => Ok(None),
            Err(_) => {
                handle.abort();
                Err(format!(
                    "dispatch still busy after {}ms grace, aborted",
                    grace.as_millis()
                ))
            }
        }
    }

    /// Send `message` to `target` through bot `self_id`.
    pub async fn send(
        &self,
        self_id: i64,
        target: ChatAddress,
        message: &UnifiedMessage,
        options: SendOptions,
    ) -> SendResult {
        if let Err(e) = self.ensure_running("send") {
            return SendResult::rejected(e.to_string());
        }
        self.inner.executor.send(self_id, target, message, options).await
    }

    /// Send to a `private_{id}` / `group_{id}` address through the first live
    /// bot connection.
    pub async fn send_message(
        &self,
        target: &str,
        message: &UnifiedMessage,
        reply_to: Option<i64>,
        recall_after: Option<Duration>,
    ) -> SendResult {
        let address = match target.parse::<ChatAddress>() {
            Ok(address) => address,
            Err(e) => {
                warn!(target, error = %e, "Rejecting send to unparsable address");
                return SendResult::rejected(e.to_string());
            }
        };
        let Some(self_id) = self.live_connections().first().map(|c| c.self_id) else {
            return SendResult::rejected("no live bot connection");
        };
        let options = SendOptions {
            reply_to,
            recall_after,
            ..SendOptions::default()
        };
        self.send(self_id, address, message, options).await
    }

    /// Send `@user text` to a group.
    pub async fn send_mention(
        &self,
        self_id: i64,
        group_id: i64,
        user_id: i64,
        text: &str,
    ) -> SendResult {
        let target = ChatAddress::group(group_id);
        let message = UnifiedMessage::new(
            target,
            vec![
                MessageElement::mention(user_id),
                MessageElement::text(format!(" {text}")),
            ],
        );
        self.send(self_id, target, &message, SendOptions::default())
            .await
    }

    pub async fn execute_admin(&self, self_id: i64, operation: AdminOperation) -> BridgeResult<()> {
        self.ensure_running("execute_admin")?;
        self.inner.executor.execute_admin(self_id, operation).await
    }

    pub async fn mute_user(
        &self,
        self_id: i64,
        group_id: i64,
        user_id: i64,
        duration_secs: u64,
    ) -> BridgeResult<()> {
        self.execute_admin(
            self_id,
            AdminOperation::Mute {
                group_id,
                user_id,
                duration_secs,
            },
        )
        .await
    }

    /// Lift a mute (a mute with duration 0).
    pub async fn unmute_user(&self, self_id: i64, group_id: i64, user_id: i64) -> BridgeResult<()> {
        self.execute_admin(self_id, AdminOperation::Unmute { group_id, user_id })
            .await
    }

    pub async fn kick_user(&self, self_id: i64, group_id: i64, user_id: i64) -> BridgeResult<()> {
        self.execute_admin(self_id, AdminOperation::Kick { group_id, user_id })
            .await
    }

    /// Recall a message, after waiting `delay_secs` when it is non-zero.
    pub async fn recall_message(
        &self,
        self_id: i64,
        message_id: i64,
        delay_secs: u64,
    ) -> BridgeResult<()> {
        self.execute_admin(
            self_id,
            AdminOperation::Recall {
                message_id,
                delay_secs,
            },
        )
        .await
    }

    pub fn subscribe_liveness(&self) -> broadcast::Receiver<LivenessEvent> {
        self.inner.heartbeat.subscribe()
    }

    pub fn is_alive(&self, self_id: i64) -> bool {
        self.inner.heartbeat.is_alive(self_id)
    }

    pub fn live_connections(&self) -> Vec<LiveConnection> {
        self.inner.heartbeat.live_connections()
    }

    /// Background tasks (transport loops, delayed recalls) still running.
    pub fn active_tasks(&self) -> usize {
        self.inner.tasks.active()
    }
}
