//! Per-connection state: outbound queue, subscriptions, broadcast lifecycle
//! and setup wizard progress.

use crate::context::IntegrationContext;
use crate::error::{BridgeError, DriverError, Result};
use crate::identifier;
use crate::model::EntityType;
use crate::setup::SetupSession;
use crate::subscription::SubscribedEntitiesHolder;
use futures::FutureExt;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Default)]
struct BroadcastSlot {
    token: Option<CancellationToken>,
    generation: u64,
    task: Option<JoinHandle<std::result::Result<(), DriverError>>>,
}

impl BroadcastSlot {
    fn is_active(&self) -> bool {
        self.token.as_ref().is_some_and(|t| !t.is_cancelled())
            && !self.task.as_ref().is_some_and(JoinHandle::is_finished)
    }

    /// Drops the stored task handle, logging it if it already failed.
    fn reap(&mut self, ws_id: &str) {
        let Some(task) = self.task.take() else {
            return;
        };
        if !task.is_finished() {
            return;
        }
        match task.now_or_never() {
            Some(Ok(Err(err))) => {
                tracing::warn!(ws_id = %ws_id, error = %err, "previous broadcast failed")
            }
            Some(Err(err)) if err.is_panic() => {
                tracing::error!(ws_id = %ws_id, error = %err, "previous broadcast panicked")
            }
            _ => {}
        }
    }
}

pub struct Connection {
    id: String,
    context: Arc<IntegrationContext>,
    outbound: mpsc::UnboundedSender<String>,
    aborted: CancellationToken,
    subscriptions: Arc<SubscribedEntitiesHolder>,
    broadcast: Mutex<BroadcastSlot>,
    setup: Mutex<SetupSession>,
}

impl Connection {
    pub fn new(
        id: impl Into<String>,
        context: Arc<IntegrationContext>,
        outbound: mpsc::UnboundedSender<String>,
    ) -> Arc<Self> {
        let aborted = context.stop_token().child_token();
        Arc::new(Self {
            id: id.into(),
            context,
            outbound,
            aborted,
            subscriptions: Arc::new(SubscribedEntitiesHolder::new()),
            broadcast: Mutex::new(BroadcastSlot::default()),
            setup: Mutex::new(SetupSession::default()),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn context(&self) -> &Arc<IntegrationContext> {
        &self.context
    }

    pub fn subscriptions(&self) -> &Arc<SubscribedEntitiesHolder> {
        &self.subscriptions
    }

    /// Cancelled when the peer goes away or the process stops.
    pub fn abort_token(&self) -> &CancellationToken {
        &self.aborted
    }

    pub fn abort(&self) {
        self.aborted.cancel();
    }

    /// Queues one message for the writer task. Messages leave in call order.
    pub fn send<T: Serialize>(&self, message: &T) -> Result<()> {
        let text = serde_json::to_string(message)?;
        tracing::trace!(ws_id = %self.id, frame = %text, "outbound");
        self.outbound
            .send(text)
            .map_err(|_| BridgeError::ConnectionClosed)
    }

    pub(crate) async fn setup_session(&self) -> MutexGuard<'_, SetupSession> {
        self.setup.lock().await
    }

    async fn lock_broadcast(&self) -> Option<MutexGuard<'_, BroadcastSlot>> {
        let timeout = self.context.options().broadcast_lock_timeout();
        match tokio::time::timeout(timeout, self.broadcast.lock()).await {
            Ok(guard) => Some(guard),
            Err(_) => {
                tracing::warn!(ws_id = %self.id, error = %BridgeError::LockTimeout(timeout), "broadcast lock busy");
                None
            }
        }
    }

    /// (Re)starts the driver's broadcast for this connection. A running
    /// broadcast is cancelled first, so at most one is ever live.
    pub async fn start_event_processing(self: &Arc<Self>) {
        let Some(mut slot) = self.lock_broadcast().await else {
            return;
        };
        slot.reap(&self.id);
        if let Some(previous) = slot.token.take() {
            previous.cancel();
        }

        let token = self.aborted.child_token();
        let generation =
            self.context
                .track_broadcast(&self.id, &self.subscriptions.base_ids(), &token);

        let driver = Arc::clone(self.context.driver());
        let conn = Arc::clone(self);
        let subscriptions = Arc::clone(&self.subscriptions);
        let task_token = token.clone();
        let task = tokio::spawn(async move {
            let result = driver
                .handle_event_updates(conn, subscriptions, task_token.clone())
                .await;
            // a broadcast that ends on its own releases its entities
            task_token.cancel();
            result
        });

        tracing::info!(ws_id = %self.id, generation, "broadcast started");
        slot.token = Some(token);
        slot.generation = generation;
        slot.task = Some(task);
    }

    pub async fn stop_event_processing(&self) {
        let Some(mut slot) = self.lock_broadcast().await else {
            return;
        };
        if let Some(token) = slot.token.take() {
            token.cancel();
        }
        slot.reap(&self.id);
        slot.task = None;
    }

    pub async fn has_active_broadcast(&self) -> bool {
        self.broadcast.lock().await.is_active()
    }

    /// Marks entities subscribed after the running broadcast started as
    /// covered by it.
    pub async fn extend_broadcast(&self, base_ids: &[String]) {
        let slot = self.broadcast.lock().await;
        if slot.is_active() {
            self.context
                .extend_broadcast(&self.id, slot.generation, base_ids);
        }
    }

    /// Subscribes every entity variant the driver exposes for `base_id`.
    /// Sensors and selects are only known through their registered suffixes.
    pub fn subscribe_all_variants(&self, base_id: &str) {
        for entity_type in self.context.driver().supported_entity_types() {
            match entity_type {
                EntityType::Sensor => {
                    for suffix in self.context.sensor_suffixes(base_id) {
                        self.subscriptions.add(&identifier::encode(
                            base_id,
                            EntityType::Sensor,
                            Some(suffix.as_str()),
                        ));
                    }
                }
                EntityType::Select => {
                    for suffix in self.context.select_suffixes(base_id) {
                        self.subscriptions.add(&identifier::encode(
                            base_id,
                            EntityType::Select,
                            Some(suffix.as_str()),
                        ));
                    }
                }
                other => self
                    .subscriptions
                    .add(&identifier::encode(base_id, *other, None)),
            }
        }
    }

    /// Stops background work and releases the connection scope.
    pub async fn close(&self) {
        self.stop_event_processing().await;
        self.subscriptions.clear();
        self.abort();
    }
}
