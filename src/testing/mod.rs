//! Shared fixtures for the engine's unit tests.

use crate::config::ProtocolConfig;
use crate::context::IntegrationContext;
use crate::driver::{Driver, DriverResult, EntityCommandResult, SetupOutcome};
use crate::error::DriverError;
use crate::model::{
    english, AvailableEntity, DeviceState, DriverMetadata, EntityStateChanged, EntityType,
    Setting, SettingField, SettingsPage, State,
};
use crate::protocol::{self, AvailableEntitiesRequest, EntityCommandRequest};
use crate::session::Connection;
use crate::store::{ConfigurationItem, IntegrationConfiguration, MemoryConfigurationService};
use crate::subscription::SubscribedEntitiesHolder;
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const SUPPORTED: [EntityType; 3] = [EntityType::MediaPlayer, EntityType::Remote, EntityType::Sensor];

/// Driver double that records every hook call.
pub struct MockDriver {
    pub calls: Mutex<Vec<String>>,
    pub remote_commands: Mutex<Vec<String>>,
    pub broadcasts_started: AtomicUsize,
    pub broadcasts_active: AtomicUsize,
    pub reachable: AtomicBool,
    pub fail_commands: AtomicBool,
    pub fail_disconnect: AtomicBool,
    pub fail_setup: AtomicBool,
    /// Makes the broadcast loop give up right after starting.
    pub fail_broadcast: AtomicBool,
    pub command_result: Mutex<EntityCommandResult>,
    pub setup_outcome: Mutex<SetupOutcome>,
    pub entity_state: Mutex<DeviceState>,
    /// Pause inside every remote command, to keep repeat loops in flight.
    pub command_latency: Mutex<Duration>,
}

impl MockDriver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            remote_commands: Mutex::new(Vec::new()),
            broadcasts_started: AtomicUsize::new(0),
            broadcasts_active: AtomicUsize::new(0),
            reachable: AtomicBool::new(true),
            fail_commands: AtomicBool::new(false),
            fail_disconnect: AtomicBool::new(false),
            fail_setup: AtomicBool::new(false),
            fail_broadcast: AtomicBool::new(false),
            command_result: Mutex::new(EntityCommandResult::Other),
            setup_outcome: Mutex::new(SetupOutcome::Finalized),
            entity_state: Mutex::new(DeviceState::Connected),
            command_latency: Mutex::new(Duration::ZERO),
        })
    }

    fn record(&self, call: impl Into<String>) {
        self.calls.lock().unwrap().push(call.into());
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn remote_commands(&self) -> Vec<String> {
        self.remote_commands.lock().unwrap().clone()
    }

    pub fn set_command_result(&self, result: EntityCommandResult) {
        *self.command_result.lock().unwrap() = result;
    }

    pub fn set_setup_outcome(&self, outcome: SetupOutcome) {
        *self.setup_outcome.lock().unwrap() = outcome;
    }

    fn command_outcome(&self) -> DriverResult<EntityCommandResult> {
        if self.fail_commands.load(Ordering::SeqCst) {
            return Err(DriverError::new("device rejected command"));
        }
        Ok(*self.command_result.lock().unwrap())
    }
}

pub fn page(title: &str) -> SettingsPage {
    SettingsPage {
        title: english(title),
        settings: vec![Setting {
            id: "host".to_string(),
            label: english("Host"),
            field: SettingField::Text {
                value: String::new(),
            },
        }],
    }
}

#[async_trait]
impl Driver for MockDriver {
    fn supported_entity_types(&self) -> &[EntityType] {
        &SUPPORTED
    }

    async fn on_connect(&self, _conn: &Connection, _cancel: &CancellationToken) -> DriverResult<()> {
        self.record("on_connect");
        Ok(())
    }

    async fn on_disconnect(
        &self,
        _conn: &Connection,
        _cancel: &CancellationToken,
    ) -> DriverResult<bool> {
        self.record("on_disconnect");
        Ok(!self.fail_disconnect.load(Ordering::SeqCst))
    }

    async fn on_abort_driver_setup(
        &self,
        _conn: &Connection,
        _cancel: &CancellationToken,
    ) -> DriverResult<()> {
        self.record("on_abort_driver_setup");
        Ok(())
    }

    async fn on_enter_standby(
        &self,
        _conn: &Connection,
        _cancel: &CancellationToken,
    ) -> DriverResult<()> {
        self.record("on_enter_standby");
        Ok(())
    }

    async fn on_exit_standby(
        &self,
        _conn: &Connection,
        _cancel: &CancellationToken,
    ) -> DriverResult<()> {
        self.record("on_exit_standby");
        Ok(())
    }

    async fn on_get_device_state(
        &self,
        _conn: &Connection,
        device_id: Option<&str>,
        _cancel: &CancellationToken,
    ) -> DriverResult<DeviceState> {
        self.record(format!("on_get_device_state:{}", device_id.unwrap_or("-")));
        Ok(DeviceState::Connected)
    }

    async fn get_entity_state(
        &self,
        item: &ConfigurationItem,
        _cancel: &CancellationToken,
    ) -> DriverResult<DeviceState> {
        self.record(format!("get_entity_state:{}", item.entity_id));
        Ok(*self.entity_state.lock().unwrap())
    }

    async fn is_entity_reachable(
        &self,
        base_id: &str,
        _cancel: &CancellationToken,
    ) -> DriverResult<bool> {
        self.record(format!("is_entity_reachable:{base_id}"));
        Ok(self.reachable.load(Ordering::SeqCst))
    }

    async fn on_get_available_entities(
        &self,
        conn: &Connection,
        _request: &AvailableEntitiesRequest,
        _cancel: &CancellationToken,
    ) -> DriverResult<Vec<AvailableEntity>> {
        self.record("on_get_available_entities");
        let configuration = conn
            .context()
            .configuration()
            .get_configuration()
            .await
            .map_err(|err| DriverError::new(err.to_string()))?;
        Ok(configuration
            .entities
            .iter()
            .map(|item| AvailableEntity {
                entity_id: item.entity_id.clone(),
                entity_type: EntityType::MediaPlayer,
                device_id: item.device_id.clone(),
                name: english(item.entity_name.clone()),
                features: vec!["on_off".to_string()],
                area: None,
                extra: Map::new(),
            })
            .collect())
    }

    async fn on_get_entity_states(
        &self,
        _conn: &Connection,
        _device_id: Option<&str>,
        _cancel: &CancellationToken,
    ) -> DriverResult<Vec<EntityStateChanged>> {
        self.record("on_get_entity_states");
        Ok(vec![protocol::media_player_state("tv1", State::Playing)])
    }

    async fn on_subscribe_events(
        &self,
        _conn: &Connection,
        _request: &protocol::SubscribeEventsRequest,
        _cancel: &CancellationToken,
    ) -> DriverResult<()> {
        self.record("on_subscribe_events");
        Ok(())
    }

    async fn on_unsubscribe_events(
        &self,
        _conn: &Connection,
        _request: &protocol::SubscribeEventsRequest,
        _cancel: &CancellationToken,
    ) -> DriverResult<()> {
        self.record("on_unsubscribe_events");
        Ok(())
    }

    async fn on_media_player_command(
        &self,
        _conn: &Connection,
        request: &EntityCommandRequest,
        _cancel: &CancellationToken,
    ) -> DriverResult<EntityCommandResult> {
        self.record(format!("on_media_player_command:{}", request.cmd_id));
        self.command_outcome()
    }

    async fn on_remote_command(
        &self,
        _conn: &Connection,
        _request: &EntityCommandRequest,
        command: &str,
        _cancel: &CancellationToken,
    ) -> DriverResult<EntityCommandResult> {
        self.remote_commands.lock().unwrap().push(command.to_string());
        let latency = *self.command_latency.lock().unwrap();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        self.command_outcome()
    }

    async fn on_setup_driver(
        &self,
        _conn: &Connection,
        _request: &protocol::SetupDriverRequest,
        _cancel: &CancellationToken,
    ) -> DriverResult<()> {
        self.record("on_setup_driver");
        Ok(())
    }

    async fn on_setup_driver_user_data_confirm(
        &self,
        _conn: &Connection,
        _request: &protocol::SetDriverUserDataRequest,
        _cancel: &CancellationToken,
    ) -> DriverResult<SetupOutcome> {
        self.record("on_setup_driver_user_data_confirm");
        Ok(*self.setup_outcome.lock().unwrap())
    }

    async fn handle_create_new_entity(
        &self,
        conn: &Connection,
        input_values: &HashMap<String, String>,
        _cancel: &CancellationToken,
    ) -> DriverResult<SetupOutcome> {
        self.record("handle_create_new_entity");
        if self.fail_setup.load(Ordering::SeqCst) {
            return Err(DriverError::new("device did not answer"));
        }
        let host = input_values.get("host").cloned().unwrap_or_default();
        let item = ConfigurationItem::new(host.clone(), host.clone(), format!("Device {host}"));
        conn.context()
            .configuration()
            .modify(Box::new(move |cfg| cfg.entities.push(item)))
            .await
            .map_err(|err| DriverError::new(err.to_string()))?;
        Ok(*self.setup_outcome.lock().unwrap())
    }

    async fn handle_entity_reconfigured(
        &self,
        _conn: &Connection,
        item: &ConfigurationItem,
        _input_values: &HashMap<String, String>,
        _cancel: &CancellationToken,
    ) -> DriverResult<SetupOutcome> {
        self.record(format!("handle_entity_reconfigured:{}", item.entity_id));
        Ok(*self.setup_outcome.lock().unwrap())
    }

    fn create_new_entity_settings_page(&self) -> SettingsPage {
        page("Add device")
    }

    fn create_reconfigure_entity_settings_page(&self, item: &ConfigurationItem) -> SettingsPage {
        page(&format!("Configure {}", item.entity_name))
    }

    async fn handle_event_updates(
        &self,
        _conn: Arc<Connection>,
        _subscriptions: Arc<SubscribedEntitiesHolder>,
        cancel: CancellationToken,
    ) -> DriverResult<()> {
        self.broadcasts_started.fetch_add(1, Ordering::SeqCst);
        if self.fail_broadcast.load(Ordering::SeqCst) {
            return Err(DriverError::new("event stream refused"));
        }
        self.broadcasts_active.fetch_add(1, Ordering::SeqCst);
        cancel.cancelled().await;
        self.broadcasts_active.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }
}

pub fn metadata() -> DriverMetadata {
    DriverMetadata {
        driver_id: Some("mock".to_string()),
        name: english("Mock Driver"),
        version: "1.0.0".to_string(),
        extra: Map::new(),
    }
}

pub fn configured(entries: &[(&str, &str)]) -> IntegrationConfiguration {
    IntegrationConfiguration {
        entities: entries
            .iter()
            .map(|(host, id)| ConfigurationItem::new(*host, *id, format!("Device {id}")))
            .collect(),
        max_message_handling_wait_time_in_seconds: None,
    }
}

pub fn test_context(
    driver: Arc<MockDriver>,
    configuration: IntegrationConfiguration,
) -> Arc<IntegrationContext> {
    Arc::new(IntegrationContext::new(
        driver,
        Arc::new(MemoryConfigurationService::new(configuration, metadata())),
        ProtocolConfig::default(),
        CancellationToken::new(),
    ))
}

pub fn test_connection(
    context: &Arc<IntegrationContext>,
) -> (Arc<Connection>, mpsc::UnboundedReceiver<String>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Connection::new("127.0.0.1:50000", Arc::clone(context), tx), rx)
}

/// Next outbound frame as json, failing the test after a generous wait.
pub async fn next_frame(rx: &mut mpsc::UnboundedReceiver<String>) -> Value {
    let text = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("no outbound frame in time")
        .expect("outbound queue closed");
    serde_json::from_str(&text).expect("outbound frame is json")
}

/// Frames already queued, without waiting.
pub fn drain(rx: &mut mpsc::UnboundedReceiver<String>) -> Vec<Value> {
    let mut frames = Vec::new();
    while let Ok(text) = rx.try_recv() {
        frames.push(serde_json::from_str(&text).expect("outbound frame is json"));
    }
    frames
}
