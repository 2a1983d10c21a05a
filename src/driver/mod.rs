//! Device-specific callbacks a driver binary supplies to the protocol engine.

use crate::error::DriverError;
use crate::model::{AvailableEntity, DeviceState, EntityStateChanged, EntityType, SettingsPage};
use crate::protocol::{
    AvailableEntitiesRequest, EntityCommandRequest, SetDriverUserDataRequest, SetupDriverRequest,
    SubscribeEventsRequest,
};
use crate::session::Connection;
use crate::store::ConfigurationItem;
use crate::subscription::SubscribedEntitiesHolder;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Outcome of one entity command callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityCommandResult {
    /// Device turned on; the engine acks and publishes the new state.
    PowerOn,
    PowerOff,
    /// The driver already answered the request itself.
    Handled,
    /// Plain success; the engine acks.
    Other,
    Failure,
}

/// Outcome of one setup wizard step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetupOutcome {
    Finalized,
    /// More wizard pages follow; the driver has sent them.
    Handled,
    Error,
}

pub type DriverResult<T> = Result<T, DriverError>;

/// Every hook the engine calls while serving a connection.
///
/// Hooks with a sensible no-op have default bodies. Everything that touches a
/// physical device has to be implemented.
#[async_trait]
pub trait Driver: Send + Sync + 'static {
    /// Entity kinds each configured device is exposed as.
    fn supported_entity_types(&self) -> &[EntityType];

    async fn on_connect(&self, _conn: &Connection, _cancel: &CancellationToken) -> DriverResult<()> {
        Ok(())
    }

    /// Returns `false` when devices could not be released cleanly.
    async fn on_disconnect(
        &self,
        _conn: &Connection,
        _cancel: &CancellationToken,
    ) -> DriverResult<bool> {
        Ok(true)
    }

    async fn on_abort_driver_setup(
        &self,
        _conn: &Connection,
        _cancel: &CancellationToken,
    ) -> DriverResult<()> {
        Ok(())
    }

    async fn on_enter_standby(
        &self,
        _conn: &Connection,
        _cancel: &CancellationToken,
    ) -> DriverResult<()> {
        Ok(())
    }

    async fn on_exit_standby(
        &self,
        _conn: &Connection,
        _cancel: &CancellationToken,
    ) -> DriverResult<()> {
        Ok(())
    }

    async fn on_get_device_state(
        &self,
        conn: &Connection,
        device_id: Option<&str>,
        cancel: &CancellationToken,
    ) -> DriverResult<DeviceState>;

    async fn get_entity_state(
        &self,
        item: &ConfigurationItem,
        cancel: &CancellationToken,
    ) -> DriverResult<DeviceState>;

    /// `base_id` is already stripped of type prefix and suffix.
    async fn is_entity_reachable(
        &self,
        base_id: &str,
        cancel: &CancellationToken,
    ) -> DriverResult<bool>;

    async fn on_get_available_entities(
        &self,
        conn: &Connection,
        request: &AvailableEntitiesRequest,
        cancel: &CancellationToken,
    ) -> DriverResult<Vec<AvailableEntity>>;

    async fn on_get_entity_states(
        &self,
        conn: &Connection,
        device_id: Option<&str>,
        cancel: &CancellationToken,
    ) -> DriverResult<Vec<EntityStateChanged>>;

    async fn on_subscribe_events(
        &self,
        _conn: &Connection,
        _request: &SubscribeEventsRequest,
        _cancel: &CancellationToken,
    ) -> DriverResult<()> {
        Ok(())
    }

    async fn on_unsubscribe_events(
        &self,
        _conn: &Connection,
        _request: &SubscribeEventsRequest,
        _cancel: &CancellationToken,
    ) -> DriverResult<()> {
        Ok(())
    }

    async fn on_media_player_command(
        &self,
        conn: &Connection,
        request: &EntityCommandRequest,
        cancel: &CancellationToken,
    ) -> DriverResult<EntityCommandResult>;

    /// Executes a single remote command. For `on`, `off` and `toggle` the
    /// command is the command id itself; for `send_cmd` and
    /// `send_cmd_sequence` it is one step of the request, called once per
    /// repetition.
    async fn on_remote_command(
        &self,
        conn: &Connection,
        request: &EntityCommandRequest,
        command: &str,
        cancel: &CancellationToken,
    ) -> DriverResult<EntityCommandResult>;

    async fn on_setup_driver(
        &self,
        _conn: &Connection,
        _request: &SetupDriverRequest,
        _cancel: &CancellationToken,
    ) -> DriverResult<()> {
        Ok(())
    }

    async fn on_setup_driver_user_data_confirm(
        &self,
        _conn: &Connection,
        _request: &SetDriverUserDataRequest,
        _cancel: &CancellationToken,
    ) -> DriverResult<SetupOutcome> {
        Ok(SetupOutcome::Finalized)
    }

    /// Persists a new configuration item built from the wizard input.
    async fn handle_create_new_entity(
        &self,
        conn: &Connection,
        input_values: &HashMap<String, String>,
        cancel: &CancellationToken,
    ) -> DriverResult<SetupOutcome>;

    async fn handle_entity_reconfigured(
        &self,
        conn: &Connection,
        item: &ConfigurationItem,
        input_values: &HashMap<String, String>,
        cancel: &CancellationToken,
    ) -> DriverResult<SetupOutcome>;

    fn create_new_entity_settings_page(&self) -> SettingsPage;

    fn create_reconfigure_entity_settings_page(&self, item: &ConfigurationItem) -> SettingsPage;

    /// Streams state changes for `subscriptions` until `cancel` fires.
    async fn handle_event_updates(
        &self,
        conn: Arc<Connection>,
        subscriptions: Arc<SubscribedEntitiesHolder>,
        cancel: CancellationToken,
    ) -> DriverResult<()>;
}
