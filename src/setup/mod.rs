//! Setup/pairing wizard driven by `setup_driver`, `set_driver_user_data` and
//! `abort_driver_setup`.

use crate::driver::SetupOutcome;
use crate::error::{BridgeError, Result};
use crate::identifier;
use crate::model::{
    english, Dropdown, DropdownItem, EntityType, RemoteState, SelectState, SensorState, Setting,
    SettingField, SettingsPage, State,
};
use crate::protocol::{
    self, common_response, entity_change_event, setup_finished, setup_in_progress,
    setup_user_input, validation_error, SetDriverUserDataRequest, SetupDriverRequest,
    ERR_INVALID_ARGUMENT, ERR_INVALID_SETUP_STEP, ERR_SETUP_STEP_NOT_FOUND,
};
use crate::session::Connection;
use crate::store::{IntegrationConfiguration, RemoveInstruction};
use serde_json::Value;
use std::collections::HashMap;
use tokio_util::sync::CancellationToken;

pub const DEVICE_FIELD: &str = "device";
pub const ACTION_FIELD: &str = "action";

const ACTIONS: [(&str, &str); 4] = [
    ("add", "Add a new device"),
    ("configure", "Configure selected device"),
    ("delete", "Delete selected device"),
    ("reset", "Reset and reconfigure"),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetupStep {
    NewEntity,
    ReconfigureEntity,
    SaveReconfiguredEntity,
}

/// Wizard progress of one connection.
#[derive(Debug, Default)]
pub struct SetupSession {
    pub step: Option<SetupStep>,
    /// Device picked with the `configure` action.
    pub reconfigure_entity_id: Option<String>,
}

impl SetupSession {
    pub fn clear(&mut self) {
        self.step = None;
        self.reconfigure_entity_id = None;
    }
}

/// Page offered when an existing installation is reconfigured.
pub fn reconfigure_page(configuration: &IntegrationConfiguration) -> SettingsPage {
    let devices: Vec<DropdownItem> = configuration
        .entities
        .iter()
        .map(|item| {
            DropdownItem::new(
                item.entity_id.clone(),
                format!("{} ({})", item.entity_name, item.host),
            )
        })
        .collect();
    let selected = devices.first().map(|item| item.id.clone());

    SettingsPage {
        title: english("Choose action"),
        settings: vec![
            Setting {
                id: DEVICE_FIELD.to_string(),
                label: english("Configured devices"),
                field: SettingField::Dropdown(Dropdown {
                    items: devices,
                    value: selected,
                }),
            },
            Setting {
                id: ACTION_FIELD.to_string(),
                label: english("Action"),
                field: SettingField::Dropdown(Dropdown {
                    items: ACTIONS
                        .iter()
                        .map(|(id, label)| DropdownItem::new(*id, *label))
                        .collect(),
                    value: Some("configure".to_string()),
                }),
            },
        ],
    }
}

async fn fail_step(conn: &Connection, req_id: u64, err: &BridgeError) {
    tracing::error!(ws_id = %conn.id(), error = %err, "setup step failed");
    conn.setup_session().await.clear();
    let _ = conn.send(&validation_error(
        req_id,
        ERR_INVALID_SETUP_STEP,
        "Invalid setup step",
    ));
}

pub async fn setup_driver(
    conn: &Connection,
    req_id: u64,
    request: SetupDriverRequest,
    cancel: &CancellationToken,
) {
    if let Err(err) = start_wizard(conn, req_id, &request, cancel).await {
        fail_step(conn, req_id, &err).await;
    }
}

async fn start_wizard(
    conn: &Connection,
    req_id: u64,
    request: &SetupDriverRequest,
    cancel: &CancellationToken,
) -> Result<()> {
    let driver = conn.context().driver();
    driver.on_setup_driver(conn, request, cancel).await?;
    conn.send(&common_response(req_id))?;

    let configuration = conn.context().configuration().get_configuration().await?;
    let reconfigure = request.reconfigure.unwrap_or(false) && !configuration.entities.is_empty();

    let (step, page) = if reconfigure {
        (SetupStep::ReconfigureEntity, reconfigure_page(&configuration))
    } else {
        (SetupStep::NewEntity, driver.create_new_entity_settings_page())
    };
    {
        let mut session = conn.setup_session().await;
        session.clear();
        session.step = Some(step);
    }
    tracing::info!(ws_id = %conn.id(), ?step, "setup started");
    conn.send(&setup_user_input(page))
}

pub async fn set_driver_user_data(
    conn: &Connection,
    req_id: u64,
    request: SetDriverUserDataRequest,
    cancel: &CancellationToken,
) {
    if let Err(err) = continue_wizard(conn, req_id, &request, cancel).await {
        fail_step(conn, req_id, &err).await;
    }
}

async fn continue_wizard(
    conn: &Connection,
    req_id: u64,
    request: &SetDriverUserDataRequest,
    cancel: &CancellationToken,
) -> Result<()> {
    let Some(step) = conn.setup_session().await.step else {
        tracing::warn!(ws_id = %conn.id(), "user data without a running setup");
        return conn.send(&validation_error(
            req_id,
            ERR_SETUP_STEP_NOT_FOUND,
            "Setup step not found",
        ));
    };
    if request.confirm.is_none() && request.input_values.is_none() {
        return conn.send(&validation_error(
            req_id,
            ERR_INVALID_ARGUMENT,
            "Either confirm or input_values is required",
        ));
    }

    conn.send(&setup_in_progress())?;
    let driver = conn.context().driver();

    if request.confirm.is_some() {
        conn.send(&common_response(req_id))?;
        let outcome = driver
            .on_setup_driver_user_data_confirm(conn, request, cancel)
            .await?;
        return finish(conn, outcome).await;
    }

    let empty = HashMap::new();
    let input = request.input_values.as_ref().unwrap_or(&empty);
    match step {
        SetupStep::NewEntity => {
            conn.send(&common_response(req_id))?;
            let outcome = driver.handle_create_new_entity(conn, input, cancel).await?;
            finish(conn, outcome).await
        }
        SetupStep::ReconfigureEntity => reconfigure_action(conn, req_id, input).await,
        SetupStep::SaveReconfiguredEntity => save_reconfigured(conn, req_id, input, cancel).await,
    }
}

async fn reconfigure_action(
    conn: &Connection,
    req_id: u64,
    input: &HashMap<String, String>,
) -> Result<()> {
    let action = input.get(ACTION_FIELD).map(String::as_str).unwrap_or_default();
    let device = input.get(DEVICE_FIELD).cloned().unwrap_or_default();
    let context = conn.context();
    let store = context.configuration();

    match action {
        "add" => {
            conn.send(&common_response(req_id))?;
            conn.setup_session().await.step = Some(SetupStep::NewEntity);
            conn.send(&setup_user_input(
                context.driver().create_new_entity_settings_page(),
            ))
        }
        "configure" => {
            let configuration = store.get_configuration().await?;
            let Some(item) = configuration.find(&device) else {
                conn.send(&validation_error(
                    req_id,
                    ERR_INVALID_ARGUMENT,
                    "Selected device is not configured",
                ))?;
                return finish(conn, SetupOutcome::Error).await;
            };
            conn.send(&common_response(req_id))?;
            {
                let mut session = conn.setup_session().await;
                session.step = Some(SetupStep::SaveReconfiguredEntity);
                session.reconfigure_entity_id = Some(item.entity_id.clone());
            }
            conn.send(&setup_user_input(
                context.driver().create_reconfigure_entity_settings_page(item),
            ))
        }
        "delete" => {
            conn.send(&common_response(req_id))?;
            store
                .remove(RemoveInstruction {
                    entity_ids: Some(vec![device.clone()]),
                    ..Default::default()
                })
                .await?;
            signal_unavailable(conn, &identifier::decode(&device))?;
            finish(conn, SetupOutcome::Finalized).await
        }
        "reset" => {
            conn.send(&common_response(req_id))?;
            let configuration = store.get_configuration().await?;
            for item in &configuration.entities {
                signal_unavailable(conn, &identifier::decode(&item.entity_id))?;
            }
            store
                .modify(Box::new(|configuration| configuration.entities.clear()))
                .await?;
            tracing::info!(ws_id = %conn.id(), removed = configuration.entities.len(), "configuration reset");
            finish(conn, SetupOutcome::Finalized).await
        }
        other => {
            tracing::warn!(ws_id = %conn.id(), action = %other, "unknown reconfigure action");
            conn.send(&validation_error(
                req_id,
                ERR_INVALID_ARGUMENT,
                "Unknown action",
            ))?;
            finish(conn, SetupOutcome::Error).await
        }
    }
}

async fn save_reconfigured(
    conn: &Connection,
    req_id: u64,
    input: &HashMap<String, String>,
    cancel: &CancellationToken,
) -> Result<()> {
    let target = conn.setup_session().await.reconfigure_entity_id.clone();
    let Some(target) = target else {
        return conn.send(&validation_error(
            req_id,
            ERR_INVALID_ARGUMENT,
            "No device selected for reconfiguration",
        ));
    };
    let configuration = conn.context().configuration().get_configuration().await?;
    let Some(item) = configuration.find(&target) else {
        return conn.send(&validation_error(
            req_id,
            ERR_INVALID_ARGUMENT,
            "Selected device is not configured",
        ));
    };

    conn.send(&common_response(req_id))?;
    let outcome = conn
        .context()
        .driver()
        .handle_entity_reconfigured(conn, item, input, cancel)
        .await?;
    finish(conn, outcome).await
}

async fn finish(conn: &Connection, outcome: SetupOutcome) -> Result<()> {
    let success = match outcome {
        SetupOutcome::Handled => return Ok(()),
        SetupOutcome::Finalized => true,
        SetupOutcome::Error => false,
    };
    conn.setup_session().await.clear();
    tracing::info!(ws_id = %conn.id(), success, "setup finished");
    conn.send(&setup_finished(success))
}

/// Reports every known variant of `base` as unavailable and forgets it.
fn signal_unavailable(conn: &Connection, base: &str) -> Result<()> {
    let context = conn.context();
    let mut changes = Vec::new();
    for entity_type in context.driver().supported_entity_types() {
        match entity_type {
            EntityType::MediaPlayer => {
                changes.push(protocol::media_player_state(base, State::Unavailable))
            }
            EntityType::Remote => {
                changes.push(protocol::remote_state(base, RemoteState::Unavailable))
            }
            EntityType::Sensor => {
                for suffix in context.sensor_suffixes(base) {
                    changes.push(protocol::sensor_state(
                        base,
                        Some(&suffix),
                        SensorState::Unavailable,
                        Value::Null,
                    ));
                }
            }
            EntityType::Select => {
                for suffix in context.select_suffixes(base) {
                    changes.push(protocol::select_state(
                        base,
                        Some(&suffix),
                        SelectState::Unavailable,
                    ));
                }
            }
            other => changes.push(protocol::unavailable_state(base, *other)),
        }
    }

    for change in changes {
        conn.subscriptions().remove(&change.entity_id);
        conn.send(&entity_change_event(change))?;
    }
    context.clear_suffixes(base);
    Ok(())
}

/// Ends the wizard on the peer's request.
pub async fn abort_driver_setup(conn: &Connection, cancel: &CancellationToken) -> Result<()> {
    conn.stop_event_processing().await;
    conn.context()
        .driver()
        .on_abort_driver_setup(conn, cancel)
        .await?;
    conn.setup_session().await.clear();
    tracing::info!(ws_id = %conn.id(), "setup aborted");
    conn.send(&common_response(0))
}
