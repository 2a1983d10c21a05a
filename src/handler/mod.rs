//! Connection loop and message routing.

use crate::command;
use crate::config::MAX_MESSAGE_HANDLING_WAIT_SECS;
use crate::context::deadline_token;
use crate::error::Result;
use crate::identifier;
use crate::model::DeviceState;
use crate::protocol::{
    auth_response, available_entities_response, common_response, device_state_event,
    driver_metadata_response, driver_version_response, entity_states_response, parse_frame,
    AvailableEntitiesData, AvailableEntitiesRequest, DeviceScope, DriverVersion,
    DriverVersionInner, EntityCommandRequest, Frame, FrameError, Kind, MessageEvent,
    SubscribeEventsRequest,
};
use crate::session::Connection;
use crate::setup;
use crate::store::RemoveInstruction;
use futures::{Stream, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Serves one peer until its frame stream ends or the connection is aborted.
pub async fn run_connection<S>(conn: Arc<Connection>, mut frames: S)
where
    S: Stream<Item = String> + Unpin,
{
    tracing::info!(ws_id = %conn.id(), "client connected");
    if conn.send(&auth_response()).is_ok() {
        loop {
            let text = tokio::select! {
                _ = conn.abort_token().cancelled() => break,
                next = frames.next() => match next {
                    Some(text) => text,
                    None => break,
                },
            };
            handle_frame(&conn, &text).await;
        }
    }
    conn.close().await;
    tracing::info!(ws_id = %conn.id(), "client disconnected");
}

/// Handles one inbound frame. Errors are logged; nothing here ends the
/// connection.
pub async fn handle_frame(conn: &Arc<Connection>, text: &str) {
    tracing::trace!(ws_id = %conn.id(), frame = %text, "inbound");
    let frame = match parse_frame(text) {
        Ok(frame) => frame,
        Err(FrameError::Empty) => {
            tracing::debug!(ws_id = %conn.id(), "empty frame");
            return;
        }
        Err(FrameError::UnknownMessage(raw)) => {
            tracing::info!(ws_id = %conn.id(), msg = %raw, "unknown message");
            return;
        }
        Err(err) => {
            tracing::debug!(ws_id = %conn.id(), error = %err, "dropping frame");
            return;
        }
    };

    let wait = message_wait(conn).await;
    let cancel = deadline_token(conn.abort_token(), wait);
    let msg = frame.msg.as_str();

    if let Err(err) = dispatch(conn, &frame, &cancel).await {
        tracing::warn!(ws_id = %conn.id(), msg, req_id = frame.req_id, error = %err, "message handling failed");
    }
    if cancel.is_cancelled() && !conn.abort_token().is_cancelled() {
        tracing::warn!(ws_id = %conn.id(), msg, wait = ?wait, "message handling exceeded wait");
    }
    // entity commands carry the token into their own task
    if frame.msg != MessageEvent::EntityCommand {
        cancel.cancel();
    }
}

/// Per-message wait: the stored override when it is usable, else the
/// process default.
async fn message_wait(conn: &Connection) -> Duration {
    let default = conn.context().options().max_message_handling_wait();
    match conn.context().configuration().get_configuration().await {
        Ok(configuration) => configuration
            .max_message_handling_wait_time_in_seconds
            .filter(|secs| *secs > 0.0 && *secs <= MAX_MESSAGE_HANDLING_WAIT_SECS)
            .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
            .unwrap_or(default),
        Err(err) => {
            tracing::warn!(error = %err, "could not read configuration, using default wait");
            default
        }
    }
}

async fn dispatch(conn: &Arc<Connection>, frame: &Frame, cancel: &CancellationToken) -> Result<()> {
    match frame.kind {
        Kind::Req => handle_request(conn, frame, cancel).await,
        Kind::Event => handle_event(conn, frame, cancel).await,
        Kind::Resp => {
            tracing::debug!(ws_id = %conn.id(), msg = frame.msg.as_str(), "ignoring response frame");
            Ok(())
        }
    }
}

async fn handle_request(
    conn: &Arc<Connection>,
    frame: &Frame,
    cancel: &CancellationToken,
) -> Result<()> {
    let context = conn.context();
    let driver = context.driver();
    let req_id = frame.req_id;

    match frame.msg {
        MessageEvent::GetDriverVersion => {
            let metadata = context.configuration().get_driver_metadata().await?;
            conn.send(&driver_version_response(
                req_id,
                DriverVersion {
                    name: metadata.display_name(),
                    version: DriverVersionInner {
                        driver: metadata.version,
                    },
                },
            ))
        }
        MessageEvent::GetDriverMetadata => {
            let metadata = context.configuration().get_driver_metadata().await?;
            conn.send(&driver_metadata_response(req_id, metadata))
        }
        MessageEvent::GetDeviceState => {
            let scope: DeviceScope = frame.data()?;
            let state = driver
                .on_get_device_state(conn, scope.device_id.as_deref(), cancel)
                .await?;
            conn.send(&device_state_event(state, scope.device_id))
        }
        MessageEvent::GetAvailableEntities => {
            let request: AvailableEntitiesRequest = frame.data()?;
            let available_entities = driver
                .on_get_available_entities(conn, &request, cancel)
                .await?;
            conn.send(&available_entities_response(
                req_id,
                AvailableEntitiesData {
                    filter: request.filter,
                    available_entities,
                },
            ))
        }
        MessageEvent::GetEntityStates => {
            let scope: DeviceScope = frame.data()?;
            let states = driver
                .on_get_entity_states(conn, scope.device_id.as_deref(), cancel)
                .await?;
            conn.send(&entity_states_response(req_id, states))
        }
        MessageEvent::SubscribeEvents => subscribe(conn, req_id, frame.data()?, cancel).await,
        MessageEvent::UnsubscribeEvents => unsubscribe(conn, req_id, frame.data()?, cancel).await,
        MessageEvent::SetupDriver => {
            setup::setup_driver(conn, req_id, frame.data()?, cancel).await;
            Ok(())
        }
        MessageEvent::SetDriverUserData => {
            setup::set_driver_user_data(conn, req_id, frame.data()?, cancel).await;
            Ok(())
        }
        MessageEvent::EntityCommand => {
            let request: EntityCommandRequest = frame.require()?;
            tokio::spawn(command::handle_entity_command(
                Arc::clone(conn),
                req_id,
                request,
                cancel.clone(),
            ));
            Ok(())
        }
        other => {
            tracing::debug!(ws_id = %conn.id(), msg = other.as_str(), "not a request message");
            Ok(())
        }
    }
}

async fn handle_event(
    conn: &Arc<Connection>,
    frame: &Frame,
    cancel: &CancellationToken,
) -> Result<()> {
    let driver = conn.context().driver();
    match frame.msg {
        MessageEvent::Connect => {
            driver.on_connect(conn, cancel).await?;
            resume(conn, cancel).await
        }
        MessageEvent::ExitStandby => {
            driver.on_exit_standby(conn, cancel).await?;
            resume(conn, cancel).await
        }
        MessageEvent::Disconnect => {
            conn.stop_event_processing().await;
            let state = match driver.on_disconnect(conn, cancel).await {
                Ok(true) => DeviceState::Disconnected,
                Ok(false) => DeviceState::Error,
                Err(err) => {
                    tracing::warn!(ws_id = %conn.id(), error = %err, "driver disconnect failed");
                    DeviceState::Error
                }
            };
            conn.send(&device_state_event(state, None))
        }
        MessageEvent::EnterStandby => {
            conn.stop_event_processing().await;
            driver.on_enter_standby(conn, cancel).await?;
            conn.send(&device_state_event(DeviceState::Disconnected, None))
        }
        MessageEvent::AbortDriverSetup => setup::abort_driver_setup(conn, cancel).await,
        other => {
            tracing::debug!(ws_id = %conn.id(), msg = other.as_str(), "not an event message");
            Ok(())
        }
    }
}

/// Shared tail of `connect` and `exit_standby`: subscribe devices that are
/// up, report the connection and start streaming.
async fn resume(conn: &Arc<Connection>, cancel: &CancellationToken) -> Result<()> {
    let context = conn.context();
    let configuration = context.configuration().get_configuration().await?;
    for item in &configuration.entities {
        match context.driver().get_entity_state(item, cancel).await {
            Ok(DeviceState::Connected) => {
                conn.subscribe_all_variants(&identifier::decode(&item.entity_id))
            }
            Ok(state) => {
                tracing::debug!(entity_id = %item.entity_id, ?state, "skipping entity warm-up")
            }
            Err(err) => {
                tracing::warn!(entity_id = %item.entity_id, error = %err, "could not query entity state")
            }
        }
    }
    conn.send(&device_state_event(DeviceState::Connected, None))?;
    conn.start_event_processing().await;
    Ok(())
}

async fn subscribe(
    conn: &Arc<Connection>,
    req_id: u64,
    request: SubscribeEventsRequest,
    cancel: &CancellationToken,
) -> Result<()> {
    let mut bases = Vec::new();
    match request.entity_ids.as_deref() {
        Some(ids) if !ids.is_empty() => {
            for id in ids {
                conn.subscriptions().add(id);
                bases.push(identifier::decode(id));
            }
        }
        _ => {
            let configuration = conn.context().configuration().get_configuration().await?;
            for item in &configuration.entities {
                let base = identifier::decode(&item.entity_id);
                conn.subscribe_all_variants(&base);
                bases.push(base);
            }
        }
    }

    conn.context()
        .driver()
        .on_subscribe_events(conn, &request, cancel)
        .await?;
    conn.send(&common_response(req_id))?;

    if conn.has_active_broadcast().await {
        conn.extend_broadcast(&bases).await;
    } else {
        conn.start_event_processing().await;
    }
    Ok(())
}

async fn unsubscribe(
    conn: &Arc<Connection>,
    req_id: u64,
    request: SubscribeEventsRequest,
    cancel: &CancellationToken,
) -> Result<()> {
    let instruction = RemoveInstruction {
        device_id: request.device_id.as_deref().map(identifier::decode),
        entity_ids: request
            .entity_ids
            .as_ref()
            .map(|ids| ids.iter().map(|id| identifier::decode(id)).collect()),
        host: None,
    };
    conn.context().configuration().remove(instruction).await?;
    for id in request.entity_ids.iter().flatten() {
        conn.subscriptions().remove(id);
    }

    conn.context()
        .driver()
        .on_unsubscribe_events(conn, &request, cancel)
        .await?;
    conn.send(&common_response(req_id))
}
