//! `entity_command` execution: reachability, routing, repeat and sequence
//! loops, and the power-state follow-up.

use crate::context::RepeatScope;
use crate::driver::{DriverResult, EntityCommandResult};
use crate::error::Result;
use crate::identifier;
use crate::model::{EntityType, RemoteState, SensorState, State};
use crate::protocol::{
    self, common_response, entity_change_event, validation_error, EntityCommandRequest,
    ERR_ENTITY_UNAVAILABLE, ERR_GENERIC, ERR_INV_ARGUMENT,
};
use crate::session::Connection;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Step and repeat counts above this are acknowledged before execution.
const EARLY_ACK_THRESHOLD: usize = 2;

/// Repeat count the loop actually runs.
///
/// Remotes send `repeat: 4` when the user never touched the repeat field, so
/// it is treated as a single press.
pub fn effective_repeat(repeat: Option<u32>) -> Option<u32> {
    match repeat? {
        4 => Some(1),
        n => Some(n.max(1)),
    }
}

/// Runs one `entity_command` to completion, answering the peer. Never fails:
/// every error becomes a validation response.
pub async fn handle_entity_command(
    conn: Arc<Connection>,
    req_id: u64,
    request: EntityCommandRequest,
    cancel: CancellationToken,
) {
    let outcome = match dispatch(&conn, req_id, &request, &cancel).await {
        Ok(result) => complete(&conn, req_id, &request, result).await,
        Err(err) => Err(err),
    };
    if let Err(err) = outcome {
        tracing::error!(
            ws_id = %conn.id(),
            entity_id = %request.entity_id,
            cmd_id = %request.cmd_id,
            params = ?request.params,
            error = %err,
            "error while handling command"
        );
        let _ = conn.send(&validation_error(
            req_id,
            ERR_GENERIC,
            "Error while handling command",
        ));
    }
}

async fn dispatch(
    conn: &Arc<Connection>,
    req_id: u64,
    request: &EntityCommandRequest,
    cancel: &CancellationToken,
) -> Result<EntityCommandResult> {
    let driver = conn.context().driver();
    let base = identifier::decode(&request.entity_id);

    if !driver.is_entity_reachable(&base, cancel).await? {
        tracing::warn!(ws_id = %conn.id(), entity_id = %request.entity_id, "entity not reachable");
        conn.send(&validation_error(
            req_id,
            ERR_ENTITY_UNAVAILABLE,
            "Could not reach entity",
        ))?;
        return Ok(EntityCommandResult::Handled);
    }

    match request.resolved_type() {
        EntityType::MediaPlayer => Ok(driver
            .on_media_player_command(conn, request, cancel)
            .await?),
        EntityType::Remote => remote_command(conn, req_id, request, &base, cancel).await,
        other => {
            tracing::debug!(entity_type = other.as_str(), "no command handling for entity type");
            Ok(EntityCommandResult::Failure)
        }
    }
}

async fn remote_command(
    conn: &Arc<Connection>,
    req_id: u64,
    request: &EntityCommandRequest,
    base: &str,
    cancel: &CancellationToken,
) -> Result<EntityCommandResult> {
    let driver = conn.context().driver();
    match request.cmd_id.to_ascii_lowercase().as_str() {
        "on" | "off" | "toggle" => Ok(driver
            .on_remote_command(conn, request, &request.cmd_id, cancel)
            .await?),
        "send_cmd" => send_command(conn, req_id, request, base, cancel).await,
        "send_cmd_sequence" => send_sequence(conn, req_id, request, base).await,
        _ => Ok(EntityCommandResult::Failure),
    }
}

async fn send_command(
    conn: &Arc<Connection>,
    req_id: u64,
    request: &EntityCommandRequest,
    base: &str,
    cancel: &CancellationToken,
) -> Result<EntityCommandResult> {
    let params = request.remote_params();
    let Some(command) = params.command.filter(|c| !c.is_empty()) else {
        return Ok(EntityCommandResult::Failure);
    };
    let Some(repeat) = effective_repeat(params.repeat) else {
        return Ok(conn
            .context()
            .driver()
            .on_remote_command(conn, request, &command, cancel)
            .await?);
    };

    let early_ack = repeat as usize > EARLY_ACK_THRESHOLD;
    if early_ack {
        conn.send(&common_response(req_id))?;
    }

    let steps = [command];
    let outcome = run_scoped(conn, request, base, &steps, repeat, params.delay).await;
    settle_loop(conn, request, outcome, early_ack)
}

async fn send_sequence(
    conn: &Arc<Connection>,
    req_id: u64,
    request: &EntityCommandRequest,
    base: &str,
) -> Result<EntityCommandResult> {
    let params = request.remote_params();
    let steps: Vec<String> = params
        .sequence
        .unwrap_or_default()
        .into_iter()
        .filter(|step| !step.is_empty())
        .collect();
    if steps.is_empty() {
        return Ok(EntityCommandResult::Failure);
    }
    let repeat = effective_repeat(params.repeat).unwrap_or(1);

    let early_ack = steps.len() > EARLY_ACK_THRESHOLD;
    if early_ack {
        conn.send(&common_response(req_id))?;
    }

    let outcome = run_scoped(conn, request, base, &steps, repeat, params.delay).await;
    settle_loop(conn, request, outcome, early_ack)
}

/// Once the peer has its acknowledgment, loop failures are only logged so
/// the request never gets a second response.
fn settle_loop(
    conn: &Connection,
    request: &EntityCommandRequest,
    outcome: DriverResult<EntityCommandResult>,
    early_ack: bool,
) -> Result<EntityCommandResult> {
    if !early_ack {
        return Ok(outcome?);
    }
    if let Err(err) = outcome {
        tracing::error!(
            ws_id = %conn.id(),
            entity_id = %request.entity_id,
            cmd_id = %request.cmd_id,
            error = %err,
            "command failed after acknowledgment"
        );
    }
    Ok(EntityCommandResult::Handled)
}

/// Runs `steps` inside a repeat scope for `base`, superseding any loop still
/// running for the same device. The scope outlives the per-message deadline
/// since early-acked loops keep going after the response went out.
async fn run_scoped(
    conn: &Arc<Connection>,
    request: &EntityCommandRequest,
    base: &str,
    steps: &[String],
    repeat: u32,
    delay_ms: Option<u64>,
) -> DriverResult<EntityCommandResult> {
    let context = conn.context();
    let scope = context.begin_repeat(base, conn.abort_token());
    let delay = Duration::from_millis(delay_ms.unwrap_or(0));
    let result = run_steps(conn, request, steps, repeat, delay, &scope).await;
    context.end_repeat(base, &scope);
    result
}

async fn run_steps(
    conn: &Arc<Connection>,
    request: &EntityCommandRequest,
    steps: &[String],
    repeat: u32,
    delay: Duration,
    scope: &RepeatScope,
) -> DriverResult<EntityCommandResult> {
    let driver = conn.context().driver();
    let total = steps.len() * repeat as usize;
    let mut issued = 0;
    let mut last = EntityCommandResult::Other;

    'steps: for step in steps {
        for _ in 0..repeat {
            if scope.token.is_cancelled() {
                tracing::info!(entity_id = %request.entity_id, issued, total, "repeat command cancelled");
                break 'steps;
            }
            last = driver
                .on_remote_command(conn, request, step, &scope.token)
                .await?;
            issued += 1;

            if issued < total && !delay.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = scope.token.cancelled() => {
                        tracing::info!(entity_id = %request.entity_id, issued, total, "repeat command cancelled");
                        break 'steps;
                    }
                }
            }
        }
    }
    Ok(last)
}

async fn complete(
    conn: &Arc<Connection>,
    req_id: u64,
    request: &EntityCommandRequest,
    result: EntityCommandResult,
) -> Result<()> {
    match result {
        EntityCommandResult::PowerOn | EntityCommandResult::PowerOff => {
            conn.send(&common_response(req_id))?;
            let base = identifier::decode(&request.entity_id);
            power_follow_up(conn, &base, result == EntityCommandResult::PowerOn).await
        }
        EntityCommandResult::Other => conn.send(&common_response(req_id)),
        EntityCommandResult::Handled => Ok(()),
        EntityCommandResult::Failure => {
            tracing::warn!(ws_id = %conn.id(), entity_id = %request.entity_id, cmd_id = %request.cmd_id, "unknown command");
            conn.send(&validation_error(req_id, ERR_INV_ARGUMENT, "Unknown command"))
        }
    }
}

/// Publishes the new power state on every variant of `base` and makes sure
/// the device is being broadcast.
async fn power_follow_up(conn: &Arc<Connection>, base: &str, on: bool) -> Result<()> {
    let context = conn.context();
    for entity_type in context.driver().supported_entity_types() {
        match entity_type {
            EntityType::MediaPlayer => {
                let state = if on { State::On } else { State::Off };
                conn.send(&entity_change_event(protocol::media_player_state(base, state)))?;
            }
            EntityType::Remote => {
                let state = if on { RemoteState::On } else { RemoteState::Off };
                conn.send(&entity_change_event(protocol::remote_state(base, state)))?;
            }
            EntityType::Sensor => {
                for suffix in context.sensor_suffixes(base) {
                    conn.send(&entity_change_event(protocol::sensor_state(
                        base,
                        Some(&suffix),
                        SensorState::On,
                        Value::Null,
                    )))?;
                }
            }
            _ => {}
        }
    }

    if !context.is_broadcasting(base) {
        conn.subscribe_all_variants(base);
        conn.start_event_processing().await;
    }
    Ok(())
}
