use crate::error::BridgeError;
use crate::identifier;
use crate::model::{
    AvailableEntity, DeviceState, EntityStateChanged, EntityType, RemoteState, SelectState,
    SensorState, SettingsPage, State,
};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use thiserror::Error;

pub const CODE_OK: u16 = 200;
pub const CODE_BAD_REQUEST: u16 = 400;

pub const ERR_ENTITY_UNAVAILABLE: &str = "ENTITY_UNAVAILABLE";
pub const ERR_INV_ARGUMENT: &str = "INV_ARGUMENT";
pub const ERR_GENERIC: &str = "ERROR";
pub const ERR_SETUP_STEP_NOT_FOUND: &str = "SETUP_STEP_NOT_FOUND";
pub const ERR_INVALID_ARGUMENT: &str = "INVALID_ARGUMENT";
pub const ERR_INVALID_SETUP_STEP: &str = "INVALID_SETUP_STEP";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Req,
    Resp,
    Event,
}

impl Kind {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.to_ascii_lowercase().as_str() {
            "req" => Some(Self::Req),
            "resp" => Some(Self::Resp),
            "event" => Some(Self::Event),
            _ => None,
        }
    }
}

/// Closed vocabulary of inbound `msg` values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageEvent {
    GetDriverVersion,
    GetDriverMetadata,
    Connect,
    Disconnect,
    GetDeviceState,
    GetAvailableEntities,
    SubscribeEvents,
    UnsubscribeEvents,
    GetEntityStates,
    SetupDriver,
    SetDriverUserData,
    AbortDriverSetup,
    EntityCommand,
    EnterStandby,
    ExitStandby,
    Other,
}

const MESSAGE_TABLE: [(&str, MessageEvent); 15] = [
    ("get_driver_version", MessageEvent::GetDriverVersion),
    ("get_driver_metadata", MessageEvent::GetDriverMetadata),
    ("connect", MessageEvent::Connect),
    ("disconnect", MessageEvent::Disconnect),
    ("get_device_state", MessageEvent::GetDeviceState),
    ("get_available_entities", MessageEvent::GetAvailableEntities),
    ("subscribe_events", MessageEvent::SubscribeEvents),
    ("unsubscribe_events", MessageEvent::UnsubscribeEvents),
    ("get_entity_states", MessageEvent::GetEntityStates),
    ("setup_driver", MessageEvent::SetupDriver),
    ("set_driver_user_data", MessageEvent::SetDriverUserData),
    ("abort_driver_setup", MessageEvent::AbortDriverSetup),
    ("entity_command", MessageEvent::EntityCommand),
    ("enter_standby", MessageEvent::EnterStandby),
    ("exit_standby", MessageEvent::ExitStandby),
];

impl MessageEvent {
    pub fn parse(raw: &str) -> Self {
        MESSAGE_TABLE
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(raw))
            .map(|(_, event)| *event)
            .unwrap_or(Self::Other)
    }

    pub fn as_str(self) -> &'static str {
        MESSAGE_TABLE
            .iter()
            .find(|(_, event)| *event == self)
            .map(|(name, _)| *name)
            .unwrap_or("other")
    }
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("empty frame")]
    Empty,
    #[error("frame is not json: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("frame is not a json object")]
    NotObject,
    #[error("frame has no 'msg' field")]
    MissingMsg,
    #[error("unknown message '{0}'")]
    UnknownMessage(String),
    #[error("frame has no 'kind' field")]
    MissingKind,
    #[error("unsupported kind '{0}'")]
    UnsupportedKind(String),
}

/// A decoded inbound frame.
#[derive(Debug, Clone)]
pub struct Frame {
    pub kind: Kind,
    pub msg: MessageEvent,
    pub req_id: u64,
    pub msg_data: Value,
}

impl Frame {
    /// Decodes `msg_data`, treating an absent payload as the type's default.
    pub fn data<T: DeserializeOwned + Default>(&self) -> Result<T, BridgeError> {
        if self.msg_data.is_null() {
            return Ok(T::default());
        }
        Ok(serde_json::from_value(self.msg_data.clone())?)
    }

    /// Decodes a payload the message cannot do without.
    pub fn require<T: DeserializeOwned>(&self) -> Result<T, BridgeError> {
        if self.msg_data.is_null() {
            return Err(BridgeError::MissingField("msg_data"));
        }
        Ok(serde_json::from_value(self.msg_data.clone())?)
    }
}

pub fn parse_frame(text: &str) -> Result<Frame, FrameError> {
    if text.trim().is_empty() {
        return Err(FrameError::Empty);
    }
    let value: Value = serde_json::from_str(text)?;
    let obj = value.as_object().ok_or(FrameError::NotObject)?;

    let raw_msg = obj
        .get("msg")
        .and_then(Value::as_str)
        .ok_or(FrameError::MissingMsg)?;
    let msg = MessageEvent::parse(raw_msg);
    if msg == MessageEvent::Other {
        return Err(FrameError::UnknownMessage(raw_msg.to_string()));
    }

    let raw_kind = obj
        .get("kind")
        .and_then(Value::as_str)
        .ok_or(FrameError::MissingKind)?;
    let kind =
        Kind::parse(raw_kind).ok_or_else(|| FrameError::UnsupportedKind(raw_kind.to_string()))?;

    let req_id = obj
        .get("req_id")
        .or_else(|| obj.get("id"))
        .and_then(Value::as_u64)
        .unwrap_or(0);

    Ok(Frame {
        kind,
        msg,
        req_id,
        msg_data: obj.get("msg_data").cloned().unwrap_or(Value::Null),
    })
}

// Inbound payloads.

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DeviceScope {
    #[serde(default)]
    pub device_id: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AvailableEntitiesRequest {
    #[serde(default)]
    pub filter: Option<Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SubscribeEventsRequest {
    #[serde(default)]
    pub device_id: Option<String>,
    #[serde(default)]
    pub entity_ids: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SetupDriverRequest {
    #[serde(default)]
    pub reconfigure: Option<bool>,
    #[serde(default)]
    pub setup_data: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SetDriverUserDataRequest {
    #[serde(default)]
    pub input_values: Option<HashMap<String, String>>,
    #[serde(default)]
    pub confirm: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct EntityCommandRequest {
    pub entity_id: String,
    #[serde(default, deserialize_with = "entity_type_any_case")]
    pub entity_type: Option<EntityType>,
    #[serde(alias = "command_id")]
    pub cmd_id: String,
    #[serde(default)]
    pub params: Option<Value>,
}

/// Unknown or non-string values decode to `None`, leaving the type to the id.
fn entity_type_any_case<'de, D>(deserializer: D) -> Result<Option<EntityType>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<Value>::deserialize(deserializer)?;
    Ok(raw.as_ref().and_then(Value::as_str).and_then(EntityType::parse))
}

impl EntityCommandRequest {
    /// Declared entity type, falling back to the one encoded in the id.
    pub fn resolved_type(&self) -> EntityType {
        self.entity_type
            .unwrap_or_else(|| identifier::type_of(&self.entity_id))
    }

    pub fn remote_params(&self) -> RemoteCommandParams {
        self.params
            .clone()
            .and_then(|p| serde_json::from_value(p).ok())
            .unwrap_or_default()
    }
}

/// Parameters of `send_cmd` and `send_cmd_sequence`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct RemoteCommandParams {
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub sequence: Option<Vec<String>>,
    #[serde(default)]
    pub repeat: Option<u32>,
    #[serde(default)]
    pub delay: Option<u64>,
}

// Outbound messages.

#[derive(Debug, Clone, Serialize)]
pub struct Response<T: Serialize> {
    pub kind: &'static str,
    pub req_id: u64,
    pub msg: &'static str,
    pub code: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub msg_data: Option<T>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventCategory {
    Device,
    Entity,
}

#[derive(Debug, Clone, Serialize)]
pub struct Event<T: Serialize> {
    pub kind: &'static str,
    pub msg: &'static str,
    pub cat: EventCategory,
    pub ts: DateTime<Utc>,
    pub msg_data: T,
}

fn response<T: Serialize>(req_id: u64, msg: &'static str, msg_data: Option<T>) -> Response<T> {
    Response {
        kind: "resp",
        req_id,
        msg,
        code: CODE_OK,
        msg_data,
    }
}

fn event<T: Serialize>(msg: &'static str, cat: EventCategory, msg_data: T) -> Event<T> {
    Event {
        kind: "event",
        msg,
        cat,
        ts: Utc::now(),
        msg_data,
    }
}

pub fn auth_response() -> Response<()> {
    response(0, "authentication", None)
}

pub fn common_response(req_id: u64) -> Response<()> {
    response(req_id, "result", None)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationError {
    pub code: String,
    pub message: String,
}

pub fn validation_error(req_id: u64, code: &str, message: &str) -> Response<ValidationError> {
    Response {
        kind: "resp",
        req_id,
        msg: "result",
        code: CODE_BAD_REQUEST,
        msg_data: Some(ValidationError {
            code: code.to_string(),
            message: message.to_string(),
        }),
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DriverVersion {
    pub name: String,
    pub version: DriverVersionInner,
}

#[derive(Debug, Clone, Serialize)]
pub struct DriverVersionInner {
    pub driver: String,
}

pub fn driver_version_response(req_id: u64, version: DriverVersion) -> Response<DriverVersion> {
    response(req_id, "driver_version", Some(version))
}

pub fn driver_metadata_response<T: Serialize>(req_id: u64, metadata: T) -> Response<T> {
    response(req_id, "driver_metadata", Some(metadata))
}

#[derive(Debug, Clone, Serialize)]
pub struct AvailableEntitiesData {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter: Option<Value>,
    pub available_entities: Vec<AvailableEntity>,
}

pub fn available_entities_response(
    req_id: u64,
    data: AvailableEntitiesData,
) -> Response<AvailableEntitiesData> {
    response(req_id, "available_entities", Some(data))
}

pub fn entity_states_response(
    req_id: u64,
    states: Vec<EntityStateChanged>,
) -> Response<Vec<EntityStateChanged>> {
    response(req_id, "entity_states", Some(states))
}

#[derive(Debug, Clone, Serialize)]
pub struct DeviceStateData {
    pub state: DeviceState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
}

pub fn device_state_event(state: DeviceState, device_id: Option<String>) -> Event<DeviceStateData> {
    event(
        "device_state",
        EventCategory::Device,
        DeviceStateData { state, device_id },
    )
}

pub fn entity_change_event(change: EntityStateChanged) -> Event<EntityStateChanged> {
    event("entity_change", EventCategory::Entity, change)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SetupEventType {
    Setup,
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SetupState {
    Setup,
    WaitUserAction,
    Ok,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SetupError {
    None,
    NotFound,
    ConnectionRefused,
    AuthorizationError,
    Timeout,
    Other,
}

#[derive(Debug, Clone, Serialize)]
pub struct RequireUserAction {
    pub input: SettingsPage,
}

#[derive(Debug, Clone, Serialize)]
pub struct DriverSetupChange {
    pub event_type: SetupEventType,
    pub state: SetupState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<SetupError>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub require_user_action: Option<RequireUserAction>,
}

fn setup_change(data: DriverSetupChange) -> Event<DriverSetupChange> {
    event("driver_setup_change", EventCategory::Device, data)
}

/// Busy indicator shown while a wizard step is processed.
pub fn setup_in_progress() -> Event<DriverSetupChange> {
    setup_change(DriverSetupChange {
        event_type: SetupEventType::Setup,
        state: SetupState::Setup,
        error: None,
        require_user_action: None,
    })
}

pub fn setup_user_input(page: SettingsPage) -> Event<DriverSetupChange> {
    setup_change(DriverSetupChange {
        event_type: SetupEventType::Setup,
        state: SetupState::WaitUserAction,
        error: None,
        require_user_action: Some(RequireUserAction { input: page }),
    })
}

pub fn setup_finished(success: bool) -> Event<DriverSetupChange> {
    setup_change(DriverSetupChange {
        event_type: SetupEventType::Stop,
        state: if success { SetupState::Ok } else { SetupState::Error },
        error: (!success).then_some(SetupError::NotFound),
        require_user_action: None,
    })
}

// State-change payloads for the entity kinds the engine itself reports on.

pub fn media_player_state(entity_id: &str, state: State) -> EntityStateChanged {
    EntityStateChanged {
        entity_id: identifier::encode(entity_id, EntityType::MediaPlayer, None),
        entity_type: EntityType::MediaPlayer,
        attributes: json!({ "state": state }),
    }
}

pub fn remote_state(entity_id: &str, state: RemoteState) -> EntityStateChanged {
    EntityStateChanged {
        entity_id: identifier::encode(entity_id, EntityType::Remote, None),
        entity_type: EntityType::Remote,
        attributes: json!({ "state": state }),
    }
}

pub fn sensor_state(
    entity_id: &str,
    suffix: Option<&str>,
    state: SensorState,
    value: Value,
) -> EntityStateChanged {
    EntityStateChanged {
        entity_id: identifier::encode(entity_id, EntityType::Sensor, suffix),
        entity_type: EntityType::Sensor,
        attributes: json!({ "state": state, "value": value, "unit": null }),
    }
}

pub fn select_state(entity_id: &str, suffix: Option<&str>, state: SelectState) -> EntityStateChanged {
    EntityStateChanged {
        entity_id: identifier::encode(entity_id, EntityType::Select, suffix),
        entity_type: EntityType::Select,
        attributes: json!({ "state": state, "current_option": null }),
    }
}

/// Generic `UNAVAILABLE` change for entity kinds without a dedicated builder.
pub fn unavailable_state(entity_id: &str, entity_type: EntityType) -> EntityStateChanged {
    EntityStateChanged {
        entity_id: identifier::encode(entity_id, entity_type, None),
        entity_type,
        attributes: json!({ "state": "UNAVAILABLE" }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_request_frame_with_id_alias() {
        let frame =
            parse_frame(r#"{"kind":"req","id":7,"msg":"get_driver_version"}"#).unwrap();
        assert_eq!(frame.kind, Kind::Req);
        assert_eq!(frame.msg, MessageEvent::GetDriverVersion);
        assert_eq!(frame.req_id, 7);
        assert!(frame.msg_data.is_null());
    }

    #[test]
    fn message_lookup_is_case_insensitive() {
        assert_eq!(MessageEvent::parse("Entity_Command"), MessageEvent::EntityCommand);
        assert_eq!(MessageEvent::parse("ping"), MessageEvent::Other);
        assert_eq!(MessageEvent::EnterStandby.as_str(), "enter_standby");
    }

    #[test]
    fn unknown_message_is_reported_before_kind() {
        let err = parse_frame(r#"{"msg":"bogus"}"#).unwrap_err();
        assert!(matches!(err, FrameError::UnknownMessage(raw) if raw == "bogus"));
    }

    #[test]
    fn rejects_frames_missing_fields() {
        assert!(matches!(parse_frame("  "), Err(FrameError::Empty)));
        assert!(matches!(parse_frame("[1]"), Err(FrameError::NotObject)));
        assert!(matches!(parse_frame(r#"{"kind":"req"}"#), Err(FrameError::MissingMsg)));
        assert!(matches!(
            parse_frame(r#"{"msg":"connect"}"#),
            Err(FrameError::MissingKind)
        ));
        assert!(matches!(
            parse_frame(r#"{"msg":"connect","kind":"push"}"#),
            Err(FrameError::UnsupportedKind(_))
        ));
        assert!(matches!(parse_frame("{nope"), Err(FrameError::Decode(_))));
    }

    #[test]
    fn absent_msg_data_decodes_to_default() {
        let frame = parse_frame(r#"{"kind":"req","id":1,"msg":"subscribe_events"}"#).unwrap();
        let data: SubscribeEventsRequest = frame.data().unwrap();
        assert!(data.entity_ids.is_none());
        assert!(matches!(
            frame.require::<EntityCommandRequest>(),
            Err(BridgeError::MissingField("msg_data"))
        ));
    }

    #[test]
    fn auth_response_matches_wire_shape() {
        let json = serde_json::to_value(auth_response()).unwrap();
        assert_eq!(
            json,
            json!({"kind":"resp","req_id":0,"msg":"authentication","code":200})
        );
    }

    #[test]
    fn validation_error_carries_detail() {
        let json =
            serde_json::to_value(validation_error(3, ERR_INV_ARGUMENT, "Unknown command")).unwrap();
        assert_eq!(json["code"], 400);
        assert_eq!(json["req_id"], 3);
        assert_eq!(json["msg_data"]["code"], "INV_ARGUMENT");
        assert_eq!(json["msg_data"]["message"], "Unknown command");
    }

    #[test]
    fn setup_finished_reports_error_detail_only_on_failure() {
        let ok = serde_json::to_value(setup_finished(true)).unwrap();
        assert_eq!(ok["msg_data"]["state"], "OK");
        assert_eq!(ok["msg_data"]["event_type"], "STOP");
        assert!(ok["msg_data"].get("error").is_none());

        let failed = serde_json::to_value(setup_finished(false)).unwrap();
        assert_eq!(failed["msg_data"]["state"], "ERROR");
        assert_eq!(failed["msg_data"]["error"], "NOT_FOUND");
        assert_eq!(failed["cat"], "DEVICE");
    }

    #[test]
    fn entity_change_event_encodes_sensor_suffix() {
        let change = sensor_state("kitchen", Some("temp"), SensorState::On, Value::Null);
        let json = serde_json::to_value(entity_change_event(change)).unwrap();
        assert_eq!(json["msg"], "entity_change");
        assert_eq!(json["cat"], "ENTITY");
        assert_eq!(json["msg_data"]["entity_type"], "sensor");
        assert_eq!(json["msg_data"]["attributes"]["state"], "ON");
        assert!(json["msg_data"]["attributes"]["value"].is_null());
    }

    #[test]
    fn remote_params_tolerate_missing_fields() {
        let req = EntityCommandRequest {
            entity_id: "REMOTE:tv".to_string(),
            entity_type: None,
            cmd_id: "send_cmd".to_string(),
            params: Some(json!({"command":"VOLUME_UP","repeat":3})),
        };
        let params = req.remote_params();
        assert_eq!(params.command.as_deref(), Some("VOLUME_UP"));
        assert_eq!(params.repeat, Some(3));
        assert_eq!(params.delay, None);
        assert_eq!(req.resolved_type(), EntityType::Remote);
    }

    #[test]
    fn entity_command_type_is_matched_in_any_case() {
        let frame = parse_frame(
            r#"{"kind":"req","id":4,"msg":"entity_command","msg_data":{"entity_id":"tv1","entity_type":"REMOTE","cmd_id":"toggle"}}"#,
        )
        .unwrap();
        let req: EntityCommandRequest = frame.require().unwrap();
        assert_eq!(req.entity_type, Some(EntityType::Remote));
        assert_eq!(req.resolved_type(), EntityType::Remote);
    }

    #[test]
    fn unknown_entity_type_falls_back_to_id_prefix() {
        let req: EntityCommandRequest = serde_json::from_value(json!({
            "entity_id": "REMOTE:tv1",
            "entity_type": "teapot",
            "cmd_id": "on"
        }))
        .unwrap();
        assert_eq!(req.entity_type, None);
        assert_eq!(req.resolved_type(), EntityType::Remote);
    }

    #[test]
    fn large_request_ids_survive_parsing() {
        let frame =
            parse_frame(r#"{"kind":"req","req_id":4294967300,"msg":"get_driver_version"}"#).unwrap();
        assert_eq!(frame.req_id, 4_294_967_300);
    }
}
