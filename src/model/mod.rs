use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Logical entity kinds a driver can expose to the remote.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Button,
    Climate,
    Cover,
    Light,
    MediaPlayer,
    Remote,
    Select,
    Sensor,
    Switch,
}

impl EntityType {
    pub const ALL: [EntityType; 9] = [
        EntityType::Button,
        EntityType::Climate,
        EntityType::Cover,
        EntityType::Light,
        EntityType::MediaPlayer,
        EntityType::Remote,
        EntityType::Select,
        EntityType::Sensor,
        EntityType::Switch,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Button => "button",
            Self::Climate => "climate",
            Self::Cover => "cover",
            Self::Light => "light",
            Self::MediaPlayer => "media_player",
            Self::Remote => "remote",
            Self::Select => "select",
            Self::Sensor => "sensor",
            Self::Switch => "switch",
        }
    }

    /// Case-insensitive lookup of the wire name.
    pub fn parse(raw: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(raw))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeviceState {
    Connected,
    Connecting,
    Disconnected,
    Error,
}

/// Media player state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum State {
    Unavailable,
    Unknown,
    On,
    Off,
    Playing,
    Paused,
    Standby,
    Buffering,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RemoteState {
    On,
    Off,
    Unavailable,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SensorState {
    On,
    Unavailable,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SelectState {
    On,
    Unavailable,
    Unknown,
}

/// Localized text keyed by language code (`en`, `de`, ...).
pub type LocalizedText = BTreeMap<String, String>;

pub fn english(text: impl Into<String>) -> LocalizedText {
    let mut map = LocalizedText::new();
    map.insert("en".to_string(), text.into());
    map
}

/// Entity offered to the remote in `available_entities`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AvailableEntity {
    pub entity_id: String,
    pub entity_type: EntityType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    pub name: LocalizedText,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub features: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub area: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Contents of `driver.json`. Only the fields the engine reads are typed;
/// everything else is passed through to `get_driver_metadata` untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriverMetadata {
    #[serde(default)]
    pub driver_id: Option<String>,
    pub name: LocalizedText,
    pub version: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl DriverMetadata {
    pub fn display_name(&self) -> String {
        self.name
            .get("en")
            .or_else(|| self.name.values().next())
            .cloned()
            .unwrap_or_default()
    }
}

/// Payload of an `entity_change` event or one element of `entity_states`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityStateChanged {
    pub entity_id: String,
    pub entity_type: EntityType,
    pub attributes: Value,
}

/// Settings page rendered by the remote during setup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettingsPage {
    pub title: LocalizedText,
    pub settings: Vec<Setting>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Setting {
    pub id: String,
    pub label: LocalizedText,
    pub field: SettingField,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SettingField {
    Text { value: String },
    Password { value: String },
    Number { value: f64 },
    Checkbox { value: bool },
    Dropdown(Dropdown),
    Label { value: LocalizedText },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dropdown {
    pub items: Vec<DropdownItem>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DropdownItem {
    pub id: String,
    pub label: LocalizedText,
}

impl DropdownItem {
    pub fn new(id: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            label: english(label),
        }
    }
}
