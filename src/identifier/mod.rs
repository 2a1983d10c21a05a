//! Entity identifier encoding.
//!
//! Wire identifiers look like `<PREFIX>:<base>[_<suffix>]`. Media players carry
//! no prefix, and neither media players nor remotes carry a suffix.

use crate::model::EntityType;
use std::sync::OnceLock;

static PREFIXING_DISABLED: OnceLock<bool> = OnceLock::new();

/// Prefixes in the order `type_of` tries them.
const PREFIXES: [(EntityType, &str); 8] = [
    (EntityType::Cover, "COVER:"),
    (EntityType::Button, "BUTTON:"),
    (EntityType::Climate, "CLIMATE:"),
    (EntityType::Light, "LIGHT:"),
    (EntityType::Remote, "REMOTE:"),
    (EntityType::Select, "SELECT:"),
    (EntityType::Sensor, "SENSOR:"),
    (EntityType::Switch, "SWITCH:"),
];

/// Sets the process-wide compatibility switch. Only the first call has any
/// effect; later calls are ignored and reported as `false`.
pub fn configure_prefixing(disabled: bool) -> bool {
    let applied = PREFIXING_DISABLED.set(disabled).is_ok();
    if !applied {
        tracing::debug!("entity id prefixing switch already set, ignoring");
    }
    applied
}

pub fn prefixing_disabled() -> bool {
    PREFIXING_DISABLED.get().copied().unwrap_or(false)
}

pub fn prefix_for(entity_type: EntityType) -> Option<&'static str> {
    PREFIXES
        .iter()
        .find(|(t, _)| *t == entity_type)
        .map(|(_, p)| *p)
}

fn carries_suffix(entity_type: EntityType) -> bool {
    !matches!(entity_type, EntityType::MediaPlayer | EntityType::Remote)
}

fn split_prefix(id: &str) -> (Option<EntityType>, &str) {
    for (entity_type, prefix) in PREFIXES {
        if let Some(head) = id.get(..prefix.len()) {
            if head.eq_ignore_ascii_case(prefix) {
                return (Some(entity_type), &id[prefix.len()..]);
            }
        }
    }
    (None, id)
}

/// Builds the wire identifier of `entity_type` for `base`, optionally
/// distinguishing a sub-entity with `suffix`.
pub fn encode(base: &str, entity_type: EntityType, suffix: Option<&str>) -> String {
    encode_with(base, entity_type, suffix, prefixing_disabled())
}

pub(crate) fn encode_with(
    id: &str,
    entity_type: EntityType,
    suffix: Option<&str>,
    prefixing_disabled: bool,
) -> String {
    let (existing, stripped) = split_prefix(id);
    let mut out = match prefix_for(entity_type) {
        Some(_) if prefixing_disabled => stripped.to_string(),
        Some(_) if existing == Some(entity_type) => id.to_string(),
        Some(prefix) => format!("{prefix}{stripped}"),
        None => stripped.to_string(),
    };

    let suffix = suffix.filter(|s| !s.is_empty() && carries_suffix(entity_type));
    if let Some(suffix) = suffix {
        let tail = format!("_{suffix}");
        if !out.ends_with(&tail) {
            out.push_str(&tail);
        }
    }
    out
}

/// Strips the type prefix and, for suffix-carrying types, the trailing
/// `_suffix`, yielding the base identifier shared by all sub-entities.
pub fn decode(id: &str) -> String {
    let (existing, stripped) = split_prefix(id);
    match existing {
        Some(entity_type) if carries_suffix(entity_type) => match stripped.rfind('_') {
            Some(idx) => stripped[..idx].to_string(),
            None => stripped.to_string(),
        },
        _ => stripped.to_string(),
    }
}

pub fn type_of(id: &str) -> EntityType {
    split_prefix(id).0.unwrap_or(EntityType::MediaPlayer)
}

pub fn suffix_of(id: &str) -> Option<&str> {
    id.rfind('_').map(|idx| &id[idx + 1..])
}
