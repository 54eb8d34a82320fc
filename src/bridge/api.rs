//! Wire types for the bridge's REST API

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;

/// Hue error type reported when the link button has not been pressed
pub const LINK_BUTTON_NOT_PRESSED_ERROR: u64 = 101;

/// One entry of the discovery endpoint's answer
#[derive(Debug, Clone, Deserialize)]
pub struct DiscoveredBridge {
    #[serde(default)]
    pub id: String,
    pub internalipaddress: String,
}

/// Interpretation of the first element of a pairing reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PairingReply {
    Token(String),
    LinkButtonNotPressed,
    Unrecognized,
}

impl PairingReply {
    pub fn from_json(data: &Value) -> Self {
        let Some(first) = data.get(0) else {
            return Self::Unrecognized;
        };

        if first.pointer("/error/type").and_then(Value::as_u64)
            == Some(LINK_BUTTON_NOT_PRESSED_ERROR)
        {
            return Self::LinkButtonNotPressed;
        }

        match first.pointer("/success/username").and_then(Value::as_str) {
            Some(username) if !username.is_empty() => Self::Token(username.to_string()),
            _ => Self::Unrecognized,
        }
    }
}

/// Light record as listed by `GET /api/<token>/lights`
#[derive(Debug, Clone, Deserialize)]
pub struct LightRecord {
    #[serde(default)]
    pub name: String,
    pub state: LightStateRecord,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LightStateRecord {
    pub on: bool,
    /// Everything else (brightness, color, reachability...) passed through untouched
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

pub type LightListing = HashMap<String, LightRecord>;
