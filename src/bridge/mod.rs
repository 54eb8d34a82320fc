//! Bridge client: discovery, pairing and on/off control of the lights
//! behind a local lighting bridge.
//!
//! Every operation converts failures into a plain return value (`None`,
//! `false`, an empty list or [`PairingOutcome::Failed`]) after logging them.

pub mod api;
pub mod transport;

use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::storage::KeyValueStore;
use api::{DiscoveredBridge, LightListing, LightStateRecord, PairingReply};
use transport::{BridgeError, BridgeTransport};

/// Namespace shared by every persisted entry
pub const STORAGE_PREFIX: &str = "handclap_";
pub const BRIDGE_IP_KEY: &str = "handclap_bridgeIp";
pub const USERNAME_KEY: &str = "handclap_username";

/// Returned in place of a token when the bridge wants its link button pressed
pub const LINK_BUTTON_NOT_PRESSED: &str = "link_button_not_pressed";

/// Bridge client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub discovery_url: String,
    pub app_id: String,
    /// Second half of the pairing devicetype (`<app_id>#<device_name>`)
    pub device_name: String,
    pub request_timeout_ms: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            discovery_url: "https://discovery.meethue.com/".to_string(),
            app_id: "handclap".to_string(),
            device_name: "phone".to_string(),
            request_timeout_ms: 5000,
        }
    }
}

impl BridgeConfig {
    pub fn devicetype(&self) -> String {
        format!("{}#{}", self.app_id, self.device_name)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// A light fixture as last fetched from the bridge
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Light {
    pub id: String,
    pub name: String,
    pub state: LightStateRecord,
}

impl Light {
    pub fn is_on(&self) -> bool {
        self.state.on
    }
}

/// Result of the pairing handshake
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PairingOutcome {
    /// The bridge issued this token
    Paired(String),
    /// Press the link button on the bridge, then retry
    LinkButtonNotPressed,
    Failed,
}

impl PairingOutcome {
    pub fn token(&self) -> Option<&str> {
        match self {
            PairingOutcome::Paired(token) => Some(token.as_str()),
            _ => None,
        }
    }
}

impl fmt::Display for PairingOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PairingOutcome::Paired(token) => f.write_str(token),
            PairingOutcome::LinkButtonNotPressed => f.write_str(LINK_BUTTON_NOT_PRESSED),
            PairingOutcome::Failed => f.write_str("failed"),
        }
    }
}

/// Per-light account of one toggle pass.
///
/// Requests go out one light at a time and the pass stops at the first
/// failed request. Lights in `applied` were switched on the bridge and in the
/// local cache; `failed` and every light after it were left untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToggleReport {
    /// Target state chosen for all lights
    pub turn_on: bool,
    pub applied: Vec<String>,
    pub failed: Option<String>,
    pub error: Option<String>,
}

impl ToggleReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_none()
    }
}

/// Majority rule: turn everything on when fewer than half the lights are on.
pub fn should_turn_on(lights: &[Light]) -> bool {
    let on = lights.iter().filter(|l| l.is_on()).count();
    on * 2 < lights.len()
}

/// Client for one bridge, holding the persisted connection and a light cache
pub struct BridgeClient {
    config: BridgeConfig,
    transport: Arc<dyn BridgeTransport>,
    store: Box<dyn KeyValueStore>,
    bridge_ip: Option<String>,
    username: Option<String>,
    lights: Vec<Light>,
}

impl BridgeClient {
    /// Create a client, restoring address and token from `store`
    pub fn new(
        config: BridgeConfig,
        transport: Arc<dyn BridgeTransport>,
        store: Box<dyn KeyValueStore>,
    ) -> Self {
        let bridge_ip = store.get(BRIDGE_IP_KEY);
        let username = store.get(USERNAME_KEY);

        if let Some(ref ip) = bridge_ip {
            log::info!(
                "Restored bridge {} ({})",
                ip,
                if username.is_some() { "paired" } else { "not paired" }
            );
        }

        Self {
            config,
            transport,
            store,
            bridge_ip,
            username,
            lights: Vec::new(),
        }
    }

    /// Find a bridge on the local network, preferring the cached address
    pub async fn discover_bridge(&mut self) -> Option<String> {
        if let Some(ref ip) = self.bridge_ip {
            return Some(ip.clone());
        }

        match self.fetch_discovery().await {
            Ok(Some(ip)) => {
                log::info!("✓ Discovered bridge at {}", ip);
                self.bridge_ip = Some(ip.clone());
                self.save_to_storage();
                Some(ip)
            }
            Ok(None) => {
                log::warn!("No bridges registered at {}", self.config.discovery_url);
                None
            }
            Err(e) => {
                log::error!("Error discovering bridge: {}", e);
                None
            }
        }
    }

    async fn fetch_discovery(&self) -> Result<Option<String>, BridgeError> {
        let url = self.config.discovery_url.as_str();
        let reply = self.transport.get(url).await?.require_success(url)?;
        let bridges: Vec<DiscoveredBridge> = reply.json(url)?;

        log::debug!("Discovery returned {} bridge(s)", bridges.len());
        Ok(bridges.into_iter().next().map(|b| b.internalipaddress))
    }

    /// Pair with the bridge, discovering it first if no address is known
    pub async fn create_user(&mut self) -> PairingOutcome {
        if self.bridge_ip.is_none() && self.discover_bridge().await.is_none() {
            return PairingOutcome::Failed;
        }
        let Some(ip) = self.bridge_ip.clone() else {
            return PairingOutcome::Failed;
        };

        let url = format!("http://{}/api", ip);
        let devicetype = self.config.devicetype();
        let body = json!({ "devicetype": devicetype });

        let data = match self.transport.post_json(&url, &body).await {
            Ok(reply) => reply.json::<serde_json::Value>(&url),
            Err(e) => Err(e),
        };
        let data = match data {
            Ok(data) => data,
            Err(e) => {
                log::error!("Error creating bridge user: {}", e);
                return PairingOutcome::Failed;
            }
        };

        match PairingReply::from_json(&data) {
            PairingReply::LinkButtonNotPressed => {
                log::info!("Bridge at {} is waiting for its link button", ip);
                PairingOutcome::LinkButtonNotPressed
            }
            PairingReply::Token(token) => {
                log::info!("✓ Paired with bridge at {} as {}", ip, devicetype);
                self.username = Some(token.clone());
                self.save_to_storage();
                PairingOutcome::Paired(token)
            }
            PairingReply::Unrecognized => {
                log::warn!("Unexpected pairing reply from {}: {}", ip, data);
                PairingOutcome::Failed
            }
        }
    }

    /// Fetch every light and replace the cache. Empty when not connected or on failure.
    pub async fn get_lights(&mut self) -> Vec<Light> {
        if !self.is_connected() {
            return Vec::new();
        }

        match self.try_get_lights().await {
            Ok(lights) => lights,
            Err(e) => {
                log::error!("Error getting lights: {}", e);
                Vec::new()
            }
        }
    }

    /// Like [`get_lights`](Self::get_lights), but a failed fetch is reported
    /// instead of looking like an empty bridge.
    pub async fn try_get_lights(&mut self) -> Result<Vec<Light>, BridgeError> {
        self.refresh_lights().await.map(<[Light]>::to_vec)
    }

    async fn refresh_lights(&mut self) -> Result<&[Light], BridgeError> {
        let (Some(ip), Some(username)) = (&self.bridge_ip, &self.username) else {
            return Ok(&[]);
        };

        let url = format!("http://{}/api/{}/lights", ip, username);
        let reply = self.transport.get(&url).await?.require_success(&url)?;
        let listing: LightListing = reply.json(&url)?;

        let mut lights: Vec<Light> = listing
            .into_iter()
            .map(|(id, record)| Light {
                id,
                name: record.name,
                state: record.state,
            })
            .collect();
        // Numeric ids in numeric order, like the bridge's own listing
        lights.sort_by(|a, b| {
            (a.id.parse::<u64>().ok(), &a.id).cmp(&(b.id.parse::<u64>().ok(), &b.id))
        });

        log::debug!("Fetched {} light(s)", lights.len());
        self.lights = lights;
        Ok(&self.lights)
    }

    /// Switch every light to the state the majority is not in.
    pub async fn toggle_all_lights(&mut self) -> bool {
        self.toggle_all_lights_report()
            .await
            .is_some_and(|report| report.is_complete())
    }

    /// Same as [`toggle_all_lights`](Self::toggle_all_lights) with a per-light account.
    ///
    /// `None` means nothing was attempted (not connected, or the light list
    /// could not be fetched).
    pub async fn toggle_all_lights_report(&mut self) -> Option<ToggleReport> {
        let (Some(ip), Some(username)) = (self.bridge_ip.clone(), self.username.clone()) else {
            log::warn!("Cannot toggle lights: not connected to a bridge");
            return None;
        };

        if self.lights.is_empty() {
            if let Err(e) = self.refresh_lights().await {
                log::error!("Error toggling lights: {}", e);
                return None;
            }
        }

        let turn_on = should_turn_on(&self.lights);
        let body = json!({ "on": turn_on });
        log::info!(
            "Turning {} {} light(s)",
            if turn_on { "on" } else { "off" },
            self.lights.len()
        );

        let mut report = ToggleReport {
            turn_on,
            applied: Vec::with_capacity(self.lights.len()),
            failed: None,
            error: None,
        };

        for light in self.lights.iter_mut() {
            let url = format!("http://{}/api/{}/lights/{}/state", ip, username, light.id);
            match self.transport.put_json(&url, &body).await {
                Ok(reply) => {
                    if !reply.is_success() {
                        log::warn!("Light {} answered HTTP {}", light.id, reply.status);
                    }
                    light.state.on = turn_on;
                    report.applied.push(light.id.clone());
                }
                Err(e) => {
                    log::error!("Error toggling light {}: {}", light.id, e);
                    report.failed = Some(light.id.clone());
                    report.error = Some(e.to_string());
                    break;
                }
            }
        }

        Some(report)
    }

    pub fn is_connected(&self) -> bool {
        self.bridge_ip.is_some() && self.username.is_some()
    }

    pub fn bridge_ip(&self) -> Option<&str> {
        self.bridge_ip.as_deref()
    }

    /// Use `ip` as the bridge address without discovery; persisted immediately.
    pub fn set_bridge_ip(&mut self, ip: impl Into<String>) {
        let ip = ip.into();
        log::info!("Bridge address set to {}", ip);
        self.bridge_ip = Some(ip);
        self.save_to_storage();
    }

    /// Forget address and token. The light cache stays until the next fetch.
    pub fn reset(&mut self) {
        self.bridge_ip = None;
        self.username = None;

        for key in [BRIDGE_IP_KEY, USERNAME_KEY] {
            if let Err(e) = self.store.remove(key) {
                log::warn!("Failed to clear {}: {:#}", key, e);
            }
        }
        log::info!("Bridge connection reset");
    }

    /// Lights from the last successful fetch
    pub fn cached_lights(&self) -> &[Light] {
        &self.lights
    }

    fn save_to_storage(&mut self) {
        let entries = [
            (BRIDGE_IP_KEY, self.bridge_ip.as_deref()),
            (USERNAME_KEY, self.username.as_deref()),
        ];
        for (key, value) in entries {
            let Some(value) = value else {
                continue;
            };
            if let Err(e) = self.store.set(key, value) {
                log::warn!("Failed to persist {}: {:#}", key, e);
            }
        }
    }
}
