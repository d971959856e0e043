use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// ClientQuery
// ---------------------------------------------------------------------------

/// Identity tuple a device announces in the first frame of every connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientQuery {
    pub app: String,
    pub os: String,
    pub device: String,
    pub device_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdk_version: Option<u32>,
}

impl ClientQuery {
    pub fn new(
        app: impl Into<String>,
        os: impl Into<String>,
        device: impl Into<String>,
        device_id: impl Into<String>,
    ) -> Self {
        Self {
            app: app.into(),
            os: os.into(),
            device: device.into(),
            device_id: device_id.into(),
            sdk_version: None,
        }
    }

    pub fn with_sdk_version(mut self, version: u32) -> Self {
        self.sdk_version = Some(version);
        self
    }

    /// The id of the logical connection this query opens.
    pub fn client_id(&self) -> ClientId {
        ClientId(format!(
            "{}#{}#{}#{}",
            self.app, self.os, self.device, self.device_id
        ))
    }

    /// Key used to group reconnect attempts from the same app on the same device.
    pub fn attempt_key(&self) -> String {
        format!("{}-{}-{}", self.os, self.device, self.app)
    }

    pub fn sdk_version(&self) -> u32 {
        self.sdk_version.unwrap_or(0)
    }

    /// Provisional descriptor used while the device is still bootstrapping.
    pub fn uninitialized(&self) -> UninitializedClient {
        UninitializedClient {
            os: self.os.clone(),
            device_name: self.device.clone(),
            app_name: self.app.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// ClientId
// ---------------------------------------------------------------------------

/// `app#os#device#device_id`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(String);

impl ClientId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&ClientQuery> for ClientId {
    fn from(query: &ClientQuery) -> Self {
        query.client_id()
    }
}

// ---------------------------------------------------------------------------
// UninitializedClient
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UninitializedClient {
    pub os: String,
    pub device_name: String,
    pub app_name: String,
}

// ---------------------------------------------------------------------------
// PluginKey
// ---------------------------------------------------------------------------

/// Scope of a plugin's message queue and persisted state.
///
/// Client plugins are keyed by `connectionId#pluginId`; device plugins by
/// `deviceSerial#pluginId` so their state survives app reconnects.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PluginKey(String);

impl PluginKey {
    pub fn for_client(client: &ClientId, plugin_id: &str) -> Self {
        Self(format!("{}#{}", client, plugin_id))
    }

    pub fn for_device(device_serial: &str, plugin_id: &str) -> Self {
        Self(format!("{}#{}", device_serial, plugin_id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True when this key is scoped under the given owner (a client id or a
    /// device serial).
    pub fn belongs_to(&self, owner: &str) -> bool {
        self.0
            .strip_prefix(owner)
            .is_some_and(|rest| rest.starts_with('#') && !rest[1..].contains('#'))
    }
}

impl fmt::Display for PluginKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
