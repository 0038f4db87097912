//! JSON config file loading: the process-wide document described in the
//! config reference (mqtt connection, mail/SMS settings, watch list,
//! notification list).

use crate::error::WatchError;
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

// ---------------------------------------------------------------------------
// Severity / edge / method enums shared across the config and runtime
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Debug,
    #[default]
    Info,
    Warning,
    Critical,
}

impl Severity {
    pub fn rank(self) -> u8 {
        match self {
            Severity::Debug => 0,
            Severity::Info => 1,
            Severity::Warning => 2,
            Severity::Critical => 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Edge {
    #[default]
    Level,
    Rising,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    Log,
    Mail,
    Sms,
}

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct Config {
    pub mqtt: MqttConfig,
    #[serde(rename = "messageService")]
    pub message_service: MessageServiceConfig,
    #[serde(rename = "watchList")]
    pub watch_list: Option<Vec<WatchSpec>>,
    #[serde(rename = "notificationList")]
    pub notification_list: Option<Vec<NotificationListEntry>>,
}

#[derive(Debug, Deserialize)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct MessageServiceConfig {
    pub mail: MailConfig,
    pub sms: Option<SmsConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MailConfig {
    pub host: String,
    pub port: u16,
    pub from: String,
    #[serde(rename = "ignoreTLS", default)]
    pub ignore_tls: bool,
    #[serde(rename = "requireTLS", default)]
    pub require_tls: bool,
    pub name: Option<String>,
    pub tls: Option<MailTlsConfig>,
    pub auth: Option<MailAuthConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MailTlsConfig {
    pub servername: Option<String>,
    #[serde(rename = "rejectUnauthorized", default = "default_true")]
    pub reject_unauthorized: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MailAuthConfig {
    pub user: String,
    pub pass: String,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SmsConfig {
    #[serde(default)]
    pub enabled: bool,
    pub sid: Option<String>,
    pub token: Option<String>,
    pub service: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WatchSpec {
    pub id: String,
    pub topic: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub dynamic: bool,
    pub events: Vec<EventSpec>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventSpec {
    pub subject: String,
    pub default: Value,
    #[serde(rename = "activeHours")]
    pub active_hours: Option<Vec<String>>,
    pub dependencies: Option<Vec<DependencySpec>>,
    #[serde(default)]
    pub dynamic: bool,
    #[serde(rename = "stateKey")]
    pub state_key: Option<String>,
    pub conditions: Vec<ConditionSpec>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DependencySpec {
    pub path: String,
    pub state: Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConditionSpec {
    pub value: Option<Value>,
    pub condition: Option<String>,
    pub log: Option<String>,
    pub message: Option<String>,
    #[serde(default)]
    pub severity: Severity,
    #[serde(default)]
    pub edge: Edge,
    #[serde(rename = "cooldownSec")]
    pub cooldown_sec: Option<u64>,
    pub key: Option<String>,
    #[serde(rename = "warningThreshold")]
    pub warning_threshold: Option<u64>,
    #[serde(rename = "warningMessage")]
    pub warning_message: Option<String>,
    #[serde(rename = "warningSeverity", default = "default_warning_severity")]
    pub warning_severity: Severity,
    pub reset: Option<u64>,
}

fn default_warning_severity() -> Severity {
    Severity::Warning
}

#[derive(Debug, Deserialize)]
pub struct NotificationListEntry {
    pub id: String,
    pub recipients: Vec<RecipientSpec>,
}

#[derive(Debug, Deserialize)]
pub struct RecipientSpec {
    #[serde(rename = "type")]
    pub method: Method,
    pub recipient: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(rename = "minSeverity", default)]
    pub min_severity: Severity,
}

// ---------------------------------------------------------------------------
// Load + validate
// ---------------------------------------------------------------------------

/// Read and parse the JSON config document, then enforce the startup
/// validation rule that `watchList`/`notificationList` must be present
/// arrays (an unknown recipient `type` already fails to parse via `serde`,
/// which is reported the same way).
pub fn load(path: &str) -> Result<Config> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config: {path}"))?;
    let config: Config = serde_json::from_str(&contents)
        .with_context(|| format!("failed to parse config: {path}"))?;

    if config.watch_list.is_none() {
        bail!(WatchError::Config("'watchList' is missing or not an array".to_string()));
    }
    if config.notification_list.is_none() {
        bail!(WatchError::Config("'notificationList' is missing or not an array".to_string()));
    }

    Ok(config)
}

/// Build the `watcherId -> topic` lookup used to route incoming publishes.
pub fn watch_topics(config: &Config) -> HashMap<String, String> {
    config
        .watch_list
        .as_deref()
        .unwrap_or_default()
        .iter()
        .filter(|w| w.enabled)
        .map(|w| (w.id.clone(), w.topic.clone()))
        .collect()
}

// ===========================================================================
// Tests
// ===========================================================================
