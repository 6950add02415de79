use std::collections::BTreeMap;

use orchestra_core::config::NotifyConfig;
use orchestra_core::{Platform, ProbeId};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::error::NotifyError;

/// Gateway platform codes.
const PLATFORM_IOS: u8 = 1;
const PLATFORM_ANDROID: u8 = 2;

/// One probe selected to receive a push.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushTarget {
    pub probe_id: ProbeId,
    pub token: String,
    pub platform: Platform,
}

/// What a push carries to the probe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PushPayload {
    /// Operator-visible alert. An `href` key in `extra` makes the app open it.
    Alert {
        message: String,
        extra: Map<String, Value>,
    },
    /// Silent push telling the probe to fetch and run a work item.
    Experiment { experiment_id: String },
}

impl PushPayload {
    fn data(&self) -> Value {
        match self {
            PushPayload::Alert { extra, .. } => {
                let kind = if extra.contains_key("href") {
                    "open_href"
                } else {
                    "default"
                };
                json!({ "type": kind, "payload": extra })
            }
            PushPayload::Experiment { experiment_id } => json!({
                "type": "run_experiment",
                "payload": { "experiment_id": experiment_id },
            }),
        }
    }
}

/// A single entry of a gateway batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GorushNotification {
    pub tokens: Vec<String>,
    pub platform: u8,
    pub message: String,
    pub topic: String,
    pub data: Value,
    pub content_available: bool,
    pub notification: BTreeMap<String, String>,
}

/// Body of `POST /api/push`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GorushRequest {
    pub notifications: Vec<GorushNotification>,
}

/// Per-platform settings needed to address a notification.
#[derive(Debug, Clone, Default)]
pub struct PushSettings {
    pub ios_topic: Option<String>,
    pub android_click_action: Option<String>,
}

impl PushSettings {
    /// Build the gateway notification for one target.
    pub fn build(
        &self,
        target: &PushTarget,
        payload: &PushPayload,
    ) -> Result<GorushNotification, NotifyError> {
        let mut notification = GorushNotification {
            tokens: vec![target.token.clone()],
            platform: 0,
            message: String::new(),
            topic: String::new(),
            data: payload.data(),
            content_available: false,
            notification: BTreeMap::new(),
        };

        match payload {
            PushPayload::Alert { message, .. } => notification.message = message.clone(),
            PushPayload::Experiment { .. } => notification.content_available = true,
        }

        match &target.platform {
            Platform::Ios => {
                notification.platform = PLATFORM_IOS;
                notification.topic = self
                    .ios_topic
                    .clone()
                    .ok_or(NotifyError::MissingConfig("notify.ios_topic"))?;
            }
            Platform::Android => {
                notification.platform = PLATFORM_ANDROID;
                let action = self
                    .android_click_action
                    .clone()
                    .ok_or(NotifyError::MissingConfig("notify.android_click_action"))?;
                notification
                    .notification
                    .insert("click_action".to_string(), action);
            }
            Platform::Other(name) => {
                return Err(NotifyError::UnsupportedPlatform {
                    platform: name.clone(),
                })
            }
        }

        Ok(notification)
    }
}

impl From<&NotifyConfig> for PushSettings {
    fn from(config: &NotifyConfig) -> Self {
        Self {
            ios_topic: config.ios_topic.clone(),
            android_click_action: config.android_click_action.clone(),
        }
    }
}
