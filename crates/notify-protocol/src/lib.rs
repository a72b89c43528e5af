// notify-protocol: bus channel vocabulary and notification envelope types.
//
// A bus message arrives as an opaque (channel, payload) pair.  The channel
// string decides WHO receives the message (`ChannelRoute`); the payload body
// decides WHAT it is (`MessageKind`, detected from discriminant fields).  The
// two are deliberately independent: an `alert:*` channel usually carries a
// crisis payload, but nothing on the wire enforces that.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// Channel string is not one of the four routable shapes.
    #[error("invalid channel '{0}'")]
    InvalidChannel(String),
    /// Payload carries none of the known discriminant fields.
    #[error("payload matches no known message kind")]
    UnknownKind,
    /// Payload failed to deserialize into the shape for its detected kind.
    #[error("payload is not a valid {kind} message: {reason}")]
    InvalidMessage { kind: MessageKind, reason: String },
}

// ---------------------------------------------------------------------------
// Channel routes
// ---------------------------------------------------------------------------

/// Routing intent parsed from a bus channel string.
///
/// The four accepted shapes:
/// - `project:{project_id}:user:{user_id}`
/// - `campaign:{campaign_id}:user:{user_id}`
/// - `alert:{subtype}:user:{user_id}`
/// - `system:{subtype}` (broadcast; carries no user)
///
/// Identifiers must be non-empty and must not contain colons; the split is on
/// ASCII `:` only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelRoute {
    Project { project_id: String, user_id: String },
    Campaign { campaign_id: String, user_id: String },
    Alert { subtype: String, user_id: String },
    System { subtype: String },
}

/// Parse a bus channel string into its routing intent.
pub fn parse_channel(channel: &str) -> Result<ChannelRoute, ProtocolError> {
    let parts: Vec<&str> = channel.split(':').collect();
    match parts.as_slice() {
        ["project", project_id, "user", user_id] if !project_id.is_empty() && !user_id.is_empty() => {
            Ok(ChannelRoute::Project {
                project_id: (*project_id).to_owned(),
                user_id: (*user_id).to_owned(),
            })
        }
        ["campaign", campaign_id, "user", user_id]
            if !campaign_id.is_empty() && !user_id.is_empty() =>
        {
            Ok(ChannelRoute::Campaign {
                campaign_id: (*campaign_id).to_owned(),
                user_id: (*user_id).to_owned(),
            })
        }
        ["alert", subtype, "user", user_id] if !subtype.is_empty() && !user_id.is_empty() => {
            Ok(ChannelRoute::Alert {
                subtype: (*subtype).to_owned(),
                user_id: (*user_id).to_owned(),
            })
        }
        ["system", subtype] if !subtype.is_empty() => Ok(ChannelRoute::System {
            subtype: (*subtype).to_owned(),
        }),
        _ => Err(ProtocolError::InvalidChannel(channel.to_owned())),
    }
}

// ---------------------------------------------------------------------------
// Message kinds
// ---------------------------------------------------------------------------

/// Classification of a bus payload, detected from its discriminant fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageKind {
    DataOnboarding,
    AnalyticsPipeline,
    CrisisAlert,
    CampaignEvent,
    System,
}

impl MessageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageKind::DataOnboarding => "DATA_ONBOARDING",
            MessageKind::AnalyticsPipeline => "ANALYTICS_PIPELINE",
            MessageKind::CrisisAlert => "CRISIS_ALERT",
            MessageKind::CampaignEvent => "CAMPAIGN_EVENT",
            MessageKind::System => "SYSTEM",
        }
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Detect the message kind from a payload's top-level fields.
///
/// Rules are evaluated in order; first match wins.  The shapes overlap (an
/// analytics payload may also carry `source_id`), so the order is part of the
/// contract and must not be rearranged.
pub fn detect_message_kind(payload: &[u8]) -> Result<MessageKind, ProtocolError> {
    let value: serde_json::Value =
        serde_json::from_slice(payload).map_err(|_| ProtocolError::UnknownKind)?;
    let Some(map) = value.as_object() else {
        return Err(ProtocolError::UnknownKind);
    };

    if map.contains_key("total_records") {
        Ok(MessageKind::AnalyticsPipeline)
    } else if map.contains_key("source_id") && map.contains_key("record_count") {
        Ok(MessageKind::DataOnboarding)
    } else if map.contains_key("alert_type") {
        Ok(MessageKind::CrisisAlert)
    } else if map.contains_key("campaign_id") {
        Ok(MessageKind::CampaignEvent)
    } else if map.contains_key("system_event") {
        Ok(MessageKind::System)
    } else {
        Err(ProtocolError::UnknownKind)
    }
}

// ---------------------------------------------------------------------------
// Typed payloads
// ---------------------------------------------------------------------------
//
// Only the discriminant fields are required; everything else is optional so
// partial publisher payloads still deserialize.  Unknown fields are ignored.

/// A data source finished (or progressed through) onboarding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataOnboardingEvent {
    pub source_id: String,
    pub record_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

/// Progress of an analytics pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalyticsPipelineEvent {
    pub total_records: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processed_records: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_records: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
}

/// A crisis-severity alert.  Also forwarded to the webhook sink out-of-band
/// of session delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrisisAlertEvent {
    pub alert_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metric: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_value: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threshold: Option<f64>,
    #[serde(default)]
    pub affected_aspects: Vec<String>,
    /// Mention objects are passed through untouched.
    #[serde(default)]
    pub sample_mentions: Vec<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_window: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_required: Option<String>,
}

/// A campaign lifecycle or metrics event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CampaignUpdateEvent {
    pub campaign_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub campaign_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

// ---------------------------------------------------------------------------
// Notification envelope
// ---------------------------------------------------------------------------

/// Typed payload carried inside a [`Notification`].  Serializes as the inner
/// structure directly (no extra tagging; the envelope's `type` field is the
/// discriminant on the wire).
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum NotificationPayload {
    DataOnboarding(DataOnboardingEvent),
    AnalyticsPipeline(AnalyticsPipelineEvent),
    CrisisAlert(CrisisAlertEvent),
    Campaign(CampaignUpdateEvent),
    /// System events carry arbitrary JSON.
    System(serde_json::Value),
}

/// The outbound wrapper delivered to clients: `{type, timestamp, payload}`.
///
/// Field order is part of the wire contract; serde emits fields in
/// declaration order, so this struct must not be reordered.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub timestamp: DateTime<Utc>,
    pub payload: NotificationPayload,
}

/// Deserialize `payload` into the typed structure for `kind` and wrap it in a
/// [`Notification`] stamped with the current time.
///
/// Fails with [`ProtocolError::InvalidMessage`] when the bytes do not match
/// the expected shape.  The SYSTEM kind accepts any JSON value.
pub fn transform(kind: MessageKind, payload: &[u8]) -> Result<Notification, ProtocolError> {
    let payload = match kind {
        MessageKind::DataOnboarding => NotificationPayload::DataOnboarding(parse(kind, payload)?),
        MessageKind::AnalyticsPipeline => {
            NotificationPayload::AnalyticsPipeline(parse(kind, payload)?)
        }
        MessageKind::CrisisAlert => NotificationPayload::CrisisAlert(parse(kind, payload)?),
        MessageKind::CampaignEvent => NotificationPayload::Campaign(parse(kind, payload)?),
        MessageKind::System => NotificationPayload::System(parse(kind, payload)?),
    };
    Ok(Notification {
        kind,
        timestamp: Utc::now(),
        payload,
    })
}

fn parse<T: DeserializeOwned>(kind: MessageKind, payload: &[u8]) -> Result<T, ProtocolError> {
    serde_json::from_slice(payload).map_err(|e| ProtocolError::InvalidMessage {
        kind,
        reason: e.to_string(),
    })
}
