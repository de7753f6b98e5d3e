//! Internal message model.
//!
//! Sensors submit three kinds of messages: measurements (named numeric data
//! points), free text messages and control messages addressed to an actuator.
//! Every routed message yields a [`NetworkEvent`] recording what happened to it.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{AccountId, SensorId};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataPoint {
    pub value: f64,
    #[serde(default)]
    pub unit: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub precision: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accuracy: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoLocation {
    pub latitude: f64,
    pub longitude: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    pub sensor_id: SensorId,
    pub data: BTreeMap<String, DataPoint>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<GeoLocation>,
    pub timestamp: DateTime<Utc>,
    pub platform_time: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageEncoding {
    #[default]
    Plain,
    Base64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextMessage {
    pub sensor_id: SensorId,
    pub data: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<GeoLocation>,
    #[serde(default)]
    pub encoding: MessageEncoding,
    pub timestamp: DateTime<Utc>,
    pub platform_time: DateTime<Utc>,
}

/// Channel a control message is delivered over
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlDestination {
    Mqtt,
    Grpc,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlMessage {
    pub sensor_id: SensorId,
    pub data: String,
    pub destination: ControlDestination,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub secret: String,
    #[serde(default)]
    pub signature: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    Measurement,
    Message,
    ControlMessage,
}

impl MessageType {
    /// Plural name used in topic templates (`$type`)
    #[inline]
    pub fn topic_name(&self) -> &'static str {
        match self {
            MessageType::Measurement => "measurements",
            MessageType::Message => "messages",
            MessageType::ControlMessage => "control",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload")]
pub enum Message {
    Measurement(Measurement),
    Message(TextMessage),
    ControlMessage(ControlMessage),
}

impl Message {
    #[inline]
    pub fn sensor_id(&self) -> SensorId {
        match self {
            Message::Measurement(m) => m.sensor_id,
            Message::Message(m) => m.sensor_id,
            Message::ControlMessage(m) => m.sensor_id,
        }
    }

    #[inline]
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::Measurement(_) => MessageType::Measurement,
            Message::Message(_) => MessageType::Message,
            Message::ControlMessage(_) => MessageType::ControlMessage,
        }
    }

    #[inline]
    pub fn is_control(&self) -> bool {
        matches!(self, Message::ControlMessage(_))
    }

    /// Sets the time the platform took the message in; control messages carry none
    #[inline]
    pub fn set_platform_time(&mut self, t: DateTime<Utc>) {
        match self {
            Message::Measurement(m) => m.platform_time = t,
            Message::Message(m) => m.platform_time = t,
            Message::ControlMessage(_) => {}
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NetworkEventType {
    MessageStorage,
    MessageLiveData,
    MessageTriggered,
    /// A router failed on this message and the chain was stopped
    MessageDropped,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkEvent {
    pub sensor_id: SensorId,
    pub account_id: AccountId,
    /// Filled in by the base router
    pub message_type: Option<MessageType>,
    pub actions: Vec<NetworkEventType>,
    pub platform_time: DateTime<Utc>,
}

impl NetworkEvent {
    #[inline]
    pub fn new(sensor_id: SensorId, account_id: AccountId) -> Self {
        Self {
            sensor_id,
            account_id,
            message_type: None,
            actions: Vec::new(),
            platform_time: Utc::now(),
        }
    }

    #[inline]
    pub fn add_action(&mut self, action: NetworkEventType) {
        self.actions.push(action);
    }

    #[inline]
    pub fn has_action(&self, action: NetworkEventType) -> bool {
        self.actions.contains(&action)
    }
}
