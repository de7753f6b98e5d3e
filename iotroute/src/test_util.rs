//! Fixtures shared by the unit tests.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use parking_lot::Mutex;

use crate::conf::Settings;
use crate::message::{
    ControlDestination, ControlMessage, DataPoint, Measurement, Message, MessageEncoding, TextMessage,
};
use crate::outbound::Publisher;
use crate::routing_cache::RoutingCache;
use crate::types::{Account, ApiKey, Sensor, SensorId};
use crate::{Error, Result};

pub fn sensor_id(n: u8) -> SensorId {
    let mut bytes = [0u8; 12];
    bytes[11] = n;
    bytes[0] = 0x5f;
    SensorId::from_bytes(bytes)
}

/// Storage enabled, no triggers
pub fn test_sensor(n: u8) -> Sensor {
    Sensor {
        id: sensor_id(n),
        account_id: uuid::Uuid::from_u128(n as u128 + 1),
        sensor_key: format!("key-{n}"),
        storage_enabled: true,
        triggers: Vec::new(),
    }
}

pub fn account_of(sensor: &Sensor) -> Account {
    Account { id: sensor.account_id, is_banned: false, has_billing_lockout: false }
}

pub fn key_of(sensor: &Sensor) -> ApiKey {
    ApiKey { key: sensor.sensor_key.clone(), account_id: sensor.account_id, is_read_only: false, is_revoked: false }
}

/// A cache holding one authorized sensor
pub fn loaded_cache() -> (RoutingCache, Sensor) {
    let sensor = test_sensor(1);
    let cache = RoutingCache::new();
    cache.load_sensors(vec![sensor.clone()]).unwrap();
    cache.load_accounts(vec![account_of(&sensor)]).unwrap();
    cache.load_api_keys(vec![key_of(&sensor)]).unwrap();
    (cache, sensor)
}

pub fn measurement(id: SensorId) -> Message {
    let mut data = BTreeMap::new();
    let point = DataPoint { value: 21.5, unit: "C".into(), precision: None, accuracy: None };
    data.insert("temperature".to_string(), point);
    Message::Measurement(Measurement {
        sensor_id: id,
        data,
        location: None,
        timestamp: Utc::now(),
        platform_time: Utc::now(),
    })
}

pub fn text_message(id: SensorId) -> Message {
    Message::Message(TextMessage {
        sensor_id: id,
        data: "hello".into(),
        location: None,
        encoding: MessageEncoding::Plain,
        timestamp: Utc::now(),
        platform_time: Utc::now(),
    })
}

pub fn control_message(id: SensorId, destination: ControlDestination) -> Message {
    Message::ControlMessage(ControlMessage {
        sensor_id: id,
        data: "open".into(),
        destination,
        timestamp: Utc::now(),
        secret: String::new(),
        signature: String::new(),
    })
}

/// Default settings with uncompressed batches, so payloads can be read back as JSON
pub fn settings() -> Settings {
    let mut inner = crate::conf::Inner::default();
    inner.queue.compress = false;
    inner.queue.capacity = 1000;
    Settings::from(inner)
}

#[derive(Default)]
pub struct RecordingPublisher {
    pub published: Mutex<Vec<(String, Bytes)>>,
    pub fail: AtomicBool,
}

impl RecordingPublisher {
    pub fn topics(&self) -> Vec<String> {
        self.published.lock().iter().map(|(t, _)| t.clone()).collect()
    }

    /// Decoded entries published to `topic`, in publish order
    pub fn entries(&self, topic: &str) -> Vec<serde_json::Value> {
        self.published
            .lock()
            .iter()
            .filter(|(t, _)| t == topic)
            .flat_map(|(_, payload)| crate::outbound::decode_batch(payload, false).unwrap())
            .collect()
    }
}

#[async_trait]
impl Publisher for RecordingPublisher {
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::Msg("broker unavailable".into()));
        }
        self.published.lock().push((topic.to_owned(), payload));
        Ok(())
    }
}

pub fn recording_publisher() -> Arc<RecordingPublisher> {
    Arc::new(RecordingPublisher::default())
}
