use std::fmt;
use std::ops::Deref;
use std::str::FromStr;
use std::sync::Arc;

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize, Serializer};

use crate::{Error, Result};

pub type AccountId = uuid::Uuid;

/// Name of a live data handler instance, e.g. `"livedata-01"`
pub type Target = String;

const SENSOR_ID_LEN: usize = 12;

///12-byte object id, written as 24 hex characters.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SensorId([u8; SENSOR_ID_LEN]);

impl SensorId {
    #[inline]
    pub const fn from_bytes(bytes: [u8; SENSOR_ID_LEN]) -> Self {
        SensorId(bytes)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; SENSOR_ID_LEN] {
        &self.0
    }

    /// The all-zero id never identifies a sensor
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }
}

impl FromStr for SensorId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut bytes = [0u8; SENSOR_ID_LEN];
        hex::decode_to_slice(s.trim(), &mut bytes)
            .map_err(|e| Error::InvalidArgument(format!("invalid sensor id '{s}', {e}")))?;
        Ok(SensorId(bytes))
    }
}

impl fmt::Display for SensorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for SensorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SensorId({self})")
    }
}

impl Serialize for SensorId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for SensorId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        SensorId::from_str(&String::deserialize(deserializer)?).map_err(de::Error::custom)
    }
}

/// Summary of one trigger rule attached to a sensor
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SensorTrigger {
    pub has_actions: bool,
    pub is_text_trigger: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sensor {
    pub id: SensorId,
    pub account_id: AccountId,
    /// Secret shared with the device, also the API key that authorizes it
    pub sensor_key: String,
    #[serde(default)]
    pub storage_enabled: bool,
    #[serde(default)]
    pub triggers: Vec<SensorTrigger>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    #[serde(default)]
    pub is_banned: bool,
    #[serde(default)]
    pub has_billing_lockout: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiKey {
    pub key: String,
    pub account_id: AccountId,
    #[serde(default)]
    pub is_read_only: bool,
    #[serde(default)]
    pub is_revoked: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RouteType {
    LiveDataSubscription,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RoutingTarget {
    pub target: Target,
    #[serde(rename = "type")]
    pub route_type: RouteType,
}

impl RoutingTarget {
    #[inline]
    pub fn live_data<T: Into<Target>>(target: T) -> Self {
        Self { target: target.into(), route_type: RouteType::LiveDataSubscription }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveDataRoute {
    pub sensor_id: SensorId,
    pub target: Target,
}

impl LiveDataRoute {
    #[inline]
    pub fn new<T: Into<Target>>(sensor_id: SensorId, target: T) -> Self {
        Self { sensor_id, target: target.into() }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiveDataHandler {
    pub name: Target,
    pub enabled: bool,
}

/// A sensor that passed authorization, together with the live data
/// targets that were subscribed to it at lookup time.
#[derive(Debug, Clone)]
pub struct ResolvedSensor {
    pub sensor: Arc<Sensor>,
    pub live_data_routing: Vec<RoutingTarget>,
}

impl ResolvedSensor {
    #[inline]
    pub fn new(sensor: Arc<Sensor>, live_data_routing: Vec<RoutingTarget>) -> Self {
        Self { sensor, live_data_routing }
    }

    #[inline]
    pub fn has_live_data(&self) -> bool {
        !self.live_data_routing.is_empty()
    }
}

impl Deref for ResolvedSensor {
    type Target = Sensor;
    #[inline]
    fn deref(&self) -> &Self::Target {
        &self.sensor
    }
}
