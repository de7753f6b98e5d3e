//! Source of the routing data.
//!
//! The relational store of the platform sits behind [`RoutingRepository`].
//! [`MemoryRepository`] keeps everything in memory, [`FileRepository`] reads
//! one JSON array per entity kind from a directory:
//!
//! ```text
//! <data_dir>/accounts.json
//! <data_dir>/api_keys.json
//! <data_dir>/sensors.json
//! <data_dir>/triggers.json
//! <data_dir>/live_data_handlers.json
//! ```

use std::io::ErrorKind;
use std::path::PathBuf;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::types::{Account, AccountId, ApiKey, LiveDataHandler, Sensor, SensorId, SensorTrigger};
use crate::Result;

/// One trigger of a sensor as stored by the rule engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerRoute {
    pub sensor_id: SensorId,
    pub action_count: u64,
    #[serde(default)]
    pub is_text_trigger: bool,
}

impl From<&TriggerRoute> for SensorTrigger {
    #[inline]
    fn from(t: &TriggerRoute) -> Self {
        SensorTrigger { has_actions: t.action_count > 0, is_text_trigger: t.is_text_trigger }
    }
}

#[async_trait]
pub trait RoutingRepository: Sync + Send {
    async fn accounts(&self) -> Result<Vec<Account>>;

    async fn api_keys(&self) -> Result<Vec<ApiKey>>;

    /// Sensors without trigger information
    async fn sensors(&self) -> Result<Vec<Sensor>>;

    async fn triggers(&self) -> Result<Vec<TriggerRoute>>;

    async fn live_data_handlers(&self) -> Result<Vec<LiveDataHandler>>;

    async fn account(&self, id: &AccountId) -> Result<Option<Account>> {
        Ok(self.accounts().await?.into_iter().find(|a| a.id == *id))
    }

    async fn api_key(&self, key: &str) -> Result<Option<ApiKey>> {
        Ok(self.api_keys().await?.into_iter().find(|k| k.key == key))
    }

    async fn sensor(&self, id: &SensorId) -> Result<Option<Sensor>> {
        Ok(self.sensors().await?.into_iter().find(|s| s.id == *id))
    }

    async fn sensor_triggers(&self, id: &SensorId) -> Result<Vec<TriggerRoute>> {
        Ok(self.triggers().await?.into_iter().filter(|t| t.sensor_id == *id).collect())
    }
}

#[derive(Default)]
pub struct MemoryRepository {
    accounts: RwLock<Vec<Account>>,
    api_keys: RwLock<Vec<ApiKey>>,
    sensors: RwLock<Vec<Sensor>>,
    triggers: RwLock<Vec<TriggerRoute>>,
    handlers: RwLock<Vec<LiveDataHandler>>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn set_accounts(&self, accounts: Vec<Account>) {
        *self.accounts.write() = accounts;
    }

    #[inline]
    pub fn set_api_keys(&self, keys: Vec<ApiKey>) {
        *self.api_keys.write() = keys;
    }

    #[inline]
    pub fn set_sensors(&self, sensors: Vec<Sensor>) {
        *self.sensors.write() = sensors;
    }

    #[inline]
    pub fn set_triggers(&self, triggers: Vec<TriggerRoute>) {
        *self.triggers.write() = triggers;
    }

    #[inline]
    pub fn set_live_data_handlers(&self, handlers: Vec<LiveDataHandler>) {
        *self.handlers.write() = handlers;
    }
}

#[async_trait]
impl RoutingRepository for MemoryRepository {
    async fn accounts(&self) -> Result<Vec<Account>> {
        Ok(self.accounts.read().clone())
    }

    async fn api_keys(&self) -> Result<Vec<ApiKey>> {
        Ok(self.api_keys.read().clone())
    }

    async fn sensors(&self) -> Result<Vec<Sensor>> {
        Ok(self.sensors.read().clone())
    }

    async fn triggers(&self) -> Result<Vec<TriggerRoute>> {
        Ok(self.triggers.read().clone())
    }

    async fn live_data_handlers(&self) -> Result<Vec<LiveDataHandler>> {
        Ok(self.handlers.read().clone())
    }
}

pub struct FileRepository {
    data_dir: PathBuf,
}

impl FileRepository {
    pub fn new<P: Into<PathBuf>>(data_dir: P) -> Self {
        Self { data_dir: data_dir.into() }
    }

    /// A missing file reads as an empty list
    async fn load<T: DeserializeOwned>(&self, name: &str) -> Result<Vec<T>> {
        let path = self.data_dir.join(name);
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(serde_json::from_slice(&data)?),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                log::debug!("{:?} does not exist, nothing to load", path);
                Ok(Vec::new())
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl RoutingRepository for FileRepository {
    async fn accounts(&self) -> Result<Vec<Account>> {
        self.load("accounts.json").await
    }

    async fn api_keys(&self) -> Result<Vec<ApiKey>> {
        self.load("api_keys.json").await
    }

    async fn sensors(&self) -> Result<Vec<Sensor>> {
        self.load("sensors.json").await
    }

    async fn triggers(&self) -> Result<Vec<TriggerRoute>> {
        self.load("triggers.json").await
    }

    async fn live_data_handlers(&self) -> Result<Vec<LiveDataHandler>> {
        self.load("live_data_handlers.json").await
    }
}
