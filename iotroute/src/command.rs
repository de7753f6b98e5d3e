//! Change events for single entities.
//!
//! Between two bulk reloads the platform announces changes as commands,
//! `{"cmd": "AddSensor", "arguments": "5f3b9c2a1d4e6f7a8b9c0d1e"}`. Live data
//! commands carry a JSON document in `arguments`.
//!
//! Inbound topics are bound to their handlers once at startup through
//! [`Inbound`].

use std::sync::Arc;

use ahash::AHashMap;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::repository::RoutingRepository;
use crate::routing_cache::RoutingCache;
use crate::types::{AccountId, LiveDataRoute, SensorId, SensorTrigger, Target};
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandType {
    FlushUser,
    FlushSensor,
    FlushKey,
    AddUser,
    AddSensor,
    AddKey,
    DeleteUser,
    AddLiveDataSensor,
    RemoveLiveDataSensor,
    SyncLiveDataSensors,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    pub cmd: CommandType,
    #[serde(default)]
    pub arguments: String,
}

impl Command {
    #[inline]
    pub fn new<S: Into<String>>(cmd: CommandType, arguments: S) -> Self {
        Self { cmd, arguments: arguments.into() }
    }
}

/// The complete set of sensors a live data handler is subscribed to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiveDataSyncList {
    pub target: Target,
    pub sensors: Vec<SensorId>,
}

impl LiveDataSyncList {
    fn into_routes(self) -> Vec<LiveDataRoute> {
        let target = self.target;
        self.sensors.into_iter().map(|id| LiveDataRoute::new(id, target.clone())).collect()
    }
}

/// Handler of one inbound topic
#[async_trait]
pub trait InboundHandler: Sync + Send {
    async fn on_message(&self, topic: &str, payload: &[u8]) -> Result<()>;
}

/// Topic to handler table
#[derive(Default, Clone)]
pub struct Inbound {
    handlers: AHashMap<String, Arc<dyn InboundHandler>>,
}

impl Inbound {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn route<T: Into<String>>(mut self, topic: T, handler: Arc<dyn InboundHandler>) -> Self {
        self.handlers.insert(topic.into(), handler);
        self
    }

    #[inline]
    pub fn topics(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(|t| t.as_str())
    }

    /// Returns false when no handler is bound to `topic`
    pub async fn dispatch(&self, topic: &str, payload: &[u8]) -> Result<bool> {
        match self.handlers.get(topic) {
            Some(h) => {
                h.on_message(topic, payload).await?;
                Ok(true)
            }
            None => {
                log::debug!("no handler for topic {}", topic);
                Ok(false)
            }
        }
    }
}

/// Applies commands to the routing cache, fetching added entities from the repository
pub struct CommandHandler {
    cache: RoutingCache,
    repository: Arc<dyn RoutingRepository>,
}

impl CommandHandler {
    pub fn new(cache: RoutingCache, repository: Arc<dyn RoutingRepository>) -> Self {
        Self { cache, repository }
    }

    pub async fn handle(&self, cmd: Command) -> Result<()> {
        log::info!("received command {:?}, arguments: {}", cmd.cmd, cmd.arguments);
        match cmd.cmd {
            CommandType::FlushUser | CommandType::DeleteUser => {
                self.cache.remove_account(&parse_account_id(&cmd.arguments)?)?;
            }
            CommandType::FlushSensor => {
                self.cache.remove_sensor(&parse_sensor_id(&cmd.arguments)?)?;
            }
            CommandType::FlushKey => {
                self.cache.remove_api_key(&cmd.arguments)?;
            }
            CommandType::AddUser => {
                let id = parse_account_id(&cmd.arguments)?;
                match self.repository.account(&id).await? {
                    Some(account) => self.cache.append_account(account)?,
                    None => log::warn!("account {} to add does not exist", id),
                }
            }
            CommandType::AddSensor => {
                let id = parse_sensor_id(&cmd.arguments)?;
                let (sensor, triggers) =
                    futures::try_join!(self.repository.sensor(&id), self.repository.sensor_triggers(&id))?;
                match sensor {
                    Some(mut sensor) => {
                        sensor.triggers = triggers.iter().map(SensorTrigger::from).collect();
                        self.cache.insert(id, sensor)?;
                    }
                    None => log::warn!("sensor {} to add does not exist", id),
                }
            }
            CommandType::AddKey => {
                let key = self.repository.api_key(&cmd.arguments).await?;
                match key {
                    Some(key) => self.cache.append_api_key(cmd.arguments, key)?,
                    None => log::warn!("API key to add does not exist"),
                }
            }
            CommandType::AddLiveDataSensor => {
                let route: LiveDataRoute = parse_json(&cmd.arguments)?;
                if !self.cache.add_live_data_route(route.clone())? {
                    log::debug!("live data route {:?} not added, target is not an enabled handler", route);
                }
            }
            CommandType::RemoveLiveDataSensor => {
                let route: LiveDataRoute = parse_json(&cmd.arguments)?;
                self.cache.remove_live_data_route(&route)?;
            }
            CommandType::SyncLiveDataSensors => {
                let list: LiveDataSyncList = parse_json(&cmd.arguments)?;
                self.cache.sync_live_data_routes(list.into_routes())?;
            }
            CommandType::Unknown => {
                log::warn!("unknown command ignored, arguments: {}", cmd.arguments);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl InboundHandler for CommandHandler {
    async fn on_message(&self, _topic: &str, payload: &[u8]) -> Result<()> {
        let cmd: Command = serde_json::from_slice(payload)
            .map_err(|e| Error::InvalidArgument(format!("malformed command, {e}")))?;
        self.handle(cmd).await
    }
}

/// Heartbeats of the live data handlers, a [`LiveDataSyncList`] per message
pub struct LiveDataSyncHandler {
    cache: RoutingCache,
}

impl LiveDataSyncHandler {
    pub fn new(cache: RoutingCache) -> Self {
        Self { cache }
    }
}

#[async_trait]
impl InboundHandler for LiveDataSyncHandler {
    async fn on_message(&self, _topic: &str, payload: &[u8]) -> Result<()> {
        let list: LiveDataSyncList = serde_json::from_slice(payload)
            .map_err(|e| Error::InvalidArgument(format!("malformed live data sync list, {e}")))?;
        let target = list.target.clone();
        let accepted = self.cache.sync_live_data_routes(list.into_routes())?;
        log::debug!("live data handler {} synced {} routes", target, accepted);
        Ok(())
    }
}

#[inline]
fn parse_account_id(s: &str) -> Result<AccountId> {
    s.trim().parse().map_err(|e| Error::InvalidArgument(format!("account id {s:?}, {e}")))
}

#[inline]
fn parse_sensor_id(s: &str) -> Result<SensorId> {
    s.trim().parse().map_err(|e| Error::InvalidArgument(format!("sensor id {s:?}, {e}")))
}

fn parse_json<T: serde::de::DeserializeOwned>(s: &str) -> Result<T> {
    serde_json::from_str(s).map_err(|e| Error::InvalidArgument(format!("command arguments {s:?}, {e}")))
}
