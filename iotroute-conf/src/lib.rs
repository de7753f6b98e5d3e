#![deny(unsafe_code)]

use std::fmt;
use std::ops::Deref;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use config::{Config, File};
use once_cell::sync::OnceCell;
use serde::Deserialize;

use iotroute_utils::{deserialize_duration, deserialize_duration_option};

use self::logging::{Level, Log};

pub use self::options::Options;

pub mod logging;
pub mod options;

static SETTINGS: OnceCell<Settings> = OnceCell::new();

#[derive(Clone)]
pub struct Settings(Arc<Inner>);

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Inner {
    #[serde(default)]
    pub log: Log,
    #[serde(default)]
    pub routing: Routing,
    #[serde(default)]
    pub reload: Reload,
    #[serde(default)]
    pub queue: Queue,
    #[serde(default)]
    pub topics: Topics,
    #[serde(default)]
    pub cache: Cache,
    #[serde(default)]
    pub repository: Repository,
    #[serde(default, skip)]
    pub opts: Options,
}

impl Deref for Settings {
    type Target = Inner;
    fn deref(&self) -> &Self::Target {
        self.0.as_ref()
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self(Arc::new(Inner::default()))
    }
}

impl From<Inner> for Settings {
    fn from(inner: Inner) -> Self {
        Self(Arc::new(inner))
    }
}

impl Settings {
    pub fn new(opts: Options) -> Result<Self> {
        let mut builder = Config::builder()
            .add_source(File::with_name("/etc/iotroute/iotroute").required(false))
            .add_source(File::with_name("iotroute").required(false));

        if let Some(cfg) = opts.cfg_name.as_ref() {
            builder = builder.add_source(File::with_name(cfg).required(true));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("iotroute").prefix_separator("_").separator("__"),
        );

        let mut inner: Inner = builder.build()?.try_deserialize()?;

        //Command line configuration overriding file configuration
        if let Some(dir) = opts.data_dir.as_ref() {
            inner.repository.data_dir.clone_from(dir);
        }
        if let Some(level) = opts.log_level.as_ref() {
            inner.log.level = Level::from_str(level).map_err(|e| anyhow!(e))?;
        }

        inner.opts = opts;
        Ok(Self(Arc::new(inner)))
    }

    #[inline]
    pub fn instance() -> &'static Self {
        match SETTINGS.get() {
            Some(c) => c,
            None => {
                unreachable!("Settings not initialized");
            }
        }
    }

    #[inline]
    pub fn init(opts: Options) -> Result<&'static Self> {
        SETTINGS.set(Settings::new(opts)?).map_err(|_| anyhow!("Settings init failed"))?;
        SETTINGS.get().ok_or_else(|| anyhow!("Settings init failed"))
    }

    pub fn logs(&self) {
        log::debug!("Config info is {:?}", self.0);
        log::info!("routing config is {:?}", self.routing);
        log::info!("reload config is {:?}", self.reload);
        log::info!("queue config is {:?}", self.queue);
        log::info!("data dir is {}", self.repository.data_dir);
        if self.reload.live_data_flush_interval <= self.reload.live_data_heartbeat {
            log::warn!(
                "reload.live_data_flush_interval ({:?}) should exceed reload.live_data_heartbeat ({:?}), \
                 otherwise live data subscriptions expire before they are renewed",
                self.reload.live_data_flush_interval,
                self.reload.live_data_heartbeat
            );
        }
    }
}

impl fmt::Debug for Settings {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Settings ...")?;
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Routing {
    //Maximum number of messages taken off the ingress queue per routing cycle.
    #[serde(default = "Routing::dequeue_batch_size_default")]
    pub dequeue_batch_size: usize,
    //Idle sleep when the ingress queue is empty.
    #[serde(default = "Routing::interval_default", deserialize_with = "deserialize_duration")]
    pub interval: Duration,
    #[serde(default = "Routing::ingress_queue_capacity_default")]
    pub ingress_queue_capacity: usize,
}

impl Default for Routing {
    #[inline]
    fn default() -> Self {
        Self {
            dequeue_batch_size: Self::dequeue_batch_size_default(),
            interval: Self::interval_default(),
            ingress_queue_capacity: Self::ingress_queue_capacity_default(),
        }
    }
}

impl Routing {
    fn dequeue_batch_size_default() -> usize {
        1000
    }
    fn interval_default() -> Duration {
        Duration::from_millis(100)
    }
    fn ingress_queue_capacity_default() -> usize {
        1_000_000
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Reload {
    #[serde(default = "Reload::start_delay_default", deserialize_with = "deserialize_duration")]
    pub start_delay: Duration,
    #[serde(default = "Reload::data_reload_interval_default", deserialize_with = "deserialize_duration")]
    pub data_reload_interval: Duration,
    //Lease length of a live data subscription. A subscription that is not re-synced
    //within one interval disappears at the next flush.
    #[serde(default = "Reload::live_data_flush_interval_default", deserialize_with = "deserialize_duration")]
    pub live_data_flush_interval: Duration,
    //Expected heartbeat period of the live data handlers.
    #[serde(default = "Reload::live_data_heartbeat_default", deserialize_with = "deserialize_duration")]
    pub live_data_heartbeat: Duration,
    #[serde(default = "Reload::cache_flush_interval_default", deserialize_with = "deserialize_duration")]
    pub cache_flush_interval: Duration,
    //When false, accounts, sensors and keys are bulk loaded once at startup and
    //afterwards only changed through commands. Live data handlers are always reloaded.
    #[serde(default = "Reload::enable_reload_default")]
    pub enable_reload: bool,
}

impl Default for Reload {
    #[inline]
    fn default() -> Self {
        Self {
            start_delay: Self::start_delay_default(),
            data_reload_interval: Self::data_reload_interval_default(),
            live_data_flush_interval: Self::live_data_flush_interval_default(),
            live_data_heartbeat: Self::live_data_heartbeat_default(),
            cache_flush_interval: Self::cache_flush_interval_default(),
            enable_reload: Self::enable_reload_default(),
        }
    }
}

impl Reload {
    fn start_delay_default() -> Duration {
        Duration::from_secs(1)
    }
    fn data_reload_interval_default() -> Duration {
        Duration::from_secs(300)
    }
    fn live_data_flush_interval_default() -> Duration {
        Duration::from_secs(60)
    }
    fn live_data_heartbeat_default() -> Duration {
        Duration::from_secs(30)
    }
    fn cache_flush_interval_default() -> Duration {
        Duration::from_secs(600)
    }
    fn enable_reload_default() -> bool {
        true
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Queue {
    //Flush cadence of the storage, trigger, live data and network event queues.
    #[serde(default = "Queue::internal_interval_default", deserialize_with = "deserialize_duration")]
    pub internal_interval: Duration,
    //Flush cadence of the actuator queue.
    #[serde(default = "Queue::public_interval_default", deserialize_with = "deserialize_duration")]
    pub public_interval: Duration,
    #[serde(default = "Queue::compress_default")]
    pub compress: bool,
    //Per-buffer bound, entries beyond it are dropped and counted.
    #[serde(default = "Queue::capacity_default")]
    pub capacity: usize,
}

impl Default for Queue {
    #[inline]
    fn default() -> Self {
        Self {
            internal_interval: Self::internal_interval_default(),
            public_interval: Self::public_interval_default(),
            compress: Self::compress_default(),
            capacity: Self::capacity_default(),
        }
    }
}

impl Queue {
    fn internal_interval_default() -> Duration {
        Duration::from_secs(1)
    }
    fn public_interval_default() -> Duration {
        Duration::from_millis(500)
    }
    fn compress_default() -> bool {
        true
    }
    fn capacity_default() -> usize {
        500_000
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Topics {
    #[serde(default = "Topics::actuator_default")]
    pub actuator: String,
    #[serde(default = "Topics::live_data_default")]
    pub live_data: String,
    #[serde(default = "Topics::trigger_default")]
    pub trigger: String,
    #[serde(default = "Topics::message_storage_default")]
    pub message_storage: String,
    #[serde(default = "Topics::measurement_storage_default")]
    pub measurement_storage: String,
    #[serde(default = "Topics::network_events_default")]
    pub network_events: String,
    #[serde(default = "Topics::commands_default")]
    pub commands: String,
    #[serde(default = "Topics::live_data_sync_default")]
    pub live_data_sync: String,
}

impl Default for Topics {
    #[inline]
    fn default() -> Self {
        Self {
            actuator: Self::actuator_default(),
            live_data: Self::live_data_default(),
            trigger: Self::trigger_default(),
            message_storage: Self::message_storage_default(),
            measurement_storage: Self::measurement_storage_default(),
            network_events: Self::network_events_default(),
            commands: Self::commands_default(),
            live_data_sync: Self::live_data_sync_default(),
        }
    }
}

impl Topics {
    fn actuator_default() -> String {
        "sensateiot/control/$id".into()
    }
    fn live_data_default() -> String {
        "sensateiot/internal/$type/$target/bulk".into()
    }
    fn trigger_default() -> String {
        "sensateiot/internal/$type/trigger/bulk".into()
    }
    fn message_storage_default() -> String {
        "sensateiot/internal/messages/bulk".into()
    }
    fn measurement_storage_default() -> String {
        "sensateiot/internal/measurements/bulk".into()
    }
    fn network_events_default() -> String {
        "sensateiot/internal/events/bulk".into()
    }
    fn commands_default() -> String {
        "sensateiot/internal/commands".into()
    }
    fn live_data_sync_default() -> String {
        "sensateiot/internal/livedata/sync".into()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Cache {
    //-1 means unbounded
    #[serde(default = "Cache::capacity_default")]
    pub capacity: i64,
    #[serde(default, deserialize_with = "deserialize_duration_option")]
    pub default_timeout: Option<Duration>,
    #[serde(default = "Cache::active_scanning_default")]
    pub active_scanning: bool,
}

impl Default for Cache {
    #[inline]
    fn default() -> Self {
        Self {
            capacity: Self::capacity_default(),
            default_timeout: None,
            active_scanning: Self::active_scanning_default(),
        }
    }
}

impl Cache {
    fn capacity_default() -> i64 {
        -1
    }
    fn active_scanning_default() -> bool {
        true
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Repository {
    #[serde(default = "Repository::data_dir_default")]
    pub data_dir: String,
}

impl Default for Repository {
    #[inline]
    fn default() -> Self {
        Self { data_dir: Self::data_dir_default() }
    }
}

impl Repository {
    fn data_dir_default() -> String {
        "./data".into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_without_files() {
        let settings = Settings::new(Options::default()).expect("Settings creation failed");
        assert_eq!(settings.routing.dequeue_batch_size, 1000);
        assert_eq!(settings.reload.data_reload_interval, Duration::from_secs(300));
        assert!(settings.reload.live_data_flush_interval > settings.reload.live_data_heartbeat);
        assert_eq!(settings.topics.actuator, "sensateiot/control/$id");
        assert_eq!(settings.cache.capacity, -1);
        assert!(settings.cache.default_timeout.is_none());
    }

    #[test]
    fn command_line_overrides() {
        let opts = Options {
            data_dir: Some("/tmp/iotroute-data".into()),
            log_level: Some("debug".into()),
            ..Default::default()
        };
        let settings = Settings::new(opts).expect("Settings creation failed");
        assert_eq!(settings.repository.data_dir, "/tmp/iotroute-data");
        assert_eq!(settings.log.level.inner(), slog::Level::Debug);

        let opts = Options { log_level: Some("loud".into()), ..Default::default() };
        assert!(Settings::new(opts).is_err());
    }

    #[test]
    fn durations_from_source() {
        let cfg = Config::builder()
            .add_source(config::File::from_str(
                r#"
                [reload]
                live_data_flush_interval = "2m"
                live_data_heartbeat = "45s"

                [cache]
                capacity = 1024
                default_timeout = "1h"
                "#,
                config::FileFormat::Toml,
            ))
            .build()
            .unwrap();
        let inner: Inner = cfg.try_deserialize().unwrap();
        assert_eq!(inner.reload.live_data_flush_interval, Duration::from_secs(120));
        assert_eq!(inner.reload.live_data_heartbeat, Duration::from_secs(45));
        assert_eq!(inner.cache.capacity, 1024);
        assert_eq!(inner.cache.default_timeout, Some(Duration::from_secs(3600)));
    }
}
