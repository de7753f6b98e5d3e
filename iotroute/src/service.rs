//! Background jobs of the engine.
//!
//! Every job is a `tokio` task that sleeps for its interval, runs one tick and
//! starts over. Cancellation is only observed while sleeping, so a tick that is
//! already running (a reload, a queue flush) always completes.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use ahash::AHashMap;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::message::Message;
use crate::metrics::Metrics;
use crate::outbound::{LiveDataQueue, Outbound};
use crate::queue::Queue;
use crate::repository::{RoutingRepository, TriggerRoute};
use crate::router::CompositeRouter;
use crate::routing_cache::RoutingCache;
use crate::types::{Sensor, SensorId, SensorTrigger};
use crate::{Error, Result};

/// Sleeps for `d`, returns `true` if the token was cancelled in the meantime
async fn cancelled_during(token: &CancellationToken, d: Duration) -> bool {
    tokio::select! {
        _ = token.cancelled() => true,
        _ = tokio::time::sleep(d) => false,
    }
}

fn spawn_periodic<F, Fut>(
    name: &'static str,
    delay: Duration,
    interval: Duration,
    token: CancellationToken,
    mut tick: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        log::info!("{} started, interval: {:?}", name, interval);
        if !cancelled_during(&token, delay).await {
            loop {
                tick().await;
                if cancelled_during(&token, interval).await {
                    break;
                }
            }
        }
        log::info!("{} stopped", name);
    })
}

/// Attaches the trigger summaries to their sensors. Summaries of unknown sensors are skipped.
fn attach_triggers(mut sensors: Vec<Sensor>, triggers: Vec<TriggerRoute>) -> Vec<Sensor> {
    let mut by_sensor: AHashMap<SensorId, Vec<SensorTrigger>> = AHashMap::default();
    for t in triggers.iter() {
        by_sensor.entry(t.sensor_id).or_default().push(SensorTrigger::from(t));
    }
    for sensor in sensors.iter_mut() {
        if let Some(triggers) = by_sensor.remove(&sensor.id) {
            sensor.triggers = triggers;
        }
    }
    for id in by_sensor.keys() {
        log::warn!("unable to attach triggers, sensor {} not found", id);
    }
    sensors
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReloadStats {
    pub handlers: usize,
    pub accounts: usize,
    pub sensors: usize,
    pub api_keys: usize,
}

/// Repopulates the routing cache from the repository.
///
/// With `reload.enable_reload` turned off, only the first run loads accounts,
/// sensors and keys; later runs only refresh the live data handlers.
pub struct DataReloadService {
    cache: RoutingCache,
    live_data: Arc<LiveDataQueue>,
    repository: Arc<dyn RoutingRepository>,
    metrics: Arc<Metrics>,
    enable_reload: bool,
    loaded: AtomicBool,
}

impl DataReloadService {
    pub fn new(
        cache: RoutingCache,
        live_data: Arc<LiveDataQueue>,
        repository: Arc<dyn RoutingRepository>,
        metrics: Arc<Metrics>,
        enable_reload: bool,
    ) -> Self {
        Self { cache, live_data, repository, metrics, enable_reload, loaded: AtomicBool::new(false) }
    }

    pub async fn reload(&self) -> Result<ReloadStats> {
        let now = Instant::now();
        let mut stats = ReloadStats::default();

        let handlers = self.repository.live_data_handlers().await?;
        stats.handlers = handlers.len();
        self.live_data.sync_handlers(&handlers);
        self.cache.set_live_data_handlers(handlers)?;

        if !self.enable_reload && self.loaded.load(Ordering::SeqCst) {
            log::debug!("reloading disabled, {} live data handlers refreshed", stats.handlers);
            return Ok(stats);
        }

        let accounts = self.repository.accounts().await?;
        stats.accounts = accounts.len();
        self.cache.load_accounts(accounts)?;

        let (sensors, triggers) = futures::try_join!(self.repository.sensors(), self.repository.triggers())?;
        let sensors = attach_triggers(sensors, triggers);
        stats.sensors = sensors.len();
        self.cache.load_sensors(sensors)?;

        let keys = self.repository.api_keys().await?;
        stats.api_keys = keys.len();
        self.cache.load_api_keys(keys)?;

        self.loaded.store(true, Ordering::SeqCst);
        log::info!(
            "routing data reloaded in {:?}, accounts: {}, sensors: {}, api keys: {}, live data handlers: {}",
            now.elapsed(),
            stats.accounts,
            stats.sensors,
            stats.api_keys,
            stats.handlers
        );
        Ok(stats)
    }

    async fn tick(&self) {
        match self.reload().await {
            Ok(_) => self.metrics.reloads_inc(),
            Err(e) => {
                self.metrics.reload_failures_inc();
                log::error!("unable to reload routing data, {}", e);
            }
        }
    }

    pub fn start(self: Arc<Self>, delay: Duration, interval: Duration, token: CancellationToken) -> JoinHandle<()> {
        spawn_periodic("data reload service", delay, interval, token, move || {
            let s = self.clone();
            async move { s.tick().await }
        })
    }
}

/// Promotes the re-synced live data subscriptions, dropping the ones nobody renewed
pub struct LiveDataFlushService {
    cache: RoutingCache,
    metrics: Arc<Metrics>,
}

impl LiveDataFlushService {
    pub fn new(cache: RoutingCache, metrics: Arc<Metrics>) -> Self {
        Self { cache, metrics }
    }

    pub fn flush(&self) -> Result<()> {
        self.cache.flush_live_data_routes()?;
        self.metrics.live_data_flushes_inc();
        log::debug!("live data routes flushed, live sensors: {}", self.cache.stats.live_sensors.count());
        Ok(())
    }

    /// The first flush happens one full interval after start
    pub fn start(self, interval: Duration, token: CancellationToken) -> JoinHandle<()> {
        let s = Arc::new(self);
        spawn_periodic("live data flush service", interval, interval, token, move || {
            let s = s.clone();
            async move {
                if let Err(e) = s.flush() {
                    log::warn!("unable to flush live data routes, {}", e);
                }
            }
        })
    }
}

pub struct CacheFlushService {
    cache: RoutingCache,
}

impl CacheFlushService {
    pub fn new(cache: RoutingCache) -> Self {
        Self { cache }
    }

    pub fn start(self, interval: Duration, token: CancellationToken) -> JoinHandle<()> {
        spawn_periodic("cache flush service", interval, interval, token, move || {
            let res = self.cache.flush();
            async move {
                if let Err(e) = res {
                    log::warn!("unable to flush routing cache, {}", e);
                }
            }
        })
    }
}

/// Flushes the outbound queues, internal and public ones on their own cadence
pub struct QueueFlushService {
    outbound: Outbound,
}

impl QueueFlushService {
    pub fn new(outbound: Outbound) -> Self {
        Self { outbound }
    }

    pub fn start(self, internal: Duration, public: Duration, token: CancellationToken) -> Vec<JoinHandle<()>> {
        let outbound = self.outbound.clone();
        let internal = spawn_periodic("internal queue flush", internal, internal, token.clone(), move || {
            let outbound = outbound.clone();
            async move {
                match outbound.flush_internal().await {
                    Ok(0) => {}
                    Ok(n) => log::debug!("{} internal batches published", n),
                    Err(e) => log::warn!("unable to flush internal queues, {}", e),
                }
            }
        });
        let outbound = self.outbound;
        let public = spawn_periodic("public queue flush", public, public, token, move || {
            let outbound = outbound.clone();
            async move {
                if let Err(e) = outbound.flush_public().await {
                    log::warn!("unable to flush public queues, {}", e);
                }
            }
        });
        vec![internal, public]
    }
}

/// Drains the routing input queue into the composite router.
///
/// Once cancelled, whatever is still queued is routed before the task ends.
pub struct RoutingService {
    queue: Arc<Queue<Message>>,
    router: Arc<CompositeRouter>,
    batch_size: usize,
}

impl RoutingService {
    pub fn new(queue: Arc<Queue<Message>>, router: Arc<CompositeRouter>, batch_size: usize) -> Self {
        Self { queue, router, batch_size: batch_size.max(1) }
    }

    /// Routes one batch, returns the number of dequeued messages
    pub async fn route_once(&self) -> Result<usize> {
        let batch = self.queue.drain(self.batch_size);
        let count = batch.len();
        if count == 0 {
            return Ok(0);
        }
        let router = self.router.clone();
        tokio::task::spawn_blocking(move || router.route_batch(batch))
            .await
            .map_err(|e| Error::Msg(format!("routing task failed, {e}")))??;
        Ok(count)
    }

    async fn tick(&self) -> usize {
        match self.route_once().await {
            Ok(n) => n,
            Err(e) => {
                log::error!("unable to route batch, {}", e);
                1
            }
        }
    }

    pub fn start(self, interval: Duration, token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            log::info!("routing service started, batch size: {}", self.batch_size);
            loop {
                if self.tick().await > 0 {
                    if token.is_cancelled() {
                        break;
                    }
                    continue;
                }
                if cancelled_during(&token, interval).await {
                    break;
                }
            }
            while !self.queue.is_empty() {
                self.tick().await;
            }
            log::info!("routing service stopped");
        })
    }
}
