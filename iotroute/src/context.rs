use std::fmt;
use std::hash::Hash;
use std::ops::Deref;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::cache::{MemoryCache, MemoryCacheOptions};
use crate::command::{CommandHandler, Inbound, LiveDataSyncHandler};
use crate::conf::Settings;
use crate::ingress::Ingress;
use crate::message::Message;
use crate::metrics::Metrics;
use crate::outbound::{Outbound, Publisher};
use crate::queue::Queue;
use crate::repository::RoutingRepository;
use crate::router::{BaseRouter, CompositeRouter, ControlMessageRouter, LiveDataRouter, StorageRouter, TriggerRouter};
use crate::routing_cache::RoutingCache;
use crate::service::{
    CacheFlushService, DataReloadService, LiveDataFlushService, QueueFlushService, RoutingService,
};
use crate::signing::MessageSigner;
use crate::Result;

#[derive(Clone)]
pub struct RouterContext {
    inner: Arc<RouterContextInner>,
}

pub struct RouterContextInner {
    pub settings: Settings,
    pub cache: RoutingCache,
    pub outbound: Outbound,
    pub metrics: Arc<Metrics>,
    pub ingress: Ingress,
    pub router: Arc<CompositeRouter>,
    pub inbound: Inbound,
    pub reload: Arc<DataReloadService>,
    input: Arc<Queue<Message>>,
    token: CancellationToken,
    jobs: Mutex<Vec<JoinHandle<()>>>,
}

impl Deref for RouterContext {
    type Target = RouterContextInner;
    #[inline]
    fn deref(&self) -> &Self::Target {
        self.inner.as_ref()
    }
}

impl RouterContext {
    pub fn new(
        settings: Settings,
        publisher: Arc<dyn Publisher>,
        repository: Arc<dyn RoutingRepository>,
        signer: Arc<dyn MessageSigner>,
    ) -> Self {
        let cache = RoutingCache::new();
        let outbound = Outbound::new(&settings, publisher);
        let metrics = Arc::new(Metrics::default());
        let input = Arc::new(Queue::new(settings.routing.ingress_queue_capacity));

        let mut router = CompositeRouter::new(cache.clone(), outbound.events.clone(), metrics.clone());
        router
            .add_router(BaseRouter)
            .add_router(ControlMessageRouter::new(signer, outbound.actuator.clone(), metrics.clone()))
            .add_router(LiveDataRouter::new(outbound.live_data.clone(), metrics.clone()))
            .add_router(StorageRouter::new(outbound.storage.clone(), metrics.clone()))
            .add_router(TriggerRouter::new(outbound.trigger.clone(), metrics.clone()));
        log::info!("router chain: {}", router.routers().collect::<Vec<_>>().join(" -> "));

        let inbound = Inbound::new()
            .route(settings.topics.commands.clone(), Arc::new(CommandHandler::new(cache.clone(), repository.clone())))
            .route(settings.topics.live_data_sync.clone(), Arc::new(LiveDataSyncHandler::new(cache.clone())));

        let reload = Arc::new(DataReloadService::new(
            cache.clone(),
            outbound.live_data.clone(),
            repository,
            metrics.clone(),
            settings.reload.enable_reload,
        ));

        Self {
            inner: Arc::new(RouterContextInner {
                ingress: Ingress::new(input.clone(), metrics.clone()),
                router: Arc::new(router),
                settings,
                cache,
                outbound,
                metrics,
                inbound,
                reload,
                input,
                token: CancellationToken::new(),
                jobs: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Spawns the routing loop and every periodic job
    pub fn start(&self) {
        let cfg = &self.settings;
        let mut jobs = self.jobs.lock();
        jobs.push(
            RoutingService::new(self.input.clone(), self.router.clone(), cfg.routing.dequeue_batch_size)
                .start(cfg.routing.interval, self.token.clone()),
        );
        jobs.push(self.reload.clone().start(
            cfg.reload.start_delay,
            cfg.reload.data_reload_interval,
            self.token.clone(),
        ));
        jobs.push(
            LiveDataFlushService::new(self.cache.clone(), self.metrics.clone())
                .start(cfg.reload.live_data_flush_interval, self.token.clone()),
        );
        jobs.push(
            CacheFlushService::new(self.cache.clone()).start(cfg.reload.cache_flush_interval, self.token.clone()),
        );
        jobs.extend(QueueFlushService::new(self.outbound.clone()).start(
            cfg.queue.internal_interval,
            cfg.queue.public_interval,
            self.token.clone(),
        ));
        log::info!("{} background jobs started", jobs.len());
    }

    /// Dispatches a message received on one of the inbound topics
    #[inline]
    pub async fn on_inbound(&self, topic: &str, payload: &[u8]) -> Result<bool> {
        self.inbound.dispatch(topic, payload).await
    }

    /// Stops the jobs, waits for in-flight ticks, publishes what is left and closes the cache
    pub async fn shutdown(&self) -> Result<()> {
        self.token.cancel();
        let jobs = std::mem::take(&mut *self.jobs.lock());
        for job in futures::future::join_all(jobs).await {
            if let Err(e) = job {
                log::warn!("background job failed, {:?}", e);
            }
        }

        let internal = self.outbound.flush_internal().await?;
        let public = self.outbound.flush_public().await?;
        log::info!("final flush, {} internal and {} public batches published", internal, public);
        self.cache.close();
        log::debug!("metrics: {}", self.metrics.to_json());
        Ok(())
    }

    #[inline]
    pub fn is_stopped(&self) -> bool {
        self.token.is_cancelled()
    }

    /// A [`MemoryCache`] configured from the `cache` settings
    pub fn memory_cache<K, V>(&self) -> MemoryCache<K, V>
    where
        K: Hash + Eq + Clone + Send + Sync + 'static,
        V: Clone + Send + Sync + 'static,
    {
        MemoryCache::new(MemoryCacheOptions::from(&self.settings.cache))
    }
}

impl fmt::Debug for RouterContext {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "RouterContext ...")?;
        Ok(())
    }
}
