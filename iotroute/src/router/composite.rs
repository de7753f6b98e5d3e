use std::sync::Arc;

use chrono::Utc;
use itertools::Itertools;
use rayon::prelude::*;

use crate::message::{Message, NetworkEvent, NetworkEventType};
use crate::metrics::Metrics;
use crate::outbound::NetworkEventQueue;
use crate::routing_cache::RoutingCache;
use crate::{Error, Result};

use super::Router;

/// Runs the router chain for each message.
///
/// A message whose sensor can not be resolved (unknown, or not authorized) is
/// dropped before any router runs and produces no network event. Otherwise the
/// routers run in the order they were added until one of them stops the chain
/// or fails, and the network event is queued in every case.
pub struct CompositeRouter {
    cache: RoutingCache,
    routers: Vec<Box<dyn Router>>,
    events: Arc<NetworkEventQueue>,
    metrics: Arc<Metrics>,
}

impl CompositeRouter {
    pub fn new(cache: RoutingCache, events: Arc<NetworkEventQueue>, metrics: Arc<Metrics>) -> Self {
        Self { cache, routers: Vec::new(), events, metrics }
    }

    #[inline]
    pub fn add_router<R: Router + 'static>(&mut self, router: R) -> &mut Self {
        self.routers.push(Box::new(router));
        self
    }

    #[inline]
    pub fn routers(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.routers.iter().map(|r| r.name())
    }

    /// Routes one message. Returns the network event, or `None` if the message was
    /// dropped for an unresolvable sensor.
    ///
    /// Routing errors are logged and recorded as `MessageDropped`; any other
    /// error is returned.
    pub fn route(&self, mut message: Message) -> Result<Option<NetworkEvent>> {
        let Some(sensor) = self.cache.get(&message.sensor_id())? else {
            self.metrics.messages_dropped_inc();
            log::debug!("unable to route message for sensor {}, sensor not found", message.sensor_id());
            return Ok(None);
        };

        log::debug!("routing message of type {:?} for sensor {}", message.message_type(), sensor.id);
        let now = Utc::now();
        message.set_platform_time(now);
        let mut event = NetworkEvent::new(sensor.id, sensor.account_id);
        event.platform_time = now;

        for router in self.routers.iter() {
            match router.route(&sensor, &mut message, &mut event) {
                Ok(true) => {}
                Ok(false) => {
                    log::debug!("router {} stopped routing for sensor {}", router.name(), sensor.id);
                    break;
                }
                Err(e) if e.is_routing() => {
                    self.metrics.routing_errors_inc();
                    self.metrics.messages_dropped_inc();
                    event.add_action(NetworkEventType::MessageDropped);
                    log::warn!("unable to route message for sensor {}, {}", sensor.id, e);
                    break;
                }
                Err(e) => return Err(e),
            }
        }

        if !event.has_action(NetworkEventType::MessageDropped) {
            self.metrics.messages_routed_inc();
        }
        if let Err(e) = self.events.enqueue(&event) {
            log::warn!("network event of sensor {} not queued, {}", sensor.id, e);
        }
        Ok(Some(event))
    }

    /// Routes a batch and returns the number of messages that produced a network event.
    ///
    /// Messages of one sensor are routed in arrival order; different sensors are
    /// routed in parallel. The first non-routing error fails the batch.
    pub fn route_batch(&self, messages: Vec<Message>) -> Result<usize> {
        if messages.is_empty() {
            return Ok(0);
        }
        let total = messages.len();
        let groups = messages.into_iter().into_group_map_by(|m| m.sensor_id());
        let routed = groups
            .into_par_iter()
            .map(|(_, messages)| {
                let mut routed = 0;
                for message in messages {
                    if self.route(message)?.is_some() {
                        routed += 1;
                    }
                }
                Ok::<_, Error>(routed)
            })
            .try_reduce(|| 0, |a, b| Ok(a + b))?;
        log::debug!("routed {} of {} messages", routed, total);
        Ok(routed)
    }
}
