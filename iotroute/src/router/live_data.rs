use std::sync::Arc;

use crate::message::{Message, NetworkEvent, NetworkEventType};
use crate::metrics::Metrics;
use crate::outbound::LiveDataQueue;
use crate::types::ResolvedSensor;
use crate::{Error, Result};

use super::Router;

const NAME: &str = "live-data";

/// Copies messages of subscribed sensors to every live data handler holding a
/// subscription. The target list is the snapshot taken when the sensor was
/// resolved, so a concurrent flush of the subscriptions can not change it
/// half way through.
pub struct LiveDataRouter {
    queue: Arc<LiveDataQueue>,
    metrics: Arc<Metrics>,
}

impl LiveDataRouter {
    pub fn new(queue: Arc<LiveDataQueue>, metrics: Arc<Metrics>) -> Self {
        Self { queue, metrics }
    }
}

impl Router for LiveDataRouter {
    #[inline]
    fn name(&self) -> &'static str {
        NAME
    }

    fn route(&self, sensor: &ResolvedSensor, message: &mut Message, event: &mut NetworkEvent) -> Result<bool> {
        if !sensor.has_live_data() {
            return Ok(true);
        }

        let mut accepted = 0;
        for route in sensor.live_data_routing.iter() {
            log::debug!("routing message of {} to live data client {}", sensor.id, route.target);
            if self.queue.enqueue(&route.target, message).map_err(|e| Error::routing(NAME, e.to_string()))? {
                accepted += 1;
                self.metrics.live_data_enqueued_inc();
            }
        }
        if accepted > 0 {
            event.add_action(NetworkEventType::MessageLiveData);
        }
        Ok(true)
    }
}
