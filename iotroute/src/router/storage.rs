use std::sync::Arc;

use crate::message::{Message, NetworkEvent, NetworkEventType};
use crate::metrics::Metrics;
use crate::outbound::StorageQueue;
use crate::types::ResolvedSensor;
use crate::{Error, Result};

use super::Router;

const NAME: &str = "storage";

pub struct StorageRouter {
    queue: Arc<StorageQueue>,
    metrics: Arc<Metrics>,
}

impl StorageRouter {
    pub fn new(queue: Arc<StorageQueue>, metrics: Arc<Metrics>) -> Self {
        Self { queue, metrics }
    }
}

impl Router for StorageRouter {
    #[inline]
    fn name(&self) -> &'static str {
        NAME
    }

    fn route(&self, sensor: &ResolvedSensor, message: &mut Message, event: &mut NetworkEvent) -> Result<bool> {
        if !sensor.storage_enabled {
            return Ok(true);
        }
        let res = match message {
            Message::Measurement(m) => self.queue.enqueue_measurement(m),
            Message::Message(m) => self.queue.enqueue_message(m),
            Message::ControlMessage(_) => return Ok(true),
        };
        res.map_err(|e| Error::routing(NAME, e.to_string()))?;
        self.metrics.storage_enqueued_inc();
        event.add_action(NetworkEventType::MessageStorage);
        Ok(true)
    }
}
