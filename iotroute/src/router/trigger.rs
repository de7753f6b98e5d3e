use std::sync::Arc;

use crate::message::{Message, NetworkEvent, NetworkEventType};
use crate::metrics::Metrics;
use crate::outbound::TriggerQueue;
use crate::types::ResolvedSensor;
use crate::{Error, Result};

use super::Router;

const NAME: &str = "trigger";

/// Hands messages to the trigger evaluation service.
///
/// Text triggers only see text messages and measurement triggers only see
/// measurements. A message is enqueued at most once per trigger kind, however
/// many triggers of that kind the sensor has.
pub struct TriggerRouter {
    queue: Arc<TriggerQueue>,
    metrics: Arc<Metrics>,
}

impl TriggerRouter {
    pub fn new(queue: Arc<TriggerQueue>, metrics: Arc<Metrics>) -> Self {
        Self { queue, metrics }
    }

    fn enqueue(&self, message: &Message, text_trigger: bool) -> Result<bool> {
        let res = match message {
            Message::Measurement(m) if !text_trigger => self.queue.enqueue_measurement(m),
            Message::Message(m) if text_trigger => self.queue.enqueue_message(m),
            _ => return Ok(false),
        };
        res.map_err(|e| Error::routing(NAME, e.to_string()))?;
        self.metrics.triggers_enqueued_inc();
        Ok(true)
    }
}

impl Router for TriggerRouter {
    #[inline]
    fn name(&self) -> &'static str {
        NAME
    }

    fn route(&self, sensor: &ResolvedSensor, message: &mut Message, event: &mut NetworkEvent) -> Result<bool> {
        if message.is_control() || sensor.triggers.is_empty() {
            return Ok(true);
        }

        let mut text_triggered = false;
        let mut measurement_triggered = false;
        for trigger in sensor.triggers.iter().filter(|t| t.has_actions) {
            let done = if trigger.is_text_trigger { &mut text_triggered } else { &mut measurement_triggered };
            if !*done {
                *done = true;
                let dispatched = self.enqueue(message, trigger.is_text_trigger)?;
                if dispatched && !event.has_action(NetworkEventType::MessageTriggered) {
                    event.add_action(NetworkEventType::MessageTriggered);
                }
            }
            if text_triggered && measurement_triggered {
                break;
            }
        }
        Ok(true)
    }
}
