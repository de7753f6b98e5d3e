use crate::message::{Message, NetworkEvent};
use crate::types::ResolvedSensor;
use crate::{Error, Result};

use super::Router;

const NAME: &str = "base";

/// Classifies the message on the network event and rejects messages that
/// can not be routed at all.
#[derive(Debug, Default)]
pub struct BaseRouter;

impl Router for BaseRouter {
    #[inline]
    fn name(&self) -> &'static str {
        NAME
    }

    fn route(&self, sensor: &ResolvedSensor, message: &mut Message, event: &mut NetworkEvent) -> Result<bool> {
        if message.sensor_id() != sensor.id {
            return Err(Error::routing(
                NAME,
                format!("message for sensor {} resolved to sensor {}", message.sensor_id(), sensor.id),
            ));
        }
        if let Message::Measurement(m) = message {
            if m.data.is_empty() {
                return Err(Error::routing(NAME, "measurement without data points"));
            }
        }
        event.message_type = Some(message.message_type());
        Ok(true)
    }
}
