use std::sync::Arc;

use chrono::Utc;

use crate::message::{ControlDestination, Message, NetworkEvent};
use crate::metrics::Metrics;
use crate::outbound::ActuatorQueue;
use crate::signing::MessageSigner;
use crate::types::ResolvedSensor;
use crate::{Error, Result};

use super::Router;

const NAME: &str = "control-message";

/// Signs control messages and forwards the MQTT bound ones to the actuator
/// topic of their sensor.
pub struct ControlMessageRouter {
    signer: Arc<dyn MessageSigner>,
    actuator: Arc<ActuatorQueue>,
    metrics: Arc<Metrics>,
}

impl ControlMessageRouter {
    pub fn new(signer: Arc<dyn MessageSigner>, actuator: Arc<ActuatorQueue>, metrics: Arc<Metrics>) -> Self {
        Self { signer, actuator, metrics }
    }
}

impl Router for ControlMessageRouter {
    #[inline]
    fn name(&self) -> &'static str {
        NAME
    }

    fn route(&self, sensor: &ResolvedSensor, message: &mut Message, _event: &mut NetworkEvent) -> Result<bool> {
        let Message::ControlMessage(control) = message else {
            return Ok(true);
        };

        control.timestamp = Utc::now();
        control.secret.clone_from(&sensor.sensor_key);
        control.signature.clear();
        let json = serde_json::to_string(control)?;
        self.signer.sign(control, &json)?;

        if control.destination == ControlDestination::Mqtt {
            let data = serde_json::to_string(control)?;
            log::debug!("publishing control message: {}", data);
            self.actuator.enqueue(&sensor.id, data).map_err(|e| Error::routing(NAME, e.to_string()))?;
            self.metrics.actuator_enqueued_inc();
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outbound::{Outbound, PublishQueue};
    use crate::signing::{HmacSigner, Sha256Signer};
    use crate::test_util::*;
    use crate::topic::TopicTemplate;

    fn router(signer: Arc<dyn MessageSigner>) -> (ControlMessageRouter, Arc<ActuatorQueue>) {
        let outbound = Outbound::new(&settings(), recording_publisher());
        let actuator = outbound.actuator.clone();
        (ControlMessageRouter::new(signer, actuator.clone(), Arc::new(Metrics::default())), actuator)
    }

    #[test]
    fn mqtt_control_is_signed_and_published_per_sensor() {
        let (router, actuator) = router(Arc::new(Sha256Signer));
        let sensor = ResolvedSensor::new(test_sensor(3).into(), Vec::new());
        let mut message = control_message(sensor.id, ControlDestination::Mqtt);
        let mut event = NetworkEvent::new(sensor.id, sensor.account_id);

        assert!(router.route(&sensor, &mut message, &mut event).unwrap());
        let Message::ControlMessage(control) = &message else { unreachable!() };
        assert!(control.secret.is_empty());
        assert_eq!(control.signature.len(), 64);
        assert_eq!(actuator.queue().pending(&format!("sensateiot/control/{}", sensor.id)), 1);
        assert_eq!(router.metrics.actuator_enqueued(), 1);
        assert!(event.actions.is_empty());
    }

    #[test]
    fn grpc_control_is_signed_only() {
        let (router, actuator) = router(Arc::new(HmacSigner));
        let sensor = ResolvedSensor::new(test_sensor(3).into(), Vec::new());
        let mut message = control_message(sensor.id, ControlDestination::Grpc);
        let mut event = NetworkEvent::new(sensor.id, sensor.account_id);

        assert!(router.route(&sensor, &mut message, &mut event).unwrap());
        let Message::ControlMessage(control) = &message else { unreachable!() };
        assert!(!control.signature.is_empty());
        assert_eq!(actuator.queue().pending_total(), 0);
    }

    #[test]
    fn other_kinds_pass_through() {
        let (router, actuator) = router(Arc::new(Sha256Signer));
        let sensor = ResolvedSensor::new(test_sensor(3).into(), Vec::new());
        let mut message = measurement(sensor.id);
        let before = message.clone();
        let mut event = NetworkEvent::new(sensor.id, sensor.account_id);
        assert!(router.route(&sensor, &mut message, &mut event).unwrap());
        assert_eq!(message, before);
        assert_eq!(actuator.queue().pending_total(), 0);
    }

    #[test]
    fn full_actuator_queue_is_a_routing_error() {
        let actuator = Arc::new(ActuatorQueue::new(
            TopicTemplate::from("sensateiot/control/$id"),
            PublishQueue::new("actuator", recording_publisher(), 0, false),
        ));
        let router = ControlMessageRouter::new(Arc::new(Sha256Signer), actuator, Arc::new(Metrics::default()));
        let sensor = ResolvedSensor::new(test_sensor(3).into(), Vec::new());
        let mut message = control_message(sensor.id, ControlDestination::Mqtt);
        let mut event = NetworkEvent::new(sensor.id, sensor.account_id);
        assert!(router.route(&sensor, &mut message, &mut event).unwrap_err().is_routing());
    }
}
