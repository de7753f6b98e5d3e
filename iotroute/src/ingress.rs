//! Entry point of the routing engine.
//!
//! Submissions arrive in wire form with textual sensor ids. They are
//! validated, converted to [`Message`]s and pushed onto the routing input
//! queue, which the routing service drains.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::message::{
    ControlDestination, ControlMessage, DataPoint, GeoLocation, Measurement, Message, MessageEncoding, TextMessage,
};
use crate::metrics::Metrics;
use crate::queue::Queue;
use crate::types::SensorId;

pub const INVALID_SENSOR_ID: &str = "Invalid sensor ID";
pub const INVALID_MEASUREMENT: &str = "Invalid measurement";
pub const INVALID_MESSAGE: &str = "Invalid message";
pub const QUEUE_FULL: &str = "Routing queue is full";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MeasurementRequest {
    pub sensor_id: String,
    pub data: BTreeMap<String, DataPoint>,
    #[serde(default)]
    pub latitude: Option<f64>,
    #[serde(default)]
    pub longitude: Option<f64>,
    /// Defaults to the time of submission
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TextMessageRequest {
    pub sensor_id: String,
    pub data: String,
    #[serde(default)]
    pub latitude: Option<f64>,
    #[serde(default)]
    pub longitude: Option<f64>,
    #[serde(default)]
    pub encoding: MessageEncoding,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlMessageRequest {
    pub sensor_id: String,
    pub data: String,
    pub destination: ControlDestination,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingResponse {
    pub count: usize,
    pub message: String,
    pub response_id: Uuid,
}

impl RoutingResponse {
    #[inline]
    fn new<S: Into<String>>(count: usize, message: S) -> Self {
        Self { count, message: message.into(), response_id: Uuid::new_v4() }
    }
}

/// Why a submission was not accepted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Rejection {
    SensorId,
    Measurement,
    Message,
}

impl Rejection {
    fn as_str(&self) -> &'static str {
        match self {
            Rejection::SensorId => INVALID_SENSOR_ID,
            Rejection::Measurement => INVALID_MEASUREMENT,
            Rejection::Message => INVALID_MESSAGE,
        }
    }
}

fn parse_sensor_id(raw: &str) -> Result<SensorId, Rejection> {
    match raw.parse::<SensorId>() {
        Ok(id) if !id.is_empty() => Ok(id),
        _ => Err(Rejection::SensorId),
    }
}

fn location(latitude: Option<f64>, longitude: Option<f64>) -> Option<Option<GeoLocation>> {
    match (latitude, longitude) {
        (None, None) => Some(None),
        (Some(lat), Some(lon)) if (-90.0..=90.0).contains(&lat) && (-180.0..=180.0).contains(&lon) => {
            Some(Some(GeoLocation { latitude: lat, longitude: lon }))
        }
        _ => None,
    }
}

fn convert_measurement(req: MeasurementRequest) -> Result<Message, Rejection> {
    let id = parse_sensor_id(&req.sensor_id)?;
    if req.data.is_empty() || req.data.values().any(|p| !p.value.is_finite()) {
        return Err(Rejection::Measurement);
    }
    let location = location(req.latitude, req.longitude).ok_or(Rejection::Measurement)?;
    let now = Utc::now();
    Ok(Message::Measurement(Measurement {
        sensor_id: id,
        data: req.data,
        location,
        timestamp: req.timestamp.unwrap_or(now),
        platform_time: now,
    }))
}

fn convert_message(req: TextMessageRequest) -> Result<Message, Rejection> {
    let id = parse_sensor_id(&req.sensor_id)?;
    if req.data.is_empty() {
        return Err(Rejection::Message);
    }
    let location = location(req.latitude, req.longitude).ok_or(Rejection::Message)?;
    let now = Utc::now();
    Ok(Message::Message(TextMessage {
        sensor_id: id,
        data: req.data,
        location,
        encoding: req.encoding,
        timestamp: req.timestamp.unwrap_or(now),
        platform_time: now,
    }))
}

fn convert_control(req: ControlMessageRequest) -> Result<Message, Rejection> {
    Ok(Message::ControlMessage(ControlMessage {
        sensor_id: parse_sensor_id(&req.sensor_id)?,
        data: req.data,
        destination: req.destination,
        timestamp: Utc::now(),
        secret: String::new(),
        signature: String::new(),
    }))
}

#[derive(Clone)]
pub struct Ingress {
    queue: Arc<Queue<Message>>,
    metrics: Arc<Metrics>,
}

impl Ingress {
    pub fn new(queue: Arc<Queue<Message>>, metrics: Arc<Metrics>) -> Self {
        Self { queue, metrics }
    }

    pub fn enqueue_measurement(&self, req: MeasurementRequest) -> RoutingResponse {
        log::debug!("received measurement routing request from sensor {}", req.sensor_id);
        self.enqueue_one(convert_measurement(req), "Measurement queued.")
    }

    pub fn enqueue_message(&self, req: TextMessageRequest) -> RoutingResponse {
        log::debug!("received message routing request from sensor {}", req.sensor_id);
        self.enqueue_one(convert_message(req), "Message queued.")
    }

    pub fn enqueue_control_message(&self, req: ControlMessageRequest) -> RoutingResponse {
        log::debug!("received control message routing request for sensor {}", req.sensor_id);
        self.enqueue_one(convert_control(req), "Control message queued.")
    }

    pub fn enqueue_bulk_measurements(&self, reqs: Vec<MeasurementRequest>) -> RoutingResponse {
        log::debug!("bulk ingress request with {} measurements", reqs.len());
        self.enqueue_many(reqs.into_iter().map(convert_measurement))
    }

    pub fn enqueue_bulk_messages(&self, reqs: Vec<TextMessageRequest>) -> RoutingResponse {
        log::debug!("bulk ingress request with {} messages", reqs.len());
        self.enqueue_many(reqs.into_iter().map(convert_message))
    }

    #[inline]
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    fn push(&self, message: Message) -> bool {
        if self.queue.push(message).is_err() {
            self.metrics.ingress_rejected_inc();
            log::warn!("routing queue is full, capacity: {}", self.queue.capacity());
            return false;
        }
        self.metrics.ingress_accepted_inc();
        true
    }

    fn enqueue_one(&self, converted: Result<Message, Rejection>, accepted: &str) -> RoutingResponse {
        match converted {
            Ok(message) => {
                if self.push(message) {
                    RoutingResponse::new(1, accepted)
                } else {
                    RoutingResponse::new(0, QUEUE_FULL)
                }
            }
            Err(r) => {
                self.metrics.ingress_rejected_inc();
                log::warn!("submission rejected, {}", r.as_str());
                RoutingResponse::new(0, r.as_str())
            }
        }
    }

    fn enqueue_many<I>(&self, converted: I) -> RoutingResponse
    where
        I: Iterator<Item = Result<Message, Rejection>>,
    {
        let mut count = 0;
        let mut rejected = 0;
        let mut full = false;
        for c in converted {
            match c {
                Ok(message) if !full => {
                    if self.push(message) {
                        count += 1;
                    } else {
                        full = true;
                    }
                }
                Ok(_) => self.metrics.ingress_rejected_inc(),
                Err(_) => {
                    rejected += 1;
                    self.metrics.ingress_rejected_inc();
                }
            }
        }
        if rejected > 0 {
            log::warn!("bulk submission, {} invalid entries skipped", rejected);
        }
        let message = if full { QUEUE_FULL } else { "Messages queued." };
        RoutingResponse::new(count, message)
    }
}
