//! Outbound queues.
//!
//! Routers never talk to the messaging transport directly. They enqueue encoded
//! entries into per-topic buffers, and a periodic flush drains each buffer into
//! one batch payload (a JSON array, gzipped when enabled) and hands it to the
//! [`Publisher`].

use std::io::{Read, Write};
use std::sync::Arc;

use ahash::AHashSet;
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use parking_lot::RwLock;
use serde::Serialize;

use crate::conf::Settings;
use crate::message::{Measurement, Message, MessageType, NetworkEvent, TextMessage};
use crate::queue::Queue;
use crate::topic::{self, TopicTemplate};
use crate::types::{LiveDataHandler, SensorId, Target};
use crate::utils::Counter;
use crate::{Error, Result};

/// The messaging transport, e.g. an MQTT client
#[async_trait]
pub trait Publisher: Sync + Send {
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<()>;
}

/// Joins pre-encoded JSON entries into one JSON array, gzipped if `compress`
pub fn encode_batch(entries: &[Bytes], compress: bool) -> Result<Bytes> {
    let len = entries.iter().map(|e| e.len() + 1).sum::<usize>() + 2;
    let mut json = Vec::with_capacity(len);
    json.push(b'[');
    for (i, entry) in entries.iter().enumerate() {
        if i > 0 {
            json.push(b',');
        }
        json.extend_from_slice(entry);
    }
    json.push(b']');

    if !compress {
        return Ok(Bytes::from(json));
    }
    let mut e = GzEncoder::new(Vec::with_capacity(json.len() / 4), flate2::Compression::fast());
    e.write_all(&json)?;
    Ok(Bytes::from(e.finish()?))
}

/// Inverse of [`encode_batch`]
pub fn decode_batch(payload: &[u8], compressed: bool) -> Result<Vec<serde_json::Value>> {
    if !compressed {
        return Ok(serde_json::from_slice(payload)?);
    }
    let mut json = Vec::new();
    GzDecoder::new(payload).read_to_end(&mut json)?;
    Ok(serde_json::from_slice(&json)?)
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct PublishStats {
    pub enqueued: Counter,
    pub dropped: Counter,
    pub published: Counter,
    pub failures: Counter,
}

/// Per-topic buffers sharing one publisher
pub struct PublishQueue {
    name: &'static str,
    buffers: DashMap<String, Arc<Queue<Bytes>>, ahash::RandomState>,
    capacity: usize,
    compress: bool,
    publisher: Arc<dyn Publisher>,
    pub stats: PublishStats,
}

impl PublishQueue {
    pub fn new(name: &'static str, publisher: Arc<dyn Publisher>, capacity: usize, compress: bool) -> Self {
        Self {
            name,
            buffers: DashMap::default(),
            capacity,
            compress,
            publisher,
            stats: PublishStats::default(),
        }
    }

    #[inline]
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn enqueue<T: Serialize + ?Sized>(&self, topic: &str, item: &T) -> Result<()> {
        let entry = Bytes::from(serde_json::to_vec(item)?);
        self.enqueue_raw(topic, entry)
    }

    pub fn enqueue_raw(&self, topic: &str, entry: Bytes) -> Result<()> {
        //push while the map entry is held, flush removes drained buffers under the shard lock
        let pushed = match self.buffers.get(topic) {
            Some(b) => b.value().push(entry),
            None => self
                .buffers
                .entry(topic.to_owned())
                .or_insert_with(|| Arc::new(Queue::new(self.capacity)))
                .value()
                .push(entry),
        };
        if pushed.is_err() {
            self.stats.dropped.inc();
            return Err(Error::Msg(format!("{} queue is full, topic: {}", self.name, topic)));
        }
        self.stats.enqueued.inc();
        Ok(())
    }

    /// Entries waiting for the next flush on `topic`
    #[inline]
    pub fn pending(&self, topic: &str) -> usize {
        self.buffers.get(topic).map(|b| b.len()).unwrap_or_default()
    }

    #[inline]
    pub fn pending_total(&self) -> usize {
        self.buffers.iter().map(|b| b.len()).sum()
    }

    /// Publishes one batch per non-empty topic, returns the number of entries published.
    /// A failing topic is logged and does not stop the others. Drained buffers are released.
    pub async fn flush(&self) -> Result<usize> {
        let snapshot: Vec<(String, Arc<Queue<Bytes>>)> =
            self.buffers.iter().map(|b| (b.key().clone(), b.value().clone())).collect();

        let mut published = 0;
        for (topic, buffer) in snapshot {
            let len = buffer.len();
            let entries = buffer.drain(len);
            self.buffers.remove_if(&topic, |_, b| b.is_empty());
            if entries.is_empty() {
                continue;
            }
            let payload = match encode_batch(&entries, self.compress) {
                Ok(payload) => payload,
                Err(e) => {
                    self.stats.failures.inc();
                    log::warn!("{} encoding for {} failed, {} entries lost, {}", self.name, topic, entries.len(), e);
                    continue;
                }
            };
            match self.publisher.publish(&topic, payload).await {
                Ok(()) => {
                    published += entries.len();
                    self.stats.published.incs(entries.len() as isize);
                }
                Err(e) => {
                    self.stats.failures.inc();
                    log::warn!("{} flush to {} failed, {} entries lost, {}", self.name, topic, entries.len(), e);
                }
            }
        }
        Ok(published)
    }
}

pub struct StorageQueue {
    measurements_topic: String,
    messages_topic: String,
    queue: PublishQueue,
}

impl StorageQueue {
    pub fn new(measurements_topic: String, messages_topic: String, queue: PublishQueue) -> Self {
        Self { measurements_topic, messages_topic, queue }
    }

    #[inline]
    pub fn enqueue_measurement(&self, m: &Measurement) -> Result<()> {
        self.queue.enqueue(&self.measurements_topic, m)
    }

    #[inline]
    pub fn enqueue_message(&self, m: &TextMessage) -> Result<()> {
        self.queue.enqueue(&self.messages_topic, m)
    }

    #[inline]
    pub fn measurements_topic(&self) -> &str {
        &self.measurements_topic
    }

    #[inline]
    pub fn messages_topic(&self) -> &str {
        &self.messages_topic
    }

    #[inline]
    pub fn queue(&self) -> &PublishQueue {
        &self.queue
    }
}

/// Fan-out to live data handlers, one topic per handler and message kind
pub struct LiveDataQueue {
    template: TopicTemplate,
    targets: RwLock<AHashSet<Target>>,
    queue: PublishQueue,
}

impl LiveDataQueue {
    pub fn new(template: TopicTemplate, queue: PublishQueue) -> Self {
        Self { template, targets: RwLock::new(AHashSet::default()), queue }
    }

    /// Keeps exactly the enabled handlers as targets
    pub fn sync_handlers(&self, handlers: &[LiveDataHandler]) {
        let targets: AHashSet<Target> = handlers.iter().filter(|h| h.enabled).map(|h| h.name.clone()).collect();
        *self.targets.write() = targets;
    }

    #[inline]
    pub fn has_target(&self, target: &str) -> bool {
        self.targets.read().contains(target)
    }

    #[inline]
    pub fn topic(&self, kind: MessageType, target: &str) -> String {
        self.template.render(&[(topic::TYPE, kind.topic_name()), (topic::TARGET, target)])
    }

    /// Returns false when `target` is not a known handler; nothing is enqueued then
    pub fn enqueue(&self, target: &str, message: &Message) -> Result<bool> {
        if !self.has_target(target) {
            log::debug!("live data target {} is not registered, message skipped", target);
            return Ok(false);
        }
        let topic = self.topic(message.message_type(), target);
        match message {
            Message::Measurement(m) => self.queue.enqueue(&topic, m)?,
            Message::Message(m) => self.queue.enqueue(&topic, m)?,
            Message::ControlMessage(m) => self.queue.enqueue(&topic, m)?,
        }
        Ok(true)
    }

    #[inline]
    pub fn queue(&self) -> &PublishQueue {
        &self.queue
    }
}

pub struct TriggerQueue {
    template: TopicTemplate,
    queue: PublishQueue,
}

impl TriggerQueue {
    pub fn new(template: TopicTemplate, queue: PublishQueue) -> Self {
        Self { template, queue }
    }

    #[inline]
    pub fn topic(&self, kind: MessageType) -> String {
        self.template.render(&[(topic::TYPE, kind.topic_name())])
    }

    #[inline]
    pub fn enqueue_measurement(&self, m: &Measurement) -> Result<()> {
        self.queue.enqueue(&self.topic(MessageType::Measurement), m)
    }

    #[inline]
    pub fn enqueue_message(&self, m: &TextMessage) -> Result<()> {
        self.queue.enqueue(&self.topic(MessageType::Message), m)
    }

    #[inline]
    pub fn queue(&self) -> &PublishQueue {
        &self.queue
    }
}

/// Control messages published to the device, one topic per sensor
pub struct ActuatorQueue {
    template: TopicTemplate,
    queue: PublishQueue,
}

impl ActuatorQueue {
    pub fn new(template: TopicTemplate, queue: PublishQueue) -> Self {
        Self { template, queue }
    }

    #[inline]
    pub fn topic(&self, sensor_id: &SensorId) -> String {
        self.template.render(&[(topic::ID, &sensor_id.to_string())])
    }

    #[inline]
    pub fn enqueue(&self, sensor_id: &SensorId, json: String) -> Result<()> {
        self.queue.enqueue_raw(&self.topic(sensor_id), Bytes::from(json))
    }

    #[inline]
    pub fn queue(&self) -> &PublishQueue {
        &self.queue
    }
}

pub struct NetworkEventQueue {
    topic: String,
    queue: PublishQueue,
}

impl NetworkEventQueue {
    pub fn new(topic: String, queue: PublishQueue) -> Self {
        Self { topic, queue }
    }

    #[inline]
    pub fn enqueue(&self, event: &NetworkEvent) -> Result<()> {
        self.queue.enqueue(&self.topic, event)
    }

    #[inline]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    #[inline]
    pub fn queue(&self) -> &PublishQueue {
        &self.queue
    }
}

/// Every outbound queue of the engine, built from the `topics` and `queue` settings
#[derive(Clone)]
pub struct Outbound {
    pub storage: Arc<StorageQueue>,
    pub live_data: Arc<LiveDataQueue>,
    pub trigger: Arc<TriggerQueue>,
    pub events: Arc<NetworkEventQueue>,
    pub actuator: Arc<ActuatorQueue>,
}

impl Outbound {
    pub fn new(settings: &Settings, publisher: Arc<dyn Publisher>) -> Self {
        let topics = &settings.topics;
        let (cap, compress) = (settings.queue.capacity, settings.queue.compress);
        let queue = |name| PublishQueue::new(name, publisher.clone(), cap, compress);
        Self {
            storage: Arc::new(StorageQueue::new(
                topics.measurement_storage.clone(),
                topics.message_storage.clone(),
                queue("storage"),
            )),
            live_data: Arc::new(LiveDataQueue::new(TopicTemplate::from(&topics.live_data), queue("live-data"))),
            trigger: Arc::new(TriggerQueue::new(TopicTemplate::from(&topics.trigger), queue("trigger"))),
            events: Arc::new(NetworkEventQueue::new(topics.network_events.clone(), queue("network-events"))),
            actuator: Arc::new(ActuatorQueue::new(TopicTemplate::from(&topics.actuator), queue("actuator"))),
        }
    }

    /// Flushes the queues consumed inside the platform
    pub async fn flush_internal(&self) -> Result<usize> {
        let mut published = self.storage.queue().flush().await?;
        published += self.live_data.queue().flush().await?;
        published += self.trigger.queue().flush().await?;
        published += self.events.queue().flush().await?;
        Ok(published)
    }

    /// Flushes the queues consumed by devices
    #[inline]
    pub async fn flush_public(&self) -> Result<usize> {
        self.actuator.queue().flush().await
    }

    pub fn pending_total(&self) -> usize {
        [
            self.storage.queue(),
            self.live_data.queue(),
            self.trigger.queue(),
            self.events.queue(),
            self.actuator.queue(),
        ]
        .iter()
        .map(|q| q.pending_total())
        .sum()
    }
}
