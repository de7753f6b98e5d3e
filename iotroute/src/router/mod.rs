//! The per-message router chain.
//!
//! A [`CompositeRouter`] resolves the sensor of a message once and then runs a
//! fixed list of [`Router`]s over it. Each router may enqueue the message to
//! an outbound queue and record what it did on the [`NetworkEvent`].

use crate::message::{Message, NetworkEvent};
use crate::types::ResolvedSensor;
use crate::Result;

pub use self::base::BaseRouter;
pub use self::composite::CompositeRouter;
pub use self::control::ControlMessageRouter;
pub use self::live_data::LiveDataRouter;
pub use self::storage::StorageRouter;
pub use self::trigger::TriggerRouter;

mod base;
mod composite;
mod control;
mod live_data;
mod storage;
mod trigger;

pub trait Router: Sync + Send {
    fn name(&self) -> &'static str;

    /// Returns `Ok(false)` to stop the chain for this message.
    ///
    /// An [`Error::Routing`](crate::Error::Routing) drops the message and lets
    /// the batch carry on, any other error fails the batch.
    fn route(&self, sensor: &ResolvedSensor, message: &mut Message, event: &mut NetworkEvent) -> Result<bool>;
}
