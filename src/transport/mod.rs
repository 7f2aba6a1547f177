pub mod mock;
pub mod mqtt;

use bytes::Bytes;

use crate::error::Result;

pub use self::mock::{MockBroker, Published};
pub use self::mqtt::MqttBroker;

/// Publish/subscribe channel to the message broker.
#[allow(async_fn_in_trait)]
pub trait Broker {
    type Subscription: Subscription;

    async fn connect(&mut self) -> Result<()>;

    /// Subscribes to an exact topic. The returned handle unsubscribes when dropped.
    async fn subscribe(&mut self, topic: &str) -> Result<Self::Subscription>;

    /// Resolves once the broker has accepted the message.
    async fn publish(&mut self, topic: &str, payload: &[u8], retain: bool) -> Result<()>;

    /// Flushes pending publishes and closes the connection.
    async fn close(&mut self) -> Result<()>;
}

#[allow(async_fn_in_trait)]
pub trait Subscription {
    fn topic(&self) -> &str;

    /// Next payload on the topic, or `None` once the channel is closed.
    async fn recv(&mut self) -> Option<Bytes>;
}
