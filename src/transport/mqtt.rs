use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bytes::Bytes;
use log::{debug, error, info, warn};
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS,
    SubscribeReasonCode, Transport,
};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use super::{Broker, Subscription};
use crate::config::MqttSettings;
use crate::error::{Error, Result};

const REQUEST_CAPACITY: usize = 16;
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

type Routes = Arc<Mutex<HashMap<String, mpsc::UnboundedSender<Bytes>>>>;

/// Resolved when the broker acknowledges a QoS 1 publish.
type PubAckWaiter = oneshot::Sender<()>;

fn lock(routes: &Routes) -> MutexGuard<'_, HashMap<String, mpsc::UnboundedSender<Bytes>>> {
    routes.lock().unwrap_or_else(|e| e.into_inner())
}

fn not_connected() -> Error {
    Error::Transport("Not connected to MQTT broker".to_string())
}

/// MQTT broker connection backed by `rumqttc`.
///
/// The event loop runs on its own task and only routes incoming publishes to
/// the matching subscription channel.
pub struct MqttBroker {
    options: MqttOptions,
    connect_timeout: Duration,
    connection: Option<Connection>,
}

struct Connection {
    client: AsyncClient,
    routes: Routes,
    acks: mpsc::UnboundedReceiver<bool>,
    /// Waiters are queued in publish order and paired with outgoing packet ids.
    pubacks: mpsc::UnboundedSender<PubAckWaiter>,
    task: JoinHandle<()>,
}

impl MqttBroker {
    pub fn new(settings: &MqttSettings, client_id: &str) -> Result<Self> {
        let mut options = MqttOptions::new(client_id, settings.host.clone(), settings.port);
        options.set_keep_alive(Duration::from_secs(settings.keep_alive_secs));

        if !settings.username.is_empty() {
            options.set_credentials(settings.username.clone(), settings.password.clone());
        }

        if !settings.ca_certificate.is_empty() {
            let ca = std::fs::read(&settings.ca_certificate).map_err(|e| {
                Error::Configuration(format!(
                    "Unable to read CA certificate {}: {}",
                    settings.ca_certificate, e
                ))
            })?;
            options.set_transport(Transport::tls(ca, None, None));
        }

        Ok(Self {
            options,
            connect_timeout: Duration::from_secs(settings.connect_timeout_secs),
            connection: None,
        })
    }

    pub fn is_connected(&self) -> bool {
        self.connection
            .as_ref()
            .is_some_and(|conn| !conn.task.is_finished())
    }
}

impl Broker for MqttBroker {
    type Subscription = MqttSubscription;

    async fn connect(&mut self) -> Result<()> {
        if self.connection.is_some() {
            return Ok(());
        }

        let (host, port) = self.options.broker_address();
        info!("Connecting to MQTT broker {}:{}", host, port);

        let (client, eventloop) = AsyncClient::new(self.options.clone(), REQUEST_CAPACITY);
        let routes = Routes::default();
        let (ack_tx, acks) = mpsc::unbounded_channel();
        let (pubacks, pending) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = oneshot::channel();
        let task = tokio::spawn(drive(
            eventloop,
            routes.clone(),
            ack_tx,
            pending,
            ready_tx,
        ));

        let outcome = match timeout(self.connect_timeout, ready_rx).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(reason))) => Err(Error::Transport(reason)),
            Ok(Err(_)) => Err(Error::Transport(
                "MQTT event loop stopped before connecting".to_string(),
            )),
            Err(_) => Err(Error::Transport(format!(
                "Unable to connect with MQTT server within {}s",
                self.connect_timeout.as_secs()
            ))),
        };

        match outcome {
            Ok(()) => {
                info!("Connected to MQTT broker");
                self.connection = Some(Connection {
                    client,
                    routes,
                    acks,
                    pubacks,
                    task,
                });
                Ok(())
            }
            Err(e) => {
                task.abort();
                Err(e)
            }
        }
    }

    async fn subscribe(&mut self, topic: &str) -> Result<MqttSubscription> {
        let ack_timeout = self.connect_timeout;
        let conn = self.connection.as_mut().ok_or_else(not_connected)?;

        let (tx, rx) = mpsc::unbounded_channel();
        lock(&conn.routes).insert(topic.to_string(), tx);

        let acknowledged = match conn.client.subscribe(topic, QoS::AtMostOnce).await {
            Ok(()) => match timeout(ack_timeout, conn.acks.recv()).await {
                Ok(Some(true)) => Ok(()),
                Ok(Some(false)) => Err(Error::Transport(format!(
                    "Subscription to {topic} rejected by broker"
                ))),
                Ok(None) => Err(Error::Transport(
                    "Connection closed while subscribing".to_string(),
                )),
                Err(_) => Err(Error::Transport(format!(
                    "No acknowledgement for subscription to {topic}"
                ))),
            },
            Err(e) => Err(e.into()),
        };

        if let Err(e) = acknowledged {
            lock(&conn.routes).remove(topic);
            return Err(e);
        }

        debug!("Subscribed to {}", topic);
        Ok(MqttSubscription {
            topic: topic.to_string(),
            rx,
            client: conn.client.clone(),
            routes: conn.routes.clone(),
        })
    }

    /// Completes once the broker has acknowledged the message.
    async fn publish(&mut self, topic: &str, payload: &[u8], retain: bool) -> Result<()> {
        let ack_timeout = self.connect_timeout;
        let conn = self.connection.as_ref().ok_or_else(not_connected)?;

        let (waiter, acked) = oneshot::channel();
        conn.pubacks.send(waiter).map_err(|_| not_connected())?;
        conn.client
            .publish(topic, QoS::AtLeastOnce, retain, payload.to_vec())
            .await?;

        match timeout(ack_timeout, acked).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(Error::Transport(format!(
                "Connection closed before publish to {topic} was acknowledged"
            ))),
            Err(_) => Err(Error::Transport(format!(
                "No acknowledgement for publish to {topic} within {}s",
                ack_timeout.as_secs()
            ))),
        }
    }

    async fn close(&mut self) -> Result<()> {
        let Some(conn) = self.connection.take() else {
            return Ok(());
        };

        // Requests are sent in order, so anything published before this goes out first.
        let result = conn.client.disconnect().await;

        let mut task = conn.task;
        if timeout(CLOSE_TIMEOUT, &mut task).await.is_err() {
            warn!("MQTT event loop did not stop in time");
            task.abort();
        }

        debug!("MQTT connection closed");
        result.map_err(Error::from)
    }
}

impl Drop for MqttBroker {
    fn drop(&mut self) {
        if let Some(conn) = self.connection.take() {
            conn.task.abort();
        }
    }
}

async fn drive(
    mut eventloop: EventLoop,
    routes: Routes,
    acks: mpsc::UnboundedSender<bool>,
    mut pending: mpsc::UnboundedReceiver<PubAckWaiter>,
    ready: oneshot::Sender<std::result::Result<(), String>>,
) {
    let mut ready = Some(ready);
    let mut in_flight: HashMap<u16, PubAckWaiter> = HashMap::new();

    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                let outcome = match ack.code {
                    ConnectReturnCode::Success => Ok(()),
                    code => Err(format!("Connection refused by broker: {code:?}")),
                };
                let refused = outcome.is_err();
                if let Some(tx) = ready.take() {
                    let _ = tx.send(outcome);
                }
                if refused {
                    break;
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let routes = lock(&routes);
                match routes.get(&publish.topic) {
                    Some(tx) => {
                        let _ = tx.send(publish.payload);
                    }
                    None => debug!("Dropping message on {}", publish.topic),
                }
            }
            Ok(Event::Incoming(Packet::SubAck(suback))) => {
                let granted = suback
                    .return_codes
                    .iter()
                    .all(|code| !matches!(code, SubscribeReasonCode::Failure));
                let _ = acks.send(granted);
            }
            Ok(Event::Outgoing(Outgoing::Publish(pkid))) => {
                // Waiters whose publish was abandoned before reaching the wire are skipped.
                while let Ok(waiter) = pending.try_recv() {
                    if !waiter.is_closed() {
                        in_flight.insert(pkid, waiter);
                        break;
                    }
                }
            }
            Ok(Event::Incoming(Packet::PubAck(ack))) => match in_flight.remove(&ack.pkid) {
                Some(waiter) => {
                    let _ = waiter.send(());
                }
                None => debug!("Unexpected PubAck for packet {}", ack.pkid),
            },
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                debug!("Disconnect sent");
                break;
            }
            Ok(event) => debug!("MQTT event: {:?}", event),
            Err(e) => {
                match ready.take() {
                    Some(tx) => {
                        let _ = tx.send(Err(e.to_string()));
                    }
                    None => error!("MQTT connection error: {}", e),
                }
                break;
            }
        }
    }

    // Closes every open subscription channel.
    lock(&routes).clear();
}

pub struct MqttSubscription {
    topic: String,
    rx: mpsc::UnboundedReceiver<Bytes>,
    client: AsyncClient,
    routes: Routes,
}

impl Subscription for MqttSubscription {
    fn topic(&self) -> &str {
        &self.topic
    }

    async fn recv(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }
}

impl Drop for MqttSubscription {
    fn drop(&mut self) {
        lock(&self.routes).remove(&self.topic);
        if let Err(e) = self.client.try_unsubscribe(self.topic.clone()) {
            debug!("Unable to unsubscribe from {}: {}", self.topic, e);
        }
    }
}
