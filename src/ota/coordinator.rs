use std::future::Future;
use std::time::Duration;

use chrono::Local;
use log::{debug, error, info, warn};
use tokio::time::{self, Instant};

use super::config::OtaOptions;
use super::types::{Device, Readiness, HOLD_SIGNAL, READY_SIGNAL, RELEASE_SIGNAL};
use crate::error::{Error, Result};
use crate::transport::{Broker, Subscription};

/// Pause between the release signal and clearing the retained request, so a
/// connected device sees the release first.
const RETAIN_CLEAR_DELAY: Duration = Duration::from_secs(5);

/// Drives one hold/ready/release handshake with a device.
pub struct ReadinessCoordinator<'a, B> {
    broker: &'a mut B,
    device: &'a Device,
    options: &'a OtaOptions,
}

impl<'a, B: Broker> ReadinessCoordinator<'a, B> {
    pub fn new(broker: &'a mut B, device: &'a Device, options: &'a OtaOptions) -> Self {
        Self {
            broker,
            device,
            options,
        }
    }

    /// Waits for the device to confirm readiness, then releases it.
    pub async fn await_ready(&mut self, timeout: Duration) -> Result<Readiness> {
        self.hold_for(timeout, || std::future::ready(Ok(()))).await
    }

    /// Holds the device awake, runs `on_ready` once it confirms readiness,
    /// and releases it afterwards.
    ///
    /// Once the hold signal has been attempted, the release signal is sent
    /// exactly once on every path: ready, timeout, transport failure or a
    /// failing `on_ready`. The subscription is dropped after the release.
    pub async fn hold_for<F, Fut>(&mut self, timeout: Duration, on_ready: F) -> Result<Readiness>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let mut subscription = self
            .broker
            .subscribe(self.device.ready_topic())
            .await
            .inspect_err(|e| error!("Unable to subscribe to {}: {}", self.device.ready_topic(), e))?;

        let outcome = match self.request_hold().await {
            Ok(()) => match wait_for_ready(&mut subscription, timeout).await {
                Ok(Readiness::Ready) => on_ready().await.map(|()| Readiness::Ready),
                other => other,
            },
            Err(e) => Err(e),
        };

        self.release().await;
        drop(subscription);
        outcome
    }

    async fn request_hold(&mut self) -> Result<()> {
        let topic = self.device.request_topic();
        info!("Sending {}: ON", topic);
        self.broker
            .publish(topic, HOLD_SIGNAL, self.options.retain)
            .await
            .inspect_err(|e| error!("Unable to send hold signal to {}: {}", topic, e))
    }

    /// Best effort: failures are logged and never change the outcome.
    async fn release(&mut self) {
        let topic = self.device.request_topic();
        info!("Sending {}: OFF", topic);
        if let Err(e) = self
            .broker
            .publish(topic, RELEASE_SIGNAL, self.options.retain)
            .await
        {
            warn!("Unable to send release signal to {}: {}", topic, e);
            return;
        }

        if self.options.clear_retained {
            time::sleep(RETAIN_CLEAR_DELAY).await;
            info!("Clearing topic {}", topic);
            if let Err(e) = self.broker.publish(topic, b"", true).await {
                warn!("Unable to clear retained topic {}: {}", topic, e);
            }
        }
    }
}

/// Single bounded wait: the deadline is fixed before the first read and
/// ignored payloads do not extend it.
async fn wait_for_ready<S: Subscription>(
    subscription: &mut S,
    timeout: Duration,
) -> Result<Readiness> {
    let deadline = Instant::now() + timeout;
    let end_time = chrono::Duration::from_std(timeout)
        .ok()
        .and_then(|delta| Local::now().checked_add_signed(delta));
    match end_time {
        Some(end_time) => info!(
            "Waiting until {} for device to be ready to receive new code",
            end_time.format("%Y/%m/%d %H:%M:%S")
        ),
        None => info!("Waiting for device to be ready to receive new code"),
    }

    loop {
        match time::timeout_at(deadline, subscription.recv()).await {
            Ok(Some(payload)) => {
                let message = String::from_utf8_lossy(&payload);
                let message = message.trim();
                info!("Received message: {}", message);
                if message == READY_SIGNAL {
                    return Ok(Readiness::Ready);
                }
                debug!("Ignoring {:?} on {}", message, subscription.topic());
            }
            Ok(None) => {
                return Err(Error::Transport(format!(
                    "Subscription to {} closed before the device was ready",
                    subscription.topic()
                )));
            }
            Err(_) => {
                warn!("Waiting time exhausted");
                return Ok(Readiness::TimedOut);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockBroker;

    fn fixture() -> (Device, OtaOptions) {
        (
            Device::new("mailbox", "home/"),
            OtaOptions::new().with_timeout_secs(24),
        )
    }

    async fn connected(broker: MockBroker) -> MockBroker {
        let mut broker = broker;
        broker.connect().await.unwrap();
        broker
    }

    fn assert_elapsed(started: Instant, expected: Duration) {
        let elapsed = started.elapsed();
        assert!(
            elapsed >= expected && elapsed < expected + Duration::from_millis(50),
            "elapsed {elapsed:?}, expected {expected:?}"
        );
    }

    fn payloads(broker: &MockBroker) -> Vec<&'static str> {
        broker
            .published()
            .iter()
            .map(|p| match p.payload.as_ref() {
                b"ON" => "ON",
                b"OFF" => "OFF",
                b"" => "",
                _ => "?",
            })
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn ready_before_deadline() {
        let (device, options) = fixture();
        let mut broker = connected(MockBroker::new().reply_to(
            device.request_topic(),
            b"ON",
            device.ready_topic(),
            b"READY",
            Duration::from_secs(5),
        ))
        .await;

        let started = Instant::now();
        let readiness = ReadinessCoordinator::new(&mut broker, &device, &options)
            .await_ready(Duration::from_secs(24))
            .await
            .unwrap();

        assert_eq!(readiness, Readiness::Ready);
        assert_elapsed(started, Duration::from_secs(5));
        assert_eq!(payloads(&broker), ["ON", "OFF"]);
        assert!(broker.published().iter().all(|p| p.topic == "home/mailbox/ota-req"));
        assert_eq!(broker.active_subscriptions(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_after_exact_budget() {
        let (device, options) = fixture();
        let mut broker = connected(MockBroker::new()).await;

        let started = Instant::now();
        let readiness = ReadinessCoordinator::new(&mut broker, &device, &options)
            .await_ready(Duration::from_secs(24))
            .await
            .unwrap();

        assert_eq!(readiness, Readiness::TimedOut);
        assert_elapsed(started, Duration::from_secs(24));
        assert_eq!(payloads(&broker), ["ON", "OFF"]);
        assert_eq!(broker.unsubscribe_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn other_payloads_do_not_extend_the_deadline() {
        let (device, options) = fixture();
        let mut broker = connected(
            MockBroker::new()
                .reply_to(
                    device.request_topic(),
                    b"ON",
                    device.ready_topic(),
                    b"BUSY",
                    Duration::from_secs(10),
                )
                .reply_to(
                    device.request_topic(),
                    b"ON",
                    device.ready_topic(),
                    b"READY",
                    Duration::from_secs(30),
                ),
        )
        .await;

        let started = Instant::now();
        let readiness = ReadinessCoordinator::new(&mut broker, &device, &options)
            .await_ready(Duration::from_secs(24))
            .await
            .unwrap();

        assert_eq!(readiness, Readiness::TimedOut);
        assert_elapsed(started, Duration::from_secs(24));
    }

    #[tokio::test(start_paused = true)]
    async fn ready_payload_is_trimmed() {
        let (device, options) = fixture();
        let mut broker = connected(MockBroker::new().reply_to(
            device.request_topic(),
            b"ON",
            device.ready_topic(),
            b" READY\n",
            Duration::from_secs(1),
        ))
        .await;

        let readiness = ReadinessCoordinator::new(&mut broker, &device, &options)
            .await_ready(Duration::from_secs(24))
            .await
            .unwrap();
        assert_eq!(readiness, Readiness::Ready);
    }

    #[tokio::test]
    async fn subscribe_failure_sends_nothing() {
        let (device, options) = fixture();
        let mut broker = connected(MockBroker::new().fail_subscribe()).await;

        let err = ReadinessCoordinator::new(&mut broker, &device, &options)
            .await_ready(Duration::from_secs(24))
            .await
            .unwrap_err();

        assert!(err.is_transport());
        assert!(broker.publish_attempts().is_empty());
    }

    #[tokio::test]
    async fn failed_hold_still_releases() {
        let (device, options) = fixture();
        let mut broker = connected(MockBroker::new().fail_publish(b"ON")).await;

        let err = ReadinessCoordinator::new(&mut broker, &device, &options)
            .await_ready(Duration::from_secs(24))
            .await
            .unwrap_err();

        assert!(err.is_transport());
        assert_eq!(payloads(&broker), ["OFF"]);
        assert_eq!(broker.publish_attempts().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_release_keeps_outcome() {
        let (device, options) = fixture();
        let mut broker = connected(MockBroker::new().fail_publish(b"OFF")).await;

        let readiness = ReadinessCoordinator::new(&mut broker, &device, &options)
            .await_ready(Duration::from_secs(3))
            .await
            .unwrap();

        assert_eq!(readiness, Readiness::TimedOut);
        assert_eq!(broker.publish_attempts().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn closed_subscription_is_a_transport_error() {
        let (device, options) = fixture();
        let mut broker = connected(MockBroker::new()).await;

        let observer = broker.clone();
        tokio::spawn(async move {
            time::sleep(Duration::from_secs(2)).await;
            observer.drop_connection();
        });

        let err = ReadinessCoordinator::new(&mut broker, &device, &options)
            .await_ready(Duration::from_secs(24))
            .await
            .unwrap_err();

        assert!(err.is_transport());
        // The connection is gone, but the release was still attempted.
        let attempts = broker.publish_attempts();
        assert_eq!(attempts.len(), 2);
        assert_eq!(attempts[1].payload.as_ref(), b"OFF");
    }

    #[tokio::test(start_paused = true)]
    async fn work_runs_while_held_and_failure_still_releases() {
        let (device, options) = fixture();
        let mut broker = connected(MockBroker::new().reply_to(
            device.request_topic(),
            b"ON",
            device.ready_topic(),
            b"READY",
            Duration::from_secs(1),
        ))
        .await;

        let observer = broker.clone();
        let err = ReadinessCoordinator::new(&mut broker, &device, &options)
            .hold_for(Duration::from_secs(24), || async move {
                // Still held: only the hold signal has gone out.
                assert_eq!(observer.published().len(), 1);
                Err(Error::Transport("work failed".to_string()))
            })
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Transport(msg) if msg == "work failed"));
        assert_eq!(payloads(&broker), ["ON", "OFF"]);
    }

    #[tokio::test(start_paused = true)]
    async fn clear_retained_publishes_empty_payload_last() {
        let (device, _) = fixture();
        let options = OtaOptions::new()
            .with_timeout_secs(1)
            .with_clear_retained(true);
        let mut broker = connected(MockBroker::new()).await;

        ReadinessCoordinator::new(&mut broker, &device, &options)
            .await_ready(Duration::from_secs(1))
            .await
            .unwrap();

        assert_eq!(payloads(&broker), ["ON", "OFF", ""]);
        assert!(broker.published().iter().all(|p| p.retain));
    }
}
