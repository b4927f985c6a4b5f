use std::time::Duration;

use rand::Rng;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::driver::ProtocolDriver;
use super::message::{now_millis, Message};
use super::payload::{HeartbeatReply, Passthrough, Payload};
use super::ReplyError;

/// Keepalive for one connection. Each round waits a random interval within
/// `[min_interval, max_interval]`, sends `heartbeat`, and feeds the round trip
/// into the connection's quality estimates. A failed round closes the
/// connection; retrying is left to the peer.
pub struct Heartbeat {
    driver: ProtocolDriver,
    min_interval: Duration,
    max_interval: Duration,
    reply_timeout: Duration,
}

impl Heartbeat {
    pub fn new(
        driver: ProtocolDriver,
        min_interval: Duration,
        max_interval: Duration,
        reply_timeout: Duration,
    ) -> Self {
        Self {
            driver,
            min_interval,
            max_interval: max_interval.max(min_interval),
            reply_timeout,
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    pub async fn run(self) {
        loop {
            tokio::time::sleep(self.next_delay()).await;
            if self.driver.connection().is_closed() {
                break;
            }
            if let Err(err) = self.beat().await {
                warn!(
                    target = "beach_mirror::protocol",
                    connection = %self.driver.label(),
                    error = %err,
                    "heartbeat failed; dropping connection"
                );
                self.driver.close();
                break;
            }
        }
        debug!(target = "beach_mirror::protocol", connection = %self.driver.label(), "heartbeat stopped");
    }

    /// One round trip.
    pub async fn beat(&self) -> Result<Duration, ReplyError> {
        let started = Instant::now();
        let sent_ms = now_millis();
        let reply = self
            .driver
            .request(
                Message::new(Payload::Heartbeat(Passthrough::default())),
                Some(self.reply_timeout),
            )
            .await?;
        let rtt = started.elapsed();

        let quality = self.driver.connection().quality();
        quality.record_round_trip(rtt.as_secs_f64() * 1000.0);
        if let Payload::HeartbeatReply(HeartbeatReply {
            local_time_ms: Some(remote_ms),
        }) = reply.payload
        {
            quality.record_clock_sample(remote_ms, sent_ms, now_millis());
        }
        Ok(rtt)
    }

    fn next_delay(&self) -> Duration {
        if self.max_interval == self.min_interval {
            return self.min_interval;
        }
        rand::thread_rng().gen_range(self.min_interval..=self.max_interval)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::driver::ProtocolHandler;
    use crate::transport::{Connection, ConnectionEvent, Pipe};

    struct Ignore;

    impl ProtocolHandler for Ignore {
        fn handle(&self, _driver: &ProtocolDriver, _message: Message) {}
    }

    #[test_timeout::tokio_timeout_test(paused)]
    async fn answered_heartbeat_updates_latency() {
        let (local, remote) = Pipe::pair();
        let mut local_events = local.take_events().unwrap();
        let mut remote_events = remote.take_events().unwrap();
        let driver = ProtocolDriver::new("heartbeat", local.clone());

        let responder = remote.clone();
        tokio::spawn(async move {
            while let Some(ConnectionEvent::Recv(message)) = remote_events.recv().await {
                tokio::time::sleep(Duration::from_millis(40)).await;
                let _ = responder.send(Message::reply(
                    message.id,
                    Payload::HeartbeatReply(HeartbeatReply {
                        local_time_ms: Some(now_millis()),
                    }),
                ));
            }
        });
        let pump_driver = driver.clone();
        tokio::spawn(async move {
            while let Some(ConnectionEvent::Recv(message)) = local_events.recv().await {
                pump_driver.recv_message(message, &Ignore);
            }
        });

        let heartbeat = Heartbeat::new(
            driver,
            Duration::from_secs(5),
            Duration::from_secs(10),
            Duration::from_secs(30),
        );
        let rtt = heartbeat.beat().await.unwrap();
        assert!(rtt >= Duration::from_millis(40));
        assert!(local.quality().latency_ms().is_some());
        assert!(local.quality().clock_offset_ms().is_some());
    }

    #[test_timeout::tokio_timeout_test(paused)]
    async fn unanswered_heartbeat_closes_connection() {
        let (local, remote) = Pipe::pair();
        let _remote_events = remote.take_events().unwrap();
        let driver = ProtocolDriver::new("heartbeat", local.clone());
        Heartbeat::new(
            driver,
            Duration::from_secs(5),
            Duration::from_secs(10),
            Duration::from_secs(30),
        )
        .run()
        .await;
        assert!(local.is_closed());
    }
}
