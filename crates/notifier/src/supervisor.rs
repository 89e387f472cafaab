//! Connection supervisor — keeps one channel's transport session alive.
//!
//! The supervisor opens the transport, probes it every heartbeat interval and
//! reconnects with exponential backoff when the session drops or a worker
//! reports it unavailable. Workers observe availability through an
//! [`Availability`] handle and only dequeue while the session is up.
//!
//! On shutdown the transport is always closed, whatever state the loop is in.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Notify, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use herald_common::config::ReconnectConfig;
use herald_common::types::Channel;

use crate::transport::ChannelTransport;

/// Read side of a channel's availability flag.
#[derive(Clone)]
pub struct Availability {
    rx: watch::Receiver<bool>,
}

impl Availability {
    pub fn is_available(&self) -> bool {
        *self.rx.borrow()
    }

    /// Wait until the transport is available.
    ///
    /// Returns `false` if `shutdown` fires first or the supervisor is gone.
    pub async fn wait(&mut self, shutdown: &CancellationToken) -> bool {
        tokio::select! {
            _ = shutdown.cancelled() => false,
            result = self.rx.wait_for(|up| *up) => result.is_ok(),
        }
    }
}

/// Per-channel reconnect and heartbeat loop.
pub struct ConnectionSupervisor {
    channel: Channel,
    transport: Arc<dyn ChannelTransport>,
    reconnect: ReconnectConfig,
    heartbeat_interval: Duration,
    available: watch::Sender<bool>,
    down: Notify,
}

impl ConnectionSupervisor {
    pub fn new(
        transport: Arc<dyn ChannelTransport>,
        reconnect: ReconnectConfig,
        heartbeat_interval: Duration,
    ) -> Self {
        let (available, _) = watch::channel(false);
        Self {
            channel: transport.channel(),
            transport,
            reconnect,
            heartbeat_interval,
            available,
            down: Notify::new(),
        }
    }

    pub fn availability(&self) -> Availability {
        Availability {
            rx: self.available.subscribe(),
        }
    }

    pub fn is_available(&self) -> bool {
        *self.available.borrow()
    }

    /// Called by a worker whose send failed with `Unavailable`.
    pub fn report_down(&self, reason: &str) {
        tracing::debug!(channel = %self.channel, reason, "Transport reported unavailable");
        self.down.notify_one();
    }

    /// Delay before reconnect attempt number `failures` (1-based).
    pub fn reconnect_delay(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(31);
        self.reconnect
            .base_delay
            .saturating_mul(2u32.saturating_pow(exponent))
            .min(self.reconnect.max_delay)
    }

    /// Run until `shutdown` is cancelled.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        tracing::info!(channel = %self.channel, "Connection supervisor started");
        let mut failures: u32 = 0;

        'outer: loop {
            let opened = tokio::select! {
                _ = shutdown.cancelled() => break 'outer,
                result = self.transport.open() => result,
            };

            if let Err(e) = opened {
                failures = failures.saturating_add(1);
                let delay = self.reconnect_delay(failures);
                tracing::warn!(
                    channel = %self.channel,
                    error = %e,
                    failures,
                    retry_in_ms = delay.as_millis() as u64,
                    "Transport connect failed"
                );
                tokio::select! {
                    _ = shutdown.cancelled() => break 'outer,
                    _ = tokio::time::sleep(delay) => continue 'outer,
                }
            }

            if failures > 0 {
                tracing::info!(channel = %self.channel, failures, "Transport reconnected");
            } else {
                tracing::info!(channel = %self.channel, "Transport connected");
            }
            failures = 0;
            self.available.send_replace(true);

            let mut ticker = tokio::time::interval_at(
                Instant::now() + self.heartbeat_interval,
                self.heartbeat_interval,
            );
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break 'outer,
                    _ = self.down.notified() => {
                        if self.probe().await {
                            continue;
                        }
                        break;
                    }
                    _ = ticker.tick() => {
                        if !self.probe().await {
                            break;
                        }
                    }
                }
            }

            self.available.send_replace(false);
            self.transport.close().await;
            failures = 1;
            let delay = self.reconnect_delay(failures);
            tracing::warn!(
                channel = %self.channel,
                retry_in_ms = delay.as_millis() as u64,
                "Transport session lost, reconnecting"
            );
            tokio::select! {
                _ = shutdown.cancelled() => break 'outer,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.available.send_replace(false);
        self.transport.close().await;
        tracing::info!(channel = %self.channel, "Connection supervisor stopped");
    }

    /// Whether the session still answers.
    async fn probe(&self) -> bool {
        if !self.transport.is_open() {
            return false;
        }
        match self.transport.heartbeat().await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(channel = %self.channel, error = %e, "Heartbeat failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TransportError;
    use async_trait::async_trait;
    use herald_common::types::NotificationPayload;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    /// Fails the first `fail_opens` opens, then connects.
    struct FlakyTransport {
        fail_opens: u32,
        opens: AtomicU32,
        closes: AtomicU32,
        open: AtomicBool,
    }

    impl FlakyTransport {
        fn new(fail_opens: u32) -> Self {
            Self {
                fail_opens,
                opens: AtomicU32::new(0),
                closes: AtomicU32::new(0),
                open: AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl ChannelTransport for FlakyTransport {
        fn channel(&self) -> Channel {
            Channel::Sms
        }

        async fn open(&self) -> Result<(), TransportError> {
            let n = self.opens.fetch_add(1, Ordering::SeqCst) + 1;
            if n <= self.fail_opens {
                return Err(TransportError::Unavailable("refused".into()));
            }
            self.open.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn close(&self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
            self.open.store(false, Ordering::SeqCst);
        }

        fn is_open(&self) -> bool {
            self.open.load(Ordering::SeqCst)
        }

        async fn send(&self, _: &str, _: &NotificationPayload) -> Result<(), TransportError> {
            Ok(())
        }
    }

    fn reconnect() -> ReconnectConfig {
        ReconnectConfig {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(8),
        }
    }

    #[test]
    fn test_reconnect_delay_doubles_and_caps() {
        let sup = ConnectionSupervisor::new(
            Arc::new(FlakyTransport::new(0)),
            reconnect(),
            Duration::from_secs(30),
        );
        assert_eq!(sup.reconnect_delay(1), Duration::from_secs(1));
        assert_eq!(sup.reconnect_delay(2), Duration::from_secs(2));
        assert_eq!(sup.reconnect_delay(4), Duration::from_secs(8));
        assert_eq!(sup.reconnect_delay(40), Duration::from_secs(8));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnects_with_backoff_then_available() {
        let transport = Arc::new(FlakyTransport::new(2));
        let sup = Arc::new(ConnectionSupervisor::new(
            transport.clone(),
            reconnect(),
            Duration::from_secs(30),
        ));
        let mut availability = sup.availability();
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(sup.clone().run(shutdown.clone()));

        let started = Instant::now();
        assert!(availability.wait(&shutdown).await);
        // two failed opens: 1s + 2s of backoff
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(3) && elapsed < Duration::from_millis(3010));
        assert_eq!(transport.opens.load(Ordering::SeqCst), 3);

        shutdown.cancel();
        handle.await.unwrap();
        assert!(!sup.is_available());
        assert!(transport.closes.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_report_down_triggers_reconnect() {
        let transport = Arc::new(FlakyTransport::new(0));
        let sup = Arc::new(ConnectionSupervisor::new(
            transport.clone(),
            reconnect(),
            Duration::from_secs(30),
        ));
        let mut availability = sup.availability();
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(sup.clone().run(shutdown.clone()));
        assert!(availability.wait(&shutdown).await);

        // a live session ignores the report
        sup.report_down("spurious");
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(transport.opens.load(Ordering::SeqCst), 1);

        transport.open.store(false, Ordering::SeqCst);
        sup.report_down("connection reset");
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!availability.is_available());

        assert!(availability.wait(&shutdown).await);
        assert_eq!(transport.opens.load(Ordering::SeqCst), 2);

        shutdown.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_detects_dropped_session() {
        let transport = Arc::new(FlakyTransport::new(0));
        let sup = Arc::new(ConnectionSupervisor::new(
            transport.clone(),
            reconnect(),
            Duration::from_secs(5),
        ));
        let mut availability = sup.availability();
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(sup.clone().run(shutdown.clone()));
        assert!(availability.wait(&shutdown).await);

        transport.open.store(false, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(7)).await;
        assert_eq!(transport.opens.load(Ordering::SeqCst), 2);
        assert!(sup.is_available());

        shutdown.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_wait_returns_false_on_shutdown() {
        let sup = ConnectionSupervisor::new(
            Arc::new(FlakyTransport::new(0)),
            reconnect(),
            Duration::from_secs(30),
        );
        let mut availability = sup.availability();
        let shutdown = CancellationToken::new();
        shutdown.cancel();
        assert!(!availability.wait(&shutdown).await);
    }
}
