//! Application service: liveness monitor.
//!
//! Watches one transport's link events. Every (re)connect asks the
//! coordinator for configuration; the outbound link additionally announces
//! a heartbeat and the host address.

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use hive_common::channel::RECONNECT_INTERVAL_MS;

use crate::application::ports::{AddressResolver, LinkDirection, LinkEvent};
use crate::application::services::relay::offer;
use crate::domain::OutboundMessage;

pub struct LivenessMonitor<R: ?Sized> {
    direction: LinkDirection,
    endpoint: String,
    relay: mpsc::Sender<OutboundMessage>,
    resolver: Arc<R>,
}

impl<R: AddressResolver + ?Sized> LivenessMonitor<R> {
    #[must_use]
    pub fn new(
        direction: LinkDirection,
        endpoint: impl Into<String>,
        relay: mpsc::Sender<OutboundMessage>,
        resolver: Arc<R>,
    ) -> Self {
        Self {
            direction,
            endpoint: endpoint.into(),
            relay,
            resolver,
        }
    }

    /// Messages to announce after a connect, in send order.
    pub async fn announcements(&self) -> Vec<OutboundMessage> {
        // WANT_CONFIG goes out on every connect, in both directions.
        let mut out = vec![OutboundMessage::want_config()];
        if self.direction == LinkDirection::Outbound {
            out.push(OutboundMessage::ping());
            out.push(OutboundMessage::ip(&self.resolver.local_address().await));
        }
        out
    }

    /// Follow link events until the transport closes or shutdown is requested.
    pub async fn run(self, mut events: broadcast::Receiver<LinkEvent>, shutdown: CancellationToken) {
        loop {
            let event = tokio::select! {
                biased;
                () = shutdown.cancelled() => break,
                event = events.recv() => event,
            };
            match event {
                Ok(LinkEvent::Connected) => {
                    info!(endpoint = %self.endpoint, direction = ?self.direction, "connected to coordinator");
                    for msg in self.announcements().await {
                        if !offer(&self.relay, msg) {
                            debug!("relay queue closed, liveness monitor exiting");
                            return;
                        }
                    }
                }
                Ok(LinkEvent::Disconnected) => {
                    warn!(
                        endpoint = %self.endpoint,
                        direction = ?self.direction,
                        "disconnected from coordinator, will reconnect in {}s",
                        RECONNECT_INTERVAL_MS / 1000
                    );
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(endpoint = %self.endpoint, skipped, "missed link events");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
        debug!(endpoint = %self.endpoint, "liveness monitor exiting");
    }
}
