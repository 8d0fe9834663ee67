//! Application service: outbound relay.
//!
//! Drains the internal relay queue in FIFO order, stamps each message with
//! the agent identity and hands it to the outbound channel. This is the only
//! place identity is inserted.

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::application::ports::MessageSink;
use crate::domain::{AgentId, OutboundMessage};

/// Capacity of the relay queue shared by all internal producers.
pub const RELAY_QUEUE_CAPACITY: usize = 256;

/// Queue a message for the relay without waiting.
///
/// A full queue drops the message with a warning so a stalled coordinator
/// link never blocks the producer. Returns `false` once the relay is gone.
pub fn offer(queue: &mpsc::Sender<OutboundMessage>, msg: OutboundMessage) -> bool {
    match queue.try_send(msg) {
        Ok(()) => true,
        Err(TrySendError::Full(msg)) => {
            warn!(topic = %msg.topic, "relay queue full, dropping message");
            true
        }
        Err(TrySendError::Closed(_)) => false,
    }
}

pub struct OutboundRelay<S> {
    agent_id: AgentId,
    sink: S,
}

impl<S: MessageSink> OutboundRelay<S> {
    #[must_use]
    pub fn new(agent_id: AgentId, sink: S) -> Self {
        Self { agent_id, sink }
    }

    /// Stamp and send a single message.
    ///
    /// # Errors
    ///
    /// Returns an error if the outbound channel refuses the line.
    pub async fn forward(&self, msg: &OutboundMessage) -> anyhow::Result<()> {
        debug!(topic = %msg.topic, "relaying message to coordinator");
        self.sink.send(msg.stamp(&self.agent_id)).await
    }

    /// Relay until every producer is gone or shutdown is requested.
    pub async fn run(self, mut queue: mpsc::Receiver<OutboundMessage>, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                biased;
                () = shutdown.cancelled() => break,
                msg = queue.recv() => {
                    let Some(msg) = msg else {
                        debug!("relay queue closed");
                        break;
                    };
                    // The outbound channel applies backpressure while the link is down.
                    let sent = tokio::select! {
                        biased;
                        () = shutdown.cancelled() => break,
                        sent = self.forward(&msg) => sent,
                    };
                    if let Err(e) = sent {
                        warn!(topic = %msg.topic, error = %format!("{e:#}"), "dropping outbound message");
                    }
                }
            }
        }
        debug!("outbound relay exiting");
    }
}
